// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! RFC 9110-style media type parser: `type "/" sub_type ["+" suffix] *(";" parameter)`.
//!
//! Whitespace-tolerant, casefolding `type`/`sub_type`/`suffix`/parameter keys,
//! and preserving duplicate parameter keys in a multi-value map. On malformed
//! input the parser still returns the partially-parsed [`ContentType`]
//! alongside a [`ContentTypeParsingError`] describing where parsing stopped
//! and what it would have accepted there.

use std::fmt;

const WHITESPACE: &[char] = &[' ', '\t'];
const DELIMITERS: &[char] = &[',', ':', ';', '(', ')', '{', '}', '[', ']', '<', '>', '\'', '"', '\\', '?', '@', '=', '/'];

/// An insertion-ordered multimap from parameter key to its (possibly
/// repeated) values, as the parser needs to preserve every occurrence of a
/// duplicated key rather than overwrite it.
#[derive(Debug, Clone, Default)]
pub struct MultiValueMap {
    entries: Vec<(String, String)>,
}

impl MultiValueMap {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: String, value: String) {
        self.entries.push((key, value));
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_str())
    }

    pub fn get_all<'a>(&'a self, key: &'a str) -> impl Iterator<Item = &'a str> {
        self.entries.iter().filter(move |(k, _)| k == key).map(|(_, v)| v.as_str())
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        let mut seen = Vec::new();
        self.entries.iter().filter_map(move |(k, _)| {
            if seen.contains(k) {
                None
            } else {
                seen.push(k.clone());
                Some(k.as_str())
            }
        })
    }
}

/// Equality ignores the order entries were inserted in, but not which keys
/// map to which (possibly repeated) values — matching the XOR-hash scheme
/// the source uses for this same reason.
impl PartialEq for MultiValueMap {
    fn eq(&self, other: &Self) -> bool {
        if self.len() != other.len() {
            return false;
        }
        for key in self.keys() {
            let mut mine: Vec<_> = self.get_all(key).collect();
            let mut theirs: Vec<_> = other.get_all(key).collect();
            mine.sort_unstable();
            theirs.sort_unstable();
            if mine != theirs {
                return false;
            }
        }
        true
    }
}

impl Eq for MultiValueMap {}

/// A parsed (or partially-parsed) media type: `type/sub_type+suffix; k=v`.
///
/// All of `type`, `sub_type`, and `suffix` are casefolded, as are parameter
/// keys; parameter values are preserved verbatim. A bare `*` head is
/// promoted to `*/*`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContentType {
    pub type_: Option<String>,
    pub sub_type: Option<String>,
    pub suffix: Option<String>,
    pub parameters: Option<MultiValueMap>,
}

impl ContentType {
    #[must_use]
    pub fn create_empty() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn get_parameter<'a>(&'a self, key: &str) -> Option<&'a str> {
        self.parameters.as_ref().and_then(|p| p.get(key))
    }
}

impl fmt::Display for ContentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(ty) = &self.type_ {
            write!(f, "{ty}")?;
            if let Some(sub) = &self.sub_type {
                write!(f, "/{sub}")?;
                if let Some(suffix) = &self.suffix {
                    write!(f, "+{suffix}")?;
                }
            }
        }
        if let Some(params) = &self.parameters {
            for (key, value) in &params.entries {
                if needs_quoting(value) {
                    write!(f, "; {key}=\"{}\"", escape_quoted(value))?;
                } else {
                    write!(f, "; {key}={value}")?;
                }
            }
        }
        Ok(())
    }
}

fn needs_quoting(value: &str) -> bool {
    value.is_empty() || value.chars().any(|c| WHITESPACE.contains(&c) || DELIMITERS.contains(&c))
}

fn escape_quoted(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        if c == '"' || c == '\\' {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// Where and why [`parse_content_type`] stopped making progress.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentTypeParsingError {
    pub string: String,
    pub index: usize,
    pub expected: &'static str,
}

impl fmt::Display for ContentTypeParsingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "content-type parse error at index {} of {:?}: expected one of {:?}",
            self.index, self.string, self.expected
        )
    }
}

impl std::error::Error for ContentTypeParsingError {}

fn consume_whitespace(chars: &[char], index: usize, end: usize) -> usize {
    let mut index = index;
    while index < end && WHITESPACE.contains(&chars[index]) {
        index += 1;
    }
    index
}

fn parse_token(chars: &[char], index: usize, end: usize, disallowed: &[char]) -> (usize, Option<String>) {
    let start = index;
    let mut index = index;
    while index < end {
        let c = chars[index];
        if disallowed.contains(&c) || WHITESPACE.contains(&c) || DELIMITERS.contains(&c) {
            break;
        }
        index += 1;
    }
    let token = if start >= index { None } else { Some(chars[start..index].iter().collect()) };
    (index, token)
}

fn parse_quoted(chars: &[char], index: usize, end: usize) -> (usize, Option<String>, Option<&'static str>) {
    let mut index = index;
    let mut collected: Option<Vec<char>> = None;
    let mut expected = None;
    let mut last_escape = false;

    loop {
        if index >= end {
            if last_escape {
                collected.get_or_insert_with(Vec::new).push('\\');
            }
            expected = Some("\"");
            break;
        }
        let c = chars[index];
        index += 1;

        if last_escape {
            last_escape = false;
            let buf = collected.get_or_insert_with(Vec::new);
            if c != '\\' && c != '"' {
                buf.push('\\');
            }
            buf.push(c);
        } else if c == '"' {
            break;
        } else if c == '\\' {
            last_escape = true;
        } else {
            collected.get_or_insert_with(Vec::new).push(c);
        }
    }

    let value = collected.map(|chars| chars.into_iter().collect());
    (index, value, expected)
}

fn parse_token_with_space_around(
    chars: &[char],
    index: usize,
    end: usize,
    disallowed: &[char],
) -> (usize, Option<String>) {
    let index = consume_whitespace(chars, index, end);
    let (index, token) = parse_token(chars, index, end, disallowed);
    let index = consume_whitespace(chars, index, end);
    (index, token)
}

fn parse_token_or_quoted_with_space_around(
    chars: &[char],
    index: usize,
    end: usize,
) -> (usize, Option<String>, Option<&'static str>) {
    let mut index = consume_whitespace(chars, index, end);
    let mut token = None;
    let mut expected = None;

    if index < end {
        if chars[index] == '"' {
            index += 1;
            let (new_index, value, err) = parse_quoted(chars, index, end);
            index = new_index;
            token = value;
            expected = err;
        } else {
            let (new_index, value) = parse_token(chars, index, end, &[]);
            index = new_index;
            token = value;
        }
    }

    index = consume_whitespace(chars, index, end);
    (index, token, expected)
}

struct Head {
    type_: Option<String>,
    sub_type: Option<String>,
    suffix: Option<String>,
    expected: Option<&'static str>,
    index: usize,
}

fn parse_head(chars: &[char], end: usize) -> Head {
    let mut index = 0;
    let mut type_ = None;
    let mut sub_type = None;
    let mut suffix = None;
    let mut expected = None;

    loop {
        if index >= end {
            break;
        }
        let (new_index, token) = parse_token_with_space_around(chars, index, end, &[';', '/']);
        index = new_index;
        type_ = token;
        if index >= end {
            break;
        }

        let c = chars[index];
        if c == ';' {
            index += 1;
            break;
        }
        if c != '/' {
            expected = Some(";/");
            break;
        }
        index += 1;

        let (new_index, token) = parse_token_with_space_around(chars, index, end, &[';', '+']);
        index = new_index;
        sub_type = token;
        if index >= end {
            break;
        }

        let c = chars[index];
        if c == ';' {
            index += 1;
            break;
        }
        if c != '+' {
            expected = Some(";+");
            break;
        }
        index += 1;

        let (new_index, token) = parse_token_with_space_around(chars, index, end, &[';']);
        index = new_index;
        suffix = token;
        if index >= end {
            break;
        }

        let c = chars[index];
        if c == ';' {
            index += 1;
            break;
        }
        expected = Some(";");
        break;
    }

    Head { type_, sub_type, suffix, expected, index }
}

struct Parameter {
    key: Option<String>,
    value: Option<String>,
    expected: Option<&'static str>,
    index: usize,
}

fn parse_parameter(chars: &[char], start: usize, end: usize) -> Parameter {
    let mut index = start;
    let mut key = None;
    let mut value = None;
    let mut expected = None;

    loop {
        if index >= end {
            break;
        }
        let (new_index, token) = parse_token_with_space_around(chars, index, end, &[';', '=']);
        index = new_index;
        key = token;
        if index >= end {
            break;
        }

        let c = chars[index];
        if c == ';' {
            index += 1;
            break;
        }
        if c != '=' {
            expected = Some(";=");
            break;
        }
        index += 1;

        let (new_index, v, err) = parse_token_or_quoted_with_space_around(chars, index, end);
        index = new_index;
        value = v;
        expected = err;
        if index >= end || expected.is_some() {
            break;
        }

        if chars[index] == ';' {
            index += 1;
            break;
        }
        expected = Some(";");
        break;
    }

    Parameter { key, value, expected, index }
}

/// Parses `string` as an RFC 9110 media type. An empty or absent input
/// yields [`ContentType::create_empty`] with no error. Malformed input still
/// yields the partially-parsed head/parameters alongside a
/// [`ContentTypeParsingError`].
#[must_use]
pub fn parse_content_type(string: &str) -> (ContentType, Option<ContentTypeParsingError>) {
    if string.is_empty() {
        return (ContentType::create_empty(), None);
    }

    let chars: Vec<char> = string.chars().collect();
    let end = chars.len();

    let head = parse_head(&chars, end);
    let mut type_ = head.type_.map(|s| s.to_lowercase());
    let mut sub_type = head.sub_type.map(|s| s.to_lowercase());
    let suffix = head.suffix.map(|s| s.to_lowercase());

    if type_.as_deref() == Some("*") && sub_type.is_none() {
        sub_type = Some("*".to_string());
    }

    let mut expected = head.expected;
    let mut index = head.index;
    let mut parameters: Option<MultiValueMap> = None;

    if expected.is_none() && index < end {
        loop {
            let parameter = parse_parameter(&chars, index, end);
            index = parameter.index;
            expected = parameter.expected;

            if parameter.key.is_some() || parameter.value.is_some() {
                let key = parameter.key.map(|s| s.to_lowercase()).unwrap_or_default();
                let value = parameter.value.unwrap_or_default();
                parameters.get_or_insert_with(MultiValueMap::new).insert(key, value);
            }

            if expected.is_some() || index >= end {
                break;
            }
        }
    }

    let content_type = ContentType { type_: type_.take(), sub_type, suffix, parameters };
    let error = expected.map(|expected| ContentTypeParsingError {
        string: string.to_string(),
        index,
        expected,
    });

    (content_type, error)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_simple_type() {
        let (ct, err) = parse_content_type("text/plain");
        assert!(err.is_none());
        assert_eq!(ct.type_.as_deref(), Some("text"));
        assert_eq!(ct.sub_type.as_deref(), Some("plain"));
        assert_eq!(ct.suffix, None);
    }

    #[test]
    fn casefolds_head_and_parameter_keys() {
        let (ct, err) = parse_content_type("Application/JSON ; Charset=\"utf-8\"");
        assert!(err.is_none());
        assert_eq!(ct.type_.as_deref(), Some("application"));
        assert_eq!(ct.sub_type.as_deref(), Some("json"));
        assert_eq!(ct.get_parameter("charset"), Some("utf-8"));
    }

    #[test]
    fn scenario_escaped_quoted_parameter() {
        let (ct, err) = parse_content_type(r#"Application/JSON  ; Charset="utf-8" ; profile="x\\y""#);
        assert!(err.is_none());
        assert_eq!(ct.type_.as_deref(), Some("application"));
        assert_eq!(ct.sub_type.as_deref(), Some("json"));
        assert_eq!(ct.get_parameter("charset"), Some("utf-8"));
        assert_eq!(ct.get_parameter("profile"), Some("x\\y"));
    }

    #[test]
    fn bare_star_promotes_to_star_star() {
        let (ct, err) = parse_content_type("*");
        assert!(err.is_none());
        assert_eq!(ct.type_.as_deref(), Some("*"));
        assert_eq!(ct.sub_type.as_deref(), Some("*"));
    }

    #[test]
    fn suffix_is_parsed() {
        let (ct, err) = parse_content_type("application/ld+json");
        assert!(err.is_none());
        assert_eq!(ct.sub_type.as_deref(), Some("ld"));
        assert_eq!(ct.suffix.as_deref(), Some("json"));
    }

    #[test]
    fn malformed_input_reports_partial_type_and_error() {
        let (ct, err) = parse_content_type("text/plain;");
        assert_eq!(ct.type_.as_deref(), Some("text"));
        assert!(err.is_none(), "a trailing bare semicolon with nothing after it is not itself an error");

        let (ct, err) = parse_content_type("text plain");
        assert_eq!(ct.type_.as_deref(), Some("text"));
        assert_eq!(ct.sub_type, None);
        let err = err.expect("missing '/' after the type is malformed");
        assert_eq!(err.expected, ";/");
    }

    #[test]
    fn empty_string_is_empty_content_type() {
        let (ct, err) = parse_content_type("");
        assert_eq!(ct, ContentType::create_empty());
        assert!(err.is_none());
    }

    #[test]
    fn duplicate_keys_preserved_in_multivalue_map() {
        let (ct, _err) = parse_content_type("text/plain; a=1; a=2");
        let params = ct.parameters.unwrap();
        let all: Vec<_> = params.get_all("a").collect();
        assert_eq!(all, vec!["1", "2"]);
    }

    #[test]
    fn equality_ignores_parameter_order_within_key() {
        let (a, _) = parse_content_type("text/plain; a=1; b=2");
        let (b, _) = parse_content_type("text/plain; b=2; a=1");
        assert_eq!(a, b);
    }
}
