// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! [`FormData`]: an ordered collection of form fields that renders either as
//! `application/x-www-form-urlencoded` (plain text fields only) or
//! `multipart/form-data` (as soon as any field carries binary content or
//! explicit framing metadata).
//!
//! The source accepts duck-typed field values (`str`, `bytes`, or a file-like
//! object whose `.name` supplies a default filename) and introspects which
//! one it got. Rust has no such introspection, so [`FieldValue`] makes the
//! two shapes explicit at the call site instead.

use crate::error::{EvLoopError, Result};

/// The value of one form field.
#[derive(Debug, Clone)]
pub enum FieldValue {
    /// A plain text field. Eligible for `x-www-form-urlencoded` encoding as
    /// long as no other field in the form forces multipart.
    Text(String),
    /// Binary content (an uploaded file, in effect). Always forces the form
    /// to encode as multipart.
    Bytes(Vec<u8>),
}

/// One field added via [`FormData::add_field`].
#[derive(Debug, Clone)]
pub struct FormField {
    pub name: String,
    pub value: FieldValue,
    pub file_name: Option<String>,
    pub content_type: Option<String>,
    pub transfer_encoding: Option<String>,
}

/// An ordered set of form fields plus the multipart-or-urlencoded encoding
/// decision, matching the source's `FormData`.
#[derive(Debug, Clone)]
pub struct FormData {
    fields: Vec<FormField>,
    multipart: bool,
    quote_fields: bool,
}

impl Default for FormData {
    fn default() -> Self {
        Self::new(true)
    }
}

impl FormData {
    /// `quote_fields` controls whether urlencoded output percent-encodes
    /// reserved characters in field values (it always does for field names).
    #[must_use]
    pub fn new(quote_fields: bool) -> Self {
        Self { fields: Vec::new(), multipart: false, quote_fields }
    }

    #[must_use]
    pub fn fields(&self) -> &[FormField] {
        &self.fields
    }

    #[must_use]
    pub fn is_multipart(&self) -> bool {
        self.multipart
    }

    #[must_use]
    pub fn quote_fields(&self) -> bool {
        self.quote_fields
    }

    /// Adds a field. `file_name`/`content_type`/`transfer_encoding` set the
    /// corresponding `Content-Disposition`/header metadata explicitly; any
    /// of them being present, or `value` being [`FieldValue::Bytes`], forces
    /// the form to multipart encoding from then on (spec §4.9). A
    /// [`FieldValue::Bytes`] field with no explicit `file_name` defaults its
    /// filename to the field name, matching the source's file-like-value
    /// default (the source's own `.name`-autodetection is not reproduced;
    /// see `DESIGN.md`).
    ///
    /// # Errors
    ///
    /// Returns [`EvLoopError::TypeError`] if `name` is empty.
    pub fn add_field(
        &mut self,
        name: impl Into<String>,
        value: FieldValue,
        file_name: Option<String>,
        content_type: Option<String>,
        transfer_encoding: Option<String>,
    ) -> Result<()> {
        let name = name.into();
        if name.is_empty() {
            return Err(EvLoopError::TypeError("form field name must not be empty"));
        }

        let forces_multipart = matches!(value, FieldValue::Bytes(_))
            || file_name.is_some()
            || content_type.is_some()
            || transfer_encoding.is_some();
        if forces_multipart {
            self.multipart = true;
        }

        let file_name = file_name.or_else(|| matches!(value, FieldValue::Bytes(_)).then(|| name.clone()));

        self.fields.push(FormField { name, value, file_name, content_type, transfer_encoding });
        Ok(())
    }

    /// Renders as `application/x-www-form-urlencoded`. Only valid when
    /// [`FormData::is_multipart`] is `false`.
    ///
    /// # Errors
    ///
    /// Returns [`EvLoopError::InvalidState`] if any field forced multipart.
    pub fn encode_urlencoded(&self) -> Result<String> {
        if self.multipart {
            return Err(EvLoopError::InvalidState);
        }
        let mut out = String::new();
        for field in &self.fields {
            let FieldValue::Text(text) = &field.value else {
                return Err(EvLoopError::InvalidState);
            };
            if !out.is_empty() {
                out.push('&');
            }
            out.push_str(&urlencode(&field.name, true));
            out.push('=');
            out.push_str(&urlencode(text, self.quote_fields));
        }
        Ok(out)
    }

    /// Renders as a `multipart/form-data` body using `boundary` as the
    /// separator, returning the body bytes. Caller is responsible for
    /// sending a `Content-Type: multipart/form-data; boundary=<boundary>`
    /// header alongside it.
    #[must_use]
    pub fn encode_multipart(&self, boundary: &str) -> Vec<u8> {
        let mut out = Vec::new();
        for field in &self.fields {
            out.extend_from_slice(b"--");
            out.extend_from_slice(boundary.as_bytes());
            out.extend_from_slice(b"\r\n");

            let mut disposition = format!("form-data; name=\"{}\"", escape_quoted(&field.name));
            if let Some(file_name) = &field.file_name {
                disposition.push_str(&format!("; filename=\"{}\"", escape_quoted(file_name)));
            }
            out.extend_from_slice(format!("Content-Disposition: {disposition}\r\n").as_bytes());

            if let Some(content_type) = &field.content_type {
                out.extend_from_slice(format!("Content-Type: {content_type}\r\n").as_bytes());
            }
            if let Some(transfer_encoding) = &field.transfer_encoding {
                out.extend_from_slice(
                    format!("Content-Transfer-Encoding: {transfer_encoding}\r\n").as_bytes(),
                );
            }
            out.extend_from_slice(b"\r\n");

            match &field.value {
                FieldValue::Text(text) => out.extend_from_slice(text.as_bytes()),
                FieldValue::Bytes(bytes) => out.extend_from_slice(bytes),
            }
            out.extend_from_slice(b"\r\n");
        }
        out.extend_from_slice(b"--");
        out.extend_from_slice(boundary.as_bytes());
        out.extend_from_slice(b"--\r\n");
        out
    }
}

fn escape_quoted(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"")
}

fn urlencode(value: &str, quote: bool) -> String {
    if !quote {
        return value.to_string();
    }
    let mut out = String::with_capacity(value.len());
    for byte in value.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char);
            }
            b' ' => out.push('+'),
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_text_fields_stay_urlencoded() {
        let mut form = FormData::default();
        form.add_field("hey", FieldValue::Text("mister".to_string()), None, None, None).unwrap();
        assert!(!form.is_multipart());
        assert_eq!(form.encode_urlencoded().unwrap(), "hey=mister");
    }

    #[test]
    fn bytes_field_forces_multipart() {
        let mut form = FormData::default();
        form.add_field("hey", FieldValue::Bytes(b"mister".to_vec()), None, None, None).unwrap();
        assert!(form.is_multipart());
        assert!(form.encode_urlencoded().is_err());
        let body = form.encode_multipart("boundary123");
        let text = String::from_utf8(body).unwrap();
        assert!(text.contains("Content-Disposition: form-data; name=\"hey\""));
        assert!(text.contains("mister"));
        assert!(text.ends_with("--boundary123--\r\n"));
    }

    #[test]
    fn bytes_field_with_no_explicit_file_name_defaults_it_to_the_field_name() {
        let mut form = FormData::default();
        form.add_field("upload", FieldValue::Bytes(b"payload".to_vec()), None, None, None).unwrap();
        assert_eq!(form.fields()[0].file_name.as_deref(), Some("upload"));
        let text = String::from_utf8(form.encode_multipart("b")).unwrap();
        assert!(text.contains("filename=\"upload\""));
    }

    #[test]
    fn text_field_gets_no_default_file_name() {
        let mut form = FormData::default();
        form.add_field("q", FieldValue::Text("x".to_string()), None, None, None).unwrap();
        assert!(form.fields()[0].file_name.is_none());
    }

    #[test]
    fn explicit_file_name_and_transfer_encoding_are_rendered() {
        let mut form = FormData::default();
        form.add_field(
            "hey",
            FieldValue::Bytes(b"mister".to_vec()),
            Some("satori".to_string()),
            Some("text/plain".to_string()),
            Some("application/octet-stream".to_string()),
        )
        .unwrap();
        let body = form.encode_multipart("b");
        let text = String::from_utf8(body).unwrap();
        assert!(text.contains("filename=\"satori\""));
        assert!(text.contains("Content-Type: text/plain"));
        assert!(text.contains("Content-Transfer-Encoding: application/octet-stream"));
    }

    #[test]
    fn empty_field_name_is_rejected() {
        let mut form = FormData::default();
        let result = form.add_field("", FieldValue::Text("x".to_string()), None, None, None);
        assert!(matches!(result, Err(EvLoopError::TypeError(_))));
    }

    #[test]
    fn urlencoded_values_are_percent_escaped_when_quoting() {
        let mut form = FormData::new(true);
        form.add_field("q", FieldValue::Text("a b&c".to_string()), None, None, None).unwrap();
        assert_eq!(form.encode_urlencoded().unwrap(), "q=a+b%26c");
    }
}
