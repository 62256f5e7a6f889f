// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! `subprocess_exec`/`subprocess_shell` (spec §4.2): spawn a child process,
//! adapt its stdio pipes to transports via
//! [`crate::transport::make_unix_read_pipe_transport`] /
//! `make_unix_write_pipe_transport`, and offload the blocking `Child::wait`
//! to the executor pool so the loop thread is never stuck waiting on a
//! process exit.
//!
//! UNIX-only, matching the source's platform split: non-UNIX builds expose
//! the same function signatures but always fail with
//! [`crate::error::EvLoopError::NotImplemented`].

#[cfg(unix)]
mod imp {
    use std::os::fd::{FromRawFd, IntoRawFd};
    use std::process::{Child, Command, ExitStatus, Stdio};
    use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
    use std::sync::{Arc, Mutex};

    use crate::error::{EvLoopError, Result};
    use crate::event_loop::EventThread;
    use crate::task::Task;
    use crate::transport::{self, Protocol, StreamProtocol, Transport};

    /// Which stdio stream a [`SubprocessProtocol`] callback refers to.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum SubprocessFd {
        Stdin,
        Stdout,
        Stderr,
    }

    /// How a stdio stream should be wired when spawning (spec §4.2's
    /// `stdin`/`stdout`/`stderr` keyword arguments).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum PipeOption {
        /// Adapt the stream to a transport via `connect_read_pipe`/`connect_write_pipe`.
        Piped,
        /// Redirect to `/dev/null`.
        Null,
        /// Leave the stream attached to this process's own.
        Inherit,
    }

    impl PipeOption {
        fn into_stdio(self) -> Stdio {
            match self {
                PipeOption::Piped => Stdio::piped(),
                PipeOption::Null => Stdio::null(),
                PipeOption::Inherit => Stdio::inherit(),
            }
        }
    }

    /// The protocol contract a subprocess transport expects (spec §4.2):
    /// the base [`Protocol`] lifecycle plus per-pipe data delivery and an
    /// exit notification.
    pub trait SubprocessProtocol: Send + Sync {
        fn connection_made(&self, transport: Arc<dyn SubprocessTransport>);
        fn connection_lost(&self, error: Option<EvLoopError>) {
            let _ = error;
        }
        fn pipe_data_received(&self, fd: SubprocessFd, data: &[u8]);
        fn pipe_connection_lost(&self, fd: SubprocessFd, error: Option<EvLoopError>) {
            let _ = (fd, error);
        }
        fn process_exited(&self);
    }

    /// The "async process record" (spec §4.2) as observed by its
    /// [`SubprocessProtocol`]: pid/returncode introspection, per-stream
    /// transport lookup, and signal delivery.
    pub trait SubprocessTransport: Send + Sync {
        fn get_pid(&self) -> u32;
        fn get_returncode(&self) -> Option<i32>;
        fn get_pipe_transport(&self, fd: SubprocessFd) -> Option<Arc<dyn Transport>>;
        fn send_signal(&self, signal: i32) -> Result<()>;
        fn terminate(&self) -> Result<()>;
        fn kill(&self) -> Result<()>;
        fn close(&self);
    }

    struct PipeState {
        stdin: Option<Arc<dyn Transport>>,
        stdout: Option<Arc<dyn Transport>>,
        stderr: Option<Arc<dyn Transport>>,
    }

    /// The concrete [`SubprocessTransport`].
    pub struct Subprocess {
        pid: u32,
        returncode: Mutex<Option<i32>>,
        pipes: Mutex<PipeState>,
        protocol: Arc<dyn SubprocessProtocol>,
        closing: AtomicBool,
    }

    impl Subprocess {
        fn on_exit(self: &Arc<Self>, code: Option<i32>) {
            *self.returncode.lock().unwrap() = Some(code.unwrap_or(-1));
            self.protocol.process_exited();
            if !self.closing.swap(true, AtomicOrdering::AcqRel) {
                self.protocol.connection_lost(None);
            }
        }
    }

    impl SubprocessTransport for Subprocess {
        fn get_pid(&self) -> u32 {
            self.pid
        }

        fn get_returncode(&self) -> Option<i32> {
            *self.returncode.lock().unwrap()
        }

        fn get_pipe_transport(&self, fd: SubprocessFd) -> Option<Arc<dyn Transport>> {
            let pipes = self.pipes.lock().unwrap();
            match fd {
                SubprocessFd::Stdin => pipes.stdin.clone(),
                SubprocessFd::Stdout => pipes.stdout.clone(),
                SubprocessFd::Stderr => pipes.stderr.clone(),
            }
        }

        fn send_signal(&self, signal: i32) -> Result<()> {
            let pid = i32::try_from(self.pid)
                .map_err(|_| EvLoopError::RuntimeError("pid does not fit in pid_t"))?;
            // SAFETY: `pid` names a process this record owns; if it has
            // already been reaped, `kill` harmlessly returns `ESRCH`.
            let rc = unsafe { libc::kill(pid, signal) };
            if rc == 0 {
                Ok(())
            } else {
                Err(EvLoopError::Os(std::io::Error::last_os_error()))
            }
        }

        fn terminate(&self) -> Result<()> {
            self.send_signal(libc::SIGTERM)
        }

        fn kill(&self) -> Result<()> {
            self.send_signal(libc::SIGKILL)
        }

        fn close(&self) {
            if let Some(stdin) = self.pipes.lock().unwrap().stdin.clone() {
                stdin.close();
            }
        }
    }

    struct ReadRelay {
        protocol: Arc<dyn SubprocessProtocol>,
        fd: SubprocessFd,
    }

    impl Protocol for ReadRelay {
        fn connection_made(&self, _transport: Arc<dyn Transport>) {}
        fn connection_lost(&self, error: Option<EvLoopError>) {
            self.protocol.pipe_connection_lost(self.fd, error);
        }
    }

    impl StreamProtocol for ReadRelay {
        fn data_received(&self, data: &[u8]) {
            self.protocol.pipe_data_received(self.fd, data);
        }
    }

    struct StdinRelay {
        protocol: Arc<dyn SubprocessProtocol>,
    }

    impl Protocol for StdinRelay {
        fn connection_made(&self, _transport: Arc<dyn Transport>) {}
        fn connection_lost(&self, error: Option<EvLoopError>) {
            self.protocol.pipe_connection_lost(SubprocessFd::Stdin, error);
        }
    }

    fn owned_file(raw: impl IntoRawFd) -> std::fs::File {
        // SAFETY: `raw` is a just-taken child stdio handle with no other
        // owner; wrapping it in a `File` takes over that ownership without
        // duplicating or closing the descriptor out from under anyone else.
        unsafe { std::fs::File::from_raw_fd(raw.into_raw_fd()) }
    }

    fn exit_code(status: ExitStatus) -> Option<i32> {
        status.code()
    }

    fn spawn_subprocess(
        event_loop: &Arc<EventThread>,
        mut command: Command,
        stdin: PipeOption,
        stdout: PipeOption,
        stderr: PipeOption,
        protocol: Arc<dyn SubprocessProtocol>,
    ) -> Result<Task<Arc<dyn SubprocessTransport>>> {
        command.stdin(stdin.into_stdio());
        command.stdout(stdout.into_stdio());
        command.stderr(stderr.into_stdio());

        let mut child: Child = command.spawn()?;
        let pid = child.id();

        let stdin_file = (stdin == PipeOption::Piped)
            .then(|| child.stdin.take().expect("stdin piped"))
            .map(owned_file);
        let stdout_file = (stdout == PipeOption::Piped)
            .then(|| child.stdout.take().expect("stdout piped"))
            .map(owned_file);
        let stderr_file = (stderr == PipeOption::Piped)
            .then(|| child.stderr.take().expect("stderr piped"))
            .map(owned_file);

        let this = Arc::new(Subprocess {
            pid,
            returncode: Mutex::new(None),
            pipes: Mutex::new(PipeState { stdin: None, stdout: None, stderr: None }),
            protocol: protocol.clone(),
            closing: AtomicBool::new(false),
        });

        if let Some(file) = stdin_file {
            let relay = Arc::new(StdinRelay { protocol: protocol.clone() }) as Arc<dyn Protocol>;
            let transport = transport::make_unix_write_pipe_transport(event_loop.clone(), file, relay)
                .get_result()
                .expect("pipe transport installation always resolves its waiter");
            this.pipes.lock().unwrap().stdin = Some(transport);
        }
        if let Some(file) = stdout_file {
            let relay = Arc::new(ReadRelay { protocol: protocol.clone(), fd: SubprocessFd::Stdout });
            let transport = transport::make_unix_read_pipe_transport(event_loop.clone(), file, relay)
                .get_result()
                .expect("pipe transport installation always resolves its waiter");
            this.pipes.lock().unwrap().stdout = Some(transport);
        }
        if let Some(file) = stderr_file {
            let relay = Arc::new(ReadRelay { protocol: protocol.clone(), fd: SubprocessFd::Stderr });
            let transport = transport::make_unix_read_pipe_transport(event_loop.clone(), file, relay)
                .get_result()
                .expect("pipe transport installation always resolves its waiter");
            this.pipes.lock().unwrap().stderr = Some(transport);
        }

        protocol.connection_made(this.clone() as Arc<dyn SubprocessTransport>);

        let exit_loop = event_loop.clone();
        let exit_this = this.clone();
        event_loop
            .run_in_executor(move || child.wait().map_err(EvLoopError::from))
            .add_done_callback(move |fut| match fut.get_result() {
                Ok(status) => exit_this.on_exit(exit_code(status)),
                Err(err) => {
                    exit_loop.exception_reporter().report("subprocess wait", &err);
                    exit_this.on_exit(None);
                }
            });

        Ok(event_loop.create_task(async move { Ok(this as Arc<dyn SubprocessTransport>) }))
    }

    /// `subprocess_exec` (spec §4.2): spawns `program` directly, with no
    /// shell interposed.
    ///
    /// # Errors
    ///
    /// Returns [`EvLoopError::Os`] if spawning the child process fails.
    pub fn subprocess_exec(
        event_loop: &Arc<EventThread>,
        program: &str,
        args: &[String],
        stdin: PipeOption,
        stdout: PipeOption,
        stderr: PipeOption,
        protocol: Arc<dyn SubprocessProtocol>,
    ) -> Result<Task<Arc<dyn SubprocessTransport>>> {
        let mut command = Command::new(program);
        command.args(args);
        spawn_subprocess(event_loop, command, stdin, stdout, stderr, protocol)
    }

    /// `subprocess_shell` (spec §4.2): runs `cmd` through `/bin/sh -c`.
    ///
    /// # Errors
    ///
    /// Returns [`EvLoopError::Os`] if spawning the shell fails.
    pub fn subprocess_shell(
        event_loop: &Arc<EventThread>,
        cmd: &str,
        stdin: PipeOption,
        stdout: PipeOption,
        stderr: PipeOption,
        protocol: Arc<dyn SubprocessProtocol>,
    ) -> Result<Task<Arc<dyn SubprocessTransport>>> {
        let mut command = Command::new("/bin/sh");
        command.arg("-c").arg(cmd);
        spawn_subprocess(event_loop, command, stdin, stdout, stderr, protocol)
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use std::sync::atomic::{AtomicBool, Ordering};
        use std::sync::Mutex as StdMutex;
        use std::time::Duration;

        struct RecordingSubprocessProtocol {
            stdout: StdMutex<Vec<u8>>,
            exited: Arc<AtomicBool>,
        }

        impl SubprocessProtocol for RecordingSubprocessProtocol {
            fn connection_made(&self, _transport: Arc<dyn SubprocessTransport>) {}
            fn pipe_data_received(&self, fd: SubprocessFd, data: &[u8]) {
                if fd == SubprocessFd::Stdout {
                    self.stdout.lock().unwrap().extend_from_slice(data);
                }
            }
            fn process_exited(&self) {
                self.exited.store(true, Ordering::SeqCst);
            }
        }

        #[test]
        fn subprocess_exec_captures_stdout_and_reports_exit() {
            let event_loop = EventThread::new().unwrap();
            event_loop.ensure_started();

            let exited = Arc::new(AtomicBool::new(false));
            let protocol = Arc::new(RecordingSubprocessProtocol {
                stdout: StdMutex::new(Vec::new()),
                exited: exited.clone(),
            });

            let task = subprocess_exec(
                &event_loop,
                "/bin/echo",
                &["hello".to_string()],
                PipeOption::Null,
                PipeOption::Piped,
                PipeOption::Null,
                protocol.clone(),
            )
            .unwrap();

            for _ in 0..100 {
                if task.is_done() {
                    break;
                }
                std::thread::sleep(Duration::from_millis(10));
            }
            assert!(task.is_done(), "construction task never resolved");

            for _ in 0..200 {
                if exited.load(Ordering::SeqCst) {
                    break;
                }
                std::thread::sleep(Duration::from_millis(10));
            }

            assert!(exited.load(Ordering::SeqCst), "process_exited was never reported");
            assert!(protocol.stdout.lock().unwrap().starts_with(b"hello"));

            event_loop.stop();
            event_loop.join();
        }

        #[test]
        fn subprocess_exec_rejects_nonpositive_no_such_program() {
            let event_loop = EventThread::new().unwrap();
            event_loop.ensure_started();
            let protocol = Arc::new(RecordingSubprocessProtocol {
                stdout: StdMutex::new(Vec::new()),
                exited: Arc::new(AtomicBool::new(false)),
            });
            let result = subprocess_exec(
                &event_loop,
                "/no/such/executable-evloop-rt-test",
                &[],
                PipeOption::Null,
                PipeOption::Null,
                PipeOption::Null,
                protocol,
            );
            assert!(result.is_err());
            event_loop.stop();
            event_loop.join();
        }
    }
}

#[cfg(not(unix))]
mod imp {
    use std::sync::Arc;

    use crate::error::{EvLoopError, Result};
    use crate::event_loop::EventThread;
    use crate::task::Task;
    use crate::transport::Transport;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum SubprocessFd {
        Stdin,
        Stdout,
        Stderr,
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum PipeOption {
        Piped,
        Null,
        Inherit,
    }

    pub trait SubprocessProtocol: Send + Sync {
        fn connection_made(&self, transport: Arc<dyn SubprocessTransport>);
        fn connection_lost(&self, error: Option<EvLoopError>) {
            let _ = error;
        }
        fn pipe_data_received(&self, fd: SubprocessFd, data: &[u8]);
        fn pipe_connection_lost(&self, fd: SubprocessFd, error: Option<EvLoopError>) {
            let _ = (fd, error);
        }
        fn process_exited(&self);
    }

    pub trait SubprocessTransport: Send + Sync {
        fn get_pid(&self) -> u32;
        fn get_returncode(&self) -> Option<i32>;
        fn get_pipe_transport(&self, fd: SubprocessFd) -> Option<Arc<dyn Transport>>;
        fn send_signal(&self, signal: i32) -> Result<()>;
        fn terminate(&self) -> Result<()>;
        fn kill(&self) -> Result<()>;
        fn close(&self);
    }

    /// # Errors
    ///
    /// Always returns [`EvLoopError::NotImplemented`] on non-UNIX platforms.
    pub fn subprocess_exec(
        _event_loop: &Arc<EventThread>,
        _program: &str,
        _args: &[String],
        _stdin: PipeOption,
        _stdout: PipeOption,
        _stderr: PipeOption,
        _protocol: Arc<dyn SubprocessProtocol>,
    ) -> Result<Task<Arc<dyn SubprocessTransport>>> {
        Err(EvLoopError::NotImplemented("subprocesses require a UNIX platform"))
    }

    /// # Errors
    ///
    /// Always returns [`EvLoopError::NotImplemented`] on non-UNIX platforms.
    pub fn subprocess_shell(
        _event_loop: &Arc<EventThread>,
        _cmd: &str,
        _stdin: PipeOption,
        _stdout: PipeOption,
        _stderr: PipeOption,
        _protocol: Arc<dyn SubprocessProtocol>,
    ) -> Result<Task<Arc<dyn SubprocessTransport>>> {
        Err(EvLoopError::NotImplemented("subprocesses require a UNIX platform"))
    }
}

pub use imp::{
    subprocess_exec, subprocess_shell, PipeOption, SubprocessFd, SubprocessProtocol,
    SubprocessTransport,
};
