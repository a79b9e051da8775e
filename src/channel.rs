//! Non-blocking duplex channel over a child process's standard streams.
//!
//! A [`Channel`] lets the marshal worker talk to a bot process without ever
//! risking an indefinite wait on a peer that is slow, dead, or has closed
//! its end of the pipe. Reads and writes only touch bytes the OS reports as
//! ready; everything else is bounded by [`Channel::wait_readable`].
//!
//! Construction registers the owning process with the
//! [`ProcessRegistry`]; once either stream is observed closed it is shut
//! down and the process deregistered, exactly once. Subsequent calls keep
//! reporting [`Recv::Closed`] / [`SendOutcome::Closed`] instead of failing.

use std::io;
use std::io::{Read, Write};
use std::process::{Child, ChildStdin, ChildStdout};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;

use crate::registry::ProcessRegistry;

/// Outcome of a non-blocking read.
#[derive(Debug, PartialEq, Eq)]
pub enum Recv {
    /// At most `max_bytes` already-available bytes.
    Data(Vec<u8>),
    /// Nothing available right now; the peer is still alive.
    Empty,
    /// The peer's end is gone. Reported on every call from now on.
    Closed,
}

/// Outcome of a non-blocking write.
#[derive(Debug, PartialEq, Eq)]
pub enum SendOutcome {
    /// Number of bytes accepted by the pipe; 0 when it was not writable.
    Sent(usize),
    /// The peer closed its read end. Reported on every call from now on.
    Closed,
}

/// Duplex byte channel over a child's piped stdin/stdout.
#[derive(Debug)]
pub struct Channel {
    pid: u32,
    stdin: Option<ChildStdin>,
    stdout: Option<ChildStdout>,
    registry: Arc<ProcessRegistry>,
}

impl Channel {
    /// Default cap on bytes returned by a single [`recv`](Channel::recv).
    pub const DEFAULT_RECV_LIMIT: usize = 1024;

    /// Take the piped streams out of `child` and track its pid.
    ///
    /// Fails if the child was not spawned with both stdin and stdout piped.
    pub fn new(
        child: &mut Child,
        registry: Arc<ProcessRegistry>,
        label: &str,
    ) -> anyhow::Result<Channel> {
        let pid = child.id();
        let stdin = child.stdin.take().context("child stdin is not piped")?;
        let stdout = child.stdout.take().context("child stdout is not piped")?;
        registry.track(pid, label);
        Ok(Channel {
            pid,
            stdin: Some(stdin),
            stdout: Some(stdout),
            registry,
        })
    }

    /// Pid of the process on the other side of the pipes.
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Wait until the peer's output has data, up to `timeout`.
    ///
    /// `None` waits indefinitely. Returns `Ok(true)` when a read will not
    /// block, which includes end-of-file on a dead peer, so a caller
    /// always learns about closure through [`recv`](Channel::recv).
    pub fn wait_readable(&self, timeout: Option<Duration>) -> io::Result<bool> {
        let Some(stdout) = self.stdout.as_ref() else {
            // Already closed: a recv() would return Closed immediately.
            return Ok(true);
        };
        sys::wait_readable(stdout, timeout)
    }

    /// Read at most `max_bytes` (floor 1) already-available bytes.
    #[cfg(unix)]
    pub fn recv(&mut self, max_bytes: usize) -> io::Result<Recv> {
        use std::os::fd::AsRawFd;

        let Some(stdout) = self.stdout.as_mut() else {
            return Ok(Recv::Closed);
        };
        let max_bytes = max_bytes.max(1);

        let fd = stdout.as_raw_fd();
        if !sys::poll_fd(fd, libc::POLLIN, Some(Duration::ZERO))? {
            return Ok(Recv::Empty);
        }

        // Read with O_NONBLOCK and restore the flags afterwards, so a
        // spurious wakeup can never park us on a silent peer.
        sys::set_nonblocking(fd, true)?;
        let mut buf = vec![0u8; max_bytes];
        let result = stdout.read(&mut buf);
        let _ = sys::set_nonblocking(fd, false);

        match result {
            Ok(0) => {
                self.close_stdout();
                Ok(Recv::Closed)
            }
            Ok(n) => {
                buf.truncate(n);
                Ok(Recv::Data(buf))
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(Recv::Empty),
            Err(e) => Err(e),
        }
    }

    /// Read at most `max_bytes` (floor 1) already-available bytes.
    #[cfg(windows)]
    pub fn recv(&mut self, max_bytes: usize) -> io::Result<Recv> {
        use std::os::windows::io::AsRawHandle;

        let Some(stdout) = self.stdout.as_mut() else {
            return Ok(Recv::Closed);
        };
        let max_bytes = max_bytes.max(1);

        let available = match sys::peek_available(stdout.as_raw_handle()) {
            Ok(n) => n,
            Err(e) if sys::is_disconnect(&e) => {
                self.close_stdout();
                return Ok(Recv::Closed);
            }
            Err(e) => return Err(e),
        };
        if available == 0 {
            return Ok(Recv::Empty);
        }

        // Only the peeked bytes are requested, so this read cannot block.
        let mut buf = vec![0u8; available.min(max_bytes)];
        match stdout.read(&mut buf) {
            Ok(0) => {
                self.close_stdout();
                Ok(Recv::Closed)
            }
            Ok(n) => {
                buf.truncate(n);
                Ok(Recv::Data(buf))
            }
            Err(e) if sys::is_disconnect(&e) => {
                self.close_stdout();
                Ok(Recv::Closed)
            }
            Err(e) => Err(e),
        }
    }

    /// Write `bytes` to the peer's input without blocking.
    #[cfg(unix)]
    pub fn send(&mut self, bytes: &[u8]) -> io::Result<SendOutcome> {
        use std::os::fd::AsRawFd;

        let Some(stdin) = self.stdin.as_mut() else {
            return Ok(SendOutcome::Closed);
        };
        if !sys::poll_fd(stdin.as_raw_fd(), libc::POLLOUT, Some(Duration::ZERO))? {
            return Ok(SendOutcome::Sent(0));
        }
        match stdin.write(bytes) {
            Ok(n) => Ok(SendOutcome::Sent(n)),
            Err(e) if e.kind() == io::ErrorKind::BrokenPipe => {
                self.close_stdin();
                Ok(SendOutcome::Closed)
            }
            Err(e) => Err(e),
        }
    }

    /// Write `bytes` to the peer's input without blocking.
    #[cfg(windows)]
    pub fn send(&mut self, bytes: &[u8]) -> io::Result<SendOutcome> {
        let Some(stdin) = self.stdin.as_mut() else {
            return Ok(SendOutcome::Closed);
        };
        match stdin.write(bytes) {
            Ok(n) => Ok(SendOutcome::Sent(n)),
            Err(e) if sys::is_disconnect(&e) => {
                self.close_stdin();
                Ok(SendOutcome::Closed)
            }
            Err(e) => Err(e),
        }
    }

    /// Close both streams and deregister the process. Idempotent.
    pub fn close(&mut self) {
        self.close_stdin();
        self.close_stdout();
    }

    fn close_stdin(&mut self) {
        if self.stdin.take().is_some() {
            self.registry.untrack(self.pid);
        }
    }

    fn close_stdout(&mut self) {
        if self.stdout.take().is_some() {
            self.registry.untrack(self.pid);
        }
    }
}

#[cfg(unix)]
mod sys {
    use std::io;
    use std::os::fd::{AsRawFd, RawFd};
    use std::process::ChildStdout;
    use std::time::Duration;

    pub(super) fn wait_readable(
        stdout: &ChildStdout,
        timeout: Option<Duration>,
    ) -> io::Result<bool> {
        poll_fd(stdout.as_raw_fd(), libc::POLLIN, timeout)
    }

    pub(super) fn poll_fd(
        fd: RawFd,
        events: libc::c_short,
        timeout: Option<Duration>,
    ) -> io::Result<bool> {
        let mut pollfd = libc::pollfd {
            fd,
            events,
            revents: 0,
        };
        let millis: libc::c_int = match timeout {
            None => -1,
            Some(t) => t.as_millis().min(libc::c_int::MAX as u128) as libc::c_int,
        };
        loop {
            let rc = unsafe { libc::poll(&mut pollfd, 1, millis) };
            if rc < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(err);
            }
            // POLLHUP/POLLERR also count: the following read/write will
            // not block, it will report the closed peer.
            return Ok(rc > 0);
        }
    }

    pub(super) fn set_nonblocking(fd: RawFd, nonblocking: bool) -> io::Result<()> {
        unsafe {
            let flags = libc::fcntl(fd, libc::F_GETFL);
            if flags < 0 {
                return Err(io::Error::last_os_error());
            }
            let flags = if nonblocking {
                flags | libc::O_NONBLOCK
            } else {
                flags & !libc::O_NONBLOCK
            };
            if libc::fcntl(fd, libc::F_SETFL, flags) < 0 {
                return Err(io::Error::last_os_error());
            }
        }
        Ok(())
    }
}

#[cfg(windows)]
mod sys {
    use std::io;
    use std::os::windows::io::{AsRawHandle, RawHandle};
    use std::process::ChildStdout;
    use std::time::Duration;

    use windows_sys::Win32::Foundation::{HANDLE, WAIT_OBJECT_0};
    use windows_sys::Win32::System::Pipes::PeekNamedPipe;
    use windows_sys::Win32::System::Threading::{WaitForSingleObject, INFINITE};

    const ERROR_BROKEN_PIPE: i32 = 109;
    const ERROR_NO_DATA: i32 = 232;

    pub(super) fn wait_readable(
        stdout: &ChildStdout,
        timeout: Option<Duration>,
    ) -> io::Result<bool> {
        let millis = match timeout {
            None => INFINITE,
            Some(t) => t.as_millis().min(u32::MAX as u128) as u32,
        };
        let rc = unsafe { WaitForSingleObject(stdout.as_raw_handle() as HANDLE, millis) };
        Ok(rc == WAIT_OBJECT_0)
    }

    pub(super) fn peek_available(handle: RawHandle) -> io::Result<usize> {
        let mut available: u32 = 0;
        let ok = unsafe {
            PeekNamedPipe(
                handle as HANDLE,
                std::ptr::null_mut(),
                0,
                std::ptr::null_mut(),
                &mut available,
                std::ptr::null_mut(),
            )
        };
        if ok == 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(available as usize)
        }
    }

    pub(super) fn is_disconnect(err: &io::Error) -> bool {
        err.kind() == io::ErrorKind::BrokenPipe
            || matches!(err.raw_os_error(), Some(ERROR_BROKEN_PIPE) | Some(ERROR_NO_DATA))
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::process::{Command, Stdio};

    fn spawn_sh(script: &str) -> Child {
        Command::new("sh")
            .arg("-c")
            .arg(script)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .spawn()
            .expect("could not spawn sh")
    }

    #[test]
    fn recv_reports_closed_exactly_as_a_sticky_state() {
        let registry = Arc::new(ProcessRegistry::new());
        let mut child = spawn_sh("exit 0");
        let mut channel = Channel::new(&mut child, registry.clone(), "t").unwrap();
        assert_eq!(registry.tracked(), 1);

        child.wait().expect("wait failed");

        // First call observes the closed pipe and deregisters the process;
        // every later call keeps reporting Closed.
        assert_eq!(channel.recv(16).unwrap(), Recv::Closed);
        assert_eq!(registry.tracked(), 0);
        assert_eq!(channel.recv(16).unwrap(), Recv::Closed);
        assert_eq!(channel.recv(16).unwrap(), Recv::Closed);
    }

    #[test]
    fn recv_is_empty_while_the_peer_is_silent() {
        let registry = Arc::new(ProcessRegistry::new());
        let mut child = spawn_sh("read unused");
        let mut channel = Channel::new(&mut child, registry.clone(), "t").unwrap();

        assert_eq!(channel.recv(16).unwrap(), Recv::Empty);
        assert!(!channel.wait_readable(Some(Duration::from_millis(20))).unwrap());

        registry.kill(channel.pid());
        child.wait().expect("wait failed");
    }

    #[test]
    fn recv_returns_available_bytes_up_to_the_cap() {
        let registry = Arc::new(ProcessRegistry::new());
        let mut child = spawn_sh("printf 'hello world\\n'; read unused");
        let mut channel = Channel::new(&mut child, registry.clone(), "t").unwrap();

        assert!(channel.wait_readable(Some(Duration::from_secs(5))).unwrap());
        let Recv::Data(first) = channel.recv(5).unwrap() else {
            panic!("expected data");
        };
        assert_eq!(first, b"hello");

        registry.kill(channel.pid());
        child.wait().expect("wait failed");
    }

    #[test]
    fn send_mirrors_the_closed_contract() {
        let registry = Arc::new(ProcessRegistry::new());
        let mut child = spawn_sh("exit 0");
        let mut channel = Channel::new(&mut child, registry.clone(), "t").unwrap();
        child.wait().expect("wait failed");

        // The read end is gone; the first write may drain into the pipe
        // buffer, but the channel settles on Closed and stays there.
        let mut saw_closed = false;
        for _ in 0..4 {
            if channel.send(b"ping\n").unwrap() == SendOutcome::Closed {
                saw_closed = true;
                break;
            }
        }
        assert!(saw_closed);
        assert_eq!(channel.send(b"ping\n").unwrap(), SendOutcome::Closed);
        assert_eq!(registry.tracked(), 0);
    }
}
