//! Pseudo-terminal handling for the TTY Exec Dispatcher (component H).
//! Unix only — there is no exec dispatcher without a pty(7) to back it.
//!
//! The controller (`/dev/ptmx` side) is opened and tracked by catchd; the
//! user side is handed to the spawned child, which makes it its controlling
//! terminal by calling `setsid()` and opening the slave path fresh (without
//! `O_NOCTTY`) in a `pre_exec` hook, the standard two-step pty-spawn dance.

use std::os::fd::{AsFd, OwnedFd};
use std::os::unix::process::CommandExt;

use rustix::pty::{grantpt, openpt, ptsname, unlockpt, OpenptFlags};
use rustix::termios::{tcsetwinsize, Winsize};

use crate::errors::{Error, Result};

/// An allocated controller/user pty pair. `controller` is read/written by
/// catchd to drive the session; `user_path` is the `/dev/pts/<N>` path the
/// spawned child attaches to as its own controlling terminal.
pub struct Pty {
    pub controller: OwnedFd,
    pub user_path: String,
}

fn winsize_of(rows: u16, cols: u16) -> Winsize {
    Winsize {
        ws_row: rows,
        ws_col: cols,
        ws_xpixel: 0,
        ws_ypixel: 0,
    }
}

/// Allocate a fresh controller/user pty pair at the given initial terminal
/// size.
pub fn open(rows: u16, cols: u16) -> Result<Pty> {
    let controller =
        openpt(OpenptFlags::RDWR | OpenptFlags::NOCTTY).map_err(|e| Error::Internal(format!("openpt failed: {e}")))?;
    grantpt(&controller).map_err(|e| Error::Internal(format!("grantpt failed: {e}")))?;
    unlockpt(&controller).map_err(|e| Error::Internal(format!("unlockpt failed: {e}")))?;
    let name = ptsname(&controller, Vec::new()).map_err(|e| Error::Internal(format!("ptsname failed: {e}")))?;
    let user_path = name.to_string_lossy().into_owned();

    tcsetwinsize(&controller, winsize_of(rows, cols))
        .map_err(|e| Error::Internal(format!("tcsetwinsize failed: {e}")))?;

    Ok(Pty { controller, user_path })
}

/// Resize an already-open pty's window size, driving the `resize` control
/// frame on an exec session.
pub fn resize(pty: &Pty, rows: u16, cols: u16) -> Result<()> {
    tcsetwinsize(&pty.controller, winsize_of(rows, cols))
        .map_err(|e| Error::Internal(format!("tcsetwinsize failed: {e}")))?;
    Ok(())
}

impl Pty {
    /// Hand the controller side to tokio as a regular async file, for
    /// bridging to the exec session's stdin/stdout channel.
    pub fn into_controller_file(self) -> tokio::fs::File {
        tokio::fs::File::from_std(std::fs::File::from(self.controller))
    }
}

/// Wire `cmd` to attach to `user_path` as its controlling terminal instead
/// of inheriting catchd's own stdio. Must run before `spawn()`.
pub fn attach_child_to_pty(cmd: &mut tokio::process::Command, user_path: &str) {
    let user_path = user_path.to_string();
    unsafe {
        cmd.pre_exec(move || {
            rustix::process::setsid().map_err(std::io::Error::from)?;

            let slave = std::fs::OpenOptions::new()
                .read(true)
                .write(true)
                .open(&user_path)?;
            let fd = slave.as_fd();
            rustix::stdio::dup2_stdin(fd)?;
            rustix::stdio::dup2_stdout(fd)?;
            rustix::stdio::dup2_stderr(fd)?;
            // `slave` is dropped here once the dups land on 0/1/2; the
            // duplicated descriptors keep the pty connection alive.
            Ok(())
        });
    }
}

#[cfg(all(test, feature = "test_pty"))]
mod tests {
    use super::*;

    #[test]
    fn open_produces_a_readable_slave_path() {
        let pty = open(24, 80).unwrap();
        assert!(pty.user_path.starts_with("/dev/pts/"));
    }

    #[test]
    fn resize_does_not_error_on_a_fresh_pty() {
        let pty = open(24, 80).unwrap();
        resize(&pty, 40, 120).unwrap();
    }
}
