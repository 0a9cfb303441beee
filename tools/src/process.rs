//! Subprocess cleanup for tools that spawn commands.

use tokio::process::{Child, Command};

/// Kills a spawned child (and on Unix its whole process group) when dropped.
///
/// Wrap the child right after `spawn()` so a timeout or cancellation that
/// drops the owning future also tears down anything the command started.
/// Call `disarm()` once the process has exited on its own.
pub struct ChildGuard {
    child: Option<Child>,
}

impl ChildGuard {
    #[must_use]
    pub fn new(child: Child) -> Self {
        Self { child: Some(child) }
    }

    pub fn child_mut(&mut self) -> Option<&mut Child> {
        self.child.as_mut()
    }

    pub fn disarm(&mut self) {
        self.child = None;
    }
}

impl Drop for ChildGuard {
    fn drop(&mut self) {
        let Some(child) = self.child.as_mut() else {
            return;
        };
        #[cfg(unix)]
        {
            if let Some(pid) = child.id() {
                // SAFETY: killpg only sends a signal; a stale pid yields ESRCH.
                let rc = unsafe { libc::killpg(pid as libc::pid_t, libc::SIGKILL) };
                if rc == -1 {
                    let _ = child.start_kill();
                }
            }
        }
        #[cfg(not(unix))]
        {
            let _ = child.start_kill();
        }
        let _ = child.try_wait();
    }
}

/// Start the command in its own session so the process group can be killed
/// as a unit.
#[cfg(unix)]
pub fn set_new_session(cmd: &mut Command) {
    use std::io;
    use std::os::unix::process::CommandExt;

    // SAFETY: setsid is async-signal-safe and touches no parent state.
    unsafe {
        cmd.as_std_mut().pre_exec(|| {
            if libc::setsid() == -1 {
                return Err(io::Error::last_os_error());
            }
            Ok(())
        });
    }
}

#[cfg(not(unix))]
pub fn set_new_session(_cmd: &mut Command) {}
