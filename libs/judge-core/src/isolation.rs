//! Kernel-level isolation for sandbox processes.
//!
//! With namespaces enabled, every run gets fresh user, network, mount, PID,
//! IPC and UTS namespaces, set up between fork and exec:
//!
//! ```text
//! supervisor ── relay            (own process group, outside the namespaces)
//!                 └── interpreter (PID 1 of a fresh PID namespace)
//!                       └── anything it spawns
//! ```
//!
//! The relay waits for the interpreter and dies the same way, so the
//! supervisor still sees the interpreter's exit status. Killing the relay
//! makes the kernel SIGKILL the interpreter (parent-death signal), and when
//! the interpreter dies every process in its PID namespace dies with it, no
//! matter which process group or session it moved to.
//!
//! The network namespace has no interfaces up, so nothing can connect out or
//! reach host services. In the mount namespace the workspace's parent
//! directory and a few host directories are covered with empty read-only
//! tmpfs mounts; the sandbox keeps its own workspace through its working
//! directory.

use std::ffi::CString;
use std::path::Path;
use std::str::FromStr;

/// Directories covered on top of the workspace parent when they exist.
const HOST_DIRS_HIDDEN: &[&str] = &["/root", "/home", "/run", "/srv", "/mnt", "/media"];

/// Exit code of a relay that lost track of the interpreter.
#[cfg(target_os = "linux")]
const RELAY_FAILURE_EXIT: i32 = 125;

/// Whether sandboxes get their own namespaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NamespaceMode {
    /// Namespaces when the host allows them, process-level isolation otherwise.
    #[default]
    Auto,
    /// Every run fails with an internal error when namespaces are unavailable.
    Required,
    /// Process-level isolation only. The worker itself must then run in a
    /// container without network access.
    Off,
}

impl FromStr for NamespaceMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "auto" => Ok(NamespaceMode::Auto),
            "required" | "on" => Ok(NamespaceMode::Required),
            "off" => Ok(NamespaceMode::Off),
            other => Err(format!("expected auto, required or off, got '{}'", other)),
        }
    }
}

/// Credentials a sandboxed process runs under.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SandboxUser {
    pub uid: u32,
    pub gid: u32,
}

impl SandboxUser {
    pub const NOBODY: SandboxUser = SandboxUser { uid: 65534, gid: 65534 };

    /// Root workers run sandboxes as `nobody`. Root is exempt from
    /// RLIMIT_NPROC and owns most host secrets.
    pub fn default_for_host() -> Option<SandboxUser> {
        #[cfg(unix)]
        {
            if nix::unistd::geteuid().is_root() {
                return Some(Self::NOBODY);
            }
        }
        None
    }
}

/// Mount targets for one run, prepared before fork so the child never
/// allocates.
#[derive(Debug, Clone)]
pub struct NamespacePlan {
    workspace_parent: CString,
    host_dirs: Vec<CString>,
    max_processes: u64,
}

impl NamespacePlan {
    pub fn for_workspace(workspace: &Path, max_processes: u64) -> std::io::Result<Self> {
        let parent = workspace
            .parent()
            .filter(|p| p.parent().is_some())
            .ok_or_else(|| {
                std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    format!("workspace {} must not sit directly under /", workspace.display()),
                )
            })?;

        Ok(Self {
            workspace_parent: path_cstring(parent)?,
            host_dirs: HOST_DIRS_HIDDEN
                .iter()
                .map(|dir| path_cstring(Path::new(dir)))
                .collect::<std::io::Result<_>>()?,
            max_processes,
        })
    }
}

fn path_cstring(path: &Path) -> std::io::Result<CString> {
    use std::os::unix::ffi::OsStrExt;

    CString::new(path.as_os_str().as_bytes())
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))
}

/// Enter fresh namespaces and split into relay and interpreter.
///
/// Returns only in the interpreter, which goes on to exec. The relay never
/// returns. Only valid in a single-threaded child between fork and exec.
#[cfg(target_os = "linux")]
pub(crate) fn enter(plan: &NamespacePlan) -> std::io::Result<()> {
    use nix::mount::{mount, MsFlags};
    use nix::sched::{unshare, CloneFlags};
    use nix::sys::resource::{setrlimit, Resource};
    use nix::sys::signal::Signal;
    use nix::unistd::{fork, ForkResult};
    use std::ffi::CStr;

    unshare(
        CloneFlags::CLONE_NEWUSER
            | CloneFlags::CLONE_NEWNS
            | CloneFlags::CLONE_NEWNET
            | CloneFlags::CLONE_NEWPID
            | CloneFlags::CLONE_NEWIPC
            | CloneFlags::CLONE_NEWUTS,
    )?;

    // Set after unshare, so the count is kept per sandbox and not shared by
    // every run under the same host user
    setrlimit(Resource::RLIMIT_NPROC, plan.max_processes, plan.max_processes)?;

    // Nothing mounted below propagates back to the host
    mount(
        None::<&CStr>,
        c"/",
        None::<&CStr>,
        MsFlags::MS_REC | MsFlags::MS_PRIVATE,
        None::<&CStr>,
    )?;

    let hidden = MsFlags::MS_RDONLY | MsFlags::MS_NOSUID | MsFlags::MS_NODEV | MsFlags::MS_NOEXEC;
    let cover = |dir: &CStr| mount(Some(c"tmpfs"), dir, Some(c"tmpfs"), hidden, Some(c"size=4k,mode=0555"));

    // Other runs' workspaces live next to ours
    cover(plan.workspace_parent.as_c_str())?;
    for dir in &plan.host_dirs {
        // Missing on many hosts
        let _ = cover(dir.as_c_str());
    }

    // SAFETY: pre-exec children are single-threaded
    match unsafe { fork() }? {
        ForkResult::Parent { child } => relay(child),
        ForkResult::Child => {
            nix::sys::prctl::set_pdeathsig(Signal::SIGKILL)?;
            // Hides host processes where the kernel allows a fresh procfs
            let _ = mount(
                Some(c"proc"),
                c"/proc",
                Some(c"proc"),
                MsFlags::MS_NOSUID | MsFlags::MS_NODEV | MsFlags::MS_NOEXEC,
                None::<&CStr>,
            );
            Ok(())
        }
    }
}

#[cfg(all(unix, not(target_os = "linux")))]
pub(crate) fn enter(_plan: &NamespacePlan) -> std::io::Result<()> {
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "sandbox namespaces need Linux",
    ))
}

#[cfg(target_os = "linux")]
fn relay(child: nix::unistd::Pid) -> ! {
    use nix::errno::Errno;
    use nix::sys::wait::{waitpid, WaitStatus};

    close_all_fds();
    loop {
        match waitpid(child, None) {
            Ok(WaitStatus::Exited(_, code)) => exit_now(code),
            Ok(WaitStatus::Signaled(_, signal, _)) => die_by(signal),
            Ok(_) | Err(Errno::EINTR) => continue,
            Err(_) => exit_now(RELAY_FAILURE_EXIT),
        }
    }
}

/// The relay holds copies of the sandbox pipes and of the spawn status
/// pipe; the supervisor only sees EOF once they are gone.
#[cfg(target_os = "linux")]
fn close_all_fds() {
    // SAFETY: close_range(2) only closes descriptors of this process
    let closed = unsafe { libc::syscall(libc::SYS_close_range, 0u32, u32::MAX, 0u32) };
    if closed != 0 {
        for fd in 0..4096 {
            // SAFETY: closing an unused descriptor number is harmless
            unsafe { libc::close(fd) };
        }
    }
}

#[cfg(target_os = "linux")]
fn die_by(signal: nix::sys::signal::Signal) -> ! {
    use nix::sys::signal::{raise, sigaction, SaFlags, SigAction, SigHandler, SigSet};

    let default = SigAction::new(SigHandler::SigDfl, SaFlags::empty(), SigSet::empty());
    // SAFETY: restores the default disposition, installs no handler
    let _ = unsafe { sigaction(signal, &default) };
    let mut set = SigSet::empty();
    set.add(signal);
    let _ = set.thread_unblock();
    let _ = raise(signal);
    exit_now(128 + signal as i32)
}

#[cfg(target_os = "linux")]
fn exit_now(code: i32) -> ! {
    // SAFETY: _exit(2) skips atexit handlers and stdio flushing, both of
    // which belong to the parent process image
    unsafe { libc::_exit(code) }
}

/// Check once whether this host lets sandboxes enter namespaces, by running
/// `/bin/sh -c :` through the same setup a real run uses.
pub fn namespaces_available(temp_root: &Path, run_as: Option<SandboxUser>) -> bool {
    #[cfg(target_os = "linux")]
    {
        use std::os::unix::process::CommandExt;
        use std::process::{Command, Stdio};
        use std::sync::OnceLock;

        static AVAILABLE: OnceLock<bool> = OnceLock::new();

        *AVAILABLE.get_or_init(|| {
            let Ok(plan) = NamespacePlan::for_workspace(&temp_root.join("judge-check"), 8) else {
                return false;
            };

            let mut cmd = Command::new("/bin/sh");
            cmd.args(["-c", ":"])
                .env_clear()
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::null());
            if let Some(user) = run_as {
                cmd.uid(user.uid).gid(user.gid);
            }
            // SAFETY: enter() is written for the post-fork child
            unsafe {
                cmd.pre_exec(move || enter(&plan));
            }

            matches!(cmd.status(), Ok(status) if status.success())
        })
    }

    #[cfg(not(target_os = "linux"))]
    {
        let _ = (temp_root, run_as);
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_namespace_mode_parse() {
        assert_eq!("auto".parse::<NamespaceMode>(), Ok(NamespaceMode::Auto));
        assert_eq!(" Required ".parse::<NamespaceMode>(), Ok(NamespaceMode::Required));
        assert_eq!("off".parse::<NamespaceMode>(), Ok(NamespaceMode::Off));
        assert!("sometimes".parse::<NamespaceMode>().is_err());
    }

    #[test]
    fn test_plan_covers_workspace_parent() {
        let plan = NamespacePlan::for_workspace(Path::new("/var/tmp/judge-sandbox-x1"), 64).unwrap();
        assert_eq!(plan.workspace_parent.to_str().unwrap(), "/var/tmp");
        assert!(plan.host_dirs.iter().any(|d| d.to_str() == Ok("/home")));
    }

    #[test]
    fn test_plan_rejects_workspace_under_root() {
        assert!(NamespacePlan::for_workspace(Path::new("/judge-sandbox-x1"), 64).is_err());
        assert!(NamespacePlan::for_workspace(Path::new("/"), 64).is_err());
    }
}
