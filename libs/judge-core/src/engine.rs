/// Execution Engine - Spawn-and-Supervise Sandbox
///
/// **Core Responsibility:**
/// Run one interpreter process inside a throwaway workspace and report how
/// it ended: exit status, captured streams, report channel, wall time.
///
/// **Critical Architectural Boundary:**
/// - Engine knows HOW to run a process under limits
/// - Engine does NOT know languages, harnesses or expected outputs
/// - Engine returns raw process results for the backends to interpret
///
/// **Isolation per run:**
/// 1. Fresh temporary working directory, removed when the run ends
/// 2. Cleared environment, only the variables the backend passes
/// 3. Own process group, so the whole tree can be killed at once
/// 4. rlimits applied between fork and exec (core dumps, file writes,
///    descriptors, CPU backstop, optional address-space cap; process count
///    once inside namespaces)
/// 5. Fresh namespaces when the host allows them (isolation.rs): no network,
///    no view of other workspaces, no process outliving the interpreter
/// 6. Unprivileged credentials when the worker runs as root
/// 7. Preemptive wall-clock deadline: on expiry the process group is
///    SIGKILLed and reaped, the sandboxed code gets no say
///
/// **Report channel:**
/// Descriptor 3 of the sandboxed process is the write end of a pipe only the
/// supervisor reads. What arrives there comes back as `SandboxRun::report`,
/// separate from stdout, which the sandboxed code controls.
use crate::error::{JudgeError, Result};
use crate::isolation::{self, NamespaceMode, NamespacePlan, SandboxUser};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tracing::{debug, info, instrument, warn};

const READ_CHUNK_BYTES: usize = 8192;
const STREAM_DRAIN_GRACE: Duration = Duration::from_millis(200);
const SANDBOX_PATH: &str = "/usr/local/bin:/usr/bin:/bin";

/// Descriptor the report channel is attached to inside the sandbox.
pub const REPORT_FD: i32 = 3;

/// OS-level limits applied to the sandboxed process before exec.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceLimits {
    pub cpu_seconds: u64,
    pub address_space_bytes: Option<u64>,
    pub open_files: u64,
    pub file_size_bytes: u64,
}

impl ResourceLimits {
    /// CPU backstop derived from a wall-clock timeout: the deadline always
    /// fires first, RLIMIT_CPU only matters if supervision is lost.
    pub fn for_timeout(timeout_ms: u64) -> Self {
        Self {
            cpu_seconds: timeout_ms.div_ceil(1000) + 1,
            address_space_bytes: None,
            open_files: 64,
            file_size_bytes: 0,
        }
    }

    pub fn with_address_space(mut self, bytes: u64) -> Self {
        self.address_space_bytes = Some(bytes);
        self
    }
}

/// What to run inside a workspace.
#[derive(Debug, Clone)]
pub struct SandboxCommand {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub stdin: Vec<u8>,
    pub timeout: Duration,
    pub limits: ResourceLimits,
}

/// How the sandboxed process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    Exited(i32),
    Signaled(i32),
    TimedOut,
}

#[derive(Debug, Clone)]
pub struct SandboxRun {
    pub termination: Termination,
    pub stdout: String,
    pub stderr: String,
    pub stdout_truncated: bool,
    /// Everything written to the report channel.
    pub report: String,
    pub report_truncated: bool,
    pub elapsed_ms: u64,
}

/// Throwaway working directory for exactly one run.
pub struct Workspace {
    dir: TempDir,
    owner: Option<SandboxUser>,
}

impl Workspace {
    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub async fn write_file(&self, name: &str, contents: &str) -> Result<()> {
        let path = self.dir.path().join(name);
        tokio::fs::write(&path, contents).await?;
        if let Some(owner) = self.owner {
            hand_over(&path, owner)?;
        }
        Ok(())
    }
}

#[cfg(unix)]
fn hand_over(path: &Path, owner: SandboxUser) -> Result<()> {
    use nix::unistd::{chown, Gid, Uid};

    chown(path, Some(Uid::from_raw(owner.uid)), Some(Gid::from_raw(owner.gid)))
        .map_err(|e| JudgeError::Internal(format!("failed to hand {} to the sandbox user: {}", path.display(), e)))
}

#[cfg(not(unix))]
fn hand_over(_path: &Path, _owner: SandboxUser) -> Result<()> {
    Ok(())
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub max_output_bytes: usize,
    /// Extra wall time granted on top of the candidate's timeout for
    /// interpreter start-up before the supervisor kills the process.
    pub startup_grace: Duration,
    pub temp_root: Option<PathBuf>,
    pub namespaces: NamespaceMode,
    /// Credentials for sandboxed processes. `None` keeps the worker's own.
    pub run_as: Option<SandboxUser>,
    /// RLIMIT_NPROC inside a sandbox, threads included. Only applied with
    /// namespaces, where the count is per sandbox instead of per user.
    pub max_processes: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_output_bytes: 1024 * 1024,
            startup_grace: Duration::from_millis(150),
            temp_root: None,
            namespaces: NamespaceMode::Auto,
            run_as: SandboxUser::default_for_host(),
            max_processes: 64,
        }
    }
}

/// Kills the sandbox's process group when dropped.
///
/// Guarantees teardown when the run future is cancelled or panics, and
/// catches grandchildren that outlive the interpreter.
struct ProcessGroupGuard {
    pgid: Option<i32>,
}

impl ProcessGroupGuard {
    fn new(pid: Option<u32>) -> Self {
        Self {
            pgid: pid.map(|p| p as i32),
        }
    }

    fn kill(&mut self) {
        if let Some(pgid) = self.pgid.take() {
            kill_process_group(pgid);
        }
    }
}

impl Drop for ProcessGroupGuard {
    fn drop(&mut self) {
        self.kill();
    }
}

#[cfg(unix)]
fn kill_process_group(pgid: i32) {
    use nix::errno::Errno;
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    match killpg(Pid::from_raw(pgid), Signal::SIGKILL) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(e) => warn!(pgid = pgid, error = %e, "Failed to kill sandbox process group"),
    }
}

#[cfg(not(unix))]
fn kill_process_group(_pgid: i32) {}

#[cfg(unix)]
fn apply_rlimits(limits: &ResourceLimits) -> std::io::Result<()> {
    use nix::sys::resource::{setrlimit, Resource};

    setrlimit(Resource::RLIMIT_CORE, 0, 0)?;
    setrlimit(Resource::RLIMIT_FSIZE, limits.file_size_bytes, limits.file_size_bytes)?;
    setrlimit(Resource::RLIMIT_NOFILE, limits.open_files, limits.open_files)?;
    setrlimit(Resource::RLIMIT_CPU, limits.cpu_seconds, limits.cpu_seconds)?;
    if let Some(bytes) = limits.address_space_bytes {
        setrlimit(Resource::RLIMIT_AS, bytes, bytes)?;
    }
    Ok(())
}

/// Put the report pipe on `REPORT_FD`, open across exec.
#[cfg(unix)]
fn attach_report_channel(fd: std::os::fd::RawFd) -> std::io::Result<()> {
    use nix::fcntl::{fcntl, FcntlArg, FdFlag};

    if fd == REPORT_FD {
        fcntl(fd, FcntlArg::F_SETFD(FdFlag::empty()))?;
    } else {
        // dup2 clears close-on-exec on the new descriptor
        nix::unistd::dup2(fd, REPORT_FD)?;
    }
    Ok(())
}

/// Read a stream to the end, keeping at most `limit` bytes.
///
/// The rest is drained and discarded so a chatty process never blocks on a
/// full pipe.
async fn read_capped<R: AsyncRead + Unpin>(mut reader: R, limit: usize) -> std::io::Result<(Vec<u8>, bool)> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; READ_CHUNK_BYTES];
    let mut truncated = false;

    loop {
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        let room = limit.saturating_sub(buf.len());
        if room > 0 {
            buf.extend_from_slice(&chunk[..n.min(room)]);
        }
        if n > room {
            truncated = true;
        }
    }

    Ok((buf, truncated))
}

fn termination_of(status: std::process::ExitStatus) -> Termination {
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return Termination::Signaled(signal);
        }
    }
    Termination::Exited(status.code().unwrap_or(-1))
}

/// Process-based sandbox engine. Stateless apart from its configuration;
/// every run gets its own workspace and process group.
#[derive(Debug, Clone)]
pub struct ProcessEngine {
    config: EngineConfig,
    namespaces: bool,
}

impl Default for ProcessEngine {
    fn default() -> Self {
        Self::new(EngineConfig::default())
    }
}

impl ProcessEngine {
    pub fn new(config: EngineConfig) -> Self {
        let namespaces = match config.namespaces {
            NamespaceMode::Off => false,
            NamespaceMode::Required => true,
            NamespaceMode::Auto => {
                let available = isolation::namespaces_available(&config.temp_dir(), config.run_as);
                if !available {
                    warn!(
                        "Namespaces unavailable, sandboxes get process-level isolation only. \
                         Run the worker in a container without network access"
                    );
                }
                available
            }
        };

        info!(
            namespaces = namespaces,
            run_as = ?config.run_as.map(|u| u.uid),
            "Sandbox engine ready"
        );

        Self { config, namespaces }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Whether runs enter their own namespaces.
    pub fn namespaces_enabled(&self) -> bool {
        self.namespaces
    }

    pub fn create_workspace(&self) -> Result<Workspace> {
        let dir = tempfile::Builder::new()
            .prefix("judge-sandbox-")
            .tempdir_in(self.config.temp_dir())
            .map_err(|e| JudgeError::Internal(format!("failed to create sandbox workspace: {}", e)))?;

        if let Some(owner) = self.config.run_as {
            hand_over(dir.path(), owner)?;
        }

        Ok(Workspace {
            dir,
            owner: self.config.run_as,
        })
    }

    /// Run `command` inside `workspace` and supervise it until exit or deadline.
    ///
    /// Returns `Err` only for host-side failures (spawn, wait). Everything the
    /// sandboxed process does, including crashing or hanging, is reported in
    /// the returned `SandboxRun`.
    #[instrument(skip(self, workspace, command), fields(program = %command.program, timeout_ms = command.timeout.as_millis() as u64))]
    pub async fn run(&self, workspace: &Workspace, command: &SandboxCommand) -> Result<SandboxRun> {
        let mut cmd = Command::new(&command.program);
        cmd.args(&command.args)
            .current_dir(workspace.path())
            .env_clear()
            .env("PATH", SANDBOX_PATH)
            .env("HOME", workspace.path())
            .env("LANG", "C.UTF-8")
            .envs(command.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let (report_rx, report_tx) = report_pipe()?;

        #[cfg(unix)]
        {
            use std::os::fd::AsRawFd;

            cmd.process_group(0);
            if let Some(user) = self.config.run_as {
                cmd.uid(user.uid).gid(user.gid);
            }

            let limits = command.limits;
            let report_fd = report_tx.as_raw_fd();
            let plan = if self.namespaces {
                Some(NamespacePlan::for_workspace(workspace.path(), self.config.max_processes)?)
            } else {
                None
            };
            // SAFETY: the closure runs between fork and exec and only issues
            // async-signal-safe syscalls on memory prepared before the fork.
            unsafe {
                cmd.pre_exec(move || {
                    attach_report_channel(report_fd)?;
                    apply_rlimits(&limits)?;
                    if let Some(plan) = &plan {
                        isolation::enter(plan)?;
                    }
                    Ok(())
                });
            }
        }

        let spawned = cmd.spawn();
        // Only the sandbox may hold the write end, or the channel never closes
        drop(report_tx);
        let mut child =
            spawned.map_err(|e| JudgeError::Internal(format!("failed to spawn '{}': {}", command.program, e)))?;

        // Installed before anything else can fail, so every exit path tears the group down
        let mut guard = ProcessGroupGuard::new(child.id());
        let start_time = Instant::now();

        if let Some(mut stdin) = child.stdin.take() {
            let payload = command.stdin.clone();
            tokio::spawn(async move {
                // The candidate may exit without reading its input
                if let Err(e) = stdin.write_all(&payload).await {
                    debug!(error = %e, "Sandbox stdin closed early");
                }
            });
        }

        let max_output = self.config.max_output_bytes;
        let stdout_task = child.stdout.take().map(|out| tokio::spawn(read_capped(out, max_output)));
        let stderr_task = child.stderr.take().map(|err| tokio::spawn(read_capped(err, max_output)));
        let report_task = Some(tokio::spawn(read_capped(report_rx, max_output)));

        let deadline = command.timeout + self.config.startup_grace;
        let termination = match tokio::time::timeout(deadline, child.wait()).await {
            Ok(Ok(status)) => termination_of(status),
            Ok(Err(e)) => {
                return Err(JudgeError::Internal(format!("failed to wait for sandbox: {}", e)));
            }
            Err(_) => {
                guard.kill();
                if let Err(e) = child.wait().await {
                    warn!(error = %e, "Failed to reap timed-out sandbox");
                }
                Termination::TimedOut
            }
        };
        let elapsed_ms = start_time.elapsed().as_millis() as u64;

        // Anything the interpreter left behind in its group goes too
        guard.kill();

        let (stdout, stdout_truncated) = collect_stream(stdout_task).await;
        let (stderr, _) = collect_stream(stderr_task).await;
        let (report, report_truncated) = collect_stream(report_task).await;

        debug!(
            termination = ?termination,
            elapsed_ms = elapsed_ms,
            stdout_bytes = stdout.len(),
            stderr_bytes = stderr.len(),
            report_bytes = report.len(),
            "Sandbox finished"
        );

        Ok(SandboxRun {
            termination,
            stdout,
            stderr,
            stdout_truncated,
            report,
            report_truncated,
            elapsed_ms,
        })
    }
}

impl EngineConfig {
    fn temp_dir(&self) -> PathBuf {
        self.temp_root.clone().unwrap_or_else(std::env::temp_dir)
    }
}

#[cfg(unix)]
type ReportReceiver = tokio::net::unix::pipe::Receiver;

/// Pipe for the report channel. Both ends are close-on-exec; the child
/// re-opens the write end on `REPORT_FD`.
#[cfg(unix)]
fn report_pipe() -> Result<(ReportReceiver, std::os::fd::OwnedFd)> {
    use nix::fcntl::OFlag;

    let (read, write) = nix::unistd::pipe2(OFlag::O_CLOEXEC)
        .map_err(|e| JudgeError::Internal(format!("failed to create report pipe: {}", e)))?;
    let receiver = tokio::net::unix::pipe::Receiver::from_owned_fd(read)?;
    Ok((receiver, write))
}

type StreamTask = tokio::task::JoinHandle<std::io::Result<(Vec<u8>, bool)>>;

async fn collect_stream(task: Option<StreamTask>) -> (String, bool) {
    let Some(task) = task else {
        return (String::new(), false);
    };
    // A process that escaped the group could hold the pipe open forever
    match tokio::time::timeout(STREAM_DRAIN_GRACE, task).await {
        Ok(Ok(Ok((bytes, truncated)))) => (String::from_utf8_lossy(&bytes).into_owned(), truncated),
        Ok(Ok(Err(e))) => {
            warn!(error = %e, "Failed to read sandbox output");
            (String::new(), false)
        }
        Ok(Err(e)) => {
            warn!(error = %e, "Sandbox output reader panicked");
            (String::new(), false)
        }
        Err(_) => {
            warn!("Sandbox output stream did not close after termination");
            (String::new(), true)
        }
    }
}
