//! Resource-limited subprocess execution for evaluator runs.
//!
//! Three layers of containment, applied to the child and its whole process
//! group:
//!
//! 1. rlimits (`RLIMIT_AS`/`RLIMIT_DATA`, `RLIMIT_CPU`) installed *in the
//!    child* via a `pre_exec` hook, together with `setsid` so the child
//!    roots its own process group;
//! 2. a wall-clock timeout around the wait (exit 124);
//! 3. a monitor sampling the process-group RSS every 100 ms and escalating
//!    SIGTERM → SIGKILL on breach (exit 137).
//!
//! The RSS sum covers the entire group, not just the direct child:
//! evaluators routinely fork helper processes, and a single-PID check
//! undercounts by orders of magnitude.
//!
//! On macOS a `sandbox-exec` profile wrapper is prepended when available,
//! restricting file access to the evolution directory and the user home and
//! denying network.  Anywhere it is unavailable, isolation silently falls
//! back to resource limits only.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::io::AsyncReadExt;
use tracing::{debug, info, warn};

/// Exit code reported for a wall-clock timeout.
pub const EXIT_TIMEOUT: i32 = 124;
/// Exit code reported for a memory-limit kill (128 + SIGKILL).
pub const EXIT_OOM: i32 = 137;

const MONITOR_INTERVAL: Duration = Duration::from_millis(100);
const KILL_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct SandboxSpec {
    /// argv of the command to run.
    pub command: Vec<String>,
    pub working_dir: PathBuf,
    /// 0 disables the memory limit and the RSS monitor.
    pub memory_limit_mb: u64,
    /// 0 disables the CPU-time rlimit.
    pub cpu_limit_secs: u64,
    pub timeout: Duration,
    /// Attempt the platform sandbox wrapper when available.
    pub use_os_sandbox: bool,
}

#[derive(Debug)]
pub struct SandboxOutcome {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl SandboxOutcome {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Run `spec.command` under the containment layers above.
pub async fn run_sandboxed(spec: &SandboxSpec) -> Result<SandboxOutcome> {
    let argv = wrapped_argv(spec);
    anyhow::ensure!(!argv.is_empty(), "empty sandbox command");

    debug!(command = ?argv, memory_limit_mb = spec.memory_limit_mb, "spawning sandboxed command");

    let mut cmd = tokio::process::Command::new(&argv[0]);
    cmd.args(&argv[1..])
        .current_dir(&spec.working_dir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let memory_mb = spec.memory_limit_mb;
    let cpu_secs = spec.cpu_limit_secs;
    unsafe {
        // SAFETY: runs between fork and exec; setsid and setrlimit are
        // async-signal-safe.
        cmd.pre_exec(move || child_setup(memory_mb, cpu_secs));
    }

    let mut child = cmd
        .spawn()
        .with_context(|| format!("failed to spawn {}", argv[0]))?;
    let pid = child.id().context("child had no pid")? as i32;

    let mut stdout_pipe = child.stdout.take().context("child stdout not piped")?;
    let mut stderr_pipe = child.stderr.take().context("child stderr not piped")?;
    let stdout_task = tokio::spawn(async move {
        let mut buf = Vec::new();
        let _ = stdout_pipe.read_to_end(&mut buf).await;
        buf
    });
    let stderr_task = tokio::spawn(async move {
        let mut buf = Vec::new();
        let _ = stderr_pipe.read_to_end(&mut buf).await;
        buf
    });

    // Continuous process-tree accounting; the rlimit alone misses children
    // that allocate after a fork.
    let oom: Arc<Mutex<Option<String>>> = Arc::new(Mutex::new(None));
    let monitor = if spec.memory_limit_mb > 0 {
        let oom = Arc::clone(&oom);
        let limit = spec.memory_limit_mb as f64;
        Some(tokio::spawn(async move {
            monitor_group_memory(pid, limit, oom).await;
        }))
    } else {
        None
    };

    let status = match tokio::time::timeout(spec.timeout, child.wait()).await {
        Ok(status) => Some(status.context("waiting for sandboxed child")?),
        Err(_) => {
            warn!(timeout_secs = spec.timeout.as_secs(), "sandboxed command timed out");
            kill_group(pid).await;
            let _ = child.wait().await;
            None
        }
    };

    if let Some(monitor) = monitor {
        monitor.abort();
    }

    let stdout = String::from_utf8_lossy(&stdout_task.await.unwrap_or_default()).into_owned();
    let stderr = String::from_utf8_lossy(&stderr_task.await.unwrap_or_default()).into_owned();

    let Some(status) = status else {
        return Ok(SandboxOutcome {
            exit_code: EXIT_TIMEOUT,
            stdout,
            stderr: format!("Timeout after {} seconds", spec.timeout.as_secs()),
        });
    };

    let oom_message = oom.lock().ok().and_then(|m| m.clone());
    if let Some(message) = oom_message {
        return Ok(SandboxOutcome {
            exit_code: EXIT_OOM,
            stdout,
            stderr: message,
        });
    }

    Ok(SandboxOutcome {
        exit_code: exit_code_of(status),
        stdout,
        stderr,
    })
}

fn exit_code_of(status: std::process::ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    status
        .code()
        .or_else(|| status.signal().map(|sig| 128 + sig))
        .unwrap_or(1)
}

/// Child-side setup run between fork and exec: new session (and therefore a
/// fresh process group rooted at the child), then resource limits.  Limit
/// failures are non-fatal; some container environments reject them.
fn child_setup(memory_mb: u64, cpu_secs: u64) -> std::io::Result<()> {
    if unsafe { libc::setsid() } == -1 {
        return Err(std::io::Error::last_os_error());
    }

    if memory_mb > 0 {
        let bytes = (memory_mb * 1024 * 1024) as libc::rlim_t;
        let limit = libc::rlimit {
            rlim_cur: bytes,
            rlim_max: bytes,
        };
        unsafe {
            let _ = libc::setrlimit(libc::RLIMIT_AS, &limit);
            let _ = libc::setrlimit(libc::RLIMIT_DATA, &limit);
        }
    }

    if cpu_secs > 0 {
        let limit = libc::rlimit {
            rlim_cur: cpu_secs as libc::rlim_t,
            rlim_max: cpu_secs as libc::rlim_t,
        };
        unsafe {
            let _ = libc::setrlimit(libc::RLIMIT_CPU, &limit);
        }
    }

    Ok(())
}

/// SIGTERM the process group, wait the grace period, then SIGKILL whatever
/// remains.
async fn kill_group(pid: i32) {
    unsafe {
        let _ = libc::killpg(pid, libc::SIGTERM);
    }
    tokio::time::sleep(KILL_GRACE).await;
    unsafe {
        if libc::kill(pid, 0) == 0 {
            let _ = libc::killpg(pid, libc::SIGKILL);
        }
    }
}

async fn monitor_group_memory(pid: i32, limit_mb: f64, oom: Arc<Mutex<Option<String>>>) {
    loop {
        tokio::time::sleep(MONITOR_INTERVAL).await;

        let Some(used_mb) = group_rss_mb(pid).await else {
            // Group is gone; the main wait will observe the exit.
            return;
        };

        if used_mb > limit_mb {
            info!(used_mb, limit_mb, "process group exceeded memory limit, terminating");
            if let Ok(mut slot) = oom.lock() {
                *slot = Some(format!("Memory limit exceeded: {used_mb:.1}MB"));
            }
            kill_group(pid).await;
            return;
        }
    }
}

/// Total resident set size of the process group rooted at `pgid`, in MB.
/// `None` once the group has no members.
async fn group_rss_mb(pgid: i32) -> Option<f64> {
    let output = tokio::process::Command::new("ps")
        .args(["-o", "rss=", "-g", &pgid.to_string()])
        .output()
        .await
        .ok()?;
    if !output.status.success() {
        return None;
    }

    let text = String::from_utf8_lossy(&output.stdout);
    let mut total_kb: u64 = 0;
    let mut seen = false;
    for line in text.lines() {
        if let Ok(kb) = line.trim().parse::<u64>() {
            total_kb += kb;
            seen = true;
        }
    }
    if seen { Some(total_kb as f64 / 1024.0) } else { None }
}

/// Prepend the platform sandbox wrapper when requested and available.
fn wrapped_argv(spec: &SandboxSpec) -> Vec<String> {
    if spec.use_os_sandbox {
        if let Some(mut wrapper) = os_sandbox_wrapper(&spec.working_dir) {
            wrapper.extend(spec.command.iter().cloned());
            return wrapper;
        }
    }
    spec.command.clone()
}

#[cfg(target_os = "macos")]
fn os_sandbox_wrapper(evolution_dir: &Path) -> Option<Vec<String>> {
    use std::io::Write;

    let available = std::process::Command::new("which")
        .arg("sandbox-exec")
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false);
    if !available {
        return None;
    }

    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    let profile = format!(
        r#"(version 1)
(deny default)
(allow process-exec)
(allow process-fork)
(allow sysctl-read)
(allow mach-lookup)
(allow file-read* (subpath "/usr") (subpath "/lib") (subpath "/etc")
                  (subpath "/tmp") (subpath "/var") (subpath "{dir}") (subpath "{home}"))
(allow file-write* (subpath "/tmp") (subpath "/var/tmp") (subpath "{dir}") (subpath "{home}"))
(allow signal (target same-sandbox))
(deny network*)
"#,
        dir = evolution_dir.display(),
    );

    let path = std::env::temp_dir().join(format!(".evolve-sandbox-{}.sb", std::process::id()));
    let mut file = std::fs::File::create(&path).ok()?;
    file.write_all(profile.as_bytes()).ok()?;

    Some(vec![
        "sandbox-exec".to_string(),
        "-f".to_string(),
        path.to_string_lossy().into_owned(),
    ])
}

#[cfg(not(target_os = "macos"))]
fn os_sandbox_wrapper(_evolution_dir: &Path) -> Option<Vec<String>> {
    None
}
