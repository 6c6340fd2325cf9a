use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use tokio::process::{Child, Command};
use tracing::{error, info, warn};

/// Supervises worker subprocesses.
///
/// Workers inherit stdout/stderr so their logs stream straight to the
/// terminal in real time.  Shutdown is SIGTERM, a bounded grace period,
/// then SIGKILL for stragglers.
pub struct WorkerPool {
    program: PathBuf,
    max_workers: usize,
    config_path: PathBuf,
    timeout_secs: u64,
    workers: Vec<(u32, Child)>,
}

impl WorkerPool {
    pub fn new(
        program: PathBuf,
        max_workers: usize,
        config_path: PathBuf,
        timeout_secs: u64,
    ) -> Self {
        Self {
            program,
            max_workers,
            config_path,
            timeout_secs,
            workers: Vec::new(),
        }
    }

    pub fn active_count(&self) -> usize {
        self.workers.len()
    }

    pub fn at_capacity(&self) -> bool {
        self.workers.len() >= self.max_workers
    }

    /// Spawn one worker subprocess.  Returns its pid, or `None` at capacity
    /// or on spawn failure.
    pub fn spawn_worker(&mut self) -> Option<u32> {
        if self.at_capacity() {
            return None;
        }

        let spawned = Command::new(&self.program)
            .arg("worker")
            .arg("--config")
            .arg(&self.config_path)
            .arg("--timeout")
            .arg(self.timeout_secs.to_string())
            .spawn();

        match spawned {
            Ok(child) => {
                let pid = child.id()?;
                info!(pid, "spawned worker");
                self.workers.push((pid, child));
                Some(pid)
            }
            Err(err) => {
                error!("failed to spawn worker: {err}");
                None
            }
        }
    }

    /// Reap exited workers, returning their exit codes.
    pub fn reap_finished(&mut self) -> Vec<i32> {
        let mut exit_codes = Vec::new();

        self.workers.retain_mut(|(pid, child)| match child.try_wait() {
            Ok(Some(status)) => {
                let code = status.code().unwrap_or(1);
                info!(pid = *pid, code, "worker exited");
                exit_codes.push(code);
                false
            }
            Ok(None) => true,
            Err(err) => {
                warn!(pid = *pid, "failed to poll worker: {err}");
                false
            }
        });

        exit_codes
    }

    /// SIGTERM every worker, wait up to `grace`, SIGKILL the rest.
    pub async fn shutdown(&mut self, grace: Duration) {
        if self.workers.is_empty() {
            return;
        }
        info!(count = self.workers.len(), "shutting down workers");

        for (pid, _) in &self.workers {
            let _ = terminate_pid(*pid).await;
        }

        let deadline = tokio::time::Instant::now() + grace;
        while !self.workers.is_empty() && tokio::time::Instant::now() < deadline {
            self.reap_finished();
            if !self.workers.is_empty() {
                tokio::time::sleep(Duration::from_millis(500)).await;
            }
        }

        for (pid, child) in &mut self.workers {
            warn!(pid = *pid, "force killing worker");
            let _ = child.start_kill();
            let _ = child.wait().await;
        }
        self.workers.clear();
    }
}

async fn terminate_pid(pid: u32) -> Result<()> {
    let status = Command::new("kill").arg(pid.to_string()).status().await?;
    anyhow::ensure!(status.success(), "failed to terminate pid {pid}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use std::path::Path;

    fn fake_worker(dir: &Path, body: &str) -> PathBuf {
        let path = dir.join("fake-worker.sh");
        fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        let mut perms = fs::metadata(&path).unwrap().permissions();
        perms.set_mode(0o755);
        fs::set_permissions(&path, perms).unwrap();
        path
    }

    fn pool(program: PathBuf, max: usize) -> WorkerPool {
        WorkerPool::new(program, max, PathBuf::from("config.toml"), 600)
    }

    #[tokio::test]
    async fn spawn_is_bounded_by_capacity() {
        let dir = tempfile::tempdir().unwrap();
        let program = fake_worker(dir.path(), "sleep 5");
        let mut pool = pool(program, 2);

        assert!(pool.spawn_worker().is_some());
        assert!(pool.spawn_worker().is_some());
        assert!(pool.spawn_worker().is_none());
        assert_eq!(pool.active_count(), 2);

        pool.shutdown(Duration::from_secs(3)).await;
        assert_eq!(pool.active_count(), 0);
    }

    #[tokio::test]
    async fn reap_collects_exit_codes() {
        let dir = tempfile::tempdir().unwrap();
        let program = fake_worker(dir.path(), "exit 3");
        let mut pool = pool(program, 1);

        pool.spawn_worker().unwrap();
        let mut codes = Vec::new();
        for _ in 0..50 {
            codes = pool.reap_finished();
            if !codes.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert_eq!(codes, vec![3]);
        assert_eq!(pool.active_count(), 0);
    }

    #[tokio::test]
    async fn shutdown_terminates_sleepers_quickly() {
        let dir = tempfile::tempdir().unwrap();
        let program = fake_worker(dir.path(), "sleep 60");
        let mut pool = pool(program, 1);
        pool.spawn_worker().unwrap();

        let start = std::time::Instant::now();
        pool.shutdown(Duration::from_secs(5)).await;
        assert!(start.elapsed() < Duration::from_secs(10));
        assert_eq!(pool.active_count(), 0);
    }
}
