//! The dispatcher: supervises the worker pool and drives the
//! evaluate → learn → ideate cycle.
//!
//! Main loop at a fixed poll interval:
//! 1. reap finished workers; a quota or rate-limit exit pauses the whole
//!    pool for five minutes, then repairs the ledger and resumes;
//! 2. every fifth idle iteration, reset stuck rows;
//! 3. while pending work remains, spawn workers up to the cap;
//! 4. when the ledger drains and the pool is empty, reset-and-recount; if
//!    still empty, run meta-learning and ideation (given enough completes)
//!    or declare the evolution finished.

mod pool;

use std::time::Duration;

use anyhow::{Context, Result};
use tokio::signal::unix::{Signal, SignalKind, signal};
use tracing::{info, warn};

use evolve_config::LoadedConfig;
use evolve_gateway::Gateway;
use evolve_ledger::{Candidate, Ledger, Stats, Status};

pub use pool::WorkerPool;

const SIGTERM: i32 = 15;
const SIGINT: i32 = 2;

/// Worker exit codes that force a pool-wide pause.
const WORKER_RATE_LIMITED: i32 = 2;
const WORKER_QUOTA: i32 = 3;

const API_LIMIT_PAUSE: Duration = Duration::from_secs(300);
const IDEATION_FAILURE_PAUSE: Duration = Duration::from_secs(30);
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

pub struct Dispatcher {
    cfg: LoadedConfig,
    ledger: Ledger,
    pool: WorkerPool,
}

impl Dispatcher {
    pub fn new(cfg: LoadedConfig) -> Result<Self> {
        let ledger = Ledger::new(
            cfg.csv_path(),
            Duration::from_secs(cfg.config.parallel.lock_timeout),
        );
        let program = std::env::current_exe().context("resolving current executable")?;
        let pool = WorkerPool::new(
            program,
            cfg.config.parallel.max_workers,
            cfg.config_path.clone(),
            cfg.config.timeout_seconds,
        );
        Ok(Self { cfg, ledger, pool })
    }

    /// Run until the evolution completes or a termination signal arrives.
    /// Returns the process exit code.
    pub async fn run(&mut self) -> Result<i32> {
        info!(
            max_workers = self.cfg.config.parallel.max_workers,
            auto_ideate = self.cfg.config.auto_ideate,
            "starting evolution run"
        );

        let mut sigterm = signal(SignalKind::terminate()).context("installing SIGTERM handler")?;
        let mut sigint = signal(SignalKind::interrupt()).context("installing SIGINT handler")?;

        self.cleanup_ledger()?;
        self.ensure_baseline()?;

        let poll = Duration::from_secs(self.cfg.config.parallel.poll_interval);
        let mut iteration: u64 = 0;

        loop {
            iteration += 1;

            let exit_codes = self.pool.reap_finished();
            if exit_codes
                .iter()
                .any(|code| *code == WORKER_RATE_LIMITED || *code == WORKER_QUOTA)
            {
                warn!("API limit reached, pausing pool for five minutes");
                if let Some(sig) = sleep_or_signal(API_LIMIT_PAUSE, &mut sigterm, &mut sigint).await
                {
                    return self.shutdown(sig).await;
                }
                self.cleanup_ledger()?;
                continue;
            }

            if iteration % 5 == 0 && self.pool.active_count() == 0 {
                self.ledger.open()?.reset_stuck()?;
            }

            let mut stats = self.stats()?;
            info!(
                pending = stats.pending,
                complete = stats.complete,
                running = stats.running,
                workers = self.pool.active_count(),
                "ledger stats"
            );

            if stats.pending == 0 && self.pool.active_count() == 0 {
                // Stale running rows may be hiding claimable work.
                self.ledger.open()?.reset_stuck()?;
                stats = self.stats()?;

                if stats.pending == 0 {
                    if !self.should_ideate(&stats) {
                        info!("evolution complete");
                        return Ok(0);
                    }

                    self.run_meta_learning().await;

                    if !self.run_ideation().await? {
                        warn!("ideation failed, waiting before retry");
                        if let Some(sig) =
                            sleep_or_signal(IDEATION_FAILURE_PAUSE, &mut sigterm, &mut sigint).await
                        {
                            return self.shutdown(sig).await;
                        }
                    }
                    continue;
                }
            }

            let mut pending = stats.pending;
            while pending > 0 && !self.pool.at_capacity() {
                if self.pool.spawn_worker().is_none() {
                    break;
                }
                pending -= 1;
            }

            if let Some(sig) = sleep_or_signal(poll, &mut sigterm, &mut sigint).await {
                return self.shutdown(sig).await;
            }
        }
    }

    async fn shutdown(&mut self, signum: i32) -> Result<i32> {
        info!(signum, "shutting down");
        self.pool.shutdown(SHUTDOWN_GRACE).await;
        Ok(128 + signum)
    }

    /// Startup (and post-pause) ledger repair.
    fn cleanup_ledger(&self) -> Result<()> {
        let guard = self.ledger.open()?;
        let removed = guard.remove_duplicates()?;
        if removed > 0 {
            info!(removed, "removed duplicate candidates");
        }
        let reset = guard.reset_stuck()?;
        if reset > 0 {
            info!(reset, "reset stuck candidates");
        }
        let fixed = guard.cleanup_corrupted_status()?;
        if fixed > 0 {
            info!(fixed, "fixed corrupted status fields");
        }
        Ok(())
    }

    /// Seed the zero-generation row when missing.
    fn ensure_baseline(&self) -> Result<()> {
        let guard = self.ledger.open()?;
        if guard.get("baseline-000")?.is_none() {
            info!("adding baseline-000 entry");
            guard.append(&[Candidate {
                id: "baseline-000".to_string(),
                description: "Original algorithm performance".to_string(),
                status: Status::Pending.to_string(),
                ..Candidate::default()
            }])?;
        }
        Ok(())
    }

    fn stats(&self) -> Result<Stats> {
        Ok(self.ledger.open()?.stats()?)
    }

    /// Ideation needs material to learn from; below the floor the run just
    /// ends.
    fn should_ideate(&self, stats: &Stats) -> bool {
        if !self.cfg.config.auto_ideate {
            return false;
        }
        if stats.complete < self.cfg.config.min_completed_for_ideation {
            info!(
                complete = stats.complete,
                needed = self.cfg.config.min_completed_for_ideation,
                "not enough completed candidates for ideation"
            );
            return false;
        }
        true
    }

    /// Summarize any unprocessed generations into the notes file.
    /// Failures are logged, never fatal: notes are an aid, not a gate.
    async fn run_meta_learning(&self) {
        if !self.cfg.config.meta_learning {
            return;
        }

        let gateway = Gateway::new(
            self.cfg.runner_path(),
            self.cfg.config.llm.run_models.clone(),
            self.cfg.config.llm.ideate_models.clone(),
            self.cfg.evolution_dir.clone(),
        );
        match evolve_ideation::meta::process_new_generations(
            &self.ledger,
            &gateway,
            &self.cfg.brief_path(),
            &self.cfg.notes_path(),
        )
        .await
        {
            Ok(0) => {}
            Ok(processed) => info!(processed, "meta-learning processed generations"),
            Err(err) => warn!("meta-learning failed: {err}"),
        }
    }

    /// Ideation runs as a subprocess of the same binary, mirroring worker
    /// isolation.  Returns whether it exited successfully.
    async fn run_ideation(&self) -> Result<bool> {
        info!("running ideation");
        let program = std::env::current_exe().context("resolving current executable")?;
        let status = tokio::process::Command::new(program)
            .arg("ideate")
            .arg("--config")
            .arg(&self.cfg.config_path)
            .current_dir(&self.cfg.evolution_dir)
            .status()
            .await;

        match status {
            Ok(status) => Ok(status.success()),
            Err(err) => {
                warn!("failed to launch ideation: {err}");
                Ok(false)
            }
        }
    }
}

async fn sleep_or_signal(
    duration: Duration,
    sigterm: &mut Signal,
    sigint: &mut Signal,
) -> Option<i32> {
    tokio::select! {
        _ = tokio::time::sleep(duration) => None,
        _ = sigterm.recv() => Some(SIGTERM),
        _ = sigint.recv() => Some(SIGINT),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    use evolve_config::EvolveConfig;

    fn dispatcher_at(dir: &std::path::Path, config: EvolveConfig) -> Dispatcher {
        let cfg = evolve_config::LoadedConfig {
            config,
            config_path: dir.join("config.toml"),
            evolution_dir: dir.to_path_buf(),
        };
        Dispatcher::new(cfg).unwrap()
    }

    #[test]
    fn baseline_is_bootstrapped_once() {
        let dir = tempfile::tempdir().unwrap();
        let d = dispatcher_at(dir.path(), EvolveConfig::default());

        d.ensure_baseline().unwrap();
        let c = d.ledger.open().unwrap().get("baseline-000").unwrap().unwrap();
        assert_eq!(c.status, "pending");
        assert_eq!(c.based_on_id, "");

        // Idempotent.
        d.ensure_baseline().unwrap();
        assert_eq!(d.ledger.open().unwrap().stats().unwrap().total, 1);
    }

    #[test]
    fn startup_cleanup_repairs_the_ledger() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("evolution.csv"),
            "id,based_on_id,description,performance,status,idea_llm,run_llm\n\
             gen02-003,,x,1.0,complete,,\n\
             gen02-003,,x,,pending,,\n\
             gen01-001,,y,,running,,\n",
        )
        .unwrap();

        let d = dispatcher_at(dir.path(), EvolveConfig::default());
        d.cleanup_ledger().unwrap();

        let guard = d.ledger.open().unwrap();
        let stats = guard.stats().unwrap();
        // The duplicate reduced to its first (complete) occurrence.
        assert_eq!(stats.total, 2);
        assert_eq!(stats.complete, 1);
        // The stale running row reverted to pending.
        assert_eq!(guard.get("gen01-001").unwrap().unwrap().status, "pending");
    }

    #[test]
    fn ideation_floor_gates_should_ideate() {
        let dir = tempfile::tempdir().unwrap();
        let d = dispatcher_at(dir.path(), EvolveConfig::default());

        let mut stats = Stats::default();
        stats.complete = 2;
        assert!(!d.should_ideate(&stats));
        stats.complete = 3;
        assert!(d.should_ideate(&stats));
    }

    #[test]
    fn auto_ideate_off_disables_ideation() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = EvolveConfig::default();
        config.auto_ideate = false;
        let d = dispatcher_at(dir.path(), config);

        let mut stats = Stats::default();
        stats.complete = 100;
        assert!(!d.should_ideate(&stats));
    }
}
