//! Worker process: claims pending candidates one at a time and runs each
//! through the processing pipeline, for at most `worker_max_candidates`
//! claims per process.
//!
//! Workers are short-lived by design.  A fresh OS process per batch keeps
//! the blast radius of a misbehaving evaluator or model call bounded; the
//! dispatcher respawns workers while pending work remains.

pub mod processor;
pub mod score;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use tracing::{info, warn};

use evolve_config::LoadedConfig;
use evolve_gateway::{Bandit, BackoffPolicy, Gateway};
use evolve_ledger::{Ledger, Status};

pub use processor::{ProcessCode, ProcessorContext, is_terminal_status, process};

pub const EXIT_OK: i32 = 0;
pub const EXIT_ERROR: i32 = 1;
pub const EXIT_RATE_LIMITED: i32 = 2;
pub const EXIT_QUOTA: i32 = 3;
pub const EXIT_AI_FAILED: i32 = 77;
pub const EXIT_PARENT_MISSING: i32 = 78;

const SIGTERM: i32 = 15;
const SIGINT: i32 = 2;

pub struct Worker {
    ctx: ProcessorContext,
    max_candidates: usize,
}

impl Worker {
    pub fn new(cfg: LoadedConfig) -> Self {
        let ledger = Ledger::new(
            cfg.csv_path(),
            Duration::from_secs(cfg.config.parallel.lock_timeout),
        );

        let mut gateway = Gateway::new(
            cfg.runner_path(),
            cfg.config.llm.run_models.clone(),
            cfg.config.llm.ideate_models.clone(),
            cfg.evolution_dir.clone(),
        );
        if cfg.config.llm.bandit {
            let state = cfg.evolution_dir.join("llm_bandit.json");
            gateway = gateway.with_bandit(Bandit::new(&cfg.config.llm.run_models, Some(state)));
        }

        let backoff = BackoffPolicy {
            max_rounds: cfg.config.ideation.max_rounds,
            initial_wait: Duration::from_secs(cfg.config.ideation.initial_wait),
            max_wait: Duration::from_secs(cfg.config.ideation.max_wait),
        };

        let max_candidates = cfg.config.worker_max_candidates;
        Self {
            ctx: ProcessorContext {
                cfg,
                ledger,
                gateway,
                backoff,
            },
            max_candidates,
        }
    }

    /// Claim-and-process loop.  Returns the worker's exit code.
    pub async fn run(&self) -> Result<i32> {
        info!(max_candidates = self.max_candidates, "worker started");

        let current: Arc<Mutex<Option<String>>> = Arc::new(Mutex::new(None));
        spawn_signal_guard(self.ctx.ledger.clone(), Arc::clone(&current));

        let mut processed = 0;
        while processed < self.max_candidates {
            let claimed = self.ctx.ledger.open()?.claim_next_pending()?;
            let Some((id, prior)) = claimed else {
                info!("no pending candidates");
                break;
            };
            info!(id = %id, prior_status = %prior, "claimed candidate");
            set_current(&current, Some(id.clone()));

            let Some(candidate) = self.ctx.ledger.open()?.get(&id)? else {
                warn!(id = %id, "claimed row vanished from ledger");
                set_current(&current, None);
                continue;
            };

            let code = process(&self.ctx, &candidate).await?;
            processed += 1;

            match code {
                ProcessCode::AiRetry => {
                    self.ctx
                        .ledger
                        .open()?
                        .set_status(&id, &Status::FailedAiRetry)?;
                }
                ProcessCode::ParentMissing => {
                    self.ctx
                        .ledger
                        .open()?
                        .set_status(&id, &Status::FailedParentMissing)?;
                }
                ProcessCode::RateLimited => {
                    set_current(&current, None);
                    return Ok(EXIT_RATE_LIMITED);
                }
                ProcessCode::Quota => {
                    set_current(&current, None);
                    return Ok(EXIT_QUOTA);
                }
                ProcessCode::Ok | ProcessCode::Failed => {}
            }

            set_current(&current, None);
            info!(processed, max = self.max_candidates, "candidate finished");
        }

        info!("worker exiting");
        Ok(EXIT_OK)
    }
}

fn set_current(current: &Arc<Mutex<Option<String>>>, value: Option<String>) {
    if let Ok(mut slot) = current.lock() {
        *slot = value;
    }
}

/// On SIGTERM/SIGINT, revert the in-flight claim to pending (unless it
/// already reached a terminal state) and exit with 128+signum.
fn spawn_signal_guard(ledger: Ledger, current: Arc<Mutex<Option<String>>>) {
    tokio::spawn(async move {
        use tokio::signal::unix::{SignalKind, signal};

        let term = signal(SignalKind::terminate());
        let int = signal(SignalKind::interrupt());
        let (Ok(mut term), Ok(mut int)) = (term, int) else {
            warn!("failed to install signal handlers");
            return;
        };

        let signum = tokio::select! {
            _ = term.recv() => SIGTERM,
            _ = int.recv() => SIGINT,
        };
        info!(signum, "received termination signal");

        let id = current.lock().ok().and_then(|slot| slot.clone());
        if let Some(id) = id {
            info!(id = %id, "reverting in-flight claim to pending");
            if let Ok(guard) = ledger.open() {
                match guard.get(&id) {
                    Ok(Some(c)) if !is_terminal_status(&c.status) => {
                        let _ = guard.set_status(&id, &Status::Pending);
                    }
                    _ => {}
                }
            }
        }

        std::process::exit(128 + signum);
    });
}
