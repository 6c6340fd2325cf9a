//! LLM invocation layer.
//!
//! Model backends are opaque: an operator-supplied runner command is invoked
//! as `<runner> <model> <prompt>` in the evolution directory and edits files
//! in place.  This crate owns model-pool selection, exit-code
//! classification, and round-based retry with exponential backoff.  The
//! runner's exit codes are the wire protocol:
//!
//! | exit | meaning                                  |
//! |------|------------------------------------------|
//! | 0    | success                                  |
//! | 124  | per-call wall-clock budget exceeded      |
//! | 2    | transient per-minute rate limit          |
//! | 3    | hard quota exhausted                     |
//! | *    | any other failure                        |

mod bandit;

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Mutex;
use std::time::Duration;

use rand::seq::SliceRandom;
use thiserror::Error;
use tracing::{debug, info, warn};

pub use bandit::{Bandit, ModelStats};

/// Environment variable the runner reads to find the evolution directory.
pub const WORKING_DIR_ENV: &str = "CLAUDE_EVOLVE_WORKING_DIR";

/// Verbatim prefix for every prompt leaving this process.  Models invoked by
/// the runner have file-editing tools and, historically, a tendency to reach
/// for version control; a VCS operation from inside an automated run can
/// destroy the ledger and every artifact beside it.
pub const PROHIBITION_BANNER: &str = "\
=================================================================
 ABSOLUTE PROHIBITION - READ BEFORE DOING ANYTHING ELSE
=================================================================
 You are STRICTLY FORBIDDEN from running ANY version-control
 command: no commit, add, reset, checkout, revert, branch, merge,
 stash, clean, push, or pull, nor any other command that touches
 a repository's history or working-tree state.

 This prompt is part of an automated evolution run.  Version
 control is managed exclusively by the human operator; automated
 VCS operations have destroyed runs before.

 You MAY edit files directly with your file-editing tools.  You
 may do nothing else to the repository.
=================================================================";

#[derive(Debug, Error)]
pub enum AiError {
    #[error("model call timed out (model: {model})")]
    Timeout { model: String },
    #[error("rate limit hit (model: {model})")]
    RateLimited { model: String },
    #[error("API quota exhausted (model: {model})")]
    Quota { model: String },
    #[error("{0}")]
    Other(String),
}

/// Which configured model pool to draw from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pool {
    /// Artifact-editing calls made while processing a candidate.
    Run,
    /// Ideation and meta-learning calls.
    Ideate,
}

/// A successful model call: the runner's stdout plus the model that served it.
#[derive(Debug, Clone)]
pub struct Invocation {
    pub output: String,
    pub model: String,
}

/// Round-based retry parameters: each round tries every model in the pool;
/// after a fully failed round the wait doubles up to the cap.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_rounds: u32,
    pub initial_wait: Duration,
    pub max_wait: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_rounds: 10,
            initial_wait: Duration::from_secs(60),
            max_wait: Duration::from_secs(600),
        }
    }
}

#[derive(Debug)]
pub struct Gateway {
    runner: PathBuf,
    run_models: Vec<String>,
    ideate_models: Vec<String>,
    working_dir: PathBuf,
    bandit: Option<Mutex<Bandit>>,
}

impl Gateway {
    pub fn new(
        runner: impl Into<PathBuf>,
        run_models: Vec<String>,
        ideate_models: Vec<String>,
        working_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            runner: runner.into(),
            run_models,
            ideate_models,
            working_dir: working_dir.into(),
            bandit: None,
        }
    }

    /// Weight model ordering by observed improvement instead of pure
    /// shuffling.  The invocation interface is unchanged.
    pub fn with_bandit(mut self, bandit: Bandit) -> Self {
        self.bandit = Some(Mutex::new(bandit));
        self
    }

    pub fn models(&self, pool: Pool) -> &[String] {
        match pool {
            Pool::Run => &self.run_models,
            Pool::Ideate => &self.ideate_models,
        }
    }

    /// Report a completed evaluation back to the bandit.  No-op when the
    /// bandit is disabled.
    pub fn record_outcome(&self, model: &str, child: Option<f64>, parent: Option<f64>) {
        if let Some(bandit) = &self.bandit {
            if let Ok(mut bandit) = bandit.lock() {
                bandit.update(model, child, parent);
            }
        }
    }

    /// Path of the auxiliary file carrying the most recently chosen model
    /// name, for callers that only see the runner's side effects.
    pub fn model_file() -> PathBuf {
        std::env::temp_dir().join(format!(".evolve-model-{}", std::process::id()))
    }

    /// Invoke one specific model.  The prohibition banner is prepended here
    /// so no caller can forget it.
    pub async fn invoke_model(&self, model: &str, prompt: &str) -> Result<Invocation, AiError> {
        let full_prompt = format!("{PROHIBITION_BANNER}\n\n{prompt}");

        // Serialize the choice for out-of-band readers before the call runs.
        let _ = std::fs::write(Self::model_file(), model);

        let output = tokio::process::Command::new(&self.runner)
            .arg(model)
            .arg(&full_prompt)
            .current_dir(&self.working_dir)
            .env(WORKING_DIR_ENV, &self.working_dir)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| AiError::Other(format!("failed to spawn runner {}: {e}", self.runner.display())))?;

        let stderr = String::from_utf8_lossy(&output.stderr);
        for line in stderr.lines().filter(|l| !l.is_empty()) {
            debug!(model, "runner: {line}");
        }

        match output.status.code() {
            Some(0) => Ok(Invocation {
                output: String::from_utf8_lossy(&output.stdout).into_owned(),
                model: model.to_string(),
            }),
            Some(124) => Err(AiError::Timeout {
                model: model.to_string(),
            }),
            Some(2) => Err(AiError::RateLimited {
                model: model.to_string(),
            }),
            Some(3) => Err(AiError::Quota {
                model: model.to_string(),
            }),
            code => Err(AiError::Other(format!(
                "runner exited with {code:?} for model {model}: {}",
                stderr.trim()
            ))),
        }
    }

    /// One attempt against the pool in randomized order; returns the first
    /// success.  Quota propagates immediately.
    pub async fn invoke(&self, prompt: &str, pool: Pool) -> Result<Invocation, AiError> {
        self.invoke_round(prompt, pool, &mut None).await
    }

    /// Round-based retry with exponential backoff: shuffle the pool each
    /// round; when every model in a round fails, sleep and double the wait
    /// up to the cap.  Quota exhaustion aborts the remaining rounds so the
    /// caller can suspend scheduling; a rate limit seen in the final round
    /// surfaces as `RateLimited`.
    pub async fn invoke_with_backoff(
        &self,
        prompt: &str,
        pool: Pool,
        policy: &BackoffPolicy,
    ) -> Result<Invocation, AiError> {
        if self.models(pool).is_empty() {
            return Err(AiError::Other(format!("no models configured for pool {pool:?}")));
        }

        let mut wait = policy.initial_wait;
        let mut last_rate_limited: Option<String> = None;

        for round in 0..policy.max_rounds {
            debug!(round = round + 1, total = policy.max_rounds, "starting model round");

            match self.invoke_round(prompt, pool, &mut last_rate_limited).await {
                Ok(invocation) => {
                    if round > 0 {
                        info!(model = invocation.model, round = round + 1, "succeeded after retry");
                    }
                    return Ok(invocation);
                }
                Err(err @ AiError::Quota { .. }) => return Err(err),
                Err(err) => {
                    warn!(round = round + 1, "all models failed: {err}");
                }
            }

            if round + 1 < policy.max_rounds {
                info!(wait_secs = wait.as_secs(), "backing off before next round");
                tokio::time::sleep(wait).await;
                wait = (wait * 2).min(policy.max_wait);
            }
        }

        if let Some(model) = last_rate_limited {
            return Err(AiError::RateLimited { model });
        }
        Err(AiError::Other(format!(
            "all {} rounds exhausted for pool {pool:?}",
            policy.max_rounds
        )))
    }

    async fn invoke_round(
        &self,
        prompt: &str,
        pool: Pool,
        last_rate_limited: &mut Option<String>,
    ) -> Result<Invocation, AiError> {
        let mut models = self.models(pool).to_vec();
        if models.is_empty() {
            return Err(AiError::Other(format!("no models configured for pool {pool:?}")));
        }

        {
            let mut rng = rand::thread_rng();
            models.shuffle(&mut rng);
        }

        // The bandit's pick goes first; the shuffled rest stays as fallback
        // order within the round.
        if let Some(bandit) = &self.bandit {
            if let Ok(mut bandit) = bandit.lock() {
                if let Some(pick) = bandit.select(&models) {
                    if let Some(pos) = models.iter().position(|m| *m == pick) {
                        models.swap(0, pos);
                    }
                }
            }
        }

        let mut last_error = AiError::Other("empty model pool".to_string());
        for model in &models {
            debug!(model, "trying model");
            match self.invoke_model(model, prompt).await {
                Ok(invocation) => return Ok(invocation),
                Err(err @ AiError::Quota { .. }) => return Err(err),
                Err(err) => {
                    if let AiError::RateLimited { model } = &err {
                        *last_rate_limited = Some(model.clone());
                    }
                    warn!(model, "model failed: {err}");
                    last_error = err;
                }
            }
        }
        Err(last_error)
    }
}
