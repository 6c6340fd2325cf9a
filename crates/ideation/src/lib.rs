//! The ideation engine: proposes a batch of new candidates each generation.
//!
//! Per strategy, the flow is claim-ids-first: fresh ids are reserved before
//! the model runs and stay consumed even when the call fails, so a retried
//! pass can never reuse an id.  The model works against a temporary sibling
//! copy of the ledger containing placeholder stub rows; only claimed ids
//! whose placeholder was actually replaced are accepted.  Survivors pass an
//! embedding-based novelty gate before being appended as `pending`.

pub mod meta;
mod strategy;

use std::fs;
use std::io::Write;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{info, warn};

use evolve_config::LoadedConfig;
use evolve_embedding::EmbeddingClient;
use evolve_gateway::{BackoffPolicy, Gateway, Pool};
use evolve_ledger::{Candidate, Ledger, Status, clean_id};

pub use strategy::{Strategy, StrategyContext, strategies};

/// A proposal accepted from a strategy pass, pre-novelty-filter.
#[derive(Debug, Clone)]
pub struct Idea {
    pub id: String,
    pub based_on_id: String,
    pub description: String,
    /// `<strategy> (<model>)`, recorded as `idea_llm` for attribution.
    pub attribution: String,
}

pub struct Ideator {
    cfg: LoadedConfig,
    ledger: Ledger,
    gateway: Gateway,
    embedder: EmbeddingClient,
    backoff: BackoffPolicy,
}

impl Ideator {
    pub fn new(cfg: LoadedConfig) -> Self {
        let ledger = Ledger::new(
            cfg.csv_path(),
            Duration::from_secs(cfg.config.parallel.lock_timeout),
        );
        let gateway = Gateway::new(
            cfg.runner_path(),
            cfg.config.llm.run_models.clone(),
            cfg.config.llm.ideate_models.clone(),
            cfg.evolution_dir.clone(),
        );
        let cache_path = cfg
            .config
            .novelty
            .enabled
            .then(|| cfg.evolution_dir.join("embeddings_cache.json"));
        let embedder = EmbeddingClient::new(cache_path);
        let backoff = BackoffPolicy {
            max_rounds: cfg.config.ideation.max_rounds,
            initial_wait: Duration::from_secs(cfg.config.ideation.initial_wait),
            max_wait: Duration::from_secs(cfg.config.ideation.max_wait),
        };

        Self {
            cfg,
            ledger,
            gateway,
            embedder,
            backoff,
        }
    }

    /// Run one full ideation pass.  Returns the number of candidates
    /// appended to the ledger.
    pub async fn run(&self) -> Result<usize> {
        let context = self.build_context()?;
        info!(
            generation = context.generation,
            elites = context.top_performers.len(),
            "starting ideation pass"
        );

        let existing = self.ledger.open()?.all_descriptions()?;
        let mut claimed: Vec<String> = Vec::new();
        let mut accepted: Vec<Idea> = Vec::new();
        let mut strategies_attempted = 0;
        let mut strategies_succeeded = 0;

        for (strategy, count) in strategies(&self.cfg.config.ideation) {
            if count == 0 {
                continue;
            }
            strategies_attempted += 1;

            let ideas = self
                .generate(strategy.as_ref(), &context, count, &mut claimed)
                .await?;
            if ideas.is_empty() {
                continue;
            }
            strategies_succeeded += 1;

            for idea in ideas {
                let (novel, similarity) = self.check_novelty(&idea, &existing, &accepted).await;
                if novel {
                    info!(id = %idea.id, similarity, "accepted proposal");
                    accepted.push(idea);
                } else {
                    warn!(
                        similarity,
                        description = %idea.description,
                        "rejected near-duplicate proposal"
                    );
                }
            }
        }

        if !accepted.is_empty() {
            let rows: Vec<Candidate> = accepted
                .iter()
                .map(|idea| Candidate {
                    id: idea.id.clone(),
                    based_on_id: idea.based_on_id.clone(),
                    description: idea.description.clone(),
                    status: Status::Pending.to_string(),
                    idea_llm: idea.attribution.clone(),
                    ..Candidate::default()
                })
                .collect();
            let added = self.ledger.open()?.append(&rows)?;
            info!(added, "appended ideas to ledger");
        }

        info!(
            succeeded = strategies_succeeded,
            attempted = strategies_attempted,
            accepted = accepted.len(),
            "ideation pass finished"
        );

        if self.cfg.config.novelty.enabled {
            self.embedder.save_cache();
        }
        Ok(accepted.len())
    }

    fn build_context(&self) -> Result<StrategyContext> {
        let guard = self.ledger.open()?;
        let top_performers = guard.top_performers(self.cfg.config.ideation.num_elites, true)?;
        let generation = guard.highest_generation()? + 1;
        drop(guard);

        let brief_path = self.cfg.brief_path();
        let brief_excerpt = if brief_path.exists() {
            let raw = fs::read_to_string(&brief_path)
                .with_context(|| format!("reading brief {}", brief_path.display()))?;
            raw.chars().take(1000).collect()
        } else {
            String::new()
        };

        Ok(StrategyContext {
            generation,
            top_performers,
            brief_excerpt,
        })
    }

    /// One strategy pass: claim ids, stage the temp CSV, invoke the ideate
    /// pool, and parse back the filled-in rows.  AI failures are logged and
    /// yield an empty batch; the claimed ids stay consumed either way.
    async fn generate(
        &self,
        strategy: &dyn Strategy,
        context: &StrategyContext,
        count: usize,
        claimed: &mut Vec<String>,
    ) -> Result<Vec<Idea>> {
        info!(strategy = strategy.name(), count, "running strategy");

        let ids = self
            .ledger
            .open()?
            .next_ids(context.generation, count, claimed)?;
        info!(strategy = strategy.name(), ids = %ids.join(", "), "claimed ids");
        claimed.extend(ids.iter().cloned());

        let temp_csv = self
            .cfg
            .evolution_dir
            .join(format!("temp-csv-{}.csv", std::process::id()));
        let result = self
            .generate_against_temp(strategy, context, &ids, &temp_csv)
            .await;
        let _ = fs::remove_file(&temp_csv);
        result
    }

    async fn generate_against_temp(
        &self,
        strategy: &dyn Strategy,
        context: &StrategyContext,
        ids: &[String],
        temp_csv: &Path,
    ) -> Result<Vec<Idea>> {
        fs::copy(self.cfg.csv_path(), temp_csv)
            .with_context(|| format!("snapshotting ledger to {}", temp_csv.display()))?;

        let parent = strategy.default_parent(context);
        {
            let mut file = fs::OpenOptions::new().append(true).open(temp_csv)?;
            for id in ids {
                writeln!(
                    file,
                    "{id},{parent},\"[PLACEHOLDER: replace with an algorithmic idea]\",,pending"
                )?;
            }
        }

        let temp_name = temp_csv
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let prompt = strategy.build_prompt(context, ids, &temp_name);

        let invocation = match self
            .gateway
            .invoke_with_backoff(&prompt, Pool::Ideate, &self.backoff)
            .await
        {
            Ok(invocation) => invocation,
            Err(err) => {
                warn!(strategy = strategy.name(), "all retries exhausted: {err}");
                return Ok(Vec::new());
            }
        };

        let ideas = parse_filled_rows(temp_csv, ids, strategy.name(), &invocation.model)?;
        if ideas.is_empty() {
            warn!(strategy = strategy.name(), "model completed but no ideas were parsed");
        }
        Ok(ideas)
    }

    async fn check_novelty(
        &self,
        idea: &Idea,
        existing: &[String],
        accepted: &[Idea],
    ) -> (bool, f32) {
        if !self.cfg.config.novelty.enabled {
            return (true, 0.0);
        }
        let mut corpus: Vec<String> = existing.to_vec();
        corpus.extend(accepted.iter().map(|i| i.description.clone()));
        self.embedder
            .is_novel(&idea.description, &corpus, self.cfg.config.novelty.threshold)
            .await
    }
}

/// Accept rows whose id is in the claimed batch and whose description no
/// longer contains `PLACEHOLDER`.
fn parse_filled_rows(
    temp_csv: &Path,
    expected_ids: &[String],
    strategy_name: &str,
    model: &str,
) -> Result<Vec<Idea>> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_path(temp_csv)?;

    let mut ideas = Vec::new();
    for record in reader.records() {
        let record = record?;
        if record.len() < 3 {
            continue;
        }
        let id = clean_id(record.get(0).unwrap_or("")).to_string();
        if !expected_ids.contains(&id) {
            continue;
        }
        let based_on = record.get(1).unwrap_or("").trim().to_string();
        let description = clean_id(record.get(2).unwrap_or("")).to_string();
        if description.is_empty() || description.contains("PLACEHOLDER") {
            continue;
        }
        ideas.push(Idea {
            id,
            based_on_id: based_on,
            description,
            attribution: format!("{strategy_name} ({model})"),
        });
    }
    Ok(ideas)
}
