//! UCB1 model selection.
//!
//! Tracks the *improvement* each model produces (child score minus parent
//! score) rather than absolute scores, which normalizes across problem
//! difficulties.  Selection balances exploitation against exploration:
//!
//! `UCB = mean_improvement + c * sqrt(2 * ln(N) / n)`
//!
//! with an epsilon-greedy override and multiplicative decay so stale
//! observations fade.

use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;

use chrono::Utc;
use rand::Rng;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Observations for one model.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ModelStats {
    /// Evaluations that ran to completion (including failures).
    pub completed: u64,
    /// Times this model was selected.
    pub submitted: u64,
    /// Sum of child-minus-parent improvements.
    pub total_improvement: f64,
}

impl ModelStats {
    pub fn mean_improvement(&self) -> f64 {
        if self.completed == 0 {
            0.0
        } else {
            self.total_improvement / self.completed as f64
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct BanditState {
    exploration_coef: f64,
    epsilon: f64,
    decay_factor: f64,
    baseline_score: f64,
    models: BTreeMap<String, ModelStats>,
    updated_at: String,
}

/// Improvement booked for an evaluation that produced no score.
const FAILURE_IMPROVEMENT: f64 = -0.1;

#[derive(Debug)]
pub struct Bandit {
    exploration_coef: f64,
    epsilon: f64,
    decay_factor: f64,
    baseline_score: f64,
    state_path: Option<PathBuf>,
    models: BTreeMap<String, ModelStats>,
}

impl Bandit {
    pub fn new(model_names: &[String], state_path: Option<PathBuf>) -> Self {
        let mut bandit = Self {
            exploration_coef: 1.0,
            epsilon: 0.15,
            decay_factor: 0.95,
            baseline_score: 0.0,
            state_path,
            models: model_names
                .iter()
                .map(|name| (name.clone(), ModelStats::default()))
                .collect(),
        };
        bandit.load();
        bandit
    }

    pub fn set_baseline(&mut self, score: f64) {
        self.baseline_score = score;
    }

    pub fn total_completions(&self) -> u64 {
        self.models.values().map(|s| s.completed).sum()
    }

    pub fn stats(&self, model: &str) -> Option<&ModelStats> {
        self.models.get(model)
    }

    fn ucb_score(&self, stats: &ModelStats) -> f64 {
        let n_total = self.total_completions().max(1) as f64;
        let n_model = stats.completed.max(1) as f64;
        stats.mean_improvement() + self.exploration_coef * (2.0 * n_total.ln() / n_model).sqrt()
    }

    /// Pick a model from `available`.  Untried models go first; otherwise
    /// the highest UCB score wins, with an epsilon chance of a uniformly
    /// random pick.
    pub fn select(&mut self, available: &[String]) -> Option<String> {
        if available.is_empty() {
            return None;
        }
        for name in available {
            self.models.entry(name.clone()).or_default();
        }

        let mut rng = rand::thread_rng();
        let selected = if rng.gen::<f64>() < self.epsilon {
            let pick = available.choose(&mut rng)?.clone();
            debug!(model = pick, "bandit exploration pick");
            pick
        } else {
            let untried: Vec<&String> = available
                .iter()
                .filter(|m| self.models[m.as_str()].completed == 0)
                .collect();
            if let Some(pick) = untried.choose(&mut rng) {
                debug!(model = %pick, "bandit untried pick");
                (**pick).clone()
            } else {
                let pick = available
                    .iter()
                    .max_by(|a, b| {
                        let sa = self.ucb_score(&self.models[a.as_str()]);
                        let sb = self.ucb_score(&self.models[b.as_str()]);
                        sa.partial_cmp(&sb).unwrap_or(std::cmp::Ordering::Equal)
                    })?
                    .clone();
                debug!(model = pick, "bandit ucb pick");
                pick
            }
        };

        if let Some(stats) = self.models.get_mut(&selected) {
            stats.submitted += 1;
        }
        Some(selected)
    }

    /// Book an evaluation outcome.  `child = None` means the evaluation
    /// failed; a missing parent score falls back to the baseline.  Returns
    /// the improvement credited.
    pub fn update(&mut self, model: &str, child: Option<f64>, parent: Option<f64>) -> f64 {
        let baseline = self.baseline_score;
        let stats = self.models.entry(model.to_string()).or_default();

        let improvement = match child {
            None => FAILURE_IMPROVEMENT,
            Some(child) => child - parent.unwrap_or(baseline),
        };

        stats.completed += 1;
        stats.total_improvement += improvement;
        debug!(
            model,
            improvement,
            mean = stats.mean_improvement(),
            "bandit update"
        );

        self.apply_decay();
        self.save();
        improvement
    }

    fn apply_decay(&mut self) {
        for stats in self.models.values_mut() {
            stats.total_improvement *= self.decay_factor;
            if stats.completed > 1 {
                stats.completed =
                    ((stats.completed as f64 * self.decay_factor) as u64).max(1);
            }
        }
    }

    fn save(&self) {
        let Some(path) = &self.state_path else {
            return;
        };
        let state = BanditState {
            exploration_coef: self.exploration_coef,
            epsilon: self.epsilon,
            decay_factor: self.decay_factor,
            baseline_score: self.baseline_score,
            models: self.models.clone(),
            updated_at: Utc::now().to_rfc3339(),
        };
        let result = (|| -> std::io::Result<()> {
            let body = serde_json::to_string_pretty(&state).map_err(std::io::Error::other)?;
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(path, body)
        })();
        if let Err(err) = result {
            warn!(path = %path.display(), "failed to save bandit state: {err}");
        }
    }

    fn load(&mut self) {
        let Some(path) = &self.state_path else {
            return;
        };
        if !path.exists() {
            return;
        }
        match fs::read_to_string(path)
            .map_err(|e| e.to_string())
            .and_then(|raw| serde_json::from_str::<BanditState>(&raw).map_err(|e| e.to_string()))
        {
            Ok(state) => {
                self.exploration_coef = state.exploration_coef;
                self.epsilon = state.epsilon;
                self.decay_factor = state.decay_factor;
                self.baseline_score = state.baseline_score;
                for (name, stats) in state.models {
                    self.models.insert(name, stats);
                }
                debug!(
                    models = self.models.len(),
                    completions = self.total_completions(),
                    "loaded bandit state"
                );
            }
            Err(err) => warn!(path = %path.display(), "failed to load bandit state: {err}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn models(names: &[&str]) -> Vec<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    fn deterministic(bandit: &mut Bandit) {
        bandit.epsilon = 0.0;
    }

    #[test]
    fn untried_models_are_selected_first() {
        let pool = models(&["a", "b"]);
        let mut bandit = Bandit::new(&pool, None);
        deterministic(&mut bandit);

        bandit.update("a", Some(10.0), Some(0.0));
        // "b" has no completions yet, so it must be tried next.
        assert_eq!(bandit.select(&pool), Some("b".to_string()));
    }

    #[test]
    fn higher_mean_improvement_wins_ucb() {
        let pool = models(&["good", "bad"]);
        let mut bandit = Bandit::new(&pool, None);
        deterministic(&mut bandit);

        for _ in 0..5 {
            bandit.update("good", Some(1.0), Some(0.0));
            bandit.update("bad", Some(-1.0), Some(0.0));
        }
        assert_eq!(bandit.select(&pool), Some("good".to_string()));
    }

    #[test]
    fn failure_counts_as_slight_regression() {
        let pool = models(&["a"]);
        let mut bandit = Bandit::new(&pool, None);
        let improvement = bandit.update("a", None, None);
        assert!(improvement < 0.0);
        assert_eq!(bandit.stats("a").unwrap().completed, 1);
    }

    #[test]
    fn missing_parent_uses_baseline() {
        let pool = models(&["a"]);
        let mut bandit = Bandit::new(&pool, None);
        bandit.set_baseline(2.0);
        let improvement = bandit.update("a", Some(5.0), None);
        assert!((improvement - 3.0).abs() < 1e-9);
    }

    #[test]
    fn state_round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("llm_bandit.json");
        let pool = models(&["a", "b"]);

        {
            let mut bandit = Bandit::new(&pool, Some(path.clone()));
            bandit.update("a", Some(4.0), Some(1.0));
        }

        let bandit = Bandit::new(&pool, Some(path));
        let stats = bandit.stats("a").unwrap();
        assert_eq!(stats.completed, 1);
        // One decay application happened at update time.
        assert!((stats.total_improvement - 3.0 * 0.95).abs() < 1e-9);
    }

    #[test]
    fn unknown_model_is_added_on_update() {
        let mut bandit = Bandit::new(&models(&["a"]), None);
        bandit.update("surprise", Some(1.0), Some(0.0));
        assert!(bandit.stats("surprise").is_some());
    }
}
