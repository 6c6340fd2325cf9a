//! Configuration for the evolve workspace.
//!
//! A single TOML file describes an evolution directory: where the ledger,
//! brief, baseline algorithm, and evaluator live, how many workers may run,
//! and how ideation is parameterized.  Every relative path in the file
//! resolves against the directory containing the config file, which is also
//! the "evolution directory" all subprocesses run in.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

/// Environment variable overriding the config file location.
pub const CONFIG_ENV: &str = "CLAUDE_EVOLVE_CONFIG";
/// Environment variable overriding the working directory searched for a config.
pub const WORKING_DIR_ENV: &str = "CLAUDE_EVOLVE_WORKING_DIR";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EvolveConfig {
    pub csv_file: String,
    pub brief_file: String,
    pub algorithm_file: String,
    pub evaluator_file: String,
    /// Empty string means "use the evolution directory itself".
    pub output_dir: String,
    pub python_cmd: String,
    /// 0 disables the memory limit.
    pub memory_limit_mb: u64,
    pub timeout_seconds: u64,
    pub worker_max_candidates: usize,
    pub max_validation_retries: u32,
    pub auto_ideate: bool,
    pub meta_learning: bool,
    pub min_completed_for_ideation: usize,
    pub llm: LlmConfig,
    pub parallel: ParallelConfig,
    pub ideation: IdeationConfig,
    pub novelty: NoveltyConfig,
}

impl Default for EvolveConfig {
    fn default() -> Self {
        Self {
            csv_file: "evolution.csv".to_string(),
            brief_file: "BRIEF.md".to_string(),
            algorithm_file: "algorithm.py".to_string(),
            evaluator_file: "evaluator.py".to_string(),
            output_dir: String::new(),
            python_cmd: "python3".to_string(),
            memory_limit_mb: 0,
            timeout_seconds: 600,
            worker_max_candidates: 5,
            max_validation_retries: 3,
            auto_ideate: true,
            meta_learning: true,
            min_completed_for_ideation: 3,
            llm: LlmConfig::default(),
            parallel: ParallelConfig::default(),
            ideation: IdeationConfig::default(),
            novelty: NoveltyConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    /// The operator-supplied model runner command.  Invoked as
    /// `<runner> <model> <prompt>` in the evolution directory.
    pub runner: String,
    /// Model pool for artifact edits.
    pub run_models: Vec<String>,
    /// Model pool for ideation and meta-learning.
    pub ideate_models: Vec<String>,
    /// Weight model selection by observed improvement instead of shuffling.
    pub bandit: bool,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            runner: "./ai-runner.sh".to_string(),
            run_models: Vec::new(),
            ideate_models: Vec::new(),
            bandit: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ParallelConfig {
    pub max_workers: usize,
    /// Dispatcher poll interval in seconds.
    pub poll_interval: u64,
    /// Ledger lock acquisition timeout in seconds.
    pub lock_timeout: u64,
}

impl Default for ParallelConfig {
    fn default() -> Self {
        Self {
            max_workers: 4,
            poll_interval: 5,
            lock_timeout: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IdeationConfig {
    pub total_ideas: usize,
    pub novel_exploration: usize,
    pub hill_climbing: usize,
    pub structural_mutation: usize,
    pub crossover_hybrid: usize,
    pub num_elites: usize,
    /// Backoff rounds for LLM calls.
    pub max_rounds: u32,
    /// Seconds to wait after the first failed round.
    pub initial_wait: u64,
    /// Cap on the wait between rounds, in seconds.
    pub max_wait: u64,
}

impl Default for IdeationConfig {
    fn default() -> Self {
        Self {
            total_ideas: 15,
            novel_exploration: 3,
            hill_climbing: 5,
            structural_mutation: 3,
            crossover_hybrid: 4,
            num_elites: 3,
            max_rounds: 10,
            initial_wait: 60,
            max_wait: 600,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NoveltyConfig {
    pub enabled: bool,
    /// Proposals with max cosine similarity >= threshold are rejected.
    pub threshold: f32,
}

impl Default for NoveltyConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            threshold: 0.92,
        }
    }
}

/// A parsed config plus the directory it resolves paths against.
#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub config: EvolveConfig,
    pub config_path: PathBuf,
    pub evolution_dir: PathBuf,
}

impl LoadedConfig {
    pub fn csv_path(&self) -> PathBuf {
        self.resolve(&self.config.csv_file)
    }

    pub fn brief_path(&self) -> PathBuf {
        self.resolve(&self.config.brief_file)
    }

    pub fn algorithm_path(&self) -> PathBuf {
        self.resolve(&self.config.algorithm_file)
    }

    pub fn evaluator_path(&self) -> PathBuf {
        self.resolve(&self.config.evaluator_file)
    }

    /// Directory that receives `evolution_<id>.py` artifacts.
    pub fn output_dir(&self) -> PathBuf {
        if self.config.output_dir.is_empty() {
            self.evolution_dir.clone()
        } else {
            self.resolve(&self.config.output_dir)
        }
    }

    /// The operator's model runner command, resolved like every other
    /// configured path.
    pub fn runner_path(&self) -> PathBuf {
        self.resolve(&self.config.llm.runner)
    }

    /// The accumulated learnings file, derived from the brief name
    /// (`BRIEF.md` -> `BRIEF-notes.md`).
    pub fn notes_path(&self) -> PathBuf {
        let brief = self.brief_path();
        let stem = brief
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "BRIEF".to_string());
        brief.with_file_name(format!("{stem}-notes.md"))
    }

    fn resolve(&self, raw: &str) -> PathBuf {
        let p = Path::new(raw);
        if p.is_absolute() {
            p.to_path_buf()
        } else {
            self.evolution_dir.join(p)
        }
    }
}

/// Locate the config file: explicit flag, then `CLAUDE_EVOLVE_CONFIG`, then
/// `CLAUDE_EVOLVE_WORKING_DIR/config.toml`, then `evolution/config.toml`,
/// then `config.toml` in the current directory.
///
/// A missing config is fatal: every path in the system is anchored to it.
pub fn discover(explicit: Option<&Path>) -> Result<PathBuf> {
    if let Some(path) = explicit {
        if path.exists() {
            return Ok(path.to_path_buf());
        }
        bail!("config not found: {}", path.display());
    }

    if let Ok(value) = env::var(CONFIG_ENV) {
        if !value.is_empty() {
            let path = PathBuf::from(value);
            if path.exists() {
                return Ok(path);
            }
            bail!("config not found (from {CONFIG_ENV}): {}", path.display());
        }
    }

    if let Ok(dir) = env::var(WORKING_DIR_ENV) {
        if !dir.is_empty() {
            let path = Path::new(&dir).join("config.toml");
            if path.exists() {
                return Ok(path);
            }
        }
    }

    for fallback in ["evolution/config.toml", "config.toml"] {
        let path = PathBuf::from(fallback);
        if path.exists() {
            return Ok(path);
        }
    }

    bail!("no config.toml found; pass --config or set {CONFIG_ENV}")
}

/// Parse the config file at `path` and pin the evolution directory to its
/// parent.
pub fn load(path: &Path) -> Result<LoadedConfig> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("reading config {}", path.display()))?;
    let config: EvolveConfig =
        toml::from_str(&raw).with_context(|| format!("parsing config {}", path.display()))?;

    let config_path = path
        .canonicalize()
        .with_context(|| format!("resolving config path {}", path.display()))?;
    let evolution_dir = config_path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));

    Ok(LoadedConfig {
        config,
        config_path,
        evolution_dir,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_config(dir: &Path, body: &str) -> PathBuf {
        let path = dir.join("config.toml");
        fs::write(&path, body).unwrap();
        path
    }

    #[test]
    fn defaults_match_documented_values() {
        let c = EvolveConfig::default();
        assert_eq!(c.csv_file, "evolution.csv");
        assert_eq!(c.timeout_seconds, 600);
        assert_eq!(c.worker_max_candidates, 5);
        assert_eq!(c.max_validation_retries, 3);
        assert_eq!(c.parallel.max_workers, 4);
        assert_eq!(c.parallel.lock_timeout, 10);
        assert_eq!(c.ideation.total_ideas, 15);
        assert_eq!(c.ideation.num_elites, 3);
        assert!(c.novelty.enabled);
        assert!((c.novelty.threshold - 0.92).abs() < f32::EPSILON);
        assert!(c.auto_ideate);
        assert_eq!(c.min_completed_for_ideation, 3);
    }

    #[test]
    fn partial_toml_keeps_defaults_elsewhere() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(
            dir.path(),
            r#"
            memory_limit_mb = 1024

            [parallel]
            max_workers = 8

            [novelty]
            threshold = 0.8
            "#,
        );

        let loaded = load(&path).unwrap();
        assert_eq!(loaded.config.memory_limit_mb, 1024);
        assert_eq!(loaded.config.parallel.max_workers, 8);
        assert_eq!(loaded.config.parallel.poll_interval, 5);
        assert!((loaded.config.novelty.threshold - 0.8).abs() < f32::EPSILON);
        assert_eq!(loaded.config.csv_file, "evolution.csv");
    }

    #[test]
    fn relative_paths_resolve_against_config_dir() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(dir.path(), "csv_file = \"ledger.csv\"\n");
        let loaded = load(&path).unwrap();

        assert_eq!(loaded.csv_path(), loaded.evolution_dir.join("ledger.csv"));
        assert_eq!(loaded.output_dir(), loaded.evolution_dir);
    }

    #[test]
    fn absolute_paths_pass_through() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(dir.path(), "evaluator_file = \"/opt/eval.py\"\n");
        let loaded = load(&path).unwrap();
        assert_eq!(loaded.evaluator_path(), PathBuf::from("/opt/eval.py"));
    }

    #[test]
    fn notes_path_derives_from_brief_stem() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(dir.path(), "brief_file = \"PROBLEM.md\"\n");
        let loaded = load(&path).unwrap();
        assert_eq!(
            loaded.notes_path(),
            loaded.evolution_dir.join("PROBLEM-notes.md")
        );
    }

    #[test]
    fn explicit_missing_config_is_fatal() {
        let err = discover(Some(Path::new("/nonexistent/config.toml"))).unwrap_err();
        assert!(err.to_string().contains("config not found"));
    }
}
