//! The candidate processing pipeline.
//!
//! One candidate travels: resolve parent → materialize artifact → LLM edit →
//! syntax gate → optional validator repair loop → sandboxed evaluation →
//! ledger update.  Baselines skip materialization and editing; a
//! pre-existing target skips straight to evaluation so re-runs are
//! idempotent.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use tokio::process::Command;
use tracing::{error, info, warn};

use evolve_config::LoadedConfig;
use evolve_gateway::{AiError, BackoffPolicy, Gateway, Pool};
use evolve_ledger::{Candidate, Ledger, Status, normalize_status};
use evolve_sandbox::{SandboxSpec, run_sandboxed};

use crate::score::{extra_to_cell, parse_evaluator_output};

/// Ids that denote the zero-generation candidate.
const BASELINE_IDS: &[&str] = &["baseline", "baseline-000", "000", "0", "gen00-000"];

const VALIDATOR_TIMEOUT: Duration = Duration::from_secs(30);

/// Outcome of processing one candidate, mapped to worker exit codes by the
/// caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessCode {
    /// Finished: complete, failed, or re-marked pending for retry.
    Ok,
    /// Terminal failure already recorded on the row.
    Failed,
    /// The LLM never produced a usable edit; row should go to
    /// `failed-ai-retry`.
    AiRetry,
    /// No parent artifact exists; row should go to `failed-parent-missing`.
    ParentMissing,
    /// A rate limit survived every backoff round; abort the worker loop.
    RateLimited,
    /// Hard quota exhaustion; abort everything.
    Quota,
}

/// Everything the pipeline needs, shared across candidates.
pub struct ProcessorContext {
    pub cfg: LoadedConfig,
    pub ledger: Ledger,
    pub gateway: Gateway,
    pub backoff: BackoffPolicy,
}

/// Artifact file for a candidate id.
pub fn artifact_path(output_dir: &Path, id: &str) -> PathBuf {
    output_dir.join(format!("evolution_{id}.py"))
}

pub fn is_baseline(id: &str, based_on_id: &str) -> bool {
    based_on_id.is_empty() && BASELINE_IDS.contains(&id)
}

pub async fn process(ctx: &ProcessorContext, candidate: &Candidate) -> Result<ProcessCode> {
    info!(id = candidate.id, parent = candidate.based_on_id, "processing candidate");

    let output_dir = ctx.cfg.output_dir();
    let baseline = is_baseline(&candidate.id, &candidate.based_on_id);
    let target = artifact_path(&output_dir, &candidate.id);

    // 1. Resolution: first listed parent whose artifact exists.
    let (resolved_parent, source) = resolve_parent(ctx, &candidate.based_on_id);
    let source = match source {
        Some(source) => source,
        None if baseline => ctx.cfg.algorithm_path(),
        None => {
            error!(id = candidate.id, parent = candidate.based_on_id, "parent artifact not found");
            return Ok(ProcessCode::ParentMissing);
        }
    };

    if target.exists() {
        info!(id = candidate.id, "artifact already exists, running evaluation only");
    } else if !baseline {
        // 2. Materialization.
        info!(
            from = %source.display(),
            to = %target.display(),
            "copying parent artifact"
        );
        std::fs::copy(&source, &target)
            .with_context(|| format!("copying {} to {}", source.display(), target.display()))?;

        // 3. Edit, verified by content hash.  A call that returns success
        // without touching the file is a refusal, not an edit.
        let target_name = file_name_of(&target);
        let prompt = build_edit_prompt(candidate, &target_name);
        let model = match edit_artifact(ctx, &prompt, &target).await {
            Ok(Some(model)) => {
                info!(id = candidate.id, model, "AI modified artifact");
                model
            }
            Ok(None) => {
                warn!(id = candidate.id, "AI completed without modifying artifact");
                let _ = std::fs::remove_file(&target);
                return Ok(ProcessCode::AiRetry);
            }
            Err(err) => {
                let _ = std::fs::remove_file(&target);
                return Ok(ai_error_code(&candidate.id, err));
            }
        };
        append_run_model(ctx, &candidate.id, &model)?;

        // 4. Syntax gate: a broken file goes back to pending for a later
        // worker rather than burning a terminal status.
        if !check_syntax(ctx, &target).await {
            error!(id = candidate.id, "syntax error in generated artifact");
            let _ = std::fs::remove_file(&target);
            ctx.ledger.open()?.set_status(&candidate.id, &Status::Pending)?;
            return Ok(ProcessCode::Ok);
        }

        // 5. Validation with AI-assisted repair.
        if let Some(validator) = find_validator(ctx) {
            match validate_with_repair(ctx, candidate, &validator, &target).await? {
                ValidationResult::Passed => {}
                ValidationResult::Failed(report) => {
                    let guard = ctx.ledger.open()?;
                    guard.set_status(&candidate.id, &Status::FailedValidation)?;
                    guard.set_field(&candidate.id, "validation_error", &report.summary())?;
                    return Ok(ProcessCode::Failed);
                }
                ValidationResult::Aborted(code) => return Ok(code),
            }
        }
    }

    // 6. Evaluation under the sandbox harness.
    evaluate(ctx, candidate, baseline, resolved_parent.as_deref()).await
}

// ── resolution ──────────────────────────────────────────────────────────

/// Parse `based_on_id` as a comma/semicolon/space-separated list and select
/// the first token whose artifact exists.  Empty (or the baseline sentinel)
/// resolves to the user's algorithm file.
fn resolve_parent(ctx: &ProcessorContext, based_on_id: &str) -> (Option<String>, Option<PathBuf>) {
    let based_on_id = based_on_id.trim();
    if based_on_id.is_empty() || based_on_id == "baseline-000" {
        return (None, Some(ctx.cfg.algorithm_path()));
    }

    let output_dir = ctx.cfg.output_dir();
    for token in based_on_id.split([',', ';']).flat_map(str::split_whitespace) {
        let token = token.trim();
        if token.is_empty() {
            continue;
        }
        let parent_file = artifact_path(&output_dir, token);
        if parent_file.exists() {
            return (Some(token.to_string()), Some(parent_file));
        }
    }

    (None, None)
}

// ── editing ─────────────────────────────────────────────────────────────

/// Invoke the run pool against `prompt` and report the model that changed
/// the file, or `None` when the call succeeded without an edit.
async fn edit_artifact(
    ctx: &ProcessorContext,
    prompt: &str,
    target: &Path,
) -> std::result::Result<Option<String>, AiError> {
    let before = file_hash(target);
    let invocation = ctx
        .gateway
        .invoke_with_backoff(prompt, Pool::Run, &ctx.backoff)
        .await?;
    let after = file_hash(target);

    if after.is_some() && after != before {
        Ok(Some(invocation.model))
    } else {
        Ok(None)
    }
}

fn file_hash(path: &Path) -> Option<String> {
    let bytes = std::fs::read(path).ok()?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Some(format!("{:x}", hasher.finalize()))
}

fn ai_error_code(id: &str, err: AiError) -> ProcessCode {
    match err {
        AiError::Quota { .. } => {
            error!(id, "quota exhausted: {err}");
            ProcessCode::Quota
        }
        AiError::RateLimited { .. } => {
            error!(id, "rate limited: {err}");
            ProcessCode::RateLimited
        }
        other => {
            error!(id, "all AI retries exhausted: {other}");
            ProcessCode::AiRetry
        }
    }
}

/// `run_llm` accumulates every model that touched the artifact,
/// `+`-separated.
fn append_run_model(ctx: &ProcessorContext, id: &str, model: &str) -> Result<()> {
    let guard = ctx.ledger.open()?;
    let current = guard.get(id)?.map(|c| c.run_llm).unwrap_or_default();
    let value = if current.is_empty() {
        model.to_string()
    } else {
        format!("{current}+{model}")
    };
    guard.set_field(id, "run_llm", &value)?;
    Ok(())
}

fn build_edit_prompt(candidate: &Candidate, target_name: &str) -> String {
    format!(
        "Modify the algorithm in {target_name} based on this description: {description}\n\
         \n\
         The modification should be substantial and follow the description exactly. \
         Make sure the algorithm still satisfies all interface requirements and can run properly.\n\
         \n\
         Important: make meaningful changes that match the description. Do not just add \
         comments or make trivial adjustments.\n\
         \n\
         CRITICAL: if you do not know how to implement what was asked for, or the requested \
         change is unclear or not feasible, you MUST decline and change nothing. Declining is \
         better than an incorrect or random change.",
        description = candidate.description
    )
}

// ── syntax gate ─────────────────────────────────────────────────────────

async fn check_syntax(ctx: &ProcessorContext, target: &Path) -> bool {
    Command::new(&ctx.cfg.config.python_cmd)
        .arg("-m")
        .arg("py_compile")
        .arg(target)
        .current_dir(&ctx.cfg.evolution_dir)
        .output()
        .await
        .map(|output| output.status.success())
        .unwrap_or(false)
}

// ── validation ──────────────────────────────────────────────────────────

/// Structured (or raw) validator output folded into repair prompts.
#[derive(Debug, Clone, Default)]
struct ValidatorReport {
    raw_output: String,
    error_type: Option<String>,
    error: Option<String>,
    suggestion: Option<String>,
    traceback: Option<String>,
}

impl ValidatorReport {
    fn from_output(stdout: &str, stderr: &str) -> Self {
        let combined = format!("{}\n{}", stdout.trim(), stderr.trim())
            .trim()
            .to_string();
        let mut report = ValidatorReport {
            raw_output: combined.clone(),
            ..ValidatorReport::default()
        };

        // Validators may emit a JSON object; anything else is raw text.
        if stdout.trim_start().starts_with('{') {
            if let Ok(serde_json::Value::Object(map)) = serde_json::from_str(stdout.trim()) {
                let take = |key: &str| map.get(key).and_then(|v| v.as_str()).map(str::to_string);
                report.error_type = take("error_type");
                report.error = take("error");
                report.suggestion = take("suggestion");
                report.traceback = take("traceback");
            }
        }

        if report.error.is_none() && !combined.is_empty() {
            report.error = Some(combined);
        }
        report
    }

    fn summary(&self) -> String {
        let error_type = self.error_type.as_deref().unwrap_or("unknown");
        let error = self.error.as_deref().unwrap_or("");
        format!("{error_type}: {}", truncate_chars(error, 100))
    }
}

enum ValidationResult {
    Passed,
    Failed(ValidatorReport),
    Aborted(ProcessCode),
}

fn find_validator(ctx: &ProcessorContext) -> Option<PathBuf> {
    // Auto-detected: if validator.py sits beside the evaluator, we use it.
    let path = ctx.cfg.evolution_dir.join("validator.py");
    path.exists().then_some(path)
}

async fn run_validator(ctx: &ProcessorContext, validator: &Path, id: &str) -> (bool, ValidatorReport) {
    info!(id, validator = %validator.display(), "running validator");

    let mut command = Command::new(&ctx.cfg.config.python_cmd);
    command
        .arg(validator)
        .arg(id)
        .current_dir(&ctx.cfg.evolution_dir)
        .kill_on_drop(true);

    match tokio::time::timeout(VALIDATOR_TIMEOUT, command.output()).await {
        Ok(Ok(output)) => {
            let stdout = String::from_utf8_lossy(&output.stdout);
            let stderr = String::from_utf8_lossy(&output.stderr);
            let report = ValidatorReport::from_output(&stdout, &stderr);
            if output.status.success() {
                info!(id, "validation passed");
                (true, report)
            } else {
                warn!(
                    id,
                    error_type = report.error_type.as_deref().unwrap_or("validation_failed"),
                    "validation failed"
                );
                (false, report)
            }
        }
        Ok(Err(err)) => {
            error!(id, "validator error: {err}");
            (
                false,
                ValidatorReport {
                    error: Some(err.to_string()),
                    error_type: Some("exception".to_string()),
                    ..ValidatorReport::default()
                },
            )
        }
        Err(_) => {
            error!(id, "validator timed out");
            (
                false,
                ValidatorReport {
                    error: Some(format!(
                        "Validator timed out after {} seconds",
                        VALIDATOR_TIMEOUT.as_secs()
                    )),
                    error_type: Some("timeout".to_string()),
                    ..ValidatorReport::default()
                },
            )
        }
    }
}

async fn validate_with_repair(
    ctx: &ProcessorContext,
    candidate: &Candidate,
    validator: &Path,
    target: &Path,
) -> Result<ValidationResult> {
    let max_retries = ctx.cfg.config.max_validation_retries;
    let target_name = file_name_of(target);
    let mut last_report = ValidatorReport::default();

    for attempt in 0..=max_retries {
        let (passed, report) = run_validator(ctx, validator, &candidate.id).await;
        if passed {
            return Ok(ValidationResult::Passed);
        }
        last_report = report;

        if attempt >= max_retries {
            error!(
                id = candidate.id,
                attempts = max_retries,
                "validation failed after all fix attempts"
            );
            break;
        }

        info!(id = candidate.id, attempt = attempt + 1, "asking AI to fix validation error");
        let fix_prompt = build_fix_prompt(candidate, &target_name, &last_report);
        match edit_artifact(ctx, &fix_prompt, target).await {
            Ok(Some(model)) => append_run_model(ctx, &candidate.id, &model)?,
            Ok(None) => {
                error!(id = candidate.id, "AI failed to fix validation error");
                break;
            }
            Err(err @ (AiError::Quota { .. } | AiError::RateLimited { .. })) => {
                return Ok(ValidationResult::Aborted(ai_error_code(&candidate.id, err)));
            }
            Err(err) => {
                error!(id = candidate.id, "AI failed to fix validation error: {err}");
                break;
            }
        }

        // A fix that breaks the syntax still gets another validation round
        // while retries remain.
        if !check_syntax(ctx, target).await {
            warn!(id = candidate.id, "fix introduced a syntax error");
        }
    }

    Ok(ValidationResult::Failed(last_report))
}

fn build_fix_prompt(candidate: &Candidate, target_name: &str, report: &ValidatorReport) -> String {
    let mut prompt = format!(
        "The code in {target_name} failed validation. Fix the errors and try again.\n\n\
         ## Validator Output\n\n"
    );

    if let Some(error_type) = &report.error_type {
        prompt.push_str(&format!("**Error Type:** {error_type}\n\n"));
    }
    if let Some(error) = &report.error {
        prompt.push_str(&format!("**Error:**\n{error}\n\n"));
    }
    if let Some(suggestion) = &report.suggestion {
        prompt.push_str(&format!("**Suggested Fix:**\n{suggestion}\n\n"));
    }
    if let Some(traceback) = &report.traceback {
        prompt.push_str(&format!("**Traceback:**\n```\n{}\n```\n\n", tail_chars(traceback, 1500)));
    }

    let has_structure = report.error_type.is_some()
        || report.error.is_some()
        || report.suggestion.is_some()
        || report.traceback.is_some();
    if !has_structure {
        let raw = if report.raw_output.is_empty() {
            "No output captured"
        } else {
            &report.raw_output
        };
        prompt.push_str(&format!("```\n{}\n```\n\n", truncate_chars(raw, 2000)));
    }

    prompt.push_str(&format!(
        "## Instructions\n\n\
         1. Read {target_name} to understand the current code\n\
         2. Identify the issue from the validator output above\n\
         3. Fix the code so validation passes\n\
         4. The fix must still implement: {description}\n\n\
         CRITICAL: actually fix the error. Do not just add comments or make cosmetic changes.",
        description = candidate.description
    ));

    prompt
}

// ── evaluation ──────────────────────────────────────────────────────────

async fn evaluate(
    ctx: &ProcessorContext,
    candidate: &Candidate,
    baseline: bool,
    resolved_parent: Option<&str>,
) -> Result<ProcessCode> {
    info!(id = candidate.id, "running evaluator");

    let eval_arg = if baseline { String::new() } else { candidate.id.clone() };
    let spec = SandboxSpec {
        command: vec![
            ctx.cfg.config.python_cmd.clone(),
            ctx.cfg.evaluator_path().to_string_lossy().into_owned(),
            eval_arg,
        ],
        working_dir: ctx.cfg.evolution_dir.clone(),
        memory_limit_mb: ctx.cfg.config.memory_limit_mb,
        cpu_limit_secs: 0,
        timeout: Duration::from_secs(ctx.cfg.config.timeout_seconds),
        use_os_sandbox: true,
    };

    let outcome = run_sandboxed(&spec).await?;
    if !outcome.success() {
        error!(
            id = candidate.id,
            exit_code = outcome.exit_code,
            "evaluator failed: {}",
            truncate_chars(outcome.stderr.trim(), 500)
        );
        ctx.ledger.open()?.set_status(&candidate.id, &Status::Failed)?;
        record_bandit(ctx, candidate, None, None);
        return Ok(ProcessCode::Failed);
    }

    let combined = format!("{}\n{}", outcome.stdout, outcome.stderr);
    let Some(parsed) = parse_evaluator_output(&combined) else {
        error!(id = candidate.id, "evaluation produced no score");
        ctx.ledger.open()?.set_status(&candidate.id, &Status::Failed)?;
        record_bandit(ctx, candidate, None, None);
        return Ok(ProcessCode::Failed);
    };

    info!(id = candidate.id, score = parsed.score, "evaluation complete");

    let parent_score = resolved_parent
        .and_then(|parent| ctx.ledger.open().ok().and_then(|g| g.get(parent).ok().flatten()))
        .and_then(|parent| parent.performance);

    {
        let guard = ctx.ledger.open()?;
        guard.set_status(&candidate.id, &Status::Complete)?;
        guard.set_performance(&candidate.id, parsed.score)?;
        for (key, value) in &parsed.extras {
            guard.set_field(&candidate.id, key, &extra_to_cell(value))?;
        }
    }

    record_bandit(ctx, candidate, Some(parsed.score), parent_score);
    Ok(ProcessCode::Ok)
}

/// Credit the model that produced this artifact with the child-minus-parent
/// improvement.  No-op when the bandit is disabled or no model edited the
/// file (baselines, pre-existing artifacts).
fn record_bandit(
    ctx: &ProcessorContext,
    candidate: &Candidate,
    child: Option<f64>,
    parent: Option<f64>,
) {
    let model = ctx
        .ledger
        .open()
        .ok()
        .and_then(|g| g.get(&candidate.id).ok().flatten())
        .map(|c| c.run_llm)
        .unwrap_or_default();
    if let Some(first) = model.split('+').next().filter(|m| !m.is_empty()) {
        ctx.gateway.record_outcome(first, child, parent);
    }
}

// ── small helpers ───────────────────────────────────────────────────────

fn file_name_of(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string_lossy().into_owned())
}

fn truncate_chars(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        text.to_string()
    } else {
        let cut: String = text.chars().take(max).collect();
        format!("{cut}... (truncated)")
    }
}

fn tail_chars(text: &str, max: usize) -> String {
    let count = text.chars().count();
    if count <= max {
        text.to_string()
    } else {
        let tail: String = text.chars().skip(count - max).collect();
        format!("...{tail}")
    }
}

/// Statuses a signal handler must not revert to pending.
pub fn is_terminal_status(status: &str) -> bool {
    matches!(
        normalize_status(status).as_str(),
        "complete" | "failed" | "failed-ai-retry" | "failed-parent-missing" | "failed-validation"
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    use evolve_config::EvolveConfig;

    const MODEL: &str = "test-model";

    struct Fixture {
        dir: TempDir,
        ctx: ProcessorContext,
    }

    fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        let mut perms = fs::metadata(&path).unwrap().permissions();
        perms.set_mode(0o755);
        fs::set_permissions(&path, perms).unwrap();
        path
    }

    /// A stand-in interpreter: `-m py_compile` succeeds, anything else runs
    /// the named file as a shell script.
    fn fake_python(dir: &Path) -> PathBuf {
        write_script(
            dir,
            "fake-python",
            "if [ \"$1\" = \"-m\" ]; then exit 0; fi\nexec sh \"$@\"",
        )
    }

    fn fixture(runner_body: &str, evaluator_body: &str) -> Fixture {
        let dir = TempDir::new().unwrap();
        let root = dir.path().to_path_buf();

        fs::write(root.join("algorithm.py"), "def solve():\n    return 1\n").unwrap();
        write_script(&root, "evaluator.py", evaluator_body);
        let runner = write_script(&root, "runner.sh", runner_body);
        let python = fake_python(&root);

        let mut config = EvolveConfig::default();
        config.python_cmd = python.to_string_lossy().into_owned();

        let cfg = evolve_config::LoadedConfig {
            config,
            config_path: root.join("config.toml"),
            evolution_dir: root.clone(),
        };

        let ledger = Ledger::new(root.join("evolution.csv"), Duration::from_secs(2));
        let gateway = Gateway::new(
            runner,
            vec![MODEL.to_string()],
            vec![MODEL.to_string()],
            &root,
        );
        let backoff = BackoffPolicy {
            max_rounds: 1,
            initial_wait: Duration::from_millis(1),
            max_wait: Duration::from_millis(1),
        };

        Fixture {
            dir,
            ctx: ProcessorContext {
                cfg,
                ledger,
                gateway,
                backoff,
            },
        }
    }

    fn seed_rows(f: &Fixture, rows: &str) {
        fs::write(
            f.dir.path().join("evolution.csv"),
            format!("id,based_on_id,description,performance,status,idea_llm,run_llm\n{rows}"),
        )
        .unwrap();
    }

    fn candidate(id: &str, parent: &str, desc: &str) -> Candidate {
        Candidate {
            id: id.to_string(),
            based_on_id: parent.to_string(),
            description: desc.to_string(),
            status: "running".to_string(),
            ..Candidate::default()
        }
    }

    fn row(f: &Fixture, id: &str) -> Candidate {
        f.ctx.ledger.open().unwrap().get(id).unwrap().unwrap()
    }

    const JSON_EVALUATOR: &str = "echo '{\"performance\": 1.5, \"extra\": \"7\"}'";

    #[tokio::test]
    async fn baseline_is_evaluated_without_editing() {
        let f = fixture("touch ai-was-called", JSON_EVALUATOR);
        seed_rows(&f, "baseline-000,,Original algorithm performance,,running,,\n");

        let code = process(&f.ctx, &candidate("baseline-000", "", "Original"))
            .await
            .unwrap();

        assert_eq!(code, ProcessCode::Ok);
        assert!(!f.dir.path().join("ai-was-called").exists());
        let c = row(&f, "baseline-000");
        assert_eq!(c.status, "complete");
        assert_eq!(c.performance, Some(1.5));
    }

    #[tokio::test]
    async fn missing_parent_is_terminal() {
        let f = fixture("exit 0", JSON_EVALUATOR);
        seed_rows(&f, "gen01-001,gen01-999,desc,,running,,\n");

        let code = process(&f.ctx, &candidate("gen01-001", "gen01-999", "desc"))
            .await
            .unwrap();
        assert_eq!(code, ProcessCode::ParentMissing);
    }

    #[tokio::test]
    async fn ai_noop_deletes_target_and_requests_retry() {
        // The runner returns success without touching the file.
        let f = fixture("exit 0", JSON_EVALUATOR);
        fs::write(f.dir.path().join("evolution_gen01-001.py"), "x = 1\n").unwrap();
        seed_rows(&f, "gen01-002,gen01-001,tweak,,running,,\n");

        let code = process(&f.ctx, &candidate("gen01-002", "gen01-001", "tweak"))
            .await
            .unwrap();

        assert_eq!(code, ProcessCode::AiRetry);
        assert!(!f.dir.path().join("evolution_gen01-002.py").exists());
    }

    #[tokio::test]
    async fn edit_then_evaluate_records_model_and_score() {
        let f = fixture("echo '# tweaked' >> evolution_gen01-002.py", JSON_EVALUATOR);
        fs::write(f.dir.path().join("evolution_gen01-001.py"), "x = 1\n").unwrap();
        seed_rows(
            &f,
            "gen01-001,,parent,1.0,complete,,\ngen01-002,gen01-001,tweak,,running,,\n",
        );

        let code = process(&f.ctx, &candidate("gen01-002", "gen01-001", "tweak"))
            .await
            .unwrap();

        assert_eq!(code, ProcessCode::Ok);
        let c = row(&f, "gen01-002");
        assert_eq!(c.status, "complete");
        assert_eq!(c.performance, Some(1.5));
        assert_eq!(c.run_llm, MODEL);
        // The evaluator's extra JSON field became a column.
        let raw = fs::read_to_string(f.dir.path().join("evolution.csv")).unwrap();
        assert!(raw.lines().next().unwrap().contains("extra"));
        assert!(raw.contains(",7"));
    }

    #[tokio::test]
    async fn preexisting_artifact_skips_editing() {
        let f = fixture("touch ai-was-called", JSON_EVALUATOR);
        fs::write(f.dir.path().join("evolution_gen01-002.py"), "x = 2\n").unwrap();
        seed_rows(&f, "gen01-002,gen01-001,tweak,,running,,\n");

        let code = process(&f.ctx, &candidate("gen01-002", "gen01-001", "tweak"))
            .await
            .unwrap();

        assert_eq!(code, ProcessCode::Ok);
        assert!(!f.dir.path().join("ai-was-called").exists());
        assert_eq!(row(&f, "gen01-002").status, "complete");
    }

    #[tokio::test]
    async fn crossover_parent_list_uses_first_existing() {
        let f = fixture("echo '#' >> evolution_gen02-001.py", JSON_EVALUATOR);
        fs::write(f.dir.path().join("evolution_gen01-002.py"), "x = 1\n").unwrap();
        seed_rows(&f, "gen02-001,\"gen01-009, gen01-002\",mix,,running,,\n");

        let code = process(&f.ctx, &candidate("gen02-001", "gen01-009, gen01-002", "mix"))
            .await
            .unwrap();
        assert_eq!(code, ProcessCode::Ok);
        assert_eq!(row(&f, "gen02-001").status, "complete");
    }

    #[tokio::test]
    async fn failing_evaluator_marks_failed() {
        let f = fixture("echo '#' >> evolution_gen01-002.py", "echo boom >&2; exit 1");
        fs::write(f.dir.path().join("evolution_gen01-001.py"), "x = 1\n").unwrap();
        seed_rows(&f, "gen01-002,gen01-001,tweak,,running,,\n");

        let code = process(&f.ctx, &candidate("gen01-002", "gen01-001", "tweak"))
            .await
            .unwrap();

        assert_eq!(code, ProcessCode::Failed);
        assert_eq!(row(&f, "gen01-002").status, "failed");
        // Artifact is retained for inspection.
        assert!(f.dir.path().join("evolution_gen01-002.py").exists());
    }

    #[tokio::test]
    async fn scoreless_evaluator_marks_failed() {
        let f = fixture("echo '#' >> evolution_gen01-002.py", "echo done");
        fs::write(f.dir.path().join("evolution_gen01-001.py"), "x = 1\n").unwrap();
        seed_rows(&f, "gen01-002,gen01-001,tweak,,running,,\n");

        let code = process(&f.ctx, &candidate("gen01-002", "gen01-001", "tweak"))
            .await
            .unwrap();
        assert_eq!(code, ProcessCode::Failed);
        assert_eq!(row(&f, "gen01-002").status, "failed");
    }

    #[tokio::test]
    async fn quota_from_runner_aborts_processing() {
        let f = fixture("exit 3", JSON_EVALUATOR);
        fs::write(f.dir.path().join("evolution_gen01-001.py"), "x = 1\n").unwrap();
        seed_rows(&f, "gen01-002,gen01-001,tweak,,running,,\n");

        let code = process(&f.ctx, &candidate("gen01-002", "gen01-001", "tweak"))
            .await
            .unwrap();
        assert_eq!(code, ProcessCode::Quota);
        assert!(!f.dir.path().join("evolution_gen01-002.py").exists());
    }

    #[tokio::test]
    async fn syntax_failure_returns_row_to_pending() {
        let f = fixture("echo 'broken(' >> evolution_gen01-002.py", JSON_EVALUATOR);
        // Replace the interpreter with one whose compile check always fails.
        write_script(
            f.dir.path(),
            "fake-python",
            "if [ \"$1\" = \"-m\" ]; then exit 1; fi\nexec sh \"$@\"",
        );
        fs::write(f.dir.path().join("evolution_gen01-001.py"), "x = 1\n").unwrap();
        seed_rows(&f, "gen01-002,gen01-001,tweak,,running,,\n");

        let code = process(&f.ctx, &candidate("gen01-002", "gen01-001", "tweak"))
            .await
            .unwrap();

        assert_eq!(code, ProcessCode::Ok);
        assert_eq!(row(&f, "gen01-002").status, "pending");
        assert!(!f.dir.path().join("evolution_gen01-002.py").exists());
    }

    #[tokio::test]
    async fn validator_failure_is_repaired_then_passes() {
        // First runner call edits; the second (repair) call drops the marker
        // the validator looks for.
        let runner = "echo '# change' >> evolution_gen01-002.py\n\
                      if [ -f first-call ]; then touch fixed.marker; else touch first-call; fi";
        let f = fixture(runner, JSON_EVALUATOR);
        write_script(
            f.dir.path(),
            "validator.py",
            "if [ -f fixed.marker ]; then exit 0; fi\n\
             echo '{\"error_type\": \"shape\", \"error\": \"bad output shape\"}'\nexit 1",
        );
        fs::write(f.dir.path().join("evolution_gen01-001.py"), "x = 1\n").unwrap();
        seed_rows(&f, "gen01-002,gen01-001,tweak,,running,,\n");

        let code = process(&f.ctx, &candidate("gen01-002", "gen01-001", "tweak"))
            .await
            .unwrap();

        assert_eq!(code, ProcessCode::Ok);
        let c = row(&f, "gen01-002");
        assert_eq!(c.status, "complete");
        // Both the edit model and the fix model are recorded.
        assert_eq!(c.run_llm, format!("{MODEL}+{MODEL}"));
    }

    #[tokio::test]
    async fn persistent_validation_failure_is_terminal() {
        let f = fixture("echo '# change' >> evolution_gen01-002.py", JSON_EVALUATOR);
        write_script(
            f.dir.path(),
            "validator.py",
            "echo '{\"error_type\": \"shape\", \"error\": \"bad output shape\"}'\nexit 1",
        );
        fs::write(f.dir.path().join("evolution_gen01-001.py"), "x = 1\n").unwrap();
        seed_rows(&f, "gen01-002,gen01-001,tweak,,running,,\n");

        let mut f = f;
        f.ctx.cfg.config.max_validation_retries = 1;

        let code = process(&f.ctx, &candidate("gen01-002", "gen01-001", "tweak"))
            .await
            .unwrap();

        assert_eq!(code, ProcessCode::Failed);
        let c = row(&f, "gen01-002");
        assert_eq!(c.status, "failed-validation");
        let raw = fs::read_to_string(f.dir.path().join("evolution.csv")).unwrap();
        assert!(raw.lines().next().unwrap().contains("validation_error"));
        assert!(raw.contains("shape: bad output shape"));
    }

    #[test]
    fn baseline_detection_requires_empty_parent() {
        assert!(is_baseline("baseline-000", ""));
        assert!(is_baseline("gen00-000", ""));
        assert!(is_baseline("0", ""));
        assert!(!is_baseline("baseline-000", "gen01-001"));
        assert!(!is_baseline("gen01-001", ""));
    }

    #[test]
    fn terminal_statuses_are_not_revertible() {
        assert!(is_terminal_status("complete"));
        assert!(is_terminal_status("failed-ai-retry"));
        assert!(is_terminal_status("Failed"));
        assert!(!is_terminal_status("running"));
        assert!(!is_terminal_status("pending"));
    }
}
