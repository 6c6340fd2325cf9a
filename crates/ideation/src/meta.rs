//! Meta-learning: distills each completed generation into a few bullet
//! points of accumulated notes that feed the next ideation round.
//!
//! The notes file is plain markdown with one `## Generation N (timestamp)`
//! section per processed generation; its highest header is the high-water
//! mark, so the scan is restartable and never re-summarizes a generation.

use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Local;
use regex::Regex;
use tracing::{info, warn};

use evolve_gateway::{BackoffPolicy, Gateway, Pool};
use evolve_ledger::{Ledger, normalize_status, parse_generation};

/// Per-candidate outcome inside a generation, sorted by improvement.
#[derive(Debug, Clone)]
pub struct AlgorithmOutcome {
    pub id: String,
    pub description: String,
    pub performance: f64,
    pub parent_id: String,
    pub parent_score: f64,
    pub improvement: f64,
}

#[derive(Debug, Clone)]
pub struct GenerationSummary {
    pub generation: u32,
    pub total: usize,
    /// Improvement over parent strictly positive.
    pub successful: usize,
    pub failed: usize,
    pub best: AlgorithmOutcome,
    pub worst: AlgorithmOutcome,
    pub algorithms: Vec<AlgorithmOutcome>,
}

/// Analyze one generation's completed candidates.  `None` when the
/// generation has no completes yet (it may still be in flight).
///
/// Improvement is `child_performance - parent_performance`; a missing
/// parent score counts as 0.
pub fn analyze_generation(ledger: &Ledger, generation: u32) -> Result<Option<GenerationSummary>> {
    let all = ledger.open()?.all_candidates()?;

    let score_of = |id: &str| -> f64 {
        all.iter()
            .find(|c| c.id == id)
            .and_then(|c| c.performance)
            .unwrap_or(0.0)
    };

    let mut pending = 0;
    let mut algorithms: Vec<AlgorithmOutcome> = Vec::new();

    for c in &all {
        if parse_generation(&c.id) != Some(generation) {
            continue;
        }
        let status = normalize_status(&c.status);
        if status.is_empty() || status == "pending" || status == "running" {
            pending += 1;
            continue;
        }
        if status != "complete" {
            continue;
        }
        let Some(performance) = c.performance else {
            continue;
        };

        let parent_id = c
            .based_on_id
            .split([',', ';'])
            .flat_map(str::split_whitespace)
            .next()
            .unwrap_or("")
            .to_string();
        let parent_score = if parent_id.is_empty() {
            0.0
        } else {
            score_of(&parent_id)
        };

        algorithms.push(AlgorithmOutcome {
            id: c.id.clone(),
            description: c.description.clone(),
            performance,
            parent_id,
            parent_score,
            improvement: performance - parent_score,
        });
    }

    if algorithms.is_empty() {
        if pending > 0 {
            info!(generation, pending, "generation still has unfinished candidates");
        }
        return Ok(None);
    }

    algorithms.sort_by(|a, b| {
        b.improvement
            .partial_cmp(&a.improvement)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let successful = algorithms.iter().filter(|a| a.improvement > 0.0).count();
    let summary = GenerationSummary {
        generation,
        total: algorithms.len(),
        successful,
        failed: algorithms.len() - successful,
        best: algorithms[0].clone(),
        worst: algorithms[algorithms.len() - 1].clone(),
        algorithms,
    };
    Ok(Some(summary))
}

fn analysis_prompt(summary: &GenerationSummary, brief_content: &str) -> String {
    let details: Vec<String> = summary
        .algorithms
        .iter()
        .take(10)
        .map(|a| {
            let trend = if a.improvement > 0.0 { "improved" } else { "regressed" };
            format!(
                "- {}: {} (improvement: {:+.4}, {trend})",
                a.id,
                excerpt(&a.description, 100),
                a.improvement
            )
        })
        .collect();

    format!(
        "Analyze the results of generation {generation} and provide brief learnings.\n\
         \n\
         ## Problem Context\n{brief}\n\
         \n\
         ## Generation {generation} Results\n\
         - Total algorithms: {total}\n\
         - Improved over parent: {successful}\n\
         - Regressed from parent: {failed}\n\
         - Best improvement: {best_improvement:+.4} ({best_id})\n\
         - Worst: {worst_improvement:+.4} ({worst_id})\n\
         \n\
         ## Algorithm Details\n{details}\n\
         \n\
         ## Your Task\n\
         Write 2-4 bullet points summarizing:\n\
         1. What approaches WORKED (led to improvement)\n\
         2. What approaches FAILED (led to regression)\n\
         3. Any patterns you notice\n\
         \n\
         Be specific about the algorithmic techniques, not generic observations. Format the \
         response as markdown bullet points starting with \"- \" and keep it concise; it is \
         appended to accumulated notes.",
        generation = summary.generation,
        brief = excerpt(brief_content, 1000),
        total = summary.total,
        successful = summary.successful,
        failed = summary.failed,
        best_improvement = summary.best.improvement,
        best_id = summary.best.id,
        worst_improvement = summary.worst.improvement,
        worst_id = summary.worst.id,
        details = details.join("\n"),
    )
}

/// Ask the ideate pool for the analysis; keep only its bullet lines.
/// `None` when every retry round fails.
pub async fn generate_notes(
    gateway: &Gateway,
    summary: &GenerationSummary,
    brief_content: &str,
) -> Option<String> {
    let prompt = analysis_prompt(summary, brief_content);
    let policy = BackoffPolicy {
        max_rounds: 3,
        initial_wait: Duration::from_secs(30),
        max_wait: Duration::from_secs(120),
    };

    match gateway.invoke_with_backoff(&prompt, Pool::Ideate, &policy).await {
        Ok(invocation) => {
            let bullets: Vec<&str> = invocation
                .output
                .lines()
                .map(str::trim)
                .filter(|line| line.starts_with("- ") || line.starts_with("* "))
                .collect();
            if bullets.is_empty() {
                Some(excerpt(invocation.output.trim(), 500))
            } else {
                Some(bullets.join("\n"))
            }
        }
        Err(err) => {
            warn!(generation = summary.generation, "failed to generate notes: {err}");
            None
        }
    }
}

/// Deterministic summary used when the model is unavailable.
pub fn fallback_notes(summary: &GenerationSummary) -> String {
    format!(
        "- Best performer: {} with improvement {:+.4}\n\
         - Success rate: {}/{} algorithms improved\n\
         - Top approach: {}",
        summary.best.id,
        summary.best.improvement,
        summary.successful,
        summary.total,
        excerpt(&summary.best.description, 100),
    )
}

/// Append a generation section to the notes file, creating the preamble on
/// first use.
pub fn append_notes(notes_path: &Path, generation: u32, notes: &str) -> Result<()> {
    let existing = if notes_path.exists() {
        fs::read_to_string(notes_path)?
    } else {
        String::new()
    };

    let base = if existing.trim().is_empty() {
        "# Evolution Notes\n\nAccumulated learnings from evolution generations.\n".to_string()
    } else {
        existing
    };

    let timestamp = Local::now().format("%Y-%m-%d %H:%M");
    let body = format!(
        "{}\n\n## Generation {generation} ({timestamp})\n\n{notes}\n",
        base.trim_end()
    );
    fs::write(notes_path, body)
        .with_context(|| format!("writing notes {}", notes_path.display()))?;
    info!(generation, path = %notes_path.display(), "updated notes");
    Ok(())
}

/// Highest generation already summarized in the notes file; 0 when none.
pub fn last_processed_generation(notes_path: &Path) -> u32 {
    let Ok(content) = fs::read_to_string(notes_path) else {
        return 0;
    };
    let Ok(re) = Regex::new(r"## Generation (\d+)") else {
        return 0;
    };
    re.captures_iter(&content)
        .filter_map(|caps| caps[1].parse::<u32>().ok())
        .max()
        .unwrap_or(0)
}

/// Summarize every generation newer than the notes file's high-water mark.
/// Returns how many generations gained a section.
pub async fn process_new_generations(
    ledger: &Ledger,
    gateway: &Gateway,
    brief_path: &Path,
    notes_path: &Path,
) -> Result<u32> {
    let highest = ledger.open()?.highest_generation()?;
    let last_processed = last_processed_generation(notes_path);

    let brief_content = if brief_path.exists() {
        fs::read_to_string(brief_path)
            .map(|raw| raw.chars().take(2000).collect::<String>())
            .unwrap_or_default()
    } else {
        String::new()
    };

    let mut processed = 0;
    for generation in (last_processed + 1)..=highest {
        info!(generation, "analyzing generation");
        let Some(summary) = analyze_generation(ledger, generation)? else {
            continue;
        };
        info!(
            generation,
            improved = summary.successful,
            total = summary.total,
            "generation analyzed"
        );

        let notes = match generate_notes(gateway, &summary, &brief_content).await {
            Some(notes) => notes,
            None => fallback_notes(&summary),
        };
        append_notes(notes_path, generation, &notes)?;
        processed += 1;
    }

    Ok(processed)
}

fn excerpt(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        text.to_string()
    } else {
        let cut: String = text.chars().take(max_chars).collect();
        format!("{cut}...")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use std::path::PathBuf;

    fn seeded_ledger(dir: &Path, body: &str) -> Ledger {
        let path = dir.join("evolution.csv");
        fs::write(&path, body).unwrap();
        Ledger::new(path, Duration::from_secs(2))
    }

    const LEDGER_BODY: &str = "id,based_on_id,description,performance,status,idea_llm,run_llm\n\
         baseline-000,,baseline,1.0,complete,,\n\
         gen01-001,baseline-000,better momentum,1.5,complete,,\n\
         gen01-002,baseline-000,worse reversion,0.5,complete,,\n\
         gen01-003,baseline-000,still running,,running,,\n\
         gen01-004,baseline-000,crashed,,failed,,\n";

    #[test]
    fn analyze_computes_improvements_against_parents() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = seeded_ledger(dir.path(), LEDGER_BODY);

        let summary = analyze_generation(&ledger, 1).unwrap().unwrap();
        assert_eq!(summary.generation, 1);
        assert_eq!(summary.total, 2); // completes only
        assert_eq!(summary.successful, 1);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.best.id, "gen01-001");
        assert!((summary.best.improvement - 0.5).abs() < 1e-9);
        assert_eq!(summary.worst.id, "gen01-002");
        assert!((summary.worst.improvement + 0.5).abs() < 1e-9);
    }

    #[test]
    fn missing_parent_score_counts_as_zero() {
        let dir = tempfile::tempdir().unwrap();
        let body = "id,based_on_id,description,performance,status\n\
                    gen02-001,gen01-999,orphan child,2.0,complete\n";
        let ledger = seeded_ledger(dir.path(), body);

        let summary = analyze_generation(&ledger, 2).unwrap().unwrap();
        assert!((summary.best.improvement - 2.0).abs() < 1e-9);
    }

    #[test]
    fn incomplete_generation_yields_none() {
        let dir = tempfile::tempdir().unwrap();
        let body = "id,based_on_id,description,performance,status\n\
                    gen03-001,,pending child,,pending\n";
        let ledger = seeded_ledger(dir.path(), body);
        assert!(analyze_generation(&ledger, 3).unwrap().is_none());
    }

    #[test]
    fn notes_append_and_high_water_mark_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let notes = dir.path().join("BRIEF-notes.md");

        assert_eq!(last_processed_generation(&notes), 0);

        append_notes(&notes, 1, "- momentum tuning worked").unwrap();
        append_notes(&notes, 2, "- reversion regressed").unwrap();

        let content = fs::read_to_string(&notes).unwrap();
        assert!(content.starts_with("# Evolution Notes"));
        assert!(content.contains("## Generation 1 ("));
        assert!(content.contains("## Generation 2 ("));
        assert!(content.contains("- momentum tuning worked"));
        assert_eq!(last_processed_generation(&notes), 2);
    }

    #[test]
    fn fallback_summary_is_deterministic() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = seeded_ledger(dir.path(), LEDGER_BODY);
        let summary = analyze_generation(&ledger, 1).unwrap().unwrap();

        let notes = fallback_notes(&summary);
        assert!(notes.contains("Best performer: gen01-001"));
        assert!(notes.contains("1/2 algorithms improved"));
        assert!(notes.contains("better momentum"));
    }

    fn fake_gateway(dir: &Path, body: &str) -> Gateway {
        let runner = dir.join("runner.sh");
        fs::write(&runner, format!("#!/bin/sh\n{body}\n")).unwrap();
        let mut perms = fs::metadata(&runner).unwrap().permissions();
        perms.set_mode(0o755);
        fs::set_permissions(&runner, perms).unwrap();
        Gateway::new(runner, vec![], vec!["meta-model".to_string()], dir)
    }

    #[tokio::test]
    async fn process_new_generations_appends_model_bullets() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = seeded_ledger(dir.path(), LEDGER_BODY);
        let gateway = fake_gateway(
            dir.path(),
            "echo 'Here are the learnings:'; echo '- tuning momentum helped'; echo '- reversion hurt'",
        );
        let brief = dir.path().join("BRIEF.md");
        fs::write(&brief, "Maximize the score").unwrap();
        let notes: PathBuf = dir.path().join("BRIEF-notes.md");

        let processed = process_new_generations(&ledger, &gateway, &brief, &notes)
            .await
            .unwrap();
        assert_eq!(processed, 1);

        let content = fs::read_to_string(&notes).unwrap();
        assert!(content.contains("- tuning momentum helped"));
        assert!(content.contains("- reversion hurt"));
        // Non-bullet chatter is dropped.
        assert!(!content.contains("Here are the learnings"));

        // A second pass finds nothing new.
        let processed = process_new_generations(&ledger, &gateway, &brief, &notes)
            .await
            .unwrap();
        assert_eq!(processed, 0);
    }

    #[tokio::test]
    async fn model_failure_falls_back_to_deterministic_notes() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = seeded_ledger(dir.path(), LEDGER_BODY);
        let gateway = fake_gateway(dir.path(), "exit 1");
        let notes = dir.path().join("BRIEF-notes.md");

        // Shrink the retry waits by using generate_notes' policy indirectly:
        // exit 1 fails fast each round; three rounds with 30s waits would
        // stall the test, so call the fallback path pieces directly.
        let summary = analyze_generation(&ledger, 1).unwrap().unwrap();
        let text = fallback_notes(&summary);
        append_notes(&notes, 1, &text).unwrap();

        assert!(fs::read_to_string(&notes)
            .unwrap()
            .contains("Best performer: gen01-001"));
    }
}
