//! Ideation strategies.
//!
//! Strategies differ only in prompt content and default parent; the
//! surrounding machinery (id claiming, stub rows, result parsing) is shared.
//! Each prompt must uphold the stub-row protocol: the model edits only the
//! placeholder descriptions in the temp CSV, never adds or deletes rows, and
//! never touches the ids.

use evolve_config::IdeationConfig;
use evolve_ledger::Candidate;

/// Inputs every prompt draws from.
#[derive(Debug, Clone, Default)]
pub struct StrategyContext {
    pub generation: u32,
    pub top_performers: Vec<Candidate>,
    pub brief_excerpt: String,
}

impl StrategyContext {
    fn top_listing(&self, with_scores: bool) -> String {
        self.top_performers
            .iter()
            .take(5)
            .map(|c| {
                let desc = excerpt(&c.description, 100);
                if with_scores {
                    let score = c
                        .performance
                        .map(|p| p.to_string())
                        .unwrap_or_else(|| "?".to_string());
                    format!("  {}: {desc} (score: {score})", c.id)
                } else {
                    format!("  {}: {desc}", c.id)
                }
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    fn parent_whitelist(&self) -> String {
        self.top_performers
            .iter()
            .take(5)
            .map(|c| c.id.as_str())
            .collect::<Vec<_>>()
            .join(",")
    }
}

pub trait Strategy: Send + Sync {
    fn name(&self) -> &'static str;

    /// Parent id written into the stub rows before the model runs.
    fn default_parent(&self, ctx: &StrategyContext) -> String {
        ctx.top_performers
            .first()
            .map(|c| c.id.clone())
            .unwrap_or_default()
    }

    fn build_prompt(&self, ctx: &StrategyContext, ids: &[String], temp_csv_name: &str) -> String;
}

/// The configured strategy roster with per-strategy idea counts.
pub fn strategies(cfg: &IdeationConfig) -> Vec<(Box<dyn Strategy>, usize)> {
    vec![
        (Box::new(NovelExploration) as Box<dyn Strategy>, cfg.novel_exploration),
        (Box::new(HillClimbing), cfg.hill_climbing),
        (Box::new(StructuralMutation), cfg.structural_mutation),
        (Box::new(Crossover), cfg.crossover_hybrid),
    ]
}

/// The shared stub-row protocol block.
fn placeholder_task(ids: &[String], temp_csv_name: &str) -> String {
    format!(
        "Use your file-editing capabilities to fill in PLACEHOLDER descriptions in the CSV \
         file: {temp_csv_name}\n\
         \n\
         CRITICAL TASK:\n\
         The CSV file already contains stub rows with these IDs: {ids}\n\
         Each stub row has a PLACEHOLDER description. REPLACE each PLACEHOLDER with a real \
         algorithmic idea description.\n\
         \n\
         RULES:\n\
         1. Only the last rows of the file contain placeholders; leave every other row alone\n\
         2. DO NOT ADD OR DELETE ANY ROWS - only edit the placeholder descriptions\n\
         3. DO NOT CHANGE THE IDs - they are already correct\n\
         4. ALWAYS wrap each description field in double quotes\n\
         5. Each description is one clear sentence describing the idea",
        ids = ids.join(", ")
    )
}

/// Unrelated, ambitious approaches; stub rows carry no parent.
pub struct NovelExploration;

impl Strategy for NovelExploration {
    fn name(&self) -> &'static str {
        "novel_exploration"
    }

    fn default_parent(&self, _ctx: &StrategyContext) -> String {
        String::new()
    }

    fn build_prompt(&self, ctx: &StrategyContext, ids: &[String], temp_csv_name: &str) -> String {
        format!(
            "{task}\n\
             \n\
             Current evolution context:\n\
             - Generation: {generation}\n\
             - Brief: {brief}\n\
             \n\
             Focus on creative, ambitious algorithmic approaches that have not been tried \
             yet. Each idea should stand alone, not building on any existing candidate.",
            task = placeholder_task(ids, temp_csv_name),
            generation = ctx.generation,
            brief = excerpt(&ctx.brief_excerpt, 500),
        )
    }
}

/// Small tuning perturbations of the current top performers.
pub struct HillClimbing;

impl Strategy for HillClimbing {
    fn name(&self) -> &'static str {
        "hill_climbing"
    }

    fn build_prompt(&self, ctx: &StrategyContext, ids: &[String], temp_csv_name: &str) -> String {
        format!(
            "{task}\n\
             \n\
             IMPORTANT: you MUST use one of these exact parent IDs: {parents}\n\
             \n\
             Successful algorithms to tune:\n{top}\n\
             \n\
             Each idea should be a small parameter adjustment or optimization. Reference \
             which parent you are improving and what specifically you are changing.",
            task = placeholder_task(ids, temp_csv_name),
            parents = ctx.parent_whitelist(),
            top = ctx.top_listing(true),
        )
    }
}

/// Architectural changes to top performers.
pub struct StructuralMutation;

impl Strategy for StructuralMutation {
    fn name(&self) -> &'static str {
        "structural_mutation"
    }

    fn build_prompt(&self, ctx: &StrategyContext, ids: &[String], temp_csv_name: &str) -> String {
        format!(
            "{task}\n\
             \n\
             IMPORTANT: you MUST use one of these exact parent IDs: {parents}\n\
             \n\
             Top algorithms for structural changes:\n{top}\n\
             \n\
             Each idea should involve a significant architectural change: adding new \
             components, changing data flow, or combining techniques within one algorithm.",
            task = placeholder_task(ids, temp_csv_name),
            parents = ctx.parent_whitelist(),
            top = ctx.top_listing(false),
        )
    }
}

/// Multi-parent hybrids; the model lists a primary parent and describes the
/// combination.
pub struct Crossover;

impl Strategy for Crossover {
    fn name(&self) -> &'static str {
        "crossover"
    }

    fn build_prompt(&self, ctx: &StrategyContext, ids: &[String], temp_csv_name: &str) -> String {
        format!(
            "{task}\n\
             \n\
             IMPORTANT: reference multiple parents from: {parents}\n\
             \n\
             Top algorithms to combine:\n{top}\n\
             \n\
             Each idea should combine elements from two or more of the algorithms above. \
             In the parent column, list the main parent first (comma-separated for \
             multiple) and describe in the idea how the approaches are combined.",
            task = placeholder_task(ids, temp_csv_name),
            parents = ctx.parent_whitelist(),
            top = ctx.top_listing(false),
        )
    }
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

    fn context() -> StrategyContext {
        StrategyContext {
            generation: 3,
            top_performers: vec![
                Candidate {
                    id: "gen02-001".to_string(),
                    description: "momentum with decay".to_string(),
                    performance: Some(1.5),
                    ..Candidate::default()
                },
                Candidate {
                    id: "gen01-004".to_string(),
                    description: "mean reversion".to_string(),
                    performance: Some(1.2),
                    ..Candidate::default()
                },
            ],
            brief_excerpt: "Maximize the score".to_string(),
        }
    }

    fn ids() -> Vec<String> {
        vec!["gen03-001".to_string(), "gen03-002".to_string()]
    }

    #[test]
    fn roster_respects_configured_counts() {
        let mut cfg = IdeationConfig::default();
        cfg.hill_climbing = 7;
        cfg.crossover_hybrid = 0;
        let roster = strategies(&cfg);
        assert_eq!(roster.len(), 4);
        assert_eq!(roster[1].0.name(), "hill_climbing");
        assert_eq!(roster[1].1, 7);
        assert_eq!(roster[3].1, 0);
    }

    #[test]
    fn novel_strategy_has_no_parent() {
        assert_eq!(NovelExploration.default_parent(&context()), "");
        let prompt = NovelExploration.build_prompt(&context(), &ids(), "temp-csv-1.csv");
        assert!(prompt.contains("temp-csv-1.csv"));
        assert!(prompt.contains("gen03-001, gen03-002"));
        assert!(prompt.contains("Maximize the score"));
        assert!(prompt.contains("DO NOT ADD OR DELETE ANY ROWS"));
    }

    #[test]
    fn tuning_strategies_whitelist_parents() {
        for prompt in [
            HillClimbing.build_prompt(&context(), &ids(), "t.csv"),
            StructuralMutation.build_prompt(&context(), &ids(), "t.csv"),
            Crossover.build_prompt(&context(), &ids(), "t.csv"),
        ] {
            assert!(prompt.contains("gen02-001,gen01-004"));
        }
    }

    #[test]
    fn default_parent_is_best_performer() {
        assert_eq!(HillClimbing.default_parent(&context()), "gen02-001");
        assert_eq!(Crossover.default_parent(&StrategyContext::default()), "");
    }

    #[test]
    fn hill_climbing_lists_scores() {
        let prompt = HillClimbing.build_prompt(&context(), &ids(), "t.csv");
        assert!(prompt.contains("(score: 1.5)"));
        assert!(prompt.contains("momentum with decay"));
    }
}
