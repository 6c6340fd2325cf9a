//! Evaluator output parsing.
//!
//! Evaluators speak one of three dialects, tried in order:
//!
//! 1. a JSON object with a numeric `performance` or `score` field (any
//!    additional keys are preserved as extra ledger columns);
//! 2. a bare numeric line;
//! 3. a legacy `SCORE: <num>` line.
//!
//! Within each dialect the *last* match wins: evaluators stream progress
//! lines before their final verdict.

use regex::Regex;
use serde_json::Value;

#[derive(Debug, Clone, PartialEq)]
pub struct ParsedScore {
    pub score: f64,
    /// Extra JSON fields, in insertion order, excluding the score keys.
    pub extras: Vec<(String, Value)>,
}

pub fn parse_evaluator_output(output: &str) -> Option<ParsedScore> {
    let mut last_json: Option<ParsedScore> = None;
    let mut last_numeric: Option<f64> = None;

    for line in output.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        if line.starts_with('{') {
            if let Ok(Value::Object(map)) = serde_json::from_str::<Value>(line) {
                let score = map
                    .get("performance")
                    .and_then(Value::as_f64)
                    .or_else(|| map.get("score").and_then(Value::as_f64));
                if let Some(score) = score {
                    let extras = map
                        .into_iter()
                        .filter(|(key, _)| key != "performance" && key != "score")
                        .collect();
                    last_json = Some(ParsedScore { score, extras });
                }
            }
            continue;
        }

        if let Ok(value) = line.parse::<f64>() {
            last_numeric = Some(value);
        }
    }

    if last_json.is_some() {
        return last_json;
    }
    if let Some(score) = last_numeric {
        return Some(ParsedScore {
            score,
            extras: Vec::new(),
        });
    }

    let score_re = Regex::new(r"(?m)^SCORE:\s*([+-]?\d*\.?\d+)").ok()?;
    score_re
        .captures_iter(output)
        .last()
        .and_then(|caps| caps[1].parse().ok())
        .map(|score| ParsedScore {
            score,
            extras: Vec::new(),
        })
}

/// Render an extra JSON value the way it should land in a CSV cell: strings
/// unquoted, everything else as compact JSON.
pub fn extra_to_cell(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn json_with_performance_and_extras() {
        let parsed =
            parse_evaluator_output("warming up\n{\"performance\": 1.5, \"extra\": 7}\n").unwrap();
        assert_eq!(parsed.score, 1.5);
        assert_eq!(parsed.extras, vec![("extra".to_string(), json!(7))]);
    }

    #[test]
    fn json_score_key_is_accepted() {
        let parsed = parse_evaluator_output("{\"score\": -0.25}").unwrap();
        assert_eq!(parsed.score, -0.25);
        assert!(parsed.extras.is_empty());
    }

    #[test]
    fn last_json_object_wins() {
        let out = "{\"performance\": 1.0}\nprogress...\n{\"performance\": 2.0, \"sharpe\": 0.9}\n";
        let parsed = parse_evaluator_output(out).unwrap();
        assert_eq!(parsed.score, 2.0);
        assert_eq!(parsed.extras, vec![("sharpe".to_string(), json!(0.9))]);
    }

    #[test]
    fn bare_numeric_line_is_a_score() {
        let parsed = parse_evaluator_output("starting\n0.875\n").unwrap();
        assert_eq!(parsed.score, 0.875);
    }

    #[test]
    fn last_bare_numeric_wins() {
        let parsed = parse_evaluator_output("1.0\n2.0\n3.0\n").unwrap();
        assert_eq!(parsed.score, 3.0);
    }

    #[test]
    fn json_takes_precedence_over_numeric() {
        let parsed = parse_evaluator_output("42\n{\"performance\": 1.0}\n").unwrap();
        assert_eq!(parsed.score, 1.0);
    }

    #[test]
    fn legacy_score_prefix_is_a_fallback() {
        let parsed = parse_evaluator_output("log line\nSCORE: -3.5\n").unwrap();
        assert_eq!(parsed.score, -3.5);
    }

    #[test]
    fn json_without_score_keys_is_ignored() {
        assert!(parse_evaluator_output("{\"status\": \"done\"}").is_none());
    }

    #[test]
    fn garbage_yields_none() {
        assert!(parse_evaluator_output("no score here\nnothing numeric\n").is_none());
        assert!(parse_evaluator_output("").is_none());
    }

    #[test]
    fn non_numeric_score_field_is_skipped() {
        // A JSON line with a string score falls through to the next dialect.
        let parsed = parse_evaluator_output("{\"performance\": \"high\"}\n0.5\n").unwrap();
        assert_eq!(parsed.score, 0.5);
    }

    #[test]
    fn extras_render_for_csv_cells() {
        assert_eq!(extra_to_cell(&json!("text")), "text");
        assert_eq!(extra_to_cell(&json!(3.5)), "3.5");
        assert_eq!(extra_to_cell(&json!({"a": 1})), "{\"a\":1}");
    }
}
