use std::fmt;
use std::str::FromStr;

/// One ledger row.
///
/// `status` keeps the raw wire string so corrupted or unknown values survive
/// a read/modify/write cycle untouched; use [`Status`] when writing.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Candidate {
    pub id: String,
    pub based_on_id: String,
    pub description: String,
    pub performance: Option<f64>,
    pub status: String,
    pub idea_llm: String,
    pub run_llm: String,
}

impl Candidate {
    /// Generation number parsed from a `genGG-NNN` id.  Baseline and
    /// sentinel ids belong to generation 0.
    pub fn generation(&self) -> Option<u32> {
        parse_generation(&self.id)
    }
}

/// Generation prefix of an id, if it has one.
pub fn parse_generation(id: &str) -> Option<u32> {
    let rest = id.strip_prefix("gen")?;
    let digits: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
    if digits.is_empty() {
        return None;
    }
    digits.parse().ok()
}

/// The candidate state machine's wire representation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Status {
    Pending,
    Running,
    Complete,
    Failed,
    FailedAiRetry,
    FailedParentMissing,
    FailedValidation,
    FailedRetry(u32),
    Skipped,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Status::Pending => write!(f, "pending"),
            Status::Running => write!(f, "running"),
            Status::Complete => write!(f, "complete"),
            Status::Failed => write!(f, "failed"),
            Status::FailedAiRetry => write!(f, "failed-ai-retry"),
            Status::FailedParentMissing => write!(f, "failed-parent-missing"),
            Status::FailedValidation => write!(f, "failed-validation"),
            Status::FailedRetry(n) => write!(f, "failed-retry{n}"),
            Status::Skipped => write!(f, "skipped"),
        }
    }
}

impl FromStr for Status {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "" | "pending" => Ok(Status::Pending),
            "running" => Ok(Status::Running),
            "complete" => Ok(Status::Complete),
            "failed" => Ok(Status::Failed),
            "failed-ai-retry" => Ok(Status::FailedAiRetry),
            "failed-parent-missing" => Ok(Status::FailedParentMissing),
            "failed-validation" => Ok(Status::FailedValidation),
            "skipped" => Ok(Status::Skipped),
            other => {
                if let Some(n) = other.strip_prefix("failed-retry") {
                    if let Ok(n) = n.parse() {
                        return Ok(Status::FailedRetry(n));
                    }
                }
                Err(())
            }
        }
    }
}

/// Strip surrounding whitespace and quotes from an id before comparison.
/// Hand-edited ledgers routinely carry `"gen01-003"` style cells.
pub fn clean_id(raw: &str) -> &str {
    raw.trim().trim_matches('"').trim()
}

/// Collapse embedded CR/LF/TAB into spaces and trim, lowercased for
/// predicate checks.  Shell-era tooling occasionally wrote newlines into
/// status cells.
pub fn normalize_status(raw: &str) -> String {
    raw.replace(['\r', '\n', '\t'], " ")
        .trim()
        .to_ascii_lowercase()
}

/// The single pending predicate shared by dispatcher and workers.
///
/// A status qualifies iff, after normalization, it is empty, `pending`,
/// `pending <garbage>` (corruption shim), or begins with `failed-retry`.
/// `running` is never pending: treating it as pending would let two workers
/// execute the same row.
pub fn is_pending_status(raw: &str) -> bool {
    let status = normalize_status(raw);
    status.is_empty()
        || status == "pending"
        || status.starts_with("pending ")
        || status.starts_with("failed-retry")
}

/// Whether the first whitespace-token of a normalized status is a status the
/// system ever writes.  Used both by corruption repair (rewrite
/// `<valid> <garbage>` to `<valid>`) and by stuck-reset (anything
/// unrecognized reverts to pending).
pub fn recognized_prefix(normalized: &str) -> Option<&str> {
    let first = normalized.split_whitespace().next().unwrap_or("");
    if first.is_empty() {
        return None;
    }
    if Status::from_str(first).is_ok() {
        return Some(first);
    }
    None
}
