//! The evolution ledger: a locked, atomic tabular store of candidates.
//!
//! The on-disk format is a plain CSV file with a header row starting `id`
//! (case-insensitive).  Known columns occupy fixed positions when the header
//! is absent; with a header, positions are discovered from it and new
//! columns can be appended on demand.  The file stays bit-compatible with
//! hand editing: unknown columns are preserved verbatim and quoting follows
//! standard CSV.
//!
//! Dispatcher and workers share the file; every operation runs under the
//! sibling advisory lock and every write goes through a PID-suffixed temp
//! file renamed into place, so readers see either the old or the new
//! content, never a partial write.

mod candidate;
mod lock;

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, warn};

pub use candidate::{
    Candidate, Status, clean_id, is_pending_status, normalize_status, parse_generation,
    recognized_prefix,
};
pub use lock::lock_path;

use lock::LedgerLock;

/// Known columns, in their fixed header-less positions.
const COLUMNS: [&str; 7] = [
    "id",
    "based_on_id",
    "description",
    "performance",
    "status",
    "idea_llm",
    "run_llm",
];

const ID_COL: usize = 0;
const BASED_ON_COL: usize = 1;
const DESCRIPTION_COL: usize = 2;
const PERFORMANCE_COL: usize = 3;
const STATUS_COL: usize = 4;

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("failed to acquire ledger lock {path} within {timeout_secs}s")]
    LockTimeout { path: PathBuf, timeout_secs: u64 },
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Csv(#[from] csv::Error),
}

pub type Result<T> = std::result::Result<T, LedgerError>;

/// Counts reported by [`LedgerGuard::stats`]; `pending` uses the same
/// predicate workers claim with.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Stats {
    pub total: usize,
    pub pending: usize,
    pub complete: usize,
    pub failed: usize,
    pub running: usize,
}

/// Handle on a ledger file.  Cheap to clone around; the lock is only taken
/// while a [`LedgerGuard`] is alive.
#[derive(Debug, Clone)]
pub struct Ledger {
    csv_path: PathBuf,
    lock_timeout: Duration,
}

impl Ledger {
    pub fn new(csv_path: impl Into<PathBuf>, lock_timeout: Duration) -> Self {
        Self {
            csv_path: csv_path.into(),
            lock_timeout,
        }
    }

    pub fn path(&self) -> &Path {
        &self.csv_path
    }

    /// Acquire the advisory lock and return a guard exposing every
    /// operation.  Lock expiry is fatal to the caller.
    pub fn open(&self) -> Result<LedgerGuard> {
        let lock = LedgerLock::acquire(&self.csv_path, self.lock_timeout)?;
        Ok(LedgerGuard {
            csv_path: self.csv_path.clone(),
            _lock: lock,
        })
    }
}

/// In-memory snapshot of the file: optional header plus data rows.
#[derive(Debug, Default)]
struct Table {
    header: Option<Vec<String>>,
    rows: Vec<Vec<String>>,
}

impl Table {
    /// Column index for a known or header-declared name.
    fn column(&self, name: &str) -> Option<usize> {
        if let Some(header) = &self.header {
            return header
                .iter()
                .position(|h| h.trim().eq_ignore_ascii_case(name));
        }
        COLUMNS.iter().position(|c| c.eq_ignore_ascii_case(name))
    }

    /// Column index, adding the column to the header (padding every row)
    /// when absent.  Without a header only the fixed positions exist.
    fn column_or_add(&mut self, name: &str) -> Option<usize> {
        if let Some(idx) = self.column(name) {
            return Some(idx);
        }
        let header = self.header.as_mut()?;
        header.push(name.to_string());
        let width = header.len();
        for row in &mut self.rows {
            while row.len() < width {
                row.push(String::new());
            }
        }
        Some(width - 1)
    }

    fn status_col(&self) -> usize {
        self.column("status").unwrap_or(STATUS_COL)
    }
}

fn field(row: &[String], idx: usize) -> &str {
    row.get(idx).map(String::as_str).unwrap_or("")
}

fn set_cell(row: &mut Vec<String>, idx: usize, value: &str) {
    while row.len() <= idx {
        row.push(String::new());
    }
    row[idx] = value.to_string();
}

fn row_is_valid(row: &[String]) -> bool {
    !clean_id(field(row, ID_COL)).is_empty()
}

fn id_matches(row: &[String], id: &str) -> bool {
    row_is_valid(row) && clean_id(field(row, ID_COL)) == clean_id(id)
}

/// RAII guard over the locked ledger.  Dropping it releases the lock and
/// unlinks the lock file.
#[derive(Debug)]
pub struct LedgerGuard {
    csv_path: PathBuf,
    _lock: LedgerLock,
}

impl LedgerGuard {
    // ── raw I/O ─────────────────────────────────────────────────────────

    fn read(&self) -> Result<Table> {
        if !self.csv_path.exists() {
            return Ok(Table::default());
        }

        let mut reader = csv::ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .from_path(&self.csv_path)?;

        let mut rows: Vec<Vec<String>> = Vec::new();
        for record in reader.records() {
            let record = record?;
            rows.push(record.iter().map(str::to_string).collect());
        }

        let has_header = rows
            .first()
            .map(|first| clean_id(field(first, ID_COL)).eq_ignore_ascii_case("id"))
            .unwrap_or(false);
        let header = has_header.then(|| rows.remove(0));

        Ok(Table { header, rows })
    }

    /// Write through a PID-suffixed temp sibling and rename into place.
    fn write(&self, table: &Table) -> Result<()> {
        let name = self
            .csv_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "evolution.csv".to_string());
        let tmp = self
            .csv_path
            .with_file_name(format!("{name}.tmp.{}", std::process::id()));

        let result = (|| -> Result<()> {
            let mut writer = csv::WriterBuilder::new()
                .has_headers(false)
                .flexible(true)
                .from_path(&tmp)?;
            if let Some(header) = &table.header {
                writer.write_record(header)?;
            }
            for row in &table.rows {
                writer.write_record(row)?;
            }
            writer.flush()?;
            drop(writer);
            fs::rename(&tmp, &self.csv_path)?;
            Ok(())
        })();

        if result.is_err() {
            let _ = fs::remove_file(&tmp);
        }
        result
    }

    // ── claiming ────────────────────────────────────────────────────────

    /// Atomically select the *last* pending row, mark it `running`, and
    /// return `(id, prior_status)`.  Reverse iteration hands out the
    /// freshest pending item first.
    pub fn claim_next_pending(&self) -> Result<Option<(String, String)>> {
        let mut table = self.read()?;
        let scol = table.status_col();

        for i in (0..table.rows.len()).rev() {
            let row = &table.rows[i];
            if !row_is_valid(row) || !is_pending_status(field(row, scol)) {
                continue;
            }

            let id = clean_id(field(row, ID_COL)).to_string();
            let prior = field(row, scol).trim().to_string();
            set_cell(&mut table.rows[i], scol, &Status::Running.to_string());
            self.write(&table)?;
            return Ok(Some((id, prior)));
        }

        Ok(None)
    }

    /// All rows the pending predicate accepts, as `(id, raw_status)`.
    pub fn list_pending(&self) -> Result<Vec<(String, String)>> {
        let table = self.read()?;
        let scol = table.status_col();
        Ok(table
            .rows
            .iter()
            .filter(|row| row_is_valid(row) && is_pending_status(field(row, scol)))
            .map(|row| {
                (
                    clean_id(field(row, ID_COL)).to_string(),
                    field(row, scol).trim().to_string(),
                )
            })
            .collect())
    }

    // ── lookups ─────────────────────────────────────────────────────────

    pub fn get(&self, id: &str) -> Result<Option<Candidate>> {
        let table = self.read()?;
        Ok(table
            .rows
            .iter()
            .find(|row| id_matches(row, id))
            .map(|row| self.to_candidate(&table, row)))
    }

    pub fn all_candidates(&self) -> Result<Vec<Candidate>> {
        let table = self.read()?;
        Ok(table
            .rows
            .iter()
            .filter(|row| row_is_valid(row))
            .map(|row| self.to_candidate(&table, row))
            .collect())
    }

    fn to_candidate(&self, table: &Table, row: &[String]) -> Candidate {
        let col = |name: &str, fixed: usize| table.column(name).unwrap_or(fixed);
        Candidate {
            id: clean_id(field(row, col("id", ID_COL))).to_string(),
            based_on_id: field(row, col("based_on_id", BASED_ON_COL)).trim().to_string(),
            description: clean_id(field(row, col("description", DESCRIPTION_COL))).to_string(),
            performance: field(row, col("performance", PERFORMANCE_COL))
                .trim()
                .parse()
                .ok(),
            status: field(row, col("status", STATUS_COL)).trim().to_string(),
            idea_llm: field(row, col("idea_llm", 5)).trim().to_string(),
            run_llm: field(row, col("run_llm", 6)).trim().to_string(),
        }
    }

    pub fn all_descriptions(&self) -> Result<Vec<String>> {
        let table = self.read()?;
        let dcol = table.column("description").unwrap_or(DESCRIPTION_COL);
        Ok(table
            .rows
            .iter()
            .filter(|row| row_is_valid(row))
            .map(|row| clean_id(field(row, dcol)).to_string())
            .filter(|d| !d.is_empty())
            .collect())
    }

    // ── updates ─────────────────────────────────────────────────────────

    /// Set the status of every row with a matching id.  Fanning out keeps
    /// the update idempotent across the duplicate-guard window; more than
    /// one match is still worth a warning.
    pub fn set_status(&self, id: &str, status: &Status) -> Result<bool> {
        self.update_column(id, "status", STATUS_COL, &status.to_string())
    }

    pub fn set_performance(&self, id: &str, performance: f64) -> Result<bool> {
        self.update_column(id, "performance", PERFORMANCE_COL, &performance.to_string())
    }

    fn update_column(&self, id: &str, name: &str, fixed: usize, value: &str) -> Result<bool> {
        let mut table = self.read()?;
        let col = table.column(name).unwrap_or(fixed);

        let mut matched = 0;
        for row in &mut table.rows {
            if id_matches(row, id) {
                set_cell(row, col, value);
                matched += 1;
            }
        }

        if matched > 1 {
            warn!(id, column = name, matched, "update touched multiple rows");
        }
        if matched > 0 {
            self.write(&table)?;
        }
        Ok(matched > 0)
    }

    /// Update an arbitrary column, creating it (and padding every row) when
    /// the header does not yet carry it.  Without a header only the fixed
    /// columns can be addressed.
    pub fn set_field(&self, id: &str, name: &str, value: &str) -> Result<bool> {
        let mut table = self.read()?;
        let Some(col) = table.column_or_add(name) else {
            warn!(id, column = name, "cannot add column to headerless ledger");
            return Ok(false);
        };

        let mut matched = 0;
        for row in &mut table.rows {
            if id_matches(row, id) {
                set_cell(row, col, value);
                matched += 1;
            }
        }

        if matched > 1 {
            warn!(id, column = name, matched, "update touched multiple rows");
        }
        if matched > 0 {
            self.write(&table)?;
        }
        Ok(matched > 0)
    }

    /// Append candidates, creating the standard header first when the file
    /// has none.
    pub fn append(&self, candidates: &[Candidate]) -> Result<usize> {
        if candidates.is_empty() {
            return Ok(0);
        }

        let mut table = self.read()?;
        if table.header.is_none() {
            table.header = Some(COLUMNS.iter().map(|c| c.to_string()).collect());
        }
        let width = table.header.as_ref().map(Vec::len).unwrap_or(COLUMNS.len());

        for c in candidates {
            let mut row = vec![String::new(); width];
            let mut put = |name: &str, fixed: usize, value: &str| {
                let idx = table.column(name).unwrap_or(fixed);
                set_cell(&mut row, idx, value);
            };
            put("id", ID_COL, &c.id);
            put("based_on_id", BASED_ON_COL, &c.based_on_id);
            put("description", DESCRIPTION_COL, &c.description);
            let perf = c.performance.map(|p| p.to_string()).unwrap_or_default();
            put("performance", PERFORMANCE_COL, &perf);
            put("status", STATUS_COL, &c.status);
            put("idea_llm", 5, &c.idea_llm);
            put("run_llm", 6, &c.run_llm);
            table.rows.push(row);
        }

        self.write(&table)?;
        Ok(candidates.len())
    }

    /// Remove every row with a matching id.
    pub fn delete(&self, id: &str) -> Result<bool> {
        let mut table = self.read()?;
        let before = table.rows.len();
        table.rows.retain(|row| !id_matches(row, id));
        let deleted = table.rows.len() != before;
        if deleted {
            self.write(&table)?;
        }
        Ok(deleted)
    }

    // ── repair ──────────────────────────────────────────────────────────

    /// Keep the first occurrence of every id; later occurrences are
    /// corruption from crashed appends.  Idempotent.
    pub fn remove_duplicates(&self) -> Result<usize> {
        let mut table = self.read()?;
        let mut seen: Vec<String> = Vec::new();
        let mut removed = 0;

        table.rows.retain(|row| {
            if !row_is_valid(row) {
                return true;
            }
            let id = clean_id(field(row, ID_COL)).to_string();
            if seen.contains(&id) {
                warn!(id, "removing duplicate ledger row");
                removed += 1;
                false
            } else {
                seen.push(id);
                true
            }
        });

        if removed > 0 {
            self.write(&table)?;
        }
        Ok(removed)
    }

    /// Convert `running` rows (and anything unrecognized) back to
    /// `pending`.  Callers must ensure no workers are active: a live claim
    /// reset here would be executed twice.
    ///
    /// Recognition keys on the first token of the normalized status so a
    /// corrupted `complete <garbage>` cell is left for
    /// [`cleanup_corrupted_status`] rather than demoted to pending.
    pub fn reset_stuck(&self) -> Result<usize> {
        let mut table = self.read()?;
        let scol = table.status_col();
        let mut reset = 0;

        for row in &mut table.rows {
            if !row_is_valid(row) {
                continue;
            }
            let raw = field(row, scol);
            if is_pending_status(raw) {
                continue;
            }
            let normalized = normalize_status(raw);
            let stuck = match recognized_prefix(&normalized) {
                Some("running") => true,
                Some(_) => false,
                None => true,
            };
            if stuck {
                debug!(id = clean_id(field(row, ID_COL)), status = raw, "resetting stuck row");
                set_cell(row, scol, &Status::Pending.to_string());
                reset += 1;
            }
        }

        if reset > 0 {
            self.write(&table)?;
        }
        Ok(reset)
    }

    /// Rewrite statuses of the form `<valid> <garbage>` (or with stray
    /// casing/control characters) to the bare `<valid>` token.
    pub fn cleanup_corrupted_status(&self) -> Result<usize> {
        let mut table = self.read()?;
        let scol = table.status_col();
        let mut fixed = 0;

        for row in &mut table.rows {
            if !row_is_valid(row) {
                continue;
            }
            let raw = field(row, scol).to_string();
            if raw.is_empty() {
                continue;
            }
            let normalized = normalize_status(&raw);
            if let Some(token) = recognized_prefix(&normalized) {
                if raw != token {
                    set_cell(row, scol, token);
                    fixed += 1;
                }
            }
        }

        if fixed > 0 {
            self.write(&table)?;
        }
        Ok(fixed)
    }

    // ── reporting ───────────────────────────────────────────────────────

    pub fn stats(&self) -> Result<Stats> {
        let table = self.read()?;
        let scol = table.status_col();
        let mut stats = Stats::default();

        for row in &table.rows {
            if !row_is_valid(row) {
                continue;
            }
            stats.total += 1;
            let raw = field(row, scol);
            let normalized = normalize_status(raw);
            if is_pending_status(raw) {
                stats.pending += 1;
            } else if normalized == "running" {
                stats.running += 1;
            } else if normalized == "complete" {
                stats.complete += 1;
            } else if normalized.starts_with("failed") {
                stats.failed += 1;
            }
        }

        Ok(stats)
    }

    pub fn stats_per_generation(&self) -> Result<BTreeMap<u32, Stats>> {
        let table = self.read()?;
        let scol = table.status_col();
        let mut per_gen: BTreeMap<u32, Stats> = BTreeMap::new();

        for row in &table.rows {
            if !row_is_valid(row) {
                continue;
            }
            let gen = parse_generation(clean_id(field(row, ID_COL))).unwrap_or(0);
            let stats = per_gen.entry(gen).or_default();
            stats.total += 1;
            let raw = field(row, scol);
            let normalized = normalize_status(raw);
            if is_pending_status(raw) {
                stats.pending += 1;
            } else if normalized == "running" {
                stats.running += 1;
            } else if normalized == "complete" {
                stats.complete += 1;
            } else if normalized.starts_with("failed") {
                stats.failed += 1;
            }
        }

        Ok(per_gen)
    }

    /// Up to `n` complete candidates by descending performance.  With
    /// `with_novel`, additionally include every complete candidate from the
    /// two highest generations so ideation sees the newest lineage even
    /// when it has not broken into the top ranks yet.
    pub fn top_performers(&self, n: usize, with_novel: bool) -> Result<Vec<Candidate>> {
        let mut completes: Vec<Candidate> = self
            .all_candidates()?
            .into_iter()
            .filter(|c| normalize_status(&c.status) == "complete")
            .filter(|c| c.performance.map(f64::is_finite).unwrap_or(false))
            .collect();

        completes.sort_by(|a, b| {
            b.performance
                .partial_cmp(&a.performance)
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        let mut result: Vec<Candidate> = completes.iter().take(n).cloned().collect();

        if with_novel {
            let mut gens: Vec<u32> = completes.iter().filter_map(|c| c.generation()).collect();
            gens.sort_unstable();
            gens.dedup();
            let newest: Vec<u32> = gens.into_iter().rev().take(2).collect();

            for c in &completes {
                let in_newest = c.generation().map(|g| newest.contains(&g)).unwrap_or(false);
                if in_newest && !result.iter().any(|r| r.id == c.id) {
                    result.push(c.clone());
                }
            }
        }

        Ok(result)
    }

    /// Highest generation present in the ledger (0 when only baseline rows
    /// exist).
    pub fn highest_generation(&self) -> Result<u32> {
        Ok(self
            .all_candidates()?
            .iter()
            .filter_map(|c| c.generation())
            .max()
            .unwrap_or(0))
    }

    /// `k` fresh `genGG-NNN` ids conflicting with neither the ledger nor
    /// `claimed`.
    pub fn next_ids(&self, gen: u32, k: usize, claimed: &[String]) -> Result<Vec<String>> {
        let table = self.read()?;
        let prefix = format!("gen{gen:02}-");

        let mut taken: Vec<String> = table
            .rows
            .iter()
            .filter(|row| row_is_valid(row))
            .map(|row| clean_id(field(row, ID_COL)).to_string())
            .collect();
        taken.extend(claimed.iter().map(|id| clean_id(id).to_string()));

        let max_used = taken
            .iter()
            .filter_map(|id| id.strip_prefix(&prefix))
            .filter_map(|suffix| suffix.parse::<u32>().ok())
            .max()
            .unwrap_or(0);

        let mut ids = Vec::with_capacity(k);
        let mut next = max_used + 1;
        while ids.len() < k {
            let id = format!("{prefix}{next:03}");
            next += 1;
            if !taken.contains(&id) {
                ids.push(id);
            }
        }
        Ok(ids)
    }
}
