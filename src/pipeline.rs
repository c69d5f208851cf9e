// Reconciliation pipeline - ingest -> stage -> reconcile -> emit -> clear
//
// The staging tables are shared state, so every run holds a run slot: the
// in-process Mutex around the connection plus, for a file-backed store, an
// exclusive advisory lock on `<db>.lock`. A second caller arriving mid-run,
// from this process or another, gets Busy instead of interleaving.

use crate::config::ReconConfig;
use crate::db::{clear_source_a, clear_source_b, count_source_a, count_source_b, load_source_a, load_source_b, setup_database, LoadStats};
use crate::error::{ReconError, Result};
use crate::parser::{parse_source, ParsedSource, RowWarning, SourceFile, SourceKind};
use crate::reconciliation::ReconciliationEngine;
use crate::report::ReportEmitter;
use chrono::{DateTime, Utc};
use fs2::FileExt;
use rusqlite::{Connection, Transaction, TransactionBehavior};
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::ops::{Deref, DerefMut};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, TryLockError};
use tracing::{debug, info, warn};
use uuid::Uuid;

// ============================================================================
// RUN SUMMARY
// ============================================================================

/// What happened to one ingested file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceSummary {
    pub kind: SourceKind,
    pub file: PathBuf,
    pub sha256: String,
    pub rows_read: usize,
    pub rows_skipped: usize,
    pub load: LoadStats,
    pub warnings: Vec<RowWarning>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub sources: Vec<SourceSummary>,
    pub matched_pairs: usize,
    pub duplicate_groups_a: usize,
    pub duplicate_groups_b: usize,
    /// None while the counterpart export has not been staged yet
    pub report_path: Option<PathBuf>,
}

impl RunSummary {
    fn start() -> Self {
        RunSummary {
            run_id: Uuid::new_v4(),
            started_at: Utc::now(),
            sources: Vec::new(),
            matched_pairs: 0,
            duplicate_groups_a: 0,
            duplicate_groups_b: 0,
            report_path: None,
        }
    }

    pub fn total_warnings(&self) -> usize {
        self.sources.iter().map(|s| s.warnings.len()).sum()
    }

    pub fn summary(&self) -> String {
        match &self.report_path {
            Some(path) => format!(
                "run {}: {} matched pairs, {} + {} duplicate keys, {} row warnings, report {}",
                self.run_id,
                self.matched_pairs,
                self.duplicate_groups_a,
                self.duplicate_groups_b,
                self.total_warnings(),
                path.display()
            ),
            None => format!(
                "run {}: staged, waiting for the counterpart export ({} row warnings)",
                self.run_id,
                self.total_warnings()
            ),
        }
    }
}

// ============================================================================
// PIPELINE
// ============================================================================

pub struct Pipeline {
    /// Run slot: whoever holds the guard owns both staging tables
    conn: Mutex<Connection>,
    /// Store-wide slot shared by every handle on the same database file
    lock_path: Option<PathBuf>,
    engine: ReconciliationEngine,
    emitter: ReportEmitter,
}

/// Held for the length of one operation; both locks release on drop
struct RunSlot<'a> {
    conn: MutexGuard<'a, Connection>,
    _store_lock: Option<File>,
}

impl Deref for RunSlot<'_> {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        &self.conn
    }
}

impl DerefMut for RunSlot<'_> {
    fn deref_mut(&mut self) -> &mut Connection {
        &mut self.conn
    }
}

/// `<db>.lock` next to the database file
pub fn store_lock_path(database_path: &Path) -> PathBuf {
    let mut name = database_path.as_os_str().to_owned();
    name.push(".lock");
    PathBuf::from(name)
}

fn lock_store(path: &Path) -> Result<File> {
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)
        .map_err(|e| ReconError::io(path, e))?;

    match FileExt::try_lock_exclusive(&file) {
        Ok(()) => Ok(file),
        Err(e) if e.raw_os_error() == fs2::lock_contended_error().raw_os_error() => {
            debug!("store lock {} held by another run", path.display());
            Err(ReconError::Busy)
        }
        Err(e) => Err(ReconError::io(path, e)),
    }
}

impl Pipeline {
    /// Wrap an existing connection; creates the staging schema if needed
    pub fn new(conn: Connection, config: &ReconConfig) -> Result<Self> {
        setup_database(&conn)?;
        Ok(Pipeline {
            conn: Mutex::new(conn),
            lock_path: None,
            engine: ReconciliationEngine::new(),
            emitter: ReportEmitter::new(&config.output_dir, config.report_prefix.clone()),
        })
    }

    /// Open the staging database named in the config
    pub fn open(config: &ReconConfig) -> Result<Self> {
        let conn = Connection::open(&config.database_path)?;
        info!("staging store: {}", config.database_path.display());
        let mut pipeline = Self::new(conn, config)?;
        pipeline.lock_path = Some(store_lock_path(&config.database_path));
        Ok(pipeline)
    }

    fn acquire(&self) -> Result<RunSlot<'_>> {
        let conn = match self.conn.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::WouldBlock) => return Err(ReconError::Busy),
            // A panicked run left its transaction uncommitted; SQLite rolled it back
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
        };
        let store_lock = self.lock_path.as_deref().map(lock_store).transpose()?;

        Ok(RunSlot {
            conn,
            _store_lock: store_lock,
        })
    }

    /// Stage one export; emit the report once both sides are staged
    ///
    /// The other table is left untouched, so a spreadsheet upload followed
    /// by an admin-panel upload (or the reverse) completes one run.
    pub fn reconcile(&self, path: &Path) -> Result<RunSummary> {
        let mut conn = self.acquire()?;
        let mut summary = RunSummary::start();
        info!("run {}: reconciling {}", summary.run_id, path.display());

        let source = stage_file(&mut conn, path)?;
        summary.sources.push(source);

        let staged_a = count_source_a(&conn)?;
        let staged_b = count_source_b(&conn)?;
        if staged_a > 0 && staged_b > 0 {
            self.finish(&mut conn, &mut summary)?;
        } else {
            info!(
                "run {}: waiting for counterpart (staged A={}, B={})",
                summary.run_id, staged_a, staged_b
            );
        }

        Ok(summary)
    }

    /// Full run over one spreadsheet and one admin-panel export, any order
    ///
    /// Always emits a report; an empty side just yields zero matches.
    pub fn reconcile_pair(&self, first: &Path, second: &Path) -> Result<RunSummary> {
        let mut conn = self.acquire()?;
        let mut summary = RunSummary::start();
        info!(
            "run {}: reconciling pair {} + {}",
            summary.run_id,
            first.display(),
            second.display()
        );

        clear_all(&mut conn)?;

        let staged = stage_file(&mut conn, first).and_then(|a| {
            let b = stage_file(&mut conn, second)?;
            if a.kind == b.kind {
                return Err(ReconError::SameSourcePair(a.kind.name()));
            }
            Ok((a, b))
        });

        let (a, b) = match staged {
            Ok(pair) => pair,
            Err(e) => {
                // Leave nothing half-staged behind
                if let Err(clear_err) = clear_all(&mut conn) {
                    warn!("run {}: cleanup after failure failed: {}", summary.run_id, clear_err);
                }
                return Err(e);
            }
        };

        summary.sources.push(a);
        summary.sources.push(b);
        self.finish(&mut conn, &mut summary)?;

        Ok(summary)
    }

    /// Row counts of (source A, source B)
    pub fn staged_counts(&self) -> Result<(i64, i64)> {
        let conn = self.acquire()?;
        Ok((count_source_a(&conn)?, count_source_b(&conn)?))
    }

    /// Empty both staging tables
    pub fn clear(&self) -> Result<()> {
        let mut conn = self.acquire()?;
        clear_all(&mut conn)
    }

    /// Reconcile pass: query, emit, clear, all in one transaction
    ///
    /// If the report cannot be written the transaction is dropped and the
    /// staged rows stay in place for inspection. If the clear or commit
    /// fails after the report was written, the report is removed again.
    fn finish(&self, conn: &mut Connection, summary: &mut RunSummary) -> Result<()> {
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let result = self.engine.reconcile(&tx)?;
        debug!("run {}: {}", summary.run_id, result.summary());
        let report_path = self.emitter.emit(&result, summary.started_at)?;

        if let Err(e) = clear_and_commit(tx) {
            match fs::remove_file(&report_path) {
                Ok(()) => warn!(
                    "run {}: discarded {} after failed commit",
                    summary.run_id,
                    report_path.display()
                ),
                Err(rm) => warn!(
                    "run {}: orphaned report {} left behind: {}",
                    summary.run_id,
                    report_path.display(),
                    rm
                ),
            }
            return Err(e);
        }

        summary.matched_pairs = result.matches.len();
        summary.duplicate_groups_a = result.duplicates_a.len();
        summary.duplicate_groups_b = result.duplicates_b.len();
        summary.report_path = Some(report_path);

        info!("{}", summary.summary());
        Ok(())
    }
}

fn clear_and_commit(tx: Transaction<'_>) -> Result<()> {
    clear_source_a(&tx)?;
    clear_source_b(&tx)?;
    tx.commit()?;
    Ok(())
}

fn clear_all(conn: &mut Connection) -> Result<()> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    clear_source_a(&tx)?;
    clear_source_b(&tx)?;
    tx.commit()?;
    Ok(())
}

/// Read, detect, parse and load one export into its table
fn stage_file(conn: &mut Connection, path: &Path) -> Result<SourceSummary> {
    let file = SourceFile::read(path)?;
    let sha256 = file.sha256();
    let parsed = parse_source(&file)?;
    let kind = parsed.kind();

    let (rows_read, rows_skipped, load, warnings) = match parsed {
        ParsedSource::SourceA(rows) => {
            let load = load_source_a(conn, &rows.records)?;
            (rows.rows_read, rows.rows_skipped(), load, rows.warnings)
        }
        ParsedSource::SourceB(rows) => {
            let load = load_source_b(conn, &rows.records)?;
            (rows.rows_read, rows.rows_skipped(), load, rows.warnings)
        }
    };

    info!(
        "{} [{}]: {} rows read, {} skipped, {} warnings",
        path.display(),
        kind.code(),
        rows_read,
        rows_skipped,
        warnings.len()
    );

    Ok(SourceSummary {
        kind,
        file: path.to_path_buf(),
        sha256,
        rows_read,
        rows_skipped,
        load,
        warnings,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    const ADMIN_HTML: &str = "<html><table>\
        <tr><td>name</td><td>active</td></tr>\
        <tr><td>Form</td><td>Y</td><td>1</td><td>d</td><td>7</td><td>Jane</td><td>j@x</td>\
        <td>+7 900 000 00 00</td><td>/p</td><td>g</td><td>cpc</td><td>c</td><td>ad</td><td>t</td></tr>\
        </table></html>";

    fn test_pipeline(output_dir: &Path) -> Pipeline {
        let config = ReconConfig {
            output_dir: output_dir.to_path_buf(),
            ..ReconConfig::default()
        };
        Pipeline::new(Connection::open_in_memory().unwrap(), &config).unwrap()
    }

    #[test]
    fn test_concurrent_run_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = test_pipeline(dir.path());
        let admin = dir.path().join("admin.html");
        fs::write(&admin, ADMIN_HTML).unwrap();

        let held = pipeline.conn.lock().unwrap();
        let err = pipeline.reconcile(&admin).unwrap_err();
        assert!(matches!(err, ReconError::Busy));
        drop(held);

        let summary = pipeline.reconcile(&admin).unwrap();
        assert!(summary.report_path.is_none());
    }

    #[test]
    fn test_single_side_waits_for_counterpart() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = test_pipeline(dir.path());
        let admin = dir.path().join("admin.html");
        fs::write(&admin, ADMIN_HTML).unwrap();

        let summary = pipeline.reconcile(&admin).unwrap();

        assert!(summary.report_path.is_none());
        assert_eq!(summary.sources[0].kind, SourceKind::AdminPanel);
        assert_eq!(summary.sources[0].load.inserted, 1);
        assert_eq!(pipeline.staged_counts().unwrap(), (0, 1));
        assert!(summary.summary().contains("waiting"));
    }

    #[test]
    fn test_unsupported_file_leaves_tables_alone() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = test_pipeline(dir.path());
        let admin = dir.path().join("admin.html");
        let junk = dir.path().join("notes.txt");
        fs::write(&admin, ADMIN_HTML).unwrap();
        fs::write(&junk, "just some text").unwrap();

        pipeline.reconcile(&admin).unwrap();
        let err = pipeline.reconcile(&junk).unwrap_err();

        assert!(matches!(err, ReconError::UnsupportedFormat { .. }));
        assert_eq!(pipeline.staged_counts().unwrap(), (0, 1));
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = test_pipeline(dir.path());

        let err = pipeline.reconcile(&dir.path().join("absent.xlsx")).unwrap_err();
        assert!(matches!(err, ReconError::Io { .. }));
    }

    #[test]
    fn test_pair_of_same_kind_rejected_and_cleaned() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = test_pipeline(dir.path());
        let admin = dir.path().join("admin.html");
        fs::write(&admin, ADMIN_HTML).unwrap();

        let err = pipeline.reconcile_pair(&admin, &admin).unwrap_err();

        assert!(matches!(err, ReconError::SameSourcePair("admin panel")));
        assert_eq!(pipeline.staged_counts().unwrap(), (0, 0));
    }

    #[test]
    fn test_second_handle_on_same_store_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let config = ReconConfig {
            database_path: dir.path().join("pdb.sqlite"),
            output_dir: dir.path().join("uploads"),
            ..ReconConfig::default()
        };
        let admin = dir.path().join("admin.html");
        fs::write(&admin, ADMIN_HTML).unwrap();

        let first = Pipeline::open(&config).unwrap();
        let second = Pipeline::open(&config).unwrap();

        let held = first.acquire().unwrap();
        assert!(matches!(second.reconcile(&admin), Err(ReconError::Busy)));
        assert!(matches!(second.staged_counts(), Err(ReconError::Busy)));
        assert_eq!(count_source_b(&held).unwrap(), 0);
        drop(held);

        second.reconcile(&admin).unwrap();
        assert_eq!(first.staged_counts().unwrap(), (0, 1));
        assert!(store_lock_path(&config.database_path).exists());
    }

    #[test]
    fn test_failed_commit_discards_report() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("uploads");
        let pipeline = test_pipeline(&output);

        let admin = dir.path().join("admin.html");
        fs::write(&admin, ADMIN_HTML).unwrap();
        let contacts = dir.path().join("contacts.xlsx");
        let mut workbook = rust_xlsxwriter::Workbook::new();
        let sheet = workbook.add_worksheet();
        let rows = [
            ["#", "Date", "Name", "Email", "Phone"],
            ["1", "2024-03-01", "Jane", "j@x", "79000000000"],
        ];
        for (r, row) in rows.iter().enumerate() {
            for (c, value) in row.iter().enumerate() {
                sheet.write_string(r as u32, c as u16, *value).unwrap();
            }
        }
        workbook.save(&contacts).unwrap();

        pipeline.reconcile(&admin).unwrap();
        pipeline
            .conn
            .lock()
            .unwrap()
            .execute_batch(
                "CREATE TRIGGER keep_b BEFORE DELETE ON source_b
                 BEGIN SELECT RAISE(ABORT, 'source_b is pinned'); END;",
            )
            .unwrap();

        let err = pipeline.reconcile(&contacts).unwrap_err();

        assert!(matches!(err, ReconError::Persistence(_)));
        let leftovers: Vec<_> = fs::read_dir(&output).unwrap().collect();
        assert!(leftovers.is_empty());
        assert_eq!(pipeline.staged_counts().unwrap(), (1, 1));
    }

    #[test]
    fn test_clear_empties_both_tables() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = test_pipeline(dir.path());
        let admin = dir.path().join("admin.html");
        fs::write(&admin, ADMIN_HTML).unwrap();

        pipeline.reconcile(&admin).unwrap();
        pipeline.clear().unwrap();

        assert_eq!(pipeline.staged_counts().unwrap(), (0, 0));
    }
}
