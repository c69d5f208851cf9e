// Staging Store - two SQLite tables, one per source
//
// Loading a batch replaces the table contents inside one transaction.
// Duplicate accounting is an explicit two-step: look the phone up, then
// either insert a fresh row or bump the existing row's duplicate_count.

use crate::error::Result;
use crate::normalize::NaturalKey;
use crate::parser::{SourceARecord, SourceBRecord};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row, TransactionBehavior};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

// ============================================================================
// TABLES
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SourceTable {
    A,
    B,
}

impl SourceTable {
    pub fn name(&self) -> &'static str {
        match self {
            SourceTable::A => "source_a",
            SourceTable::B => "source_b",
        }
    }
}

/// A record type that lives in one staging table
pub trait StagedRecord: Sized {
    const TABLE: SourceTable;

    /// Column names in positional order, excluding id and duplicate_count
    const COLUMNS: &'static [&'static str];

    fn values(&self) -> Vec<&str>;

    /// `(full_name, phone)`; only the phone drives the staging lookup
    fn natural_key(&self) -> NaturalKey;

    /// Read `COLUMNS.len()` text columns starting at `offset`
    fn from_row(row: &Row<'_>, offset: usize) -> rusqlite::Result<Self>;
}

impl StagedRecord for SourceARecord {
    const TABLE: SourceTable = SourceTable::A;
    const COLUMNS: &'static [&'static str] = &[
        "sequence_number",
        "first_contact_date",
        "full_name",
        "email",
        "phone",
        "status",
        "result",
        "comment",
        "is_open",
        "open_date",
    ];

    fn values(&self) -> Vec<&str> {
        vec![
            self.sequence_number.as_str(),
            self.first_contact_date.as_str(),
            self.full_name.as_str(),
            self.email.as_str(),
            self.phone.as_str(),
            self.status.as_str(),
            self.result.as_str(),
            self.comment.as_str(),
            self.is_open.as_str(),
            self.open_date.as_str(),
        ]
    }

    fn natural_key(&self) -> NaturalKey {
        SourceARecord::natural_key(self)
    }

    fn from_row(row: &Row<'_>, offset: usize) -> rusqlite::Result<Self> {
        Ok(SourceARecord {
            sequence_number: row.get(offset)?,
            first_contact_date: row.get(offset + 1)?,
            full_name: row.get(offset + 2)?,
            email: row.get(offset + 3)?,
            phone: row.get(offset + 4)?,
            status: row.get(offset + 5)?,
            result: row.get(offset + 6)?,
            comment: row.get(offset + 7)?,
            is_open: row.get(offset + 8)?,
            open_date: row.get(offset + 9)?,
        })
    }
}

impl StagedRecord for SourceBRecord {
    const TABLE: SourceTable = SourceTable::B;
    const COLUMNS: &'static [&'static str] = &[
        "name",
        "active",
        "sorting",
        "mod_date",
        "lead_id",
        "full_name",
        "email",
        "phone",
        "page",
        "utm_source",
        "utm_medium",
        "utm_campaign",
        "utm_content",
        "utm_term",
    ];

    fn values(&self) -> Vec<&str> {
        vec![
            self.name.as_str(),
            self.active.as_str(),
            self.sorting.as_str(),
            self.mod_date.as_str(),
            self.lead_id.as_str(),
            self.full_name.as_str(),
            self.email.as_str(),
            self.phone.as_str(),
            self.page.as_str(),
            self.utm_source.as_str(),
            self.utm_medium.as_str(),
            self.utm_campaign.as_str(),
            self.utm_content.as_str(),
            self.utm_term.as_str(),
        ]
    }

    fn natural_key(&self) -> NaturalKey {
        SourceBRecord::natural_key(self)
    }

    fn from_row(row: &Row<'_>, offset: usize) -> rusqlite::Result<Self> {
        Ok(SourceBRecord {
            name: row.get(offset)?,
            active: row.get(offset + 1)?,
            sorting: row.get(offset + 2)?,
            mod_date: row.get(offset + 3)?,
            lead_id: row.get(offset + 4)?,
            full_name: row.get(offset + 5)?,
            email: row.get(offset + 6)?,
            phone: row.get(offset + 7)?,
            page: row.get(offset + 8)?,
            utm_source: row.get(offset + 9)?,
            utm_medium: row.get(offset + 10)?,
            utm_campaign: row.get(offset + 11)?,
            utm_content: row.get(offset + 12)?,
            utm_term: row.get(offset + 13)?,
        })
    }
}

/// A record as stored, with its row id and duplicate counter
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Staged<T> {
    pub id: i64,
    pub record: T,
    pub duplicate_count: i64,
}

// ============================================================================
// SCHEMA
// ============================================================================

fn create_table_sql<T: StagedRecord>() -> String {
    let columns: Vec<String> = T::COLUMNS
        .iter()
        .map(|c| format!("{} TEXT NOT NULL DEFAULT ''", c))
        .collect();

    format!(
        "CREATE TABLE IF NOT EXISTS {} (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            {},
            duplicate_count INTEGER NOT NULL DEFAULT 0
        )",
        T::TABLE.name(),
        columns.join(",\n            ")
    )
}

pub fn setup_database(conn: &Connection) -> Result<()> {
    // WAL for crash recovery; in-memory databases answer "memory"
    let mode: String =
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
    debug!("journal_mode = {}", mode);

    conn.execute(&create_table_sql::<SourceARecord>(), [])?;
    conn.execute(&create_table_sql::<SourceBRecord>(), [])?;

    // Not UNIQUE: rows without a phone may repeat freely
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_source_a_phone ON source_a(phone)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_source_b_phone ON source_b(phone)",
        [],
    )?;

    Ok(())
}

// ============================================================================
// LOADING
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageOutcome {
    Inserted,
    /// Phone already staged; its duplicate_count went up by one
    Incremented,
}

/// Per-batch accounting, one entry per record attempted
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadStats {
    pub inserted: usize,
    pub incremented: usize,
    pub failed: usize,
}

/// Insert, or bump the counter of the row already holding this phone
pub fn stage_record<T: StagedRecord>(conn: &Connection, record: &T) -> rusqlite::Result<StageOutcome> {
    let table = T::TABLE.name();

    let key = record.natural_key();
    if key.is_countable() {
        let existing: Option<i64> = conn
            .query_row(
                &format!("SELECT id FROM {} WHERE phone = ?1 ORDER BY id LIMIT 1", table),
                params![key.phone],
                |row| row.get(0),
            )
            .optional()?;

        if let Some(id) = existing {
            conn.execute(
                &format!(
                    "UPDATE {} SET duplicate_count = duplicate_count + 1 WHERE id = ?1",
                    table
                ),
                params![id],
            )?;
            return Ok(StageOutcome::Incremented);
        }
    }

    let placeholders: Vec<String> = (1..=T::COLUMNS.len()).map(|i| format!("?{}", i)).collect();
    conn.execute(
        &format!(
            "INSERT INTO {} ({}) VALUES ({})",
            table,
            T::COLUMNS.join(", "),
            placeholders.join(", ")
        ),
        params_from_iter(record.values()),
    )?;

    Ok(StageOutcome::Inserted)
}

/// Replace a staging table's contents with `records`
///
/// One transaction: delete everything, then give every record its own
/// attempt. A failing row is logged and counted, the batch goes on.
pub fn load_records<T: StagedRecord>(conn: &mut Connection, records: &[T]) -> Result<LoadStats> {
    let table = T::TABLE.name();
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

    let removed = tx.execute(&format!("DELETE FROM {}", table), [])?;
    debug!("{}: removed {} previously staged rows", table, removed);

    let mut stats = LoadStats::default();
    for (idx, record) in records.iter().enumerate() {
        match stage_record(&tx, record) {
            Ok(StageOutcome::Inserted) => stats.inserted += 1,
            Ok(StageOutcome::Incremented) => stats.incremented += 1,
            Err(e) => {
                warn!("{}: record {} not staged: {}", table, idx + 1, e);
                stats.failed += 1;
            }
        }
    }

    tx.commit()?;

    info!(
        "{}: {} inserted, {} duplicates counted, {} failed",
        table, stats.inserted, stats.incremented, stats.failed
    );
    Ok(stats)
}

pub fn load_source_a(conn: &mut Connection, records: &[SourceARecord]) -> Result<LoadStats> {
    load_records(conn, records)
}

pub fn load_source_b(conn: &mut Connection, records: &[SourceBRecord]) -> Result<LoadStats> {
    load_records(conn, records)
}

// ============================================================================
// COUNTS / CLEANUP / INSPECTION
// ============================================================================

pub fn count_rows(conn: &Connection, table: SourceTable) -> Result<i64> {
    let count: i64 = conn.query_row(
        &format!("SELECT COUNT(id) FROM {}", table.name()),
        [],
        |row| row.get(0),
    )?;
    Ok(count)
}

pub fn count_source_a(conn: &Connection) -> Result<i64> {
    count_rows(conn, SourceTable::A)
}

pub fn count_source_b(conn: &Connection) -> Result<i64> {
    count_rows(conn, SourceTable::B)
}

pub fn clear_table(conn: &Connection, table: SourceTable) -> Result<usize> {
    let removed = conn.execute(&format!("DELETE FROM {}", table.name()), [])?;
    debug!("{}: cleared {} rows", table.name(), removed);
    Ok(removed)
}

pub fn clear_source_a(conn: &Connection) -> Result<usize> {
    clear_table(conn, SourceTable::A)
}

pub fn clear_source_b(conn: &Connection) -> Result<usize> {
    clear_table(conn, SourceTable::B)
}

/// All staged rows of one table, in insertion order
pub fn get_staged<T: StagedRecord>(conn: &Connection) -> Result<Vec<Staged<T>>> {
    let sql = format!(
        "SELECT id, {}, duplicate_count FROM {} ORDER BY id",
        T::COLUMNS.join(", "),
        T::TABLE.name()
    );
    let mut stmt = conn.prepare(&sql)?;

    let rows = stmt
        .query_map([], |row| {
            Ok(Staged {
                id: row.get(0)?,
                record: T::from_row(row, 1)?,
                duplicate_count: row.get(T::COLUMNS.len() + 1)?,
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_db() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        setup_database(&conn).unwrap();
        conn
    }

    fn contact(name: &str, phone: &str) -> SourceARecord {
        SourceARecord::from_fields(&[
            "1".to_string(),
            "2024-01-01".to_string(),
            name.to_string(),
            "mail@example.com".to_string(),
            phone.to_string(),
        ])
    }

    fn lead(name: &str, phone: &str) -> SourceBRecord {
        let mut fields = vec![String::new(); 14];
        fields[5] = name.to_string();
        fields[7] = phone.to_string();
        SourceBRecord::from_fields(&fields)
    }

    #[test]
    fn test_repeated_key_counts_extra_occurrences() {
        let mut conn = test_db();
        let jane = contact("Jane Doe", "79000000000");

        let stats = load_source_a(&mut conn, &[jane.clone(), jane.clone(), jane]).unwrap();

        assert_eq!(stats.inserted, 1);
        assert_eq!(stats.incremented, 2);
        assert_eq!(count_source_a(&conn).unwrap(), 1);

        let staged: Vec<Staged<SourceARecord>> = get_staged(&conn).unwrap();
        assert_eq!(staged[0].duplicate_count, 2);
        assert_eq!(staged[0].record.full_name, "jane doe");
    }

    #[test]
    fn test_rows_without_phone_never_count_as_duplicates() {
        let mut conn = test_db();
        let nobody = contact("Jane Doe", "   ");

        let stats = load_source_a(&mut conn, &[nobody.clone(), nobody]).unwrap();

        assert_eq!(stats.inserted, 2);
        assert_eq!(stats.incremented, 0);
        let staged: Vec<Staged<SourceARecord>> = get_staged(&conn).unwrap();
        assert!(staged.iter().all(|s| s.duplicate_count == 0));
    }

    #[test]
    fn test_load_replaces_previous_batch() {
        let mut conn = test_db();
        load_source_a(&mut conn, &[contact("a", "1"), contact("b", "2")]).unwrap();
        load_source_a(&mut conn, &[contact("c", "3")]).unwrap();

        assert_eq!(count_source_a(&conn).unwrap(), 1);
        let staged: Vec<Staged<SourceARecord>> = get_staged(&conn).unwrap();
        assert_eq!(staged[0].record.phone, "3");
    }

    #[test]
    fn test_tables_are_independent() {
        let mut conn = test_db();
        load_source_a(&mut conn, &[contact("a", "1")]).unwrap();
        load_source_b(&mut conn, &[lead("a", "1"), lead("b", "2")]).unwrap();

        assert_eq!(count_source_a(&conn).unwrap(), 1);
        assert_eq!(count_source_b(&conn).unwrap(), 2);

        assert_eq!(clear_source_b(&conn).unwrap(), 2);
        assert_eq!(count_source_a(&conn).unwrap(), 1);
        assert_eq!(count_source_b(&conn).unwrap(), 0);

        clear_source_a(&conn).unwrap();
        assert_eq!(count_source_a(&conn).unwrap(), 0);
    }

    #[test]
    fn test_failing_row_does_not_abort_batch() {
        let mut conn = test_db();
        conn.execute_batch(
            "CREATE TRIGGER reject_marked BEFORE INSERT ON source_a
             WHEN NEW.phone = '000'
             BEGIN SELECT RAISE(ABORT, 'rejected by test'); END;",
        )
        .unwrap();

        let stats = load_source_a(
            &mut conn,
            &[contact("a", "1"), contact("bad", "000"), contact("c", "3")],
        )
        .unwrap();

        assert_eq!(stats.inserted, 2);
        assert_eq!(stats.failed, 1);
        assert_eq!(count_source_a(&conn).unwrap(), 2);
    }

    #[test]
    fn test_round_trip_keeps_every_source_b_column() {
        let mut conn = test_db();
        let fields: Vec<String> = (0..14).map(|i| format!("v{}", i)).collect();
        let record = SourceBRecord::from_fields(&fields);

        load_source_b(&mut conn, &[record.clone()]).unwrap();

        let staged: Vec<Staged<SourceBRecord>> = get_staged(&conn).unwrap();
        assert_eq!(staged[0].record, record);
        assert_eq!(staged[0].duplicate_count, 0);
    }

    #[test]
    fn test_setup_is_idempotent() {
        let conn = test_db();
        setup_database(&conn).unwrap();
        assert_eq!(count_source_b(&conn).unwrap(), 0);
    }
}
