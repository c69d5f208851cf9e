// Reconciliation Engine - read-only queries over the staging tables
//
//   join:            source_a INNER JOIN source_b ON phone
//   duplicate ranks: per table, keys whose counter is non-zero, highest first
//
// Nothing here writes. Callers decide the transaction boundary.

use crate::db::{count_source_a, count_source_b, SourceTable, StagedRecord};
use crate::error::Result;
use crate::parser::{SourceARecord, SourceBRecord};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use tracing::info;

// ============================================================================
// RESULT TYPES
// ============================================================================

/// One Source A row and one Source B row sharing a normalized phone
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchedPair {
    pub a: SourceARecord,
    pub a_duplicate_count: i64,
    pub b: SourceBRecord,
    pub b_duplicate_count: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DuplicateGroup {
    pub full_name: String,
    pub phone: String,
    pub max_duplicate_count: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReconciliationResult {
    pub matches: Vec<MatchedPair>,
    pub duplicates_a: Vec<DuplicateGroup>,
    pub duplicates_b: Vec<DuplicateGroup>,
    pub staged_a: i64,
    pub staged_b: i64,
}

impl ReconciliationResult {
    /// Join only runs when both sides have staged rows
    pub fn join_ran(&self) -> bool {
        self.staged_a > 0 && self.staged_b > 0
    }

    pub fn summary(&self) -> String {
        format!(
            "{} matched pairs, {} duplicate keys in A, {} duplicate keys in B (staged A={}, B={})",
            self.matches.len(),
            self.duplicates_a.len(),
            self.duplicates_b.len(),
            self.staged_a,
            self.staged_b
        )
    }
}

// ============================================================================
// QUERIES
// ============================================================================

/// Inner join on phone; empty phones never match
pub fn join_sources(conn: &Connection) -> Result<Vec<MatchedPair>> {
    let a_cols: Vec<String> = SourceARecord::COLUMNS.iter().map(|c| format!("a.{}", c)).collect();
    let b_cols: Vec<String> = SourceBRecord::COLUMNS.iter().map(|c| format!("b.{}", c)).collect();

    let sql = format!(
        "SELECT {}, a.duplicate_count, {}, b.duplicate_count
         FROM {} a
         INNER JOIN {} b ON a.phone = b.phone
         WHERE a.phone <> ''
         ORDER BY a.id, b.id",
        a_cols.join(", "),
        b_cols.join(", "),
        SourceTable::A.name(),
        SourceTable::B.name()
    );

    let a_width = SourceARecord::COLUMNS.len();
    let b_offset = a_width + 1;
    let b_width = SourceBRecord::COLUMNS.len();

    let mut stmt = conn.prepare(&sql)?;
    let pairs = stmt
        .query_map([], |row| {
            Ok(MatchedPair {
                a: SourceARecord::from_row(row, 0)?,
                a_duplicate_count: row.get(a_width)?,
                b: SourceBRecord::from_row(row, b_offset)?,
                b_duplicate_count: row.get(b_offset + b_width)?,
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    Ok(pairs)
}

/// Keys with a non-zero counter, highest counter first
pub fn duplicate_ranks(conn: &Connection, table: SourceTable) -> Result<Vec<DuplicateGroup>> {
    let sql = format!(
        "SELECT full_name, phone, MAX(duplicate_count) AS max_count
         FROM {}
         GROUP BY full_name, phone
         HAVING MAX(duplicate_count) > 0
         ORDER BY max_count DESC, MIN(id) ASC",
        table.name()
    );

    let mut stmt = conn.prepare(&sql)?;
    let groups = stmt
        .query_map([], |row| {
            Ok(DuplicateGroup {
                full_name: row.get(0)?,
                phone: row.get(1)?,
                max_duplicate_count: row.get(2)?,
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    Ok(groups)
}

// ============================================================================
// ENGINE
// ============================================================================

pub struct ReconciliationEngine;

impl ReconciliationEngine {
    pub fn new() -> Self {
        ReconciliationEngine
    }

    /// Run all three queries against whatever is staged
    ///
    /// When either table is empty the join is skipped and the result holds
    /// zero matches; duplicate ranks are still computed for both sides.
    pub fn reconcile(&self, conn: &Connection) -> Result<ReconciliationResult> {
        let staged_a = count_source_a(conn)?;
        let staged_b = count_source_b(conn)?;

        let matches = if staged_a > 0 && staged_b > 0 {
            join_sources(conn)?
        } else {
            info!(
                "join skipped: staged A={}, B={}",
                staged_a, staged_b
            );
            Vec::new()
        };

        let result = ReconciliationResult {
            matches,
            duplicates_a: duplicate_ranks(conn, SourceTable::A)?,
            duplicates_b: duplicate_ranks(conn, SourceTable::B)?,
            staged_a,
            staged_b,
        };

        info!("reconciled: {}", result.summary());
        Ok(result)
    }
}

impl Default for ReconciliationEngine {
    fn default() -> Self {
        Self::new()
    }
}
