// Report Emitter - three-sheet xlsx artifact
//
// Each sheet is described by an ordered list of (header, extractor) columns.
// Row 1 holds the headers, data starts at row 2 in query order.

use crate::error::{ReconError, Result};
use crate::reconciliation::{DuplicateGroup, MatchedPair, ReconciliationResult};
use chrono::{DateTime, Utc};
use rust_xlsxwriter::Workbook;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

pub const MAPPING_SHEET: &str = "Mapping";
pub const DUPLICATE_A_SHEET: &str = "Duplicate_excel";
pub const DUPLICATE_B_SHEET: &str = "Duplicate_admin";

// ============================================================================
// COLUMN MAPS
// ============================================================================

pub enum Extract<T> {
    Text(fn(&T) -> &str),
    Count(fn(&T) -> i64),
}

pub struct Column<T> {
    pub header: &'static str,
    pub extract: Extract<T>,
}

impl<T> Column<T> {
    pub const fn text(header: &'static str, get: fn(&T) -> &str) -> Self {
        Column {
            header,
            extract: Extract::Text(get),
        }
    }

    pub const fn count(header: &'static str, get: fn(&T) -> i64) -> Self {
        Column {
            header,
            extract: Extract::Count(get),
        }
    }
}

pub const MAPPING_COLUMNS: &[Column<MatchedPair>] = &[
    Column::text("a.fullName", |p| p.a.full_name.as_str()),
    Column::text("a.phone", |p| p.a.phone.as_str()),
    Column::text("a.email", |p| p.a.email.as_str()),
    Column::text("a.firstContactDate", |p| p.a.first_contact_date.as_str()),
    Column::text("a.status", |p| p.a.status.as_str()),
    Column::text("a.result", |p| p.a.result.as_str()),
    Column::text("a.comment", |p| p.a.comment.as_str()),
    Column::text("a.isOpen", |p| p.a.is_open.as_str()),
    Column::text("a.openDate", |p| p.a.open_date.as_str()),
    Column::count("a.duplicateCount", |p| p.a_duplicate_count),
    Column::text("b.fullName", |p| p.b.full_name.as_str()),
    Column::text("b.phone", |p| p.b.phone.as_str()),
    Column::text("b.email", |p| p.b.email.as_str()),
    Column::text("b.name", |p| p.b.name.as_str()),
    Column::text("b.modDate", |p| p.b.mod_date.as_str()),
    Column::text("b.page", |p| p.b.page.as_str()),
    Column::text("b.utmSource", |p| p.b.utm_source.as_str()),
    Column::text("b.utmMedium", |p| p.b.utm_medium.as_str()),
    Column::text("b.utmCampaign", |p| p.b.utm_campaign.as_str()),
    Column::text("b.utmContent", |p| p.b.utm_content.as_str()),
    Column::text("b.utmTerm", |p| p.b.utm_term.as_str()),
    Column::count("b.duplicateCount", |p| p.b_duplicate_count),
];

pub const DUPLICATE_COLUMNS: &[Column<DuplicateGroup>] = &[
    Column::text("fullName", |g| g.full_name.as_str()),
    Column::text("phone", |g| g.phone.as_str()),
    Column::count("count", |g| g.max_duplicate_count),
];

// ============================================================================
// CELL ADDRESSING
// ============================================================================

/// 0 -> "A", 25 -> "Z", 26 -> "AA"
pub fn column_letter(col: usize) -> String {
    let mut n = col + 1;
    let mut letters = Vec::new();
    while n > 0 {
        let rem = (n - 1) % 26;
        letters.push((b'A' + rem as u8) as char);
        n = (n - 1) / 26;
    }
    letters.iter().rev().collect()
}

/// Zero-based (col, row) -> "B7" style address
pub fn cell_address(col: usize, row: usize) -> String {
    format!("{}{}", column_letter(col), row + 1)
}

// ============================================================================
// EMITTER
// ============================================================================

fn write_sheet<T>(
    workbook: &mut Workbook,
    name: &str,
    columns: &[Column<T>],
    rows: &[T],
) -> Result<usize> {
    let sheet = workbook
        .add_worksheet()
        .set_name(name)
        .map_err(|e| ReconError::report(name, e))?;

    let at = |col: usize, row: usize| format!("{}!{}", name, cell_address(col, row));

    for (c, column) in columns.iter().enumerate() {
        sheet
            .write_string(0, c as u16, column.header)
            .map_err(|e| ReconError::report(at(c, 0), e))?;
    }

    for (r, item) in rows.iter().enumerate() {
        let row = r + 1;
        for (c, column) in columns.iter().enumerate() {
            let written = match &column.extract {
                Extract::Text(get) => sheet.write_string(row as u32, c as u16, get(item)),
                Extract::Count(get) => sheet.write_number(row as u32, c as u16, get(item) as f64),
            };
            written.map_err(|e| ReconError::report(at(c, row), e))?;
        }
    }

    debug!("{}: {} data rows", name, rows.len());
    Ok(rows.len())
}

/// `<dir>/<prefix>-<yyyymmddHHMMSS>.xlsx`, suffixed `-N` if already taken
pub fn fresh_report_path(dir: &Path, prefix: &str, at: DateTime<Utc>) -> PathBuf {
    let stem = format!("{}-{}", prefix, at.format("%Y%m%d%H%M%S"));
    let mut candidate = dir.join(format!("{}.xlsx", stem));
    let mut n = 1;
    while candidate.exists() {
        candidate = dir.join(format!("{}-{}.xlsx", stem, n));
        n += 1;
    }
    candidate
}

pub struct ReportEmitter {
    pub output_dir: PathBuf,
    pub prefix: String,
}

impl ReportEmitter {
    pub fn new(output_dir: impl Into<PathBuf>, prefix: impl Into<String>) -> Self {
        ReportEmitter {
            output_dir: output_dir.into(),
            prefix: prefix.into(),
        }
    }

    /// Write Mapping, Duplicate_excel and Duplicate_admin; return the artifact path
    pub fn emit(&self, result: &ReconciliationResult, at: DateTime<Utc>) -> Result<PathBuf> {
        fs::create_dir_all(&self.output_dir)
            .map_err(|e| ReconError::report(self.output_dir.display().to_string(), e))?;

        let mut workbook = Workbook::new();
        write_sheet(&mut workbook, MAPPING_SHEET, MAPPING_COLUMNS, &result.matches)?;
        write_sheet(&mut workbook, DUPLICATE_A_SHEET, DUPLICATE_COLUMNS, &result.duplicates_a)?;
        write_sheet(&mut workbook, DUPLICATE_B_SHEET, DUPLICATE_COLUMNS, &result.duplicates_b)?;

        let path = fresh_report_path(&self.output_dir, &self.prefix, at);
        workbook
            .save(&path)
            .map_err(|e| ReconError::report(path.display().to_string(), e))?;

        info!("report written to {}", path.display());
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::{SourceARecord, SourceBRecord};
    use calamine::{open_workbook_auto, Data, Reader};
    use chrono::TimeZone;

    fn sample_result() -> ReconciliationResult {
        let a = SourceARecord::from_fields(&[
            "1".to_string(),
            "2024-01-01".to_string(),
            "Jane Doe".to_string(),
            "jane@example.com".to_string(),
            "+7 900 000 00 00".to_string(),
            "new".to_string(),
        ]);
        let mut b_fields = vec![String::new(); 14];
        b_fields[0] = "Lead form".to_string();
        b_fields[5] = "Jane".to_string();
        b_fields[7] = "79000000000".to_string();
        b_fields[13] = "crm".to_string();

        ReconciliationResult {
            matches: vec![MatchedPair {
                a,
                a_duplicate_count: 2,
                b: SourceBRecord::from_fields(&b_fields),
                b_duplicate_count: 0,
            }],
            duplicates_a: vec![DuplicateGroup {
                full_name: "jane doe".to_string(),
                phone: "79000000000".to_string(),
                max_duplicate_count: 2,
            }],
            duplicates_b: Vec::new(),
            staged_a: 1,
            staged_b: 1,
        }
    }

    #[test]
    fn test_column_letters() {
        assert_eq!(column_letter(0), "A");
        assert_eq!(column_letter(21), "V");
        assert_eq!(column_letter(25), "Z");
        assert_eq!(column_letter(26), "AA");
        assert_eq!(column_letter(701), "ZZ");
        assert_eq!(cell_address(1, 6), "B7");
    }

    #[test]
    fn test_column_maps_have_fixed_widths() {
        assert_eq!(MAPPING_COLUMNS.len(), 22);
        assert_eq!(MAPPING_COLUMNS[9].header, "a.duplicateCount");
        assert_eq!(MAPPING_COLUMNS[21].header, "b.duplicateCount");

        let headers: Vec<&str> = DUPLICATE_COLUMNS.iter().map(|c| c.header).collect();
        assert_eq!(headers, vec!["fullName", "phone", "count"]);
    }

    #[test]
    fn test_fresh_path_avoids_collisions() {
        let dir = tempfile::tempdir().unwrap();
        let at = Utc.with_ymd_and_hms(2024, 5, 1, 8, 30, 0).unwrap();

        let first = fresh_report_path(dir.path(), "result", at);
        assert_eq!(first.file_name().unwrap(), "result-20240501083000.xlsx");

        fs::write(&first, b"taken").unwrap();
        let second = fresh_report_path(dir.path(), "result", at);
        assert_eq!(second.file_name().unwrap(), "result-20240501083000-1.xlsx");
    }

    #[test]
    fn test_emit_three_sheets_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let emitter = ReportEmitter::new(dir.path(), "result");

        let path = emitter.emit(&sample_result(), Utc::now()).unwrap();
        assert!(path.exists());

        let mut workbook = open_workbook_auto(&path).unwrap();
        assert_eq!(
            workbook.sheet_names(),
            vec![MAPPING_SHEET, DUPLICATE_A_SHEET, DUPLICATE_B_SHEET]
        );

        let mapping = workbook.worksheet_range(MAPPING_SHEET).unwrap();
        assert_eq!(mapping.get_size(), (2, 22));
        assert_eq!(mapping.get((0, 0)), Some(&Data::String("a.fullName".to_string())));
        assert_eq!(mapping.get((1, 0)), Some(&Data::String("jane doe".to_string())));
        assert_eq!(mapping.get((1, 1)), Some(&Data::String("79000000000".to_string())));
        assert_eq!(mapping.get((1, 9)), Some(&Data::Float(2.0)));
        assert_eq!(mapping.get((1, 13)), Some(&Data::String("Lead form".to_string())));
        assert_eq!(mapping.get((1, 20)), Some(&Data::String("crm".to_string())));

        let dup_a = workbook.worksheet_range(DUPLICATE_A_SHEET).unwrap();
        assert_eq!(dup_a.get_size(), (2, 3));
        assert_eq!(dup_a.get((1, 2)), Some(&Data::Float(2.0)));

        let dup_b = workbook.worksheet_range(DUPLICATE_B_SHEET).unwrap();
        assert_eq!(dup_b.get_size(), (1, 3));
    }

    #[test]
    fn test_unwritable_output_is_report_error() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("not-a-dir");
        fs::write(&blocker, b"file").unwrap();

        let emitter = ReportEmitter::new(blocker.join("reports"), "result");
        let err = emitter.emit(&sample_result(), Utc::now()).unwrap_err();

        assert!(matches!(err, ReconError::ReportWrite { .. }));
    }
}
