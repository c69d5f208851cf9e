// Format Detector & Row Parser
// Two source shapes: a spreadsheet workbook (Source A) and an HTML table
// exported from the admin panel (Source B).
//
// Detection is a signature probe on the leading bytes. A file whose
// signature says "workbook" but which cannot be opened as one is a
// MalformedSource error, never a fallback to the HTML parser.

use crate::error::{ReconError, Result};
use crate::normalize::{normalize_field, normalize_name, normalize_phone, NaturalKey};
use calamine::{open_workbook_auto_from_rs, Data, Reader};
use chrono::{Duration, NaiveDate};
use scraper::{Html, Selector};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

// ============================================================================
// CORE TYPES
// ============================================================================

/// Which of the two supported exports a file is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SourceKind {
    /// Source A: tabular export (xlsx / xls / ods workbook)
    Spreadsheet,
    /// Source B: HTML table dumped from the admin panel
    AdminPanel,
}

impl SourceKind {
    pub fn name(&self) -> &'static str {
        match self {
            SourceKind::Spreadsheet => "spreadsheet",
            SourceKind::AdminPanel => "admin panel",
        }
    }

    /// Short code used in logs and summaries
    pub fn code(&self) -> &'static str {
        match self {
            SourceKind::Spreadsheet => "A",
            SourceKind::AdminPanel => "B",
        }
    }
}

/// One row of the tabular export, normalized
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceARecord {
    pub sequence_number: String,
    pub first_contact_date: String,
    pub full_name: String,
    pub email: String,
    pub phone: String,
    pub status: String,
    pub result: String,
    pub comment: String,
    pub is_open: String,
    pub open_date: String,
}

impl SourceARecord {
    /// Positional fill: fields past the end of `fields` become empty strings
    pub fn from_fields(fields: &[String]) -> Self {
        let field = |i: usize| fields.get(i).map(|s| normalize_field(s)).unwrap_or_default();

        SourceARecord {
            sequence_number: field(0),
            first_contact_date: field(1),
            full_name: fields.get(2).map(|s| normalize_name(s)).unwrap_or_default(),
            email: field(3),
            phone: fields.get(4).map(|s| normalize_phone(s)).unwrap_or_default(),
            status: field(5),
            result: field(6),
            comment: field(7),
            is_open: field(8),
            open_date: field(9),
        }
    }

    pub fn natural_key(&self) -> NaturalKey {
        NaturalKey {
            full_name: self.full_name.clone(),
            phone: self.phone.clone(),
        }
    }
}

/// One row of the admin panel export, normalized
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceBRecord {
    pub name: String,
    pub active: String,
    pub sorting: String,
    pub mod_date: String,
    pub lead_id: String,
    pub full_name: String,
    pub email: String,
    pub phone: String,
    pub page: String,
    pub utm_source: String,
    pub utm_medium: String,
    pub utm_campaign: String,
    pub utm_content: String,
    pub utm_term: String,
}

impl SourceBRecord {
    pub fn from_fields(fields: &[String]) -> Self {
        let field = |i: usize| fields.get(i).map(|s| normalize_field(s)).unwrap_or_default();

        SourceBRecord {
            name: field(0),
            active: field(1),
            sorting: field(2),
            mod_date: field(3),
            lead_id: field(4),
            full_name: fields.get(5).map(|s| normalize_name(s)).unwrap_or_default(),
            email: field(6),
            phone: fields.get(7).map(|s| normalize_phone(s)).unwrap_or_default(),
            page: field(8),
            utm_source: field(9),
            utm_medium: field(10),
            utm_campaign: field(11),
            utm_content: field(12),
            utm_term: field(13),
        }
    }

    pub fn natural_key(&self) -> NaturalKey {
        NaturalKey {
            full_name: self.full_name.clone(),
            phone: self.phone.clone(),
        }
    }
}

/// A row that was too narrow (or too wide) to map cleanly
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowWarning {
    /// 1-based row number in the source, header included
    pub row: usize,
    pub width: usize,
    pub reason: String,
    /// false when the row was still staged best-effort
    pub skipped: bool,
}

/// Parser output: normalized records plus per-row outcomes
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedRows<T> {
    pub records: Vec<T>,
    /// Data rows seen, header excluded
    pub rows_read: usize,
    pub warnings: Vec<RowWarning>,
}

impl<T> ParsedRows<T> {
    fn new() -> Self {
        ParsedRows {
            records: Vec::new(),
            rows_read: 0,
            warnings: Vec::new(),
        }
    }

    pub fn rows_skipped(&self) -> usize {
        self.warnings.iter().filter(|w| w.skipped).count()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ParsedSource {
    SourceA(ParsedRows<SourceARecord>),
    SourceB(ParsedRows<SourceBRecord>),
}

impl ParsedSource {
    pub fn kind(&self) -> SourceKind {
        match self {
            ParsedSource::SourceA(_) => SourceKind::Spreadsheet,
            ParsedSource::SourceB(_) => SourceKind::AdminPanel,
        }
    }
}

/// Raw bytes of an uploaded export, read once
#[derive(Debug, Clone)]
pub struct SourceFile {
    pub path: PathBuf,
    pub bytes: Vec<u8>,
}

impl SourceFile {
    pub fn read(path: &Path) -> Result<Self> {
        let bytes = fs::read(path).map_err(|e| ReconError::io(path, e))?;
        Ok(SourceFile {
            path: path.to_path_buf(),
            bytes,
        })
    }

    /// Hex SHA-256 of the file contents, for run provenance
    pub fn sha256(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(&self.bytes);
        format!("{:x}", hasher.finalize())
    }
}

// ============================================================================
// TRAITS
// ============================================================================

/// Parses one source shape into normalized records
pub trait SourceParser {
    type Record;

    fn parse(&self, file: &SourceFile) -> Result<ParsedRows<Self::Record>>;

    fn kind(&self) -> SourceKind;
}

/// Cheap capability check on the leading bytes of a file
pub trait FormatProbe {
    fn matches(&self, head: &[u8]) -> bool;
}

// ============================================================================
// FORMAT DETECTION
// ============================================================================

const ZIP_MAGIC: &[u8] = b"PK\x03\x04";
const CFB_MAGIC: &[u8] = &[0xD0, 0xCF, 0x11, 0xE0, 0xA1, 0xB1, 0x1A, 0xE1];
const UTF8_BOM: &[u8] = &[0xEF, 0xBB, 0xBF];

/// Decide the source shape from its signature
pub fn detect_format(file: &SourceFile) -> Result<SourceKind> {
    let head = &file.bytes[..file.bytes.len().min(1024)];

    let kind = if WorkbookParser.matches(head) {
        SourceKind::Spreadsheet
    } else if AdminExportParser.matches(head) {
        SourceKind::AdminPanel
    } else {
        return Err(ReconError::UnsupportedFormat {
            path: file.path.clone(),
        });
    };

    debug!("{} detected as {}", file.path.display(), kind.name());
    Ok(kind)
}

/// Detect, then run the matching parser
pub fn parse_source(file: &SourceFile) -> Result<ParsedSource> {
    match detect_format(file)? {
        SourceKind::Spreadsheet => WorkbookParser.parse(file).map(ParsedSource::SourceA),
        SourceKind::AdminPanel => AdminExportParser.parse(file).map(ParsedSource::SourceB),
    }
}

// ============================================================================
// SOURCE A: WORKBOOK
// ============================================================================

/// Widest Source A row; narrower rows are zero-filled down to the minimum
pub const SOURCE_A_WIDTH: usize = 10;
pub const SOURCE_A_MIN_WIDTH: usize = 5;

pub struct WorkbookParser;

impl FormatProbe for WorkbookParser {
    fn matches(&self, head: &[u8]) -> bool {
        head.starts_with(ZIP_MAGIC) || head.starts_with(CFB_MAGIC)
    }
}

impl SourceParser for WorkbookParser {
    type Record = SourceARecord;

    fn parse(&self, file: &SourceFile) -> Result<ParsedRows<SourceARecord>> {
        let malformed = |reason: String| ReconError::MalformedSource {
            format: "workbook",
            path: file.path.clone(),
            reason,
        };

        let mut workbook = open_workbook_auto_from_rs(Cursor::new(file.bytes.clone()))
            .map_err(|e| malformed(e.to_string()))?;

        let sheet_names = workbook.sheet_names();
        let first_sheet = sheet_names
            .first()
            .cloned()
            .ok_or_else(|| malformed("workbook contains no sheets".to_string()))?;
        info!(
            "'{}' is first sheet of {} sheets in {}",
            first_sheet,
            sheet_names.len(),
            file.path.display()
        );

        let range = workbook
            .worksheet_range(&first_sheet)
            .map_err(|e| malformed(format!("sheet '{}': {}", first_sheet, e)))?;

        // Ranges start at the first used cell; pad back to column A
        let (first_row, first_col) = range.start().unwrap_or((0, 0));
        let rows: Vec<Vec<String>> = range
            .rows()
            .map(|cells| {
                let mut row = vec![String::new(); first_col as usize];
                row.extend(cells.iter().map(cell_text));
                trim_trailing_empty(&mut row);
                row
            })
            .collect();

        info!("'{}' total rows in spreadsheet", rows.len());

        let mut parsed = ParsedRows::new();
        for (idx, row) in rows.iter().enumerate().skip(1) {
            let row_number = first_row as usize + idx + 1;
            let width = row.len();

            if width == 0 {
                debug!("row {}: blank, ignored", row_number);
                continue;
            }
            parsed.rows_read += 1;

            if (SOURCE_A_MIN_WIDTH..=SOURCE_A_WIDTH).contains(&width) {
                parsed.records.push(SourceARecord::from_fields(row));
            } else {
                warn!("invalid row {}: width {} in {:?}", row_number, width, row);
                parsed.warnings.push(RowWarning {
                    row: row_number,
                    width,
                    reason: format!(
                        "expected {} to {} fields, found {}",
                        SOURCE_A_MIN_WIDTH, SOURCE_A_WIDTH, width
                    ),
                    skipped: true,
                });
            }
        }

        Ok(parsed)
    }

    fn kind(&self) -> SourceKind {
        SourceKind::Spreadsheet
    }
}

/// Render a cell the way the spreadsheet displays it
fn cell_text(cell: &Data) -> String {
    match cell {
        Data::Empty => String::new(),
        Data::String(s) => s.clone(),
        // Phones typed as numbers must not grow a ".0"
        Data::Float(n) => {
            if n.fract() == 0.0 && n.abs() < 1e15 {
                format!("{}", *n as i64)
            } else {
                format!("{}", n)
            }
        }
        Data::Int(n) => n.to_string(),
        Data::Bool(b) => (if *b { "TRUE" } else { "FALSE" }).to_string(),
        Data::Error(e) => format!("#{:?}", e),
        Data::DateTime(dt) => excel_serial_to_text(dt.as_f64()),
        Data::DateTimeIso(s) => s.clone(),
        Data::DurationIso(s) => s.clone(),
    }
}

/// 1900 date system serial -> ISO date (with time when present)
fn excel_serial_to_text(serial: f64) -> String {
    let Some(epoch) = NaiveDate::from_ymd_opt(1899, 12, 30) else {
        return serial.to_string();
    };
    let seconds = (serial * 86_400.0).round() as i64;
    let Some(moment) = epoch
        .and_hms_opt(0, 0, 0)
        .and_then(|start| start.checked_add_signed(Duration::seconds(seconds)))
    else {
        return serial.to_string();
    };

    if seconds % 86_400 == 0 {
        moment.format("%Y-%m-%d").to_string()
    } else {
        moment.format("%Y-%m-%d %H:%M:%S").to_string()
    }
}

fn trim_trailing_empty(row: &mut Vec<String>) {
    while row.last().is_some_and(|s| s.is_empty()) {
        row.pop();
    }
}

// ============================================================================
// SOURCE B: ADMIN PANEL HTML
// ============================================================================

pub const SOURCE_B_WIDTH: usize = 14;
/// Narrower rows are flagged but still staged best-effort
pub const SOURCE_B_MIN_WIDTH: usize = 12;

pub struct AdminExportParser;

impl FormatProbe for AdminExportParser {
    fn matches(&self, head: &[u8]) -> bool {
        let head = head.strip_prefix(UTF8_BOM).unwrap_or(head);
        let start = head.iter().position(|b| !b.is_ascii_whitespace());

        match start {
            Some(i) if head[i] == b'<' => head
                .get(i + 1)
                .is_some_and(|b| b.is_ascii_alphabetic() || *b == b'!' || *b == b'?'),
            _ => false,
        }
    }
}

impl SourceParser for AdminExportParser {
    type Record = SourceBRecord;

    fn parse(&self, file: &SourceFile) -> Result<ParsedRows<SourceBRecord>> {
        let text = String::from_utf8_lossy(&file.bytes);
        let table = extract_table_rows(&text).map_err(|reason| ReconError::MalformedSource {
            format: "html",
            path: file.path.clone(),
            reason,
        })?;

        info!("'{}' total rows in admin panel export", table.len());

        let mut parsed = ParsedRows::new();
        for (idx, row) in table.iter().enumerate().skip(1) {
            let row_number = idx + 1;
            let width = row.len();
            parsed.rows_read += 1;

            if width < SOURCE_B_MIN_WIDTH {
                warn!("invalid row {}: width {} in {:?}", row_number, width, row);
                parsed.warnings.push(RowWarning {
                    row: row_number,
                    width,
                    reason: format!(
                        "expected at least {} fields, found {}; missing fields left empty",
                        SOURCE_B_MIN_WIDTH, width
                    ),
                    skipped: false,
                });
            }

            parsed.records.push(SourceBRecord::from_fields(row));
        }

        Ok(parsed)
    }

    fn kind(&self) -> SourceKind {
        SourceKind::AdminPanel
    }
}

/// Every `<tr>` with at least one cell, as whitespace-collapsed cell texts
///
/// Tree building drops `<tr>`/`<td>` tags outside a table, so a bare row
/// dump is parsed again inside a `<table>` wrapper. No rows at all is an error.
fn extract_table_rows(html: &str) -> std::result::Result<Vec<Vec<String>>, String> {
    let table_sel = Selector::parse("table").map_err(|e| e.to_string())?;
    let row_sel = Selector::parse("tr").map_err(|e| e.to_string())?;
    let cell_sel = Selector::parse("td, th").map_err(|e| e.to_string())?;

    let mut document = Html::parse_document(html);
    if document.select(&table_sel).next().is_none() {
        debug!("no <table> element, reading rows as a bare table body");
        document = Html::parse_document(&format!("<table>{}</table>", html));
    }

    let rows: Vec<Vec<String>> = document
        .select(&row_sel)
        .map(|tr| {
            tr.select(&cell_sel)
                .map(|cell| {
                    let text = cell.text().collect::<String>();
                    text.split_whitespace().collect::<Vec<_>>().join(" ")
                })
                .collect::<Vec<_>>()
        })
        .filter(|cells| !cells.is_empty())
        .collect();

    if rows.is_empty() {
        return Err("no table rows found".to_string());
    }
    Ok(rows)
}
