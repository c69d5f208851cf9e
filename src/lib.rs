// Contact Reconciliation - Core Library
// Exposes all modules for use in the CLI and tests

pub mod config;
pub mod db;
pub mod error;
pub mod normalize;
pub mod parser;
pub mod pipeline;
pub mod reconciliation;
pub mod report;

// Re-export commonly used types
pub use config::ReconConfig;
pub use db::{
    LoadStats, SourceTable, Staged, StagedRecord,
    setup_database, load_source_a, load_source_b,
    count_source_a, count_source_b, clear_source_a, clear_source_b, get_staged,
};
pub use error::{ReconError, Result};
pub use normalize::{normalize_name, normalize_phone, NaturalKey};
pub use parser::{
    SourceParser, FormatProbe,
    SourceARecord, SourceBRecord, SourceFile, SourceKind, ParsedSource, ParsedRows, RowWarning,
    detect_format, parse_source,
    WorkbookParser, AdminExportParser,
};
pub use pipeline::{Pipeline, RunSummary, SourceSummary};
pub use reconciliation::{
    ReconciliationEngine, ReconciliationResult, MatchedPair, DuplicateGroup,
};
pub use report::{ReportEmitter, MAPPING_SHEET, DUPLICATE_A_SHEET, DUPLICATE_B_SHEET};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
