/// Records per batch file produced by the splitter
pub const DEFAULT_BATCH_SIZE: usize = 10_000;

/// In-memory entities (products + reviews + category paths) a parser holds before flushing a chunk
pub const DEFAULT_FLUSH_THRESHOLD: usize = 50_000;

/// Decimal places kept for derived statistics
pub const STAT_PRECISION: u32 = 4;

/// Bump when the on-disk layout of intermediate artifacts changes
pub const ARTIFACT_VERSION: u32 = 1;

/// Extension of batch files written by the splitter
pub const BATCH_EXTENSION: &str = "txt";

/// Separator between levels of a category path
pub const CATEGORY_SEPARATOR: char = '|';

/// Array delimiter understood by neo4j-admin for `string[]` columns
pub const ARRAY_DELIMITER: &str = ";";

/// Field delimiter for export files
pub const EXPORT_DELIMITER: u8 = b'\t';

pub const LEDGER_FILE: &str = "ledger.log";

/// Bytes read per step when scanning the ledger backwards
pub const LEDGER_SCAN_CHUNK: usize = 4096;

/// Written into an export directory once every dataset has been exported
pub const COMPLETION_MARKER: &str = "_SUCCESS";

pub const RUN_REPORT_FILE: &str = "run_report.json";

/// Progress update interval (tick every N records)
pub const PROGRESS_INTERVAL: u64 = 1000;
