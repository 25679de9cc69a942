//! Spreadsheet reading + schema normalization into canonical contact batches.

use std::fmt;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};

use calamine::{open_workbook, Data, Reader, Sheets, Xls, Xlsx};
use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};

pub mod schema;

pub use schema::{
    assemble_batch, cell_text, extract_rows, map_columns, normalize_header, Batch, ColumnMapping,
    MappedColumn, SchemaError,
};

pub const CRATE_NAME: &str = "fwdb-adapters";

const OLE2_SIGNATURE: [u8; 8] = [0xD0, 0xCF, 0x11, 0xE0, 0xA1, 0xB1, 0x1A, 0xE1];

const ENCRYPTION_HINTS: [&str; 10] = [
    "password",
    "encrypted",
    "protected",
    "ole2",
    "compound document",
    "permission denied",
    "access denied",
    "locked",
    "security",
    "encryption",
];

#[derive(Debug, Error)]
pub enum ReadError {
    #[error("uploaded file is empty")]
    Empty,
    #[error("invalid file type '{0}'; upload .xlsx, .xls or .csv files")]
    UnsupportedType(String),
    #[error("file is encrypted or password-protected ({detail})")]
    Encrypted { detail: String },
    #[error("could not read spreadsheet with any reader: {detail}")]
    Unreadable { detail: String },
    #[error("workbook contains no sheets")]
    NoSheets,
    #[error("sheet '{0}' not found in workbook")]
    MissingSheet(String),
    #[error("reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl ReadError {
    /// Guidance shown next to the error in the UI.
    pub fn remedy(&self) -> Option<&'static str> {
        match self {
            ReadError::Encrypted { .. } => Some(
                "The workbook may be password-protected, saved in an internal Excel format, or carry permission restrictions.",
            ),
            ReadError::Unreadable { .. } => Some(
                "Open the file in Excel, use File > Save As > 'Excel Workbook (*.xlsx)', then upload the new file.",
            ),
            _ => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error(transparent)]
    Read(#[from] ReadError),
    #[error(transparent)]
    Schema(#[from] SchemaError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SpreadsheetKind {
    /// `.xlsx` / `.xlsm`
    Ooxml,
    /// `.xls`
    Legacy,
    Csv,
}

impl SpreadsheetKind {
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.trim().to_ascii_lowercase().as_str() {
            "xlsx" | "xlsm" => Some(SpreadsheetKind::Ooxml),
            "xls" => Some(SpreadsheetKind::Legacy),
            "csv" => Some(SpreadsheetKind::Csv),
            _ => None,
        }
    }

    fn engines(self) -> &'static [Engine] {
        match self {
            SpreadsheetKind::Ooxml => &[Engine::Ooxml, Engine::Biff],
            SpreadsheetKind::Legacy => &[Engine::Biff, Engine::Ooxml],
            SpreadsheetKind::Csv => &[Engine::Csv],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Engine {
    Ooxml,
    Biff,
    Csv,
}

/// Check name and size of an upload before touching its contents.
pub fn validate_file_format(file_name: &str, size: u64) -> Result<SpreadsheetKind, ReadError> {
    if size == 0 {
        return Err(ReadError::Empty);
    }
    let ext = Path::new(file_name)
        .extension()
        .map(|e| e.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_default();
    SpreadsheetKind::from_extension(&ext).ok_or(ReadError::UnsupportedType(ext))
}

#[derive(Debug, Clone, PartialEq)]
pub enum CellValue {
    Empty,
    Text(String),
    Int(i64),
    Float(f64),
    Bool(bool),
}

impl From<&Data> for CellValue {
    fn from(cell: &Data) -> Self {
        match cell {
            Data::Empty | Data::Error(_) => CellValue::Empty,
            Data::String(s) if s.is_empty() => CellValue::Empty,
            Data::String(s) => CellValue::Text(s.clone()),
            Data::Int(i) => CellValue::Int(*i),
            Data::Float(f) => CellValue::Float(*f),
            Data::Bool(b) => CellValue::Bool(*b),
            Data::DateTime(dt) => match dt.as_datetime() {
                Some(naive) => CellValue::Text(naive.to_string()),
                None => CellValue::Float(dt.as_f64()),
            },
            other => CellValue::Text(other.to_string()),
        }
    }
}

/// One sheet as read: header row plus data rows.
#[derive(Debug, Clone, PartialEq)]
pub struct RawTable {
    pub sheet: String,
    pub headers: Vec<String>,
    pub rows: Vec<Vec<CellValue>>,
}

impl RawTable {
    fn from_rows(sheet: &str, mut rows: Vec<Vec<CellValue>>) -> Self {
        let headers = if rows.is_empty() {
            Vec::new()
        } else {
            rows.remove(0)
                .iter()
                .map(|cell| schema::cell_text(Some(cell)).trim().to_string())
                .collect()
        };
        Self {
            sheet: sheet.to_string(),
            headers,
            rows,
        }
    }
}

enum SheetSource {
    Workbook(Sheets<BufReader<File>>),
    Csv(RawTable),
}

/// An opened spreadsheet file, ready for per-sheet reads.
pub struct Spreadsheet {
    path: PathBuf,
    kind: SpreadsheetKind,
    engine: Engine,
    sheet_names: Vec<String>,
    source: SheetSource,
}

impl fmt::Debug for Spreadsheet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Spreadsheet")
            .field("path", &self.path)
            .field("kind", &self.kind)
            .field("engine", &self.engine)
            .field("sheet_names", &self.sheet_names)
            .finish()
    }
}

impl Spreadsheet {
    pub fn sheet_names(&self) -> &[String] {
        &self.sheet_names
    }

    pub fn kind(&self) -> SpreadsheetKind {
        self.kind
    }

    pub fn engine(&self) -> Engine {
        self.engine
    }

    pub fn read_sheet(&mut self, name: &str) -> Result<RawTable, ReadError> {
        if !self.sheet_names.iter().any(|s| s == name) {
            return Err(ReadError::MissingSheet(name.to_string()));
        }
        match &mut self.source {
            SheetSource::Csv(table) => Ok(table.clone()),
            SheetSource::Workbook(book) => {
                let range = book
                    .worksheet_range(name)
                    .map_err(|e| ReadError::Unreadable {
                        detail: format!("sheet '{name}': {e}"),
                    })?;
                let rows = range
                    .rows()
                    .map(|row| row.iter().map(CellValue::from).collect())
                    .collect();
                Ok(RawTable::from_rows(name, rows))
            }
        }
    }
}

/// Open a spreadsheet, falling back across readers the way Excel files
/// saved with the wrong extension require.
pub fn open_spreadsheet(path: impl AsRef<Path>) -> Result<Spreadsheet, ReadError> {
    let path = path.as_ref();
    let size = std::fs::metadata(path)
        .map_err(|source| ReadError::Io {
            path: path.to_path_buf(),
            source,
        })?
        .len();
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let kind = validate_file_format(&name, size)?;

    let mut last_error = String::new();
    for &engine in kind.engines() {
        match open_with(path, engine) {
            Ok((sheet_names, source)) => {
                if sheet_names.is_empty() {
                    return Err(ReadError::NoSheets);
                }
                info!(path = %path.display(), ?engine, sheets = sheet_names.len(), "opened spreadsheet");
                return Ok(Spreadsheet {
                    path: path.to_path_buf(),
                    kind,
                    engine,
                    sheet_names,
                    source,
                });
            }
            Err(err) => {
                warn!(path = %path.display(), ?engine, error = %err, "spreadsheet reader failed");
                last_error = format!("{engine:?}: {err}");
            }
        }
    }

    if looks_encrypted(path, kind, &last_error) {
        Err(ReadError::Encrypted { detail: last_error })
    } else {
        Err(ReadError::Unreadable { detail: last_error })
    }
}

fn open_with(path: &Path, engine: Engine) -> Result<(Vec<String>, SheetSource), String> {
    let book = match engine {
        Engine::Ooxml => open_workbook::<Xlsx<BufReader<File>>, _>(path)
            .map(Sheets::Xlsx)
            .map_err(|e| e.to_string())?,
        Engine::Biff => open_workbook::<Xls<BufReader<File>>, _>(path)
            .map(Sheets::Xls)
            .map_err(|e| e.to_string())?,
        Engine::Csv => {
            let table = read_csv_table(path)?;
            return Ok((vec![table.sheet.clone()], SheetSource::Csv(table)));
        }
    };
    Ok((book.sheet_names(), SheetSource::Workbook(book)))
}

fn read_csv_table(path: &Path) -> Result<RawTable, String> {
    let sheet = path
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "csv".to_string());
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_path(path)
        .map_err(|e| e.to_string())?;

    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record.map_err(|e| e.to_string())?;
        rows.push(
            record
                .iter()
                .map(|field| {
                    let field = field.trim_start_matches('\u{feff}');
                    if field.is_empty() {
                        CellValue::Empty
                    } else {
                        CellValue::Text(field.to_string())
                    }
                })
                .collect(),
        );
    }
    Ok(RawTable::from_rows(&sheet, rows))
}

fn looks_encrypted(path: &Path, kind: SpreadsheetKind, last_error: &str) -> bool {
    let lower = last_error.to_lowercase();
    if ENCRYPTION_HINTS.iter().any(|hint| lower.contains(hint)) {
        return true;
    }
    // Protected OOXML workbooks are wrapped in an OLE2 container.
    kind == SpreadsheetKind::Ooxml && has_ole2_signature(path)
}

fn has_ole2_signature(path: &Path) -> bool {
    let mut magic = [0u8; 8];
    File::open(path)
        .and_then(|mut f| f.read_exact(&mut magic))
        .map(|_| magic == OLE2_SIGNATURE)
        .unwrap_or(false)
}

#[derive(Debug, Clone, Serialize)]
pub struct SheetSummary {
    pub name: String,
    pub rows: usize,
    pub renamed: Vec<(String, String)>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SheetFailure {
    pub name: String,
    pub error: String,
    pub missing: Vec<String>,
    pub hints: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct IngestReport {
    pub processed: Vec<SheetSummary>,
    pub failed: Vec<SheetFailure>,
    pub rows_read: usize,
    pub rows_in_batch: usize,
    pub collapsed_duplicates: usize,
    pub skipped_blank_email: usize,
}

#[derive(Debug, Clone)]
pub struct Ingested {
    pub batch: Batch,
    pub report: IngestReport,
}

/// Normalize the selected sheets (first sheet when none selected) into one
/// batch. Sheets failing validation are reported; if all fail, the first
/// failure is returned.
pub fn ingest_sheets(spreadsheet: &mut Spreadsheet, selected: &[String]) -> Result<Ingested, AdapterError> {
    let selected = if selected.is_empty() {
        spreadsheet.sheet_names().iter().take(1).cloned().collect::<Vec<_>>()
    } else {
        selected.to_vec()
    };
    if selected.is_empty() {
        return Err(ReadError::NoSheets.into());
    }

    let mut report = IngestReport::default();
    let mut records = Vec::new();
    let mut first_error: Option<AdapterError> = None;

    for sheet in &selected {
        let outcome = spreadsheet
            .read_sheet(sheet)
            .map_err(AdapterError::from)
            .and_then(|table| {
                let mapping = map_columns(sheet, &table.headers)?;
                Ok((extract_rows(&table, &mapping), mapping))
            });
        match outcome {
            Ok((rows, mapping)) => {
                report.processed.push(SheetSummary {
                    name: sheet.clone(),
                    rows: rows.len(),
                    renamed: mapping.renamed(),
                });
                records.extend(rows);
            }
            Err(err) => {
                warn!(sheet = %sheet, error = %err, "sheet rejected");
                let (missing, hints) = match &err {
                    AdapterError::Schema(schema) => (
                        schema.missing.iter().map(|c| c.as_str().to_string()).collect(),
                        schema.hints(),
                    ),
                    AdapterError::Read(_) => (Vec::new(), Vec::new()),
                };
                report.failed.push(SheetFailure {
                    name: sheet.clone(),
                    error: err.to_string(),
                    missing,
                    hints,
                });
                first_error.get_or_insert(err);
            }
        }
    }

    if report.processed.is_empty() {
        if let Some(err) = first_error {
            return Err(err);
        }
    }

    report.rows_read = records.len();
    let batch = assemble_batch(records);
    report.rows_in_batch = batch.len();
    report.collapsed_duplicates = batch.collapsed_duplicates;
    report.skipped_blank_email = batch.skipped_blank_email;
    Ok(Ingested { batch, report })
}

/// Open `path` and ingest the selected sheets in one step.
pub fn ingest_path(path: impl AsRef<Path>, selected: &[String]) -> Result<Ingested, AdapterError> {
    let mut spreadsheet = open_spreadsheet(path)?;
    ingest_sheets(&mut spreadsheet, selected)
}
