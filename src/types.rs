use std::fmt;

use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use serde::{Deserialize, Serialize};

/// Number of leading records kept from every source file
pub const MAX_ROWS: usize = 500;

/// Stem shared by every produced file name
pub const OUTPUT_STEM: &str = "first_500_rows";

/// Longest variable or member name a v5 transport file can hold
pub const MAX_TRANSPORT_NAME_LEN: usize = 8;

/// Longest variable or dataset label a v5 transport file can hold
pub const MAX_TRANSPORT_LABEL_LEN: usize = 40;

/// Longest character variable a v5 transport file can hold
pub const MAX_TRANSPORT_CHAR_LEN: usize = 200;

/// The namestr header stores the variable count in four digits
pub const MAX_TRANSPORT_VARIABLES: usize = 9999;

/// Supported file formats
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileFormat {
    Csv,
    Xpt,
    Sas7bdat,
}

impl FileFormat {
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_lowercase().as_str() {
            "csv" => Some(FileFormat::Csv),
            "xpt" => Some(FileFormat::Xpt),
            "sas7bdat" => Some(FileFormat::Sas7bdat),
            _ => None,
        }
    }

    /// Extension used when naming produced files
    pub fn extension(self) -> &'static str {
        match self {
            FileFormat::Csv => "csv",
            FileFormat::Xpt => "xpt",
            FileFormat::Sas7bdat => "sas7bdat",
        }
    }

    /// Human-readable name shown in the preview heading and buttons
    pub fn label(self) -> &'static str {
        match self {
            FileFormat::Csv => "CSV",
            FileFormat::Xpt => "SAS XPT",
            FileFormat::Sas7bdat => "SAS7BDAT",
        }
    }

    pub fn mime_type(self) -> &'static str {
        match self {
            FileFormat::Csv => "text/csv",
            FileFormat::Xpt => "application/x-sas-xport",
            FileFormat::Sas7bdat => "application/x-sas-data",
        }
    }

    pub fn all_extensions() -> &'static [&'static str] {
        &["csv", "xpt", "sas7bdat"]
    }
}

impl fmt::Display for FileFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Which SAS decoding backend handles SAS7BDAT sources.
///
/// Both backends decode the same rows. They differ in whether the column
/// descriptors of a SAS7BDAT file are kept, which decides whether an XPT
/// artifact can be offered for it.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "kebab-case")]
pub enum SasBackend {
    /// Keep column names, labels, formats and lengths
    #[default]
    WithMetadata,
    /// Keep the rows only
    DataOnly,
}

impl SasBackend {
    /// Whether decoding `format` with this backend yields `FormatMetadata`
    pub fn captures_metadata(self, format: FileFormat) -> bool {
        match format {
            FileFormat::Csv => false,
            FileFormat::Xpt => true,
            FileFormat::Sas7bdat => self == SasBackend::WithMetadata,
        }
    }
}

/// A single cell
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Number(f64),
    String(String),
    /// Numeric SAS cell whose display format marks it as a calendar value
    Date(NaiveDate),
    DateTime(NaiveDateTime),
    Time(NaiveTime),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Text form used for CSV output and previews. Nulls render empty.
    pub fn to_text(&self) -> String {
        match self {
            Value::Null => String::new(),
            Value::Number(n) => n.to_string(),
            Value::String(s) => s.clone(),
            Value::Date(d) => d.to_string(),
            Value::DateTime(dt) => dt.to_string(),
            Value::Time(t) => t.to_string(),
        }
    }
}

/// In-memory table with a fixed column set
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Dataset {
    columns: Vec<String>,
    rows: Vec<Vec<Value>>,
}

impl Dataset {
    pub fn new(columns: Vec<String>) -> Self {
        Self {
            columns,
            rows: Vec::new(),
        }
    }

    /// Append a row. Fails if the row width differs from the column count.
    pub fn push_row(&mut self, row: Vec<Value>) -> Result<()> {
        if row.len() != self.columns.len() {
            return Err(crate::error::Error::InvalidInput(format!(
                "row has {} values but the dataset has {} columns",
                row.len(),
                self.columns.len()
            )));
        }
        self.rows.push(row);
        Ok(())
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn rows(&self) -> &[Vec<Value>] {
        &self.rows
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    pub fn column_count(&self) -> usize {
        self.columns.len()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    /// Look up a cell by row number and column name
    pub fn value(&self, row: usize, column: &str) -> Option<&Value> {
        let index = self.column_index(column)?;
        self.rows.get(row).and_then(|r| r.get(index))
    }

    /// Drop every row past `limit`
    pub fn truncate(&mut self, limit: usize) {
        self.rows.truncate(limit);
    }
}

/// Storage class of a SAS variable
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnKind {
    Numeric,
    Character,
}

/// A SAS display format or informat such as `DATE9.` or `BEST12.2`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DisplayFormat {
    pub name: String,
    pub width: u16,
    pub decimals: u16,
}

impl DisplayFormat {
    pub fn new(name: impl Into<String>, width: u16, decimals: u16) -> Self {
        Self {
            name: name.into(),
            width,
            decimals,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.name.is_empty() && self.width == 0 && self.decimals == 0
    }
}

impl fmt::Display for DisplayFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return Ok(());
        }
        f.write_str(&self.name)?;
        if self.width > 0 {
            write!(f, "{}", self.width)?;
        }
        f.write_str(".")?;
        if self.decimals > 0 {
            write!(f, "{}", self.decimals)?;
        }
        Ok(())
    }
}

/// Descriptor of one column as recorded by a SAS file
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnMeta {
    /// Name as it appears in the dataset
    pub name: String,
    pub label: String,
    pub kind: ColumnKind,
    /// Bytes per value in the observation record
    pub length: usize,
    pub format: DisplayFormat,
    pub informat: DisplayFormat,
}

impl ColumnMeta {
    pub fn numeric(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            label: String::new(),
            kind: ColumnKind::Numeric,
            length: 8,
            format: DisplayFormat::default(),
            informat: DisplayFormat::default(),
        }
    }

    pub fn character(name: impl Into<String>, length: usize) -> Self {
        Self {
            name: name.into(),
            label: String::new(),
            kind: ColumnKind::Character,
            length,
            format: DisplayFormat::default(),
            informat: DisplayFormat::default(),
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    pub fn with_format(mut self, format: DisplayFormat) -> Self {
        self.format = format;
        self
    }
}

/// Side information needed to write a dataset back out as XPT
#[derive(Debug, Clone, PartialEq, Default)]
pub struct FormatMetadata {
    pub dataset_name: String,
    pub dataset_label: String,
    pub dataset_type: String,
    pub sas_version: String,
    pub os_name: String,
    pub created: Option<NaiveDateTime>,
    pub modified: Option<NaiveDateTime>,
    pub columns: Vec<ColumnMeta>,
}

impl FormatMetadata {
    pub fn column(&self, name: &str) -> Option<&ColumnMeta> {
        self.columns.iter().find(|c| c.name == name)
    }
}

/// A produced file, ready to be saved
#[derive(Debug, Clone, PartialEq)]
pub struct OutputArtifact {
    pub file_name: String,
    pub format: FileFormat,
    /// Source format when this artifact stands in for it
    pub fallback_for: Option<FileFormat>,
    pub bytes: Vec<u8>,
}

impl OutputArtifact {
    pub fn mime_type(&self) -> &'static str {
        self.format.mime_type()
    }

    /// Caption for the download button, e.g. "Download CSV (Fallback for SAS7BDAT)"
    pub fn button_label(&self) -> String {
        match self.fallback_for {
            Some(source) => format!("Download {} (Fallback for {})", self.format, source),
            None => format!("Download {}", self.format),
        }
    }
}

/// Processing options
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProcessingOptions {
    /// Backend used for SAS7BDAT sources
    pub sas_backend: SasBackend,

    /// Whether to hash the source bytes
    pub hash_source: bool,
}

/// Summary of a produced artifact
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactSummary {
    pub file_name: String,
    pub format: FileFormat,
    pub mime_type: String,
    pub size: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fallback_for: Option<FileFormat>,
}

/// Machine-readable account of one run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SplitReport {
    /// Report version
    pub version: String,

    /// Source file name (without path)
    pub file_name: String,

    /// Source file hash (SHA-256)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_sha256: Option<String>,

    pub format: FileFormat,

    /// Rows decoded from the source
    pub source_rows: usize,

    /// Rows kept after truncation
    pub rows: usize,

    pub columns: Vec<String>,

    pub artifacts: Vec<ArtifactSummary>,

    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub caveats: Vec<String>,

    /// Artifacts that could not be produced
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub failures: Vec<String>,
}

/// Result type for the application
pub type Result<T> = std::result::Result<T, crate::error::Error>;
