pub mod csv;
pub mod sas7bdat;
pub mod xpt;

use crate::types::{Dataset, FileFormat, FormatMetadata, ProcessingOptions, Result};

/// Rows decoded from a source file, plus whatever column metadata the
/// decoder kept
#[derive(Debug, Clone)]
pub struct Decoded {
    pub dataset: Dataset,
    pub metadata: Option<FormatMetadata>,
}

/// Common trait for data file readers
pub trait DataReader {
    /// Decode the whole source into a dataset
    fn read(&mut self, bytes: &[u8]) -> Result<Decoded>;

    /// Whether `read` returns `FormatMetadata` for this reader's format
    fn captures_metadata(&self) -> bool;
}

/// Create a reader for the given format
pub fn create_reader(format: FileFormat, options: &ProcessingOptions) -> Box<dyn DataReader> {
    match format {
        FileFormat::Csv => Box::new(csv::CsvReader::new()),
        FileFormat::Xpt => Box::new(xpt::XptReader::new()),
        FileFormat::Sas7bdat => Box::new(sas7bdat::Sas7bdatReader::new(options.sas_backend)),
    }
}

/// Decode header or cell text stored by SAS. Files written by older
/// sessions are often Latin-1, so bytes that are not UTF-8 are mapped
/// one-to-one onto code points.
pub(crate) fn decode_text(bytes: &[u8]) -> String {
    match std::str::from_utf8(bytes) {
        Ok(s) => s.to_string(),
        Err(_) => bytes.iter().map(|&b| char::from(b)).collect(),
    }
}

/// Strip the blank and NUL padding SAS leaves after text fields
pub(crate) fn trim_padding(bytes: &[u8]) -> &[u8] {
    let end = bytes
        .iter()
        .rposition(|&b| b != b' ' && b != 0)
        .map_or(0, |i| i + 1);
    &bytes[..end]
}
