pub mod csv;
pub mod xpt;

use crate::error::Error;
use crate::types::{Dataset, FileFormat, FormatMetadata, Result};

/// Encode `dataset` as `target`.
///
/// Fails with [`Error::Encode`] when the target needs column metadata that
/// was not captured, or when the target cannot be written at all. Callers
/// pick targets from the capability table first; this never falls back to
/// another format.
pub fn encode(
    dataset: &Dataset,
    metadata: Option<&FormatMetadata>,
    target: FileFormat,
) -> Result<Vec<u8>> {
    match target {
        FileFormat::Csv => csv::encode(dataset),
        FileFormat::Xpt => xpt::encode(dataset, metadata),
        FileFormat::Sas7bdat => Err(Error::encode(
            FileFormat::Sas7bdat,
            "writing SAS7BDAT files is not supported",
        )),
    }
}
