//! SAS7BDAT reader
//!
//! The parser needs random access, so uploaded bytes are first written to a
//! scoped temporary file that is removed when decoding finishes, whether it
//! succeeds or not.

pub mod decompress;
mod parser;

#[cfg(test)]
pub(crate) mod fixture;

use std::fs::File;
use std::io::{BufReader, Write};
use std::path::Path;

use tracing::debug;

use crate::types::{
    ColumnKind, ColumnMeta, FileFormat, FormatMetadata, Result, SasBackend,
    MAX_TRANSPORT_CHAR_LEN,
};

use super::{DataReader, Decoded};

use parser::Sas7bdat;

/// SAS7BDAT reader. The backend decides whether column metadata is kept
/// for re-encoding; rows decode the same either way.
#[derive(Debug, Default)]
pub struct Sas7bdatReader {
    backend: SasBackend,
}

impl Sas7bdatReader {
    pub fn new(backend: SasBackend) -> Self {
        Self { backend }
    }
}

impl DataReader for Sas7bdatReader {
    fn read(&mut self, bytes: &[u8]) -> Result<Decoded> {
        let parsed = with_temp_file(bytes, |path| {
            let file = File::open(path)?;
            parser::parse(BufReader::new(file))
        })?;

        debug!(
            backend = ?self.backend,
            rows = parsed.dataset.row_count(),
            columns = parsed.columns.len(),
            "decoded SAS7BDAT"
        );

        let metadata = self
            .captures_metadata()
            .then(|| transport_metadata(&parsed));
        Ok(Decoded {
            dataset: parsed.dataset,
            metadata,
        })
    }

    fn captures_metadata(&self) -> bool {
        self.backend.captures_metadata(FileFormat::Sas7bdat)
    }
}

/// Write `bytes` to a temporary file and hand its path to `decode`. The
/// file is deleted when this returns.
pub(crate) fn with_temp_file<T>(
    bytes: &[u8],
    decode: impl FnOnce(&Path) -> Result<T>,
) -> Result<T> {
    let mut file = tempfile::Builder::new()
        .prefix("filesplit-")
        .suffix(".sas7bdat")
        .tempfile()?;
    file.write_all(bytes)?;
    file.flush()?;
    debug!(path = %file.path().display(), size = bytes.len(), "staged upload");

    decode(file.path())
}

fn transport_metadata(parsed: &Sas7bdat) -> FormatMetadata {
    let header = &parsed.header;
    let columns = parsed
        .columns
        .iter()
        .map(|column| {
            let base = match column.kind {
                ColumnKind::Numeric => ColumnMeta::numeric(column.name.as_str()),
                ColumnKind::Character => ColumnMeta::character(
                    column.name.as_str(),
                    column.length.min(MAX_TRANSPORT_CHAR_LEN),
                ),
            };
            let mut meta = base
                .with_label(column.label.as_str())
                .with_format(column.format.clone());
            if column.kind == ColumnKind::Numeric {
                meta.length = column.length;
            }
            meta
        })
        .collect();

    FormatMetadata {
        dataset_name: header.dataset_name.clone(),
        dataset_label: String::new(),
        dataset_type: header.file_type.clone(),
        sas_version: header.sas_release.clone(),
        os_name: header.os_name.clone(),
        created: header.created,
        modified: header.modified,
        columns,
    }
}
