use std::collections::HashMap;

use csv::{ReaderBuilder, StringRecord};
use tracing::debug;

use crate::error::Error;
use crate::types::{Dataset, FileFormat, Result, Value, MAX_ROWS};

use super::{DataReader, Decoded};

const UTF8_BOM: &[u8] = b"\xEF\xBB\xBF";

/// Cell text treated as a missing value
pub const MISSING_TOKENS: &[&str] = &[
    "", "#N/A", "#N/A N/A", "#NA", "-1.#IND", "-1.#QNAN", "-NaN", "-nan", "1.#IND", "1.#QNAN",
    "<NA>", "N/A", "NA", "NULL", "NaN", "None", "n/a", "nan", "null",
];

pub fn is_missing(value: &str) -> bool {
    MISSING_TOKENS.contains(&value)
}

/// CSV file reader
#[derive(Debug)]
pub struct CsvReader {
    delimiter: u8,
    /// Leading rows that decide whether a column is numeric. Matches the
    /// truncation so the kept rows read back with the same types.
    inference_rows: usize,
}

impl Default for CsvReader {
    fn default() -> Self {
        Self::new()
    }
}

impl CsvReader {
    pub fn new() -> Self {
        Self {
            delimiter: b',',
            inference_rows: MAX_ROWS,
        }
    }

    /// Make header names unique by suffixing repeats with `.1`, `.2`, ...
    fn dedupe_headers(headers: &StringRecord) -> Vec<String> {
        let mut seen: HashMap<String, usize> = HashMap::new();
        let mut names = Vec::with_capacity(headers.len());
        for header in headers.iter() {
            let mut name = header.to_string();
            if let Some(&count) = seen.get(header) {
                let mut n = count;
                loop {
                    n += 1;
                    name = format!("{}.{}", header, n);
                    if !seen.contains_key(&name) {
                        break;
                    }
                }
                seen.insert(header.to_string(), n);
            }
            seen.insert(name.clone(), 0);
            names.push(name);
        }
        names
    }
}

impl DataReader for CsvReader {
    fn read(&mut self, bytes: &[u8]) -> Result<Decoded> {
        let bytes = bytes.strip_prefix(UTF8_BOM).unwrap_or(bytes);
        let mut reader = ReaderBuilder::new()
            .delimiter(self.delimiter)
            .has_headers(true)
            .flexible(true)
            .from_reader(bytes);

        let headers = reader
            .headers()
            .map_err(|e| Error::parse(FileFormat::Csv, e))?
            .clone();
        if headers.is_empty() || headers.iter().all(str::is_empty) {
            return Err(Error::parse(FileFormat::Csv, "missing header row"));
        }

        let columns = Self::dedupe_headers(&headers);
        let num_cols = columns.len();

        // Raw cells first, typing looks at the leading rows of each column
        let mut cells: Vec<Vec<Option<String>>> = Vec::new();
        for (line, record) in reader.records().enumerate() {
            let record = record.map_err(|e| Error::parse(FileFormat::Csv, e))?;
            if record.len() > num_cols {
                return Err(Error::parse(
                    FileFormat::Csv,
                    format!(
                        "record {} has {} fields, expected at most {}",
                        line + 1,
                        record.len(),
                        num_cols
                    ),
                ));
            }
            let mut row: Vec<Option<String>> = record
                .iter()
                .map(|field| (!is_missing(field)).then(|| field.to_string()))
                .collect();
            row.resize(num_cols, None);
            cells.push(row);
        }

        let numeric: Vec<bool> = (0..num_cols)
            .map(|col| {
                cells
                    .iter()
                    .take(self.inference_rows)
                    .filter_map(|row| row[col].as_deref())
                    .all(|s| s.trim().parse::<f64>().is_ok())
            })
            .collect();

        let mut dataset = Dataset::new(columns);
        for row in cells {
            let values = row
                .into_iter()
                .zip(&numeric)
                .map(|(cell, &is_numeric)| match cell {
                    None => Value::Null,
                    Some(s) if is_numeric => s
                        .trim()
                        .parse::<f64>()
                        .map(Value::Number)
                        .unwrap_or(Value::String(s)),
                    Some(s) => Value::String(s),
                })
                .collect();
            dataset.push_row(values)?;
        }

        debug!(
            rows = dataset.row_count(),
            columns = dataset.column_count(),
            "decoded csv"
        );

        Ok(Decoded {
            dataset,
            metadata: None,
        })
    }

    fn captures_metadata(&self) -> bool {
        false
    }
}
