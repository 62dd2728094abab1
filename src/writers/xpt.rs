//! SAS transport (XPORT version 5) writer

use std::collections::HashSet;

use chrono::{NaiveDateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::warn;

use crate::error::Error;
use crate::ibm_float;
use crate::temporal;
use crate::readers::xpt::{
    DESCRIPTOR_HEADER, LIBRARY_HEADER, MEMBER_HEADER, NAMESTR_HEADER, NAMESTR_LEN, OBS_HEADER,
    RECORD_LEN, TIMESTAMP_FORMAT,
};
use crate::types::{
    ColumnKind, ColumnMeta, Dataset, FileFormat, FormatMetadata, Result, Value,
    MAX_TRANSPORT_CHAR_LEN, MAX_TRANSPORT_LABEL_LEN, MAX_TRANSPORT_NAME_LEN,
    MAX_TRANSPORT_VARIABLES,
};

const SAS_VERSION: &str = "9.4";
const DEFAULT_OS: &str = "X64_10PR";
const DEFAULT_MEMBER: &str = "DATASET";

static INVALID_NAME_CHARS: Lazy<Regex> = Lazy::new(|| Regex::new(r"[^A-Za-z0-9_]").unwrap());

/// A dataset column laid out for the observation record
struct Variable<'a> {
    meta: &'a ColumnMeta,
    name: String,
    length: usize,
    position: usize,
}

/// Encode a dataset as a single-member transport file.
///
/// Every dataset column needs a matching `ColumnMeta`; its kind, length,
/// label and formats drive the namestr records.
pub fn encode(dataset: &Dataset, metadata: Option<&FormatMetadata>) -> Result<Vec<u8>> {
    let metadata = metadata.ok_or_else(|| {
        encode_error("column metadata was not captured when the source was decoded")
    })?;
    if dataset.column_count() > MAX_TRANSPORT_VARIABLES {
        return Err(encode_error(format!(
            "{} columns exceed the transport limit of {}",
            dataset.column_count(),
            MAX_TRANSPORT_VARIABLES
        )));
    }
    let variables = layout_variables(dataset, metadata)?;

    let now = Utc::now().naive_utc();
    let created = timestamp(metadata.created.unwrap_or(now));
    let modified = timestamp(metadata.modified.unwrap_or(now));
    let version = non_empty(&metadata.sas_version, SAS_VERSION);
    let os_name = non_empty(&metadata.os_name, DEFAULT_OS);
    let member = member_name(&metadata.dataset_name);

    let mut out = Vec::new();

    out.extend(header_record(LIBRARY_HEADER, &"0".repeat(30)));
    out.extend(record(&[
        field("SAS", 8),
        field("SAS", 8),
        field("SASLIB", 8),
        field(version, 8),
        field(os_name, 8),
        field("", 24),
        field(&created, 16),
    ]));
    out.extend(record(&[field(&modified, 16), field("", 64)]));

    out.extend(header_record(
        MEMBER_HEADER,
        &format!("00000000000000000160000000{:04}", NAMESTR_LEN),
    ));
    out.extend(header_record(DESCRIPTOR_HEADER, &"0".repeat(30)));
    out.extend(record(&[
        field("SAS", 8),
        field(&member, 8),
        field("SASDATA", 8),
        field(version, 8),
        field(os_name, 8),
        field("", 24),
        field(&created, 16),
    ]));
    out.extend(record(&[
        field(&modified, 16),
        field("", 16),
        field(&metadata.dataset_label, MAX_TRANSPORT_LABEL_LEN),
        field(&metadata.dataset_type, 8),
    ]));

    out.extend(header_record(
        NAMESTR_HEADER,
        &format!("000000{:04}00000000000000000000", variables.len()),
    ));
    let mut namestrs = Vec::with_capacity(variables.len() * NAMESTR_LEN);
    for (index, variable) in variables.iter().enumerate() {
        namestrs.extend(namestr(variable, index)?);
    }
    pad_to_record(&mut namestrs);
    out.extend(namestrs);

    out.extend(header_record(OBS_HEADER, &"0".repeat(30)));
    let mut observations = Vec::new();
    let mut truncated = vec![0usize; variables.len()];
    for (row_index, row) in dataset.rows().iter().enumerate() {
        for (col, variable) in variables.iter().enumerate() {
            let value = &row[col];
            let bytes = encode_value(variable, value, row_index, &mut truncated[col])?;
            observations.extend(bytes);
        }
    }
    pad_to_record(&mut observations);
    out.extend(observations);

    for (variable, count) in variables.iter().zip(&truncated) {
        if *count > 0 {
            warn!(
                column = %variable.meta.name,
                values = count,
                length = variable.length,
                "character values truncated to the transport column length"
            );
        }
    }

    Ok(out)
}

fn layout_variables<'a>(
    dataset: &Dataset,
    metadata: &'a FormatMetadata,
) -> Result<Vec<Variable<'a>>> {
    let mut used = HashSet::new();
    let mut position = 0;
    let mut variables = Vec::with_capacity(dataset.column_count());

    for (index, column) in dataset.columns().iter().enumerate() {
        let meta = metadata.column(column).ok_or_else(|| {
            encode_error(format!("no column metadata for '{}'", column))
        })?;

        let length = match meta.kind {
            ColumnKind::Numeric if (2..=8).contains(&meta.length) => meta.length,
            ColumnKind::Numeric => 8,
            ColumnKind::Character if meta.length > 0 => meta.length.min(MAX_TRANSPORT_CHAR_LEN),
            ColumnKind::Character => dataset
                .rows()
                .iter()
                .map(|row| row[index].to_text().len())
                .max()
                .unwrap_or(1)
                .clamp(1, MAX_TRANSPORT_CHAR_LEN),
        };

        variables.push(Variable {
            meta,
            name: transport_name(column, &mut used),
            length,
            position,
        });
        position += length;
    }

    Ok(variables)
}

/// Make `name` a valid, unique v5 variable name: letters, digits and
/// underscores, not starting with a digit, at most 8 characters.
pub(crate) fn transport_name(name: &str, used: &mut HashSet<String>) -> String {
    let mut base = INVALID_NAME_CHARS.replace_all(name, "_").into_owned();
    if base.is_empty() || base.starts_with(|c: char| c.is_ascii_digit()) {
        base.insert(0, '_');
    }
    base.truncate(MAX_TRANSPORT_NAME_LEN);

    let mut candidate = base.clone();
    let mut suffix = 0usize;
    // SAS names are case-insensitive
    while used.contains(&candidate.to_uppercase()) {
        suffix += 1;
        let tail = suffix.to_string();
        let keep = base.len().min(MAX_TRANSPORT_NAME_LEN - tail.len());
        candidate = format!("{}{}", &base[..keep], tail);
    }
    used.insert(candidate.to_uppercase());
    candidate
}

fn member_name(name: &str) -> String {
    let mut used = HashSet::new();
    let name = non_empty(name, DEFAULT_MEMBER);
    transport_name(name, &mut used).to_uppercase()
}

fn namestr(variable: &Variable<'_>, index: usize) -> Result<Vec<u8>> {
    let meta = variable.meta;
    let number = i16::try_from(index + 1)
        .map_err(|_| encode_error(format!("too many variables at '{}'", meta.name)))?;
    let position = i32::try_from(variable.position).map_err(|_| {
        encode_error(format!("observation too wide at '{}'", meta.name))
    })?;
    let mut out = Vec::with_capacity(NAMESTR_LEN);
    let ntype: i16 = match meta.kind {
        ColumnKind::Numeric => 1,
        ColumnKind::Character => 2,
    };

    out.extend(ntype.to_be_bytes());
    out.extend(0i16.to_be_bytes());
    out.extend((variable.length as i16).to_be_bytes());
    out.extend(number.to_be_bytes());
    out.extend(field(&variable.name, 8));
    out.extend(field(&meta.label, MAX_TRANSPORT_LABEL_LEN));
    out.extend(field(&meta.format.name, 8));
    out.extend((meta.format.width as i16).to_be_bytes());
    out.extend((meta.format.decimals as i16).to_be_bytes());
    out.extend(0i16.to_be_bytes());
    out.extend([0u8; 2]);
    out.extend(field(&meta.informat.name, 8));
    out.extend((meta.informat.width as i16).to_be_bytes());
    out.extend((meta.informat.decimals as i16).to_be_bytes());
    out.extend(position.to_be_bytes());
    out.resize(NAMESTR_LEN, 0);
    Ok(out)
}

fn encode_value(
    variable: &Variable<'_>,
    value: &Value,
    row_index: usize,
    truncated: &mut usize,
) -> Result<Vec<u8>> {
    match variable.meta.kind {
        ColumnKind::Numeric => {
            let full = match value {
                Value::Null => ibm_float::missing(),
                Value::String(s) => {
                    return Err(encode_error(format!(
                        "column '{}' is numeric but row {} holds text {:?}",
                        variable.meta.name,
                        row_index + 1,
                        s
                    )))
                }
                other => match temporal::to_sas_number(other) {
                    Some(n) => ibm_float::from_f64(n),
                    None => {
                        return Err(encode_error(format!(
                            "column '{}' row {} holds a date SAS cannot store",
                            variable.meta.name,
                            row_index + 1
                        )))
                    }
                },
            };
            Ok(full[..variable.length].to_vec())
        }
        ColumnKind::Character => {
            let text = value.to_text();
            if text.len() > variable.length {
                *truncated += 1;
            }
            Ok(field(&text, variable.length))
        }
    }
}

/// `text` cut at a character boundary to `width` bytes and blank-padded
fn field(text: &str, width: usize) -> Vec<u8> {
    let mut end = text.len().min(width);
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    let mut out = text.as_bytes()[..end].to_vec();
    out.resize(width, b' ');
    out
}

fn record(fields: &[Vec<u8>]) -> Vec<u8> {
    let out: Vec<u8> = fields.concat();
    debug_assert_eq!(out.len(), RECORD_LEN);
    out
}

fn header_record(prefix: &[u8], digits: &str) -> Vec<u8> {
    let mut out = prefix.to_vec();
    out.extend(digits.as_bytes());
    out.resize(RECORD_LEN, b' ');
    out
}

fn pad_to_record(buf: &mut Vec<u8>) {
    let fill = (RECORD_LEN - buf.len() % RECORD_LEN) % RECORD_LEN;
    buf.resize(buf.len() + fill, b' ');
}

fn timestamp(ts: NaiveDateTime) -> String {
    ts.format(TIMESTAMP_FORMAT).to_string().to_uppercase()
}

fn non_empty<'a>(value: &'a str, default: &'a str) -> &'a str {
    if value.trim().is_empty() {
        default
    } else {
        value
    }
}

fn encode_error(message: impl std::fmt::Display) -> Error {
    Error::encode(FileFormat::Xpt, message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::readers::xpt::XptReader;
    use crate::readers::DataReader;
    use crate::types::DisplayFormat;
    use chrono::{NaiveDate, NaiveTime};

    #[test]
    fn test_header_layout() {
        let meta = FormatMetadata {
            dataset_name: "ae".to_string(),
            columns: vec![ColumnMeta::numeric("X")],
            ..Default::default()
        };
        let mut ds = Dataset::new(vec!["X".to_string()]);
        ds.push_row(vec![Value::Number(1.0)]).unwrap();

        let bytes = encode(&ds, Some(&meta)).unwrap();
        let records: Vec<&[u8]> = bytes.chunks(RECORD_LEN).collect();

        assert!(records[0].starts_with(LIBRARY_HEADER));
        assert_eq!(&records[3][74..78], b"0140");
        assert_eq!(&records[5][8..16], b"AE      ");
        assert_eq!(&records[7][54..58], b"0001");
        // 140-byte namestr padded to two records, then the OBS header
        assert!(records[10].starts_with(OBS_HEADER));
        assert_eq!(&records[11][..8], &[0x41, 0x10, 0, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn test_transport_names() {
        let mut used = HashSet::new();
        assert_eq!(transport_name("visit date", &mut used), "visit_da");
        assert_eq!(transport_name("visit_day", &mut used), "visit_d1");
        assert_eq!(transport_name("1st", &mut used), "_1st");
        assert_eq!(transport_name("AGE", &mut used), "AGE");
        assert_eq!(transport_name("age", &mut used), "age1");
    }

    #[test]
    fn test_missing_column_metadata() {
        let meta = FormatMetadata {
            columns: vec![ColumnMeta::numeric("A")],
            ..Default::default()
        };
        let ds = Dataset::new(vec!["A".to_string(), "B".to_string()]);

        let err = encode(&ds, Some(&meta)).unwrap_err();
        assert!(err.to_string().contains("'B'"));
    }

    #[test]
    fn test_text_in_numeric_column() {
        let meta = FormatMetadata {
            columns: vec![ColumnMeta::numeric("A")],
            ..Default::default()
        };
        let mut ds = Dataset::new(vec!["A".to_string()]);
        ds.push_row(vec![Value::String("oops".into())]).unwrap();

        assert!(matches!(
            encode(&ds, Some(&meta)),
            Err(Error::Encode { format: FileFormat::Xpt, .. })
        ));
    }

    #[test]
    fn test_long_names_and_values_are_fitted() {
        let meta = FormatMetadata {
            columns: vec![ColumnMeta::character("adverse_event_term", 4)],
            ..Default::default()
        };
        let mut ds = Dataset::new(vec!["adverse_event_term".to_string()]);
        ds.push_row(vec![Value::String("HEADACHE".into())]).unwrap();

        let decoded = XptReader::new().read(&encode(&ds, Some(&meta)).unwrap()).unwrap();
        assert_eq!(decoded.dataset.columns(), ["adverse_"]);
        assert_eq!(decoded.dataset.rows()[0][0], Value::String("HEAD".into()));
    }

    #[test]
    fn test_calendar_values_keep_their_type() {
        let meta = FormatMetadata {
            columns: vec![
                ColumnMeta::numeric("DT").with_format(DisplayFormat::new("DATE", 9, 0)),
                ColumnMeta::numeric("DTM").with_format(DisplayFormat::new("DATETIME", 20, 0)),
                ColumnMeta::numeric("TM").with_format(DisplayFormat::new("TIME", 8, 0)),
                ColumnMeta::character("TXT", 10),
            ],
            ..Default::default()
        };
        let date = NaiveDate::from_ymd_opt(2020, 3, 26).unwrap();
        let time = NaiveTime::from_hms_opt(10, 0, 0).unwrap();
        let mut ds = Dataset::new(vec![
            "DT".to_string(),
            "DTM".to_string(),
            "TM".to_string(),
            "TXT".to_string(),
        ]);
        ds.push_row(vec![
            Value::Date(date),
            Value::DateTime(date.and_time(time)),
            Value::Time(time),
            Value::Date(date),
        ])
        .unwrap();

        let bytes = encode(&ds, Some(&meta)).unwrap();
        let records: Vec<&[u8]> = bytes.chunks(RECORD_LEN).collect();
        // first observation record: 22000 days, as IBM hex float 0x4455F0
        assert_eq!(&records[records.len() - 1][..3], &[0x44, 0x55, 0xf0]);

        let decoded = XptReader::new().read(&bytes).unwrap();
        let row = &decoded.dataset.rows()[0];
        assert_eq!(row[..3], ds.rows()[0][..3]);
        assert_eq!(row[3], Value::String("2020-03-26".into()));
    }

    #[test]
    fn test_too_many_variables() {
        let columns: Vec<String> = (0..=MAX_TRANSPORT_VARIABLES)
            .map(|i| format!("C{}", i))
            .collect();
        let ds = Dataset::new(columns);

        let err = encode(&ds, Some(&FormatMetadata::default())).unwrap_err();
        assert!(matches!(err, Error::Encode { format: FileFormat::Xpt, .. }));
        assert!(err.to_string().contains("9999"));
    }

    #[test]
    fn test_short_numeric_length() {
        let meta = FormatMetadata {
            columns: vec![ColumnMeta {
                length: 4,
                ..ColumnMeta::numeric("N")
            }],
            ..Default::default()
        };
        let mut ds = Dataset::new(vec!["N".to_string()]);
        ds.push_row(vec![Value::Number(42.0)]).unwrap();
        ds.push_row(vec![Value::Null]).unwrap();

        let decoded = XptReader::new().read(&encode(&ds, Some(&meta)).unwrap()).unwrap();
        assert_eq!(decoded.dataset.rows()[0][0], Value::Number(42.0));
        assert_eq!(decoded.dataset.rows()[1][0], Value::Null);
    }
}
