//! SAS transport (XPORT version 5) reader
//!
//! A transport file is a sequence of 80-byte records: library headers,
//! then per member a descriptor, one namestr per variable and the packed
//! observations. Only the first member is decoded.

use chrono::NaiveDateTime;
use tracing::debug;

use crate::error::Error;
use crate::ibm_float;
use crate::temporal::Temporal;
use crate::types::{
    ColumnKind, ColumnMeta, Dataset, DisplayFormat, FileFormat, FormatMetadata, Result, Value,
};

use super::{decode_text, trim_padding, DataReader, Decoded};

pub(crate) const RECORD_LEN: usize = 80;

pub(crate) const LIBRARY_HEADER: &[u8] = b"HEADER RECORD*******LIBRARY HEADER RECORD!!!!!!!";
pub(crate) const MEMBER_HEADER: &[u8] = b"HEADER RECORD*******MEMBER  HEADER RECORD!!!!!!!";
pub(crate) const DESCRIPTOR_HEADER: &[u8] = b"HEADER RECORD*******DSCRPTR HEADER RECORD!!!!!!!";
pub(crate) const NAMESTR_HEADER: &[u8] = b"HEADER RECORD*******NAMESTR HEADER RECORD!!!!!!!";
pub(crate) const OBS_HEADER: &[u8] = b"HEADER RECORD*******OBS     HEADER RECORD!!!!!!!";
const LIBV8_HEADER: &[u8] = b"HEADER RECORD*******LIBV8   HEADER RECORD!!!!!!!";

pub(crate) const NAMESTR_LEN: usize = 140;
/// Namestr size written by VAX/VMS hosts
const VAX_NAMESTR_LEN: usize = 136;

/// Timestamp layout of header records, e.g. `15MAR24:09:30:00`
pub(crate) const TIMESTAMP_FORMAT: &str = "%d%b%y:%H:%M:%S";

/// SAS transport file reader
#[derive(Debug, Default)]
pub struct XptReader;

impl XptReader {
    pub fn new() -> Self {
        Self
    }
}

impl DataReader for XptReader {
    fn read(&mut self, bytes: &[u8]) -> Result<Decoded> {
        let mut records = Records::new(bytes);

        let library = records.next_record()?;
        if library.starts_with(LIBV8_HEADER) {
            return Err(parse_error("version 8 transport files are not supported"));
        }
        if !library.starts_with(LIBRARY_HEADER) {
            return Err(parse_error("missing library header record"));
        }
        let _library_first = records.next_record()?;
        let _library_second = records.next_record()?;

        let member = records.expect_header(MEMBER_HEADER, "member")?;
        let namestr_len = match parse_count(&member[74..78])? {
            NAMESTR_LEN => NAMESTR_LEN,
            VAX_NAMESTR_LEN => VAX_NAMESTR_LEN,
            other => return Err(parse_error(format!("unexpected namestr length {}", other))),
        };

        records.expect_header(DESCRIPTOR_HEADER, "descriptor")?;
        let descriptor = records.next_record()?;
        let descriptor_second = records.next_record()?;

        let namestr_header = records.expect_header(NAMESTR_HEADER, "namestr")?;
        let variable_count = parse_count(&namestr_header[54..58])?;
        let namestrs = records.take_padded(variable_count * namestr_len)?;
        let variables = namestrs
            .chunks_exact(namestr_len)
            .map(parse_namestr)
            .collect::<Result<Vec<_>>>()?;

        records.expect_header(OBS_HEADER, "observation")?;
        let data = member_data(records.rest());

        let metadata = FormatMetadata {
            dataset_name: header_text(&descriptor[8..16]),
            sas_version: header_text(&descriptor[24..32]),
            os_name: header_text(&descriptor[32..40]),
            created: parse_timestamp(&descriptor[64..80]),
            modified: parse_timestamp(&descriptor_second[0..16]),
            dataset_label: header_text(&descriptor_second[32..72]),
            dataset_type: header_text(&descriptor_second[72..80]),
            columns: variables.iter().map(|v| v.meta.clone()).collect(),
        };

        let dataset = decode_observations(&variables, data)?;
        debug!(
            member = %metadata.dataset_name,
            rows = dataset.row_count(),
            columns = dataset.column_count(),
            "decoded transport file"
        );

        Ok(Decoded {
            dataset,
            metadata: Some(metadata),
        })
    }

    fn captures_metadata(&self) -> bool {
        true
    }
}

/// A variable and where its value sits inside an observation
struct Variable {
    meta: ColumnMeta,
    position: usize,
}

/// Forward cursor over 80-byte records
struct Records<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Records<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn next_record(&mut self) -> Result<&'a [u8]> {
        self.take(RECORD_LEN)
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        let end = self.pos + len;
        let slice = self
            .bytes
            .get(self.pos..end)
            .ok_or_else(|| parse_error("unexpected end of file"))?;
        self.pos = end;
        Ok(slice)
    }

    /// Take `len` bytes, then skip the blank fill up to the next record
    fn take_padded(&mut self, len: usize) -> Result<&'a [u8]> {
        let slice = self.take(len)?;
        let fill = (RECORD_LEN - len % RECORD_LEN) % RECORD_LEN;
        self.take(fill)?;
        Ok(slice)
    }

    fn expect_header(&mut self, prefix: &[u8], what: &str) -> Result<&'a [u8]> {
        let record = self.next_record()?;
        if !record.starts_with(prefix) {
            return Err(parse_error(format!("missing {} header record", what)));
        }
        Ok(record)
    }

    fn rest(&self) -> &'a [u8] {
        &self.bytes[self.pos.min(self.bytes.len())..]
    }
}

/// Observation bytes of the current member, up to the next member header
fn member_data(data: &[u8]) -> &[u8] {
    let next_member = data
        .chunks(RECORD_LEN)
        .position(|record| record.starts_with(MEMBER_HEADER));
    match next_member {
        Some(index) => &data[..index * RECORD_LEN],
        None => data,
    }
}

fn parse_namestr(raw: &[u8]) -> Result<Variable> {
    let kind = match be_i16(raw, 0) {
        1 => ColumnKind::Numeric,
        2 => ColumnKind::Character,
        other => return Err(parse_error(format!("unknown variable type {}", other))),
    };
    let length = usize::try_from(be_i16(raw, 4))
        .ok()
        .filter(|&len| len > 0)
        .ok_or_else(|| parse_error("variable length must be positive"))?;
    if kind == ColumnKind::Numeric && length > 8 {
        return Err(parse_error(format!(
            "numeric variable length {} exceeds 8 bytes",
            length
        )));
    }
    let position = usize::try_from(be_i32(raw, 84))
        .map_err(|_| parse_error("negative variable position"))?;

    let name = header_text(&raw[8..16]);
    if name.is_empty() {
        return Err(parse_error("variable without a name"));
    }

    Ok(Variable {
        meta: ColumnMeta {
            name,
            label: header_text(&raw[16..56]),
            kind,
            length,
            format: DisplayFormat::new(
                header_text(&raw[56..64]),
                be_i16(raw, 64).max(0) as u16,
                be_i16(raw, 66).max(0) as u16,
            ),
            informat: DisplayFormat::new(
                header_text(&raw[72..80]),
                be_i16(raw, 80).max(0) as u16,
                be_i16(raw, 82).max(0) as u16,
            ),
        },
        position,
    })
}

fn decode_observations(variables: &[Variable], data: &[u8]) -> Result<Dataset> {
    let columns = variables.iter().map(|v| v.meta.name.clone()).collect();
    let mut dataset = Dataset::new(columns);

    let obs_len = variables
        .iter()
        .map(|v| v.position + v.meta.length)
        .max()
        .unwrap_or(0);
    if obs_len == 0 {
        return Ok(dataset);
    }

    // The last record is blank-filled; a short observation can fit in that fill.
    let mut count = data.len() / obs_len;
    while count > 0 {
        let start = (count - 1) * obs_len;
        let is_fill = data.len() - start < RECORD_LEN
            && data[start..start + obs_len].iter().all(|&b| b == b' ');
        if !is_fill {
            break;
        }
        count -= 1;
    }

    let temporal: Vec<_> = variables.iter().map(|v| Temporal::of(&v.meta.format)).collect();
    for observation in data.chunks_exact(obs_len).take(count) {
        let row = variables
            .iter()
            .zip(&temporal)
            .map(|(v, temporal)| {
                let raw = &observation[v.position..v.position + v.meta.length];
                match v.meta.kind {
                    ColumnKind::Numeric => match (ibm_float::to_f64(raw), temporal) {
                        (None, _) => Value::Null,
                        (Some(n), Some(temporal)) => temporal.decode(n),
                        (Some(n), None) => Value::Number(n),
                    },
                    ColumnKind::Character => Value::String(decode_text(trim_padding(raw))),
                }
            })
            .collect();
        dataset.push_row(row)?;
    }

    Ok(dataset)
}

fn parse_error(message: impl std::fmt::Display) -> Error {
    Error::parse(FileFormat::Xpt, message)
}

fn parse_count(raw: &[u8]) -> Result<usize> {
    std::str::from_utf8(raw)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .ok_or_else(|| parse_error(format!("invalid count field {:?}", raw)))
}

fn header_text(raw: &[u8]) -> String {
    decode_text(trim_padding(raw))
}

pub(crate) fn parse_timestamp(raw: &[u8]) -> Option<NaiveDateTime> {
    let text = header_text(raw);
    NaiveDateTime::parse_from_str(&text, TIMESTAMP_FORMAT).ok()
}

fn be_i16(raw: &[u8], offset: usize) -> i16 {
    i16::from_be_bytes([raw[offset], raw[offset + 1]])
}

fn be_i32(raw: &[u8], offset: usize) -> i32 {
    i32::from_be_bytes([
        raw[offset],
        raw[offset + 1],
        raw[offset + 2],
        raw[offset + 3],
    ])
}
