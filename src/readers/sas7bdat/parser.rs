//! SAS7BDAT container parsing.
//!
//! A file is a header followed by fixed-size pages. Metadata pages carry
//! subheaders (row size, column names, attributes, formats, ...) located
//! through a pointer table; data pages carry packed rows. Mix pages carry
//! both. In compressed files every row is its own subheader.

use std::io::{Read, Seek, SeekFrom};

use chrono::NaiveDateTime;
use tracing::{debug, trace};

use crate::error::Error;
use crate::readers::{decode_text, trim_padding};
use crate::temporal::{sas_datetime, Temporal};
use crate::types::{ColumnKind, Dataset, DisplayFormat, FileFormat, Result, Value};

use super::decompress;

pub(crate) const MAGIC: [u8; 32] = [
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0xc2, 0xea, 0x81,
    0x60, 0xb3, 0x14, 0x11, 0xcf, 0xbd, 0x92, 0x08, 0x00, 0x09, 0xc7, 0x31, 0x8c, 0x18, 0x1f,
    0x10, 0x11,
];

/// Bytes of the file header needed to locate everything else
const HEADER_PREFIX_LEN: usize = 296;

const PAGE_TYPE_MASK: u16 = 0xff00;
const PAGE_META: u16 = 0x0000;
const PAGE_DATA: u16 = 0x0100;
const PAGE_MIX: u16 = 0x0200;
const PAGE_AMD: u16 = 0x0400;
const PAGE_META2: u16 = 0x4000;

const SUBHEADER_POINTERS_OFFSET: usize = 8;
const TRUNCATED_SUBHEADER: u8 = 1;
const COMPRESSED_SUBHEADER: u8 = 4;
const COMPRESSED_SUBHEADER_TYPE: u8 = 1;

const RLE_LITERAL: &[u8] = b"SASYZCRL";
const RDC_LITERAL: &[u8] = b"SASYZCR2";

fn parse_error(message: impl std::fmt::Display) -> Error {
    Error::parse(FileFormat::Sas7bdat, message)
}

/// Byte order and word size of a file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Layout {
    pub little_endian: bool,
    /// 64-bit layout: 8-byte integers and wider page headers
    pub wide: bool,
}

impl Layout {
    fn int_len(self) -> usize {
        if self.wide {
            8
        } else {
            4
        }
    }

    fn page_bit_offset(self) -> usize {
        if self.wide {
            32
        } else {
            16
        }
    }

    fn pointer_len(self) -> usize {
        if self.wide {
            24
        } else {
            12
        }
    }

    fn u16(self, buf: &[u8], offset: usize) -> Result<u16> {
        let raw = array::<2>(buf, offset)?;
        Ok(if self.little_endian {
            u16::from_le_bytes(raw)
        } else {
            u16::from_be_bytes(raw)
        })
    }

    fn u32(self, buf: &[u8], offset: usize) -> Result<u32> {
        let raw = array::<4>(buf, offset)?;
        Ok(if self.little_endian {
            u32::from_le_bytes(raw)
        } else {
            u32::from_be_bytes(raw)
        })
    }

    /// Integer of the file's word size
    fn int(self, buf: &[u8], offset: usize) -> Result<u64> {
        if !self.wide {
            return self.u32(buf, offset).map(u64::from);
        }
        let raw = array::<8>(buf, offset)?;
        Ok(if self.little_endian {
            u64::from_le_bytes(raw)
        } else {
            u64::from_be_bytes(raw)
        })
    }

    fn usize(self, buf: &[u8], offset: usize) -> Result<usize> {
        usize::try_from(self.int(buf, offset)?).map_err(|_| parse_error("offset out of range"))
    }

    fn f64(self, buf: &[u8], offset: usize) -> Result<f64> {
        let raw = array::<8>(buf, offset)?;
        Ok(if self.little_endian {
            f64::from_le_bytes(raw)
        } else {
            f64::from_be_bytes(raw)
        })
    }

    /// Decode a stored numeric of 1 to 8 bytes. Stored values keep their
    /// most significant bytes.
    fn numeric(self, raw: &[u8]) -> Option<f64> {
        let mut buf = [0u8; 8];
        let value = if self.little_endian {
            buf[8 - raw.len()..].copy_from_slice(raw);
            f64::from_le_bytes(buf)
        } else {
            buf[..raw.len()].copy_from_slice(raw);
            f64::from_be_bytes(buf)
        };
        // SAS missing values are NaN payloads
        (!value.is_nan()).then_some(value)
    }
}

fn bytes_at(buf: &[u8], offset: usize, len: usize) -> Result<&[u8]> {
    offset
        .checked_add(len)
        .and_then(|end| buf.get(offset..end))
        .ok_or_else(|| parse_error(format!("read of {} bytes at {} runs past the page", len, offset)))
}

fn array<const N: usize>(buf: &[u8], offset: usize) -> Result<[u8; N]> {
    let mut out = [0u8; N];
    out.copy_from_slice(bytes_at(buf, offset, N)?);
    Ok(out)
}

fn byte_at(buf: &[u8], offset: usize) -> Result<u8> {
    Ok(array::<1>(buf, offset)?[0])
}

fn header_text(raw: &[u8]) -> String {
    decode_text(trim_padding(raw))
}

/// File-level information from the header
#[derive(Debug, Clone)]
pub struct Header {
    pub layout: Layout,
    pub header_length: usize,
    pub page_length: usize,
    pub page_count: u64,
    pub dataset_name: String,
    pub file_type: String,
    pub created: Option<NaiveDateTime>,
    pub modified: Option<NaiveDateTime>,
    pub sas_release: String,
    pub os_name: String,
}

fn read_header<R: Read + Seek>(source: &mut R) -> Result<Header> {
    let mut prefix = [0u8; HEADER_PREFIX_LEN];
    source.seek(SeekFrom::Start(0))?;
    source
        .read_exact(&mut prefix)
        .map_err(|_| parse_error("file is too short to hold a header"))?;

    if prefix[..MAGIC.len()] != MAGIC {
        return Err(parse_error("bad magic number, not a SAS7BDAT file"));
    }

    let wide = prefix[32] == b'3';
    let align_wide = if wide { 4 } else { 0 };
    let align_first = if prefix[35] == b'3' { 4 } else { 0 };
    let total_align = align_first + align_wide;
    let layout = Layout {
        little_endian: prefix[37] == 0x01,
        wide,
    };

    let header_length = layout.u32(&prefix, 196 + align_first)? as usize;
    let page_length = layout.u32(&prefix, 200 + align_first)? as usize;
    if header_length < HEADER_PREFIX_LEN || page_length == 0 {
        return Err(parse_error(format!(
            "implausible header ({} bytes) or page ({} bytes) length",
            header_length, page_length
        )));
    }

    let os_name = header_text(bytes_at(&prefix, 272 + total_align, 16)?);
    let os_maker = header_text(bytes_at(&prefix, 256 + total_align, 16)?);

    Ok(Header {
        layout,
        header_length,
        page_length,
        page_count: layout.int(&prefix, 204 + align_first)?,
        dataset_name: header_text(&prefix[92..156]),
        file_type: header_text(&prefix[156..164]),
        created: sas_datetime(layout.f64(&prefix, 164 + align_first)?),
        modified: sas_datetime(layout.f64(&prefix, 172 + align_first)?),
        sas_release: header_text(bytes_at(&prefix, 216 + total_align, 8)?),
        os_name: if os_name.is_empty() { os_maker } else { os_name },
    })
}

/// A decoded column descriptor
#[derive(Debug, Clone, PartialEq)]
pub struct SasColumn {
    pub name: String,
    pub label: String,
    pub format: DisplayFormat,
    pub kind: ColumnKind,
    /// Byte offset within a row
    pub offset: usize,
    pub length: usize,
}

/// Everything decoded from a SAS7BDAT file
#[derive(Debug, Clone)]
pub struct Sas7bdat {
    pub header: Header,
    pub columns: Vec<SasColumn>,
    pub dataset: Dataset,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum Compression {
    #[default]
    None,
    Rle,
    Rdc,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SubheaderKind {
    RowSize,
    ColumnSize,
    SubheaderCounts,
    ColumnText,
    ColumnName,
    ColumnAttributes,
    FormatAndLabel,
    ColumnList,
}

fn subheader_kind(signature: &[u8]) -> Option<SubheaderKind> {
    use SubheaderKind::*;

    let kind = match signature {
        [0xf7, 0xf7, 0xf7, 0xf7]
        | [0x00, 0x00, 0x00, 0x00, 0xf7, 0xf7, 0xf7, 0xf7]
        | [0xf7, 0xf7, 0xf7, 0xf7, 0x00, 0x00, 0x00, 0x00]
        | [0xf7, 0xf7, 0xf7, 0xf7, 0xff, 0xff, 0xfb, 0xfe] => RowSize,
        [0xf6, 0xf6, 0xf6, 0xf6]
        | [0x00, 0x00, 0x00, 0x00, 0xf6, 0xf6, 0xf6, 0xf6]
        | [0xf6, 0xf6, 0xf6, 0xf6, 0x00, 0x00, 0x00, 0x00]
        | [0xf6, 0xf6, 0xf6, 0xf6, 0xff, 0xff, 0xfb, 0xfe] => ColumnSize,
        [0x00, 0xfc, 0xff, 0xff]
        | [0xff, 0xff, 0xfc, 0x00]
        | [0x00, 0xfc, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff]
        | [0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xfc, 0x00] => SubheaderCounts,
        [0xfd, 0xff, 0xff, 0xff]
        | [0xff, 0xff, 0xff, 0xfd]
        | [0xfd, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff]
        | [0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xfd] => ColumnText,
        [0xff, 0xff, 0xff, 0xff] | [0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff] => ColumnName,
        [0xfc, 0xff, 0xff, 0xff]
        | [0xff, 0xff, 0xff, 0xfc]
        | [0xfc, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff]
        | [0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xfc] => ColumnAttributes,
        [0xfe, 0xfb, 0xff, 0xff]
        | [0xff, 0xff, 0xfb, 0xfe]
        | [0xfe, 0xfb, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff]
        | [0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xfb, 0xfe] => FormatAndLabel,
        [0xfe, 0xff, 0xff, 0xff]
        | [0xff, 0xff, 0xff, 0xfe]
        | [0xfe, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff]
        | [0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xfe] => ColumnList,
        _ => return None,
    };
    Some(kind)
}

#[derive(Debug, Clone, Copy)]
struct Attribute {
    offset: usize,
    length: usize,
    kind: ColumnKind,
}

/// Metadata accumulated across subheaders
#[derive(Debug, Default)]
struct Metadata {
    row_length: usize,
    row_count: usize,
    mix_page_row_count: usize,
    column_count: Option<usize>,
    compression: Compression,
    text_blocks: Vec<Vec<u8>>,
    names: Vec<String>,
    attributes: Vec<Attribute>,
    formats: Vec<(DisplayFormat, String)>,
}

impl Metadata {
    /// Walk a page's subheader pointers. Row subheaders of compressed files
    /// are returned as `(offset, length)` pairs in page order.
    fn process_page(
        &mut self,
        page: &[u8],
        layout: Layout,
        subheader_count: usize,
    ) -> Result<Vec<(usize, usize)>> {
        let int_len = layout.int_len();
        let pointers = layout.page_bit_offset() + SUBHEADER_POINTERS_OFFSET;
        let mut rows = Vec::new();

        for index in 0..subheader_count {
            let pointer = pointers + index * layout.pointer_len();
            let offset = layout.usize(page, pointer)?;
            let length = layout.usize(page, pointer + int_len)?;
            let compression = byte_at(page, pointer + 2 * int_len)?;
            let subheader_type = byte_at(page, pointer + 2 * int_len + 1)?;

            if length == 0 || compression == TRUNCATED_SUBHEADER {
                continue;
            }

            let signature = bytes_at(page, offset, int_len)?;
            match subheader_kind(signature) {
                Some(kind) => self.process_subheader(kind, page, layout, offset, length)?,
                None if self.compression != Compression::None
                    && (compression == COMPRESSED_SUBHEADER || compression == 0)
                    && subheader_type == COMPRESSED_SUBHEADER_TYPE =>
                {
                    rows.push((offset, length));
                }
                None => trace!(?signature, offset, "skipping unknown subheader"),
            }
        }

        Ok(rows)
    }

    fn process_subheader(
        &mut self,
        kind: SubheaderKind,
        page: &[u8],
        layout: Layout,
        offset: usize,
        length: usize,
    ) -> Result<()> {
        let int_len = layout.int_len();
        match kind {
            SubheaderKind::RowSize => {
                self.row_length = layout.usize(page, offset + 5 * int_len)?;
                self.row_count = layout.usize(page, offset + 6 * int_len)?;
                self.mix_page_row_count = layout.usize(page, offset + 15 * int_len)?;
            }
            SubheaderKind::ColumnSize => {
                self.column_count = Some(layout.usize(page, offset + int_len)?);
            }
            SubheaderKind::ColumnText => {
                let size = usize::from(layout.u16(page, offset + int_len)?);
                let block = bytes_at(page, offset + int_len, size)?.to_vec();
                if self.text_blocks.is_empty() {
                    self.compression = detect_compression(&block);
                }
                self.text_blocks.push(block);
            }
            SubheaderKind::ColumnName => {
                let count = length.saturating_sub(2 * int_len + 12) / 8;
                for i in 0..count {
                    let entry = offset + int_len + 8 * (i + 1);
                    let name = self
                        .text_ref(page, layout, entry, false)?
                        .ok_or_else(|| parse_error("column name points outside the text blocks"))?;
                    self.names.push(name);
                }
            }
            SubheaderKind::ColumnAttributes => {
                let step = int_len + 8;
                let count = length.saturating_sub(2 * int_len + 12) / step;
                for i in 0..count {
                    let base = offset + i * step;
                    let kind = match byte_at(page, base + 2 * int_len + 14)? {
                        1 => ColumnKind::Numeric,
                        _ => ColumnKind::Character,
                    };
                    self.attributes.push(Attribute {
                        offset: layout.usize(page, base + int_len + 8)?,
                        length: layout.u32(page, base + 2 * int_len + 8)? as usize,
                        kind,
                    });
                }
            }
            SubheaderKind::FormatAndLabel => {
                let base = offset + 3 * int_len;
                if length < 3 * int_len + 34 {
                    trace!(length, "short format subheader");
                    self.formats.push(Default::default());
                    return Ok(());
                }
                let width = layout.u16(page, base)?;
                let decimals = layout.u16(page, base + 2)?;
                let name = self.text_ref(page, layout, base + 22, true)?.unwrap_or_default();
                let label = self.text_ref(page, layout, base + 28, true)?.unwrap_or_default();
                self.formats
                    .push((DisplayFormat::new(name, width, decimals), label));
            }
            SubheaderKind::SubheaderCounts | SubheaderKind::ColumnList => {}
        }
        Ok(())
    }

    /// Resolve a `(block, offset, length)` reference into the text blocks.
    /// With `clamp`, an out-of-range block index falls back to the last block.
    fn text_ref(
        &self,
        page: &[u8],
        layout: Layout,
        at: usize,
        clamp: bool,
    ) -> Result<Option<String>> {
        let mut index = usize::from(layout.u16(page, at)?);
        let start = usize::from(layout.u16(page, at + 2)?);
        let len = usize::from(layout.u16(page, at + 4)?);
        if clamp && !self.text_blocks.is_empty() {
            index = index.min(self.text_blocks.len() - 1);
        }
        Ok(self
            .text_blocks
            .get(index)
            .and_then(|block| block.get(start..start + len))
            .map(header_text))
    }

    fn columns(&self) -> Result<Vec<SasColumn>> {
        let count = self.column_count.unwrap_or(self.names.len());
        if self.names.len() < count || self.attributes.len() < count {
            return Err(parse_error(format!(
                "incomplete column metadata: {} columns declared, {} names, {} attributes",
                count,
                self.names.len(),
                self.attributes.len()
            )));
        }

        (0..count)
            .map(|i| {
                let attr = self.attributes[i];
                let end = attr.offset.checked_add(attr.length);
                if end.map_or(true, |end| end > self.row_length) {
                    return Err(parse_error(format!(
                        "column {} lies outside the {}-byte row",
                        self.names[i], self.row_length
                    )));
                }
                if attr.kind == ColumnKind::Numeric && !(1..=8).contains(&attr.length) {
                    return Err(parse_error(format!(
                        "numeric column {} has width {}",
                        self.names[i], attr.length
                    )));
                }
                let (format, label) = self.formats.get(i).cloned().unwrap_or_default();
                Ok(SasColumn {
                    name: self.names[i].clone(),
                    label,
                    format,
                    kind: attr.kind,
                    offset: attr.offset,
                    length: attr.length,
                })
            })
            .collect()
    }
}

fn detect_compression(block: &[u8]) -> Compression {
    let contains = |literal: &[u8]| block.windows(literal.len()).any(|w| w == literal);
    if contains(RLE_LITERAL) {
        Compression::Rle
    } else if contains(RDC_LITERAL) {
        Compression::Rdc
    } else {
        Compression::None
    }
}

/// Collects decoded rows once the column layout is known
struct RowSink {
    columns: Vec<SasColumn>,
    temporal: Vec<Option<Temporal>>,
    dataset: Dataset,
    layout: Layout,
    row_length: usize,
    row_count: usize,
    compression: Compression,
}

impl RowSink {
    fn new(meta: &Metadata, layout: Layout) -> Result<Self> {
        let columns = meta.columns()?;
        let dataset = Dataset::new(columns.iter().map(|c| c.name.clone()).collect());
        let temporal = columns.iter().map(|c| Temporal::of(&c.format)).collect();
        Ok(Self {
            columns,
            temporal,
            dataset,
            layout,
            row_length: meta.row_length,
            row_count: meta.row_count,
            compression: meta.compression,
        })
    }

    fn is_full(&self) -> bool {
        self.dataset.row_count() >= self.row_count
    }

    fn push(&mut self, raw: &[u8]) -> Result<()> {
        if self.is_full() {
            return Ok(());
        }

        let expanded;
        let row = if self.compression != Compression::None && raw.len() < self.row_length {
            expanded = match self.compression {
                Compression::Rle => decompress::rle(raw, self.row_length)?,
                _ => decompress::rdc(raw, self.row_length)?,
            };
            &expanded[..]
        } else {
            raw
        };

        let values = self
            .columns
            .iter()
            .zip(&self.temporal)
            .map(|(column, temporal)| {
                let cell = bytes_at(row, column.offset, column.length)?;
                Ok(match column.kind {
                    ColumnKind::Numeric => match (self.layout.numeric(cell), temporal) {
                        (None, _) => Value::Null,
                        (Some(n), Some(temporal)) => temporal.decode(n),
                        (Some(n), None) => Value::Number(n),
                    },
                    ColumnKind::Character => Value::String(header_text(cell)),
                })
            })
            .collect::<Result<Vec<_>>>()?;
        self.dataset.push_row(values)
    }
}

/// Parse a SAS7BDAT file. Needs random access: pages are addressed by
/// offset from the header.
pub fn parse<R: Read + Seek>(mut source: R) -> Result<Sas7bdat> {
    let header = read_header(&mut source)?;
    let layout = header.layout;

    let file_length = source.seek(SeekFrom::End(0))?;
    if header.page_length as u64 > file_length {
        return Err(parse_error(format!(
            "page length {} exceeds the {}-byte file",
            header.page_length, file_length
        )));
    }
    let body = file_length.saturating_sub(header.header_length as u64);
    let page_length = header.page_length as u64;
    let pages = body / page_length;
    if body % page_length != 0 {
        debug!(trailing = body % page_length, "ignoring partial trailing page");
    }
    if pages != header.page_count {
        debug!(declared = header.page_count, found = pages, "page count mismatch");
    }

    let bit_offset = layout.page_bit_offset();
    let mut meta = Metadata::default();
    let mut sink: Option<RowSink> = None;
    let mut page = vec![0u8; header.page_length];

    for index in 0..pages {
        source.seek(SeekFrom::Start(header.header_length as u64 + index * page_length))?;
        source.read_exact(&mut page)?;

        let page_type = layout.u16(&page, bit_offset)? & PAGE_TYPE_MASK;
        let block_count = usize::from(layout.u16(&page, bit_offset + 2)?);
        let subheader_count = usize::from(layout.u16(&page, bit_offset + 4)?);

        let row_subheaders = match page_type {
            PAGE_META | PAGE_META2 | PAGE_AMD | PAGE_MIX => {
                meta.process_page(&page, layout, subheader_count)?
            }
            PAGE_DATA => Vec::new(),
            other => {
                trace!(page = index, page_type = other, "skipping page");
                continue;
            }
        };

        let has_rows =
            !row_subheaders.is_empty() || page_type == PAGE_DATA || page_type == PAGE_MIX;
        if !has_rows {
            continue;
        }
        if sink.is_none() {
            sink = Some(RowSink::new(&meta, layout)?);
        }
        let Some(rows) = sink.as_mut() else {
            continue;
        };

        for (offset, length) in row_subheaders {
            rows.push(bytes_at(&page, offset, length)?)?;
        }

        let row_length = rows.row_length;
        if row_length > 0 && row_length <= page.len() {
            let (start, count) = match page_type {
                PAGE_MIX => {
                    let pointers_end = bit_offset
                        + SUBHEADER_POINTERS_OFFSET
                        + subheader_count * layout.pointer_len();
                    let start = pointers_end + pointers_end % 8;
                    (start, meta.row_count.min(meta.mix_page_row_count))
                }
                PAGE_DATA => (bit_offset + SUBHEADER_POINTERS_OFFSET, block_count),
                _ => (0, 0),
            };
            for i in 0..count {
                let row = i
                    .checked_mul(row_length)
                    .and_then(|o| o.checked_add(start))
                    .and_then(|offset| page.get(offset..offset.checked_add(row_length)?));
                let Some(row) = row else {
                    break;
                };
                if rows.is_full() {
                    break;
                }
                rows.push(row)?;
            }
        }

        if rows.is_full() {
            break;
        }
    }

    let (columns, dataset) = match sink {
        Some(rows) => (rows.columns, rows.dataset),
        None => {
            let columns = meta.columns()?;
            let dataset = Dataset::new(columns.iter().map(|c| c.name.clone()).collect());
            (columns, dataset)
        }
    };

    if dataset.row_count() < meta.row_count {
        debug!(
            expected = meta.row_count,
            found = dataset.row_count(),
            "file holds fewer rows than declared"
        );
    }

    Ok(Sas7bdat {
        header,
        columns,
        dataset,
    })
}
