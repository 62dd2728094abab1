//! Builds small 32-bit little-endian SAS7BDAT files for tests.

use crate::temporal;
use crate::types::Value;

use super::parser::MAGIC;

const HEADER_LEN: usize = 1024;
const PAGE_LEN: usize = 8192;
const PAGE_HEADER_LEN: usize = 24;
const POINTER_LEN: usize = 12;
const TEXT_BLOCK_PREFIX: usize = 12;

pub struct FixtureColumn {
    pub name: &'static str,
    pub label: &'static str,
    pub numeric: bool,
    pub length: usize,
    pub format: (&'static str, u16, u16),
}

impl FixtureColumn {
    pub fn numeric(name: &'static str, label: &'static str) -> Self {
        Self {
            name,
            label,
            numeric: true,
            length: 8,
            format: ("", 0, 0),
        }
    }

    pub fn character(name: &'static str, label: &'static str, length: usize) -> Self {
        Self {
            name,
            label,
            numeric: false,
            length,
            format: ("", 0, 0),
        }
    }

    pub fn with_format(mut self, name: &'static str, width: u16, decimals: u16) -> Self {
        self.format = (name, width, decimals);
        self
    }
}

fn put_u16(buf: &mut [u8], at: usize, value: usize) {
    buf[at..at + 2].copy_from_slice(&(value as u16).to_le_bytes());
}

fn put_u32(buf: &mut [u8], at: usize, value: usize) {
    buf[at..at + 4].copy_from_slice(&(value as u32).to_le_bytes());
}

/// Append a string to the text block, returning its (offset, length)
fn add_text(block: &mut Vec<u8>, text: &str) -> (usize, usize) {
    let offset = block.len();
    block.extend_from_slice(text.as_bytes());
    while block.len() % 4 != 0 {
        block.push(0);
    }
    (offset, text.len())
}

fn put_text_ref(buf: &mut [u8], at: usize, (offset, len): (usize, usize)) {
    put_u16(buf, at, 0);
    put_u16(buf, at + 2, offset);
    put_u16(buf, at + 4, len);
}

fn encode_row(columns: &[FixtureColumn], row: &[Value]) -> Vec<u8> {
    let mut out = Vec::new();
    for (column, value) in columns.iter().zip(row) {
        if column.numeric {
            let number = temporal::to_sas_number(value).unwrap_or(f64::NAN);
            out.extend_from_slice(&number.to_le_bytes()[8 - column.length..]);
        } else {
            let text = value.to_text();
            let mut cell = text.into_bytes();
            cell.resize(column.length, b' ');
            out.extend_from_slice(&cell);
        }
    }
    out
}

/// Naive RLE: runs of three or more equal bytes become fills, the rest
/// literal copies of up to 16 bytes.
fn rle_encode(row: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    let mut literal: Vec<u8> = Vec::new();
    let flush = |literal: &mut Vec<u8>, out: &mut Vec<u8>| {
        for chunk in literal.chunks(16) {
            out.push(0x80 | (chunk.len() as u8 - 1));
            out.extend_from_slice(chunk);
        }
        literal.clear();
    };

    let mut i = 0;
    while i < row.len() {
        let byte = row[i];
        let run = row[i..].iter().take(18).take_while(|&&b| b == byte).count();
        if run >= 3 {
            flush(&mut literal, &mut out);
            out.push(0xc0 | (run as u8 - 3));
            out.push(byte);
            i += run;
        } else {
            literal.push(byte);
            i += 1;
        }
    }
    flush(&mut literal, &mut out);
    out
}

/// Lay subheaders out on a metadata page. Each entry is the subheader bytes
/// with its pointer's compression and type flags.
fn meta_page(subheaders: &[(Vec<u8>, u8, u8)]) -> Vec<u8> {
    let mut page = vec![0u8; PAGE_LEN];
    put_u16(&mut page, 16, 0);
    put_u16(&mut page, 18, subheaders.len());
    put_u16(&mut page, 20, subheaders.len());

    // Subheaders are packed from the end of the page backwards
    let mut end = PAGE_LEN;
    for (i, (body, compression, kind)) in subheaders.iter().enumerate() {
        let offset = end - body.len();
        assert!(
            offset >= PAGE_HEADER_LEN + subheaders.len() * POINTER_LEN,
            "fixture metadata does not fit one page"
        );
        page[offset..end].copy_from_slice(body);
        let pointer = PAGE_HEADER_LEN + i * POINTER_LEN;
        put_u32(&mut page, pointer, offset);
        put_u32(&mut page, pointer + 4, body.len());
        page[pointer + 8] = *compression;
        page[pointer + 9] = *kind;
        end = offset;
    }
    page
}

fn data_pages(rows: &[Vec<u8>], row_length: usize) -> Vec<Vec<u8>> {
    let per_page = (PAGE_LEN - PAGE_HEADER_LEN) / row_length.max(1);
    rows.chunks(per_page.max(1))
        .map(|chunk| {
            let mut page = vec![0u8; PAGE_LEN];
            put_u16(&mut page, 16, 0x0100);
            put_u16(&mut page, 18, chunk.len());
            for (i, row) in chunk.iter().enumerate() {
                let at = PAGE_HEADER_LEN + i * row_length;
                page[at..at + row_length].copy_from_slice(row);
            }
            page
        })
        .collect()
}

/// Build a complete file holding `rows`. With `compressed`, rows are RLE
/// packed and stored as subheaders on the metadata page.
pub fn build(
    dataset_name: &str,
    columns: &[FixtureColumn],
    rows: &[Vec<Value>],
    compressed: bool,
) -> Vec<u8> {
    let row_length: usize = columns.iter().map(|c| c.length).sum();
    let n = columns.len();

    let mut text = vec![0u8; TEXT_BLOCK_PREFIX];
    if compressed {
        text[2..10].copy_from_slice(b"SASYZCRL");
    }
    let names: Vec<_> = columns.iter().map(|c| add_text(&mut text, c.name)).collect();
    let labels: Vec<_> = columns.iter().map(|c| add_text(&mut text, c.label)).collect();
    let formats: Vec<_> = columns
        .iter()
        .map(|c| add_text(&mut text, c.format.0))
        .collect();
    let text_len = text.len();
    put_u16(&mut text, 0, text_len);

    let mut row_size = vec![0u8; 480];
    row_size[..4].copy_from_slice(&[0xf7; 4]);
    put_u32(&mut row_size, 20, row_length);
    put_u32(&mut row_size, 24, rows.len());
    put_u32(&mut row_size, 36, n);

    let mut col_size = vec![0u8; 12];
    col_size[..4].copy_from_slice(&[0xf6; 4]);
    put_u32(&mut col_size, 4, n);

    let mut col_text = vec![0xfd, 0xff, 0xff, 0xff];
    col_text.extend_from_slice(&text);

    let mut col_name = vec![0u8; 20 + 8 * n];
    col_name[..4].copy_from_slice(&[0xff; 4]);
    for (i, name) in names.iter().enumerate() {
        put_text_ref(&mut col_name, 12 + 8 * i, *name);
    }

    let mut col_attr = vec![0u8; 20 + 12 * n];
    col_attr[..4].copy_from_slice(&[0xfc, 0xff, 0xff, 0xff]);
    let mut offset = 0;
    for (i, column) in columns.iter().enumerate() {
        put_u32(&mut col_attr, 12 + 12 * i, offset);
        put_u32(&mut col_attr, 16 + 12 * i, column.length);
        col_attr[22 + 12 * i] = if column.numeric { 1 } else { 2 };
        offset += column.length;
    }

    let mut subheaders = vec![
        (row_size, 0, 0),
        (col_size, 0, 0),
        (col_text, 0, 0),
        (col_name, 0, 0),
        (col_attr, 0, 0),
    ];
    for (i, column) in columns.iter().enumerate() {
        let mut format = vec![0u8; 52];
        format[..4].copy_from_slice(&[0xfe, 0xfb, 0xff, 0xff]);
        put_u16(&mut format, 12, usize::from(column.format.1));
        put_u16(&mut format, 14, usize::from(column.format.2));
        put_text_ref(&mut format, 34, formats[i]);
        put_text_ref(&mut format, 40, labels[i]);
        subheaders.push((format, 0, 0));
    }

    let encoded: Vec<Vec<u8>> = rows.iter().map(|r| encode_row(columns, r)).collect();
    let mut pages = Vec::new();
    if compressed {
        for row in &encoded {
            let packed = rle_encode(row);
            assert!(packed.len() < row_length, "fixture row does not compress");
            subheaders.push((packed, 4, 1));
        }
        pages.push(meta_page(&subheaders));
    } else {
        pages.push(meta_page(&subheaders));
        pages.extend(data_pages(&encoded, row_length));
    }

    let mut header = vec![0u8; HEADER_LEN];
    header[..32].copy_from_slice(&MAGIC);
    header[32] = 0x22;
    header[35] = 0x22;
    header[37] = 0x01;
    header[39] = b'1';
    header[70] = 20;
    header[92..92 + dataset_name.len()].copy_from_slice(dataset_name.as_bytes());
    header[156..164].copy_from_slice(b"DATA    ");
    // 2020-01-01 in seconds since 1960
    let created = 1_893_456_000.0f64;
    header[164..172].copy_from_slice(&created.to_le_bytes());
    header[172..180].copy_from_slice(&created.to_le_bytes());
    put_u32(&mut header, 196, HEADER_LEN);
    put_u32(&mut header, 200, PAGE_LEN);
    put_u32(&mut header, 204, pages.len());
    header[216..224].copy_from_slice(b"9.0401M0");
    header[224..232].copy_from_slice(b"X64_7PRO");
    header[272..277].copy_from_slice(b"Linux");

    let mut file = header;
    for page in pages {
        file.extend_from_slice(&page);
    }
    file
}
