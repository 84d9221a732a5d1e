//! Line codec and the compact record every in-memory stage sorts.
//!
//! A line looks like `<number>.<optional space><text>`. The text after the separator is the sort key; the number only
//! breaks ties between equal keys.

use crate::error::{Result, SortError};

use bytemuck::allocation::zeroed_vec;
use bytemuck::{Pod, Zeroable};
use memchr::{memchr, memchr_iter};
use std::cmp::Ordering;

/// Where the pieces of one line are, relative to the start of the line.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LineFields {
    pub number: u32,
    pub key_start: usize,
    pub key_len: usize,
}

/// Splits one line (without its `\n`) into number and key.
///
/// An empty line is accepted as a degenerate entry with number 0 and an empty key.
pub fn parse_fields(line: &[u8]) -> std::result::Result<LineFields, &'static str> {
    if line.is_empty() {
        return Ok(LineFields {
            number: 0,
            key_start: 0,
            key_len: 0,
        });
    }

    let dot = memchr(b'.', line).ok_or("missing '.' separator")?;
    if dot == 0 {
        return Err("missing leading number");
    }

    let mut number: u32 = 0;
    for &digit in &line[..dot] {
        if !digit.is_ascii_digit() {
            return Err("leading number is not decimal");
        }
        number = number
            .checked_mul(10)
            .and_then(|n| n.checked_add(u32::from(digit - b'0')))
            .ok_or("leading number does not fit in 32 bits")?;
    }

    let mut key_start = dot + 1;
    if line.get(key_start) == Some(&b' ') {
        key_start += 1;
    }
    let mut key_end = line.len();
    if key_end > key_start && line[key_end - 1] == b'\r' {
        key_end -= 1;
    }

    Ok(LineFields {
        number,
        key_start,
        key_len: key_end - key_start,
    })
}

/// Packs the first 8 bytes of `key` big-endian, zero padded, so that integer order matches byte order.
#[inline]
pub fn encode_prefix(key: &[u8]) -> u64 {
    let mut bytes = [0u8; 8];
    let n = key.len().min(8);
    bytes[..n].copy_from_slice(&key[..n]);
    u64::from_be_bytes(bytes)
}

/// The full ordering of a line: key bytes first (with the packed prefix as a fast path), then the number.
///
/// Field order matters: the derived `Ord` compares `prefix`, then `key`, then `number`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct SortKey<'a> {
    pub prefix: u64,
    pub key: &'a [u8],
    pub number: u32,
}

/// A view of one line inside a raw buffer. Never owns text.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct Record {
    pub prefix: u64,
    pub line_offset: u32,
    pub number: u32,
    pub key_offset: u16,
    pub line_len: u16,
    pub key_len: u16,
    pub buffer_index: u16,
}

impl Record {
    /// Parses the line `data[line_offset..line_offset + line_len]`.
    pub fn parse(data: &[u8], line_offset: usize, line_len: usize, buffer_index: u16) -> Result<Self> {
        let line = &data[line_offset..line_offset + line_len];
        let malformed = |reason| SortError::Parse {
            line: String::from_utf8_lossy(&line[..line.len().min(80)]).into_owned(),
            reason,
        };

        let line_len = u16::try_from(line.len()).map_err(|_| malformed("line longer than 65535 bytes"))?;
        let line_offset = u32::try_from(line_offset).map_err(|_| malformed("line starts beyond 4 GiB"))?;
        let fields = parse_fields(line).map_err(malformed)?;

        Ok(Self {
            prefix: encode_prefix(&line[fields.key_start..fields.key_start + fields.key_len]),
            line_offset,
            number: fields.number,
            // Both fit because the whole line does.
            key_offset: fields.key_start as u16,
            line_len,
            key_len: fields.key_len as u16,
            buffer_index,
        })
    }

    #[inline]
    pub fn line<'a>(&self, data: &'a [u8]) -> &'a [u8] {
        let start = self.line_offset as usize;
        &data[start..start + self.line_len as usize]
    }

    #[inline]
    pub fn key<'a>(&self, data: &'a [u8]) -> &'a [u8] {
        let start = self.line_offset as usize + self.key_offset as usize;
        &data[start..start + self.key_len as usize]
    }

    #[inline]
    pub fn sort_key<'a>(&self, data: &'a [u8]) -> SortKey<'a> {
        SortKey {
            prefix: self.prefix,
            key: self.key(data),
            number: self.number,
        }
    }
}

/// Orders two records, each resolved against the buffer that holds its text.
#[inline]
pub fn compare(a: &Record, a_data: &[u8], b: &Record, b_data: &[u8]) -> Ordering {
    a.sort_key(a_data).cmp(&b.sort_key(b_data))
}

/// Number of lines in `data`, counting a final line without `\n`.
pub fn count_lines(data: &[u8]) -> usize {
    let newlines = memchr_iter(b'\n', data).count();
    match data.last() {
        Some(b'\n') | None => newlines,
        Some(_) => newlines + 1,
    }
}

/// Parses every line of `data` into a record array sized exactly to the line count.
pub fn parse_lines(data: &[u8], buffer_index: u16) -> Result<Vec<Record>> {
    let mut records: Vec<Record> = zeroed_vec(count_lines(data));
    let mut start = 0;
    for record in &mut records {
        let end = memchr(b'\n', &data[start..]).map_or(data.len(), |i| start + i);
        *record = Record::parse(data, start, end - start, buffer_index)?;
        start = end + 1;
    }
    debug_assert!(start >= data.len());
    Ok(records)
}
