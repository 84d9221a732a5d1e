use crate::buffer::RawBuffer;
use crate::error::Result;
use crate::record::{compare, parse_lines, Record};

use std::cmp::Ordering;
use std::convert::Infallible;
use std::io::{self, Write};

/// A sorted group of records together with the raw buffers their text lives in.
///
/// Merging two runs moves both buffer lists into the result and re-indexes the second run's records; character data is
/// never copied.
pub struct Run {
    records: Vec<Record>,
    buffers: Vec<RawBuffer>,
    pub rank: i32,
}

#[derive(Clone, Copy)]
enum Side {
    A,
    B,
}

impl Run {
    /// Parses and sorts one filled buffer.
    pub fn sort_buffer(buffer: RawBuffer, rank: i32) -> Result<Self> {
        let mut records = parse_lines(buffer.filled(), 0)?;
        let data = buffer.filled();
        records.sort_unstable_by(|a, b| compare(a, data, b, data));
        Ok(Self {
            records,
            buffers: vec![buffer],
            rank,
        })
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn buffer_count(&self) -> usize {
        self.buffers.len()
    }

    /// Iterates the lines in sorted order, zero-length lines included.
    pub fn lines(&self) -> impl Iterator<Item = &[u8]> + '_ {
        self.records.iter().map(move |r| self.line_of(r))
    }

    #[inline]
    fn data_of(&self, record: &Record) -> &[u8] {
        self.buffers[record.buffer_index as usize].filled()
    }

    #[inline]
    fn line_of(&self, record: &Record) -> &[u8] {
        record.line(self.data_of(record))
    }

    /// Folds two runs into one. The result's rank is one below the smaller input rank.
    pub fn merge(a: Run, b: Run) -> Run {
        let span = tracing::info_span!("merge_runs_in_memory");
        let _guard = span.enter();

        // The rank table caps a run at 2^15 buffers.
        debug_assert!(a.buffers.len() < usize::from(u16::MAX));
        let shift = a.buffers.len() as u16;
        let mut records = Vec::with_capacity(a.len() + b.len());
        let visited = merge_walk(&a, &b, |side, record| {
            records.push(match side {
                Side::A => *record,
                Side::B => Record {
                    buffer_index: record.buffer_index + shift,
                    ..*record
                },
            });
            Ok::<_, Infallible>(())
        });
        visited.unwrap_or_else(|never| match never {});

        let rank = a.rank.min(b.rank) - 1;
        let mut buffers = a.buffers;
        buffers.extend(b.buffers);

        Run {
            records,
            buffers,
            rank,
        }
    }

    /// Writes every non-empty line, `\n` terminated.
    pub fn write_to(&self, mut writer: impl Write) -> io::Result<u64> {
        let mut written = 0;
        for record in &self.records {
            written += write_line(&mut writer, self.line_of(record))?;
        }
        Ok(written)
    }

    /// Streams the merge of `self` and `other` into `writer` without materialising the merged run.
    pub fn merge_to(&self, other: &Run, mut writer: impl Write) -> io::Result<u64> {
        let span = tracing::info_span!("merge_runs_to_file");
        let _guard = span.enter();

        let mut written = 0;
        merge_walk(self, other, |side, record| {
            let line = match side {
                Side::A => self.line_of(record),
                Side::B => other.line_of(record),
            };
            written += write_line(&mut writer, line)?;
            Ok::<(), io::Error>(())
        })?;
        Ok(written)
    }
}

fn write_line(writer: &mut impl Write, line: &[u8]) -> io::Result<u64> {
    if line.is_empty() {
        return Ok(0);
    }
    writer.write_all(line)?;
    writer.write_all(b"\n")?;
    Ok(line.len() as u64 + 1)
}

/// Two-pointer merge of `a` and `b`, visiting records in ascending order. On equal records `b` goes first, which only
/// happens for byte-identical lines.
fn merge_walk<E>(
    a: &Run,
    b: &Run,
    mut visit: impl FnMut(Side, &Record) -> std::result::Result<(), E>,
) -> std::result::Result<(), E> {
    let (mut i, mut j) = (0, 0);
    while i < a.records.len() && j < b.records.len() {
        let (ra, rb) = (&a.records[i], &b.records[j]);
        if compare(ra, a.data_of(ra), rb, b.data_of(rb)) == Ordering::Less {
            visit(Side::A, ra)?;
            i += 1;
        } else {
            visit(Side::B, rb)?;
            j += 1;
        }
    }
    for record in &a.records[i..] {
        visit(Side::A, record)?;
    }
    for record in &b.records[j..] {
        visit(Side::B, record)?;
    }
    Ok(())
}
