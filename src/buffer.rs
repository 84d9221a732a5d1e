use memchr::memrchr;
use std::io::{self, Read};

/// One physically read slice of the input file.
///
/// The first `start_offset` bytes are the unfinished last line of the previous buffer, carried over by copy so the file
/// is never re-read. Only `data[..filled_len]` holds complete lines.
pub struct RawBuffer {
    data: Box<[u8]>,
    pub start_offset: usize,
    pub filled_len: usize,
}

impl RawBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            data: vec![0; capacity].into_boxed_slice(),
            start_offset: 0,
            filled_len: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// The complete lines held by this buffer.
    pub fn filled(&self) -> &[u8] {
        &self.data[..self.filled_len]
    }

    /// Position of the last `\n` within the first `end` bytes.
    pub fn last_newline(&self, end: usize) -> Option<usize> {
        memrchr(b'\n', &self.data[..end])
    }

    /// Starts the next buffer with the bytes of `self` in `from..end`.
    pub fn carry_into(&self, from: usize, end: usize, next: &mut RawBuffer) {
        let tail = &self.data[from..end];
        next.data[..tail.len()].copy_from_slice(tail);
        next.start_offset = tail.len();
    }

    /// Reads from `reader` after the carried-over prefix until the buffer is full or the reader is exhausted.
    ///
    /// Returns the number of bytes read; fewer than requested means end of input.
    pub fn fill_from(&mut self, reader: &mut impl Read) -> io::Result<usize> {
        let mut read = 0;
        let free = &mut self.data[self.start_offset..];
        while read < free.len() {
            match reader.read(&mut free[read..]) {
                Ok(0) => break,
                Ok(n) => read += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        Ok(read)
    }
}
