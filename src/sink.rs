//! A `Write + Seek` sink that discards bytes but tracks position.
//!
//! Pass 1 of the split planner (§4.1) runs the cluster engine and EBML
//! writer exactly as pass 2 would, except it must not touch the real
//! output file -- only the byte *positions* it would have produced matter,
//! to size split candidates. `NullSink` gives pass 1 a real sink to render
//! into without allocating or writing the actual cluster bytes.

use std::io::{self, Seek, SeekFrom, Write};

#[derive(Debug, Default)]
pub struct NullSink {
    pos: u64,
    len: u64,
}

impl NullSink {
    pub fn new() -> Self {
        Self { pos: 0, len: 0 }
    }
}

impl Write for NullSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.pos += buf.len() as u64;
        self.len = self.len.max(self.pos);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Seek for NullSink {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let new_pos = match pos {
            SeekFrom::Start(p) => p as i64,
            SeekFrom::End(p) => self.len as i64 + p,
            SeekFrom::Current(p) => self.pos as i64 + p,
        };
        if new_pos < 0 {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "seek to negative position"));
        }
        self.pos = new_pos as u64;
        self.len = self.len.max(self.pos);
        Ok(self.pos)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_advances_position_without_storing_bytes() {
        let mut sink = NullSink::new();
        sink.write_all(&[0u8; 100]).unwrap();
        assert_eq!(sink.stream_position().unwrap(), 100);
    }

    #[test]
    fn seek_then_write_patches_in_place_like_a_real_file_would() {
        let mut sink = NullSink::new();
        sink.write_all(&[0u8; 16]).unwrap();
        sink.seek(SeekFrom::Start(4)).unwrap();
        sink.write_all(&[0u8; 4]).unwrap();
        assert_eq!(sink.stream_position().unwrap(), 8);
        sink.seek(SeekFrom::End(0)).unwrap();
        assert_eq!(sink.stream_position().unwrap(), 16);
    }
}
