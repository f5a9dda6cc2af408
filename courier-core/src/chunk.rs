//! Chunk manager: split a file into fixed-size chunks, track which indices arrived.

use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::Path;

/// Default chunk size in bytes.
pub const DEFAULT_CHUNK_SIZE: u64 = 1024 * 1024; // 1 MiB

/// Largest chunk size accepted; keeps every chunk frame under the wire limit.
pub const MAX_CHUNK_SIZE: u64 = 8 * 1024 * 1024;

/// Number of chunks for a file of `size` bytes. A zero-byte file still gets one (empty) chunk.
pub fn chunk_count(size: u64, chunk_size: u64) -> u64 {
    let chunk_size = effective_chunk_size(chunk_size);
    size.div_ceil(chunk_size).max(1)
}

/// Zero falls back to the default; oversized values are clamped.
pub fn effective_chunk_size(chunk_size: u64) -> u64 {
    match chunk_size {
        0 => DEFAULT_CHUNK_SIZE,
        n => n.min(MAX_CHUNK_SIZE),
    }
}

/// Expected payload length of chunk `index`.
pub fn expected_len(size: u64, chunk_size: u64, index: u64) -> u64 {
    let start = index.saturating_mul(chunk_size);
    size.saturating_sub(start).min(chunk_size)
}

/// Reads a file as `total` chunks in strictly increasing index order.
pub struct ChunkReader {
    reader: BufReader<File>,
    chunk_size: u64,
    size: u64,
    total: u64,
    next: u64,
}

impl ChunkReader {
    pub fn open(path: &Path, chunk_size: u64) -> io::Result<Self> {
        let file = File::open(path)?;
        let size = file.metadata()?.len();
        let chunk_size = effective_chunk_size(chunk_size);
        Ok(Self {
            reader: BufReader::new(file),
            chunk_size,
            size,
            total: chunk_count(size, chunk_size),
            next: 0,
        })
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    pub fn chunk_size(&self) -> u64 {
        self.chunk_size
    }
}

impl Iterator for ChunkReader {
    type Item = io::Result<(u64, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.next >= self.total {
            return None;
        }
        let index = self.next;
        self.next += 1;
        let len = expected_len(self.size, self.chunk_size, index) as usize;
        let mut buf = vec![0u8; len];
        Some(self.reader.read_exact(&mut buf).map(|_| (index, buf)))
    }
}

/// Most chunks one transfer may have. Bounds receiver bookkeeping to 2 MiB per download.
pub const MAX_CHUNKS: u64 = 1 << 24;

/// Which chunk indices of one transfer have arrived, one bit per index.
pub struct ReceivedSet {
    bits: Vec<u64>,
    total: u64,
    count: u64,
}

impl ReceivedSet {
    /// `None` when `total` is zero or above `MAX_CHUNKS`.
    pub fn new(total: u64) -> Option<Self> {
        if total == 0 || total > MAX_CHUNKS {
            return None;
        }
        Some(Self {
            bits: vec![0; total.div_ceil(64) as usize],
            total,
            count: 0,
        })
    }

    /// Record an index. Returns false for duplicates and out-of-range indices.
    pub fn mark(&mut self, index: u64) -> bool {
        if index >= self.total {
            return false;
        }
        let (word, bit) = ((index / 64) as usize, 1u64 << (index % 64));
        if self.bits[word] & bit != 0 {
            return false;
        }
        self.bits[word] |= bit;
        self.count += 1;
        true
    }

    pub fn contains(&self, index: u64) -> bool {
        index < self.total && self.bits[(index / 64) as usize] & (1u64 << (index % 64)) != 0
    }

    pub fn is_complete(&self) -> bool {
        self.count == self.total
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    pub fn received(&self) -> u64 {
        self.count
    }

    pub fn missing(&self) -> u64 {
        self.total - self.count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const C: u64 = 64;

    fn write_file(dir: &Path, len: usize) -> (std::path::PathBuf, Vec<u8>) {
        let path = dir.join(format!("f{}.bin", len));
        let data: Vec<u8> = (0..len).map(|i| (i * 7 % 256) as u8).collect();
        File::create(&path).unwrap().write_all(&data).unwrap();
        (path, data)
    }

    #[test]
    fn counts() {
        assert_eq!(chunk_count(0, C), 1);
        assert_eq!(chunk_count(1, C), 1);
        assert_eq!(chunk_count(C - 1, C), 1);
        assert_eq!(chunk_count(C, C), 1);
        assert_eq!(chunk_count(C + 1, C), 2);
        assert_eq!(chunk_count(10 * C, C), 10);
    }

    #[test]
    fn zero_chunk_size_uses_default() {
        assert_eq!(chunk_count(DEFAULT_CHUNK_SIZE * 2, 0), 2);
        assert_eq!(effective_chunk_size(u64::MAX), MAX_CHUNK_SIZE);
    }

    #[test]
    fn split_and_append_is_identity() {
        let dir = tempfile::tempdir().unwrap();
        for len in [0, 1, C - 1, C, C + 1, 10 * C] {
            let (path, data) = write_file(dir.path(), len as usize);
            let reader = ChunkReader::open(&path, C).unwrap();
            let total = reader.total();
            let mut out = Vec::new();
            let mut last_index = None;
            for item in reader {
                let (index, bytes) = item.unwrap();
                assert_eq!(last_index.map_or(0, |i| i + 1), index);
                assert_eq!(bytes.len() as u64, expected_len(len, C, index));
                out.extend_from_slice(&bytes);
                last_index = Some(index);
            }
            assert_eq!(last_index, Some(total - 1));
            assert_eq!(out, data, "size {}", len);
        }
    }

    #[test]
    fn zero_byte_file_yields_one_empty_chunk() {
        let dir = tempfile::tempdir().unwrap();
        let (path, _) = write_file(dir.path(), 0);
        let chunks: Vec<_> = ChunkReader::open(&path, C)
            .unwrap()
            .map(|c| c.unwrap())
            .collect();
        assert_eq!(chunks, vec![(0, Vec::new())]);
    }

    #[test]
    fn received_set_tracks_gaps() {
        let mut set = ReceivedSet::new(4).unwrap();
        assert!(set.mark(0));
        assert!(set.mark(3));
        assert!(!set.is_complete());
        assert_eq!(set.missing(), 2);
        assert!(!set.mark(3));
        assert!(!set.mark(4));
        assert!(set.mark(1));
        assert!(set.mark(2));
        assert!(set.is_complete());
        assert!(set.contains(2));
        assert_eq!(set.received(), 4);
    }

    #[test]
    fn received_set_spans_word_boundaries_and_is_bounded() {
        let mut set = ReceivedSet::new(130).unwrap();
        for i in [0, 63, 64, 127, 128, 129] {
            assert!(set.mark(i));
        }
        assert!(set.contains(64));
        assert!(!set.contains(65));
        assert!(!set.mark(130));
        assert_eq!(set.missing(), 124);

        assert!(ReceivedSet::new(0).is_none());
        assert!(ReceivedSet::new(MAX_CHUNKS).is_some());
        assert!(ReceivedSet::new(MAX_CHUNKS + 1).is_none());
        assert!(ReceivedSet::new(u64::MAX).is_none());
    }
}
