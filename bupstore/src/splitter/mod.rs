//! C1: the rolling-hash content splitter (spec.md §4.1).
//!
//! Cuts an arbitrary byte stream into a sequence of variable-length blobs using a
//! content-defined rolling checksum, so that inserting or deleting bytes anywhere in the
//! stream only perturbs the blobs adjacent to the edit (spec.md §8, "edit locality").
//! Each emitted blob carries a `level`: level 0 marks an ordinary cut, level `l > 0`
//! marks a cut that a level-`l` fold in the tree builder (C2) should also treat as a
//! boundary, so the tree above the blob layer stays shallow without needing to know
//! blob sizes.

mod rollsum;

use std::io::{self, Cursor, Read};

use rollsum::RollSum;

/// One cut blob, in stream order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub data: Vec<u8>,
    pub level: u32,
}

/// Splits a `Read` stream into content-defined chunks.
///
/// Restartable: two `Splitter`s fed the same bytes (regardless of how those bytes are
/// chunked into individual `read()` calls upstream) produce exactly the same cuts, since
/// the rolling window only depends on the byte sequence itself.
pub struct Splitter<R> {
    reader: R,
    min_size: usize,
    max_size: usize,
    blobbits: u32,
    roll: RollSum,
    done: bool,
}

impl<R: Read> Splitter<R> {
    pub fn new(reader: R) -> Self {
        Self::with_params(
            reader,
            shared::BLOB_MIN_SIZE,
            shared::BLOB_MAX_SIZE,
            shared::BLOBBITS,
        )
    }

    pub fn with_params(reader: R, min_size: usize, max_size: usize, blobbits: u32) -> Self {
        assert!(min_size <= max_size, "min_size must not exceed max_size");
        Self {
            reader,
            min_size,
            max_size,
            blobbits,
            roll: RollSum::new(),
            done: false,
        }
    }
}

impl<'a> Splitter<Cursor<&'a [u8]>> {
    pub fn from_slice(data: &'a [u8]) -> Self {
        Self::new(Cursor::new(data))
    }
}

impl<R: Read> Iterator for Splitter<R> {
    type Item = io::Result<Chunk>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        let mut data = Vec::new();
        let mut byte = [0u8; 1];

        loop {
            match self.reader.read(&mut byte) {
                Ok(0) => {
                    self.done = true;
                    if data.is_empty() {
                        return None;
                    }
                    return Some(Ok(Chunk { data, level: 0 }));
                }
                Ok(_) => {
                    data.push(byte[0]);
                    self.roll.roll(byte[0]);

                    if data.len() >= self.min_size {
                        if let Some(level) = self.roll.cut_level(self.blobbits) {
                            self.roll = RollSum::new();
                            return Some(Ok(Chunk { data, level }));
                        }
                    }

                    if data.len() >= self.max_size {
                        self.roll = RollSum::new();
                        return Some(Ok(Chunk { data, level: 0 }));
                    }
                }
                Err(e) => {
                    self.done = true;
                    return Some(Err(e));
                }
            }
        }
    }
}
