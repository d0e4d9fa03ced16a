use crate::config::{ChunkerConfig, MAX_WINDOW_SIZE};
use crate::error::{ChunkerError, Result};
use crate::types::{Chunk, ChunkSpan};

/// Content-defined chunker using a Buzhash rolling hash
pub struct Chunker {
    config: ChunkerConfig,
    mask: u64,
    table: [u64; 256],
}

impl Chunker {
    /// Create a new chunker with configuration
    pub fn new(config: ChunkerConfig) -> Result<Self> {
        config.validate().map_err(ChunkerError::invalid_config)?;

        let mask = config.mask();
        log::debug!(
            "Chunker configured: min={} target={} max={} window={} mask={mask:#x}",
            config.min_size,
            config.target_size,
            config.max_size,
            config.window_size
        );

        Ok(Self {
            config,
            mask,
            table: buzhash_table(),
        })
    }

    /// Get the chunker configuration
    pub fn config(&self) -> &ChunkerConfig {
        &self.config
    }

    /// Lazily split `data` into spans
    pub fn spans<'a>(&'a self, data: &'a [u8]) -> Spans<'a> {
        Spans {
            chunker: self,
            data,
            pos: 0,
        }
    }

    /// Split `data` into chunks borrowing the input
    pub fn chunk<'a>(&'a self, data: &'a [u8]) -> Vec<Chunk<'a>> {
        self.spans(data)
            .map(|span| Chunk {
                span,
                data: &data[span.offset..span.end()],
            })
            .collect()
    }

    /// Length of the next atom starting at `data[0]`
    fn next_cut(&self, data: &[u8]) -> usize {
        let min = self.config.min_size;
        let max = self.config.max_size.min(data.len());
        if data.len() <= min {
            return data.len();
        }

        let window_size = self.config.window_size;
        let mut window = [0u8; MAX_WINDOW_SIZE];
        let mut window_pos = 0usize;
        let mut window_len = 0usize;
        let mut hash = 0u64;

        // With a full window the hash only depends on the window bytes, so
        // scanning can start one window before the first eligible cut.
        let start = min.saturating_sub(window_size);
        for (i, &byte) in data.iter().enumerate().take(max).skip(start) {
            hash = hash.rotate_left(1) ^ self.table[byte as usize];
            if window_len == window_size {
                let old = window[window_pos];
                hash ^= self.table[old as usize].rotate_left((window_size % 64) as u32);
            } else {
                window_len += 1;
            }
            window[window_pos] = byte;
            window_pos = (window_pos + 1) % window_size;

            let size = i + 1;
            if size >= min && hash & self.mask == 0 {
                return size;
            }
        }

        max
    }
}

/// Lazy, finite iterator over the spans of one input
pub struct Spans<'a> {
    chunker: &'a Chunker,
    data: &'a [u8],
    pos: usize,
}

impl Iterator for Spans<'_> {
    type Item = ChunkSpan;

    fn next(&mut self) -> Option<Self::Item> {
        if self.pos >= self.data.len() {
            return None;
        }

        let len = self.chunker.next_cut(&self.data[self.pos..]);
        let span = ChunkSpan::new(self.pos, len);
        self.pos += len;
        Some(span)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.data.len() - self.pos;
        if remaining == 0 {
            return (0, Some(0));
        }
        let max = self.chunker.config.max_size;
        let min = self.chunker.config.min_size;
        (remaining.div_ceil(max), Some(remaining.div_ceil(min)))
    }
}

impl std::iter::FusedIterator for Spans<'_> {}

/// Pseudo-random Buzhash table, fixed so fingerprints stay stable across runs
fn buzhash_table() -> [u64; 256] {
    let mut table = [0u64; 256];
    let mut state = 0x1234_5678_9ABC_DEF0u64;
    for entry in &mut table {
        // xorshift64
        state ^= state << 13;
        state ^= state >> 7;
        state ^= state << 17;
        *entry = state;
    }
    table
}
