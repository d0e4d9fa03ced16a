use serde::{Deserialize, Serialize};

/// A byte range of the input produced by the chunker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChunkSpan {
    /// Offset of the first byte in the original stream
    pub offset: usize,

    /// Number of bytes (always > 0)
    pub len: usize,
}

impl ChunkSpan {
    /// Create a new span
    #[must_use]
    pub const fn new(offset: usize, len: usize) -> Self {
        Self { offset, len }
    }

    /// Offset one past the last byte
    #[must_use]
    pub const fn end(&self) -> usize {
        self.offset + self.len
    }

    /// Borrow the bytes of this span from the stream it was cut from
    ///
    /// Returns `None` when the span does not fit inside `data`.
    #[must_use]
    pub fn slice<'a>(&self, data: &'a [u8]) -> Option<&'a [u8]> {
        data.get(self.offset..self.end())
    }
}

/// A span together with the bytes it covers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Chunk<'a> {
    pub span: ChunkSpan,
    pub data: &'a [u8],
}

impl<'a> Chunk<'a> {
    #[must_use]
    pub const fn offset(&self) -> usize {
        self.span.offset
    }

    #[must_use]
    pub const fn len(&self) -> usize {
        self.span.len
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.span.len == 0
    }
}
