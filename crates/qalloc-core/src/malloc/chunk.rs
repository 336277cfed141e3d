//! Chunk header layout.
//!
//! Every span of the heap is preceded by a fixed-size header of four machine
//! words:
//!
//! ```text
//! offset 0          8          16         24         32
//!        ┌──────────┬──────────┬──────────┬──────────┬─────────────────────┐
//!        │   size   │   next   │   prev   │   free   │  size usable bytes  │
//!        └──────────┴──────────┴──────────┴──────────┴─────────────────────┘
//!                                                    ▲
//!                                                    └── user pointer
//! ```
//!
//! `next` and `prev` are offsets into the heap region, not addresses, with an
//! all-ones word standing in for null. For every chunk except the sentinel,
//! `offset + HEADER_SIZE + size == next`.

use std::mem::size_of;

use super::error::AllocError;

const WORD: usize = size_of::<usize>();

/// Alignment unit: every usable size is a multiple of this, and every user
/// pointer is aligned to it.
pub const ALIGNMENT: usize = 16;

/// Size of an encoded chunk header.
pub const HEADER_SIZE: usize = 4 * WORD;

const _: () = assert!(HEADER_SIZE.is_multiple_of(ALIGNMENT));

const NIL: usize = usize::MAX;

/// Raw encoded header as stored in the region.
pub type RawHeader = [u8; HEADER_SIZE];

/// Decoded chunk header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkHeader {
    /// Usable bytes following the header.
    pub size: usize,
    /// Offset of the next header in address order.
    pub next: Option<usize>,
    /// Offset of the previous header in address order.
    pub prev: Option<usize>,
    /// Whether the span is available for allocation.
    pub free: bool,
}

impl ChunkHeader {
    /// Header for a zero-size, never-allocatable end marker.
    #[must_use]
    pub const fn sentinel(prev: Option<usize>) -> Self {
        Self {
            size: 0,
            next: None,
            prev,
            free: false,
        }
    }

    #[must_use]
    pub fn encode(&self) -> RawHeader {
        let words = [
            self.size,
            self.next.unwrap_or(NIL),
            self.prev.unwrap_or(NIL),
            usize::from(self.free),
        ];
        let mut raw = [0u8; HEADER_SIZE];
        for (slot, word) in raw.chunks_exact_mut(WORD).zip(words) {
            slot.copy_from_slice(&word.to_ne_bytes());
        }
        raw
    }

    #[must_use]
    pub fn decode(raw: &RawHeader) -> Self {
        let mut words = [0usize; 4];
        for (word, slot) in words.iter_mut().zip(raw.chunks_exact(WORD)) {
            let mut bytes = [0u8; WORD];
            bytes.copy_from_slice(slot);
            *word = usize::from_ne_bytes(bytes);
        }
        let link = |word: usize| (word != NIL).then_some(word);
        Self {
            size: words[0],
            next: link(words[1]),
            prev: link(words[2]),
            free: words[3] != 0,
        }
    }

    /// Offset one past the end of this chunk's usable span.
    #[must_use]
    pub const fn end(&self, offset: usize) -> usize {
        offset + HEADER_SIZE + self.size
    }
}

/// Rounds `value` up to a multiple of `align` (a power of two).
#[must_use]
pub const fn align_up(value: usize, align: usize) -> Option<usize> {
    match value.checked_add(align - 1) {
        Some(bumped) => Some(bumped & !(align - 1)),
        None => None,
    }
}

/// Normalizes a caller-supplied size into a chunk size.
///
/// Zero becomes one alignment unit; anything whose rounded size exceeds
/// `isize::MAX` is rejected.
pub fn request_size(size: usize) -> Result<usize, AllocError> {
    let size = size.max(1);
    match align_up(size, ALIGNMENT) {
        Some(rounded) if rounded <= isize::MAX as usize => Ok(rounded),
        _ => Err(AllocError::SizeOverflow { requested: size }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_is_four_words() {
        assert_eq!(HEADER_SIZE, 4 * size_of::<usize>());
        assert_eq!(HEADER_SIZE % ALIGNMENT, 0);
    }

    #[test]
    fn header_codec_preserves_links() {
        let header = ChunkHeader {
            size: 4096,
            next: Some(4096 + HEADER_SIZE),
            prev: None,
            free: true,
        };
        let decoded = ChunkHeader::decode(&header.encode());
        assert_eq!(decoded, header);
        assert_eq!(decoded.end(0), 4096 + HEADER_SIZE);
    }

    #[test]
    fn sentinel_is_zero_size_and_in_use() {
        let sentinel = ChunkHeader::decode(&ChunkHeader::sentinel(Some(0)).encode());
        assert_eq!(sentinel.size, 0);
        assert_eq!(sentinel.next, None);
        assert_eq!(sentinel.prev, Some(0));
        assert!(!sentinel.free);
    }

    #[test]
    fn test_align_up() {
        for i in 0..10 {
            let sizes = (ALIGNMENT * i + 1)..=(ALIGNMENT * (i + 1));
            let expected = ALIGNMENT * (i + 1);
            for size in sizes {
                assert_eq!(align_up(size, ALIGNMENT), Some(expected));
            }
        }
        assert_eq!(align_up(0, ALIGNMENT), Some(0));
        assert_eq!(align_up(usize::MAX, ALIGNMENT), None);
    }

    #[test]
    fn request_size_rounds_and_rejects_overflow() {
        assert_eq!(request_size(0), Ok(ALIGNMENT));
        assert_eq!(request_size(1), Ok(16));
        assert_eq!(request_size(17), Ok(32));
        assert_eq!(request_size(64), Ok(64));
        assert!(matches!(
            request_size(usize::MAX),
            Err(AllocError::SizeOverflow { .. })
        ));
        assert!(matches!(
            request_size(isize::MAX as usize),
            Err(AllocError::SizeOverflow { .. })
        ));
    }
}
