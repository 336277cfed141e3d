//! Heap introspection and integrity checking.

use std::fmt;

use thiserror::Error;

use super::chunk::{ALIGNMENT, ChunkHeader, HEADER_SIZE};
use super::heap::Heap;
use super::region::HeapRegion;

/// Snapshot of one chunk, addressed the way callers see the heap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkView {
    /// Offset of the header inside the region.
    pub offset: usize,
    /// Address of the header.
    pub addr: usize,
    /// Address of the first usable byte.
    pub data: usize,
    /// Usable bytes recorded in the header.
    pub size: usize,
    /// Address of the next header, if any.
    pub next: Option<usize>,
    /// Address of the previous header, if any.
    pub prev: Option<usize>,
    pub free: bool,
}

impl fmt::Display for ChunkView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "chunk {:#x}", self.addr)?;
        writeln!(f, "  size: {}", self.size)?;
        match self.next {
            Some(next) => writeln!(f, "  next: {next:#x}")?,
            None => writeln!(f, "  next: null")?,
        }
        match self.prev {
            Some(prev) => writeln!(f, "  prev: {prev:#x}")?,
            None => writeln!(f, "  prev: null")?,
        }
        writeln!(f, "  data: {:#x}", self.data)?;
        write!(f, "  free: {}", self.free)
    }
}

/// Aggregate occupancy figures. The sentinel is not counted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeapStats {
    pub chunks: usize,
    pub free_chunks: usize,
    pub free_bytes: usize,
    pub used_chunks: usize,
    pub used_bytes: usize,
    pub largest_free: usize,
    pub heap_bytes: usize,
    pub growth_events: u64,
}

/// Address-ordered walk over the chunk list, sentinel included.
///
/// Stops early on a link that leaves the region or fails to advance, so it
/// is safe to run over a damaged heap.
pub struct Chunks<'a, R: HeapRegion> {
    heap: &'a Heap<R>,
    cursor: Option<usize>,
}

impl<R: HeapRegion> Iterator for Chunks<'_, R> {
    type Item = ChunkView;

    fn next(&mut self) -> Option<ChunkView> {
        let offset = self.cursor.take()?;
        if !self.heap.in_bounds(offset) {
            return None;
        }
        let header = self.heap.header(offset);
        self.cursor = header.next.filter(|&next| next > offset);
        Some(self.heap.view(offset, &header))
    }
}

/// Kind of structural damage found by [`Heap::check_integrity`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CorruptionKind {
    /// A chunk's end does not match its `next` link.
    ForwardLink,
    /// A chunk's `prev` link does not point at the chunk that ends at it.
    BackwardLink,
    /// Two neighbouring chunks are both free.
    AdjacentFree,
    /// The list does not end in a zero-size, in-use chunk at `last`.
    BadSentinel,
    /// A header offset is not aligned.
    Misaligned,
    /// A link points outside the region.
    OutOfBounds,
}

impl fmt::Display for CorruptionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::ForwardLink => "chunk end does not match next header",
            Self::BackwardLink => "prev link does not match preceding chunk",
            Self::AdjacentFree => "adjacent free chunks were not coalesced",
            Self::BadSentinel => "heap does not end in a valid sentinel",
            Self::Misaligned => "chunk header is misaligned",
            Self::OutOfBounds => "chunk link points outside the heap",
        })
    }
}

/// Structural corruption detected in the chunk list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("heap corruption: {kind} at chunk {addr:#x}", addr = .chunk.addr)]
pub struct HeapCorruption {
    pub kind: CorruptionKind,
    /// Chunk at which the walk stopped.
    pub chunk: ChunkView,
    /// Neighbour involved in the failed check, when it could be read.
    pub neighbor: Option<ChunkView>,
    /// Address of the first header.
    pub first: usize,
    /// Address of the sentinel header.
    pub last: usize,
}

impl HeapCorruption {
    /// Writes the full diagnostic: message, both chunks and the heap bounds.
    pub fn report<W: fmt::Write>(&self, out: &mut W) -> fmt::Result {
        writeln!(out, "{self}")?;
        writeln!(out, "{}", self.chunk)?;
        if let Some(neighbor) = &self.neighbor {
            writeln!(out, "{neighbor}")?;
        }
        writeln!(out, "first: {:#x}", self.first)?;
        writeln!(out, "last: {:#x}", self.last)
    }
}

impl<R: HeapRegion> Heap<R> {
    /// Walks the chunk list in address order.
    pub fn chunks(&self) -> Chunks<'_, R> {
        Chunks {
            heap: self,
            cursor: Some(self.first_offset()),
        }
    }

    #[must_use]
    pub fn stats(&self) -> HeapStats {
        let mut stats = HeapStats {
            heap_bytes: self.region().len(),
            growth_events: self.growth_events(),
            ..HeapStats::default()
        };
        for chunk in self.chunks().filter(|chunk| chunk.next.is_some()) {
            stats.chunks += 1;
            if chunk.free {
                stats.free_chunks += 1;
                stats.free_bytes += chunk.size;
                stats.largest_free = stats.largest_free.max(chunk.size);
            } else {
                stats.used_chunks += 1;
                stats.used_bytes += chunk.size;
            }
        }
        stats
    }

    /// Writes every chunk, sentinel included, followed by a blank line.
    pub fn dump<W: fmt::Write>(&self, out: &mut W) -> fmt::Result {
        for chunk in self.chunks() {
            writeln!(out, "{chunk}")?;
            writeln!(out)?;
        }
        Ok(())
    }

    /// Verifies the chunk list in both directions.
    ///
    /// Forward: every link lands where the previous chunk ends, no two free
    /// chunks touch, and the list ends in the sentinel. Backward: every
    /// `prev` link names the chunk that ends at it.
    pub fn check_integrity(&self) -> Result<(), HeapCorruption> {
        let first = self.first_offset();
        let last = self.last_offset();

        let mut offset = first;
        let mut prev_free = false;
        loop {
            if !offset.is_multiple_of(ALIGNMENT) {
                return Err(self.corruption(CorruptionKind::Misaligned, offset, None));
            }
            let header = self.header(offset);
            let Some(next) = header.next else {
                if offset != last || header.size != 0 || header.free {
                    return Err(self.corruption(CorruptionKind::BadSentinel, offset, None));
                }
                break;
            };
            if !self.in_bounds(next) {
                return Err(self.corruption(CorruptionKind::OutOfBounds, offset, None));
            }
            if checked_end(offset, &header) != Some(next) {
                return Err(self.corruption(CorruptionKind::ForwardLink, offset, Some(next)));
            }
            if header.free && prev_free {
                let prev = header.prev.filter(|&prev| self.in_bounds(prev));
                return Err(self.corruption(CorruptionKind::AdjacentFree, offset, prev));
            }
            prev_free = header.free;
            offset = next;
        }

        let mut offset = last;
        while offset != first {
            let header = self.header(offset);
            let Some(prev) = header.prev.filter(|&prev| prev < offset) else {
                return Err(self.corruption(CorruptionKind::BackwardLink, offset, None));
            };
            if !self.in_bounds(prev) {
                return Err(self.corruption(CorruptionKind::OutOfBounds, offset, None));
            }
            let prev_header = self.header(prev);
            if checked_end(prev, &prev_header) != Some(offset) || prev_header.next != Some(offset)
            {
                return Err(self.corruption(CorruptionKind::BackwardLink, offset, Some(prev)));
            }
            offset = prev;
        }
        if self.header(first).prev.is_some() {
            return Err(self.corruption(CorruptionKind::BackwardLink, first, None));
        }
        Ok(())
    }

    pub(super) fn in_bounds(&self, offset: usize) -> bool {
        offset >= self.first_offset()
            && offset
                .checked_add(HEADER_SIZE)
                .is_some_and(|end| end <= self.region().len())
    }

    fn view(&self, offset: usize, header: &ChunkHeader) -> ChunkView {
        ChunkView {
            offset,
            addr: self.header_addr(offset),
            data: self.data_addr(offset),
            size: header.size,
            // Links are raw words and may be garbage on a damaged heap.
            next: header.next.map(|next| self.region().base().wrapping_add(next)),
            prev: header.prev.map(|prev| self.region().base().wrapping_add(prev)),
            free: header.free,
        }
    }

    fn corruption(
        &self,
        kind: CorruptionKind,
        offset: usize,
        neighbor: Option<usize>,
    ) -> HeapCorruption {
        HeapCorruption {
            kind,
            chunk: self.view(offset, &self.header(offset)),
            neighbor: neighbor.map(|n| self.view(n, &self.header(n))),
            first: self.header_addr(self.first_offset()),
            last: self.header_addr(self.last_offset()),
        }
    }
}

fn checked_end(offset: usize, header: &ChunkHeader) -> Option<usize> {
    offset.checked_add(HEADER_SIZE)?.checked_add(header.size)
}
