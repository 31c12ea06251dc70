//! Chunk layout of a byte range: fixed-size spans, last one clipped.

/// Default chunk size in bytes.
pub const DEFAULT_CHUNK_SIZE: u64 = 512 * 1024; // 512 KiB

/// One chunk of a requested range: absolute object offset and length.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChunkSpan {
    pub offset: u64,
    pub len: u64,
}

/// Inclusive byte range `[start, end]` of an object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    /// Validate `range` against an object of `size` bytes. `None` means the whole object.
    /// Returns `None` for an empty object, `Err` for a range outside the object.
    pub fn resolve(range: Option<(u64, u64)>, size: u64) -> Result<Option<ByteRange>, RangeError> {
        let (start, end) = match range {
            Some(r) => r,
            None if size == 0 => return Ok(None),
            None => (0, size - 1),
        };
        if start > end {
            return Err(RangeError::Inverted { start, end });
        }
        if end >= size {
            return Err(RangeError::PastEnd { end, size });
        }
        Ok(Some(ByteRange { start, end }))
    }

    /// Chunk starting at `offset`, clipped to the range end. `None` if `offset` is not a chunk boundary of this range.
    pub fn span_at(&self, offset: u64, chunk_size: u64) -> Option<ChunkSpan> {
        let size = effective_chunk_size(chunk_size);
        if offset < self.start || offset > self.end || (offset - self.start) % size != 0 {
            return None;
        }
        Some(ChunkSpan {
            offset,
            len: size.min(self.end + 1 - offset),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RangeError {
    #[error("range start {start} after end {end}")]
    Inverted { start: u64, end: u64 },
    #[error("range end {end} beyond object size {size}")]
    PastEnd { end: u64, size: u64 },
}

fn effective_chunk_size(chunk_size: u64) -> u64 {
    if chunk_size == 0 {
        DEFAULT_CHUNK_SIZE
    } else {
        chunk_size
    }
}

/// Split a range into chunks by fixed size, lazily.
pub fn split_range(range: ByteRange, chunk_size: u64) -> impl Iterator<Item = ChunkSpan> {
    let size = effective_chunk_size(chunk_size);
    let mut offset = Some(range.start).filter(|o| *o <= range.end);
    std::iter::from_fn(move || {
        let at = offset?;
        let len = size.min(range.end + 1 - at);
        offset = at.checked_add(len).filter(|o| *o <= range.end);
        Some(ChunkSpan { offset: at, len })
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn range(start: u64, end: u64) -> ByteRange {
        ByteRange { start, end }
    }

    #[test]
    fn split_chunks() {
        let chunks: Vec<_> = split_range(range(0, 99), 30).collect();
        assert_eq!(chunks.len(), 4);
        assert_eq!(chunks[0], ChunkSpan { offset: 0, len: 30 });
        assert_eq!(chunks[3], ChunkSpan { offset: 90, len: 10 });
    }

    #[test]
    fn split_exact_multiple() {
        let chunks: Vec<_> = split_range(range(0, 89), 30).collect();
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[2].offset + chunks[2].len, 90);
    }

    #[test]
    fn split_offset_range() {
        let chunks: Vec<_> = split_range(range(100, 149), 30).collect();
        assert_eq!(
            chunks,
            vec![
                ChunkSpan { offset: 100, len: 30 },
                ChunkSpan { offset: 130, len: 20 },
            ]
        );
    }

    #[test]
    fn split_zero_chunk_size_uses_default() {
        let chunks: Vec<_> = split_range(range(0, DEFAULT_CHUNK_SIZE * 2 - 1), 0).collect();
        assert_eq!(chunks.len(), 2);
    }

    #[test]
    fn two_mib_is_four_chunks() {
        let r = ByteRange::resolve(None, 2 * 1024 * 1024).unwrap().unwrap();
        assert_eq!(split_range(r, DEFAULT_CHUNK_SIZE).count(), 4);
    }

    #[test]
    fn resolve_validates() {
        assert_eq!(ByteRange::resolve(None, 0), Ok(None));
        assert_eq!(ByteRange::resolve(Some((5, 9)), 10), Ok(Some(range(5, 9))));
        assert!(matches!(
            ByteRange::resolve(Some((9, 5)), 10),
            Err(RangeError::Inverted { .. })
        ));
        assert!(matches!(
            ByteRange::resolve(Some((0, 10)), 10),
            Err(RangeError::PastEnd { .. })
        ));
    }

    #[test]
    fn span_at_boundaries_only() {
        let r = range(10, 74);
        assert_eq!(r.span_at(10, 30), Some(ChunkSpan { offset: 10, len: 30 }));
        assert_eq!(r.span_at(70, 30), Some(ChunkSpan { offset: 70, len: 5 }));
        assert_eq!(r.span_at(11, 30), None);
        assert_eq!(r.span_at(100, 30), None);
    }
}
