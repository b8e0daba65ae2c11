use std::{
    io::{Chain, Cursor, Read},
    mem,
};

use super::{fill_pattern, read_up_to, ChunkReader, ChunkType, SparseHeader, FILE_HEADER_LEN};
use crate::error::SparseError;

/// Splits an image into contiguous parts of at most `max_part` bytes
///
/// Sparse images are inflated on the fly: chunks are packed into the current
/// part while they fit, and chunks larger than a part are subdivided. Raw
/// images are simply cut into `max_part` sized pieces. Concatenating every
/// part yields the inflated image.
pub struct SplitBlob<R> {
    source: Source<R>,
    max_part: usize,
    done: bool,
}

enum Source<R> {
    Raw(Chain<Cursor<Vec<u8>>, R>),
    Sparse {
        chunks: ChunkReader<R>,
        current: Option<Current>,
        part: Vec<u8>,
    },
}

/// Unconsumed tail of the chunk being split
struct Current {
    kind: ChunkType,
    word: [u8; 4],
    position: u64,
    remaining: u64,
}

impl<R: Read> SplitBlob<R> {
    pub fn new(mut reader: R, max_part: usize) -> Result<Self, SparseError> {
        let prefix = read_up_to(&mut reader, FILE_HEADER_LEN)?;
        let source = match SparseHeader::parse(&prefix)? {
            Some(header) => Source::Sparse {
                chunks: ChunkReader::new(reader, header),
                current: None,
                part: Vec::new(),
            },
            None => Source::Raw(Cursor::new(prefix).chain(reader)),
        };

        Ok(Self {
            source,
            max_part: max_part.max(1),
            done: false,
        })
    }

    /// Header of the image, `None` for raw images
    pub fn sparse_header(&self) -> Option<&SparseHeader> {
        match &self.source {
            Source::Sparse { chunks, .. } => Some(chunks.header()),
            Source::Raw(_) => None,
        }
    }

    fn next_part(&mut self) -> Result<Option<Vec<u8>>, SparseError> {
        let max_part = self.max_part;
        match &mut self.source {
            Source::Raw(reader) => {
                let part = read_up_to(reader, max_part)?;
                Ok((!part.is_empty()).then_some(part))
            }
            Source::Sparse {
                chunks,
                current,
                part,
            } => next_sparse_part(chunks, current, part, max_part),
        }
    }
}

fn next_sparse_part<R: Read>(
    chunks: &mut ChunkReader<R>,
    current: &mut Option<Current>,
    part: &mut Vec<u8>,
    max_part: usize,
) -> Result<Option<Vec<u8>>, SparseError> {
    loop {
        if current.is_none() {
            let Some((chunk, len)) = chunks.next_chunk()? else {
                return Ok((!part.is_empty()).then(|| mem::take(part)));
            };
            let word = match chunk.kind {
                ChunkType::Fill | ChunkType::Crc32 => chunks.read_word()?,
                _ => [0; 4],
            };
            if chunk.kind == ChunkType::Crc32 || len == 0 {
                continue;
            }
            *current = Some(Current {
                kind: chunk.kind,
                word,
                position: 0,
                remaining: len,
            });
        }
        let Some(cur) = current.as_mut() else {
            continue;
        };

        let piece = cur.remaining.min(max_part as u64) as usize;
        if part.len() + piece > max_part {
            return Ok(Some(mem::take(part)));
        }

        match cur.kind {
            ChunkType::Raw => {
                let start = part.len();
                part.resize(start + piece, 0);
                chunks.read_exact(&mut part[start..])?;
            }
            ChunkType::Fill => part.extend(fill_pattern(cur.word, cur.position, piece)),
            _ => part.resize(part.len() + piece, 0),
        }

        cur.position += piece as u64;
        cur.remaining -= piece as u64;
        if cur.remaining == 0 {
            *current = None;
        }
    }
}

impl<R: Read> Iterator for SplitBlob<R> {
    type Item = Result<Vec<u8>, SparseError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        let result = self.next_part().transpose();
        if !matches!(result, Some(Ok(_))) {
            self.done = true;
        }
        result
    }
}
