//! Android sparse images
//!
//! A sparse image is a 28-byte [SparseHeader] followed by `total_chunks`
//! chunks, each a 12-byte [ChunkHeader] plus payload. [Decoder] inflates an
//! image into a stream of [Segment]s, keeping holes as holes, and
//! [SplitBlob] re-chunks an image into bounded, contiguous parts suitable for
//! streaming to a device.

use std::{
    io::{self, ErrorKind, Read, Seek, SeekFrom, Write},
    mem::size_of,
};

use bytemuck::{pod_read_unaligned, Pod, Zeroable};
use log::{debug, warn};
use strum::{Display, FromRepr};

use crate::error::SparseError;

pub use self::split::SplitBlob;

mod split;

pub const SPARSE_MAGIC: u32 = 0xED26_FF3A;
pub const FILE_HEADER_LEN: usize = size_of::<SparseHeader>();
pub const CHUNK_HEADER_LEN: usize = size_of::<ChunkHeader>();

/// Largest buffer a single decoded segment carries
const MAX_SEGMENT_LEN: u64 = 1024 * 1024;

/// Sparse file header
#[derive(Zeroable, Pod, Copy, Clone, Debug, PartialEq, Eq)]
#[repr(C)]
pub struct SparseHeader {
    pub magic: u32,
    pub major_version: u16,
    pub minor_version: u16,
    pub file_header_size: u16,
    pub chunk_header_size: u16,
    pub block_size: u32,
    pub total_blocks: u32,
    pub total_chunks: u32,
    pub image_checksum: u32,
}

impl SparseHeader {
    /// Parse the header at the start of `data`
    ///
    /// Returns `None` when the magic does not match, which is how raw images
    /// are told apart from sparse ones.
    pub fn parse(data: &[u8]) -> Result<Option<Self>, SparseError> {
        let magic = match data.get(..4) {
            Some(bytes) => u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
            None => return Ok(None),
        };
        if magic != SPARSE_MAGIC {
            return Ok(None);
        }

        let header: SparseHeader = match data.get(..FILE_HEADER_LEN) {
            Some(bytes) => pod_read_unaligned(bytes),
            None => return Err(SparseError::UnexpectedEof(0)),
        };

        if header.file_header_size as usize != FILE_HEADER_LEN
            || header.chunk_header_size as usize != CHUNK_HEADER_LEN
        {
            return Err(SparseError::InvalidHeaderSize {
                file: header.file_header_size,
                chunk: header.chunk_header_size,
            });
        }
        if header.block_size == 0 || header.block_size % 4 != 0 {
            return Err(SparseError::InvalidBlockSize(header.block_size));
        }

        Ok(Some(header))
    }

    /// Read and parse a header from the start of a stream
    ///
    /// The bytes are consumed even when the stream turns out not to be sparse.
    pub fn read_from<R: Read>(reader: &mut R) -> Result<Option<Self>, SparseError> {
        let buffer = read_up_to(reader, FILE_HEADER_LEN)?;
        Self::parse(&buffer)
    }

    /// Size of the fully inflated image
    pub fn total_bytes(&self) -> u64 {
        u64::from(self.total_blocks) * u64::from(self.block_size)
    }
}

/// Kinds of sparse chunks
#[derive(Copy, Clone, Debug, Display, PartialEq, Eq, FromRepr)]
#[repr(u16)]
pub enum ChunkType {
    Raw = 0xCAC1,
    Fill = 0xCAC2,
    #[strum(serialize = "Don't care")]
    Skip = 0xCAC3,
    Crc32 = 0xCAC4,
}

/// On-disk chunk header
#[derive(Zeroable, Pod, Copy, Clone, Debug)]
#[repr(C)]
pub struct ChunkHeader {
    pub chunk_type: u16,
    pub reserved: u16,
    pub blocks: u32,
    pub total_size: u32,
}

/// A decoded chunk header, its payload still unread
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Chunk {
    pub kind: ChunkType,
    pub blocks: u32,
    /// Payload bytes following the chunk header
    pub data_len: u32,
}

impl Chunk {
    pub fn parse(data: &[u8; CHUNK_HEADER_LEN]) -> Result<Self, SparseError> {
        let header: ChunkHeader = pod_read_unaligned(data);
        let kind = ChunkType::from_repr(header.chunk_type)
            .ok_or(SparseError::UnknownChunkType(header.chunk_type))?;
        let data_len = header
            .total_size
            .checked_sub(CHUNK_HEADER_LEN as u32)
            .ok_or(SparseError::ChunkSizeMismatch {
                kind,
                expected: CHUNK_HEADER_LEN as u64,
                found: header.total_size.into(),
            })?;

        Ok(Chunk {
            kind,
            blocks: header.blocks,
            data_len,
        })
    }

    /// Number of bytes this chunk contributes to the inflated image
    pub fn real_byte_length(&self, block_size: u32) -> Result<u64, SparseError> {
        let blocks_len = u64::from(self.blocks) * u64::from(block_size);
        let expected_data = match self.kind {
            ChunkType::Raw => blocks_len,
            ChunkType::Fill | ChunkType::Crc32 => 4,
            ChunkType::Skip => 0,
        };
        if u64::from(self.data_len) != expected_data {
            return Err(SparseError::ChunkSizeMismatch {
                kind: self.kind,
                expected: expected_data,
                found: self.data_len.into(),
            });
        }

        Ok(match self.kind {
            ChunkType::Crc32 => 0,
            _ => blocks_len,
        })
    }
}

/// Reads chunk headers one after another from a sparse stream
pub(crate) struct ChunkReader<R> {
    reader: R,
    header: SparseHeader,
    index: u32,
}

impl<R: Read> ChunkReader<R> {
    pub(crate) fn new(reader: R, header: SparseHeader) -> Self {
        Self {
            reader,
            header,
            index: 0,
        }
    }

    /// Next chunk and its inflated length, `None` after the last chunk
    pub(crate) fn next_chunk(&mut self) -> Result<Option<(Chunk, u64)>, SparseError> {
        if self.index == self.header.total_chunks {
            return Ok(None);
        }

        let mut raw = [0; CHUNK_HEADER_LEN];
        self.read_exact(&mut raw)?;
        let chunk = Chunk::parse(&raw)?;
        let len = chunk.real_byte_length(self.header.block_size)?;
        self.index += 1;

        Ok(Some((chunk, len)))
    }

    pub(crate) fn read_word(&mut self) -> Result<[u8; 4], SparseError> {
        let mut word = [0; 4];
        self.read_exact(&mut word)?;
        Ok(word)
    }

    pub(crate) fn read_exact(&mut self, buffer: &mut [u8]) -> Result<(), SparseError> {
        self.reader.read_exact(buffer).map_err(|e| match e.kind() {
            ErrorKind::UnexpectedEof => SparseError::UnexpectedEof(self.index),
            _ => SparseError::Io(e),
        })
    }

    pub(crate) fn header(&self) -> &SparseHeader {
        &self.header
    }
}

impl<R: Read + Seek> ChunkReader<R> {
    /// Step over the payload of the chunk just read
    pub(crate) fn skip_data(&mut self, chunk: &Chunk) -> Result<(), SparseError> {
        self.reader
            .seek(SeekFrom::Current(i64::from(chunk.data_len)))?;
        Ok(())
    }
}

/// A run of the inflated image
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Segment {
    /// Byte offset into the inflated image
    pub offset: u64,
    /// Contents, or `None` for a run of zeros which need not be written
    pub data: Option<Vec<u8>>,
    pub len: u64,
}

#[derive(Copy, Clone, Debug)]
enum Pending {
    Raw { remaining: u64 },
    Fill { word: [u8; 4], position: u64, remaining: u64 },
}

/// Lazily inflates a sparse image
///
/// Segments are contiguous: each one starts where the previous ended. Raw and
/// non-zero fill chunks are emitted in pieces of at most 1 MiB.
pub struct Decoder<R> {
    chunks: ChunkReader<R>,
    offset: u64,
    pending: Option<Pending>,
    finished: bool,
}

impl<R: Read> Decoder<R> {
    /// Start decoding, returns `None` if the stream is not a sparse image
    pub fn new(mut reader: R) -> Result<Option<Self>, SparseError> {
        Ok(SparseHeader::read_from(&mut reader)?.map(|header| Self::with_header(reader, header)))
    }

    /// Decode the chunks of a stream whose header was already consumed
    pub fn with_header(reader: R, header: SparseHeader) -> Self {
        Self {
            chunks: ChunkReader::new(reader, header),
            offset: 0,
            pending: None,
            finished: false,
        }
    }

    pub fn header(&self) -> &SparseHeader {
        self.chunks.header()
    }

    fn next_segment(&mut self) -> Result<Option<Segment>, SparseError> {
        loop {
            if let Some(pending) = self.pending.take() {
                return self.continue_pending(pending).map(Some);
            }

            let Some((chunk, len)) = self.chunks.next_chunk()? else {
                return Ok(None);
            };

            match chunk.kind {
                ChunkType::Raw if len > 0 => self.pending = Some(Pending::Raw { remaining: len }),
                ChunkType::Fill => {
                    let word = self.chunks.read_word()?;
                    if len == 0 {
                        continue;
                    }
                    if word == [0; 4] {
                        return Ok(Some(self.hole(len)));
                    }
                    self.pending = Some(Pending::Fill {
                        word,
                        position: 0,
                        remaining: len,
                    });
                }
                ChunkType::Skip if len > 0 => return Ok(Some(self.hole(len))),
                ChunkType::Crc32 => {
                    let checksum = self.chunks.read_word()?;
                    debug!("Skipping image checksum {:08x}", u32::from_le_bytes(checksum));
                }
                _ => {}
            }
        }
    }

    fn continue_pending(&mut self, pending: Pending) -> Result<Segment, SparseError> {
        let (data, rest) = match pending {
            Pending::Raw { remaining } => {
                let len = remaining.min(MAX_SEGMENT_LEN);
                let mut data = vec![0; len as usize];
                self.chunks.read_exact(&mut data)?;
                let rest = Pending::Raw {
                    remaining: remaining - len,
                };
                (data, (remaining > len).then_some(rest))
            }
            Pending::Fill {
                word,
                position,
                remaining,
            } => {
                let len = remaining.min(MAX_SEGMENT_LEN);
                let data = fill_pattern(word, position, len as usize);
                let rest = Pending::Fill {
                    word,
                    position: position + len,
                    remaining: remaining - len,
                };
                (data, (remaining > len).then_some(rest))
            }
        };

        self.pending = rest;
        let segment = Segment {
            offset: self.offset,
            len: data.len() as u64,
            data: Some(data),
        };
        self.offset += segment.len;

        Ok(segment)
    }

    fn hole(&mut self, len: u64) -> Segment {
        let segment = Segment {
            offset: self.offset,
            data: None,
            len,
        };
        self.offset += len;
        segment
    }
}

impl<R: Read> Iterator for Decoder<R> {
    type Item = Result<Segment, SparseError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }

        let result = self.next_segment().transpose();
        if !matches!(result, Some(Ok(_))) {
            self.finished = true;
        }
        result
    }
}

/// Write the fully inflated contents of a sparse image, returning its size
///
/// Holes are written out as zeros.
pub fn unsparse<R: Read, W: Write>(reader: R, mut writer: W) -> Result<u64, SparseError> {
    let decoder = Decoder::new(reader)?.ok_or(SparseError::NotSparse)?;
    let zeros = vec![0; MAX_SEGMENT_LEN as usize];

    let mut written = 0;
    for segment in decoder {
        let segment = segment?;
        match &segment.data {
            Some(data) => writer.write_all(data)?,
            None => {
                let mut remaining = segment.len;
                while remaining > 0 {
                    let len = remaining.min(MAX_SEGMENT_LEN);
                    writer.write_all(&zeros[..len as usize])?;
                    remaining -= len;
                }
            }
        }
        written += segment.len;
    }
    writer.flush()?;

    Ok(written)
}

/// Size of an image once inflated, sparse or not
///
/// For sparse images the chunk headers are walked and their lengths summed,
/// payloads are seeked over. The stream is left at the position it had on
/// entry.
pub fn inflated_size<R: Read + Seek>(image: &mut R) -> Result<u64, SparseError> {
    let start = image.stream_position()?;
    let size = match SparseHeader::read_from(image)? {
        Some(header) => {
            let mut chunks = ChunkReader::new(&mut *image, header);
            let mut size = 0;
            while let Some((chunk, len)) = chunks.next_chunk()? {
                chunks.skip_data(&chunk)?;
                size += len;
            }
            if size != header.total_bytes() {
                warn!(
                    "Sparse header announces {} bytes, its chunks hold {size}",
                    header.total_bytes()
                );
            }
            size
        }
        None => image.seek(SeekFrom::End(0))? - start,
    };
    image.seek(SeekFrom::Start(start))?;

    Ok(size)
}

/// `len` bytes of `word` repeated, starting `position` bytes into the pattern
pub(crate) fn fill_pattern(word: [u8; 4], position: u64, len: usize) -> Vec<u8> {
    let phase = (position % 4) as usize;
    word.iter()
        .cycle()
        .skip(phase)
        .take(len)
        .copied()
        .collect()
}

/// Read until `len` bytes or the end of the stream
fn read_up_to<R: Read>(reader: &mut R, len: usize) -> io::Result<Vec<u8>> {
    let mut buffer = Vec::with_capacity(len);
    reader.take(len as u64).read_to_end(&mut buffer)?;
    Ok(buffer)
}


#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use pretty_assertions::assert_eq;

    use super::{test_image::*, *};

    #[test]
    fn parse_sample_header() {
        let (image, _) = sample();
        let header = SparseHeader::parse(&image).unwrap().unwrap();

        assert_eq!(header.magic, SPARSE_MAGIC);
        assert_eq!(header.major_version, 1);
        assert_eq!(header.block_size, 4096);
        assert_eq!(header.total_blocks, 9);
        assert_eq!(header.total_chunks, 6);
        assert_eq!(header.total_bytes(), 9 * 4096);
    }

    #[test]
    fn raw_images_are_not_sparse() {
        assert_eq!(SparseHeader::parse(&[0; 64]).unwrap(), None);
        assert_eq!(SparseHeader::parse(&[0x3a, 0xff]).unwrap(), None);
        assert_eq!(SparseHeader::parse(&[]).unwrap(), None);
    }

    #[test]
    fn wrong_header_sizes_are_invalid() {
        let (mut image, _) = sample();
        image[8] = 32;
        assert!(matches!(
            SparseHeader::parse(&image),
            Err(SparseError::InvalidHeaderSize { file: 32, chunk: 12 })
        ));

        let (mut image, _) = sample();
        image[10] = 16;
        assert!(matches!(
            SparseHeader::parse(&image),
            Err(SparseError::InvalidHeaderSize { file: 28, chunk: 16 })
        ));
    }

    #[test]
    fn real_byte_length_checks_payload() {
        let raw = Chunk {
            kind: ChunkType::Raw,
            blocks: 2,
            data_len: 8192,
        };
        assert_eq!(raw.real_byte_length(4096).unwrap(), 8192);

        let short_raw = Chunk { data_len: 4096, ..raw };
        assert!(short_raw.real_byte_length(4096).is_err());

        let fill = Chunk {
            kind: ChunkType::Fill,
            blocks: 3,
            data_len: 4,
        };
        assert_eq!(fill.real_byte_length(4096).unwrap(), 3 * 4096);
        assert!(Chunk { data_len: 8, ..fill }.real_byte_length(4096).is_err());

        let skip = Chunk {
            kind: ChunkType::Skip,
            blocks: 5,
            data_len: 0,
        };
        assert_eq!(skip.real_byte_length(512).unwrap(), 5 * 512);
        assert!(Chunk { data_len: 4, ..skip }.real_byte_length(512).is_err());

        let crc = Chunk {
            kind: ChunkType::Crc32,
            blocks: 0,
            data_len: 4,
        };
        assert_eq!(crc.real_byte_length(4096).unwrap(), 0);
    }

    #[test]
    fn unknown_chunk_type() {
        let mut raw = [0; CHUNK_HEADER_LEN];
        raw[..2].copy_from_slice(&0xCAC5u16.to_le_bytes());
        raw[8..].copy_from_slice(&12u32.to_le_bytes());
        assert!(matches!(
            Chunk::parse(&raw),
            Err(SparseError::UnknownChunkType(0xCAC5))
        ));
    }

    #[test]
    fn decoder_segments() {
        let (image, expected) = sample();
        let decoder = Decoder::new(Cursor::new(image)).unwrap().unwrap();
        let segments = decoder.collect::<Result<Vec<_>, _>>().unwrap();

        let holes: Vec<_> = segments
            .iter()
            .filter(|s| s.data.is_none())
            .map(|s| (s.offset, s.len))
            .collect();
        assert_eq!(
            holes,
            vec![(4 * 4096, 4096), (5 * 4096, 4096), (7 * 4096, 2 * 4096)]
        );

        let mut offset = 0;
        let mut inflated = Vec::new();
        for segment in &segments {
            assert_eq!(segment.offset, offset);
            assert!(segment.len > 0);
            match &segment.data {
                Some(data) => inflated.extend_from_slice(data),
                None => inflated.resize(inflated.len() + segment.len as usize, 0),
            }
            offset += segment.len;
        }
        assert_eq!(inflated, expected);
    }

    #[test]
    fn decoder_skips_checksum_chunk() {
        let image = SparseBuilder::new(1024)
            .crc32(0x1234_5678)
            .raw(&[7; 1024])
            .build();
        let segments = Decoder::new(Cursor::new(image))
            .unwrap()
            .unwrap()
            .collect::<Result<Vec<_>, _>>()
            .unwrap();

        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].data.as_deref(), Some(&[7; 1024][..]));
    }

    #[test]
    fn decoder_stops_on_truncated_image() {
        let (image, _) = sample();
        let truncated = image[..image.len() - 100].to_vec();
        let result = Decoder::new(Cursor::new(truncated))
            .unwrap()
            .unwrap()
            .collect::<Result<Vec<_>, _>>();

        assert!(matches!(result, Err(SparseError::UnexpectedEof(5))));
    }

    #[test]
    fn inflated_size_of_both_kinds() {
        let (image, expected) = sample();
        let mut cursor = Cursor::new(image);
        assert_eq!(inflated_size(&mut cursor).unwrap(), expected.len() as u64);
        assert_eq!(cursor.position(), 0);

        let mut cursor = Cursor::new(vec![0xaa; 10_000]);
        cursor.set_position(1000);
        assert_eq!(inflated_size(&mut cursor).unwrap(), 9000);
        assert_eq!(cursor.position(), 1000);
    }

    #[test]
    fn inflated_size_follows_chunks() {
        let (image, expected) = sample();
        let with_checksum = SparseBuilder::new(4096).fill(3, 7).crc32(0x1234).skip(1).build();

        let mut lying = image.clone();
        lying[16..20].copy_from_slice(&1_000_000u32.to_le_bytes());
        assert_eq!(
            inflated_size(&mut Cursor::new(lying)).unwrap(),
            expected.len() as u64
        );
        assert_eq!(
            inflated_size(&mut Cursor::new(with_checksum)).unwrap(),
            4 * 4096
        );

        let mut bogus = image;
        bogus[FILE_HEADER_LEN..FILE_HEADER_LEN + 2].copy_from_slice(&0xCAC9u16.to_le_bytes());
        assert!(matches!(
            inflated_size(&mut Cursor::new(bogus)),
            Err(SparseError::UnknownChunkType(0xCAC9))
        ));
    }

    #[test]
    fn fill_pattern_keeps_phase() {
        let word = [1, 2, 3, 4];
        assert_eq!(fill_pattern(word, 0, 6), vec![1, 2, 3, 4, 1, 2]);
        assert_eq!(fill_pattern(word, 6, 4), vec![3, 4, 1, 2]);
    }

    #[test]
    fn unsparse_fills_holes() {
        let (image, expected) = sample();
        let mut output = Vec::new();
        let written = unsparse(Cursor::new(image), &mut output).unwrap();

        assert_eq!(written, expected.len() as u64);
        assert_eq!(output, expected);
    }
}
