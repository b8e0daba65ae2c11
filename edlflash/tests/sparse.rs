use std::io::Cursor;

use edlflash::{
    error::SparseError,
    sparse::{inflated_size, unsparse, Decoder, SplitBlob, SPARSE_MAGIC},
};

const BLOCK: usize = 4096;

/// Assembles a sparse image chunk by chunk
struct Image {
    chunks: Vec<u8>,
    count: u32,
    blocks: u32,
}

impl Image {
    fn new() -> Self {
        Self {
            chunks: Vec::new(),
            count: 0,
            blocks: 0,
        }
    }

    fn chunk(mut self, kind: u16, blocks: u32, payload: &[u8]) -> Self {
        self.chunks.extend_from_slice(&kind.to_le_bytes());
        self.chunks.extend_from_slice(&0u16.to_le_bytes());
        self.chunks.extend_from_slice(&blocks.to_le_bytes());
        self.chunks
            .extend_from_slice(&(12 + payload.len() as u32).to_le_bytes());
        self.chunks.extend_from_slice(payload);
        self.count += 1;
        self.blocks += blocks;
        self
    }

    fn raw(self, data: &[u8]) -> Self {
        let blocks = (data.len() / BLOCK) as u32;
        self.chunk(0xCAC1, blocks, data)
    }

    fn fill(self, blocks: u32, word: u32) -> Self {
        self.chunk(0xCAC2, blocks, &word.to_le_bytes())
    }

    fn skip(self, blocks: u32) -> Self {
        self.chunk(0xCAC3, blocks, &[])
    }

    fn build(&self) -> Vec<u8> {
        let mut image = Vec::new();
        image.extend_from_slice(&SPARSE_MAGIC.to_le_bytes());
        image.extend_from_slice(&1u16.to_le_bytes());
        image.extend_from_slice(&0u16.to_le_bytes());
        image.extend_from_slice(&28u16.to_le_bytes());
        image.extend_from_slice(&12u16.to_le_bytes());
        image.extend_from_slice(&(BLOCK as u32).to_le_bytes());
        image.extend_from_slice(&self.blocks.to_le_bytes());
        image.extend_from_slice(&self.count.to_le_bytes());
        image.extend_from_slice(&0u32.to_le_bytes());
        image.extend_from_slice(&self.chunks);
        image
    }
}

/// A system-like image: a header block, a large hole, filled and raw runs
fn system_image() -> (Vec<u8>, Vec<u8>) {
    let superblock: Vec<u8> = (0..BLOCK).map(|i| (i * 7 % 256) as u8).collect();
    let data: Vec<u8> = (0..5 * BLOCK).map(|i| (i % 249) as u8 ^ 0x5a).collect();

    let image = Image::new()
        .raw(&superblock)
        .skip(300)
        .fill(3, 0x0102_0304)
        .raw(&data)
        .fill(2, 0)
        .skip(1)
        .build();

    let mut expected = superblock;
    expected.resize(expected.len() + 300 * BLOCK, 0);
    for _ in 0..3 * BLOCK / 4 {
        expected.extend_from_slice(&[4, 3, 2, 1]);
    }
    expected.extend_from_slice(&data);
    expected.resize(expected.len() + 3 * BLOCK, 0);

    (image, expected)
}

#[test]
fn decode_reassembles_raw_image() {
    let (image, expected) = system_image();
    let decoder = Decoder::new(Cursor::new(image)).unwrap().unwrap();
    assert_eq!(decoder.header().total_blocks, 312);

    let mut inflated = Vec::new();
    let mut offset = 0;
    for segment in decoder {
        let segment = segment.unwrap();
        assert_eq!(segment.offset, offset);
        match segment.data {
            Some(data) => {
                assert_eq!(data.len() as u64, segment.len);
                inflated.extend_from_slice(&data);
            }
            None => inflated.resize(inflated.len() + segment.len as usize, 0),
        }
        offset += segment.len;
    }

    assert_eq!(inflated.len(), expected.len());
    assert!(inflated == expected);
}

#[test]
fn raw_images_are_not_sparse() {
    let raw = vec![0x3a; 8192];
    assert!(Decoder::new(Cursor::new(raw.clone())).unwrap().is_none());
    assert!(matches!(
        unsparse(Cursor::new(raw.clone()), Vec::new()),
        Err(SparseError::NotSparse)
    ));

    let mut reader = Cursor::new(raw);
    assert_eq!(inflated_size(&mut reader).unwrap(), 8192);
    assert_eq!(reader.position(), 0);
}

#[test]
fn split_parts_are_bounded_and_contiguous() {
    let (image, expected) = system_image();

    for max_part in [BLOCK, 3 * BLOCK, 64 * 1024, 1024 * 1024] {
        let split = SplitBlob::new(Cursor::new(image.clone()), max_part).unwrap();
        assert!(split.sparse_header().is_some());

        let parts = split.collect::<Result<Vec<_>, _>>().unwrap();
        assert!(parts.iter().all(|part| !part.is_empty() && part.len() <= max_part));
        assert!(parts.concat() == expected, "max_part {max_part}");
    }
}

#[test]
fn split_raw_image() {
    let raw: Vec<u8> = (0..10_000u32).map(|i| i as u8).collect();
    let parts = SplitBlob::new(Cursor::new(raw.clone()), 4096)
        .unwrap()
        .collect::<Result<Vec<_>, _>>()
        .unwrap();

    assert_eq!(
        parts.iter().map(Vec::len).collect::<Vec<_>>(),
        vec![4096, 4096, 1808]
    );
    assert_eq!(parts.concat(), raw);
}

#[test]
fn unsparse_writes_holes() {
    let (image, expected) = system_image();
    let mut reader = Cursor::new(image);
    assert_eq!(inflated_size(&mut reader).unwrap(), expected.len() as u64);

    let mut output = Vec::new();
    let written = unsparse(reader, &mut output).unwrap();

    assert_eq!(written, expected.len() as u64);
    assert!(output == expected);
}

#[test]
fn truncated_image() {
    let (image, _) = system_image();
    let truncated = image[..image.len() - 100].to_vec();

    let result = SplitBlob::new(Cursor::new(truncated), 1024 * 1024)
        .unwrap()
        .collect::<Result<Vec<_>, _>>();
    assert!(result.is_err());
}

#[test]
fn inconsistent_chunk_size() {
    let image = Image::new().chunk(0xCAC2, 1, &[0; 8]).build();

    let result = Decoder::new(Cursor::new(image))
        .unwrap()
        .unwrap()
        .collect::<Result<Vec<_>, _>>();
    assert!(matches!(
        result,
        Err(SparseError::ChunkSizeMismatch { .. })
    ));
}
