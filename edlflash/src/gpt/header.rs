use bytemuck::pod_read_unaligned;
use uuid::Uuid;

use crate::error::GptError;

/// Byte offset of `header_crc32` within the header
pub(crate) const HEADER_CRC_OFFSET: usize = 16;

/// A GPT header as laid out on disk, all fields little-endian
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GptHeader {
    pub signature: [u8; 8],
    pub revision: u32,
    pub header_size: u32,
    pub header_crc32: u32,
    pub reserved: u32,
    pub current_lba: u64,
    pub backup_lba: u64,
    pub first_usable_lba: u64,
    pub last_usable_lba: u64,
    pub disk_guid: Uuid,
    pub part_entry_start_lba: u64,
    pub num_part_entries: u32,
    pub part_entry_size: u32,
    pub part_entries_crc32: u32,
}

impl GptHeader {
    pub const SIGNATURE: [u8; 8] = *b"EFI PART";
    pub const REVISION: u32 = 0x0001_0000;
    pub const SIZE: usize = 92;

    pub fn decode(data: &[u8]) -> Result<Self, GptError> {
        if data.len() < Self::SIZE {
            return Err(GptError::Truncated {
                expected: Self::SIZE,
                got: data.len(),
            });
        }

        let mut signature = [0; 8];
        signature.copy_from_slice(&data[..8]);
        let mut disk_guid = [0; 16];
        disk_guid.copy_from_slice(&data[56..72]);

        Ok(Self {
            signature,
            revision: le_u32(data, 8),
            header_size: le_u32(data, 12),
            header_crc32: le_u32(data, HEADER_CRC_OFFSET),
            reserved: le_u32(data, 20),
            current_lba: le_u64(data, 24),
            backup_lba: le_u64(data, 32),
            first_usable_lba: le_u64(data, 40),
            last_usable_lba: le_u64(data, 48),
            disk_guid: Uuid::from_bytes_le(disk_guid),
            part_entry_start_lba: le_u64(data, 72),
            num_part_entries: le_u32(data, 80),
            part_entry_size: le_u32(data, 84),
            part_entries_crc32: le_u32(data, 88),
        })
    }

    pub fn encode(&self) -> [u8; Self::SIZE] {
        let mut data = [0; Self::SIZE];
        data[..8].copy_from_slice(&self.signature);
        data[8..12].copy_from_slice(&self.revision.to_le_bytes());
        data[12..16].copy_from_slice(&self.header_size.to_le_bytes());
        data[16..20].copy_from_slice(&self.header_crc32.to_le_bytes());
        data[20..24].copy_from_slice(&self.reserved.to_le_bytes());
        data[24..32].copy_from_slice(&self.current_lba.to_le_bytes());
        data[32..40].copy_from_slice(&self.backup_lba.to_le_bytes());
        data[40..48].copy_from_slice(&self.first_usable_lba.to_le_bytes());
        data[48..56].copy_from_slice(&self.last_usable_lba.to_le_bytes());
        data[56..72].copy_from_slice(&self.disk_guid.to_bytes_le());
        data[72..80].copy_from_slice(&self.part_entry_start_lba.to_le_bytes());
        data[80..84].copy_from_slice(&self.num_part_entries.to_le_bytes());
        data[84..88].copy_from_slice(&self.part_entry_size.to_le_bytes());
        data[88..92].copy_from_slice(&self.part_entries_crc32.to_le_bytes());
        data
    }

    /// Structural checks which do not depend on where the header was read
    pub fn validate(&self, sector_size: usize) -> Result<(), GptError> {
        if self.signature != Self::SIGNATURE {
            return Err(GptError::InvalidSignature(
                String::from_utf8_lossy(&self.signature).into_owned(),
            ));
        }
        if self.revision != Self::REVISION {
            return Err(GptError::UnsupportedRevision(self.revision));
        }
        if (self.header_size as usize) < Self::SIZE || self.header_size as usize > sector_size {
            return Err(GptError::InvalidHeaderSize(self.header_size));
        }
        if self.part_entry_size as usize != super::PartitionEntry::SIZE
            || self.num_part_entries == 0
            || self.entries_len() > super::MAX_ENTRIES_LEN
        {
            return Err(GptError::InvalidEntryLayout {
                count: self.num_part_entries,
                size: self.part_entry_size,
            });
        }

        // The entry array of the table at the far end sits right before it
        let far_lba = self.current_lba.max(self.backup_lba);
        let entries_sectors = self.entries_sectors(sector_size);
        if far_lba <= entries_sectors {
            return Err(GptError::EntriesOutOfRange {
                lba: far_lba,
                entries_sectors,
            });
        }

        Ok(())
    }

    /// Length of the partition entry array in bytes
    pub fn entries_len(&self) -> usize {
        self.num_part_entries as usize * self.part_entry_size as usize
    }

    /// Sectors covered by the partition entry array
    pub fn entries_sectors(&self, sector_size: usize) -> u64 {
        self.entries_len().div_ceil(sector_size) as u64
    }
}

pub(crate) fn le_u32(data: &[u8], offset: usize) -> u32 {
    u32::from_le(pod_read_unaligned(&data[offset..offset + 4]))
}

pub(crate) fn le_u64(data: &[u8], offset: usize) -> u64 {
    u64::from_le(pod_read_unaligned(&data[offset..offset + 8]))
}
