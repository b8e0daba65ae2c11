use std::str::FromStr;

use strum::{Display, EnumString, VariantNames};
use uuid::Uuid;

use super::header::{le_u64, GptHeader};
use crate::error::Error;

/// Bit offset of the A/B flag byte within the attributes
const AB_FLAG_OFFSET: u32 = 48 + 6;

const AB_SLOT_ACTIVE: u64 = 1 << 2;
const AB_BOOT_SUCCESSFUL: u64 = 1 << 6;
const AB_UNBOOTABLE: u64 = 1 << 7;
const AB_TRIES_SHIFT: u32 = 8;
const AB_TRIES_MASK: u64 = 0xF << AB_TRIES_SHIFT;

/// One of the two redundant A/B slots
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Display, EnumString, VariantNames)]
#[strum(serialize_all = "lowercase")]
pub enum Slot {
    A,
    B,
}

impl Slot {
    /// Partition name suffix of this slot
    pub fn suffix(self) -> &'static str {
        match self {
            Slot::A => "_a",
            Slot::B => "_b",
        }
    }

    /// Slot of a partition named `<base>_a` or `<base>_b`
    pub fn from_partition_name(name: &str) -> Option<Self> {
        if name.ends_with("_a") {
            Some(Slot::A)
        } else if name.ends_with("_b") {
            Some(Slot::B)
        } else {
            None
        }
    }

    /// Parse a user supplied slot name, `a`/`b` or `_a`/`_b`
    pub fn parse(name: &str) -> Result<Self, Error> {
        let trimmed = name.trim().trim_start_matches('_').to_ascii_lowercase();
        Slot::from_str(&trimmed).map_err(|_| Error::InvalidSlot(name.to_owned()))
    }
}

/// Android A/B attribute bits of a partition entry
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct AbFlags {
    pub active: bool,
    pub successful: bool,
    pub unbootable: bool,
    pub tries_remaining: u8,
}

impl AbFlags {
    pub fn from_attributes(attributes: u64) -> Self {
        let flags = attributes >> AB_FLAG_OFFSET;
        Self {
            active: flags & AB_SLOT_ACTIVE != 0,
            successful: flags & AB_BOOT_SUCCESSFUL != 0,
            unbootable: flags & AB_UNBOOTABLE != 0,
            tries_remaining: ((flags & AB_TRIES_MASK) >> AB_TRIES_SHIFT) as u8,
        }
    }

    /// Replace the A/B bits of `attributes`, leaving every other bit alone
    pub fn apply(self, attributes: u64) -> u64 {
        let mask = (AB_SLOT_ACTIVE | AB_BOOT_SUCCESSFUL | AB_UNBOOTABLE | AB_TRIES_MASK)
            << AB_FLAG_OFFSET;

        let mut flags = 0;
        if self.active {
            flags |= AB_SLOT_ACTIVE;
        }
        if self.successful {
            flags |= AB_BOOT_SUCCESSFUL;
        }
        if self.unbootable {
            flags |= AB_UNBOOTABLE;
        }
        flags |= (u64::from(self.tries_remaining) << AB_TRIES_SHIFT) & AB_TRIES_MASK;

        (attributes & !mask) | (flags << AB_FLAG_OFFSET)
    }
}

/// A partition entry as laid out on disk
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PartitionEntry {
    pub type_guid: Uuid,
    pub unique_guid: Uuid,
    pub first_lba: u64,
    pub last_lba: u64,
    pub attributes: u64,
    /// UTF-16 name, nul padded
    pub name: [u16; 36],
}

impl PartitionEntry {
    pub const SIZE: usize = 128;

    /// Decode an entry from the first 128 bytes of `data`
    pub fn decode(data: &[u8]) -> Self {
        let mut type_guid = [0; 16];
        type_guid.copy_from_slice(&data[..16]);
        let mut unique_guid = [0; 16];
        unique_guid.copy_from_slice(&data[16..32]);

        let mut name = [0; 36];
        for (i, unit) in data[56..Self::SIZE].chunks_exact(2).enumerate() {
            name[i] = u16::from_le_bytes([unit[0], unit[1]]);
        }

        Self {
            type_guid: Uuid::from_bytes_le(type_guid),
            unique_guid: Uuid::from_bytes_le(unique_guid),
            first_lba: le_u64(data, 32),
            last_lba: le_u64(data, 40),
            attributes: le_u64(data, 48),
            name,
        }
    }

    pub fn encode(&self) -> [u8; Self::SIZE] {
        let mut data = [0; Self::SIZE];
        data[..16].copy_from_slice(&self.type_guid.to_bytes_le());
        data[16..32].copy_from_slice(&self.unique_guid.to_bytes_le());
        data[32..40].copy_from_slice(&self.first_lba.to_le_bytes());
        data[40..48].copy_from_slice(&self.last_lba.to_le_bytes());
        data[48..56].copy_from_slice(&self.attributes.to_le_bytes());
        for (i, unit) in self.name.iter().enumerate() {
            data[56 + 2 * i..58 + 2 * i].copy_from_slice(&unit.to_le_bytes());
        }
        data
    }

    /// An unused slot in the entry array has a nil type GUID
    pub fn is_used(&self) -> bool {
        !self.type_guid.is_nil()
    }

    pub fn name(&self) -> String {
        let len = self.name.iter().position(|c| *c == 0).unwrap_or(self.name.len());
        String::from_utf16_lossy(&self.name[..len])
    }

    /// Set the name, truncated to 36 UTF-16 code units
    pub fn set_name(&mut self, name: &str) {
        self.name = [0; 36];
        for (slot, unit) in self.name.iter_mut().zip(name.encode_utf16()) {
            *slot = unit;
        }
    }

    /// Number of sectors covered, both ends inclusive
    pub fn sectors(&self) -> u64 {
        (self.last_lba + 1).saturating_sub(self.first_lba)
    }

    pub fn slot(&self) -> Option<Slot> {
        Slot::from_partition_name(&self.name())
    }

    pub fn ab_flags(&self) -> AbFlags {
        AbFlags::from_attributes(self.attributes)
    }

    pub fn set_ab_flags(&mut self, flags: AbFlags) {
        self.attributes = flags.apply(self.attributes);
    }
}

/// Decode the entry array described by `header`
pub(crate) fn decode_entries(header: &GptHeader, data: &[u8]) -> Vec<PartitionEntry> {
    data[..header.entries_len()]
        .chunks_exact(header.part_entry_size as usize)
        .map(PartitionEntry::decode)
        .collect()
}

pub(crate) fn encode_entries(entries: &[PartitionEntry]) -> Vec<u8> {
    entries.iter().flat_map(|entry| entry.encode()).collect()
}
