//! GUID partition tables
//!
//! Every LUN of a device carries a primary GPT right after the protective
//! MBR and a backup copy at the end of the disk. A table is parsed in two
//! steps: [GptTable::parse_header] validates the header sector and tells how
//! large the entry array is, [PartialTable::parse_part_entries] then decodes
//! that array. CRC mismatches are reported but do not fail parsing, so a
//! damaged table can still be inspected and repaired.

use std::collections::HashMap;

use crc::{Crc, CRC_32_ISO_HDLC};
use log::{debug, warn};

pub use self::{
    entry::{AbFlags, PartitionEntry, Slot},
    header::GptHeader,
    repair::{create_backup_gpt_header, ensure_gpt_hdr_consistency, Consistency, RawGpt},
};
use self::{
    entry::{decode_entries, encode_entries},
    header::HEADER_CRC_OFFSET,
};
use crate::error::GptError;

mod entry;
mod header;
mod repair;

/// LBA of the primary header
pub const PRIMARY_HEADER_LBA: u64 = 1;
/// Upper bound on the entry array, well above the 16 KiB UEFI minimum
pub(crate) const MAX_ENTRIES_LEN: usize = 1024 * 1024;

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

pub(crate) fn crc32(data: &[u8]) -> u32 {
    CRC32.checksum(data)
}

/// CRC of a header sector, computed with its own CRC field zeroed
fn header_crc32(sector: &[u8], header_size: usize) -> u32 {
    let mut digest = CRC32.digest();
    digest.update(&sector[..HEADER_CRC_OFFSET]);
    digest.update(&[0; 4]);
    digest.update(&sector[HEADER_CRC_OFFSET + 4..header_size]);
    digest.finalize()
}

/// A validated header whose partition entries have not been read yet
#[derive(Clone, Debug)]
pub struct PartialTable {
    header: GptHeader,
    sector_size: usize,
    header_crc_ok: bool,
}

impl PartialTable {
    pub fn header(&self) -> &GptHeader {
        &self.header
    }

    pub fn header_crc_ok(&self) -> bool {
        self.header_crc_ok
    }

    /// Sectors to read at `part_entry_start_lba` for the entry array
    pub fn part_entries_sectors(&self) -> u64 {
        self.header.entries_sectors(self.sector_size)
    }

    /// Decode the entry array, completing the table
    pub fn parse_part_entries(self, data: &[u8]) -> Result<GptTable, GptError> {
        let len = self.header.entries_len();
        if data.len() < len {
            return Err(GptError::Truncated {
                expected: len,
                got: data.len(),
            });
        }

        let actual = crc32(&data[..len]);
        let entries_crc_ok = actual == self.header.part_entries_crc32;
        if !entries_crc_ok {
            warn!(
                "Partition entries CRC32 mismatch: expected {:#010x}, actual {:#010x}",
                self.header.part_entries_crc32, actual
            );
        }

        let entries = decode_entries(&self.header, data);
        let index = build_index(&entries);

        Ok(GptTable {
            header: self.header,
            entries,
            index,
            sector_size: self.sector_size,
            header_crc_ok: self.header_crc_ok,
            entries_crc_ok,
        })
    }
}

/// A parsed partition table
#[derive(Clone, Debug)]
pub struct GptTable {
    header: GptHeader,
    entries: Vec<PartitionEntry>,
    /// First entry index of every used partition name
    index: HashMap<String, usize>,
    sector_size: usize,
    header_crc_ok: bool,
    entries_crc_ok: bool,
}

impl GptTable {
    /// Parse and validate the header sector read from `expected_lba`
    pub fn parse_header(
        sector: &[u8],
        expected_lba: u64,
        sector_size: usize,
    ) -> Result<PartialTable, GptError> {
        let header = GptHeader::decode(sector)?;
        header.validate(sector_size)?;
        if header.current_lba != expected_lba {
            return Err(GptError::LbaMismatch {
                expected: expected_lba,
                found: header.current_lba,
            });
        }

        let header_size = header.header_size as usize;
        if sector.len() < header_size {
            return Err(GptError::Truncated {
                expected: header_size,
                got: sector.len(),
            });
        }

        let actual = header_crc32(sector, header_size);
        let header_crc_ok = actual == header.header_crc32;
        if !header_crc_ok {
            warn!(
                "GPT header CRC32 mismatch at LBA {expected_lba}: expected {:#010x}, actual {:#010x}",
                header.header_crc32, actual
            );
        }

        Ok(PartialTable {
            header,
            sector_size,
            header_crc_ok,
        })
    }

    /// Parse a complete table from its raw sectors
    pub fn parse(raw: &RawGpt, sector_size: usize) -> Result<Self, GptError> {
        Self::parse_header(&raw.header, raw.lba, sector_size)?.parse_part_entries(&raw.entries)
    }

    pub fn header(&self) -> &GptHeader {
        &self.header
    }

    pub fn sector_size(&self) -> usize {
        self.sector_size
    }

    pub fn part_entries_sectors(&self) -> u64 {
        self.header.entries_sectors(self.sector_size)
    }

    pub fn header_crc_ok(&self) -> bool {
        self.header_crc_ok
    }

    pub fn entries_crc_ok(&self) -> bool {
        self.entries_crc_ok
    }

    /// Fails if either CRC did not verify when the table was parsed
    pub fn check(&self) -> Result<(), GptError> {
        if !self.header_crc_ok {
            let mut sector = self.header.encode();
            sector[HEADER_CRC_OFFSET..HEADER_CRC_OFFSET + 4].fill(0);
            return Err(GptError::ChecksumMismatch {
                region: "header",
                expected: self.header.header_crc32,
                actual: crc32(&sector),
            });
        }
        if !self.entries_crc_ok {
            return Err(GptError::ChecksumMismatch {
                region: "partition entries",
                expected: self.header.part_entries_crc32,
                actual: crc32(&encode_entries(&self.entries)),
            });
        }

        Ok(())
    }

    /// Every entry of the array, used or not
    pub fn entries(&self) -> &[PartitionEntry] {
        &self.entries
    }

    /// Used entries, in on-disk order
    pub fn partitions(&self) -> impl Iterator<Item = &PartitionEntry> {
        self.entries.iter().filter(|entry| entry.is_used())
    }

    pub fn partition(&self, name: &str) -> Option<&PartitionEntry> {
        self.index.get(name).map(|i| &self.entries[*i])
    }

    /// First sector and sector count of the named partition
    pub fn locate_partition(&self, name: &str) -> Option<(u64, u64)> {
        self.partition(name)
            .map(|entry| (entry.first_lba, entry.sectors()))
    }

    /// The slot whose `_a`/`_b` partitions are marked active
    pub fn get_active_slot(&self) -> Result<Option<Slot>, GptError> {
        let mut active = None;
        for entry in self.partitions() {
            let Some(slot) = entry.slot() else {
                continue;
            };
            let flags = entry.ab_flags();
            debug!("{} flags: {:?}", entry.name(), flags);
            if !flags.active {
                continue;
            }

            match active {
                Some(other) if other != slot => return Err(GptError::ConflictingSlots),
                _ => active = Some(slot),
            }
        }

        Ok(active)
    }

    /// Mark `slot` active and the other one inactive
    ///
    /// Only `boot_<slot>` is marked as successfully booted, every other
    /// `_a`/`_b` partition is marked unbootable. Retry counters are reset.
    pub fn set_active_slot(&mut self, slot: Slot) {
        let boot = format!("boot{}", slot.suffix());
        for entry in self.entries.iter_mut().filter(|entry| entry.is_used()) {
            let Some(entry_slot) = entry.slot() else {
                continue;
            };

            let successful = entry.name() == boot;
            entry.set_ab_flags(AbFlags {
                active: entry_slot == slot,
                successful,
                unbootable: !successful,
                tries_remaining: 0,
            });
            debug!("Set {} flags: {:?}", entry.name(), entry.ab_flags());
        }
    }

    /// Extend the partition reaching furthest into the disk up to the last
    /// usable LBA, returning its name when it changed
    pub fn grow_last_partition(&mut self) -> Option<String> {
        let last_usable = self.header.last_usable_lba;
        let entry = self
            .entries
            .iter_mut()
            .filter(|entry| entry.is_used())
            .max_by_key(|entry| entry.last_lba)?;

        if entry.last_lba >= last_usable {
            return None;
        }

        debug!(
            "Growing {} from LBA {} to {}",
            entry.name(),
            entry.last_lba,
            last_usable
        );
        entry.last_lba = last_usable;
        Some(entry.name())
    }

    /// Move the backup table to the end of a disk of `total_sectors`
    ///
    /// Only meaningful on a primary table.
    pub fn resize_disk(&mut self, total_sectors: u64) -> Result<(), GptError> {
        let entries_sectors = self.part_entries_sectors();
        let last_usable = total_sectors
            .checked_sub(entries_sectors + 2)
            .filter(|&lba| lba >= self.header.first_usable_lba)
            .ok_or(GptError::EntriesOutOfRange {
                lba: total_sectors.saturating_sub(1),
                entries_sectors,
            })?;
        let backup_lba = last_usable + entries_sectors + 1;
        if self.header.backup_lba != backup_lba {
            debug!(
                "Moving backup GPT from LBA {} to {}",
                self.header.backup_lba, backup_lba
            );
        }
        self.header.backup_lba = backup_lba;
        self.header.last_usable_lba = last_usable;
        Ok(())
    }

    /// The matching table at the other end of the disk
    ///
    /// Swaps the current and backup LBAs. The entry array of a backup table
    /// sits right before its header, the one of a primary table right after.
    pub fn as_alternate(&self) -> GptTable {
        let mut header = self.header.clone();
        header.current_lba = self.header.backup_lba;
        header.backup_lba = self.header.current_lba;
        header.part_entry_start_lba = if header.current_lba > header.backup_lba {
            header.current_lba - self.part_entries_sectors()
        } else {
            header.current_lba + 1
        };

        GptTable {
            header,
            entries: self.entries.clone(),
            index: self.index.clone(),
            sector_size: self.sector_size,
            header_crc_ok: self.header_crc_ok,
            entries_crc_ok: self.entries_crc_ok,
        }
    }

    /// Serialize the table, recomputing both CRCs
    ///
    /// Returns the header sector and the entry array.
    pub fn build(&mut self) -> (Vec<u8>, Vec<u8>) {
        let entries = encode_entries(&self.entries);
        self.header.part_entries_crc32 = crc32(&entries);
        self.header.header_crc32 = 0;

        let header_size = self.header.header_size as usize;
        let mut sector = vec![0; self.sector_size.max(header_size)];
        sector[..GptHeader::SIZE].copy_from_slice(&self.header.encode());
        self.header.header_crc32 = crc32(&sector[..header_size]);
        sector[HEADER_CRC_OFFSET..HEADER_CRC_OFFSET + 4]
            .copy_from_slice(&self.header.header_crc32.to_le_bytes());

        self.header_crc_ok = true;
        self.entries_crc_ok = true;

        (sector, entries)
    }
}

fn build_index(entries: &[PartitionEntry]) -> HashMap<String, usize> {
    let mut index = HashMap::new();
    for (i, entry) in entries.iter().enumerate().filter(|(_, e)| e.is_used()) {
        let name = entry.name();
        if index.contains_key(&name) {
            warn!("Duplicate partition name `{name}`, keeping the first entry");
            continue;
        }
        index.insert(name, i);
    }
    index
}


#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::{test_table::*, *};

    const TOTAL_SECTORS: u64 = 8 * 1024 * 1024;

    #[test]
    fn parse_typical_header() {
        let raw = primary(512, TOTAL_SECTORS, Vec::new());
        let table = GptTable::parse(&raw, 512).unwrap();
        let header = table.header();

        assert_eq!(header.revision, 0x10000);
        assert_eq!(header.header_size, 0x5C);
        assert_eq!(header.first_usable_lba, 34);
        assert_eq!(header.num_part_entries, 128);
        assert_eq!(header.part_entry_size, 128);
        assert_eq!(table.part_entries_sectors(), 32);
        assert!(table.check().is_ok());
        assert_eq!(table.partitions().count(), 0);
    }

    #[test]
    fn parse_ab_partitions() {
        let raw = primary(512, TOTAL_SECTORS, ab_partitions());
        let table = GptTable::parse(&raw, 512).unwrap();

        assert_eq!(table.locate_partition("boot_a"), Some((2048, 32768)));
        assert_eq!(table.locate_partition("system_b"), Some((2164736, 2097152)));
        assert_eq!(table.locate_partition("vendor_a"), None);
        assert_eq!(
            table.partitions().map(|p| p.name()).collect::<Vec<_>>(),
            vec!["boot_a", "boot_b", "system_a", "system_b", "userdata"]
        );
    }

    #[test]
    fn header_validation() {
        let raw = primary(4096, TOTAL_SECTORS, Vec::new());

        let mut bad = raw.header.clone();
        bad[0] = b'X';
        assert!(matches!(
            GptTable::parse_header(&bad, 1, 4096),
            Err(GptError::InvalidSignature(_))
        ));

        let mut bad = raw.header.clone();
        bad[8..12].copy_from_slice(&0x20000u32.to_le_bytes());
        assert!(matches!(
            GptTable::parse_header(&bad, 1, 4096),
            Err(GptError::UnsupportedRevision(0x20000))
        ));

        let mut bad = raw.header.clone();
        bad[12..16].copy_from_slice(&8192u32.to_le_bytes());
        assert!(matches!(
            GptTable::parse_header(&bad, 1, 4096),
            Err(GptError::InvalidHeaderSize(8192))
        ));

        let mut bad = raw.header.clone();
        bad[32..40].copy_from_slice(&3u64.to_le_bytes());
        assert!(matches!(
            GptTable::parse_header(&bad, 1, 4096),
            Err(GptError::EntriesOutOfRange { lba: 3, entries_sectors: 4 })
        ));

        assert!(matches!(
            GptTable::parse_header(&raw.header, 2, 4096),
            Err(GptError::LbaMismatch { expected: 2, found: 1 })
        ));
        assert!(matches!(
            GptTable::parse_header(&raw.header[..64], 1, 4096),
            Err(GptError::Truncated { .. })
        ));
    }

    #[test]
    fn checksum_mismatch_is_not_fatal() {
        let mut raw = primary(4096, TOTAL_SECTORS, ab_partitions());
        raw.entries[56] = b'B';

        let partial = GptTable::parse_header(&raw.header, 1, 4096).unwrap();
        assert!(partial.header_crc_ok());
        let table = partial.parse_part_entries(&raw.entries).unwrap();
        assert!(!table.entries_crc_ok());
        assert!(table.partition("Boot_a").is_some());
        assert!(matches!(
            table.check(),
            Err(GptError::ChecksumMismatch { region: "partition entries", .. })
        ));

        let mut raw = primary(4096, TOTAL_SECTORS, ab_partitions());
        raw.header[40] ^= 0xff;
        let table = GptTable::parse(&raw, 4096).unwrap();
        assert!(!table.header_crc_ok());
        assert!(matches!(
            table.check(),
            Err(GptError::ChecksumMismatch { region: "header", .. })
        ));
    }

    #[test]
    fn build_round_trip() {
        let raw = primary(4096, TOTAL_SECTORS, ab_partitions());
        let mut table = GptTable::parse(&raw, 4096).unwrap();
        let header_crc = table.header().header_crc32;
        let entries_crc = table.header().part_entries_crc32;

        let (header, entries) = table.build();

        assert_eq!(table.header().header_crc32, header_crc);
        assert_eq!(table.header().part_entries_crc32, entries_crc);
        assert_eq!(header, raw.header);
        assert_eq!(entries, raw.entries);
    }

    #[test]
    fn alternate_tables() {
        let raw = primary(4096, TOTAL_SECTORS, ab_partitions());
        let table = GptTable::parse(&raw, 4096).unwrap();

        let mut backup = table.as_alternate();
        assert_eq!(backup.header().current_lba, TOTAL_SECTORS - 1);
        assert_eq!(backup.header().backup_lba, 1);
        assert_eq!(backup.header().part_entry_start_lba, TOTAL_SECTORS - 1 - 4);

        let (header, entries) = backup.build();
        let reparsed = GptTable::parse(
            &RawGpt {
                lba: TOTAL_SECTORS - 1,
                header,
                entries,
            },
            4096,
        )
        .unwrap();
        assert!(reparsed.check().is_ok());

        let mut primary = reparsed.as_alternate();
        assert_eq!(primary.header().part_entry_start_lba, 2);
        let (header, _) = primary.build();
        assert_eq!(header, raw.header);
    }

    #[test]
    fn active_slot() {
        let raw = primary(4096, TOTAL_SECTORS, ab_partitions());
        let mut table = GptTable::parse(&raw, 4096).unwrap();
        assert_eq!(table.get_active_slot().unwrap(), None);

        table.set_active_slot(Slot::A);
        assert_eq!(table.get_active_slot().unwrap(), Some(Slot::A));
        for entry in table.partitions() {
            let flags = entry.ab_flags();
            match entry.slot() {
                Some(Slot::A) => assert!(flags.active, "{}", entry.name()),
                Some(Slot::B) => assert!(!flags.active, "{}", entry.name()),
                None => assert_eq!(entry.attributes, 0),
            }
            assert_eq!(flags.successful, entry.name() == "boot_a");
            assert_eq!(flags.unbootable, entry.slot().is_some() && entry.name() != "boot_a");
            assert_eq!(flags.tries_remaining, 0);
        }

        table.set_active_slot(Slot::B);
        assert_eq!(table.get_active_slot().unwrap(), Some(Slot::B));
        assert!(table.partition("boot_b").unwrap().ab_flags().successful);
        assert!(!table.partition("boot_a").unwrap().ab_flags().successful);
    }

    #[test]
    fn conflicting_slots() {
        let active = AbFlags {
            active: true,
            ..Default::default()
        }
        .apply(0);
        let raw = primary(
            4096,
            TOTAL_SECTORS,
            vec![entry("boot_a", 64, 64, active), entry("boot_b", 128, 64, active)],
        );
        let table = GptTable::parse(&raw, 4096).unwrap();

        assert!(matches!(
            table.get_active_slot(),
            Err(GptError::ConflictingSlots)
        ));
    }

    #[test]
    fn duplicate_names_keep_first() {
        let raw = primary(
            4096,
            TOTAL_SECTORS,
            vec![entry("modem", 64, 64, 0), entry("modem", 1024, 8, 0)],
        );
        let table = GptTable::parse(&raw, 4096).unwrap();

        assert_eq!(table.locate_partition("modem"), Some((64, 64)));
        assert_eq!(table.partitions().count(), 2);
    }

    #[test]
    fn grow_and_resize() {
        let raw = primary(4096, TOTAL_SECTORS, ab_partitions());
        let mut table = GptTable::parse(&raw, 4096).unwrap();

        assert_eq!(table.grow_last_partition().as_deref(), Some("userdata"));
        assert_eq!(
            table.partition("userdata").unwrap().last_lba,
            TOTAL_SECTORS - 2 - 4
        );
        assert_eq!(table.grow_last_partition(), None);

        table.resize_disk(2 * TOTAL_SECTORS).unwrap();
        assert_eq!(table.header().backup_lba, 2 * TOTAL_SECTORS - 1);
        assert_eq!(table.header().last_usable_lba, 2 * TOTAL_SECTORS - 2 - 4);
        table.grow_last_partition();
        assert_eq!(
            table.partition("userdata").unwrap().last_lba,
            2 * TOTAL_SECTORS - 2 - 4
        );
    }

    #[test]
    fn resize_to_tiny_disk() {
        let raw = primary(4096, TOTAL_SECTORS, Vec::new());
        let mut table = GptTable::parse(&raw, 4096).unwrap();

        for total_sectors in [0, 1, 5, 9] {
            assert!(matches!(
                table.resize_disk(total_sectors),
                Err(GptError::EntriesOutOfRange { entries_sectors: 4, .. })
            ));
        }
        assert_eq!(table.header().backup_lba, TOTAL_SECTORS - 1);

        table.resize_disk(12).unwrap();
        assert_eq!(table.header().backup_lba, 11);
        assert_eq!(table.header().last_usable_lba, 6);
    }
}
