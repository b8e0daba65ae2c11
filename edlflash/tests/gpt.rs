use crc::{Crc, CRC_32_ISO_HDLC};
use edlflash::{
    error::GptError,
    gpt::{
        create_backup_gpt_header, ensure_gpt_hdr_consistency, AbFlags, GptTable, RawGpt, Slot,
    },
};

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

const SECTOR_SIZE: usize = 4096;
const TOTAL_SECTORS: u64 = 1 << 20;
const NUM_ENTRIES: usize = 64;

/// Linux filesystem data, in its on-disk mixed-endian byte order
const LINUX_DATA: [u8; 16] = [
    0xaf, 0x3d, 0xc6, 0x0f, 0x83, 0x84, 0x72, 0x47, 0x8e, 0x79, 0x3d, 0x69, 0xd8, 0x47, 0x7d, 0xe4,
];

fn ab(active: bool, successful: bool) -> u64 {
    AbFlags {
        active,
        successful,
        unbootable: !successful,
        tries_remaining: 0,
    }
    .apply(0)
}

/// Encode a partition entry byte by byte
fn entry(name: &str, first_lba: u64, last_lba: u64, attributes: u64) -> [u8; 128] {
    let mut entry = [0; 128];
    entry[..16].copy_from_slice(&LINUX_DATA);
    entry[16..24].copy_from_slice(&first_lba.to_be_bytes());
    entry[24] = name.len() as u8;
    entry[32..40].copy_from_slice(&first_lba.to_le_bytes());
    entry[40..48].copy_from_slice(&last_lba.to_le_bytes());
    entry[48..56].copy_from_slice(&attributes.to_le_bytes());
    for (i, unit) in name.encode_utf16().enumerate() {
        entry[56 + 2 * i..58 + 2 * i].copy_from_slice(&unit.to_le_bytes());
    }
    entry
}

fn entry_array() -> Vec<u8> {
    let mut entries = Vec::new();
    entries.extend(entry("xbl_a", 6, 1029, ab(true, false)));
    entries.extend(entry("xbl_b", 1030, 2053, ab(false, false)));
    entries.extend(entry("boot_a", 2054, 18437, ab(true, true)));
    entries.extend(entry("boot_b", 18438, 34821, ab(false, false)));
    entries.extend(entry("modemst1", 34822, 35333, 0));
    entries.extend(entry("userdata", 35334, 900_000, 0));
    entries.resize(NUM_ENTRIES * 128, 0);
    entries
}

/// Encode a primary header sector for `entries`
fn header_sector(entries: &[u8]) -> Vec<u8> {
    let entries_sectors = (entries.len() / SECTOR_SIZE) as u64;

    let mut sector = vec![0; SECTOR_SIZE];
    sector[..8].copy_from_slice(b"EFI PART");
    sector[8..12].copy_from_slice(&0x0001_0000u32.to_le_bytes());
    sector[12..16].copy_from_slice(&92u32.to_le_bytes());
    sector[24..32].copy_from_slice(&1u64.to_le_bytes());
    sector[32..40].copy_from_slice(&(TOTAL_SECTORS - 1).to_le_bytes());
    sector[40..48].copy_from_slice(&(2 + entries_sectors).to_le_bytes());
    sector[48..56].copy_from_slice(&(TOTAL_SECTORS - 2 - entries_sectors).to_le_bytes());
    sector[56..72].copy_from_slice(&[0x42; 16]);
    sector[72..80].copy_from_slice(&2u64.to_le_bytes());
    sector[80..84].copy_from_slice(&(NUM_ENTRIES as u32).to_le_bytes());
    sector[84..88].copy_from_slice(&128u32.to_le_bytes());
    sector[88..92].copy_from_slice(&CRC32.checksum(entries).to_le_bytes());

    let crc = CRC32.checksum(&sector[..92]);
    sector[16..20].copy_from_slice(&crc.to_le_bytes());
    sector
}

fn primary() -> RawGpt {
    let entries = entry_array();
    RawGpt {
        lba: 1,
        header: header_sector(&entries),
        entries,
    }
}

fn backup_of(primary: &RawGpt) -> RawGpt {
    let table = GptTable::parse(primary, SECTOR_SIZE).unwrap();
    let (header, entries) = create_backup_gpt_header(&table);
    RawGpt {
        lba: TOTAL_SECTORS - 1,
        header,
        entries,
    }
}

#[test]
fn parse_device_table() {
    let table = GptTable::parse(&primary(), SECTOR_SIZE).unwrap();
    assert!(table.check().is_ok());

    let header = table.header();
    assert_eq!(header.first_usable_lba, 4);
    assert_eq!(header.last_usable_lba, TOTAL_SECTORS - 4);
    assert_eq!(table.part_entries_sectors(), 2);
    assert_eq!(table.entries().len(), NUM_ENTRIES);

    let names = table.partitions().map(|e| e.name()).collect::<Vec<_>>();
    assert_eq!(
        names,
        ["xbl_a", "xbl_b", "boot_a", "boot_b", "modemst1", "userdata"]
    );

    let boot = table.partition("boot_a").unwrap();
    assert_eq!(
        boot.type_guid.to_string(),
        "0fc63daf-8483-4772-8e79-3d69d8477de4"
    );
    assert_eq!(table.locate_partition("boot_a"), Some((2054, 16384)));
    assert_eq!(table.locate_partition("modemst1"), Some((34822, 512)));
    assert_eq!(table.locate_partition("cache"), None);
}

#[test]
fn active_slot() {
    let mut table = GptTable::parse(&primary(), SECTOR_SIZE).unwrap();
    assert_eq!(table.get_active_slot().unwrap(), Some(Slot::A));

    table.set_active_slot(Slot::B);
    let (header, entries) = table.build();
    let table = GptTable::parse(
        &RawGpt {
            lba: 1,
            header,
            entries,
        },
        SECTOR_SIZE,
    )
    .unwrap();

    assert!(table.check().is_ok());
    assert_eq!(table.get_active_slot().unwrap(), Some(Slot::B));

    let flags = |name: &str| table.partition(name).unwrap().ab_flags();
    assert!(flags("boot_b").active && flags("boot_b").successful);
    assert!(flags("xbl_b").active && flags("xbl_b").unbootable);
    assert!(!flags("boot_a").active && flags("boot_a").unbootable);
    assert_eq!(table.partition("userdata").unwrap().attributes, 0);
}

#[test]
fn backup_table_layout() {
    let primary = primary();
    let backup = backup_of(&primary);
    let table = GptTable::parse(&backup, SECTOR_SIZE).unwrap();

    assert!(table.check().is_ok());
    assert_eq!(table.header().current_lba, TOTAL_SECTORS - 1);
    assert_eq!(table.header().backup_lba, 1);
    assert_eq!(table.header().part_entry_start_lba, TOTAL_SECTORS - 3);
    assert_eq!(backup.entries, primary.entries);
}

#[test]
fn corrupt_primary_entries_are_restored() {
    let original = primary();
    let backup = backup_of(&original);

    let mut damaged = original.clone();
    damaged.entries[2 * 128 + 60] ^= 0xff;
    assert!(matches!(
        GptTable::parse(&damaged, SECTOR_SIZE).unwrap().check(),
        Err(GptError::ChecksumMismatch { region: "partition entries", .. })
    ));

    let consistency = ensure_gpt_hdr_consistency(&mut damaged, &backup, SECTOR_SIZE).unwrap();
    assert!(consistency.primary_repaired);
    assert_eq!(damaged, original);
}

#[test]
fn corrupt_primary_header_is_restored() {
    let original = primary();
    let backup = backup_of(&original);

    let mut damaged = original.clone();
    damaged.header[40] ^= 0x01;
    assert!(GptTable::parse(&damaged, SECTOR_SIZE).unwrap().check().is_err());

    ensure_gpt_hdr_consistency(&mut damaged, &backup, SECTOR_SIZE).unwrap();
    assert_eq!(damaged, original);
}

#[test]
fn unusable_tables() {
    let mut damaged = primary();
    damaged.header[..8].copy_from_slice(b"NOT PART");
    let mut backup = backup_of(&primary());
    backup.entries.truncate(128);

    assert!(matches!(
        GptTable::parse(&damaged, SECTOR_SIZE),
        Err(GptError::InvalidSignature(_))
    ));
    assert!(matches!(
        ensure_gpt_hdr_consistency(&mut damaged, &backup, SECTOR_SIZE),
        Err(GptError::CorruptStorage)
    ));
}
