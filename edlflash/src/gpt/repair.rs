use log::{debug, info, warn};

use super::GptTable;
use crate::error::GptError;

/// Raw sectors of one copy of a partition table
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RawGpt {
    /// LBA the header sector was read from
    pub lba: u64,
    /// The header sector
    pub header: Vec<u8>,
    /// The partition entry array
    pub entries: Vec<u8>,
}

/// What [ensure_gpt_hdr_consistency] found and did
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Consistency {
    /// The primary copy was rebuilt from the backup
    pub primary_repaired: bool,
    /// The backup copy is unusable and should be rewritten from the primary
    pub backup_corrupt: bool,
}

/// Parse one copy, returning `None` when it cannot be trusted
fn intact(raw: &RawGpt, sector_size: usize, which: &str) -> Option<GptTable> {
    match GptTable::parse(raw, sector_size) {
        Ok(table) if table.header_crc_ok() && table.entries_crc_ok() => Some(table),
        Ok(_) => {
            warn!("{which} GPT at LBA {} fails its CRC checks", raw.lba);
            None
        }
        Err(err) => {
            warn!("{which} GPT at LBA {} is invalid: {err}", raw.lba);
            None
        }
    }
}

/// Make the primary table consistent with the backup
///
/// A corrupt primary is rebuilt from an intact backup, as is a primary
/// whose entry array disagrees with an intact backup. A corrupt backup
/// leaves the primary untouched and is flagged so the caller can rewrite it.
/// Fails with [GptError::CorruptStorage] when neither copy is usable.
pub fn ensure_gpt_hdr_consistency(
    primary: &mut RawGpt,
    backup: &RawGpt,
    sector_size: usize,
) -> Result<Consistency, GptError> {
    let primary_table = intact(primary, sector_size, "Primary");
    let backup_table = intact(backup, sector_size, "Backup");

    let backup_table = match (primary_table, backup_table) {
        (None, None) => return Err(GptError::CorruptStorage),
        (Some(_), None) => {
            return Ok(Consistency {
                primary_repaired: false,
                backup_corrupt: true,
            });
        }
        (Some(primary_table), Some(backup_table)) => {
            if primary_table.header().part_entries_crc32 == backup_table.header().part_entries_crc32
            {
                debug!("Primary and backup GPT agree");
                return Ok(Consistency::default());
            }
            warn!("Primary and backup GPT entries differ, restoring primary from backup");
            backup_table
        }
        (None, Some(backup_table)) => backup_table,
    };

    let (header, entries) = backup_table.as_alternate().build();
    info!("Rebuilt primary GPT from backup at LBA {}", backup.lba);
    primary.lba = backup_table.header().backup_lba;
    primary.header = header;
    primary.entries = entries;

    Ok(Consistency {
        primary_repaired: true,
        backup_corrupt: false,
    })
}

/// Build the backup header sector and entry array matching `primary`
pub fn create_backup_gpt_header(primary: &GptTable) -> (Vec<u8>, Vec<u8>) {
    primary.as_alternate().build()
}
