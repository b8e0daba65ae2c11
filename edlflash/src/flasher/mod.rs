//! Operate on a device in EDL mode
//!
//! The [Flasher] struct owns the channel to a device for the whole session.
//! It uploads the Firehose programmer through Sahara, then resolves
//! partition names through the GPT of every LUN to read, write, erase and
//! repair on-device storage.

use std::io::{Cursor, Read, Seek};

use log::{debug, info, warn};

use crate::{
    connection::Channel,
    error::{Error, GptError},
    firehose::{FirehoseClient, FirehoseConfig, StorageInfo},
    gpt::{
        create_backup_gpt_header,
        ensure_gpt_hdr_consistency,
        Consistency,
        GptTable,
        PartitionEntry,
        RawGpt,
        Slot,
        PRIMARY_HEADER_LBA,
    },
    progress::ProgressCallbacks,
    sahara::SaharaClient,
    sparse::inflated_size,
};

/// A session with a device running the Firehose programmer
pub struct Flasher<C> {
    firehose: FirehoseClient<C>,
    /// Serial number read during the Sahara handshake
    serial: Option<String>,
}

impl<C: Channel> Flasher<C> {
    /// Upload `programmer` to a device waiting in Sahara mode and open a
    /// Firehose session with it
    pub fn connect(channel: C, programmer: &[u8], config: FirehoseConfig) -> Result<Self, Error> {
        let mut sahara = SaharaClient::new(channel);
        sahara.connect()?;
        sahara.upload_loader(programmer)?;
        let serial = sahara.serial().map(str::to_owned);

        let mut firehose = FirehoseClient::new(sahara.into_channel(), config);
        firehose.configure()?;

        Ok(Flasher { firehose, serial })
    }

    /// Open a Firehose session with a programmer that is already running
    pub fn attach(channel: C, config: FirehoseConfig) -> Result<Self, Error> {
        let mut firehose = FirehoseClient::new(channel, config);
        firehose.configure()?;

        Ok(Flasher {
            firehose,
            serial: None,
        })
    }

    pub fn serial(&self) -> Option<&str> {
        self.serial.as_deref()
    }

    pub fn firehose(&mut self) -> &mut FirehoseClient<C> {
        &mut self.firehose
    }

    pub fn into_channel(self) -> C {
        self.firehose.into_channel()
    }

    fn sector_size(&self) -> usize {
        self.firehose.config().sector_size
    }

    fn luns(&self) -> Vec<u8> {
        self.firehose.luns().to_vec()
    }

    /// Reboot the device
    pub fn reset(&mut self) -> Result<(), Error> {
        info!("Resetting device");
        self.firehose.cmd_reset()
    }

    pub fn set_boot_lun(&mut self, lun: u8) -> Result<(), Error> {
        self.firehose.cmd_set_boot_lun_id(lun)
    }

    /// Storage details of LUN 0
    pub fn get_storage_info(&mut self) -> Result<StorageInfo, Error> {
        self.lun_storage_info(0)
    }

    pub fn lun_storage_info(&mut self, lun: u8) -> Result<StorageInfo, Error> {
        let logs = self.firehose.cmd_get_storage_info(lun)?;
        StorageInfo::from_logs(&logs)
    }

    /// Size of a LUN in sectors, as reported by the programmer
    fn total_sectors(&mut self, lun: u8) -> Result<u64, Error> {
        let info = self.lun_storage_info(lun)?;
        let sector_size = self.sector_size() as u64;
        let block_size = match info.block_size {
            0 => sector_size,
            size => u64::from(size),
        };

        match info.total_blocks * block_size / sector_size {
            0 => Err(Error::StorageInfo(format!("LUN {lun} reports no blocks"))),
            total => Ok(total),
        }
    }

    /// Read the raw sectors of the table whose header sits at `lba`
    ///
    /// When the header cannot be parsed the entry array is left empty.
    fn read_raw_gpt(&mut self, lun: u8, lba: u64) -> Result<RawGpt, Error> {
        let sector_size = self.sector_size();
        let header = self.firehose.cmd_read_buffer(lun, lba, 1)?;

        let entries = match GptTable::parse_header(&header, lba, sector_size) {
            Ok(partial) => {
                let start = partial.header().part_entry_start_lba;
                let sectors = partial.part_entries_sectors();
                self.firehose.cmd_read_buffer(lun, start, sectors)?
            }
            Err(err) => {
                debug!("No usable GPT header at LBA {lba} of LUN {lun}: {err}");
                Vec::new()
            }
        };

        Ok(RawGpt {
            lba,
            header,
            entries,
        })
    }

    fn read_gpt(&mut self, lun: u8, lba: u64) -> Result<GptTable, Error> {
        let sector_size = self.sector_size();
        let partial = GptTable::parse_header(
            &self.firehose.cmd_read_buffer(lun, lba, 1)?,
            lba,
            sector_size,
        )?;
        let entries = self.firehose.cmd_read_buffer(
            lun,
            partial.header().part_entry_start_lba,
            partial.part_entries_sectors(),
        )?;

        Ok(partial.parse_part_entries(&entries)?)
    }

    /// The primary partition table of a LUN
    pub fn list_partitions(&mut self, lun: u8) -> Result<GptTable, Error> {
        self.read_gpt(lun, PRIMARY_HEADER_LBA)
    }

    /// The backup partition table of a LUN, located through the primary
    pub fn read_backup_gpt(&mut self, lun: u8) -> Result<GptTable, Error> {
        let sector_size = self.sector_size();
        let primary = self.firehose.cmd_read_buffer(lun, PRIMARY_HEADER_LBA, 1)?;
        let backup_lba = GptTable::parse_header(&primary, PRIMARY_HEADER_LBA, sector_size)?
            .header()
            .backup_lba;

        self.read_gpt(lun, backup_lba)
    }

    /// The primary table of a LUN, or `None` when the LUN has none
    fn lun_table(&mut self, lun: u8) -> Result<Option<GptTable>, Error> {
        match self.list_partitions(lun) {
            Ok(table) => Ok(Some(table)),
            Err(err @ (Error::Nak { .. } | Error::Gpt(_))) => {
                debug!("Skipping LUN {lun}: {err}");
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }

    /// The first LUN holding a partition called `name`, and its entry
    pub fn find_partition(&mut self, name: &str) -> Result<(u8, PartitionEntry), Error> {
        for lun in self.luns() {
            if let Some(entry) = self
                .lun_table(lun)?
                .and_then(|table| table.partition(name).cloned())
            {
                debug!(
                    "Found {name} on LUN {lun} at sector {}, {} sectors",
                    entry.first_lba,
                    entry.sectors()
                );
                return Ok((lun, entry));
            }
        }

        Err(Error::PartitionNotFound(name.to_owned()))
    }

    /// The slot marked active in the first LUN with A/B partitions
    pub fn get_active_slot(&mut self) -> Result<Option<Slot>, Error> {
        for lun in self.luns() {
            let Some(table) = self.lun_table(lun)? else {
                continue;
            };
            if let Some(slot) = table.get_active_slot()? {
                return Ok(Some(slot));
            }
        }

        Ok(None)
    }

    /// Mark `slot` active in the primary and backup table of every LUN
    ///
    /// Every table is checked before the first write. A primary table with a
    /// bad CRC is left alone, along with its backup, until `repair_gpt` ran.
    pub fn set_active_slot(&mut self, slot: Slot) -> Result<(), Error> {
        let mut tables = Vec::new();
        for lun in self.luns() {
            let Some(table) = self.lun_table(lun)? else {
                continue;
            };
            if !table.partitions().any(|entry| entry.slot().is_some()) {
                continue;
            }
            if let Err(err) = table.check() {
                warn!("GPT of LUN {lun} is damaged, no slot change written");
                return Err(err.into());
            }
            tables.push((lun, table));
        }

        if tables.is_empty() {
            warn!("No LUN carries A/B partitions, nothing to update");
            return Ok(());
        }

        let updated = tables.len();
        for (lun, mut table) in tables {
            table.set_active_slot(slot);
            self.write_primary(lun, &mut table)?;
            self.write_backup(lun, &table)?;
        }
        info!("Slot {slot} is now active on {updated} LUN(s)");

        Ok(())
    }

    /// Erase the named partition
    pub fn erase(&mut self, name: &str) -> Result<(), Error> {
        let (lun, entry) = self.find_partition(name)?;
        info!("Erasing {name}");
        self.firehose
            .cmd_erase(lun, entry.first_lba, entry.sectors())
    }

    /// Write an image, raw or sparse, to the named partition
    pub fn flash<R: Read + Seek>(
        &mut self,
        name: &str,
        mut image: R,
        mut progress: Option<&mut dyn ProgressCallbacks>,
    ) -> Result<(), Error> {
        let (lun, entry) = self.find_partition(name)?;

        let image_size = inflated_size(&mut image)?;
        let partition_size = entry.sectors() * self.sector_size() as u64;
        if image_size > partition_size {
            return Err(Error::ImageTooLarge {
                partition: name.to_owned(),
                image_size,
                partition_size,
            });
        }

        info!("Flashing {image_size} bytes to {name}");
        self.firehose
            .cmd_program(lun, entry.first_lba, image, &mut progress)
    }

    /// Bring the primary and backup table of a LUN back in line
    ///
    /// A damaged primary table is rebuilt from the backup, a damaged or
    /// outdated backup is rebuilt from the primary. With
    /// `grow_last_partition` the tables are moved to the end of the LUN and
    /// the last partition takes up the space gained.
    pub fn repair_gpt(&mut self, lun: u8, grow_last_partition: bool) -> Result<Consistency, Error> {
        let sector_size = self.sector_size();

        let mut primary = self.read_raw_gpt(lun, PRIMARY_HEADER_LBA)?;
        let backup_lba = match GptTable::parse_header(&primary.header, PRIMARY_HEADER_LBA, sector_size)
        {
            Ok(partial) if partial.header_crc_ok() => partial.header().backup_lba,
            Ok(_) => {
                warn!("Primary GPT header of LUN {lun} fails its CRC, looking for the backup at the end of the LUN");
                self.total_sectors(lun)? - 1
            }
            Err(err) => {
                warn!("Primary GPT of LUN {lun} is unreadable ({err}), looking for the backup at the end of the LUN");
                self.total_sectors(lun)? - 1
            }
        };
        let backup = self.read_raw_gpt(lun, backup_lba)?;

        let original = primary.clone();
        let consistency = ensure_gpt_hdr_consistency(&mut primary, &backup, sector_size)?;
        let mut table = GptTable::parse(&primary, sector_size)?;

        if grow_last_partition {
            let total_sectors = self.total_sectors(lun)?;
            table.resize_disk(total_sectors)?;
            if let Some(name) = table.grow_last_partition() {
                info!("Grew {name} to the end of LUN {lun}");
            }
        }

        let (header, entries) = table.build();
        let primary_changed = header != original.header || entries != original.entries;
        if primary_changed {
            info!("Writing primary GPT of LUN {lun}");
            self.write_raw(
                lun,
                table.header().part_entry_start_lba,
                &entries,
                PRIMARY_HEADER_LBA,
                &header,
            )?;
        }
        if primary_changed || consistency.backup_corrupt {
            info!("Writing backup GPT of LUN {lun}");
            self.write_backup(lun, &table)?;
        }
        if !primary_changed && !consistency.backup_corrupt {
            info!("GPT of LUN {lun} is consistent");
        }

        Ok(consistency)
    }

    /// Write a GPT image, protective MBR first, to the start of a LUN and
    /// regenerate its backup table
    pub fn restore_gpt<R: Read + Seek>(&mut self, lun: u8, image: R) -> Result<(), Error> {
        info!("Restoring GPT of LUN {lun}");
        self.firehose.cmd_program(lun, 0, image, &mut None)?;

        let table = self.list_partitions(lun)?;
        table.check()?;
        self.write_backup(lun, &table)
    }

    fn write_primary(&mut self, lun: u8, table: &mut GptTable) -> Result<(), Error> {
        let (header, entries) = table.build();
        let entries_lba = table.header().part_entry_start_lba;
        let header_lba = table.header().current_lba;

        self.write_raw(lun, entries_lba, &entries, header_lba, &header)
    }

    fn write_backup(&mut self, lun: u8, primary: &GptTable) -> Result<(), Error> {
        let (header, entries) = create_backup_gpt_header(primary);
        let header_lba = primary.header().backup_lba;
        let entries_sectors = primary.part_entries_sectors();
        let entries_lba = header_lba
            .checked_sub(entries_sectors)
            .ok_or(GptError::EntriesOutOfRange {
                lba: header_lba,
                entries_sectors,
            })?;

        self.write_raw(lun, entries_lba, &entries, header_lba, &header)
    }

    /// Write the entry array before the header, so an interrupted write
    /// leaves a header whose entries CRC fails
    fn write_raw(
        &mut self,
        lun: u8,
        entries_lba: u64,
        entries: &[u8],
        header_lba: u64,
        header: &[u8],
    ) -> Result<(), Error> {
        debug!("Writing GPT to LUN {lun}: header at {header_lba}, entries at {entries_lba}");
        self.firehose
            .cmd_program(lun, entries_lba, Cursor::new(entries), &mut None)?;
        self.firehose
            .cmd_program(lun, header_lba, Cursor::new(header), &mut None)
    }
}
