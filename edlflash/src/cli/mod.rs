//! Types and functions for the command-line interface
//!
//! No stability guaranties apply

use std::{
    fs::{self, File},
    io::BufWriter,
    path::{Path, PathBuf},
};

use clap::Args;
use comfy_table::{modifiers, presets::UTF8_FULL, Attribute, Cell, Color, Table};
use indicatif::{HumanBytes, ProgressBar, ProgressStyle};
use log::{info, warn};
use miette::{IntoDiagnostic, Result, WrapErr};

use self::{config::Config, serial::get_serial_port_info};
use crate::{
    connection::SerialChannel,
    error::Error,
    firehose::StorageInfo,
    flasher::Flasher,
    gpt::{GptTable, Slot},
    progress::ProgressCallbacks,
    sparse,
};

pub mod config;

mod serial;

/// Establish a connection with a target device
#[derive(Debug, Args)]
#[non_exhaustive]
pub struct ConnectArgs {
    /// Serial port connected to the device
    #[arg(short = 'p', long, env = "EDLFLASH_PORT")]
    pub port: Option<String>,
    /// Firehose programmer to upload, defaults to `programmer` from
    /// `edlflash.toml`
    #[arg(short = 'l', long, env = "EDLFLASH_PROGRAMMER")]
    pub programmer: Option<PathBuf>,
    /// Do not upload a programmer, one is already running on the device
    #[arg(long, conflicts_with = "programmer")]
    pub no_programmer: bool,
}

/// Progress bar shown while streaming data to the device
#[derive(Default)]
pub struct EdlProgress {
    pb: Option<ProgressBar>,
}

impl ProgressCallbacks for EdlProgress {
    fn init(&mut self, start_sector: u64, total: usize) {
        let pb = ProgressBar::new(total as u64);
        if let Ok(style) = ProgressStyle::with_template(
            "[{elapsed_precise}] {bar:40.cyan/blue} {bytes:>10}/{total_bytes:10} {msg}",
        ) {
            pb.set_style(style.progress_chars("#>-"));
        }
        pb.set_message(format!("sector {start_sector:#x}"));

        self.pb = Some(pb);
    }

    fn update(&mut self, current: usize) {
        if let Some(pb) = &self.pb {
            pb.set_position(current as u64);
        }
    }

    fn finish(&mut self) {
        if let Some(pb) = &self.pb {
            pb.finish_with_message("done");
        }
    }
}

fn read_file(path: &Path) -> Result<Vec<u8>, Error> {
    fs::read(path).map_err(|e| Error::FileOpenError(path.display().to_string(), e))
}

fn open_file(path: &Path) -> Result<File, Error> {
    File::open(path).map_err(|e| Error::FileOpenError(path.display().to_string(), e))
}

/// Open the serial port and start a Firehose session
pub fn connect(args: &ConnectArgs, config: &Config) -> Result<Flasher<SerialChannel>> {
    let port_info = get_serial_port_info(args, config)?;
    info!("Serial port: '{}'", port_info.port_name);

    let channel = SerialChannel::open(&port_info.port_name)
        .wrap_err_with(|| format!("Failed to open serial port {}", port_info.port_name))?;
    let firehose_config = config.project_config.firehose.clone();

    if args.no_programmer {
        info!("Attaching to running programmer...");
        return Ok(Flasher::attach(channel, firehose_config)?);
    }

    let path = args
        .programmer
        .as_ref()
        .or(config.project_config.programmer.as_ref())
        .ok_or(Error::NoProgrammer)?;
    let programmer = read_file(path)?;

    info!("Uploading {} ({})...", path.display(), HumanBytes(programmer.len() as u64));
    let flasher = Flasher::connect(channel, &programmer, firehose_config)?;
    if let Some(serial) = flasher.serial() {
        info!("Device serial number: {serial}");
    }

    Ok(flasher)
}

pub fn reset(args: ConnectArgs, config: &Config) -> Result<()> {
    let mut flasher = connect(&args, config)?;
    flasher.reset()?;

    Ok(())
}

pub fn get_active_slot(args: ConnectArgs, config: &Config) -> Result<()> {
    let mut flasher = connect(&args, config)?;
    match flasher.get_active_slot()? {
        Some(slot) => println!("Active slot: {slot}"),
        None => println!("No slot is marked active"),
    }

    Ok(())
}

pub fn set_active_slot(args: ConnectArgs, config: &Config, slot: &str) -> Result<()> {
    let slot = Slot::parse(slot)?;
    let mut flasher = connect(&args, config)?;
    flasher.set_active_slot(slot)?;

    Ok(())
}

pub fn storage_info(args: ConnectArgs, config: &Config) -> Result<()> {
    let mut flasher = connect(&args, config)?;
    let info = flasher.get_storage_info()?;
    print_storage_info(&info);

    Ok(())
}

pub fn print_storage_info(info: &StorageInfo) {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .apply_modifier(modifiers::UTF8_ROUND_CORNERS);

    let block_size = u64::from(info.block_size);
    let rows = [
        ("Memory type", info.mem_type.clone()),
        ("Product", info.prod_name.clone()),
        ("Firmware", info.fw_version.clone()),
        ("Manufacturer ID", format!("{:#x}", info.manufacturer_id)),
        ("Serial number", format!("{:#x}", info.serial_num)),
        ("Physical partitions", info.num_physical.to_string()),
        ("Block size", info.block_size.to_string()),
        ("Page size", info.page_size.to_string()),
        (
            "Total blocks",
            format!(
                "{} ({})",
                info.total_blocks,
                HumanBytes(info.total_blocks * block_size)
            ),
        ),
    ];
    for (name, value) in rows {
        table.add_row(vec![
            Cell::new(name).fg(Color::Green).add_attribute(Attribute::Bold),
            Cell::new(value),
        ]);
    }

    println!("{table}");
}

pub fn print_gpt(args: ConnectArgs, config: &Config, lun: Option<u8>, backup: bool) -> Result<()> {
    let mut flasher = connect(&args, config)?;
    let all_luns = lun.is_none();
    let luns = match lun {
        Some(lun) => vec![lun],
        None => flasher.firehose().luns().to_vec(),
    };

    for lun in luns {
        let table = if backup {
            flasher.read_backup_gpt(lun)
        } else {
            flasher.list_partitions(lun)
        };

        match table {
            Ok(table) => {
                if let Err(e) = table.check() {
                    warn!("LUN {lun}: {e}");
                }
                println!("LUN {lun}");
                pretty_print(&table);
            }
            Err(Error::Nak { .. }) if all_luns => {
                info!("LUN {lun} is not present");
            }
            Err(e) => return Err(e).wrap_err_with(|| format!("Failed to read GPT of LUN {lun}")),
        }
    }

    Ok(())
}

/// Print the used entries of a partition table
pub fn pretty_print(gpt: &GptTable) {
    let sector_size = gpt.sector_size() as u64;

    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .apply_modifier(modifiers::UTF8_ROUND_CORNERS)
        .set_header(vec![
            Cell::new("Name")
                .fg(Color::Green)
                .add_attribute(Attribute::Bold),
            Cell::new("Start")
                .fg(Color::Red)
                .add_attribute(Attribute::Bold),
            Cell::new("Sectors")
                .fg(Color::Yellow)
                .add_attribute(Attribute::Bold),
            Cell::new("Size")
                .fg(Color::Yellow)
                .add_attribute(Attribute::Bold),
            Cell::new("Type")
                .fg(Color::Cyan)
                .add_attribute(Attribute::Bold),
            Cell::new("A/B")
                .fg(Color::Magenta)
                .add_attribute(Attribute::Bold),
        ]);

    for entry in gpt.partitions() {
        let ab = match entry.slot() {
            Some(_) => {
                let flags = entry.ab_flags();
                let mut labels = Vec::new();
                if flags.active {
                    labels.push("active".to_owned());
                }
                if flags.successful {
                    labels.push("successful".to_owned());
                }
                if flags.unbootable {
                    labels.push("unbootable".to_owned());
                }
                if flags.tries_remaining > 0 {
                    labels.push(format!("{} tries", flags.tries_remaining));
                }
                labels.join(", ")
            }
            None => String::new(),
        };

        table.add_row(vec![
            Cell::new(entry.name()).fg(Color::Green),
            Cell::new(format!("{:#x}", entry.first_lba)).fg(Color::Red),
            Cell::new(entry.sectors()).fg(Color::Yellow),
            Cell::new(HumanBytes(entry.sectors() * sector_size)).fg(Color::Yellow),
            Cell::new(entry.type_guid).fg(Color::Cyan),
            Cell::new(ab).fg(Color::Magenta),
        ]);
    }

    println!("{table}");
}

pub fn repair_gpt(args: ConnectArgs, config: &Config, lun: u8, grow: bool) -> Result<()> {
    let mut flasher = connect(&args, config)?;
    let consistency = flasher.repair_gpt(lun, grow)?;
    if consistency.primary_repaired {
        println!("Primary GPT of LUN {lun} was restored from its backup");
    }

    Ok(())
}

pub fn restore_gpt(args: ConnectArgs, config: &Config, lun: u8, image: &Path) -> Result<()> {
    let image = open_file(image)?;
    let mut flasher = connect(&args, config)?;
    flasher.restore_gpt(lun, image)?;

    Ok(())
}

pub fn erase(args: ConnectArgs, config: &Config, partition: &str) -> Result<()> {
    let mut flasher = connect(&args, config)?;
    flasher.erase(partition)?;
    println!("Partition {partition} erased");

    Ok(())
}

pub fn flash(args: ConnectArgs, config: &Config, partition: &str, image: &Path) -> Result<()> {
    let image = open_file(image)?;
    let mut flasher = connect(&args, config)?;

    let mut progress = EdlProgress::default();
    flasher.flash(partition, image, Some(&mut progress))?;
    println!("Flashing has completed!");

    Ok(())
}

pub fn set_boot_lun(args: ConnectArgs, config: &Config, lun: u8) -> Result<()> {
    let mut flasher = connect(&args, config)?;
    flasher.set_boot_lun(lun)?;

    Ok(())
}

/// Convert a sparse image to a raw one
pub fn simg2img(input: &Path, output: &Path) -> Result<()> {
    let reader = open_file(input)?;
    let writer = File::create(output)
        .into_diagnostic()
        .wrap_err_with(|| format!("Failed to create {}", output.display()))?;

    let written = sparse::unsparse(reader, BufWriter::new(writer))
        .wrap_err_with(|| format!("Failed to convert {}", input.display()))?;
    println!("Wrote {} to {}", HumanBytes(written), output.display());

    Ok(())
}
