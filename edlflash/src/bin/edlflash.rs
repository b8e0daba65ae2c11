use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use edlflash::{
    cli::{self, config::Config, ConnectArgs},
    gpt::Slot,
    logging::initialize_logger,
};
use log::{debug, LevelFilter};
use miette::Result;
use strum::VariantNames;

#[derive(Debug, Parser)]
#[command(about, max_term_width = 100, propagate_version = true, version)]
struct Cli {
    #[command(subcommand)]
    subcommand: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Reboot the device
    Reset(ConnectArgs),
    /// Print the active A/B slot
    GetActiveSlot(ConnectArgs),
    /// Mark an A/B slot active
    SetActiveSlot(SetActiveSlotArgs),
    /// Print details about the device's storage
    StorageInfo(ConnectArgs),
    /// Print the partition tables of the device
    PrintGpt(PrintGptArgs),
    /// Make the primary and backup partition tables of a LUN consistent
    RepairGpt(RepairGptArgs),
    /// Write a partition table image to a LUN and regenerate its backup
    RestoreGpt(RestoreGptArgs),
    /// Erase a partition
    Erase(EraseArgs),
    /// Write a raw or sparse image to a partition
    Flash(FlashArgs),
    /// Select the LUN the device boots from
    SetBootLun(SetBootLunArgs),
    /// Convert an Android sparse image to a raw image
    ///
    /// This does not need a device.
    Simg2img(Simg2imgArgs),
}

#[derive(Debug, Args)]
struct SetActiveSlotArgs {
    /// Slot to activate
    #[arg(value_parser = clap::builder::PossibleValuesParser::new(Slot::VARIANTS))]
    slot: String,

    #[command(flatten)]
    connect_args: ConnectArgs,
}

#[derive(Debug, Args)]
struct PrintGptArgs {
    /// Only print the table of this LUN
    #[arg(long)]
    lun: Option<u8>,
    /// Print the backup tables instead of the primary ones
    #[arg(long)]
    backup: bool,

    #[command(flatten)]
    connect_args: ConnectArgs,
}

#[derive(Debug, Args)]
struct RepairGptArgs {
    /// LUN to repair
    lun: u8,
    /// Move the backup table to the end of the LUN and grow the last
    /// partition into the space gained
    #[arg(long)]
    grow: bool,

    #[command(flatten)]
    connect_args: ConnectArgs,
}

#[derive(Debug, Args)]
struct RestoreGptArgs {
    /// LUN to write to
    lun: u8,
    /// Image holding the protective MBR, GPT header and partition entries
    image: PathBuf,

    #[command(flatten)]
    connect_args: ConnectArgs,
}

#[derive(Debug, Args)]
struct EraseArgs {
    /// Name of the partition to erase
    partition: String,

    #[command(flatten)]
    connect_args: ConnectArgs,
}

#[derive(Debug, Args)]
struct FlashArgs {
    /// Name of the partition to write to
    partition: String,
    /// Raw or sparse image to write
    image: PathBuf,

    #[command(flatten)]
    connect_args: ConnectArgs,
}

#[derive(Debug, Args)]
struct SetBootLunArgs {
    /// LUN to boot from
    lun: u8,

    #[command(flatten)]
    connect_args: ConnectArgs,
}

#[derive(Debug, Args)]
struct Simg2imgArgs {
    /// Sparse image to read
    input: PathBuf,
    /// Raw image to write
    output: PathBuf,
}

fn main() -> Result<()> {
    miette::set_panic_hook();
    initialize_logger(LevelFilter::Info);

    // Parse the arguments first, so printing the help does not load any config
    let args = Cli::parse().subcommand;
    debug!("{:#?}", args);

    let config = Config::load()?;

    match args {
        Commands::Reset(args) => cli::reset(args, &config),
        Commands::GetActiveSlot(args) => cli::get_active_slot(args, &config),
        Commands::SetActiveSlot(args) => {
            cli::set_active_slot(args.connect_args, &config, &args.slot)
        }
        Commands::StorageInfo(args) => cli::storage_info(args, &config),
        Commands::PrintGpt(args) => cli::print_gpt(args.connect_args, &config, args.lun, args.backup),
        Commands::RepairGpt(args) => cli::repair_gpt(args.connect_args, &config, args.lun, args.grow),
        Commands::RestoreGpt(args) => {
            cli::restore_gpt(args.connect_args, &config, args.lun, &args.image)
        }
        Commands::Erase(args) => cli::erase(args.connect_args, &config, &args.partition),
        Commands::Flash(args) => {
            cli::flash(args.connect_args, &config, &args.partition, &args.image)
        }
        Commands::SetBootLun(args) => cli::set_boot_lun(args.connect_args, &config, args.lun),
        Commands::Simg2img(args) => cli::simg2img(&args.input, &args.output),
    }
}
