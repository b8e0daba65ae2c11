//! Library and application errors

use std::{
    fmt::{Display, Formatter},
    io,
};

use miette::Diagnostic;
use thiserror::Error;

use crate::{
    sahara::command::{CommandType, ExecCommand},
    sparse::ChunkType,
};

/// All possible errors returned by edlflash
#[derive(Debug, Diagnostic, Error)]
#[non_exhaustive]
pub enum Error {
    #[error("Operation was cancelled by the user")]
    #[diagnostic(code(edlflash::cancelled))]
    Cancelled,

    #[error("Firehose command is {size} bytes long, the device accepts at most {max} bytes")]
    #[diagnostic(
        code(edlflash::firehose::command_too_large),
        help("Raise `max_xml_size` in the [firehose] configuration section if the loader supports it")
    )]
    CommandTooLarge { size: usize, max: usize },

    #[error("Error while connecting to device")]
    #[diagnostic(transparent)]
    Connection(#[source] ConnectionError),

    #[error("Communication error while flashing device")]
    #[diagnostic(transparent)]
    Flashing(#[source] ConnectionError),

    #[error("Failed to open file: {0}")]
    #[diagnostic(code(edlflash::file_open))]
    FileOpenError(String, #[source] io::Error),

    #[error("Failed to parse GPT")]
    #[diagnostic(transparent)]
    Gpt(#[from] GptError),

    #[error(
        "Image of {image_size} bytes does not fit partition `{partition}` of {partition_size} bytes"
    )]
    #[diagnostic(
        code(edlflash::image_too_large),
        help("Make sure the image was built for this device and partition")
    )]
    ImageTooLarge {
        partition: String,
        image_size: u64,
        partition_size: u64,
    },

    #[error("Invalid sparse image")]
    #[diagnostic(transparent)]
    InvalidFormat(#[from] SparseError),

    #[error("Unknown slot `{0}`")]
    #[diagnostic(code(edlflash::invalid_slot), help("The accepted values are: a, b"))]
    InvalidSlot(String),

    #[error("Misplaced key(s) in the configuration file: {0}")]
    #[diagnostic(
        code(edlflash::misplaced_key),
        help("Move the key(s) into the `[firehose]` section of `edlflash.toml`")
    )]
    MisplacedKey(String),

    #[error("Malformed response from the device: {0}")]
    #[diagnostic(
        code(edlflash::malformed_response),
        help("Try power cycling the device back into EDL mode and try again")
    )]
    MalformedResponse(String),

    #[error("The device rejected the `{command}` command{}", format_logs(.logs))]
    #[diagnostic(code(edlflash::firehose::nak))]
    Nak { command: String, logs: Vec<String> },

    #[error("No configuration directory could be determined for this user")]
    #[diagnostic(code(edlflash::no_config_dir))]
    NoConfigDir,

    #[error("No Firehose programmer was given")]
    #[diagnostic(
        code(edlflash::no_programmer),
        help("Pass `--programmer <FILE>`, set `programmer` in `edlflash.toml`, or use `--no-programmer` when a programmer is already running")
    )]
    NoProgrammer,

    #[error("No serial ports could be detected")]
    #[diagnostic(
        code(edlflash::no_serial),
        help("Make sure the device is connected and in EDL mode, it should enumerate as a Qualcomm HS-USB QDLoader 9008 port")
    )]
    NoSerial,

    #[error("Partition `{0}` was not found on any LUN")]
    #[diagnostic(
        code(edlflash::partition_not_found),
        help("Use the `print-gpt` command to list the partitions of the device")
    )]
    PartitionNotFound(String),

    #[error("Sahara command-mode request was rejected")]
    #[diagnostic(
        code(edlflash::sahara::command_mode),
        help("The device may already be running a loader; power cycle it into EDL mode")
    )]
    SaharaCommandMode,

    #[error("Sahara failed to execute the {0} command")]
    #[diagnostic(code(edlflash::sahara::exec))]
    SaharaExec(ExecCommand),

    #[error("Sahara image transfer failed with status {0:#x}")]
    #[diagnostic(
        code(edlflash::sahara::transfer),
        help("Make sure the programmer matches the device, a wrong loader is usually rejected here")
    )]
    SaharaTransferFailed(u32),

    #[error("Unknown Sahara image id {0:#x}")]
    #[diagnostic(
        code(edlflash::sahara::unknown_image),
        help("The device did not request a Firehose programmer")
    )]
    SaharaUnknownImage(u64),

    #[error("The serial port '{0}' could not be found")]
    #[diagnostic(
        code(edlflash::serial_not_found),
        help("Make sure the correct device is connected to the host system")
    )]
    SerialNotFound(String),

    #[error("Failed to get storage info: {0}")]
    #[diagnostic(code(edlflash::firehose::storage_info))]
    StorageInfo(String),

    #[error("Unexpected Sahara packet {received} while waiting for {expected}")]
    #[diagnostic(code(edlflash::sahara::unexpected_packet))]
    UnexpectedPacket {
        expected: &'static str,
        received: String,
    },

    #[cfg(feature = "cli")]
    #[error(transparent)]
    #[diagnostic(code(edlflash::dialoguer_error))]
    DialoguerError(#[from] dialoguer::Error),
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Self::Connection(err.into())
    }
}

#[cfg(feature = "serialport")]
#[cfg_attr(docsrs, doc(cfg(feature = "serialport")))]
impl From<serialport::Error> for Error {
    fn from(err: serialport::Error) -> Self {
        Self::Connection(err.into())
    }
}

fn format_logs(logs: &[String]) -> String {
    match logs.last() {
        Some(last) => format!(": {last}"),
        None => String::new(),
    }
}

/// Connection-related errors
#[derive(Debug, Diagnostic, Error)]
#[non_exhaustive]
pub enum ConnectionError {
    #[error("Failed to connect to the device")]
    #[diagnostic(
        code(edlflash::connection_failed),
        help("Ensure that the device is in EDL mode and has not already been handed a programmer")
    )]
    ConnectionFailed,

    #[error("Serial port not found")]
    #[diagnostic(
        code(edlflash::connection_failed),
        help("Ensure that the device is connected and your host recognizes the QDLoader port")
    )]
    DeviceNotFound,

    #[error("IO error while talking to the device: {0}")]
    #[diagnostic(code(edlflash::io_error))]
    Io(#[source] io::Error),

    #[error("Timeout while running {0}command")]
    #[diagnostic(code(edlflash::timeout))]
    Timeout(TimedOutCommand),

    #[cfg(feature = "serialport")]
    #[error("IO error while using serial port: {0}")]
    #[diagnostic(code(edlflash::serial_error))]
    Serial(#[source] serialport::Error),
}

impl From<io::Error> for ConnectionError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::TimedOut => ConnectionError::Timeout(TimedOutCommand::default()),
            io::ErrorKind::NotFound => ConnectionError::DeviceNotFound,
            _ => ConnectionError::Io(err),
        }
    }
}

#[cfg(feature = "serialport")]
#[cfg_attr(docsrs, doc(cfg(feature = "serialport")))]
impl From<serialport::Error> for ConnectionError {
    fn from(err: serialport::Error) -> Self {
        use serialport::ErrorKind;

        match err.kind() {
            ErrorKind::Io(io::ErrorKind::TimedOut) => {
                ConnectionError::Timeout(TimedOutCommand::default())
            }
            ErrorKind::NoDevice => ConnectionError::DeviceNotFound,
            _ => ConnectionError::Serial(err),
        }
    }
}

/// An executed command which has timed out
#[derive(Clone, Debug, Default)]
pub struct TimedOutCommand {
    command: Option<String>,
}

impl Display for TimedOutCommand {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match &self.command {
            Some(command) => write!(f, "{} ", command),
            None => Ok(()),
        }
    }
}

impl From<CommandType> for TimedOutCommand {
    fn from(ct: CommandType) -> Self {
        TimedOutCommand {
            command: Some(ct.to_string()),
        }
    }
}

impl From<&str> for TimedOutCommand {
    fn from(command: &str) -> Self {
        TimedOutCommand {
            command: Some(command.to_owned()),
        }
    }
}

/// Errors found while validating a GUID partition table
#[derive(Debug, Diagnostic, Error)]
#[non_exhaustive]
pub enum GptError {
    #[error("Invalid GPT signature: {0:?}")]
    #[diagnostic(code(edlflash::gpt::signature))]
    InvalidSignature(String),

    #[error("Unknown GPT revision: {0:#x}")]
    #[diagnostic(code(edlflash::gpt::revision))]
    UnsupportedRevision(u32),

    #[error("Invalid GPT header size: {0}")]
    #[diagnostic(code(edlflash::gpt::header_size))]
    InvalidHeaderSize(u32),

    #[error("Invalid partition entry layout: {count} entries of {size} bytes")]
    #[diagnostic(code(edlflash::gpt::entry_size))]
    InvalidEntryLayout { count: u32, size: u32 },

    #[error("GPT header claims to be at LBA {found}, but was read from LBA {expected}")]
    #[diagnostic(code(edlflash::gpt::lba_mismatch))]
    LbaMismatch { expected: u64, found: u64 },

    #[error("Partition entries of {entries_sectors} sectors do not fit before LBA {lba}")]
    #[diagnostic(code(edlflash::gpt::entries_range))]
    EntriesOutOfRange { lba: u64, entries_sectors: u64 },

    #[error("Not enough data for the GPT, expected {expected} bytes but got {got}")]
    #[diagnostic(code(edlflash::gpt::truncated))]
    Truncated { expected: usize, got: usize },

    #[error("GPT {region} CRC32 mismatch: expected {expected:#010x}, computed {actual:#010x}")]
    #[diagnostic(
        code(edlflash::gpt::checksum),
        help("Run `repair-gpt` to restore the table from its backup copy")
    )]
    ChecksumMismatch {
        region: &'static str,
        expected: u32,
        actual: u32,
    },

    #[error("Both primary and backup GPT are corrupted, cannot recover")]
    #[diagnostic(
        code(edlflash::gpt::corrupt_storage),
        help("Restore the partition table from a known-good image with `restore-gpt`")
    )]
    CorruptStorage,

    #[error("Both `_a` and `_b` partitions are marked active")]
    #[diagnostic(
        code(edlflash::gpt::conflicting_slots),
        help("Use `set-active-slot` to mark a single slot active")
    )]
    ConflictingSlots,
}

/// Errors found while decoding an Android sparse image
#[derive(Debug, Diagnostic, Error)]
#[non_exhaustive]
pub enum SparseError {
    #[error("Not an Android sparse image")]
    #[diagnostic(code(edlflash::sparse::magic))]
    NotSparse,

    #[error("Sparse header sizes are {file}/{chunk} bytes, expected 28/12")]
    #[diagnostic(code(edlflash::sparse::header_size))]
    InvalidHeaderSize { file: u16, chunk: u16 },

    #[error("Invalid sparse block size {0}")]
    #[diagnostic(code(edlflash::sparse::block_size))]
    InvalidBlockSize(u32),

    #[error("Unknown sparse chunk type {0:#06x}")]
    #[diagnostic(code(edlflash::sparse::chunk_type))]
    UnknownChunkType(u16),

    #[error("{kind} chunk carries {found} bytes of data, expected {expected}")]
    #[diagnostic(code(edlflash::sparse::chunk_size))]
    ChunkSizeMismatch {
        kind: ChunkType,
        expected: u64,
        found: u64,
    },

    #[error("Sparse image ended after {0} chunks")]
    #[diagnostic(code(edlflash::sparse::truncated))]
    UnexpectedEof(u32),

    #[error("Failed to read sparse image")]
    #[diagnostic(code(edlflash::sparse::io))]
    Io(#[source] io::Error),
}

impl From<io::Error> for SparseError {
    fn from(err: io::Error) -> Self {
        Self::Io(err)
    }
}

pub(crate) trait ResultExt {
    /// Mark an error as having occurred during the flashing stage
    fn flashing(self) -> Self;
    /// Mark the command from which this error originates
    fn for_command(self, command: impl Into<TimedOutCommand>) -> Self;
}

impl<T> ResultExt for Result<T, Error> {
    fn flashing(self) -> Self {
        match self {
            Err(Error::Connection(err)) => Err(Error::Flashing(err)),
            res => res,
        }
    }

    fn for_command(self, command: impl Into<TimedOutCommand>) -> Self {
        match self {
            Err(Error::Connection(ConnectionError::Timeout(_))) => {
                Err(Error::Connection(ConnectionError::Timeout(command.into())))
            }
            Err(Error::Flashing(ConnectionError::Timeout(_))) => {
                Err(Error::Flashing(ConnectionError::Timeout(command.into())))
            }
            res => res,
        }
    }
}
