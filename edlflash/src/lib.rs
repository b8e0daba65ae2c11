//! Flash Qualcomm devices in Emergency Download mode
//!
//! A device in EDL mode first speaks Sahara, which is used to upload a
//! Firehose programmer. The programmer then gives access to the device's
//! storage: [Flasher] drives both protocols and resolves partitions through
//! the GUID partition table of each LUN.
//!
//! The library can also be used on its own:
//!
//! - [sahara] and [firehose] implement the two protocols over any
//!   [connection::Channel]
//! - [gpt] parses, validates, repairs and rebuilds partition tables
//! - [sparse] decodes Android sparse images
//!
//! ## Cargo features
//!
//! - `serialport` enables [connection::SerialChannel]
//! - `cli` enables the `edlflash` binary and the helpers in [cli]

#![cfg_attr(docsrs, feature(doc_cfg))]

pub use self::{error::Error, flasher::Flasher};

#[cfg(feature = "cli")]
#[cfg_attr(docsrs, doc(cfg(feature = "cli")))]
pub mod cli;
pub mod connection;
pub mod error;
pub mod firehose;
pub mod flasher;
pub mod gpt;
pub mod progress;
pub mod sahara;
pub mod sparse;

/// Logging utilities
#[cfg(feature = "cli")]
#[cfg_attr(docsrs, doc(cfg(feature = "cli")))]
pub mod logging {
    use env_logger::{Builder, Env};
    use log::LevelFilter;

    /// Initialize the logger with the given [LevelFilter]
    ///
    /// `RUST_LOG` takes precedence over `filter`.
    pub fn initialize_logger(filter: LevelFilter) {
        Builder::from_env(Env::default().default_filter_or(filter.as_str()))
            .format_target(false)
            .init();
    }
}
