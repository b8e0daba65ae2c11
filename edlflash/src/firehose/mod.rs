//! Firehose command client
//!
//! Once the Sahara upload completed, the programmer running on the device
//! speaks Firehose: XML commands answered by XML responses, with sector data
//! streamed raw in between. [FirehoseClient] issues one command at a time
//! and always drains its response before returning.

use std::{
    io::{Read, Seek},
    thread::sleep,
    time::Duration,
};

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

pub use self::xml::{FirehoseResponse, XmlCommand};
use crate::{
    connection::{Channel, MAX_IDLE_READS},
    error::{ConnectionError, Error, ResultExt},
    progress::ProgressCallbacks,
    sparse::{inflated_size, SplitBlob},
};

pub mod xml;

const RESPONSE_POLL_INTERVAL: Duration = Duration::from_millis(50);
const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(20);
/// Progress is reported every this many chunks
const PROGRESS_INTERVAL: usize = 10;

/// Session parameters sent with `configure`
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct FirehoseConfig {
    pub memory_name: String,
    pub sector_size: usize,
    pub max_payload_size_to_target: usize,
    pub max_payload_size_from_target: usize,
    pub max_xml_size: usize,
    pub max_lun: u8,
    pub fast_erase: bool,
    pub zlp_aware_host: bool,
    pub skip_storage_init: bool,
    pub skip_write: bool,
}

impl Default for FirehoseConfig {
    fn default() -> Self {
        Self {
            memory_name: String::from("UFS"),
            sector_size: 4096,
            max_payload_size_to_target: 1024 * 1024,
            max_payload_size_from_target: 4096,
            max_xml_size: 4096,
            max_lun: 6,
            fast_erase: true,
            zlp_aware_host: true,
            skip_storage_init: false,
            skip_write: false,
        }
    }
}

/// Storage details the programmer reports for `getstorageinfo`
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct StorageInfo {
    pub total_blocks: u64,
    pub block_size: u32,
    pub page_size: u32,
    pub num_physical: u32,
    pub manufacturer_id: u32,
    pub serial_num: u32,
    pub fw_version: String,
    pub mem_type: String,
    pub prod_name: String,
}

impl StorageInfo {
    /// Find and parse the `INFO: {"storage_info": ...}` log line
    pub fn from_logs(logs: &[String]) -> Result<Self, Error> {
        #[derive(Deserialize)]
        struct Report {
            storage_info: StorageInfo,
        }

        let json = logs
            .iter()
            .filter_map(|line| line.strip_prefix("INFO:"))
            .map(str::trim_start)
            .find(|line| line.starts_with('{') && line.contains("storage_info"))
            .ok_or_else(|| Error::StorageInfo(String::from("no storage_info log line")))?;

        let report: Report =
            serde_json::from_str(json).map_err(|e| Error::StorageInfo(e.to_string()))?;

        Ok(report.storage_info)
    }
}

/// Drives a Firehose programmer over a [Channel]
pub struct FirehoseClient<C> {
    channel: C,
    config: FirehoseConfig,
    luns: Vec<u8>,
    /// Bytes received after the last response document
    pending: Vec<u8>,
}

impl<C: Channel> FirehoseClient<C> {
    pub fn new(channel: C, config: FirehoseConfig) -> Self {
        Self {
            channel,
            config,
            luns: Vec::new(),
            pending: Vec::new(),
        }
    }

    pub fn config(&self) -> &FirehoseConfig {
        &self.config
    }

    /// LUNs known after [FirehoseClient::configure]
    pub fn luns(&self) -> &[u8] {
        &self.luns
    }

    pub fn into_channel(self) -> C {
        self.channel
    }

    /// Send one command and collect the device's answer
    pub fn xml_send(&mut self, command: &XmlCommand, wait: bool) -> Result<FirehoseResponse, Error> {
        let xml = command.to_xml();
        if xml.len() > self.config.max_xml_size {
            return Err(Error::CommandTooLarge {
                size: xml.len(),
                max: self.config.max_xml_size,
            });
        }

        debug!("Firehose command: {xml}");
        self.channel
            .write(xml.as_bytes(), wait)
            .for_command(command.tag())?;

        self.read_response(RESPONSE_POLL_INTERVAL)
            .for_command(command.tag())
    }

    /// Read until a complete `<response>` arrived or the device went quiet
    ///
    /// Anything the device sent after the document holding the response is
    /// kept for the next read.
    fn read_response(&mut self, interval: Duration) -> Result<FirehoseResponse, Error> {
        let mut data = std::mem::take(&mut self.pending);
        let mut idle = 0;
        while !contains_response(&data) {
            let transfer = self.channel.read(None)?;
            if transfer.is_empty() {
                idle += 1;
                if idle >= MAX_IDLE_READS {
                    break;
                }
                sleep(interval);
                continue;
            }
            data.extend_from_slice(&transfer);
        }

        if let Some(end) = response_end(&data) {
            self.pending = data.split_off(end);
        }

        let response = FirehoseResponse::parse(data);
        for line in &response.logs {
            info!("{line}");
        }
        debug!(
            "Firehose response: {:?} (rawmode {:?})",
            response.value, response.raw_mode
        );

        Ok(response)
    }

    /// Open the session, sending our transfer parameters
    pub fn configure(&mut self) -> Result<(), Error> {
        let config = &self.config;
        let command = XmlCommand::new("configure")
            .attr("MemoryName", &config.memory_name)
            .attr("Verbose", 0)
            .attr("AlwaysValidate", 0)
            .attr("MaxDigestTableSizeInBytes", 2048)
            .attr("MaxPayloadSizeToTargetInBytes", config.max_payload_size_to_target)
            .attr("ZLPAwareHost", u8::from(config.zlp_aware_host))
            .attr("SkipStorageInit", u8::from(config.skip_storage_init))
            .attr("SkipWrite", u8::from(config.skip_write));

        let response = self.xml_send(&command, false)?;
        if !response.ack() {
            warn!(
                "Programmer did not accept the configuration: {}",
                response.error_text().unwrap_or("no details")
            );
        }

        self.luns = (0..self.config.max_lun).collect();
        Ok(())
    }

    fn sector_command(&self, tag: &'static str, lun: u8, start_sector: u64, sectors: u64) -> XmlCommand {
        XmlCommand::new(tag)
            .attr("SECTOR_SIZE_IN_BYTES", self.config.sector_size)
            .attr("num_partition_sectors", sectors)
            .attr("physical_partition_number", lun)
            .attr("start_sector", start_sector)
    }

    /// Read `sectors` sectors starting at `start_sector`
    pub fn cmd_read_buffer(&mut self, lun: u8, start_sector: u64, sectors: u64) -> Result<Vec<u8>, Error> {
        let command = self.sector_command("read", lun, start_sector, sectors);
        let response = self.xml_send(&command, true)?;
        expect_ack("read", &response)?;

        let total = self.config.sector_size * sectors as usize;
        let max_packet = self.channel.max_packet_size();
        let mut data = std::mem::take(&mut self.pending);
        data.reserve(total.saturating_sub(data.len()));
        while data.len() < total {
            let len = max_packet.min(total - data.len());
            let transfer = self.channel.read(Some(len)).for_command("read")?;
            data.extend_from_slice(&transfer);
        }
        if data.len() > total {
            self.pending = data.split_off(total);
        }

        let trailer = self.read_response(DRAIN_POLL_INTERVAL).for_command("read")?;
        expect_ack("read", &trailer)?;
        if trailer.raw_mode == Some(true) {
            return Err(Error::MalformedResponse(String::from(
                "device stayed in raw mode after the read completed",
            )));
        }

        Ok(data)
    }

    /// Write an image starting at `start_sector`
    ///
    /// Sparse images are inflated on the fly. The image is sent in chunks of
    /// at most `max_payload_size_to_target` bytes, the last one zero-padded
    /// to a whole sector, each followed by a zero-length write.
    pub fn cmd_program<R: Read + Seek>(
        &mut self,
        lun: u8,
        start_sector: u64,
        mut image: R,
        progress: &mut Option<&mut dyn ProgressCallbacks>,
    ) -> Result<(), Error> {
        let total = inflated_size(&mut image)?;
        let sector_size = self.config.sector_size;
        let sectors = total.div_ceil(sector_size as u64);

        let command = self.sector_command("program", lun, start_sector, sectors);
        let response = self.xml_send(&command, true)?;
        expect_ack("program", &response)?;

        let chunk_size = (self.config.max_payload_size_to_target / sector_size).max(1) * sector_size;
        if let Some(cb) = progress.as_mut() {
            cb.init(start_sector, total as usize);
        }

        let mut pending = Vec::with_capacity(chunk_size);
        let mut written = 0;
        let mut chunks = 0;
        for part in SplitBlob::new(image, chunk_size)? {
            pending.extend_from_slice(&part?);

            while pending.len() >= chunk_size {
                let rest = pending.split_off(chunk_size);
                self.write_chunk(&pending)?;
                written += pending.len();
                pending = rest;

                chunks += 1;
                if chunks % PROGRESS_INTERVAL == 0 {
                    if let Some(cb) = progress.as_mut() {
                        cb.update(written);
                    }
                }
            }
        }

        if !pending.is_empty() {
            written += pending.len();
            pending.resize(pending.len().next_multiple_of(sector_size), 0);
            self.write_chunk(&pending)?;
        }
        debug!("Wrote {written} bytes to LUN {lun} at sector {start_sector}");

        let trailer = self
            .read_response(DRAIN_POLL_INTERVAL)
            .for_command("program")?;
        expect_ack("program", &trailer)?;

        if let Some(cb) = progress.as_mut() {
            cb.update(total as usize);
            cb.finish();
        }

        Ok(())
    }

    fn write_chunk(&mut self, chunk: &[u8]) -> Result<(), Error> {
        self.channel
            .write(chunk, false)
            .and_then(|_| self.channel.write(&[], true))
            .flashing()
            .for_command("program")
    }

    /// Erase a range of sectors
    ///
    /// With `fast_erase` this is a single `erase` command, otherwise the
    /// range is programmed with zeros.
    pub fn cmd_erase(&mut self, lun: u8, start_sector: u64, sectors: u64) -> Result<(), Error> {
        if self.config.fast_erase {
            let command = self.sector_command("erase", lun, start_sector, sectors);
            let response = self.xml_send(&command, true)?;
            return expect_value_ack("erase", &response);
        }

        let command = self.sector_command("program", lun, start_sector, sectors);
        let response = self.xml_send(&command, true)?;
        expect_ack("erase", &response)?;

        let chunk_size = self.config.max_payload_size_to_target;
        let zeros = vec![0; chunk_size];
        let mut remaining = self.config.sector_size * sectors as usize;
        while remaining > 0 {
            let len = remaining.min(chunk_size);
            self.write_chunk(&zeros[..len])?;
            remaining -= len;
        }

        let trailer = self.read_response(DRAIN_POLL_INTERVAL).for_command("erase")?;
        expect_value_ack("erase", &trailer)
    }

    /// Select the LUN the device boots from
    pub fn cmd_set_boot_lun_id(&mut self, lun: u8) -> Result<(), Error> {
        let command = XmlCommand::new("setbootablestoragedrive").attr("value", lun);
        let response = self.xml_send(&command, true)?;
        expect_ack("setbootablestoragedrive", &response)?;

        info!("Boot LUN set to {lun}");
        Ok(())
    }

    /// Reboot the device
    pub fn cmd_reset(&mut self) -> Result<(), Error> {
        let command = XmlCommand::new("power").attr("value", "reset");
        let response = self.xml_send(&command, true)?;
        expect_ack("power", &response)?;

        // The device may still flush log lines before it goes away
        if let Err(e) = self.read_response(DRAIN_POLL_INTERVAL) {
            debug!("Ignoring error while draining after reset: {e}");
        }

        Ok(())
    }

    /// Query storage details, returned as the raw log lines of the reply
    pub fn cmd_get_storage_info(&mut self, lun: u8) -> Result<Vec<String>, Error> {
        let command = XmlCommand::new("getstorageinfo").attr("physical_partition_number", lun);
        let response = self.xml_send(&command, true)?;

        if !response.ack() || response.logs.is_empty() {
            return Err(Error::StorageInfo(
                response
                    .error_text()
                    .unwrap_or("the device sent no storage details")
                    .to_owned(),
            ));
        }

        Ok(response.logs)
    }
}

fn contains_response(data: &[u8]) -> bool {
    const NEEDLE: &[u8] = b"<response";

    data.windows(NEEDLE.len())
        .position(|w| w == NEEDLE)
        .is_some_and(|start| data[start..].contains(&b'>'))
}

/// Offset just past the `</data>` closing the document with the response
fn response_end(data: &[u8]) -> Option<usize> {
    const RESPONSE: &[u8] = b"<response";
    const CLOSE: &[u8] = b"</data>";

    let start = data.windows(RESPONSE.len()).position(|w| w == RESPONSE)?;
    let close = data[start..]
        .windows(CLOSE.len())
        .position(|w| w == CLOSE)?;

    Some(start + close + CLOSE.len())
}

/// A response was received and did not reject the command
fn expect_ack(command: &str, response: &FirehoseResponse) -> Result<(), Error> {
    if !response.received {
        return Err(Error::Connection(ConnectionError::Timeout(command.into())));
    }
    if !response.ack() {
        return Err(Error::Nak {
            command: command.to_owned(),
            logs: response.logs.clone(),
        });
    }

    Ok(())
}

/// A response was received carrying an explicit `ACK`
fn expect_value_ack(command: &str, response: &FirehoseResponse) -> Result<(), Error> {
    match response.value.as_deref() {
        Some("ACK") => Ok(()),
        Some(_) => Err(Error::Nak {
            command: command.to_owned(),
            logs: response.logs.clone(),
        }),
        None if response.received => Err(Error::MalformedResponse(format!(
            "{command} response carried no value"
        ))),
        None => Err(Error::Connection(ConnectionError::Timeout(command.into()))),
    }
}
