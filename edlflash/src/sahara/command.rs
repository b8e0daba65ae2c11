//! Sahara packets exchanged with the device's primary boot loader

use std::{io::Write, mem::size_of};

use bytemuck::{pod_read_unaligned, Pod, Zeroable};
use strum::{Display, FromRepr};

use crate::error::Error;

/// Transfer completed successfully
pub const STATUS_SUCCESS: u32 = 0x00;
/// The device did not understand the last command
pub const STATUS_NAK_INVALID_CMD: u32 = 0x01;

/// Protocol version announced in our Hello-Response
pub const SAHARA_VERSION: u32 = 2;
/// Oldest protocol version we can talk
pub const SAHARA_VERSION_MIN: u32 = 1;

const HELLO_RESPONSE_LEN: u32 = 0x30;
const SHORT_PACKET_LEN: u32 = 0x0C;
const DONE_REQUEST_LEN: u32 = 0x08;

/// Types of packets defined by the Sahara protocol
#[derive(Copy, Clone, Debug, Display, PartialEq, Eq, FromRepr)]
#[non_exhaustive]
#[repr(u32)]
pub enum CommandType {
    HelloRequest = 0x01,
    HelloResponse = 0x02,
    ReadData = 0x03,
    EndTransfer = 0x04,
    DoneRequest = 0x05,
    DoneResponse = 0x06,
    ResetRequest = 0x07,
    ResetResponse = 0x08,
    MemoryDebug = 0x09,
    MemoryRead = 0x0A,
    CommandReady = 0x0B,
    SwitchMode = 0x0C,
    ExecuteRequest = 0x0D,
    ExecuteResponse = 0x0E,
    ExecuteData = 0x0F,
    MemoryDebug64 = 0x10,
    MemoryRead64 = 0x11,
    ReadData64 = 0x12,
    ResetStateMachine = 0x13,
}

/// Operating modes negotiated in the Hello exchange
#[derive(Copy, Clone, Debug, Display, PartialEq, Eq, FromRepr)]
#[repr(u32)]
pub enum Mode {
    ImageTxPending = 0x0,
    ImageTxComplete = 0x1,
    MemoryDebug = 0x2,
    Command = 0x3,
}

/// Client commands which can be run while in command mode
#[derive(Copy, Clone, Debug, Display, PartialEq, Eq, FromRepr)]
#[repr(u32)]
pub enum ExecCommand {
    Nop = 0x00,
    SerialNumRead = 0x01,
    MsmHwIdRead = 0x02,
    OemPkHashRead = 0x03,
    SwitchToDmss = 0x04,
    SwitchToStreaming = 0x05,
    ReadDebugData = 0x06,
    GetSoftwareVersionSbl = 0x07,
}

/// Packets sent by the host
#[derive(Copy, Clone, Debug)]
#[non_exhaustive]
pub enum Command {
    HelloResponse {
        mode: Mode,
        version: u32,
        version_min: u32,
        max_cmd_len: u32,
    },
    SwitchMode(Mode),
    Execute(ExecCommand),
    ExecuteData(ExecCommand),
    Done,
    Reset,
}

impl Command {
    /// Return the command type
    pub fn command_type(&self) -> CommandType {
        match self {
            Command::HelloResponse { .. } => CommandType::HelloResponse,
            Command::SwitchMode(_) => CommandType::SwitchMode,
            Command::Execute(_) => CommandType::ExecuteRequest,
            Command::ExecuteData(_) => CommandType::ExecuteData,
            Command::Done => CommandType::DoneRequest,
            Command::Reset => CommandType::ResetRequest,
        }
    }

    /// Write a command
    pub fn write<W: Write>(&self, mut writer: W) -> std::io::Result<()> {
        writer.write_all(&self.to_bytes())
    }

    /// Encode the command into a new buffer
    pub fn to_bytes(&self) -> Vec<u8> {
        let words: Vec<u32> = match *self {
            Command::HelloResponse {
                mode,
                version,
                version_min,
                max_cmd_len,
            } => vec![
                HELLO_RESPONSE_LEN,
                version,
                version_min,
                max_cmd_len,
                mode as u32,
                // Reserved
                1,
                2,
                3,
                4,
                5,
                6,
            ],
            Command::SwitchMode(mode) => vec![SHORT_PACKET_LEN, mode as u32],
            Command::Execute(cmd) | Command::ExecuteData(cmd) => {
                vec![SHORT_PACKET_LEN, cmd as u32]
            }
            Command::Done | Command::Reset => vec![DONE_REQUEST_LEN],
        };

        std::iter::once(self.command_type() as u32)
            .chain(words)
            .flat_map(u32::to_le_bytes)
            .collect()
    }
}

#[derive(Zeroable, Pod, Copy, Clone, Debug)]
#[repr(C)]
pub(crate) struct PacketHeader {
    pub command: u32,
    pub length: u32,
}

/// Size of the header every Sahara packet starts with
pub(crate) const HEADER_LEN: usize = size_of::<PacketHeader>();

/// Body of a Hello-Request, the first packet a device sends
#[derive(Zeroable, Pod, Copy, Clone, Debug, PartialEq, Eq)]
#[repr(C)]
pub struct HelloRequest {
    pub version: u32,
    pub version_min: u32,
    pub max_cmd_len: u32,
    pub mode: u32,
    pub reserved: [u32; 6],
}

impl HelloRequest {
    pub fn mode(&self) -> Option<Mode> {
        Mode::from_repr(self.mode)
    }
}

#[derive(Zeroable, Pod, Copy, Clone, Debug)]
#[repr(C)]
struct ReadData32 {
    image_id: u32,
    offset: u32,
    length: u32,
}

#[derive(Zeroable, Pod, Copy, Clone, Debug)]
#[repr(C)]
struct ReadData64 {
    image_id: u64,
    offset: u64,
    length: u64,
}

/// A request for a slice of the image being uploaded
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ReadDataRequest {
    /// `ReadData` or `ReadData64`
    pub command: CommandType,
    pub image_id: u64,
    pub offset: u64,
    pub length: u64,
}

/// End of an image transfer, successful or not
#[derive(Zeroable, Pod, Copy, Clone, Debug, PartialEq, Eq)]
#[repr(C)]
pub struct EndTransfer {
    pub image_id: u32,
    pub status: u32,
}

#[derive(Zeroable, Pod, Copy, Clone, Debug)]
#[repr(C)]
struct DoneResponse {
    image_tx_status: u32,
}

#[derive(Zeroable, Pod, Copy, Clone, Debug)]
#[repr(C)]
struct ExecuteResponse {
    command: u32,
    data_len: u32,
}

/// Packets sent by the device
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum Packet {
    HelloRequest(HelloRequest),
    ReadData(ReadDataRequest),
    EndTransfer(EndTransfer),
    DoneResponse { image_tx_status: u32 },
    ExecuteResponse { command: u32, data_len: u32 },
    CommandReady,
    ResetResponse,
    Unknown(u32),
}

impl Packet {
    /// Decode one packet
    pub fn parse(data: &[u8]) -> Result<Packet, Error> {
        let header: PacketHeader = read_body(data, 0)?;

        let packet = match CommandType::from_repr(header.command) {
            Some(CommandType::HelloRequest) => Packet::HelloRequest(read_body(data, HEADER_LEN)?),
            Some(CommandType::ReadData) => {
                let body: ReadData32 = read_body(data, HEADER_LEN)?;
                Packet::ReadData(ReadDataRequest {
                    command: CommandType::ReadData,
                    image_id: body.image_id.into(),
                    offset: body.offset.into(),
                    length: body.length.into(),
                })
            }
            Some(CommandType::ReadData64) => {
                let body: ReadData64 = read_body(data, HEADER_LEN)?;
                Packet::ReadData(ReadDataRequest {
                    command: CommandType::ReadData64,
                    image_id: body.image_id,
                    offset: body.offset,
                    length: body.length,
                })
            }
            Some(CommandType::EndTransfer) => Packet::EndTransfer(read_body(data, HEADER_LEN)?),
            Some(CommandType::DoneResponse) => {
                let body: DoneResponse = read_body(data, HEADER_LEN)?;
                Packet::DoneResponse {
                    image_tx_status: body.image_tx_status,
                }
            }
            Some(CommandType::ExecuteResponse) => {
                let body: ExecuteResponse = read_body(data, HEADER_LEN)?;
                Packet::ExecuteResponse {
                    command: body.command,
                    data_len: body.data_len,
                }
            }
            Some(CommandType::CommandReady) => Packet::CommandReady,
            Some(CommandType::ResetResponse) => Packet::ResetResponse,
            _ => Packet::Unknown(header.command),
        };

        Ok(packet)
    }

    /// Short name used in diagnostics
    pub fn name(&self) -> String {
        match self {
            Packet::HelloRequest(_) => CommandType::HelloRequest.to_string(),
            Packet::ReadData(request) => request.command.to_string(),
            Packet::EndTransfer(_) => CommandType::EndTransfer.to_string(),
            Packet::DoneResponse { .. } => CommandType::DoneResponse.to_string(),
            Packet::ExecuteResponse { .. } => CommandType::ExecuteResponse.to_string(),
            Packet::CommandReady => CommandType::CommandReady.to_string(),
            Packet::ResetResponse => CommandType::ResetResponse.to_string(),
            Packet::Unknown(command) => format!("{command:#x}"),
        }
    }
}

fn read_body<T: Pod>(data: &[u8], offset: usize) -> Result<T, Error> {
    let end = offset + size_of::<T>();
    match data.get(offset..end) {
        Some(bytes) => Ok(pod_read_unaligned(bytes)),
        None => Err(Error::MalformedResponse(format!(
            "Sahara packet of {} bytes is too short, expected at least {end}",
            data.len()
        ))),
    }
}

/// Encode a device packet, used to script devices in tests
#[cfg(test)]
pub(crate) fn device_packet<T: Pod>(command: CommandType, body: &T) -> Vec<u8> {
    let body = bytemuck::bytes_of(body);
    let header = PacketHeader {
        command: command as u32,
        length: (HEADER_LEN + body.len()) as u32,
    };

    [bytemuck::bytes_of(&header), body].concat()
}

#[cfg(test)]
pub(crate) fn read_data_64(image_id: u64, offset: u64, length: u64) -> Vec<u8> {
    device_packet(
        CommandType::ReadData64,
        &ReadData64 {
            image_id,
            offset,
            length,
        },
    )
}

#[cfg(test)]
pub(crate) fn done_response(status: u32) -> Vec<u8> {
    device_packet(
        CommandType::DoneResponse,
        &DoneResponse {
            image_tx_status: status,
        },
    )
}

#[cfg(test)]
pub(crate) fn execute_response(command: ExecCommand, data_len: u32) -> Vec<u8> {
    device_packet(
        CommandType::ExecuteResponse,
        &ExecuteResponse {
            command: command as u32,
            data_len,
        },
    )
}

#[cfg(test)]
pub(crate) fn bare_packet(command: CommandType) -> Vec<u8> {
    let header = PacketHeader {
        command: command as u32,
        length: HEADER_LEN as u32,
    };
    bytemuck::bytes_of(&header).to_vec()
}
