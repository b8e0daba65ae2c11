//! Sahara bootstrap client
//!
//! A device in EDL mode greets the host with a Sahara Hello-Request. The
//! [SaharaClient] answers it, reads the device serial number in command
//! mode and then serves the device's read requests until the Firehose
//! programmer has been uploaded. Once [SaharaClient::upload_loader]
//! returns, the channel belongs to the programmer and can be handed to a
//! [crate::firehose::FirehoseClient].

use log::{debug, error, info, warn};

use self::command::{
    Command, CommandType, EndTransfer, ExecCommand, HelloRequest, Mode, Packet, PacketHeader,
    ReadDataRequest, HEADER_LEN, SAHARA_VERSION, SAHARA_VERSION_MIN, STATUS_NAK_INVALID_CMD,
    STATUS_SUCCESS,
};
use crate::{
    connection::Channel,
    error::{ConnectionError, Error, ResultExt},
};

pub mod command;

/// Image ids from this value up are Firehose programmers
const FIREHOSE_IMAGE_ID: u64 = 0x0C;
/// Largest packet we are willing to reassemble across transfers
const MAX_PACKET_LEN: usize = 0x100;
const XML_PROLOG: &[u8] = b"<?xml";

/// A classified read from the device
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Response {
    /// A Sahara packet
    Packet(Packet),
    /// The device is already talking Firehose
    Firehose,
    /// Nothing arrived
    Empty,
}

/// Protocol the device runs once the loader upload finished
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ProtocolMode {
    Firehose,
}

/// Drives the Sahara handshake over a [Channel]
pub struct SaharaClient<C> {
    channel: C,
    serial: Option<String>,
}

impl<C: Channel> SaharaClient<C> {
    pub fn new(channel: C) -> Self {
        Self {
            channel,
            serial: None,
        }
    }

    /// Serial number read from the device during the upload
    pub fn serial(&self) -> Option<&str> {
        self.serial.as_deref()
    }

    /// Give the channel back, to be used by the uploaded programmer
    pub fn into_channel(self) -> C {
        self.channel
    }

    /// Wait for the Hello-Request the device sends on enumeration
    pub fn connect(&mut self) -> Result<HelloRequest, Error> {
        let data = self
            .channel
            .read(Some(HEADER_LEN + std::mem::size_of::<HelloRequest>()))
            .for_command(CommandType::HelloRequest)?;

        match Packet::parse(&data)? {
            Packet::HelloRequest(hello) => {
                debug!(
                    "Sahara hello: version {}, minimum {}, mode {:?}",
                    hello.version,
                    hello.version_min,
                    hello.mode()
                );
                Ok(hello)
            }
            packet => {
                debug!("Expected a hello request, received {}", packet.name());
                Err(Error::Connection(ConnectionError::ConnectionFailed))
            }
        }
    }

    /// Answer a Hello-Request, asking the device to enter `mode`
    pub fn cmd_hello(&mut self, mode: Mode) -> Result<(), Error> {
        self.send(Command::HelloResponse {
            mode,
            version: SAHARA_VERSION,
            version_min: SAHARA_VERSION_MIN,
            max_cmd_len: 0,
        })
    }

    pub fn cmd_mode_switch(&mut self, mode: Mode) -> Result<(), Error> {
        self.send(Command::SwitchMode(mode))
    }

    /// Read and classify the next packet from the device
    pub fn get_response(&mut self) -> Result<Response, Error> {
        let mut data = self.channel.read(None)?;
        if data.is_empty() {
            return Ok(Response::Empty);
        }
        if data.windows(XML_PROLOG.len()).any(|w| w == XML_PROLOG) {
            return Ok(Response::Firehose);
        }

        // Complete a packet which was split across transfers
        if let Some(header) = data.get(..HEADER_LEN) {
            let header: PacketHeader = bytemuck::pod_read_unaligned(header);
            let length = header.length as usize;
            if length > data.len() && length <= MAX_PACKET_LEN {
                let rest = self.channel.read(Some(length - data.len()))?;
                data.extend_from_slice(&rest);
            }
        }

        let packet = Packet::parse(&data)?;
        if let Packet::Unknown(command) = packet {
            warn!("Ignoring unknown Sahara command {command:#x}");
        }

        Ok(Response::Packet(packet))
    }

    /// Run a client command, returning the data it produced
    pub fn cmd_exec(&mut self, command: ExecCommand) -> Result<Vec<u8>, Error> {
        self.send(Command::Execute(command))?;

        match self.get_response()? {
            Response::Packet(Packet::ExecuteResponse { data_len, .. }) => {
                self.send(Command::ExecuteData(command))?;
                self.channel
                    .read(Some(data_len as usize))
                    .for_command(CommandType::ExecuteData)
            }
            Response::Packet(Packet::EndTransfer(_)) => Err(Error::SaharaExec(command)),
            response => Err(unexpected("an execute response", &response)),
        }
    }

    /// Read the chip serial number, formatted as zero-padded hex
    pub fn cmd_get_serial_number(&mut self) -> Result<String, Error> {
        let data = self.cmd_exec(ExecCommand::SerialNumRead)?;
        let serial = data
            .get(..4)
            .and_then(|bytes| bytes.try_into().ok())
            .map(u32::from_le_bytes)
            .ok_or_else(|| {
                Error::MalformedResponse(format!("serial number of {} bytes", data.len()))
            })?;

        Ok(format!("0x{serial:08x}"))
    }

    /// Ask the device to accept client commands
    pub fn enter_command_mode(&mut self) -> Result<(), Error> {
        self.cmd_hello(Mode::Command)?;

        match self.get_response()? {
            Response::Packet(Packet::CommandReady) => Ok(()),
            response => {
                debug!("Command mode refused: {response:?}");
                Err(Error::SaharaCommandMode)
            }
        }
    }

    /// Upload the Firehose programmer
    ///
    /// The device requests the image in slices. Requests reaching past the end
    /// of `loader` are answered with `0xFF` padding.
    pub fn upload_loader(&mut self, loader: &[u8]) -> Result<ProtocolMode, Error> {
        self.enter_command_mode()?;
        let serial = self.cmd_get_serial_number()?;
        info!("Device serial number: {serial}");
        self.serial = Some(serial);
        self.cmd_mode_switch(Mode::Command)?;

        self.connect()?;
        debug!("Uploading programmer of {} bytes", loader.len());
        self.cmd_hello(Mode::ImageTxPending)?;

        let mut requests = 0usize;
        loop {
            let packet = match self.get_response()? {
                Response::Packet(packet) => packet,
                _ => {
                    return Err(Error::Connection(ConnectionError::Timeout(
                        CommandType::ReadData64.into(),
                    )))
                }
            };

            match packet {
                Packet::ReadData(request) => {
                    if requests == 0 {
                        debug!("Firehose image {:#x} requested", request.image_id);
                    }
                    requests += 1;
                    serve_read(&mut self.channel, loader, request)?;
                }
                Packet::EndTransfer(EndTransfer { status, .. }) if status == STATUS_SUCCESS => {
                    if !self.cmd_done()? {
                        return Err(Error::SaharaTransferFailed(STATUS_NAK_INVALID_CMD));
                    }
                    info!("Programmer uploaded after {requests} requests");
                    return Ok(ProtocolMode::Firehose);
                }
                Packet::EndTransfer(EndTransfer { status, .. }) => {
                    return Err(Error::SaharaTransferFailed(status));
                }
                packet => debug!("Ignoring {} during upload", packet.name()),
            }
        }
    }

    /// Finish the transfer
    ///
    /// Returns `false` when the device rejected the Done-Request as an invalid
    /// command.
    pub fn cmd_done(&mut self) -> Result<bool, Error> {
        self.send(Command::Done)?;

        match self.get_response()? {
            Response::Packet(Packet::DoneResponse { .. }) => Ok(true),
            Response::Packet(Packet::EndTransfer(EndTransfer { status, .. }))
                if status == STATUS_NAK_INVALID_CMD =>
            {
                error!("Invalid transfer command received");
                Ok(false)
            }
            Response::Packet(Packet::EndTransfer(EndTransfer { status, .. })) => {
                Err(Error::SaharaTransferFailed(status))
            }
            Response::Empty => Err(Error::Connection(ConnectionError::Timeout(
                CommandType::DoneRequest.into(),
            ))),
            response => Err(unexpected("a done response", &response)),
        }
    }

    /// Restart the Sahara state machine on the device
    pub fn cmd_reset(&mut self) -> Result<(), Error> {
        self.send(Command::Reset)?;

        match self.get_response()? {
            Response::Packet(Packet::ResetResponse) => Ok(()),
            response => Err(unexpected("a reset response", &response)),
        }
    }

    fn send(&mut self, command: Command) -> Result<(), Error> {
        debug!("Sahara > {}", command.command_type());
        self.channel
            .write(&command.to_bytes(), false)
            .for_command(command.command_type())
    }
}

/// Answer a read request with a window of `image`, `0xFF` padded
///
/// Neither the start nor the length of a request may exceed the image by
/// more than one packet.
fn serve_read<C: Channel>(
    channel: &mut C,
    image: &[u8],
    request: ReadDataRequest,
) -> Result<(), Error> {
    if request.image_id < FIREHOSE_IMAGE_ID {
        return Err(Error::SaharaUnknownImage(request.image_id));
    }

    let limit = image.len() + channel.max_packet_size();
    let range = usize::try_from(request.offset)
        .ok()
        .zip(usize::try_from(request.length).ok())
        .filter(|&(start, len)| start <= limit && len <= limit)
        .map(|(start, len)| start..start + len)
        .ok_or_else(|| {
            Error::MalformedResponse(format!(
                "read request of {} bytes at offset {} for an image of {} bytes",
                request.length,
                request.offset,
                image.len()
            ))
        })?;

    if range.end <= image.len() {
        return channel.write(&image[range], false).flashing();
    }

    let mut window = image[range.start.min(image.len())..].to_vec();
    window.resize(range.len(), 0xFF);
    channel.write(&window, false).flashing()
}

fn unexpected(expected: &'static str, response: &Response) -> Error {
    let received = match response {
        Response::Packet(packet) => packet.name(),
        Response::Firehose => "a Firehose document".to_owned(),
        Response::Empty => "nothing".to_owned(),
    };

    Error::UnexpectedPacket { expected, received }
}
