use std::collections::VecDeque;

use super::Channel;
use crate::error::{ConnectionError, Error};

/// An in-memory device that replays scripted transfers and records writes
#[derive(Debug, Default)]
pub(crate) struct ScriptedChannel {
    reads: VecDeque<Vec<u8>>,
    pub(crate) writes: Vec<Vec<u8>>,
}

impl ScriptedChannel {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Queue one transfer the device will deliver
    pub(crate) fn push(&mut self, data: impl Into<Vec<u8>>) -> &mut Self {
        self.reads.push_back(data.into());
        self
    }

    /// Queue a Firehose response document
    pub(crate) fn push_response(&mut self, value: &str) -> &mut Self {
        self.push(format!(
            r#"<?xml version="1.0" encoding="UTF-8" ?><data><response value="{value}" /></data>"#
        ))
    }

    /// Queue a Firehose log document
    pub(crate) fn push_log(&mut self, message: &str) -> &mut Self {
        self.push(format!(
            r#"<?xml version="1.0" encoding="UTF-8" ?><data><log value="{message}" /></data>"#
        ))
    }

    pub(crate) fn pending_reads(&self) -> usize {
        self.reads.len()
    }
}

impl Channel for ScriptedChannel {
    fn read(&mut self, len: Option<usize>) -> Result<Vec<u8>, Error> {
        let Some(len) = len else {
            return Ok(self.reads.pop_front().unwrap_or_default());
        };

        let mut data = Vec::with_capacity(len);
        while data.len() < len {
            let Some(mut transfer) = self.reads.pop_front() else {
                return Err(Error::Connection(ConnectionError::Timeout(
                    Default::default(),
                )));
            };
            let wanted = len - data.len();
            if transfer.len() > wanted {
                let rest = transfer.split_off(wanted);
                self.reads.push_front(rest);
            }
            data.extend_from_slice(&transfer);
        }

        Ok(data)
    }

    fn write(&mut self, data: &[u8], _wait: bool) -> Result<(), Error> {
        self.writes.push(data.to_vec());
        Ok(())
    }

    fn max_packet_size(&self) -> usize {
        4096
    }
}
