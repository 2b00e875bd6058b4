//! Host bridge (§4.10, X68000-style): wraps a TAP-backed Ethernet link with
//! GET/SEND MESSAGE(10) framing, plus an opaque FS_* byte pipe a host
//! application interprets.
//!
//! Per Open Question #2, the FS_* subprotocol (opcodes 0x40..0x58) is
//! host-OS-specific and out of scope here: this crate only defines the
//! dispatch entry and a callback trait, never the payload semantics.
//! Grounded on `devices/scsi_host_bridge.h`/`.cpp`.

use std::collections::VecDeque;

use anyhow::Result;

use crate::device::{CommandResult, Device, ScsiTarget};
use crate::error::{Asc, ScsiError};
use crate::util::get_int16;

const OPCODE_GET_MESSAGE10: u8 = 0x28;
const OPCODE_SEND_MESSAGE10: u8 = 0x2a;
const FS_OPCODE_LOW: u8 = 0x40;
const FS_OPCODE_HIGH: u8 = 0x58;

/// Ethernet FCS (CRC-32/ISO-HDLC), appended on receive to match what real
/// network hardware would present a guest driver, since the host's TAP
/// device normally strips it.
fn append_fcs(frame: &mut Vec<u8>) {
    let crc = crc::Crc::<u32>::new(&crc::CRC_32_ISO_HDLC);
    let digest = crc.checksum(frame);
    frame.extend_from_slice(&digest.to_le_bytes());
}

/// Host-implemented byte pipe for the opaque FS_* subprotocol (filesystem
/// access over the bridge, specific to the Sharp X68000 NetBSD driver this
/// device type emulates). This crate never parses `request`/`response`.
pub trait HostBridgeIo: Send {
    fn send_message(&mut self, request: &[u8]) -> Result<()>;
    fn receive_message(&mut self) -> Result<Vec<u8>>;
}

/// Wraps a TAP-backed link: `frames` queues Ethernet frames read from the
/// host side, waiting to be drained by GET MESSAGE(10).
pub struct HostBridge {
    io: Box<dyn HostBridgeIo>,
    frames: VecDeque<Vec<u8>>,
}

impl HostBridge {
    pub fn new(io: Box<dyn HostBridgeIo>) -> Self {
        Self {
            io,
            frames: VecDeque::new(),
        }
    }

    /// Enqueues a frame the host side received, for a later GET MESSAGE(10)
    /// to drain.
    pub fn push_frame(&mut self, frame: Vec<u8>) {
        self.frames.push_back(frame);
    }

    fn get_message(&mut self, alloc_len: usize) -> Vec<u8> {
        match self.frames.pop_front() {
            Some(mut frame) => {
                append_fcs(&mut frame);
                frame.truncate(alloc_len.min(frame.len()));
                frame
            }
            None => Vec::new(),
        }
    }

    fn send_message(&mut self, dev: &mut Device, data: &[u8]) -> Result<CommandResult, ScsiError> {
        self.io
            .send_message(data)
            .map_err(|_| dev.fail(ScsiError::medium_error(Asc::WriteFault)))?;
        Ok(CommandResult::Status(crate::error::status::GOOD))
    }
}

impl ScsiTarget for HostBridge {
    fn dispatch(&mut self, dev: &mut Device, cdb: &[u8], outdata: Option<&[u8]>) -> Result<CommandResult, ScsiError> {
        let opcode = cdb[0];
        if (FS_OPCODE_LOW..=FS_OPCODE_HIGH).contains(&opcode) {
            return match outdata {
                None => Ok(CommandResult::DataOut(cdb.len())),
                Some(data) => {
                    let response = self
                        .io
                        .receive_message()
                        .unwrap_or_default();
                    let _ = data; // opaque payload; this crate only relays it
                    Ok(CommandResult::DataIn(response))
                }
            };
        }

        match opcode {
            OPCODE_GET_MESSAGE10 => {
                let alloc_len = usize::from(get_int16(cdb, 7));
                Ok(CommandResult::DataIn(self.get_message(alloc_len)))
            }
            OPCODE_SEND_MESSAGE10 => {
                let len = usize::from(get_int16(cdb, 7));
                match outdata {
                    None => Ok(CommandResult::DataOut(len)),
                    Some(data) => self.send_message(dev, data),
                }
            }
            _ => Err(dev.fail(ScsiError::illegal_request(Asc::InvalidCommandOperationCode))),
        }
    }
}
