//! In-memory [`SignalBus`] double for driving [`super::PhaseEngine`] under
//! test, standing in for the initiator side of the handshake a real bus
//! transport would perform. Scripted by queuing bytes the "initiator" will
//! hand back on REQ during a target-receives phase, and recording bytes the
//! engine hands to the "initiator" during a target-sends phase.

use std::collections::VecDeque;

use super::{BusDirection, Signal, SignalBus};
use crate::types::ScsiId;

/// A purely in-memory bus: every line lives in a bool array, and asserting
/// REQ is answered synchronously (no real waiting, since there is no
/// separate initiator thread to wait on).
pub struct TestBus {
    bsy: bool,
    sel: bool,
    cd: bool,
    io: bool,
    msg: bool,
    req: bool,
    ack: bool,
    atn: bool,
    rst: bool,
    data: u8,
    direction: BusDirection,

    /// Bytes the "initiator" will hand back, in order, each time the engine
    /// raises REQ during a phase where the engine is the receiver (Command,
    /// DataOut).
    input: VecDeque<u8>,

    /// Bytes captured during DATA IN specifically (not Status/Message In,
    /// which also assert REQ toward the initiator but aren't data).
    data_in_log: Vec<u8>,
}

impl TestBus {
    pub fn new() -> Self {
        Self {
            bsy: false,
            sel: false,
            cd: false,
            io: false,
            msg: false,
            req: false,
            ack: false,
            atn: false,
            rst: false,
            data: 0,
            direction: BusDirection::ToTarget,
            input: VecDeque::new(),
            data_in_log: Vec::new(),
        }
    }

    /// Asserts SEL with both `target_id` and `initiator_id` set in the data
    /// bus, matching real SELECTION (both IDs' bits asserted together).
    pub fn script_selection(&mut self, target_id: ScsiId, initiator_id: ScsiId) {
        self.sel = true;
        self.data = (1 << target_id) | (1 << initiator_id);
    }

    /// Queues the bytes the engine's COMMAND-phase `recv_byte` calls
    /// (including the opcode byte) will read back, one per REQ/ACK cycle.
    pub fn script_command_in(&mut self, cdb: &[u8]) {
        self.input.extend(cdb.iter().copied());
    }

    /// Bytes the engine sent during DATA IN specifically, in order.
    pub fn data_in_log(&self) -> Vec<u8> {
        self.data_in_log.clone()
    }

    fn is_data_in_combo(&self) -> bool {
        !self.msg && !self.cd && self.io
    }

    fn line_mut(&mut self, line: Signal) -> &mut bool {
        match line {
            Signal::Bsy => &mut self.bsy,
            Signal::Sel => &mut self.sel,
            Signal::Cd => &mut self.cd,
            Signal::Io => &mut self.io,
            Signal::Msg => &mut self.msg,
            Signal::Req => &mut self.req,
            Signal::Ack => &mut self.ack,
            Signal::Atn => &mut self.atn,
            Signal::Rst => &mut self.rst,
        }
    }
}

impl Default for TestBus {
    fn default() -> Self {
        Self::new()
    }
}

impl SignalBus for TestBus {
    fn get(&self, line: Signal) -> bool {
        match line {
            Signal::Bsy => self.bsy,
            Signal::Sel => self.sel,
            Signal::Cd => self.cd,
            Signal::Io => self.io,
            Signal::Msg => self.msg,
            Signal::Req => self.req,
            Signal::Ack => self.ack,
            Signal::Atn => self.atn,
            Signal::Rst => self.rst,
        }
    }

    fn set(&mut self, line: Signal, value: bool) {
        *self.line_mut(line) = value;

        if line != Signal::Req {
            return;
        }

        // REQ is the only line whose assertion the "initiator" side must
        // answer; every other line is just state the engine reads back.
        if value {
            match self.direction {
                BusDirection::ToTarget => {
                    if let Some(byte) = self.input.pop_front() {
                        self.data = byte;
                    }
                }
                BusDirection::ToInitiator => {
                    if self.is_data_in_combo() {
                        self.data_in_log.push(self.data);
                    }
                }
            }
            self.ack = true;
        } else {
            self.ack = false;
        }
    }

    fn data(&self) -> u8 {
        self.data
    }

    fn set_data(&mut self, value: u8) {
        self.data = value;
    }

    fn set_direction(&mut self, dir: BusDirection) {
        self.direction = dir;
    }
}
