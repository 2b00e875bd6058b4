//! SCSI signal bus abstraction and the phase engine driving a target's side
//! of the bus protocol.
//!
//! The original implementation talks to one specific adapter board's GPIO
//! pins (`hal/gpiobus_fullspec.h`). This crate keeps that abstraction's
//! *shape* — a trait boundary between "what line is asserted" and the
//! physical transport, plus an explicit bus-direction control separate from
//! phase — and drops the pin numbers, which are out of scope here.

pub mod testbus;

use std::time::{Duration, Instant};

use crate::controller::ControllerOutcome;
use crate::error::BusError;
use crate::registry::Registry;
use crate::types::ScsiId;

/// Default REQ/ACK and selection handshake deadline, matching the original
/// bus driver's 3-second timeout.
pub const BUS_TIMEOUT: Duration = Duration::from_secs(3);

/// A single named control or data-handshake line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Signal {
    Bsy,
    Sel,
    Cd,
    Io,
    Msg,
    Req,
    Ack,
    Atn,
    Rst,
}

/// Who is driving the 8-bit data bus and the control lines right now. Set
/// before any signal is asserted in that direction, never inferred from
/// phase alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusDirection {
    ToTarget,
    ToInitiator,
}

/// Transport-independent view of the physical SCSI bus. A real adapter
/// implements this against GPIO; [`testbus::TestBus`] implements it purely
/// in memory for driving the phase engine under test.
pub trait SignalBus: Send {
    fn get(&self, line: Signal) -> bool;
    fn set(&mut self, line: Signal, value: bool);
    fn data(&self) -> u8;
    fn set_data(&mut self, value: u8);
    fn set_direction(&mut self, dir: BusDirection);

    /// Odd parity over the current data byte, as transmitted alongside it.
    fn parity(&self) -> bool {
        self.data().count_ones() % 2 == 0
    }
}

/// Polls `line` until it reads `want`, RST is asserted, or `timeout`
/// elapses.
pub fn wait_signal(bus: &dyn SignalBus, line: Signal, want: bool, timeout: Duration) -> Result<(), BusError> {
    let deadline = Instant::now() + timeout;
    loop {
        if bus.get(line) == want {
            return Ok(());
        }
        if bus.get(Signal::Rst) {
            return Err(BusError::Reset);
        }
        if Instant::now() >= deadline {
            return Err(BusError::Timeout);
        }
    }
}

/// The nine phases of the target state machine (§4.2). Each variant's
/// `control_lines` gives the fixed MSG/CD/IO combination the engine sets,
/// with BSY asserted, before raising REQ.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    BusFree,
    Arbitration,
    Selection,
    Command,
    DataIn,
    DataOut,
    Status,
    MessageIn,
    MessageOut,
}

impl Phase {
    /// (msg, cd, io) asserted-line combination for this phase. `BusFree`
    /// has no meaningful combination; callers must not ask for it.
    fn control_lines(self) -> (bool, bool, bool) {
        match self {
            Phase::Command => (false, true, false),
            Phase::DataIn => (false, false, true),
            Phase::DataOut => (false, false, false),
            Phase::Status => (false, true, true),
            Phase::MessageIn => (true, true, true),
            Phase::MessageOut => (true, true, false),
            Phase::BusFree | Phase::Arbitration | Phase::Selection => {
                unreachable!("control_lines() is only meaningful for data/command/status/message phases")
            }
        }
    }
}

/// One-shot COMMAND COMPLETE message, the only message this engine ever
/// sends on MESSAGE IN.
const MSG_COMMAND_COMPLETE: u8 = 0x00;

/// Drives one target ID's half of the bus protocol: selection, command
/// receipt, delegation to the addressed [`crate::controller::Controller`],
/// and the data/status/message phases the controller's outcome implies.
pub struct PhaseEngine<B: SignalBus> {
    bus: B,
    registry: Registry,
    our_id: ScsiId,
    phase: Phase,
}

impl<B: SignalBus> PhaseEngine<B> {
    pub fn new(bus: B, registry: Registry, our_id: ScsiId) -> Self {
        Self {
            bus,
            registry,
            our_id,
            phase: Phase::BusFree,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    fn enter(&mut self, phase: Phase) {
        self.bus.set_direction(match phase {
            Phase::DataIn | Phase::Status | Phase::MessageIn => BusDirection::ToInitiator,
            _ => BusDirection::ToTarget,
        });
        let (msg, cd, io) = phase.control_lines();
        self.bus.set(Signal::Msg, msg);
        self.bus.set(Signal::Cd, cd);
        self.bus.set(Signal::Io, io);
        self.bus.set(Signal::Bsy, true);
        self.phase = phase;
    }

    fn enter_bus_free(&mut self) {
        self.bus.set(Signal::Bsy, false);
        self.bus.set(Signal::Sel, false);
        self.bus.set(Signal::Msg, false);
        self.bus.set(Signal::Cd, false);
        self.bus.set(Signal::Io, false);
        self.phase = Phase::BusFree;
    }

    /// Sends one byte on the current phase's handshake: assert data, raise
    /// REQ, wait ACK, drop REQ, wait ACK release.
    fn send_byte(&mut self, byte: u8) -> Result<(), BusError> {
        self.bus.set_data(byte);
        self.bus.set(Signal::Req, true);
        wait_signal(&self.bus, Signal::Ack, true, BUS_TIMEOUT)?;
        self.bus.set(Signal::Req, false);
        wait_signal(&self.bus, Signal::Ack, false, BUS_TIMEOUT)?;
        Ok(())
    }

    /// Receives one byte: raise REQ, wait ACK, latch data, drop REQ, wait
    /// ACK release.
    fn recv_byte(&mut self) -> Result<u8, BusError> {
        self.bus.set(Signal::Req, true);
        wait_signal(&self.bus, Signal::Ack, true, BUS_TIMEOUT)?;
        let byte = self.bus.data();
        self.bus.set(Signal::Req, false);
        wait_signal(&self.bus, Signal::Ack, false, BUS_TIMEOUT)?;
        Ok(byte)
    }

    /// Runs exactly one SELECTION -> ... -> BUS FREE cycle. Returns `Ok(false)`
    /// immediately, without touching any state, if SEL never arrives (so a
    /// caller can poll this in a loop without busy-waiting on a match).
    /// Returns `Ok(true)` after a full cycle completes; `Err` on RST or a
    /// handshake timeout (the engine always returns to BUS FREE regardless).
    pub fn run_once(&mut self) -> Result<bool, BusError> {
        if wait_signal(&self.bus, Signal::Sel, true, Duration::from_millis(0)).is_err() {
            return Ok(false);
        }

        let result = self.run_selected_cycle();
        self.enter_bus_free();
        result.map(|()| true)
    }

    fn run_selected_cycle(&mut self) -> Result<(), BusError> {
        let select_mask = self.bus.data();
        if select_mask & (1 << self.our_id) == 0 {
            return Ok(()); // SEL asserted, but not addressed to us
        }
        let initiator_id = (0..8u8)
            .find(|&b| b != self.our_id && select_mask & (1 << b) != 0)
            .unwrap_or(self.our_id);

        self.phase = Phase::Selection;
        self.bus.set(Signal::Bsy, true);

        self.enter(Phase::Command);
        let opcode = self.recv_byte()?;
        let cdb_len = crate::controller::cdb_len_for_opcode(opcode);
        let mut cdb = vec![opcode];
        for _ in 1..cdb_len {
            cdb.push(self.recv_byte()?);
        }

        let outcome = self
            .registry
            .with_controller_mut(self.our_id, |c| c.dispatch(initiator_id, &cdb, None))
            .unwrap_or(ControllerOutcome::Status(crate::error::status::CHECK_CONDITION));

        let status = self.drive_outcome(outcome, initiator_id, &cdb)?;

        self.enter(Phase::Status);
        self.send_byte(status)?;

        self.enter(Phase::MessageIn);
        self.send_byte(MSG_COMMAND_COMPLETE)?;

        Ok(())
    }

    /// Drives the data phase (if any) the controller's outcome calls for,
    /// returning the final status byte.
    fn drive_outcome(&mut self, outcome: ControllerOutcome, initiator_id: ScsiId, cdb: &[u8]) -> Result<u8, BusError> {
        match outcome {
            ControllerOutcome::Status(s) => Ok(s),
            ControllerOutcome::DataIn(data) => {
                self.enter(Phase::DataIn);
                for byte in &data {
                    self.send_byte(*byte)?;
                }
                Ok(crate::error::status::GOOD)
            }
            ControllerOutcome::DataOut(len) => {
                self.enter(Phase::DataOut);
                let mut received = vec![0u8; len];
                for slot in received.iter_mut() {
                    *slot = self.recv_byte()?;
                }
                let outcome = self
                    .registry
                    .with_controller_mut(self.our_id, |c| c.dispatch(initiator_id, cdb, Some(&received)))
                    .unwrap_or(ControllerOutcome::Status(crate::error::status::CHECK_CONDITION));
                match outcome {
                    ControllerOutcome::Status(s) => Ok(s),
                    // a device is not expected to ask for a second DATA OUT
                    _ => Ok(crate::error::status::GOOD),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{CommandResult, Device, DeviceType, ScsiTarget};
    use crate::error::ScsiError;
    use testbus::TestBus;

    struct EchoTarget;
    impl ScsiTarget for EchoTarget {
        fn dispatch(&mut self, _dev: &mut Device, cdb: &[u8], _outdata: Option<&[u8]>) -> Result<CommandResult, ScsiError> {
            // 0x08 == READ(6): respond with one data byte for this test.
            if cdb[0] == 0x08 {
                Ok(CommandResult::DataIn(vec![0x42]))
            } else {
                Ok(CommandResult::Status(crate::error::status::GOOD))
            }
        }
    }

    #[test]
    fn no_selection_returns_false_without_side_effects() {
        let bus = TestBus::new();
        let registry = Registry::new();
        let mut engine = PhaseEngine::new(bus, registry, 0);
        assert_eq!(engine.run_once().unwrap(), false);
        assert_eq!(engine.phase(), Phase::BusFree);
    }

    #[test]
    fn full_command_cycle_reaches_bus_free_with_data_in() {
        let registry = Registry::new();
        registry.ensure_controller(0).unwrap();
        registry
            .with_controller_mut(0, |c| {
                let mut dev = Device::new(DeviceType::DirectAccess, 0);
                dev.ready = true;
                c.attach(0, dev, Box::new(EchoTarget)).unwrap();
            })
            .unwrap();

        let mut bus = TestBus::new();
        bus.script_selection(0, 7);
        bus.script_command_in(&[0x08, 0, 0, 0, 1, 0]);

        let mut engine = PhaseEngine::new(bus, registry, 0);
        let completed = engine.run_once().unwrap();
        assert!(completed);
        assert_eq!(engine.phase(), Phase::BusFree);
        assert_eq!(engine.bus.data_in_log(), vec![0x42]);
    }
}
