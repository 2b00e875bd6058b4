//! Device abstraction: the common state every SCSI logical unit carries
//! ([`Device`]), and the narrow capability traits concrete device types
//! implement ([`ScsiTarget`] for command dispatch, [`ModePages`] for
//! MODE SENSE/SELECT, [`BlockStorage`] for the block-device command set).
//!
//! The original implementation gets this from a chain of virtual base
//! classes (`Device` -> `PrimaryDevice` -> `ModePageDevice` ->
//! `StorageDevice` -> concrete type). Per this crate's redesign notes, it is
//! instead one plain struct of shared state plus small capability traits a
//! concrete type opts into, avoiding both virtual inheritance and the
//! device/controller shared-pointer cycle (a device never points back at
//! its controller; the controller looks devices up by (id, lun) instead).

pub mod mode_page;
pub mod primary;
pub mod storage;

use std::collections::HashMap;

use crate::error::ScsiError;
use crate::types::{Lun, LatchingEvent, ScsiId};

pub use mode_page::ModePages;
pub use storage::BlockStorage;

/// SCSI peripheral device type codes (`shared/scsi.h`'s `device_type`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum DeviceType {
    DirectAccess = 0x00,
    Printer = 0x02,
    Processor = 0x03,
    CdRom = 0x05,
    OpticalMemory = 0x07,
    Communications = 0x09,
}

/// Result of a dispatched command, mirroring the three ways a device
/// handler can end a command before the controller drives STATUS/MESSAGE
/// IN itself: it already produced a status, it has data ready for DATA IN,
/// or it expects a DATA OUT payload of a given length next.
#[derive(Debug)]
pub enum CommandResult {
    Status(u8),
    DataIn(Vec<u8>),
    DataOut(usize),
}

/// Shared, concrete state every logical unit carries regardless of type.
/// This is the data model's "Device" entity from the specification.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Device {
    pub device_type: DeviceType,
    pub lun: Lun,
    pub scsi_level: u8,

    pub vendor: String,
    pub product: String,
    pub revision: String,

    pub protectable: bool,
    pub read_only: bool,
    pub write_protected: bool,
    pub stoppable: bool,
    pub stopped: bool,
    pub removable: bool,
    pub removed: bool,
    pub lockable: bool,
    pub locked: bool,
    pub supports_params: bool,
    pub supports_file: bool,

    pub ready: bool,
    pub reset: bool,
    pub attn: LatchingEvent,

    pub params: HashMap<String, String>,

    /// Initiator ID holding the reservation, if any (RESERVE/RELEASE).
    pub reserving_initiator: Option<ScsiId>,

    /// Sense data pending delivery on the next REQUEST SENSE.
    pub pending_sense: Option<ScsiError>,
}

impl Device {
    pub fn new(device_type: DeviceType, lun: Lun) -> Self {
        Self {
            device_type,
            lun,
            scsi_level: 2,
            vendor: "PiSCSI".to_string(),
            product: String::new(),
            revision: "0.1".to_string(),
            protectable: false,
            read_only: false,
            write_protected: false,
            stoppable: false,
            stopped: false,
            removable: false,
            removed: false,
            lockable: false,
            locked: false,
            supports_params: false,
            supports_file: false,
            ready: false,
            reset: false,
            attn: LatchingEvent::default(),
            params: HashMap::new(),
            reserving_initiator: None,
            pending_sense: None,
        }
    }

    /// Records an error to be surfaced through the next REQUEST SENSE and
    /// returns it unchanged, so handlers can `return Err(dev.fail(err))`.
    pub fn fail(&mut self, err: ScsiError) -> ScsiError {
        self.pending_sense = Some(err);
        err
    }

    /// RESERVE(6): succeeds only if unreserved or already held by `initiator`.
    pub fn reserve(&mut self, initiator: ScsiId) -> Result<(), ScsiError> {
        match self.reserving_initiator {
            None => {
                self.reserving_initiator = Some(initiator);
                Ok(())
            }
            Some(id) if id == initiator => Ok(()),
            Some(_) => Err(ScsiError::new(
                crate::error::SenseKey::IllegalRequest,
                crate::error::Asc::InvalidFieldInCdb,
            )),
        }
    }

    /// RELEASE(6): only the holder (or nobody) may release.
    pub fn release(&mut self, initiator: ScsiId) {
        if self.reserving_initiator == Some(initiator) {
            self.reserving_initiator = None;
        }
    }

    pub fn discard_reservation(&mut self, initiator: ScsiId) {
        self.release(initiator);
    }

    /// True if `initiator` may proceed despite an outstanding reservation
    /// held by someone else, for the small set of commands the spec exempts.
    pub fn reservation_allows(&self, initiator: ScsiId, opcode: u8, prevent_bit_clear: bool) -> bool {
        match self.reserving_initiator {
            None => true,
            Some(id) if id == initiator => true,
            Some(_) => matches!(opcode, 0x12 | 0x03 | 0x17)
                || (opcode == 0x1e && prevent_bit_clear),
        }
    }
}

/// The common responder interface the controller dispatches through. A
/// concrete device type implements this for its specific command set; the
/// controller handles the mandatory PrimaryDevice/ModePageDevice commands
/// generically before ever reaching here (see `device::primary` and
/// `device::mode_page`).
pub trait ScsiTarget: Send {
    /// Executes a command this type registers beyond the generic mandatory
    /// set. `outdata` is `Some` only on the second half of a DATA OUT
    /// command (the controller calls once to learn the expected transfer
    /// length, then again with the received bytes).
    fn dispatch(
        &mut self,
        dev: &mut Device,
        cdb: &[u8],
        outdata: Option<&[u8]>,
    ) -> Result<CommandResult, ScsiError>;

    /// TEST UNIT READY. Default: ready iff `dev.ready`, clearing a pending
    /// medium-change unit attention is handled by the controller, not here.
    fn test_unit_ready(&mut self, dev: &mut Device) -> Result<(), ScsiError> {
        if dev.ready {
            Ok(())
        } else {
            Err(dev.fail(ScsiError::not_ready(crate::error::Asc::MediumNotPresent)))
        }
    }

    /// Flushes any write-back cache to the backing store. Default: no-op,
    /// matching `PrimaryDevice::FlushCache`'s virtual default.
    fn flush_cache(&mut self) {}

    fn as_mode_pages(&self) -> Option<&dyn ModePages> {
        None
    }

    fn as_mode_pages_mut(&mut self) -> Option<&mut dyn ModePages> {
        None
    }

    fn as_block_storage(&self) -> Option<&dyn BlockStorage> {
        None
    }

    fn as_block_storage_mut(&mut self) -> Option<&mut dyn BlockStorage> {
        None
    }
}
