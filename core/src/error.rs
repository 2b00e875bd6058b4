//! SCSI-domain error types.
//!
//! A SCSI command handler never panics and never returns a bare `anyhow`
//! error for a condition the initiator is meant to see: it returns
//! [`ScsiError`], which the controller (the single catch point, per the
//! redesign notes this crate follows) turns into a CHECK CONDITION status
//! plus 18-byte sense data. Non-SCSI failures (image I/O, bus timing) use
//! [`BusError`] or plain `anyhow::Error` and are translated to the nearest
//! sense key at the same boundary.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// SCSI status byte values this crate produces.
pub mod status {
    pub const GOOD: u8 = 0x00;
    pub const CHECK_CONDITION: u8 = 0x02;
    pub const RESERVATION_CONFLICT: u8 = 0x18;
}

/// Sense key, the 4-bit category of a SCSI error (see `shared/scsi.h` in the
/// original implementation).
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::FromRepr, Serialize, Deserialize)]
#[repr(u8)]
pub enum SenseKey {
    NoSense = 0x00,
    NotReady = 0x02,
    MediumError = 0x03,
    IllegalRequest = 0x05,
    UnitAttention = 0x06,
    DataProtect = 0x07,
    BlankCheck = 0x08,
    AbortedCommand = 0x0B,
}

/// Additional sense code (ASC), paired with an implicit ASCQ of 0 unless
/// otherwise noted. Values taken from `shared/scsi.h`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u16)]
pub enum Asc {
    NoAdditionalSenseInformation = 0x0000,
    WriteFault = 0x0300,
    ReadFault = 0x1100,
    ParameterListLengthError = 0x1a00,
    InvalidCommandOperationCode = 0x2000,
    LbaOutOfRange = 0x2100,
    InvalidFieldInCdb = 0x2400,
    InvalidLun = 0x2500,
    InvalidFieldInParameterList = 0x2600,
    WriteProtected = 0x2700,
    NotReadyToReadyChange = 0x2800,
    PowerOnOrReset = 0x2900,
    SavingParametersNotSupported = 0x3900,
    MediumNotPresent = 0x3a00,
    LoadOrEjectFailed = 0x5300,
}

/// A SCSI-level error: sense key plus additional sense code. Handlers return
/// this as an `Err`; the controller is the only place it is ever matched
/// against a status byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("scsi error: sense_key={sense_key:?} asc={asc:?}")]
pub struct ScsiError {
    pub sense_key: SenseKey,
    pub asc: Asc,
}

impl ScsiError {
    pub const fn new(sense_key: SenseKey, asc: Asc) -> Self {
        Self { sense_key, asc }
    }

    pub const fn illegal_request(asc: Asc) -> Self {
        Self::new(SenseKey::IllegalRequest, asc)
    }

    pub const fn not_ready(asc: Asc) -> Self {
        Self::new(SenseKey::NotReady, asc)
    }

    pub const fn medium_error(asc: Asc) -> Self {
        Self::new(SenseKey::MediumError, asc)
    }

    pub const fn unit_attention(asc: Asc) -> Self {
        Self::new(SenseKey::UnitAttention, asc)
    }

    pub const fn data_protect(asc: Asc) -> Self {
        Self::new(SenseKey::DataProtect, asc)
    }

    /// Packs sense key (bits 16..20) and ASC/ASCQ (bits 0..15) the way
    /// `Device::GetStatusCode` packs its status code field.
    pub const fn status_code(&self) -> u32 {
        ((self.sense_key as u32) << 16) | (self.asc as u32)
    }

    /// Renders the 18-byte fixed-format REQUEST SENSE payload.
    pub fn to_sense_data(self) -> [u8; 18] {
        let mut buf = [0u8; 18];
        buf[0] = 0x70; // response code, current errors
        buf[2] = self.sense_key as u8;
        buf[7] = 10; // additional sense length
        let asc = self.asc as u16;
        buf[12] = (asc >> 8) as u8;
        buf[13] = (asc & 0xff) as u8;
        buf
    }
}

/// Errors raised by the bus/phase engine: deadlines and reset conditions
/// that abort a command before it could reach a status phase at all, so
/// they are never expressed as a SCSI status byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum BusError {
    #[error("bus reset asserted")]
    Reset,
    #[error("signal wait timed out")]
    Timeout,
    #[error("target not present")]
    TargetNotPresent,
}

/// Errors from `Registry` mutating operations (attach/detach/reserve). These
/// never panic and never propagate as a SCSI status; a host's management
/// layer translates them into its own status/message protocol.
#[derive(Debug, Clone, Error)]
pub enum RegistryError {
    #[error("SCSI ID {0} is reserved")]
    IdReserved(u8),
    #[error("file '{0}' is already attached to another device")]
    FileAlreadyReserved(String),
    #[error("LUN {0} already has a device attached")]
    LunInUse(u8),
    #[error("LUN {0} cannot be detached while higher LUNs are still attached")]
    LunZeroStillReferenced(u8),
    #[error("no device attached at ID {id} LUN {lun}")]
    NoDevice { id: u8, lun: u8 },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sense_data_layout() {
        let err = ScsiError::new(SenseKey::IllegalRequest, Asc::InvalidFieldInCdb);
        let sense = err.to_sense_data();
        assert_eq!(sense[0], 0x70);
        assert_eq!(sense[2], SenseKey::IllegalRequest as u8);
        assert_eq!(sense[7], 10);
        assert_eq!(sense[12], 0x24);
        assert_eq!(sense[13], 0x00);
    }

    #[test]
    fn status_code_packs_sense_and_asc() {
        let err = ScsiError::new(SenseKey::UnitAttention, Asc::NotReadyToReadyChange);
        let code = err.status_code();
        assert_eq!((code >> 16) as u8, SenseKey::UnitAttention as u8);
        assert_eq!((code & 0xffff) as u16, Asc::NotReadyToReadyChange as u16);
    }
}
