//! Per-SCSI-ID controller: owns the LUN table for one target, decodes CDB
//! length from the opcode group, enforces reservations and unit-attention
//! delivery, and is the single point that turns a raised [`ScsiError`] into
//! CHECK CONDITION plus recorded sense data.
//!
//! Grounded on `controllers/scsi_controller.cpp` and `primary_device.cpp`.

use std::collections::BTreeMap;

use crate::device::{CommandResult, Device, ScsiTarget};
use crate::error::{status, Asc, ScsiError};
use crate::types::{Lun, ScsiId};

const OPCODE_TEST_UNIT_READY: u8 = 0x00;
const OPCODE_REQUEST_SENSE: u8 = 0x03;
const OPCODE_INQUIRY: u8 = 0x12;
const OPCODE_RESERVE6: u8 = 0x16;
const OPCODE_RELEASE6: u8 = 0x17;
const OPCODE_SEND_DIAGNOSTIC: u8 = 0x1d;
const OPCODE_PREVENT_ALLOW: u8 = 0x1e;
const OPCODE_REPORT_LUNS: u8 = 0xa0;

/// Decodes CDB length from the opcode's top 3 bits, per SCSI's command
/// group convention.
pub fn cdb_len_for_opcode(opcode: u8) -> usize {
    match opcode >> 5 {
        0b000 => 6,
        0b001 | 0b010 => 10,
        0b101 => 12,
        0b100 => 16,
        _ => 6, // vendor-specific group; this crate does not register any
    }
}

/// Outcome of a dispatched command, mirroring what the phase engine does
/// next: go to STATUS directly, or to DATA IN/OUT first.
#[derive(Debug)]
pub enum ControllerOutcome {
    Status(u8),
    DataIn(Vec<u8>),
    DataOut(usize),
}

/// What the outer supervisor should do once the current command completes
/// and the phase engine returns to BUS FREE.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ShutdownMode {
    #[default]
    None,
    StopEmulator,
    StopHost,
    RestartHost,
}

/// Per-target state: the LUN table and the shared transfer buffer.
pub struct Controller {
    id: ScsiId,
    luns: BTreeMap<Lun, (Device, Box<dyn ScsiTarget>)>,
    buffer: Vec<u8>,
    shutdown: ShutdownMode,
}

impl Controller {
    pub fn new(id: ScsiId) -> Self {
        Self {
            id,
            luns: BTreeMap::new(),
            buffer: Vec::new(),
            shutdown: ShutdownMode::None,
        }
    }

    pub fn id(&self) -> ScsiId {
        self.id
    }

    pub fn is_empty(&self) -> bool {
        self.luns.is_empty()
    }

    pub fn shutdown_mode(&self) -> ShutdownMode {
        self.shutdown
    }

    pub fn request_shutdown(&mut self, mode: ShutdownMode) {
        self.shutdown = mode;
    }

    /// Binds a device at `lun`. LUN 0 must be attached before any other LUN
    /// on this target.
    pub fn attach(&mut self, lun: Lun, device: Device, target: Box<dyn ScsiTarget>) -> Result<(), crate::error::RegistryError> {
        if lun != 0 && !self.luns.contains_key(&0) {
            return Err(crate::error::RegistryError::NoDevice { id: self.id, lun: 0 });
        }
        self.luns.insert(lun, (device, target));
        Ok(())
    }

    /// Detaches the device at `lun`. LUN 0 cannot be detached while any
    /// other LUN on this target is still present.
    pub fn detach(&mut self, lun: Lun) -> Result<(), crate::error::RegistryError> {
        if lun == 0 && self.luns.len() > 1 {
            return Err(crate::error::RegistryError::LunZeroStillReferenced(lun));
        }
        self.luns.remove(&lun);
        Ok(())
    }

    pub fn device_mut(&mut self, lun: Lun) -> Option<&mut Device> {
        self.luns.get_mut(&lun).map(|(dev, _)| dev)
    }

    /// Flushes every attached LUN's write-back cache, e.g. before a
    /// host-services-initiated shutdown or reboot.
    pub fn flush_all_caches(&mut self) {
        for (_, target) in self.luns.values_mut() {
            target.flush_cache();
        }
    }

    /// Snapshots the common envelope of every attached LUN (vendor/product,
    /// ready/locked/reservation state, pending sense), for [`crate::savestate`].
    /// The image file and any write-back cache are not part of this: they
    /// are flushed to the backing file instead (see [`Self::flush_all_caches`]).
    pub fn device_snapshot(&self) -> Vec<(Lun, Device)> {
        self.luns
            .iter()
            .map(|(&lun, (device, _))| (lun, device.clone()))
            .collect()
    }

    /// Restores envelope state into already-attached LUNs. A host must
    /// re-attach each device (reopening its image file, if any) before
    /// calling this; a `lun` in `snapshot` with nothing currently attached
    /// is skipped, since there is no `ScsiTarget` to pair it with.
    pub fn restore_devices(&mut self, snapshot: Vec<(Lun, Device)>) {
        for (lun, saved) in snapshot {
            if let Some((device, _)) = self.luns.get_mut(&lun) {
                *device = saved;
            }
        }
    }

    fn ensure_buffer(&mut self, len: usize) -> &mut [u8] {
        if self.buffer.len() < len {
            self.buffer.resize(len, 0);
        }
        &mut self.buffer[..len]
    }

    /// Extracts the LUN selector from CDB byte 1, bits 5..7 (the legacy
    /// SCSI-2 location this core targets).
    fn lun_from_cdb(cdb: &[u8]) -> Lun {
        (cdb[1] >> 5) & 0x07
    }

    fn present_luns(&self) -> Vec<u8> {
        self.luns.keys().copied().collect()
    }

    /// Dispatches one CDB for `initiator`. `outdata` carries the DATA OUT
    /// payload on the second call of a write command; `None` on the first
    /// call, when the controller/device are only negotiating the transfer
    /// length.
    pub fn dispatch(&mut self, initiator: ScsiId, cdb: &[u8], outdata: Option<&[u8]>) -> ControllerOutcome {
        let opcode = cdb[0];
        let lun = Self::lun_from_cdb(cdb);

        if !self.luns.contains_key(&lun) {
            return self.dispatch_unsupported_lun(opcode);
        }

        let prevent_bit_clear = opcode == OPCODE_PREVENT_ALLOW && cdb.len() > 4 && cdb[4] & 0x01 == 0;
        {
            let (device, _) = self.luns.get(&lun).expect("checked above");
            if !device.reservation_allows(initiator, opcode, prevent_bit_clear) {
                return ControllerOutcome::Status(status::RESERVATION_CONFLICT);
            }
        }

        {
            let (device, _) = self.luns.get_mut(&lun).expect("checked above");
            if device.removable && device.attn.get_clear() {
                let err = device.fail(ScsiError::unit_attention(Asc::NotReadyToReadyChange));
                return self.finish_with_error(lun, err);
            }
        }

        match opcode {
            OPCODE_TEST_UNIT_READY => {
                let (device, target) = self.luns.get_mut(&lun).expect("checked above");
                match target.test_unit_ready(device) {
                    Ok(()) => ControllerOutcome::Status(status::GOOD),
                    Err(err) => self.finish_with_error(lun, err),
                }
            }
            OPCODE_INQUIRY => {
                let (device, _) = self.luns.get(&lun).expect("checked above");
                ControllerOutcome::DataIn(crate::device::primary::handle_inquiry(device))
            }
            OPCODE_REQUEST_SENSE => {
                let (device, _) = self.luns.get_mut(&lun).expect("checked above");
                ControllerOutcome::DataIn(crate::device::primary::handle_request_sense(device))
            }
            OPCODE_REPORT_LUNS => {
                let present = self.present_luns();
                ControllerOutcome::DataIn(crate::device::primary::handle_report_luns(&present))
            }
            OPCODE_RESERVE6 => {
                let (device, _) = self.luns.get_mut(&lun).expect("checked above");
                match device.reserve(initiator) {
                    Ok(()) => ControllerOutcome::Status(status::GOOD),
                    Err(err) => self.finish_with_error(lun, err),
                }
            }
            OPCODE_RELEASE6 => {
                let (device, _) = self.luns.get_mut(&lun).expect("checked above");
                device.release(initiator);
                ControllerOutcome::Status(status::GOOD)
            }
            OPCODE_SEND_DIAGNOSTIC => ControllerOutcome::Status(status::GOOD),
            _ => {
                let (device, target) = self.luns.get_mut(&lun).expect("checked above");
                match target.dispatch(device, cdb, outdata) {
                    Ok(CommandResult::Status(s)) => ControllerOutcome::Status(s),
                    Ok(CommandResult::DataIn(data)) => ControllerOutcome::DataIn(data),
                    Ok(CommandResult::DataOut(len)) => {
                        self.ensure_buffer(len);
                        ControllerOutcome::DataOut(len)
                    }
                    Err(err) => self.finish_with_error(lun, err),
                }
            }
        }
    }

    /// Single catch point: records the error as the device's pending sense
    /// and reports CHECK CONDITION. `lun` must be present.
    fn finish_with_error(&mut self, lun: Lun, err: ScsiError) -> ControllerOutcome {
        if let Some((device, _)) = self.luns.get_mut(&lun) {
            device.fail(err);
        }
        ControllerOutcome::Status(status::CHECK_CONDITION)
    }

    fn dispatch_unsupported_lun(&mut self, opcode: u8) -> ControllerOutcome {
        match opcode {
            OPCODE_INQUIRY => ControllerOutcome::DataIn(crate::device::primary::handle_inquiry_unsupported_lun()),
            OPCODE_REQUEST_SENSE => {
                let err = ScsiError::illegal_request(Asc::InvalidLun);
                ControllerOutcome::DataIn(err.to_sense_data().to_vec())
            }
            OPCODE_REPORT_LUNS => {
                let present = self.present_luns();
                ControllerOutcome::DataIn(crate::device::primary::handle_report_luns(&present))
            }
            _ => ControllerOutcome::Status(status::CHECK_CONDITION),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceType;
    use crate::error::SenseKey;

    struct NullTarget;
    impl ScsiTarget for NullTarget {
        fn dispatch(&mut self, dev: &mut Device, _cdb: &[u8], _outdata: Option<&[u8]>) -> Result<CommandResult, ScsiError> {
            if dev.ready {
                Ok(CommandResult::Status(status::GOOD))
            } else {
                Err(dev.fail(ScsiError::not_ready(Asc::MediumNotPresent)))
            }
        }
    }

    fn attached_controller() -> Controller {
        let mut c = Controller::new(0);
        let mut dev = Device::new(DeviceType::DirectAccess, 0);
        dev.ready = true;
        dev.vendor = "ACME".into();
        dev.product = "DISK".into();
        c.attach(0, dev, Box::new(NullTarget)).unwrap();
        c
    }

    #[test]
    fn cdb_length_decoding_matches_opcode_groups() {
        assert_eq!(cdb_len_for_opcode(0x00), 6); // TEST UNIT READY
        assert_eq!(cdb_len_for_opcode(0x28), 10); // READ(10)
        assert_eq!(cdb_len_for_opcode(0xa8), 12); // READ(12)
        assert_eq!(cdb_len_for_opcode(0x88), 16); // READ(16)
    }

    #[test]
    fn inquiry_on_unsupported_lun_is_7f() {
        let mut c = attached_controller();
        let cdb = [OPCODE_INQUIRY, 0x20, 0, 0, 36, 0]; // LUN 1, not attached
        match c.dispatch(0, &cdb, None) {
            ControllerOutcome::DataIn(data) => assert_eq!(data[0], 0x7f),
            other => panic!("expected DataIn, got {other:?}"),
        }
    }

    #[test]
    fn reservation_conflict_blocks_other_initiator() {
        let mut c = attached_controller();
        let reserve_cdb = [OPCODE_RESERVE6, 0, 0, 0, 0, 0];
        assert!(matches!(c.dispatch(7, &reserve_cdb, None), ControllerOutcome::Status(s) if s == status::GOOD));

        let tur_cdb = [OPCODE_TEST_UNIT_READY, 0, 0, 0, 0, 0];
        match c.dispatch(6, &tur_cdb, None) {
            ControllerOutcome::Status(s) => assert_eq!(s, status::RESERVATION_CONFLICT),
            other => panic!("expected Status, got {other:?}"),
        }
        // the reservation holder itself is unaffected
        assert!(matches!(c.dispatch(7, &tur_cdb, None), ControllerOutcome::Status(s) if s == status::GOOD));
    }

    #[test]
    fn eject_unit_attention_then_not_ready_matches_scenario_5() {
        let mut c = attached_controller();
        {
            let dev = c.device_mut(0).unwrap();
            dev.removable = true;
            dev.ready = false;
            dev.attn.set();
        }
        let tur_cdb = [OPCODE_TEST_UNIT_READY, 0, 0, 0, 0, 0];

        // First TEST UNIT READY after eject reports the unit attention.
        match c.dispatch(0, &tur_cdb, None) {
            ControllerOutcome::Status(s) => assert_eq!(s, status::CHECK_CONDITION),
            other => panic!("expected Status, got {other:?}"),
        }
        let sense = c.device_mut(0).unwrap().pending_sense.unwrap();
        assert_eq!(sense.sense_key, SenseKey::UnitAttention);
        assert_eq!(sense.asc, Asc::NotReadyToReadyChange);

        // The following TEST UNIT READY falls through to the device's own
        // not-ready handling, since the attention was already delivered.
        match c.dispatch(0, &tur_cdb, None) {
            ControllerOutcome::Status(s) => assert_eq!(s, status::CHECK_CONDITION),
            other => panic!("expected Status, got {other:?}"),
        }
        let sense = c.device_mut(0).unwrap().pending_sense.unwrap();
        assert_eq!(sense.sense_key, SenseKey::NotReady);
        assert_eq!(sense.asc, Asc::MediumNotPresent);
    }

    #[test]
    fn unit_attention_also_fails_other_commands_once() {
        let mut c = attached_controller();
        {
            let dev = c.device_mut(0).unwrap();
            dev.removable = true;
            dev.attn.set();
        }
        let inquiry_cdb = [OPCODE_INQUIRY, 0, 0, 0, 36, 0];
        match c.dispatch(0, &inquiry_cdb, None) {
            ControllerOutcome::Status(s) => assert_eq!(s, status::CHECK_CONDITION),
            other => panic!("expected Status, got {other:?}"),
        }
        // cleared after delivery: the next command proceeds normally
        match c.dispatch(0, &inquiry_cdb, None) {
            ControllerOutcome::DataIn(data) => assert_eq!(data[0], 0x00),
            other => panic!("expected DataIn, got {other:?}"),
        }
    }

    #[test]
    fn attach_requires_lun_zero_first() {
        let mut c = Controller::new(1);
        let dev = Device::new(DeviceType::DirectAccess, 1);
        assert!(c.attach(1, dev, Box::new(NullTarget)).is_err());
    }

    #[test]
    fn detach_lun_zero_blocked_while_others_present() {
        let mut c = attached_controller();
        let dev1 = Device::new(DeviceType::DirectAccess, 1);
        c.attach(1, dev1, Box::new(NullTarget)).unwrap();
        assert!(c.detach(0).is_err());
        c.detach(1).unwrap();
        assert!(c.detach(0).is_ok());
        assert!(c.is_empty());
    }

    #[test]
    fn report_luns_lists_all_present_luns_regardless_of_cdb_lun() {
        let mut c = attached_controller();
        let dev1 = Device::new(DeviceType::DirectAccess, 1);
        c.attach(1, dev1, Box::new(NullTarget)).unwrap();
        // CDB targets LUN 3 (unattached); REPORT LUNS still runs against LUN 0's list
        let cdb = [OPCODE_REPORT_LUNS, 0x60, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0];
        match c.dispatch(0, &cdb, None) {
            ControllerOutcome::DataIn(data) => {
                assert_eq!(crate::util::get_int32(&data, 0), 16);
            }
            other => panic!("expected DataIn, got {other:?}"),
        }
    }

    #[test]
    fn not_ready_device_dispatch_error_is_caught_and_recorded() {
        let mut c = attached_controller();
        c.device_mut(0).unwrap().ready = false;
        let cdb = [0x08, 0, 0, 0, 1, 0]; // READ(6), not registered by NullTarget's dispatch
        match c.dispatch(0, &cdb, None) {
            ControllerOutcome::Status(s) => assert_eq!(s, status::CHECK_CONDITION),
            other => panic!("expected Status, got {other:?}"),
        }
        let sense = c.device_mut(0).unwrap().pending_sense;
        assert_eq!(sense, Some(ScsiError::not_ready(Asc::MediumNotPresent)));
    }
}
