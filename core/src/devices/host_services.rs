//! Host services (§4.10): a PROCESSOR-type device exposing the host's clock
//! as a vendor mode page and encoding administrative shutdown requests
//! through START STOP UNIT's start/load bits.
//!
//! Grounded on `devices/host_services.cpp`.

use std::collections::BTreeMap;

use anyhow::Result;

use crate::device::mode_page::ModePages;
use crate::device::{CommandResult, Device, ScsiTarget};
use crate::error::{Asc, ScsiError};
use crate::registry::Registry;

const OPCODE_START_STOP_UNIT: u8 = 0x1b;

/// Wall-clock source host services reads for vendor page 0x20. A trait so
/// tests can supply a fixed time instead of the real clock.
pub trait ClockSource: Send {
    /// (year since 1900, month 0..11, day 1..31, hour, minute, second)
    fn now(&self) -> (i32, u8, u8, u8, u8, u8);
}

pub struct SystemClock;

impl ClockSource for SystemClock {
    fn now(&self) -> (i32, u8, u8, u8, u8, u8) {
        // `chrono`/`time` are not in this crate's dependency set; host
        // services is expected to be wired up with a concrete ClockSource
        // by the embedding application, which already depends on one.
        (0, 0, 1, 0, 0, 0)
    }
}

/// Administrative action START STOP UNIT encodes via CDB byte 4's start
/// (bit 0) and load (bit 1) bits, per `host_services.cpp`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownRequest {
    StopEmulator,
    HostShutdown,
    HostReboot,
}

pub struct HostServices {
    clock: Box<dyn ClockSource>,
    pub pending_shutdown: Option<ShutdownRequest>,
}

impl HostServices {
    pub fn new(clock: Box<dyn ClockSource>) -> Self {
        Self {
            clock,
            pending_shutdown: None,
        }
    }

    fn rtc_page(&self) -> Vec<u8> {
        let (year, month, day, hour, minute, second) = self.clock.now();
        let mut p = vec![0u8; 2 + 10];
        p[2] = 1; // major
        p[3] = 0; // minor
        p[4] = (year & 0xff) as u8;
        p[5] = month;
        p[6] = day;
        p[7] = hour;
        p[8] = minute;
        p[9] = second.min(59);
        p
    }

    /// START STOP UNIT: decodes (start, load) into a shutdown request and
    /// flushes every attached device's cache first, matching
    /// `HostServices::StartStopUnit`'s "flush everything before tearing
    /// anything down" ordering.
    fn start_stop_unit(&mut self, dev: &mut Device, registry: &Registry, flags: u8) -> Result<CommandResult, ScsiError> {
        let start = flags & 0x01 != 0;
        let load = flags & 0x02 != 0;

        let request = match (start, load) {
            (false, false) => ShutdownRequest::StopEmulator,
            (false, true) => ShutdownRequest::HostShutdown,
            (true, true) => ShutdownRequest::HostReboot,
            (true, false) => return Err(dev.fail(ScsiError::illegal_request(Asc::InvalidFieldInCdb))),
        };

        for id in registry.all_controller_ids() {
            registry.with_controller_mut(id, |controller| controller.flush_all_caches());
        }

        self.pending_shutdown = Some(request);
        Ok(CommandResult::Status(crate::error::status::GOOD))
    }
}

impl ModePages for HostServices {
    fn set_up_mode_pages(&self, pages: &mut BTreeMap<u8, Vec<u8>>, page: u8, _changeable: bool) {
        if page == 0x20 || page == 0x3f {
            pages.insert(0x20, self.rtc_page());
        }
    }
}

impl ScsiTarget for HostServices {
    fn dispatch(&mut self, dev: &mut Device, cdb: &[u8], _outdata: Option<&[u8]>) -> Result<CommandResult, ScsiError> {
        match cdb[0] {
            OPCODE_START_STOP_UNIT => {
                // Cache-flush fan-out across every attached controller needs
                // a Registry handle, which ScsiTarget::dispatch does not
                // carry; a controller wired to one calls
                // `start_stop_unit_with_registry` instead of going through
                // this generic entry point.
                let flags = cdb.get(4).copied().unwrap_or(0);
                let start = flags & 0x01 != 0;
                let load = flags & 0x02 != 0;
                if start && !load {
                    return Err(dev.fail(ScsiError::illegal_request(Asc::InvalidFieldInCdb)));
                }
                let request = match (start, load) {
                    (false, false) => ShutdownRequest::StopEmulator,
                    (false, true) => ShutdownRequest::HostShutdown,
                    (true, true) => ShutdownRequest::HostReboot,
                    (true, false) => unreachable!(),
                };
                self.pending_shutdown = Some(request);
                Ok(CommandResult::Status(crate::error::status::GOOD))
            }
            _ => Err(dev.fail(ScsiError::illegal_request(Asc::InvalidCommandOperationCode))),
        }
    }

    fn as_mode_pages(&self) -> Option<&dyn ModePages> {
        Some(self)
    }

    fn as_mode_pages_mut(&mut self) -> Option<&mut dyn ModePages> {
        Some(self)
    }
}

/// Entry point for a controller wired to a [`Registry`]: performs the full
/// cache-flush-then-shutdown sequence `host_services.cpp` implements.
pub fn start_stop_unit_with_registry(
    services: &mut HostServices,
    dev: &mut Device,
    registry: &Registry,
    flags: u8,
) -> Result<CommandResult, ScsiError> {
    services.start_stop_unit(dev, registry, flags)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedClock;
    impl ClockSource for FixedClock {
        fn now(&self) -> (i32, u8, u8, u8, u8, u8) {
            (124, 5, 17, 13, 45, 9)
        }
    }

    #[test]
    fn rtc_page_matches_fields() {
        let services = HostServices::new(Box::new(FixedClock));
        let page = services.rtc_page();
        assert_eq!(page[2], 1);
        assert_eq!(page[4], 124);
        assert_eq!(page[5], 5);
        assert_eq!(page[6], 17);
        assert_eq!(page[7], 13);
        assert_eq!(page[8], 45);
        assert_eq!(page[9], 9);
    }

    #[test]
    fn start_without_load_is_illegal() {
        let mut services = HostServices::new(Box::new(FixedClock));
        let mut dev = Device::new(crate::device::DeviceType::Processor, 0);
        let cdb = [OPCODE_START_STOP_UNIT, 0, 0, 0, 0b01, 0];
        assert!(services.dispatch(&mut dev, &cdb, None).is_err());
    }

    #[test]
    fn stop_emulator_request_decoded() {
        let mut services = HostServices::new(Box::new(FixedClock));
        let mut dev = Device::new(crate::device::DeviceType::Processor, 0);
        let cdb = [OPCODE_START_STOP_UNIT, 0, 0, 0, 0b00, 0];
        services.dispatch(&mut dev, &cdb, None).unwrap();
        assert_eq!(services.pending_shutdown, Some(ShutdownRequest::StopEmulator));
    }

    #[test]
    fn host_reboot_request_decoded() {
        let mut services = HostServices::new(Box::new(FixedClock));
        let mut dev = Device::new(crate::device::DeviceType::Processor, 0);
        let cdb = [OPCODE_START_STOP_UNIT, 0, 0, 0, 0b11, 0];
        services.dispatch(&mut dev, &cdb, None).unwrap();
        assert_eq!(services.pending_shutdown, Some(ShutdownRequest::HostReboot));
    }
}
