//! Whole-registry save states: every attached LUN's common envelope
//! (vendor/product identity, ready/locked/reservation state, pending
//! sense), postcard-encoded and zstd-compressed, matching the container
//! format `emulator/save.rs` uses for its own state files.
//!
//! Deliberately scoped, not a literal serialization of `Box<dyn ScsiTarget>`:
//! every concrete device type owns a non-serializable I/O handle (an open
//! image file, a bridge socket, a clock source), so a save state captures
//! only the part of a device that is pure data. Restoring one requires the
//! host to have already re-attached each device (reopening its image file,
//! if any); [`Registry::restore_devices`] then overwrites just the envelope
//! fields, leaving image content in place on disk where it was flushed to
//! before the snapshot was taken.

use std::io::{Read, Write};

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

use crate::registry::Registry;
use crate::types::{Lun, ScsiId};

const MAGIC: &[u8; 4] = b"PSST";
const VERSION: u16 = 1;

#[derive(Serialize, Deserialize)]
struct Snapshot {
    controllers: Vec<(ScsiId, Vec<(Lun, crate::device::Device)>)>,
}

/// Flushes every attached LUN's cache and writes a compressed snapshot of
/// registry-wide device envelope state to `writer`.
pub fn save_state_to<W: Write>(mut writer: W, registry: &Registry) -> Result<()> {
    writer.write_all(MAGIC)?;
    writer.write_all(&VERSION.to_le_bytes())?;

    let snapshot = Snapshot {
        controllers: registry.snapshot_devices(),
    };

    let compressor = zstd::stream::Encoder::new(writer, 0)?.auto_finish();
    postcard::to_io(&snapshot, compressor)?;
    Ok(())
}

/// Reads a snapshot written by [`save_state_to`] and restores it into
/// `registry`'s already-attached controllers/LUNs.
pub fn load_state_from<R: Read>(mut reader: R) -> Result<impl FnOnce(&Registry)> {
    let mut magic = [0u8; 4];
    reader.read_exact(&mut magic)?;
    if &magic != MAGIC {
        bail!("not a save state file");
    }
    let mut version = [0u8; 2];
    reader.read_exact(&mut version)?;
    if u16::from_le_bytes(version) != VERSION {
        bail!("unsupported save state version {}", u16::from_le_bytes(version));
    }

    let decompressor = zstd::stream::Decoder::new(reader)?;
    let mut buf = [0u8; 1024];
    let snapshot: Snapshot = postcard::from_io((decompressor, &mut buf))?.0;

    Ok(move |registry: &Registry| registry.restore_devices(snapshot.controllers))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{CommandResult, Device, DeviceType, ScsiTarget};
    use crate::error::ScsiError;

    struct NullTarget;
    impl ScsiTarget for NullTarget {
        fn dispatch(
            &mut self,
            _dev: &mut Device,
            _cdb: &[u8],
            _outdata: Option<&[u8]>,
        ) -> Result<CommandResult, ScsiError> {
            Ok(CommandResult::Status(0))
        }
    }

    #[test]
    fn round_trips_device_identity_through_a_save_state() {
        let registry = Registry::new();
        registry.ensure_controller(0).unwrap();
        registry.with_controller_mut(0, |c| {
            let mut dev = Device::new(DeviceType::DirectAccess, 0);
            dev.vendor = "ACME".to_string();
            dev.product = "DISK".to_string();
            dev.locked = true;
            c.attach(0, dev, Box::new(NullTarget)).unwrap();
        });

        let mut buf = Vec::new();
        save_state_to(&mut buf, &registry).unwrap();

        let registry2 = Registry::new();
        registry2.ensure_controller(0).unwrap();
        registry2.with_controller_mut(0, |c| {
            let dev = Device::new(DeviceType::DirectAccess, 0);
            c.attach(0, dev, Box::new(NullTarget)).unwrap();
        });

        let apply = load_state_from(buf.as_slice()).unwrap();
        apply(&registry2);

        registry2.with_controller_mut(0, |c| {
            assert_eq!(c.device_mut(0).unwrap().vendor, "ACME");
            assert!(c.device_mut(0).unwrap().locked);
        });
    }

    #[test]
    fn rejects_bad_magic() {
        let garbage = vec![0u8; 16];
        assert!(load_state_from(garbage.as_slice()).is_err());
    }
}
