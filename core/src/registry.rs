//! Process-wide shared state, made explicit.
//!
//! The original implementation keeps a static `reserved_files` map inside
//! `StorageDevice` and a static controller table inside `ControllerManager`.
//! Per the redesign notes this crate follows, both become fields of one
//! `Registry` value, constructed once by the host and passed to every
//! component that needs it — no implicit globals, no `static` with interior
//! mutability.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::controller::Controller;
use crate::error::RegistryError;
use crate::types::{Lun, ScsiId, MAX_SCSI_IDS};

/// Reserved image filename -> the (id, lun) of the device it's bound to.
type ReservedFiles = HashMap<String, (ScsiId, Lun)>;

struct Inner {
    controllers: [Option<Controller>; MAX_SCSI_IDS],
    reserved_files: ReservedFiles,
    reserved_ids: Vec<ScsiId>,
}

/// Process-wide state shared between the bus thread and a management thread.
/// All mutation goes through methods on this type, which take the internal
/// mutex for the duration of the call, matching the "serializes onto the bus
/// thread via a mutex taken for the duration of any mutating operation"
/// concurrency model.
#[derive(Clone)]
pub struct Registry {
    inner: Arc<Mutex<Inner>>,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                controllers: Default::default(),
                reserved_files: HashMap::new(),
                reserved_ids: Vec::new(),
            })),
        }
    }

    /// Reserves a set of SCSI IDs so no device may be attached there. Used
    /// by a host-adapter front-end that occupies a fixed ID.
    pub fn reserve_ids(&self, ids: &[ScsiId]) {
        let mut inner = self.inner.lock().unwrap();
        inner.reserved_ids = ids.to_vec();
    }

    pub fn is_id_reserved(&self, id: ScsiId) -> bool {
        self.inner.lock().unwrap().reserved_ids.contains(&id)
    }

    /// Reserves `filename` for `(id, lun)`. Enforces the invariant that no
    /// two attached storage devices may reference the same image file.
    pub fn reserve_file(&self, filename: &str, id: ScsiId, lun: Lun) -> Result<(), RegistryError> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(&(existing_id, existing_lun)) = inner.reserved_files.get(filename) {
            if (existing_id, existing_lun) != (id, lun) {
                return Err(RegistryError::FileAlreadyReserved(filename.to_string()));
            }
            return Ok(());
        }
        inner
            .reserved_files
            .insert(filename.to_string(), (id, lun));
        Ok(())
    }

    pub fn unreserve_file(&self, filename: &str) {
        self.inner.lock().unwrap().reserved_files.remove(filename);
    }

    /// Releases every file reservation held by `(id, lun)`, used on detach.
    pub fn unreserve_all_for(&self, id: ScsiId, lun: Lun) {
        let mut inner = self.inner.lock().unwrap();
        inner
            .reserved_files
            .retain(|_, &mut (rid, rlun)| (rid, rlun) != (id, lun));
    }

    pub fn file_exists(&self, filename: &str) -> bool {
        self.inner.lock().unwrap().reserved_files.contains_key(filename)
    }

    /// Runs `f` with mutable access to the controller at `id`, if any.
    pub fn with_controller_mut<R>(&self, id: ScsiId, f: impl FnOnce(&mut Controller) -> R) -> Option<R> {
        let mut inner = self.inner.lock().unwrap();
        inner.controllers[id as usize].as_mut().map(f)
    }

    /// Runs `f` with shared access to the controller at `id`, if any.
    pub fn with_controller<R>(&self, id: ScsiId, f: impl FnOnce(&Controller) -> R) -> Option<R> {
        let inner = self.inner.lock().unwrap();
        inner.controllers[id as usize].as_ref().map(f)
    }

    /// Attaches a fresh, empty controller at `id` if none exists yet.
    pub fn ensure_controller(&self, id: ScsiId) -> Result<(), RegistryError> {
        if self.is_id_reserved(id) {
            return Err(RegistryError::IdReserved(id));
        }
        let mut inner = self.inner.lock().unwrap();
        if inner.controllers[id as usize].is_none() {
            inner.controllers[id as usize] = Some(Controller::new(id));
        }
        Ok(())
    }

    /// Destroys the controller at `id` if it no longer has any LUNs.
    pub fn drop_empty_controller(&self, id: ScsiId) {
        let mut inner = self.inner.lock().unwrap();
        let empty = inner.controllers[id as usize]
            .as_ref()
            .is_some_and(Controller::is_empty);
        if empty {
            inner.controllers[id as usize] = None;
        }
    }

    pub fn all_controller_ids(&self) -> Vec<ScsiId> {
        let inner = self.inner.lock().unwrap();
        (0..MAX_SCSI_IDS as ScsiId)
            .filter(|&id| inner.controllers[id as usize].is_some())
            .collect()
    }

    /// Flushes every attached LUN's cache, then snapshots its envelope
    /// state, across every controller. Used by [`crate::savestate`].
    pub fn snapshot_devices(&self) -> Vec<(ScsiId, Vec<(Lun, crate::device::Device)>)> {
        let mut inner = self.inner.lock().unwrap();
        inner
            .controllers
            .iter_mut()
            .enumerate()
            .filter_map(|(id, slot)| {
                let controller = slot.as_mut()?;
                controller.flush_all_caches();
                Some((id as ScsiId, controller.device_snapshot()))
            })
            .collect()
    }

    /// Restores envelope state captured by [`Self::snapshot_devices`] into
    /// whatever controllers/LUNs are currently attached.
    pub fn restore_devices(&self, snapshot: Vec<(ScsiId, Vec<(Lun, crate::device::Device)>)>) {
        let mut inner = self.inner.lock().unwrap();
        for (id, luns) in snapshot {
            if let Some(controller) = inner.controllers[id as usize].as_mut() {
                controller.restore_devices(luns);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_reservation_conflict() {
        let reg = Registry::new();
        reg.reserve_file("disk.hds", 0, 0).unwrap();
        assert!(reg.reserve_file("disk.hds", 1, 0).is_err());
        reg.unreserve_file("disk.hds");
        assert!(reg.reserve_file("disk.hds", 1, 0).is_ok());
    }

    #[test]
    fn reserved_ids_block_attach() {
        let reg = Registry::new();
        reg.reserve_ids(&[7]);
        assert!(reg.is_id_reserved(7));
        assert!(matches!(
            reg.ensure_controller(7),
            Err(RegistryError::IdReserved(7))
        ));
        assert!(reg.ensure_controller(3).is_ok());
    }
}
