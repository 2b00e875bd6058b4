//! Small shared value types used throughout the device and controller layers.

/// A self-clearing latch for one-shot events (unit attention, media eject).
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct LatchingEvent {
    val: bool,
}

impl LatchingEvent {
    /// Returns the current value and clears the event.
    pub fn get_clear(&mut self) -> bool {
        let v = self.val;
        self.val = false;
        v
    }

    /// Sets the event.
    pub fn set(&mut self) {
        self.val = true;
    }
}

/// SCSI ID, 0..=7.
pub type ScsiId = u8;

/// Logical unit number, 0..=31 within a target ID.
pub type Lun = u8;

pub const MAX_SCSI_IDS: usize = 8;
pub const MAX_LUNS: usize = 32;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn latching_event_roundtrip() {
        let mut ev = LatchingEvent::default();
        assert!(!ev.get_clear());
        ev.set();
        assert!(ev.get_clear());
        assert!(!ev.get_clear());
    }
}
