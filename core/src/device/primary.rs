//! Mandatory command bodies shared by every device type: INQUIRY, REQUEST
//! SENSE, REPORT LUNS. Grounded on `devices/primary_device.cpp` in the
//! original implementation. The controller calls these directly rather
//! than dispatching to a `PrimaryDevice` base class, since every device in
//! this crate shares exactly this behavior for these three opcodes.

use crate::device::Device;
use crate::util::pad_ascii;

/// Standard INQUIRY data, 36 bytes (allocation length applied by the
/// caller via truncation).
pub fn handle_inquiry(dev: &Device) -> Vec<u8> {
    let mut buf = vec![0u8; 36];

    buf[0] = dev.device_type as u8 & 0x1f;
    if dev.removable {
        buf[1] = 0x80;
    }
    buf[2] = dev.scsi_level;
    buf[3] = dev.scsi_level.min(2);
    buf[4] = 0x1f; // additional length, N-4

    buf[8..16].copy_from_slice(&pad_ascii(&dev.vendor, 8));
    buf[16..32].copy_from_slice(&pad_ascii(&dev.product, 16));
    buf[32..36].copy_from_slice(&pad_ascii(&dev.revision, 4));

    buf
}

/// INQUIRY response for an unsupported LUN: byte 0 = 0x7F (peripheral
/// qualifier "logical unit not present", device type 0x1F).
pub fn handle_inquiry_unsupported_lun() -> Vec<u8> {
    let mut buf = vec![0u8; 36];
    buf[0] = 0x7f;
    buf[4] = 0x1f;
    buf
}

/// 18-byte fixed-format REQUEST SENSE. Consumes (clears) the device's
/// pending sense, matching `PrimaryDevice::RequestSense`'s `mem::take`-style
/// behavior in the teacher's CD-ROM target.
pub fn handle_request_sense(dev: &mut Device) -> Vec<u8> {
    match dev.pending_sense.take() {
        Some(err) => err.to_sense_data().to_vec(),
        None => {
            let mut buf = [0u8; 18];
            buf[0] = 0x70;
            buf[7] = 10;
            buf.to_vec()
        }
    }
}

/// REPORT LUNS, SELECT REPORT mode 0 only: 8-byte header (length, always
/// against LUN 0 regardless of the CDB's LUN field) followed by 8 bytes per
/// present LUN.
pub fn handle_report_luns(present_luns: &[u8]) -> Vec<u8> {
    let mut buf = vec![0u8; 8 + present_luns.len() * 8];
    crate::util::set_int32(&mut buf, 0, (present_luns.len() * 8) as u32);
    for (i, &lun) in present_luns.iter().enumerate() {
        buf[8 + i * 8 + 1] = lun;
    }
    buf
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceType;

    #[test]
    fn inquiry_matches_scenario_1() {
        let mut dev = Device::new(DeviceType::DirectAccess, 0);
        dev.vendor = "ACME".to_string();
        dev.product = "DISK".to_string();
        dev.revision = "1.0".to_string();

        let buf = handle_inquiry(&dev);
        assert_eq!(buf.len(), 36);
        assert_eq!(buf[0], 0x00);
        assert_eq!(buf[1], 0x00);
        assert_eq!(buf[4], 0x1f);
        assert_eq!(&buf[8..16], b"ACME    ");
        assert_eq!(&buf[16..32], b"DISK            ");
        assert_eq!(&buf[32..36], b"1.0 ");
    }

    #[test]
    fn report_luns_header_and_entries() {
        let buf = handle_report_luns(&[0, 1, 2]);
        assert_eq!(buf.len(), 8 + 24);
        assert_eq!(crate::util::get_int32(&buf, 0), 24);
        assert_eq!(buf[8 + 1], 0);
        assert_eq!(buf[16 + 1], 1);
        assert_eq!(buf[24 + 1], 2);
    }
}
