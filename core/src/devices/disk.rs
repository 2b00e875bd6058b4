//! Direct-access disk (hard disk / removable hard disk): the block-read/write
//! command set of §4.5, grounded on `devices/disk.cpp` and
//! `devices/scsihd_nec.cpp` for the NEC PC-9801 identity override.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::Result;

use crate::cache::DiskCache;
use crate::device::mode_page::{mode_sense6_with_descriptor, mode_sense10_with_descriptor, ModePages};
use crate::device::storage::BlockStorage;
use crate::device::{CommandResult, Device, ScsiTarget};
use crate::error::{Asc, ScsiError};
use crate::image::{resolve_hd_geometry, FlatImage, ImageFile};
use crate::util::{get_int16, set_int16, set_int32};

const OPCODE_REZERO: u8 = 0x01;
const OPCODE_FORMAT_UNIT: u8 = 0x04;
const OPCODE_REASSIGN_BLOCKS: u8 = 0x07;
const OPCODE_READ6: u8 = 0x08;
const OPCODE_WRITE6: u8 = 0x0a;
const OPCODE_SEEK6: u8 = 0x0b;
const OPCODE_MODE_SELECT6: u8 = 0x15;
const OPCODE_MODE_SENSE6: u8 = 0x1a;
const OPCODE_START_STOP_UNIT: u8 = 0x1b;
const OPCODE_PREVENT_ALLOW: u8 = 0x1e;
const OPCODE_READ_CAPACITY10: u8 = 0x25;
const OPCODE_READ10: u8 = 0x28;
const OPCODE_WRITE10: u8 = 0x2a;
const OPCODE_SEEK10: u8 = 0x2b;
const OPCODE_VERIFY10: u8 = 0x2f;
const OPCODE_SYNCHRONIZE_CACHE10: u8 = 0x35;
const OPCODE_READ_DEFECT_DATA10: u8 = 0x37;
const OPCODE_READ_LONG10: u8 = 0x3e;
const OPCODE_WRITE_LONG10: u8 = 0x3f;
const OPCODE_MODE_SELECT10: u8 = 0x55;
const OPCODE_MODE_SENSE10: u8 = 0x5a;
const OPCODE_READ12: u8 = 0xa8;
const OPCODE_WRITE12: u8 = 0xaa;
const OPCODE_READ16: u8 = 0x88;
const OPCODE_WRITE16: u8 = 0x8a;
const OPCODE_VERIFY16: u8 = 0x8f;
const OPCODE_SYNCHRONIZE_CACHE16: u8 = 0x91;
const OPCODE_SERVICE_ACTION_IN16: u8 = 0x9e;
const OPCODE_SERVICE_ACTION_OUT16: u8 = 0x9f;
const SERVICE_ACTION_READ_CAPACITY16: u8 = 0x10;
const SERVICE_ACTION_READ_WRITE_LONG16: u8 = 0x11;

const SENSE_OK: Result<(), ScsiError> = Ok(());

/// Geometry synthesized for mode page 0x04, per §4.5: 8 heads x 25
/// sectors/track at 7200 RPM, regardless of the image's real layout (this
/// core does not model physical CHS addressing, only LBA).
const GEOMETRY_HEADS: u32 = 8;
const GEOMETRY_SECTORS_PER_TRACK: u32 = 25;
const GEOMETRY_RPM: u16 = 7200;

const APPLE_VENDOR_STRING: &[u8] = b"APPLE COMPUTER, INC   ";

pub struct OpenedDisk {
    pub target: DirectAccessDisk,
    pub block_count: u32,
    pub sector_size: usize,
    pub writable: bool,
}

/// A direct-access disk, backed by one flat (or headered-flat) image file
/// through the block cache (§4.6).
pub struct DirectAccessDisk {
    image: Box<dyn ImageFile>,
    cache: DiskCache,
    sector_size: usize,
    block_count: u32,
    data_offset: u64,
}

impl DirectAccessDisk {
    /// Opens `path`, resolving its geometry from the (lowercased) extension
    /// the way the factory would (§6a), and requesting `sector_size` only
    /// for layouts that don't carry their own (flat `.hds`/`.hda`/`.hd1`/
    /// `.hdr` images).
    pub fn open(path: &Path, ext: &str, sector_size: Option<usize>) -> Result<OpenedDisk> {
        let geometry = resolve_hd_geometry(path, ext, sector_size)?;
        let (_, writable) = crate::device::storage::validate_file(path)?;
        let image = Box::new(FlatImage::open(path)?);
        let cache = DiskCache::new(geometry.sector_size, geometry.data_offset, false, geometry.block_count);

        Ok(OpenedDisk {
            target: Self {
                image,
                cache,
                sector_size: geometry.sector_size,
                block_count: geometry.block_count,
                data_offset: geometry.data_offset,
            },
            block_count: geometry.block_count,
            sector_size: geometry.sector_size,
            writable,
        })
    }

    fn in_range(&self, lba: u32, count: u32) -> bool {
        count == 0 || (u64::from(lba) + u64::from(count) <= u64::from(self.block_count))
    }

    fn do_read(&mut self, dev: &mut Device, lba: u32, count: u32) -> Result<CommandResult, ScsiError> {
        if !self.in_range(lba, count) {
            return Err(dev.fail(ScsiError::illegal_request(Asc::LbaOutOfRange)));
        }
        if count == 0 {
            return Ok(CommandResult::Status(crate::error::status::GOOD));
        }
        let mut out = Vec::with_capacity(count as usize * self.sector_size);
        for i in 0..count {
            let sector = self
                .cache
                .read_sector(self.image.as_mut(), lba + i)
                .map_err(|_| dev.fail(ScsiError::medium_error(Asc::ReadFault)))?;
            out.extend_from_slice(&sector);
        }
        Ok(CommandResult::DataIn(out))
    }

    fn do_write_request(&self, dev: &mut Device, lba: u32, count: u32) -> Result<CommandResult, ScsiError> {
        if dev.write_protected {
            return Err(dev.fail(ScsiError::data_protect(Asc::WriteProtected)));
        }
        if !self.in_range(lba, count) {
            return Err(dev.fail(ScsiError::illegal_request(Asc::LbaOutOfRange)));
        }
        if count == 0 {
            return Ok(CommandResult::Status(crate::error::status::GOOD));
        }
        Ok(CommandResult::DataOut(count as usize * self.sector_size))
    }

    fn do_write_commit(&mut self, dev: &mut Device, lba: u32, count: u32, data: &[u8]) -> Result<CommandResult, ScsiError> {
        for i in 0..count {
            let start = i as usize * self.sector_size;
            let chunk = &data[start..start + self.sector_size];
            self.cache
                .write_sector(self.image.as_mut(), lba + i, chunk)
                .map_err(|_| dev.fail(ScsiError::medium_error(Asc::WriteFault)))?;
        }
        Ok(CommandResult::Status(crate::error::status::GOOD))
    }

    fn read_capacity(&self) -> Vec<u8> {
        let mut buf = vec![0u8; 8];
        let last_lba = self.block_count.saturating_sub(1);
        set_int32(&mut buf, 0, last_lba);
        set_int32(&mut buf, 4, self.sector_size as u32);
        buf
    }

    fn read_capacity16(&self) -> Vec<u8> {
        let mut buf = vec![0u8; 32];
        crate::util::set_int64(&mut buf, 0, u64::from(self.block_count.saturating_sub(1)));
        set_int32(&mut buf, 8, self.sector_size as u32);
        buf
    }
}

impl ModePages for DirectAccessDisk {
    fn set_up_mode_pages(&self, pages: &mut BTreeMap<u8, Vec<u8>>, page: u8, _changeable: bool) {
        let all = page == 0x3f;
        if all || page == 0x01 {
            pages.insert(0x01, vec![0u8; 12]);
        }
        if all || page == 0x03 {
            let mut p = vec![0u8; 24];
            set_int16(&mut p, 10, GEOMETRY_SECTORS_PER_TRACK as u16);
            set_int16(&mut p, 12, self.sector_size as u16);
            pages.insert(0x03, p);
        }
        if all || page == 0x04 {
            let mut p = vec![0u8; 24];
            let cylinders = self
                .block_count
                .div_ceil(GEOMETRY_HEADS * GEOMETRY_SECTORS_PER_TRACK);
            p[2] = (cylinders >> 16) as u8;
            p[3] = (cylinders >> 8) as u8;
            p[4] = cylinders as u8;
            p[5] = GEOMETRY_HEADS as u8;
            set_int16(&mut p, 20, GEOMETRY_RPM);
            pages.insert(0x04, p);
        }
        if all || page == 0x08 {
            pages.insert(0x08, vec![0, 0, 0, 0, 0xff, 0xff, 0, 0, 0xff, 0xff, 0xff, 0xff]);
        }
        if all || page == 0x30 {
            let mut p = vec![0u8; 2 + APPLE_VENDOR_STRING.len()];
            p[2..].copy_from_slice(APPLE_VENDOR_STRING);
            pages.insert(0x30, p);
        }
    }
}

impl BlockStorage for DirectAccessDisk {
    fn blocksize(&self) -> usize {
        self.sector_size
    }

    fn block_count(&self) -> u32 {
        self.block_count
    }

    fn image_path(&self) -> Option<&Path> {
        Some(self.image.path())
    }

    fn read_blocks(&mut self, lba: u32, count: u32) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(count as usize * self.sector_size);
        for i in 0..count {
            out.extend_from_slice(&self.cache.read_sector(self.image.as_mut(), lba + i)?);
        }
        Ok(out)
    }

    fn write_blocks(&mut self, lba: u32, data: &[u8]) -> Result<()> {
        for (i, chunk) in data.chunks(self.sector_size).enumerate() {
            self.cache.write_sector(self.image.as_mut(), lba + i as u32, chunk)?;
        }
        Ok(())
    }
}

impl ScsiTarget for DirectAccessDisk {
    fn dispatch(&mut self, dev: &mut Device, cdb: &[u8], outdata: Option<&[u8]>) -> Result<CommandResult, ScsiError> {
        let opcode = cdb[0];
        match opcode {
            OPCODE_REZERO | OPCODE_REASSIGN_BLOCKS | OPCODE_SEEK6 | OPCODE_SEEK10 => {
                let (lba, _count) = if cdb.len() <= 6 {
                    super::lba_count_6(cdb)
                } else {
                    super::lba_count_10(cdb)
                };
                if lba >= self.block_count {
                    return Err(dev.fail(ScsiError::illegal_request(Asc::LbaOutOfRange)));
                }
                Ok(CommandResult::Status(crate::error::status::GOOD))
            }
            OPCODE_FORMAT_UNIT => Ok(CommandResult::Status(crate::error::status::GOOD)),
            OPCODE_READ6 => {
                let (lba, count) = super::lba_count_6(cdb);
                self.do_read(dev, lba, count)
            }
            OPCODE_READ10 | OPCODE_READ12 => {
                let (lba, count) = if opcode == OPCODE_READ10 {
                    super::lba_count_10(cdb)
                } else {
                    super::lba_count_12(cdb)
                };
                self.do_read(dev, lba, count)
            }
            OPCODE_READ16 => {
                let (lba, count) = super::lba_count_16(cdb);
                self.do_read(dev, lba, count)
            }
            OPCODE_WRITE6 => {
                let (lba, count) = super::lba_count_6(cdb);
                self.write_dispatch(dev, lba, count, outdata)
            }
            OPCODE_WRITE10 | OPCODE_WRITE12 => {
                let (lba, count) = if opcode == OPCODE_WRITE10 {
                    super::lba_count_10(cdb)
                } else {
                    super::lba_count_12(cdb)
                };
                self.write_dispatch(dev, lba, count, outdata)
            }
            OPCODE_WRITE16 => {
                let (lba, count) = super::lba_count_16(cdb);
                self.write_dispatch(dev, lba, count, outdata)
            }
            OPCODE_VERIFY10 => {
                let (lba, count) = super::lba_count_10(cdb);
                if !self.in_range(lba, count) {
                    return Err(dev.fail(ScsiError::illegal_request(Asc::LbaOutOfRange)));
                }
                Ok(CommandResult::Status(crate::error::status::GOOD))
            }
            OPCODE_VERIFY16 => {
                let (lba, count) = super::lba_count_16(cdb);
                if !self.in_range(lba, count) {
                    return Err(dev.fail(ScsiError::illegal_request(Asc::LbaOutOfRange)));
                }
                Ok(CommandResult::Status(crate::error::status::GOOD))
            }
            OPCODE_SYNCHRONIZE_CACHE10 | OPCODE_SYNCHRONIZE_CACHE16 => {
                self.cache
                    .flush_all(self.image.as_mut())
                    .map_err(|_| dev.fail(ScsiError::medium_error(Asc::WriteFault)))?;
                Ok(CommandResult::Status(crate::error::status::GOOD))
            }
            OPCODE_READ_CAPACITY10 => Ok(CommandResult::DataIn(self.read_capacity())),
            OPCODE_SERVICE_ACTION_IN16 => self.service_action_in16(dev, cdb),
            OPCODE_SERVICE_ACTION_OUT16 => self.service_action_out16(dev, cdb),
            OPCODE_READ_DEFECT_DATA10 => {
                // No defects to report: a 4-byte header, zero defect list length.
                Ok(CommandResult::DataIn(vec![0u8; 4]))
            }
            OPCODE_READ_LONG10 | OPCODE_WRITE_LONG10 => {
                let len = usize::from(get_int16(cdb, 7));
                if len != 0 {
                    return Err(dev.fail(ScsiError::illegal_request(Asc::InvalidFieldInCdb)));
                }
                Ok(CommandResult::Status(crate::error::status::GOOD))
            }
            OPCODE_START_STOP_UNIT => self.start_stop_unit(dev, cdb),
            OPCODE_PREVENT_ALLOW => {
                if dev.lockable {
                    dev.locked = cdb.get(4).is_some_and(|&b| b & 0x01 != 0);
                }
                Ok(CommandResult::Status(crate::error::status::GOOD))
            }
            OPCODE_MODE_SENSE6 => {
                let (page, changeable, dbd, alloc_len) = mode_sense6_fields(cdb);
                let out = mode_sense6_with_descriptor(dev, self, page, changeable, dbd, alloc_len, self.block_count, self.sector_size as u32);
                Ok(CommandResult::DataIn(out))
            }
            OPCODE_MODE_SENSE10 => {
                let (page, changeable, dbd, alloc_len) = mode_sense10_fields(cdb);
                let out = mode_sense10_with_descriptor(dev, self, page, changeable, dbd, alloc_len, self.block_count, self.sector_size as u32);
                Ok(CommandResult::DataIn(out))
            }
            OPCODE_MODE_SELECT6 | OPCODE_MODE_SELECT10 => self.mode_select(dev, cdb, outdata),
            _ => Err(dev.fail(ScsiError::illegal_request(Asc::InvalidCommandOperationCode))),
        }
    }

    fn test_unit_ready(&mut self, dev: &mut Device) -> Result<(), ScsiError> {
        if dev.ready {
            SENSE_OK
        } else {
            Err(dev.fail(ScsiError::not_ready(Asc::MediumNotPresent)))
        }
    }

    fn flush_cache(&mut self) {
        let _ = self.cache.flush_all(self.image.as_mut());
    }

    fn as_mode_pages(&self) -> Option<&dyn ModePages> {
        Some(self)
    }

    fn as_mode_pages_mut(&mut self) -> Option<&mut dyn ModePages> {
        Some(self)
    }

    fn as_block_storage(&self) -> Option<&dyn BlockStorage> {
        Some(self)
    }

    fn as_block_storage_mut(&mut self) -> Option<&mut dyn BlockStorage> {
        Some(self)
    }
}

impl DirectAccessDisk {
    fn write_dispatch(&mut self, dev: &mut Device, lba: u32, count: u32, outdata: Option<&[u8]>) -> Result<CommandResult, ScsiError> {
        match outdata {
            None => self.do_write_request(dev, lba, count),
            Some(data) => self.do_write_commit(dev, lba, count, data),
        }
    }

    fn service_action_in16(&self, dev: &mut Device, cdb: &[u8]) -> Result<CommandResult, ScsiError> {
        match cdb[1] & 0x1f {
            SERVICE_ACTION_READ_CAPACITY16 => Ok(CommandResult::DataIn(self.read_capacity16())),
            SERVICE_ACTION_READ_WRITE_LONG16 => {
                let len = crate::util::get_int32(cdb, 10);
                if len != 0 {
                    return Err(dev.fail(ScsiError::illegal_request(Asc::InvalidFieldInCdb)));
                }
                Ok(CommandResult::Status(crate::error::status::GOOD))
            }
            _ => Err(dev.fail(ScsiError::illegal_request(Asc::InvalidFieldInCdb))),
        }
    }

    fn service_action_out16(&self, dev: &mut Device, cdb: &[u8]) -> Result<CommandResult, ScsiError> {
        if cdb[1] & 0x1f != SERVICE_ACTION_READ_WRITE_LONG16 {
            return Err(dev.fail(ScsiError::illegal_request(Asc::InvalidFieldInCdb)));
        }
        let len = crate::util::get_int32(cdb, 10);
        if len != 0 {
            return Err(dev.fail(ScsiError::illegal_request(Asc::InvalidFieldInCdb)));
        }
        Ok(CommandResult::Status(crate::error::status::GOOD))
    }

    /// START STOP UNIT: bit 0 of byte 4 is Start, bit 1 is LoEj. On a
    /// removable device, Start=0/LoEj=1 ejects (sets the medium-changed
    /// attention the controller delivers on the next access).
    fn start_stop_unit(&mut self, dev: &mut Device, cdb: &[u8]) -> Result<CommandResult, ScsiError> {
        if !dev.stoppable {
            return Ok(CommandResult::Status(crate::error::status::GOOD));
        }
        let flags = cdb.get(4).copied().unwrap_or(0);
        let start = flags & 0x01 != 0;
        let load_eject = flags & 0x02 != 0;

        if load_eject && !start {
            if dev.removable {
                self.flush_cache();
                dev.ready = false;
                dev.removed = true;
                dev.attn.set();
            }
        } else {
            dev.stopped = !start;
            if start && dev.removable {
                dev.ready = true;
                dev.removed = false;
            }
        }
        Ok(CommandResult::Status(crate::error::status::GOOD))
    }

    fn mode_select(&mut self, dev: &mut Device, cdb: &[u8], outdata: Option<&[u8]>) -> Result<CommandResult, ScsiError> {
        let ten_byte = cdb[0] == OPCODE_MODE_SELECT10;
        let param_len = if ten_byte {
            usize::from(get_int16(cdb, 7))
        } else {
            usize::from(cdb.get(4).copied().unwrap_or(0))
        };
        match outdata {
            None => Ok(CommandResult::DataOut(param_len)),
            Some(data) => {
                let header_len = if ten_byte { 8 } else { 4 };
                let block_desc_len = if data.len() > header_len { data[header_len.saturating_sub(2)] as usize } else { 0 };
                let _ = block_desc_len; // geometry changes via MODE SELECT are not supported (§4.5)
                if data.first().copied().unwrap_or(0) & 0x80 != 0 {
                    return Err(dev.fail(ScsiError::illegal_request(Asc::SavingParametersNotSupported)));
                }
                Ok(CommandResult::Status(crate::error::status::GOOD))
            }
        }
    }
}

fn mode_sense6_fields(cdb: &[u8]) -> (u8, bool, bool, usize) {
    let dbd = cdb[1] & 0x08 != 0;
    let pc = (cdb[2] >> 6) & 0x03;
    let page = cdb[2] & 0x3f;
    let alloc_len = usize::from(cdb[4]);
    (page, pc == 1, dbd, alloc_len)
}

fn mode_sense10_fields(cdb: &[u8]) -> (u8, bool, bool, usize) {
    let dbd = cdb[1] & 0x08 != 0;
    let pc = (cdb[2] >> 6) & 0x03;
    let page = cdb[2] & 0x3f;
    let alloc_len = usize::from(get_int16(cdb, 7));
    (page, pc == 1, dbd, alloc_len)
}

/// Default identity/geometry overrides the factory applies for the NEC
/// PC-9801 variant (`scsihd_nec.cpp`): same command set as the generic disk,
/// just a different default vendor/product string. The geometry page
/// (0x04) still synthesizes from `block_count`, matching the generic path;
/// only identity is NEC-specific, per §4.5a's "thin wrapper" note.
pub const NEC_VENDOR: &str = "PiSCSI";
pub const NEC_PRODUCT: &str = "PiSCSI HD (NEC)";

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn temp_image(blocks: u32, sector_size: usize) -> (tempfile::NamedTempFile, PathBuf) {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(&vec![0u8; blocks as usize * sector_size]).unwrap();
        f.flush().unwrap();
        let path = f.path().to_path_buf();
        (f, path)
    }

    #[test]
    fn read_capacity_matches_scenario_2() {
        let (_guard, path) = temp_image(2048, 512); // 1 MiB / 512
        let opened = DirectAccessDisk::open(&path, "hds", Some(512)).unwrap();
        let mut disk = opened.target;
        let buf = disk.read_capacity();
        assert_eq!(buf, vec![0x00, 0x00, 0x07, 0xff, 0x00, 0x00, 0x02, 0x00]);
    }

    #[test]
    fn write_then_read_round_trips() {
        let (_guard, path) = temp_image(64, 512);
        let opened = DirectAccessDisk::open(&path, "hds", Some(512)).unwrap();
        let mut disk = opened.target;
        let mut dev = Device::new(crate::device::DeviceType::DirectAccess, 0);
        dev.ready = true;

        let data = vec![0x5a; 512 * 3];
        let cdb_write = [OPCODE_WRITE10, 0, 0, 0, 0, 10, 0, 0, 3, 0];
        match disk.dispatch(&mut dev, &cdb_write, None).unwrap() {
            CommandResult::DataOut(len) => assert_eq!(len, data.len()),
            other => panic!("expected DataOut, got {other:?}"),
        }
        disk.dispatch(&mut dev, &cdb_write, Some(&data)).unwrap();

        let cdb_read = [OPCODE_READ10, 0, 0, 0, 0, 10, 0, 0, 3, 0];
        match disk.dispatch(&mut dev, &cdb_read, None).unwrap() {
            CommandResult::DataIn(read_back) => assert_eq!(read_back, data),
            other => panic!("expected DataIn, got {other:?}"),
        }
    }

    #[test]
    fn write_rejected_when_protected() {
        let (_guard, path) = temp_image(64, 512);
        let opened = DirectAccessDisk::open(&path, "hds", Some(512)).unwrap();
        let mut disk = opened.target;
        let mut dev = Device::new(crate::device::DeviceType::DirectAccess, 0);
        dev.ready = true;
        dev.write_protected = true;

        let cdb = [OPCODE_WRITE10, 0, 0, 0, 0, 1, 0, 0, 1, 0];
        assert!(disk.dispatch(&mut dev, &cdb, None).is_err());
    }

    #[test]
    fn out_of_range_read_is_rejected() {
        let (_guard, path) = temp_image(10, 512);
        let opened = DirectAccessDisk::open(&path, "hds", Some(512)).unwrap();
        let mut disk = opened.target;
        let mut dev = Device::new(crate::device::DeviceType::DirectAccess, 0);
        dev.ready = true;

        let cdb = [OPCODE_READ10, 0, 0, 0, 0, 9, 0, 0, 5, 0]; // 9+5 > 10
        let err = disk.dispatch(&mut dev, &cdb, None).unwrap_err();
        assert_eq!(err.asc, Asc::LbaOutOfRange);
    }

    #[test]
    fn read6_zero_count_means_256_blocks() {
        let (_guard, path) = temp_image(300, 512);
        let opened = DirectAccessDisk::open(&path, "hds", Some(512)).unwrap();
        let mut disk = opened.target;
        let mut dev = Device::new(crate::device::DeviceType::DirectAccess, 0);
        dev.ready = true;

        let cdb = [OPCODE_READ6, 0, 0, 0, 0, 0];
        match disk.dispatch(&mut dev, &cdb, None).unwrap() {
            CommandResult::DataIn(data) => assert_eq!(data.len(), 256 * 512),
            other => panic!("expected DataIn, got {other:?}"),
        }
    }

    #[test]
    fn read_long_rejects_nonzero_length() {
        let (_guard, path) = temp_image(10, 512);
        let opened = DirectAccessDisk::open(&path, "hds", Some(512)).unwrap();
        let mut disk = opened.target;
        let mut dev = Device::new(crate::device::DeviceType::DirectAccess, 0);
        dev.ready = true;

        let cdb = [OPCODE_READ_LONG10, 0, 0, 0, 0, 0, 0, 0, 1, 0];
        let err = disk.dispatch(&mut dev, &cdb, None).unwrap_err();
        assert_eq!(err.asc, Asc::InvalidFieldInCdb);
    }
}
