//! Magneto-optical drive (§4.8): the same block command set as a direct-
//! access disk, but with a fixed geometry table keyed by file size instead
//! of a header or flat default, and defect-management mode pages 0x06/0x20
//! carrying per-geometry spare/bands counts.
//!
//! Grounded on `devices/scsimo.cpp`.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::Result;

use crate::cache::DiskCache;
use crate::device::mode_page::{mode_sense6_with_descriptor, mode_sense10_with_descriptor, ModePages};
use crate::device::storage::BlockStorage;
use crate::device::{CommandResult, Device, ScsiTarget};
use crate::error::{Asc, ScsiError};
use crate::image::{FlatImage, ImageFile};
use crate::util::{get_int16, set_int32};

const OPCODE_READ6: u8 = 0x08;
const OPCODE_WRITE6: u8 = 0x0a;
const OPCODE_MODE_SELECT6: u8 = 0x15;
const OPCODE_MODE_SENSE6: u8 = 0x1a;
const OPCODE_START_STOP_UNIT: u8 = 0x1b;
const OPCODE_PREVENT_ALLOW: u8 = 0x1e;
const OPCODE_READ_CAPACITY10: u8 = 0x25;
const OPCODE_READ10: u8 = 0x28;
const OPCODE_WRITE10: u8 = 0x2a;
const OPCODE_VERIFY10: u8 = 0x2f;
const OPCODE_SYNCHRONIZE_CACHE10: u8 = 0x35;
const OPCODE_MODE_SELECT10: u8 = 0x55;
const OPCODE_MODE_SENSE10: u8 = 0x5a;

/// One row of the MO geometry table: the block size, total block count this
/// media size corresponds to, and its spare-area/band-count pair used in the
/// vendor defect-management mode pages. Matches `scsimo.cpp`'s
/// `geometry` table exactly, including the fourth ("not tested") row.
struct Geometry {
    sector_size: usize,
    block_count: u32,
    spare: u8,
    bands: u8,
}

const GEOMETRY_TABLE: [Geometry; 5] = [
    Geometry { sector_size: 512, block_count: 248_826, spare: 0x3c, bands: 0xb5 },
    Geometry { sector_size: 512, block_count: 446_325, spare: 0x82, bands: 0xb5 },
    Geometry { sector_size: 512, block_count: 1_041_500, spare: 0xc1, bands: 0xb5 },
    Geometry { sector_size: 512, block_count: 605_846, spare: 0x52, bands: 0xb5 }, // not tested
    Geometry { sector_size: 2048, block_count: 310_352, spare: 0x3c, bands: 0xb5 },
];

fn geometry_for_block_count(block_count: u32) -> &'static Geometry {
    GEOMETRY_TABLE
        .iter()
        .find(|g| g.block_count == block_count)
        .unwrap_or(&GEOMETRY_TABLE[0])
}

pub struct OpenedMo {
    pub target: MagnetoOptical,
    pub block_count: u32,
    pub sector_size: usize,
}

pub struct MagnetoOptical {
    image: Box<dyn ImageFile>,
    cache: DiskCache,
    sector_size: usize,
    block_count: u32,
    spare: u8,
    bands: u8,
}

impl MagnetoOptical {
    pub fn open(path: &Path) -> Result<OpenedMo> {
        let image = Box::new(FlatImage::open(path)?);
        let byte_len = image.byte_len() as u64;

        // Try each known geometry's implied size before falling back to a
        // flat 512-byte-sector assumption, as `scsimo.cpp` does by matching
        // file size against the table.
        let matched = GEOMETRY_TABLE
            .iter()
            .find(|g| u64::from(g.block_count) * g.sector_size as u64 == byte_len);

        let (sector_size, block_count, spare, bands) = match matched {
            Some(g) => (g.sector_size, g.block_count, g.spare, g.bands),
            None => {
                let block_count = (byte_len / 512) as u32;
                let g = geometry_for_block_count(block_count);
                (512, block_count, g.spare, g.bands)
            }
        };

        let cache = DiskCache::new(sector_size, 0, false, block_count);
        Ok(OpenedMo {
            target: MagnetoOptical {
                image,
                cache,
                sector_size,
                block_count,
                spare,
                bands,
            },
            block_count,
            sector_size,
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

    fn read_capacity(&self) -> Vec<u8> {
        let mut buf = vec![0u8; 8];
        set_int32(&mut buf, 0, self.block_count.saturating_sub(1));
        set_int32(&mut buf, 4, self.sector_size as u32);
        buf
    }
}

impl ModePages for MagnetoOptical {
    fn set_up_mode_pages(&self, pages: &mut BTreeMap<u8, Vec<u8>>, page: u8, _changeable: bool) {
        let all = page == 0x3f;
        if all || page == 0x06 {
            // Optical memory page: per-defect-list format plus the media's
            // spare-area/band-count pair, at offsets (3) and (8) the way
            // `scsimo.cpp::AddOptical` lays them out.
            let mut p = vec![0u8; 6];
            p[3] = self.spare;
            pages.insert(0x06, p);
        }
        if all || page == 0x20 {
            let mut p = vec![0u8; 4];
            p[2] = self.bands;
            pages.insert(0x20, p);
        }
    }
}

impl BlockStorage for MagnetoOptical {
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

impl ScsiTarget for MagnetoOptical {
    fn dispatch(&mut self, dev: &mut Device, cdb: &[u8], outdata: Option<&[u8]>) -> Result<CommandResult, ScsiError> {
        let opcode = cdb[0];
        match opcode {
            OPCODE_READ6 => {
                let (lba, count) = super::lba_count_6(cdb);
                self.do_read(dev, lba, count)
            }
            OPCODE_READ10 => {
                let (lba, count) = super::lba_count_10(cdb);
                self.do_read(dev, lba, count)
            }
            OPCODE_WRITE6 => {
                let (lba, count) = super::lba_count_6(cdb);
                self.write_dispatch(dev, lba, count, outdata)
            }
            OPCODE_WRITE10 => {
                let (lba, count) = super::lba_count_10(cdb);
                self.write_dispatch(dev, lba, count, outdata)
            }
            OPCODE_VERIFY10 => {
                let (lba, count) = super::lba_count_10(cdb);
                if !self.in_range(lba, count) {
                    return Err(dev.fail(ScsiError::illegal_request(Asc::LbaOutOfRange)));
                }
                Ok(CommandResult::Status(crate::error::status::GOOD))
            }
            OPCODE_SYNCHRONIZE_CACHE10 => {
                self.cache
                    .flush_all(self.image.as_mut())
                    .map_err(|_| dev.fail(ScsiError::medium_error(Asc::WriteFault)))?;
                Ok(CommandResult::Status(crate::error::status::GOOD))
            }
            OPCODE_READ_CAPACITY10 => Ok(CommandResult::DataIn(self.read_capacity())),
            OPCODE_START_STOP_UNIT => {
                let flags = cdb.get(4).copied().unwrap_or(0);
                if flags & 0x03 == 0x02 {
                    self.flush_cache();
                    dev.ready = false;
                    dev.removed = true;
                    dev.attn.set();
                } else {
                    dev.stopped = flags & 0x01 == 0;
                }
                Ok(CommandResult::Status(crate::error::status::GOOD))
            }
            OPCODE_PREVENT_ALLOW => {
                if dev.lockable {
                    dev.locked = cdb.get(4).is_some_and(|&b| b & 0x01 != 0);
                }
                Ok(CommandResult::Status(crate::error::status::GOOD))
            }
            OPCODE_MODE_SENSE6 => {
                let (page, changeable, dbd, alloc_len) = mode_sense_fields_6(cdb);
                Ok(CommandResult::DataIn(mode_sense6_with_descriptor(
                    dev, self, page, changeable, dbd, alloc_len, self.block_count, self.sector_size as u32,
                )))
            }
            OPCODE_MODE_SENSE10 => {
                let (page, changeable, dbd, alloc_len) = mode_sense_fields_10(cdb);
                Ok(CommandResult::DataIn(mode_sense10_with_descriptor(
                    dev, self, page, changeable, dbd, alloc_len, self.block_count, self.sector_size as u32,
                )))
            }
            OPCODE_MODE_SELECT6 | OPCODE_MODE_SELECT10 => {
                let ten_byte = opcode == OPCODE_MODE_SELECT10;
                let param_len = if ten_byte {
                    usize::from(get_int16(cdb, 7))
                } else {
                    usize::from(cdb.get(4).copied().unwrap_or(0))
                };
                match outdata {
                    None => Ok(CommandResult::DataOut(param_len)),
                    Some(_) => Ok(CommandResult::Status(crate::error::status::GOOD)),
                }
            }
            _ => Err(dev.fail(ScsiError::illegal_request(Asc::InvalidCommandOperationCode))),
        }
    }

    fn test_unit_ready(&mut self, dev: &mut Device) -> Result<(), ScsiError> {
        if dev.ready {
            Ok(())
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

impl MagnetoOptical {
    fn write_dispatch(&mut self, dev: &mut Device, lba: u32, count: u32, outdata: Option<&[u8]>) -> Result<CommandResult, ScsiError> {
        match outdata {
            None => {
                if dev.write_protected {
                    return Err(dev.fail(ScsiError::data_protect(Asc::WriteProtected)));
                }
                if !self.in_range(lba, count) {
                    return Err(dev.fail(ScsiError::illegal_request(Asc::LbaOutOfRange)));
                }
                Ok(CommandResult::DataOut(count as usize * self.sector_size))
            }
            Some(data) => {
                for (i, chunk) in data.chunks(self.sector_size).enumerate() {
                    self.cache
                        .write_sector(self.image.as_mut(), lba + i as u32, chunk)
                        .map_err(|_| dev.fail(ScsiError::medium_error(Asc::WriteFault)))?;
                }
                Ok(CommandResult::Status(crate::error::status::GOOD))
            }
        }
    }
}

fn mode_sense_fields_6(cdb: &[u8]) -> (u8, bool, bool, usize) {
    let dbd = cdb[1] & 0x08 != 0;
    let pc = (cdb[2] >> 6) & 0x03;
    (cdb[2] & 0x3f, pc == 1, dbd, usize::from(cdb[4]))
}

fn mode_sense_fields_10(cdb: &[u8]) -> (u8, bool, bool, usize) {
    let dbd = cdb[1] & 0x08 != 0;
    let pc = (cdb[2] >> 6) & 0x03;
    (cdb[2] & 0x3f, pc == 1, dbd, usize::from(get_int16(cdb, 7)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn temp_image(byte_len: u64) -> (tempfile::NamedTempFile, std::path::PathBuf) {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(&vec![0u8; byte_len as usize]).unwrap();
        f.flush().unwrap();
        let path = f.path().to_path_buf();
        (f, path)
    }

    #[test]
    fn matches_128mb_geometry_row() {
        let (_guard, path) = temp_image(248_826 * 512);
        let opened = MagnetoOptical::open(&path).unwrap();
        assert_eq!(opened.block_count, 248_826);
        assert_eq!(opened.sector_size, 512);
        assert_eq!(opened.target.spare, 0x3c);
        assert_eq!(opened.target.bands, 0xb5);
    }

    #[test]
    fn matches_640mb_geometry_row_with_2048_sectors() {
        let (_guard, path) = temp_image(310_352 * 2048);
        let opened = MagnetoOptical::open(&path).unwrap();
        assert_eq!(opened.sector_size, 2048);
        assert_eq!(opened.block_count, 310_352);
    }

    #[test]
    fn unmatched_size_falls_back_to_flat_512() {
        let (_guard, path) = temp_image(100 * 512);
        let opened = MagnetoOptical::open(&path).unwrap();
        assert_eq!(opened.sector_size, 512);
        assert_eq!(opened.block_count, 100);
    }

    #[test]
    fn write_then_read_round_trips() {
        let (_guard, path) = temp_image(64 * 512);
        let mut mo = MagnetoOptical::open(&path).unwrap().target;
        let mut dev = Device::new(crate::device::DeviceType::OpticalMemory, 0);
        dev.ready = true;

        let data = vec![0x77; 512 * 2];
        let cdb_write = [OPCODE_WRITE10, 0, 0, 0, 0, 5, 0, 0, 2, 0];
        mo.dispatch(&mut dev, &cdb_write, None).unwrap();
        mo.dispatch(&mut dev, &cdb_write, Some(&data)).unwrap();

        let cdb_read = [OPCODE_READ10, 0, 0, 0, 0, 5, 0, 0, 2, 0];
        match mo.dispatch(&mut dev, &cdb_read, None).unwrap() {
            CommandResult::DataIn(read_back) => assert_eq!(read_back, data),
            other => panic!("expected DataIn, got {other:?}"),
        }
    }
}
