//! Sequential-access tape (§4.9): a single backing file addressed by byte
//! offset rather than LBA. Filemark handling intentionally reproduces the
//! original's known gap (see `handle_space`) rather than inventing a fix.

use std::path::Path;

use anyhow::Result;

use crate::device::storage::BlockStorage;
use crate::device::{CommandResult, Device, ScsiTarget};
use crate::error::{Asc, ScsiError, SenseKey};
use crate::image::{FlatImage, ImageFile};
use crate::util::set_int32;

const OPCODE_REWIND: u8 = 0x01;
const OPCODE_READ_BLOCK_LIMITS: u8 = 0x05;
const OPCODE_READ6: u8 = 0x08;
const OPCODE_WRITE_FILEMARKS: u8 = 0x10;
const OPCODE_SPACE: u8 = 0x11;
const OPCODE_VERIFY6: u8 = 0x13;
const OPCODE_WRITE6: u8 = 0x0a;
const OPCODE_ERASE: u8 = 0x19;
const OPCODE_LOAD_UNLOAD: u8 = 0x1b;
const OPCODE_READ_POSITION: u8 = 0x34;

const MAX_BLOCK_LEN: u32 = 0x00ff_ffff;
const MIN_BLOCK_LEN: u16 = 1;

const LOAD_BIT: u8 = 0x01;
const EOT_BIT: u8 = 0x02;

pub struct OpenedTape {
    pub target: Tape,
}

/// Default fixed block length tape commands use when the CDB requests the
/// device's "current" block length (fixed-block mode only; this core does
/// not support variable-length tape records).
pub const DEFAULT_BLOCK_LEN: usize = 512;

pub struct Tape {
    image: Box<dyn ImageFile>,
    position: u64,
    block_len: usize,
    filemark_count: u64,
}

impl Tape {
    pub fn open(path: &Path, block_len: Option<usize>) -> Result<OpenedTape> {
        let image = Box::new(FlatImage::open(path)?);
        Ok(OpenedTape {
            target: Tape {
                image,
                position: 0,
                block_len: block_len.unwrap_or(DEFAULT_BLOCK_LEN),
                filemark_count: 0,
            },
        })
    }

    fn byte_len(&self) -> u64 {
        self.image.byte_len() as u64
    }

    fn handle_read(&mut self, dev: &mut Device, count: u32) -> Result<CommandResult, ScsiError> {
        let len = count as u64 * self.block_len as u64;
        let end = (self.position + len).min(self.byte_len());
        let avail = end.saturating_sub(self.position);
        if avail == 0 {
            return Err(dev.fail(ScsiError::new(SenseKey::BlankCheck, Asc::NoAdditionalSenseInformation)));
        }
        let data = self.image.read_at(self.position as usize, avail as usize);
        self.position = end;
        Ok(CommandResult::DataIn(data))
    }

    fn handle_write(&mut self, dev: &mut Device, data: &[u8]) -> Result<CommandResult, ScsiError> {
        if dev.write_protected {
            return Err(dev.fail(ScsiError::data_protect(Asc::WriteProtected)));
        }
        let needed = self.position as usize + data.len();
        if needed > self.image.byte_len() {
            return Err(dev.fail(ScsiError::medium_error(Asc::WriteFault)));
        }
        self.image.write_at(self.position as usize, data);
        self.position += data.len() as u64;
        Ok(CommandResult::Status(crate::error::status::GOOD))
    }

    /// SPACE(6): per Open Question #1, only code 0 (space by block count)
    /// performs a real position change; codes 1..5 (filemark-relative
    /// forms) return BLANK CHECK unconditionally, matching the original's
    /// incomplete filemark support bit-for-bit.
    fn handle_space(&mut self, dev: &mut Device, code: u8, count: i32) -> Result<CommandResult, ScsiError> {
        match code {
            0 => {
                let step = i64::from(count) * self.block_len as i64;
                let new_pos = self.position as i64 + step;
                self.position = new_pos.clamp(0, self.byte_len() as i64) as u64;
                Ok(CommandResult::Status(crate::error::status::GOOD))
            }
            1..=5 => Err(dev.fail(ScsiError::new(SenseKey::BlankCheck, Asc::NoAdditionalSenseInformation))),
            _ => Err(dev.fail(ScsiError::illegal_request(Asc::InvalidFieldInCdb))),
        }
    }

    fn read_position(&self) -> Vec<u8> {
        let lba = (self.position / self.block_len as u64) as u32;
        let mut buf = vec![0u8; 20];
        if self.position == 0 {
            buf[0] |= 0x80; // BOP
        }
        if self.position >= self.byte_len() {
            buf[0] |= 0x40; // EOP
        }
        set_int32(&mut buf, 4, lba);
        set_int32(&mut buf, 8, lba);
        buf
    }

    fn load_unload(&mut self, dev: &mut Device, flags: u8) -> Result<CommandResult, ScsiError> {
        let load = flags & LOAD_BIT != 0;
        let eot = flags & EOT_BIT != 0;
        if load && eot {
            return Err(dev.fail(ScsiError::illegal_request(Asc::InvalidFieldInCdb)));
        }
        if load {
            self.position = 0;
        } else if eot {
            self.position = self.byte_len();
        }
        Ok(CommandResult::Status(crate::error::status::GOOD))
    }
}

impl BlockStorage for Tape {
    fn blocksize(&self) -> usize {
        self.block_len
    }

    fn block_count(&self) -> u32 {
        (self.byte_len() / self.block_len as u64) as u32
    }

    fn image_path(&self) -> Option<&Path> {
        Some(self.image.path())
    }

    fn read_blocks(&mut self, lba: u32, count: u32) -> Result<Vec<u8>> {
        let offset = lba as usize * self.block_len;
        Ok(self.image.read_at(offset, count as usize * self.block_len))
    }

    fn write_blocks(&mut self, lba: u32, data: &[u8]) -> Result<()> {
        self.image.write_at(lba as usize * self.block_len, data);
        Ok(())
    }
}

impl ScsiTarget for Tape {
    fn dispatch(&mut self, dev: &mut Device, cdb: &[u8], outdata: Option<&[u8]>) -> Result<CommandResult, ScsiError> {
        match cdb[0] {
            OPCODE_REWIND => {
                self.position = 0;
                Ok(CommandResult::Status(crate::error::status::GOOD))
            }
            OPCODE_READ_BLOCK_LIMITS => {
                let mut buf = vec![0u8; 6];
                buf[1] = (MAX_BLOCK_LEN >> 16) as u8;
                buf[2] = (MAX_BLOCK_LEN >> 8) as u8;
                buf[3] = MAX_BLOCK_LEN as u8;
                buf[4] = (MIN_BLOCK_LEN >> 8) as u8;
                buf[5] = MIN_BLOCK_LEN as u8;
                Ok(CommandResult::DataIn(buf))
            }
            OPCODE_READ6 => {
                let count = crate::util::get_int24(cdb, 2);
                self.handle_read(dev, count)
            }
            OPCODE_WRITE6 => {
                let count = crate::util::get_int24(cdb, 2);
                let len = count as usize * self.block_len;
                match outdata {
                    None => Ok(CommandResult::DataOut(len)),
                    Some(data) => self.handle_write(dev, data),
                }
            }
            OPCODE_WRITE_FILEMARKS => {
                let count = u64::from(crate::util::get_int24(cdb, 2));
                self.filemark_count += count;
                Ok(CommandResult::Status(crate::error::status::GOOD))
            }
            OPCODE_SPACE => {
                let code = cdb[1] & 0x07;
                let raw = crate::util::get_int24(cdb, 2);
                // sign-extend the 24-bit two's complement count
                let count = if raw & 0x0080_0000 != 0 {
                    (raw | 0xff00_0000) as i32
                } else {
                    raw as i32
                };
                self.handle_space(dev, code, count)
            }
            OPCODE_VERIFY6 => Ok(CommandResult::Status(crate::error::status::GOOD)),
            OPCODE_ERASE => {
                let pos = self.position as usize;
                let len = self.image.byte_len() - pos;
                if len > 0 {
                    self.image.write_at(pos, &vec![0u8; len]);
                }
                Ok(CommandResult::Status(crate::error::status::GOOD))
            }
            OPCODE_LOAD_UNLOAD => {
                let flags = cdb.get(4).copied().unwrap_or(0);
                self.load_unload(dev, flags)
            }
            OPCODE_READ_POSITION => Ok(CommandResult::DataIn(self.read_position())),
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

    fn as_block_storage(&self) -> Option<&dyn BlockStorage> {
        Some(self)
    }

    fn as_block_storage_mut(&mut self) -> Option<&mut dyn BlockStorage> {
        Some(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn temp_tape(byte_len: usize) -> (tempfile::NamedTempFile, std::path::PathBuf) {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(&vec![0u8; byte_len]).unwrap();
        f.flush().unwrap();
        let path = f.path().to_path_buf();
        (f, path)
    }

    #[test]
    fn space_by_block_count_moves_position() {
        let (_guard, path) = temp_tape(4096);
        let mut tape = Tape::open(&path, Some(512)).unwrap().target;
        let mut dev = Device::new(crate::device::DeviceType::DirectAccess, 0);
        dev.ready = true;

        let cdb = [OPCODE_SPACE, 0x00, 0x00, 0x00, 0x02, 0]; // code 0, count 2
        tape.dispatch(&mut dev, &cdb, None).unwrap();
        assert_eq!(tape.position, 1024);
    }

    #[test]
    fn space_by_filemark_codes_return_blank_check() {
        let (_guard, path) = temp_tape(4096);
        let mut tape = Tape::open(&path, Some(512)).unwrap().target;
        let mut dev = Device::new(crate::device::DeviceType::DirectAccess, 0);

        for code in 1..=5u8 {
            let cdb = [OPCODE_SPACE, code, 0x00, 0x00, 0x01, 0];
            let err = tape.dispatch(&mut dev, &cdb, None).unwrap_err();
            assert_eq!(err.sense_key, SenseKey::BlankCheck);
        }
    }

    #[test]
    fn write_filemarks_does_not_move_position() {
        let (_guard, path) = temp_tape(4096);
        let mut tape = Tape::open(&path, Some(512)).unwrap().target;
        let mut dev = Device::new(crate::device::DeviceType::DirectAccess, 0);

        let cdb = [OPCODE_WRITE_FILEMARKS, 0, 0x00, 0x00, 0x03, 0];
        tape.dispatch(&mut dev, &cdb, None).unwrap();
        assert_eq!(tape.filemark_count, 3);
        assert_eq!(tape.position, 0);
    }

    #[test]
    fn read_position_reports_bop_at_start() {
        let (_guard, path) = temp_tape(4096);
        let tape = Tape::open(&path, Some(512)).unwrap().target;
        let buf = tape.read_position();
        assert_eq!(buf[0] & 0x80, 0x80);
    }

    #[test]
    fn load_unload_rejects_load_and_eot_together() {
        let (_guard, path) = temp_tape(4096);
        let mut tape = Tape::open(&path, Some(512)).unwrap().target;
        let mut dev = Device::new(crate::device::DeviceType::DirectAccess, 0);
        let cdb = [OPCODE_LOAD_UNLOAD, 0, 0, 0, LOAD_BIT | EOT_BIT, 0];
        assert!(tape.dispatch(&mut dev, &cdb, None).is_err());
    }

    #[test]
    fn read_past_end_is_blank_check() {
        let (_guard, path) = temp_tape(512);
        let mut tape = Tape::open(&path, Some(512)).unwrap().target;
        let mut dev = Device::new(crate::device::DeviceType::DirectAccess, 0);
        tape.position = 512;
        let cdb = [OPCODE_READ6, 0, 0x00, 0x00, 0x01, 0];
        let err = tape.dispatch(&mut dev, &cdb, None).unwrap_err();
        assert_eq!(err.sense_key, SenseKey::BlankCheck);
    }
}
