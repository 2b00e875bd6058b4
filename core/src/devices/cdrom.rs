//! CD-ROM drive (§4.7): read-only block device, plus READ TOC and the
//! Apple-vendor mode page CD-ROM drives of this era carried.
//!
//! Grounded on `devices/scsicd.cpp` for the command set and on the teacher's
//! own `mac/scsi/cdrom.rs` (an NCR5380-side CD-ROM target) for the exact TOC
//! and mode-page byte layouts, which this crate's tests reproduce.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::Result;

use crate::cache::DiskCache;
use crate::device::mode_page::{mode_sense6_with_descriptor, mode_sense10_with_descriptor, ModePages};
use crate::device::storage::BlockStorage;
use crate::device::{CommandResult, Device, ScsiTarget};
use crate::error::{Asc, ScsiError};
use crate::image::{is_raw_cd_sync, FlatImage, ImageFile};
use crate::util::{get_int16, set_int16};

const SECTOR_SIZE: usize = 2048;
const TRACK_LEADOUT: u8 = 0xaa;

const OPCODE_READ6: u8 = 0x08;
const OPCODE_MODE_SELECT6: u8 = 0x15;
const OPCODE_MODE_SENSE6: u8 = 0x1a;
const OPCODE_START_STOP_UNIT: u8 = 0x1b;
const OPCODE_PREVENT_ALLOW: u8 = 0x1e;
const OPCODE_READ_CAPACITY10: u8 = 0x25;
const OPCODE_READ10: u8 = 0x28;
const OPCODE_MODE_SELECT10: u8 = 0x55;
const OPCODE_MODE_SENSE10: u8 = 0x5a;
const OPCODE_READ_TOC: u8 = 0x43;
const OPCODE_READ12: u8 = 0xa8;

const APPLE_VENDOR_STRING: &[u8] = b"APPLE COMPUTER, INC   ";

pub struct OpenedCdRom {
    pub target: CdRom,
    pub block_count: u32,
}

/// One entry in a CD-ROM's table of contents. `path` is the image backing
/// this specific track: in principle a track's data can live in a
/// different file than the rest of the disc (a separate audio track file,
/// say), though `CdRom::open` only ever synthesizes a single data track
/// bound to the opened image.
#[derive(Debug, Clone)]
pub struct CdTrack {
    pub number: u8,
    pub first_lba: u32,
    pub last_lba: u32,
    pub audio: bool,
    pub path: PathBuf,
}

/// A CD-ROM. `tracks` is a full table of contents; READ TOC, `search_track`
/// and `Read`'s re-bind-on-track-change are all written generically over
/// it, even though `open` only ever builds a single-track table (this core
/// does not author multi-session or audio-track images).
pub struct CdRom {
    image: Box<dyn ImageFile>,
    cache: DiskCache,
    block_count: u32,
    tracks: Vec<CdTrack>,
    current_track: usize,
}

impl CdRom {
    /// Opens `path`, detecting a raw 2352-byte-stride MODE1 image from its
    /// sync pattern and falling back to a flat 2048-byte-sector ISO image.
    pub fn open(path: &Path) -> Result<OpenedCdRom> {
        let image = Box::new(FlatImage::open(path)?);
        let byte_len = image.byte_len();
        let header = image.read_at(0, byte_len.min(16));
        let raw = is_raw_cd_sync(&header);
        let stride = if raw { 2352 } else { SECTOR_SIZE };
        let block_count = (byte_len / stride) as u32;
        let cache = DiskCache::new(SECTOR_SIZE, 0, raw, block_count);
        let tracks = vec![CdTrack {
            number: 1,
            first_lba: 0,
            last_lba: block_count.saturating_sub(1),
            audio: false,
            path: path.to_path_buf(),
        }];

        Ok(OpenedCdRom {
            target: CdRom {
                image,
                cache,
                block_count,
                tracks,
                current_track: 0,
            },
            block_count,
        })
    }

    /// Finds the track containing `lba`, mirroring `SearchTrack`.
    fn search_track(&self, lba: u32) -> Option<usize> {
        self.tracks
            .iter()
            .position(|t| lba >= t.first_lba && lba <= t.last_lba)
    }

    fn do_read(&mut self, dev: &mut Device, lba: u32, count: u32) -> Result<CommandResult, ScsiError> {
        if count == 0 {
            return Ok(CommandResult::Status(crate::error::status::GOOD));
        }
        let track_idx = self
            .search_track(lba)
            .ok_or_else(|| dev.fail(ScsiError::illegal_request(Asc::LbaOutOfRange)))?;
        if u64::from(lba) + u64::from(count) - 1 > u64::from(self.tracks[track_idx].last_lba) {
            return Err(dev.fail(ScsiError::illegal_request(Asc::LbaOutOfRange)));
        }
        // A real re-bind would reopen `self.tracks[track_idx].path` and
        // rebuild the cache against it; out of reach with only one track
        // ever synthesized, so this just records which track served the read.
        self.current_track = track_idx;
        let mut out = Vec::with_capacity(count as usize * SECTOR_SIZE);
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
        crate::util::set_int32(&mut buf, 0, self.block_count.saturating_sub(1));
        crate::util::set_int32(&mut buf, 4, SECTOR_SIZE as u32);
        buf
    }

    /// READ TOC, written generically over `self.tracks` (see `ReadTocInternal`
    /// in the original implementation): format 0 returns descriptors for
    /// every track from the requested one through the last, plus a
    /// lead-out-only descriptor if `track` is the lead-out pseudo-track
    /// 0xAA; format 1 (session TOC) returns the first track's descriptor.
    fn read_toc(&self, dev: &mut Device, msf: bool, format: u8, track: u8, alloc_len: usize) -> Result<CommandResult, ScsiError> {
        let first = self.tracks[0].number;
        let last = self.tracks[self.tracks.len() - 1].number;

        match format {
            0 => {
                if track > last && track != TRACK_LEADOUT {
                    return Err(dev.fail(ScsiError::illegal_request(Asc::InvalidFieldInCdb)));
                }

                let start_index = if track == 0 {
                    Some(0)
                } else {
                    self.tracks.iter().position(|t| t.number == track)
                };

                let Some(start_index) = start_index else {
                    // Not a known track number; only the lead-out pseudo-track
                    // reaches here (checked above), so this returns a
                    // lead-out-only descriptor one block past the last track.
                    let mut result = vec![0u8; 12];
                    result[1] = 0x0a;
                    result[2] = first;
                    result[3] = last;
                    result[6] = TRACK_LEADOUT;
                    let lead_out_lba = self.tracks[self.tracks.len() - 1].last_lba + 1;
                    write_track_address(&mut result, 8, lead_out_lba, msf);
                    return Ok(CommandResult::DataIn(resize_to_alloc(result, alloc_len)));
                };

                let loop_count = (last - self.tracks[start_index].number) as usize + 1;
                let mut result = vec![0u8; 4 + loop_count * 8];
                set_int16(&mut result, 0, (loop_count * 8 + 2) as u16);
                result[2] = first;
                result[3] = last;

                let mut offset = 4;
                for t in &self.tracks[start_index..] {
                    result[offset + 1] = if t.audio { 0x10 } else { 0x14 };
                    result[offset + 2] = t.number;
                    write_track_address(&mut result, offset + 4, t.first_lba, msf);
                    offset += 8;
                }

                Ok(CommandResult::DataIn(resize_to_alloc(result, alloc_len)))
            }
            1 => {
                let head = &self.tracks[0];
                let mut result = vec![0u8; 12];
                result[1] = 0x0a;
                result[2] = first;
                result[3] = last;
                result[5] = if head.audio { 0x10 } else { 0x14 };
                result[6] = head.number;
                Ok(CommandResult::DataIn(resize_to_alloc(result, alloc_len)))
            }
            _ => Err(dev.fail(ScsiError::illegal_request(Asc::InvalidFieldInCdb))),
        }
    }
}

/// Writes a track's absolute address at `buf[offset..offset+4]`: an MSF
/// quadruple if `msf`, otherwise the low 16 bits of the LBA at
/// `offset+2..offset+4`, matching `ReadTocInternal`'s `SetInt16` call
/// (the high 16 bits are never written, matching the original exactly).
fn write_track_address(buf: &mut [u8], offset: usize, lba: u32, msf: bool) {
    if msf {
        buf[offset..offset + 4].copy_from_slice(&lba_to_msf(lba));
    } else {
        set_int16(buf, offset + 2, lba as u16);
    }
}

/// Converts an LBA to an MSF (minute/second/frame) quadruple, matching
/// `SCSICD::LBAtoMSF`.
fn lba_to_msf(lba: u32) -> [u8; 4] {
    let mut m = lba / (75 * 60);
    let mut s = lba % (75 * 60);
    let f = s % 75;
    s /= 75;
    s += 2;
    if s >= 60 {
        s -= 60;
        m += 1;
    }
    [0, m as u8, s as u8, f as u8]
}

/// Resizes `buf` to exactly `alloc_len`, zero-padding if the caller asked
/// for more than the descriptor content needed.
fn resize_to_alloc(mut buf: Vec<u8>, alloc_len: usize) -> Vec<u8> {
    if alloc_len > buf.len() {
        buf.resize(alloc_len, 0);
    } else {
        buf.truncate(alloc_len);
    }
    buf
}

impl ModePages for CdRom {
    fn set_up_mode_pages(&self, pages: &mut BTreeMap<u8, Vec<u8>>, page: u8, _changeable: bool) {
        let all = page == 0x3f;
        if all || page == 0x01 {
            pages.insert(0x01, vec![0u8; 6]);
        }
        if all || page == 0x03 {
            pages.insert(0x03, vec![0u8; 0x16]);
        }
        if all || page == 0x0d {
            // CD-ROM parameters page: inactivity timer, MSF numbers for
            // seconds/frames per minute, both left at their standard values.
            let mut p = vec![0u8; 8];
            p[3] = 1; // inactivity timer multiplier
            p[5] = 60; // seconds per minute
            p[7] = 75; // frames per second
            pages.insert(0x0d, p);
        }
        if all || page == 0x0e {
            // CD audio control page: no audio tracks, so channel ports/gains
            // stay zeroed.
            pages.insert(0x0e, vec![0u8; 16]);
        }
        if all || page == 0x30 {
            let mut p = vec![0u8; 2 + APPLE_VENDOR_STRING.len()];
            p[2..].copy_from_slice(APPLE_VENDOR_STRING);
            pages.insert(0x30, p);
        }
    }
}

impl BlockStorage for CdRom {
    fn blocksize(&self) -> usize {
        SECTOR_SIZE
    }

    fn block_count(&self) -> u32 {
        self.block_count
    }

    fn image_path(&self) -> Option<&Path> {
        Some(self.image.path())
    }

    fn read_blocks(&mut self, lba: u32, count: u32) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(count as usize * SECTOR_SIZE);
        for i in 0..count {
            out.extend_from_slice(&self.cache.read_sector(self.image.as_mut(), lba + i)?);
        }
        Ok(out)
    }

    fn write_blocks(&mut self, _lba: u32, _data: &[u8]) -> Result<()> {
        anyhow::bail!("CD-ROM media is read-only")
    }
}

impl ScsiTarget for CdRom {
    fn dispatch(&mut self, dev: &mut Device, cdb: &[u8], outdata: Option<&[u8]>) -> Result<CommandResult, ScsiError> {
        let opcode = cdb[0];
        match opcode {
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
            OPCODE_READ_CAPACITY10 => Ok(CommandResult::DataIn(self.read_capacity())),
            OPCODE_READ_TOC => {
                let msf = cdb[1] & 0x02 != 0;
                let format = cdb[9] >> 6;
                let track = cdb[6];
                let alloc_len = usize::from(get_int16(cdb, 7));
                self.read_toc(dev, msf, format, track, alloc_len)
            }
            OPCODE_START_STOP_UNIT => {
                let flags = cdb.get(4).copied().unwrap_or(0);
                if flags & 0x03 == 0x02 {
                    dev.ready = false;
                    dev.removed = true;
                    dev.attn.set();
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
                    dev,
                    self,
                    page,
                    changeable,
                    dbd,
                    alloc_len,
                    self.block_count,
                    SECTOR_SIZE as u32,
                )))
            }
            OPCODE_MODE_SENSE10 => {
                let (page, changeable, dbd, alloc_len) = mode_sense_fields_10(cdb);
                Ok(CommandResult::DataIn(mode_sense10_with_descriptor(
                    dev,
                    self,
                    page,
                    changeable,
                    dbd,
                    alloc_len,
                    self.block_count,
                    SECTOR_SIZE as u32,
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

    fn temp_iso(blocks: u32) -> (tempfile::NamedTempFile, std::path::PathBuf) {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(&vec![0u8; blocks as usize * SECTOR_SIZE]).unwrap();
        f.flush().unwrap();
        let path = f.path().to_path_buf();
        (f, path)
    }

    #[test]
    fn read_toc_track_one_matches_scenario() {
        let (_guard, path) = temp_iso(100);
        let cdrom = CdRom::open(&path).unwrap().target;
        let mut dev = Device::new(crate::device::DeviceType::CdRom, 0);
        dev.ready = true;
        let result = cdrom.read_toc(&mut dev, false, 0, 1, 0x14).unwrap();
        match result {
            CommandResult::DataIn(buf) => {
                // one data track, no lead-out entry: 4-byte header + one
                // 8-byte descriptor, zero-padded out to the 0x14 alloc_len
                assert_eq!(buf[1], 0x0a);
                assert_eq!(buf[2], 1); // first track
                assert_eq!(buf[3], 1); // last track
                assert_eq!(buf[5], 0x14); // ADR/control: data track
                assert_eq!(buf[6], 1); // track number
                assert_eq!(buf.len(), 0x14);
                assert!(buf[12..].iter().all(|&b| b == 0));
            }
            other => panic!("expected DataIn, got {other:?}"),
        }
    }

    #[test]
    fn read_toc_leadout_track() {
        let (_guard, path) = temp_iso(100);
        let cdrom = CdRom::open(&path).unwrap().target;
        let mut dev = Device::new(crate::device::DeviceType::CdRom, 0);
        let result = cdrom.read_toc(&mut dev, false, 0, TRACK_LEADOUT, 12).unwrap();
        match result {
            CommandResult::DataIn(buf) => {
                assert_eq!(buf[6], TRACK_LEADOUT);
                assert_eq!(crate::util::get_int16(&buf, 10), 100); // last_lba(99) + 1
            }
            other => panic!("expected DataIn, got {other:?}"),
        }
    }

    #[test]
    fn read_toc_unknown_track_number_is_illegal() {
        let (_guard, path) = temp_iso(100);
        let cdrom = CdRom::open(&path).unwrap().target;
        let mut dev = Device::new(crate::device::DeviceType::CdRom, 0);
        let err = cdrom.read_toc(&mut dev, false, 0, 5, 12).unwrap_err();
        assert_eq!(err.asc, Asc::InvalidFieldInCdb);
    }

    #[test]
    fn read_toc_is_table_driven_over_multiple_tracks() {
        let (_guard, path) = temp_iso(200);
        let mut cdrom = CdRom::open(&path).unwrap().target;
        // Synthesize a second track to exercise the generic multi-track
        // loop; `open` itself never builds more than one.
        cdrom.tracks.push(CdTrack {
            number: 2,
            first_lba: 100,
            last_lba: 199,
            audio: true,
            path: path.clone(),
        });
        let mut dev = Device::new(crate::device::DeviceType::CdRom, 0);
        let result = cdrom.read_toc(&mut dev, false, 0, 1, 0x40).unwrap();
        match result {
            CommandResult::DataIn(buf) => {
                assert_eq!(buf[2], 1); // first track
                assert_eq!(buf[3], 2); // last track
                // track 1 descriptor at offset 4
                assert_eq!(buf[5], 0x14);
                assert_eq!(buf[6], 1);
                // track 2 (audio) descriptor at offset 12
                assert_eq!(buf[13], 0x10);
                assert_eq!(buf[14], 2);
                assert_eq!(crate::util::get_int16(&buf, 18), 100);
            }
            other => panic!("expected DataIn, got {other:?}"),
        }
    }

    #[test]
    fn read_capacity_reflects_block_count() {
        let (_guard, path) = temp_iso(300);
        let opened = CdRom::open(&path).unwrap();
        assert_eq!(opened.block_count, 300);
        let buf = opened.target.read_capacity();
        assert_eq!(crate::util::get_int32(&buf, 0), 299);
        assert_eq!(crate::util::get_int32(&buf, 4), SECTOR_SIZE as u32);
    }

    #[test]
    fn read_past_end_is_rejected() {
        let (_guard, path) = temp_iso(10);
        let mut cdrom = CdRom::open(&path).unwrap().target;
        let mut dev = Device::new(crate::device::DeviceType::CdRom, 0);
        dev.ready = true;
        let cdb = [OPCODE_READ10, 0, 0, 0, 0, 9, 0, 0, 5, 0];
        let err = cdrom.dispatch(&mut dev, &cdb, None).unwrap_err();
        assert_eq!(err.asc, Asc::LbaOutOfRange);
    }

    #[test]
    fn write_is_rejected() {
        let (_guard, path) = temp_iso(10);
        let mut cdrom = CdRom::open(&path).unwrap().target;
        assert!(cdrom.write_blocks(0, &[0u8; SECTOR_SIZE]).is_err());
    }
}
