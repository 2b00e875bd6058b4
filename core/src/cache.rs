//! Track-granularity write-back disk cache: 16 resident [`DiskTrack`] slots,
//! evicted by oldest access serial, each tracking per-sector dirty state so
//! a save only rewrites what actually changed.
//!
//! Grounded on `devices/disk_cache.cpp`/`devices/disk_track.cpp`.

use anyhow::Result;

use crate::image::ImageFile;

const CACHE_SLOTS: usize = 16;
const SECTORS_PER_TRACK: u32 = 256;

/// One resident track: `sectors` consecutive logical blocks starting at
/// `track_no * SECTORS_PER_TRACK`, held in a single buffer with a per-sector
/// dirty bitmap. `raw` tracks are addressed with the CD-ROM 2352-byte stride
/// (2048 usable bytes per sector, 16-byte sync header skipped on load and
/// re-synthesized on save being out of scope — raw tracks are read-only).
pub struct DiskTrack {
    track_no: u32,
    sector_size: usize,
    sectors: u32,
    raw: bool,
    buffer: Vec<u8>,
    dirty: Vec<bool>,
    initialized: bool,
    changed: bool,
}

impl DiskTrack {
    pub fn new(track_no: u32, sector_size: usize, sectors: u32, raw: bool) -> Self {
        Self {
            track_no,
            sector_size,
            sectors,
            raw,
            buffer: Vec::new(),
            dirty: Vec::new(),
            initialized: false,
            changed: false,
        }
    }

    fn stride(&self) -> usize {
        if self.raw {
            2352
        } else {
            self.sector_size
        }
    }

    fn sync_skip(&self) -> usize {
        if self.raw {
            16
        } else {
            0
        }
    }

    fn base_offset(&self, data_offset: u64) -> u64 {
        data_offset + u64::from(self.track_no) * u64::from(SECTORS_PER_TRACK) * self.stride() as u64
    }

    /// Loads every sector of this track from `image` at `data_offset`
    /// (the header size for Anex86/T98Next images, 0 otherwise).
    pub fn load(&mut self, image: &dyn ImageFile, data_offset: u64) -> Result<()> {
        self.buffer = vec![0u8; self.sector_size * self.sectors as usize];
        self.dirty = vec![false; self.sectors as usize];

        let base = self.base_offset(data_offset);
        let stride = self.stride();
        let skip = self.sync_skip();
        for s in 0..self.sectors as usize {
            let off = base as usize + s * stride + skip;
            let chunk = image.read_at(off, self.sector_size);
            self.buffer[s * self.sector_size..(s + 1) * self.sector_size].copy_from_slice(&chunk);
        }
        self.initialized = true;
        self.changed = false;
        Ok(())
    }

    /// Writes back every contiguous run of dirty sectors. Raw (CD) tracks
    /// are never dirtied, since the block cache serves CD-ROM media
    /// read-only. Returns whether anything was written.
    pub fn save(&mut self, image: &mut dyn ImageFile, data_offset: u64) -> Result<bool> {
        if !self.changed || self.raw {
            return Ok(false);
        }

        let base = self.base_offset(data_offset);
        let stride = self.stride();
        let mut s = 0usize;
        while s < self.dirty.len() {
            if !self.dirty[s] {
                s += 1;
                continue;
            }
            let run_start = s;
            while s < self.dirty.len() && self.dirty[s] {
                s += 1;
            }
            let run_len = s - run_start;
            let byte_start = run_start * self.sector_size;
            let byte_len = run_len * self.sector_size;
            let off = base as usize + run_start * stride;
            image.write_at(off, &self.buffer[byte_start..byte_start + byte_len]);
        }

        self.dirty.iter_mut().for_each(|d| *d = false);
        self.changed = false;
        Ok(true)
    }

    pub fn read_sector(&self, sector_in_track: u32) -> &[u8] {
        let s = sector_in_track as usize;
        &self.buffer[s * self.sector_size..(s + 1) * self.sector_size]
    }

    pub fn write_sector(&mut self, sector_in_track: u32, data: &[u8]) {
        let s = sector_in_track as usize;
        self.buffer[s * self.sector_size..(s + 1) * self.sector_size].copy_from_slice(data);
        self.dirty[s] = true;
        self.changed = true;
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }
}

struct Slot {
    track: DiskTrack,
    serial: u64,
}

/// 16-slot, serial-ordered LRU cache of [`DiskTrack`]s sitting in front of
/// an [`ImageFile`]. `sector_size`/`data_offset`/`raw` describe the backing
/// image's geometry once, at construction, matching how a concrete device
/// owns exactly one cache for its one image file.
pub struct DiskCache {
    slots: Vec<Option<Slot>>,
    serial: u64,
    sector_size: usize,
    data_offset: u64,
    raw: bool,
    block_count: u32,
}

impl DiskCache {
    /// `block_count` is the device's total block count, used to clamp the
    /// last track's sector count so a load never reads past EOF.
    pub fn new(sector_size: usize, data_offset: u64, raw: bool, block_count: u32) -> Self {
        Self {
            slots: (0..CACHE_SLOTS).map(|_| None).collect(),
            serial: 0,
            sector_size,
            data_offset,
            raw,
            block_count,
        }
    }

    fn next_serial(&mut self) -> u64 {
        self.serial = self.serial.wrapping_add(1);
        if self.serial == 0 {
            // Rollover: reset every slot's serial so the ordering after
            // wraparound still reflects true recency.
            for slot in self.slots.iter_mut().flatten() {
                slot.serial = 0;
            }
            self.serial = 1;
        }
        self.serial
    }

    fn track_and_sector(&self, lba: u32) -> (u32, u32) {
        (lba / SECTORS_PER_TRACK, lba % SECTORS_PER_TRACK)
    }

    fn slot_for(&mut self, image: &mut dyn ImageFile, track_no: u32) -> Result<usize> {
        if let Some(idx) = self.slots.iter().position(|s| matches!(s, Some(slot) if slot.track.track_no == track_no)) {
            return Ok(idx);
        }

        let evict = self
            .slots
            .iter()
            .enumerate()
            .min_by_key(|(_, s)| s.as_ref().map_or(0, |slot| slot.serial))
            .map(|(i, _)| i)
            .unwrap_or(0);

        if let Some(mut slot) = self.slots[evict].take() {
            slot.track.save(image, self.data_offset)?;
        }

        // Last track is short when block_count isn't a multiple of
        // SECTORS_PER_TRACK; clamp so load() never reads past EOF.
        let track_base = track_no * SECTORS_PER_TRACK;
        let sectors = SECTORS_PER_TRACK.min(self.block_count.saturating_sub(track_base));
        let mut track = DiskTrack::new(track_no, self.sector_size, sectors, self.raw);
        track.load(image, self.data_offset)?;
        let serial = self.next_serial();
        self.slots[evict] = Some(Slot { track, serial });
        Ok(evict)
    }

    pub fn read_sector(&mut self, image: &mut dyn ImageFile, lba: u32) -> Result<Vec<u8>> {
        let (track_no, sector) = self.track_and_sector(lba);
        let idx = self.slot_for(image, track_no)?;
        let serial = self.next_serial();
        let slot = self.slots[idx].as_mut().expect("just populated");
        slot.serial = serial;
        Ok(slot.track.read_sector(sector).to_vec())
    }

    pub fn write_sector(&mut self, image: &mut dyn ImageFile, lba: u32, data: &[u8]) -> Result<()> {
        let (track_no, sector) = self.track_and_sector(lba);
        let idx = self.slot_for(image, track_no)?;
        let serial = self.next_serial();
        let slot = self.slots[idx].as_mut().expect("just populated");
        slot.serial = serial;
        slot.track.write_sector(sector, data);
        Ok(())
    }

    /// Flushes every dirty resident track back to `image`, e.g. before
    /// SYNCHRONIZE CACHE, STOP UNIT, or a reservation-safe shutdown.
    pub fn flush_all(&mut self, image: &mut dyn ImageFile) -> Result<()> {
        for slot in self.slots.iter_mut().flatten() {
            slot.track.save(image, self.data_offset)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::{Path, PathBuf};

    struct MemImage {
        buf: Vec<u8>,
        path: PathBuf,
    }

    impl ImageFile for MemImage {
        fn byte_len(&self) -> usize {
            self.buf.len()
        }
        fn read_at(&self, offset: usize, len: usize) -> Vec<u8> {
            self.buf[offset..offset + len].to_vec()
        }
        fn write_at(&mut self, offset: usize, data: &[u8]) {
            self.buf[offset..offset + data.len()].copy_from_slice(data);
        }
        fn path(&self) -> &Path {
            &self.path
        }
    }

    fn blank_image(blocks: u32, sector_size: usize) -> MemImage {
        MemImage {
            buf: vec![0u8; blocks as usize * sector_size],
            path: PathBuf::from("mem"),
        }
    }

    #[test]
    fn write_then_read_round_trips_through_cache() {
        let mut image = blank_image(512, 512);
        let mut cache = DiskCache::new(512, 0, false, 512);

        let data = vec![0xab; 512];
        cache.write_sector(&mut image, 100, &data).unwrap();
        let read_back = cache.read_sector(&mut image, 100).unwrap();
        assert_eq!(read_back, data);

        cache.flush_all(&mut image).unwrap();
        assert_eq!(&image.buf[100 * 512..101 * 512], data.as_slice());
    }

    #[test]
    fn dirty_sectors_survive_eviction_via_flush() {
        let mut image = blank_image(SECTORS_PER_TRACK * 20, 512);
        let mut cache = DiskCache::new(512, 0, false, SECTORS_PER_TRACK * 20);

        for track in 0..20u32 {
            let lba = track * SECTORS_PER_TRACK;
            cache.write_sector(&mut image, lba, &vec![track as u8; 512]).unwrap();
        }
        cache.flush_all(&mut image).unwrap();

        for track in 0..20u32 {
            let lba = track * SECTORS_PER_TRACK;
            let off = lba as usize * 512;
            assert_eq!(image.buf[off], track as u8);
        }
    }

    #[test]
    fn serial_rollover_resets_ordering() {
        let mut cache = DiskCache::new(512, 0, false, SECTORS_PER_TRACK);
        cache.serial = u64::MAX - 1;
        let mut image = blank_image(SECTORS_PER_TRACK, 512);
        cache.read_sector(&mut image, 0).unwrap();
        // second call wraps serial back to a small number without panicking
        cache.serial = u64::MAX;
        cache.read_sector(&mut image, 0).unwrap();
    }

    #[test]
    fn short_last_track_does_not_read_past_eof() {
        // 300 blocks is not a multiple of SECTORS_PER_TRACK (256), so track 1
        // only has 44 sectors. Reading/writing the last valid LBA must not
        // reach past the image's end.
        let blocks = 300u32;
        let mut image = blank_image(blocks, 512);
        let mut cache = DiskCache::new(512, 0, false, blocks);

        let data = vec![0x5a; 512];
        cache.write_sector(&mut image, 299, &data).unwrap();
        let read_back = cache.read_sector(&mut image, 299).unwrap();
        assert_eq!(read_back, data);

        cache.flush_all(&mut image).unwrap();
        assert_eq!(&image.buf[299 * 512..300 * 512], data.as_slice());
    }
}
