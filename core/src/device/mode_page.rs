//! MODE SENSE/SELECT support. Grounded on `devices/mode_page_device.cpp`:
//! a concrete device populates an ordered map of page code -> page bytes
//! (minus the 2-byte page header), and this module's serializer assembles
//! the mode-parameter header, optional block descriptor, and pages in
//! ascending order with page 0 forced last.

use std::collections::BTreeMap;

use crate::device::Device;
use crate::error::{Asc, ScsiError};
use crate::util::set_int16;

/// Capability trait for devices that support MODE SENSE/SELECT. `changeable`
/// selects between "current values" and "changeable mask" pages, as
/// required by MODE SENSE's PC field.
pub trait ModePages {
    /// Populates `pages` with every page this device supports matching
    /// `page` (or all pages, when `page == 0x3f`).
    fn set_up_mode_pages(&self, pages: &mut BTreeMap<u8, Vec<u8>>, page: u8, changeable: bool);

    /// Whether this device accepts MODE SELECT's "save pages" (SP) bit.
    /// Default: unsupported, matching most concrete devices in the original.
    fn supports_save_parameters(&self) -> bool {
        false
    }

    /// Applies a MODE SELECT page (already validated/unwrapped from the
    /// parameter list) to this device's configuration. Default: no writable
    /// pages.
    fn apply_mode_select_page(&mut self, _page: u8, _data: &[u8]) -> Result<(), ScsiError> {
        Err(ScsiError::illegal_request(Asc::InvalidFieldInParameterList))
    }
}

/// Flattens `pages` (in ascending page-code order, with page 0 moved last)
/// into the caller's pre-zeroed output buffer starting at `offset`, OR-ing
/// the page code into each page's first byte and setting its length byte to
/// `size - 2`. Returns the total byte count that would have been written,
/// before truncation to the buffer's length.
fn flatten_pages(pages: &BTreeMap<u8, Vec<u8>>, out: &mut Vec<u8>, offset: usize) -> usize {
    let mut ordered: Vec<(&u8, &Vec<u8>)> = pages.iter().collect();
    ordered.sort_by_key(|&(&code, _)| if code == 0 { u16::MAX } else { u16::from(code) });

    let mut total = offset;
    for (&code, bytes) in ordered {
        let mut page = bytes.clone();
        if page.is_empty() {
            page = vec![0, 0];
        }
        page[0] |= code;
        let len = page.len();
        page[1] = (len - 2) as u8;
        total += len;
        if out.len() < total {
            out.resize(total, 0);
        }
        out[total - len..total].copy_from_slice(&page);
    }
    total
}

/// Shared MODE SENSE(6) body. `alloc_len` is the CDB's allocation length;
/// `dbd` is the "disable block descriptor" bit; `page` and `changeable`
/// select which pages to emit.
pub fn mode_sense6(
    dev: &Device,
    mp: &dyn ModePages,
    page: u8,
    changeable: bool,
    dbd: bool,
    alloc_len: usize,
) -> Vec<u8> {
    let mut out = vec![0u8; 4];
    let mut offset = 4;
    if !dbd && dev.ready {
        out.resize(12, 0);
        offset = 12;
        // block descriptor is left zeroed; concrete disk types overwrite it
        // with real geometry via `mode_sense6_with_descriptor` below.
    }

    let mut pages = BTreeMap::new();
    mp.set_up_mode_pages(&mut pages, page, changeable);
    let total = flatten_pages(&pages, &mut out, offset);

    out[0] = total as u8;
    out.truncate(alloc_len.min(out.len()));
    out
}

/// As [`mode_sense6`] but writes an 8-byte block descriptor (block count,
/// block length) after the header when one is requested, as direct-access
/// and CD-ROM devices require.
pub fn mode_sense6_with_descriptor(
    dev: &Device,
    mp: &dyn ModePages,
    page: u8,
    changeable: bool,
    dbd: bool,
    alloc_len: usize,
    block_count: u32,
    block_len: u32,
) -> Vec<u8> {
    let mut out = vec![0u8; 4];
    if dev.write_protected {
        out[2] = 0x80;
    }
    let offset;
    if !dbd && dev.ready {
        out.resize(12, 0);
        out[3] = 8; // block descriptor length
        crate::util::set_int32(&mut out, 4, block_count);
        set_int16(&mut out, 10, (block_len & 0xffff) as u16);
        offset = 12;
    } else {
        offset = 4;
    }

    let mut pages = BTreeMap::new();
    mp.set_up_mode_pages(&mut pages, page, changeable);
    let total = flatten_pages(&pages, &mut out, offset);

    out[0] = total as u8;
    out.truncate(alloc_len.min(out.len()));
    out
}

/// Shared MODE SENSE(10) body; header is 8 bytes wide and the total-length
/// field is 16-bit big-endian.
pub fn mode_sense10_with_descriptor(
    dev: &Device,
    mp: &dyn ModePages,
    page: u8,
    changeable: bool,
    dbd: bool,
    alloc_len: usize,
    block_count: u32,
    block_len: u32,
) -> Vec<u8> {
    let mut out = vec![0u8; 8];
    if dev.write_protected {
        out[3] = 0x80;
    }
    let offset;
    if !dbd && dev.ready {
        out.resize(16, 0);
        set_int16(&mut out, 6, 8);
        crate::util::set_int32(&mut out, 8, block_count);
        set_int16(&mut out, 14, (block_len & 0xffff) as u16);
        offset = 16;
    } else {
        offset = 8;
    }

    let mut pages = BTreeMap::new();
    mp.set_up_mode_pages(&mut pages, page, changeable);
    let total = flatten_pages(&pages, &mut out, offset);

    set_int16(&mut out, 0, total as u16);
    out.truncate(alloc_len.min(out.len()));
    out
}
