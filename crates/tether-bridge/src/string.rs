//! Text across the boundary.
//!
//! Guest strings are UTF-8 `(ptr, len)` pairs in linear memory. Decoding is
//! fatal: malformed input is an error, never replaced. Encoding allocates
//! guest memory through the guest's allocator, either sized exactly up front
//! or, when the guest exports a reallocator, sized optimistically and shrunk.

use tether_types::{BridgeError, BridgeResult, GuestStr};
use tracing::trace;

use crate::guest::Guest;
use crate::memory::MemoryViews;

/// Borrow the UTF-8 text at `ptr..ptr+len`.
pub fn decode<'m>(views: &mut MemoryViews, mem: &'m [u8], ptr: u32, len: u32) -> BridgeResult<&'m str> {
    let bytes = views.bytes(mem).into_subarray(ptr, len)?;
    std::str::from_utf8(bytes).map_err(|source| BridgeError::Decode { ptr, len, source })
}

/// Copy the guest string at `ptr..ptr+len` out of guest memory.
pub fn read<G: Guest + ?Sized>(guest: &mut G, ptr: u32, len: u32) -> BridgeResult<String> {
    let (mem, bridge) = guest.split();
    decode(&mut bridge.views, mem, ptr, len).map(str::to_owned)
}

/// Copy `text` into freshly allocated guest memory.
pub fn encode<G: Guest + ?Sized>(guest: &mut G, text: &str) -> BridgeResult<GuestStr> {
    if guest.bridge().string_fast_path() && guest.has_realloc() {
        encode_growing(guest, text)
    } else {
        encode_exact(guest, text)
    }
}

fn encode_exact<G: Guest + ?Sized>(guest: &mut G, text: &str) -> BridgeResult<GuestStr> {
    let len = guest_len(text.len())?;
    let ptr = guest.malloc(len, 1)?;
    guest.bridge().views.invalidate();
    write_bytes(guest, ptr, text.as_bytes())?;
    Ok(GuestStr { ptr, len })
}

/// Allocate one byte per UTF-16 unit and copy the ASCII prefix. At the first
/// non-ASCII character, grow to three bytes per remaining unit, encode the
/// tail, and shrink to the bytes actually written.
fn encode_growing<G: Guest + ?Sized>(guest: &mut G, text: &str) -> BridgeResult<GuestStr> {
    let mut capacity = guest_len(text.encode_utf16().count())?;
    let mut ptr = guest.malloc(capacity, 1)?;
    guest.bridge().views.invalidate();

    let ascii = text.bytes().take_while(u8::is_ascii).count();
    write_bytes(guest, ptr, &text.as_bytes()[..ascii])?;
    if ascii == text.len() {
        return Ok(GuestStr { ptr, len: capacity });
    }

    let tail = &text[ascii..];
    let grown = guest_len(ascii + tail.encode_utf16().count() * 3)?;
    trace!(from = capacity, to = grown, "growing string buffer for non-ASCII tail");
    ptr = guest.realloc(ptr, capacity, grown, 1)?;
    capacity = grown;
    guest.bridge().views.invalidate();

    let offset = guest_len(ascii)?;
    write_bytes(guest, offset_by(ptr, offset)?, tail.as_bytes())?;

    let len = guest_len(text.len())?;
    ptr = guest.realloc(ptr, capacity, len, 1)?;
    guest.bridge().views.invalidate();
    Ok(GuestStr { ptr, len })
}

fn guest_len(len: usize) -> BridgeResult<u32> {
    u32::try_from(len).map_err(|_| BridgeError::OutOfBounds {
        offset: 0,
        len,
        memory_len: u32::MAX as usize,
    })
}

fn write_bytes<G: Guest + ?Sized>(guest: &mut G, ptr: u32, bytes: &[u8]) -> BridgeResult<()> {
    let (mem, bridge) = guest.split();
    bridge.views.bytes_mut(mem).write(ptr, bytes)
}

/// Write a `(ptr, len)` pair to the out-parameter at `out`: pointer at `+0`,
/// length at `+4`.
pub fn write_out_str<G: Guest + ?Sized>(guest: &mut G, out: u32, value: GuestStr) -> BridgeResult<()> {
    let (mem, bridge) = guest.split();
    let mut dv = bridge.views.data_view_mut(mem);
    dv.set_u32(out, value.ptr)?;
    dv.set_u32(offset_by(out, 4)?, value.len)
}

/// Write an optional number to the out-parameter at `out`: presence flag
/// (i32) at `+0`, value (f64) at `+8`.
pub fn write_out_f64<G: Guest + ?Sized>(guest: &mut G, out: u32, value: Option<f64>) -> BridgeResult<()> {
    let (mem, bridge) = guest.split();
    let mut dv = bridge.views.data_view_mut(mem);
    dv.set_f64(offset_by(out, 8)?, value.unwrap_or(0.0))?;
    dv.set_i32(out, i32::from(value.is_some()))
}

fn offset_by(out: u32, offset: u32) -> BridgeResult<u32> {
    out.checked_add(offset).ok_or(BridgeError::OutOfBounds {
        offset: out as usize,
        len: offset as usize,
        memory_len: u32::MAX as usize,
    })
}
