//! Address codec (component A, spec.md §4.3.1).

use crate::command::Endianness;

/// Serializes `addr` into `buf[..width]`.
///
/// For [`Endianness::Big`] the MSB lands at `buf[0]`; for
/// [`Endianness::Little`] the LSB lands at `buf[0]`. `width` is clamped to
/// `buf.len()` and to 4 (addresses are carried as `u32`).
pub fn encode(addr: u32, width: u8, endianness: Endianness, buf: &mut [u8]) {
    let width = (width as usize).min(buf.len()).min(4);
    let be = addr.to_be_bytes();
    match endianness {
        Endianness::Big => {
            // Big-endian, keep only the low `width` bytes of the 4-byte form.
            let skip = 4 - width;
            buf[..width].copy_from_slice(&be[skip..]);
        }
        Endianness::Little => {
            for i in 0..width {
                buf[i] = be[3 - i];
            }
        }
    }
}
