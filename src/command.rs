//! Immutable, caller-owned configuration: command opcodes and chip geometry.

/// Index into [`CommandTable::erase_opcodes`] / [`Config::erase_ms`], smallest to largest.
///
/// Block sizes are fixed at 4, 8, 16, 32 and 64 KiB, matching the set every
/// 25-series part draws its erase granularity from.
pub const ERASE_SIZE_COUNT: usize = 5;

/// Byte size of each supported erase block, indexed the same way as
/// [`CommandTable::erase_opcodes`].
pub const ERASE_BLOCK_SIZES: [u32; ERASE_SIZE_COUNT] = [
    4 * 1024,
    8 * 1024,
    16 * 1024,
    32 * 1024,
    64 * 1024,
];

/// Address byte order used when serializing a chip address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Endianness {
    Big,
    Little,
}

/// Opcode table for one chip family. A `0` opcode means "unsupported".
///
/// Covers the opcodes named in spec.md §3: the fixed set plus five optional
/// block-erase opcodes keyed by size, and the bitmask identifying the busy
/// bit inside the status register.
#[derive(Debug, Clone, Copy)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct CommandTable {
    pub write_enable: u8,
    pub write_disable: u8,
    pub page_program: u8,
    pub read_data: u8,
    pub read_data_fast: u8,
    pub write_sr: u8,
    pub read_sr: u8,
    pub chip_erase: u8,
    pub jedec_id: u8,
    pub device_id: u8,
    /// Erase opcodes for {4, 8, 16, 32, 64} KiB blocks, `0` where unsupported.
    pub erase_opcodes: [u8; ERASE_SIZE_COUNT],
    /// Bitmask selecting the busy bit within the status register byte.
    pub sr_busy_mask: u8,
}

/// Bit position within the erase-planner's support mask for a given block
/// size, per spec.md §4.3.2: bit *k* means size `1 << (k + 8)` is supported,
/// so 4 KiB is bit 4 and 64 KiB is bit 8.
fn size_to_bit(block_size: u32) -> Option<u32> {
    if !block_size.is_power_of_two() {
        return None;
    }
    block_size.trailing_zeros().checked_sub(8)
}

impl CommandTable {
    /// Opcode for the given block size, if the chip supports erasing at that
    /// granularity.
    pub fn erase_opcode(&self, block_size: u32) -> Option<u8> {
        let idx = ERASE_BLOCK_SIZES.iter().position(|&s| s == block_size)?;
        match self.erase_opcodes[idx] {
            0 => None,
            op => Some(op),
        }
    }

    /// Bitmask of supported erase sizes, in the layout the erase planner
    /// expects: bit *k* set means block size `1 << (k + 8)` has a configured
    /// opcode.
    pub fn supported_erase_mask(&self) -> u32 {
        let mut mask = 0u32;
        for (idx, &op) in self.erase_opcodes.iter().enumerate() {
            if op != 0 {
                if let Some(bit) = size_to_bit(ERASE_BLOCK_SIZES[idx]) {
                    mask |= 1 << bit;
                }
            }
        }
        mask
    }
}

/// Chip geometry and timing, immutable for the lifetime of a [`crate::Device`].
///
/// A duration of `0` for any of the wait fields means the BUSY line is
/// wired: the busy-check subengine will call [`crate::hal::Hal::wait`] with
/// `0` and rely on it blocking until the pin releases (spec.md §3, §4.3.3).
#[derive(Debug, Clone, Copy)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Config {
    /// Total chip size in bytes.
    pub chip_size: u32,
    /// Page size in bytes. Must be a power of two.
    pub page_size: u32,
    /// Address width in bytes, typically 3 or 4.
    pub addr_width: u8,
    /// Dummy bytes after the address, before data, for plain (non-fast) reads.
    pub addr_dummy_bytes: u8,
    pub addr_endianness: Endianness,
    pub sr_write_ms: u32,
    pub page_program_ms: u32,
    /// Typical duration for each of the five erase sizes, same indexing as
    /// [`CommandTable::erase_opcodes`].
    pub erase_ms: [u32; ERASE_SIZE_COUNT],
    pub chip_erase_ms: u32,
}

impl Config {
    /// Offset of `addr` within its page.
    pub fn page_offset(&self, addr: u32) -> u32 {
        addr % self.page_size
    }

    /// Bytes of payload that fit in the current page starting at `addr`.
    pub fn page_remainder(&self, addr: u32) -> u32 {
        self.page_size - self.page_offset(addr)
    }
}
