use std::fmt;
use std::fs;
use std::path::Path;

use crate::{RandomiserError, Result};

/// Number of addressable banks in the cartridge layout.
pub const BANK_COUNT: usize = 0x40;

/// Size of one bank in the image file.
pub const BANK_SIZE: usize = 0x4000;

const SWITCHABLE_BASE: u16 = 0x4000;

const HEADER_CHECKSUM: usize = 0x014d;
const GLOBAL_CHECKSUM: usize = 0x014e;

/// End of the CPU-visible window for a bank. Bank 0 is mapped at
/// 0000-3fff, every other bank at 4000-7fff.
pub const fn bank_capacity(bank: u8) -> u32 {
    if bank == 0 {
        0x4000
    } else {
        0x8000
    }
}

/// Start of the CPU-visible window for a bank.
pub const fn bank_base(bank: u8) -> u16 {
    if bank == 0 {
        0
    } else {
        SWITCHABLE_BASE
    }
}

/// A resolved location: bank number plus the address the CPU sees while
/// that bank is mapped.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Address {
    pub bank: u8,
    pub offset: u16,
}

impl Address {
    pub const fn new(bank: u8, offset: u16) -> Self {
        Address { bank, offset }
    }

    /// Pointer bytes as the CPU reads them (call/jp operands, pointer tables).
    pub fn to_le_bytes(self) -> [u8; 2] {
        self.offset.to_le_bytes()
    }

    /// Big-endian pointer, used by a few script formats.
    pub fn to_be_bytes(self) -> [u8; 2] {
        self.offset.to_be_bytes()
    }

    /// Position of this address in the image file, or `None` if the offset
    /// lies outside the bank's window.
    pub fn file_offset(self) -> Option<usize> {
        if self.bank as usize >= BANK_COUNT {
            return None;
        }
        let base = bank_base(self.bank);
        if self.offset < base || u32::from(self.offset) >= bank_capacity(self.bank) {
            return None;
        }
        Some(self.bank as usize * BANK_SIZE + (self.offset - base) as usize)
    }

    /// True if `len` bytes starting here stay within the bank's window.
    pub fn fits(self, len: usize) -> bool {
        self.file_offset().is_some()
            && u32::from(self.offset) + len as u32 <= bank_capacity(self.bank)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02x}:{:04x}", self.bank, self.offset)
    }
}

/// The working image. All bank-relative reads and writes are bounds
/// checked against both the bank window and the image length.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Rom {
    data: Vec<u8>,
}

impl Rom {
    pub fn new(data: Vec<u8>) -> Self {
        Rom { data }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let data = fs::read(path)?;
        if data.is_empty() || data.len() % BANK_SIZE != 0 {
            return Err(RandomiserError::Config(format!(
                "{} is not a bank-aligned image ({} bytes)",
                path.display(),
                data.len()
            )));
        }
        Ok(Rom::new(data))
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }

    fn span(&self, addr: Address, n: usize) -> Result<usize> {
        let out_of_range = || RandomiserError::AddressOutOfRange { address: addr, len: n };
        if !addr.fits(n) {
            return Err(out_of_range());
        }
        let start = addr.file_offset().ok_or_else(out_of_range)?;
        if start + n > self.data.len() {
            return Err(out_of_range());
        }
        Ok(start)
    }

    pub fn read_n(&self, addr: Address, n: usize) -> Result<&[u8]> {
        let start = self.span(addr, n)?;
        Ok(&self.data[start..start + n])
    }

    pub fn write_n(&mut self, addr: Address, x: &[u8]) -> Result<()> {
        let start = self.span(addr, x.len())?;
        self.data[start..start + x.len()].copy_from_slice(x);
        Ok(())
    }

    /// Fails the same way `write_n` would, without touching the image.
    pub fn check_write(&self, addr: Address, n: usize) -> Result<()> {
        self.span(addr, n).map(|_| ())
    }

    /// Recompute the big-endian global checksum stored at 014e-014f. The
    /// header checksum at 014d is left alone since patches never touch the
    /// header. Returns the new checksum, or `None` for images too small to
    /// carry a header.
    pub fn fix_global_checksum(&mut self) -> Option<u16> {
        if self.data.len() <= GLOBAL_CHECKSUM + 1 {
            return None;
        }
        let sum = self
            .data
            .iter()
            .enumerate()
            .filter(|(i, _)| *i != GLOBAL_CHECKSUM && *i != GLOBAL_CHECKSUM + 1)
            .fold(0u16, |acc, (_, &b)| acc.wrapping_add(u16::from(b)));
        self.data[GLOBAL_CHECKSUM..GLOBAL_CHECKSUM + 2].copy_from_slice(&sum.to_be_bytes());
        Some(sum)
    }

    pub fn header_checksum_valid(&self) -> bool {
        if self.data.len() <= HEADER_CHECKSUM {
            return false;
        }
        let x = self.data[0x0134..HEADER_CHECKSUM]
            .iter()
            .fold(0u8, |acc, &b| acc.wrapping_sub(b).wrapping_sub(1));
        x == self.data[HEADER_CHECKSUM]
    }
}
