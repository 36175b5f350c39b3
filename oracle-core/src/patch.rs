use std::fmt;

use tracing::debug;

use crate::asm::{AsmError, Assembler};
use crate::banks::BankAllocator;
use crate::rom::{bank_capacity, Address, Rom};
use crate::{RandomiserError, Result};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PatchKind {
    Append,
    Replace,
    Tail,
}

/// One write made to the image, kept for the build's patch log.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PatchRecord {
    pub kind: PatchKind,
    pub address: Address,
    pub label: String,
    pub old: Vec<u8>,
    pub new: Vec<u8>,
}

impl fmt::Display for PatchRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            PatchKind::Append => write!(
                f,
                "{} append {} ({} bytes): {}",
                self.address,
                self.label,
                self.new.len(),
                hex::encode(&self.new)
            ),
            PatchKind::Tail => write!(
                f,
                "{} tail {} ({} bytes): {}",
                self.address,
                self.label,
                self.new.len(),
                hex::encode(&self.new)
            ),
            PatchKind::Replace => write!(
                f,
                "{} replace {}: {} -> {}",
                self.address,
                self.label,
                hex::encode(&self.old),
                hex::encode(&self.new)
            ),
        }
    }
}

#[derive(Clone, Debug)]
struct Tail {
    address: Address,
    label: String,
}

/// Applies appends and verified replacements to a working image.
///
/// Appended blocks get their address as soon as they are appended, so it
/// can go straight into the bytes of a later replacement. Every replacement
/// checks the bytes it expects to find before writing anything; any
/// failure should end the build.
pub struct PatchEngine<A: Assembler> {
    rom: Rom,
    banks: BankAllocator,
    assembler: A,
    tails: Vec<Tail>,
    records: Vec<PatchRecord>,
}

impl<A: Assembler> PatchEngine<A> {
    pub fn new(rom: Rom, banks: BankAllocator, assembler: A) -> Self {
        PatchEngine {
            rom,
            banks,
            assembler,
            tails: Vec::new(),
            records: Vec::new(),
        }
    }

    pub fn rom(&self) -> &Rom {
        &self.rom
    }

    pub fn banks(&self) -> &BankAllocator {
        &self.banks
    }

    pub fn assembler(&self) -> &A {
        &self.assembler
    }

    pub fn records(&self) -> &[PatchRecord] {
        &self.records
    }

    /// Assemble `source` with the current symbol table.
    pub fn compile(&self, source: &str) -> Result<Vec<u8>> {
        Ok(self.assembler.compile(source)?)
    }

    pub fn get_def(&self, name: &str) -> Result<Address> {
        Ok(self.assembler.get_def(name)?)
    }

    /// Write `bytes` to the free space at the end of `bank` and return the
    /// address they landed at.
    pub fn append(&mut self, bank: u8, label: &str, bytes: &[u8]) -> Result<Address> {
        let before = self.banks.clone();
        let addr = self.banks.append(bank, bytes.len())?;
        if !bytes.is_empty() {
            if let Err(err) = self.rom.write_n(addr, bytes) {
                self.banks = before;
                return Err(err);
            }
        }
        debug!(%addr, label, len = bytes.len(), "append");
        self.records.push(PatchRecord {
            kind: PatchKind::Append,
            address: addr,
            label: label.to_string(),
            old: Vec::new(),
            new: bytes.to_vec(),
        });
        Ok(addr)
    }

    /// Assemble a routine, append it to `bank`, and make `name` usable as a
    /// symbol in later source.
    pub fn append_asm(&mut self, bank: u8, name: &str, source: &str) -> Result<Address> {
        let bytes = self.compile(source)?;
        // The name has to be free before any space is claimed.
        if let Ok(existing) = self.assembler.get_def(name) {
            return Err(AsmError::Redefined {
                name: name.to_string(),
                existing,
            }
            .into());
        }
        let addr = self.append(bank, name, &bytes)?;
        self.assembler.define(name, addr)?;
        Ok(addr)
    }

    /// Overwrite the bytes at `addr` with `new`, provided they currently
    /// read `old`. `old` and `new` may differ in length.
    pub fn replace(&mut self, addr: Address, label: &str, old: &[u8], new: &[u8]) -> Result<()> {
        self.verify(addr, label, old, new.len())?;
        self.write_replacement(addr, label, old, new)
    }

    /// Same substitution at several places. Every location is checked before
    /// any is written, so a mismatch anywhere leaves the image untouched.
    /// Locations whose ranges overlap are refused.
    pub fn replace_multiple(
        &mut self,
        addrs: &[Address],
        label: &str,
        old: &[u8],
        new: &[u8],
    ) -> Result<()> {
        let span = old.len().max(new.len());
        for (i, &first) in addrs.iter().enumerate() {
            for &second in &addrs[i + 1..] {
                if overlaps(first, second, span) {
                    return Err(RandomiserError::OverlappingLocations {
                        label: label.to_string(),
                        first,
                        second,
                    });
                }
            }
        }
        for &addr in addrs {
            self.verify(addr, label, old, new.len())?;
        }
        for &addr in addrs {
            self.write_replacement(addr, label, old, new)?;
        }
        Ok(())
    }

    /// Assemble both sides and replace. The new source doubles as the label.
    pub fn replace_asm(&mut self, addr: Address, old_source: &str, new_source: &str) -> Result<()> {
        let old = self.compile(old_source)?;
        let new = self.compile(new_source)?;
        self.replace(addr, new_source, &old, &new)
    }

    /// Reserve the rest of `bank` for a block whose size is only known later.
    /// No further appends to the bank are allowed after this.
    pub fn reserve_tail(&mut self, bank: u8, label: &str) -> Result<Address> {
        let addr = self.banks.reserve_tail(bank)?;
        debug!(%addr, label, "tail reserved");
        self.tails.push(Tail {
            address: addr,
            label: label.to_string(),
        });
        Ok(addr)
    }

    /// Write the content of a reserved tail block. Each tail is written once.
    pub fn fill_tail(&mut self, bank: u8, bytes: &[u8]) -> Result<Address> {
        let index = self
            .tails
            .iter()
            .position(|t| t.address.bank == bank)
            .ok_or_else(|| {
                RandomiserError::Config(format!("no unfilled tail block in bank {:02x}", bank))
            })?;
        let address = self.tails[index].address;
        let capacity = bank_capacity(bank);
        let attempted_end = u32::try_from(bytes.len())
            .ok()
            .and_then(|len| u32::from(address.offset).checked_add(len))
            .unwrap_or(u32::MAX);
        if attempted_end > capacity {
            return Err(RandomiserError::CapacityExceeded {
                bank,
                attempted_end,
                capacity,
            });
        }
        if !bytes.is_empty() {
            self.rom.write_n(address, bytes)?;
        }
        let tail = self.tails.remove(index);
        debug!(addr = %address, label = %tail.label, len = bytes.len(), "tail filled");
        self.records.push(PatchRecord {
            kind: PatchKind::Tail,
            address,
            label: tail.label,
            old: Vec::new(),
            new: bytes.to_vec(),
        });
        Ok(address)
    }

    /// End the build and hand back the image and the patch log.
    pub fn finish(self) -> (Rom, Vec<PatchRecord>) {
        (self.rom, self.records)
    }

    fn verify(&self, addr: Address, label: &str, old: &[u8], new_len: usize) -> Result<()> {
        let actual = self.rom.read_n(addr, old.len())?;
        if actual != old {
            return Err(RandomiserError::VerificationMismatch {
                label: label.to_string(),
                bank: addr.bank,
                address: addr.offset,
                expected: old.to_vec(),
                actual: actual.to_vec(),
            });
        }
        self.rom.check_write(addr, new_len)
    }

    fn write_replacement(&mut self, addr: Address, label: &str, old: &[u8], new: &[u8]) -> Result<()> {
        self.rom.write_n(addr, new)?;
        debug!(%addr, label, "replace");
        self.records.push(PatchRecord {
            kind: PatchKind::Replace,
            address: addr,
            label: label.to_string(),
            old: old.to_vec(),
            new: new.to_vec(),
        });
        Ok(())
    }
}

fn overlaps(a: Address, b: Address, span: usize) -> bool {
    if a.bank != b.bank || span == 0 {
        return false;
    }
    let (lo, hi) = if a.offset <= b.offset { (a, b) } else { (b, a) };
    usize::from(hi.offset - lo.offset) < span
}
