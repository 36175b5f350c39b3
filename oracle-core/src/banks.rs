use tracing::debug;

use crate::rom::{bank_base, bank_capacity, Address, BANK_COUNT};
use crate::{RandomiserError, Result};

#[derive(Copy, Clone, Debug, Default)]
struct BankState {
    cursor: Option<u16>,
    sealed: bool,
}

/// Append-only free-space cursors, one per bank.
///
/// Each cursor starts at the end of the content the base image already
/// uses in that bank and only ever moves forward. A bank with no starting
/// cursor has no known free space and refuses appends.
#[derive(Clone, Debug)]
pub struct BankAllocator {
    banks: [BankState; BANK_COUNT],
}

impl BankAllocator {
    /// Build from `(bank, end_of_used_content)` pairs. Later entries for the
    /// same bank replace earlier ones.
    pub fn new<I>(end_of_bank: I) -> Result<Self>
    where
        I: IntoIterator<Item = (u8, u16)>,
    {
        let mut banks = [BankState::default(); BANK_COUNT];
        for (bank, cursor) in end_of_bank {
            if bank as usize >= BANK_COUNT {
                return Err(RandomiserError::BankUnavailable(bank));
            }
            let base = bank_base(bank);
            if cursor < base || u32::from(cursor) > bank_capacity(bank) {
                return Err(RandomiserError::Config(format!(
                    "end-of-bank cursor {:04x} lies outside bank {:02x}",
                    cursor, bank
                )));
            }
            banks[bank as usize].cursor = Some(cursor);
        }
        Ok(BankAllocator { banks })
    }

    fn state(&self, bank: u8) -> Result<&BankState> {
        self.banks
            .get(bank as usize)
            .ok_or(RandomiserError::BankUnavailable(bank))
    }

    /// Current end of used content in `bank`.
    pub fn cursor(&self, bank: u8) -> Option<Address> {
        self.banks
            .get(bank as usize)
            .and_then(|s| s.cursor)
            .map(|c| Address::new(bank, c))
    }

    pub fn is_sealed(&self, bank: u8) -> bool {
        self.banks.get(bank as usize).map_or(false, |s| s.sealed)
    }

    /// Bytes left between the cursor and the end of the bank.
    pub fn remaining(&self, bank: u8) -> u32 {
        self.cursor(bank)
            .map_or(0, |a| bank_capacity(bank) - u32::from(a.offset))
    }

    /// Claim `len` bytes at the end of `bank` and return where they start.
    /// On failure the cursor is left where it was.
    pub fn append(&mut self, bank: u8, len: usize) -> Result<Address> {
        let state = self.state(bank)?;
        if state.sealed {
            return Err(RandomiserError::BankSealed(bank));
        }
        let cursor = state.cursor.ok_or(RandomiserError::BankUnavailable(bank))?;

        let capacity = bank_capacity(bank);
        let attempted_end = u32::try_from(len)
            .ok()
            .and_then(|len| u32::from(cursor).checked_add(len))
            .unwrap_or(u32::MAX);
        if attempted_end > capacity {
            return Err(RandomiserError::CapacityExceeded {
                bank,
                attempted_end,
                capacity,
            });
        }

        // attempted_end <= 0x8000, so it fits the cursor type.
        self.banks[bank as usize].cursor = Some(attempted_end as u16);
        debug!(bank, addr = cursor, len, "bank append");
        Ok(Address::new(bank, cursor))
    }

    /// Hand out the rest of `bank` as its final block and refuse any further
    /// appends there. Content for the block can grow until the bank is full.
    pub fn reserve_tail(&mut self, bank: u8) -> Result<Address> {
        let state = self.state(bank)?;
        if state.sealed {
            return Err(RandomiserError::BankSealed(bank));
        }
        let cursor = state.cursor.ok_or(RandomiserError::BankUnavailable(bank))?;
        self.banks[bank as usize].sealed = true;
        debug!(bank, addr = cursor, "bank tail reserved");
        Ok(Address::new(bank, cursor))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn allocator() -> BankAllocator {
        BankAllocator::new([(0x00, 0x3ef8), (0x06, 0x7a31), (0x38, 0x6b00)]).unwrap()
    }

    #[test]
    fn first_append_starts_at_table_cursor() {
        let mut banks = allocator();
        let addr = banks.append(0x06, 4).unwrap();
        assert_eq!(addr, Address::new(0x06, 0x7a31));
        assert_eq!(banks.cursor(0x06), Some(Address::new(0x06, 0x7a35)));
    }

    #[test]
    fn consecutive_appends_are_adjacent() {
        let mut banks = allocator();
        let a = banks.append(0x38, 3).unwrap();
        let b = banks.append(0x38, 10).unwrap();
        assert_eq!(b.offset, a.offset + 3);
        assert_eq!(banks.cursor(0x38).unwrap().offset, a.offset + 13);
    }

    #[test]
    fn overflow_leaves_cursor_alone() {
        let mut banks = allocator();
        let before = banks.cursor(0x00);
        let err = banks.append(0x00, 0x200).unwrap_err();
        match err {
            RandomiserError::CapacityExceeded {
                bank,
                attempted_end,
                capacity,
            } => {
                assert_eq!(bank, 0x00);
                assert_eq!(attempted_end, 0x40f8);
                assert_eq!(capacity, 0x4000);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(banks.cursor(0x00), before);
    }

    #[test]
    fn filling_a_bank_exactly_is_allowed() {
        let mut banks = allocator();
        banks.append(0x00, 0x108).unwrap();
        assert_eq!(banks.remaining(0x00), 0);
        assert!(banks.append(0x00, 1).is_err());
        assert!(banks.append(0x00, 0).is_ok());
    }

    #[test]
    fn banks_without_a_cursor_refuse_appends() {
        let mut banks = allocator();
        assert!(matches!(
            banks.append(0x07, 1),
            Err(RandomiserError::BankUnavailable(0x07))
        ));
        assert!(matches!(
            banks.append(0x40, 1),
            Err(RandomiserError::BankUnavailable(0x40))
        ));
    }

    #[test]
    fn sealed_bank_refuses_appends() {
        let mut banks = allocator();
        let tail = banks.reserve_tail(0x38).unwrap();
        assert_eq!(tail, Address::new(0x38, 0x6b00));
        assert!(banks.is_sealed(0x38));
        assert!(matches!(
            banks.append(0x38, 1),
            Err(RandomiserError::BankSealed(0x38))
        ));
        assert!(banks.reserve_tail(0x38).is_err());
    }

    #[test]
    fn rejects_cursor_outside_the_bank_window() {
        assert!(BankAllocator::new([(0x05, 0x3000)]).is_err());
        assert!(BankAllocator::new([(0x00, 0x4001)]).is_err());
    }

    proptest! {
        #[test]
        fn appends_never_overlap(lens in proptest::collection::vec(0usize..0x80, 1..40)) {
            let mut banks = BankAllocator::new([(0x06, 0x7a31)]).unwrap();
            let mut expected = 0x7a31u32;
            for len in lens {
                match banks.append(0x06, len) {
                    Ok(addr) => {
                        prop_assert_eq!(u32::from(addr.offset), expected);
                        expected += len as u32;
                    }
                    Err(RandomiserError::CapacityExceeded { .. }) => {
                        prop_assert!(expected + len as u32 > 0x8000);
                    }
                    Err(other) => return Err(TestCaseError::fail(other.to_string())),
                }
                prop_assert_eq!(u32::from(banks.cursor(0x06).unwrap().offset), expected);
            }
        }
    }
}
