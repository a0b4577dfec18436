//! Page directory and page table entries for 32-bit x86.

use crate::PhysicalAddress;

use super::flags::PageFlags;

/// A single page directory or page table entry.
///
/// Entry format (`u32`):
/// - Bits 0-11: flags, fitting below the 12-bit page offset
/// - Bits 12-31: frame base bits of the 32-bit physical address
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct PageEntry(u32);

impl PageEntry {
    /// Frame address mask (bits 12-31, 4 KiB aligned).
    const ADDRESS_MASK: u32 = 0xFFFF_F000;

    /// Flag bits mask (bits 0-11).
    const FLAGS_MASK: u32 = 0x0000_0FFF;

    /// Creates a new entry pointing at a page-aligned physical address.
    pub fn new(address: PhysicalAddress, flags: PageFlags) -> Self {
        debug_assert!(
            address.as_usize() & (Self::FLAGS_MASK as usize) == 0,
            "physical address must be page-aligned (4 KiB alignment)"
        );
        let addr_bits = address.as_usize() as u32 & Self::ADDRESS_MASK;
        let flag_bits = flags.to_raw() as u32 & Self::FLAGS_MASK;
        Self(addr_bits | flag_bits)
    }

    /// Returns the physical address stored in this entry, or `None` if the
    /// entry is not present.
    pub fn address(self) -> Option<PhysicalAddress> {
        if self.is_present() {
            Some(PhysicalAddress::new((self.0 & Self::ADDRESS_MASK) as usize))
        } else {
            None
        }
    }

    /// Returns the flags of this entry.
    pub fn flags(self) -> PageFlags {
        PageFlags::from_raw((self.0 & Self::FLAGS_MASK) as usize)
    }

    /// Returns whether this entry is present.
    pub fn is_present(self) -> bool {
        self.flags().is_present()
    }

    /// Returns the raw value of this entry.
    pub const fn as_raw(self) -> u32 {
        self.0
    }
}

impl Default for PageEntry {
    fn default() -> Self {
        Self(0)
    }
}
