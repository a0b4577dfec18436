//! Directory and table entries for the software scale model.

use crate::PhysicalAddress;

use super::flags::PageFlags;

/// A single directory or table entry.
///
/// Entry format (`u16`):
/// - Bits 0-5: flags, fitting below the 6-bit page offset
/// - Bits 6-15: frame base bits of the 16-bit physical address
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct PageEntry(u16);

impl PageEntry {
    /// Frame address mask (bits 6-15, 64-byte aligned).
    const ADDRESS_MASK: u16 = 0xFFC0;

    /// Flag bits mask (bits 0-5).
    const FLAGS_MASK: u16 = 0x003F;

    /// Creates a new entry pointing at a page-aligned physical address.
    pub fn new(address: PhysicalAddress, flags: PageFlags) -> Self {
        debug_assert!(
            address.as_usize() & (Self::FLAGS_MASK as usize) == 0,
            "physical address must be page-aligned (64-byte alignment)"
        );
        let addr_bits = address.as_usize() as u16 & Self::ADDRESS_MASK;
        let flag_bits = flags.to_raw() as u16 & Self::FLAGS_MASK;
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
    pub const fn as_raw(self) -> u16 {
        self.0
    }
}

impl Default for PageEntry {
    fn default() -> Self {
        Self(0)
    }
}
