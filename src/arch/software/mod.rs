//! Software scale model of the paging hardware.
//!
//! This backend runs on any host and is what the test suite exercises. It is
//! a scale model of 32-bit x86 two-level paging:
//!
//! - 16-bit addresses (vs 32-bit on x86), canonical as sign-extensions of
//!   bit 15 into the host word
//! - 64-byte pages (vs 4 KiB)
//! - 2 levels of translation, 5 index bits each (32 entries per table,
//!   vs 10 bits/1024 entries)
//! - 2-byte table entries, so a full table is exactly one page, which is the
//!   property the recursive self-map arithmetic depends on at either scale
//!
//! Physical memory is a plain in-process buffer; there is no MMU, so the
//! higher layers walk the active table in software where hardware would
//! translate.

mod entry;
mod flags;

pub use entry::PageEntry;
pub use flags::PageFlags;

/// Maximum number of bits in a physical address for the scale model.
pub const MAX_PHYSICAL_BITS: usize = 16;

/// Maximum number of bits in a virtual address for the scale model.
pub const MAX_VIRTUAL_BITS: usize = 16;

/// Page and frame size in bytes.
pub const PAGE_SIZE: usize = 64;

/// Number of entries in one directory or table.
pub const TABLE_ENTRIES: usize = 32;

/// Number of translation levels (level 1 = directory, level 0 = table).
pub const PAGE_TABLE_LEVELS: usize = 2;

/// Number of address bits consumed by the page offset.
pub const PAGE_OFFSET_BITS: usize = 6;

/// Number of address bits consumed by each translation level.
pub const LEVEL_INDEX_BITS: usize = 5;

/// Returns the translation index for a virtual address at the given level.
///
/// - Level 0: bits 6-10 (second-level table index)
/// - Level 1: bits 11-15 (directory index)
#[inline]
pub const fn page_index(address: usize, level: usize) -> usize {
    assert!(level < PAGE_TABLE_LEVELS, "level out of range (0-1)");
    let shift = PAGE_OFFSET_BITS + level * LEVEL_INDEX_BITS;
    (address >> shift) & ((1 << LEVEL_INDEX_BITS) - 1)
}

/// Validates a physical address: it must fit within 16 bits.
#[inline]
pub const fn validate_physical(addr: usize) -> bool {
    addr <= 0xFFFF
}

/// Validates a virtual address: bits 16 and up must be the sign-extension of
/// bit 15.
#[inline]
pub const fn validate_virtual(addr: usize) -> bool {
    canonicalize_virtual(addr) == addr
}

/// Canonicalizes a virtual address by sign-extending bit 15.
#[inline]
pub const fn canonicalize_virtual(addr: usize) -> usize {
    if (addr & 0x8000) != 0 {
        addr | !0xFFFF
    } else {
        addr & 0xFFFF
    }
}

/// Installs a directory as the translation base.
///
/// The scale model has no translation-base register; the active directory is
/// tracked by [`crate::VmContext`], so this is a no-op.
///
/// # Safety
///
/// The directory must be fully initialized, including its self-map entry.
pub unsafe fn set_translation_base(_directory: crate::PhysicalAddress) {}

/// Turns on address translation.
///
/// The scale model has no translation-enable bit; the flag lives in
/// [`crate::VmContext`], so this is a no-op.
///
/// # Safety
///
/// A valid directory must have been installed first.
pub unsafe fn enable_translation() {}

std::thread_local! {
    // Interrupts start masked, as they are when a kernel boots.
    static INTERRUPTS_ENABLED: core::cell::Cell<bool> = const { core::cell::Cell::new(false) };
}

/// Unmasks interrupts for the current thread of control.
///
/// # Safety
///
/// The caller must be prepared to take interrupts from this point on.
pub unsafe fn enable_interrupts() {
    INTERRUPTS_ENABLED.with(|flag| flag.set(true));
}

/// Masks interrupts for the current thread of control.
///
/// # Safety
///
/// Pending interrupts stay pending until interrupts are unmasked again.
pub unsafe fn disable_interrupts() {
    INTERRUPTS_ENABLED.with(|flag| flag.set(false));
}

/// Returns whether interrupts are currently unmasked.
pub fn interrupts_enabled() -> bool {
    INTERRUPTS_ENABLED.with(|flag| flag.get())
}

/// Emulated physical memory for the scale model.
///
/// Provides a simulated physical address space so frame pools and page tables
/// can be exercised without hardware. Backed by a `u64` slab so that
/// frame-aligned offsets keep host alignment for entry and region records.
pub struct EmulatedMemory {
    memory: alloc::boxed::Box<[u64]>,
}

impl EmulatedMemory {
    /// Creates an emulated physical memory of `size` bytes.
    ///
    /// # Panics
    ///
    /// Panics if `size` is not a multiple of the page size or exceeds the
    /// 16-bit physical address space.
    pub fn new(size: usize) -> Self {
        assert!(size % PAGE_SIZE == 0, "memory size must be page-granular");
        assert!(validate_physical(size - 1), "memory exceeds physical space");
        Self {
            memory: alloc::vec![0u64; size / 8].into_boxed_slice(),
        }
    }

    /// Translates a physical address to a host pointer into the buffer.
    pub fn translate(&self, phys: usize) -> *mut u8 {
        assert!(phys < self.size(), "physical address out of bounds");
        unsafe { (self.memory.as_ptr() as *mut u8).add(phys) }
    }

    /// Returns the size of the emulated physical memory in bytes.
    pub fn size(&self) -> usize {
        self.memory.len() * 8
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_index_splits_the_address() {
        // 0b11111_00001_000000: directory 31, table 1.
        let addr = (31 << 11) | (1 << 6);
        assert_eq!(page_index(addr, 1), 31);
        assert_eq!(page_index(addr, 0), 1);
    }

    #[test]
    fn canonical_form_sign_extends_bit_15() {
        assert_eq!(canonicalize_virtual(0x7FFF), 0x7FFF);
        assert_eq!(canonicalize_virtual(0x8000), usize::MAX - 0xFFFF + 0x8000);
        assert!(validate_virtual(canonicalize_virtual(0xFFC0)));
        assert!(!validate_virtual(0x8000));
    }

    #[test]
    fn interrupt_flag_round_trips() {
        assert!(!interrupts_enabled());
        unsafe { enable_interrupts() };
        assert!(interrupts_enabled());
        unsafe { disable_interrupts() };
        assert!(!interrupts_enabled());
    }

    #[test]
    fn emulated_memory_starts_zeroed() {
        let memory = EmulatedMemory::new(4 * PAGE_SIZE);
        assert_eq!(memory.size(), 4 * PAGE_SIZE);
        for offset in [0, PAGE_SIZE, 4 * PAGE_SIZE - 1] {
            assert_eq!(unsafe { memory.translate(offset).read() }, 0);
        }
    }

    #[test]
    #[should_panic(expected = "out of bounds")]
    fn out_of_bounds_translation_is_rejected() {
        let memory = EmulatedMemory::new(PAGE_SIZE);
        memory.translate(PAGE_SIZE);
    }
}
