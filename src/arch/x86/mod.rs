//! 32-bit x86 two-level paging backend.
//!
//! Constants and control-register access for real hardware: 4 KiB pages, a
//! 1024-entry page directory whose entries point at 1024-entry page tables.
//! Register access goes through the `x86` crate.

mod entry;
mod flags;

pub use entry::PageEntry;
pub use flags::PageFlags;

/// Maximum number of bits in a physical address.
pub const MAX_PHYSICAL_BITS: usize = 32;

/// Maximum number of bits in a virtual address.
pub const MAX_VIRTUAL_BITS: usize = 32;

/// Page and frame size in bytes.
pub const PAGE_SIZE: usize = 4096;

/// Number of entries in the directory and in each page table.
pub const TABLE_ENTRIES: usize = 1024;

/// Number of translation levels (level 1 = directory, level 0 = table).
pub const PAGE_TABLE_LEVELS: usize = 2;

/// Number of address bits consumed by the page offset.
pub const PAGE_OFFSET_BITS: usize = 12;

/// Number of address bits consumed by each translation level.
pub const LEVEL_INDEX_BITS: usize = 10;

/// Returns the translation index for a virtual address at the given level.
///
/// - Level 0: bits 12-21 (page table index)
/// - Level 1: bits 22-31 (directory index)
#[inline]
pub const fn page_index(address: usize, level: usize) -> usize {
    assert!(level < PAGE_TABLE_LEVELS, "level out of range (0-1)");
    let shift = PAGE_OFFSET_BITS + level * LEVEL_INDEX_BITS;
    (address >> shift) & ((1 << LEVEL_INDEX_BITS) - 1)
}

/// Validates a physical address: it must fit within 32 bits.
#[inline]
pub const fn validate_physical(addr: usize) -> bool {
    addr <= 0xFFFF_FFFF
}

/// Validates a virtual address: the full 32-bit space is canonical.
#[inline]
pub const fn validate_virtual(addr: usize) -> bool {
    addr <= 0xFFFF_FFFF
}

/// Canonicalizes a virtual address. Identity on 32-bit x86.
#[inline]
pub const fn canonicalize_virtual(addr: usize) -> usize {
    addr & 0xFFFF_FFFF
}

/// Installs a directory's physical address into CR3.
///
/// # Safety
///
/// The directory must be fully initialized, including its self-map entry,
/// and must identity-map (or otherwise keep reachable) the code performing
/// the switch.
pub unsafe fn set_translation_base(directory: crate::PhysicalAddress) {
    unsafe { x86::controlregs::cr3_write(directory.as_usize() as u64) };
}

/// Sets the paging-enable bit in CR0.
///
/// # Safety
///
/// A valid directory must have been installed into CR3 first. There is no
/// way back: this backend does not support disabling translation.
pub unsafe fn enable_translation() {
    unsafe {
        let cr0 = x86::controlregs::cr0();
        x86::controlregs::cr0_write(cr0 | x86::controlregs::Cr0::CR0_ENABLE_PAGING);
    }
}

/// Reads the faulting virtual address (CR2) after a translation fault.
pub fn read_fault_address() -> usize {
    unsafe { x86::controlregs::cr2() }
}

/// Unmasks interrupts (STI).
///
/// # Safety
///
/// The caller must be prepared to take interrupts from this point on.
pub unsafe fn enable_interrupts() {
    unsafe { x86::irq::enable() };
}

/// Masks interrupts (CLI).
///
/// # Safety
///
/// Pending interrupts stay pending until interrupts are unmasked again.
pub unsafe fn disable_interrupts() {
    unsafe { x86::irq::disable() };
}

/// Returns whether the interrupt flag is set in EFLAGS.
pub fn interrupts_enabled() -> bool {
    x86::bits32::eflags::read().contains(x86::bits32::eflags::EFlags::FLAGS_IF)
}
