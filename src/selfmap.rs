//! Recursive self-map address arithmetic.
//!
//! The last directory slot of every address space points back at the
//! directory itself. Translating an address whose directory index is that
//! slot therefore short-circuits one level of the hierarchy: the directory is
//! reached as if it were a second-level table, and its entries are reached as
//! if they were data pages. That yields fixed virtual addresses for editing
//! the active directory and any of its tables after translation is enabled.
//!
//! All self-map address computation lives here; nothing else in the crate
//! builds these addresses inline.

use crate::{VirtualAddress, arch};

/// The directory slot reserved for the self-map.
pub(crate) const RECURSIVE_SLOT: usize = arch::TABLE_ENTRIES - 1;

/// Virtual address at which the active directory appears as a data page.
///
/// Both translation indices name the recursive slot, so the walk lands on
/// the directory frame itself.
pub(crate) fn directory_address() -> VirtualAddress {
    VirtualAddress::new(arch::canonicalize_virtual(
        ((RECURSIVE_SLOT << arch::LEVEL_INDEX_BITS) | RECURSIVE_SLOT) << arch::PAGE_OFFSET_BITS,
    ))
}

/// Virtual address at which the active second-level table for directory
/// `slot` appears as a data page.
///
/// # Panics
///
/// Panics if `slot` is not a valid directory index.
pub(crate) fn table_address(slot: usize) -> VirtualAddress {
    assert!(slot < arch::TABLE_ENTRIES, "directory slot out of range");
    VirtualAddress::new(arch::canonicalize_virtual(
        (RECURSIVE_SLOT << (arch::LEVEL_INDEX_BITS + arch::PAGE_OFFSET_BITS))
            | (slot << arch::PAGE_OFFSET_BITS),
    ))
}
