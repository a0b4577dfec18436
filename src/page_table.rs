//! Two-level page tables with fault-driven lazy allocation.
//!
//! Each [`PageTable`] owns one directory frame and, initially, one
//! second-level table that identity-maps the shared region. The last
//! directory slot maps the directory onto itself (see [`crate::selfmap`]),
//! which is what lets [`PageTable::handle_fault`] and
//! [`PageTable::free_page`] edit the active tables after translation is
//! enabled, without ever addressing them physically.
//!
//! A fault resolves exactly one missing translation level. An address with
//! both levels missing faults twice; the hardware re-dispatches the second
//! fault after the first returns.

use core::fmt;
use core::mem::size_of;

use crate::{
    AddressTranslator, AllocError, PageNumber, PhysicalAddress, VirtualAddress, VmContext, arch,
    arch::{PageEntry, PageFlags},
    selfmap,
};

/// Hardware cause bits of a translation fault.
///
/// The low three bits follow the x86 page-fault error code: bit 0 set means
/// the fault was a protection violation on a present page (clear means the
/// page was not present), bit 1 set means a write access, bit 2 set means a
/// user-mode access.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FaultCause(usize);

impl FaultCause {
    const PROTECTION: usize = 1 << 0;
    const WRITE: usize = 1 << 1;
    const USER: usize = 1 << 2;

    /// Wraps a raw hardware error code.
    pub const fn from_raw(raw: usize) -> Self {
        Self(raw)
    }

    /// Returns the raw hardware error code.
    pub const fn as_raw(self) -> usize {
        self.0
    }

    /// Whether the fault hit a present page with forbidden access rights.
    pub const fn is_protection_violation(self) -> bool {
        (self.0 & Self::PROTECTION) != 0
    }

    /// Whether the faulting access was a write.
    pub const fn is_write(self) -> bool {
        (self.0 & Self::WRITE) != 0
    }

    /// Whether the faulting access came from user mode.
    pub const fn is_user(self) -> bool {
        (self.0 & Self::USER) != 0
    }
}

impl fmt::Display for FaultCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} from {} mode",
            if self.is_protection_violation() {
                "protection violation"
            } else {
                "not-present"
            },
            if self.is_write() { "write" } else { "read" },
            if self.is_user() { "user" } else { "supervisor" },
        )
    }
}

/// The saved state of a translation fault, as read by the trap stub.
///
/// On hardware the stub builds this from the fault-address register and the
/// pushed error code; tests construct it directly.
#[derive(Debug, Clone, Copy)]
pub struct FaultContext {
    address: VirtualAddress,
    cause: FaultCause,
}

impl FaultContext {
    /// Creates a fault context for the given faulting address and cause.
    pub const fn new(address: VirtualAddress, cause: FaultCause) -> Self {
        Self { address, cause }
    }

    /// The faulting virtual address.
    pub const fn address(&self) -> VirtualAddress {
        self.address
    }

    /// The hardware cause bits.
    pub const fn cause(&self) -> FaultCause {
        self.cause
    }
}

/// What [`PageTable::handle_fault`] did to resolve a fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultResolution {
    /// A missing second-level table was allocated and installed; the faulting
    /// access will fault once more for its page.
    MappedTable,
    /// A missing data page was allocated and mapped.
    MappedPage,
}

/// A fault the handler could not resolve.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultError {
    /// No registered address-space pool claims the faulting address. Backing
    /// it would hand physical memory to an address outside every declared
    /// region, so this is fatal for the faulting context, not a condition
    /// the caller recovers from.
    Illegitimate(VirtualAddress),
    /// Both translation levels are already present; the access itself was
    /// forbidden. This design has no permission upgrades, so the fault
    /// cannot be resolved.
    ProtectionViolation(VirtualAddress),
    /// The process pool ran out of frames for the missing level.
    OutOfFrames,
}

impl fmt::Display for FaultError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Illegitimate(addr) => {
                write!(f, "fault at {addr}, outside every registered pool")
            }
            Self::ProtectionViolation(addr) => {
                write!(f, "access violation at {addr} on a fully mapped page")
            }
            Self::OutOfFrames => write!(f, "no frames left to back the faulting address"),
        }
    }
}

impl core::error::Error for FaultError {}

/// A two-level translation structure for one address space.
pub struct PageTable {
    /// Physical address of the directory frame.
    directory: PhysicalAddress,
}

impl PageTable {
    /// Builds the tables for a new address space.
    ///
    /// Allocates a directory frame and one table frame from the kernel pool,
    /// identity-maps the context's shared region through that table at
    /// directory slot 0, and installs the self-map in the last slot. All
    /// writes use physical addressing, so this must run before the table is
    /// active.
    pub fn new(ctx: &mut VmContext) -> Result<Self, AllocError> {
        let directory_frame = ctx.kernel_pool().lock().get_frames(1)?;
        let table_frame = match ctx.kernel_pool().lock().get_frames(1) {
            Ok(frame) => frame,
            Err(err) => {
                ctx.kernel_pool().lock().release_frames(directory_frame);
                return Err(err);
            }
        };

        let directory = directory_frame.base_address();
        let table = table_frame.base_address();

        // Identity-map the shared region, present and writable, supervisor
        // only. The rest of the table stays vacant.
        let shared_pages = ctx.shared_size() / arch::PAGE_SIZE;
        for index in 0..arch::TABLE_ENTRIES {
            let entry = if index < shared_pages {
                PageEntry::new(
                    PhysicalAddress::new(index * arch::PAGE_SIZE),
                    mapped_flags(),
                )
            } else {
                vacant_entry()
            };
            write_phys_entry(table, index, entry);
        }

        write_phys_entry(directory, 0, PageEntry::new(table, mapped_flags()));
        for slot in 1..selfmap::RECURSIVE_SLOT {
            write_phys_entry(directory, slot, vacant_entry());
        }
        write_phys_entry(
            directory,
            selfmap::RECURSIVE_SLOT,
            PageEntry::new(directory, mapped_flags()),
        );

        log::info!(
            "page table constructed: directory at {directory}, {} bytes shared",
            ctx.shared_size()
        );
        Ok(Self { directory })
    }

    /// Physical address of this table's directory frame.
    pub fn directory(&self) -> PhysicalAddress {
        self.directory
    }

    /// Makes this the active address space.
    ///
    /// Records the directory in the context and writes the translation-base
    /// register, which also discards any cached translations.
    pub fn load(&self, ctx: &mut VmContext) {
        ctx.set_active_directory(self.directory);
        // SAFETY: The directory was fully initialized by new(), including
        // the self-map and the identity-mapped shared region.
        unsafe { arch::set_translation_base(self.directory) };
        log::trace!("loaded address space with directory at {}", self.directory);
    }

    /// Turns translation on. Irreversible.
    ///
    /// # Panics
    ///
    /// Panics if this table is not the loaded one.
    pub fn enable_paging(&self, ctx: &mut VmContext) {
        assert!(
            self.is_active(ctx),
            "a page table must be loaded before paging is enabled"
        );
        ctx.set_paging_enabled();
        // SAFETY: This table is installed in the translation base and
        // identity-maps the shared region the kernel runs from.
        unsafe { arch::enable_translation() };
        log::info!("paging enabled");
    }

    /// Whether this table is the one installed in the translation base.
    pub fn is_active(&self, ctx: &VmContext) -> bool {
        ctx.active_directory() == Some(self.directory)
    }

    /// Resolves a translation fault by mapping exactly one missing level.
    ///
    /// The faulting address must lie inside a registered address-space pool;
    /// anything else is a trust violation and comes back as
    /// [`FaultError::Illegitimate`]. A missing second-level table is
    /// allocated from the process pool, installed, and cleared through its
    /// self-map window. A missing page gets a process-pool frame. If both
    /// levels are already present the access itself was forbidden and the
    /// fault is unresolvable.
    ///
    /// # Panics
    ///
    /// Panics if this table is not loaded or paging is not enabled; faults
    /// cannot occur before that point.
    pub fn handle_fault(
        &mut self,
        ctx: &mut VmContext,
        fault: &FaultContext,
    ) -> Result<FaultResolution, FaultError> {
        assert!(
            self.is_active(ctx) && ctx.paging_enabled(),
            "fault handling requires this table loaded and paging enabled"
        );

        let address = fault.address();
        log::trace!("translation fault at {address}: {}", fault.cause());

        if !ctx.is_legitimate(address) {
            log::warn!("fault at {address} is outside every registered pool");
            return Err(FaultError::Illegitimate(address));
        }

        let dir_index = address.directory_index();
        let table_index = address.table_index();

        let dir_entry = unsafe { self.directory_entry_ptr(dir_index).read() };
        if !dir_entry.is_present() {
            let frame = ctx
                .process_pool()
                .lock()
                .get_frames(1)
                .map_err(|_| FaultError::OutOfFrames)?;
            // Install the table first so its self-map window resolves, then
            // clear it through that window. It must start empty.
            unsafe {
                self.directory_entry_ptr(dir_index)
                    .write(PageEntry::new(frame.base_address(), mapped_flags()));
                for index in 0..arch::TABLE_ENTRIES {
                    self.table_entry_ptr(dir_index, index).write(vacant_entry());
                }
            }
            log::trace!("installed table for directory slot {dir_index} at frame {frame}");
            return Ok(FaultResolution::MappedTable);
        }

        let entry_ptr = self.table_entry_ptr(dir_index, table_index);
        let entry = unsafe { entry_ptr.read() };
        if entry.is_present() {
            log::warn!("unresolvable fault at {address}: {}", fault.cause());
            return Err(FaultError::ProtectionViolation(address));
        }

        let frame = ctx
            .process_pool()
            .lock()
            .get_frames(1)
            .map_err(|_| FaultError::OutOfFrames)?;
        unsafe { entry_ptr.write(PageEntry::new(frame.base_address(), mapped_flags())) };
        log::trace!("mapped page {} to frame {frame}", address.page_number());
        Ok(FaultResolution::MappedPage)
    }

    /// Unmaps `page` and returns its frame to the owning pool.
    ///
    /// A page whose directory entry or table entry is already absent is left
    /// alone. After unmapping, the table is reloaded to discard any cached
    /// translation for the entry.
    ///
    /// # Panics
    ///
    /// Panics if this table is not loaded; the table entries are reached
    /// through the self-map.
    pub fn free_page(&mut self, ctx: &mut VmContext, page: PageNumber) {
        assert!(
            self.is_active(ctx),
            "freeing pages requires this table loaded"
        );

        let address = page.base_address();
        let dir_index = address.directory_index();

        let dir_entry = unsafe { self.directory_entry_ptr(dir_index).read() };
        if !dir_entry.is_present() {
            log::trace!("free of page {page} with no second-level table");
            return;
        }

        let entry_ptr = self.table_entry_ptr(dir_index, address.table_index());
        let entry = unsafe { entry_ptr.read() };
        let Some(frame_address) = entry.address() else {
            log::trace!("free of unmapped page {page}");
            return;
        };

        ctx.registry().release_frames(frame_address.frame_number());
        unsafe { entry_ptr.write(vacant_entry()) };
        log::trace!("freed page {page}, was frame {}", frame_address.frame_number());

        // Full reload; this design has no single-entry invalidate.
        self.load(ctx);
    }

    /// Walks this table's entries by physical addressing and returns the
    /// physical address `vaddr` maps to, if both levels are present.
    ///
    /// This mirrors the hardware walk, and under emulation it is also how
    /// mapped memory is reached at all.
    pub fn translate(&self, vaddr: VirtualAddress) -> Option<PhysicalAddress> {
        let dir_entry = read_phys_entry(self.directory, vaddr.directory_index());
        let table = dir_entry.address()?;
        let entry = read_phys_entry(table, vaddr.table_index());
        let page = entry.address()?;
        Some(page + vaddr.page_offset())
    }

    /// Pointer to the active directory's entry at `index`, through the
    /// self-map.
    fn directory_entry_ptr(&self, index: usize) -> *mut PageEntry {
        self.window_ptr(selfmap::directory_address() + index * size_of::<PageEntry>())
    }

    /// Pointer to entry `index` of the active second-level table for
    /// directory `slot`, through the self-map.
    fn table_entry_ptr(&self, slot: usize, index: usize) -> *mut PageEntry {
        self.window_ptr(selfmap::table_address(slot) + index * size_of::<PageEntry>())
    }

    /// Turns a self-map window address into a dereferenceable pointer.
    ///
    /// On hardware the window address is simply dereferenced; the MMU walk
    /// through the recursive slot does the rest. Under emulation the walk is
    /// performed in software against this table's entries.
    fn window_ptr(&self, vaddr: VirtualAddress) -> *mut PageEntry {
        match AddressTranslator::current() {
            AddressTranslator::Hardware { .. } => vaddr.as_mut_ptr(),
            #[cfg(not(all(
                target_arch = "x86",
                target_os = "none",
                not(feature = "software-emulation")
            )))]
            AddressTranslator::Emulated(_) => {
                let phys = self
                    .translate(vaddr)
                    .expect("self-map window is mapped by construction");
                AddressTranslator::current().phys_to_ptr(phys.as_usize())
            }
        }
    }
}

impl fmt::Debug for PageTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PageTable")
            .field("directory", &self.directory)
            .finish()
    }
}

/// Flags for a live mapping: present, writable, supervisor only.
fn mapped_flags() -> PageFlags {
    let mut flags = PageFlags::empty();
    flags.set_present(true);
    flags.set_writable(true);
    flags
}

/// An absent entry, kept writable by convention.
fn vacant_entry() -> PageEntry {
    let mut flags = PageFlags::empty();
    flags.set_writable(true);
    PageEntry::new(PhysicalAddress::new(0), flags)
}

fn read_phys_entry(table: PhysicalAddress, index: usize) -> PageEntry {
    let ptr = AddressTranslator::current()
        .phys_to_ptr::<PageEntry>(table.as_usize() + index * size_of::<PageEntry>());
    // SAFETY: The entry lies inside a table frame owned by a PageTable.
    unsafe { ptr.read() }
}

fn write_phys_entry(table: PhysicalAddress, index: usize, entry: PageEntry) {
    let ptr = AddressTranslator::current()
        .phys_to_ptr::<PageEntry>(table.as_usize() + index * size_of::<PageEntry>());
    // SAFETY: As in read_phys_entry.
    unsafe { ptr.write(entry) };
}
