//! Process-wide virtual-memory execution context.
//!
//! All the state that would otherwise live in process-wide globals is held
//! here instead: which pools back table metadata and data pages, the
//! frame-pool registry, the active directory, the paging flag, and the list of
//! address ranges that are legitimate to back on demand. Operations that need
//! this state take the context explicitly.

use alloc::sync::Arc;
use alloc::vec::Vec;
use spin::Mutex;

use crate::{FramePool, FramePoolRegistry, PhysicalAddress, VirtualAddress, arch};

/// A half-open range of virtual addresses, `[base, base + size)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressRange {
    base: VirtualAddress,
    size: usize,
}

impl AddressRange {
    /// Creates a range of `size` bytes starting at `base`.
    ///
    /// # Panics
    ///
    /// Panics if `size` is zero.
    pub fn new(base: VirtualAddress, size: usize) -> Self {
        assert!(size > 0, "address range must not be empty");
        Self { base, size }
    }

    /// First address of the range.
    pub fn base(&self) -> VirtualAddress {
        self.base
    }

    /// Length of the range in bytes.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Checks whether `address` lies inside the range.
    pub fn contains(&self, address: VirtualAddress) -> bool {
        // Wrapping keeps this correct for ranges in the sign-extended upper
        // half of the canonical space.
        address.as_usize().wrapping_sub(self.base.as_usize()) < self.size
    }
}

/// The virtual-memory execution context, created once at boot.
///
/// Carries the process-wide configuration: the registry of frame pools, the
/// pool that backs page-table metadata (the kernel pool), the pool that backs
/// demand-allocated pages (the process pool), and the size of the region
/// identity-mapped into every address space.
pub struct VmContext {
    registry: FramePoolRegistry,
    kernel_pool: Arc<Mutex<FramePool>>,
    process_pool: Arc<Mutex<FramePool>>,
    shared_size: usize,
    active_directory: Option<PhysicalAddress>,
    paging_enabled: bool,
    ranges: Vec<AddressRange>,
}

impl VmContext {
    /// Creates the context.
    ///
    /// `shared_size` bytes of physical memory, starting at address zero, are
    /// identity-mapped into every address space built against this context.
    ///
    /// # Panics
    ///
    /// Panics if `shared_size` is zero, not page-aligned, or larger than a
    /// single second-level table covers.
    pub fn new(
        registry: FramePoolRegistry,
        kernel_pool: Arc<Mutex<FramePool>>,
        process_pool: Arc<Mutex<FramePool>>,
        shared_size: usize,
    ) -> Self {
        assert!(shared_size > 0, "shared region must not be empty");
        assert!(
            shared_size % arch::PAGE_SIZE == 0,
            "shared region size must be page-aligned"
        );
        assert!(
            shared_size <= arch::PAGE_SIZE * arch::TABLE_ENTRIES,
            "shared region must fit in one second-level table"
        );

        Self {
            registry,
            kernel_pool,
            process_pool,
            shared_size,
            active_directory: None,
            paging_enabled: false,
            ranges: Vec::new(),
        }
    }

    /// The process-wide frame-pool registry.
    pub fn registry(&self) -> &FramePoolRegistry {
        &self.registry
    }

    /// Mutable access to the frame-pool registry, for registering pools
    /// created after boot.
    pub fn registry_mut(&mut self) -> &mut FramePoolRegistry {
        &mut self.registry
    }

    /// The pool backing page-table metadata (directories and tables built at
    /// construction time).
    pub fn kernel_pool(&self) -> &Arc<Mutex<FramePool>> {
        &self.kernel_pool
    }

    /// The pool backing demand-allocated tables and data pages.
    pub fn process_pool(&self) -> &Arc<Mutex<FramePool>> {
        &self.process_pool
    }

    /// Size in bytes of the identity-mapped shared region.
    pub fn shared_size(&self) -> usize {
        self.shared_size
    }

    /// Physical address of the directory currently installed in the
    /// translation-base register, if any.
    pub fn active_directory(&self) -> Option<PhysicalAddress> {
        self.active_directory
    }

    pub(crate) fn set_active_directory(&mut self, directory: PhysicalAddress) {
        self.active_directory = Some(directory);
    }

    /// Whether translation has been enabled.
    pub fn paging_enabled(&self) -> bool {
        self.paging_enabled
    }

    pub(crate) fn set_paging_enabled(&mut self) {
        self.paging_enabled = true;
    }

    /// Registers an address range as legitimate for demand allocation.
    ///
    /// Called by each address-space pool at construction. Append-only; ranges
    /// are never unregistered in this design.
    pub fn register_pool(&mut self, range: AddressRange) {
        // The end is formatted raw: for a range ending exactly at the
        // canonical boundary, one-past-the-end is not a valid address.
        log::trace!(
            "registered address-space pool [{}, {:#x})",
            range.base(),
            range.base().as_usize().wrapping_add(range.size())
        );
        self.ranges.push(range);
    }

    /// The registered address ranges, in registration order.
    pub fn registered_ranges(&self) -> &[AddressRange] {
        &self.ranges
    }

    /// Checks whether some registered range contains `address`.
    pub fn is_legitimate(&self, address: VirtualAddress) -> bool {
        self.ranges.iter().any(|range| range.contains(address))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{AddressTranslator, FrameNumber};

    fn setup() -> VmContext {
        if AddressTranslator::try_current().is_none() {
            AddressTranslator::set_current(AddressTranslator::emulated(256 * arch::PAGE_SIZE));
        }
        let kernel = Arc::new(Mutex::new(FramePool::new(FrameNumber::new(32), 32, None)));
        let process = Arc::new(Mutex::new(FramePool::new(FrameNumber::new(64), 128, None)));
        let mut registry = FramePoolRegistry::new();
        registry.register(kernel.clone());
        registry.register(process.clone());
        VmContext::new(registry, kernel, process, 32 * arch::PAGE_SIZE)
    }

    #[test]
    fn range_membership() {
        let range = AddressRange::new(VirtualAddress::new(0x2000), 2 * arch::PAGE_SIZE);
        assert!(range.contains(VirtualAddress::new(0x2000)));
        assert!(range.contains(VirtualAddress::new(0x2000 + 2 * arch::PAGE_SIZE - 1)));
        assert!(!range.contains(VirtualAddress::new(0x2000 + 2 * arch::PAGE_SIZE)));
        assert!(!range.contains(VirtualAddress::new(0x1FFF)));
    }

    #[test]
    fn upper_half_range_membership() {
        let base = VirtualAddress::new(arch::canonicalize_virtual(
            (1 << arch::MAX_VIRTUAL_BITS) - 2 * arch::PAGE_SIZE,
        ));
        let range = AddressRange::new(base, arch::PAGE_SIZE);
        assert!(range.contains(base));
        assert!(range.contains(base + (arch::PAGE_SIZE - 1)));
        assert!(!range.contains(base + arch::PAGE_SIZE));
    }

    #[test]
    fn legitimacy_consults_registered_ranges() {
        let mut ctx = setup();
        let probe = VirtualAddress::new(0x2000);
        assert!(!ctx.is_legitimate(probe));

        ctx.register_pool(AddressRange::new(probe, 4 * arch::PAGE_SIZE));
        assert!(ctx.is_legitimate(probe));
        assert!(ctx.is_legitimate(probe + 4 * arch::PAGE_SIZE - 1));
        assert!(!ctx.is_legitimate(probe + 4 * arch::PAGE_SIZE));
    }

    struct QuietLogger;

    impl log::Log for QuietLogger {
        fn enabled(&self, _metadata: &log::Metadata) -> bool {
            true
        }

        fn log(&self, _record: &log::Record) {}

        fn flush(&self) {}
    }

    #[test]
    fn boundary_ending_range_registers_with_logging_enabled() {
        // Force the trace line in register_pool to actually format its
        // arguments. Another test may have installed a logger already.
        let _ = log::set_logger(&QuietLogger);
        log::set_max_level(log::LevelFilter::Trace);

        let mut ctx = setup();
        // A pool ending exactly at the canonical boundary: every address in
        // it is valid, but one-past-the-end is not.
        let base = VirtualAddress::new(0x7000);
        ctx.register_pool(AddressRange::new(base, 0x1000));
        assert!(ctx.is_legitimate(VirtualAddress::new(0x7FFF)));
    }

    #[test]
    fn context_starts_unloaded() {
        let ctx = setup();
        assert!(ctx.active_directory().is_none());
        assert!(!ctx.paging_enabled());
        assert_eq!(ctx.shared_size(), 32 * arch::PAGE_SIZE);
    }

    #[test]
    #[should_panic(expected = "one second-level table")]
    fn oversized_shared_region_is_rejected() {
        AddressTranslator::set_current(AddressTranslator::emulated(256 * arch::PAGE_SIZE));
        let kernel = Arc::new(Mutex::new(FramePool::new(FrameNumber::new(32), 32, None)));
        let process = kernel.clone();
        VmContext::new(
            FramePoolRegistry::new(),
            kernel,
            process,
            arch::PAGE_SIZE * (arch::TABLE_ENTRIES + 1),
        );
    }
}
