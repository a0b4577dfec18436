//! Per-address-space region allocation.
//!
//! An [`AddressSpacePool`] carves one virtual range into variable-sized
//! regions. The region records live in the pool's own first page, which is
//! reserved and never offered to callers; like any other page in the pool it
//! is backed lazily, so the pool consumes no frames until its first
//! allocation. Registering the pool's range with the [`VmContext`] is what
//! makes faults inside it legitimate.

use core::mem::size_of;

use alloc::sync::Arc;
use spin::Mutex;

use crate::{
    AddressRange, AddressTranslator, AllocError, PageTable, VirtualAddress, VmContext, arch,
};

#[cfg(not(all(target_arch = "x86", target_os = "none", not(feature = "software-emulation"))))]
use crate::{FaultCause, FaultContext, FaultError};

/// One allocated region, as stored in the pool's reserved first page.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
struct Region {
    start: usize,
    size: usize,
}

/// A region allocator over one virtual address range.
pub struct AddressSpacePool {
    base: VirtualAddress,
    size: usize,
    page_table: Arc<Mutex<PageTable>>,
    region_count: usize,
}

impl AddressSpacePool {
    /// Creates a pool over `[base, base + size)` and registers that range
    /// with the context.
    ///
    /// The first page of the range is reserved for the pool's region array.
    ///
    /// # Panics
    ///
    /// Panics if `base` or `size` is not page-aligned, or if the pool is not
    /// at least two pages (the reserved page plus something to hand out).
    pub fn new(
        base: VirtualAddress,
        size: usize,
        page_table: Arc<Mutex<PageTable>>,
        ctx: &mut VmContext,
    ) -> Self {
        assert!(base.is_aligned(arch::PAGE_SIZE), "pool base must be page-aligned");
        assert!(size % arch::PAGE_SIZE == 0, "pool size must be page-aligned");
        assert!(
            size >= 2 * arch::PAGE_SIZE,
            "pool must be larger than its reserved first page"
        );

        ctx.register_pool(AddressRange::new(base, size));
        // One-past-the-end of a boundary-ending pool is not a valid address,
        // so the end is formatted raw.
        log::info!(
            "address-space pool created over [{base}, {:#x})",
            base.as_usize().wrapping_add(size)
        );
        Self {
            base,
            size,
            page_table,
            region_count: 0,
        }
    }

    /// First address of the pool's range.
    pub fn base(&self) -> VirtualAddress {
        self.base
    }

    /// Length of the pool's range in bytes.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Number of live regions.
    pub fn region_count(&self) -> usize {
        self.region_count
    }

    /// Number of regions the reserved first page can record.
    pub const fn region_capacity() -> usize {
        arch::PAGE_SIZE / size_of::<Region>()
    }

    /// Allocates a region of at least `size` bytes, rounded up to whole
    /// pages, and returns its start address.
    ///
    /// The region records stay sorted by start address; the first gap that
    /// fits is used, starting with the gap after the reserved first page,
    /// otherwise the region is appended after the last one. No pages are
    /// mapped eagerly; the region's pages fault in on first touch.
    ///
    /// # Panics
    ///
    /// Panics if `size` is zero.
    pub fn allocate(&mut self, ctx: &mut VmContext, size: usize) -> Result<VirtualAddress, AllocError> {
        assert!(size > 0, "cannot allocate an empty region");
        let size = size.div_ceil(arch::PAGE_SIZE) * arch::PAGE_SIZE;

        if self.region_count == Self::region_capacity() {
            return Err(AllocError::RegionsFull);
        }

        let regions = self.regions_ptr(ctx)?;
        let pool_end = self.base.as_usize() + self.size;

        // First fit over the gaps between sorted regions. Region sizes and
        // the pool base are page-granular, so every gap is too.
        let mut previous_end = self.base.as_usize() + arch::PAGE_SIZE;
        let mut insert_at = self.region_count;
        for index in 0..self.region_count {
            // SAFETY: index < region_count, and the records live in the
            // reserved page resolved above.
            let region = unsafe { regions.add(index).read() };
            if region.start - previous_end >= size {
                insert_at = index;
                break;
            }
            previous_end = region.start + region.size;
        }
        if insert_at == self.region_count && pool_end - previous_end < size {
            log::warn!("no gap of {size} bytes left in pool at {}", self.base);
            return Err(AllocError::OutOfSpace);
        }
        let start = previous_end;

        // Shift the tail right, last record first, then insert.
        unsafe {
            for index in (insert_at..self.region_count).rev() {
                regions.add(index + 1).write(regions.add(index).read());
            }
            regions.add(insert_at).write(Region { start, size });
        }
        self.region_count += 1;

        log::trace!("allocated region [{start:#x}, {:#x})", start + size);
        Ok(VirtualAddress::new(arch::canonicalize_virtual(start)))
    }

    /// Releases the region starting exactly at `start`.
    ///
    /// Every page of the region is unmapped through the page table, which
    /// returns the backing frames to their pool. An address that is not the
    /// start of a live region changes nothing.
    pub fn release(&mut self, ctx: &mut VmContext, start: VirtualAddress) {
        if self.region_count == 0 {
            log::warn!("release of {start} from an empty pool");
            return;
        }
        let regions = self
            .regions_ptr(ctx)
            .expect("region page is mapped while regions exist");

        let Some(index) = (0..self.region_count).find(|&index| {
            // SAFETY: As in allocate().
            unsafe { regions.add(index).read() }.start == start.as_usize()
        }) else {
            log::warn!("release of {start}, which starts no region");
            return;
        };

        let region = unsafe { regions.add(index).read() };
        for offset in (0..region.size).step_by(arch::PAGE_SIZE) {
            let page = VirtualAddress::new(arch::canonicalize_virtual(region.start + offset))
                .page_number();
            self.page_table.lock().free_page(ctx, page);
        }

        // Compact the array left over the removed record.
        unsafe {
            for i in index..self.region_count - 1 {
                regions.add(i).write(regions.add(i + 1).read());
            }
        }
        self.region_count -= 1;
        log::trace!("released region [{start}, {:#x})", start.as_usize() + region.size);
    }

    /// Checks whether `address` lies inside the pool's range.
    ///
    /// Deliberately coarse: an address in an unallocated gap is still
    /// legitimate, and faults there are backed on demand.
    pub fn is_legitimate(&self, address: VirtualAddress) -> bool {
        address.as_usize().wrapping_sub(self.base.as_usize()) < self.size
    }

    /// Resolves the reserved first page to a pointer at its region records.
    ///
    /// On hardware the page is simply dereferenced; a miss traps to the
    /// fault handler and the access repeats. Under emulation this plays the
    /// hardware's part: translate, and on a miss deliver the fault by hand
    /// (at most twice, table then page) before retrying.
    fn regions_ptr(&self, ctx: &mut VmContext) -> Result<*mut Region, AllocError> {
        match AddressTranslator::current() {
            AddressTranslator::Hardware { .. } => {
                let _ = ctx;
                Ok(self.base.as_mut_ptr())
            }
            #[cfg(not(all(
                target_arch = "x86",
                target_os = "none",
                not(feature = "software-emulation")
            )))]
            AddressTranslator::Emulated(_) => {
                let mut table = self.page_table.lock();
                loop {
                    if let Some(phys) = table.translate(self.base) {
                        return Ok(AddressTranslator::current().phys_to_ptr(phys.as_usize()));
                    }
                    let fault = FaultContext::new(self.base, FaultCause::from_raw(0b010));
                    match table.handle_fault(ctx, &fault) {
                        Ok(_) => {}
                        Err(FaultError::OutOfFrames) => return Err(AllocError::OutOfFrames),
                        Err(err) => unreachable!(
                            "fault on the pool's own registered page cannot fail: {err}"
                        ),
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{FrameNumber, FramePool, FramePoolRegistry};

    const MEMORY_SIZE: usize = 256 * arch::PAGE_SIZE;
    const POOL_BASE: usize = 0x2000;

    /// A context with kernel and process pools and an active page table.
    fn setup() -> (VmContext, Arc<Mutex<PageTable>>) {
        if AddressTranslator::try_current().is_none() {
            AddressTranslator::set_current(AddressTranslator::emulated(MEMORY_SIZE));
        }
        let kernel = Arc::new(Mutex::new(FramePool::new(FrameNumber::new(32), 32, None)));
        let process = Arc::new(Mutex::new(FramePool::new(FrameNumber::new(64), 128, None)));
        let mut registry = FramePoolRegistry::new();
        registry.register(kernel.clone());
        registry.register(process.clone());
        let mut ctx = VmContext::new(registry, kernel, process, 32 * arch::PAGE_SIZE);

        let table = PageTable::new(&mut ctx).unwrap();
        table.load(&mut ctx);
        table.enable_paging(&mut ctx);
        (ctx, Arc::new(Mutex::new(table)))
    }

    fn pool(ctx: &mut VmContext, table: &Arc<Mutex<PageTable>>, pages: usize) -> AddressSpacePool {
        AddressSpacePool::new(
            VirtualAddress::new(POOL_BASE),
            pages * arch::PAGE_SIZE,
            table.clone(),
            ctx,
        )
    }

    fn process_free(ctx: &VmContext) -> usize {
        ctx.process_pool().lock().free_count()
    }

    #[test]
    fn construction_registers_range_without_touching_memory() {
        let (mut ctx, table) = setup();
        let free_before = process_free(&ctx);
        let pool = pool(&mut ctx, &table, 8);

        assert!(ctx.is_legitimate(VirtualAddress::new(POOL_BASE)));
        assert_eq!(pool.region_count(), 0);
        // Nothing is backed until the first allocation.
        assert_eq!(process_free(&ctx), free_before);
    }

    #[test]
    fn first_allocation_follows_the_reserved_page() {
        let (mut ctx, table) = setup();
        let mut pool = pool(&mut ctx, &table, 8);

        let first = pool.allocate(&mut ctx, arch::PAGE_SIZE).unwrap();
        assert_eq!(first, VirtualAddress::new(POOL_BASE + arch::PAGE_SIZE));
        assert_eq!(pool.region_count(), 1);
    }

    #[test]
    fn sizes_round_up_to_whole_pages() {
        let (mut ctx, table) = setup();
        let mut pool = pool(&mut ctx, &table, 8);

        let first = pool.allocate(&mut ctx, arch::PAGE_SIZE + 1).unwrap();
        let second = pool.allocate(&mut ctx, 1).unwrap();
        // The first region occupies two pages.
        assert_eq!(second - first, 2 * arch::PAGE_SIZE);
    }

    #[test]
    fn released_gaps_are_reused_first_fit() {
        let (mut ctx, table) = setup();
        let mut pool = pool(&mut ctx, &table, 8);

        let a = pool.allocate(&mut ctx, arch::PAGE_SIZE).unwrap();
        let b = pool.allocate(&mut ctx, arch::PAGE_SIZE).unwrap();
        let c = pool.allocate(&mut ctx, arch::PAGE_SIZE).unwrap();
        assert!(a < b && b < c);

        pool.release(&mut ctx, a);
        assert_eq!(pool.region_count(), 2);

        // The gap right after the reserved page is found again.
        let reused = pool.allocate(&mut ctx, arch::PAGE_SIZE).unwrap();
        assert_eq!(reused, a);
        assert_eq!(pool.region_count(), 3);
    }

    #[test]
    fn exact_fit_gaps_are_usable() {
        let (mut ctx, table) = setup();
        let mut pool = pool(&mut ctx, &table, 8);

        let a = pool.allocate(&mut ctx, 2 * arch::PAGE_SIZE).unwrap();
        let _b = pool.allocate(&mut ctx, arch::PAGE_SIZE).unwrap();
        pool.release(&mut ctx, a);

        // A request exactly the size of the freed gap takes it.
        assert_eq!(pool.allocate(&mut ctx, 2 * arch::PAGE_SIZE), Ok(a));
    }

    #[test]
    fn undersized_gaps_are_skipped() {
        let (mut ctx, table) = setup();
        let mut pool = pool(&mut ctx, &table, 8);

        let a = pool.allocate(&mut ctx, arch::PAGE_SIZE).unwrap();
        let b = pool.allocate(&mut ctx, arch::PAGE_SIZE).unwrap();
        pool.release(&mut ctx, a);

        let big = pool.allocate(&mut ctx, 2 * arch::PAGE_SIZE).unwrap();
        assert_eq!(big, b + arch::PAGE_SIZE);
    }

    #[test]
    fn exhausted_pool_reports_out_of_space() {
        let (mut ctx, table) = setup();
        // Three pages: one reserved, two allocatable.
        let mut pool = pool(&mut ctx, &table, 3);

        pool.allocate(&mut ctx, arch::PAGE_SIZE).unwrap();
        pool.allocate(&mut ctx, arch::PAGE_SIZE).unwrap();
        assert_eq!(
            pool.allocate(&mut ctx, arch::PAGE_SIZE),
            Err(AllocError::OutOfSpace)
        );
        // The failed attempt left the region array alone.
        assert_eq!(pool.region_count(), 2);
    }

    #[test]
    fn full_region_array_reports_regions_full() {
        let (mut ctx, table) = setup();
        let capacity = AddressSpacePool::region_capacity();
        let mut pool = pool(&mut ctx, &table, capacity + 2);

        for _ in 0..capacity {
            pool.allocate(&mut ctx, arch::PAGE_SIZE).unwrap();
        }
        assert_eq!(
            pool.allocate(&mut ctx, arch::PAGE_SIZE),
            Err(AllocError::RegionsFull)
        );
        assert_eq!(pool.region_count(), capacity);
    }

    #[test]
    fn release_unmaps_pages_and_returns_frames() {
        let (mut ctx, table) = setup();
        let mut pool = pool(&mut ctx, &table, 8);

        let region = pool.allocate(&mut ctx, 2 * arch::PAGE_SIZE).unwrap();
        // Touch both pages the way running code would, by faulting them in.
        for page in 0..2 {
            let addr = region + page * arch::PAGE_SIZE;
            let fault = FaultContext::new(addr, FaultCause::from_raw(0b010));
            while table.lock().translate(addr).is_none() {
                table.lock().handle_fault(&mut ctx, &fault).unwrap();
            }
        }
        let free_mapped = process_free(&ctx);
        assert!(table.lock().translate(region).is_some());

        pool.release(&mut ctx, region);
        assert_eq!(pool.region_count(), 0);
        assert_eq!(table.lock().translate(region), None);
        assert_eq!(
            table.lock().translate(region + arch::PAGE_SIZE),
            None
        );
        // Both data frames came back; the region page stays mapped.
        assert_eq!(process_free(&ctx), free_mapped + 2);
    }

    #[test]
    fn release_of_unknown_address_is_a_no_op() {
        let (mut ctx, table) = setup();
        let mut pool = pool(&mut ctx, &table, 8);

        let region = pool.allocate(&mut ctx, arch::PAGE_SIZE).unwrap();
        pool.release(&mut ctx, region + 1);
        assert_eq!(pool.region_count(), 1);

        pool.release(&mut ctx, region);
        assert_eq!(pool.region_count(), 0);
        // Releasing the same start twice changes nothing.
        pool.release(&mut ctx, region);
        assert_eq!(pool.region_count(), 0);
    }

    #[test]
    fn release_keeps_remaining_regions_ordered() {
        let (mut ctx, table) = setup();
        let mut pool = pool(&mut ctx, &table, 8);

        let a = pool.allocate(&mut ctx, arch::PAGE_SIZE).unwrap();
        let b = pool.allocate(&mut ctx, arch::PAGE_SIZE).unwrap();
        let c = pool.allocate(&mut ctx, arch::PAGE_SIZE).unwrap();

        pool.release(&mut ctx, b);
        assert_eq!(pool.region_count(), 2);

        // The freed middle gap is the first fit for a new page.
        let refill = pool.allocate(&mut ctx, arch::PAGE_SIZE).unwrap();
        assert_eq!(refill, b);
        assert!(a < refill && refill < c);
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
    fn boundary_ending_pool_constructs_with_logging_enabled() {
        // Force the info line in new() to actually format its arguments.
        // Another test may have installed a logger already.
        let _ = log::set_logger(&QuietLogger);
        log::set_max_level(log::LevelFilter::Trace);

        let (mut ctx, table) = setup();
        // A pool ending exactly at the canonical boundary: one-past-the-end
        // is not a valid address and must never be constructed as one.
        let base = VirtualAddress::new(0x7000);
        let mut pool = AddressSpacePool::new(base, 0x1000, table, &mut ctx);

        let first = pool.allocate(&mut ctx, arch::PAGE_SIZE).unwrap();
        assert_eq!(first, base + arch::PAGE_SIZE);
        assert!(pool.is_legitimate(VirtualAddress::new(0x7FFF)));
    }

    #[test]
    fn legitimacy_covers_exactly_the_pool_range() {
        let (mut ctx, table) = setup();
        let mut pool = pool(&mut ctx, &table, 8);
        let end = POOL_BASE + 8 * arch::PAGE_SIZE;

        assert!(pool.is_legitimate(VirtualAddress::new(POOL_BASE)));
        assert!(pool.is_legitimate(VirtualAddress::new(end - 1)));
        assert!(!pool.is_legitimate(VirtualAddress::new(end)));
        assert!(!pool.is_legitimate(VirtualAddress::new(POOL_BASE - 1)));

        // Fragmentation does not change the answer.
        let a = pool.allocate(&mut ctx, arch::PAGE_SIZE).unwrap();
        let _b = pool.allocate(&mut ctx, arch::PAGE_SIZE).unwrap();
        pool.release(&mut ctx, a);
        assert!(pool.is_legitimate(a));
        assert!(pool.is_legitimate(VirtualAddress::new(end - 1)));
    }
}
