//! Contiguous physical frame pools.
//!
//! A [`FramePool`] manages one contiguous range of physical frames and hands
//! out runs of consecutive frames. Per-frame state is packed two bits per
//! frame into a metadata frame, which lives either in the pool's own first
//! frame or in a frame supplied by another pool. The first frame of every
//! allocated run is tagged distinctly, so a release given only the run's head
//! frame number can recover the run's extent.
//!
//! Pools are grouped in a [`FramePoolRegistry`] so a frame can be released
//! without a handle to its owning pool.

use core::fmt;

use alloc::sync::Arc;
use alloc::vec::Vec;
use spin::Mutex;

use crate::{AddressTranslator, FrameNumber, PhysicalAddress, arch};

/// A recoverable allocation failure.
///
/// Every variant leaves the allocator it came from unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocError {
    /// The frame pool has no run of free frames long enough for the request.
    OutOfFrames,
    /// The address-space pool has no gap large enough for the request.
    OutOfSpace,
    /// The address-space pool's region array is full.
    RegionsFull,
}

impl fmt::Display for AllocError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutOfFrames => write!(f, "not enough contiguous free frames"),
            Self::OutOfSpace => write!(f, "no gap large enough in the address-space pool"),
            Self::RegionsFull => write!(f, "region array is full"),
        }
    }
}

impl core::error::Error for AllocError {}

/// Per-frame state, packed two bits per frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum FrameState {
    Free = 0b00,
    /// Interior member of an allocated run.
    Allocated = 0b01,
    /// First frame of an allocated run.
    HeadOfRun = 0b11,
}

impl FrameState {
    fn from_bits(bits: u8) -> Self {
        match bits {
            0b00 => Self::Free,
            0b01 => Self::Allocated,
            0b11 => Self::HeadOfRun,
            _ => panic!("corrupt frame state bits {bits:#04b}"),
        }
    }
}

/// Number of 2-bit state entries a single metadata frame can hold.
const ENTRIES_PER_FRAME: usize = arch::PAGE_SIZE * 4;

/// An allocator over one contiguous range of physical frames.
pub struct FramePool {
    /// First frame owned by this pool.
    base: FrameNumber,
    /// Number of frames owned by this pool.
    frame_count: usize,
    /// Number of frames currently free.
    free_count: usize,
    /// Physical address of the packed state array.
    metadata: PhysicalAddress,
}

impl FramePool {
    /// Creates a pool over `frame_count` frames starting at `base`.
    ///
    /// If `metadata_frame` is `None`, the state array is stored in the pool's
    /// own leading frames, which are marked allocated and excluded from the
    /// free count. Otherwise it is stored in the given external frame, whose
    /// owner must have already reserved it, and every pool frame starts free.
    ///
    /// # Panics
    ///
    /// Panics if `frame_count` is zero, if the pool's own frames cannot hold
    /// the state array when `metadata_frame` is `None`, or if a supplied
    /// external frame is too small to hold it.
    pub fn new(base: FrameNumber, frame_count: usize, metadata_frame: Option<FrameNumber>) -> Self {
        assert!(frame_count > 0, "frame pool must own at least one frame");

        let info_frames = Self::needed_metadata_frames(frame_count);
        if metadata_frame.is_none() {
            assert!(
                info_frames <= frame_count,
                "pool too small to hold its own state array"
            );
        } else {
            // A caller supplies exactly one frame; spilling the state array
            // into whatever follows it would corrupt unowned memory.
            assert!(
                info_frames == 1,
                "external metadata frame cannot hold {frame_count} frame states"
            );
        }

        let metadata = metadata_frame.unwrap_or(base).base_address();
        let mut pool = Self {
            base,
            frame_count,
            free_count: frame_count,
            metadata,
        };

        for index in 0..frame_count {
            pool.set_state(index, FrameState::Free);
        }
        if metadata_frame.is_none() {
            // The state array occupies the pool's own leading frames.
            pool.mark_inaccessible(base, info_frames);
        }

        log::info!(
            "frame pool initialized: frames [{}, {}), {} free, metadata at {}",
            base,
            base + frame_count,
            pool.free_count,
            metadata
        );
        pool
    }

    /// Returns the number of frames needed to hold the state array for a pool
    /// of `frame_count` frames.
    pub const fn needed_metadata_frames(frame_count: usize) -> usize {
        frame_count.div_ceil(ENTRIES_PER_FRAME)
    }

    /// First frame owned by this pool.
    pub fn base(&self) -> FrameNumber {
        self.base
    }

    /// Number of frames owned by this pool.
    pub fn frame_count(&self) -> usize {
        self.frame_count
    }

    /// Number of frames currently free.
    pub fn free_count(&self) -> usize {
        self.free_count
    }

    /// Checks whether `frame` lies inside this pool's range.
    pub fn contains(&self, frame: FrameNumber) -> bool {
        frame >= self.base && frame.as_usize() < self.base.as_usize() + self.frame_count
    }

    /// Allocates a run of `count` consecutive frames, first-fit.
    ///
    /// Returns the absolute number of the run's first frame. On failure
    /// nothing is marked and the free count is unchanged.
    ///
    /// # Panics
    ///
    /// Panics if `count` is zero.
    pub fn get_frames(&mut self, count: usize) -> Result<FrameNumber, AllocError> {
        assert!(count > 0, "cannot allocate an empty run");
        if self.free_count < count {
            return Err(AllocError::OutOfFrames);
        }

        let mut run_start = 0;
        let mut run_len = 0;
        for index in 0..self.frame_count {
            if self.state(index) == FrameState::Free {
                if run_len == 0 {
                    run_start = index;
                }
                run_len += 1;
                if run_len == count {
                    self.mark_run(run_start, count);
                    self.free_count -= count;
                    let head = self.base + run_start;
                    log::trace!("allocated {count} frame(s) at {head}");
                    return Ok(head);
                }
            } else {
                run_len = 0;
            }
        }
        Err(AllocError::OutOfFrames)
    }

    /// Marks the run of `count` frames starting at `head` as allocated,
    /// without searching.
    ///
    /// Used to reserve frames already known to be in use, such as frames
    /// backing boot structures or another pool's state array. The caller must
    /// guarantee the whole range is currently free; this is not re-checked.
    ///
    /// # Panics
    ///
    /// Panics if `count` is zero or the range is not fully inside the pool.
    pub fn mark_inaccessible(&mut self, head: FrameNumber, count: usize) {
        assert!(count > 0, "cannot reserve an empty run");
        assert!(
            self.contains(head) && head.as_usize() + count <= self.base.as_usize() + self.frame_count,
            "reserved range [{head}, {}) is outside the pool",
            head + count
        );

        self.mark_run(head - self.base, count);
        self.free_count -= count;
        log::trace!("reserved {count} frame(s) at {head}");
    }

    /// Releases the run whose first frame is `head`, returning the number of
    /// frames freed.
    ///
    /// If `head` is outside the pool or is not the head of an allocated run,
    /// nothing changes and zero is returned.
    pub fn release_frames(&mut self, head: FrameNumber) -> usize {
        if !self.contains(head) {
            log::warn!("release of frame {head} outside pool [{}, {})", self.base, self.base + self.frame_count);
            return 0;
        }

        let start = head - self.base;
        if self.state(start) != FrameState::HeadOfRun {
            log::warn!("release of frame {head} that is not the head of a run");
            return 0;
        }

        self.set_state(start, FrameState::Free);
        let mut released = 1;
        // The run's extent is implicit: it ends at the next frame that is not
        // an interior member, or at the pool boundary.
        for index in start + 1..self.frame_count {
            if self.state(index) != FrameState::Allocated {
                break;
            }
            self.set_state(index, FrameState::Free);
            released += 1;
        }

        self.free_count += released;
        log::trace!("released {released} frame(s) at {head}");
        released
    }

    fn mark_run(&mut self, start: usize, count: usize) {
        self.set_state(start, FrameState::HeadOfRun);
        for index in start + 1..start + count {
            self.set_state(index, FrameState::Allocated);
        }
    }

    /// Reads the state of the frame at pool-relative `index`.
    fn state(&self, index: usize) -> FrameState {
        debug_assert!(index < self.frame_count);
        let shift = (index % 4) * 2;
        let byte = self.metadata_byte(index / 4);
        // SAFETY: The byte lies inside the pool's metadata frame(s), which
        // the pool owns exclusively.
        let bits = unsafe { byte.read() };
        FrameState::from_bits((bits >> shift) & 0b11)
    }

    /// Writes the state of the frame at pool-relative `index`.
    fn set_state(&mut self, index: usize, state: FrameState) {
        debug_assert!(index < self.frame_count);
        let shift = (index % 4) * 2;
        let byte = self.metadata_byte(index / 4);
        // SAFETY: As in state().
        unsafe {
            let bits = byte.read() & !(0b11 << shift);
            byte.write(bits | ((state as u8) << shift));
        }
    }

    fn metadata_byte(&self, offset: usize) -> *mut u8 {
        AddressTranslator::current().phys_to_ptr::<u8>(self.metadata.as_usize() + offset)
    }
}

impl fmt::Debug for FramePool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FramePool")
            .field("base", &self.base)
            .field("frame_count", &self.frame_count)
            .field("free_count", &self.free_count)
            .field("metadata", &self.metadata)
            .finish()
    }
}

/// The process-wide set of frame pools.
///
/// Pools register here at boot, in insertion order. The registry resolves a
/// bare frame number to its owning pool, so a frame can be released by the
/// code that holds only the frame number.
#[derive(Default)]
pub struct FramePoolRegistry {
    pools: Vec<Arc<Mutex<FramePool>>>,
}

impl FramePoolRegistry {
    /// Creates an empty registry.
    pub const fn new() -> Self {
        Self { pools: Vec::new() }
    }

    /// Registers a pool.
    ///
    /// # Panics
    ///
    /// Panics if the pool's frame range overlaps a registered pool.
    pub fn register(&mut self, pool: Arc<Mutex<FramePool>>) {
        {
            let new = pool.lock();
            for existing in &self.pools {
                let existing = existing.lock();
                let disjoint = new.base.as_usize() + new.frame_count <= existing.base.as_usize()
                    || existing.base.as_usize() + existing.frame_count <= new.base.as_usize();
                assert!(
                    disjoint,
                    "pool [{}, {}) overlaps registered pool [{}, {})",
                    new.base,
                    new.base + new.frame_count,
                    existing.base,
                    existing.base + existing.frame_count
                );
            }
        }
        self.pools.push(pool);
    }

    /// Returns the registered pool that owns `frame`, if any.
    pub fn owner_of(&self, frame: FrameNumber) -> Option<&Arc<Mutex<FramePool>>> {
        self.pools.iter().find(|pool| pool.lock().contains(frame))
    }

    /// Releases the run headed by `head` back to its owning pool, returning
    /// the number of frames freed.
    ///
    /// If no registered pool owns `head`, nothing changes and zero is
    /// returned.
    pub fn release_frames(&self, head: FrameNumber) -> usize {
        match self.owner_of(head) {
            Some(pool) => pool.lock().release_frames(head),
            None => {
                log::warn!("release of frame {head} owned by no registered pool");
                0
            }
        }
    }
}
