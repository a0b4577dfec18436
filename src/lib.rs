#![cfg_attr(
    all(target_arch = "x86", target_os = "none", not(feature = "software-emulation")),
    no_std
)]

//! # Virtual Memory Manager (VMM)
//!
//! The virtual-memory subsystem of a small single-core kernel. It provides:
//!
//! - Contiguous physical frame allocation over independently constructed pools.
//! - Two-level page tables with a recursive self-map, so the active table can
//!   be edited after translation is enabled.
//! - Fault-driven lazy page allocation, guarded by per-address-space pools
//!   that decide which addresses are legitimate to back on demand.
//! - A software-emulated architecture so the whole subsystem can be exercised
//!   in ordinary host tests.

extern crate alloc;

mod address;
mod address_space;
pub mod arch;
mod context;
mod frame_pool;
mod numbers;
mod page_table;
mod selfmap;

pub use address::{AddressTranslator, PhysicalAddress, VirtualAddress};
pub use address_space::AddressSpacePool;
pub use context::{AddressRange, VmContext};
pub use frame_pool::{AllocError, FramePool, FramePoolRegistry};
pub use numbers::{FrameNumber, PageNumber};
pub use page_table::{FaultCause, FaultContext, FaultError, FaultResolution, PageTable};

pub use arch::{PAGE_SIZE, TABLE_ENTRIES};
