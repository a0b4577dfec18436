//! Frame and page numbers.
//!
//! Physical memory is measured in frames and virtual memory in pages, both
//! `PAGE_SIZE` bytes. These newtypes keep the two index spaces apart and
//! convert to and from the corresponding address types.

use core::fmt;
use core::ops::{Add, Sub};

use crate::{PhysicalAddress, VirtualAddress, arch};

/// Defines the functionality common to both number types.
macro_rules! impl_number_common {
    ($name:ident, $doc:expr) => {
        #[doc = $doc]
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        #[repr(transparent)]
        pub struct $name(usize);

        impl $name {
            /// Creates a new number from a raw index.
            #[inline]
            pub const fn new(number: usize) -> Self {
                Self(number)
            }

            /// Returns the raw index value.
            #[inline]
            pub const fn as_usize(self) -> usize {
                self.0
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl Add<usize> for $name {
            type Output = Self;

            #[inline]
            fn add(self, rhs: usize) -> Self::Output {
                Self(self.0 + rhs)
            }
        }

        impl Sub<$name> for $name {
            type Output = usize;

            #[inline]
            fn sub(self, rhs: $name) -> Self::Output {
                self.0 - rhs.0
            }
        }
    };
}

impl_number_common!(
    FrameNumber,
    "The number of a physical memory frame.\n\n\
     Frame `n` covers physical addresses `[n * PAGE_SIZE, (n + 1) * PAGE_SIZE)`."
);

impl FrameNumber {
    /// Returns the physical address of the first byte of this frame.
    #[inline]
    pub fn base_address(self) -> PhysicalAddress {
        PhysicalAddress::new(self.0 * arch::PAGE_SIZE)
    }
}

impl From<PhysicalAddress> for FrameNumber {
    #[inline]
    fn from(addr: PhysicalAddress) -> Self {
        Self(addr.as_usize() / arch::PAGE_SIZE)
    }
}

impl_number_common!(
    PageNumber,
    "The number of a virtual memory page.\n\n\
     Page `n` covers virtual addresses `[n * PAGE_SIZE, (n + 1) * PAGE_SIZE)`,\n\
     numbered within the canonical space."
);

impl PageNumber {
    /// Returns the virtual address of the first byte of this page.
    #[inline]
    pub fn base_address(self) -> VirtualAddress {
        VirtualAddress::new(arch::canonicalize_virtual(self.0 * arch::PAGE_SIZE))
    }
}

impl From<VirtualAddress> for PageNumber {
    #[inline]
    fn from(addr: VirtualAddress) -> Self {
        Self((addr.as_usize() & ((1 << arch::MAX_VIRTUAL_BITS) - 1)) / arch::PAGE_SIZE)
    }
}
