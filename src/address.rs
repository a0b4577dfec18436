//! Address types for physical and virtual memory management.
//!
//! Architecture-independent wrappers around physical and virtual addresses,
//! plus the process-wide translator that turns physical addresses into
//! dereferenceable pointers (a direct mapping on hardware, a buffer offset
//! under the software scale model).

use core::fmt;
use core::ops::{Add, Sub};

use crate::{FrameNumber, arch};

#[cfg(not(all(target_arch = "x86", target_os = "none", not(feature = "software-emulation"))))]
use crate::arch::EmulatedMemory;

/// Process-wide translator from physical addresses to usable pointers.
///
/// - `Hardware`: physical memory is reachable at a fixed direct-map offset
///   (zero for an identity-mapped kernel).
/// - `Emulated`: physical memory is a host buffer; only available under the
///   software scale model.
pub enum AddressTranslator {
    /// Hardware translation through a direct-map offset.
    Hardware { direct_map_offset: usize },
    /// Emulated translation into a simulated physical memory.
    #[cfg(not(all(target_arch = "x86", target_os = "none", not(feature = "software-emulation"))))]
    Emulated(EmulatedMemory),
}

impl AddressTranslator {
    /// Creates a hardware translator with the given direct-map offset.
    pub const fn hardware(direct_map_offset: usize) -> Self {
        Self::Hardware { direct_map_offset }
    }

    /// Creates an emulated translator over `size` bytes of simulated
    /// physical memory.
    #[cfg(not(all(target_arch = "x86", target_os = "none", not(feature = "software-emulation"))))]
    pub fn emulated(size: usize) -> Self {
        Self::Emulated(EmulatedMemory::new(size))
    }

    /// Sets the process-wide address translator.
    ///
    /// Must be called exactly once during initialization, before any pool or
    /// page table is constructed.
    ///
    /// # Panics
    ///
    /// Panics if the translator has already been set.
    pub fn set_current(translator: AddressTranslator) {
        #[cfg(all(target_arch = "x86", target_os = "none", not(feature = "software-emulation")))]
        {
            if ADDRESS_TRANSLATOR.get().is_some() {
                panic!("address translator already set");
            }
            ADDRESS_TRANSLATOR.call_once(|| translator);
        }

        #[cfg(not(all(target_arch = "x86", target_os = "none", not(feature = "software-emulation"))))]
        {
            ADDRESS_TRANSLATOR.with(|t| {
                if t.get().is_some() {
                    panic!("address translator already set");
                }
                t.call_once(|| translator);
            });
        }
    }

    /// Returns the process-wide address translator.
    ///
    /// # Panics
    ///
    /// Panics if the translator has not been set yet.
    pub fn current() -> &'static AddressTranslator {
        #[cfg(all(target_arch = "x86", target_os = "none", not(feature = "software-emulation")))]
        {
            ADDRESS_TRANSLATOR
                .get()
                .expect("address translator not set; call AddressTranslator::set_current at boot")
        }

        #[cfg(not(all(target_arch = "x86", target_os = "none", not(feature = "software-emulation"))))]
        {
            ADDRESS_TRANSLATOR.with(|t| {
                // SAFETY: The reference is leaked to 'static. Each thread has
                // its own translator, spin::Once never hands out a second
                // initialization, and the thread-local outlives every use on
                // its thread.
                unsafe {
                    &*(t.get().expect(
                        "address translator not set; call AddressTranslator::set_current at boot",
                    ) as *const AddressTranslator)
                }
            })
        }
    }

    /// Returns the process-wide translator if it has been set.
    #[cfg(test)]
    pub fn try_current() -> Option<&'static AddressTranslator> {
        ADDRESS_TRANSLATOR.with(|t| {
            t.get().map(|translator| {
                // SAFETY: Same reasoning as in current().
                unsafe { &*(translator as *const AddressTranslator) }
            })
        })
    }

    /// Translates a physical address to a virtual address.
    pub fn phys_to_virt(&self, phys: usize) -> usize {
        match self {
            Self::Hardware { direct_map_offset } => phys.wrapping_add(*direct_map_offset),
            #[cfg(not(all(
                target_arch = "x86",
                target_os = "none",
                not(feature = "software-emulation")
            )))]
            Self::Emulated(memory) => memory.translate(phys) as usize,
        }
    }

    /// Translates a physical address to a typed pointer.
    pub fn phys_to_ptr<T>(&self, phys: usize) -> *mut T {
        self.phys_to_virt(phys) as *mut T
    }
}

/// Process-wide address translator.
///
/// Set once at boot on hardware. Under the software scale model it is
/// thread-local, so every test thread gets its own physical memory.
#[cfg(all(target_arch = "x86", target_os = "none", not(feature = "software-emulation")))]
static ADDRESS_TRANSLATOR: spin::Once<AddressTranslator> = spin::Once::new();

#[cfg(not(all(target_arch = "x86", target_os = "none", not(feature = "software-emulation"))))]
std::thread_local! {
    static ADDRESS_TRANSLATOR: spin::Once<AddressTranslator> = spin::Once::new();
}

/// Defines the functionality common to both address types.
macro_rules! impl_address_common {
    ($name:ident, $doc:expr) => {
        #[doc = $doc]
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        #[repr(transparent)]
        pub struct $name(usize);

        impl $name {
            /// Returns the raw address value.
            #[inline]
            pub const fn as_usize(self) -> usize {
                self.0
            }

            /// Checks if the address is aligned to the given alignment.
            ///
            /// # Panics
            ///
            /// Panics if `align` is not a power of two.
            #[inline]
            pub const fn is_aligned(self, align: usize) -> bool {
                assert!(align.is_power_of_two(), "alignment must be a power of two");
                self.0 & (align - 1) == 0
            }

            /// Aligns the address down to the given alignment.
            ///
            /// # Panics
            ///
            /// Panics if `align` is not a power of two.
            #[inline]
            pub const fn align_down(self, align: usize) -> Self {
                assert!(align.is_power_of_two(), "alignment must be a power of two");
                Self(self.0 & !(align - 1))
            }

            /// Aligns the address up to the given alignment.
            ///
            /// # Panics
            ///
            /// Panics if `align` is not a power of two.
            #[inline]
            pub const fn align_up(self, align: usize) -> Self {
                assert!(align.is_power_of_two(), "alignment must be a power of two");
                Self((self.0 + align - 1) & !(align - 1))
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({:#x})", stringify!($name), self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{:#x}", self.0)
            }
        }

        impl Add<usize> for $name {
            type Output = Self;

            #[inline]
            fn add(self, rhs: usize) -> Self::Output {
                Self::new(self.0 + rhs)
            }
        }

        impl Sub<usize> for $name {
            type Output = Self;

            #[inline]
            fn sub(self, rhs: usize) -> Self::Output {
                Self::new(self.0 - rhs)
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

impl_address_common!(
    PhysicalAddress,
    "A physical memory address.\n\n\
     A newtype over the architecture's representation of a physical address,\n\
     with alignment helpers and frame-number conversion."
);

impl PhysicalAddress {
    /// Creates a new physical address.
    ///
    /// # Panics
    ///
    /// Panics if the address exceeds the architecture's physical address
    /// width.
    #[inline]
    pub const fn new(addr: usize) -> Self {
        assert!(
            arch::validate_physical(addr),
            "physical address exceeds maximum width"
        );
        Self(addr)
    }

    /// Returns the number of the frame containing this address.
    #[inline]
    pub fn frame_number(self) -> FrameNumber {
        FrameNumber::from(self)
    }
}

impl_address_common!(
    VirtualAddress,
    "A virtual memory address.\n\n\
     A newtype over the architecture's representation of a virtual address,\n\
     with alignment helpers and accessors for the two translation indices."
);

impl VirtualAddress {
    /// Creates a new virtual address.
    ///
    /// # Panics
    ///
    /// Panics if the address is not canonical for the architecture.
    #[inline]
    pub const fn new(addr: usize) -> Self {
        assert!(arch::validate_virtual(addr), "address is not canonical");
        Self(addr)
    }

    /// Converts the address to a pointer.
    #[inline]
    pub const fn as_ptr<T>(self) -> *const T {
        self.0 as *const T
    }

    /// Converts the address to a mutable pointer.
    #[inline]
    pub const fn as_mut_ptr<T>(self) -> *mut T {
        self.0 as *mut T
    }

    /// Returns the byte offset of this address within its page.
    #[inline]
    pub const fn page_offset(self) -> usize {
        self.0 & (arch::PAGE_SIZE - 1)
    }

    /// Returns the directory index (top translation level) for this address.
    #[inline]
    pub const fn directory_index(self) -> usize {
        arch::page_index(self.0, 1)
    }

    /// Returns the table index (second translation level) for this address.
    #[inline]
    pub const fn table_index(self) -> usize {
        arch::page_index(self.0, 0)
    }

    /// Returns the number of the page containing this address.
    #[inline]
    pub fn page_number(self) -> crate::PageNumber {
        crate::PageNumber::from(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    mod physical_address {
        use super::*;

        #[test]
        fn new_valid_address() {
            let addr = PhysicalAddress::new(0x0100);
            assert_eq!(addr.as_usize(), 0x0100);
        }

        #[test]
        fn new_max_valid_address() {
            let max_addr = (1usize << arch::MAX_PHYSICAL_BITS) - 1;
            let addr = PhysicalAddress::new(max_addr);
            assert_eq!(addr.as_usize(), max_addr);
        }

        #[test]
        #[should_panic(expected = "physical address exceeds maximum width")]
        fn new_exceeds_max() {
            PhysicalAddress::new(1usize << arch::MAX_PHYSICAL_BITS);
        }

        #[test]
        fn alignment_check() {
            let addr = PhysicalAddress::new(arch::PAGE_SIZE * 4);
            assert!(addr.is_aligned(arch::PAGE_SIZE));
            assert!(addr.is_aligned(1));
            assert!(!addr.is_aligned(arch::PAGE_SIZE * 8));
        }

        #[test]
        fn align_up_and_down() {
            let addr = PhysicalAddress::new(arch::PAGE_SIZE + 4);
            assert_eq!(
                addr.align_down(arch::PAGE_SIZE),
                PhysicalAddress::new(arch::PAGE_SIZE)
            );
            assert_eq!(
                addr.align_up(arch::PAGE_SIZE),
                PhysicalAddress::new(arch::PAGE_SIZE * 2)
            );
        }

        #[test]
        fn arithmetic() {
            let addr = PhysicalAddress::new(0x0100);
            assert_eq!((addr + 0x50).as_usize(), 0x0150);
            assert_eq!((addr - 0x50).as_usize(), 0x00B0);
            assert_eq!(PhysicalAddress::new(0x0150) - addr, 0x50);
        }

        #[test]
        fn formatting() {
            let addr = PhysicalAddress::new(0x0100);
            assert!(format!("{addr:?}").contains("PhysicalAddress"));
            assert!(format!("{addr}").contains("0x100"));
        }
    }

    mod virtual_address {
        use super::*;

        #[test]
        fn new_valid_lower_half() {
            let addr = VirtualAddress::new(0x7FFF);
            assert_eq!(addr.as_usize(), 0x7FFF);
        }

        #[test]
        fn new_valid_upper_half() {
            // 0x8000 sign-extends to the top of the host word.
            let addr = VirtualAddress::new(0xFFFF_FFFF_FFFF_8000);
            assert_eq!(addr.as_usize(), 0xFFFF_FFFF_FFFF_8000);
        }

        #[test]
        #[should_panic(expected = "address is not canonical")]
        fn new_non_canonical() {
            VirtualAddress::new(0x8000);
        }

        #[test]
        fn page_offset() {
            let addr = VirtualAddress::new(arch::PAGE_SIZE + 4);
            assert_eq!(addr.page_offset(), 4);
            assert_eq!(VirtualAddress::new(arch::PAGE_SIZE).page_offset(), 0);
        }

        #[test]
        fn translation_indices() {
            // 0x2040: directory index = bits 11-15, table index = bits 6-10.
            let addr = VirtualAddress::new(0x2040);
            assert_eq!(addr.directory_index(), 4);
            assert_eq!(addr.table_index(), 1);
            assert_eq!(addr.page_offset(), 0);
        }

        #[test]
        fn indices_of_upper_half_address() {
            let addr = VirtualAddress::new(arch::canonicalize_virtual(0xFFC0));
            assert_eq!(addr.directory_index(), arch::TABLE_ENTRIES - 1);
            assert_eq!(addr.table_index(), arch::TABLE_ENTRIES - 1);
        }

        #[test]
        fn pointer_conversion() {
            let addr = VirtualAddress::new(0x0100);
            assert_eq!(addr.as_ptr::<u8>() as usize, 0x0100);
            assert_eq!(addr.as_mut_ptr::<u8>() as usize, 0x0100);
        }
    }

    mod translator {
        use super::*;

        #[test]
        fn hardware_direct_mapping() {
            let translator = AddressTranslator::hardware(0xFFFF_FFFF_FFFF_8000);
            assert_eq!(translator.phys_to_virt(0x0100), 0xFFFF_FFFF_FFFF_8100);
        }

        #[test]
        fn emulated_translation_round_trips() {
            let translator = AddressTranslator::emulated(4 * arch::PAGE_SIZE);
            let first = translator.phys_to_virt(0);
            let second = translator.phys_to_virt(arch::PAGE_SIZE);
            assert_eq!(second - first, arch::PAGE_SIZE);
        }

        #[test]
        #[should_panic(expected = "address translator already set")]
        fn panics_on_double_set() {
            AddressTranslator::set_current(AddressTranslator::hardware(0));
            AddressTranslator::set_current(AddressTranslator::hardware(0));
        }
    }
}
