//! Architecture backends for the virtual-memory subsystem.
//!
//! Two backends exist: the real 32-bit x86 two-level paging hardware, and a
//! software scale model used for tests and for builds on hosts that cannot
//! run the hardware backend.

// The hardware backend only makes sense on a bare-metal 32-bit x86 target.
#[cfg(all(target_arch = "x86", target_os = "none", not(feature = "software-emulation")))]
mod x86;
#[cfg(all(target_arch = "x86", target_os = "none", not(feature = "software-emulation")))]
pub use x86::*;

// Everything else (host tests, host builds, explicit opt-in) runs the scale
// model.
#[cfg(not(all(target_arch = "x86", target_os = "none", not(feature = "software-emulation"))))]
mod software;
#[cfg(not(all(target_arch = "x86", target_os = "none", not(feature = "software-emulation"))))]
pub use software::*;
