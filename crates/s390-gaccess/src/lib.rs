//! s390 guest access: DAT translation and key-checked guest memory access on
//! behalf of a virtual CPU.
//!
//! This crate implements what a hypervisor needs when it, rather than the
//! CPU, touches guest storage:
//! - ASCE selection from the PSW, including access-register translation
//! - the region/segment/page table walk, with EDAT large frames
//! - low-address, DAT, key-controlled and instruction-execution protection,
//!   plus fetch- and storage-protection override
//! - exception reporting with the architected program-interruption code and
//!   translation-exception identification
//! - the IPTE interlock against concurrent table purges
//! - shadow tables for nested guests
//!
//! Guest memory is reached through [`s390_guest_mem::GuestMemory`].

#![forbid(unsafe_code)]

pub mod access;
pub mod addr;
pub mod ar;
pub mod asce;
pub mod config;
pub mod entry;
pub mod error;
pub mod exception;
pub mod ipte;
pub mod key;
pub mod range;
pub mod shadow;
pub mod vcpu;
pub mod walk;

#[cfg(test)]
mod test_util;
#[cfg(test)]
mod tests;

pub use addr::{AddressingMode, Level, VirtualAddress};
pub use asce::{Asce, TableType};
pub use config::{Facilities, VmConfig};
pub use error::{Error, HostFault, Result};
pub use exception::{PgmCode, ProgramInterruption, ProtType, Teid};
pub use ipte::{IpteControl, IpteGuard, IpteLock, PurgeGuard};
pub use shadow::{ShadowFault, ShadowPage, ShadowSpace};
pub use vcpu::{AddressSpace, Cr0, Psw, Vcpu, VcpuState, Vm};
pub use walk::{guest_translate, DatFeatures};

/// Kind of guest storage access.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccessMode {
    Fetch,
    Store,
    InstructionFetch,
}

impl AccessMode {
    #[inline]
    pub fn is_fetch(self) -> bool {
        matches!(self, AccessMode::Fetch | AccessMode::InstructionFetch)
    }
}
