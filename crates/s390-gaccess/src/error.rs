use s390_guest_mem::MemoryError;
use thiserror::Error;

use crate::exception::{PgmCode, ProgramInterruption};

pub type Result<T> = std::result::Result<T, Error>;

/// Hypervisor-internal failure, never visible to the guest as such.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HostFault {
    #[error(transparent)]
    Memory(#[from] MemoryError),

    #[error("store to read-only memory slot at {gpa:#x}")]
    ReadOnlySlot { gpa: u64 },

    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    #[error("out of memory")]
    OutOfMemory,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// Architectural exception to be injected into the guest.
    #[error("program interruption {:#06x}", .0.code.code())]
    Program(ProgramInterruption),

    #[error(transparent)]
    Host(#[from] HostFault),
}

impl Error {
    pub fn program(&self) -> Option<&ProgramInterruption> {
        match self {
            Error::Program(pgm) => Some(pgm),
            Error::Host(_) => None,
        }
    }

    pub fn pgm_code(&self) -> Option<PgmCode> {
        self.program().map(|pgm| pgm.code)
    }
}

impl From<MemoryError> for Error {
    fn from(err: MemoryError) -> Self {
        Error::Host(HostFault::Memory(err))
    }
}
