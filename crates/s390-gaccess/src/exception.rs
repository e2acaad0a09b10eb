//! Program-interruption codes and translation-exception identification.

use tracing::{debug, warn};

use crate::error::{Error, HostFault};
use crate::AccessMode;
use s390_guest_mem::MemoryError;

/// Architected program-interruption codes produced by guest accesses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum PgmCode {
    Protection = 0x04,
    Addressing = 0x05,
    Specification = 0x06,
    SegmentTranslation = 0x10,
    PageTranslation = 0x11,
    TranslationSpecification = 0x12,
    AletSpecification = 0x28,
    AlenTranslation = 0x29,
    AleSequence = 0x2a,
    AsteValidity = 0x2b,
    AsteSequence = 0x2c,
    ExtendedAuthority = 0x2d,
    AsceType = 0x38,
    RegionFirstTranslation = 0x39,
    RegionSecondTranslation = 0x3a,
    RegionThirdTranslation = 0x3b,
}

impl PgmCode {
    #[inline]
    pub const fn code(self) -> u16 {
        self as u16
    }

    /// Codes whose TEID carries the failing address, FSI and address-space id.
    const fn reports_address(self) -> bool {
        matches!(
            self,
            PgmCode::Protection
                | PgmCode::AsceType
                | PgmCode::PageTranslation
                | PgmCode::RegionFirstTranslation
                | PgmCode::RegionSecondTranslation
                | PgmCode::RegionThirdTranslation
                | PgmCode::SegmentTranslation
        )
    }

    /// Codes that report the access register number.
    const fn reports_access_id(self) -> bool {
        self.reports_address()
            || matches!(
                self,
                PgmCode::AlenTranslation
                    | PgmCode::AleSequence
                    | PgmCode::AsteValidity
                    | PgmCode::AsteSequence
                    | PgmCode::ExtendedAuthority
            )
    }
}

/// Cause of a protection exception.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProtType {
    LowAddress,
    KeyControlled,
    AccessListControlled,
    Dat,
    InstructionExecution,
}

/// Translation-exception identification.
///
/// ```text
///  0                                   51 52 53     56      60  61  62 63
/// |   failing page address              | FSI  | .. |B56| .. |B60|B61| AS |
/// ```
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Teid(pub u64);

impl Teid {
    pub const FSI_STORE: u64 = 1 << 10;
    pub const FSI_FETCH: u64 = 2 << 10;
    pub const B56: u64 = 1 << 7;
    pub const B60: u64 = 1 << 3;
    pub const B61: u64 = 1 << 2;

    #[inline]
    pub const fn address(self) -> u64 {
        self.0 & !0xfff
    }

    /// Fetch/store indication: 1 = store, 2 = fetch, 0 = not reported.
    #[inline]
    pub const fn fsi(self) -> u8 {
        ((self.0 >> 10) & 3) as u8
    }

    #[inline]
    pub const fn b56(self) -> bool {
        self.0 & Self::B56 != 0
    }

    #[inline]
    pub const fn b60(self) -> bool {
        self.0 & Self::B60 != 0
    }

    #[inline]
    pub const fn b61(self) -> bool {
        self.0 & Self::B61 != 0
    }

    #[inline]
    pub const fn address_space(self) -> u8 {
        (self.0 & 3) as u8
    }

    /// Protection-cause bits for a protection exception.
    const fn protection_bits(prot: ProtType) -> u64 {
        match prot {
            ProtType::InstructionExecution => Self::B61 | Self::B56,
            ProtType::LowAddress => Self::B56,
            ProtType::KeyControlled => Self::B60,
            ProtType::AccessListControlled => Self::B60 | Self::B61,
            ProtType::Dat => Self::B61,
        }
    }
}

/// A program interruption ready to be injected into the guest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProgramInterruption {
    pub code: PgmCode,
    pub teid: Teid,
    /// Access register number, for codes that report it.
    pub exc_access_id: u8,
}

impl ProgramInterruption {
    /// An interruption with no exception identification, as produced by
    /// accesses to absolute storage.
    pub const fn new(code: PgmCode) -> Self {
        Self {
            code,
            teid: Teid(0),
            exc_access_id: 0,
        }
    }
}

/// A failed translation step, before it is attributed to a guest address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fault {
    Program {
        code: PgmCode,
        prot: Option<ProtType>,
    },
    Host(HostFault),
}

impl Fault {
    #[inline]
    pub const fn program(code: PgmCode) -> Self {
        Fault::Program { code, prot: None }
    }

    #[inline]
    pub const fn protection(prot: ProtType) -> Self {
        Fault::Program {
            code: PgmCode::Protection,
            prot: Some(prot),
        }
    }

    pub fn code(&self) -> Option<PgmCode> {
        match self {
            Fault::Program { code, .. } => Some(*code),
            Fault::Host(_) => None,
        }
    }
}

impl From<Fault> for Error {
    /// Surface a fault that has no guest address attached.
    fn from(fault: Fault) -> Self {
        match fault {
            Fault::Program { code, .. } => Error::Program(ProgramInterruption::new(code)),
            Fault::Host(err) => Error::Host(err),
        }
    }
}

impl From<HostFault> for Fault {
    fn from(err: HostFault) -> Self {
        Fault::Host(err)
    }
}

impl From<MemoryError> for Fault {
    fn from(err: MemoryError) -> Self {
        Fault::Host(HostFault::Memory(err))
    }
}

/// Where and how a faulting access was made.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FaultSite {
    pub ga: u64,
    pub ar: u8,
    pub mode: AccessMode,
    /// PSW address-space control at the time of the access.
    pub address_space: u8,
}

/// Attribute `fault` to `site`, producing the guest-visible error.
pub fn trans_exc(fault: Fault, site: FaultSite) -> Error {
    trans_exc_ending(fault, site, false)
}

/// Like [`trans_exc`], but with `terminate` set the protection-cause bits
/// are cleared: the access was terminated rather than suppressed.
pub fn trans_exc_ending(fault: Fault, site: FaultSite, terminate: bool) -> Error {
    let (code, prot) = match fault {
        Fault::Program { code, prot } => (code, prot),
        Fault::Host(err) => return Error::Host(err),
    };

    let mut teid = 0;
    if code == PgmCode::Protection {
        match prot {
            Some(prot) => teid |= Teid::protection_bits(prot),
            None => warn!(ga = site.ga, "protection exception without a cause"),
        }
        if terminate {
            teid &= !(Teid::B56 | Teid::B60 | Teid::B61);
        }
    }
    if code.reports_address() {
        teid |= site.ga & !0xfff;
        teid |= if site.mode == AccessMode::Store {
            Teid::FSI_STORE
        } else {
            Teid::FSI_FETCH
        };
        teid |= u64::from(site.address_space & 3);
    }
    let exc_access_id = if code.reports_access_id() { site.ar } else { 0 };

    debug!(
        code = code.code(),
        ga = site.ga,
        ar = site.ar,
        ?prot,
        terminate,
        "program interruption"
    );
    Error::Program(ProgramInterruption {
        code,
        teid: Teid(teid),
        exc_access_id,
    })
}
