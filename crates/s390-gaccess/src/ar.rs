//! Access-register translation and per-access ASCE selection.
//!
//! In access-register mode the ASCE comes from an ASN-second-table entry
//! reached through the access list designated by the ALET in the access
//! register:
//!
//! ```text
//! ALET ──► ALD (CR2 or CR5) ──► ALE ──► ASTE ──► ASCE
//! ```
//!
//! All of these tables live in guest real storage.

use s390_guest_mem::GuestMemory;

use crate::access::Data;
use crate::asce::Asce;
use crate::error::{HostFault, Result};
use crate::exception::{trans_exc, Fault, FaultSite, PgmCode, ProtType};
use crate::vcpu::{AddressSpace, Vcpu, NUM_REGS};
use crate::AccessMode;

/// Access-list-entry token, the content of an access register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Alet(pub u32);

impl Alet {
    #[inline]
    pub const fn reserved(self) -> u32 {
        self.0 >> 25
    }

    /// Selects the PASTE-based (CR5) rather than the DUCT-based (CR2) list.
    #[inline]
    pub const fn private(self) -> bool {
        self.0 & (1 << 24) != 0
    }

    #[inline]
    pub const fn alesn(self) -> u8 {
        (self.0 >> 16) as u8
    }

    #[inline]
    pub const fn alen(self) -> u16 {
        self.0 as u16
    }
}

/// Access-list designation word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Ald(u32);

impl Ald {
    /// Access-list origin, in units of 128 bytes.
    const fn alo(self) -> u64 {
        ((self.0 >> 7) & 0xff_ffff) as u64
    }

    /// Access-list length, in units of 8 entries minus one.
    const fn all(self) -> u16 {
        (self.0 & 0x7f) as u16
    }
}

/// Access-list entry (16 bytes).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Ale {
    invalid: bool,
    fetch_only: bool,
    private: bool,
    alesn: u8,
    aleax: u16,
    /// ASTE origin, in units of 64 bytes.
    asteo: u64,
    astesn: u32,
}

impl Ale {
    fn decode(raw: [u8; 16]) -> Self {
        let w0 = u64::from_be_bytes(head(&raw));
        let w1 = u64::from_be_bytes(tail(&raw));
        Self {
            invalid: w0 & (1 << 63) != 0,
            fetch_only: w0 & (1 << 57) != 0,
            private: w0 & (1 << 56) != 0,
            alesn: (w0 >> 48) as u8,
            aleax: (w0 >> 32) as u16,
            asteo: (w1 >> 38) & 0x1ff_ffff,
            astesn: w1 as u32,
        }
    }
}

/// ASN-second-table entry (64 bytes).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Aste {
    invalid: bool,
    /// Authority-table origin, in units of 4 bytes.
    ato: u64,
    /// Authority-table length, in units of 16 entries.
    atl: u16,
    asce: Asce,
    astesn: u32,
}

impl Aste {
    fn decode(raw: &[u8; 64]) -> Self {
        let word = |i: usize| {
            let mut b = [0u8; 8];
            b.copy_from_slice(&raw[i * 8..i * 8 + 8]);
            u64::from_be_bytes(b)
        };
        let w0 = word(0);
        Self {
            invalid: w0 & (1 << 63) != 0,
            ato: (w0 >> 34) & 0x1fff_ffff,
            atl: ((w0 >> 4) & 0xfff) as u16,
            asce: Asce(word(1)),
            astesn: word(2) as u32,
        }
    }
}

fn head(raw: &[u8; 16]) -> [u8; 8] {
    let mut b = [0u8; 8];
    b.copy_from_slice(&raw[..8]);
    b
}

fn tail(raw: &[u8; 16]) -> [u8; 8] {
    let mut b = [0u8; 8];
    b.copy_from_slice(&raw[8..]);
    b
}

impl<M: GuestMemory> Vcpu<M> {
    fn read_real(&self, gra: u64, buf: &mut [u8]) -> std::result::Result<(), Fault> {
        self.access_real(gra, Data::Fetch(buf))
    }

    /// Resolve access register `ar` to an ASCE.
    pub fn ar_translation(&self, ar: u8, mode: AccessMode) -> std::result::Result<Asce, Fault> {
        if usize::from(ar) >= NUM_REGS {
            return Err(HostFault::InvalidArgument("access register number out of range").into());
        }
        let gcr = &self.state.gcr;
        let alet = Alet(self.state.acrs[usize::from(ar)]);
        if ar == 0 || alet.0 == 0 {
            return Ok(Asce(gcr[1]));
        }
        if alet.0 == 1 {
            return Ok(Asce(gcr[7]));
        }
        if alet.reserved() != 0 {
            return Err(Fault::program(PgmCode::AletSpecification));
        }

        let ald_addr = (if alet.private() { gcr[5] } else { gcr[2] }) & 0x7fff_ffc0;
        let mut word = [0u8; 4];
        self.read_real(ald_addr + 16, &mut word)?;
        let ald = Ald(u32::from_be_bytes(word));

        if alet.alen() / 8 > ald.all() {
            return Err(Fault::program(PgmCode::AlenTranslation));
        }
        let alen = u64::from(alet.alen());
        if 0x7fff_ffff - ald.alo() * 128 < alen * 16 {
            return Err(Fault::program(PgmCode::Addressing));
        }
        let mut raw = [0u8; 16];
        self.read_real(ald.alo() * 128 + alen * 16, &mut raw)?;
        let ale = Ale::decode(raw);
        if ale.invalid {
            return Err(Fault::program(PgmCode::AlenTranslation));
        }
        if ale.alesn != alet.alesn() {
            return Err(Fault::program(PgmCode::AleSequence));
        }

        let mut raw = [0u8; 64];
        self.read_real(ale.asteo * 64, &mut raw)?;
        let aste = Aste::decode(&raw);
        if aste.invalid {
            return Err(Fault::program(PgmCode::AsteValidity));
        }
        if aste.astesn != ale.astesn {
            return Err(Fault::program(PgmCode::AsteSequence));
        }

        if ale.private {
            let eax = ((gcr[8] >> 16) & 0xffff) as u16;
            if ale.aleax != eax {
                if eax / 16 > aste.atl {
                    return Err(Fault::program(PgmCode::ExtendedAuthority));
                }
                let mut authority = [0u8; 1];
                self.read_real(aste.ato * 4 + u64::from(eax / 4), &mut authority)?;
                // Two bits per EAX; test the secondary-authority bit.
                if authority[0] & (0x40 >> ((eax & 3) * 2)) == 0 {
                    return Err(Fault::program(PgmCode::ExtendedAuthority));
                }
            }
        }

        if ale.fetch_only && mode == AccessMode::Store {
            return Err(Fault::program(PgmCode::Protection));
        }
        Ok(aste.asce)
    }

    /// The ASCE an access with `mode` through access register `ar` uses.
    ///
    /// DAT off yields the real-space ASCE. Instruction fetches always use the
    /// primary space unless the PSW selects the home space.
    pub fn get_vcpu_asce(&self, ga: u64, ar: u8, mode: AccessMode) -> Result<Asce> {
        let psw = self.psw();
        if !psw.dat() {
            return Ok(Asce::REAL);
        }
        let mut space = psw.address_space();
        if mode == AccessMode::InstructionFetch && space != AddressSpace::Home {
            space = AddressSpace::Primary;
        }
        match space {
            AddressSpace::Primary => Ok(Asce(self.state.gcr[1])),
            AddressSpace::Secondary => Ok(Asce(self.state.gcr[7])),
            AddressSpace::Home => Ok(Asce(self.state.gcr[13])),
            AddressSpace::AccessRegister => self.ar_translation(ar, mode).map_err(|fault| {
                let fault = match fault {
                    Fault::Program { code, .. } => Fault::Program {
                        code,
                        prot: Some(ProtType::AccessListControlled),
                    },
                    host => host,
                };
                trans_exc(fault, self.fault_site(ga, ar, mode))
            }),
        }
    }

    pub(crate) fn fault_site(&self, ga: u64, ar: u8, mode: AccessMode) -> FaultSite {
        FaultSite {
            ga,
            ar,
            mode,
            address_space: self.psw().address_space().bits(),
        }
    }
}
