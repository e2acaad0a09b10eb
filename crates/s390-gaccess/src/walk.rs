//! DAT table walk.
//!
//! The walk enters at the level designated by the ASCE and steps one level at
//! a time. Each step decodes one region/segment entry with [`step`], which is
//! shared with the shadow-table builder, and either descends into the next
//! table or stops at a large frame.

use s390_guest_mem::GuestMemory;
use tracing::trace;

use crate::addr::{real_to_abs, Level, VirtualAddress};
use crate::asce::Asce;
use crate::entry::{EntryFormat, LargeFrame, PageTableEntry, TableEntry};
use crate::exception::{Fault, PgmCode, ProtType};
use crate::AccessMode;

/// DAT extensions in effect for a walk.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DatFeatures {
    /// 1MiB segment frames, region-entry protection.
    pub edat1: bool,
    /// 2GiB region-third frames.
    pub edat2: bool,
    /// Instruction-execution protection.
    pub iep: bool,
}

impl DatFeatures {
    /// Features implied by an EDAT level (0, 1 or 2).
    pub const fn from_edat_level(level: u8) -> Self {
        Self {
            edat1: level >= 1,
            edat2: level >= 2,
            iep: false,
        }
    }
}

/// How the walk continues after a region or segment entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Descent {
    /// Descend into the table of `level` at `origin`. `protected` tells
    /// whether the entry contributes DAT protection.
    Table {
        level: Level,
        origin: u64,
        protected: bool,
    },
    /// The entry maps a large frame; the walk ends here.
    Frame(LargeFrame),
}

/// Validate a region or segment entry read at `level` for `va`.
pub fn step(
    level: Level,
    raw: u64,
    va: VirtualAddress,
    asce: Asce,
    features: DatFeatures,
) -> Result<Descent, Fault> {
    let entry = TableEntry::decode(level, raw);
    trace!(?level, raw, "dat entry");

    if entry.invalid {
        return Err(Fault::program(level.translation_exception()));
    }
    if Some(entry.table_type) != level.table_type() {
        return Err(Fault::program(PgmCode::TranslationSpecification));
    }
    match level {
        Level::Region3 if entry.common && asce.private_space() && features.edat2 => {
            return Err(Fault::program(PgmCode::TranslationSpecification));
        }
        Level::Segment if entry.common && asce.private_space() => {
            return Err(Fault::program(PgmCode::TranslationSpecification));
        }
        _ => {}
    }

    match entry.format {
        EntryFormat::Frame(frame) => {
            let allowed = match level {
                Level::Region3 => features.edat2,
                _ => features.edat1,
            };
            if !allowed {
                return Err(Fault::program(PgmCode::TranslationSpecification));
            }
            Ok(Descent::Frame(frame))
        }
        EntryFormat::Table(next) => {
            let Some(lower) = level.next() else {
                return Err(Fault::program(PgmCode::TranslationSpecification));
            };
            let idx = va.index01(lower);
            if lower != Level::Page && (idx < next.offset || idx > next.length) {
                return Err(Fault::program(lower.translation_exception()));
            }
            // Region-entry protection only exists with EDAT-1.
            let protected = match level {
                Level::Segment => next.protected,
                _ => next.protected && features.edat1,
            };
            Ok(Descent::Table {
                level: lower,
                origin: next.origin,
                protected,
            })
        }
    }
}

/// Checks made against the ASCE before any table is touched. Returns the
/// level the walk enters at.
pub fn check_asce(asce: Asce, va: VirtualAddress) -> Result<Level, Fault> {
    let level = Level::from_table_type(asce.designation_type());
    if va.unconsumed_high_bits(level) != 0 {
        return Err(Fault::program(PgmCode::AsceType));
    }
    if va.index01(level) > asce.table_length() {
        return Err(Fault::program(level.translation_exception()));
    }
    Ok(level)
}

/// Read one 8-byte table entry from guest absolute storage.
fn read_entry<M: GuestMemory + ?Sized>(mem: &M, ptr: u64) -> Result<u64, Fault> {
    if mem.is_error_gpa(ptr) {
        return Err(Fault::program(PgmCode::Addressing));
    }
    Ok(mem.read_u64(ptr)?)
}

/// Translate guest virtual address `gva` through the tables designated by
/// `asce`, returning the guest absolute address.
///
/// Protection accumulated along the walk is enforced here: stores fail on DAT
/// protection, instruction fetches fail on instruction-execution protection
/// when IEP is enabled. The result is not checked against guest memory;
/// callers report an addressing exception when they consume it.
pub fn guest_translate<M: GuestMemory + ?Sized>(
    mem: &M,
    prefix: u64,
    features: DatFeatures,
    gva: u64,
    asce: Asce,
    mode: AccessMode,
) -> Result<u64, Fault> {
    let va = VirtualAddress(gva);
    let mut dat_protection = false;
    let mut iep_protection = false;

    let gpa = if asce.real_space() {
        real_to_abs(prefix, gva)
    } else {
        let mut level = check_asce(asce, va)?;
        let mut origin = asce.origin();
        loop {
            let ptr = origin.wrapping_add(va.index(level) * 8);
            let raw = read_entry(mem, ptr)?;

            if level == Level::Page {
                let pte = PageTableEntry(raw);
                trace!(raw, "dat pte");
                if pte.invalid() {
                    return Err(Fault::program(PgmCode::PageTranslation));
                }
                if pte.zero_bit() {
                    return Err(Fault::program(PgmCode::TranslationSpecification));
                }
                dat_protection |= pte.protected();
                iep_protection = pte.iep();
                break real_to_abs(prefix, pte.frame() | va.bx());
            }

            match step(level, raw, va, asce, features)? {
                Descent::Table {
                    level: lower,
                    origin: next,
                    protected,
                } => {
                    dat_protection |= protected;
                    origin = next;
                    level = lower;
                }
                Descent::Frame(frame) => {
                    dat_protection |= frame.protected;
                    iep_protection = frame.iep;
                    break frame.frame | va.offset_within(level);
                }
            }
        }
    };

    if mode == AccessMode::Store && dat_protection {
        return Err(Fault::protection(ProtType::Dat));
    }
    if mode == AccessMode::InstructionFetch && iep_protection && features.iep {
        return Err(Fault::protection(ProtType::InstructionExecution));
    }
    Ok(gpa)
}
