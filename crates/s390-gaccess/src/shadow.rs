//! Shadow DAT tables for nested guests.
//!
//! A [`ShadowSpace`] caches, per DAT level, what the nested guest's tables
//! say about a shadow address range, so that the combined translation can be
//! served without walking guest memory again. Entries are built lazily by
//! [`Vm::shadow_fault`] and dropped by [`ShadowSpace::unshadow`].
//!
//! When the nested guest's ASCE is a real-space designation, or a walk hits
//! a large frame, the levels below are "fake": they describe contiguous
//! memory and are computed with address arithmetic instead of being read
//! from a table.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use s390_guest_mem::{gpa_to_gfn, GuestMemory, MemoryError, PAGE_SIZE};
use tracing::debug;

use crate::addr::{Level, VirtualAddress};
use crate::asce::Asce;
use crate::entry::PageTableEntry;
use crate::error::{HostFault, Result};
use crate::exception::{Fault, PgmCode};
use crate::vcpu::{Vcpu, Vm};
use crate::walk::{check_asce, step, DatFeatures, Descent};

/// The reported entry is DAT protected.
pub const PEI_DAT_PROT: u64 = 2;
/// The reported entry is a region or segment entry, not a page-table entry.
pub const PEI_NOT_PTE: u64 = 4;

/// A cached region or segment level entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShadowEntry {
    /// Origin of the next-lower guest table, or the base of the contiguous
    /// range a fake entry stands for.
    pub origin: u64,
    /// Protection accumulated down to and including this level.
    pub protected: bool,
    pub fake: bool,
}

/// A shadowed page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShadowPage {
    /// Absolute address of the backing frame in the outer guest.
    pub frame: u64,
    pub protected: bool,
}

/// Outcome of a shadow fault that did not hit a host fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShadowFault {
    /// The established page, or the program interruption the nested guest
    /// must see.
    pub result: std::result::Result<ShadowPage, PgmCode>,
    /// Guest table entry to watch for invalidation, tagged with
    /// [`PEI_NOT_PTE`] and [`PEI_DAT_PROT`]. `None` for fake mappings.
    pub datptr: Option<u64>,
}

const TABLE_LEVELS: usize = 4;

#[derive(Debug, Default)]
struct ShadowTables {
    /// Entries per region/segment level, keyed by the shadow address aligned
    /// to the level's entry span.
    entries: [BTreeMap<u64, ShadowEntry>; TABLE_LEVELS],
    pages: BTreeMap<u64, ShadowPage>,
}

fn table_slot(level: Level) -> Option<usize> {
    match level {
        Level::Region1 => Some(0),
        Level::Region2 => Some(1),
        Level::Region3 => Some(2),
        Level::Segment => Some(3),
        Level::Page => None,
    }
}

#[inline]
fn level_key(level: Level, saddr: u64) -> u64 {
    saddr & !(level.entry_span() - 1)
}

impl ShadowTables {
    fn lookup(&self, level: Level, saddr: u64) -> Option<ShadowEntry> {
        let slot = table_slot(level)?;
        self.entries[slot].get(&level_key(level, saddr)).copied()
    }

    fn insert(&mut self, level: Level, saddr: u64, entry: ShadowEntry) {
        let Some(slot) = table_slot(level) else {
            return;
        };
        self.entries[slot]
            .entry(level_key(level, saddr))
            .or_insert_with(|| {
                debug!(?level, saddr, origin = entry.origin, fake = entry.fake, "shadow entry");
                entry
            });
    }
}

/// Shadow address space for one nested-guest ASCE.
#[derive(Debug)]
pub struct ShadowSpace {
    asce: Asce,
    edat_level: u8,
    tables: Mutex<ShadowTables>,
}

impl ShadowSpace {
    /// `edat_level` is the EDAT level available to the nested guest (0-2).
    pub fn new(asce: Asce, edat_level: u8) -> Self {
        Self {
            asce,
            edat_level: edat_level.min(2),
            tables: Mutex::new(ShadowTables::default()),
        }
    }

    pub fn asce(&self) -> Asce {
        self.asce
    }

    pub fn edat_level(&self) -> u8 {
        self.edat_level
    }

    fn tables(&self) -> MutexGuard<'_, ShadowTables> {
        self.tables.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Number of cached entries at `level`.
    pub fn entry_count(&self, level: Level) -> usize {
        let tables = self.tables();
        match table_slot(level) {
            Some(slot) => tables.entries[slot].len(),
            None => tables.pages.len(),
        }
    }

    pub fn lookup(&self, level: Level, saddr: u64) -> Option<ShadowEntry> {
        self.tables().lookup(level, saddr)
    }

    pub fn page(&self, saddr: u64) -> Option<ShadowPage> {
        self.tables().pages.get(&level_key(Level::Page, saddr)).copied()
    }

    /// Translate a shadow address through the cache.
    pub fn translate(&self, saddr: u64) -> Option<u64> {
        self.page(saddr).map(|page| page.frame | VirtualAddress(saddr).bx())
    }

    /// Drop every cached entry whose range overlaps `saddr..saddr+len`.
    pub fn unshadow(&self, saddr: u64, len: u64) {
        if len == 0 {
            return;
        }
        let end = saddr.saturating_add(len - 1);
        let overlaps = |level: Level, key: u64| {
            let last = key.saturating_add(level.entry_span() - 1);
            key <= end && last >= saddr
        };

        let mut tables = self.tables();
        for level in Level::ALL {
            match table_slot(level) {
                Some(slot) => tables.entries[slot].retain(|&key, _| !overlaps(level, key)),
                None => tables.pages.retain(|&key, _| !overlaps(level, key)),
            }
        }
        debug!(saddr, len, "unshadow");
    }
}

/// Walk state carried between levels of a shadow walk.
#[derive(Debug, Default, Clone, Copy)]
struct ShadowWalk {
    /// Address of the last guest entry read, then the page-table origin (or
    /// fake frame base) once the walk completes.
    pgt: u64,
    dat_protection: bool,
    fake: bool,
}

/// Walk the nested guest's region and segment tables for `saddr`, creating
/// the shadow entry of every level passed through.
fn shadow_tables<M: GuestMemory + ?Sized>(
    mem: &M,
    sg: &ShadowSpace,
    tables: &mut ShadowTables,
    saddr: u64,
    w: &mut ShadowWalk,
) -> std::result::Result<(), Fault> {
    let va = VirtualAddress(saddr);
    let asce = sg.asce;
    let features = DatFeatures::from_edat_level(sg.edat_level);

    let mut ptr = asce.origin();
    w.pgt = ptr;
    let mut level = if asce.real_space() {
        w.fake = true;
        ptr = 0;
        Level::Region1
    } else {
        check_asce(asce, va)?
    };

    while level != Level::Page {
        let (next_origin, next_level) = if w.fake {
            ptr = ptr.wrapping_add(va.index(level) * level.entry_span());
            (ptr, level.next())
        } else {
            let entry_addr = ptr.wrapping_add(va.index(level) * 8);
            w.pgt = entry_addr;
            let raw = mem.read_u64(entry_addr)?;
            match step(level, raw, va, asce, features)? {
                Descent::Table {
                    level: lower,
                    origin,
                    protected,
                } => {
                    w.dat_protection |= protected;
                    (origin, Some(lower))
                }
                Descent::Frame(frame) => {
                    w.dat_protection |= frame.protected;
                    w.fake = true;
                    (frame.frame, level.next())
                }
            }
        };

        tables.insert(
            level,
            saddr,
            ShadowEntry {
                origin: next_origin,
                protected: w.dat_protection,
                fake: w.fake,
            },
        );
        ptr = next_origin;
        level = match next_level {
            Some(next) => next,
            None => break,
        };
    }

    w.pgt = ptr;
    Ok(())
}

const fn is_table_translation(code: PgmCode) -> bool {
    matches!(
        code,
        PgmCode::SegmentTranslation
            | PgmCode::RegionThirdTranslation
            | PgmCode::RegionSecondTranslation
            | PgmCode::RegionFirstTranslation
    )
}

impl<M: GuestMemory> Vm<M> {
    /// Resolve a fault on shadow address `saddr`, building whatever shadow
    /// entries are missing.
    ///
    /// Runs under the IPTE lock and the shadow space's table lock. Host
    /// faults are returned as errors; architectural exceptions are part of
    /// the [`ShadowFault`].
    pub fn shadow_fault(&self, sg: &ShadowSpace, saddr: u64) -> Result<ShadowFault> {
        let _ipte = self.ipte_lock();
        let mut tables = sg.tables();
        let va = VirtualAddress(saddr);

        let mut w = ShadowWalk::default();
        let rc = match tables.lookup(Level::Segment, saddr) {
            Some(entry) => {
                w = ShadowWalk {
                    pgt: entry.origin,
                    dat_protection: entry.protected,
                    fake: entry.fake,
                };
                Ok(())
            }
            None => shadow_tables(self.mem(), sg, &mut tables, saddr, &mut w),
        };

        let mut datptr = None;
        let pte = if w.fake {
            rc.map(|()| PageTableEntry(w.pgt.wrapping_add(va.px() * PAGE_SIZE)))
        } else {
            let mut pgt = w.pgt;
            let pte = match rc {
                Ok(()) => {
                    pgt = pgt.wrapping_add(va.px() * 8);
                    self.mem()
                        .read_u64(pgt)
                        .map(PageTableEntry)
                        .map_err(Fault::from)
                }
                Err(fault) => {
                    if fault.code().is_some_and(is_table_translation) {
                        pgt |= PEI_NOT_PTE;
                    }
                    Err(fault)
                }
            };
            datptr = Some(if w.dat_protection {
                pgt | PEI_DAT_PROT
            } else {
                pgt
            });
            pte.and_then(|pte| {
                if pte.invalid() {
                    Err(Fault::program(PgmCode::PageTranslation))
                } else if pte.zero_bit() {
                    Err(Fault::program(PgmCode::TranslationSpecification))
                } else {
                    Ok(pte)
                }
            })
        };

        let pte = match pte {
            Ok(pte) => pte.with_protection(w.dat_protection),
            Err(Fault::Program { code, .. }) => {
                return Ok(ShadowFault {
                    result: Err(code),
                    datptr,
                })
            }
            Err(Fault::Host(err)) => return Err(err.into()),
        };

        let frame = pte.frame();
        if self.mem().is_error_gpa(frame) {
            let gfn = gpa_to_gfn(frame);
            return Err(HostFault::Memory(MemoryError::UnmappedGuestFrame { gfn }).into());
        }
        let page = *tables
            .pages
            .entry(level_key(Level::Page, saddr))
            .or_insert_with(|| {
                debug!(saddr, frame, protected = pte.protected(), "shadow page");
                ShadowPage {
                    frame,
                    protected: pte.protected(),
                }
            });

        Ok(ShadowFault {
            result: Ok(page),
            datptr,
        })
    }
}

impl<M: GuestMemory> Vcpu<M> {
    /// EDAT level this vCPU can offer a nested guest's shadow space.
    pub fn shadow_edat_level(&self) -> u8 {
        let features = self.dat_features();
        u8::from(features.edat1) + u8::from(features.edat2)
    }
}
