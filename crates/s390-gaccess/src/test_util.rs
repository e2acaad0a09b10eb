use std::sync::atomic::{AtomicUsize, Ordering};

use s390_guest_mem::{GuestMemory, GuestRam, HostPage, MemorySlot, StorageKey};

use crate::addr::{Level, VirtualAddress};
use crate::asce::{Asce, TableType};
use crate::entry::{raw, EntryFormat, TableEntry};

/// Guest RAM that counts byte accesses, so tests can tell how many table
/// entries a walk touched.
pub(crate) struct CountingMemory {
    pub ram: GuestRam,
    reads: AtomicUsize,
    writes: AtomicUsize,
}

impl CountingMemory {
    pub fn new(size: u64) -> Self {
        Self {
            ram: GuestRam::with_size(size).unwrap(),
            reads: AtomicUsize::new(0),
            writes: AtomicUsize::new(0),
        }
    }

    pub fn add_slot(&self, slot: MemorySlot) {
        self.ram.add_slot(slot).unwrap();
    }

    pub fn reset_counters(&self) {
        self.reads.store(0, Ordering::Relaxed);
        self.writes.store(0, Ordering::Relaxed);
    }

    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::Relaxed)
    }

    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::Relaxed)
    }
}

impl GuestMemory for CountingMemory {
    fn gfn_to_hva(&self, gfn: u64) -> Option<HostPage> {
        self.ram.gfn_to_hva(gfn)
    }

    fn read_hva(&self, hva: u64, dst: &mut [u8]) -> s390_guest_mem::Result<()> {
        self.reads.fetch_add(1, Ordering::Relaxed);
        self.ram.read_hva(hva, dst)
    }

    fn write_hva(&self, hva: u64, src: &[u8]) -> s390_guest_mem::Result<()> {
        self.writes.fetch_add(1, Ordering::Relaxed);
        self.ram.write_hva(hva, src)
    }

    fn cmpxchg_hva(
        &self,
        hva: u64,
        expected: &[u8],
        new: &[u8],
        observed: &mut [u8],
    ) -> s390_guest_mem::Result<bool> {
        self.ram.cmpxchg_hva(hva, expected, new, observed)
    }

    fn storage_key(&self, hva: u64) -> s390_guest_mem::Result<StorageKey> {
        self.ram.storage_key(hva)
    }

    fn set_storage_key(&self, hva: u64, key: StorageKey) -> s390_guest_mem::Result<()> {
        self.ram.set_storage_key(hva, key)
    }

    fn mark_page_dirty(&self, gfn: u64) {
        self.ram.mark_page_dirty(gfn)
    }
}

/// Region and segment tables are allocated at full length (2048 entries).
const TABLE_BYTES: u64 = 2048 * 8;

/// Builds DAT tables in guest memory, allocating tables bump-style from
/// `next`.
pub(crate) struct DatBuilder<'a, M: GuestMemory> {
    mem: &'a M,
    top: Level,
    root: u64,
    next: u64,
}

fn invalid_entry(level: Level) -> u64 {
    match level.table_type() {
        Some(tt) => raw::INVALID | (tt.bits() << 2),
        None => raw::PTE_INVALID,
    }
}

impl<'a, M: GuestMemory> DatBuilder<'a, M> {
    pub fn new(mem: &'a M, top: Level, table_area: u64) -> Self {
        let mut builder = Self {
            mem,
            top,
            root: 0,
            next: table_area,
        };
        builder.root = builder.alloc(top);
        builder
    }

    fn alloc(&mut self, level: Level) -> u64 {
        let origin = self.next;
        let entries = if level == Level::Page { 256 } else { 2048 };
        for i in 0..entries {
            self.mem.write_u64(origin + i * 8, invalid_entry(level)).unwrap();
        }
        self.next += TABLE_BYTES;
        origin
    }

    pub fn asce(&self) -> Asce {
        let tt = self.top.table_type().unwrap_or(TableType::Segment);
        Asce::new(self.root, tt, 3)
    }

    /// Address of the entry for `va` at `level`, creating the tables above it.
    pub fn entry_addr(&mut self, va: u64, level: Level) -> u64 {
        let va = VirtualAddress(va);
        let mut table = self.root;
        let mut cur = self.top;
        while cur != level {
            let ptr = table + va.index(cur) * 8;
            let entry = self.mem.read_u64(ptr).unwrap();
            let decoded = TableEntry::decode(cur, entry);
            let lower = cur.next().unwrap();
            table = if decoded.invalid {
                let origin = self.alloc(lower);
                let entry = match cur {
                    Level::Segment => raw::segment(origin),
                    _ => raw::region(origin, cur.table_type().unwrap(), 0, 3),
                };
                self.mem.write_u64(ptr, entry).unwrap();
                origin
            } else {
                match decoded.format {
                    EntryFormat::Table(next) => next.origin,
                    EntryFormat::Frame(_) => panic!("{va:?} is mapped by a large frame"),
                }
            };
            cur = lower;
        }
        table + va.index(level) * 8
    }

    pub fn set_entry(&mut self, va: u64, level: Level, value: u64) {
        let ptr = self.entry_addr(va, level);
        self.mem.write_u64(ptr, value).unwrap();
    }

    pub fn or_entry(&mut self, va: u64, level: Level, bits: u64) {
        let ptr = self.entry_addr(va, level);
        let old = self.mem.read_u64(ptr).unwrap();
        self.mem.write_u64(ptr, old | bits).unwrap();
    }

    /// Map the 4KiB page at `va` to `frame`.
    pub fn map(&mut self, va: u64, frame: u64) {
        self.set_entry(va, Level::Page, raw::page(frame));
    }
}
