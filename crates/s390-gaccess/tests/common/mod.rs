// Shared test helpers (integration tests compile as separate crates, so put common code in a
// submodule to avoid it becoming its own test target).
#![allow(dead_code)]

use std::sync::Arc;

use s390_gaccess::entry::{raw, EntryFormat, TableEntry};
use s390_gaccess::{
    AddressSpace, Asce, Error, Level, ProgramInterruption, TableType, Vcpu, VirtualAddress, Vm,
    VmConfig,
};
use s390_guest_mem::{GuestMemory, GuestRam};

/// Guest RAM size used by most tests.
pub const RAM_SIZE: u64 = 16 << 20;
/// Where test page tables are allocated; data frames live below.
pub const TABLE_AREA: u64 = 8 << 20;

pub fn vm_with(config: VmConfig) -> Arc<Vm<GuestRam>> {
    let ram = GuestRam::with_size(RAM_SIZE).unwrap();
    Arc::new(Vm::new(ram, config))
}

pub fn vcpu_with(config: VmConfig) -> Vcpu<GuestRam> {
    Vcpu::new(vm_with(config))
}

/// Turn DAT on in the primary space with `asce` in CR1.
pub fn enable_dat(vcpu: &mut Vcpu<GuestRam>, asce: Asce) {
    vcpu.state.gcr[1] = asce.0;
    vcpu.state.psw = vcpu
        .state
        .psw
        .with_dat(true)
        .with_address_space(AddressSpace::Primary);
}

pub fn set_psw_key(vcpu: &mut Vcpu<GuestRam>, key: u8) {
    vcpu.state.psw = vcpu.state.psw.with_key(key);
}

#[track_caller]
pub fn pgm(err: Error) -> ProgramInterruption {
    match err {
        Error::Program(pgm) => pgm,
        other => panic!("expected a program interruption, got {other:?}"),
    }
}

/// Builds DAT tables in guest memory. Tables are carved out of a bump
/// region starting at the given address and come up filled with invalid
/// entries.
pub struct TableBuilder<'a, M: GuestMemory> {
    mem: &'a M,
    top: Level,
    root: u64,
    next: u64,
}

impl<'a, M: GuestMemory> TableBuilder<'a, M> {
    pub fn new(mem: &'a M, top: Level, area: u64) -> Self {
        let mut tables = Self {
            mem,
            top,
            root: 0,
            next: area,
        };
        tables.root = tables.alloc(top);
        tables
    }

    fn alloc(&mut self, level: Level) -> u64 {
        let origin = self.next;
        let (entries, empty) = match level.table_type() {
            Some(tt) => (2048u64, raw::INVALID | (tt.bits() << 2)),
            None => (256, raw::PTE_INVALID),
        };
        let mut table = Vec::with_capacity(entries as usize * 8);
        for _ in 0..entries {
            table.extend_from_slice(&empty.to_be_bytes());
        }
        self.mem.write_abs(origin, &table).unwrap();
        self.next += 2048 * 8;
        origin
    }

    pub fn asce(&self) -> Asce {
        Asce::new(self.root, self.top.table_type().unwrap_or(TableType::Segment), 3)
    }

    /// Absolute address of the entry translating `va` at `level`. Missing
    /// intermediate tables are created.
    pub fn entry_addr(&mut self, va: u64, level: Level) -> u64 {
        let va = VirtualAddress(va);
        let mut table = self.root;
        let mut cur = self.top;
        while cur != level {
            let ptr = table + va.index(cur) * 8;
            let lower = cur.next().unwrap();
            let entry = TableEntry::decode(cur, self.mem.read_u64(ptr).unwrap());
            table = match entry.format {
                _ if entry.invalid => {
                    let origin = self.alloc(lower);
                    let designation = match cur.table_type() {
                        Some(TableType::Segment) | None => raw::segment(origin),
                        Some(tt) => raw::region(origin, tt, 0, 3),
                    };
                    self.mem.write_u64(ptr, designation).unwrap();
                    origin
                }
                EntryFormat::Table(next) => next.origin,
                EntryFormat::Frame(_) => panic!("{va:?} already maps a large frame"),
            };
            cur = lower;
        }
        table + va.index(level) * 8
    }

    pub fn set(&mut self, va: u64, level: Level, entry: u64) {
        let ptr = self.entry_addr(va, level);
        self.mem.write_u64(ptr, entry).unwrap();
    }

    pub fn set_bits(&mut self, va: u64, level: Level, bits: u64) {
        let ptr = self.entry_addr(va, level);
        let entry = self.mem.read_u64(ptr).unwrap();
        self.mem.write_u64(ptr, entry | bits).unwrap();
    }

    pub fn map(&mut self, va: u64, frame: u64) {
        self.set(va, Level::Page, raw::page(frame));
    }
}
