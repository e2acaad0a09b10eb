use super::*;

use s390_guest_mem::{GuestMemory, MemorySlot};

use crate::entry::raw;
use crate::exception::Fault;
use crate::test_util::{CountingMemory, DatBuilder};

const MEM_SIZE: u64 = 8 << 20;
const TABLES: u64 = 4 << 20;

const EDAT1: DatFeatures = DatFeatures {
    edat1: true,
    edat2: false,
    iep: false,
};
const EDAT2: DatFeatures = DatFeatures {
    edat1: true,
    edat2: true,
    iep: false,
};

fn translate(
    mem: &CountingMemory,
    asce: Asce,
    va: u64,
    mode: AccessMode,
    features: DatFeatures,
) -> std::result::Result<u64, Fault> {
    guest_translate(mem, 0, features, va, asce, mode)
}

#[test]
fn four_level_walk_reaches_page() {
    let mem = CountingMemory::new(MEM_SIZE);
    let va = 0x0012_3456_7000_0000 | 0x5678;
    let mut dat = DatBuilder::new(&mem, Level::Region1, TABLES);
    dat.map(va, 0x5000);

    mem.reset_counters();
    let gpa = translate(&mem, dat.asce(), va, AccessMode::Fetch, DatFeatures::default());
    assert_eq!(gpa, Ok(0x5678));
    // One entry per level.
    assert_eq!(mem.reads(), 5);
    assert_eq!(mem.writes(), 0);
}

#[test]
fn invalid_entry_raises_that_levels_exception() {
    let va = 0x0012_3456_7000_0000;
    for level in Level::ALL {
        let mem = CountingMemory::new(MEM_SIZE);
        let mut dat = DatBuilder::new(&mem, Level::Region1, TABLES);
        dat.map(va, 0x5000);
        let invalid = match level {
            Level::Page => raw::PTE_INVALID,
            _ => raw::INVALID,
        };
        dat.or_entry(va, level, invalid);

        let rc = translate(&mem, dat.asce(), va, AccessMode::Fetch, DatFeatures::default());
        assert_eq!(rc, Err(Fault::program(level.translation_exception())), "{level:?}");
    }
}

#[test]
fn address_beyond_designated_tables_is_asce_type() {
    let mem = CountingMemory::new(MEM_SIZE);
    let seg = DatBuilder::new(&mem, Level::Segment, TABLES).asce();
    let rc = translate(&mem, seg, 1 << 31, AccessMode::Fetch, DatFeatures::default());
    assert_eq!(rc, Err(Fault::program(PgmCode::AsceType)));

    let r3 = DatBuilder::new(&mem, Level::Region3, TABLES + (1 << 20)).asce();
    let rc = translate(&mem, r3, 1 << 42, AccessMode::Fetch, DatFeatures::default());
    assert_eq!(rc, Err(Fault::program(PgmCode::AsceType)));

    mem.reset_counters();
    let rc = translate(&mem, r3, (1 << 42) - 1, AccessMode::Fetch, DatFeatures::default());
    assert_eq!(rc, Err(Fault::program(PgmCode::RegionThirdTranslation)));
    assert_eq!(mem.reads(), 1);
}

#[test]
fn asce_table_length_limits_first_index() {
    let mem = CountingMemory::new(MEM_SIZE);
    let dat = DatBuilder::new(&mem, Level::Region1, TABLES);
    let asce = Asce::new(dat.asce().origin(), TableType::Region1, 0);

    mem.reset_counters();
    let rc = translate(&mem, asce, 1 << 62, AccessMode::Fetch, DatFeatures::default());
    assert_eq!(rc, Err(Fault::program(PgmCode::RegionFirstTranslation)));
    assert_eq!(mem.reads(), 0);
}

#[test]
fn region_offset_and_length_bound_next_index() {
    let mem = CountingMemory::new(MEM_SIZE);
    let va = 0x1000;
    let mut dat = DatBuilder::new(&mem, Level::Region2, TABLES);
    dat.map(va, 0x5000);

    let ptr = dat.entry_addr(va, Level::Region2);
    let entry = mem.read_u64(ptr).unwrap();
    // Offset 1 excludes index01 == 0 in the region-third table.
    mem.write_u64(ptr, entry | (1 << 6)).unwrap();
    let rc = translate(&mem, dat.asce(), va, AccessMode::Fetch, DatFeatures::default());
    assert_eq!(rc, Err(Fault::program(PgmCode::RegionThirdTranslation)));
}

#[test]
fn table_type_mismatch_is_translation_specification() {
    let mem = CountingMemory::new(MEM_SIZE);
    let va = 0x7000_0000;
    let mut dat = DatBuilder::new(&mem, Level::Region3, TABLES);
    dat.map(va, 0x5000);

    let ptr = dat.entry_addr(va, Level::Region3);
    let entry = mem.read_u64(ptr).unwrap();
    let wrong = (entry & !0xc) | (TableType::Region2.bits() << 2);
    mem.write_u64(ptr, wrong).unwrap();
    let rc = translate(&mem, dat.asce(), va, AccessMode::Fetch, DatFeatures::default());
    assert_eq!(rc, Err(Fault::program(PgmCode::TranslationSpecification)));
}

#[test]
fn zero_bit_in_pte_is_translation_specification() {
    let mem = CountingMemory::new(MEM_SIZE);
    let mut dat = DatBuilder::new(&mem, Level::Segment, TABLES);
    dat.set_entry(0x1000, Level::Page, raw::page(0x5000) | raw::PTE_ZERO);
    let rc = translate(&mem, dat.asce(), 0x1000, AccessMode::Fetch, DatFeatures::default());
    assert_eq!(rc, Err(Fault::program(PgmCode::TranslationSpecification)));
}

#[test]
fn segment_frame_needs_edat1() {
    let mem = CountingMemory::new(MEM_SIZE);
    let va = 0x30_1234;
    let mut dat = DatBuilder::new(&mem, Level::Segment, TABLES);
    dat.set_entry(va, Level::Segment, raw::segment_frame(0x20_0000));

    let rc = translate(&mem, dat.asce(), va, AccessMode::Fetch, DatFeatures::default());
    assert_eq!(rc, Err(Fault::program(PgmCode::TranslationSpecification)));

    mem.reset_counters();
    let rc = translate(&mem, dat.asce(), va, AccessMode::Fetch, EDAT1);
    assert_eq!(rc, Ok(0x20_1234));
    assert_eq!(mem.reads(), 1);
}

#[test]
fn region3_frame_stops_the_walk() {
    let mem = CountingMemory::new(MEM_SIZE);
    mem.add_slot(MemorySlot::new(0x8000_0000, 0x10000));
    let va = 0x8000_1000;
    let mut dat = DatBuilder::new(&mem, Level::Region3, TABLES);
    dat.set_entry(va, Level::Region3, raw::region3_frame(0x8000_0000));

    let rc = translate(&mem, dat.asce(), va, AccessMode::Fetch, EDAT1);
    assert_eq!(rc, Err(Fault::program(PgmCode::TranslationSpecification)));

    mem.reset_counters();
    let rc = translate(&mem, dat.asce(), va, AccessMode::Store, EDAT2);
    assert_eq!(rc, Ok(0x8000_1000));
    // No segment or page table was read.
    assert_eq!(mem.reads(), 1);
}

#[test]
fn large_frame_outside_memory_is_left_to_the_caller() {
    let mem = CountingMemory::new(MEM_SIZE);
    let mut dat = DatBuilder::new(&mem, Level::Region3, TABLES);
    dat.set_entry(0x8000_0000, Level::Region3, raw::region3_frame(0x8000_0000));
    let rc = translate(&mem, dat.asce(), 0x8000_0010, AccessMode::Fetch, EDAT2);
    assert_eq!(rc, Ok(0x8000_0010));
    assert!(mem.is_error_gpa(0x8000_0010));
}

#[test]
fn table_origin_at_top_of_address_space_wraps() {
    let mem = CountingMemory::new(MEM_SIZE);
    let va = 0x7ff0_0000;
    let mut dat = DatBuilder::new(&mem, Level::Region3, TABLES);
    dat.set_entry(
        va,
        Level::Region3,
        raw::region(0xffff_ffff_ffff_f000, TableType::Region3, 0, 3),
    );
    // Segment index 0x7ff puts the entry 0x3ff8 past the origin.
    mem.write_u64(0x2ff8, raw::INVALID).unwrap();

    mem.reset_counters();
    let rc = translate(&mem, dat.asce(), va, AccessMode::Fetch, DatFeatures::default());
    assert_eq!(rc, Err(Fault::program(PgmCode::SegmentTranslation)));
    assert_eq!(mem.reads(), 2);
}

#[test]
fn common_segment_in_private_space() {
    let mem = CountingMemory::new(MEM_SIZE);
    let mut dat = DatBuilder::new(&mem, Level::Segment, TABLES);
    dat.map(0x1000, 0x5000);
    dat.or_entry(0x1000, Level::Segment, raw::COMMON);

    let rc = translate(&mem, dat.asce(), 0x1000, AccessMode::Fetch, DatFeatures::default());
    assert_eq!(rc, Ok(0x5000));

    let private = dat.asce().with_flags(Asce::PRIVATE_SPACE);
    let rc = translate(&mem, private, 0x1000, AccessMode::Fetch, DatFeatures::default());
    assert_eq!(rc, Err(Fault::program(PgmCode::TranslationSpecification)));
}

#[test]
fn dat_protection_only_blocks_stores() {
    let mem = CountingMemory::new(MEM_SIZE);
    let mut dat = DatBuilder::new(&mem, Level::Segment, TABLES);
    dat.map(0x1000, 0x5000);
    dat.or_entry(0x1000, Level::Segment, raw::PROTECT);

    let asce = dat.asce();
    let none = DatFeatures::default();
    assert_eq!(translate(&mem, asce, 0x1000, AccessMode::Fetch, none), Ok(0x5000));
    assert_eq!(
        translate(&mem, asce, 0x1000, AccessMode::Store, none),
        Err(Fault::protection(ProtType::Dat))
    );
}

#[test]
fn region_protection_needs_edat1() {
    let mem = CountingMemory::new(MEM_SIZE);
    let mut dat = DatBuilder::new(&mem, Level::Region3, TABLES);
    dat.map(0x1000, 0x5000);
    dat.or_entry(0x1000, Level::Region3, raw::PROTECT);

    let asce = dat.asce();
    let rc = translate(&mem, asce, 0x1000, AccessMode::Store, DatFeatures::default());
    assert_eq!(rc, Ok(0x5000));
    let rc = translate(&mem, asce, 0x1000, AccessMode::Store, EDAT1);
    assert_eq!(rc, Err(Fault::protection(ProtType::Dat)));
}

#[test]
fn iep_blocks_instruction_fetch_when_enabled() {
    let mem = CountingMemory::new(MEM_SIZE);
    let mut dat = DatBuilder::new(&mem, Level::Segment, TABLES);
    dat.set_entry(0x1000, Level::Page, raw::page(0x5000) | raw::PTE_IEP);
    let asce = dat.asce();

    let iep = DatFeatures {
        iep: true,
        ..DatFeatures::default()
    };
    assert_eq!(
        translate(&mem, asce, 0x1000, AccessMode::InstructionFetch, iep),
        Err(Fault::protection(ProtType::InstructionExecution))
    );
    assert_eq!(translate(&mem, asce, 0x1000, AccessMode::Fetch, iep), Ok(0x5000));
    assert_eq!(
        translate(&mem, asce, 0x1000, AccessMode::InstructionFetch, DatFeatures::default()),
        Ok(0x5000)
    );
}

#[test]
fn page_frame_is_prefixed() {
    let mem = CountingMemory::new(MEM_SIZE);
    let mut dat = DatBuilder::new(&mem, Level::Segment, TABLES);
    dat.map(0x10_0000, 0x1000);

    let gpa = guest_translate(
        &mem,
        0x2_0000,
        DatFeatures::default(),
        0x10_0010,
        dat.asce(),
        AccessMode::Fetch,
    );
    assert_eq!(gpa, Ok(0x2_1010));
}

#[test]
fn real_space_asce_skips_tables() {
    let mem = CountingMemory::new(MEM_SIZE);
    let asce = Asce::REAL;
    let gpa = guest_translate(&mem, 0x4_0000, DatFeatures::default(), 0x100, asce, AccessMode::Fetch);
    assert_eq!(gpa, Ok(0x4_0100));
    assert_eq!(mem.reads(), 0);
}

#[test]
fn unbacked_table_is_addressing() {
    let mem = CountingMemory::new(MEM_SIZE);
    let asce = Asce::new(MEM_SIZE, TableType::Segment, 3);
    let rc = translate(&mem, asce, 0x1000, AccessMode::Fetch, DatFeatures::default());
    assert_eq!(rc, Err(Fault::program(PgmCode::Addressing)));
}
