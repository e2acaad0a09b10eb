//! DAT table entries.
//!
//! Region-third and segment-table entries have two layouts selected by the
//! format-control bit. An entry is decoded once: the bits common to both
//! layouts first, then exactly one typed record for the active layout.

use crate::addr::Level;
use crate::asce::TableType;

const INVALID: u64 = 1 << 5;
const COMMON: u64 = 1 << 4;
const PROTECT: u64 = 1 << 9;
const FORMAT_CONTROL: u64 = 1 << 10;

const FRAME_ACCF_VALID: u64 = 1 << 16;
const FRAME_FETCH_PROTECT: u64 = 1 << 11;
const FRAME_IEP: u64 = 1 << 8;

const PTE_ZERO: u64 = 1 << 11;
const PTE_INVALID: u64 = 1 << 10;
const PTE_PROTECT: u64 = 1 << 9;
const PTE_IEP: u64 = 1 << 8;

/// Designation of the next-lower table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NextTable {
    /// Absolute origin of the next table.
    pub origin: u64,
    /// Lowest valid value of the next index's leftmost two bits.
    pub offset: u8,
    /// Highest valid value of the next index's leftmost two bits.
    pub length: u8,
    pub protected: bool,
}

/// A region-third (2GiB) or segment (1MiB) frame mapped without lower tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LargeFrame {
    /// Absolute address of the frame.
    pub frame: u64,
    /// Access-control bits, present when the ACCF-validity control is set.
    pub access_control: Option<u8>,
    pub fetch_protected: bool,
    pub protected: bool,
    pub iep: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryFormat {
    Table(NextTable),
    Frame(LargeFrame),
}

/// A decoded region or segment table entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableEntry {
    pub invalid: bool,
    pub table_type: TableType,
    /// Common-region / common-segment bit.
    pub common: bool,
    pub format: EntryFormat,
}

impl TableEntry {
    /// Decode a raw entry read from a table at `level`.
    ///
    /// Only region-third and segment entries honour the format-control bit;
    /// whether a frame may actually be used is decided by the caller.
    pub fn decode(level: Level, raw: u64) -> Self {
        let large = raw & FORMAT_CONTROL != 0 && matches!(level, Level::Region3 | Level::Segment);
        let format = if large {
            let frame_mask = !(level.entry_span() - 1);
            EntryFormat::Frame(LargeFrame {
                frame: raw & frame_mask,
                access_control: (raw & FRAME_ACCF_VALID != 0).then_some(((raw >> 12) & 0xf) as u8),
                fetch_protected: raw & FRAME_FETCH_PROTECT != 0,
                protected: raw & PROTECT != 0,
                iep: raw & FRAME_IEP != 0,
            })
        } else if level == Level::Segment {
            // Page tables are 2KiB aligned and have no offset/length fields.
            EntryFormat::Table(NextTable {
                origin: raw & !0x7ff,
                offset: 0,
                length: 3,
                protected: raw & PROTECT != 0,
            })
        } else {
            EntryFormat::Table(NextTable {
                origin: raw & !0xfff,
                offset: ((raw >> 6) & 3) as u8,
                length: (raw & 3) as u8,
                protected: raw & PROTECT != 0,
            })
        };

        Self {
            invalid: raw & INVALID != 0,
            table_type: TableType::from_bits(raw >> 2),
            common: raw & COMMON != 0,
            format,
        }
    }

    pub fn protected(&self) -> bool {
        match self.format {
            EntryFormat::Table(t) => t.protected,
            EntryFormat::Frame(f) => f.protected,
        }
    }
}

/// A page-table entry.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PageTableEntry(pub u64);

impl PageTableEntry {
    pub const INVALID: u64 = PTE_INVALID;
    pub const PROTECT: u64 = PTE_PROTECT;

    /// Real address of the page frame.
    #[inline]
    pub const fn frame(self) -> u64 {
        self.0 & !0xfff
    }

    #[inline]
    pub const fn invalid(self) -> bool {
        self.0 & PTE_INVALID != 0
    }

    #[inline]
    pub const fn zero_bit(self) -> bool {
        self.0 & PTE_ZERO != 0
    }

    #[inline]
    pub const fn protected(self) -> bool {
        self.0 & PTE_PROTECT != 0
    }

    #[inline]
    pub const fn iep(self) -> bool {
        self.0 & PTE_IEP != 0
    }

    pub const fn with_protection(self, protected: bool) -> Self {
        if protected {
            Self(self.0 | PTE_PROTECT)
        } else {
            self
        }
    }
}

/// Raw entry encoders, used to build guest tables.
pub mod raw {
    use super::*;

    /// Region-first/second/third entry designating a lower table.
    pub const fn region(origin: u64, tt: TableType, offset: u8, length: u8) -> u64 {
        (origin & !0xfff) | ((offset as u64 & 3) << 6) | (tt.bits() << 2) | (length as u64 & 3)
    }

    /// Region-third entry mapping a 2GiB frame.
    pub const fn region3_frame(frame: u64) -> u64 {
        (frame & !((1 << 31) - 1)) | FORMAT_CONTROL | (TableType::Region3.bits() << 2)
    }

    /// Segment-table entry designating a page table.
    pub const fn segment(pt_origin: u64) -> u64 {
        pt_origin & !0x7ff
    }

    /// Segment-table entry mapping a 1MiB frame.
    pub const fn segment_frame(frame: u64) -> u64 {
        (frame & !((1 << 20) - 1)) | FORMAT_CONTROL
    }

    pub const fn page(frame: u64) -> u64 {
        frame & !0xfff
    }

    pub const INVALID: u64 = super::INVALID;
    pub const PROTECT: u64 = super::PROTECT;
    pub const COMMON: u64 = super::COMMON;
    pub const FRAME_IEP: u64 = super::FRAME_IEP;
    pub const FRAME_FETCH_PROTECT: u64 = super::FRAME_FETCH_PROTECT;
    pub const PTE_INVALID: u64 = super::PTE_INVALID;
    pub const PTE_ZERO: u64 = super::PTE_ZERO;
    pub const PTE_PROTECT: u64 = super::PTE_PROTECT;
    pub const PTE_IEP: u64 = super::PTE_IEP;

    /// ACCF-validity control plus access-control bits of a large frame.
    pub const fn frame_access_control(acc: u8) -> u64 {
        super::FRAME_ACCF_VALID | ((acc as u64 & 0xf) << 12)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn region3_format_selects_layout() {
        let table = TableEntry::decode(
            Level::Region3,
            raw::region(0x5000, TableType::Region3, 1, 2) | raw::PROTECT,
        );
        assert_eq!(table.table_type, TableType::Region3);
        assert_eq!(
            table.format,
            EntryFormat::Table(NextTable {
                origin: 0x5000,
                offset: 1,
                length: 2,
                protected: true,
            })
        );

        let frame = TableEntry::decode(
            Level::Region3,
            raw::region3_frame(0x1_8000_0000) | raw::FRAME_IEP | raw::frame_access_control(9),
        );
        assert_eq!(frame.table_type, TableType::Region3);
        assert_eq!(
            frame.format,
            EntryFormat::Frame(LargeFrame {
                frame: 0x1_8000_0000,
                access_control: Some(9),
                fetch_protected: false,
                protected: false,
                iep: true,
            })
        );
    }

    #[test]
    fn format_control_is_ignored_above_region3() {
        let raw = raw::region(0x7000, TableType::Region2, 0, 3) | (1 << 10);
        let entry = TableEntry::decode(Level::Region2, raw);
        assert!(matches!(entry.format, EntryFormat::Table(t) if t.origin == 0x7000));
    }

    #[test]
    fn segment_layouts() {
        let pt = TableEntry::decode(Level::Segment, raw::segment(0x2800) | raw::COMMON);
        assert!(pt.common);
        assert_eq!(pt.table_type, TableType::Segment);
        assert!(matches!(pt.format, EntryFormat::Table(t) if t.origin == 0x2800));

        let frame = TableEntry::decode(Level::Segment, raw::segment_frame(0x30_0000) | raw::PROTECT);
        assert!(frame.protected());
        assert!(matches!(frame.format, EntryFormat::Frame(f) if f.frame == 0x30_0000 && f.access_control.is_none()));
    }

    #[test]
    fn page_entry_bits() {
        let pte = PageTableEntry(raw::page(0x1234_5000) | raw::PTE_PROTECT | raw::PTE_IEP);
        assert_eq!(pte.frame(), 0x1234_5000);
        assert!(pte.protected());
        assert!(pte.iep());
        assert!(!pte.invalid());
        assert!(!pte.zero_bit());
        assert!(PageTableEntry(raw::PTE_INVALID).invalid());
        assert!(PageTableEntry(raw::PTE_ZERO).zero_bit());
    }
}
