//! Virtual, real and absolute address helpers.

use crate::asce::TableType;
use crate::exception::PgmCode;
use s390_guest_mem::PAGE_SIZE;

/// One level of the DAT hierarchy, coarsest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Level {
    Region1,
    Region2,
    Region3,
    Segment,
    Page,
}

impl Level {
    pub const ALL: [Level; 5] = [
        Level::Region1,
        Level::Region2,
        Level::Region3,
        Level::Segment,
        Level::Page,
    ];

    /// Bit position of the lowest bit of this level's index field.
    #[inline]
    pub const fn index_shift(self) -> u32 {
        match self {
            Level::Region1 => 53,
            Level::Region2 => 42,
            Level::Region3 => 31,
            Level::Segment => 20,
            Level::Page => 12,
        }
    }

    /// Bytes of address space mapped by one entry at this level.
    #[inline]
    pub const fn entry_span(self) -> u64 {
        1 << self.index_shift()
    }

    #[inline]
    pub const fn next(self) -> Option<Level> {
        match self {
            Level::Region1 => Some(Level::Region2),
            Level::Region2 => Some(Level::Region3),
            Level::Region3 => Some(Level::Segment),
            Level::Segment => Some(Level::Page),
            Level::Page => None,
        }
    }

    /// Table-type tag carried by entries of this level. Page-table entries
    /// have none.
    #[inline]
    pub const fn table_type(self) -> Option<TableType> {
        match self {
            Level::Region1 => Some(TableType::Region1),
            Level::Region2 => Some(TableType::Region2),
            Level::Region3 => Some(TableType::Region3),
            Level::Segment => Some(TableType::Segment),
            Level::Page => None,
        }
    }

    /// The level whose table an ASCE of the given type designates.
    #[inline]
    pub const fn from_table_type(tt: TableType) -> Level {
        match tt {
            TableType::Region1 => Level::Region1,
            TableType::Region2 => Level::Region2,
            TableType::Region3 => Level::Region3,
            TableType::Segment => Level::Segment,
        }
    }

    /// Exception raised when an entry of this level is invalid or its index
    /// lies outside the table.
    #[inline]
    pub const fn translation_exception(self) -> PgmCode {
        match self {
            Level::Region1 => PgmCode::RegionFirstTranslation,
            Level::Region2 => PgmCode::RegionSecondTranslation,
            Level::Region3 => PgmCode::RegionThirdTranslation,
            Level::Segment => PgmCode::SegmentTranslation,
            Level::Page => PgmCode::PageTranslation,
        }
    }
}

/// A 64-bit virtual address split into its DAT index fields.
///
/// ```text
///  0        11        22        33        44      52        63
/// |   RFX   |   RSX   |   RTX   |   SX    |   PX  |    BX    |
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VirtualAddress(pub u64);

impl VirtualAddress {
    #[inline]
    pub const fn rfx(self) -> u64 {
        self.0 >> 53
    }

    #[inline]
    pub const fn rsx(self) -> u64 {
        (self.0 >> 42) & 0x7ff
    }

    #[inline]
    pub const fn rtx(self) -> u64 {
        (self.0 >> 31) & 0x7ff
    }

    #[inline]
    pub const fn sx(self) -> u64 {
        (self.0 >> 20) & 0x7ff
    }

    #[inline]
    pub const fn px(self) -> u64 {
        (self.0 >> 12) & 0xff
    }

    #[inline]
    pub const fn bx(self) -> u64 {
        self.0 & 0xfff
    }

    /// Index into the table of `level`.
    #[inline]
    pub const fn index(self, level: Level) -> u64 {
        match level {
            Level::Region1 => self.rfx(),
            Level::Region2 => self.rsx(),
            Level::Region3 => self.rtx(),
            Level::Segment => self.sx(),
            Level::Page => self.px(),
        }
    }

    /// Leftmost two bits of a region/segment index, compared against table
    /// offset and length fields. Always 0 for the page level.
    #[inline]
    pub const fn index01(self, level: Level) -> u8 {
        match level {
            Level::Page => 0,
            _ => (self.index(level) >> 9) as u8,
        }
    }

    /// Index bits above `level` that a table walk starting at `level` does
    /// not consume. Nonzero means an ASCE-type exception.
    #[inline]
    pub const fn unconsumed_high_bits(self, level: Level) -> u64 {
        match level {
            Level::Region1 => 0,
            Level::Region2 => self.0 >> 53,
            Level::Region3 => self.0 >> 42,
            Level::Segment => self.0 >> 31,
            Level::Page => self.0 >> 20,
        }
    }

    /// Offset within a large frame or page mapped at `level`.
    #[inline]
    pub const fn offset_within(self, level: Level) -> u64 {
        self.0 & (level.entry_span() - 1)
    }
}

/// PSW extended/basic addressing mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressingMode {
    Bits24,
    Bits31,
    Bits64,
}

/// Apply addressing-mode wraparound to a logical address.
#[inline]
pub const fn logical_to_effective(amode: AddressingMode, ga: u64) -> u64 {
    match amode {
        AddressingMode::Bits64 => ga,
        AddressingMode::Bits31 => ga & ((1 << 31) - 1),
        AddressingMode::Bits24 => ga & ((1 << 24) - 1),
    }
}

/// Real → absolute prefixing: the first two pages and the prefix area swap.
#[inline]
pub const fn real_to_abs(prefix: u64, gra: u64) -> u64 {
    if gra < 2 * PAGE_SIZE {
        gra + prefix
    } else if gra >= prefix && gra < prefix + 2 * PAGE_SIZE {
        gra - prefix
    } else {
        gra
    }
}

/// Addresses 0..=511 and 4096..=4607 are subject to low-address protection.
#[inline]
pub const fn is_low_address(ga: u64) -> bool {
    ga & !0x11ff == 0
}
