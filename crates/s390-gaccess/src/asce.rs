//! Address-space-control element decoding.

/// Designation type of an ASCE, also used as the table-type tag of region and
/// segment table entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TableType {
    Segment,
    Region3,
    Region2,
    Region1,
}

impl TableType {
    #[inline]
    pub const fn from_bits(bits: u64) -> Self {
        match bits & 3 {
            0 => TableType::Segment,
            1 => TableType::Region3,
            2 => TableType::Region2,
            _ => TableType::Region1,
        }
    }

    #[inline]
    pub const fn bits(self) -> u64 {
        match self {
            TableType::Segment => 0,
            TableType::Region3 => 1,
            TableType::Region2 => 2,
            TableType::Region1 => 3,
        }
    }
}

/// Address-space-control element.
///
/// ```text
///  0                                51  54 55 56 57 58   60 61 62 63
/// |       table origin (4K aligned)  | G | P | S | X | R |  DT  |  TL  |
/// ```
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Asce(pub u64);

impl Asce {
    pub const ORIGIN_MASK: u64 = !0xfff;
    pub const SUBSPACE_GROUP: u64 = 1 << 9;
    pub const PRIVATE_SPACE: u64 = 1 << 8;
    pub const STORAGE_ALTERATION: u64 = 1 << 7;
    pub const SPACE_SWITCH: u64 = 1 << 6;
    pub const REAL_SPACE: u64 = 1 << 5;

    /// The ASCE used when DAT is off: a real-space designation.
    pub const REAL: Asce = Asce(Self::REAL_SPACE);

    pub const fn new(origin: u64, dt: TableType, tl: u8) -> Self {
        Self((origin & Self::ORIGIN_MASK) | (dt.bits() << 2) | (tl as u64 & 3))
    }

    pub const fn with_flags(self, flags: u64) -> Self {
        Self(self.0 | flags)
    }

    /// Absolute address of the designated table.
    #[inline]
    pub const fn origin(self) -> u64 {
        self.0 & Self::ORIGIN_MASK
    }

    #[inline]
    pub const fn designation_type(self) -> TableType {
        TableType::from_bits(self.0 >> 2)
    }

    /// Table length in units of 512 entries, minus one.
    #[inline]
    pub const fn table_length(self) -> u8 {
        (self.0 & 3) as u8
    }

    #[inline]
    pub const fn private_space(self) -> bool {
        self.0 & Self::PRIVATE_SPACE != 0
    }

    #[inline]
    pub const fn real_space(self) -> bool {
        self.0 & Self::REAL_SPACE != 0
    }

    #[inline]
    pub const fn subspace_group(self) -> bool {
        self.0 & Self::SUBSPACE_GROUP != 0
    }

    #[inline]
    pub const fn storage_alteration(self) -> bool {
        self.0 & Self::STORAGE_ALTERATION != 0
    }
}
