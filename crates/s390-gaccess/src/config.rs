use bitflags::bitflags;

bitflags! {
    /// Installed facilities the translation core depends on.
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
    pub struct Facilities: u32 {
        /// Facility 8: enhanced DAT, 1MiB segment frames.
        const EDAT1 = 1 << 0;
        /// Facility 78: enhanced DAT 2, 2GiB region-third frames.
        const EDAT2 = 1 << 1;
        /// Facility 130: instruction-execution protection.
        const IEP = 1 << 2;
    }
}

impl Facilities {
    /// Map an architected facility number to its flag, if the core cares
    /// about it.
    pub const fn from_number(nr: u32) -> Option<Self> {
        match nr {
            8 => Some(Self::EDAT1),
            78 => Some(Self::EDAT2),
            130 => Some(Self::IEP),
            _ => None,
        }
    }

    /// Collect the flags for a list of installed facility numbers.
    pub fn from_numbers(numbers: impl IntoIterator<Item = u32>) -> Self {
        numbers
            .into_iter()
            .filter_map(Self::from_number)
            .fold(Self::empty(), |acc, f| acc | f)
    }
}

/// Per-VM configuration, fixed at VM creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VmConfig {
    pub facilities: Facilities,
    /// The machine interprets IPTE under SIE, so the IPTE lock is shared with
    /// the hardware and supports concurrent holders.
    pub ipte_interpretation: bool,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            facilities: Facilities::all(),
            ipte_interpretation: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn facility_numbers() {
        assert_eq!(
            Facilities::from_numbers([8, 17, 130]),
            Facilities::EDAT1 | Facilities::IEP
        );
        assert_eq!(Facilities::from_number(78), Some(Facilities::EDAT2));
        assert_eq!(Facilities::from_number(2), None);
    }
}
