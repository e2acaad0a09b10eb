//! Virtual machine and virtual CPU state consulted by guest accesses.

use std::fmt;
use std::sync::Arc;

use bitflags::bitflags;
use s390_guest_mem::GuestMemory;

use crate::addr::{logical_to_effective, AddressingMode};
use crate::config::{Facilities, VmConfig};
use crate::ipte::{self, IpteControl, IpteGuard, IpteLock, PurgeGuard};
use crate::walk::DatFeatures;

/// Number of access registers and control registers.
pub const NUM_REGS: usize = 16;

/// PSW address-space control.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AddressSpace {
    Primary,
    AccessRegister,
    Secondary,
    Home,
}

impl AddressSpace {
    #[inline]
    pub const fn from_bits(bits: u64) -> Self {
        match bits & 3 {
            0 => AddressSpace::Primary,
            1 => AddressSpace::AccessRegister,
            2 => AddressSpace::Secondary,
            _ => AddressSpace::Home,
        }
    }

    #[inline]
    pub const fn bits(self) -> u8 {
        match self {
            AddressSpace::Primary => 0,
            AddressSpace::AccessRegister => 1,
            AddressSpace::Secondary => 2,
            AddressSpace::Home => 3,
        }
    }
}

/// Program-status word.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Psw {
    pub mask: u64,
    pub addr: u64,
}

impl Psw {
    pub const DAT: u64 = 1 << 58;
    const KEY_SHIFT: u32 = 52;
    const AS_SHIFT: u32 = 46;
    const EA: u64 = 1 << 32;
    const BA: u64 = 1 << 31;

    #[inline]
    pub const fn dat(self) -> bool {
        self.mask & Self::DAT != 0
    }

    #[inline]
    pub const fn key(self) -> u8 {
        ((self.mask >> Self::KEY_SHIFT) & 0xf) as u8
    }

    #[inline]
    pub const fn address_space(self) -> AddressSpace {
        AddressSpace::from_bits(self.mask >> Self::AS_SHIFT)
    }

    #[inline]
    pub const fn addressing_mode(self) -> AddressingMode {
        match (self.mask & Self::EA != 0, self.mask & Self::BA != 0) {
            (true, true) => AddressingMode::Bits64,
            (false, true) => AddressingMode::Bits31,
            _ => AddressingMode::Bits24,
        }
    }

    pub const fn with_dat(self, on: bool) -> Self {
        let mask = if on {
            self.mask | Self::DAT
        } else {
            self.mask & !Self::DAT
        };
        Self { mask, ..self }
    }

    pub const fn with_key(self, key: u8) -> Self {
        let mask =
            (self.mask & !(0xf << Self::KEY_SHIFT)) | (((key & 0xf) as u64) << Self::KEY_SHIFT);
        Self { mask, ..self }
    }

    pub const fn with_address_space(self, space: AddressSpace) -> Self {
        let mask = (self.mask & !(3 << Self::AS_SHIFT)) | ((space.bits() as u64) << Self::AS_SHIFT);
        Self { mask, ..self }
    }

    pub const fn with_addressing_mode(self, amode: AddressingMode) -> Self {
        let bits = match amode {
            AddressingMode::Bits64 => Self::EA | Self::BA,
            AddressingMode::Bits31 => Self::BA,
            AddressingMode::Bits24 => 0,
        };
        Self {
            mask: (self.mask & !(Self::EA | Self::BA)) | bits,
            ..self
        }
    }
}

bitflags! {
    /// Control register 0 bits consulted by guest accesses.
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
    pub struct Cr0: u64 {
        const LOW_ADDRESS_PROTECTION = 1 << 28;
        const FETCH_PROTECTION_OVERRIDE = 1 << 25;
        const STORAGE_PROTECTION_OVERRIDE = 1 << 24;
        const EDAT = 1 << 23;
        const IEP = 1 << 20;
    }
}

/// Architected vCPU registers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VcpuState {
    pub psw: Psw,
    /// Control registers 0-15.
    pub gcr: [u64; NUM_REGS],
    /// Access registers 0-15.
    pub acrs: [u32; NUM_REGS],
    /// Prefix register.
    pub prefix: u64,
}

impl Default for VcpuState {
    fn default() -> Self {
        Self {
            psw: Psw::default().with_addressing_mode(AddressingMode::Bits64),
            gcr: [0; NUM_REGS],
            acrs: [0; NUM_REGS],
            prefix: 0,
        }
    }
}

impl VcpuState {
    #[inline]
    pub fn cr0(&self) -> Cr0 {
        Cr0::from_bits_truncate(self.gcr[0])
    }
}

/// VM-wide state shared by all vCPUs: guest memory, configuration and the
/// IPTE lock.
pub struct Vm<M> {
    mem: M,
    config: VmConfig,
    ipte: Box<dyn IpteLock>,
}

impl<M: GuestMemory> Vm<M> {
    /// The IPTE lock implementation is chosen here, once, from
    /// [`VmConfig::ipte_interpretation`].
    pub fn new(mem: M, config: VmConfig) -> Self {
        Self {
            mem,
            config,
            ipte: ipte::new_lock(config.ipte_interpretation),
        }
    }

    #[inline]
    pub fn mem(&self) -> &M {
        &self.mem
    }

    #[inline]
    pub fn config(&self) -> &VmConfig {
        &self.config
    }

    #[inline]
    pub fn has_facility(&self, facility: Facilities) -> bool {
        self.config.facilities.contains(facility)
    }

    /// Take the IPTE lock for a translation that walks guest tables.
    pub fn ipte_lock(&self) -> IpteGuard<'_> {
        IpteGuard::new(&*self.ipte)
    }

    /// Enter an interlocked table purge. Blocks while translations hold the
    /// IPTE lock.
    pub fn ipte_purge(&self) -> PurgeGuard<'_> {
        PurgeGuard::new(&*self.ipte)
    }

    pub fn ipte_lock_held(&self) -> bool {
        self.ipte.is_held()
    }

    /// Current IPTE control word.
    pub fn ipte_control(&self) -> IpteControl {
        self.ipte.control()
    }

    /// Block until no translation holds the IPTE lock.
    pub fn wait_ipte_released(&self) {
        self.ipte.wait_released();
    }
}

impl<M> fmt::Debug for Vm<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Vm")
            .field("config", &self.config)
            .field("ipte", &self.ipte)
            .finish_non_exhaustive()
    }
}

/// A virtual CPU: its registers plus a handle on the VM.
///
/// Guest access operations are implemented as methods in the modules that
/// own them ([`crate::access`], [`crate::range`], [`crate::shadow`]).
#[derive(Debug)]
pub struct Vcpu<M> {
    vm: Arc<Vm<M>>,
    pub state: VcpuState,
}

impl<M: GuestMemory> Vcpu<M> {
    pub fn new(vm: Arc<Vm<M>>) -> Self {
        Self {
            vm,
            state: VcpuState::default(),
        }
    }

    #[inline]
    pub fn vm(&self) -> &Arc<Vm<M>> {
        &self.vm
    }

    #[inline]
    pub fn mem(&self) -> &M {
        self.vm.mem()
    }

    #[inline]
    pub fn psw(&self) -> Psw {
        self.state.psw
    }

    #[inline]
    pub fn cr0(&self) -> Cr0 {
        self.state.cr0()
    }

    /// Apply the current addressing mode to a logical address.
    #[inline]
    pub fn logical_to_effective(&self, ga: u64) -> u64 {
        logical_to_effective(self.state.psw.addressing_mode(), ga)
    }

    /// Real → absolute conversion with this vCPU's prefix.
    #[inline]
    pub fn real_to_abs(&self, gra: u64) -> u64 {
        crate::addr::real_to_abs(self.state.prefix, gra)
    }

    /// DAT extensions enabled both by facility and by CR0.
    pub fn dat_features(&self) -> DatFeatures {
        let cr0 = self.cr0();
        let edat1 = cr0.contains(Cr0::EDAT) && self.vm.has_facility(Facilities::EDAT1);
        DatFeatures {
            edat1,
            edat2: edat1 && self.vm.has_facility(Facilities::EDAT2),
            iep: cr0.contains(Cr0::IEP) && self.vm.has_facility(Facilities::IEP),
        }
    }
}
