//! Guest memory access primitives.
//!
//! Logical accesses resolve the whole range first, with key checking
//! bypassed, and then move data page by page with the real access key. A
//! protection failure on a page is retried once with the storage-protection
//! override key when that override is enabled.

use s390_guest_mem::{gpa_to_gfn, offset_in_page, GuestMemory, PAGE_SIZE};
use tracing::warn;

use crate::addr::is_low_address;
use crate::error::{HostFault, Result};
use crate::exception::{trans_exc, trans_exc_ending, Fault, PgmCode, ProtType};
use crate::key::{fetch_prot_override_applies, key_permits, vm_check_access_key, SPO_ACCESS_KEY};
use crate::range::{nr_pages, Fragments};
use crate::vcpu::{Cr0, Vcpu, Vm};
use crate::AccessMode;

/// Caller buffer of an access: filled on fetch, drained on store.
#[derive(Debug)]
pub(crate) enum Data<'a> {
    Fetch(&'a mut [u8]),
    Store(&'a [u8]),
}

impl<'a> Data<'a> {
    fn new(data: &'a mut [u8], mode: AccessMode) -> Self {
        match mode {
            AccessMode::Store => Data::Store(data),
            AccessMode::Fetch | AccessMode::InstructionFetch => Data::Fetch(data),
        }
    }

    fn len(&self) -> usize {
        match self {
            Data::Fetch(buf) => buf.len(),
            Data::Store(buf) => buf.len(),
        }
    }

    fn slice(&mut self, start: usize, len: usize) -> Data<'_> {
        match self {
            Data::Fetch(buf) => Data::Fetch(&mut buf[start..start + len]),
            Data::Store(buf) => Data::Store(&buf[start..start + len]),
        }
    }
}

/// Move data to or from one page of absolute storage, checking `access_key`
/// against the frame's storage key the way the hardware would.
fn access_page_with_key<M: GuestMemory + ?Sized>(
    mem: &M,
    gpa: u64,
    data: Data<'_>,
    mode: AccessMode,
    access_key: u8,
) -> std::result::Result<(), Fault> {
    let gfn = gpa_to_gfn(gpa);
    let Some(page) = mem.gfn_to_hva(gfn) else {
        return Err(Fault::program(PgmCode::Addressing));
    };
    if matches!(data, Data::Store(_)) && !page.writable {
        warn!(gpa, "store to read-only memory slot");
        return Err(HostFault::ReadOnlySlot { gpa }.into());
    }
    if access_key != 0 {
        let key = mem.storage_key(page.hva)?;
        if !key_permits(key, access_key, mode) {
            return Err(Fault::program(PgmCode::Protection));
        }
    }

    let hva = page.hva + offset_in_page(gpa);
    match data {
        Data::Fetch(buf) => mem.read_hva(hva, buf)?,
        Data::Store(buf) => {
            mem.write_hva(hva, buf)?;
            mem.mark_page_dirty(gfn);
        }
    }
    Ok(())
}

fn with_key_controlled(fault: Fault) -> Fault {
    match fault {
        Fault::Program {
            code: PgmCode::Protection,
            ..
        } => Fault::protection(ProtType::KeyControlled),
        other => other,
    }
}

impl<M: GuestMemory> Vcpu<M> {
    /// Access `data.len()` bytes at logical address `ga` through access
    /// register `ar`. On store `data` is the source, otherwise the
    /// destination.
    pub fn access_guest_with_key(
        &self,
        ga: u64,
        ar: u8,
        data: &mut [u8],
        mode: AccessMode,
        access_key: u8,
    ) -> Result<()> {
        self.access_logical(ga, ar, Data::new(data, mode), mode, access_key)
    }

    /// Fetch with the PSW key.
    pub fn read_guest(&self, ga: u64, ar: u8, data: &mut [u8]) -> Result<()> {
        let key = self.psw().key();
        self.access_logical(ga, ar, Data::Fetch(data), AccessMode::Fetch, key)
    }

    /// Store with the PSW key.
    pub fn write_guest(&self, ga: u64, ar: u8, data: &[u8]) -> Result<()> {
        let key = self.psw().key();
        self.access_logical(ga, ar, Data::Store(data), AccessMode::Store, key)
    }

    /// Instruction fetch with the PSW key.
    pub fn read_guest_instr(&self, ga: u64, data: &mut [u8]) -> Result<()> {
        let key = self.psw().key();
        self.access_logical(ga, 0, Data::Fetch(data), AccessMode::InstructionFetch, key)
    }

    fn access_logical(
        &self,
        ga: u64,
        ar: u8,
        mut data: Data<'_>,
        mode: AccessMode,
        access_key: u8,
    ) -> Result<()> {
        let len = data.len() as u64;
        if len == 0 {
            return Ok(());
        }
        let mut ga = self.logical_to_effective(ga);
        let asce = self.get_vcpu_asce(ga, ar, mode)?;

        let mut gpas = Vec::new();
        gpas.try_reserve_exact(nr_pages(ga, len) as usize)
            .map_err(|_| HostFault::OutOfMemory)?;

        let try_fpo = self.fetch_prot_override_applicable(mode, asce);
        let try_spo = self.storage_prot_override_applicable();
        let _ipte = (self.psw().dat() && !asce.real_space()).then(|| self.vm().ipte_lock());

        // Key checking is left to the per-page accesses below.
        self.guest_range_to_gpas(ga, ar, Some(&mut gpas), len, asce, mode, 0)?;

        let mut done = 0usize;
        for (idx, &gpa) in gpas.iter().enumerate() {
            let fragment_len = (PAGE_SIZE - offset_in_page(gpa)).min(len - done as u64);
            let n = fragment_len as usize;
            let key = if try_fpo && fetch_prot_override_applies(ga, fragment_len) {
                0
            } else {
                access_key
            };

            let mut rc = access_page_with_key(self.mem(), gpa, data.slice(done, n), mode, key);
            if try_spo && matches!(rc, Err(ref f) if f.code() == Some(PgmCode::Protection)) {
                rc = access_page_with_key(self.mem(), gpa, data.slice(done, n), mode, SPO_ACCESS_KEY);
            }
            if let Err(fault) = rc {
                // Earlier fragments of a store have already been written.
                let terminate = mode == AccessMode::Store && idx > 0;
                return Err(trans_exc_ending(
                    with_key_controlled(fault),
                    self.fault_site(ga, ar, mode),
                    terminate,
                ));
            }

            done += n;
            ga = self.logical_to_effective(ga.wrapping_add(fragment_len));
        }
        Ok(())
    }

    /// Check that a logical range is accessible, without moving data.
    pub fn check_gva_range(
        &self,
        gva: u64,
        ar: u8,
        len: u64,
        mode: AccessMode,
        access_key: u8,
    ) -> Result<()> {
        let asce = self.get_vcpu_asce(gva, ar, mode)?;
        let _ipte = self.vm().ipte_lock();
        self.guest_range_to_gpas(gva, ar, None, len, asce, mode, access_key)
    }

    /// Translate one logical address to absolute, including key checking.
    pub fn guest_translate_address_with_key(
        &self,
        gva: u64,
        ar: u8,
        mode: AccessMode,
        access_key: u8,
    ) -> Result<u64> {
        let gva = self.logical_to_effective(gva);
        let asce = self.get_vcpu_asce(gva, ar, mode)?;
        let mut gpa = Vec::with_capacity(1);
        self.guest_range_to_gpas(gva, ar, Some(&mut gpa), 1, asce, mode, access_key)?;
        gpa.pop()
            .ok_or_else(|| HostFault::InvalidArgument("empty translation").into())
    }

    /// Access guest real storage: prefixing applies, DAT and keys do not.
    /// Storage outside every memory slot is an addressing exception.
    pub fn access_guest_real(&self, gra: u64, data: &mut [u8], mode: AccessMode) -> Result<()> {
        Ok(self.access_real(gra, Data::new(data, mode))?)
    }

    pub fn read_guest_real(&self, gra: u64, data: &mut [u8]) -> Result<()> {
        Ok(self.access_real(gra, Data::Fetch(data))?)
    }

    pub fn write_guest_real(&self, gra: u64, data: &[u8]) -> Result<()> {
        Ok(self.access_real(gra, Data::Store(data))?)
    }

    pub(crate) fn access_real(&self, gra: u64, mut data: Data<'_>) -> std::result::Result<(), Fault> {
        let len = data.len();
        let mut gra = gra;
        let mut done = 0usize;
        while done < len {
            let gpa = self.real_to_abs(gra);
            if self.mem().is_error_gpa(gpa) {
                return Err(Fault::program(PgmCode::Addressing));
            }
            let n = ((PAGE_SIZE - offset_in_page(gpa)) as usize).min(len - done);
            match data.slice(done, n) {
                Data::Fetch(buf) => self.mem().read_abs(gpa, buf)?,
                Data::Store(buf) => self.mem().write_abs(gpa, buf)?,
            }
            done += n;
            gra = gra.wrapping_add(n as u64);
        }
        Ok(())
    }

    /// Low-address protection check for a store to real address `gra`.
    pub fn check_low_addr_prot_real(&self, gra: u64) -> Result<()> {
        if !self.cr0().contains(Cr0::LOW_ADDRESS_PROTECTION) || !is_low_address(gra) {
            return Ok(());
        }
        Err(trans_exc(
            Fault::protection(ProtType::LowAddress),
            self.fault_site(gra, 0, AccessMode::Store),
        ))
    }
}

impl<M: GuestMemory> Vm<M> {
    /// Access absolute storage with `access_key`. Exceptions carry no
    /// exception identification.
    pub fn access_guest_abs_with_key(
        &self,
        gpa: u64,
        data: &mut [u8],
        mode: AccessMode,
        access_key: u8,
    ) -> Result<()> {
        let mut data = Data::new(data, mode);
        let mut done = 0usize;
        for (gpa, len) in Fragments::new(gpa, data.len() as u64) {
            let n = len as usize;
            access_page_with_key(self.mem(), gpa, data.slice(done, n), mode, access_key)?;
            done += n;
        }
        Ok(())
    }

    /// Key-check an absolute range without moving data.
    pub fn check_gpa_range(
        &self,
        gpa: u64,
        len: u64,
        mode: AccessMode,
        access_key: u8,
    ) -> Result<()> {
        for (gpa, _) in Fragments::new(gpa, len) {
            vm_check_access_key(self.mem(), access_key, mode, gpa)?;
        }
        Ok(())
    }

    /// Compare-and-exchange `old.len()` bytes at absolute `gpa`.
    ///
    /// Operands must be 1, 2, 4, 8 or 16 bytes and naturally aligned. On
    /// return `old` holds the value found in storage; the result tells
    /// whether `new` was stored.
    pub fn cmpxchg_guest_abs_with_key(
        &self,
        gpa: u64,
        old: &mut [u8],
        new: &[u8],
        access_key: u8,
    ) -> Result<bool> {
        let len = new.len();
        if old.len() != len || !matches!(len, 1 | 2 | 4 | 8 | 16) {
            return Err(HostFault::InvalidArgument("unsupported operand size").into());
        }
        if gpa % len as u64 != 0 {
            return Err(HostFault::InvalidArgument("unaligned operand").into());
        }
        let gfn = gpa_to_gfn(gpa);
        let Some(page) = self.mem().gfn_to_hva(gfn) else {
            return Err(Fault::program(PgmCode::Addressing).into());
        };
        if !page.writable {
            warn!(gpa, "compare-exchange on read-only memory slot");
            return Err(HostFault::ReadOnlySlot { gpa }.into());
        }
        if access_key != 0 {
            let key = self.mem().storage_key(page.hva)?;
            if !key_permits(key, access_key, AccessMode::Store) {
                return Err(Fault::program(PgmCode::Protection).into());
            }
        }

        let mut expected = [0u8; 16];
        expected[..len].copy_from_slice(old);
        let hva = page.hva + offset_in_page(gpa);
        let swapped = self.mem().cmpxchg_hva(hva, &expected[..len], new, old)?;
        if swapped {
            self.mem().mark_page_dirty(gfn);
        }
        Ok(swapped)
    }
}
