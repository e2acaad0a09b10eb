//! Storage-key checks and the protection overrides.

use s390_guest_mem::{gpa_to_gfn, GuestMemory, StorageKey};

use crate::asce::Asce;
use crate::exception::{Fault, PgmCode};
use crate::vcpu::{Cr0, Vcpu};
use crate::AccessMode;

/// Access-control value that storage-protection override lets any key store
/// to.
pub const SPO_ACCESS_KEY: u8 = 9;

/// Fetch-protection override covers effective addresses 0..2048.
const FPO_LIMIT: u64 = 2048;

/// Whether a fragment `ga..ga+len` lies in the fetch-protection-override
/// area.
#[inline]
pub const fn fetch_prot_override_applies(ga: u64, len: u64) -> bool {
    ga < FPO_LIMIT && ga + len <= FPO_LIMIT
}

#[inline]
pub const fn storage_prot_override_applies(access_control: u8) -> bool {
    access_control == SPO_ACCESS_KEY
}

/// Whether an access with `access_key` to a frame with storage key `key` is
/// allowed by the key alone, without any override.
#[inline]
pub fn key_permits(key: StorageKey, access_key: u8, mode: AccessMode) -> bool {
    access_key == 0
        || key.access_control() == access_key
        || (mode.is_fetch() && !key.fetch_protected())
}

impl<M: GuestMemory> Vcpu<M> {
    /// Low-address protection is in effect unless DAT is on with a private
    /// address space.
    pub fn low_address_protection_enabled(&self, asce: Asce) -> bool {
        self.cr0().contains(Cr0::LOW_ADDRESS_PROTECTION)
            && !(self.psw().dat() && asce.private_space())
    }

    pub fn fetch_prot_override_applicable(&self, mode: AccessMode, asce: Asce) -> bool {
        mode.is_fetch()
            && self.cr0().contains(Cr0::FETCH_PROTECTION_OVERRIDE)
            && !(self.psw().dat() && asce.private_space())
    }

    pub fn storage_prot_override_applicable(&self) -> bool {
        self.cr0().contains(Cr0::STORAGE_PROTECTION_OVERRIDE)
    }

    /// Key-controlled protection check of a `len` byte fragment at absolute
    /// `gpa`, reached through effective address `ga`.
    pub fn check_access_key(
        &self,
        access_key: u8,
        mode: AccessMode,
        asce: Asce,
        gpa: u64,
        ga: u64,
        len: u64,
    ) -> Result<(), Fault> {
        if access_key == 0 {
            return Ok(());
        }
        let Some(page) = self.mem().gfn_to_hva(gpa_to_gfn(gpa)) else {
            return Err(Fault::program(PgmCode::Addressing));
        };
        let key = self.mem().storage_key(page.hva)?;

        if key.access_control() == access_key {
            return Ok(());
        }
        if mode.is_fetch() {
            if !key.fetch_protected() {
                return Ok(());
            }
            if self.fetch_prot_override_applicable(mode, asce)
                && fetch_prot_override_applies(ga, len)
            {
                return Ok(());
            }
        }
        if self.storage_prot_override_applicable()
            && storage_prot_override_applies(key.access_control())
        {
            return Ok(());
        }
        Err(Fault::program(PgmCode::Protection))
    }
}

/// Key check for VM-level accesses, which have no vCPU and so no overrides.
pub fn vm_check_access_key<M: GuestMemory + ?Sized>(
    mem: &M,
    access_key: u8,
    mode: AccessMode,
    gpa: u64,
) -> Result<(), Fault> {
    if access_key == 0 {
        return Ok(());
    }
    let Some(page) = mem.gfn_to_hva(gpa_to_gfn(gpa)) else {
        return Err(Fault::program(PgmCode::Addressing));
    };
    let key = mem.storage_key(page.hva)?;
    if key_permits(key, access_key, mode) {
        Ok(())
    } else {
        Err(Fault::program(PgmCode::Protection))
    }
}
