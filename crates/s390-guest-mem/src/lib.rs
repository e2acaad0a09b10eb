//! Guest absolute storage for an s390 virtual machine.
//!
//! The translation core never touches host memory directly. It goes through
//! [`GuestMemory`], which models the pieces of the hypervisor's memory
//! machinery it depends on:
//! - memory-slot lookup (guest frame → host virtual address + writability)
//! - byte access keyed by host virtual address
//! - storage-key get/set (one key per 4KiB frame)
//! - dirty logging
//! - a compare-and-exchange that is atomic with respect to other accessors
//!
//! [`GuestRam`] is the in-process implementation backing VMs and tests.
//!
//! All multi-byte guest values are big-endian; the typed helpers on
//! [`GuestMemory`] take care of the conversion.

#![forbid(unsafe_code)]

mod guest_ram;

pub use guest_ram::{GuestRam, GuestRamOptions, MemorySlot};

use std::sync::Arc;

use thiserror::Error;

pub const PAGE_SHIFT: u32 = 12;
pub const PAGE_SIZE: u64 = 1 << PAGE_SHIFT;

#[inline]
pub const fn gpa_to_gfn(gpa: u64) -> u64 {
    gpa >> PAGE_SHIFT
}

#[inline]
pub const fn gfn_to_gpa(gfn: u64) -> u64 {
    gfn << PAGE_SHIFT
}

#[inline]
pub const fn offset_in_page(addr: u64) -> u64 {
    addr & (PAGE_SIZE - 1)
}

pub type Result<T> = std::result::Result<T, MemoryError>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MemoryError {
    #[error("guest frame {gfn:#x} is not backed by a memory slot")]
    UnmappedGuestFrame { gfn: u64 },

    #[error("host range {hva:#x}+{len:#x} is not backed by a memory slot")]
    UnmappedHostAddress { hva: u64, len: usize },

    #[error("memory slot containing {gpa:#x} is read-only")]
    ReadOnly { gpa: u64 },

    #[error("invalid memory slot: {0}")]
    InvalidSlot(&'static str),

    #[error("memory slot {base:#x}+{size:#x} overlaps an existing slot")]
    SlotOverlap { base: u64, size: u64 },

    #[error("compare-exchange operand lengths differ ({expected} vs {new})")]
    OperandMismatch { expected: usize, new: usize },
}

/// Result of a memory-slot lookup for one guest frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostPage {
    /// Host virtual address of the first byte of the frame.
    pub hva: u64,
    pub writable: bool,
}

/// A 7-bit s390 storage key: access-control nibble, fetch-protection,
/// reference and change bits.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StorageKey(u8);

impl StorageKey {
    pub const ACC_MASK: u8 = 0xf0;
    pub const FETCH_PROTECTION: u8 = 0x08;
    pub const REFERENCE: u8 = 0x04;
    pub const CHANGE: u8 = 0x02;

    pub const fn from_raw(raw: u8) -> Self {
        Self(raw & 0xfe)
    }

    pub const fn new(access_control: u8, fetch_protected: bool) -> Self {
        let fp = if fetch_protected {
            Self::FETCH_PROTECTION
        } else {
            0
        };
        Self(((access_control & 0xf) << 4) | fp)
    }

    pub const fn raw(self) -> u8 {
        self.0
    }

    pub const fn access_control(self) -> u8 {
        (self.0 & Self::ACC_MASK) >> 4
    }

    pub const fn fetch_protected(self) -> bool {
        self.0 & Self::FETCH_PROTECTION != 0
    }

    pub const fn referenced(self) -> bool {
        self.0 & Self::REFERENCE != 0
    }

    pub const fn changed(self) -> bool {
        self.0 & Self::CHANGE != 0
    }
}

/// The hypervisor memory service consumed by the translation core.
///
/// Host-address based methods never cross a frame boundary when called by the
/// core; implementations may reject such requests.
pub trait GuestMemory: Send + Sync {
    /// Memory-slot lookup. `None` means the frame is outside configured memory.
    fn gfn_to_hva(&self, gfn: u64) -> Option<HostPage>;

    fn read_hva(&self, hva: u64, dst: &mut [u8]) -> Result<()>;

    fn write_hva(&self, hva: u64, src: &[u8]) -> Result<()>;

    /// Atomically replace the bytes at `hva` with `new` if they equal
    /// `expected`. The bytes observed before the exchange are stored in
    /// `observed`. Returns whether the exchange happened.
    fn cmpxchg_hva(&self, hva: u64, expected: &[u8], new: &[u8], observed: &mut [u8])
        -> Result<bool>;

    fn storage_key(&self, hva: u64) -> Result<StorageKey>;

    fn set_storage_key(&self, hva: u64, key: StorageKey) -> Result<()>;

    fn mark_page_dirty(&self, gfn: u64);

    #[inline]
    fn is_error_gpa(&self, gpa: u64) -> bool {
        self.gfn_to_hva(gpa_to_gfn(gpa)).is_none()
    }

    /// Read absolute storage, splitting at frame boundaries.
    fn read_abs(&self, gpa: u64, dst: &mut [u8]) -> Result<()> {
        let mut gpa = gpa;
        let mut done = 0;
        while done < dst.len() {
            let chunk = ((PAGE_SIZE - offset_in_page(gpa)) as usize).min(dst.len() - done);
            let gfn = gpa_to_gfn(gpa);
            let page = self
                .gfn_to_hva(gfn)
                .ok_or(MemoryError::UnmappedGuestFrame { gfn })?;
            self.read_hva(page.hva + offset_in_page(gpa), &mut dst[done..done + chunk])?;
            done += chunk;
            gpa = gpa.wrapping_add(chunk as u64);
        }
        Ok(())
    }

    /// Write absolute storage, splitting at frame boundaries and marking every
    /// touched frame dirty.
    fn write_abs(&self, gpa: u64, src: &[u8]) -> Result<()> {
        let mut gpa = gpa;
        let mut done = 0;
        while done < src.len() {
            let chunk = ((PAGE_SIZE - offset_in_page(gpa)) as usize).min(src.len() - done);
            let gfn = gpa_to_gfn(gpa);
            let page = self
                .gfn_to_hva(gfn)
                .ok_or(MemoryError::UnmappedGuestFrame { gfn })?;
            if !page.writable {
                return Err(MemoryError::ReadOnly { gpa });
            }
            self.write_hva(page.hva + offset_in_page(gpa), &src[done..done + chunk])?;
            self.mark_page_dirty(gfn);
            done += chunk;
            gpa = gpa.wrapping_add(chunk as u64);
        }
        Ok(())
    }

    fn read_u8(&self, gpa: u64) -> Result<u8> {
        let mut buf = [0u8; 1];
        self.read_abs(gpa, &mut buf)?;
        Ok(buf[0])
    }

    fn read_u32(&self, gpa: u64) -> Result<u32> {
        let mut buf = [0u8; 4];
        self.read_abs(gpa, &mut buf)?;
        Ok(u32::from_be_bytes(buf))
    }

    fn read_u64(&self, gpa: u64) -> Result<u64> {
        let mut buf = [0u8; 8];
        self.read_abs(gpa, &mut buf)?;
        Ok(u64::from_be_bytes(buf))
    }

    fn write_u32(&self, gpa: u64, value: u32) -> Result<()> {
        self.write_abs(gpa, &value.to_be_bytes())
    }

    fn write_u64(&self, gpa: u64, value: u64) -> Result<()> {
        self.write_abs(gpa, &value.to_be_bytes())
    }

    /// Storage key of the frame containing `gpa`.
    fn storage_key_gpa(&self, gpa: u64) -> Result<StorageKey> {
        let gfn = gpa_to_gfn(gpa);
        let page = self
            .gfn_to_hva(gfn)
            .ok_or(MemoryError::UnmappedGuestFrame { gfn })?;
        self.storage_key(page.hva)
    }

    fn set_storage_key_gpa(&self, gpa: u64, key: StorageKey) -> Result<()> {
        let gfn = gpa_to_gfn(gpa);
        let page = self
            .gfn_to_hva(gfn)
            .ok_or(MemoryError::UnmappedGuestFrame { gfn })?;
        self.set_storage_key(page.hva, key)
    }
}

impl<T: GuestMemory + ?Sized> GuestMemory for Arc<T> {
    #[inline]
    fn gfn_to_hva(&self, gfn: u64) -> Option<HostPage> {
        <T as GuestMemory>::gfn_to_hva(self, gfn)
    }

    #[inline]
    fn read_hva(&self, hva: u64, dst: &mut [u8]) -> Result<()> {
        <T as GuestMemory>::read_hva(self, hva, dst)
    }

    #[inline]
    fn write_hva(&self, hva: u64, src: &[u8]) -> Result<()> {
        <T as GuestMemory>::write_hva(self, hva, src)
    }

    #[inline]
    fn cmpxchg_hva(
        &self,
        hva: u64,
        expected: &[u8],
        new: &[u8],
        observed: &mut [u8],
    ) -> Result<bool> {
        <T as GuestMemory>::cmpxchg_hva(self, hva, expected, new, observed)
    }

    #[inline]
    fn storage_key(&self, hva: u64) -> Result<StorageKey> {
        <T as GuestMemory>::storage_key(self, hva)
    }

    #[inline]
    fn set_storage_key(&self, hva: u64, key: StorageKey) -> Result<()> {
        <T as GuestMemory>::set_storage_key(self, hva, key)
    }

    #[inline]
    fn mark_page_dirty(&self, gfn: u64) {
        <T as GuestMemory>::mark_page_dirty(self, gfn)
    }
}
