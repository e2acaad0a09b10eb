//! Range resolution: split a logical range into page fragments and translate
//! each one.

use s390_guest_mem::{offset_in_page, GuestMemory, PAGE_SHIFT, PAGE_SIZE};

use crate::addr::is_low_address;
use crate::asce::Asce;
use crate::error::Result;
use crate::exception::{trans_exc, Fault, PgmCode, ProtType};
use crate::vcpu::Vcpu;
use crate::walk::guest_translate;
use crate::AccessMode;

/// Number of pages touched by `len` bytes at `ga`.
#[inline]
pub const fn nr_pages(ga: u64, len: u64) -> u64 {
    if len == 0 {
        0
    } else {
        ((offset_in_page(ga) + len - 1) >> PAGE_SHIFT) + 1
    }
}

/// Iterator over the page-bounded pieces of a logical range, as
/// `(logical address, length)` pairs in ascending order.
///
/// Only the first piece may start inside a page.
#[derive(Debug, Clone)]
pub struct Fragments {
    ga: u64,
    remaining: u64,
}

impl Fragments {
    pub const fn new(ga: u64, len: u64) -> Self {
        Self { ga, remaining: len }
    }
}

impl Iterator for Fragments {
    type Item = (u64, u64);

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        let len = (PAGE_SIZE - offset_in_page(self.ga)).min(self.remaining);
        let item = (self.ga, len);
        self.ga = self.ga.wrapping_add(len);
        self.remaining -= len;
        Some(item)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let n = nr_pages(self.ga, self.remaining) as usize;
        (n, Some(n))
    }
}

impl ExactSizeIterator for Fragments {}

impl<M: GuestMemory> Vcpu<M> {
    /// Translate and key-check every fragment of `len` bytes at logical `ga`.
    ///
    /// Fragments are processed in ascending order; the absolute address of
    /// each is appended to `gpas` when given. The first failing fragment
    /// stops the walk and its exception is reported against that fragment's
    /// effective address.
    #[allow(clippy::too_many_arguments)]
    pub fn guest_range_to_gpas(
        &self,
        ga: u64,
        ar: u8,
        mut gpas: Option<&mut Vec<u64>>,
        len: u64,
        asce: Asce,
        mode: AccessMode,
        access_key: u8,
    ) -> Result<()> {
        let lap_enabled = self.low_address_protection_enabled(asce);
        let dat = self.psw().dat();
        let features = self.dat_features();

        for (logical, fragment_len) in Fragments::new(ga, len) {
            let ga = self.logical_to_effective(logical);
            let site = self.fault_site(ga, ar, mode);

            if mode == AccessMode::Store && lap_enabled && is_low_address(ga) {
                return Err(trans_exc(Fault::protection(ProtType::LowAddress), site));
            }

            let gpa = if dat {
                guest_translate(self.mem(), self.state.prefix, features, ga, asce, mode)
                    .map_err(|fault| trans_exc(fault, site))?
            } else {
                self.real_to_abs(ga)
            };
            if self.mem().is_error_gpa(gpa) {
                return Err(trans_exc(Fault::program(PgmCode::Addressing), site));
            }

            self.check_access_key(access_key, mode, asce, gpa, ga, fragment_len)
                .map_err(|fault| match fault {
                    Fault::Program { code, .. } => trans_exc(
                        Fault::Program {
                            code,
                            prot: Some(ProtType::KeyControlled),
                        },
                        site,
                    ),
                    host => trans_exc(host, site),
                })?;

            if let Some(gpas) = gpas.as_deref_mut() {
                gpas.push(gpa);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fragments_split_at_page_boundaries() {
        let frags: Vec<_> = Fragments::new(4090, 10).collect();
        assert_eq!(frags, vec![(4090, 6), (4096, 4)]);
        assert_eq!(nr_pages(4090, 10), 2);

        let frags: Vec<_> = Fragments::new(0x2000, 0x2000).collect();
        assert_eq!(frags, vec![(0x2000, 0x1000), (0x3000, 0x1000)]);

        assert_eq!(Fragments::new(0x123, 0).count(), 0);
        assert_eq!(nr_pages(0x123, 0), 0);
    }

    #[test]
    fn size_hint_matches_count() {
        let frags = Fragments::new(0xff8, 0x3010);
        assert_eq!(frags.len(), 5);
        assert_eq!(frags.count(), 5);
    }
}
