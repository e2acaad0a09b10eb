//! IPTE interlock.
//!
//! Guest translations that walk DAT tables in guest memory must not race
//! with the guest purging those tables. Both sides go through a shared
//! control word:
//!
//! ```text
//!  63  62                     32 31                       0
//! | K |    KH (hold count)     |   KG (purge in progress)  |
//! ```
//!
//! Without IPTE interpretation only the hypervisor takes the lock, so a
//! mutex-protected count makes nested holds cheap and K alone is the
//! interlock. With interpretation the machine itself may purge, so every
//! holder increments KH and translations back off while KG is set.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::Duration;

use tracing::{trace, warn};

const K: u64 = 1 << 63;
const KH_SHIFT: u32 = 32;
const KH_MASK: u64 = 0x7fff_ffff << KH_SHIFT;
const KG_MASK: u64 = 0xffff_ffff;

const WAIT_SLICE: Duration = Duration::from_millis(1);

/// Decoded IPTE control word.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct IpteControl(pub u64);

impl IpteControl {
    #[inline]
    pub const fn k(self) -> bool {
        self.0 & K != 0
    }

    #[inline]
    pub const fn kh(self) -> u32 {
        ((self.0 & KH_MASK) >> KH_SHIFT) as u32
    }

    #[inline]
    pub const fn kg(self) -> u32 {
        (self.0 & KG_MASK) as u32
    }

    const fn with_k(self, k: bool) -> Self {
        if k {
            Self(self.0 | K)
        } else {
            Self(self.0 & !K)
        }
    }

    const fn with_kh(self, kh: u32) -> Self {
        Self((self.0 & !KH_MASK) | (((kh as u64) << KH_SHIFT) & KH_MASK))
    }

    const fn with_kg(self, kg: u32) -> Self {
        Self((self.0 & !KG_MASK) | kg as u64)
    }
}

/// The VM-wide IPTE lock.
pub trait IpteLock: Send + Sync + fmt::Debug {
    /// Acquire for a translation. Spins while a purge holds the interlock.
    fn lock(&self);

    fn unlock(&self);

    fn is_held(&self) -> bool;

    /// Acquire for a table purge. Spins while any translation holds the lock.
    fn begin_purge(&self);

    fn end_purge(&self);

    /// Block until no translation holds the lock.
    fn wait_released(&self);

    /// Current control word.
    fn control(&self) -> IpteControl;
}

/// Pick the implementation matching the machine's IPTE handling.
pub fn new_lock(ipte_interpretation: bool) -> Box<dyn IpteLock> {
    if ipte_interpretation {
        Box::new(SharedIpteLock::default())
    } else {
        Box::new(ExclusiveIpteLock::default())
    }
}

/// Control word plus a wait queue for waiters on release.
#[derive(Debug, Default)]
struct ControlWord {
    word: AtomicU64,
    wq_lock: Mutex<()>,
    wq: Condvar,
}

impl ControlWord {
    fn load(&self) -> IpteControl {
        IpteControl(self.word.load(Ordering::Acquire))
    }

    /// Apply `update` with compare-and-swap until it sticks. `update`
    /// returning `None` means the caller must back off and retry later.
    fn update(&self, mut update: impl FnMut(IpteControl) -> Option<IpteControl>) -> IpteControl {
        loop {
            let old = self.load();
            match update(old) {
                Some(new) => {
                    if self
                        .word
                        .compare_exchange_weak(old.0, new.0, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                    {
                        return new;
                    }
                }
                None => std::thread::yield_now(),
            }
        }
    }

    fn wake(&self) {
        let _wq = self.wq_lock.lock().unwrap_or_else(|e| e.into_inner());
        self.wq.notify_all();
    }

    fn wait_until(&self, mut done: impl FnMut(IpteControl) -> bool) {
        let mut wq = self.wq_lock.lock().unwrap_or_else(|e| e.into_inner());
        while !done(self.load()) {
            // Changes made by the machine itself are never notified.
            wq = match self.wq.wait_timeout(wq, WAIT_SLICE) {
                Ok((guard, _)) => guard,
                Err(e) => e.into_inner().0,
            };
        }
    }
}

/// IPTE lock without IPTE interpretation.
///
/// Holders are counted under a mutex; the first holder sets K, the last one
/// clears it.
#[derive(Debug, Default)]
pub struct ExclusiveIpteLock {
    ctl: ControlWord,
    count: Mutex<u64>,
}

impl IpteLock for ExclusiveIpteLock {
    fn lock(&self) {
        let mut count = self.count.lock().unwrap_or_else(|e| e.into_inner());
        *count += 1;
        if *count > 1 {
            return;
        }
        self.ctl
            .update(|old| (!old.k()).then_some(old.with_k(true)));
        trace!("ipte lock taken");
    }

    fn unlock(&self) {
        {
            let mut count = self.count.lock().unwrap_or_else(|e| e.into_inner());
            if *count == 0 {
                warn!("ipte unlock without a holder");
                return;
            }
            *count -= 1;
            if *count > 0 {
                return;
            }
            self.ctl.update(|old| Some(old.with_k(false)));
        }
        trace!("ipte lock released");
        // The count lock must be dropped here: waiters check it while
        // holding the queue lock.
        self.ctl.wake();
    }

    fn is_held(&self) -> bool {
        *self.count.lock().unwrap_or_else(|e| e.into_inner()) != 0
    }

    fn begin_purge(&self) {
        self.ctl
            .update(|old| (!old.k()).then_some(old.with_k(true)));
    }

    fn end_purge(&self) {
        self.ctl.update(|old| Some(old.with_k(false)));
        self.ctl.wake();
    }

    fn wait_released(&self) {
        self.ctl.wait_until(|_| !self.is_held());
    }

    fn control(&self) -> IpteControl {
        self.ctl.load()
    }
}

/// IPTE lock with IPTE interpretation: any number of holders, counted in KH.
#[derive(Debug, Default)]
pub struct SharedIpteLock {
    ctl: ControlWord,
}

impl IpteLock for SharedIpteLock {
    fn lock(&self) {
        let new = self.ctl.update(|old| {
            (old.kg() == 0).then(|| old.with_k(true).with_kh(old.kh() + 1))
        });
        trace!(kh = new.kh(), "ipte lock taken");
    }

    fn unlock(&self) {
        let released = self
            .ctl
            .word
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |word| {
                let old = IpteControl(word);
                let kh = old.kh().checked_sub(1)?;
                Some(old.with_kh(kh).with_k(kh != 0).0)
            });
        // With no holder, K belongs to a purge if it is set at all.
        let Ok(old) = released else {
            warn!("ipte unlock without a holder");
            return;
        };
        let kh = IpteControl(old).kh() - 1;
        trace!(kh, "ipte lock released");
        if kh == 0 {
            self.ctl.wake();
        }
    }

    fn is_held(&self) -> bool {
        self.ctl.load().kh() != 0
    }

    fn begin_purge(&self) {
        self.ctl.update(|old| {
            (old.kh() == 0 && old.kg() == 0).then(|| old.with_k(true).with_kg(1))
        });
    }

    fn end_purge(&self) {
        self.ctl.update(|old| Some(old.with_kg(0).with_k(false)));
        self.ctl.wake();
    }

    fn wait_released(&self) {
        self.ctl.wait_until(|ctl| ctl.kh() == 0);
    }

    fn control(&self) -> IpteControl {
        self.ctl.load()
    }
}

/// Holds the IPTE lock for a translation; released on drop.
#[must_use = "the IPTE lock is released when the guard is dropped"]
pub struct IpteGuard<'a> {
    lock: &'a dyn IpteLock,
}

impl<'a> IpteGuard<'a> {
    pub(crate) fn new(lock: &'a dyn IpteLock) -> Self {
        lock.lock();
        Self { lock }
    }
}

impl Drop for IpteGuard<'_> {
    fn drop(&mut self) {
        self.lock.unlock();
    }
}

/// Holds the purge side of the interlock; released on drop.
#[must_use = "the purge ends when the guard is dropped"]
pub struct PurgeGuard<'a> {
    lock: &'a dyn IpteLock,
}

impl<'a> PurgeGuard<'a> {
    pub(crate) fn new(lock: &'a dyn IpteLock) -> Self {
        lock.begin_purge();
        Self { lock }
    }
}

impl Drop for PurgeGuard<'_> {
    fn drop(&mut self) {
        self.lock.end_purge();
    }
}
