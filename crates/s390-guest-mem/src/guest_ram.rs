use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, RwLock, RwLockWriteGuard};

use crate::{
    gfn_to_gpa, gpa_to_gfn, offset_in_page, GuestMemory, HostPage, MemoryError, Result,
    StorageKey, PAGE_SIZE,
};

/// Layout of one memory slot as requested by the VM configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemorySlot {
    /// Guest absolute address of the first byte. Must be page aligned.
    pub guest_base: u64,
    /// Size in bytes. Must be a non-zero multiple of the page size.
    pub size: u64,
    pub readonly: bool,
}

impl MemorySlot {
    pub const fn new(guest_base: u64, size: u64) -> Self {
        Self {
            guest_base,
            size,
            readonly: false,
        }
    }

    pub const fn readonly(mut self) -> Self {
        self.readonly = true;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GuestRamOptions {
    /// First synthetic host virtual address handed out to a slot.
    pub host_base: u64,
    /// Backing storage is allocated in chunks of this many bytes on first
    /// write. Must be a non-zero multiple of the page size.
    pub chunk_size: u64,
}

impl Default for GuestRamOptions {
    fn default() -> Self {
        Self {
            host_base: 0x7f00_0000_0000,
            chunk_size: 64 * 1024,
        }
    }
}

type Chunk = Option<Box<[u8]>>;

struct Slot {
    base_gfn: u64,
    npages: u64,
    host_base: u64,
    readonly: bool,
    chunk_size: usize,
    /// Never-written chunks read as zeros.
    chunks: Vec<RwLock<Chunk>>,
    keys: Vec<AtomicU8>,
    dirty: Vec<AtomicBool>,
}

impl Slot {
    fn contains_gfn(&self, gfn: u64) -> bool {
        gfn >= self.base_gfn && gfn - self.base_gfn < self.npages
    }

    fn host_len(&self) -> u64 {
        self.npages * PAGE_SIZE
    }

    /// Byte offset into the slot for a host range, if the range is fully
    /// contained.
    fn host_offset(&self, hva: u64, len: usize) -> Option<usize> {
        let off = hva.checked_sub(self.host_base)?;
        let end = off.checked_add(len as u64)?;
        (end <= self.host_len()).then_some(off as usize)
    }

    /// Split `len` bytes at slot offset `off` into (chunk, offset in chunk,
    /// length) pieces.
    fn pieces(&self, off: usize, len: usize) -> impl Iterator<Item = (usize, usize, usize)> + '_ {
        let mut off = off;
        let end = off + len;
        std::iter::from_fn(move || {
            if off >= end {
                return None;
            }
            let start = off % self.chunk_size;
            let n = (self.chunk_size - start).min(end - off);
            let piece = (off / self.chunk_size, start, n);
            off += n;
            Some(piece)
        })
    }

    fn chunk_mut(&self, idx: usize) -> RwLockWriteGuard<'_, Chunk> {
        self.chunks[idx].write().unwrap_or_else(|e| e.into_inner())
    }

    fn read(&self, off: usize, dst: &mut [u8]) {
        let mut done = 0;
        for (idx, start, n) in self.pieces(off, dst.len()) {
            let chunk = self.chunks[idx].read().unwrap_or_else(|e| e.into_inner());
            let dst = &mut dst[done..done + n];
            match chunk.as_deref() {
                Some(bytes) => dst.copy_from_slice(&bytes[start..start + n]),
                None => dst.fill(0),
            }
            done += n;
        }
    }

    fn write(&self, off: usize, src: &[u8]) {
        let mut done = 0;
        for (idx, start, n) in self.pieces(off, src.len()) {
            let mut chunk = self.chunk_mut(idx);
            let bytes = chunk.get_or_insert_with(|| vec![0; self.chunk_size].into_boxed_slice());
            bytes[start..start + n].copy_from_slice(&src[done..done + n]);
            done += n;
        }
    }

    fn allocated_chunks(&self) -> usize {
        self.chunks
            .iter()
            .filter(|c| c.read().unwrap_or_else(|e| e.into_inner()).is_some())
            .count()
    }
}

/// Slot-based guest absolute storage.
///
/// Slots are looked up under a reader lock on the slot table. Slot contents
/// are sparse: each chunk is allocated on its first write, so a large guest
/// costs host memory only for what it touches. Byte accesses take per-chunk
/// locks; [`GuestMemory::cmpxchg_hva`] holds every chunk it covers, which
/// makes it atomic with respect to every other accessor of this instance.
pub struct GuestRam {
    opts: GuestRamOptions,
    slots: RwLock<Vec<Arc<Slot>>>,
}

impl Default for GuestRam {
    fn default() -> Self {
        Self::with_options(GuestRamOptions::default())
    }
}

impl GuestRam {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_options(opts: GuestRamOptions) -> Self {
        Self {
            opts,
            slots: RwLock::new(Vec::new()),
        }
    }

    /// Convenience constructor for a single writable slot at absolute 0.
    pub fn with_size(size: u64) -> Result<Self> {
        let ram = Self::new();
        ram.add_slot(MemorySlot::new(0, size))?;
        Ok(ram)
    }

    pub fn add_slot(&self, slot: MemorySlot) -> Result<()> {
        if slot.size == 0 || offset_in_page(slot.size) != 0 {
            return Err(MemoryError::InvalidSlot(
                "size must be a non-zero multiple of the page size",
            ));
        }
        if offset_in_page(slot.guest_base) != 0 {
            return Err(MemoryError::InvalidSlot("guest base must be page aligned"));
        }
        let chunk_size = self.opts.chunk_size;
        if chunk_size == 0 || offset_in_page(chunk_size) != 0 {
            return Err(MemoryError::InvalidSlot(
                "chunk size must be a non-zero multiple of the page size",
            ));
        }
        let Some(end) = slot.guest_base.checked_add(slot.size) else {
            return Err(MemoryError::InvalidSlot("slot wraps the address space"));
        };

        let mut slots = self.slots.write().unwrap_or_else(|e| e.into_inner());
        let base_gfn = gpa_to_gfn(slot.guest_base);
        let npages = slot.size / PAGE_SIZE;
        for existing in slots.iter() {
            let existing_start = gfn_to_gpa(existing.base_gfn);
            let existing_end = existing_start + existing.host_len();
            if slot.guest_base < existing_end && existing_start < end {
                return Err(MemoryError::SlotOverlap {
                    base: slot.guest_base,
                    size: slot.size,
                });
            }
        }

        // Leave an unmapped guard page between host ranges so off-by-one host
        // accesses fail instead of silently landing in a neighbouring slot.
        let host_base = slots
            .iter()
            .map(|s| s.host_base + s.host_len() + PAGE_SIZE)
            .max()
            .unwrap_or(self.opts.host_base);

        tracing::debug!(
            guest_base = slot.guest_base,
            size = slot.size,
            host_base,
            readonly = slot.readonly,
            "adding memory slot"
        );

        slots.push(Arc::new(Slot {
            base_gfn,
            npages,
            host_base,
            readonly: slot.readonly,
            chunk_size: chunk_size as usize,
            chunks: (0..slot.size.div_ceil(chunk_size))
                .map(|_| RwLock::new(None))
                .collect(),
            keys: (0..npages).map(|_| AtomicU8::new(0)).collect(),
            dirty: (0..npages).map(|_| AtomicBool::new(false)).collect(),
        }));
        Ok(())
    }

    /// Whether the frame containing `gpa` was written since the last
    /// [`GuestRam::take_dirty_log`].
    pub fn is_dirty(&self, gpa: u64) -> bool {
        let gfn = gpa_to_gfn(gpa);
        self.slot_for_gfn(gfn)
            .map(|slot| slot.dirty[(gfn - slot.base_gfn) as usize].load(Ordering::Acquire))
            .unwrap_or(false)
    }

    /// Collect and clear the dirty frames of every slot, in ascending order.
    pub fn take_dirty_log(&self) -> Vec<u64> {
        let slots = self.slots.read().unwrap_or_else(|e| e.into_inner());
        let mut gfns = Vec::new();
        for slot in slots.iter() {
            for (i, bit) in slot.dirty.iter().enumerate() {
                if bit.swap(false, Ordering::AcqRel) {
                    gfns.push(slot.base_gfn + i as u64);
                }
            }
        }
        gfns.sort_unstable();
        gfns
    }

    /// Number of backing chunks allocated so far, over all slots.
    pub fn allocated_chunks(&self) -> usize {
        let slots = self.slots.read().unwrap_or_else(|e| e.into_inner());
        slots.iter().map(|slot| slot.allocated_chunks()).sum()
    }

    fn slot_for_gfn(&self, gfn: u64) -> Option<Arc<Slot>> {
        let slots = self.slots.read().unwrap_or_else(|e| e.into_inner());
        slots.iter().find(|s| s.contains_gfn(gfn)).cloned()
    }

    fn slot_for_hva(&self, hva: u64, len: usize) -> Result<(Arc<Slot>, usize)> {
        let slots = self.slots.read().unwrap_or_else(|e| e.into_inner());
        slots
            .iter()
            .find_map(|s| s.host_offset(hva, len).map(|off| (s.clone(), off)))
            .ok_or(MemoryError::UnmappedHostAddress { hva, len })
    }

    fn touch_key(slot: &Slot, off: usize, bits: u8) {
        let page = off / PAGE_SIZE as usize;
        slot.keys[page].fetch_or(bits, Ordering::AcqRel);
    }
}

impl GuestMemory for GuestRam {
    fn gfn_to_hva(&self, gfn: u64) -> Option<HostPage> {
        self.slot_for_gfn(gfn).map(|slot| HostPage {
            hva: slot.host_base + (gfn - slot.base_gfn) * PAGE_SIZE,
            writable: !slot.readonly,
        })
    }

    fn read_hva(&self, hva: u64, dst: &mut [u8]) -> Result<()> {
        let (slot, off) = self.slot_for_hva(hva, dst.len())?;
        slot.read(off, dst);
        if !dst.is_empty() {
            Self::touch_key(&slot, off, StorageKey::REFERENCE);
        }
        Ok(())
    }

    fn write_hva(&self, hva: u64, src: &[u8]) -> Result<()> {
        let (slot, off) = self.slot_for_hva(hva, src.len())?;
        if slot.readonly {
            let gpa = gfn_to_gpa(slot.base_gfn) + off as u64;
            return Err(MemoryError::ReadOnly { gpa });
        }
        slot.write(off, src);
        if !src.is_empty() {
            Self::touch_key(&slot, off, StorageKey::REFERENCE | StorageKey::CHANGE);
        }
        Ok(())
    }

    fn cmpxchg_hva(
        &self,
        hva: u64,
        expected: &[u8],
        new: &[u8],
        observed: &mut [u8],
    ) -> Result<bool> {
        if expected.len() != new.len() || observed.len() != new.len() {
            return Err(MemoryError::OperandMismatch {
                expected: expected.len(),
                new: new.len(),
            });
        }
        let (slot, off) = self.slot_for_hva(hva, new.len())?;
        if slot.readonly {
            let gpa = gfn_to_gpa(slot.base_gfn) + off as u64;
            return Err(MemoryError::ReadOnly { gpa });
        }
        // Chunks are locked in ascending order, like every other multi-chunk
        // holder would have to.
        let pieces: Vec<_> = slot.pieces(off, new.len()).collect();
        let mut guards: Vec<_> = pieces.iter().map(|&(idx, _, _)| slot.chunk_mut(idx)).collect();

        let mut done = 0;
        for (&(_, start, n), chunk) in pieces.iter().zip(guards.iter()) {
            let dst = &mut observed[done..done + n];
            match chunk.as_deref() {
                Some(bytes) => dst.copy_from_slice(&bytes[start..start + n]),
                None => dst.fill(0),
            }
            done += n;
        }
        if observed[..] != expected[..] {
            Self::touch_key(&slot, off, StorageKey::REFERENCE);
            return Ok(false);
        }

        let mut done = 0;
        for (&(_, start, n), chunk) in pieces.iter().zip(guards.iter_mut()) {
            let bytes = chunk.get_or_insert_with(|| vec![0; slot.chunk_size].into_boxed_slice());
            bytes[start..start + n].copy_from_slice(&new[done..done + n]);
            done += n;
        }
        Self::touch_key(&slot, off, StorageKey::REFERENCE | StorageKey::CHANGE);
        Ok(true)
    }

    fn storage_key(&self, hva: u64) -> Result<StorageKey> {
        let (slot, off) = self.slot_for_hva(hva, 1)?;
        let page = off / PAGE_SIZE as usize;
        Ok(StorageKey::from_raw(slot.keys[page].load(Ordering::Acquire)))
    }

    fn set_storage_key(&self, hva: u64, key: StorageKey) -> Result<()> {
        let (slot, off) = self.slot_for_hva(hva, 1)?;
        let page = off / PAGE_SIZE as usize;
        slot.keys[page].store(key.raw(), Ordering::Release);
        Ok(())
    }

    fn mark_page_dirty(&self, gfn: u64) {
        if let Some(slot) = self.slot_for_gfn(gfn) {
            slot.dirty[(gfn - slot.base_gfn) as usize].store(true, Ordering::Release);
        }
    }
}
