//! Spill-slot storage
//!
//! Direct GPR slots live in a contiguous word array reachable through
//! segment-relative addressing. Slot 0 belongs to the flags engine;
//! slots `1..=num_direct` back direct GPR spills; requests beyond
//! those fall through to the host framework's own slots, which are
//! not preserved across application instructions. Vector registers
//! spill into a separately allocated 64-byte-aligned block reached
//! through a pointer parked in one reserved direct word (the hidden
//! slot), because thread-local storage cannot be read directly into a
//! vector register.

use log::{debug, trace};
use regmed_common::{Result, Status};
use regmed_isa::Reg;

/// Logical slot number reserved for the flags engine.
pub const AFLAGS_SLOT: usize = 0;
/// Host-framework slots exposed to us.
pub const HOST_SLOT_COUNT: usize = 3;
/// The last host slot has unclear ownership; never hand it out.
pub const HOST_SLOTS_USABLE: usize = HOST_SLOT_COUNT - 1;
/// Byte offset where the host framework's slots start.
pub const HOST_TLS_BASE: u32 = 0x800;
/// Byte offset where the host framework keeps the app value of the
/// register it stole for its own use.
pub const STOLEN_TLS_OFFSET: u32 = 0xf00;
/// Bytes per SIMD slot in the indirect block.
pub const SIMD_SLOT_BYTES: usize = 64;

const WORD: u32 = 8;

/// One 64-byte-aligned vector slot.
#[derive(Clone, Copy)]
#[repr(align(64))]
struct SimdSlot([u8; SIMD_SLOT_BYTES]);

/// Where a thread-local byte offset points.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotLoc {
    /// A direct slot, by logical slot number (0 is the flags slot).
    Direct(usize),
    /// The hidden word holding the SIMD block pointer.
    Hidden,
    /// A host-framework slot, by logical slot number.
    Host(usize),
}

/// Per-thread spill memory and slot ownership.
pub struct SlotStore {
    num_direct: usize,
    num_simd: usize,
    /// Flags word, direct GPR words, then the hidden pointer word.
    direct: Vec<u64>,
    host: [u64; HOST_SLOT_COUNT],
    simd: Vec<SimdSlot>,
    slot_use: Vec<Option<Reg>>,
    simd_slot_use: Vec<Option<Reg>>,
    /// App value of the register the host framework stole, if any.
    stolen_value: u64,
    max_used: usize,
}

impl SlotStore {
    pub fn new(num_gpr_slots: u32, num_simd_slots: u32) -> Self {
        let num_direct = num_gpr_slots as usize;
        let num_simd = num_simd_slots as usize;
        debug!(
            "slot store: {num_direct} direct GPR slots, {HOST_SLOTS_USABLE} host slots, \
             {num_simd} SIMD slots"
        );
        Self {
            num_direct,
            num_simd,
            direct: vec![0; num_direct + 2],
            host: [0; HOST_SLOT_COUNT],
            simd: vec![SimdSlot([0; SIMD_SLOT_BYTES]); num_simd],
            slot_use: vec![None; 1 + num_direct + HOST_SLOTS_USABLE],
            simd_slot_use: vec![None; num_simd],
            stolen_value: 0,
            max_used: 0,
        }
    }

    pub fn num_direct(&self) -> usize {
        self.num_direct
    }

    pub fn num_simd(&self) -> usize {
        self.num_simd
    }

    /// Total logical GPR slots, flags slot included.
    pub fn num_slots(&self) -> usize {
        self.slot_use.len()
    }

    /// High-water mark of simultaneously owned GPR slots.
    pub fn max_slots_used(&self) -> usize {
        self.max_used
    }

    /// Slots past the direct array are host-framework storage and are
    /// not preserved across application instructions.
    pub fn is_host_slot(&self, slot: usize) -> bool {
        slot > self.num_direct
    }

    /// Byte offset of a logical slot.
    pub fn slot_offset(&self, slot: usize) -> u32 {
        debug_assert!(slot < self.num_slots());
        if slot <= self.num_direct {
            slot as u32 * WORD
        } else {
            HOST_TLS_BASE + (slot - self.num_direct - 1) as u32 * WORD
        }
    }

    /// Byte offset of the hidden SIMD-block pointer word.
    pub fn hidden_offset(&self) -> u32 {
        (self.num_direct as u32 + 1) * WORD
    }

    /// Classify a thread-local byte offset emitted by this store.
    pub fn classify_offset(&self, offset: u32) -> Option<SlotLoc> {
        if offset == self.hidden_offset() {
            return Some(SlotLoc::Hidden);
        }
        if offset % WORD != 0 {
            return None;
        }
        if offset < self.hidden_offset() {
            return Some(SlotLoc::Direct((offset / WORD) as usize));
        }
        if offset >= HOST_TLS_BASE {
            let idx = ((offset - HOST_TLS_BASE) / WORD) as usize;
            if idx < HOST_SLOTS_USABLE {
                return Some(SlotLoc::Host(self.num_direct + 1 + idx));
            }
        }
        None
    }

    /// First free GPR slot, lowest number first.
    pub fn alloc_gpr_slot(&mut self, owner: Reg) -> Result<usize> {
        for slot in (AFLAGS_SLOT + 1)..self.num_slots() {
            if self.slot_use[slot].is_none() {
                self.slot_use[slot] = Some(owner);
                let used = self.slot_use.iter().filter(|s| s.is_some()).count();
                self.max_used = self.max_used.max(used);
                trace!("slot {slot} -> {owner}");
                return Ok(slot);
            }
        }
        Err(Status::OutOfSlots)
    }

    pub fn free_gpr_slot(&mut self, slot: usize) {
        debug_assert!(self.slot_use[slot].is_some(), "freeing unowned slot {slot}");
        trace!("slot {slot} freed");
        self.slot_use[slot] = None;
    }

    pub fn slot_owner(&self, slot: usize) -> Option<Reg> {
        self.slot_use[slot]
    }

    pub fn alloc_simd_slot(&mut self, owner: Reg) -> Result<usize> {
        for slot in 0..self.num_simd {
            if self.simd_slot_use[slot].is_none() {
                self.simd_slot_use[slot] = Some(owner);
                trace!("simd slot {slot} -> {owner}");
                return Ok(slot);
            }
        }
        Err(Status::OutOfSlots)
    }

    pub fn free_simd_slot(&mut self, slot: usize) {
        debug_assert!(self.simd_slot_use[slot].is_some());
        self.simd_slot_use[slot] = None;
    }

    pub fn simd_slot_owner(&self, slot: usize) -> Option<Reg> {
        self.simd_slot_use[slot]
    }

    pub fn all_slots_free(&self) -> bool {
        self.slot_use.iter().all(|s| s.is_none()) && self.simd_slot_use.iter().all(|s| s.is_none())
    }

    /// Read a word through its thread-local byte offset. This is the
    /// view generated code (and the fault walker) has of the store.
    pub fn tls_read(&self, offset: u32) -> u64 {
        if offset == STOLEN_TLS_OFFSET {
            return self.stolen_value;
        }
        match self.classify_offset(offset) {
            Some(SlotLoc::Direct(slot)) => self.direct[slot],
            Some(SlotLoc::Hidden) => self.direct[self.num_direct + 1],
            Some(SlotLoc::Host(slot)) => self.host[slot - self.num_direct - 1],
            None => 0,
        }
    }

    pub fn tls_write(&mut self, offset: u32, value: u64) {
        if offset == STOLEN_TLS_OFFSET {
            self.stolen_value = value;
            return;
        }
        match self.classify_offset(offset) {
            Some(SlotLoc::Direct(slot)) => self.direct[slot] = value,
            Some(SlotLoc::Hidden) => self.direct[self.num_direct + 1] = value,
            Some(SlotLoc::Host(slot)) => self.host[slot - self.num_direct - 1] = value,
            None => {}
        }
    }

    pub fn read_slot(&self, slot: usize) -> u64 {
        self.tls_read(self.slot_offset(slot))
    }

    pub fn write_slot(&mut self, slot: usize, value: u64) {
        self.tls_write(self.slot_offset(slot), value);
    }

    /// Base address generated code finds in the hidden slot. The
    /// store publishes it on creation; displacements off it select
    /// SIMD slots.
    pub fn simd_block_base(&self) -> u64 {
        self.direct[self.num_direct + 1]
    }

    pub fn publish_simd_block(&mut self, base: u64) {
        let hidden = self.num_direct + 1;
        self.direct[hidden] = base;
    }

    pub fn simd_read(&self, slot: usize) -> &[u8; SIMD_SLOT_BYTES] {
        &self.simd[slot].0
    }

    pub fn simd_write(&mut self, slot: usize, bytes: &[u8]) {
        self.simd[slot].0[..bytes.len()].copy_from_slice(bytes);
    }

    pub fn stolen_value(&self) -> u64 {
        self.stolen_value
    }

    pub fn set_stolen_value(&mut self, value: u64) {
        self.stolen_value = value;
    }

    /// Host slots are scratch for the host framework between app
    /// instructions; the host clobbering them is modeled by zeroing.
    pub fn clobber_host_slots(&mut self) {
        self.host = [0; HOST_SLOT_COUNT];
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_offsets_round_trip() {
        let store = SlotStore::new(4, 2);
        assert_eq!(store.classify_offset(store.slot_offset(0)), Some(SlotLoc::Direct(0)));
        assert_eq!(store.classify_offset(store.slot_offset(4)), Some(SlotLoc::Direct(4)));
        assert_eq!(store.classify_offset(store.hidden_offset()), Some(SlotLoc::Hidden));
        let host_slot = 5; // first slot past the direct array
        assert!(store.is_host_slot(host_slot));
        assert_eq!(
            store.classify_offset(store.slot_offset(host_slot)),
            Some(SlotLoc::Host(host_slot))
        );
    }

    #[test]
    fn test_alloc_is_first_free() {
        let mut store = SlotStore::new(2, 0);
        let a = store.alloc_gpr_slot(Reg::Rbx).unwrap();
        let b = store.alloc_gpr_slot(Reg::Rcx).unwrap();
        assert_eq!((a, b), (1, 2));
        store.free_gpr_slot(a);
        let c = store.alloc_gpr_slot(Reg::Rdx).unwrap();
        assert_eq!(c, 1);
    }

    #[test]
    fn test_overflow_into_host_slots_then_exhaustion() {
        let mut store = SlotStore::new(1, 0);
        let a = store.alloc_gpr_slot(Reg::Rbx).unwrap();
        let b = store.alloc_gpr_slot(Reg::Rcx).unwrap();
        let c = store.alloc_gpr_slot(Reg::Rdx).unwrap();
        assert!(!store.is_host_slot(a));
        assert!(store.is_host_slot(b));
        assert!(store.is_host_slot(c));
        assert_eq!(store.alloc_gpr_slot(Reg::Rsi), Err(Status::OutOfSlots));
    }

    #[test]
    fn test_slot_zero_never_allocated() {
        let mut store = SlotStore::new(1, 0);
        for _ in 0..3 {
            let s = store.alloc_gpr_slot(Reg::Rbx).unwrap();
            assert_ne!(s, AFLAGS_SLOT);
        }
    }

    #[test]
    fn test_simd_block_alignment() {
        let store = SlotStore::new(1, 4);
        let base = store.simd.as_ptr() as usize;
        assert_eq!(base % 64, 0);
    }

    #[test]
    fn test_tls_view_matches_slot_view() {
        let mut store = SlotStore::new(2, 0);
        store.write_slot(1, 0xdead);
        assert_eq!(store.tls_read(store.slot_offset(1)), 0xdead);
        store.tls_write(store.slot_offset(2), 0xbeef);
        assert_eq!(store.read_slot(2), 0xbeef);
    }

    #[test]
    fn test_host_slots_volatile() {
        let mut store = SlotStore::new(0, 0);
        let s = store.alloc_gpr_slot(Reg::Rbx).unwrap();
        assert!(store.is_host_slot(s));
        store.write_slot(s, 7);
        store.clobber_host_slots();
        assert_eq!(store.read_slot(s), 0);
    }
}
