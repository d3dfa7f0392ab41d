//! Pool of refcounted handle slots for one native call.
//!
//! Native code binds local variables to slots instead of raw handles. Several
//! bindings may share one slot; the slot counts them, and when the count drops
//! to zero the slot gives back what it acquired on the handle's behalf: string
//! views and its reference on the array record. The handle itself is deleted
//! lazily, when the slot is reused.

use std::ffi::CStr;

use crate::{
    arrays::{ArrayCache, RecordId},
    host::{Handle, Host, RawChars},
    utils::error::{ErrorKind, NativeError},
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SlotIdx(usize);

impl SlotIdx {
    pub fn index(self) -> usize {
        self.0
    }
}

#[derive(Debug, Default)]
pub struct Slot {
    handle: Option<Handle>,
    refcount: u32,
    array: Option<RecordId>,
    length: Option<i32>,
    utf16: Option<RawChars<u16>>,
    utf8: Option<RawChars<u8>>,
}

impl Slot {
    pub fn handle(&self) -> Option<Handle> {
        self.handle
    }
    pub fn refcount(&self) -> u32 {
        self.refcount
    }
    pub fn array(&self) -> Option<RecordId> {
        self.array
    }
    pub fn length(&self) -> Option<i32> {
        self.length
    }
    fn has_resources(&self) -> bool {
        self.array.is_some() || self.utf16.is_some() || self.utf8.is_some()
    }

    fn release_resources<H: Host>(&mut self, host: &mut H, cache: &mut ArrayCache) {
        if let Some(handle) = self.handle {
            if let Some(chars) = self.utf16.take() {
                host.release_string_utf16(handle, chars.ptr);
            }
            if let Some(chars) = self.utf8.take() {
                host.release_string_utf8(handle, chars.ptr);
            }
        }
        if let Some(id) = self.array.take() {
            let shared_handle = cache.record(id).map(|r| r.handle());
            let gone = cache.release(host, id);
            if !gone && shared_handle == self.handle {
                // the record still uses this handle; don't delete it on reuse
                self.handle = None;
            }
        }
        self.length = None;
    }
}

#[derive(Debug)]
pub struct SlotTable {
    slots: Box<[Slot]>,
    cursor: usize,
}

impl SlotTable {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: std::iter::repeat_with(Slot::default)
                .take(capacity)
                .collect(),
            cursor: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn slot(&self, idx: SlotIdx) -> &Slot {
        &self.slots[idx.0]
    }

    /// Number of slots currently bound by at least one binding.
    pub fn in_use(&self) -> usize {
        self.slots.iter().filter(|s| s.refcount > 0).count()
    }

    /// Puts `handle` into a free slot. The slot starts unbound (refcount
    /// zero); callers bind it with [`SlotTable::increment`].
    #[track_caller]
    pub fn install<H: Host>(
        &mut self,
        host: &mut H,
        cache: &mut ArrayCache,
        handle: Option<Handle>,
    ) -> Result<Option<SlotIdx>, NativeError> {
        let Some(handle) = handle else {
            return Ok(None);
        };
        let n = self.slots.len();
        let Some(idx) = (0..n)
            .map(|i| (self.cursor + i) % n)
            .find(|&i| self.slots[i].refcount == 0)
        else {
            return Err(NativeError::out_of_memory("no free handle slot"));
        };
        self.cursor = (idx + 1) % n;
        let slot = &mut self.slots[idx];
        slot.release_resources(host, cache);
        if let Some(old) = slot.handle.take() {
            host.delete_local_ref(old);
        }
        slot.handle = Some(handle);
        slot.length = None;
        Ok(Some(SlotIdx(idx)))
    }

    pub fn increment(&mut self, idx: SlotIdx) {
        let slot = &mut self.slots[idx.0];
        debug_assert!(slot.handle.is_some(), "binding an empty slot");
        slot.refcount += 1;
        log::trace!("slot {}: refcount -> {}", idx.0, slot.refcount);
    }

    pub fn decrement<H: Host>(&mut self, host: &mut H, cache: &mut ArrayCache, idx: SlotIdx) {
        let slot = &mut self.slots[idx.0];
        debug_assert!(slot.refcount > 0, "unbinding a free slot");
        if slot.refcount == 0 {
            return;
        }
        slot.refcount -= 1;
        log::trace!("slot {}: refcount -> {}", idx.0, slot.refcount);
        if slot.refcount == 0 {
            slot.release_resources(host, cache);
        }
    }

    pub fn deref(&self, idx: Option<SlotIdx>) -> Option<Handle> {
        idx.and_then(|i| self.slots[i.0].handle)
    }

    /// Rebinds `binding` to `handle`, unless it already denotes it.
    #[track_caller]
    pub fn assign_simple<H: Host>(
        &mut self,
        host: &mut H,
        cache: &mut ArrayCache,
        binding: &mut Option<SlotIdx>,
        handle: Option<Handle>,
    ) -> Result<(), NativeError> {
        if self.deref(*binding) == handle {
            return Ok(());
        }
        if let Some(old) = binding.take() {
            self.decrement(host, cache, old);
        }
        *binding = self.install(host, cache, handle)?;
        if let Some(new) = *binding {
            self.increment(new);
        }
        Ok(())
    }

    /// Rebinds `binding` to the slot `source` is bound to.
    pub fn assign_multi<H: Host>(
        &mut self,
        host: &mut H,
        cache: &mut ArrayCache,
        binding: &mut Option<SlotIdx>,
        source: Option<SlotIdx>,
    ) {
        if *binding == source || (binding.is_some() && self.deref(*binding) == self.deref(source))
        {
            return;
        }
        if let Some(old) = binding.take() {
            self.decrement(host, cache, old);
        }
        *binding = source;
        if let Some(new) = source {
            self.increment(new);
        }
    }

    /// The handle that stands for the slot's object: the array record's when
    /// one is attached.
    fn canonical(&self, cache: &ArrayCache, idx: SlotIdx) -> Option<Handle> {
        let slot = &self.slots[idx.0];
        slot.array
            .and_then(|id| cache.record(id))
            .map(|r| r.handle())
            .or(slot.handle)
    }

    pub fn multiref_compare<H: Host>(
        &self,
        host: &H,
        cache: &ArrayCache,
        a: Option<SlotIdx>,
        b: Option<SlotIdx>,
    ) -> bool {
        match (a, b) {
            (None, None) => true,
            (Some(a), Some(b)) if a == b => true,
            (Some(a), Some(b)) => {
                match (self.canonical(cache, a), self.canonical(cache, b)) {
                    (Some(x), Some(y)) => x == y || host.is_same_object(x, y),
                    (None, None) => true,
                    _ => false,
                }
            }
            _ => false,
        }
    }

    /// Links the slot to the cache record for its array.
    #[track_caller]
    pub fn install_array<H: Host>(
        &mut self,
        host: &mut H,
        cache: &mut ArrayCache,
        idx: SlotIdx,
    ) -> Result<RecordId, NativeError> {
        let slot = &mut self.slots[idx.0];
        if let Some(id) = slot.array {
            return Ok(id);
        }
        let Some(handle) = slot.handle else {
            return Err(NativeError::null_reference("null array reference"));
        };
        let id = cache.put(host, handle)?;
        if let Some(len) = slot.length {
            debug_assert!(
                cache.record(id).and_then(|r| r.length()).is_none_or(|l| l == len),
                "array length changed"
            );
            cache.set_length(id, len);
        }
        slot.array = Some(id);
        Ok(id)
    }

    pub fn length<H: Host>(
        &mut self,
        host: &mut H,
        cache: &mut ArrayCache,
        idx: SlotIdx,
    ) -> Result<i32, NativeError> {
        let slot = &mut self.slots[idx.0];
        if let Some(len) = slot.length {
            return Ok(len);
        }
        let len = match (slot.array, slot.handle) {
            (Some(id), _) => cache.length(host, id)?,
            (None, Some(handle)) => host.array_length(handle),
            (None, None) => return Err(NativeError::null_reference("null array reference")),
        };
        slot.length = Some(len);
        Ok(len)
    }

    #[track_caller]
    pub fn check_bounds<H: Host>(
        &mut self,
        host: &mut H,
        cache: &mut ArrayCache,
        idx: SlotIdx,
        index: i32,
    ) -> Result<(), NativeError> {
        let len = self.length(host, cache, idx)?;
        if (0..len).contains(&index) {
            Ok(())
        } else {
            Err(NativeError::new(ErrorKind::IndexOutOfBounds { index }))
        }
    }

    /// Fetches the UTF-16 contents once; [`SlotTable::utf16`] reads them.
    #[track_caller]
    pub fn load_utf16<H: Host>(&mut self, host: &mut H, idx: SlotIdx) -> Result<(), NativeError> {
        let slot = &mut self.slots[idx.0];
        if slot.utf16.is_some() {
            return Ok(());
        }
        let handle = slot
            .handle
            .ok_or_else(|| NativeError::null_reference("null string reference"))?;
        let chars = host
            .string_utf16(handle)
            .ok_or_else(|| NativeError::out_of_memory("failed to get contents of a string"))?;
        slot.utf16 = Some(chars);
        Ok(())
    }

    #[track_caller]
    pub fn load_utf8<H: Host>(&mut self, host: &mut H, idx: SlotIdx) -> Result<(), NativeError> {
        let slot = &mut self.slots[idx.0];
        if slot.utf8.is_some() {
            return Ok(());
        }
        let handle = slot
            .handle
            .ok_or_else(|| NativeError::null_reference("null string reference"))?;
        let chars = host
            .string_utf8(handle)
            .ok_or_else(|| NativeError::out_of_memory("failed to get contents of a string"))?;
        slot.utf8 = Some(chars);
        Ok(())
    }

    /// UTF-16 contents loaded by [`SlotTable::load_utf16`].
    pub fn utf16(&self, idx: SlotIdx) -> Option<&[u16]> {
        let chars = self.slots[idx.0].utf16?;
        // SAFETY: the host keeps the characters alive until the view is
        // released, which needs `&mut self`.
        Some(unsafe { std::slice::from_raw_parts(chars.ptr.as_ptr(), chars.len) })
    }

    /// NUL-terminated modified UTF-8 loaded by [`SlotTable::load_utf8`].
    pub fn utf8(&self, idx: SlotIdx) -> Option<&CStr> {
        let chars = self.slots[idx.0].utf8?;
        // SAFETY: as for `utf16`; the host terminates the buffer with NUL.
        Some(unsafe { CStr::from_ptr(chars.ptr.as_ptr().cast()) })
    }

    /// Tears down every slot still holding resources. Bindings that were
    /// never released are reported.
    pub fn release_all<H: Host>(&mut self, host: &mut H, cache: &mut ArrayCache) {
        for (i, slot) in self.slots.iter_mut().enumerate() {
            if slot.refcount > 0 {
                log::warn!(
                    "slot {i}: releasing {:?} with {} live bindings",
                    slot.handle,
                    slot.refcount
                );
                slot.refcount = 0;
                slot.release_resources(host, cache);
            } else if slot.has_resources() {
                slot.release_resources(host, cache);
            }
        }
    }
}

/// Identity first, then the host's same-object test.
pub fn simple_compare<H: Host>(host: &H, a: Option<Handle>, b: Option<Handle>) -> bool {
    match (a, b) {
        (None, None) => true,
        (Some(a), Some(b)) => a == b || host.is_same_object(a, b),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arrays::element::Int;
    use crate::host::memory::MemoryHost;

    fn setup() -> (MemoryHost, ArrayCache, SlotTable) {
        (MemoryHost::new(), ArrayCache::default(), SlotTable::new(4))
    }

    #[test]
    fn null_installs_nothing() {
        let (mut host, mut cache, mut slots) = setup();
        assert_eq!(slots.install(&mut host, &mut cache, None).unwrap(), None);
        assert_eq!(slots.deref(None), None);
    }

    #[test]
    fn refcount_follows_bindings() {
        let (mut host, mut cache, mut slots) = setup();
        let s = host.new_string("a");
        let mut x = None;
        let mut y = None;
        slots.assign_simple(&mut host, &mut cache, &mut x, Some(s)).unwrap();
        slots.assign_multi(&mut host, &mut cache, &mut y, x);
        let idx = x.unwrap();
        assert_eq!(slots.slot(idx).refcount(), 2);
        // rebinding to the same handle changes nothing
        slots.assign_simple(&mut host, &mut cache, &mut x, Some(s)).unwrap();
        assert_eq!(slots.slot(idx).refcount(), 2);
        slots.assign_simple(&mut host, &mut cache, &mut x, None).unwrap();
        assert_eq!(slots.slot(idx).refcount(), 1);
        slots.assign_multi(&mut host, &mut cache, &mut y, None);
        assert_eq!(slots.slot(idx).refcount(), 0);
        assert_eq!(slots.in_use(), 0);
    }

    #[test]
    fn reuse_deletes_previous_handle() {
        let (mut host, mut cache, _) = setup();
        let mut slots1 = SlotTable::new(1);
        let a = host.new_string("a");
        let b = host.new_string("b");
        let ia = slots1.install(&mut host, &mut cache, Some(a)).unwrap().unwrap();
        slots1.increment(ia);
        slots1.decrement(&mut host, &mut cache, ia);
        assert!(host.is_live(a));
        let ib = slots1.install(&mut host, &mut cache, Some(b)).unwrap().unwrap();
        assert_eq!(ia, ib);
        assert!(!host.is_live(a));
    }

    #[test]
    fn full_table_is_out_of_memory() {
        let (mut host, mut cache, _) = setup();
        let mut slots = SlotTable::new(2);
        for name in ["a", "b"] {
            let h = host.new_string(name);
            let i = slots.install(&mut host, &mut cache, Some(h)).unwrap().unwrap();
            slots.increment(i);
        }
        let c = host.new_string("c");
        let err = slots.install(&mut host, &mut cache, Some(c)).unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::OutOfMemory(_)));
    }

    #[test]
    fn shared_record_keeps_its_handle_alive() {
        let (mut host, mut cache, mut slots) = setup();
        let a = host.new_array_from::<Int>(&[1, 2]);
        let a2 = host.new_local_ref(a).unwrap();
        let i1 = slots.install(&mut host, &mut cache, Some(a)).unwrap().unwrap();
        slots.increment(i1);
        let i2 = slots.install(&mut host, &mut cache, Some(a2)).unwrap().unwrap();
        slots.increment(i2);
        let r1 = slots.install_array(&mut host, &mut cache, i1).unwrap();
        let r2 = slots.install_array(&mut host, &mut cache, i2).unwrap();
        assert_eq!(r1, r2);
        assert!(slots.multiref_compare(&host, &cache, Some(i1), Some(i2)));
        cache.get_native_pointer::<Int, _>(&mut host, r1).unwrap();
        // the first slot's handle is the record's; it is forgotten, not deleted
        slots.decrement(&mut host, &mut cache, i1);
        assert_eq!(slots.slot(i1).handle(), None);
        assert!(host.is_live(a));
        assert_eq!(host.outstanding_pins(), 1);
        slots.decrement(&mut host, &mut cache, i2);
        assert_eq!(host.outstanding_pins(), 0);
        assert_eq!(cache.live_records(), 0);
    }

    #[test]
    fn length_is_cached_and_bounds_checked() {
        let (mut host, mut cache, mut slots) = setup();
        let a = host.new_array_from::<Int>(&[1, 2, 3]);
        let i = slots.install(&mut host, &mut cache, Some(a)).unwrap().unwrap();
        assert_eq!(slots.length(&mut host, &mut cache, i).unwrap(), 3);
        let r = slots.install_array(&mut host, &mut cache, i).unwrap();
        assert_eq!(cache.record(r).unwrap().length(), Some(3));
        assert!(slots.check_bounds(&mut host, &mut cache, i, 2).is_ok());
        let err = slots.check_bounds(&mut host, &mut cache, i, 3).unwrap_err();
        assert_eq!(err.to_string(), "Array index out of range: 3");
        assert!(slots.check_bounds(&mut host, &mut cache, i, -1).is_err());
    }

    #[test]
    fn string_views_released_at_zero() {
        let (mut host, mut cache, mut slots) = setup();
        let s = host.new_string("héllo");
        let i = slots.install(&mut host, &mut cache, Some(s)).unwrap().unwrap();
        slots.increment(i);
        slots.load_utf16(&mut host, i).unwrap();
        slots.load_utf16(&mut host, i).unwrap();
        slots.load_utf8(&mut host, i).unwrap();
        assert_eq!(String::from_utf16_lossy(slots.utf16(i).unwrap()), "héllo");
        assert_eq!(slots.utf8(i).unwrap().to_bytes(), "héllo".as_bytes());
        assert_eq!(host.stats().utf16_views, 1);
        slots.decrement(&mut host, &mut cache, i);
        assert_eq!(host.stats().utf16_releases, 1);
        assert_eq!(host.outstanding_utf8_views(), 0);
    }

    #[test]
    fn release_all_sweeps_leaks_and_temporaries() {
        let (mut host, mut cache, mut slots) = setup();
        let a = host.new_array_from::<Int>(&[1]);
        let b = host.new_array_from::<Int>(&[2]);
        let bound = slots.install(&mut host, &mut cache, Some(a)).unwrap().unwrap();
        slots.increment(bound);
        let temp = slots.install(&mut host, &mut cache, Some(b)).unwrap().unwrap();
        for i in [bound, temp] {
            let r = slots.install_array(&mut host, &mut cache, i).unwrap();
            cache.get_native_pointer::<Int, _>(&mut host, r).unwrap();
        }
        assert_eq!(host.outstanding_pins(), 2);
        slots.release_all(&mut host, &mut cache);
        assert_eq!(host.outstanding_pins(), 0);
        assert_eq!(cache.live_records(), 0);
        assert_eq!(slots.in_use(), 0);
    }

    #[test]
    fn compare_null_and_aliases() {
        let mut host = MemoryHost::new();
        let a = host.new_string("a");
        let a2 = host.new_local_ref(a).unwrap();
        let b = host.new_string("b");
        assert!(simple_compare(&host, None, None));
        assert!(!simple_compare(&host, Some(a), None));
        assert!(simple_compare(&host, Some(a), Some(a2)));
        assert!(!simple_compare(&host, Some(a), Some(b)));
    }
}
