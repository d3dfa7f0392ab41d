//! Cache of pinned primitive arrays, keyed by object identity.
//!
//! Every managed array that native code asks to access gets one
//! [`ArrayRecord`], no matter how many local references point to it. Records
//! are found through the host's identity hash and confirmed with a same-object
//! test. Pinning and conversion happen on first use and are remembered, so a
//! record is pinned at most once and unpinned exactly once when its last user
//! lets go.
//!
//! ## Layout
//!
//! The cache is a chain of open-addressed [`Generation`]s whose sizes follow
//! [`RADKE_PRIMES`]. A lookup probes every generation in order. When no
//! generation has room for a new record, a larger one is appended; existing
//! records never move, so a [`RecordId`] stays valid for the record's whole
//! life.
//!
//! Removing a record leaves a zombie cell behind so later probe chains are not
//! cut short. Zombies are reused for insertion but never match a lookup.

use std::{fmt, ptr::NonNull};

use itertools::Itertools;

use crate::{
    host::{Handle, Host},
    utils::error::NativeError,
};

pub mod element;

use element::{ConvertedBuffer, PinKind, PinStrategy, PrimitiveElement};

/// Table sizes, each a prime close to a power of two.
pub const RADKE_PRIMES: [usize; 30] = [
    0x3, 0x7, 0xB, 0x13, 0x2B, 0x43, 0x8B, 0x107, 0x20B, 0x407, 0x80F, 0x1003, 0x201B, 0x401B,
    0x800B, 0x10003, 0x20027, 0x40003, 0x8003B, 0x100007, 0x20003B, 0x40000F, 0x80000B,
    0x100002B, 0x2000023, 0x400000F, 0x8000033, 0x10000003, 0x2000000B, 0x40000003,
];

/// Sizing and pinning of an [`ArrayCache`].
///
/// With the default load factor a size-3 first generation holds two records
/// before the cache grows; a factor of 0.5 makes it grow on the second.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct CacheConfig {
    /// Index into [`RADKE_PRIMES`] of the first generation's size.
    pub initial_size_index: usize,
    /// Largest size index the cache may grow to.
    pub max_size_index: usize,
    pub load_factor: f64,
    pub pin_strategy: PinStrategy,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            initial_size_index: 0,
            max_size_index: RADKE_PRIMES.len() - 1,
            load_factor: 0.75,
            pin_strategy: PinStrategy::Standard,
        }
    }
}

/// Position of a record: which generation, and which cell in it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct RecordId {
    pub generation: usize,
    pub cell: usize,
}

#[derive(Debug)]
struct Pinned {
    ptr: NonNull<u8>,
    kind: PinKind,
}

#[derive(Debug)]
enum Converted {
    /// Native code reads the pinned memory directly.
    Alias,
    Owned(ConvertedBuffer),
}

#[derive(Debug)]
pub struct ArrayRecord {
    handle: Handle,
    hash: i32,
    refcount: u32,
    length: Option<i32>,
    pinned: Option<Pinned>,
    converted: Option<Converted>,
}

impl ArrayRecord {
    fn new(handle: Handle, hash: i32) -> Self {
        Self {
            handle,
            hash,
            refcount: 1,
            length: None,
            pinned: None,
            converted: None,
        }
    }
    pub fn handle(&self) -> Handle {
        self.handle
    }
    pub fn hash(&self) -> i32 {
        self.hash
    }
    pub fn refcount(&self) -> u32 {
        self.refcount
    }
    pub fn length(&self) -> Option<i32> {
        self.length
    }
    pub fn is_pinned(&self) -> bool {
        self.pinned.is_some()
    }
    /// Whether native code gets its own copy instead of the pinned memory.
    pub fn is_copied(&self) -> bool {
        matches!(self.converted, Some(Converted::Owned(_)))
    }

    fn release_resources<H: Host>(&mut self, host: &mut H) {
        if let Some(Converted::Owned(buf)) = self.converted.take() {
            log::trace!("record {:?}: freeing converted copy", self.handle);
            drop(buf);
        }
        if let Some(Pinned { ptr, kind }) = self.pinned.take() {
            log::trace!("record {:?}: unpin ({kind:?})", self.handle);
            element::unpin(host, self.handle, ptr, kind);
        }
        self.length = None;
    }
}

#[derive(Debug, Default)]
enum Cell {
    #[default]
    Unused,
    Live(ArrayRecord),
    Zombie,
}

/// One open-addressed table in the chain.
#[derive(Debug)]
pub struct Generation {
    size_index: usize,
    fill: usize,
    threshold: usize,
    dynamic: bool,
    cells: Box<[Cell]>,
}

fn alloc_cells(size: usize) -> Result<Box<[Cell]>, NativeError> {
    let mut cells = Vec::new();
    cells
        .try_reserve_exact(size)
        .map_err(|_| NativeError::out_of_memory("cannot allocate an array cache generation"))?;
    cells.resize_with(size, Cell::default);
    Ok(cells.into_boxed_slice())
}

impl Generation {
    #[track_caller]
    fn new(size_index: usize, load_factor: f64, dynamic: bool) -> Result<Self, NativeError> {
        let size = RADKE_PRIMES[size_index];
        Ok(Self {
            size_index,
            fill: 0,
            threshold: (size as f64 * load_factor) as usize,
            dynamic,
            cells: alloc_cells(size)?,
        })
    }
    pub fn size(&self) -> usize {
        self.cells.len()
    }
    pub fn fill(&self) -> usize {
        self.fill
    }
    pub fn threshold(&self) -> usize {
        self.threshold
    }
    pub fn is_dynamic(&self) -> bool {
        self.dynamic
    }
    fn has_room(&self) -> bool {
        self.fill < self.threshold
    }
}

impl fmt::Display for Generation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({}/{})", self.size(), self.fill, self.threshold)
    }
}

/// Cells visited when looking for `hash` in a table of `size` cells.
///
/// Starts at `hash mod size` and advances by `size-2, size-4, …, 1, 1, 3, …,
/// size-2`, so the sequence is bounded by the table size.
pub fn probe_sequence(hash: i32, size: usize) -> impl Iterator<Item = usize> {
    let start = hash as u32 as usize % size;
    let size = size as isize;
    let mut step = -size;
    std::iter::successors(Some(start), move |&cell| {
        step += 2;
        (step < size).then(|| (cell + step.unsigned_abs()) % size as usize)
    })
}

#[derive(Debug)]
pub struct ArrayCache {
    config: CacheConfig,
    generations: Vec<Generation>,
}

impl Default for ArrayCache {
    fn default() -> Self {
        Self::new(CacheConfig::default())
    }
}

impl ArrayCache {
    /// An empty cache. The first generation is allocated by the first
    /// [`ArrayCache::put`].
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            generations: vec![],
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn generations(&self) -> &[Generation] {
        &self.generations
    }

    pub fn generation_count(&self) -> usize {
        self.generations.len()
    }

    pub fn generation_sizes(&self) -> Vec<usize> {
        self.generations.iter().map(Generation::size).collect()
    }

    pub fn live_records(&self) -> usize {
        self.generations.iter().map(|g| g.fill).sum()
    }

    pub fn record(&self, id: RecordId) -> Option<&ArrayRecord> {
        match self.generations.get(id.generation)?.cells.get(id.cell)? {
            Cell::Live(record) => Some(record),
            _ => None,
        }
    }

    fn record_mut(&mut self, id: RecordId) -> Result<&mut ArrayRecord, NativeError> {
        let cell = self
            .generations
            .get_mut(id.generation)
            .and_then(|g| g.cells.get_mut(id.cell));
        match cell {
            Some(Cell::Live(record)) => Ok(record),
            _ => {
                debug_assert!(false, "no live array record at {id:?}");
                Err(NativeError::unknown(format!("no live array record at {id:?}")))
            }
        }
    }

    /// Finds the record for `array` or creates one, and takes a reference to
    /// it.
    #[track_caller]
    pub fn put<H: Host>(&mut self, host: &mut H, array: Handle) -> Result<RecordId, NativeError> {
        let hash = host.identity_hash(array);
        let mut candidate = None;
        for (g, generation) in self.generations.iter_mut().enumerate() {
            let has_room = generation.has_room();
            let mut first_unused = None;
            for cell in probe_sequence(hash, generation.size()) {
                match &mut generation.cells[cell] {
                    Cell::Unused => {
                        first_unused = Some(cell);
                        break;
                    }
                    Cell::Zombie => {
                        if candidate.is_none() && has_room {
                            candidate = Some(RecordId { generation: g, cell });
                        }
                    }
                    Cell::Live(record) => {
                        if record.hash == hash && host.is_same_object(record.handle, array) {
                            record.refcount += 1;
                            log::trace!("put: {array:?} refcount -> {}", record.refcount);
                            return Ok(RecordId { generation: g, cell });
                        }
                    }
                }
            }
            if candidate.is_none() && has_room {
                candidate = first_unused.map(|cell| RecordId { generation: g, cell });
            }
        }
        let id = match candidate {
            Some(id) => id,
            None => self.grow(hash)?,
        };
        let generation = &mut self.generations[id.generation];
        generation.cells[id.cell] = Cell::Live(ArrayRecord::new(array, hash));
        generation.fill += 1;
        log::trace!("put: new record for {array:?} at {id:?}");
        Ok(id)
    }

    #[track_caller]
    fn grow(&mut self, hash: i32) -> Result<RecordId, NativeError> {
        let next = self
            .generations
            .last()
            .map_or(self.config.initial_size_index, |g| g.size_index + 1);
        if next > self.config.max_size_index.min(RADKE_PRIMES.len() - 1) {
            return Err(NativeError::out_of_memory("array cache cannot grow any further"));
        }
        let dynamic = !self.generations.is_empty();
        let generation = Generation::new(next, self.config.load_factor, dynamic)?;
        let cell = hash as u32 as usize % generation.size();
        log::debug!(
            "array cache: appending generation of size {}",
            generation.size()
        );
        self.generations.push(generation);
        Ok(RecordId {
            generation: self.generations.len() - 1,
            cell,
        })
    }

    pub fn retain(&mut self, id: RecordId) {
        if let Ok(record) = self.record_mut(id) {
            record.refcount += 1;
            log::trace!("retain: {:?} refcount -> {}", record.handle, record.refcount);
        }
    }

    /// Drops one reference; the last one releases the pin and frees the cell.
    /// Returns whether the record is gone.
    pub fn release<H: Host>(&mut self, host: &mut H, id: RecordId) -> bool {
        let Ok(record) = self.record_mut(id) else {
            return false;
        };
        debug_assert!(record.refcount > 0);
        record.refcount = record.refcount.saturating_sub(1);
        log::trace!("release: {:?} refcount -> {}", record.handle, record.refcount);
        if record.refcount == 0 {
            self.remove(host, id);
            true
        } else {
            false
        }
    }

    /// Releases the record's pin and copy and turns its cell into a zombie.
    pub fn remove<H: Host>(&mut self, host: &mut H, id: RecordId) {
        let Some(generation) = self.generations.get_mut(id.generation) else {
            return;
        };
        let Some(cell) = generation.cells.get_mut(id.cell) else {
            return;
        };
        let Cell::Live(mut record) = std::mem::replace(cell, Cell::Zombie) else {
            debug_assert!(false, "removing a cell without a record at {id:?}");
            return;
        };
        debug_assert_eq!(record.refcount, 0, "removing a referenced array record");
        record.release_resources(host);
        generation.fill -= 1;
        log::trace!("remove: {:?} at {id:?}", record.handle);
    }

    /// Element count of the array, queried from the host once.
    pub fn length<H: Host>(&mut self, host: &mut H, id: RecordId) -> Result<i32, NativeError> {
        let record = self.record_mut(id)?;
        match record.length {
            Some(len) => Ok(len),
            None => {
                let len = host.array_length(record.handle);
                record.length = Some(len);
                Ok(len)
            }
        }
    }

    pub fn set_length(&mut self, id: RecordId, length: i32) {
        if let Ok(record) = self.record_mut(id) {
            debug_assert!(record.length.is_none_or(|l| l == length));
            record.length = Some(length);
        }
    }

    /// Pointer to the pinned managed elements, pinning on first use.
    #[track_caller]
    pub fn get_native_pointer<E: PrimitiveElement, H: Host>(
        &mut self,
        host: &mut H,
        id: RecordId,
    ) -> Result<NonNull<E::Managed>, NativeError> {
        let strategy = self.config.pin_strategy;
        let record = self.record_mut(id)?;
        if let Some(pinned) = &record.pinned {
            return Ok(pinned.ptr.cast());
        }
        let Some((ptr, kind)) = element::pin::<E, H>(host, record.handle, strategy) else {
            return Err(NativeError::out_of_memory(
                "failed to get contents of an array",
            ));
        };
        log::trace!("record {:?}: pinned ({kind:?})", record.handle);
        record.pinned = Some(Pinned { ptr, kind });
        Ok(ptr.cast())
    }

    /// Pointer to the elements in their native representation. Aliases the
    /// pinned memory when the layouts agree and is a private copy otherwise.
    #[track_caller]
    pub fn get_converted_pointer<E: PrimitiveElement, H: Host>(
        &mut self,
        host: &mut H,
        id: RecordId,
    ) -> Result<NonNull<E::Native>, NativeError> {
        let pinned = self.get_native_pointer::<E, H>(host, id)?;
        if let Some(ptr) = self.cached_conversion::<E>(id)? {
            return Ok(ptr);
        }
        if element::layout_compatible::<E>() {
            self.record_mut(id)?.converted = Some(Converted::Alias);
            return Ok(pinned.cast());
        }
        let len = usize::try_from(self.length(host, id)?).unwrap_or(0);
        // SAFETY: `pinned` holds `len` managed elements until the record is
        // removed.
        let mut buf = unsafe { element::convert::<E>(pinned.cast(), len) }
            .map_err(|_| NativeError::out_of_memory("cannot convert array contents"))?;
        let ptr = buf.as_mut_ptr().cast();
        self.record_mut(id)?.converted = Some(Converted::Owned(buf));
        Ok(ptr)
    }

    fn cached_conversion<E: PrimitiveElement>(
        &mut self,
        id: RecordId,
    ) -> Result<Option<NonNull<E::Native>>, NativeError> {
        let record = self.record_mut(id)?;
        Ok(match &mut record.converted {
            None => None,
            Some(Converted::Alias) => record.pinned.as_ref().map(|p| p.ptr.cast()),
            Some(Converted::Owned(buf)) => {
                debug_assert_eq!(buf.element_type(), E::TYPE);
                Some(buf.as_mut_ptr().cast())
            }
        })
    }

    /// Forces every record out, then drops the generations added by growth.
    pub fn release_all<H: Host>(&mut self, host: &mut H) {
        for generation in &mut self.generations {
            for cell in generation.cells.iter_mut() {
                if let Cell::Live(record) = cell {
                    if record.refcount > 0 {
                        log::warn!(
                            "release_all: {:?} still has {} references",
                            record.handle,
                            record.refcount
                        );
                    }
                    record.refcount = 0;
                    record.release_resources(host);
                }
                *cell = Cell::Unused;
            }
            generation.fill = 0;
        }
        self.generations.retain(|g| !g.dynamic);
    }
}

impl fmt::Display for ArrayCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] {} live",
            self.generations.iter().join(", "),
            self.live_records()
        )
    }
}
