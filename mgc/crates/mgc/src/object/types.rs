//! Type Descriptors - Shape metadata for heap allocations
//!
//! A `GcType` tells the scanner and sizer everything about an allocation:
//! its kind, its stride, which byte offsets hold references, and an optional
//! finalizer. Descriptors are shared by every object of that shape.
//!
//! Descriptors live in a `TypePool` arena and are referred to by
//! `TypeHandle`. Heap headers store the handle, never an address, so the
//! pool is free to reclaim slots without the moving heap holding dangling
//! pointers. Reclamation is driven by a liveness sweep over the heap (see
//! `Gc::free_type`): a freed handle is only recycled once no object header,
//! and no `Type`-kind object, refers to it any more.

use crate::error::{GcError, Result};
use crate::util::constants::WORD;
use parking_lot::{Mutex, RwLock, RwLockReadGuard};
use rustc_hash::FxHashSet;
use serde::Serialize;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::thread::ThreadId;

/// Kind of allocation described by a type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum GcKind {
    /// Fixed-size record
    Fixed,
    /// Fixed-size record of a managed object (may carry a finalizer)
    FixedObj,
    /// Array of `stride`-sized elements
    Array,
    /// Array whose reference slots do not keep their targets alive
    WeakArray,
    /// Type-of-types: the slot at the first offset holds a `TypeHandle`
    Type,
    /// Machine code block (never used for a descriptor that is allocated)
    Code,
}

impl GcKind {
    /// Kinds allocated with an element count
    pub fn is_array(self) -> bool {
        matches!(self, GcKind::Array | GcKind::WeakArray)
    }
}

/// Outcome of running a finalizer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Finalized {
    /// Finalizer ran to completion
    Done,
    /// Finalizer must run on the given OS thread instead
    Defer(ThreadId),
}

/// Finalizer callback, receives the client address of the dying object
pub type FinalizerFn = fn(usize) -> Finalized;

/// Type Descriptor
#[derive(Debug, Clone)]
pub struct GcType {
    /// Kind of allocation
    pub kind: GcKind,
    /// Reflection-layer type object (0 if none)
    ///
    /// Kept alive by the collector as long as the descriptor exists. Should
    /// be a static allocation; anything else is pinned where it lies.
    pub reflect: usize,
    /// Object size for fixed kinds, element size for arrays
    pub stride: usize,
    /// Byte offsets of reference slots within one element
    pub offsets: Vec<usize>,
    /// Finalizer, if any
    pub finalizer: Option<FinalizerFn>,
}

impl GcType {
    /// Fixed-size record of `size` bytes
    pub fn fixed(size: usize) -> Self {
        Self::with_kind(GcKind::Fixed, size)
    }

    /// Fixed-size managed object of `size` bytes
    pub fn object(size: usize) -> Self {
        Self::with_kind(GcKind::FixedObj, size)
    }

    /// Array with `stride`-byte elements
    pub fn array(stride: usize) -> Self {
        Self::with_kind(GcKind::Array, stride)
    }

    /// Weak array of pointers
    pub fn weak_array() -> Self {
        Self::with_kind(GcKind::WeakArray, WORD).with_offsets(&[0])
    }

    /// Descriptor of a kind
    pub fn with_kind(kind: GcKind, stride: usize) -> Self {
        Self {
            kind,
            reflect: 0,
            stride,
            offsets: Vec::new(),
            finalizer: None,
        }
    }

    /// Set the reference offsets
    pub fn with_offsets(mut self, offsets: &[usize]) -> Self {
        self.offsets = offsets.to_vec();
        self
    }

    /// Set the finalizer
    pub fn with_finalizer(mut self, finalizer: FinalizerFn) -> Self {
        self.finalizer = Some(finalizer);
        self
    }

    /// Set the reflection-layer type object
    pub fn with_reflect(mut self, reflect: usize) -> Self {
        self.reflect = reflect;
        self
    }

    /// Check that the descriptor describes a scannable shape
    pub fn validate(&self) -> Result<()> {
        if self.kind == GcKind::Code {
            return Err(GcError::Usage(
                "code blocks are allocated with alloc_code, not through a type".to_string(),
            ));
        }
        if self.kind == GcKind::Type && self.offsets.is_empty() {
            return Err(GcError::Usage(
                "Type-kind descriptors need the handle slot as their first offset".to_string(),
            ));
        }
        for &offset in &self.offsets {
            if offset % WORD != 0 || offset + WORD > self.stride {
                return Err(GcError::Usage(format!(
                    "reference offset {} does not fit a {}-byte element",
                    offset, self.stride
                )));
            }
        }
        Ok(())
    }

    /// Offsets that hold references (excludes the handle slot of `Type` kinds)
    #[inline]
    pub fn reference_offsets(&self) -> &[usize] {
        if self.kind == GcKind::Type {
            &self.offsets[1..]
        } else {
            &self.offsets
        }
    }
}

/// Stable handle of a descriptor in the `TypePool`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TypeHandle(NonZeroU32);

impl TypeHandle {
    fn from_index(index: usize) -> Option<Self> {
        u32::try_from(index + 1).ok().and_then(NonZeroU32::new).map(TypeHandle)
    }

    fn index(self) -> usize {
        self.0.get() as usize - 1
    }

    /// Encoding stored in object headers
    pub fn to_raw(self) -> usize {
        self.0.get() as usize
    }

    /// Decode a header word; 0 is "no type"
    pub fn from_raw(raw: usize) -> Option<Self> {
        u32::try_from(raw).ok().and_then(NonZeroU32::new).map(TypeHandle)
    }
}

type Slots = Vec<Option<Arc<GcType>>>;

/// Arena of type descriptors
pub struct TypePool {
    slots: RwLock<Slots>,
    free: Mutex<Vec<usize>>,
    pending: Mutex<Vec<TypeHandle>>,
}

impl TypePool {
    /// Create an empty pool
    pub fn new() -> Self {
        Self {
            slots: RwLock::new(Vec::new()),
            free: Mutex::new(Vec::new()),
            pending: Mutex::new(Vec::new()),
        }
    }

    /// Register a descriptor
    pub fn alloc(&self, ty: GcType) -> Result<TypeHandle> {
        ty.validate()?;

        let mut slots = self.slots.write();
        let index = match self.free.lock().pop() {
            Some(index) => index,
            None => {
                slots.push(None);
                slots.len() - 1
            },
        };
        let handle = TypeHandle::from_index(index)
            .ok_or_else(|| GcError::Internal("type pool index space exhausted".to_string()))?;
        slots[index] = Some(Arc::new(ty));
        Ok(handle)
    }

    /// Look up a descriptor
    pub fn get(&self, handle: TypeHandle) -> Result<Arc<GcType>> {
        self.slots
            .read()
            .get(handle.index())
            .and_then(|slot| slot.clone())
            .ok_or_else(|| GcError::Usage(format!("unknown type handle {}", handle.to_raw())))
    }

    /// Read access to all descriptors for the duration of a scan
    pub fn table(&self) -> TypeTable<'_> {
        TypeTable {
            slots: self.slots.read(),
        }
    }

    /// Queue a descriptor for reclamation
    ///
    /// Returns the number of handles waiting for a liveness sweep.
    pub fn free(&self, handle: TypeHandle) -> usize {
        let mut pending = self.pending.lock();
        if !pending.contains(&handle) {
            pending.push(handle);
        }
        pending.len()
    }

    /// Number of handles waiting for a liveness sweep
    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    /// Release every pending handle that is not in `live`
    ///
    /// Handles still referenced stay pending for the next sweep.
    /// Returns `(freed, kept)`.
    pub fn reclaim(&self, live: &FxHashSet<TypeHandle>) -> (usize, usize) {
        let mut pending = self.pending.lock();
        let mut slots = self.slots.write();
        let mut free = self.free.lock();

        let before = pending.len();
        pending.retain(|handle| {
            if live.contains(handle) {
                return true;
            }
            if let Some(slot) = slots.get_mut(handle.index()) {
                *slot = None;
                free.push(handle.index());
            }
            false
        });

        (before - pending.len(), pending.len())
    }

    /// Number of registered descriptors
    pub fn len(&self) -> usize {
        self.slots.read().iter().filter(|slot| slot.is_some()).count()
    }

    /// Check if no descriptor is registered
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for TypePool {
    fn default() -> Self {
        Self::new()
    }
}

/// Read guard over the descriptor arena
pub struct TypeTable<'a> {
    slots: RwLockReadGuard<'a, Slots>,
}

impl<'a> TypeTable<'a> {
    /// Descriptor for a raw header word
    #[inline]
    pub fn get(&self, raw: usize) -> Option<&GcType> {
        let handle = TypeHandle::from_raw(raw)?;
        self.slots.get(handle.index())?.as_deref()
    }

    /// Reflection objects of every registered descriptor
    pub fn reflects(&self) -> impl Iterator<Item = usize> + '_ {
        self.slots
            .iter()
            .flatten()
            .map(|ty| ty.reflect)
            .filter(|&reflect| reflect != 0)
    }
}
