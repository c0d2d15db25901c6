//! Heap footprint estimation for buffered records.
//!
//! The buffer never measures memory directly. Instead every payload is sized
//! once by an [`ObjectSizes`] implementation, and the result is multiplied by
//! an expansion rate to absorb estimation error.
//!
//! [`HeapObjectSizes`] is the default sizer: it adds the inline size of the
//! value, the `Arc` header the buffer wraps it in, and every owned heap
//! allocation reported through [`Sizeable`], each rounded by the allocator
//! model in [`MemoryLayout`].

use std::marker::PhantomData;

use smallvec::SmallVec;

use crate::error::Result;

/// Computes the byte footprint of a payload.
///
/// Implemented for any `Fn(&T) -> u64` closure, which is the common way to
/// inject a sizing function in tests.
pub trait ObjectSizes<T>: Send + Sync {
    /// Returns the footprint of `value` in bytes.
    fn size_of(&self, value: &T) -> Result<u64>;
}

impl<T, F> ObjectSizes<T> for F
where
    F: Fn(&T) -> u64 + Send + Sync,
{
    fn size_of(&self, value: &T) -> Result<u64> {
        Ok(self(value))
    }
}

/// Allocator model used to round heap allocations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryLayout {
    /// Bookkeeping bytes the allocator adds to every block.
    pub allocation_overhead: u64,
    /// Block alignment; every block is rounded up to a multiple of it.
    pub allocation_alignment: u64,
}

impl MemoryLayout {
    /// A general-purpose malloc on a 64-bit target: 8 bytes of header, 16-byte blocks.
    pub const SYSTEM: Self = Self {
        allocation_overhead: 8,
        allocation_alignment: 16,
    };

    /// No overhead and no rounding. Useful for deterministic tests.
    pub const EXACT: Self = Self {
        allocation_overhead: 0,
        allocation_alignment: 1,
    };

    /// Rounds `bytes` up to the block alignment.
    #[must_use]
    pub const fn align(&self, bytes: u64) -> u64 {
        let a = if self.allocation_alignment == 0 {
            1
        } else {
            self.allocation_alignment
        };
        bytes.div_ceil(a) * a
    }

    /// Footprint of one heap block holding `bytes` of data. Zero-sized requests don't allocate.
    #[must_use]
    pub const fn allocation(&self, bytes: u64) -> u64 {
        if bytes == 0 {
            0
        } else {
            self.align(bytes + self.allocation_overhead)
        }
    }

    /// Heap bytes owned by a string.
    #[must_use]
    #[allow(clippy::ptr_arg)]
    pub fn string(&self, s: &String) -> u64 {
        self.allocation(s.capacity() as u64)
    }

    /// Heap bytes owned by an optional string.
    #[must_use]
    #[allow(clippy::ref_option)]
    pub fn opt_string(&self, s: &Option<String>) -> u64 {
        s.as_ref().map_or(0, |s| self.string(s))
    }

    /// Heap bytes owned by a vector's buffer, not counting its elements' own heap.
    #[must_use]
    #[allow(clippy::ptr_arg)]
    pub fn vec_buffer<T>(&self, v: &Vec<T>) -> u64 {
        self.allocation((v.capacity() * std::mem::size_of::<T>()) as u64)
    }

    /// Heap bytes owned by a vector of strings, including each string.
    #[must_use]
    #[allow(clippy::ptr_arg)]
    pub fn string_vec(&self, v: &Vec<String>) -> u64 {
        self.vec_buffer(v) + v.iter().map(|s| self.string(s)).sum::<u64>()
    }

    /// Heap bytes owned by a small vector of strings. Inline storage costs nothing extra.
    #[must_use]
    pub fn string_smallvec<const N: usize>(&self, v: &SmallVec<[String; N]>) -> u64 {
        let buffer = if v.spilled() {
            self.allocation((v.capacity() * std::mem::size_of::<String>()) as u64)
        } else {
            0
        };
        buffer + v.iter().map(|s| self.string(s)).sum::<u64>()
    }
}

impl Default for MemoryLayout {
    fn default() -> Self {
        Self::SYSTEM
    }
}

/// Types that can report the heap memory they own.
pub trait Sizeable {
    /// Heap bytes owned by `self`, excluding its inline size.
    fn heap_size(&self, layout: &MemoryLayout) -> u64;

    /// Inline plus owned heap bytes.
    fn deep_size(&self, layout: &MemoryLayout) -> u64
    where
        Self: Sized,
    {
        std::mem::size_of::<Self>() as u64 + self.heap_size(layout)
    }
}

/// Sizes any [`Sizeable`] payload as it sits in the buffer: one `Arc` block
/// holding the value plus everything the value owns.
pub struct HeapObjectSizes<T> {
    layout: MemoryLayout,
    _marker: PhantomData<fn(&T)>,
}

impl<T> HeapObjectSizes<T> {
    /// Creates a sizer using the given allocator model.
    #[must_use]
    pub fn new(layout: MemoryLayout) -> Self {
        Self {
            layout,
            _marker: PhantomData,
        }
    }

    /// Returns the allocator model.
    #[must_use]
    pub fn layout(&self) -> &MemoryLayout {
        &self.layout
    }
}

impl<T> Default for HeapObjectSizes<T> {
    fn default() -> Self {
        Self::new(MemoryLayout::SYSTEM)
    }
}

impl<T: Sizeable> ObjectSizes<T> for HeapObjectSizes<T> {
    fn size_of(&self, value: &T) -> Result<u64> {
        // The buffer wraps payloads in an Arc, which keeps two counters in front of the value.
        let arc_block = (2 * std::mem::size_of::<usize>() + std::mem::size_of::<T>()) as u64;
        Ok(self.layout.allocation(arc_block) + value.heap_size(&self.layout))
    }
}
