//! Unmanaged memory: allocate/free/resize/raw-copy over address
//! handles backed by a pluggable native allocator.
//!
//! Addresses handed out by the heap are stable integer handles into an
//! allocation table, not raw pointers; every access is bounds-checked
//! against the owning buffer. [`UnmanagedHeap::base_ptr`] exposes the
//! real base pointer when a buffer is handed to a non-managed consumer.

use std::alloc;
use std::fmt;
use std::ptr::{self, NonNull};
use thiserror::Error;

/// Width of an address word written into flat buffers.
pub const WORD_BYTES: usize = std::mem::size_of::<usize>();

/// Alignment of every buffer the heap hands out; covers every slot kind
/// a shadow layout can contain.
const BUFFER_ALIGN: usize = 16;

/// An address handle. Zero is the null sentinel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NativeAddr(u64);

impl NativeAddr {
    pub const NULL: NativeAddr = NativeAddr(0);

    pub fn is_null(self) -> bool {
        self.0 == 0
    }

    pub fn raw(self) -> u64 {
        self.0
    }

    pub fn from_raw(raw: u64) -> Self {
        NativeAddr(raw)
    }
}

impl fmt::Display for NativeAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Errors that can occur during heap operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HeapError {
    #[error("allocation of {0} bytes failed")]
    AllocationFailure(usize),

    #[error("invalid or already-freed address {0}")]
    InvalidAddress(NativeAddr),

    #[error("access of {len} bytes at offset {offset} overruns buffer {addr} ({size} bytes)")]
    OutOfBounds {
        addr: NativeAddr,
        offset: usize,
        len: usize,
        size: usize,
    },
}

/// The pluggable native allocator underneath the heap.
pub trait BackingAllocator {
    /// Allocates `bytes` of zero-filled memory. `None` on exhaustion.
    fn allocate(&mut self, bytes: usize) -> Option<NonNull<u8>>;

    /// # Safety
    /// `ptr` must have come from `allocate`/`resize` on this backend
    /// with size `bytes`, and must not be used afterwards.
    unsafe fn free(&mut self, ptr: NonNull<u8>, bytes: usize);

    /// Grows or shrinks a buffer, preserving the first
    /// `min(old_bytes, new_bytes)` bytes and zero-filling any
    /// extension. May relocate.
    ///
    /// # Safety
    /// Same provenance rules as [`BackingAllocator::free`]. On success
    /// the old pointer must not be used again.
    unsafe fn resize(
        &mut self,
        ptr: NonNull<u8>,
        old_bytes: usize,
        new_bytes: usize,
    ) -> Option<NonNull<u8>>;
}

/// Default backend on the standard allocator.
pub struct SystemAllocator;

impl BackingAllocator for SystemAllocator {
    fn allocate(&mut self, bytes: usize) -> Option<NonNull<u8>> {
        if bytes == 0 {
            // Dangling but aligned, matching the standard allocator's
            // treatment of zero-sized allocations.
            return Some(NonNull::dangling());
        }
        let layout = alloc::Layout::from_size_align(bytes, BUFFER_ALIGN).ok()?;
        // SAFETY: layout has non-zero size.
        let raw = unsafe { alloc::alloc_zeroed(layout) };
        NonNull::new(raw)
    }

    unsafe fn free(&mut self, ptr: NonNull<u8>, bytes: usize) {
        if bytes == 0 {
            return;
        }
        if let Ok(layout) = alloc::Layout::from_size_align(bytes, BUFFER_ALIGN) {
            alloc::dealloc(ptr.as_ptr(), layout);
        }
    }

    unsafe fn resize(
        &mut self,
        ptr: NonNull<u8>,
        old_bytes: usize,
        new_bytes: usize,
    ) -> Option<NonNull<u8>> {
        if old_bytes == 0 {
            return self.allocate(new_bytes);
        }
        if new_bytes == 0 {
            self.free(ptr, old_bytes);
            return Some(NonNull::dangling());
        }
        let layout = alloc::Layout::from_size_align(old_bytes, BUFFER_ALIGN).ok()?;
        let raw = alloc::realloc(ptr.as_ptr(), layout, new_bytes);
        let moved = NonNull::new(raw)?;
        if new_bytes > old_bytes {
            // realloc leaves the extension undefined.
            ptr::write_bytes(moved.as_ptr().add(old_bytes), 0, new_bytes - old_bytes);
        }
        Some(moved)
    }
}

struct Allocation {
    ptr: NonNull<u8>,
    len: usize,
}

/// Live-allocation counters, mostly for leak assertions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapStats {
    pub live_allocations: usize,
    pub live_bytes: usize,
}

/// Allocation table handing out bounds-checked address handles.
pub struct UnmanagedHeap<A: BackingAllocator = SystemAllocator> {
    backend: A,
    slots: Vec<Option<Allocation>>,
    free_slots: Vec<usize>,
    live_bytes: usize,
}

impl UnmanagedHeap<SystemAllocator> {
    pub fn new() -> Self {
        Self::with_backend(SystemAllocator)
    }
}

impl Default for UnmanagedHeap<SystemAllocator> {
    fn default() -> Self {
        Self::new()
    }
}

impl<A: BackingAllocator> UnmanagedHeap<A> {
    pub fn with_backend(backend: A) -> Self {
        UnmanagedHeap {
            backend,
            slots: Vec::new(),
            free_slots: Vec::new(),
            live_bytes: 0,
        }
    }

    /// Allocates a zero-filled buffer and returns its handle.
    pub fn allocate(&mut self, bytes: usize) -> Result<NativeAddr, HeapError> {
        let ptr = self
            .backend
            .allocate(bytes)
            .ok_or(HeapError::AllocationFailure(bytes))?;
        let slot = self.acquire_slot();
        self.slots[slot] = Some(Allocation { ptr, len: bytes });
        self.live_bytes += bytes;
        let addr = NativeAddr(slot as u64 + 1);
        log::trace!("allocated {bytes} bytes at {addr}");
        Ok(addr)
    }

    /// Releases one buffer. The tree beneath it is the caller's
    /// responsibility.
    pub fn free(&mut self, addr: NativeAddr) -> Result<(), HeapError> {
        let slot = self.slot_index(addr)?;
        let allocation = self.slots[slot]
            .take()
            .ok_or(HeapError::InvalidAddress(addr))?;
        // SAFETY: the allocation came from this backend with this length.
        unsafe { self.backend.free(allocation.ptr, allocation.len) };
        self.live_bytes -= allocation.len;
        self.free_slots.push(slot);
        log::trace!("freed {} bytes at {addr}", allocation.len);
        Ok(())
    }

    /// Grows or shrinks a buffer. Returns a new handle; the old one is
    /// invalid afterwards. On failure the original buffer stays live.
    pub fn resize(&mut self, addr: NativeAddr, new_bytes: usize) -> Result<NativeAddr, HeapError> {
        let slot = self.slot_index(addr)?;
        let allocation = self.slots[slot]
            .take()
            .ok_or(HeapError::InvalidAddress(addr))?;
        // SAFETY: provenance as for free; on success the old pointer is
        // discarded with the old handle.
        let moved = unsafe {
            self.backend
                .resize(allocation.ptr, allocation.len, new_bytes)
        };
        match moved {
            Some(ptr) => {
                self.live_bytes = self.live_bytes - allocation.len + new_bytes;
                let new_slot = self.acquire_slot();
                self.slots[new_slot] = Some(Allocation {
                    ptr,
                    len: new_bytes,
                });
                // Retire the old handle only after the new one exists,
                // so the two are never equal.
                self.free_slots.push(slot);
                Ok(NativeAddr(new_slot as u64 + 1))
            }
            None => {
                self.slots[slot] = Some(allocation);
                Err(HeapError::AllocationFailure(new_bytes))
            }
        }
    }

    /// Copies `len` bytes between buffers; the regions may belong to
    /// the same buffer.
    pub fn raw_copy(
        &mut self,
        dst: NativeAddr,
        dst_offset: usize,
        src: NativeAddr,
        src_offset: usize,
        len: usize,
    ) -> Result<(), HeapError> {
        self.check_range(src, src_offset, len)?;
        self.check_range(dst, dst_offset, len)?;
        let src_ptr = self.resolve(src)?.ptr.as_ptr();
        let dst_ptr = self.resolve(dst)?.ptr.as_ptr();
        // SAFETY: both ranges were bounds-checked; copy handles overlap.
        unsafe {
            ptr::copy(src_ptr.add(src_offset), dst_ptr.add(dst_offset), len);
        }
        Ok(())
    }

    /// Whole buffer as a byte slice.
    pub fn bytes(&self, addr: NativeAddr) -> Result<&[u8], HeapError> {
        let allocation = self.resolve(addr)?;
        // SAFETY: the allocation is live and `len` bytes long.
        Ok(unsafe { std::slice::from_raw_parts(allocation.ptr.as_ptr(), allocation.len) })
    }

    /// Whole buffer as a mutable byte slice.
    pub fn bytes_mut(&mut self, addr: NativeAddr) -> Result<&mut [u8], HeapError> {
        let allocation = self.resolve(addr)?;
        // SAFETY: the allocation is live, `len` bytes long, and borrowed
        // uniquely through `&mut self`.
        Ok(unsafe { std::slice::from_raw_parts_mut(allocation.ptr.as_ptr(), allocation.len) })
    }

    /// Bounds-checked view of `len` bytes at `offset`.
    pub fn read_bytes(
        &self,
        addr: NativeAddr,
        offset: usize,
        len: usize,
    ) -> Result<&[u8], HeapError> {
        self.check_range(addr, offset, len)?;
        Ok(&self.bytes(addr)?[offset..offset + len])
    }

    /// Bounds-checked write of `data` at `offset`.
    pub fn write_bytes(
        &mut self,
        addr: NativeAddr,
        offset: usize,
        data: &[u8],
    ) -> Result<(), HeapError> {
        self.check_range(addr, offset, data.len())?;
        self.bytes_mut(addr)?[offset..offset + data.len()].copy_from_slice(data);
        Ok(())
    }

    /// Writes an address word (native width, native endianness).
    pub fn write_word(
        &mut self,
        addr: NativeAddr,
        offset: usize,
        value: u64,
    ) -> Result<(), HeapError> {
        self.write_bytes(addr, offset, &(value as usize).to_ne_bytes())
    }

    /// Reads an address word back, widened to u64.
    pub fn read_word(&self, addr: NativeAddr, offset: usize) -> Result<u64, HeapError> {
        let bytes = self.read_bytes(addr, offset, WORD_BYTES)?;
        let mut buf = [0u8; WORD_BYTES];
        buf.copy_from_slice(bytes);
        Ok(usize::from_ne_bytes(buf) as u64)
    }

    pub fn write_i32(&mut self, addr: NativeAddr, offset: usize, value: i32) -> Result<(), HeapError> {
        self.write_bytes(addr, offset, &value.to_ne_bytes())
    }

    pub fn read_i32(&self, addr: NativeAddr, offset: usize) -> Result<i32, HeapError> {
        let bytes = self.read_bytes(addr, offset, 4)?;
        let mut buf = [0u8; 4];
        buf.copy_from_slice(bytes);
        Ok(i32::from_ne_bytes(buf))
    }

    /// Size of the buffer behind a handle.
    pub fn size_of(&self, addr: NativeAddr) -> Result<usize, HeapError> {
        Ok(self.resolve(addr)?.len)
    }

    /// Real base pointer, for handing a buffer to non-managed code.
    pub fn base_ptr(&self, addr: NativeAddr) -> Result<NonNull<u8>, HeapError> {
        Ok(self.resolve(addr)?.ptr)
    }

    pub fn stats(&self) -> HeapStats {
        HeapStats {
            live_allocations: self.slots.iter().filter(|s| s.is_some()).count(),
            live_bytes: self.live_bytes,
        }
    }

    fn acquire_slot(&mut self) -> usize {
        match self.free_slots.pop() {
            Some(slot) => slot,
            None => {
                self.slots.push(None);
                self.slots.len() - 1
            }
        }
    }

    fn slot_index(&self, addr: NativeAddr) -> Result<usize, HeapError> {
        if addr.is_null() {
            return Err(HeapError::InvalidAddress(addr));
        }
        let index = (addr.0 - 1) as usize;
        if index >= self.slots.len() {
            return Err(HeapError::InvalidAddress(addr));
        }
        Ok(index)
    }

    fn resolve(&self, addr: NativeAddr) -> Result<&Allocation, HeapError> {
        let index = self.slot_index(addr)?;
        self.slots[index]
            .as_ref()
            .ok_or(HeapError::InvalidAddress(addr))
    }

    fn check_range(&self, addr: NativeAddr, offset: usize, len: usize) -> Result<(), HeapError> {
        let size = self.size_of(addr)?;
        let end = offset.checked_add(len);
        match end {
            Some(end) if end <= size => Ok(()),
            _ => Err(HeapError::OutOfBounds {
                addr,
                offset,
                len,
                size,
            }),
        }
    }
}

impl<A: BackingAllocator> Drop for UnmanagedHeap<A> {
    fn drop(&mut self) {
        let mut leaked = 0usize;
        for slot in &mut self.slots {
            if let Some(allocation) = slot.take() {
                // SAFETY: allocation provenance as in free.
                unsafe { self.backend.free(allocation.ptr, allocation.len) };
                leaked += 1;
            }
        }
        if leaked > 0 {
            log::debug!("heap dropped with {leaked} live allocations");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Backend that refuses every allocation.
    struct ExhaustedAllocator;

    impl BackingAllocator for ExhaustedAllocator {
        fn allocate(&mut self, _bytes: usize) -> Option<NonNull<u8>> {
            None
        }
        unsafe fn free(&mut self, _ptr: NonNull<u8>, _bytes: usize) {}
        unsafe fn resize(
            &mut self,
            _ptr: NonNull<u8>,
            _old: usize,
            _new: usize,
        ) -> Option<NonNull<u8>> {
            None
        }
    }

    #[test]
    fn allocate_zero_fills() {
        let mut heap = UnmanagedHeap::new();
        let addr = heap.allocate(32).unwrap();
        assert!(heap.bytes(addr).unwrap().iter().all(|&b| b == 0));
    }

    #[test]
    fn write_read_round_trip() {
        let mut heap = UnmanagedHeap::new();
        let addr = heap.allocate(16).unwrap();
        heap.write_i32(addr, 4, -7).unwrap();
        assert_eq!(heap.read_i32(addr, 4).unwrap(), -7);
        heap.write_word(addr, 8, 0xDEAD).unwrap();
        assert_eq!(heap.read_word(addr, 8).unwrap(), 0xDEAD);
    }

    #[test]
    fn out_of_bounds_rejected() {
        let mut heap = UnmanagedHeap::new();
        let addr = heap.allocate(8).unwrap();
        let err = heap.write_i32(addr, 6, 1).unwrap_err();
        assert!(matches!(err, HeapError::OutOfBounds { .. }));
    }

    #[test]
    fn double_free_rejected() {
        let mut heap = UnmanagedHeap::new();
        let addr = heap.allocate(8).unwrap();
        heap.free(addr).unwrap();
        assert_eq!(heap.free(addr), Err(HeapError::InvalidAddress(addr)));
    }

    #[test]
    fn null_and_garbage_addresses_rejected() {
        let heap = UnmanagedHeap::new();
        assert!(heap.bytes(NativeAddr::NULL).is_err());
        assert!(heap.bytes(NativeAddr::from_raw(42)).is_err());
    }

    #[test]
    fn resize_preserves_and_zero_fills() {
        let mut heap = UnmanagedHeap::new();
        let addr = heap.allocate(8).unwrap();
        heap.write_i32(addr, 0, 99).unwrap();
        let grown = heap.resize(addr, 24).unwrap();
        assert_ne!(grown, addr);
        assert_eq!(heap.read_i32(grown, 0).unwrap(), 99);
        assert!(heap.bytes(grown).unwrap()[8..].iter().all(|&b| b == 0));
        // The old handle is dead.
        assert!(heap.bytes(addr).is_err());
    }

    #[test]
    fn raw_copy_between_buffers() {
        let mut heap = UnmanagedHeap::new();
        let src = heap.allocate(8).unwrap();
        let dst = heap.allocate(8).unwrap();
        heap.write_i32(src, 0, 1234).unwrap();
        heap.raw_copy(dst, 4, src, 0, 4).unwrap();
        assert_eq!(heap.read_i32(dst, 4).unwrap(), 1234);
    }

    #[test]
    fn stats_track_live_buffers() {
        let mut heap = UnmanagedHeap::new();
        let a = heap.allocate(16).unwrap();
        let b = heap.allocate(8).unwrap();
        assert_eq!(
            heap.stats(),
            HeapStats {
                live_allocations: 2,
                live_bytes: 24
            }
        );
        heap.free(a).unwrap();
        heap.free(b).unwrap();
        assert_eq!(heap.stats().live_allocations, 0);
        assert_eq!(heap.stats().live_bytes, 0);
    }

    #[test]
    fn exhaustion_is_an_explicit_error() {
        let mut heap = UnmanagedHeap::with_backend(ExhaustedAllocator);
        assert_eq!(heap.allocate(8), Err(HeapError::AllocationFailure(8)));
    }

    #[test]
    fn zero_sized_allocations_work() {
        let mut heap = UnmanagedHeap::new();
        let addr = heap.allocate(0).unwrap();
        assert_eq!(heap.bytes(addr).unwrap().len(), 0);
        heap.free(addr).unwrap();
    }
}
