//! Kernel heap: a single contiguous virtual range pre-mapped to fresh
//! frames at init. Maintains one singly linked list covering every block
//! in the range (allocated and free alike), sorted by address, exactly
//! mirroring the "a block is either part of the list or doesn't exist"
//! shape of the original C allocator this is ported from. `alloc` walks
//! the list first-fit and only ever splits or flips a node's `free` bit;
//! `free` flips the bit back and coalesces adjacent free neighbors in one
//! left-to-right pass.

use core::ptr::NonNull;

use crate::memory::addr::VirtAddress;
use crate::memory::block::{round_up_8, Header, HEADER_SIZE, MAGIC_ALLOCATED, MAGIC_FREED, MIN_SPLIT_RESIDUAL};
use crate::panic_sink::PanicSink;

/// Sentinel returned by `kbrk` for an out-of-region request, matching the
/// boot-contract convention `(void*)-1`.
pub const BRK_SENTINEL: usize = usize::MAX;

pub struct KernelHeap<Sink> {
    head: Option<NonNull<Header>>,
    base: VirtAddress,
    total_bytes: u64,
    used_bytes: u64,
    sink: Sink,
}

// Safety: a `KernelHeap` owns its backing range exclusively; it is Send
// wherever its sink is, same as any other allocator state guarded by a
// `spin::Mutex` at the call site.
unsafe impl<Sink: Send> Send for KernelHeap<Sink> {}

impl<Sink: PanicSink> KernelHeap<Sink> {
    pub const fn new(sink: Sink) -> Self {
        KernelHeap {
            head: None,
            base: VirtAddress::from_raw(0),
            total_bytes: 0,
            used_bytes: 0,
            sink,
        }
    }

    /// Initializes the heap over `[base, base+size)`, which the caller has
    /// already pre-mapped writable and supervisor-only. The entire range
    /// minus one header becomes a single free block.
    ///
    /// # Safety
    ///
    /// `[base, base+size)` must be mapped, writable, and not otherwise in
    /// use.
    pub unsafe fn init(&mut self, base: VirtAddress, size: u64) {
        self.base = base;
        self.total_bytes = size;
        self.used_bytes = 0;

        let header_ptr = base.as_mut_ptr::<Header>();
        header_ptr.write(Header {
            size: size - HEADER_SIZE,
            free: true,
            magic: MAGIC_FREED,
            next: None,
            capacity: 0,
        });
        self.head = Some(NonNull::new_unchecked(header_ptr));
    }

    pub fn used_bytes(&self) -> u64 {
        self.used_bytes
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    fn in_range(&self, addr: usize) -> bool {
        let base = self.base.as_raw() as usize;
        addr >= base && (addr as u64 - base as u64) < self.total_bytes
    }

    /// `n == 0` returns null without touching any state. No free block
    /// fits ⇒ fatal: the kernel heap never grows past its pre-mapped
    /// extent.
    pub fn alloc(&mut self, n: u64) -> *mut u8 {
        if n == 0 {
            return core::ptr::null_mut();
        }
        let n = round_up_8(n);

        let mut cur = self.head;
        while let Some(mut node) = cur {
            let header = unsafe { node.as_mut() };
            if header.free && header.size >= n {
                self.split_if_worthwhile(node, n);
                header.free = false;
                header.magic = MAGIC_ALLOCATED;
                self.used_bytes += header.size + HEADER_SIZE;
                return unsafe { Header::payload_ptr(node) };
            }
            cur = header.next;
        }

        fatal!(
            self.sink,
            "kmalloc: out of memory! requested {} bytes, heap full",
            n
        )
    }

    fn split_if_worthwhile(&mut self, mut node: NonNull<Header>, n: u64) {
        let header = unsafe { node.as_mut() };
        if header.size < n + HEADER_SIZE + MIN_SPLIT_RESIDUAL {
            return;
        }

        let remainder_size = header.size - n - HEADER_SIZE;
        let remainder_addr = unsafe { (node.as_ptr() as *mut u8).add((HEADER_SIZE + n) as usize) };
        let remainder_ptr = remainder_addr as *mut Header;
        unsafe {
            remainder_ptr.write(Header {
                size: remainder_size,
                free: true,
                magic: MAGIC_FREED,
                next: header.next,
                capacity: 0,
            });
            header.next = Some(NonNull::new_unchecked(remainder_ptr));
        }
        header.size = n;
    }

    /// Null ⇒ no-op. Double free and corrupted-magic are both fatal.
    /// Coalesces forward in one pass after flipping the bit.
    ///
    /// # Safety
    ///
    /// `ptr` must be null or a pointer previously returned by [`Self::alloc`]
    /// on this heap that has not since been freed.
    pub unsafe fn free(&mut self, ptr: *mut u8) {
        if ptr.is_null() {
            return;
        }

        let mut node = unsafe { Header::from_payload_ptr(ptr) };
        let header = unsafe { node.as_mut() };

        if header.is_freed() {
            fatal!(self.sink, "kfree: double free detected at {:p}", ptr);
        }
        if !header.is_allocated() {
            fatal!(
                self.sink,
                "kfree: invalid memory block at {:p} (magic: {:#x})",
                ptr,
                header.magic
            );
        }

        header.free = true;
        header.magic = MAGIC_FREED;
        self.used_bytes -= header.size + HEADER_SIZE;

        self.coalesce();
    }

    /// Single left-to-right pass merging adjacent blocks whose end address
    /// equals the next block's header address, preserving free-list order.
    fn coalesce(&mut self) {
        let mut cur = self.head;
        while let Some(mut node) = cur {
            let header = unsafe { node.as_mut() };
            let next = header.next;
            match next {
                Some(next_node) if header.free && unsafe { next_node.as_ref() }.free => {
                    let end_of_cur = unsafe { Header::end_addr(node, header.size) };
                    if end_of_cur == next_node.as_ptr() as usize {
                        let next_header = unsafe { next_node.as_ref() };
                        header.size += HEADER_SIZE + next_header.size;
                        header.next = next_header.next;
                        // Re-examine `node` in case it can merge again with
                        // its new `next`.
                        continue;
                    }
                    cur = next;
                }
                _ => cur = next,
            }
        }
    }

    /// Null ⇒ 0. Pointer outside the heap, or bad magic ⇒ log and return
    /// 0 (recoverable — lets diagnostic tooling probe without crashing).
    ///
    /// # Safety
    ///
    /// `ptr` must be null or a pointer previously returned by [`Self::alloc`]
    /// on this heap.
    pub unsafe fn size(&self, ptr: *mut u8) -> u64 {
        if ptr.is_null() {
            return 0;
        }
        if !self.in_range(ptr as usize) {
            log::warn!("ksize: pointer {:p} is outside the kernel heap", ptr);
            return 0;
        }
        let node = unsafe { Header::from_payload_ptr(ptr) };
        let header = unsafe { node.as_ref() };
        if header.magic != MAGIC_ALLOCATED {
            log::warn!("ksize: pointer {:p} is not a live allocation", ptr);
            return 0;
        }
        header.size
    }

    /// `new == null` returns the current break (`base + used_bytes`). A
    /// request within `[base, base+total_bytes]` moves `used_bytes` to
    /// match, independent of the free list's own bookkeeping of the same
    /// field — mirroring the original C allocator, where `heap_used` is
    /// both the free-list accounting variable and the brk watermark.
    /// Unlike the virtual-range allocator's `brk`, the kernel heap is
    /// fully pre-mapped at init, so this never maps new pages; it can only
    /// move the watermark within the already-fixed range. Out-of-range
    /// requests return [`BRK_SENTINEL`] without mutating state.
    pub fn kbrk(&mut self, new: *mut u8) -> *mut u8 {
        if new.is_null() {
            return unsafe { self.base.as_mut_ptr::<u8>().add(self.used_bytes as usize) };
        }

        let new_addr = new as u64;
        let base = self.base.as_raw();
        if new_addr < base || new_addr > base + self.total_bytes {
            return BRK_SENTINEL as *mut u8;
        }

        self.used_bytes = new_addr - base;
        new
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::panic_sink::test_support::RecordingPanicSink;

    const HEAP_SIZE: u64 = 4096;

    fn heap() -> (KernelHeap<RecordingPanicSink>, std::vec::Vec<u8>) {
        let mut backing = std::vec![0u8; HEAP_SIZE as usize];
        let base = VirtAddress::from_raw(backing.as_mut_ptr() as u64);
        let mut kh = KernelHeap::new(RecordingPanicSink::new());
        unsafe { kh.init(base, HEAP_SIZE) };
        (kh, backing)
    }

    #[test]
    fn alloc_zero_returns_null_without_state_change() {
        let (mut kh, _backing) = heap();
        let used_before = kh.used_bytes();
        assert!(kh.alloc(0).is_null());
        assert_eq!(kh.used_bytes(), used_before);
    }

    #[test]
    fn allocate_write_verify_free() {
        let (mut kh, _backing) = heap();
        let p = kh.alloc(128);
        assert!(!p.is_null());
        unsafe { *(p as *mut u32) = 42 };
        assert_eq!(unsafe { *(p as *mut u32) }, 42);
        assert_eq!(unsafe { kh.size(p) }, 128);
        unsafe { kh.free(p) };
        assert_eq!(unsafe { kh.size(p) }, 0);
    }

    #[test]
    #[should_panic(expected = "double free")]
    fn double_free_is_fatal() {
        let (mut kh, _backing) = heap();
        let p = kh.alloc(64);
        unsafe { kh.free(p) };
        unsafe { kh.free(p) };
    }

    #[test]
    #[should_panic(expected = "invalid memory block")]
    fn free_of_unallocated_pointer_is_fatal() {
        let (mut kh, backing) = heap();
        let bogus = unsafe { (backing.as_ptr() as *mut u8).add(64) };
        unsafe { kh.free(bogus) };
    }

    #[test]
    fn round_trip_leaves_used_bytes_unchanged() {
        let (mut kh, _backing) = heap();
        let before = kh.used_bytes();
        let p = kh.alloc(200);
        unsafe { kh.free(p) };
        assert_eq!(kh.used_bytes(), before);
    }

    #[test]
    fn pointers_are_8_byte_aligned_and_in_range() {
        let (mut kh, _backing) = heap();
        let p = kh.alloc(13);
        assert_eq!((p as u64) % 8, 0);
        assert!(kh.in_range(p as usize));
    }

    #[test]
    fn exact_fit_succeeds_once_then_panics() {
        let (mut kh, _backing) = heap();
        let n = HEAP_SIZE - HEADER_SIZE;
        let p = kh.alloc(n);
        assert!(!p.is_null());

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            kh.alloc(8);
        }));
        assert!(result.is_err());
    }

    #[test]
    fn coalescing_allows_refit_after_freeing_neighbors() {
        let (mut kh, _backing) = heap();
        let a = kh.alloc(64);
        let b = kh.alloc(64);
        let c = kh.alloc(64);
        unsafe { kh.free(a) };
        unsafe { kh.free(b) };
        unsafe { kh.free(c) };
        // Everything coalesced back into one block; a single large
        // allocation should fit without growing anything.
        let big = kh.alloc(HEAP_SIZE - HEADER_SIZE);
        assert!(!big.is_null());
    }

    #[test]
    fn size_on_bad_pointer_logs_and_returns_zero_without_panicking() {
        let (kh, backing) = heap();
        let outside = unsafe { (backing.as_ptr() as *mut u8).add(HEAP_SIZE as usize + 8) };
        assert_eq!(unsafe { kh.size(outside) }, 0);
    }

    #[test]
    fn kbrk_null_returns_current_break() {
        let (mut kh, _backing) = heap();
        let base = kh.base.as_mut_ptr::<u8>();
        assert_eq!(kh.kbrk(core::ptr::null_mut()), base);

        kh.alloc(64);
        let expected = unsafe { base.add(kh.used_bytes() as usize) };
        assert_eq!(kh.kbrk(core::ptr::null_mut()), expected);
    }

    #[test]
    fn kbrk_moves_break_within_bounds() {
        let (mut kh, _backing) = heap();
        let base = kh.base.as_raw();
        let target = unsafe { kh.base.as_mut_ptr::<u8>().add(256) };
        assert_eq!(kh.kbrk(target), target);
        assert_eq!(kh.used_bytes(), 256);
        assert_eq!(kh.base.as_raw(), base);
    }

    #[test]
    fn kbrk_out_of_bounds_returns_sentinel() {
        let (mut kh, _backing) = heap();
        let too_high = unsafe { kh.base.as_mut_ptr::<u8>().add(HEAP_SIZE as usize + 8) };
        assert_eq!(kh.kbrk(too_high) as usize, BRK_SENTINEL);
        assert_eq!(kh.used_bytes(), 0);

        let too_low = (kh.base.as_raw() - 8) as *mut u8;
        assert_eq!(kh.kbrk(too_low) as usize, BRK_SENTINEL);
    }
}
