//! Virtual-range allocator: grows a contiguous virtual region on demand by
//! mapping fresh frames, instead of failing when no free block fits (the
//! kernel heap's policy). A watermark (`vmem_current`) tracks the first
//! unreserved virtual address in the region. Otherwise shares the kernel
//! heap's first-fit/split/coalesce algorithm, with one difference: a
//! block's `size` (user-requested) and `capacity` (page-aligned) differ,
//! because growth happens a whole page at a time.

use core::ptr::NonNull;

use crate::memory::addr::VirtAddress;
use crate::memory::block::{round_up_8, Header, HEADER_SIZE, MAGIC_ALLOCATED, MAGIC_FREED, MIN_SPLIT_RESIDUAL};
use crate::memory::frame_alloc::FrameAllocator;
use crate::memory::page::PAGE_SIZE;
use crate::memory::pager::{PageFlags, PhysicalMemory, Pager};
use crate::panic_sink::PanicSink;

/// Sentinel returned by `brk` for an out-of-region request, matching the
/// boot-contract convention `(void*)-1`.
pub const BRK_SENTINEL: usize = usize::MAX;

pub struct VirtualRangeAllocator<Sink> {
    head: Option<NonNull<Header>>,
    region_start: VirtAddress,
    region_end: VirtAddress,
    watermark: VirtAddress,
    used_bytes: u64,
    sink: Sink,
}

unsafe impl<Sink: Send> Send for VirtualRangeAllocator<Sink> {}

impl<Sink: PanicSink> VirtualRangeAllocator<Sink> {
    pub const fn new(sink: Sink) -> Self {
        VirtualRangeAllocator {
            head: None,
            region_start: VirtAddress::from_raw(0),
            region_end: VirtAddress::from_raw(0),
            watermark: VirtAddress::from_raw(0),
            used_bytes: 0,
            sink,
        }
    }

    pub fn init(&mut self, region_start: VirtAddress, region_end: VirtAddress) {
        self.region_start = region_start;
        self.region_end = region_end;
        self.watermark = region_start;
        self.head = None;
        self.used_bytes = 0;
    }

    pub fn used_bytes(&self) -> u64 {
        self.used_bytes
    }

    pub fn watermark(&self) -> VirtAddress {
        self.watermark
    }

    fn in_range(&self, addr: usize) -> bool {
        (addr as u64) >= self.region_start.as_raw() && (addr as u64) < self.watermark.as_raw()
    }

    /// `n == 0` returns null. First-fit over the free list; on a miss,
    /// grows the region by mapping whole pages via `pager`/`fa`, fatal
    /// only if that growth would exceed the region's end.
    pub fn alloc<Mem: PhysicalMemory>(
        &mut self,
        fa: &mut FrameAllocator<Sink>,
        pager: &mut Pager<Sink, Mem>,
        n: u64,
    ) -> *mut u8 {
        if n == 0 {
            return core::ptr::null_mut();
        }
        let n = round_up_8(n);

        let mut cur = self.head;
        let mut tail = None;
        while let Some(mut node) = cur {
            let header = unsafe { node.as_mut() };
            if header.free && header.capacity >= n {
                self.commit_block(node, n);
                return unsafe { Header::payload_ptr(node) };
            }
            tail = Some(node);
            cur = header.next;
        }

        self.grow_and_alloc(fa, pager, n, tail)
    }

    fn commit_block(&mut self, mut node: NonNull<Header>, n: u64) {
        let header = unsafe { node.as_mut() };
        // VA blocks only split along capacity; requested size can be
        // smaller than capacity without the allocator caring.
        if header.capacity >= n + HEADER_SIZE + MIN_SPLIT_RESIDUAL {
            let remainder_capacity = header.capacity - n - HEADER_SIZE;
            let remainder_addr =
                unsafe { (node.as_ptr() as *mut u8).add((HEADER_SIZE + n) as usize) };
            let remainder_ptr = remainder_addr as *mut Header;
            unsafe {
                remainder_ptr.write(Header {
                    size: remainder_capacity,
                    free: true,
                    magic: MAGIC_FREED,
                    next: header.next,
                    capacity: remainder_capacity,
                });
                header.next = Some(NonNull::new_unchecked(remainder_ptr));
            }
            header.capacity = n;
        }
        header.size = n;
        header.free = false;
        header.magic = MAGIC_ALLOCATED;
        self.used_bytes += header.size + HEADER_SIZE;
    }

    fn grow_and_alloc<Mem: PhysicalMemory>(
        &mut self,
        fa: &mut FrameAllocator<Sink>,
        pager: &mut Pager<Sink, Mem>,
        n: u64,
        tail: Option<NonNull<Header>>,
    ) -> *mut u8 {
        let pages = (n + HEADER_SIZE).div_ceil(PAGE_SIZE.as_raw());
        let growth = pages * PAGE_SIZE.as_raw();

        let new_watermark = self
            .watermark
            .as_raw()
            .checked_add(growth)
            .filter(|w| *w <= self.region_end.as_raw() + 1);
        let Some(new_watermark) = new_watermark else {
            fatal!(self.sink, "vmalloc: virtual-range region exhausted");
        };

        let block_start = self.watermark;
        for i in 0..pages {
            let virt = VirtAddress::from_raw(self.watermark.as_raw() + i * PAGE_SIZE.as_raw());
            let phys = fa.alloc_page();
            pager
                .map_page(fa, virt, phys, PageFlags::PRESENT | PageFlags::WRITABLE)
                .unwrap_or_else(|_| {
                    fatal!(self.sink, "vmalloc: out of frames extending region")
                });
        }
        self.watermark = VirtAddress::from_raw(new_watermark);

        let capacity = growth - HEADER_SIZE;
        let header_ptr = block_start.as_mut_ptr::<Header>();
        unsafe {
            header_ptr.write(Header {
                size: n,
                free: false,
                magic: MAGIC_ALLOCATED,
                next: None,
                capacity,
            });
        }
        let node = unsafe { NonNull::new_unchecked(header_ptr) };

        match tail {
            Some(mut tail_node) => unsafe { tail_node.as_mut().next = Some(node) },
            None => self.head = Some(node),
        }

        self.used_bytes += n + HEADER_SIZE;
        // If the new block is bigger than requested (rounded to a whole
        // page), the remainder is already reflected in `capacity` and is
        // available to a future `alloc` that calls `commit_block` again
        // only via a second pass; since we just created this node fresh,
        // split it immediately to release any unused capacity as a free
        // neighbor.
        if capacity > n + MIN_SPLIT_RESIDUAL + HEADER_SIZE {
            self.commit_block(node, n);
        }

        unsafe { Header::payload_ptr(node) }
    }

    /// As the kernel heap, plus a bounds check against `[region_start,
    /// watermark)`.
    ///
    /// # Safety
    ///
    /// `ptr` must be null or a pointer previously returned by [`Self::alloc`]
    /// or [`Self::brk`] that has not since been freed.
    pub unsafe fn free(&mut self, ptr: *mut u8) {
        if ptr.is_null() {
            return;
        }

        let mut node = unsafe { Header::from_payload_ptr(ptr) };
        let header = unsafe { node.as_mut() };

        if header.is_freed() {
            fatal!(self.sink, "vfree: double free detected at {:p}", ptr);
        }
        if !header.is_allocated() {
            fatal!(
                self.sink,
                "vfree: invalid memory block at {:p} (magic: {:#x})",
                ptr,
                header.magic
            );
        }

        header.free = true;
        header.magic = MAGIC_FREED;
        self.used_bytes -= header.size + HEADER_SIZE;

        self.coalesce();
    }

    fn coalesce(&mut self) {
        let mut cur = self.head;
        while let Some(mut node) = cur {
            let header = unsafe { node.as_mut() };
            let next = header.next;
            match next {
                Some(next_node) if header.free && unsafe { next_node.as_ref() }.free => {
                    let end_of_cur = unsafe { Header::end_addr(node, header.capacity) };
                    if end_of_cur == next_node.as_ptr() as usize {
                        let next_header = unsafe { next_node.as_ref() };
                        header.capacity += HEADER_SIZE + next_header.capacity;
                        header.size = header.capacity;
                        header.next = next_header.next;
                        continue;
                    }
                    cur = next;
                }
                _ => cur = next,
            }
        }
    }

    /// Null ⇒ 0. Out-of-bounds or bad magic ⇒ log and return 0.
    ///
    /// # Safety
    ///
    /// `ptr` must be null or a pointer previously returned by [`Self::alloc`]
    /// or [`Self::brk`].
    pub unsafe fn size(&self, ptr: *mut u8) -> u64 {
        if ptr.is_null() {
            return 0;
        }
        if !self.in_range(ptr as usize) {
            log::warn!("vsize: pointer {:p} is outside the virtual-range region", ptr);
            return 0;
        }
        let node = unsafe { Header::from_payload_ptr(ptr) };
        let header = unsafe { node.as_ref() };
        if header.magic != MAGIC_ALLOCATED {
            log::warn!("vsize: pointer {:p} is not a live allocation", ptr);
            return 0;
        }
        header.size
    }

    /// `new == null` returns the watermark. A higher address extends the
    /// region (mapping pages one at a time). Lower or out-of-region
    /// addresses return [`BRK_SENTINEL`] without mutating state.
    pub fn brk<Mem: PhysicalMemory>(
        &mut self,
        fa: &mut FrameAllocator<Sink>,
        pager: &mut Pager<Sink, Mem>,
        new: *mut u8,
    ) -> *mut u8 {
        if new.is_null() {
            return self.watermark.as_mut_ptr();
        }

        let new_addr = new as u64;
        if new_addr < self.watermark.as_raw() || new_addr > self.region_end.as_raw() + 1 {
            return BRK_SENTINEL as *mut u8;
        }

        while self.watermark.as_raw() < new_addr {
            let virt = self.watermark;
            let phys = fa.alloc_page();
            pager
                .map_page(fa, virt, phys, PageFlags::PRESENT | PageFlags::WRITABLE)
                .unwrap_or_else(|_| fatal!(self.sink, "vbrk: out of frames extending region"));
            self.watermark = VirtAddress::from_raw(self.watermark.as_raw() + PAGE_SIZE.as_raw());
        }

        self.watermark.as_mut_ptr()
    }
}
