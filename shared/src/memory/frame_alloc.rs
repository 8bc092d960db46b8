//! Physical frame allocator.
//!
//! Owns a dense bitmap, one bit per 4 KiB frame: `0` free, `1` used. Bit 0
//! maps to physical address 0. `init` marks everything used, then frees the
//! range the bootloader reported, then reserves the BIOS region and a
//! kernel-image prefix back out of that. `alloc_page` restarts its scan
//! from word 0 every call; at a few thousand words this is cheap enough,
//! and the resulting simplicity and debuggability is worth more than a
//! buddy allocator here.

use core::fmt::Debug;

use crate::memory::addr::{PhysAddress, PhysExtent};
use crate::memory::config;
use crate::memory::page::PAGE_SIZE;
use crate::memory::{Map, MemoryType};
use crate::panic_sink::PanicSink;

const BITS_PER_WORD: usize = 32;
const MAX_FRAMES: usize = (config::MAX_MANAGED_MEMORY_BYTES / PAGE_SIZE.as_raw()) as usize;
const BITMAP_WORDS: usize = (MAX_FRAMES + BITS_PER_WORD - 1) / BITS_PER_WORD;

#[derive(Debug, Eq, PartialEq)]
pub enum FrameAllocError {
    OutOfMemory,
}

/// Physical frame allocator. `Sink` is the injected fatal-error
/// collaborator (see [`crate::panic_sink`]).
pub struct FrameAllocator<Sink> {
    bitmap: [u32; BITMAP_WORDS],
    base_frame: u64,
    total_pages: u64,
    free_pages: u64,
    sink: Sink,
}

impl<Sink: PanicSink> FrameAllocator<Sink> {
    pub const fn new(sink: Sink) -> Self {
        FrameAllocator {
            bitmap: [0xFFFF_FFFF; BITMAP_WORDS],
            base_frame: 0,
            total_pages: 0,
            free_pages: 0,
            sink,
        }
    }

    /// Clamps `mem_bytes` to the compile-time cap, computes
    /// `total_pages`, marks every frame used, then frees
    /// `[1 MiB, 1 MiB + total_pages*4096)`, then re-reserves a prefix of
    /// that for the kernel image.
    pub fn init(&mut self, mem_bytes: u64) {
        let mem_bytes = mem_bytes.min(config::MAX_MANAGED_MEMORY_BYTES);
        self.total_pages = mem_bytes / PAGE_SIZE.as_raw();
        self.free_pages = 0;
        self.base_frame = config::BIOS_REGION_END / PAGE_SIZE.as_raw();

        for word in self.bitmap.iter_mut() {
            *word = 0xFFFF_FFFF;
        }

        let base_frame = self.base_frame;
        for i in 0..self.total_pages {
            self.clear_bit((base_frame + i) as usize);
            self.free_pages += 1;
        }

        let reserved_pages = config::KERNEL_IMAGE_RESERVED_BYTES / PAGE_SIZE.as_raw();
        for i in 0..reserved_pages.min(self.total_pages) {
            if !self.test_bit((base_frame + i) as usize) {
                self.set_bit((base_frame + i) as usize);
                self.free_pages -= 1;
            }
        }
    }

    /// As `init`, but seeds the bitmap from a bootloader-supplied memory
    /// map's `Available` extents individually instead of one contiguous
    /// range. Marks every frame used, frees each `Available` extent
    /// (clamped to the compile-time cap), then re-reserves the BIOS region
    /// and kernel-image prefix on top, exactly as `init` does — a real e820
    /// -style map may well report that low range as `Available` too, and it
    /// must never be handed out regardless of what the map claims.
    pub fn init_from_map(&mut self, map: &Map) {
        self.total_pages = config::MAX_MANAGED_MEMORY_BYTES / PAGE_SIZE.as_raw();
        self.free_pages = 0;
        self.base_frame = 0;

        for word in self.bitmap.iter_mut() {
            *word = 0xFFFF_FFFF;
        }

        for extent in map.iter_type(MemoryType::Available) {
            self.free_extent(extent);
        }

        let reserved_pages =
            (config::BIOS_REGION_END + config::KERNEL_IMAGE_RESERVED_BYTES) / PAGE_SIZE.as_raw();
        for i in 0..reserved_pages.min(self.total_pages) {
            if !self.test_bit(i as usize) {
                self.set_bit(i as usize);
                self.free_pages -= 1;
            }
        }
    }

    /// Frees every whole frame contained in `extent`, clamped to the
    /// compile-time managed-memory cap. A partial frame at either edge is
    /// left marked used.
    fn free_extent(&mut self, extent: PhysExtent) {
        let start = extent.address().as_raw();
        let end = start
            .saturating_add(extent.length().as_raw())
            .min(config::MAX_MANAGED_MEMORY_BYTES);
        if start >= end {
            return;
        }

        let first_frame = start.div_ceil(PAGE_SIZE.as_raw());
        let last_frame = end / PAGE_SIZE.as_raw();
        for idx in first_frame..last_frame {
            if self.test_bit(idx as usize) {
                self.clear_bit(idx as usize);
                self.free_pages += 1;
            }
        }
    }

    /// First-fit scan of the bitmap for a zero (free) bit; flips it to one
    /// and returns the frame's base address. Fatal on exhaustion.
    pub fn alloc_page(&mut self) -> PhysAddress {
        for (word_idx, word) in self.bitmap.iter().enumerate() {
            if *word == 0xFFFF_FFFF {
                continue;
            }
            let free_bit = (!*word).trailing_zeros() as usize;
            let idx = word_idx * BITS_PER_WORD + free_bit;
            if idx >= MAX_FRAMES {
                break;
            }
            self.set_bit(idx);
            self.free_pages -= 1;
            return PhysAddress::from_raw(idx as u64 * PAGE_SIZE.as_raw());
        }
        fatal!(self.sink, "PMM out of memory")
    }

    /// Clears the frame's bit. Addresses outside the managed range are
    /// silently ignored. Freeing an already-free frame is fatal
    /// (double free).
    pub fn free_page(&mut self, frame_base: PhysAddress) {
        let idx = (frame_base.as_raw() / PAGE_SIZE.as_raw()) as usize;
        if idx < self.base_frame as usize || idx >= (self.base_frame + self.total_pages) as usize {
            return;
        }
        if !self.test_bit(idx) {
            fatal!(self.sink, "Double free page {:#x}", frame_base.as_raw());
        }
        self.clear_bit(idx);
        self.free_pages += 1;
    }

    pub fn free_pages(&self) -> u64 {
        self.free_pages
    }

    pub fn total_pages(&self) -> u64 {
        self.total_pages
    }

    fn set_bit(&mut self, idx: usize) {
        self.bitmap[idx / BITS_PER_WORD] |= 1 << (idx % BITS_PER_WORD);
    }

    fn clear_bit(&mut self, idx: usize) {
        self.bitmap[idx / BITS_PER_WORD] &= !(1 << (idx % BITS_PER_WORD));
    }

    fn test_bit(&self, idx: usize) -> bool {
        self.bitmap[idx / BITS_PER_WORD] & (1 << (idx % BITS_PER_WORD)) != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MapEntry;
    use crate::panic_sink::test_support::RecordingPanicSink;

    fn allocator() -> FrameAllocator<RecordingPanicSink> {
        let mut fa = FrameAllocator::new(RecordingPanicSink::new());
        fa.init(2 * 1024 * 1024);
        fa
    }

    #[test]
    fn init_accounts_for_bios_and_kernel_image_reservation() {
        let fa = allocator();
        // 2 MiB / 4096 = 512 pages total; 1 MiB reserved for the kernel
        // image leaves 256 free.
        assert_eq!(fa.total_pages(), 512);
        assert_eq!(fa.free_pages(), 256);
    }

    #[test]
    fn alloc_and_free_round_trip() {
        let mut fa = allocator();
        let before = fa.free_pages();

        let p1 = fa.alloc_page();
        let p2 = fa.alloc_page();
        assert_ne!(p1, p2);
        assert_eq!(fa.free_pages(), before - 2);

        fa.free_page(p1);
        fa.free_page(p2);
        assert_eq!(fa.free_pages(), before);
    }

    #[test]
    fn alloc_never_returns_bios_region() {
        let mut fa = allocator();
        for _ in 0..fa.free_pages() {
            let p = fa.alloc_page();
            assert!(p.as_raw() >= config::BIOS_REGION_END);
        }
    }

    #[test]
    #[should_panic(expected = "Double free")]
    fn double_free_is_fatal() {
        let mut fa = allocator();
        let p = fa.alloc_page();
        fa.free_page(p);
        fa.free_page(p);
    }

    #[test]
    #[should_panic(expected = "out of memory")]
    fn exhaustion_is_fatal() {
        let mut fa = allocator();
        for _ in 0..=fa.free_pages() {
            fa.alloc_page();
        }
    }

    #[test]
    fn free_outside_managed_range_is_ignored() {
        let mut fa = allocator();
        let before = fa.free_pages();
        fa.free_page(PhysAddress::from_raw(config::MAX_MANAGED_MEMORY_BYTES * 2));
        assert_eq!(fa.free_pages(), before);
    }

    #[test]
    fn init_from_map_only_frees_available_extents() {
        // Everything below here (BIOS region + kernel-image prefix) must
        // never be handed out, regardless of what's in the map.
        let reserved_end = config::BIOS_REGION_END + config::KERNEL_IMAGE_RESERVED_BYTES;
        let base_frame = reserved_end / PAGE_SIZE.as_raw();

        // Two `Available` extents separated by a gap: one implicitly
        // reserved (absent from the map), the other an explicit `Reserved`
        // entry. Neither half of the gap should ever be freed.
        let map = Map::from_entries([
            MapEntry {
                extent: PhysExtent::from_raw(reserved_end, 4 * 4096),
                mem_type: MemoryType::Available,
            },
            MapEntry {
                extent: PhysExtent::from_raw(reserved_end + 6 * 4096, 2 * 4096),
                mem_type: MemoryType::Reserved,
            },
            MapEntry {
                extent: PhysExtent::from_raw(reserved_end + 8 * 4096, 4 * 4096),
                mem_type: MemoryType::Available,
            },
        ]);

        let mut fa = FrameAllocator::new(RecordingPanicSink::new());
        fa.init_from_map(&map);

        // Below the kernel-image reservation: always used, map never asked.
        assert!(fa.test_bit((base_frame - 1) as usize));

        // The first `Available` extent is entirely free.
        for i in 0..4 {
            assert!(!fa.test_bit((base_frame + i) as usize));
        }

        // The gap (implicitly reserved, then explicitly `Reserved`) stays used.
        for i in 4..8 {
            assert!(fa.test_bit((base_frame + i) as usize));
        }

        // The second `Available` extent is entirely free.
        for i in 8..12 {
            assert!(!fa.test_bit((base_frame + i) as usize));
        }

        assert_eq!(fa.free_pages(), 8);
    }

    #[test]
    fn init_from_map_clamps_to_managed_memory_cap() {
        let past_cap = config::MAX_MANAGED_MEMORY_BYTES;
        let map = Map::from_entries([MapEntry {
            extent: PhysExtent::from_raw(config::BIOS_REGION_END, past_cap * 2),
            mem_type: MemoryType::Available,
        }]);

        let mut fa = FrameAllocator::new(RecordingPanicSink::new());
        fa.init_from_map(&map);

        let before = fa.free_pages();
        fa.free_page(PhysAddress::from_raw(past_cap));
        assert_eq!(fa.free_pages(), before);
    }

    use proptest::prelude::*;

    proptest! {
        #[test]
        fn frame_states_partition(num_allocs in 1usize..200) {
            let mut fa = allocator();
            let total_free = fa.free_pages();
            prop_assume!((num_allocs as u64) <= total_free);

            let mut allocated = std::vec::Vec::new();
            for _ in 0..num_allocs {
                allocated.push(fa.alloc_page());
            }

            prop_assert_eq!(fa.free_pages() + num_allocs as u64, total_free);

            let mut uniq = allocated.clone();
            uniq.sort_by_key(|a| a.as_raw());
            uniq.dedup();
            prop_assert_eq!(uniq.len(), allocated.len());

            for p in allocated {
                fa.free_page(p);
            }
            prop_assert_eq!(fa.free_pages(), total_free);
        }
    }
}
