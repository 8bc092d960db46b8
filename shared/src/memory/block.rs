//! The block header shared by the kernel heap and the virtual-range
//! allocator: a sorted singly linked free list, with a magic sentinel at
//! each node distinguishing "currently allocated" from "recently freed"
//! (and anything else from corruption).
//!
//! Per the "raw pointer graphs → typed arena indices" design note, a block
//! is addressed through a `NonNull<Header>` tied to the allocator's backing
//! range rather than a bare pointer, so "this pointer was produced by me"
//! is closer to a type-level fact.

use core::mem::size_of;
use core::ptr::NonNull;

pub const MAGIC_ALLOCATED: u32 = 0xDEAD_BEEF;
pub const MAGIC_FREED: u32 = 0xFEEE_D000;

/// Minimum leftover size (beyond a fresh header) a split must leave behind;
/// below this a split would create an unusably small fragment.
pub const MIN_SPLIT_RESIDUAL: u64 = 16;

#[repr(C, align(8))]
pub struct Header {
    /// User-requested payload size in bytes (KH), or a VA block's
    /// originally-requested size distinct from its page-aligned capacity.
    pub size: u64,
    pub free: bool,
    pub magic: u32,
    pub next: Option<NonNull<Header>>,
    /// Only meaningful for VA blocks: the page-aligned capacity backing
    /// this block, which may exceed `size`.
    pub capacity: u64,
}

static_assertions::const_assert!(size_of::<Header>() % 8 == 0);

impl Header {
    pub fn is_allocated(&self) -> bool {
        self.magic == MAGIC_ALLOCATED
    }

    pub fn is_freed(&self) -> bool {
        self.magic == MAGIC_FREED
    }

    /// The address just past this block's storage (header + capacity, or
    /// header + size when capacity is unused).
    pub unsafe fn end_addr(header: NonNull<Header>, extent: u64) -> usize {
        header.as_ptr() as usize + size_of::<Header>() + extent as usize
    }

    pub unsafe fn payload_ptr(header: NonNull<Header>) -> *mut u8 {
        (header.as_ptr() as *mut u8).add(size_of::<Header>())
    }

    pub unsafe fn from_payload_ptr(ptr: *mut u8) -> NonNull<Header> {
        NonNull::new_unchecked(ptr.sub(size_of::<Header>()) as *mut Header)
    }
}

pub const HEADER_SIZE: u64 = size_of::<Header>() as u64;

pub fn round_up_8(n: u64) -> u64 {
    (n + 7) & !7
}
