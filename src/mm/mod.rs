//! The kernel-facing entry points into the memory subsystem.
//!
//! This module owns the one process-wide [`MemorySubsystem`] instance and
//! exposes it as a flat set of `#[no_mangle] extern "C" fn` wrappers, so the
//! boot-assembly entry stub or any future C-ABI caller can reach the memory
//! subsystem by symbol name alongside ordinary Rust callers in this crate.
//! Everything here is a thin forwarding layer: all the real logic lives in
//! `shared::memory`. None of `PhysAddress`/`VirtAddress`/`PageFlags`/
//! `MapError`/`FaultErrorCode`/`Map` carry a `#[repr(C)]` all the way down,
//! so the compiler's `improper_ctypes_definitions` lint is silenced here;
//! this crate is the only caller today and treats these shapes as its ABI.

#![allow(improper_ctypes_definitions)]

use shared::memory::addr::{PhysAddress, VirtAddress};
use shared::memory::pager::{FaultErrorCode, IdentityMappedMemory, MapError, PageFlags};
use shared::memory::subsystem::MemorySubsystem;
use shared::memory::Map;
use shared::panic_sink::HaltingPanicSink;

use spin::Once;

type Subsystem = MemorySubsystem<HaltingPanicSink, IdentityMappedMemory>;

static SUBSYSTEM: Once<Subsystem> = Once::new();

fn subsystem() -> &'static Subsystem {
    SUBSYSTEM
        .get()
        .expect("memory subsystem used before memory_init")
}

/// Brings up the frame allocator, pager, kernel heap, and virtual-range
/// allocator from a single `mem_bytes` hint. Must be called exactly once,
/// before any other function in this module.
#[no_mangle]
pub extern "C" fn memory_init(mem_bytes: u64) {
    let subsystem = SUBSYSTEM.call_once(|| MemorySubsystem::new(HaltingPanicSink, IdentityMappedMemory));
    subsystem.init(mem_bytes);
}

/// As [`memory_init`], but seeds the frame allocator from the `Available`
/// extents of a bootloader-supplied memory map instead of taking one
/// `mem_bytes` hint.
#[no_mangle]
pub extern "C" fn memory_init_from_map(map: &Map) {
    let subsystem = SUBSYSTEM.call_once(|| MemorySubsystem::new(HaltingPanicSink, IdentityMappedMemory));
    subsystem.init_from_map(map);
}

#[no_mangle]
pub extern "C" fn frame_alloc() -> PhysAddress {
    subsystem().frame_alloc()
}

#[no_mangle]
pub extern "C" fn frame_free(frame: PhysAddress) {
    subsystem().frame_free(frame)
}

#[no_mangle]
pub extern "C" fn map_page(virt: VirtAddress, phys: PhysAddress, flags: PageFlags) -> Result<(), MapError> {
    subsystem().map_page(virt, phys, flags)
}

#[no_mangle]
pub extern "C" fn unmap_page(virt: VirtAddress) {
    subsystem().unmap_page(virt)
}

#[no_mangle]
pub extern "C" fn get_mapping(virt: VirtAddress) -> u32 {
    subsystem().get_mapping(virt)
}

/// Routes a vector-14 trap here. The external trap-vector layer is
/// responsible for decoding `cr2` and the hardware error code into
/// `fault_addr`/`error_code` before calling in.
#[no_mangle]
pub extern "C" fn page_fault(fault_addr: VirtAddress, error_code: FaultErrorCode) -> ! {
    subsystem().page_fault(fault_addr, error_code)
}

#[no_mangle]
pub extern "C" fn kmalloc(n: u64) -> *mut u8 {
    subsystem().kmalloc(n)
}

/// # Safety
///
/// `ptr` must be null or a pointer previously returned by [`kmalloc`] that
/// has not since been freed.
#[no_mangle]
pub unsafe extern "C" fn kfree(ptr: *mut u8) {
    unsafe { subsystem().kfree(ptr) }
}

/// # Safety
///
/// `ptr` must be null or a pointer previously returned by [`kmalloc`].
#[no_mangle]
pub unsafe extern "C" fn ksize(ptr: *mut u8) -> u64 {
    unsafe { subsystem().ksize(ptr) }
}

#[no_mangle]
pub extern "C" fn kbrk(new: *mut u8) -> *mut u8 {
    subsystem().kbrk(new)
}

#[no_mangle]
pub extern "C" fn vmalloc(n: u64) -> *mut u8 {
    subsystem().vmalloc(n)
}

/// # Safety
///
/// `ptr` must be null or a pointer previously returned by [`vmalloc`] or
/// [`vbrk`] that has not since been freed.
#[no_mangle]
pub unsafe extern "C" fn vfree(ptr: *mut u8) {
    unsafe { subsystem().vfree(ptr) }
}

/// # Safety
///
/// `ptr` must be null or a pointer previously returned by [`vmalloc`] or
/// [`vbrk`].
#[no_mangle]
pub unsafe extern "C" fn vsize(ptr: *mut u8) -> u64 {
    unsafe { subsystem().vsize(ptr) }
}

#[no_mangle]
pub extern "C" fn vbrk(new: *mut u8) -> *mut u8 {
    subsystem().vbrk(new)
}
