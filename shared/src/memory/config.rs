//! Compile-time layout of the virtual address space.
//!
//! The exact numeric values are deployment parameters, not invariants: the
//! only thing that actually matters is that the kernel zone sits below the
//! user zone, that the BIOS region is never handed out, and that user-zone
//! pages carry the user-accessible flag while kernel-zone pages do not.

use super::addr::{PhysAddress, VirtAddress};
use super::page::PAGE_SIZE;

/// Below this, every access is fatal: BIOS data area and low memory.
pub const BIOS_REGION_END: u64 = 0x0010_0000;

/// End of the kernel zone (exclusive upper bound is `KERNEL_ZONE_END + 1`).
/// Everything at or above `USER_ZONE_START` is user-accessible; everything
/// below is supervisor-only.
pub const KERNEL_ZONE_END: u64 = 0x3FFF_FFFF;

pub const KHEAP_START: u64 = 0x0040_0000;
pub const KHEAP_SIZE: u64 = 4 * 1024 * 1024;
pub const KHEAP_END: u64 = KHEAP_START + KHEAP_SIZE - 1;

pub const KVMEM_START: u64 = KHEAP_END + 1;
pub const KVMEM_SIZE: u64 = 4 * 1024 * 1024;
pub const KVMEM_END: u64 = KVMEM_START + KVMEM_SIZE - 1;

pub const USER_ZONE_START: u64 = KERNEL_ZONE_END + 1;
pub const USER_ZONE_END: u64 = 0xFFFF_FFFF;

pub const VMEM_START: u64 = USER_ZONE_START;
pub const VMEM_SIZE: u64 = 16 * 1024 * 1024;
pub const VMEM_END: u64 = VMEM_START + VMEM_SIZE - 1;

/// Upper bound on physical memory this kernel will ever track, regardless of
/// what the bootloader reports. Keeps the frame bitmap a fixed compile-time
/// size.
pub const MAX_MANAGED_MEMORY_BYTES: u64 = 10 * 1024 * 1024;

/// Minimum `mem_bytes` hint accepted from the bootloader.
pub const MIN_MEM_BYTES: u64 = 1024 * 1024;
/// Maximum `mem_bytes` hint accepted from the bootloader.
pub const MAX_MEM_BYTES: u64 = 1024 * 1024 * 1024;
/// Used when the bootloader does not supply a hint at all.
pub const DEFAULT_MEM_BYTES: u64 = 10 * 1024 * 1024;

/// Extra space beyond the BIOS region reserved for the kernel image, its
/// page tables, and other boot-time structures. Frames in this range are
/// marked used at `FrameAllocator::init` and never handed out.
pub const KERNEL_IMAGE_RESERVED_BYTES: u64 = 1024 * 1024;

/// How much of physical memory the pager identity-maps at `Pager::init`,
/// before the kernel heap has even been stood up. Must cover the BIOS
/// region, the kernel image reservation, and the kernel heap.
pub const IDENTITY_MAP_BYTES: u64 = BIOS_REGION_END + KERNEL_IMAGE_RESERVED_BYTES + KHEAP_SIZE;

pub const fn kheap_start() -> VirtAddress {
    VirtAddress::from_raw(KHEAP_START)
}

pub const fn kheap_end() -> VirtAddress {
    VirtAddress::from_raw(KHEAP_END)
}

pub const fn vmem_start() -> VirtAddress {
    VirtAddress::from_raw(VMEM_START)
}

pub const fn vmem_end() -> VirtAddress {
    VirtAddress::from_raw(VMEM_END)
}

pub const fn user_zone_start() -> VirtAddress {
    VirtAddress::from_raw(USER_ZONE_START)
}

pub const fn bios_region_end() -> PhysAddress {
    PhysAddress::from_raw(BIOS_REGION_END)
}

static_assertions::const_assert!(KHEAP_START >= BIOS_REGION_END);
static_assertions::const_assert!(KHEAP_END < KVMEM_START);
static_assertions::const_assert!(KVMEM_END <= KERNEL_ZONE_END);
static_assertions::const_assert!(USER_ZONE_START == KERNEL_ZONE_END + 1);
static_assertions::const_assert!(VMEM_END <= USER_ZONE_END);
static_assertions::const_assert!(KHEAP_START % PAGE_SIZE.as_raw() == 0);
static_assertions::const_assert!(VMEM_START % PAGE_SIZE.as_raw() == 0);
