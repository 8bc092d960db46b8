//! Two-level 32-bit paging: one page directory, up to 1024 page tables of
//! 1024 entries each, no PAE. Page tables are allocated lazily from the
//! frame allocator the first time their 4 MiB region is touched and are
//! never freed once promoted.

use bitflags::bitflags;

use crate::memory::addr::{PhysAddress, VirtAddress};
use crate::memory::config;
use crate::memory::frame_alloc::FrameAllocator;
use crate::memory::page::PAGE_SIZE;
use crate::panic_sink::PanicSink;

bitflags! {
    /// The flags vocabulary from the boot hand-off contract: low 3 bits of
    /// a page-table entry.
    #[derive(Clone, Copy, Debug, Eq, PartialEq)]
    pub struct PageFlags: u32 {
        const PRESENT = 0b001;
        const WRITABLE = 0b010;
        const USER_ACCESSIBLE = 0b100;
    }
}

#[derive(Debug, Eq, PartialEq)]
pub enum MapError {
    /// The frame allocator had no frame to promote a new page table.
    OutOfFrames,
}

/// Abstraction over "read/write the 4 KiB backing a frame" so the pager's
/// logic is testable on a host target. On real hardware, once `init` has
/// identity-mapped the kernel zone, a physical address there is also a
/// valid virtual address and the production impl just casts the pointer.
///
/// # Safety
///
/// Implementations must return a pointer to exactly the 4 KiB of storage
/// backing `phys`, valid for as long as the frame is in use as a page
/// table.
pub unsafe trait PhysicalMemory {
    unsafe fn frame_table(&mut self, phys: PhysAddress) -> *mut [u32; 1024];
}

/// Production impl: valid once the identity mapping from `Pager::init`
/// covers `phys`.
pub struct IdentityMappedMemory;

unsafe impl PhysicalMemory for IdentityMappedMemory {
    unsafe fn frame_table(&mut self, phys: PhysAddress) -> *mut [u32; 1024] {
        phys.as_raw() as usize as *mut [u32; 1024]
    }
}

/// Classification of a page fault, per the first-match-wins table.
#[derive(Debug, Eq, PartialEq)]
pub enum FaultKind {
    BiosMemory,
    UserAccessToKernelSpace,
    UserAccessToSupervisorPage,
    Generic,
}

bitflags! {
    #[derive(Clone, Copy, Debug, Eq, PartialEq)]
    pub struct FaultErrorCode: u32 {
        const PRESENT = 1 << 0;
        const WRITE = 1 << 1;
        const USER = 1 << 2;
        const RESERVED_WRITE = 1 << 3;
        const INSTRUCTION_FETCH = 1 << 4;
    }
}

pub struct Pager<Sink, Mem = IdentityMappedMemory> {
    directory: [u32; 1024],
    directory_phys: PhysAddress,
    mem: Mem,
    sink: Sink,
}

impl<Sink: PanicSink, Mem: PhysicalMemory> Pager<Sink, Mem> {
    pub const fn new(sink: Sink, mem: Mem) -> Self {
        Pager {
            directory: [0; 1024],
            directory_phys: PhysAddress::from_raw(0),
            mem,
            sink,
        }
    }

    /// Zeroes the page directory, identity-maps
    /// `[0, IDENTITY_MAP_BYTES)` with `{present, writable}`, and (in
    /// production) loads the directory into `cr3`. `directory_phys` is the
    /// physical address the caller promises the directory itself lives
    /// at — on a host build this is a stand-in, not a real load target.
    pub fn init(&mut self, fa: &mut FrameAllocator<Sink>, directory_phys: PhysAddress) {
        self.directory = [0; 1024];
        self.directory_phys = directory_phys;

        let identity_pages = config::IDENTITY_MAP_BYTES.div_ceil(PAGE_SIZE.as_raw());
        for i in 0..identity_pages {
            let addr = VirtAddress::from_raw(i * PAGE_SIZE.as_raw());
            let phys = PhysAddress::from_raw(i * PAGE_SIZE.as_raw());
            self.map_page_with(fa, addr, phys, PageFlags::PRESENT | PageFlags::WRITABLE)
                .unwrap_or_else(|_| fatal!(self.sink, "out of frames mapping identity region"));
        }
    }

    /// Sets the paging-enable bit. On non-x86 test builds this is a no-op
    /// placeholder; the invariant it establishes (every subsequent memory
    /// access goes through this directory) is exercised purely in-memory
    /// by the other methods regardless.
    pub fn enable(&mut self) {
        #[cfg(target_arch = "x86")]
        unsafe {
            crate::arch::load_page_directory(self.directory_phys.as_raw() as u32);
            crate::arch::enable_paging();
        }
    }

    fn dir_index(virt: VirtAddress) -> usize {
        ((virt.as_raw() >> 22) & 0x3FF) as usize
    }

    fn table_index(virt: VirtAddress) -> usize {
        ((virt.as_raw() >> 12) & 0x3FF) as usize
    }

    /// Ensures a page table exists for `virt`'s 4 MiB region, allocating
    /// and zeroing a fresh frame from `fa` on first use, and returns a
    /// pointer to its 1024 entries.
    fn table_for(
        &mut self,
        fa: &mut FrameAllocator<Sink>,
        virt: VirtAddress,
    ) -> Result<*mut [u32; 1024], MapError> {
        let dir_idx = Self::dir_index(virt);
        let dir_entry = self.directory[dir_idx];

        let table_phys = if dir_entry & PageFlags::PRESENT.bits() != 0 {
            PhysAddress::from_raw((dir_entry & 0xFFFF_F000) as u64)
        } else {
            let frame = fa.alloc_page();
            let table = unsafe { self.mem.frame_table(frame) };
            unsafe {
                (*table) = [0; 1024];
            }
            let user = if virt.as_raw() >= config::USER_ZONE_START {
                PageFlags::USER_ACCESSIBLE
            } else {
                PageFlags::empty()
            };
            self.directory[dir_idx] =
                (frame.as_raw() as u32 & 0xFFFF_F000)
                    | (PageFlags::PRESENT | PageFlags::WRITABLE | user).bits();
            frame
        };

        Ok(unsafe { self.mem.frame_table(table_phys) })
    }

    /// Maps `virt` to `phys` with `flags`. Overwrites any existing mapping
    /// silently (last writer wins).
    pub fn map_page(
        &mut self,
        fa: &mut FrameAllocator<Sink>,
        virt: VirtAddress,
        phys: PhysAddress,
        flags: PageFlags,
    ) -> Result<(), MapError> {
        self.map_page_with(fa, virt, phys, flags)
    }

    fn map_page_with(
        &mut self,
        fa: &mut FrameAllocator<Sink>,
        virt: VirtAddress,
        phys: PhysAddress,
        flags: PageFlags,
    ) -> Result<(), MapError> {
        let table = self.table_for(fa, virt)?;
        let idx = Self::table_index(virt);
        let entry = (phys.as_raw() as u32 & 0xFFFF_F000)
            | (flags.bits() & 0xFFF)
            | PageFlags::PRESENT.bits();
        unsafe {
            (*table)[idx] = entry;
        }
        Ok(())
    }

    /// Zeroes the page-table entry if present. The caller must reload
    /// `cr3` (or call [`crate::arch::flush_tlb`]) before assuming the old
    /// mapping is gone.
    pub fn unmap_page(&mut self, virt: VirtAddress) {
        let dir_idx = Self::dir_index(virt);
        if self.directory[dir_idx] & PageFlags::PRESENT.bits() == 0 {
            return;
        }
        let table_phys = PhysAddress::from_raw((self.directory[dir_idx] & 0xFFFF_F000) as u64);
        let table = unsafe { self.mem.frame_table(table_phys) };
        let idx = Self::table_index(virt);
        unsafe {
            (*table)[idx] = 0;
        }
    }

    /// Read-only lookup; 0 if not present.
    pub fn get_mapping(&mut self, virt: VirtAddress) -> u32 {
        let dir_idx = Self::dir_index(virt);
        if self.directory[dir_idx] & PageFlags::PRESENT.bits() == 0 {
            return 0;
        }
        let table_phys = PhysAddress::from_raw((self.directory[dir_idx] & 0xFFFF_F000) as u64);
        let table = unsafe { self.mem.frame_table(table_phys) };
        let idx = Self::table_index(virt);
        unsafe { (*table)[idx] }
    }

    /// Classifies and reports a page fault. Every path is fatal: this
    /// kernel does not do demand paging.
    pub fn fault_handler(&mut self, fault_addr: VirtAddress, error_code: FaultErrorCode) -> ! {
        let kind = self.classify_fault(fault_addr, error_code);
        match kind {
            FaultKind::BiosMemory => fatal!(self.sink, "access to BIOS memory"),
            FaultKind::UserAccessToKernelSpace => {
                fatal!(self.sink, "user access to kernel space")
            }
            FaultKind::UserAccessToSupervisorPage => {
                fatal!(self.sink, "user access to supervisor-only page")
            }
            FaultKind::Generic => fatal!(self.sink, "page fault (error code {:?})", error_code),
        }
    }

    fn classify_fault(&mut self, fault_addr: VirtAddress, error_code: FaultErrorCode) -> FaultKind {
        if fault_addr.as_raw() < config::BIOS_REGION_END {
            return FaultKind::BiosMemory;
        }

        let user_mode = error_code.contains(FaultErrorCode::USER);

        if user_mode && fault_addr.as_raw() < config::USER_ZONE_START {
            return FaultKind::UserAccessToKernelSpace;
        }

        if user_mode {
            let entry = self.get_mapping(fault_addr);
            let present = entry & PageFlags::PRESENT.bits() != 0;
            let user_accessible = entry & PageFlags::USER_ACCESSIBLE.bits() != 0;
            if present && !user_accessible {
                return FaultKind::UserAccessToSupervisorPage;
            }
        }

        FaultKind::Generic
    }
}

/// Test-only stand-ins shared by this module's tests and by the
/// allocators layered on top of the pager.
#[cfg(test)]
pub mod test_support {
    use super::{PhysAddress, PhysicalMemory, PAGE_SIZE};
    use std::boxed::Box;
    use std::vec::Vec;

    /// A `Vec<[u32; 1024]>`-backed stand-in for physical memory, indexed by
    /// frame number. Lets tests exercise the pager (and anything built on
    /// it) without real hardware or a real identity mapping.
    pub struct FakePhysicalMemory {
        frames: Vec<Box<[u32; 1024]>>,
    }

    impl FakePhysicalMemory {
        pub fn new() -> Self {
            FakePhysicalMemory { frames: Vec::new() }
        }
    }

    unsafe impl PhysicalMemory for FakePhysicalMemory {
        unsafe fn frame_table(&mut self, phys: PhysAddress) -> *mut [u32; 1024] {
            let idx = (phys.as_raw() / PAGE_SIZE.as_raw()) as usize;
            while self.frames.len() <= idx {
                self.frames.push(Box::new([0u32; 1024]));
            }
            self.frames[idx].as_mut() as *mut [u32; 1024]
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::panic_sink::test_support::RecordingPanicSink;
    use test_support::FakePhysicalMemory;

    fn setup() -> (
        FrameAllocator<RecordingPanicSink>,
        Pager<RecordingPanicSink, FakePhysicalMemory>,
    ) {
        let mut fa = FrameAllocator::new(RecordingPanicSink::new());
        fa.init(4 * 1024 * 1024);
        let mut pager = Pager::new(RecordingPanicSink::new(), FakePhysicalMemory::new());
        pager.init(&mut fa, PhysAddress::from_raw(0x1000));
        (fa, pager)
    }

    #[test]
    fn map_then_get_mapping_then_unmap() {
        let (mut fa, mut pager) = setup();
        let virt = VirtAddress::from_raw(0x1000_0000);
        let phys = fa.alloc_page();

        pager
            .map_page(&mut fa, virt, phys, PageFlags::PRESENT | PageFlags::WRITABLE)
            .unwrap();

        let entry = pager.get_mapping(virt);
        assert_eq!(entry & 0xFFFF_F000, phys.as_raw() as u32 & 0xFFFF_F000);
        assert!(entry & PageFlags::PRESENT.bits() != 0);

        pager.unmap_page(virt);
        assert_eq!(pager.get_mapping(virt), 0);
    }

    #[test]
    fn map_over_existing_mapping_overwrites() {
        let (mut fa, mut pager) = setup();
        let virt = VirtAddress::from_raw(0x1000_0000);
        let phys1 = fa.alloc_page();
        let phys2 = fa.alloc_page();

        pager.map_page(&mut fa, virt, phys1, PageFlags::PRESENT).unwrap();
        pager.map_page(&mut fa, virt, phys2, PageFlags::PRESENT).unwrap();

        let entry = pager.get_mapping(virt);
        assert_eq!(entry & 0xFFFF_F000, phys2.as_raw() as u32 & 0xFFFF_F000);
    }

    #[test]
    fn user_zone_page_table_is_user_accessible_but_pte_reflects_caller_flags() {
        let (mut fa, mut pager) = setup();
        let user_virt = VirtAddress::from_raw(config::USER_ZONE_START);
        let kernel_virt = VirtAddress::from_raw(config::KHEAP_START);
        let phys1 = fa.alloc_page();
        let phys2 = fa.alloc_page();

        pager
            .map_page(&mut fa, user_virt, phys1, PageFlags::PRESENT | PageFlags::USER_ACCESSIBLE)
            .unwrap();
        pager.map_page(&mut fa, kernel_virt, phys2, PageFlags::PRESENT).unwrap();

        assert!(pager.get_mapping(user_virt) & PageFlags::USER_ACCESSIBLE.bits() != 0);
        assert!(pager.get_mapping(kernel_virt) & PageFlags::USER_ACCESSIBLE.bits() == 0);

        let dir_idx = Pager::<RecordingPanicSink, FakePhysicalMemory>::dir_index(user_virt);
        assert!(pager.directory[dir_idx] & PageFlags::USER_ACCESSIBLE.bits() != 0);
    }

    #[test]
    #[should_panic(expected = "access to BIOS memory")]
    fn fault_below_bios_region_end_is_fatal() {
        let (_fa, mut pager) = setup();
        pager.fault_handler(VirtAddress::from_raw(0x1000), FaultErrorCode::empty());
    }

    #[test]
    #[should_panic(expected = "user access to kernel space")]
    fn user_fault_below_user_zone_is_fatal() {
        let (_fa, mut pager) = setup();
        pager.fault_handler(
            VirtAddress::from_raw(config::KHEAP_START),
            FaultErrorCode::USER,
        );
    }

    #[test]
    #[should_panic(expected = "user access to supervisor-only page")]
    fn user_fault_on_supervisor_page_is_fatal() {
        let (mut fa, mut pager) = setup();
        let virt = VirtAddress::from_raw(config::USER_ZONE_START + PAGE_SIZE.as_raw());
        let phys = fa.alloc_page();
        // Supervisor-only despite being in the user zone: caller omitted
        // USER_ACCESSIBLE from the requested flags, but `table_for` still
        // promotes the *table* as user-accessible since virt >= USER_ZONE_START.
        // The PTE itself carries exactly the flags the caller asked for.
        pager.map_page(&mut fa, virt, phys, PageFlags::PRESENT).unwrap();
        pager.fault_handler(virt, FaultErrorCode::USER | FaultErrorCode::PRESENT);
    }

    #[test]
    #[should_panic(expected = "page fault")]
    fn generic_fault_is_fatal() {
        let (_fa, mut pager) = setup();
        pager.fault_handler(
            VirtAddress::from_raw(config::USER_ZONE_START + 0x10_0000),
            FaultErrorCode::empty(),
        );
    }
}
