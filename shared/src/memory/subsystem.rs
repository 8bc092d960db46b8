//! The memory subsystem facade: wires the frame allocator, pager, kernel
//! heap, and virtual-range allocator together behind one `spin::Mutex` per
//! component, and sequences their init order. Everything the kernel crate
//! calls across the FFI boundary goes through here rather than touching any
//! one allocator directly.

use spin::Mutex;

use crate::memory::addr::{PhysAddress, VirtAddress};
use crate::memory::config;
use crate::memory::frame_alloc::FrameAllocator;
use crate::memory::kheap::KernelHeap;
use crate::memory::page::PAGE_SIZE;
use crate::memory::pager::{FaultErrorCode, IdentityMappedMemory, MapError, PageFlags, Pager, PhysicalMemory};
use crate::memory::vmem::VirtualRangeAllocator;
use crate::memory::Map;
use crate::panic_sink::PanicSink;

pub struct MemorySubsystem<Sink: PanicSink + Clone, Mem: PhysicalMemory = IdentityMappedMemory> {
    fa: Mutex<FrameAllocator<Sink>>,
    pg: Mutex<Pager<Sink, Mem>>,
    kh: Mutex<KernelHeap<Sink>>,
    va: Mutex<VirtualRangeAllocator<Sink>>,
}

impl<Sink: PanicSink + Clone, Mem: PhysicalMemory> MemorySubsystem<Sink, Mem> {
    pub fn new(sink: Sink, mem: Mem) -> Self {
        MemorySubsystem {
            fa: Mutex::new(FrameAllocator::new(sink.clone())),
            pg: Mutex::new(Pager::new(sink.clone(), mem)),
            kh: Mutex::new(KernelHeap::new(sink.clone())),
            va: Mutex::new(VirtualRangeAllocator::new(sink)),
        }
    }

    /// Brings every component up in dependency order: frames first (the
    /// pager needs them for page tables), then the pager and its identity
    /// mapping (the kernel heap needs the range it will live in mapped),
    /// then the kernel heap and virtual-range region.
    pub fn init(&self, mem_bytes: u64) {
        let mem_bytes = mem_bytes.clamp(config::MIN_MEM_BYTES, config::MAX_MEM_BYTES);
        self.fa.lock().init(mem_bytes);
        self.init_rest();
    }

    /// As [`Self::init`], but seeds the frame allocator from the
    /// `Available` extents of a bootloader-supplied memory map
    /// individually, instead of collapsing them into one contiguous
    /// range — a real map may report available memory both below and
    /// above a reserved gap (MMIO, ACPI tables, etc.), and those holes
    /// must not be handed out as free frames.
    pub fn init_from_map(&self, map: &Map) {
        self.fa.lock().init_from_map(map);
        self.init_rest();
    }

    fn init_rest(&self) {
        let mut fa = self.fa.lock();

        let mut pg = self.pg.lock();
        let directory_frame = fa.alloc_page();
        pg.init(&mut fa, directory_frame);
        pg.enable();

        for i in 0..(config::KHEAP_SIZE / PAGE_SIZE.as_raw()) {
            let virt = VirtAddress::from_raw(config::KHEAP_START + i * PAGE_SIZE.as_raw());
            let phys = fa.alloc_page();
            pg.map_page(&mut fa, virt, phys, PageFlags::PRESENT | PageFlags::WRITABLE)
                .unwrap_or_else(|_| panic!("out of frames mapping kernel heap"));
        }

        let mut kh = self.kh.lock();
        unsafe { kh.init(config::kheap_start(), config::KHEAP_SIZE) };

        let mut va = self.va.lock();
        va.init(config::vmem_start(), config::vmem_end());

        log::info!(
            "memory subsystem ready: {} frames free, kernel heap {} KiB, vmem region {} MiB",
            fa.free_pages(),
            config::KHEAP_SIZE / 1024,
            config::VMEM_SIZE / (1024 * 1024),
        );
    }

    pub fn frame_alloc(&self) -> PhysAddress {
        self.fa.lock().alloc_page()
    }

    pub fn frame_free(&self, frame: PhysAddress) {
        self.fa.lock().free_page(frame)
    }

    pub fn map_page(&self, virt: VirtAddress, phys: PhysAddress, flags: PageFlags) -> Result<(), MapError> {
        let mut fa = self.fa.lock();
        self.pg.lock().map_page(&mut fa, virt, phys, flags)
    }

    pub fn unmap_page(&self, virt: VirtAddress) {
        self.pg.lock().unmap_page(virt)
    }

    pub fn get_mapping(&self, virt: VirtAddress) -> u32 {
        self.pg.lock().get_mapping(virt)
    }

    pub fn page_fault(&self, fault_addr: VirtAddress, error_code: FaultErrorCode) -> ! {
        self.pg.lock().fault_handler(fault_addr, error_code)
    }

    pub fn kmalloc(&self, n: u64) -> *mut u8 {
        self.kh.lock().alloc(n)
    }

    /// # Safety
    ///
    /// `ptr` must be null or a pointer previously returned by
    /// [`Self::kmalloc`] that has not since been freed.
    pub unsafe fn kfree(&self, ptr: *mut u8) {
        unsafe { self.kh.lock().free(ptr) }
    }

    /// # Safety
    ///
    /// `ptr` must be null or a pointer previously returned by
    /// [`Self::kmalloc`].
    pub unsafe fn ksize(&self, ptr: *mut u8) -> u64 {
        unsafe { self.kh.lock().size(ptr) }
    }

    pub fn kbrk(&self, new: *mut u8) -> *mut u8 {
        self.kh.lock().kbrk(new)
    }

    pub fn vmalloc(&self, n: u64) -> *mut u8 {
        let mut fa = self.fa.lock();
        let mut pg = self.pg.lock();
        self.va.lock().alloc(&mut fa, &mut pg, n)
    }

    /// # Safety
    ///
    /// `ptr` must be null or a pointer previously returned by
    /// [`Self::vmalloc`] or [`Self::vbrk`] that has not since been freed.
    pub unsafe fn vfree(&self, ptr: *mut u8) {
        unsafe { self.va.lock().free(ptr) }
    }

    /// # Safety
    ///
    /// `ptr` must be null or a pointer previously returned by
    /// [`Self::vmalloc`] or [`Self::vbrk`].
    pub unsafe fn vsize(&self, ptr: *mut u8) -> u64 {
        unsafe { self.va.lock().size(ptr) }
    }

    pub fn vbrk(&self, new: *mut u8) -> *mut u8 {
        let mut fa = self.fa.lock();
        let mut pg = self.pg.lock();
        self.va.lock().brk(&mut fa, &mut pg, new)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::pager::test_support::FakePhysicalMemory;
    use crate::panic_sink::test_support::RecordingPanicSink;

    // `init_common` maps the kernel heap and vmem region at their real,
    // fixed virtual addresses (low physical-memory-range values on a real
    // machine, not valid host pointers). So these tests wire up the
    // subsystem's pieces directly, the same way the individual allocators'
    // own tests do, using host-backed buffers in place of the fixed
    // addresses `config` names.
    const KHEAP_SIZE: u64 = 64 * 1024;
    const VMEM_SIZE: u64 = 64 * 1024;

    fn setup() -> (
        MemorySubsystem<RecordingPanicSink, FakePhysicalMemory>,
        std::vec::Vec<u8>,
        std::vec::Vec<u8>,
    ) {
        let subsystem = MemorySubsystem::new(RecordingPanicSink::new(), FakePhysicalMemory::new());

        {
            let mut fa = subsystem.fa.lock();
            fa.init(4 * 1024 * 1024);
            let mut pg = subsystem.pg.lock();
            let directory_frame = fa.alloc_page();
            pg.init(&mut fa, directory_frame);
        }

        let mut kheap_backing = std::vec![0u8; KHEAP_SIZE as usize];
        let kheap_base = VirtAddress::from_raw(kheap_backing.as_mut_ptr() as u64);
        unsafe { subsystem.kh.lock().init(kheap_base, KHEAP_SIZE) };

        let mut vmem_backing = std::vec![0u8; VMEM_SIZE as usize];
        let vmem_start = VirtAddress::from_raw(vmem_backing.as_mut_ptr() as u64);
        let vmem_end = VirtAddress::from_raw(vmem_backing.as_mut_ptr() as u64 + VMEM_SIZE - 1);
        subsystem.va.lock().init(vmem_start, vmem_end);

        (subsystem, kheap_backing, vmem_backing)
    }

    #[test]
    fn frame_alloc_and_free_round_trip_through_the_facade() {
        let (subsystem, _kh, _vm) = setup();
        let before = subsystem.fa.lock().free_pages();

        let frame = subsystem.frame_alloc();
        assert_eq!(subsystem.fa.lock().free_pages(), before - 1);

        subsystem.frame_free(frame);
        assert_eq!(subsystem.fa.lock().free_pages(), before);
    }

    #[test]
    fn map_page_then_get_mapping_then_unmap_through_the_facade() {
        let (subsystem, _kh, _vm) = setup();
        let virt = VirtAddress::from_raw(0x1000_0000);
        let phys = subsystem.frame_alloc();

        subsystem
            .map_page(virt, phys, PageFlags::PRESENT | PageFlags::WRITABLE)
            .unwrap();
        assert!(subsystem.get_mapping(virt) & PageFlags::PRESENT.bits() != 0);

        subsystem.unmap_page(virt);
        assert_eq!(subsystem.get_mapping(virt), 0);
    }

    #[test]
    fn kmalloc_write_verify_free_through_the_facade() {
        let (subsystem, _kh, _vm) = setup();
        let p = subsystem.kmalloc(64);
        assert!(!p.is_null());
        unsafe { *(p as *mut u32) = 7 };
        assert_eq!(unsafe { *(p as *mut u32) }, 7);
        assert_eq!(unsafe { subsystem.ksize(p) }, 64);
        unsafe { subsystem.kfree(p) };
        assert_eq!(unsafe { subsystem.ksize(p) }, 0);
    }

    #[test]
    fn kbrk_moves_break_through_the_facade() {
        let (subsystem, _kh, _vm) = setup();
        let wm = subsystem.kbrk(core::ptr::null_mut());
        let target = unsafe { wm.add(64) };
        assert_eq!(subsystem.kbrk(target), target);
        assert_eq!(subsystem.kbrk(core::ptr::null_mut()), target);
    }

    #[test]
    fn vmalloc_write_verify_free_through_the_facade() {
        let (subsystem, _kh, _vm) = setup();
        let p = subsystem.vmalloc(128);
        assert!(!p.is_null());
        unsafe { *(p as *mut u32) = 99 };
        assert_eq!(unsafe { *(p as *mut u32) }, 99);
        assert_eq!(unsafe { subsystem.vsize(p) }, 128);
        unsafe { subsystem.vfree(p) };
        assert_eq!(unsafe { subsystem.vsize(p) }, 0);
    }

    #[test]
    #[should_panic(expected = "double free")]
    fn kfree_double_free_is_fatal_through_the_facade() {
        let (subsystem, _kh, _vm) = setup();
        let p = subsystem.kmalloc(32);
        unsafe { subsystem.kfree(p) };
        unsafe { subsystem.kfree(p) };
    }

    #[test]
    fn page_fault_below_bios_region_is_fatal_through_the_facade() {
        let (subsystem, _kh, _vm) = setup();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            subsystem.page_fault(VirtAddress::from_raw(0x1000), FaultErrorCode::empty());
        }));
        assert!(result.is_err());
    }
}
