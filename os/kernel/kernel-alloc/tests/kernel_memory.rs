use kernel_alloc::{BootstrapMapper, HeapError, KernelMemory, PageSource, PhysicalFrameAllocator, StaticFrameStorage};
use kernel_info::boot::MemoryRegion;
use kernel_info::memory::KERNEL_HEAP_START;
use kernel_memory_addresses::{PhysicalAddress, PhysicalPage, VirtualAddress};
use kernel_sync::InterruptControl;
use kernel_sync::testing::SimulatedInterrupts;
use kernel_vmem::testing::{SimulatedMmu, SimulatedRam};
use kernel_vmem::{MapError, Mmu, PageFlags, PageTable, UnmapError};

const RAM_FRAMES: usize = 2048;
const POOL_BASE: u64 = 0x10_0000;

type Memory<'s> = KernelMemory<'s, &'s SimulatedRam, SimulatedMmu<'s>, SimulatedInterrupts>;

/// Usable memory sized so that `free` frames remain once the kernel space
/// has taken its root and shared L3.
fn regions(free: u64) -> [MemoryRegion; 2] {
    [
        MemoryRegion::available(0, 0x9_F000),
        MemoryRegion::available(POOL_BASE, (free + 2) * 4096),
    ]
}

fn boot<'s>(ram: &'s SimulatedRam, storage: &'s mut StaticFrameStorage<32>, free: u64) -> Memory<'s> {
    let frames = PhysicalFrameAllocator::new(storage.storage(), &regions(free), PhysicalAddress::new(POOL_BASE));
    let mmu = SimulatedMmu::new(ram, PhysicalPage::from_frame_number(0));
    KernelMemory::new(ram, mmu, SimulatedInterrupts::new(true), frames).unwrap()
}

fn user(va: u64) -> VirtualAddress {
    VirtualAddress::new(va)
}

#[test]
fn process_lifecycle_returns_every_frame() {
    let ram = SimulatedRam::new(RAM_FRAMES);
    let mut storage = StaticFrameStorage::new();
    let memory = boot(&ram, &mut storage, 1024);
    assert_eq!(memory.free_count(), 1024);

    let space = memory.create_address_space().unwrap();
    let pages = [
        0x1000,
        0x2000,
        0x20_0000,
        0x4000_0000,
        0x7F_FFFF_F000,
        0x80_0000_0000,
        0x1234_5000,
        0x7FFF_FFFF_F000,
        0x4000_0000_0000,
        0x10_0000,
    ];
    for va in pages {
        memory.map_anonymous(&space, user(va), PageFlags::KERNEL_DATA.user()).unwrap();
    }
    assert!(memory.free_count() < 1024 - 1 - pages.len());
    for va in pages {
        assert!(space.translate(user(va)).is_some(), "{va:#x} not mapped");
    }

    memory.destroy_address_space(space);
    assert_eq!(memory.free_count(), 1024);
}

#[test]
fn create_then_destroy_restores_the_count() {
    let ram = SimulatedRam::new(RAM_FRAMES);
    let mut storage = StaticFrameStorage::new();
    let memory = boot(&ram, &mut storage, 64);

    let space = memory.create_address_space().unwrap();
    assert_eq!(memory.free_count(), 63);
    memory.destroy_address_space(space);
    assert_eq!(memory.free_count(), 64);
}

#[test]
fn kernel_mappings_are_visible_in_every_space() {
    let ram = SimulatedRam::new(RAM_FRAMES);
    let mut storage = StaticFrameStorage::new();
    let memory = boot(&ram, &mut storage, 256);

    let a = memory.create_address_space().unwrap();
    let b = memory.create_address_space().unwrap();

    // Mapped after both spaces exist.
    let va = VirtualAddress::new(KERNEL_HEAP_START + 0x7000);
    let kernel = memory.kernel_space();
    let frame = memory.map_anonymous(&kernel, va, PageFlags::KERNEL_DATA).unwrap();

    assert_eq!(a.translate(va), Some(frame.base()));
    assert_eq!(b.translate(va), Some(frame.base()));
    assert_eq!(
        memory.map_page(&a, va + 0x1000, frame.base(), PageFlags::KERNEL_DATA),
        Err(MapError::KernelHalf)
    );

    memory.destroy_address_space(a);
    memory.destroy_address_space(b);
    assert_eq!(kernel.translate(va), Some(frame.base()));
}

#[test]
fn user_mappings_are_private() {
    let ram = SimulatedRam::new(RAM_FRAMES);
    let mut storage = StaticFrameStorage::new();
    let memory = boot(&ram, &mut storage, 256);

    let a = memory.create_address_space().unwrap();
    let b = memory.create_address_space().unwrap();
    let va = user(0x40_0000);

    memory.map_anonymous(&a, va, PageFlags::KERNEL_DATA.user()).unwrap();
    assert!(a.translate(va).is_some());
    assert_eq!(b.translate(va), None);
    assert_eq!(memory.kernel_space().translate(va), None);
}

#[test]
fn unmap_frees_the_frame() {
    let ram = SimulatedRam::new(RAM_FRAMES);
    let mut storage = StaticFrameStorage::new();
    let memory = boot(&ram, &mut storage, 64);

    let space = memory.create_address_space().unwrap();
    let va = user(0x5000);
    memory.map_anonymous(&space, va, PageFlags::KERNEL_DATA.user()).unwrap();
    let mapped = memory.free_count();

    memory.unmap_page(&space, va).unwrap();
    assert_eq!(memory.free_count(), mapped + 1);
    assert_eq!(memory.unmap_page(&space, va), Err(UnmapError::NotMapped));
    assert_eq!(memory.mmu().invalidations(), vec![va]);
}

#[test]
fn device_pages_survive_teardown() {
    let ram = SimulatedRam::new(RAM_FRAMES);
    let mut storage = StaticFrameStorage::new();
    let memory = boot(&ram, &mut storage, 64);

    let space = memory.create_address_space().unwrap();
    let va = user(0x1000);
    let vga = PhysicalAddress::new(0xB8000);
    memory.map_page(&space, va, vga, PageFlags::KERNEL_DATA.user()).unwrap();
    memory.unmap_page(&space, va).unwrap();
    memory.map_page(&space, va, vga, PageFlags::KERNEL_DATA.user()).unwrap();
    memory.map_anonymous(&space, user(0x2000), PageFlags::KERNEL_DATA.user()).unwrap();

    memory.destroy_address_space(space);
    assert_eq!(memory.free_count(), 64);
}

#[test]
fn anonymous_pages_are_zeroed() {
    let ram = SimulatedRam::new(RAM_FRAMES);
    let mut storage = StaticFrameStorage::new();
    let memory = boot(&ram, &mut storage, 64);

    let space = memory.create_address_space().unwrap();

    let dirty = memory.allocate_frame().unwrap();
    ram.fill_frame(dirty, 0xAA);
    memory.free_frame(dirty.base()).unwrap();

    // The most recently freed frame is handed out first.
    let frame = memory.map_anonymous(&space, user(0x9000), PageFlags::KERNEL_DATA.user()).unwrap();
    assert_eq!(frame, dirty);
    assert_eq!(ram.read_u64(frame.base()), 0);
    assert_eq!(ram.read_u64(frame.base() + 4088), 0);
}

#[test]
fn exhaustion_then_free_then_allocate() {
    let ram = SimulatedRam::new(RAM_FRAMES);
    let mut storage = StaticFrameStorage::new();
    let memory = boot(&ram, &mut storage, 8);

    let taken: Vec<_> = std::iter::from_fn(|| memory.allocate_frame()).collect();
    assert_eq!(taken.len(), 8);
    assert_eq!(memory.free_count(), 0);
    assert_eq!(memory.create_address_space().err(), Some(kernel_vmem::CreateError::OutOfMemory));

    memory.free_frame(taken[3].base()).unwrap();
    assert_eq!(memory.allocate_frame(), Some(taken[3]));
}

#[test]
fn destroying_the_active_space_switches_to_the_kernel() {
    let ram = SimulatedRam::new(RAM_FRAMES);
    let mut storage = StaticFrameStorage::new();
    let memory = boot(&ram, &mut storage, 64);
    let kernel_root = memory.kernel_space().root_page();

    let space = memory.create_address_space().unwrap();
    assert!(memory.switch_to(&space));
    assert!(!memory.switch_to(&space));
    assert_eq!(memory.mmu().current_root(), space.root_page());

    memory.destroy_address_space(space);
    assert_eq!(memory.mmu().current_root(), kernel_root);
    assert_eq!(memory.free_count(), 64);
}

#[test]
fn kernel_space_is_never_destroyed() {
    let ram = SimulatedRam::new(RAM_FRAMES);
    let mut storage = StaticFrameStorage::new();
    let memory = boot(&ram, &mut storage, 64);

    memory.destroy_address_space(memory.kernel_space());
    assert_eq!(memory.free_count(), 64);
    assert!(memory.create_address_space().is_ok());
}

#[test]
fn heap_pages_are_mapped_and_released() {
    let ram = SimulatedRam::new(RAM_FRAMES);
    let mut storage = StaticFrameStorage::new();
    let memory = boot(&ram, &mut storage, 64);
    let heap_pages = memory.heap_pages();

    let ptr = heap_pages.alloc_pages(3).unwrap();
    let start = VirtualAddress::from_ptr(ptr.as_ptr());
    assert_eq!(start.as_u64(), KERNEL_HEAP_START);

    let kernel = memory.kernel_space();
    for i in 0..3 {
        assert!(kernel.translate(start + i * 4096).is_some());
    }
    // Three pages plus an L2 and an L1 table.
    assert_eq!(memory.free_count(), 64 - 5);

    let next = heap_pages.alloc_pages(1).unwrap();
    assert_eq!(VirtualAddress::from_ptr(next.as_ptr()), start + 3 * 4096);

    unsafe { heap_pages.free_pages(ptr, 3).unwrap() };
    for i in 0..3 {
        assert_eq!(kernel.translate(start + i * 4096), None);
    }
    assert_eq!(memory.free_count(), 64 - 3);

    // The released run is found again.
    let again = heap_pages.alloc_pages(2).unwrap();
    assert_eq!(again, ptr);
}

#[test]
fn failed_heap_growth_rolls_back() {
    let ram = SimulatedRam::new(RAM_FRAMES);
    let mut storage = StaticFrameStorage::new();
    let memory = boot(&ram, &mut storage, 6);
    let heap_pages = memory.heap_pages();

    assert_eq!(heap_pages.alloc_pages(0), Err(HeapError::ZeroPages));
    assert_eq!(heap_pages.alloc_pages(10), Err(HeapError::OutOfMemory));

    // Only the two tables created on the way stay behind.
    assert_eq!(memory.free_count(), 4);
    let kernel = memory.kernel_space();
    for i in 0..10 {
        assert_eq!(kernel.translate(VirtualAddress::new(KERNEL_HEAP_START + i * 4096)), None);
    }
    assert_eq!(memory.mmu().invalidations().len(), 4);
}

#[test]
fn interrupts_are_restored_after_every_operation() {
    let ram = SimulatedRam::new(RAM_FRAMES);
    let mut storage = StaticFrameStorage::new();
    let memory = boot(&ram, &mut storage, 64);

    let space = memory.create_address_space().unwrap();
    memory.map_anonymous(&space, user(0x1000), PageFlags::KERNEL_DATA.user()).unwrap();
    memory.heap_pages().alloc_pages(2).unwrap();
    memory.destroy_address_space(space);

    let control = memory.lock().control();
    assert!(control.interrupts_enabled());
    assert!(control.disable_count() >= 4);
    assert_eq!(control.disable_count(), control.enable_count());
    assert_eq!(memory.lock().depth(), 0);
}

#[test]
fn boots_through_the_bootstrap_window() {
    let ram = SimulatedRam::new(RAM_FRAMES);
    let mmu = SimulatedMmu::new(&ram, PhysicalPage::from_frame_number(0));
    let mut directory = Box::new(PageTable::zeroed());
    let mapper = unsafe { BootstrapMapper::new(&mut directory, &mmu) };

    let mut storage = StaticFrameStorage::<32>::new();
    // Spans several 2 MiB regions.
    let frames = PhysicalFrameAllocator::new(
        storage.storage(),
        &[MemoryRegion::available(POOL_BASE, 1026 * 4096)],
        PhysicalAddress::new(POOL_BASE),
    );
    let memory = KernelMemory::new(mapper, &mmu, SimulatedInterrupts::new(true), frames).unwrap();
    assert_eq!(memory.free_count(), 1024);

    let space = memory.create_address_space().unwrap();
    for i in 0..10 {
        memory
            .map_anonymous(&space, user(0x40_0000 + i * 0x20_0000), PageFlags::KERNEL_DATA.user())
            .unwrap();
    }
    assert!(space.translate(user(0x40_0000)).is_some());

    memory.destroy_address_space(space);
    assert_eq!(memory.free_count(), 1024);
    assert!(mmu.flush_count() >= 1);
}
