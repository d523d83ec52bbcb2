//! Loading images into fresh processes.

use std::sync::Arc;

use kestrel_common::{Capabilities, Protection};
use kestrel_kernel::config::{HUGE_PAGE_SIZE, PAGE_SIZE};
use kestrel_kernel::mm::{AddressSpace, FramePool, PhysMemory, Placement};
use kestrel_kernel::process::{elf_load, ElfError, Process};
use kestrel_kernel::testutil::{self, ElfBuilder};

const BASE: u64 = 0x40_0000;

fn empty_process() -> Process {
    let frames = Arc::new(FramePool::new(PhysMemory::hosted(HUGE_PAGE_SIZE, 4 * HUGE_PAGE_SIZE)));
    let space = AddressSpace::new(frames, None).unwrap();
    Process::new("loader", None, space, Capabilities::empty())
}

#[test]
fn bss_tail_is_zero_filled() {
    let process = empty_process();
    // Leave stale data in the pool so the zeroing is observable.
    let scratch = process
        .allocate(Placement::Anywhere, PAGE_SIZE, Protection::READ | Protection::WRITE)
        .unwrap();
    process.space().copy_to_user(scratch, &[0x5A; PAGE_SIZE as usize]).unwrap();
    process.free(scratch, PAGE_SIZE).unwrap();

    let image = ElfBuilder::new(BASE)
        .segment(BASE, &[0xAB; 100], PAGE_SIZE, 4 | 2)
        .build();
    let loaded = elf_load(&process, &image).unwrap();
    assert_eq!(loaded.entry, BASE);

    let mut page = vec![0xFF; PAGE_SIZE as usize];
    process.space().copy_from_user(BASE, &mut page).unwrap();
    assert!(page[..100].iter().all(|&b| b == 0xAB));
    assert!(page[100..].iter().all(|&b| b == 0));
}

#[test]
fn malformed_headers_leave_the_space_untouched() {
    let process = empty_process();
    let good = ElfBuilder::new(BASE).segment(BASE, b"code", 64, 4 | 1).build();

    let mut bad_magic = good.clone();
    bad_magic[1] = b'X';
    let mut wrong_class = good.clone();
    wrong_class[4] = 1; // ELFCLASS32
    let mut big_endian = good.clone();
    big_endian[5] = 2;
    let mut wrapping_phoff = good.clone();
    wrapping_phoff[32..40].copy_from_slice(&u64::MAX.to_le_bytes());
    let mut short_segment = good.clone();
    // p_filesz of the first header reaches past the end of the file.
    short_segment[64 + 32..64 + 40].copy_from_slice(&(1u64 << 20).to_le_bytes());

    for image in [bad_magic, wrong_class, big_endian, wrapping_phoff, short_segment] {
        assert_eq!(elf_load(&process, &image), Err(ElfError::Invalid));
        assert_eq!(process.space().regions().count(), 0);
    }
    assert!(elf_load(&process, &good).is_ok());
}

#[test]
fn created_process_maps_its_image_with_final_protection() {
    let (kernel, _cpu, _clock) = testutil::hosted_kernel();
    let pid = kernel
        .create_process("init", &testutil::minimal_elf(), &["init"], None)
        .unwrap();
    let process = kernel.process(pid).unwrap();
    let region = process.space().region_at(BASE).copied().unwrap();
    assert_eq!((region.base, region.size), (BASE, PAGE_SIZE));
    assert_eq!(region.prot, Protection::READ | Protection::EXEC);
}

#[test]
fn image_too_big_for_memory_is_no_memory() {
    let process = empty_process();
    let image = ElfBuilder::new(BASE)
        .segment(BASE, b"x", 64 * HUGE_PAGE_SIZE, 4 | 2)
        .build();
    assert_eq!(elf_load(&process, &image), Err(ElfError::NoMemory));
    assert_eq!(process.space().regions().count(), 0);
}
