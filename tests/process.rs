use std::fs::File;

use quicken_unwind::*;

mod common;

use common::*;

#[test]
fn test_self_refresh_sees_mapping_changes() {
    // The target directory allows executable mappings.
    let dir = tempfile::tempdir_in(env!("CARGO_TARGET_TMPDIR")).unwrap();
    let path = dir.path().join("libtransient.so");
    let debug_frame = DebugFrameBuilder::new().fde(0..0x100, &[]).build();
    std::fs::write(&path, elf_with_debug_frame(&debug_frame)).unwrap();
    let path = path.canonicalize().unwrap();

    let space = AddressSpace::for_self();
    assert_eq!(space.generation(), 0);
    let file = File::open(&path).unwrap();
    // SAFETY: the file is not modified while mapped.
    let map = unsafe { memmap2::MmapOptions::new().map_exec(&file) }.unwrap();
    let address = map.as_ptr() as u64;

    let snapshot = space.snapshot();
    let generation = snapshot.generation();
    assert_eq!(space.generation(), generation);
    let region = snapshot.resolve(address).unwrap();
    assert!(region.is_executable());
    let identity = region.identity().unwrap().clone();
    assert_eq!(identity.path(), path);

    // Without a notification the snapshot stays as it is.
    drop(map);
    assert_eq!(space.snapshot().generation(), generation);
    assert!(space.take_unloaded().is_empty());

    space.notify_maps_changed();
    let snapshot = space.snapshot();
    assert!(snapshot.generation() > generation);
    assert!(snapshot
        .resolve(address)
        .map_or(true, |region| region.path() != Some(path.as_path())));
    assert!(space.take_unloaded().contains(&identity));
}

#[cfg(target_arch = "x86_64")]
mod remote {
    use quicken_unwind::x86_64::reg;
    use quicken_unwind::*;

    #[inline(never)]
    fn callee() -> i32 {
        std::hint::black_box(1)
    }

    #[inline(never)]
    fn caller() -> i32 {
        std::hint::black_box(2)
    }

    #[test]
    fn test_unwind_remote_on_own_process() {
        // A fake stack for a thread that just entered `callee`, called from
        // the start of `caller`, which is the outermost frame.
        let return_address = caller as usize as u64 + 1;
        let stack: Box<[u64; 4]> = Box::new([return_address, 0, 0, 0]);
        let sp = stack.as_ptr() as u64;
        let regs = RegisterSnapshot::new(callee as usize as u64)
            .with(reg::RSP, sp)
            .with(reg::RBP, 0);

        let unwinder = UnwinderX86_64::new(UnwinderConfig::default());
        let result = unwinder.unwind_remote(std::process::id() as i32, &regs, 16);
        assert_eq!(result.reason, TerminationReason::Complete);
        let frames: Vec<_> = result.frames.iter().map(|f| (f.pc, f.sp)).collect();
        assert_eq!(frames, [(callee as usize as u64, sp), (return_address, sp + 8)]);
        assert!(result.frames.iter().all(|f| f.image.is_some()));
        assert_eq!(callee() + caller(), 3);
    }
}
