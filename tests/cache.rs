use quicken_unwind::x86_64::reg;
use quicken_unwind::*;

mod common;

use common::*;

fn leaf_regions(name: &str, range: std::ops::Range<u64>) -> Vec<MappedRegion> {
    let debug_frame = DebugFrameBuilder::new()
        .fde(range.start..range.start + 0x100, &[])
        .build();
    vec![mapped_image(name, range, Some(debug_frame_sections(debug_frame)))]
}

#[test]
fn test_programs_persist_across_unwinders() {
    let dir = tempfile::tempdir().unwrap();
    let config = UnwinderConfig::default().with_cache_dir(dir.path());
    let regs = RegisterSnapshot::new(0x40010).with(reg::RSP, 0x9000);

    let first = unwinder(leaf_regions("libpersist.so", 0x40000..0x41000), stack(0x9000, &[0]), config.clone());
    let result = first.unwind(&regs);
    assert_eq!(result.frames[0].method, UnwindMethod::Quicken);
    assert_eq!(first.cache().compile_count(), 1);
    first.cache().flush();
    let path = first.cache().disk().unwrap().path_for(&identity("libpersist.so"));
    assert!(path.exists());
    drop(first);

    let second = unwinder(leaf_regions("libpersist.so", 0x40000..0x41000), stack(0x9000, &[0]), config);
    let result = second.unwind(&regs);
    assert_eq!(result.reason, TerminationReason::Complete);
    assert_eq!(result.frames[0].method, UnwindMethod::Quicken);
    assert_eq!(second.cache().compile_count(), 0);
}

#[test]
fn test_unloaded_image_is_invalidated() {
    let dir = tempfile::tempdir().unwrap();
    let config = UnwinderConfig::default().with_cache_dir(dir.path());
    let unwinder = unwinder(leaf_regions("libold.so", 0x40000..0x41000), stack(0x9000, &[0]), config);

    unwinder.unwind(&RegisterSnapshot::new(0x40010).with(reg::RSP, 0x9000));
    let old = identity("libold.so");
    let old_program = unwinder.cache().try_get(&old).unwrap();
    unwinder.cache().flush();

    unwinder
        .address_space()
        .replace_regions(leaf_regions("libnew.so", 0x40000..0x41000));
    let result = unwinder.unwind(&RegisterSnapshot::new(0x40010).with(reg::RSP, 0x9000));
    assert_eq!(result.frames[0].identity(), Some(&identity("libnew.so")));

    assert!(unwinder.cache().try_get(&old).is_none());
    // The program that was handed out stays usable.
    assert!(old_program.is_stale());
    assert!(old_program.lookup(0x40010).is_some());

    unwinder.cache().flush();
    let disk = unwinder.cache().disk().unwrap();
    assert_eq!(disk.collect_garbage().unwrap(), 1);
    assert!(!disk.path_for(&old).exists());
    assert!(disk.path_for(&identity("libnew.so")).exists());
}

#[test]
fn test_concurrent_walks_compile_once() {
    let unwinder = unwinder(
        leaf_regions("libshared.so", 0x40000..0x41000),
        stack(0x9000, &[0]),
        UnwinderConfig::default(),
    );
    let regs = RegisterSnapshot::new(0x40010).with(reg::RSP, 0x9000);
    std::thread::scope(|scope| {
        for _ in 0..8 {
            scope.spawn(|| {
                let result = unwinder.unwind(&regs);
                assert_eq!(result.frames[0].method, UnwindMethod::Quicken);
            });
        }
    });
    assert_eq!(unwinder.cache().compile_count(), 1);
    assert_eq!(unwinder.cache().len(), 1);
}
