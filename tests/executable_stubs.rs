//! Executing precodes on x86-64 Linux.
//!
//! Each test maps an executable loader heap; on hosts that refuse
//! writable-executable mappings the tests return early.

#![cfg(all(target_arch = "x86_64", target_os = "linux"))]

use std::sync::Arc;

use precode::{
    LoaderHeap, LoaderHeapConfig, MethodDef, MethodDescChunk, Precode, PrecodeCapabilities,
    PrecodeKind, Trampolines,
};

extern "C" fn prestub(x: u64) -> u64 {
    x + 1000
}

extern "C" fn fixup_thunk(x: u64) -> u64 {
    x + 2000
}

extern "C" fn ndirect_import_thunk(x: u64) -> u64 {
    x + 3000
}

extern "C" fn remoting_check_thunk() {}

extern "C" fn add_one(x: u64) -> u64 {
    x + 1
}

extern "C" fn add_two(x: u64) -> u64 {
    x + 2
}

extern "C" fn pair(a: u64, b: u64) -> u64 {
    a * 10 + b
}

fn trampolines() -> Trampolines {
    Trampolines {
        prestub: prestub as usize,
        fixup_thunk: fixup_thunk as usize,
        ndirect_import_thunk: ndirect_import_thunk as usize,
        remoting_check_thunk: remoting_check_thunk as usize,
    }
}

fn executable_chunk() -> Option<Arc<MethodDescChunk>> {
    let heap = LoaderHeap::new(
        trampolines(),
        LoaderHeapConfig {
            executable: true,
            ..LoaderHeapConfig::default()
        },
    );
    // Try the mapping once; some kernels forbid RWX pages.
    use precode::LoaderAllocator;
    if heap.alloc_aligned_mem(8, 8).is_err() {
        eprintln!("skipping: executable mappings unavailable");
        return None;
    }
    Some(MethodDescChunk::new(heap, [MethodDef::new("Exec", 0x0600_0500)]))
}

fn as_fn(precode: &Precode<'_>) -> extern "C" fn(u64) -> u64 {
    unsafe { std::mem::transmute::<usize, extern "C" fn(u64) -> u64>(precode.entry_point()) }
}

#[test]
fn test_stub_precode_dispatches_to_target() {
    let Some(chunk) = executable_chunk() else {
        return;
    };
    let precode =
        Precode::allocate(&PrecodeCapabilities::X86_64, PrecodeKind::Stub, &chunk[0]).unwrap();

    assert_eq!(as_fn(&precode)(5), 1005);
    assert!(precode.set_target_interlocked(add_one as usize, true).unwrap());
    assert_eq!(as_fn(&precode)(5), 6);
    assert!(precode.set_target_interlocked(add_two as usize, false).unwrap());
    assert_eq!(as_fn(&precode)(5), 7);

    precode.reset().unwrap();
    assert_eq!(as_fn(&precode)(5), 1005);
}

#[test]
fn test_patched_fixup_jumps_to_target() {
    let Some(chunk) = executable_chunk() else {
        return;
    };
    let precode =
        Precode::allocate(&PrecodeCapabilities::X86_64, PrecodeKind::Fixup, &chunk[0]).unwrap();

    // The text segment is usually out of rel32 reach of the heap, so this
    // also runs through a jump stub.
    assert!(precode.set_target_interlocked(add_one as usize, true).unwrap());
    assert_eq!(precode.target(), add_one as usize);
    assert_eq!(as_fn(&precode)(41), 42);

    assert!(precode.set_target_interlocked(add_two as usize, false).unwrap());
    assert_eq!(as_fn(&precode)(40), 42);
}

#[test]
fn test_this_ptr_ret_buf_swaps_arguments() {
    let Some(chunk) = executable_chunk() else {
        return;
    };
    let caps = &PrecodeCapabilities::X86_64;
    let precode = Precode::allocate(caps, PrecodeKind::ThisPtrRetBuf, &chunk[0]).unwrap();
    assert!(precode.set_target_interlocked(pair as usize, true).unwrap());

    let f = unsafe {
        std::mem::transmute::<usize, extern "C" fn(u64, u64) -> u64>(precode.entry_point())
    };
    assert_eq!(f(1, 2), 21);
}
