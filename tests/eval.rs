//! End-to-end tests of the trace → schedule → compile → launch pipeline,
//! running on the built-in reference device.

use filament::{AllocType, Error, Jit, ReductionType, VarType};

const ADD: &str = "add.$t1 $r1, $r2, $r3";
const MUL: &str = "mul.$t1 $r1, $r2, $r3";
const ZERO_F32: &str = "mov.$t1 $r1, 0f00000000";
const ONE_F32: &str = "mov.$t1 $r1, 0f3f800000";

const GATHER_F32: &str = "mul.wide.u32 %t0, $r3, 4;\n\
                          add.u64 %t0, $r2, %t0;\n\
                          ld.global.$t1 $r1, [%t0]";
const SCATTER_F32: &str = "mul.wide.u32 %t0, $r3, 4;\n\
                           add.u64 %t0, $r2, %t0;\n\
                           st.global.$t4 [%t0], $r4";

fn jit() -> Jit {
    let _ = env_logger::builder().is_test(true).try_init();
    let jit = Jit::new();
    jit.init(false, true);
    jit
}

#[test]
fn test_add_and_materialize() {
    let jit = jit();
    let a = jit
        .var_copy_from_host(VarType::Float32, &[1.0f32, 2.0, 3.0, 4.0])
        .unwrap();
    let b = jit
        .var_copy_from_host(VarType::Float32, &[10.0f32, 20.0, 30.0, 40.0])
        .unwrap();
    let c = jit.trace_append_2(VarType::Float32, ADD, a, b).unwrap();
    assert!(jit.var_ptr(c).unwrap().is_null());

    jit.eval().unwrap();
    assert!(!jit.var_ptr(c).unwrap().is_null());
    for (i, expected) in [11.0f32, 22.0, 33.0, 44.0].into_iter().enumerate() {
        assert_eq!(jit.var_read::<f32>(c, i).unwrap(), expected);
    }
    assert_eq!(jit.kernel_stats().launches, 1);
}

#[test]
fn test_eval_twice_is_noop() {
    let jit = jit();
    let a = jit
        .var_copy_from_host(VarType::Float32, &[1.0f32, 2.0])
        .unwrap();
    let c = jit.trace_append_2(VarType::Float32, MUL, a, a).unwrap();
    jit.eval().unwrap();
    let stats = jit.kernel_stats();
    jit.eval().unwrap();
    assert_eq!(jit.kernel_stats(), stats);
    assert_eq!(jit.var_read::<f32>(c, 1).unwrap(), 4.0);
}

#[test]
fn test_cse() {
    let jit = jit();
    let a = jit
        .var_copy_from_host(VarType::Float32, &[1.0f32, 2.0])
        .unwrap();
    let b = jit
        .var_copy_from_host(VarType::Float32, &[3.0f32, 4.0])
        .unwrap();
    assert_eq!(jit.var_int_ref(a).unwrap(), 0);

    let c1 = jit.trace_append_2(VarType::Float32, ADD, a, b).unwrap();
    assert_eq!(jit.var_int_ref(a).unwrap(), 1);
    let c2 = jit.trace_append_2(VarType::Float32, ADD, a, b).unwrap();
    assert_eq!(c1, c2);
    assert_eq!(jit.var_ext_ref(c1).unwrap(), 2);
    // The duplicate request did not register fresh dependency references
    assert_eq!(jit.var_int_ref(a).unwrap(), 1);

    // Different statements do not merge
    let d = jit.trace_append_2(VarType::Float32, MUL, a, b).unwrap();
    assert_ne!(c1, d);

    // Drop every reference, then re-issue: a fresh node appears and the
    // dependency counts return to their old values
    jit.var_dec_ref_ext(c1).unwrap();
    jit.var_dec_ref_ext(c2).unwrap();
    assert_eq!(jit.var_int_ref(a).unwrap(), 1); // still held by `d`
    jit.var_dec_ref_ext(d).unwrap();
    assert_eq!(jit.var_int_ref(a).unwrap(), 0);
    let c3 = jit.trace_append_2(VarType::Float32, ADD, a, b).unwrap();
    assert_ne!(c3, c1);
    assert_eq!(jit.var_int_ref(a).unwrap(), 1);
}

#[test]
fn test_dirty_flush() {
    let jit = jit();
    let a = jit
        .var_copy_from_host(VarType::Float32, &[1.0f32, 2.0, 3.0, 4.0])
        .unwrap();
    let ptr = jit.var_ptr(a).unwrap();
    let pv = jit.var_copy_ptr(ptr, a).unwrap();
    let idx = jit
        .var_copy_from_host(VarType::UInt32, &[0u32, 2])
        .unwrap();
    let val = jit
        .var_copy_from_host(VarType::Float32, &[9.0f32, 9.0])
        .unwrap();

    let sc = jit
        .trace_append_3(VarType::Float32, SCATTER_F32, pv, idx, val)
        .unwrap();
    jit.var_mark_scatter(sc, a).unwrap();
    jit.var_dec_ref_ext(sc).unwrap();

    // Reading any element flushes the scatter first
    assert_eq!(jit.var_read::<f32>(a, 1).unwrap(), 2.0);
    assert_eq!(jit.var_read::<f32>(a, 0).unwrap(), 9.0);
    assert_eq!(jit.var_read::<f32>(a, 2).unwrap(), 9.0);
    assert_eq!(jit.var_read::<f32>(a, 3).unwrap(), 4.0);
}

#[test]
fn test_gather() {
    let jit = jit();
    let a = jit
        .var_copy_from_host(VarType::Float32, &[10.0f32, 20.0, 30.0, 40.0])
        .unwrap();
    let pv = jit.var_copy_ptr(jit.var_ptr(a).unwrap(), a).unwrap();
    let idx = jit
        .var_copy_from_host(VarType::UInt32, &[3u32, 0, 1])
        .unwrap();
    let g = jit
        .trace_append_2(VarType::Float32, GATHER_F32, pv, idx)
        .unwrap();
    assert_eq!(jit.var_size(g).unwrap(), 3);
    jit.eval().unwrap();
    assert_eq!(jit.var_read::<f32>(g, 0).unwrap(), 40.0);
    assert_eq!(jit.var_read::<f32>(g, 1).unwrap(), 10.0);
    assert_eq!(jit.var_read::<f32>(g, 2).unwrap(), 20.0);
}

#[test]
fn test_literal_zero_absorbs() {
    let jit = jit();
    let a = jit
        .var_copy_from_host(VarType::Float32, &[1.0f32, 2.0, 3.0, 4.0])
        .unwrap();
    let zero4 = jit
        .trace_append_0(VarType::Float32, ZERO_F32, 4)
        .unwrap();
    let zero1 = jit
        .trace_append_0(VarType::Float32, ZERO_F32, 1)
        .unwrap();
    assert!(jit.var_is_literal_zero(zero1).unwrap());
    assert!(!jit.var_is_literal_one(zero1).unwrap());

    // x * 0 folds to the cached broadcast zero of the result shape
    let d = jit
        .trace_append_2(VarType::Float32, MUL, a, zero1)
        .unwrap();
    assert_eq!(d, zero4);
    assert!(jit.var_is_literal_zero(d).unwrap());

    // x * 1 refreshes x itself
    let one = jit.trace_append_0(VarType::Float32, ONE_F32, 4).unwrap();
    assert!(jit.var_is_literal_one(one).unwrap());
    let before = jit.var_ext_ref(a).unwrap();
    let e = jit.trace_append_2(VarType::Float32, MUL, a, one).unwrap();
    assert_eq!(e, a);
    assert_eq!(jit.var_ext_ref(a).unwrap(), before + 1);

    // x + 0 likewise
    let f = jit
        .trace_append_2(VarType::Float32, ADD, a, zero4)
        .unwrap();
    assert_eq!(f, a);
}

#[test]
fn test_broadcasting() {
    let jit = jit();
    let a = jit
        .var_copy_from_host(VarType::Float32, &[1.0f32, 2.0, 3.0])
        .unwrap();
    let s = jit.var_copy_from_host(VarType::Float32, &[5.0f32]).unwrap();
    let c = jit.trace_append_2(VarType::Float32, ADD, a, s).unwrap();
    assert_eq!(jit.var_size(c).unwrap(), 3);
    jit.eval().unwrap();
    assert_eq!(jit.var_read::<f32>(c, 0).unwrap(), 6.0);
    assert_eq!(jit.var_read::<f32>(c, 2).unwrap(), 8.0);
}

#[test]
fn test_size_mismatch() {
    let jit = jit();
    let a = jit
        .var_copy_from_host(VarType::Float32, &[1.0f32, 2.0, 3.0])
        .unwrap();
    let b = jit
        .var_copy_from_host(VarType::Float32, &[1.0f32, 2.0])
        .unwrap();
    assert!(matches!(
        jit.trace_append_2(VarType::Float32, ADD, a, b),
        Err(Error::SizeMismatch(..))
    ));
    assert!(matches!(
        jit.trace_append_0(VarType::Float32, ZERO_F32, 0),
        Err(Error::SizeMismatch(..))
    ));
    let empty: &[f32] = &[];
    assert!(jit.var_copy_from_host(VarType::Float32, empty).is_err());
}

#[test]
fn test_template_validation() {
    let jit = jit();
    let a = jit.var_copy_from_host(VarType::Float32, &[1.0f32]).unwrap();
    assert!(matches!(
        jit.trace_append_1(VarType::Float32, ADD, a),
        Err(Error::TypeMismatch(..))
    ));
    assert!(matches!(
        jit.trace_append_1(VarType::Float32, "add", 0xdead_beef),
        Err(Error::UnknownIndex(..))
    ));
}

#[test]
fn test_read_write_roundtrip() {
    let jit = jit();
    let values = [4.0f32, 3.0, 2.0, 1.0];
    let a = jit.var_copy_from_host(VarType::Float32, &values).unwrap();
    for (i, v) in values.into_iter().enumerate() {
        assert_eq!(jit.var_read::<f32>(a, i).unwrap(), v);
    }
    jit.var_write(a, 1, 7.5f32).unwrap();
    assert_eq!(jit.var_read::<f32>(a, 1).unwrap(), 7.5);
    assert!(jit.var_read::<f32>(a, 4).is_err());
}

#[test]
fn test_var_map_and_labels() {
    let jit = jit();
    let ptr = jit.malloc(AllocType::Device, 4 * 4).unwrap();
    unsafe { jit.fill(VarType::Float32, ptr, 4, 2.5f32).unwrap() };
    let a = jit.var_map(VarType::Float32, ptr, 4, true).unwrap();
    assert_eq!(jit.var_read::<f32>(a, 3).unwrap(), 2.5);

    assert_eq!(jit.var_label(a).unwrap(), None);
    jit.var_set_label(a, "mapped").unwrap();
    assert_eq!(jit.var_label(a).unwrap().as_deref(), Some("mapped"));
    assert!(jit.var_whos().contains("mapped"));
}

#[test]
fn test_var_migrate() {
    let jit = jit();
    let a = jit
        .var_copy_from_host(VarType::Float32, &[1.0f32, 2.0])
        .unwrap();
    let before = jit.var_ptr(a).unwrap();
    jit.var_migrate(a, AllocType::HostPinned).unwrap();
    let after = jit.var_ptr(a).unwrap();
    assert_ne!(before, after);
    jit.sync_stream().unwrap();
    assert_eq!(jit.var_read::<f32>(a, 1).unwrap(), 2.0);
}

#[test]
fn test_var_schedule() {
    let jit = jit();
    let a = jit
        .var_copy_from_host(VarType::Float32, &[1.0f32, 2.0])
        .unwrap();
    let c = jit.trace_append_2(VarType::Float32, ADD, a, a).unwrap();
    jit.var_schedule(c).unwrap();
    jit.eval().unwrap();
    assert!(!jit.var_ptr(c).unwrap().is_null());
    assert_eq!(jit.var_read::<f32>(c, 0).unwrap(), 2.0);
}

#[test]
fn test_partial_eval() {
    let jit = jit();
    let a = jit
        .var_copy_from_host(VarType::Float32, &[1.0f32, 2.0])
        .unwrap();
    let b = jit
        .var_copy_from_host(VarType::Float32, &[1.0f32, 2.0, 3.0])
        .unwrap();
    let c = jit.trace_append_2(VarType::Float32, ADD, a, a).unwrap();
    let d = jit.trace_append_2(VarType::Float32, ADD, b, b).unwrap();

    // Evaluating `c` must not touch `d`: the two live in different
    // partitions (their sizes differ)
    jit.var_eval(c).unwrap();
    assert!(!jit.var_ptr(c).unwrap().is_null());
    assert!(jit.var_ptr(d).unwrap().is_null());
    jit.eval().unwrap();
    assert!(!jit.var_ptr(d).unwrap().is_null());
}

#[test]
fn test_kernel_reuse_in_memory() {
    let jit = jit();
    let a = jit
        .var_copy_from_host(VarType::Float32, &[1.0f32, 2.0])
        .unwrap();
    let c = jit.trace_append_2(VarType::Float32, ADD, a, a).unwrap();
    jit.eval().unwrap();
    let first = jit.kernel_stats();

    // The same expression over fresh inputs produces identical IR, which
    // must be served from the in-memory kernel table
    let b = jit
        .var_copy_from_host(VarType::Float32, &[5.0f32, 6.0])
        .unwrap();
    let d = jit.trace_append_2(VarType::Float32, ADD, b, b).unwrap();
    jit.eval().unwrap();
    let second = jit.kernel_stats();
    assert_eq!(second.compiled + second.disk_hits, first.compiled + first.disk_hits);
    assert_eq!(second.memory_hits, first.memory_hits + 1);
    assert_eq!(jit.var_read::<f32>(c, 0).unwrap(), 2.0);
    assert_eq!(jit.var_read::<f32>(d, 1).unwrap(), 12.0);
}

#[test]
fn test_cache_persistence() {
    // A process-unique literal makes the kernel text unique to this run,
    // so the first compilation cannot be served by a stale cache file
    let lit = format!("mov.$t1 $r1, 0f{:08x}", std::process::id());

    let build = |jit: &Jit| -> u32 {
        let a = jit
            .var_copy_from_host(VarType::Float32, &[1.0f32, 2.0, 3.0, 4.0])
            .unwrap();
        let u = jit.trace_append_0(VarType::Float32, &lit, 4).unwrap();
        jit.trace_append_2(VarType::Float32, ADD, a, u).unwrap()
    };

    let jit1 = jit();
    let c1 = build(&jit1);
    jit1.eval().unwrap();
    let v1: Vec<f32> = (0..4).map(|i| jit1.var_read(c1, i).unwrap()).collect();
    let stats1 = jit1.kernel_stats();
    assert_eq!(stats1.compiled + stats1.disk_hits, 1);
    drop(jit1);

    // A fresh compiler has an empty in-memory table; the kernel must come
    // back from disk without invoking the IR parser
    let jit2 = jit();
    let c2 = build(&jit2);
    jit2.eval().unwrap();
    let stats2 = jit2.kernel_stats();
    assert_eq!(stats2.compiled, 0);
    assert_eq!(stats2.disk_hits, 1);
    assert_eq!(stats2.memory_hits, 0);
    let v2: Vec<f32> = (0..4).map(|i| jit2.var_read(c2, i).unwrap()).collect();
    assert_eq!(v1, v2);
}

#[test]
fn test_bulk_operations() {
    let jit = jit();
    let n = 6u32;
    let buf = jit.malloc(AllocType::Device, (n as usize) * 4).unwrap();
    unsafe {
        jit.fill(VarType::UInt32, buf, n, 3u32).unwrap();
        let mut out = 0u32;
        jit.reduce(
            VarType::UInt32,
            ReductionType::Add,
            buf,
            n,
            &mut out as *mut u32 as *mut u8,
        )
        .unwrap();
        assert_eq!(out, 18);

        let input = [1u32, 2, 3, 4];
        let mut scanned = [0u32; 4];
        jit.scan(input.as_ptr(), scanned.as_mut_ptr(), 4).unwrap();
        assert_eq!(scanned, [0, 1, 3, 6]);

        let masks = [1u8, 1, 0, 1];
        assert!(!jit.all(masks.as_ptr(), 4).unwrap());
        assert!(jit.any(masks.as_ptr(), 4).unwrap());

        let values = [1u32, 0, 1, 2, 0];
        let mut perm = [0u32; 5];
        let mut offsets = [0u32; 4];
        let unique = jit
            .mkperm(values.as_ptr(), 5, 3, perm.as_mut_ptr(), offsets.as_mut_ptr())
            .unwrap();
        assert_eq!(unique, 3);
        assert_eq!(offsets, [0, 2, 4, 5]);
        assert_eq!(&perm[0..2], &[1, 4]); // bucket 0
        assert_eq!(&perm[2..4], &[0, 2]); // bucket 1
        assert_eq!(&perm[4..5], &[3]); // bucket 2
    }
    jit.free(buf).unwrap();
}

#[test]
fn test_allocator_reuse() {
    let jit = jit();
    let a = jit.malloc(AllocType::Device, 100).unwrap();
    jit.free(a).unwrap();
    assert!(matches!(jit.free(a), Err(Error::UnknownPointer(_))));

    // Deferred releases only become reusable after a sync
    jit.sync_stream().unwrap();
    let b = jit.malloc(AllocType::Device, 100).unwrap();
    assert_eq!(a, b);
    jit.free(b).unwrap();

    let (usage, watermark) = jit.malloc_usage(AllocType::Device);
    assert_eq!(usage, 0);
    assert!(watermark >= 128);
    jit.malloc_trim().unwrap();
}

#[test]
fn test_shutdown() {
    let jit = jit();
    let a = jit
        .var_copy_from_host(VarType::Float32, &[1.0f32, 2.0])
        .unwrap();
    let c = jit.trace_append_2(VarType::Float32, ADD, a, a).unwrap();
    jit.eval().unwrap();
    assert_eq!(jit.var_read::<f32>(c, 0).unwrap(), 2.0);

    jit.shutdown(false);
    assert_eq!(jit.malloc_usage(AllocType::Device).0, 0);
    assert!(!jit.has_cuda());
    assert!(matches!(jit.var_size(a), Err(Error::Uninitialized)));

    // The compiler can be brought back up afterwards
    jit.init(false, true);
    assert!(jit.has_cuda());
    assert!(matches!(jit.var_size(a), Err(Error::UnknownIndex(_))));
}

#[test]
fn test_device_api() {
    let jit = jit();
    assert!(jit.device_count() >= 1);
    jit.device_set(0, 0).unwrap();
    assert!(jit.device_set(99, 0).is_err());
    jit.sync_device().unwrap();
    jit.parallel_set_dispatch(true);
    assert!(jit.parallel_dispatch());
    jit.parallel_set_dispatch(false);
}

#[test]
fn test_uninitialized() {
    let jit = Jit::new();
    assert!(matches!(jit.eval(), Err(Error::Uninitialized)));
    assert!(matches!(
        jit.malloc(AllocType::Device, 64),
        Err(Error::Uninitialized)
    ));
}
