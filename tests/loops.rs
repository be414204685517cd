//! Symbolic loop recording, elimination, and execution.

use filament::{Jit, VarType};

const ADD_U32: &str = "add.$t1 $r1, $r2, $r3";
const LT: &str = "setp.lt.$t2 $r1, $r2, $r3";

fn jit() -> Jit {
    let _ = env_logger::builder().is_test(true).try_init();
    let jit = Jit::new();
    jit.init(false, true);
    jit
}

fn literal_u32(jit: &Jit, value: u32, size: u32) -> u32 {
    jit.trace_append_0(
        VarType::UInt32,
        &format!("mov.$t1 $r1, {:#010x}", value),
        size,
    )
    .unwrap()
}

#[test]
fn test_counter_loop() {
    let jit = jit();

    // i = 0; while (i < 10) { i += 1; }
    let zero = literal_u32(&jit, 0, 1);
    let mut state = [zero];
    let holder = jit.var_loop_start(Some("counter"), &mut state).unwrap();
    let phi = state[0];
    assert_ne!(phi, zero);

    let ten = literal_u32(&jit, 10, 1);
    let active = jit.trace_append_2(VarType::Bool, LT, phi, ten).unwrap();
    let cond = jit.var_loop_cond(holder, active).unwrap();
    let checkpoint = jit.side_effect_counter();

    let one = literal_u32(&jit, 1, 1);
    let next = jit
        .trace_append_2(VarType::UInt32, ADD_U32, phi, one)
        .unwrap();

    let mut out_state = [next];
    let done = jit
        .var_loop_end(holder, cond, &mut out_state, checkpoint)
        .unwrap();
    assert!(done);
    let result = out_state[0];
    assert_ne!(result, next);

    for h in [holder, cond, active, ten, one, next, phi] {
        jit.var_dec_ref_ext(h).unwrap();
    }

    jit.eval().unwrap();
    assert_eq!(jit.var_read::<u32>(result, 0).unwrap(), 10);
}

#[test]
fn test_vector_loop_divergence() {
    let jit = jit();

    // Lanes enter with different values and exit after different trip
    // counts; lane 3 never runs the body at all
    let x = jit
        .var_copy_from_host(VarType::UInt32, &[0u32, 5, 8, 12])
        .unwrap();
    let ten = literal_u32(&jit, 10, 1);

    let mut state = [x];
    let holder = jit.var_loop_start(Some("clamp"), &mut state).unwrap();
    let phi = state[0];

    let active = jit.trace_append_2(VarType::Bool, LT, phi, ten).unwrap();
    let cond = jit.var_loop_cond(holder, active).unwrap();
    let checkpoint = jit.side_effect_counter();

    let one = literal_u32(&jit, 1, 1);
    let next = jit
        .trace_append_2(VarType::UInt32, ADD_U32, phi, one)
        .unwrap();

    let mut out_state = [next];
    let done = jit
        .var_loop_end(holder, cond, &mut out_state, checkpoint)
        .unwrap();
    assert!(done);
    let result = out_state[0];
    assert_eq!(jit.var_size(result).unwrap(), 4);

    for h in [holder, cond, active, ten, one, next, phi] {
        jit.var_dec_ref_ext(h).unwrap();
    }

    jit.eval().unwrap();
    for (i, expected) in [10u32, 10, 10, 12].into_iter().enumerate() {
        assert_eq!(jit.var_read::<u32>(result, i).unwrap(), expected);
    }
}

#[test]
fn test_invariant_state_elimination() {
    let jit = jit();

    let x = jit
        .var_copy_from_host(VarType::UInt32, &[5u32, 6])
        .unwrap();
    let ten = literal_u32(&jit, 10, 1);

    let mut state = [x];
    let holder = jit.var_loop_start(Some("invariant"), &mut state).unwrap();
    let phi = state[0];

    let active = jit.trace_append_2(VarType::Bool, LT, phi, ten).unwrap();
    let cond = jit.var_loop_cond(holder, active).unwrap();
    let checkpoint = jit.side_effect_counter();

    // The body leaves the state untouched, so the slot gets eliminated and
    // the recorder requests exactly one replay
    let mut out_state = [phi];
    let done = jit
        .var_loop_end(holder, cond, &mut out_state, checkpoint)
        .unwrap();
    assert!(!done);
    assert_eq!(out_state[0], x);

    jit.var_dec_ref_ext(cond).unwrap();
    jit.var_dec_ref_ext(active).unwrap();
    jit.var_dec_ref_ext(phi).unwrap();

    // Replay: the condition now reads the outer value directly
    let active2 = jit
        .trace_append_2(VarType::Bool, LT, out_state[0], ten)
        .unwrap();
    let cond2 = jit.var_loop_cond(holder, active2).unwrap();
    let checkpoint2 = jit.side_effect_counter();
    let mut state2 = [out_state[0]];
    let done2 = jit
        .var_loop_end(holder, cond2, &mut state2, checkpoint2)
        .unwrap();
    assert!(done2);

    // Final state equals the initial state
    assert_eq!(state2[0], x);
    assert_eq!(jit.var_read::<u32>(x, 0).unwrap(), 5);
    assert_eq!(jit.var_read::<u32>(x, 1).unwrap(), 6);

    for h in [holder, cond2, active2, ten, state2[0]] {
        jit.var_dec_ref_ext(h).unwrap();
    }
}

#[test]
fn test_loop_validation() {
    let jit = jit();

    // Empty state
    let mut empty: [u32; 0] = [];
    assert!(jit.var_loop_start(None, &mut empty).is_err());

    // Uninitialized state slot
    assert!(jit.var_loop_start(None, &mut [0]).is_err());

    // A non-symbolic condition is rejected on the first pass
    let x = jit.var_copy_from_host(VarType::UInt32, &[1u32]).unwrap();
    let mut state = [x];
    let holder = jit.var_loop_start(None, &mut state).unwrap();
    let phi = state[0];
    let plain = jit
        .var_copy_from_host(VarType::Bool, &[1u8])
        .unwrap();
    assert!(jit.var_loop_cond(holder, plain).is_err());

    // A non-boolean condition is rejected as well
    let ten = literal_u32(&jit, 10, 1);
    let int_cond = jit
        .trace_append_2(VarType::UInt32, ADD_U32, phi, ten)
        .unwrap();
    assert!(jit.var_loop_cond(holder, int_cond).is_err());

    for h in [holder, phi, plain, ten, int_cond] {
        jit.var_dec_ref_ext(h).unwrap();
    }
}
