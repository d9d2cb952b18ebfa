use std::vec::Vec;

use super::*;
use crate::arch::Platform;
use crate::code::TargetMethod;
use crate::sim::{object, Program, SimStack, HEAP, NATIVE_PC, STACK_BASE, THREAD_START};
use crate::walk::StackFrameWalker;

const PLATFORM: Platform = Platform {
    return_address_after_call: true,
    stack_bias: StackBias::NONE,
};

/// run -> main -> helper -> leaf, leaf holding a reference in local 0 and an
/// integer in local 1.
fn managed_stack(program: &Program, stop: usize) -> SimStack<'_> {
    let mut stack = SimStack::new(&program.code, PLATFORM, 256, 4);
    stack
        .enter(program.run, THREAD_START)
        .call(program.main, 0x10)
        .call(program.helper, 0x20)
        .call(program.leaf, 0x30)
        .set_local(0, object(1))
        .set_local(1, 42)
        .stop_at(stop);
    stack
}

/// run -> main -> stub -> native, the stub holding a reference in local 0.
fn native_stack(program: &Program) -> SimStack<'_> {
    let mut stack = SimStack::new(&program.code, PLATFORM, 256, 4);
    stack
        .enter(program.run, THREAD_START)
        .call(program.main, 0x10)
        .call(program.stub, 0x28)
        .set_local(0, object(9))
        .call_native(0x10, NATIVE_PC, 6);
    stack
}

fn set_slots(map: &ReferenceMap) -> Vec<Addr> {
    (0..map.slots())
        .filter(|&i| map.is_set(i))
        .map(|i| map.slot_address(i))
        .collect()
}

fn prepare_from_top(
    stack: &SimStack<'_>,
    program: &Program,
    thread: &mut ThreadContext,
    preparer: &mut StackReferenceMapPreparer,
    ignore_top_frame: bool,
) -> Result<()> {
    let mut walker = StackFrameWalker::new(stack, &program.code, PLATFORM);
    let (ip, sp, fp) = stack.top();
    preparer.prepare_stack_reference_map_at(&mut walker, thread, &HEAP, ip, sp, fp, ignore_top_frame)
}

#[test]
fn only_the_leaf_reference_is_marked() {
    let program = Program::new().unwrap();
    let stack = managed_stack(&program, 0x8);
    let mut thread = stack.thread(1);
    let mut preparer = StackReferenceMapPreparer::new(false, true);

    prepare_from_top(&stack, &program, &mut thread, &mut preparer, false).unwrap();

    let leaf = stack.frame(3);
    let local0 = leaf.sp.plus(program.method(program.leaf).frame_layout().local_slot_offset(0));
    assert_eq!(set_slots(thread.reference_map()), [local0]);
    assert_eq!(thread.lowest_active_slot(), leaf.sp);
    assert_eq!(
        preparer.stats(),
        PreparationStats {
            frames_prepared: 4,
            bits_set: 1
        }
    );
}

#[test]
fn preparing_an_unchanged_stack_again_gives_the_same_map() {
    let program = Program::new().unwrap();
    let stack = managed_stack(&program, 0x8);
    let mut thread = stack.thread(1);
    let mut preparer = StackReferenceMapPreparer::new(false, true);

    prepare_from_top(&stack, &program, &mut thread, &mut preparer, false).unwrap();
    let first = thread.reference_map().clone();

    // Stale bits from an earlier scan must not survive.
    let stale = thread.reference_map().bit_index(stack.frame(1).sp);
    thread.reference_map_mut().set_bit(stale).unwrap();
    prepare_from_top(&stack, &program, &mut thread, &mut preparer, false).unwrap();

    assert_eq!(thread.reference_map(), &first);
    assert_eq!(preparer.scan_count(), 2);
}

#[test]
fn marked_slots_lie_in_the_active_stack() {
    let program = Program::new().unwrap();
    let stack = managed_stack(&program, 0x8);
    let mut thread = stack.thread(1);
    let mut preparer = StackReferenceMapPreparer::new(false, true);

    prepare_from_top(&stack, &program, &mut thread, &mut preparer, false).unwrap();

    for slot in set_slots(thread.reference_map()) {
        assert!(slot >= thread.lowest_active_slot() && slot <= thread.highest_stack_slot());
    }
}

#[test]
fn ignoring_the_top_frame_skips_its_references() {
    let program = Program::new().unwrap();
    let stack = managed_stack(&program, 0x8);
    let mut thread = stack.thread(1);
    let mut preparer = StackReferenceMapPreparer::new(false, true);

    prepare_from_top(&stack, &program, &mut thread, &mut preparer, true).unwrap();

    assert!(set_slots(thread.reference_map()).is_empty());
    assert_eq!(preparer.stats().frames_prepared, 3);
}

#[test]
fn a_frame_stopped_outside_a_safepoint_is_fatal() {
    let program = Program::new().unwrap();
    let stack = managed_stack(&program, 0xc);
    let mut thread = stack.thread(1);
    let mut preparer = StackReferenceMapPreparer::new(false, true);

    let result = prepare_from_top(&stack, &program, &mut thread, &mut preparer, false);

    assert_eq!(
        result,
        Err(Error::MissingSafepoint {
            method: program.method(program.leaf).code_start(),
            pos: 0xc
        })
    );
}

#[test]
fn verification_accepts_references_and_null() {
    let program = Program::new().unwrap();
    let mut stack = managed_stack(&program, 0x8);
    let mut thread = stack.thread(1);
    let mut verifier = StackReferenceMapPreparer::verifier();
    let (ip, sp, fp) = stack.top();

    {
        let mut walker = StackFrameWalker::new(&stack, &program.code, PLATFORM);
        verifier
            .verify_reference_maps(&mut walker, &mut thread, &HEAP, ip, sp, fp)
            .unwrap();
    }
    assert!(set_slots(thread.reference_map()).is_empty());

    stack.set_local(0, 0);
    let mut walker = StackFrameWalker::new(&stack, &program.code, PLATFORM);
    verifier
        .verify_reference_maps(&mut walker, &mut thread, &HEAP, ip, sp, fp)
        .unwrap();
}

#[test]
fn verification_rejects_a_marked_slot_without_a_reference() {
    let program = Program::new().unwrap();
    let mut stack = managed_stack(&program, 0x8);
    stack.set_local(0, 0x5000);
    let mut thread = stack.thread(1);
    let options = Options {
        verify_ref_maps: true,
        ..Options::default()
    };
    let mut preparer = StackReferenceMapPreparer::from_options(&options);

    let result = prepare_from_top(&stack, &program, &mut thread, &mut preparer, false);

    assert_eq!(
        result,
        Err(Error::InvalidReference {
            slot: stack.frame(3).sp,
            value: 0x5000,
            safepoint: 0
        })
    );
}

#[test]
fn verification_rejects_tagged_values() {
    let program = Program::new().unwrap();
    let mut stack = managed_stack(&program, 0x8);
    stack.set_local(0, object(1) + 1);
    let mut thread = stack.thread(1);
    let mut preparer = StackReferenceMapPreparer::new(true, true);

    let result = prepare_from_top(&stack, &program, &mut thread, &mut preparer, false);

    assert!(matches!(result, Err(Error::InvalidReference { .. })));
}

#[test]
fn thread_in_native_is_prepared_from_its_anchor() {
    let program = Program::new().unwrap();
    let stack = native_stack(&program);
    let mut thread = stack.thread(1);
    let mut preparer = StackReferenceMapPreparer::new(false, true);
    let mut walker = StackFrameWalker::new(&stack, &program.code, PLATFORM);

    preparer
        .prepare_stack_reference_map(&mut walker, &mut thread, &HEAP)
        .unwrap();

    let stub = stack.frame(2);
    assert_eq!(set_slots(thread.reference_map()), [stub.sp]);
    assert_eq!(thread.lowest_active_slot(), stub.sp);
    assert_eq!(preparer.stats().frames_prepared, 3);

    let mut roots = Vec::new();
    thread
        .scan_references(&stack, &HEAP, |slot| roots.push(slot))
        .unwrap();
    assert_eq!(roots, [stub.sp]);
}

#[test]
fn thread_without_anchor_has_an_empty_map() {
    let program = Program::new().unwrap();
    let stack = native_stack(&program);
    let mut thread = stack.thread(1);
    thread.set_last_anchor(Addr::ZERO);
    let mut preparer = StackReferenceMapPreparer::new(false, true);
    let mut walker = StackFrameWalker::new(&stack, &program.code, PLATFORM);

    preparer
        .prepare_stack_reference_map(&mut walker, &mut thread, &HEAP)
        .unwrap();

    assert!(set_slots(thread.reference_map()).is_empty());
    assert_eq!(preparer.scan_count(), 0);
}

#[test]
fn register_references_do_not_outlive_their_trap() {
    let program = Program::new().unwrap();
    let mut trapped = managed_stack(&program, 0x8);
    trapped.set_spill(0, object(5));
    let mut thread = trapped.thread(1);
    let mut preparer = StackReferenceMapPreparer::new(false, true);
    {
        let mut walker = StackFrameWalker::new(&trapped, &program.code, PLATFORM);
        preparer
            .prepare_stack_reference_map_from_trap(&mut walker, &mut thread, &HEAP, &trapped.trap_state(3, 0b1))
            .unwrap();
    }
    assert!(thread.reference_map().is_slot_set(STACK_BASE));

    // The next pause finds the thread blocked in native code.
    let blocked = native_stack(&program);
    thread.set_last_anchor(blocked.last_anchor());
    let mut walker = StackFrameWalker::new(&blocked, &program.code, PLATFORM);
    preparer
        .prepare_stack_reference_map(&mut walker, &mut thread, &HEAP)
        .unwrap();

    let mut roots = Vec::new();
    thread
        .scan_references(&blocked, &HEAP, |slot| roots.push(slot))
        .unwrap();
    assert_eq!(roots, [blocked.frame(2).sp]);
}

#[test]
fn thread_that_left_managed_code_has_no_roots() {
    let program = Program::new().unwrap();
    let stack = native_stack(&program);
    let mut thread = stack.thread(1);
    let mut preparer = StackReferenceMapPreparer::new(false, true);
    let mut walker = StackFrameWalker::new(&stack, &program.code, PLATFORM);
    preparer
        .prepare_stack_reference_map(&mut walker, &mut thread, &HEAP)
        .unwrap();
    assert!(!set_slots(thread.reference_map()).is_empty());

    thread.set_last_anchor(Addr::ZERO);
    preparer
        .prepare_stack_reference_map(&mut walker, &mut thread, &HEAP)
        .unwrap();

    assert!(set_slots(thread.reference_map()).is_empty());
    assert_eq!(thread.lowest_active_slot(), thread.highest_stack_slot());
    let mut roots = Vec::new();
    thread
        .scan_references(&stack, &HEAP, |slot| roots.push(slot))
        .unwrap();
    assert!(roots.is_empty(), "{roots:?}");
}

#[test]
fn thread_in_managed_code_is_not_stopped() {
    let program = Program::new().unwrap();
    let stack = managed_stack(&program, 0x8);
    let mut thread = stack.thread(1);
    let mut preparer = StackReferenceMapPreparer::new(false, true);
    let mut walker = StackFrameWalker::new(&stack, &program.code, PLATFORM);

    assert_eq!(
        preparer.prepare_stack_reference_map(&mut walker, &mut thread, &HEAP),
        Err(Error::ThreadNotStopped)
    );
    assert_eq!(
        preparer.complete_stack_reference_map(&mut walker, &mut thread, &HEAP),
        Err(Error::ThreadNotStopped)
    );
}

#[test]
fn trap_then_completion_covers_every_frame() {
    let program = Program::new().unwrap();
    let mut stack = SimStack::new(&program.code, PLATFORM, 256, 4);
    stack
        .enter(program.run, THREAD_START)
        .call(program.main, 0x10)
        .call(program.helper, 0x20)
        .set_operand(0, object(3))
        .trap(program.trap, 0x34, &[object(1), 7, object(2), 9])
        .set_spill(0, object(5))
        .set_spill(1, object(6));
    let mut thread = stack.thread(1);
    let mut preparer = StackReferenceMapPreparer::new(true, true);

    // Stopped by the trap, before blocking.
    {
        let mut walker = StackFrameWalker::new(&stack, &program.code, PLATFORM);
        preparer
            .prepare_stack_reference_map_from_trap(&mut walker, &mut thread, &HEAP, &stack.trap_state(2, 0b11))
            .unwrap();
    }
    let helper = stack.frame(2);
    assert_eq!(thread.lowest_active_slot(), helper.sp);

    // The trap handler blocks in native code.
    stack
        .call(program.stub, 0x10)
        .set_local(0, object(4))
        .call_native(0x10, NATIVE_PC, 6);
    thread.set_last_anchor(stack.last_anchor());
    {
        let mut walker = StackFrameWalker::new(&stack, &program.code, PLATFORM);
        preparer
            .complete_stack_reference_map(&mut walker, &mut thread, &HEAP)
            .unwrap();
    }

    let trap = stack.frame(3);
    let stub = stack.frame(4);
    assert_eq!(thread.lowest_active_slot(), stub.sp);
    let mut roots = Vec::new();
    thread
        .scan_references(&stack, &HEAP, |slot| roots.push(slot))
        .unwrap();
    assert_eq!(
        roots,
        [
            STACK_BASE,
            STACK_BASE.plus_words(1),
            stub.sp,
            trap.sp,
            trap.sp.plus_words(2),
            helper.sp.plus_words(2),
        ]
    );
}

#[test]
fn scanning_detects_frames_pushed_after_preparation() {
    let program = Program::new().unwrap();
    let mut stack = native_stack(&program);
    let mut thread = stack.thread(1);
    let mut preparer = StackReferenceMapPreparer::new(false, true);
    {
        let mut walker = StackFrameWalker::new(&stack, &program.code, PLATFORM);
        preparer
            .prepare_stack_reference_map(&mut walker, &mut thread, &HEAP)
            .unwrap();
    }

    // An anchor of a later native call, below the prepared part of the stack.
    let anchor = STACK_BASE.plus_words(8);
    let sp = STACK_BASE.plus_words(16);
    for (i, word) in [0, NATIVE_PC.addr(), sp.addr(), sp.addr()].into_iter().enumerate() {
        stack.write(anchor.plus_words(i), word);
    }
    thread.set_last_anchor(anchor);

    assert_eq!(
        thread.scan_references(&stack, &HEAP, |_| {}),
        Err(Error::UncoveredSlots {
            sp,
            lowest_active: stack.frame(2).sp
        })
    );
}

#[test]
fn frame_bits_are_checked_before_they_are_applied() {
    let program = Program::new().unwrap();
    let stack = managed_stack(&program, 0x8);
    let mut thread = stack.thread(1);
    let mut preparer = StackReferenceMapPreparer::new(false, true);
    let leaf = stack.frame(3);
    let mut cursor = StackFrameCursor::default();
    cursor.start(None, leaf.ip, leaf.sp, leaf.fp);

    let mut pass = PreparationPass {
        preparer: &mut preparer,
        map: thread.reference_map_mut(),
        memory: &stack,
        oracle: &HEAP,
        bias: StackBias::NONE,
        thread_id: 1,
        safepoint: 0,
    };

    assert_eq!(
        pass.visit_reference_map_bits(&cursor, leaf.sp, 0b100, 2),
        Err(Error::ExtraneousBits { bits: 0b100, count: 2 })
    );
    assert_eq!(
        pass.visit_reference_map_bits(&cursor, STACK_BASE.minus_words(1), 1, 1),
        Err(Error::SlotNotInStack {
            slot: STACK_BASE.minus_words(1)
        })
    );
    pass.visit_reference_map_bits(&cursor, leaf.sp, 0b101, 3).unwrap();
    assert!(pass.map.is_slot_set(leaf.sp));
    assert!(!pass.map.is_slot_set(leaf.sp.plus_words(1)));
    assert!(pass.map.is_slot_set(leaf.sp.plus_words(2)));
}
