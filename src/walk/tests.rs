use std::string::{String, ToString};
use std::vec::Vec;

use proptest::prelude::*;

use super::*;
use crate::anchor::AnchorField;
use crate::bias::StackBias;
use crate::code::ClassId;
use crate::inspect::{FrameLimit, StackTrace};
use crate::sim::{object, Program, SimStack, CAUGHT, NATIVE_PC, NATIVE_RETURN, THREAD_START};

const PLATFORM: Platform = Platform {
    return_address_after_call: true,
    stack_bias: StackBias::NONE,
};

#[derive(Default)]
struct Recorder {
    frames: Vec<(Option<String>, Addr, bool)>,
    sps: Vec<Addr>,
    done: bool,
}

impl RawStackFrameVisitor for Recorder {
    fn visit_frame(&mut self, current: &StackFrameCursor<'_>, _callee: &StackFrameCursor<'_>) -> bool {
        self.frames.push((
            current.target_method().map(|tm| tm.region_name().to_string()),
            current.ip(),
            current.is_top_frame(),
        ));
        self.sps.push(current.sp());
        true
    }

    fn done(&mut self) {
        self.done = true;
    }
}

fn name(frame: &(Option<String>, Addr, bool)) -> &str {
    frame.0.as_deref().unwrap_or("<native>")
}

/// run -> main -> stub -> native -> callback -> leaf
fn nested_stack<'c>(program: &'c Program, platform: Platform) -> SimStack<'c> {
    let mut stack = SimStack::new(&program.code, platform, 256, 4);
    stack
        .enter(program.run, THREAD_START)
        .call(program.main, 0x10)
        .call(program.stub, 0x28)
        .call_native(0x10, NATIVE_PC, 6)
        .enter(program.callback, NATIVE_RETURN)
        .call(program.leaf, 0x10)
        .set_local(0, object(1))
        .stop_at(0x8);
    stack
}

/// run -> main -> helper -> leaf
fn managed_stack<'c>(program: &'c Program, platform: Platform) -> SimStack<'c> {
    let mut stack = SimStack::new(&program.code, platform, 256, 4);
    stack
        .enter(program.run, THREAD_START)
        .call(program.main, 0x10)
        .call(program.helper, 0x20)
        .call(program.leaf, 0x30)
        .set_local(0, object(1))
        .set_local(1, 42)
        .stop_at(0x8);
    stack
}

/// run followed by one region of main frames per entry in `regions`. Every
/// region after the first is entered from native code through the native
/// stub and callback. Returns the stack with the names its frames are
/// expected to be walked with, top first.
fn interleaved_stack<'c>(
    program: &'c Program,
    regions: &[usize],
    ends_in_native: bool,
) -> (SimStack<'c>, Vec<&'static str>) {
    let mut stack = SimStack::new(&program.code, PLATFORM, 512, 4);
    let mut expected = vec!["<native>", "VmThread.run"];
    stack.enter(program.run, THREAD_START);
    let mut call_pos = 0x10;
    for (i, &calls) in regions.iter().enumerate() {
        if i > 0 {
            stack
                .call(program.stub, call_pos)
                .call_native(0x10, NATIVE_PC, 6)
                .enter(program.callback, NATIVE_RETURN);
            expected.extend(["<native stub>", "<native>", "<vm entry stub>"]);
            call_pos = 0x10;
        }
        for _ in 0..calls {
            stack.call(program.main, call_pos);
            expected.push("main");
            call_pos = 0x20;
        }
    }
    if ends_in_native {
        stack.call(program.stub, call_pos).call_native(0x10, NATIVE_PC, 6);
        expected.extend(["<native stub>", "<native>"]);
    } else {
        stack.stop_at(call_pos);
    }
    expected.reverse();
    (stack, expected)
}

fn raw_walk(stack: &SimStack<'_>, program: &Program) -> Result<Recorder> {
    let mut walker = StackFrameWalker::new(stack, &program.code, stack.platform());
    let mut recorder = Recorder::default();
    let (ip, sp, fp) = stack.top();
    walker.inspect_raw(ip, sp, fp, stack.last_anchor(), &mut recorder)?;
    assert!(!walker.is_in_use());
    Ok(recorder)
}

#[test]
fn raw_walk_visits_managed_and_native_frames_callee_first() {
    let program = Program::new().unwrap();
    let stack = nested_stack(&program, PLATFORM);

    let recorder = raw_walk(&stack, &program).unwrap();

    let names: Vec<&str> = recorder.frames.iter().map(name).collect();
    assert_eq!(
        names,
        [
            "leaf",
            "<vm entry stub>",
            "<native>",
            "<native stub>",
            "main",
            "VmThread.run",
            "<native>",
        ]
    );
    let ips: Vec<Addr> = recorder.frames.iter().map(|f| f.1).collect();
    assert_eq!(
        ips,
        [
            program.method(program.leaf).address_of(0x8),
            program.method(program.callback).address_of(0x10),
            NATIVE_RETURN,
            program.method(program.stub).address_of(0x10),
            program.method(program.main).address_of(0x28),
            program.method(program.run).address_of(0x10),
            THREAD_START,
        ]
    );
    let tops: Vec<bool> = recorder.frames.iter().map(|f| f.2).collect();
    assert_eq!(tops, [true, false, false, false, false, false, false]);
    assert!(recorder.done);
}

proptest! {
    #[test]
    fn raw_walk_visits_every_frame_once_from_callee_to_caller(
        regions in proptest::collection::vec(0usize..6, 1..5),
        ends_in_native in any::<bool>(),
    ) {
        let program = Program::new().unwrap();
        let (stack, expected) = interleaved_stack(&program, &regions, ends_in_native);

        let recorder = raw_walk(&stack, &program).unwrap();

        // Every pushed frame plus the thread start routine at the bottom.
        prop_assert_eq!(recorder.frames.len(), stack.frames().len() + 1);
        let names: Vec<&str> = recorder.frames.iter().map(name).collect();
        prop_assert_eq!(names, expected);
        prop_assert!(
            recorder.sps.windows(2).all(|pair| pair[0] < pair[1]),
            "frames not visited callee first: {:?}",
            recorder.sps
        );
        prop_assert_eq!(recorder.frames.last().map(|frame| frame.1), Some(THREAD_START));
        prop_assert!(recorder.frames[0].2);
        prop_assert!(recorder.done);
    }
}

#[test]
fn walk_of_a_thread_in_native_starts_at_the_native_frame() {
    let program = Program::new().unwrap();
    let mut stack = SimStack::new(&program.code, PLATFORM, 256, 4);
    stack
        .enter(program.run, THREAD_START)
        .call(program.main, 0x10)
        .call(program.stub, 0x28)
        .call_native(0x10, NATIVE_PC, 6);

    let recorder = raw_walk(&stack, &program).unwrap();

    let names: Vec<&str> = recorder.frames.iter().map(name).collect();
    assert_eq!(
        names,
        ["<native>", "<native stub>", "main", "VmThread.run", "<native>"]
    );
    assert_eq!(recorder.frames[0].1, NATIVE_PC);
    assert!(recorder.frames[0].2);
}

#[test]
fn biased_stack_walks_the_same_frames() {
    let program = Program::new().unwrap();
    let platform = Platform {
            return_address_after_call: false,
        stack_bias: StackBias::SPARC_V9,
    };
    let stack = nested_stack(&program, platform);

    let recorder = raw_walk(&stack, &program).unwrap();

    assert_eq!(recorder.frames.len(), 7);
    assert_eq!(recorder.frames[4].0.as_deref(), Some("main"));
}

#[test]
fn adjacent_entry_anchors_are_fatal() {
    let program = Program::new().unwrap();
    let mut stack = SimStack::new(&program.code, PLATFORM, 256, 4);
    stack
        .enter(program.run, THREAD_START)
        .call(program.main, 0x10)
        .call(program.stub, 0x28)
        .call_native(0x10, NATIVE_PC, 6);
    let exit_anchor = stack.last_anchor();
    stack.enter(program.callback, NATIVE_RETURN).stop_at(0x10);
    // Turn the exit anchor into a second entry anchor.
    stack.write(exit_anchor.plus(AnchorField::Pc.offset()), 0);

    let result = raw_walk(&stack, &program);

    assert!(matches!(
        result,
        Err(Error::AdjacentEntryAnchors { anchor }) if anchor == exit_anchor
    ));
}

#[test]
fn anchor_linking_to_itself_is_fatal() {
    let program = Program::new().unwrap();
    let mut stack = nested_stack(&program, PLATFORM);
    let exit_anchor = program
        .method(program.stub)
        .anchor_offset()
        .map(|offset| stack.frame(2).sp.plus(offset))
        .unwrap();
    stack.write(exit_anchor.plus(AnchorField::Previous.offset()), exit_anchor.addr());

    let result = raw_walk(&stack, &program);

    assert_eq!(
        result.err(),
        Some(Error::AnchorChainNotAscending {
            anchor: exit_anchor,
            previous: exit_anchor
        })
    );
}

#[test]
fn anchor_linking_down_the_stack_is_fatal() {
    let program = Program::new().unwrap();
    let mut stack = nested_stack(&program, PLATFORM);
    let entry_anchor = stack.last_anchor();
    let exit_anchor = program
        .method(program.stub)
        .anchor_offset()
        .map(|offset| stack.frame(2).sp.plus(offset))
        .unwrap();
    // The exit anchor links back to the newer entry anchor below it.
    stack.write(exit_anchor.plus(AnchorField::Previous.offset()), entry_anchor.addr());
    let mut walker = StackFrameWalker::new(&stack, &program.code, PLATFORM);
    let (ip, sp, fp) = stack.top();

    let result = walker.unwind(ip, sp, fp, entry_anchor, &ClassId(8));

    assert_eq!(
        result,
        Err(Error::AnchorChainNotAscending {
            anchor: exit_anchor,
            previous: entry_anchor
        })
    );
}

#[test]
fn entry_point_called_from_managed_code_is_fatal() {
    let program = Program::new().unwrap();
    let mut stack = SimStack::new(&program.code, PLATFORM, 256, 4);
    stack
        .enter(program.run, THREAD_START)
        .call(program.callback, 0x10)
        .stop_at(0x10);

    let result = raw_walk(&stack, &program);

    assert_eq!(
        result.err(),
        Some(Error::EntryPointCalledFromManaged {
            caller: program.method(program.run).code_start()
        })
    );
}

#[test]
fn native_code_calling_ordinary_method_is_fatal() {
    let program = Program::new().unwrap();
    let mut stack = managed_stack(&program, PLATFORM);
    let leaf = stack.frame(3);
    let ret = leaf.sp.plus(program.method(program.leaf).return_address_offset());
    stack.write(ret, 0x7000_5000);

    let result = raw_walk(&stack, &program);

    assert_eq!(
        result.err(),
        Some(Error::NativeCalledNonEntryPoint {
            callee: program.method(program.leaf).code_start()
        })
    );
}

#[test]
fn visitor_can_stop_the_walk() {
    struct TwoFrames(usize);
    impl RawStackFrameVisitor for TwoFrames {
        fn visit_frame(&mut self, _: &StackFrameCursor<'_>, _: &StackFrameCursor<'_>) -> bool {
            self.0 += 1;
            self.0 < 2
        }
    }

    let program = Program::new().unwrap();
    let stack = managed_stack(&program, PLATFORM);
    let mut walker = StackFrameWalker::new(&stack, &program.code, PLATFORM);
    let mut visitor = TwoFrames(0);
    let (ip, sp, fp) = stack.top();

    walker
        .inspect_raw(ip, sp, fp, stack.last_anchor(), &mut visitor)
        .unwrap();

    assert_eq!(visitor.0, 2);
    assert!(!walker.is_in_use());
}

#[test]
fn unwinding_stops_at_the_handling_frame() {
    let program = Program::new().unwrap();
    let stack = managed_stack(&program, PLATFORM);
    let mut walker = StackFrameWalker::new(&stack, &program.code, PLATFORM);
    let (ip, sp, fp) = stack.top();

    let outcome = walker
        .unwind(ip, sp, fp, stack.last_anchor(), &CAUGHT)
        .unwrap();

    let helper = stack.frame(2);
    let method = program.method(program.helper);
    assert_eq!(
        outcome,
        UnwindOutcome::HandlerFound(HandlerFrame {
            method: method.code_start(),
            handler: method.address_of(0x80),
            sp: helper.sp,
            fp: helper.fp,
            frames_unwound: 1,
        })
    );
}

#[test]
fn unwinding_without_a_handler_reaches_the_end_of_the_stack() {
    let program = Program::new().unwrap();
    let stack = managed_stack(&program, PLATFORM);
    let mut walker = StackFrameWalker::new(&stack, &program.code, PLATFORM);
    let (ip, sp, fp) = stack.top();

    let outcome = walker
        .unwind(ip, sp, fp, stack.last_anchor(), &ClassId(8))
        .unwrap();

    assert_eq!(outcome, UnwindOutcome::EndOfStack { frames_unwound: 4 });
}

#[test]
fn walker_stays_in_use_after_unwinding_until_reset() {
    let program = Program::new().unwrap();
    let stack = managed_stack(&program, PLATFORM);
    let mut walker = StackFrameWalker::new(&stack, &program.code, PLATFORM);
    let (ip, sp, fp) = stack.top();
    let anchor = stack.last_anchor();

    walker.unwind(ip, sp, fp, anchor, &CAUGHT).unwrap();
    assert!(walker.is_in_use());
    assert_eq!(walker.purpose(), Some(Purpose::ExceptionHandling));

    let mut recorder = Recorder::default();
    assert_eq!(
        walker.inspect_raw(ip, sp, fp, anchor, &mut recorder),
        Err(Error::WalkerInUse)
    );
    assert!(!walker.is_in_use());

    walker.unwind(ip, sp, fp, anchor, &CAUGHT).unwrap();
    walker.reset();
    let mut recorder = Recorder::default();
    walker.inspect_raw(ip, sp, fp, anchor, &mut recorder).unwrap();
    assert_eq!(recorder.frames.len(), 5);
}

#[test]
fn typed_inspection_links_frames_to_their_callees() {
    let program = Program::new().unwrap();
    let stack = nested_stack(&program, PLATFORM);
    let mut walker = StackFrameWalker::new(&stack, &program.code, PLATFORM);
    let (ip, sp, fp) = stack.top();

    let trace = StackTrace::capture(&mut walker, ip, sp, fp, stack.last_anchor(), FrameLimit::default());

    assert_eq!(trace.len(), 7);
    assert!(!trace.is_truncated());
    assert!(trace.error().is_none());
    assert_eq!(trace.get(0).and_then(StackFrame::callee), None);
    for i in 1..trace.len() {
        assert_eq!(trace.get(i).and_then(StackFrame::callee), Some(i - 1));
        assert_eq!(trace.caller_of(i - 1), trace.get(i));
        assert_eq!(trace.callee_of(i), trace.get(i - 1));
    }
    match trace.get(0) {
        Some(StackFrame::Managed(leaf)) => {
            assert_eq!(leaf.name, "leaf");
            assert_eq!(leaf.pos, 0x8);
            assert!(leaf.is_top_frame);
        }
        other => panic!("unexpected top frame {other:?}"),
    }
    assert!(matches!(trace.get(2), Some(StackFrame::Native(f)) if f.ip == NATIVE_RETURN));

    let dump = trace.to_string();
    assert!(dump.contains("leaf+0x8"), "{dump}");
    assert!(dump.contains("<native stub>+0x10"), "{dump}");
}

#[test]
fn native_frames_are_named_only_when_walking_this_process() {
    let program = Program::new().unwrap();
    let native_pc = Addr(libc::getpid as usize);
    let mut stack = SimStack::new(&program.code, PLATFORM, 256, 4);
    stack
        .enter(program.run, THREAD_START)
        .call(program.main, 0x10)
        .call(program.stub, 0x28)
        .call_native(0x10, native_pc, 6);
    let (ip, sp, fp) = stack.top();
    let anchor = stack.last_anchor();

    let mut walker = StackFrameWalker::new(&stack, &program.code, PLATFORM);
    let trace = StackTrace::capture(&mut walker, ip, sp, fp, anchor, FrameLimit::default());
    assert!(
        matches!(trace.get(0), Some(StackFrame::Native(f)) if f.ip == native_pc && f.symbol.is_none()),
        "{trace}"
    );

    let mut walker = StackFrameWalker::new(&stack, &program.code, PLATFORM).with_native_symbols(true);
    let trace = StackTrace::capture(&mut walker, ip, sp, fp, anchor, FrameLimit::default());
    match trace.get(0) {
        Some(StackFrame::Native(frame)) => assert!(
            frame.symbol.as_deref().is_some_and(|symbol| symbol.contains("getpid")),
            "{frame:?}"
        ),
        other => panic!("unexpected top frame {other:?}"),
    }
}

#[test]
fn typed_inspection_truncates_and_extends() {
    let program = Program::new().unwrap();
    let stack = nested_stack(&program, PLATFORM);
    let mut walker = StackFrameWalker::new(&stack, &program.code, PLATFORM);
    let (ip, sp, fp) = stack.top();
    let anchor = stack.last_anchor();
    let mut limit = FrameLimit::new(3);

    let trace = StackTrace::capture(&mut walker, ip, sp, fp, anchor, limit);
    assert_eq!(trace.len(), 4);
    assert!(trace.is_truncated());
    assert_eq!(trace.get(3).and_then(StackFrame::callee), Some(2));

    limit.extend();
    let trace = StackTrace::capture(&mut walker, ip, sp, fp, anchor, limit);
    assert_eq!(limit.max(), 6);
    assert_eq!(trace.len(), 7);
    assert!(trace.is_truncated());

    limit.extend();
    let trace = StackTrace::capture(&mut walker, ip, sp, fp, anchor, limit);
    assert_eq!(trace.len(), 7);
    assert!(!trace.is_truncated());
}

#[test]
fn typed_inspection_reports_a_broken_stack_as_an_error_frame() {
    let program = Program::new().unwrap();
    let mut stack = nested_stack(&program, PLATFORM);
    let exit_anchor = program
        .method(program.stub)
        .anchor_offset()
        .map(|offset| stack.frame(2).sp.plus(offset))
        .unwrap();
    stack.write(exit_anchor.plus(AnchorField::Pc.offset()), 0);
    let mut walker = StackFrameWalker::new(&stack, &program.code, PLATFORM);
    let (ip, sp, fp) = stack.top();

    let trace = StackTrace::capture(&mut walker, ip, sp, fp, stack.last_anchor(), FrameLimit::default());

    assert_eq!(trace.len(), 4);
    assert_eq!(
        trace.error(),
        Some(Error::AdjacentEntryAnchors {
            anchor: exit_anchor
        })
    );
    assert_eq!(trace.get(3).and_then(StackFrame::callee), Some(2));
    assert!(!walker.is_in_use());
}
