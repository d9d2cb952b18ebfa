use framewalk::arch::Platform;
use framewalk::inspect::{FrameLimit, StackTrace};
use framewalk::options::Options;
use framewalk::preparer::StackReferenceMapPreparer;
use framewalk::sim::{object, Program, SimStack, CAUGHT, HEAP, NATIVE_PC, NATIVE_RETURN, THREAD_START};
use framewalk::unwind::UnwindOutcome;
use framewalk::walk::{RawStackFrameVisitor, StackFrameCursor, StackFrameWalker};
use framewalk::OrHalt;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Default)]
struct FrameCounter {
    managed: usize,
    native: usize,
}

impl RawStackFrameVisitor for FrameCounter {
    fn visit_frame(&mut self, current: &StackFrameCursor<'_>, _callee: &StackFrameCursor<'_>) -> bool {
        if current.is_native() {
            self.native += 1;
        } else {
            self.managed += 1;
        }
        true
    }
}

fn main() {
    let registry = tracing_subscriber::Registry::default().with(
        EnvFilter::builder()
            .with_default_directive(tracing::Level::DEBUG.into())
            .from_env()
            .unwrap(),
    );

    let tree_layer = tracing_tree::HierarchicalLayer::new(2)
        .with_targets(true)
        .with_bracketed_fields(true);

    registry.with(tree_layer).init();

    let options = match Options::parse(std::env::args().skip(1)) {
        Ok(options) => options,
        Err(error) => {
            eprintln!("error: {error}");
            std::process::exit(2);
        }
    };

    let program = Program::new().or_halt();
    let platform = Platform::host();

    // run -> main -> native stub -> native code -> callback -> leaf
    let mut stack = SimStack::new(&program.code, platform, 512, 8);
    stack
        .enter(program.run, THREAD_START)
        .call(program.main, 0x10)
        .call(program.stub, 0x28)
        .set_local(0, object(9))
        .call_native(0x10, NATIVE_PC, 6)
        .enter(program.callback, NATIVE_RETURN)
        .call(program.leaf, 0x10)
        .set_local(0, object(1))
        .set_local(1, 42)
        .stop_at(0x8);
    stack.set_spill(0, object(2));

    let mut thread = stack.thread(1);
    let mut walker = StackFrameWalker::new(&stack, &program.code, platform)
        .with_tracing(options.trace_stack_walk);
    let (ip, sp, fp) = stack.top();
    let anchor = stack.last_anchor();

    let trace = StackTrace::capture(
        &mut walker,
        ip,
        sp,
        fp,
        anchor,
        FrameLimit::new(options.max_frames_display),
    );
    println!("stack of thread {}:\n{trace}", thread.id());

    let mut counter = FrameCounter::default();
    walker
        .inspect_raw(ip, sp, fp, anchor, &mut counter)
        .or_halt();
    println!(
        "{} managed frames, {} native frames",
        counter.managed, counter.native
    );

    let mut preparer = StackReferenceMapPreparer::from_options(&options);
    preparer
        .prepare_stack_reference_map_from_trap(
            &mut walker,
            &mut thread,
            &HEAP,
            &stack.trap_state(stack.frames().len() - 1, 0b1),
        )
        .or_halt();
    let mut roots = Vec::new();
    thread
        .scan_references(&stack, &HEAP, |slot| roots.push(slot))
        .or_halt();
    println!("{} stack roots: {roots:?}", roots.len());
    println!("{:?}", preparer.stats());

    match walker.unwind(ip, sp, fp, anchor, &CAUGHT).or_halt() {
        UnwindOutcome::HandlerFound(frame) => {
            println!("handler at {} in frame sp={}", frame.handler, frame.sp)
        }
        UnwindOutcome::EndOfStack { frames_unwound } => {
            println!("uncaught after unwinding {frames_unwound} frames")
        }
    }
    walker.reset();
}
