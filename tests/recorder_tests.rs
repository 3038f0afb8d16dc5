use std::sync::{Arc, Mutex};

use tjit::{
    BailoutSlot, CompileError, Fragment, Mode, NATIVE_CONTINUE, OpCode, Params, TraceCompiler,
    TraceJit, TraceRequest, TraceType, Value, VmRegisters,
};

#[derive(Default)]
struct RecordingCompiler {
    calls: Mutex<Vec<TraceRequest>>,
}

impl RecordingCompiler {
    fn calls(&self) -> Vec<TraceRequest> {
        self.calls.lock().expect("compiler calls lock").clone()
    }
}

impl TraceCompiler for RecordingCompiler {
    fn compile(&self, jit: &TraceJit, request: TraceRequest) -> Result<(), CompileError> {
        self.calls.lock().expect("compiler calls lock").push(request);
        jit.increment_trace_id();
        Ok(())
    }
}

struct FailingCompiler;

impl TraceCompiler for FailingCompiler {
    fn compile(&self, _jit: &TraceJit, _request: TraceRequest) -> Result<(), CompileError> {
        Err(CompileError::Backend("no codegen for target".to_string()))
    }
}

/// Root fragment whose type-guard always passes; used as a link target.
struct AlwaysFragment {
    id: usize,
    entry_ip: usize,
    downrec: bool,
    uprec: bool,
}

impl Fragment for AlwaysFragment {
    fn id(&self) -> usize {
        self.id
    }

    fn entry_ip(&self) -> usize {
        self.entry_ip
    }

    fn exit_count(&self, _exit: usize) -> u32 {
        0
    }

    fn set_exit_count(&self, _exit: usize, _count: u32) {}

    fn num_children(&self) -> u32 {
        0
    }

    fn is_downrec(&self) -> bool {
        self.downrec
    }

    fn is_uprec(&self) -> bool {
        self.uprec
    }

    fn matches(&self, _locals: &[Value]) -> bool {
        true
    }

    fn execute(&self, _vp: &mut VmRegisters, _bailout: &mut BailoutSlot) -> i32 {
        NATIVE_CONTINUE
    }
}

fn engine_with_compiler() -> (TraceJit, Arc<RecordingCompiler>) {
    let compiler = Arc::new(RecordingCompiler::default());
    let jit = TraceJit::new(Params::new(), Box::new(compiler.clone()));
    (jit, compiler)
}

fn registers(ip: usize) -> VmRegisters {
    VmRegisters {
        ip,
        sp: 8,
        ra: 0x80,
        dl: 2,
        locals: vec![Value::Fixnum(3), Value::Boolean(false)],
    }
}

fn code_with(words: &[(usize, u32)], len: usize) -> Vec<u32> {
    let mut code = vec![OpCode::Nop as u32; len];
    for &(index, word) in words {
        code[index] = word;
    }
    code
}

#[test]
fn overflowing_recording_aborts_and_blacklists_loop_start() {
    let (jit, compiler) = engine_with_compiler();
    jit.params().set_max_record(4).expect("set max-record");
    jit.with_state(|state| state.start_recording(300, 396, TraceType::Jump));

    let code = vec![OpCode::Add as u32; 100];
    let mut vp = registers(304);
    for step in 0..5 {
        vp.ip = 304 + step * 4;
        jit.merge(&mut vp, &code);
    }

    assert_eq!(jit.failure_count(300), 1);
    jit.with_state(|state| {
        assert_eq!(state.mode, Mode::Interpret);
        assert_eq!(state.bc_idx(), 0);
    });
    assert!(compiler.calls().is_empty());
}

#[test]
fn call_trace_unrolls_then_finishes_downrec() {
    let (jit, compiler) = engine_with_compiler();
    jit.with_state(|state| state.start_recording(500, 900, TraceType::Call));

    let code = code_with(&[(125, OpCode::Call as u32)], 130);
    let mut vp = registers(500);
    jit.merge(&mut vp, &code);
    jit.merge(&mut vp, &code);
    jit.with_state(|state| {
        assert_eq!(state.nunrolled, 2);
        assert_eq!(state.traces.len(), 2);
    });
    jit.merge(&mut vp, &code);

    let calls = compiler.calls();
    assert_eq!(calls.len(), 1);
    let request = &calls[0];
    assert!(request.loop_p);
    assert!(request.downrec_p);
    assert!(!request.uprec_p);
    assert_eq!(request.linked_ip, 500);
    assert_eq!(request.steps.len(), 2);
    assert_eq!(request.bytecode.len(), 2 * OpCode::Call.size());
    jit.with_state(|state| assert_eq!(state.mode, Mode::Interpret));
}

#[test]
fn jump_recording_aborts_at_foreign_compiled_loop() {
    let (jit, compiler) = engine_with_compiler();
    jit.add_root_ip(640);
    jit.directory().insert_root(Arc::new(AlwaysFragment {
        id: 9,
        entry_ip: 640,
        downrec: false,
        uprec: false,
    }));
    jit.with_state(|state| state.start_recording(600, 600, TraceType::Jump));

    let mut vp = registers(640);
    jit.merge(&mut vp, &code_with(&[], 200));

    assert_eq!(jit.failure_count(600), 1);
    jit.with_state(|state| assert_eq!(state.mode, Mode::Interpret));
    assert!(compiler.calls().is_empty());
}

#[test]
fn side_recording_matching_immediately_counts_as_failure() {
    let (jit, compiler) = engine_with_compiler();
    jit.add_root_ip(740);
    jit.directory().insert_root(Arc::new(AlwaysFragment {
        id: 4,
        entry_ip: 740,
        downrec: false,
        uprec: false,
    }));
    jit.with_state(|state| {
        state.start_recording(700, 740, TraceType::Side);
        state.parent_fragment = Some(4);
        state.parent_exit = Some(0);
    });

    let mut vp = registers(740);
    jit.merge(&mut vp, &code_with(&[], 200));

    assert_eq!(jit.failure_count(700), 1);
    jit.with_state(|state| assert_eq!(state.mode, Mode::Interpret));
    assert!(compiler.calls().is_empty());
}

#[test]
fn side_recording_links_into_matching_root() {
    let (jit, compiler) = engine_with_compiler();
    jit.add_root_ip(840);
    jit.directory().insert_root(Arc::new(AlwaysFragment {
        id: 7,
        entry_ip: 840,
        downrec: false,
        uprec: false,
    }));
    jit.with_state(|state| {
        state.start_recording(800, 840, TraceType::Side);
        state.parent_fragment = Some(7);
        state.parent_exit = Some(2);
    });

    let code = code_with(&[], 300);
    let mut vp = registers(804);
    jit.merge(&mut vp, &code);
    vp.ip = 808;
    jit.merge(&mut vp, &code);
    vp.ip = 840;
    jit.merge(&mut vp, &code);

    let calls = compiler.calls();
    assert_eq!(calls.len(), 1);
    let request = &calls[0];
    assert!(!request.loop_p);
    assert_eq!(request.linked_ip, 840);
    assert_eq!(request.parent_fragment, Some(7));
    assert_eq!(request.parent_exit, Some(2));
    assert_eq!(request.steps.len(), 2);
}

#[test]
fn hot_non_recursive_call_stops_without_failure() {
    let (jit, compiler) = engine_with_compiler();
    jit.with_state(|state| state.start_recording(900, 940, TraceType::Call));

    let mut vp = registers(940);
    jit.merge(&mut vp, &code_with(&[], 300));

    assert_eq!(jit.failure_count(900), 0);
    jit.with_state(|state| assert_eq!(state.mode, Mode::Interpret));
    assert!(compiler.calls().is_empty());
}

#[test]
fn return_trace_linking_upward_recursive_fragment_finishes_non_looping() {
    let (jit, compiler) = engine_with_compiler();
    jit.add_root_ip(1340);
    jit.directory().insert_root(Arc::new(AlwaysFragment {
        id: 11,
        entry_ip: 1340,
        downrec: false,
        uprec: true,
    }));
    jit.with_state(|state| {
        state.start_recording(1300, 1400, TraceType::Return);
        state.nunrolled = 2;
        state.record(
            &registers(1304),
            &code_with(&[(326, OpCode::Return as u32)], 340),
        );
    });

    let mut vp = registers(1340);
    jit.merge(&mut vp, &code_with(&[], 340));

    let calls = compiler.calls();
    assert_eq!(calls.len(), 1);
    let request = &calls[0];
    assert!(!request.loop_p);
    assert!(!request.downrec_p);
    assert!(request.uprec_p);
    assert_eq!(request.linked_ip, 1340);
}

#[test]
fn unroll_state_does_not_leak_across_sessions() {
    let (jit, _compiler) = engine_with_compiler();
    jit.with_state(|state| state.start_recording(1000, 1100, TraceType::Call));

    let code = code_with(&[(250, OpCode::Call as u32)], 260);
    let mut vp = registers(1000);
    jit.merge(&mut vp, &code);
    jit.with_state(|state| assert_eq!(state.nunrolled, 1));

    vp.ip = 1100;
    jit.merge(&mut vp, &code);
    jit.with_state(|state| {
        assert_eq!(state.mode, Mode::Interpret);
        assert_eq!(state.nunrolled, 0);
        assert_eq!(state.bc_idx(), 0);
        state.start_recording(1200, 1200, TraceType::Jump);
        assert_eq!(state.nunrolled, 0);
        assert!(state.traces.is_empty());
    });
}

#[test]
fn compiler_failure_bumps_failed_counter_at_loop_start() {
    let jit = TraceJit::new(Params::new(), Box::new(FailingCompiler));
    jit.with_state(|state| state.start_recording(1400, 1400, TraceType::Jump));

    let mut vp = registers(1400);
    jit.merge(&mut vp, &code_with(&[(350, OpCode::Br as u32)], 360));

    assert_eq!(jit.failure_count(1400), 1);
    assert_eq!(jit.trace_id(), 1);
    jit.with_state(|state| assert_eq!(state.mode, Mode::Interpret));
}
