use std::cell::RefCell;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use tracing::{debug, warn};

use crate::counters::CounterTable;
use crate::fragment::{Fragment, FragmentDirectory, TraceId};
use crate::host::{NATIVE_CONTINUE, TraceCompiler, TraceRequest, VmRegisters};
use crate::params::{ENGINE_TJIT, Params};
use crate::recorder::{TjitState, TraceType};

pub const INC_JUMP: u16 = 1;
pub const INC_CALL: u16 = 1;
pub const INC_TCALL: u16 = 1;
pub const INC_RETURN: u16 = 1;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EnterStatus {
    /// Proceed with the jump in the interpreter.
    Interpret,
    /// Native code ran; `vp.ip` holds the resume target.
    Dispatched,
}

thread_local! {
    static TJIT_STATE: RefCell<Option<TjitState>> = const { RefCell::new(None) };
}

/// The tracing-JIT control core: hot-path detection, trace recording,
/// compiler hand-off, and native fragment dispatch. One instance is shared
/// by every interpreter thread; recorder state is per-thread.
pub struct TraceJit {
    params: Params,
    hot_ip: CounterTable,
    root_ip: CounterTable,
    failed_ip: CounterTable,
    directory: FragmentDirectory,
    compiler: Box<dyn TraceCompiler>,
    trace_id: AtomicUsize,
    engine_mode: AtomicU32,
}

impl TraceJit {
    pub fn new(params: Params, compiler: Box<dyn TraceCompiler>) -> Self {
        Self {
            params,
            hot_ip: CounterTable::new(),
            root_ip: CounterTable::new(),
            failed_ip: CounterTable::new(),
            directory: FragmentDirectory::new(),
            compiler,
            trace_id: AtomicUsize::new(1),
            engine_mode: AtomicU32::new(ENGINE_TJIT),
        }
    }

    pub fn params(&self) -> &Params {
        &self.params
    }

    pub fn directory(&self) -> &FragmentDirectory {
        &self.directory
    }

    /// Interpreter engine the host should be running right now. Switched to
    /// the `scheme-engine` tunable while the compiler or a type-checker
    /// runs, so nested interpreter entries stay out of the tracer.
    pub fn vm_engine(&self) -> u32 {
        self.engine_mode.load(Ordering::Relaxed)
    }

    pub fn trace_id(&self) -> TraceId {
        self.trace_id.load(Ordering::Relaxed)
    }

    pub fn increment_trace_id(&self) {
        self.trace_id.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_root_ip(&self, ip: usize) {
        self.root_ip.set(ip, 1);
    }

    pub fn remove_root_ip(&self, ip: usize) {
        self.root_ip.set(ip, 0);
    }

    pub fn is_root_ip(&self, ip: usize) -> bool {
        self.root_ip.get(ip) != 0
    }

    pub fn increment_compilation_failure(&self, ip: usize, inc: u16) {
        let count = self.failed_ip.get(ip);
        self.failed_ip.set(ip, count.wrapping_add(inc));
    }

    pub fn failure_count(&self, ip: usize) -> u16 {
        self.failed_ip.get(ip)
    }

    pub fn hot_count(&self, ip: usize) -> u16 {
        self.hot_ip.get(ip)
    }

    /// Run `f` against this thread's recorder state, allocating it on first
    /// use.
    pub fn with_state<R>(&self, f: impl FnOnce(&mut TjitState) -> R) -> R {
        TJIT_STATE.with(|cell| {
            let mut slot = cell.borrow_mut();
            let state = slot
                .get_or_insert_with(|| TjitState::new(self.params.max_record() as usize));
            f(state)
        })
    }

    /// Hot-path hook, called before a control-transfer instruction with the
    /// destination IP. Dispatches native code when a matching root fragment
    /// exists, otherwise bumps heat and possibly flips the recorder on.
    pub fn enter(
        &self,
        vp: &mut VmRegisters,
        next_ip: usize,
        loop_end: usize,
        trace_type: TraceType,
        inc: u16,
    ) -> EnterStatus {
        self.with_state(|state| self.enter_with_state(state, vp, next_ip, loop_end, trace_type, inc))
    }

    fn enter_with_state(
        &self,
        state: &mut TjitState,
        vp: &mut VmRegisters,
        next_ip: usize,
        loop_end: usize,
        trace_type: TraceType,
        inc: u16,
    ) -> EnterStatus {
        if state.is_recording() {
            // The merge hook owns control while a recording is active.
            return EnterStatus::Interpret;
        }

        if self.root_ip.get(next_ip) != 0
            && let Some(fragment) = self.matching_fragment(vp, next_ip)
        {
            vp.ip = next_ip;
            self.call_native(state, vp, &fragment);
            return EnterStatus::Dispatched;
        }

        // Increment heat unless the destination is black-listed.
        if (self.failed_ip.get(next_ip) as u32) < self.params.max_retries() {
            let count = self.hot_ip.get(next_ip);
            if count as u32 >= self.params.hot_loop() {
                self.hot_ip.set(next_ip, 0);
                state.start_recording(next_ip, loop_end, trace_type);
                debug!(
                    ip = next_ip,
                    loop_end,
                    ?trace_type,
                    "hot loop, recording started"
                );
            } else {
                self.hot_ip.set(next_ip, count.wrapping_add(inc));
            }
        }

        EnterStatus::Interpret
    }

    /// Recorder hook, called before every instruction while recording may
    /// be active. Appends the instruction or decides to finish or abort.
    pub fn merge(&self, vp: &mut VmRegisters, code: &[u32]) {
        self.with_state(|state| {
            if !state.is_recording() {
                return;
            }
            self.merge_with_state(state, vp, code);
            if state.bc_idx() > self.params.max_record() as usize {
                let start = state.loop_start;
                self.abort_recording(state, start);
            }
        })
    }

    fn merge_with_state(&self, state: &mut TjitState, vp: &mut VmRegisters, code: &[u32]) {
        let ip = vp.ip;
        let start_ip = state.loop_start;
        let end_ip = state.loop_end;

        let has_root = self.root_ip.get(ip) != 0;
        let fragment = if has_root {
            self.matching_fragment(vp, ip)
        } else {
            None
        };
        // A looping side trace must not link to itself.
        let link_found = has_root && ip != start_ip;

        match state.trace_type {
            TraceType::Side => {
                if fragment.is_some() {
                    self.finish(state, ip, false);
                } else {
                    state.record(vp, code);
                }
            }
            TraceType::Jump | TraceType::TailCall => {
                if ip == end_ip {
                    state.record(vp, code);
                    self.finish(state, ip, true);
                } else if fragment.is_some() {
                    // Ran into a foreign compiled loop; its root trace owns
                    // this IP.
                    self.abort_recording(state, start_ip);
                } else {
                    state.record(vp, code);
                }
            }
            TraceType::Call => {
                let downrec_link =
                    link_found && fragment.as_ref().is_some_and(|frag| frag.is_downrec());
                if ip == start_ip || downrec_link {
                    if self.params.num_unrolls() <= state.nunrolled {
                        if link_found {
                            self.abort_recording(state, start_ip);
                        } else {
                            self.finish(state, ip, true);
                        }
                    } else {
                        state.record(vp, code);
                        state.nunrolled += 1;
                    }
                } else if ip == end_ip {
                    // Hot procedure call, possibly non-recursive; not worth
                    // a trace of its own.
                    state.stop_recording();
                } else {
                    state.record(vp, code);
                }
            }
            TraceType::Return => {
                let uprec_link =
                    link_found && fragment.as_ref().is_some_and(|frag| frag.is_uprec());
                if ip == start_ip || uprec_link {
                    if state.nunrolled == self.params.num_unrolls() {
                        self.finish(state, ip, !link_found);
                    } else {
                        state.record(vp, code);
                        state.nunrolled += 1;
                    }
                } else if ip == end_ip {
                    state.stop_recording();
                } else {
                    state.record(vp, code);
                }
            }
        }
    }

    fn finish(&self, state: &mut TjitState, linked_ip: usize, loop_p: bool) {
        self.tjitc(state, linked_ip, loop_p);
        state.stop_recording();
    }

    /// Hand the finished recording to the compiler. An empty recording
    /// counts as a compilation failure at the loop start.
    fn tjitc(&self, state: &mut TjitState, linked_ip: usize, loop_p: bool) {
        if state.traces.is_empty() {
            self.increment_compilation_failure(state.loop_start, 1);
            return;
        }

        let request = TraceRequest {
            trace_id: self.trace_id(),
            bytecode: state.bytecode.clone(),
            steps: state.traces.clone(),
            parent_fragment: state.parent_fragment,
            parent_exit: state.parent_exit,
            linked_ip,
            loop_p,
            downrec_p: state.trace_type == TraceType::Call,
            uprec_p: state.trace_type == TraceType::Return,
        };
        let origin = state.loop_start;
        debug!(
            trace_id = request.trace_id,
            linked_ip,
            loop_p,
            steps = request.steps.len(),
            "invoking trace compiler"
        );

        let result = self.with_scheme_engine(|| self.compiler.compile(self, request));
        if let Err(error) = result {
            warn!(ip = origin, %error, "trace compilation failed");
            self.increment_compilation_failure(origin, 1);
        }
    }

    fn abort_recording(&self, state: &mut TjitState, ip: usize) {
        self.increment_compilation_failure(ip, 1);
        state.stop_recording();
        debug!(ip, "recording aborted");
    }

    /// Walk the root-trace candidates at `ip` and return the first whose
    /// type-guard accepts the current locals.
    fn matching_fragment(&self, vp: &VmRegisters, ip: usize) -> Option<Arc<dyn Fragment>> {
        let candidates = self.directory.roots_at(ip);
        if candidates.is_empty() {
            return None;
        }
        let locals = vp.locals.clone();
        self.with_scheme_engine(|| {
            candidates
                .into_iter()
                .find(|candidate| candidate.matches(&locals))
        })
    }

    /// Invoke a fragment's native code and process its bailout: bump the
    /// exit counter and, once the exit turns hot, arm a side-trace
    /// recording rooted at it.
    fn call_native(&self, state: &mut TjitState, vp: &mut VmRegisters, fragment: &Arc<dyn Fragment>) {
        let entry_ip = fragment.entry_ip();
        state.bailout.clear();
        let status = fragment.execute(vp, &mut state.bailout);
        if status == NATIVE_CONTINUE {
            return;
        }

        let Some(ret_fragment) = state.bailout.fragment.clone() else {
            warn!("native bailout without a fragment in the return channel");
            return;
        };
        let Some(origin) = state.bailout.origin.clone() else {
            warn!("native bailout without an origin in the return channel");
            return;
        };
        let exit_id = state.bailout.exit_id;

        let count = ret_fragment.exit_count(exit_id);
        let give_up = self.params.hot_exit() + self.params.try_sides();
        if count < give_up && origin.num_children() < self.params.max_sides() {
            let count = count + 1;
            ret_fragment.set_exit_count(exit_id, count);
            if self.params.hot_exit() < count {
                state.parent_fragment = Some(ret_fragment.id());
                state.parent_exit = Some(exit_id);
                state.start_recording(vp.ip, entry_ip, TraceType::Side);
                debug!(
                    ip = vp.ip,
                    parent = ret_fragment.id(),
                    exit = exit_id,
                    "hot exit, side-trace recording armed"
                );
            }
        }
    }

    fn with_scheme_engine<R>(&self, f: impl FnOnce() -> R) -> R {
        self.engine_mode
            .store(self.params.scheme_engine(), Ordering::Relaxed);
        let result = f();
        self.engine_mode.store(ENGINE_TJIT, Ordering::Relaxed);
        result
    }

    pub fn dump_text(&self) -> String {
        let mut out = String::new();
        out.push_str("trace-jit:\n");
        out.push_str(&format!("  vm engine: {}\n", self.vm_engine()));
        out.push_str(&format!("  trace id: {}\n", self.trace_id()));
        out.push_str(&format!("  hot-loop: {}\n", self.params.hot_loop()));
        out.push_str(&format!("  hot-exit: {}\n", self.params.hot_exit()));
        out.push_str(&format!("  max-record: {}\n", self.params.max_record()));
        out.push_str(&format!("  max-retries: {}\n", self.params.max_retries()));
        out.push_str(&format!("  max-sides: {}\n", self.params.max_sides()));
        out.push_str(&format!("  try-sides: {}\n", self.params.try_sides()));
        out.push_str(&format!("  num-unrolls: {}\n", self.params.num_unrolls()));
        out.push_str(&format!("  fragments: {}\n", self.directory.len()));
        out.push_str(&format!("  root ips: {}\n", self.directory.root_count()));
        out
    }

    /// Render the last bailout the way the tracer reports it.
    pub fn dump_bailout(&self, vp: &VmRegisters) -> String {
        self.with_state(|state| {
            let id = state
                .bailout
                .fragment
                .as_ref()
                .map(|fragment| fragment.id())
                .unwrap_or(0);
            format!(
                ";;; trace {}: exit {} => {:#x}\n",
                id, state.bailout.exit_id, vp.ip
            )
        })
    }
}

/// Render the register view and frame locals for one trace.
pub fn dump_locals(trace_id: TraceId, vp: &VmRegisters) -> String {
    let mut out = format!(
        ";;; trace {}: ip={:#x} sp={:#x} ra={:#x} dl={:#x}\n",
        trace_id, vp.ip, vp.sp, vp.ra, vp.dl
    );
    out.push_str(&format!(";;; trace {}: locals", trace_id));
    for (index, value) in vp.locals.iter().enumerate() {
        out.push_str(&format!(" [{index}]: {value}"));
    }
    out.push('\n');
    out
}
