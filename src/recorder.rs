use std::sync::Arc;

use crate::bytecode::{OpCode, word_index};
use crate::fragment::{ExitId, Fragment, TraceId};
use crate::host::VmRegisters;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Mode {
    Interpret,
    Record,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TraceType {
    Jump,
    Call,
    TailCall,
    Return,
    Side,
}

/// One recorded instruction: where it was, the frame linkage at that point,
/// and a snapshot of every frame local.
#[derive(Clone, Debug)]
pub struct TraceStep {
    pub ip: usize,
    pub ra: usize,
    pub dl: usize,
    pub locals: Vec<crate::bytecode::Value>,
}

/// Return channel filled by native code on bailout, passed to the entry
/// point by `&mut` rather than through hidden thread-local fields.
#[derive(Clone, Default)]
pub struct BailoutSlot {
    pub exit_id: ExitId,
    pub fragment: Option<Arc<dyn Fragment>>,
    pub origin: Option<Arc<dyn Fragment>>,
}

impl BailoutSlot {
    pub fn clear(&mut self) {
        self.exit_id = 0;
        self.fragment = None;
        self.origin = None;
    }
}

impl std::fmt::Debug for BailoutSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BailoutSlot")
            .field("exit_id", &self.exit_id)
            .field("fragment", &self.fragment.as_ref().map(|frag| frag.id()))
            .field("origin", &self.origin.as_ref().map(|frag| frag.id()))
            .finish()
    }
}

/// Per-thread recorder state, lazily allocated on a thread's first hook
/// call and reused for every recording session after that.
pub struct TjitState {
    pub mode: Mode,
    pub trace_type: TraceType,
    pub loop_start: usize,
    pub loop_end: usize,
    pub bytecode: Vec<u32>,
    pub traces: Vec<TraceStep>,
    pub parent_fragment: Option<TraceId>,
    pub parent_exit: Option<ExitId>,
    pub nunrolled: u32,
    pub bailout: BailoutSlot,
}

impl TjitState {
    pub fn new(max_record: usize) -> Self {
        Self {
            mode: Mode::Interpret,
            trace_type: TraceType::Jump,
            loop_start: 0,
            loop_end: 0,
            bytecode: Vec::with_capacity(max_record + crate::bytecode::MAX_OP_WORDS),
            traces: Vec::new(),
            parent_fragment: None,
            parent_exit: None,
            nunrolled: 0,
            bailout: BailoutSlot::default(),
        }
    }

    pub fn bc_idx(&self) -> usize {
        self.bytecode.len()
    }

    pub fn is_recording(&self) -> bool {
        self.mode == Mode::Record
    }

    pub fn start_recording(&mut self, start: usize, end: usize, trace_type: TraceType) {
        self.mode = Mode::Record;
        self.trace_type = trace_type;
        self.loop_start = start;
        self.loop_end = end;
    }

    pub fn stop_recording(&mut self) {
        self.mode = Mode::Interpret;
        self.traces.clear();
        self.bytecode.clear();
        self.parent_fragment = None;
        self.parent_exit = None;
        self.nunrolled = 0;
    }

    /// Append one step: copy the instruction's words into the bytecode
    /// buffer and snapshot the frame.
    pub fn record(&mut self, vp: &VmRegisters, code: &[u32]) {
        let index = word_index(vp.ip);
        let size = match code.get(index).copied().and_then(OpCode::from_word) {
            Some(op) => op.size(),
            None => 1,
        };
        for offset in 0..size {
            if let Some(word) = code.get(index + offset) {
                self.bytecode.push(*word);
            }
        }
        self.traces.push(TraceStep {
            ip: vp.ip,
            ra: vp.ra,
            dl: vp.dl,
            locals: vp.locals.clone(),
        });
    }
}
