use crate::bytecode::Value;
use crate::fragment::{ExitId, TraceId};
use crate::jit::TraceJit;
use crate::recorder::TraceStep;

/// Native code finished on its own (tail-resumed or completed a loop exit
/// it handles itself).
pub const NATIVE_CONTINUE: i32 = 0;
/// Native code bailed out to the interpreter; the bailout slot is filled.
pub const NATIVE_BAILOUT: i32 = 1;

/// The interpreter's register view, synchronized to memory around every
/// hook call. `locals` is the current frame, outermost slot first.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct VmRegisters {
    pub ip: usize,
    pub sp: usize,
    pub ra: usize,
    pub dl: usize,
    pub locals: Vec<Value>,
}

/// Everything a finished recording hands to the compiler callback.
#[derive(Clone, Debug)]
pub struct TraceRequest {
    pub trace_id: TraceId,
    /// Fresh copy of the recorded bytecode words.
    pub bytecode: Vec<u32>,
    /// Recorded steps in execution order.
    pub steps: Vec<TraceStep>,
    pub parent_fragment: Option<TraceId>,
    pub parent_exit: Option<ExitId>,
    /// IP the compiled trace links to: the loop entry for looping root
    /// traces, the matched root's entry for side and link traces.
    pub linked_ip: usize,
    pub loop_p: bool,
    pub downrec_p: bool,
    pub uprec_p: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CompileError {
    UnsupportedBytecode(String),
    Backend(String),
}

impl std::fmt::Display for CompileError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CompileError::UnsupportedBytecode(what) => {
                write!(f, "unsupported bytecode: {what}")
            }
            CompileError::Backend(message) => write!(f, "backend error: {message}"),
        }
    }
}

impl std::error::Error for CompileError {}

/// Host-provided trace compiler. On success the implementation must insert
/// the new fragment into `jit.directory()`, flag root entries with
/// `jit.add_root_ip`, and call `jit.increment_trace_id`. On `Err` the
/// engine bumps the failure counter for the recording's origin IP.
///
/// Called synchronously from the merge hook; implementations must not
/// re-enter the recorder (`enter`, `merge`, `with_state`) on the same
/// thread.
pub trait TraceCompiler: Send + Sync {
    fn compile(&self, jit: &TraceJit, request: TraceRequest) -> Result<(), CompileError>;
}

impl<T: TraceCompiler + ?Sized> TraceCompiler for std::sync::Arc<T> {
    fn compile(&self, jit: &TraceJit, request: TraceRequest) -> Result<(), CompileError> {
        (**self).compile(jit, request)
    }
}
