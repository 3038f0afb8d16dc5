pub mod bytecode;
pub mod counters;
pub mod fragment;
#[cfg(unix)]
pub mod gdb;
pub mod host;
pub mod jit;
pub mod params;
pub mod recorder;

pub use bytecode::{MAX_OP_WORDS, OpCode, Value, WORD_BYTES, word_index};
pub use counters::CounterTable;
pub use fragment::{ExitId, Fragment, FragmentDirectory, TraceId};
#[cfg(unix)]
pub use gdb::{
    GDB_JIT_NOACTION, GDB_JIT_REGISTER, GDB_JIT_UNREGISTER, GdbJitDescriptor, GdbJitEntry,
    register_symfile, unregister_symfile,
};
pub use host::{
    CompileError, NATIVE_BAILOUT, NATIVE_CONTINUE, TraceCompiler, TraceRequest, VmRegisters,
};
pub use jit::{
    EnterStatus, INC_CALL, INC_JUMP, INC_RETURN, INC_TCALL, TraceJit, dump_locals,
};
pub use params::{ENGINE_DEBUG, ENGINE_REGULAR, ENGINE_TJIT, ParamError, Params};
pub use recorder::{BailoutSlot, Mode, TjitState, TraceStep, TraceType};
