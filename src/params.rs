use std::sync::atomic::{AtomicU32, Ordering};

pub const ENGINE_REGULAR: u32 = 0;
pub const ENGINE_DEBUG: u32 = 1;
pub const ENGINE_TJIT: u32 = 2;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ParamError {
    pub name: &'static str,
    pub value: i64,
}

impl std::fmt::Display for ParamError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "invalid value {} for {}: expected an integer in 0..=65536",
            self.value, self.name
        )
    }
}

impl std::error::Error for ParamError {}

/// Engine tunables. Each parameter is a small-integer cell with a paired
/// getter/setter; setters validate the 0..=65536 range. Cells are atomics so
/// a process-wide engine can be re-tuned through `&self`.
pub struct Params {
    hot_loop: AtomicU32,
    hot_exit: AtomicU32,
    max_record: AtomicU32,
    max_retries: AtomicU32,
    max_sides: AtomicU32,
    try_sides: AtomicU32,
    num_unrolls: AtomicU32,
    scheme_engine: AtomicU32,
}

impl Params {
    pub fn new() -> Self {
        Self {
            hot_loop: AtomicU32::new(59),
            hot_exit: AtomicU32::new(40),
            max_record: AtomicU32::new(5000),
            max_retries: AtomicU32::new(10),
            max_sides: AtomicU32::new(100),
            try_sides: AtomicU32::new(4),
            num_unrolls: AtomicU32::new(2),
            scheme_engine: AtomicU32::new(ENGINE_REGULAR),
        }
    }

    fn check(name: &'static str, value: i64) -> Result<u32, ParamError> {
        if !(0..=65_536).contains(&value) {
            return Err(ParamError { name, value });
        }
        Ok(value as u32)
    }

    /// Iterations needed at a back-edge IP before recording starts.
    pub fn hot_loop(&self) -> u32 {
        self.hot_loop.load(Ordering::Relaxed)
    }

    pub fn set_hot_loop(&self, value: i64) -> Result<(), ParamError> {
        self.hot_loop
            .store(Self::check("hot-loop", value)?, Ordering::Relaxed);
        Ok(())
    }

    /// Exit count needed before a side trace is recorded.
    pub fn hot_exit(&self) -> u32 {
        self.hot_exit.load(Ordering::Relaxed)
    }

    pub fn set_hot_exit(&self, value: i64) -> Result<(), ParamError> {
        self.hot_exit
            .store(Self::check("hot-exit", value)?, Ordering::Relaxed);
        Ok(())
    }

    /// Hard cap on recorded bytecode words.
    pub fn max_record(&self) -> u32 {
        self.max_record.load(Ordering::Relaxed)
    }

    pub fn set_max_record(&self, value: i64) -> Result<(), ParamError> {
        self.max_record
            .store(Self::check("max-record", value)?, Ordering::Relaxed);
        Ok(())
    }

    /// Compilation failures at an IP before it is blacklisted.
    pub fn max_retries(&self) -> u32 {
        self.max_retries.load(Ordering::Relaxed)
    }

    pub fn set_max_retries(&self, value: i64) -> Result<(), ParamError> {
        self.max_retries
            .store(Self::check("max-retries", value)?, Ordering::Relaxed);
        Ok(())
    }

    /// Per-root cap on side-trace descendants.
    pub fn max_sides(&self) -> u32 {
        self.max_sides.load(Ordering::Relaxed)
    }

    pub fn set_max_sides(&self, value: i64) -> Result<(), ParamError> {
        self.max_sides
            .store(Self::check("max-sides", value)?, Ordering::Relaxed);
        Ok(())
    }

    /// Extra exit hits allowed past `hot_exit` before giving up on an exit.
    pub fn try_sides(&self) -> u32 {
        self.try_sides.load(Ordering::Relaxed)
    }

    pub fn set_try_sides(&self, value: i64) -> Result<(), ParamError> {
        self.try_sides
            .store(Self::check("try-sides", value)?, Ordering::Relaxed);
        Ok(())
    }

    /// Unroll depth for recursive traces.
    pub fn num_unrolls(&self) -> u32 {
        self.num_unrolls.load(Ordering::Relaxed)
    }

    pub fn set_num_unrolls(&self, value: i64) -> Result<(), ParamError> {
        self.num_unrolls
            .store(Self::check("num-unrolls", value)?, Ordering::Relaxed);
        Ok(())
    }

    /// Interpreter engine switched to while the compiler runs.
    pub fn scheme_engine(&self) -> u32 {
        self.scheme_engine.load(Ordering::Relaxed)
    }

    pub fn set_scheme_engine(&self, value: i64) -> Result<(), ParamError> {
        self.scheme_engine
            .store(Self::check("scheme-engine", value)?, Ordering::Relaxed);
        Ok(())
    }
}

impl Default for Params {
    fn default() -> Self {
        Self::new()
    }
}
