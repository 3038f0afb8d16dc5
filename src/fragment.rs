use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use crate::bytecode::Value;
use crate::host::VmRegisters;
use crate::recorder::BailoutSlot;

pub type TraceId = usize;
pub type ExitId = usize;

/// A compiled trace, owned by the host. The core reads fragments through
/// these accessors and never mutates them except to bump exit counters.
pub trait Fragment: Send + Sync {
    fn id(&self) -> TraceId;

    /// Bytecode IP this fragment was compiled for.
    fn entry_ip(&self) -> usize;

    fn exit_count(&self, exit: ExitId) -> u32;

    fn set_exit_count(&self, exit: ExitId, count: u32);

    /// Number of side traces hanging off this fragment.
    fn num_children(&self) -> u32;

    fn is_downrec(&self) -> bool {
        false
    }

    fn is_uprec(&self) -> bool {
        false
    }

    fn parent_id(&self) -> Option<TraceId> {
        None
    }

    /// Type-guard check against the current frame locals. Dispatch picks the
    /// first candidate at an IP whose check passes.
    fn matches(&self, locals: &[Value]) -> bool;

    /// Run the native code. A non-zero return is a bailout; the callee must
    /// have filled `bailout` before returning and left the resume IP in
    /// `vp.ip`.
    fn execute(&self, vp: &mut VmRegisters, bailout: &mut BailoutSlot) -> i32;
}

/// All live fragments plus the per-IP candidate lists for root traces.
/// Reads dominate; writes go through the compiler callback, which the host
/// serializes.
pub struct FragmentDirectory {
    fragments: RwLock<HashMap<TraceId, Arc<dyn Fragment>>>,
    root_traces: RwLock<HashMap<usize, Vec<Arc<dyn Fragment>>>>,
}

impl FragmentDirectory {
    pub fn new() -> Self {
        Self {
            fragments: RwLock::new(HashMap::new()),
            root_traces: RwLock::new(HashMap::new()),
        }
    }

    pub fn insert(&self, fragment: Arc<dyn Fragment>) {
        self.fragments
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(fragment.id(), fragment);
    }

    /// Register a root-trace candidate at its entry IP. Candidates keep
    /// registration order; dispatch walks them oldest first.
    pub fn insert_root(&self, fragment: Arc<dyn Fragment>) {
        let ip = fragment.entry_ip();
        self.insert(fragment.clone());
        self.root_traces
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(ip)
            .or_default()
            .push(fragment);
    }

    pub fn get(&self, id: TraceId) -> Option<Arc<dyn Fragment>> {
        self.fragments
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .cloned()
    }

    pub fn roots_at(&self, ip: usize) -> Vec<Arc<dyn Fragment>> {
        self.root_traces
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&ip)
            .cloned()
            .unwrap_or_default()
    }

    pub fn remove(&self, id: TraceId) -> Option<Arc<dyn Fragment>> {
        let removed = self
            .fragments
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);
        if let Some(fragment) = &removed {
            let mut roots = self
                .root_traces
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            if let Some(candidates) = roots.get_mut(&fragment.entry_ip()) {
                candidates.retain(|candidate| candidate.id() != id);
                if candidates.is_empty() {
                    roots.remove(&fragment.entry_ip());
                }
            }
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.fragments
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn root_count(&self) -> usize {
        self.root_traces
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl Default for FragmentDirectory {
    fn default() -> Self {
        Self::new()
    }
}
