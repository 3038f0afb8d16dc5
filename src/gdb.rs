//! GDB JIT interface: a well-known descriptor plus a never-inlined function
//! the debugger sets a breakpoint on. Debugger ABI, not a correctness
//! concern.

use std::ptr::null_mut;
use std::sync::{Mutex, Once, PoisonError};

pub const GDB_JIT_NOACTION: u32 = 0;
pub const GDB_JIT_REGISTER: u32 = 1;
pub const GDB_JIT_UNREGISTER: u32 = 2;

#[repr(C)]
pub struct GdbJitEntry {
    pub next_entry: *mut GdbJitEntry,
    pub prev_entry: *mut GdbJitEntry,
    pub symfile_addr: *const u8,
    pub symfile_size: u64,
}

#[repr(C)]
pub struct GdbJitDescriptor {
    pub version: u32,
    pub action_flag: u32,
    pub relevant_entry: *mut GdbJitEntry,
    pub first_entry: *mut GdbJitEntry,
}

#[unsafe(no_mangle)]
pub static mut __jit_debug_descriptor: GdbJitDescriptor = GdbJitDescriptor {
    version: 1,
    action_flag: GDB_JIT_NOACTION,
    relevant_entry: null_mut(),
    first_entry: null_mut(),
};

#[unsafe(no_mangle)]
#[inline(never)]
pub extern "C" fn __jit_debug_register_code() {
    // Keep the call site; the debugger breaks on this symbol.
    std::hint::black_box(());
}

struct Registration {
    entry: *mut GdbJitEntry,
    _symfile: Box<[u8]>,
}

unsafe impl Send for Registration {}

static ENTRIES: Mutex<Vec<Registration>> = Mutex::new(Vec::new());
static CLEANUP: Once = Once::new();

/// Publish a symfile to the debugger. The entry stays registered until
/// [`unregister_symfile`] or process exit.
pub fn register_symfile(symfile: Vec<u8>) -> *mut GdbJitEntry {
    let symfile = symfile.into_boxed_slice();
    let entry = Box::into_raw(Box::new(GdbJitEntry {
        next_entry: null_mut(),
        prev_entry: null_mut(),
        symfile_addr: symfile.as_ptr(),
        symfile_size: symfile.len() as u64,
    }));

    let mut entries = ENTRIES.lock().unwrap_or_else(PoisonError::into_inner);
    unsafe {
        let descriptor = &raw mut __jit_debug_descriptor;
        (*entry).next_entry = (*descriptor).first_entry;
        if !(*entry).next_entry.is_null() {
            (*(*entry).next_entry).prev_entry = entry;
        }
        (*descriptor).first_entry = entry;
        (*descriptor).relevant_entry = entry;
        (*descriptor).action_flag = GDB_JIT_REGISTER;
        __jit_debug_register_code();
    }
    entries.push(Registration {
        entry,
        _symfile: symfile,
    });

    CLEANUP.call_once(|| unsafe {
        libc::atexit(cleanup_entries);
    });

    entry
}

/// Withdraw a previously registered symfile and free it.
pub fn unregister_symfile(entry: *mut GdbJitEntry) {
    let mut entries = ENTRIES.lock().unwrap_or_else(PoisonError::into_inner);
    let Some(position) = entries.iter().position(|reg| reg.entry == entry) else {
        return;
    };
    let registration = entries.swap_remove(position);
    unsafe {
        unlink(registration.entry);
        drop(Box::from_raw(registration.entry));
    }
}

unsafe fn unlink(entry: *mut GdbJitEntry) {
    unsafe {
        let descriptor = &raw mut __jit_debug_descriptor;
        if !(*entry).prev_entry.is_null() {
            (*(*entry).prev_entry).next_entry = (*entry).next_entry;
        } else {
            (*descriptor).first_entry = (*entry).next_entry;
        }
        if !(*entry).next_entry.is_null() {
            (*(*entry).next_entry).prev_entry = (*entry).prev_entry;
        }
        (*descriptor).relevant_entry = entry;
        (*descriptor).action_flag = GDB_JIT_UNREGISTER;
        __jit_debug_register_code();
    }
}

extern "C" fn cleanup_entries() {
    let mut entries = ENTRIES.lock().unwrap_or_else(PoisonError::into_inner);
    for registration in entries.drain(..) {
        unsafe {
            unlink(registration.entry);
            drop(Box::from_raw(registration.entry));
        }
    }
}
