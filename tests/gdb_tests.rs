#![cfg(unix)]

use tjit::{GDB_JIT_REGISTER, GDB_JIT_UNREGISTER, register_symfile, unregister_symfile};

#[test]
fn registration_maintains_the_debugger_entry_list() {
    let first = register_symfile(vec![1, 2, 3]);
    let second = register_symfile(vec![4, 5, 6, 7]);

    unsafe {
        let descriptor = &raw const tjit::gdb::__jit_debug_descriptor;
        assert_eq!((*descriptor).version, 1);
        assert_eq!((*descriptor).action_flag, GDB_JIT_REGISTER);
        assert_eq!((*descriptor).first_entry, second);
        assert_eq!((*descriptor).relevant_entry, second);

        assert_eq!((*second).next_entry, first);
        assert!((*second).prev_entry.is_null());
        assert_eq!((*first).prev_entry, second);
        assert!((*first).next_entry.is_null());

        assert_eq!((*second).symfile_size, 4);
        assert_eq!(
            std::slice::from_raw_parts((*first).symfile_addr, 3),
            &[1, 2, 3]
        );
    }

    unregister_symfile(second);
    unsafe {
        let descriptor = &raw const tjit::gdb::__jit_debug_descriptor;
        assert_eq!((*descriptor).action_flag, GDB_JIT_UNREGISTER);
        assert_eq!((*descriptor).first_entry, first);
        assert!((*first).prev_entry.is_null());
        assert!((*first).next_entry.is_null());
    }

    unregister_symfile(first);
    unsafe {
        let descriptor = &raw const tjit::gdb::__jit_debug_descriptor;
        assert!((*descriptor).first_entry.is_null());
    }
}
