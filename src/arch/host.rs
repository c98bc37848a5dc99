//! # Host Port
//!
//! Stand-in for the target port when the kernel is built for the host
//! (unit and integration tests). Nothing ever switches to a task here, so
//! the stack pointer is only recorded.

use crate::task::TaskEntry;

/// Return the top of `stack` as the task's initial stack pointer.
pub fn init_stack(stack: &mut [u32], _entry: TaskEntry, _param: usize) -> *mut u32 {
    stack.as_mut_ptr_range().end
}
