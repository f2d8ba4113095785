//! Boundary with the guest runtime.
//!
//! The guest runtime (system-call shims, task bookkeeping, FPU helpers) is a
//! separate library; the engine only sees it through a handful of intrinsic
//! entry points. Host-side, the `Runtime` trait mirrors the lifecycle
//! intrinsics the executor drives (`__vmill_init`, `__vmill_create_task`,
//! `__vmill_resume`, `__vmill_fini`); module-side, `intrinsic_symbols()`
//! publishes the addresses lifted code links against.

use crate::code_cache::SymbolTable;
use crate::executor::Executor;
use crate::task::{StateHeader, Task, TaskSharedPtr};
use log::{debug, error};
use std::ffi::CStr;
use std::os::raw::{c_char, c_void};
use std::ptr;

pub trait Runtime {
    /// `__vmill_init`.
    fn init(&mut self) {}

    /// `__vmill_create_task`: notification that the executor registered a
    /// new task (initial tasks at startup, forked tasks later).
    fn create_task(&mut self, _task: &TaskSharedPtr) {}

    /// `__vmill_resume`: drive every runnable task until none remain. The
    /// runtime yields back into the executor for each dispatch.
    fn resume(&mut self, executor: &mut Executor);

    /// `__vmill_fini`.
    fn fini(&mut self) {}

    /// `__remill_error` at the dispatch boundary: a task reached a PC with
    /// no translation (undecodable code). Default: halt the task.
    fn error(&mut self, task: &mut Task) {
        error!("no translation for {}; halting task", task.pc);
        task.exit();
    }

    /// `__vmill_get_rounding_mode`.
    fn get_rounding_mode(&self, task: &Task) -> u32 {
        task.rounding_mode
    }

    /// `__vmill_initial_heap_end`: where the guest's program break starts.
    fn initial_heap_end(&self, task: &Task) -> u64 {
        task.program_break
    }

    /// `__vmill_strace` diagnostics sink.
    fn strace(&self, message: &str) {
        debug!("strace: {}", message);
    }
}

/// The built-in cooperative scheduler: one sweep dispatches every runnable
/// task; tasks that miss in the live index park until the lifter pool
/// delivers their translation; the loop blocks only when every live task is
/// parked.
pub struct CooperativeRuntime;

impl Runtime for CooperativeRuntime {
    fn resume(&mut self, executor: &mut Executor) {
        loop {
            let runnable = executor.runnable_tasks();
            if runnable.is_empty() && !executor.has_pending_lifts() {
                break;
            }
            for task in &runnable {
                if let Some(func) = executor.find_lifted_function_for_task(task) {
                    executor.dispatch(task, func);
                }
            }
            let block = executor.runnable_tasks().is_empty() && executor.has_pending_lifts();
            for failed in executor.pump_lift_results(block) {
                self.error(&mut failed.borrow_mut());
            }
        }
    }
}

/// Entry for coroutine stacks that have not been handed work yet; the guest
/// runtime repoints the stack before the first switch, so reaching this
/// means a switch onto an idle stack.
pub extern "C" fn coroutine_idle(_arg: *mut c_void) {
    error!("context switch onto an idle coroutine stack");
}

unsafe extern "C" fn error_intrinsic(_state: *mut u8, pc: u64, _memory: *mut c_void) -> *mut c_void {
    error!("error intrinsic reached at pc {:#x}", pc);
    // Null retires the task at the next dispatch boundary.
    ptr::null_mut()
}

unsafe extern "C" fn strace_intrinsic(message: *const c_char) {
    if !message.is_null() {
        debug!("strace: {}", CStr::from_ptr(message).to_string_lossy());
    }
}

unsafe extern "C" fn rounding_mode_intrinsic(state: *const u8) -> u32 {
    if state.is_null() {
        return 0;
    }
    ptr::read_unaligned(state as *const StateHeader).rounding_mode
}

/// Placeholder for intrinsics only the real guest runtime library provides;
/// linking is fine, calling is a bug.
extern "C" fn unlinked_intrinsic() {
    panic!("intrinsic provided by the guest runtime library was called without one linked");
}

/// Symbol table the code cache resolves intrinsic references against.
pub fn intrinsic_symbols() -> SymbolTable {
    let mut table = SymbolTable::new();
    table.insert("__remill_error", error_intrinsic as usize);
    table.insert("__vmill_strace", strace_intrinsic as usize);
    table.insert("__vmill_get_rounding_mode", rounding_mode_intrinsic as usize);
    for name in &[
        "__vmill_init",
        "__vmill_fini",
        "__vmill_create_task",
        "__vmill_resume",
        "__vmill_current",
        "__vmill_allocate_coroutine",
        "__vmill_free_coroutine",
        "__vmill_initial_heap_end",
    ] {
        table.insert(name, unlinked_intrinsic as usize);
    }
    table
}
