//! Per-task native stacks.
//!
//! When the guest runtime hits a potentially blocking system call it switches
//! off the dispatch stack onto the calling task's coroutine stack, so other
//! tasks keep making progress while the host call sleeps. Switching is
//! symmetric: `swap_context` saves the current stack pointer and resumes the
//! other side wherever it last parked. Only callee-saved registers cross the
//! switch, which is all the C ABI requires of a function call.

use crate::memory::PAGE_SIZE;
use nix::sys::mman::{mmap, mprotect, munmap, MapFlags, ProtFlags};
use std::os::raw::c_void;
use std::ptr;

pub const DEFAULT_STACK_SIZE: usize = 512 * 1024;

pub type CoroutineEntry = extern "C" fn(*mut c_void);

/// A parked execution context: just the stack pointer of the frame
/// `swap_context` built when the context was suspended.
#[repr(C)]
#[derive(Copy, Clone, Default)]
pub struct CoroutineContext {
    sp: u64,
}

extern "C" {
    fn snapvm_swap_context(save: *mut u64, load: *const u64);
    fn snapvm_coroutine_entry();
}

#[cfg(target_arch = "x86_64")]
std::arch::global_asm!(
    r#"
    .text
    .globl snapvm_swap_context
    .type snapvm_swap_context, @function
snapvm_swap_context:
    push rbp
    push rbx
    push r12
    push r13
    push r14
    push r15
    mov [rdi], rsp
    mov rsp, [rsi]
    pop r15
    pop r14
    pop r13
    pop r12
    pop rbx
    pop rbp
    ret

    .globl snapvm_coroutine_entry
    .type snapvm_coroutine_entry, @function
snapvm_coroutine_entry:
    mov rdi, r13
    call r12
    ud2
"#
);

#[cfg(target_arch = "aarch64")]
std::arch::global_asm!(
    r#"
    .text
    .globl snapvm_swap_context
    .type snapvm_swap_context, %function
snapvm_swap_context:
    sub sp, sp, #96
    stp x19, x20, [sp, #0]
    stp x21, x22, [sp, #16]
    stp x23, x24, [sp, #32]
    stp x25, x26, [sp, #48]
    stp x27, x28, [sp, #64]
    stp x29, x30, [sp, #80]
    mov x9, sp
    str x9, [x0]
    ldr x9, [x1]
    mov sp, x9
    ldp x19, x20, [sp, #0]
    ldp x21, x22, [sp, #16]
    ldp x23, x24, [sp, #32]
    ldp x25, x26, [sp, #48]
    ldp x27, x28, [sp, #64]
    ldp x29, x30, [sp, #80]
    add sp, sp, #96
    ret

    .globl snapvm_coroutine_entry
    .type snapvm_coroutine_entry, %function
snapvm_coroutine_entry:
    mov x0, x20
    blr x19
    brk #0
"#
);

/// Switch from the current context to `load`, saving the current one into
/// `save`. Returns when something switches back into `save`.
pub fn swap_context(save: &mut CoroutineContext, load: &CoroutineContext) {
    unsafe { snapvm_swap_context(&mut save.sp, &load.sp) };
}

/// Lay out the initial switch frame so that the first `swap_context` into
/// this stack "returns" into the entry trampoline with the entry function
/// and its argument in callee-saved registers.
#[cfg(target_arch = "x86_64")]
unsafe fn prepare_stack(top: *mut u8, entry: CoroutineEntry, arg: *mut c_void) -> u64 {
    let mut sp = (top as u64) & !0xF;
    sp -= 7 * 8;
    let frame = sp as *mut u64;
    frame.add(0).write(0); // r15
    frame.add(1).write(0); // r14
    frame.add(2).write(arg as u64); // r13: entry argument
    frame.add(3).write(entry as usize as u64); // r12: entry function
    frame.add(4).write(0); // rbx
    frame.add(5).write(0); // rbp
    frame.add(6).write(snapvm_coroutine_entry as usize as u64); // return address
    sp
}

#[cfg(target_arch = "aarch64")]
unsafe fn prepare_stack(top: *mut u8, entry: CoroutineEntry, arg: *mut c_void) -> u64 {
    let sp = ((top as u64) & !0xF) - 96;
    let frame = sp as *mut u64;
    frame.add(0).write(entry as usize as u64); // x19: entry function
    frame.add(1).write(arg as u64); // x20: entry argument
    for i in 2..10 {
        frame.add(i).write(0); // x21..x28
    }
    frame.add(10).write(0); // x29
    frame.add(11).write(snapvm_coroutine_entry as usize as u64); // x30
    sp
}

/// An mmap'd stack with a guard page at its low end, plus the context cell
/// the stack's owner is resumed from.
pub struct Coroutine {
    mapping: *mut c_void,
    mapping_len: usize,
    pub context: CoroutineContext,
}

impl Coroutine {
    pub fn new(stack_size: usize, entry: CoroutineEntry, arg: *mut c_void) -> nix::Result<Coroutine> {
        let guard = PAGE_SIZE as usize;
        let mapping_len = crate::util::page_align_up(stack_size as u64) as usize + guard;
        let mapping = unsafe {
            mmap(
                ptr::null_mut(),
                mapping_len,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_PRIVATE | MapFlags::MAP_ANONYMOUS | MapFlags::MAP_STACK,
                -1,
                0,
            )?
        };
        if let Err(err) = unsafe { mprotect(mapping, guard, ProtFlags::PROT_NONE) } {
            let _ = unsafe { munmap(mapping, mapping_len) };
            return Err(err);
        }
        let top = unsafe { (mapping as *mut u8).add(mapping_len) };
        let sp = unsafe { prepare_stack(top, entry, arg) };
        Ok(Coroutine {
            mapping,
            mapping_len,
            context: CoroutineContext { sp },
        })
    }
}

impl Drop for Coroutine {
    fn drop(&mut self) {
        let _ = unsafe { munmap(self.mapping, self.mapping_len) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct PingPong {
        main: CoroutineContext,
        task: CoroutineContext,
        counter: u32,
    }

    extern "C" fn ping_pong_entry(arg: *mut c_void) {
        let shared = unsafe { &mut *(arg as *mut PingPong) };
        shared.counter += 1;
        swap_context(&mut shared.task, &shared.main);
        shared.counter += 10;
        swap_context(&mut shared.task, &shared.main);
    }

    #[test]
    fn symmetric_switching_round_trips() {
        let mut shared = Box::new(PingPong {
            main: CoroutineContext::default(),
            task: CoroutineContext::default(),
            counter: 0,
        });
        let arg = &mut *shared as *mut PingPong as *mut c_void;
        let coroutine = Coroutine::new(64 * 1024, ping_pong_entry, arg).unwrap();
        shared.task = coroutine.context;

        swap_context(&mut shared.main, &shared.task);
        assert_eq!(shared.counter, 1);
        swap_context(&mut shared.main, &shared.task);
        assert_eq!(shared.counter, 11);
    }

    #[test]
    fn stacks_are_freed_on_drop() {
        extern "C" fn never_entered(_arg: *mut c_void) {}
        for _ in 0..8 {
            let coroutine = Coroutine::new(DEFAULT_STACK_SIZE, never_entered, ptr::null_mut());
            assert!(coroutine.is_ok());
        }
    }
}
