use crate::coroutine::Coroutine;
use crate::guest_ptr::GuestPc;
use crate::memory::AddressSpaceSharedPtr;
use crate::trace::LiveTraceId;
use std::cell::RefCell;
use std::mem;
use std::ptr;
use std::rc::Rc;

pub type TaskSharedPtr = Rc<RefCell<Task>>;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TaskStatus {
    Runnable,
    /// Parked until a lifter worker delivers the translation for
    /// `Task::awaiting`.
    AwaitingTranslation,
    /// Parked on its coroutine stack inside a blocking system call.
    Blocked,
    Exited,
}

/// Layout contract for the head of a task's register-state blob. The blob
/// itself is opaque to the engine (its full layout belongs to the lifter
/// backend), but the dispatch loop must re-read the PC after every call into
/// lifted code, and the rounding-mode intrinsic must work from the raw state
/// pointer alone, so those two live at fixed offsets up front.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default)]
pub struct StateHeader {
    pub pc: u64,
    pub rounding_mode: u32,
}

/// One cooperative guest task: a register blob, a program counter, and a
/// handle on the address space it executes in.
pub struct Task {
    state: Vec<u8>,
    pub pc: GuestPc,
    pub memory: AddressSpaceSharedPtr,
    pub status: TaskStatus,
    /// Native stack the guest runtime switches onto for blocking syscalls.
    pub coroutine: Option<Coroutine>,
    pub rounding_mode: u32,
    /// Current program break, managed by the guest runtime's brk shim.
    pub program_break: u64,
    /// Dispatch key this task is parked on, when `AwaitingTranslation`.
    pub awaiting: Option<LiveTraceId>,
}

impl Task {
    pub fn new(state_bytes: &[u8], pc: GuestPc, memory: AddressSpaceSharedPtr) -> Task {
        let mut state = state_bytes.to_vec();
        if state.len() < mem::size_of::<StateHeader>() {
            state.resize(mem::size_of::<StateHeader>(), 0);
        }
        let mut task = Task {
            state,
            pc,
            memory,
            status: TaskStatus::Runnable,
            coroutine: None,
            rounding_mode: 0,
            program_break: 0,
            awaiting: None,
        };
        task.store_pc(pc);
        task
    }

    pub fn state(&self) -> &[u8] {
        &self.state
    }

    pub fn state_ptr(&mut self) -> *mut u8 {
        self.state.as_mut_ptr()
    }

    pub fn header(&self) -> StateHeader {
        unsafe { ptr::read_unaligned(self.state.as_ptr() as *const StateHeader) }
    }

    /// Write `pc` through to the state blob so lifted code observes it.
    pub fn store_pc(&mut self, pc: GuestPc) {
        self.pc = pc;
        let mut header = self.header();
        header.pc = pc.as_u64();
        header.rounding_mode = self.rounding_mode;
        unsafe { ptr::write_unaligned(self.state.as_mut_ptr() as *mut StateHeader, header) };
    }

    /// Pick up the PC (and rounding mode) lifted code left in the state blob.
    pub fn reload_pc(&mut self) {
        let header = self.header();
        self.pc = GuestPc::new(header.pc);
        self.rounding_mode = header.rounding_mode;
    }

    pub fn is_runnable(&self) -> bool {
        self.status == TaskStatus::Runnable
    }

    /// Retire the task: the coroutine stack is unmapped here, the address
    /// space handle goes away when the task itself is dropped.
    pub fn exit(&mut self) {
        self.status = TaskStatus::Exited;
        self.awaiting = None;
        self.coroutine = None;
    }
}
