//! Boundary with the machine-code translation backend.
//!
//! The engine never interprets guest bytes itself: a backend decodes one
//! instruction at a time for the trace decoder, and later turns whole decoded
//! traces into callable host functions. Backends are expected to be
//! deterministic given the instruction bytes, which is why failed lifts are
//! never retried.

use crate::guest_ptr::GuestPc;
use crate::trace::{DecodedInstruction, DecodedTrace, TraceId};
use crossbeam::channel::{self, Receiver, Sender, TryRecvError};
use log::{debug, error};
use std::os::raw::c_void;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

/// ABI of one compiled trace: `(state, pc, memory) -> memory`. The state
/// pointer addresses the task's register blob (see `task::StateHeader` for
/// the layout of its first bytes), and the returned memory pointer replaces
/// the task's memory handle; returning null retires the task.
pub type LiftedFunction =
    unsafe extern "C" fn(state: *mut u8, pc: u64, memory: *mut c_void) -> *mut c_void;

/// A batch of host functions produced from one decoded batch.
pub struct LiftedModule {
    pub functions: Vec<LiftedTraceFn>,
}

pub struct LiftedTraceFn {
    pub id: TraceId,
    pub entry_pc: GuestPc,
    pub func: LiftedFunction,
}

/// Instruction-level decoding, used from the dispatch thread by the trace
/// decoder. `bytes` holds at most one instruction's worth of fetched bytes
/// and may be short (or empty) when the fetch ran off executable memory.
pub trait InstructionDecoder: Send + Sync {
    fn decode(&self, pc: GuestPc, bytes: &[u8]) -> DecodedInstruction;
}

/// Full backend: instruction decoding plus batch lifting. `lift` runs on
/// worker threads and must not touch guest memory; everything it needs is in
/// the decoded traces.
pub trait Lifter: InstructionDecoder {
    fn lift(&self, traces: &[DecodedTrace]) -> Result<LiftedModule, String>;
}

/// Backend used when no real translator is linked in: nothing decodes and
/// nothing lifts, so every dispatch falls through to the error intrinsic.
pub struct NullLifter;

impl InstructionDecoder for NullLifter {
    fn decode(&self, pc: GuestPc, bytes: &[u8]) -> DecodedInstruction {
        DecodedInstruction::invalid(pc, bytes.to_vec())
    }
}

impl Lifter for NullLifter {
    fn lift(&self, _traces: &[DecodedTrace]) -> Result<LiftedModule, String> {
        Ok(LiftedModule {
            functions: Vec::new(),
        })
    }
}

pub struct LiftRequest {
    pub traces: Vec<DecodedTrace>,
}

/// Completion record: the module (or the backend's failure message) plus the
/// decoded traces echoed back, so the dispatcher can reconstruct the live
/// keys the request was for.
pub struct LiftResponse {
    pub traces: Vec<DecodedTrace>,
    pub result: Result<LiftedModule, String>,
}

/// Bounded pool of backend workers. Requests are decoded batches; responses
/// come back on a channel the dispatch loop drains between sweeps, so lift
/// work never blocks the dispatch thread.
pub struct LifterPool {
    request_tx: Option<Sender<LiftRequest>>,
    response_rx: Receiver<LiftResponse>,
    workers: Vec<JoinHandle<()>>,
}

impl LifterPool {
    pub fn new(lifter: Arc<dyn Lifter>, num_workers: usize) -> LifterPool {
        let (request_tx, request_rx) = channel::unbounded::<LiftRequest>();
        let (response_tx, response_rx) = channel::unbounded::<LiftResponse>();
        let mut workers = Vec::with_capacity(num_workers);
        for i in 0..num_workers.max(1) {
            let request_rx = request_rx.clone();
            let response_tx = response_tx.clone();
            let lifter = lifter.clone();
            workers.push(
                thread::Builder::new()
                    .name(format!("lifter-{}", i))
                    .spawn(move || {
                        while let Ok(request) = request_rx.recv() {
                            let result = lifter.lift(&request.traces);
                            if let Err(ref message) = result {
                                error!("lift failed: {}", message);
                            }
                            let response = LiftResponse {
                                traces: request.traces,
                                result,
                            };
                            if response_tx.send(response).is_err() {
                                break;
                            }
                        }
                    })
                    .expect("failed to spawn lifter worker"),
            );
        }
        LifterPool {
            request_tx: Some(request_tx),
            response_rx,
            workers,
        }
    }

    pub fn submit(&self, traces: Vec<DecodedTrace>) {
        debug!("submitting {} traces for lifting", traces.len());
        if let Some(tx) = &self.request_tx {
            // Send only fails when every worker died; surfaced on collect.
            let _ = tx.send(LiftRequest { traces });
        }
    }

    /// Non-blocking poll for a finished batch.
    pub fn try_collect(&self) -> Option<LiftResponse> {
        match self.response_rx.try_recv() {
            Ok(response) => Some(response),
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
        }
    }

    /// Blocking wait; used when every runnable task is parked on a pending
    /// translation.
    pub fn collect(&self) -> Option<LiftResponse> {
        self.response_rx.recv().ok()
    }
}

impl Drop for LifterPool {
    fn drop(&mut self) {
        self.request_tx.take();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}
