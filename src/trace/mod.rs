pub mod decoder;

pub use decoder::decode_traces;

use crate::guest_ptr::GuestPc;
use crate::memory::CodeVersion;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Identity of a translation unit, independent of which address space or run
/// produced it: the entry PC plus a position-sensitive digest of every
/// decoded instruction byte. Two traces with identical bytes at identical
/// PCs share a `TraceId`, which is what lets the code cache deduplicate
/// translations across address spaces and executions.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TraceId {
    pub entry_pc: GuestPc,
    pub hash: u64,
}

impl fmt::Display for TraceId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}:{:016x}", self.entry_pc, self.hash)
    }
}

/// The hot dispatch key: where a task is about to execute, and which content
/// version of the surrounding range that PC was decoded under.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LiveTraceId {
    pub pc: GuestPc,
    pub version: CodeVersion,
}

impl fmt::Display for LiveTraceId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}@{}", self.pc, self.version)
    }
}

/// Control-flow class of a decoded instruction, as reported by the lifter
/// backend. Drives both the decoder's successor enqueueing and the lifted
/// code's exit strategy.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum InstructionCategory {
    Normal,
    NoOp,
    /// Decodable but known-faulting (e.g. privileged in user mode).
    Error,
    /// Not a valid instruction at all.
    Invalid,
    DirectJump,
    IndirectJump,
    DirectFunctionCall,
    IndirectFunctionCall,
    FunctionReturn,
    ConditionalBranch,
    AsyncHyperCall,
    ConditionalAsyncHyperCall,
}

/// One decoded guest instruction: its raw bytes plus the successor PCs the
/// backend extracted from it. `next_pc` is the fall-through; branches carry
/// the taken/not-taken pair instead.
#[derive(Clone, Debug)]
pub struct DecodedInstruction {
    pub pc: GuestPc,
    pub bytes: Vec<u8>,
    pub category: InstructionCategory,
    pub next_pc: Option<GuestPc>,
    pub taken_pc: Option<GuestPc>,
    pub not_taken_pc: Option<GuestPc>,
}

impl DecodedInstruction {
    /// An undecodable byte sequence; lowered to the error intrinsic at lift
    /// time.
    pub fn invalid(pc: GuestPc, bytes: Vec<u8>) -> DecodedInstruction {
        DecodedInstruction {
            pc,
            bytes,
            category: InstructionCategory::Invalid,
            next_pc: None,
            taken_pc: None,
            not_taken_pc: None,
        }
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_decodable(&self) -> bool {
        !matches!(
            self.category,
            InstructionCategory::Invalid | InstructionCategory::Error
        )
    }
}

/// Single-entry, multiple-exit region of guest code produced by one decoder
/// walk, with the code version its bytes were read under.
#[derive(Clone, Debug)]
pub struct DecodedTrace {
    pub entry_pc: GuestPc,
    pub id: TraceId,
    pub version: CodeVersion,
    pub instructions: BTreeMap<GuestPc, DecodedInstruction>,
}
