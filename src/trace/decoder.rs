//! Recursive trace partitioning.
//!
//! Starting from an entry PC, the decoder walks the statically reachable
//! code graph and cuts it into single-entry, multiple-exit traces. Direct
//! call targets start new traces (they return to a known site, and keeping
//! callees separate bounds trace size and maximises sharing); indirect edges
//! end the walk and are resolved at run time by the dispatch table.

use crate::guest_ptr::GuestPc;
use crate::lifter::InstructionDecoder;
use crate::memory::AddressSpace;
use crate::trace::{DecodedInstruction, DecodedTrace, InstructionCategory, TraceId};
use crate::util::Digest;
use log::{debug, warn};
use std::collections::{BTreeMap, VecDeque};

/// Decode every not-yet-seen trace reachable from `entry_pc`. PCs already in
/// the address space's trace-head memo are skipped: they were decoded under
/// the current code version, and any translation for them is already in
/// flight or live.
pub fn decode_traces<D: InstructionDecoder + ?Sized>(
    decoder: &D,
    memory: &AddressSpace,
    entry_pc: GuestPc,
) -> Vec<DecodedTrace> {
    let max_bytes = memory.arch().max_instruction_bytes();
    let mut traces = Vec::new();
    let mut inter_trace: VecDeque<GuestPc> = VecDeque::new();
    inter_trace.push_back(entry_pc);

    while let Some(trace_pc) = inter_trace.pop_front() {
        if memory.is_trace_head(trace_pc) {
            continue;
        }
        memory.mark_trace_head(trace_pc);
        let version = memory.compute_code_version(trace_pc);

        let mut instructions: BTreeMap<GuestPc, DecodedInstruction> = BTreeMap::new();
        let mut intra_trace: Vec<GuestPc> = vec![trace_pc];

        while let Some(pc) = intra_trace.pop() {
            if instructions.contains_key(&pc) {
                continue;
            }
            let bytes = read_instruction_bytes(memory, pc, max_bytes);
            let inst = decoder.decode(pc, &bytes);
            if !inst.is_decodable() {
                warn!("unable to decode instruction at {}", pc);
            }
            enqueue_successors(&inst, &mut intra_trace, &mut inter_trace);
            instructions.insert(pc, inst);
        }

        let id = hash_trace(trace_pc, &instructions);
        debug!(
            "decoded trace {} with {} instructions",
            id,
            instructions.len()
        );
        traces.push(DecodedTrace {
            entry_pc: trace_pc,
            id,
            version,
            instructions,
        });
    }
    traces
}

/// Fetch up to one instruction's worth of bytes, stopping at the first byte
/// that is not executable.
fn read_instruction_bytes(memory: &AddressSpace, pc: GuestPc, max_bytes: usize) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(max_bytes);
    for i in 0..max_bytes {
        let mut byte = 0u8;
        if !memory.try_read_executable(pc.offset(i as u64), &mut byte) {
            break;
        }
        bytes.push(byte);
    }
    bytes
}

fn enqueue_successors(
    inst: &DecodedInstruction,
    intra_trace: &mut Vec<GuestPc>,
    inter_trace: &mut VecDeque<GuestPc>,
) {
    match inst.category {
        InstructionCategory::Normal | InstructionCategory::NoOp => {
            if let Some(next) = inst.next_pc {
                intra_trace.push(next);
            }
        }
        InstructionCategory::ConditionalBranch => {
            if let Some(taken) = inst.taken_pc {
                intra_trace.push(taken);
            }
            if let Some(not_taken) = inst.not_taken_pc.or(inst.next_pc) {
                intra_trace.push(not_taken);
            }
        }
        InstructionCategory::DirectJump => {
            if let Some(taken) = inst.taken_pc {
                intra_trace.push(taken);
            }
        }
        InstructionCategory::DirectFunctionCall => {
            // The body continues at the return site; the callee becomes its
            // own trace unless the call is a fall-through to itself.
            if let Some(return_site) = inst.not_taken_pc {
                intra_trace.push(return_site);
            }
            if let Some(callee) = inst.taken_pc {
                if Some(callee) != inst.not_taken_pc {
                    inter_trace.push_back(callee);
                }
            }
        }
        InstructionCategory::IndirectFunctionCall
        | InstructionCategory::ConditionalAsyncHyperCall => {
            if let Some(return_site) = inst.not_taken_pc {
                intra_trace.push(return_site);
            }
        }
        InstructionCategory::IndirectJump
        | InstructionCategory::FunctionReturn
        | InstructionCategory::AsyncHyperCall
        | InstructionCategory::Error
        | InstructionCategory::Invalid => {}
    }
}

/// Content hash over all instruction bytes in PC order, seeded with
/// `min_pc * max_pc * instruction_count` so identical byte sequences at
/// different PCs digest differently.
fn hash_trace(entry_pc: GuestPc, instructions: &BTreeMap<GuestPc, DecodedInstruction>) -> TraceId {
    let min_pc = instructions
        .keys()
        .next()
        .copied()
        .unwrap_or(entry_pc)
        .as_u64();
    let max_pc = instructions
        .keys()
        .next_back()
        .copied()
        .unwrap_or(entry_pc)
        .as_u64();
    let seed = min_pc
        .wrapping_mul(max_pc)
        .wrapping_mul(instructions.len() as u64);
    let mut digest = Digest::with_seed(seed);
    for inst in instructions.values() {
        digest.update(&inst.bytes);
    }
    TraceId {
        entry_pc,
        hash: digest.finish(),
    }
}
