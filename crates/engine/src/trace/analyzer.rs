// TDB - Trace Debugger
// Copyright (C) 2024 Zhuo Zhang and Wuqi Zhang
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Single-pass analysis of a struct-log trace.
//!
//! [`TraceAnalysis::analyse`] walks the raw log once and derives the call-frame
//! tree from depth transitions together with the monotonic change indices the
//! rest of the engine queries in `O(log n)`.

use std::{collections::HashMap, sync::Arc};

use alloy_primitives::{hex, Address, Bytes, B256, U256};
use revm::bytecode::OpCode;
use serde::{Deserialize, Serialize};
use tdb_common::{
    opcode_from_name,
    types::{CallKind, RawTrace, RevertKind, StructLog, TxContext},
    OpcodeTr,
};
use tracing::{debug, info};

use super::{CallFrame, FrameId};
use crate::{
    error::TraceError,
    utils::{find_lower_bound, find_lower_bound_by_key},
};

/// Largest memory range copied out of a step (calldata, return data, hash preimages).
const MAX_MEMORY_READ: usize = 1 << 24;

/// One executed instruction, with stack and memory decoded.
#[derive(Debug, Clone)]
pub struct ExecutionStep {
    /// Position in the trace
    pub index: usize,
    /// Decoded opcode, `None` for mnemonics this EVM definition does not know
    pub op: Option<OpCode>,
    /// Mnemonic as reported by the node
    pub op_name: String,
    /// Program counter
    pub pc: usize,
    /// Struct-log call depth
    pub depth: u64,
    /// Remaining gas before the instruction
    pub gas: u64,
    /// Gas charged by the node for the instruction
    pub gas_cost: u64,
    /// Stack, bottom first
    pub stack: Vec<U256>,
    /// Memory, shared with the previous step when unchanged
    pub memory: Arc<[u8]>,
    /// Node-reported error
    pub error: Option<String>,
}

impl ExecutionStep {
    /// The `n`-th stack word counted from the top (`0` is the top).
    pub fn stack_top(&self, n: usize) -> Option<U256> {
        self.stack.len().checked_sub(n + 1).map(|i| self.stack[i])
    }

    /// Whether the step executes `op`.
    pub fn is(&self, op: OpCode) -> bool {
        self.op == Some(op)
    }

    /// Copy `size` bytes of memory starting at `offset`, zero-padding past the end.
    pub fn read_memory(&self, offset: U256, size: U256) -> Bytes {
        read_memory(&self.memory, offset, size)
    }
}

/// An `SSTORE` observed in the trace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageWrite {
    /// Step executing the `SSTORE`
    pub step: usize,
    /// Frame executing the `SSTORE`
    pub frame: FrameId,
    /// Storage owner
    pub address: Address,
    /// Slot written
    pub slot: U256,
    /// Value written
    pub value: U256,
    /// Exit step of the innermost failing frame that discards this write
    pub reverted_at: Option<usize>,
}

impl StorageWrite {
    /// Whether the write is in effect when execution reaches `step`.
    pub fn visible_at(&self, step: usize) -> bool {
        self.step < step && self.reverted_at.is_none_or(|reverted| reverted > step)
    }
}

/// A `KECCAK256` input of the form `key ++ slot`, used to name mapping entries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Preimage {
    /// Everything but the trailing 32 bytes
    pub key: Bytes,
    /// The trailing 32-byte word, the mapping's base slot
    pub base_slot: U256,
}

/// The analysed trace: steps, call frames and change indices. Immutable once built.
#[derive(Debug, Clone)]
pub struct TraceAnalysis {
    tx: TxContext,
    failed: bool,
    gas_used: u64,
    steps: Vec<ExecutionStep>,
    frames: Vec<CallFrame>,
    frame_changes: Vec<(usize, FrameId)>,
    memory_changes: Vec<usize>,
    storage_writes: Vec<StorageWrite>,
    stops: Vec<usize>,
    out_of_gas: Vec<usize>,
    return_values: Vec<(usize, Bytes)>,
    preimages: HashMap<B256, Preimage>,
}

impl TraceAnalysis {
    /// Analyse `raw`, the struct log of `tx`.
    pub fn analyse(tx: TxContext, raw: &RawTrace) -> Result<Self, TraceError> {
        if raw.is_empty() {
            return Err(TraceError::NotAContractInvocation);
        }

        let steps = decode_steps(&raw.struct_logs)?;
        let root_address = tx.target();
        let mut analysis = Self {
            frames: vec![CallFrame {
                id: FrameId::ROOT,
                parent: None,
                kind: CallKind::Root,
                code_address: root_address,
                storage_address: root_address,
                depth: steps[0].depth,
                call_step: None,
                start: 0,
                exit: steps.len() - 1,
                return_step: None,
                reverted: None,
                calldata: if tx.is_creation() { Bytes::new() } else { tx.input.clone() },
                output: None,
                children: Vec::new(),
            }],
            tx,
            failed: raw.failed,
            gas_used: raw.gas,
            steps: Vec::new(),
            frame_changes: vec![(0, FrameId::ROOT)],
            memory_changes: Vec::new(),
            storage_writes: Vec::new(),
            stops: Vec::new(),
            out_of_gas: Vec::new(),
            return_values: Vec::new(),
            preimages: HashMap::new(),
        };
        analysis.build_call_tree(&steps);
        analysis.steps = steps;

        info!(
            steps = analysis.steps.len(),
            frames = analysis.frames.len(),
            storage_writes = analysis.storage_writes.len(),
            failed = analysis.failed,
            "Trace analysed"
        );
        Ok(analysis)
    }

    fn build_call_tree(&mut self, steps: &[ExecutionStep]) {
        let mut open = vec![FrameId::ROOT];

        for (i, step) in steps.iter().enumerate() {
            let current = open.last().copied().unwrap_or(FrameId::ROOT);
            let next = steps.get(i + 1);

            if i > 0 && !Arc::ptr_eq(&step.memory, &steps[i - 1].memory) {
                self.memory_changes.push(i);
            }
            if step.error.is_none() {
                self.record_effects(step, next, current);
            }
            if is_out_of_gas(step) {
                self.out_of_gas.push(i);
            }

            match next {
                Some(next) if next.depth > step.depth => {
                    let id = self.open_frame(step, next, current);
                    open.push(id);
                    self.frame_changes.push((i + 1, id));
                }
                Some(next) if next.depth < step.depth => {
                    let mut innermost = true;
                    while open.len() > 1 {
                        let Some(&top) = open.last() else { break };
                        if self.frames[top.index()].depth <= next.depth {
                            break;
                        }
                        let reverted = if innermost {
                            revert_kind(step)
                        } else {
                            Some(RevertKind::Error)
                        };
                        self.close_frame(top, i, Some(next), reverted);
                        open.pop();
                        innermost = false;
                    }
                    self.frame_changes.push((i + 1, open.last().copied().unwrap_or(FrameId::ROOT)));
                }
                Some(_) => {}
                None => {
                    let mut innermost = true;
                    while let Some(top) = open.pop() {
                        let mut reverted =
                            if innermost { revert_kind(step) } else { Some(RevertKind::Error) };
                        if top == FrameId::ROOT && reverted.is_none() && self.failed {
                            reverted = Some(RevertKind::Error);
                        }
                        self.close_frame(top, i, None, reverted);
                        innermost = false;
                    }
                }
            }
        }

        // Frames entered through DELEGATECALL/CALLCODE inherit a storage context that may have
        // been a CREATE placeholder when they were opened. Parents precede children in the arena.
        for idx in 0..self.frames.len() {
            let frame = &self.frames[idx];
            if let (true, Some(parent)) = (frame.kind.keeps_caller_storage(), frame.parent) {
                self.frames[idx].storage_address = self.frames[parent.index()].storage_address;
            }
        }
        for write in &mut self.storage_writes {
            write.address = self.frames[write.frame.index()].storage_address;
        }
    }

    fn record_effects(&mut self, step: &ExecutionStep, next: Option<&ExecutionStep>, frame: FrameId) {
        match step.op {
            Some(OpCode::SSTORE) => {
                if let (Some(slot), Some(value)) = (step.stack_top(0), step.stack_top(1)) {
                    self.storage_writes.push(StorageWrite {
                        step: step.index,
                        frame,
                        address: self.frames[frame.index()].storage_address,
                        slot,
                        value,
                        reverted_at: None,
                    });
                }
            }
            Some(OpCode::KECCAK256) => {
                if let Some((hash, preimage)) = extract_preimage(step, next) {
                    self.preimages.insert(hash, preimage);
                }
            }
            Some(OpCode::RETURN | OpCode::REVERT) => {
                if let (Some(offset), Some(size)) = (step.stack_top(0), step.stack_top(1)) {
                    let output = step.read_memory(offset, size);
                    self.return_values.push((step.index, output.clone()));
                    self.frames[frame.index()].output = Some(output);
                }
            }
            _ => {}
        }
        if step.op.is_some_and(|op| op.is_halt()) {
            self.stops.push(step.index);
        }
    }

    fn open_frame(&mut self, step: &ExecutionStep, next: &ExecutionStep, parent: FrameId) -> FrameId {
        let kind = step.op.and_then(CallKind::from_opcode).unwrap_or(CallKind::Call);
        let (code_address, calldata) = if kind.is_create() {
            // Patched from the stack once the creation returns.
            (Address::ZERO, Bytes::new())
        } else {
            let address = step.stack_top(1).map(word_to_address).unwrap_or_default();
            let (offset_at, size_at) = match kind {
                CallKind::Call | CallKind::CallCode => (3, 4),
                _ => (2, 3),
            };
            let calldata = match (step.stack_top(offset_at), step.stack_top(size_at)) {
                (Some(offset), Some(size)) => step.read_memory(offset, size),
                _ => Bytes::new(),
            };
            (address, calldata)
        };
        let storage_address = if kind.keeps_caller_storage() {
            self.frames[parent.index()].storage_address
        } else {
            code_address
        };

        let id = FrameId::from(self.frames.len());
        debug!(step = step.index, %kind, %code_address, frame = %id, "Entering call frame");
        self.frames.push(CallFrame {
            id,
            parent: Some(parent),
            kind,
            code_address,
            storage_address,
            depth: next.depth,
            call_step: Some(step.index),
            start: step.index,
            exit: step.index,
            return_step: None,
            reverted: None,
            calldata,
            output: None,
            children: Vec::new(),
        });
        self.frames[parent.index()].children.push(id);
        id
    }

    fn close_frame(
        &mut self,
        id: FrameId,
        exit: usize,
        next: Option<&ExecutionStep>,
        reverted: Option<RevertKind>,
    ) {
        let frame = &mut self.frames[id.index()];
        frame.exit = exit;
        frame.return_step = next.map(|_| exit + 1);
        frame.reverted = reverted;

        if frame.kind.is_create() {
            let created = next.and_then(|n| n.stack_top(0)).map(word_to_address).unwrap_or_default();
            frame.code_address = created;
            frame.storage_address = created;
        }

        if reverted.is_some() {
            let start = frame.start;
            for write in &mut self.storage_writes {
                if write.step >= start && write.step <= exit && write.reverted_at.is_none() {
                    write.reverted_at = Some(exit);
                }
            }
        }
    }

    fn check_step(&self, step: usize) -> Result<(), TraceError> {
        if step < self.steps.len() {
            Ok(())
        } else {
            Err(TraceError::StepOutOfRange { step, length: self.steps.len() })
        }
    }

    /// The transaction the trace belongs to.
    pub fn tx(&self) -> &TxContext {
        &self.tx
    }

    /// Whether the node reported the transaction as failed.
    pub fn failed(&self) -> bool {
        self.failed
    }

    /// Gas used by the transaction, as reported by the node.
    pub fn gas_used(&self) -> u64 {
        self.gas_used
    }

    /// Number of steps.
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// Always false for a successfully analysed trace.
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Whether `step` is a valid index.
    pub fn in_range(&self, step: usize) -> bool {
        step < self.steps.len()
    }

    /// All steps.
    pub fn steps(&self) -> &[ExecutionStep] {
        &self.steps
    }

    /// The step at `step`.
    pub fn step(&self, step: usize) -> Result<&ExecutionStep, TraceError> {
        self.check_step(step)?;
        Ok(&self.steps[step])
    }

    /// The stack at `step`, bottom first.
    pub fn stack_at(&self, step: usize) -> Result<&[U256], TraceError> {
        Ok(&self.step(step)?.stack)
    }

    /// The memory at `step`.
    pub fn memory_at(&self, step: usize) -> Result<&[u8], TraceError> {
        Ok(&self.step(step)?.memory)
    }

    /// Remaining gas at `step`.
    pub fn remaining_gas(&self, step: usize) -> Result<u64, TraceError> {
        Ok(self.step(step)?.gas)
    }

    /// Gas attributed to `step`. For a step entering a new frame the gas handed to the
    /// callee is excluded, so nested steps are not counted twice.
    pub fn step_gas_cost(&self, step: usize) -> Result<u64, TraceError> {
        let current = self.step(step)?;
        Ok(match self.steps.get(step + 1) {
            Some(next) if next.depth > current.depth => current.gas_cost.saturating_sub(next.gas),
            _ => current.gas_cost,
        })
    }

    /// All call frames; index 0 is the root.
    pub fn frames(&self) -> &[CallFrame] {
        &self.frames
    }

    /// The frame with the given id.
    pub fn frame(&self, id: FrameId) -> &CallFrame {
        &self.frames[id.index()]
    }

    /// The transaction's top-level frame.
    pub fn root_frame(&self) -> &CallFrame {
        &self.frames[0]
    }

    /// The frame executing `step`. A call step executes in the caller; its callee starts
    /// with the following step.
    pub fn frame_at(&self, step: usize) -> Result<&CallFrame, TraceError> {
        self.check_step(step)?;
        let idx = find_lower_bound_by_key(&self.frame_changes, step, |(s, _)| *s).unwrap_or(0);
        Ok(self.frame(self.frame_changes[idx].1))
    }

    /// The frames from the root down to the one executing `step`.
    pub fn call_path(&self, step: usize) -> Result<Vec<&CallFrame>, TraceError> {
        let mut path = vec![self.frame_at(step)?];
        while let Some(parent) = path.last().and_then(|f| f.parent) {
            path.push(self.frame(parent));
        }
        path.reverse();
        Ok(path)
    }

    /// Address whose code runs at `step`.
    pub fn address_at(&self, step: usize) -> Result<Address, TraceError> {
        Ok(self.frame_at(step)?.code_address)
    }

    /// Address whose storage is in effect at `step`.
    pub fn storage_address_at(&self, step: usize) -> Result<Address, TraceError> {
        Ok(self.frame_at(step)?.storage_address)
    }

    /// Calldata of the frame executing `step`.
    pub fn calldata_at(&self, step: usize) -> Result<&Bytes, TraceError> {
        Ok(&self.frame_at(step)?.calldata)
    }

    /// Whether `step` runs init code.
    pub fn is_creation_step(&self, step: usize) -> Result<bool, TraceError> {
        let frame = self.frame_at(step)?;
        Ok(frame.kind.is_create() || (frame.id == FrameId::ROOT && self.tx.is_creation()))
    }

    /// The step execution continues at once the frame running `step` finishes. For the
    /// root frame this is the last step of the trace.
    pub fn find_step_out(&self, step: usize) -> Result<usize, TraceError> {
        let frame = self.frame_at(step)?;
        Ok(frame.return_step.unwrap_or(frame.exit))
    }

    /// The next step after `step` that opens a call frame.
    pub fn find_next_call(&self, step: usize) -> Result<Option<usize>, TraceError> {
        self.check_step(step)?;
        Ok(self.frames.iter().filter_map(|f| f.call_step).filter(|s| *s > step).min())
    }

    /// The last step before `step` that opened a call frame.
    pub fn find_prev_call(&self, step: usize) -> Result<Option<usize>, TraceError> {
        self.check_step(step)?;
        Ok(self.frames.iter().filter_map(|f| f.call_step).filter(|s| *s < step).max())
    }

    /// The last step at or before `step` whose memory differs from its predecessor.
    pub fn last_memory_change(&self, step: usize) -> Result<Option<usize>, TraceError> {
        self.check_step(step)?;
        Ok(find_lower_bound(&self.memory_changes, step).map(|i| self.memory_changes[i]))
    }

    /// Steps whose memory differs from the previous step.
    pub fn memory_changes(&self) -> &[usize] {
        &self.memory_changes
    }

    /// Every `SSTORE` in execution order.
    pub fn storage_writes(&self) -> &[StorageWrite] {
        &self.storage_writes
    }

    /// Steps halting a frame normally (`STOP`, `RETURN`, `SELFDESTRUCT`).
    pub fn stops(&self) -> &[usize] {
        &self.stops
    }

    /// Steps at which execution ran out of gas.
    pub fn out_of_gas(&self) -> &[usize] {
        &self.out_of_gas
    }

    /// Data returned by each `RETURN`/`REVERT`, keyed by step.
    pub fn return_values(&self) -> &[(usize, Bytes)] {
        &self.return_values
    }

    /// The most recent return data at or before `step`.
    pub fn return_value_at(&self, step: usize) -> Result<Option<&Bytes>, TraceError> {
        self.check_step(step)?;
        Ok(find_lower_bound_by_key(&self.return_values, step, |(s, _)| *s)
            .map(|i| &self.return_values[i].1))
    }

    /// The `KECCAK256` preimage that produced `hash`, if it was computed in this trace.
    pub fn preimage(&self, hash: &B256) -> Option<&Preimage> {
        self.preimages.get(hash)
    }

    /// All recorded `KECCAK256` preimages.
    pub fn preimages(&self) -> impl Iterator<Item = (&B256, &Preimage)> {
        self.preimages.iter()
    }

    /// The first step of the trace where a frame fails.
    pub fn first_exception(&self) -> Option<usize> {
        self.frames.iter().filter(|f| f.is_reverted()).map(|f| f.exit).min()
    }

    /// Whether `address` was deployed by a frame that finished before `step`.
    pub fn created_before(&self, address: Address, step: usize) -> bool {
        let root_created = self.tx.is_creation() && self.root_frame().code_address == address;
        root_created
            || self.frames.iter().any(|f| {
                f.kind.is_create()
                    && f.code_address == address
                    && f.start < step
                    && f.reverted.is_none()
            })
    }

    /// Render the call tree, one frame per line.
    pub fn format_call_tree(&self) -> String {
        let mut out = String::new();
        self.format_frame(FrameId::ROOT, 0, &mut out);
        out
    }

    fn format_frame(&self, id: FrameId, indent: usize, out: &mut String) {
        let frame = self.frame(id);
        let status = match frame.reverted {
            None => "✓",
            Some(RevertKind::OutOfGas) => "☠ out of gas",
            Some(_) => "✗ reverted",
        };
        let end = frame.return_step.unwrap_or(frame.exit);
        out.push_str(&format!(
            "{}{} {} [{}..{}] {}\n",
            "  ".repeat(indent),
            frame.kind,
            frame.code_address,
            frame.start,
            end,
            status
        ));
        for child in &frame.children {
            self.format_frame(*child, indent + 1, out);
        }
    }
}

fn decode_steps(logs: &[StructLog]) -> Result<Vec<ExecutionStep>, TraceError> {
    let mut steps = Vec::with_capacity(logs.len());
    let mut previous: Option<(&[String], Arc<[u8]>)> = None;

    for (index, log) in logs.iter().enumerate() {
        let stack = log
            .stack
            .iter()
            .map(|word| parse_word(word))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| TraceError::Malformed(format!("step {index}: {e}")))?;

        let memory = match &previous {
            Some((words, memory)) if *words == log.memory.as_slice() => memory.clone(),
            _ => Arc::from(
                parse_memory(&log.memory)
                    .map_err(|e| TraceError::Malformed(format!("step {index}: {e}")))?,
            ),
        };
        previous = Some((&log.memory, memory.clone()));

        steps.push(ExecutionStep {
            index,
            op: opcode_from_name(&log.op),
            op_name: log.op.clone(),
            pc: log.pc as usize,
            depth: log.depth,
            gas: log.gas,
            gas_cost: log.gas_cost,
            stack,
            memory,
            error: log.error.clone(),
        });
    }
    Ok(steps)
}

fn parse_word(word: &str) -> Result<U256, String> {
    let digits = word.strip_prefix("0x").unwrap_or(word);
    if digits.is_empty() {
        return Ok(U256::ZERO);
    }
    U256::from_str_radix(digits, 16).map_err(|e| format!("invalid stack word {word:?}: {e}"))
}

fn parse_memory(words: &[String]) -> Result<Vec<u8>, String> {
    let mut memory = Vec::with_capacity(words.len() * 32);
    for word in words {
        let bytes = hex::decode(word).map_err(|e| format!("invalid memory word {word:?}: {e}"))?;
        memory.extend_from_slice(&bytes);
    }
    Ok(memory)
}

/// Copy `size` bytes of `memory` starting at `offset`, zero-padding past the end.
pub fn read_memory(memory: &[u8], offset: U256, size: U256) -> Bytes {
    let (Ok(offset), Ok(size)) = (usize::try_from(offset), usize::try_from(size)) else {
        return Bytes::new();
    };
    if size == 0 || size > MAX_MEMORY_READ {
        return Bytes::new();
    }
    let mut out = vec![0u8; size];
    if offset < memory.len() {
        let end = memory.len().min(offset.saturating_add(size));
        out[..end - offset].copy_from_slice(&memory[offset..end]);
    }
    out.into()
}

/// The low 20 bytes of a stack word.
pub fn word_to_address(word: U256) -> Address {
    Address::from_word(B256::from(word.to_be_bytes::<32>()))
}

fn is_out_of_gas(step: &ExecutionStep) -> bool {
    match &step.error {
        Some(error) => RevertKind::from_error(error) == RevertKind::OutOfGas,
        None => step.gas < step.gas_cost,
    }
}

fn revert_kind(last: &ExecutionStep) -> Option<RevertKind> {
    if let Some(error) = &last.error {
        return Some(RevertKind::from_error(error));
    }
    match last.op {
        Some(OpCode::REVERT) => Some(RevertKind::Revert),
        Some(OpCode::INVALID) => Some(RevertKind::Invalid),
        _ if last.gas < last.gas_cost => Some(RevertKind::OutOfGas),
        // Running off the end of the code is an implicit STOP.
        _ => None,
    }
}

fn extract_preimage(step: &ExecutionStep, next: Option<&ExecutionStep>) -> Option<(B256, Preimage)> {
    let next = next.filter(|n| n.depth == step.depth)?;
    let data = step.read_memory(step.stack_top(0)?, step.stack_top(1)?);
    if data.len() <= 32 {
        return None;
    }
    let hash = B256::from(next.stack_top(0)?.to_be_bytes::<32>());
    let (key, slot) = data.split_at(data.len() - 32);
    Some((hash, Preimage { key: Bytes::copy_from_slice(key), base_slot: U256::from_be_slice(slot) }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{addr, tx_to, TraceBuilder};
    use alloy_primitives::keccak256;

    /// Ten steps, one CALL at step 3 into depth 2 returning at step 7, STOP at step 9.
    fn simple_call_trace() -> RawTrace {
        let callee = U256::from_be_slice(addr(0xbb).as_slice());
        TraceBuilder::new()
            .step(0, "PUSH1", 1, &[])
            .step(2, "PUSH1", 1, &[U256::from(0)])
            .step(4, "PUSH20", 1, &[U256::ZERO, U256::ZERO])
            .step(
                25,
                "CALL",
                1,
                &[U256::ZERO, U256::ZERO, U256::ZERO, U256::ZERO, U256::ZERO, callee, U256::from(5000)],
            )
            .step(0, "PUSH1", 2, &[])
            .step(2, "PUSH1", 2, &[U256::from(1)])
            .step(4, "STOP", 2, &[U256::from(1), U256::from(2)])
            .step(26, "PUSH1", 1, &[U256::from(1)])
            .step(28, "POP", 1, &[U256::from(1), U256::from(3)])
            .step(29, "STOP", 1, &[U256::from(1)])
            .build()
    }

    #[test]
    fn test_simple_call_tree() {
        let analysis = TraceAnalysis::analyse(tx_to(addr(0xaa)), &simple_call_trace()).unwrap();

        assert_eq!(analysis.len(), 10);
        assert_eq!(analysis.frames().len(), 2);
        let root = analysis.root_frame();
        assert_eq!(root.children.len(), 1);
        assert_eq!(root.exit, 9);
        assert!(!root.is_reverted());

        let child = analysis.frame(root.children[0]);
        assert_eq!(child.kind, CallKind::Call);
        assert_eq!(child.start, 3);
        assert_eq!(child.exit, 6);
        assert_eq!(child.return_step, Some(7));
        assert_eq!(child.code_address, addr(0xbb));

        assert_eq!(analysis.address_at(5).unwrap(), addr(0xbb));
        assert_eq!(analysis.address_at(3).unwrap(), addr(0xaa));
        assert_eq!(analysis.address_at(7).unwrap(), addr(0xaa));
        assert_eq!(analysis.find_step_out(5).unwrap(), 7);
        assert_eq!(analysis.find_step_out(8).unwrap(), 9);
        assert_eq!(analysis.find_next_call(0).unwrap(), Some(3));
        assert_eq!(analysis.find_prev_call(9).unwrap(), Some(3));
        assert_eq!(analysis.stops(), &[6, 9]);
        assert_eq!(analysis.call_path(5).unwrap().len(), 2);
    }

    #[test]
    fn test_step_out_of_range() {
        let analysis = TraceAnalysis::analyse(tx_to(addr(0xaa)), &simple_call_trace()).unwrap();
        assert!(matches!(
            analysis.step(10),
            Err(TraceError::StepOutOfRange { step: 10, length: 10 })
        ));
        assert!(analysis.stack_at(42).is_err());
        assert!(analysis.frame_at(10).is_err());
    }

    #[test]
    fn test_empty_trace_is_not_a_contract_invocation() {
        let raw = RawTrace::default();
        assert!(matches!(
            TraceAnalysis::analyse(tx_to(addr(1)), &raw),
            Err(TraceError::NotAContractInvocation)
        ));
    }

    #[test]
    fn test_revert_discards_nested_storage_writes() {
        // root SSTOREs slot 1, calls a frame that SSTOREs slot 2 and reverts.
        let callee = U256::from_be_slice(addr(0xcc).as_slice());
        let raw = TraceBuilder::new()
            .step(0, "SSTORE", 1, &[U256::from(10), U256::from(1)])
            .step(1, "CALL", 1, &[U256::ZERO, U256::ZERO, U256::ZERO, U256::ZERO, U256::ZERO, callee, U256::from(1)])
            .step(0, "SSTORE", 2, &[U256::from(20), U256::from(2)])
            .step(1, "REVERT", 2, &[U256::ZERO, U256::ZERO])
            .step(2, "STOP", 1, &[U256::ZERO])
            .build();
        let analysis = TraceAnalysis::analyse(tx_to(addr(0xaa)), &raw).unwrap();

        let writes = analysis.storage_writes();
        assert_eq!(writes.len(), 2);
        assert_eq!(writes[0].address, addr(0xaa));
        assert_eq!(writes[0].reverted_at, None);
        assert_eq!(writes[1].address, addr(0xcc));
        assert_eq!(writes[1].reverted_at, Some(3));

        assert!(writes[1].visible_at(3));
        assert!(!writes[1].visible_at(4));
        assert!(!writes[0].visible_at(0));
        assert!(writes[0].visible_at(1));

        let child = analysis.frame(FrameId::from(1));
        assert_eq!(child.reverted, Some(RevertKind::Revert));
        assert_eq!(analysis.first_exception(), Some(3));
    }

    #[test]
    fn test_create_and_delegatecall_addresses() {
        let lib = U256::from_be_slice(addr(0xdd).as_slice());
        let created = U256::from_be_slice(addr(0xee).as_slice());
        let raw = TraceBuilder::new()
            .step(0, "CREATE", 1, &[U256::ZERO, U256::ZERO, U256::ZERO])
            .step(0, "DELEGATECALL", 2, &[U256::ZERO, U256::ZERO, U256::ZERO, U256::ZERO, lib, U256::from(1)])
            .step(0, "SSTORE", 3, &[U256::from(7), U256::from(0)])
            .step(1, "STOP", 3, &[])
            .step(1, "RETURN", 2, &[U256::from(1), U256::ZERO, U256::ZERO])
            .step(1, "STOP", 1, &[created])
            .build();
        let analysis = TraceAnalysis::analyse(tx_to(addr(0xaa)), &raw).unwrap();

        let create = analysis.frame(FrameId::from(1));
        assert_eq!(create.kind, CallKind::Create);
        assert_eq!(create.code_address, addr(0xee));
        assert!(analysis.is_creation_step(1).unwrap());
        assert!(!analysis.is_creation_step(2).unwrap());
        assert!(!analysis.is_creation_step(0).unwrap());

        let delegate = analysis.frame(FrameId::from(2));
        assert_eq!(delegate.code_address, addr(0xdd));
        assert_eq!(delegate.storage_address, addr(0xee));
        assert_eq!(analysis.storage_writes()[0].address, addr(0xee));
        assert!(analysis.created_before(addr(0xee), 5));
        assert!(!analysis.created_before(addr(0xdd), 5));
    }

    #[test]
    fn test_memory_dedup_preimages_and_return_values() {
        let mut memory = vec![0u8; 64];
        memory[31] = 0x2a;
        memory[63] = 0x01;
        let hash = keccak256(&memory);
        let raw = TraceBuilder::new()
            .step(0, "PUSH1", 1, &[])
            .step(2, "KECCAK256", 1, &[U256::from(64), U256::ZERO])
            .with_memory(&memory)
            .step(3, "PUSH1", 1, &[U256::from_be_bytes(hash.0)])
            .with_memory(&memory)
            .step(5, "RETURN", 1, &[U256::from(32), U256::ZERO])
            .with_memory(&memory)
            .build();
        let analysis = TraceAnalysis::analyse(tx_to(addr(0xaa)), &raw).unwrap();

        assert_eq!(analysis.memory_changes(), &[1]);
        assert_eq!(analysis.last_memory_change(3).unwrap(), Some(1));
        assert_eq!(analysis.last_memory_change(0).unwrap(), None);

        let preimage = analysis.preimage(&hash).unwrap();
        assert_eq!(preimage.base_slot, U256::from(1));
        assert_eq!(preimage.key.len(), 32);
        assert_eq!(preimage.key[31], 0x2a);

        let output = analysis.root_frame().output.clone().unwrap();
        assert_eq!(output.len(), 32);
        assert_eq!(output[31], 0x2a);
        assert_eq!(analysis.return_value_at(3).unwrap(), Some(&output));
        assert_eq!(analysis.return_value_at(2).unwrap(), None);
    }

    #[test]
    fn test_out_of_gas_marks_frame() {
        let raw = TraceBuilder::new()
            .step(0, "PUSH1", 1, &[])
            .step(2, "SSTORE", 1, &[U256::from(1), U256::from(1)])
            .with_error("out of gas")
            .build();
        let analysis = TraceAnalysis::analyse(tx_to(addr(0xaa)), &raw).unwrap();
        assert_eq!(analysis.out_of_gas(), &[1]);
        assert!(analysis.root_frame().is_out_of_gas());
        assert!(analysis.storage_writes().is_empty());
    }

    #[test]
    fn test_step_gas_cost_excludes_forwarded_gas() {
        let analysis = TraceAnalysis::analyse(tx_to(addr(0xaa)), &simple_call_trace()).unwrap();
        let call = analysis.step(3).unwrap();
        let callee_gas = analysis.step(4).unwrap().gas;
        assert_eq!(analysis.step_gas_cost(3).unwrap(), call.gas_cost.saturating_sub(callee_gas));
        assert_eq!(analysis.step_gas_cost(5).unwrap(), analysis.step(5).unwrap().gas_cost);
    }

    #[test]
    fn test_read_memory_padding() {
        let memory = [1u8, 2, 3];
        assert_eq!(read_memory(&memory, U256::from(1), U256::from(4)).as_ref(), &[2, 3, 0, 0]);
        assert!(read_memory(&memory, U256::ZERO, U256::ZERO).is_empty());
        assert!(read_memory(&memory, U256::MAX, U256::from(1)).is_empty());
    }
}
