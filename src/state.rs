//! Per-thread virtual machine state.
//!
//! `VirtualMachineState` owns everything that belongs to one thread of
//! execution: the interpreted frames, the operand stack they share, the
//! call-stack depth bookkeeping used to return to native callers, and the
//! pending guest exception. Nothing in here is shared between threads.
use std::sync::Arc;

use byteorder::{BigEndian, ByteOrder};
use tracing::debug;

use crate::error::{Result, RuntimeError};
use crate::heap::ObjectRef;
use crate::monitor::Monitor;
use crate::program::{Class, Method};
use crate::safepoint::PauseToken;
use crate::value::Value;

/// Operand stack entry, tagged with the address of the instruction that
/// pushed it so exception handlers can rewind to a region start.
#[derive(Debug, Clone, PartialEq)]
pub struct OperandEntry {
    pub value: Value,
    pub pushed_at: usize,
}

/// Activation record of an interpreted method.
#[derive(Debug)]
pub struct Frame {
    pub class: Arc<Class>,
    pub method: Arc<Method>,
    // Next byte to decode.
    pc: usize,
    // Address of the instruction being executed.
    instruction_pc: usize,
    locals: Vec<Value>,
    // Index of the first operand stack entry owned by this frame.
    stack_base: usize,
    // Monitors held by this activation, released in reverse on exit.
    monitors: Vec<Arc<Monitor>>,
}

impl Frame {
    pub fn pc(&self) -> usize {
        self.pc
    }

    pub fn instruction_pc(&self) -> usize {
        self.instruction_pc
    }

    pub fn code(&self) -> &[u8] {
        &self.method.code
    }

    pub fn code_len(&self) -> usize {
        self.method.code.len()
    }

    pub fn can_read_bytes(&self, count: usize) -> bool {
        self.pc + count <= self.code_len()
    }

    /// Moves the program counter to an absolute address.
    pub fn jump(&mut self, target: usize) -> Result<()> {
        if target >= self.code_len() {
            return Err(RuntimeError::CodeSegmentExhausted {
                pc: target,
                len: self.code_len(),
            });
        }
        self.pc = target;
        Ok(())
    }

    /// Branches relative to the current instruction's address.
    pub fn branch(&mut self, offset: i32) -> Result<()> {
        let target = self.instruction_pc as i64 + offset as i64;
        if target < 0 {
            return Err(RuntimeError::CodeSegmentExhausted {
                pc: 0,
                len: self.code_len(),
            });
        }
        self.jump(target as usize)
    }

    pub fn advance_pc(&mut self, count: usize) -> Result<()> {
        if !self.can_read_bytes(count) {
            return Err(RuntimeError::CodeSegmentExhausted {
                pc: self.pc,
                len: self.code_len(),
            });
        }
        self.pc += count;
        Ok(())
    }

    /// Fetches the next opcode byte and marks the start of a new instruction.
    pub fn fetch_opcode(&mut self) -> Result<u8> {
        self.instruction_pc = self.pc;
        self.read_u8()
    }

    fn read_slice(&mut self, count: usize) -> Result<&[u8]> {
        let start = self.pc;
        self.advance_pc(count)?;
        Ok(&self.method.code[start..start + count])
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        Ok(self.read_slice(1)?[0])
    }

    pub fn read_i8(&mut self) -> Result<i8> {
        Ok(self.read_u8()? as i8)
    }

    pub fn read_u16(&mut self) -> Result<u16> {
        Ok(BigEndian::read_u16(self.read_slice(2)?))
    }

    pub fn read_i16(&mut self) -> Result<i16> {
        Ok(BigEndian::read_i16(self.read_slice(2)?))
    }

    pub fn read_i32(&mut self) -> Result<i32> {
        Ok(BigEndian::read_i32(self.read_slice(4)?))
    }

    pub fn local_count(&self) -> usize {
        self.locals.len()
    }

    pub fn monitors(&self) -> &[Arc<Monitor>] {
        &self.monitors
    }
}

/// Lays the arguments of `method` out into a fresh local variable array of
/// `max_locals` slots. Long and double arguments take two slots, the second
/// one holding a `Null` placeholder.
pub fn setup_local_variables(method: &Method, args: Vec<Value>) -> Result<Vec<Value>> {
    let size = (method.max_locals as usize).max(method.arg_slots());
    let mut locals = vec![Value::Null; size];
    let mut index = 0;
    for value in args {
        let wide = value.is_category_two();
        if index + usize::from(wide) >= size {
            return Err(RuntimeError::LocalOutOfRange { index, max: size });
        }
        locals[index] = value;
        index += 1;
        if wide {
            index += 1;
        }
    }
    Ok(locals)
}

/// State of one Java thread.
#[derive(Debug, Default)]
pub struct VirtualMachineState {
    frames: Vec<Frame>,
    operands: Vec<OperandEntry>,
    // One call-stack depth counter per active `Runtime::run` invocation.
    depth_stack: Vec<usize>,
    // Number of nested `Runtime::run` invocations.
    stack_level: usize,
    pending_exception: Option<ObjectRef>,
    // The `java/lang/Thread` object this state runs, if any.
    thread: Option<ObjectRef>,
    pause: PauseToken,
    instructions: u64,
}

impl VirtualMachineState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_thread(thread: ObjectRef) -> Self {
        Self {
            thread: Some(thread),
            ..Self::default()
        }
    }

    pub fn thread_object(&self) -> Option<ObjectRef> {
        self.thread
    }

    pub fn set_thread_object(&mut self, thread: Option<ObjectRef>) {
        self.thread = thread;
    }

    /// Token the controller uses to pause this thread.
    pub fn pause_token(&self) -> PauseToken {
        self.pause.clone()
    }

    /// Parks the thread here if a pause was requested, until it's resumed
    /// or `halted` answers true.
    pub(crate) fn checkpoint(&self, halted: impl Fn() -> bool) -> bool {
        self.pause.checkpoint(halted)
    }

    /// Counts one executed instruction, returns the running total.
    pub(crate) fn tick(&mut self) -> u64 {
        self.instructions += 1;
        self.instructions
    }

    pub fn instructions_executed(&self) -> u64 {
        self.instructions
    }

    // Frames.

    pub fn has_frames(&self) -> bool {
        !self.frames.is_empty()
    }

    pub fn frame_count(&self) -> usize {
        self.frames.len()
    }

    pub fn current_frame(&self) -> Result<&Frame> {
        self.frames.last().ok_or(RuntimeError::NoActiveFrame)
    }

    pub fn current_frame_mut(&mut self) -> Result<&mut Frame> {
        self.frames.last_mut().ok_or(RuntimeError::NoActiveFrame)
    }

    pub fn current_method(&self) -> Result<Arc<Method>> {
        Ok(Arc::clone(&self.current_frame()?.method))
    }

    pub fn current_class(&self) -> Result<Arc<Class>> {
        Ok(Arc::clone(&self.current_frame()?.class))
    }

    /// Creates a frame for `method`, popping its arguments (receiver first)
    /// from the caller's operand stack into the new local variables.
    pub fn push_state(&mut self, class: Arc<Class>, method: Arc<Method>) -> Result<()> {
        let count = method.arg_count();
        if self.operand_depth() < count {
            return Err(RuntimeError::StackUnderflow);
        }
        let args = self
            .operands
            .split_off(self.operands.len() - count)
            .into_iter()
            .map(|entry| entry.value)
            .collect();
        let locals = setup_local_variables(&method, args)?;
        debug!(method = %method.signature(), depth = self.frames.len() + 1, "push frame");
        self.frames.push(Frame {
            class,
            method,
            pc: 0,
            instruction_pc: 0,
            locals,
            stack_base: self.operands.len(),
            monitors: Vec::new(),
        });
        Ok(())
    }

    /// Tears the current frame down: releases its monitors, drops whatever
    /// it left on the operand stack and frees its local variables.
    pub fn pop_state(&mut self) -> Result<Arc<Method>> {
        let mut frame = self.frames.pop().ok_or(RuntimeError::NoActiveFrame)?;
        while let Some(monitor) = frame.monitors.pop() {
            monitor.exit();
        }
        self.operands.truncate(frame.stack_base);
        debug!(method = %frame.method.signature(), depth = self.frames.len(), "pop frame");
        Ok(frame.method)
    }

    /// Enters `monitor` and records it on the current frame's monitor stack.
    pub fn push_monitor(&mut self, monitor: Arc<Monitor>) -> Result<()> {
        let frame = self.current_frame_mut()?;
        monitor.enter();
        frame.monitors.push(monitor);
        Ok(())
    }

    /// Exits the most recently entered occurrence of `monitor`. Returns false
    /// if the thread doesn't own it.
    pub fn pop_monitor(&mut self, monitor: &Arc<Monitor>) -> Result<bool> {
        let frame = self.current_frame_mut()?;
        if let Some(index) = frame
            .monitors
            .iter()
            .rposition(|m| Arc::ptr_eq(m, monitor))
        {
            frame.monitors.remove(index);
        }
        Ok(monitor.exit())
    }

    // Operand stack.

    fn stack_base(&self) -> usize {
        self.frames.last().map_or(0, |f| f.stack_base)
    }

    /// Number of operand stack entries owned by the current frame.
    pub fn operand_depth(&self) -> usize {
        self.operands.len() - self.stack_base()
    }

    pub fn push_operand(&mut self, value: Value) {
        let pushed_at = self.frames.last().map_or(0, |f| f.instruction_pc);
        self.operands.push(OperandEntry { value, pushed_at });
    }

    pub fn pop_operand(&mut self) -> Result<Value> {
        if self.operand_depth() == 0 {
            return Err(RuntimeError::StackUnderflow);
        }
        self.operands
            .pop()
            .map(|entry| entry.value)
            .ok_or(RuntimeError::StackUnderflow)
    }

    /// Pops the top entry along with the address that pushed it.
    pub(crate) fn pop_entry(&mut self) -> Result<OperandEntry> {
        if self.operand_depth() == 0 {
            return Err(RuntimeError::StackUnderflow);
        }
        self.operands.pop().ok_or(RuntimeError::StackUnderflow)
    }

    /// Pushes an entry back unchanged, used by the stack shuffling
    /// instructions so moved values keep their origin.
    pub(crate) fn push_entry(&mut self, entry: OperandEntry) {
        self.operands.push(entry);
    }

    pub fn peek_operand(&self) -> Result<&Value> {
        self.peek_operand_from_back(1)
    }

    /// Reads the `n`-th value from the top without popping, 1 being the top.
    pub fn peek_operand_from_back(&self, n: usize) -> Result<&Value> {
        if n == 0 || n > self.operand_depth() {
            return Err(RuntimeError::StackUnderflow);
        }
        Ok(&self.operands[self.operands.len() - n].value)
    }

    /// Entries of the current frame pushed at or after `start_pc`, counted
    /// from the top of the stack.
    pub fn count_stack_items_to_clear(&self, start_pc: usize) -> usize {
        self.operands[self.stack_base()..]
            .iter()
            .rev()
            .take_while(|entry| entry.pushed_at >= start_pc)
            .count()
    }

    pub fn operands(&self) -> impl Iterator<Item = &Value> {
        self.operands[self.stack_base()..].iter().map(|e| &e.value)
    }

    // Local variables.

    pub fn get_local_variable(&self, index: usize) -> Result<Value> {
        let frame = self.current_frame()?;
        frame
            .locals
            .get(index)
            .cloned()
            .ok_or(RuntimeError::LocalOutOfRange {
                index,
                max: frame.locals.len(),
            })
    }

    /// Stores `value` at `index`, a long or double also claims `index + 1`.
    pub fn set_local_variable(&mut self, index: usize, value: Value) -> Result<()> {
        let frame = self.current_frame_mut()?;
        let max = frame.locals.len();
        let needed = if value.is_category_two() { index + 2 } else { index + 1 };
        if needed > max {
            return Err(RuntimeError::LocalOutOfRange { index, max });
        }
        if value.is_category_two() {
            frame.locals[index + 1] = Value::Null;
        }
        frame.locals[index] = value;
        Ok(())
    }

    // Call-stack depth bookkeeping. Each `run` invocation gets a fresh
    // counter, when it drops back to zero the invocation is complete.

    pub fn push_and_zero_call_stack_depth(&mut self) {
        self.depth_stack.push(0);
    }

    pub fn pop_call_stack_depth(&mut self) -> Result<usize> {
        self.depth_stack
            .pop()
            .ok_or_else(|| RuntimeError::invalid_state("call-stack depth stack is empty"))
    }

    pub fn increment_call_stack_depth(&mut self) -> Result<usize> {
        let depth = self
            .depth_stack
            .last_mut()
            .ok_or_else(|| RuntimeError::invalid_state("call-stack depth stack is empty"))?;
        *depth += 1;
        Ok(*depth)
    }

    pub fn decrement_call_stack_depth(&mut self) -> Result<usize> {
        let depth = self
            .depth_stack
            .last_mut()
            .ok_or_else(|| RuntimeError::invalid_state("call-stack depth stack is empty"))?;
        *depth = depth
            .checked_sub(1)
            .ok_or_else(|| RuntimeError::invalid_state("call-stack depth underflow"))?;
        Ok(*depth)
    }

    pub fn call_stack_depth(&self) -> usize {
        self.depth_stack.last().copied().unwrap_or(0)
    }

    pub fn stack_level(&self) -> usize {
        self.stack_level
    }

    pub(crate) fn enter_run(&mut self) -> usize {
        self.stack_level += 1;
        self.stack_level
    }

    pub(crate) fn leave_run(&mut self) {
        self.stack_level = self.stack_level.saturating_sub(1);
    }

    // Exceptions.

    pub fn pending_exception(&self) -> Option<ObjectRef> {
        self.pending_exception
    }

    pub fn has_pending_exception(&self) -> bool {
        self.pending_exception.is_some()
    }

    pub fn set_pending_exception(&mut self, exception: ObjectRef) {
        self.pending_exception = Some(exception);
    }

    pub fn take_pending_exception(&mut self) -> Option<ObjectRef> {
        self.pending_exception.take()
    }
}
