//! Bytecode execution engine.
//!
//! `Runtime` interprets the frames of a `VirtualMachineState` one instruction
//! at a time. Between two instructions it honours pause requests, asks the
//! collector whether it must run and checks for a halt, so the collector and
//! the controller only ever see the thread at an instruction boundary.
//!
//! The engine is shared: any number of threads can run their own state
//! through the same `Runtime` concurrently.
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::bytecode::OPCode;
use crate::error::{Result, RuntimeError};
use crate::exceptions::{
    catch_exception, find_local_exception_table_entry, ARITHMETIC_EXCEPTION, OUT_OF_MEMORY_ERROR,
};
use crate::heap::{ArrayType, Heap, ObjectRef};
use crate::jvm::Jvm;
use crate::resolver::{instance_fields, MethodResolver};
use crate::state::{OperandEntry, VirtualMachineState};
use crate::value::{compare_floating, int_to_byte, int_to_char, int_to_short, Value};

macro_rules! binary_op {
    ($state:expr, $pop:ident, $variant:ident, |$a:ident, $b:ident| $body:expr) => {{
        let $b = $pop($state)?;
        let $a = $pop($state)?;
        $state.push_operand(Value::$variant($body));
    }};
}

macro_rules! unary_op {
    ($state:expr, $pop:ident, $variant:ident, |$a:ident| $body:expr) => {{
        let $a = $pop($state)?;
        $state.push_operand(Value::$variant($body));
    }};
    ($state:expr, $pop:ident, $variant:ident, $function:path) => {{
        let a = $pop($state)?;
        $state.push_operand(Value::$variant($function(a)));
    }};
}

/// Why `Runtime::run` returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// The frames of this invocation all returned.
    Completed,
    /// `Runtime::halt` was called, frames are left as they were.
    Halted,
    /// An exception unwound every frame of a nested invocation and is still
    /// pending for the caller to handle.
    ExceptionPending(ObjectRef),
    /// An exception unwound the outermost frame of the thread and was handed
    /// to its uncaught exception handler.
    Uncaught(ObjectRef),
}

/// Result of `Runtime::execute_method`.
#[derive(Debug, Clone, PartialEq)]
pub enum Invocation {
    Returned(Option<Value>),
    Threw(ObjectRef),
    Halted,
}

/// What the run loop does after an instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Flow {
    Continue,
    // The last frame of the current run invocation returned.
    ReenterCaller,
}

#[derive(Debug, Clone, Copy)]
enum LocalKind {
    Int,
    Long,
    Float,
    Double,
    Reference,
}

/// `Runtime` executes JVM bytecode against the classes, heap, collector and
/// natives of a `Jvm` context.
pub struct Runtime {
    jvm: Jvm,
    resolver: MethodResolver,
    halted: AtomicBool,
    // Interned `ldc` string constants.
    pub(crate) strings: Mutex<HashMap<String, ObjectRef>>,
}

impl Runtime {
    pub fn new(jvm: Jvm) -> Self {
        Self {
            jvm,
            resolver: MethodResolver::new(),
            halted: AtomicBool::new(false),
            strings: Mutex::new(HashMap::new()),
        }
    }

    pub fn jvm(&self) -> &Jvm {
        &self.jvm
    }

    pub fn resolver(&self) -> &MethodResolver {
        &self.resolver
    }

    /// Stops every thread running through this runtime at its next
    /// instruction boundary.
    pub fn halt(&self) {
        debug!("halt requested");
        self.halted.store(true, Ordering::Release);
    }

    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::Acquire)
    }

    /// Executes instructions until the frames pushed for this invocation all
    /// returned, the runtime is halted or an exception escapes them.
    ///
    /// The caller is expected to have pushed the first frame and opened a
    /// call-stack depth counter for it, `execute_method` does both.
    pub fn run(&self, state: &mut VirtualMachineState) -> Result<RunOutcome> {
        let level = state.enter_run();
        let outcome = self.run_loop(state, level);
        state.leave_run();
        outcome
    }

    fn run_loop(&self, state: &mut VirtualMachineState, level: usize) -> Result<RunOutcome> {
        loop {
            if self.is_halted() {
                return Ok(RunOutcome::Halted);
            }
            if state.checkpoint(|| self.is_halted()) && self.is_halted() {
                return Ok(RunOutcome::Halted);
            }
            self.safepoint(state);

            let flow = self.step(state)?;
            if let Some(exception) = state.pending_exception() {
                if let Some(outcome) = self.handle_exception(state, exception, level)? {
                    return Ok(outcome);
                }
                continue;
            }
            if flow == Flow::ReenterCaller {
                return Ok(RunOutcome::Completed);
            }
        }
    }

    // Collection only ever happens here, between two instructions.
    fn safepoint(&self, state: &mut VirtualMachineState) {
        let executed = state.tick();
        let interval = self.jvm.config.gc_check_interval;
        let periodic = interval > 0 && executed % interval == 0;
        if periodic || self.jvm.gc.must_collect() {
            debug!(executed, periodic, "collecting at safepoint");
            self.jvm.gc.collect();
        }
    }

    fn step(&self, state: &mut VirtualMachineState) -> Result<Flow> {
        let frame = state.current_frame_mut()?;
        let opcode = OPCode::from(frame.fetch_opcode()?);
        if self.jvm.config.trace_opcodes {
            trace!(
                pc = frame.instruction_pc(),
                opcode = opcode.mnemonic(),
                method = %frame.method.signature(),
                "execute"
            );
        }
        self.eval(state, opcode)
    }

    /// Looks for a handler of `exception`, unwinding frames of this run
    /// invocation until one is found. Returns the outcome of the run when
    /// they are all gone.
    fn handle_exception(
        &self,
        state: &mut VirtualMachineState,
        exception: ObjectRef,
        level: usize,
    ) -> Result<Option<RunOutcome>> {
        let class = self.jvm.heap.class_of(exception)?;
        loop {
            let method = state.current_method()?;
            let pc = state.current_frame()?.instruction_pc();
            let classes = self.jvm.classes.as_ref();
            let entry = find_local_exception_table_entry(classes, &method, pc, class.name());
            if let Some(entry) = entry {
                debug!(
                    exception = class.name(),
                    method = %method.signature(),
                    pc,
                    handler = entry.handler_pc,
                    "caught exception"
                );
                catch_exception(state, entry, exception)?;
                return Ok(None);
            }

            state.pop_state()?;
            if state.decrement_call_stack_depth()? == 0 {
                if level == 1 {
                    return self.handle_unhandled_exception(state, exception).map(Some);
                }
                return Ok(Some(RunOutcome::ExceptionPending(exception)));
            }
        }
    }

    /// Allocates an instance of `class_name` and makes it the pending
    /// exception of `state`. The exception's constructor is not run.
    pub fn throw_exception(&self, state: &mut VirtualMachineState, class_name: &str) -> Result<()> {
        self.throw(state, class_name, None)
    }

    /// Same as `throw_exception` with `detailMessage` set to `message`.
    pub fn throw_exception_with_message(
        &self,
        state: &mut VirtualMachineState,
        class_name: &str,
        message: &str,
    ) -> Result<()> {
        self.throw(state, class_name, Some(message))
    }

    fn throw(
        &self,
        state: &mut VirtualMachineState,
        class_name: &str,
        message: Option<&str>,
    ) -> Result<()> {
        if class_name == OUT_OF_MEMORY_ERROR {
            return self.throw_out_of_memory(state);
        }
        warn!(exception = class_name, message = message.unwrap_or_default(), "raising exception");
        let classes = self.jvm.classes.as_ref();
        let class = classes
            .find_class(class_name)
            .ok_or_else(|| RuntimeError::ClassNotFound(class_name.to_string()))?;
        let fields = instance_fields(classes, &class);
        let exception = match self.jvm.heap.allocate_object(class, fields) {
            Ok(exception) => exception,
            Err(e) if e.is_out_of_memory() => return self.throw_out_of_memory(state),
            Err(e) => return Err(e),
        };
        if let Some(message) = message {
            if let Some(field) = self.resolver.resolve_field(classes, class_name, "detailMessage") {
                match self.new_string(message) {
                    Ok(text) => self.jvm.heap.set_field(exception, &field, Value::Object(text))?,
                    // The exception is more useful without its message than not at all.
                    Err(e) if e.is_out_of_memory() => {}
                    Err(e) => return Err(e),
                }
            }
        }
        state.set_pending_exception(exception);
        Ok(())
    }

    fn throw_out_of_memory(&self, state: &mut VirtualMachineState) -> Result<()> {
        warn!("heap exhausted, raising OutOfMemoryError");
        let classes = self.jvm.classes.as_ref();
        let class = classes
            .find_class(OUT_OF_MEMORY_ERROR)
            .ok_or_else(|| RuntimeError::ClassNotFound(OUT_OF_MEMORY_ERROR.to_string()))?;
        let fields = instance_fields(classes, &class);
        let exception = self.jvm.heap.allocate_reserved_object(class, fields)?;
        state.set_pending_exception(exception);
        Ok(())
    }

    /// Raises a guest exception and keeps executing.
    pub(crate) fn raise(&self, state: &mut VirtualMachineState, class_name: &str) -> Result<Flow> {
        self.throw_exception(state, class_name)?;
        Ok(Flow::Continue)
    }

    pub(crate) fn raise_with_message(
        &self,
        state: &mut VirtualMachineState,
        class_name: &str,
        message: &str,
    ) -> Result<Flow> {
        self.throw_exception_with_message(state, class_name, message)?;
        Ok(Flow::Continue)
    }

    /// Runs a heap allocation for the guest. Exhaustion becomes a pending
    /// `OutOfMemoryError` and `None`.
    pub(crate) fn allocate<T>(
        &self,
        state: &mut VirtualMachineState,
        allocation: impl FnOnce(&Heap) -> Result<T>,
    ) -> Result<Option<T>> {
        match allocation(&self.jvm.heap) {
            Ok(value) => Ok(Some(value)),
            Err(e) if e.is_out_of_memory() => {
                self.throw_out_of_memory(state)?;
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    fn eval(&self, state: &mut VirtualMachineState, opcode: OPCode) -> Result<Flow> {
        match opcode {
            OPCode::NOP => (),
            OPCode::AconstNull => state.push_operand(Value::Null),
            OPCode::IconstM1
            | OPCode::Iconst0
            | OPCode::Iconst1
            | OPCode::Iconst2
            | OPCode::Iconst3
            | OPCode::Iconst4
            | OPCode::Iconst5 => {
                let value = opcode.byte() as i32 - OPCode::Iconst0.byte() as i32;
                state.push_operand(Value::Integer(value));
            }
            OPCode::Lconst0 => state.push_operand(Value::Long(0)),
            OPCode::Lconst1 => state.push_operand(Value::Long(1)),
            OPCode::Fconst0 => state.push_operand(Value::Float(0.0)),
            OPCode::Fconst1 => state.push_operand(Value::Float(1.0)),
            OPCode::Fconst2 => state.push_operand(Value::Float(2.0)),
            OPCode::Dconst0 => state.push_operand(Value::Double(0.0)),
            OPCode::Dconst1 => state.push_operand(Value::Double(1.0)),
            OPCode::BiPush => {
                let value = state.current_frame_mut()?.read_i8()?;
                state.push_operand(Value::Integer(value as i32));
            }
            OPCode::SiPush => {
                let value = state.current_frame_mut()?.read_i16()?;
                state.push_operand(Value::Integer(value as i32));
            }
            OPCode::Ldc => {
                let index = state.current_frame_mut()?.read_u8()? as u16;
                return self.load_constant(state, index);
            }
            OPCode::LdcW => {
                let index = state.current_frame_mut()?.read_u16()?;
                return self.load_constant(state, index);
            }
            OPCode::Ldc2W => {
                let index = state.current_frame_mut()?.read_u16()?;
                return self.load_wide_constant(state, index);
            }

            OPCode::ILoad => {
                let index = read_index(state)?;
                load_local(state, LocalKind::Int, index)?
            }
            OPCode::LLoad => {
                let index = read_index(state)?;
                load_local(state, LocalKind::Long, index)?
            }
            OPCode::FLoad => {
                let index = read_index(state)?;
                load_local(state, LocalKind::Float, index)?
            }
            OPCode::DLoad => {
                let index = read_index(state)?;
                load_local(state, LocalKind::Double, index)?
            }
            OPCode::ALoad => {
                let index = read_index(state)?;
                load_local(state, LocalKind::Reference, index)?
            }
            OPCode::ILoad0 | OPCode::ILoad1 | OPCode::ILoad2 | OPCode::ILoad3 => {
                load_local(state, LocalKind::Int, implicit_index(opcode, OPCode::ILoad0))?
            }
            OPCode::LLoad0 | OPCode::LLoad1 | OPCode::LLoad2 | OPCode::LLoad3 => {
                load_local(state, LocalKind::Long, implicit_index(opcode, OPCode::LLoad0))?
            }
            OPCode::FLoad0 | OPCode::FLoad1 | OPCode::FLoad2 | OPCode::FLoad3 => {
                load_local(state, LocalKind::Float, implicit_index(opcode, OPCode::FLoad0))?
            }
            OPCode::DLoad0 | OPCode::DLoad1 | OPCode::DLoad2 | OPCode::DLoad3 => {
                load_local(state, LocalKind::Double, implicit_index(opcode, OPCode::DLoad0))?
            }
            OPCode::ALoad0 | OPCode::ALoad1 | OPCode::ALoad2 | OPCode::ALoad3 => {
                load_local(state, LocalKind::Reference, implicit_index(opcode, OPCode::ALoad0))?
            }
            OPCode::IStore => {
                let index = read_index(state)?;
                store_local(state, LocalKind::Int, index)?
            }
            OPCode::LStore => {
                let index = read_index(state)?;
                store_local(state, LocalKind::Long, index)?
            }
            OPCode::FStore => {
                let index = read_index(state)?;
                store_local(state, LocalKind::Float, index)?
            }
            OPCode::DStore => {
                let index = read_index(state)?;
                store_local(state, LocalKind::Double, index)?
            }
            OPCode::AStore => {
                let index = read_index(state)?;
                store_local(state, LocalKind::Reference, index)?
            }
            OPCode::IStore0 | OPCode::IStore1 | OPCode::IStore2 | OPCode::IStore3 => {
                store_local(state, LocalKind::Int, implicit_index(opcode, OPCode::IStore0))?
            }
            OPCode::LStore0 | OPCode::LStore1 | OPCode::LStore2 | OPCode::LStore3 => {
                store_local(state, LocalKind::Long, implicit_index(opcode, OPCode::LStore0))?
            }
            OPCode::FStore0 | OPCode::FStore1 | OPCode::FStore2 | OPCode::FStore3 => {
                store_local(state, LocalKind::Float, implicit_index(opcode, OPCode::FStore0))?
            }
            OPCode::DStore0 | OPCode::DStore1 | OPCode::DStore2 | OPCode::DStore3 => {
                store_local(state, LocalKind::Double, implicit_index(opcode, OPCode::DStore0))?
            }
            OPCode::AStore0 | OPCode::AStore1 | OPCode::AStore2 | OPCode::AStore3 => {
                store_local(state, LocalKind::Reference, implicit_index(opcode, OPCode::AStore0))?
            }

            OPCode::IALoad => return self.array_load(state, ArrayType::Int),
            OPCode::LALoad => return self.array_load(state, ArrayType::Long),
            OPCode::FALoad => return self.array_load(state, ArrayType::Float),
            OPCode::DALoad => return self.array_load(state, ArrayType::Double),
            OPCode::AALoad => return self.array_load(state, ArrayType::Reference),
            OPCode::BALoad => return self.array_load(state, ArrayType::Byte),
            OPCode::CALoad => return self.array_load(state, ArrayType::Char),
            OPCode::SALoad => return self.array_load(state, ArrayType::Short),
            OPCode::IAStore => return self.array_store(state, ArrayType::Int),
            OPCode::LAStore => return self.array_store(state, ArrayType::Long),
            OPCode::FAStore => return self.array_store(state, ArrayType::Float),
            OPCode::DAStore => return self.array_store(state, ArrayType::Double),
            OPCode::AAStore => return self.array_store(state, ArrayType::Reference),
            OPCode::BAStore => return self.array_store(state, ArrayType::Byte),
            OPCode::CAStore => return self.array_store(state, ArrayType::Char),
            OPCode::SAStore => return self.array_store(state, ArrayType::Short),

            OPCode::Pop => {
                pop_words(state, 1)?;
            }
            OPCode::Pop2 => {
                pop_words(state, 2)?;
            }
            OPCode::Dup => {
                let top = pop_words(state, 1)?;
                push_copies(state, &top);
                push_back(state, top);
            }
            OPCode::DupX1 => duplicate_under(state, 1, 1)?,
            OPCode::DupX2 => duplicate_under(state, 1, 2)?,
            OPCode::Dup2 => {
                let top = pop_words(state, 2)?;
                push_copies(state, &top);
                push_back(state, top);
            }
            OPCode::Dup2X1 => duplicate_under(state, 2, 1)?,
            OPCode::Dup2X2 => duplicate_under(state, 2, 2)?,
            OPCode::Swap => {
                let top = pop_words(state, 1)?;
                let under = pop_words(state, 1)?;
                push_back(state, top);
                push_back(state, under);
            }

            OPCode::IAdd => binary_op!(state, pop_int, Integer, |a, b| a.wrapping_add(b)),
            OPCode::LAdd => binary_op!(state, pop_long, Long, |a, b| a.wrapping_add(b)),
            OPCode::FAdd => binary_op!(state, pop_float, Float, |a, b| a + b),
            OPCode::DAdd => binary_op!(state, pop_double, Double, |a, b| a + b),
            OPCode::ISub => binary_op!(state, pop_int, Integer, |a, b| a.wrapping_sub(b)),
            OPCode::LSub => binary_op!(state, pop_long, Long, |a, b| a.wrapping_sub(b)),
            OPCode::FSub => binary_op!(state, pop_float, Float, |a, b| a - b),
            OPCode::DSub => binary_op!(state, pop_double, Double, |a, b| a - b),
            OPCode::IMul => binary_op!(state, pop_int, Integer, |a, b| a.wrapping_mul(b)),
            OPCode::LMul => binary_op!(state, pop_long, Long, |a, b| a.wrapping_mul(b)),
            OPCode::FMul => binary_op!(state, pop_float, Float, |a, b| a * b),
            OPCode::DMul => binary_op!(state, pop_double, Double, |a, b| a * b),
            OPCode::FDiv => binary_op!(state, pop_float, Float, |a, b| a / b),
            OPCode::DDiv => binary_op!(state, pop_double, Double, |a, b| a / b),
            OPCode::FRem => binary_op!(state, pop_float, Float, |a, b| a % b),
            OPCode::DRem => binary_op!(state, pop_double, Double, |a, b| a % b),
            OPCode::IDiv | OPCode::IRem => {
                let b = pop_int(state)?;
                let a = pop_int(state)?;
                if b == 0 {
                    return self.raise_with_message(state, ARITHMETIC_EXCEPTION, "/ by zero");
                }
                let result = if opcode == OPCode::IDiv {
                    a.wrapping_div(b)
                } else {
                    a.wrapping_rem(b)
                };
                state.push_operand(Value::Integer(result));
            }
            OPCode::LDiv | OPCode::LRem => {
                let b = pop_long(state)?;
                let a = pop_long(state)?;
                if b == 0 {
                    return self.raise_with_message(state, ARITHMETIC_EXCEPTION, "/ by zero");
                }
                let result = if opcode == OPCode::LDiv {
                    a.wrapping_div(b)
                } else {
                    a.wrapping_rem(b)
                };
                state.push_operand(Value::Long(result));
            }
            OPCode::INeg => unary_op!(state, pop_int, Integer, |a| a.wrapping_neg()),
            OPCode::LNeg => unary_op!(state, pop_long, Long, |a| a.wrapping_neg()),
            OPCode::FNeg => unary_op!(state, pop_float, Float, |a| -a),
            OPCode::DNeg => unary_op!(state, pop_double, Double, |a| -a),

            OPCode::IShl => binary_op!(state, pop_int, Integer, |a, b| a << (b & 0x1f)),
            OPCode::IShr => binary_op!(state, pop_int, Integer, |a, b| a >> (b & 0x1f)),
            OPCode::IUShr => {
                binary_op!(state, pop_int, Integer, |a, b| ((a as u32) >> (b & 0x1f)) as i32)
            }
            OPCode::LShl => {
                let b = pop_int(state)?;
                let a = pop_long(state)?;
                state.push_operand(Value::Long(a << (b & 0x3f)));
            }
            OPCode::LShr => {
                let b = pop_int(state)?;
                let a = pop_long(state)?;
                state.push_operand(Value::Long(a >> (b & 0x3f)));
            }
            OPCode::LUShr => {
                let b = pop_int(state)?;
                let a = pop_long(state)?;
                state.push_operand(Value::Long(((a as u64) >> (b & 0x3f)) as i64));
            }
            OPCode::IAnd => binary_op!(state, pop_int, Integer, |a, b| a & b),
            OPCode::LAnd => binary_op!(state, pop_long, Long, |a, b| a & b),
            OPCode::IOr => binary_op!(state, pop_int, Integer, |a, b| a | b),
            OPCode::LOr => binary_op!(state, pop_long, Long, |a, b| a | b),
            OPCode::IXor => binary_op!(state, pop_int, Integer, |a, b| a ^ b),
            OPCode::LXor => binary_op!(state, pop_long, Long, |a, b| a ^ b),
            OPCode::IInc => {
                let frame = state.current_frame_mut()?;
                let index = frame.read_u8()? as usize;
                let delta = frame.read_i8()? as i32;
                increment_local(state, index, delta)?;
            }

            OPCode::I2L => unary_op!(state, pop_int, Long, |a| a as i64),
            OPCode::I2F => unary_op!(state, pop_int, Float, |a| a as f32),
            OPCode::I2D => unary_op!(state, pop_int, Double, |a| a as f64),
            OPCode::L2I => unary_op!(state, pop_long, Integer, |a| a as i32),
            OPCode::L2F => unary_op!(state, pop_long, Float, |a| a as f32),
            OPCode::L2D => unary_op!(state, pop_long, Double, |a| a as f64),
            // `as` saturates and maps NaN to zero, as the JVM does.
            OPCode::F2I => unary_op!(state, pop_float, Integer, |a| a as i32),
            OPCode::F2L => unary_op!(state, pop_float, Long, |a| a as i64),
            OPCode::F2D => unary_op!(state, pop_float, Double, |a| a as f64),
            OPCode::D2I => unary_op!(state, pop_double, Integer, |a| a as i32),
            OPCode::D2L => unary_op!(state, pop_double, Long, |a| a as i64),
            OPCode::D2F => unary_op!(state, pop_double, Float, |a| a as f32),
            OPCode::I2B => unary_op!(state, pop_int, Integer, int_to_byte),
            OPCode::I2C => unary_op!(state, pop_int, Integer, int_to_char),
            OPCode::I2S => unary_op!(state, pop_int, Integer, int_to_short),

            OPCode::LCmp => binary_op!(state, pop_long, Integer, |a, b| a.cmp(&b) as i32),
            OPCode::FCmpL => {
                binary_op!(state, pop_float, Integer, |a, b| compare_floating(a, b, -1))
            }
            OPCode::FCmpG => {
                binary_op!(state, pop_float, Integer, |a, b| compare_floating(a, b, 1))
            }
            OPCode::DCmpL => {
                binary_op!(state, pop_double, Integer, |a, b| compare_floating(a, b, -1))
            }
            OPCode::DCmpG => {
                binary_op!(state, pop_double, Integer, |a, b| compare_floating(a, b, 1))
            }

            OPCode::IfEq => branch_if(state, |s| Ok(pop_int(s)? == 0))?,
            OPCode::IfNe => branch_if(state, |s| Ok(pop_int(s)? != 0))?,
            OPCode::IfLt => branch_if(state, |s| Ok(pop_int(s)? < 0))?,
            OPCode::IfGe => branch_if(state, |s| Ok(pop_int(s)? >= 0))?,
            OPCode::IfGt => branch_if(state, |s| Ok(pop_int(s)? > 0))?,
            OPCode::IfLe => branch_if(state, |s| Ok(pop_int(s)? <= 0))?,
            OPCode::IfICmpEq => branch_if(state, |s| compare_ints(s, |a, b| a == b))?,
            OPCode::IfICmpNe => branch_if(state, |s| compare_ints(s, |a, b| a != b))?,
            OPCode::IfICmpLt => branch_if(state, |s| compare_ints(s, |a, b| a < b))?,
            OPCode::IfICmpGe => branch_if(state, |s| compare_ints(s, |a, b| a >= b))?,
            OPCode::IfICmpGt => branch_if(state, |s| compare_ints(s, |a, b| a > b))?,
            OPCode::IfICmpLe => branch_if(state, |s| compare_ints(s, |a, b| a <= b))?,
            OPCode::IfACmpEq => branch_if(state, compare_references)?,
            OPCode::IfACmpNe => branch_if(state, |s| compare_references(s).map(|same| !same))?,
            OPCode::IfNull => {
                branch_if(state, |s| Ok(s.pop_operand()?.into_reference()?.is_null()))?
            }
            OPCode::IfNonNull => {
                branch_if(state, |s| Ok(!s.pop_operand()?.into_reference()?.is_null()))?
            }
            OPCode::Goto => {
                let frame = state.current_frame_mut()?;
                let offset = frame.read_i16()?;
                frame.branch(offset as i32)?;
            }
            OPCode::GotoW => {
                let frame = state.current_frame_mut()?;
                let offset = frame.read_i32()?;
                frame.branch(offset)?;
            }
            OPCode::Jsr => {
                let offset = state.current_frame_mut()?.read_i16()? as i32;
                jump_to_subroutine(state, offset)?;
            }
            OPCode::JsrW => {
                let offset = state.current_frame_mut()?.read_i32()?;
                jump_to_subroutine(state, offset)?;
            }
            OPCode::Ret => {
                let index = read_index(state)?;
                return_from_subroutine(state, index)?;
            }
            OPCode::TableSwitch => table_switch(state)?,
            OPCode::LookupSwitch => lookup_switch(state)?,

            OPCode::IReturn
            | OPCode::LReturn
            | OPCode::FReturn
            | OPCode::DReturn
            | OPCode::AReturn
            | OPCode::Return => return self.return_from_method(state, opcode),

            OPCode::GetStatic => return self.get_static(state),
            OPCode::PutStatic => return self.put_static(state),
            OPCode::GetField => return self.get_field(state),
            OPCode::PutField => return self.put_field(state),
            OPCode::InvokeVirtual => return self.invoke_virtual(state),
            OPCode::InvokeSpecial => return self.invoke_special(state),
            OPCode::InvokeStatic => return self.invoke_static(state),
            OPCode::InvokeInterface => return self.invoke_interface(state),
            OPCode::New => return self.new_object(state),
            OPCode::NewArray => return self.new_array(state),
            OPCode::ANewArray => return self.new_reference_array(state),
            OPCode::MultiANewArray => return self.new_multi_array(state),
            OPCode::ArrayLength => return self.array_length(state),
            OPCode::AThrow => return self.throw_reference(state),
            OPCode::CheckCast => return self.check_cast(state),
            OPCode::InstanceOf => return self.instance_of(state),
            OPCode::MonitorEnter => return self.monitor_enter(state),
            OPCode::MonitorExit => return self.monitor_exit(state),
            OPCode::Wide => wide(state)?,

            OPCode::InvokeDynamic | OPCode::Breakpoint | OPCode::ImpDep1 | OPCode::ImpDep2 => {
                return Err(RuntimeError::UnsupportedOpcode {
                    mnemonic: opcode.mnemonic(),
                    pc: state.current_frame()?.instruction_pc(),
                });
            }
            OPCode::Unknown(byte) => {
                return Err(RuntimeError::UnknownOpcode {
                    opcode: byte,
                    pc: state.current_frame()?.instruction_pc(),
                });
            }
        }
        Ok(Flow::Continue)
    }
}

pub(crate) fn pop_int(state: &mut VirtualMachineState) -> Result<i32> {
    state.pop_operand()?.as_int()
}

fn pop_long(state: &mut VirtualMachineState) -> Result<i64> {
    state.pop_operand()?.as_long()
}

fn pop_float(state: &mut VirtualMachineState) -> Result<f32> {
    state.pop_operand()?.as_float()
}

fn pop_double(state: &mut VirtualMachineState) -> Result<f64> {
    state.pop_operand()?.as_double()
}

fn read_index(state: &mut VirtualMachineState) -> Result<usize> {
    Ok(state.current_frame_mut()?.read_u8()? as usize)
}

// `iload_2` and friends encode their slot in the opcode.
fn implicit_index(opcode: OPCode, first: OPCode) -> usize {
    (opcode.byte() - first.byte()) as usize
}

fn load_local(state: &mut VirtualMachineState, kind: LocalKind, index: usize) -> Result<()> {
    let value = state.get_local_variable(index)?;
    let value = match kind {
        LocalKind::Int => Value::Integer(value.as_int()?),
        LocalKind::Long => Value::Long(value.as_long()?),
        LocalKind::Float => Value::Float(value.as_float()?),
        LocalKind::Double => Value::Double(value.as_double()?),
        LocalKind::Reference => value.into_reference()?,
    };
    state.push_operand(value);
    Ok(())
}

fn store_local(state: &mut VirtualMachineState, kind: LocalKind, index: usize) -> Result<()> {
    let value = state.pop_operand()?;
    let value = match kind {
        LocalKind::Int => Value::Integer(value.as_int()?),
        LocalKind::Long => Value::Long(value.as_long()?),
        LocalKind::Float => Value::Float(value.as_float()?),
        LocalKind::Double => Value::Double(value.as_double()?),
        // `astore` also stores the return addresses pushed by `jsr`.
        LocalKind::Reference => value.into_reference()?,
    };
    state.set_local_variable(index, value)
}

fn increment_local(state: &mut VirtualMachineState, index: usize, delta: i32) -> Result<()> {
    let value = state.get_local_variable(index)?.as_int()?;
    state.set_local_variable(index, Value::Integer(value.wrapping_add(delta)))
}

/// Pops exactly `words` stack words, one or two values. Splitting a long or
/// double in half is a type error. Entries come back bottom first.
fn pop_words(state: &mut VirtualMachineState, words: usize) -> Result<Vec<OperandEntry>> {
    let mut entries = Vec::with_capacity(words);
    let mut taken = 0;
    while taken < words {
        let entry = state.pop_entry()?;
        taken += if entry.value.is_category_two() { 2 } else { 1 };
        entries.push(entry);
    }
    if taken != words {
        return Err(RuntimeError::TypeMismatch {
            expected: "category one value",
            found: "category two value",
        });
    }
    entries.reverse();
    Ok(entries)
}

fn push_back(state: &mut VirtualMachineState, entries: Vec<OperandEntry>) {
    for entry in entries {
        state.push_entry(entry);
    }
}

fn push_copies(state: &mut VirtualMachineState, entries: &[OperandEntry]) {
    for entry in entries {
        state.push_operand(entry.value.clone());
    }
}

// The `dup_x` family: copies the top `top_words` under the next
// `under_words`.
fn duplicate_under(
    state: &mut VirtualMachineState,
    top_words: usize,
    under_words: usize,
) -> Result<()> {
    let top = pop_words(state, top_words)?;
    let under = pop_words(state, under_words)?;
    push_copies(state, &top);
    push_back(state, under);
    push_back(state, top);
    Ok(())
}

fn branch_if(
    state: &mut VirtualMachineState,
    taken: impl FnOnce(&mut VirtualMachineState) -> Result<bool>,
) -> Result<()> {
    let offset = state.current_frame_mut()?.read_i16()?;
    if taken(state)? {
        state.current_frame_mut()?.branch(offset as i32)?;
    }
    Ok(())
}

fn compare_ints(state: &mut VirtualMachineState, compare: fn(i32, i32) -> bool) -> Result<bool> {
    let b = pop_int(state)?;
    let a = pop_int(state)?;
    Ok(compare(a, b))
}

fn compare_references(state: &mut VirtualMachineState) -> Result<bool> {
    let b = state.pop_operand()?.into_reference()?;
    let a = state.pop_operand()?.into_reference()?;
    Ok(a.same_reference(&b))
}

fn jump_to_subroutine(state: &mut VirtualMachineState, offset: i32) -> Result<()> {
    let frame = state.current_frame_mut()?;
    let return_address = frame.pc();
    frame.branch(offset)?;
    state.push_operand(Value::ReturnAddress(return_address));
    Ok(())
}

fn return_from_subroutine(state: &mut VirtualMachineState, index: usize) -> Result<()> {
    let target = state.get_local_variable(index)?.as_return_address()?;
    state.current_frame_mut()?.jump(target)
}

/// Bytes of padding after a switch opcode at `address` so its operands start
/// on a four byte boundary relative to the start of the code.
pub fn switch_padding(address: usize) -> usize {
    (4 - (address + 1) % 4) % 4
}

fn table_switch(state: &mut VirtualMachineState) -> Result<()> {
    let key = pop_int(state)?;
    let frame = state.current_frame_mut()?;
    frame.advance_pc(switch_padding(frame.instruction_pc()))?;
    let default = frame.read_i32()?;
    let low = frame.read_i32()?;
    let high = frame.read_i32()?;
    if low > high {
        return Err(RuntimeError::invalid_state(format!(
            "tableswitch with low {low} above high {high}"
        )));
    }
    let offset = if key < low || key > high {
        default
    } else {
        frame.advance_pc(4 * (key as i64 - low as i64) as usize)?;
        frame.read_i32()?
    };
    frame.branch(offset)
}

fn lookup_switch(state: &mut VirtualMachineState) -> Result<()> {
    let key = pop_int(state)?;
    let frame = state.current_frame_mut()?;
    frame.advance_pc(switch_padding(frame.instruction_pc()))?;
    let default = frame.read_i32()?;
    let pairs = frame.read_i32()?;
    if pairs < 0 {
        return Err(RuntimeError::invalid_state(format!(
            "lookupswitch with {pairs} pairs"
        )));
    }
    for _ in 0..pairs {
        let candidate = frame.read_i32()?;
        let offset = frame.read_i32()?;
        if candidate == key {
            return frame.branch(offset);
        }
    }
    frame.branch(default)
}

fn wide(state: &mut VirtualMachineState) -> Result<()> {
    let frame = state.current_frame_mut()?;
    let opcode = OPCode::from(frame.read_u8()?);
    let index = frame.read_u16()? as usize;
    match opcode {
        OPCode::ILoad => load_local(state, LocalKind::Int, index),
        OPCode::LLoad => load_local(state, LocalKind::Long, index),
        OPCode::FLoad => load_local(state, LocalKind::Float, index),
        OPCode::DLoad => load_local(state, LocalKind::Double, index),
        OPCode::ALoad => load_local(state, LocalKind::Reference, index),
        OPCode::IStore => store_local(state, LocalKind::Int, index),
        OPCode::LStore => store_local(state, LocalKind::Long, index),
        OPCode::FStore => store_local(state, LocalKind::Float, index),
        OPCode::DStore => store_local(state, LocalKind::Double, index),
        OPCode::AStore => store_local(state, LocalKind::Reference, index),
        OPCode::Ret => return_from_subroutine(state, index),
        OPCode::IInc => {
            let delta = state.current_frame_mut()?.read_i16()? as i32;
            increment_local(state, index, delta)
        }
        other => Err(RuntimeError::UnknownOpcode {
            opcode: other.byte(),
            pc: state.current_frame()?.instruction_pc(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::gc::FlaggedCollector;
    use crate::jvm::ClassLibrary;
    use crate::program::{ClassBuilder, ExceptionTableEntry, MethodBuilder, ACC_STATIC};
    use crate::safepoint::PauseState;
    use crate::testing::{call, library_with, returned, runtime_with, static_method_class};

    fn eval_int(code: Vec<u8>) -> i32 {
        let runtime = runtime_with(vec![static_method_class("Calc", "()I", code)]);
        let mut state = VirtualMachineState::new();
        returned(call(&runtime, &mut state, "Calc", "run", "()I", vec![]))
            .as_int()
            .unwrap()
    }

    #[test]
    fn int_division_overflow_wraps() {
        let calc = static_method_class("Calc", "(II)I", vec![0x1a, 0x1b, 0x6c, 0xac]);
        let runtime = runtime_with(vec![calc]);
        let mut state = VirtualMachineState::new();
        let result = call(
            &runtime,
            &mut state,
            "Calc",
            "run",
            "(II)I",
            vec![Value::Integer(i32::MIN), Value::Integer(-1)],
        );
        assert_eq!(result, Invocation::Returned(Some(Value::Integer(i32::MIN))));
    }

    #[test]
    fn nan_comparisons_depend_on_opcode() {
        // 0.0f / 0.0f twice, then fcmpl / fcmpg
        let nan_nan = |cmp: u8| vec![0x0b, 0x0b, 0x6e, 0x0b, 0x0b, 0x6e, cmp, 0xac];
        assert_eq!(eval_int(nan_nan(0x95)), -1);
        assert_eq!(eval_int(nan_nan(0x96)), 1);
        // 2.0f fcmpl 1.0f
        assert_eq!(eval_int(vec![0x0d, 0x0c, 0x95, 0xac]), 1);
    }

    #[test]
    fn shifts_mask_their_amount() {
        // iconst_m1, iconst_1, iushr
        assert_eq!(eval_int(vec![0x02, 0x04, 0x7c, 0xac]), 0x7fff_ffff);
        // bipush 5, bipush 33, ishl
        assert_eq!(eval_int(vec![0x10, 5, 0x10, 33, 0x78, 0xac]), 10);
        // iconst_m1, bipush 33, ishr
        assert_eq!(eval_int(vec![0x02, 0x10, 33, 0x7a, 0xac]), -1);
    }

    #[test]
    fn narrowing_conversions_truncate() {
        // sipush 0x01ff, i2b
        assert_eq!(eval_int(vec![0x11, 0x01, 0xff, 0x91, 0xac]), -1);
        // iconst_m1, i2c
        assert_eq!(eval_int(vec![0x02, 0x92, 0xac]), 0xffff);
        // iconst_m1, i2l, lconst_1, lcmp
        assert_eq!(eval_int(vec![0x02, 0x85, 0x0a, 0x94, 0xac]), -1);
    }

    #[test]
    fn division_by_zero_raises_arithmetic_exception() {
        let calc = static_method_class("Calc", "()I", vec![0x04, 0x03, 0x6c, 0xac]);
        let runtime = runtime_with(vec![calc]);
        let mut state = VirtualMachineState::new();
        let result = call(&runtime, &mut state, "Calc", "run", "()I", vec![]);
        let Invocation::Threw(exception) = result else {
            panic!("expected an exception");
        };
        let heap = &runtime.jvm().heap;
        assert_eq!(heap.class_of(exception).unwrap().name(), ARITHMETIC_EXCEPTION);
        let message = heap.get_field_by_name(exception, "detailMessage").unwrap();
        let Some(Value::Object(message)) = message else {
            panic!("missing detail message");
        };
        assert_eq!(heap.read_string(message).unwrap().as_deref(), Some("/ by zero"));
        assert!(!state.has_frames());
    }

    #[test]
    fn long_locals_take_two_slots() {
        // ldc2_w #1, lstore_3, lload_3, lreturn
        let mut builder = ClassBuilder::new("Locals");
        let index = builder.constant(crate::program::ConstantPoolEntry::Long(0x1_0000_0001));
        let [hi, lo] = index.to_be_bytes();
        builder.method(
            MethodBuilder::new("run", "()J")
                .access_flags(ACC_STATIC)
                .max_locals(5)
                .code(vec![0x14, hi, lo, 0x42, 0x21, 0xad]),
        );
        let runtime = runtime_with(vec![builder.build().unwrap()]);
        let mut state = VirtualMachineState::new();
        let result = call(&runtime, &mut state, "Locals", "run", "()J", vec![]);
        assert_eq!(result, Invocation::Returned(Some(Value::Long(0x1_0000_0001))));
    }

    #[test]
    fn stack_shuffles_respect_categories() {
        // lconst_1, iconst_2, dup_x2, pop, pop2 -> 2
        assert_eq!(eval_int(vec![0x0a, 0x05, 0x5b, 0x57, 0x58, 0xac]), 2);
        // iconst_1, iconst_2, swap, isub -> 1
        assert_eq!(eval_int(vec![0x04, 0x05, 0x5f, 0x64, 0xac]), 1);
        // iconst_3, iconst_4, dup2, iadd, iadd, iadd -> 14
        assert_eq!(eval_int(vec![0x06, 0x07, 0x5c, 0x60, 0x60, 0x60, 0xac]), 14);
        // lconst_1, dup2, ladd, l2i -> 2
        assert_eq!(eval_int(vec![0x0a, 0x5c, 0x61, 0x88, 0xac]), 2);
    }

    #[test]
    fn popping_half_a_long_is_a_type_error() {
        let calc = static_method_class("Calc", "()V", vec![0x0a, 0x57, 0xb1]);
        let runtime = runtime_with(vec![calc]);
        let mut state = VirtualMachineState::new();
        let class = runtime.jvm().classes.find_class("Calc").unwrap();
        let method = class.get_method("run", "()V").unwrap();
        let err = runtime.execute_method(&mut state, class, method, vec![]).unwrap_err();
        assert!(matches!(err, RuntimeError::TypeMismatch { .. }));
    }

    #[test]
    fn table_switch_targets_are_relative_to_the_opcode() {
        // 0: iload_0
        // 1: tableswitch, 2 bytes of padding, default 27, low 1, high 2,
        //    offsets 23 and 25
        // 24: iconst_1 ireturn
        // 26: iconst_2 ireturn
        // 28: iconst_m1 ireturn
        let mut code = vec![0x1a, 0xaa, 0, 0];
        for word in [27i32, 1, 2, 23, 25] {
            code.extend_from_slice(&word.to_be_bytes());
        }
        code.extend_from_slice(&[0x04, 0xac, 0x05, 0xac, 0x02, 0xac]);
        let runtime = runtime_with(vec![static_method_class("Switch", "(I)I", code)]);
        let mut state = VirtualMachineState::new();
        for (key, expected) in [(1, 1), (2, 2), (3, -1), (-7, -1)] {
            let result =
                call(&runtime, &mut state, "Switch", "run", "(I)I", vec![Value::Integer(key)]);
            assert_eq!(result, Invocation::Returned(Some(Value::Integer(expected))), "key {key}");
        }
    }

    #[test]
    fn lookup_switch_matches_pairs() {
        // 0: nop, nop, iload_0
        // 3: lookupswitch, no padding, default 29, 2 pairs: 10 -> 25, -4 -> 27
        let mut code = vec![0x00, 0x00, 0x1a, 0xab];
        for word in [29i32, 2, 10, 25, -4, 27] {
            code.extend_from_slice(&word.to_be_bytes());
        }
        // 28: iconst_1 ireturn, 30: iconst_2 ireturn, 32: iconst_0 ireturn
        code.extend_from_slice(&[0x04, 0xac, 0x05, 0xac, 0x03, 0xac]);
        let runtime = runtime_with(vec![static_method_class("Switch", "(I)I", code)]);
        let mut state = VirtualMachineState::new();
        for (key, expected) in [(10, 1), (-4, 2), (0, 0)] {
            let result =
                call(&runtime, &mut state, "Switch", "run", "(I)I", vec![Value::Integer(key)]);
            assert_eq!(result, Invocation::Returned(Some(Value::Integer(expected))), "key {key}");
        }
    }

    #[test]
    fn switch_padding_aligns_operands() {
        assert_eq!(switch_padding(0), 3);
        assert_eq!(switch_padding(1), 2);
        assert_eq!(switch_padding(3), 0);
        assert_eq!(switch_padding(4), 3);
    }

    #[test]
    fn loops_and_wide_increments() {
        // Sum of 1..=n.
        let code = vec![
            0x03, 0x3c, // 0: iconst_0, istore_1
            0x1a, 0x9e, 0x00, 0x10, // 2: iload_0, ifle +16
            0x1b, 0x1a, 0x60, 0x3c, // 6: iload_1, iload_0, iadd, istore_1
            0xc4, 0x84, 0x00, 0x00, 0xff, 0xff, // 10: wide iinc 0 -1
            0xa7, 0xff, 0xf2, // 16: goto -14
            0x1b, 0xac, // 19: iload_1, ireturn
        ];
        let runtime = runtime_with(vec![static_method_class("Loop", "(I)I", code)]);
        let mut state = VirtualMachineState::new();
        let result = call(&runtime, &mut state, "Loop", "run", "(I)I", vec![Value::Integer(10)]);
        assert_eq!(result, Invocation::Returned(Some(Value::Integer(55))));
    }

    #[test]
    fn subroutines_return_through_locals() {
        // 0: jsr +6 (-> 6)
        // 3: iload_1, ireturn
        // 5: nop
        // 6: astore_2, bipush 7, istore_1, ret 2
        let code = vec![0xa8, 0x00, 0x06, 0x1b, 0xac, 0x00, 0x4d, 0x10, 0x07, 0x3c, 0xa9, 0x02];
        let mut builder = ClassBuilder::new("Sub");
        builder.method(
            MethodBuilder::new("run", "()I")
                .access_flags(ACC_STATIC)
                .max_locals(3)
                .code(code),
        );
        let runtime = runtime_with(vec![builder.build().unwrap()]);
        let mut state = VirtualMachineState::new();
        let result = call(&runtime, &mut state, "Sub", "run", "()I", vec![]);
        assert_eq!(result, Invocation::Returned(Some(Value::Integer(7))));
    }

    #[test]
    fn handler_rewinds_to_region_start() {
        // 0..10: pushes 1 at pc 0, then nops
        // 10: iconst_2, iconst_3, iconst_0, idiv (faults at 13)
        // 14..25: nops
        // 25: pop, ireturn -> the 1 pushed before the region
        let mut code = vec![0x04];
        code.resize(10, 0x00);
        code.extend_from_slice(&[0x05, 0x06, 0x03, 0x6c]);
        code.resize(25, 0x00);
        code.extend_from_slice(&[0x57, 0xac]);
        let mut builder = ClassBuilder::new("Guarded");
        builder.method(
            MethodBuilder::new("run", "()I")
                .access_flags(ACC_STATIC)
                .code(code)
                .exception(ExceptionTableEntry::new(10, 20, 25, Some(ARITHMETIC_EXCEPTION))),
        );
        let runtime = runtime_with(vec![builder.build().unwrap()]);
        let mut state = VirtualMachineState::new();
        let result = call(&runtime, &mut state, "Guarded", "run", "()I", vec![]);
        assert_eq!(result, Invocation::Returned(Some(Value::Integer(1))));
        assert!(!state.has_pending_exception());
        assert_eq!(state.operand_depth(), 0);
    }

    #[test]
    fn fault_outside_range_propagates() {
        // The division sits at 25, past the [10, 20) region.
        let mut code = vec![0x00; 23];
        code.extend_from_slice(&[0x04, 0x03, 0x6c, 0xac]);
        let mut builder = ClassBuilder::new("Guarded");
        builder.method(
            MethodBuilder::new("run", "()I")
                .access_flags(ACC_STATIC)
                .code(code)
                .exception(ExceptionTableEntry::new(10, 20, 23, Some(ARITHMETIC_EXCEPTION))),
        );
        let runtime = runtime_with(vec![builder.build().unwrap()]);
        let mut state = VirtualMachineState::new();
        let result = call(&runtime, &mut state, "Guarded", "run", "()I", vec![]);
        assert!(matches!(result, Invocation::Threw(_)));
    }

    #[test]
    fn halted_runtime_stops_at_next_instruction() {
        let spin = static_method_class("Spin", "()V", vec![0xa7, 0x00, 0x00]);
        let runtime = runtime_with(vec![spin]);
        runtime.halt();
        let mut state = VirtualMachineState::new();
        assert_eq!(call(&runtime, &mut state, "Spin", "run", "()V", vec![]), Invocation::Halted);
        assert_eq!(state.instructions_executed(), 0);
    }

    #[test]
    fn halt_reaches_a_paused_thread() {
        // goto 0
        let spin = static_method_class("Spin", "()V", vec![0xa7, 0x00, 0x00]);
        let runtime = runtime_with(vec![spin]);
        let mut state = VirtualMachineState::new();
        let token = state.pause_token();
        token.request_pause();
        std::thread::scope(|scope| {
            let spinner = scope.spawn(|| call(&runtime, &mut state, "Spin", "run", "()V", vec![]));
            token.wait_until_paused();
            runtime.halt();
            assert_eq!(spinner.join().unwrap(), Invocation::Halted);
        });
        assert_eq!(token.state(), PauseState::Paused);
        assert!(state.has_frames());
    }

    #[test]
    fn collector_runs_at_safepoints() {
        let gc = Arc::new(FlaggedCollector::new());
        gc.request();
        let config = EngineConfig {
            gc_check_interval: 2,
            ..EngineConfig::default()
        };
        let calc = static_method_class("Calc", "()I", vec![0x04, 0x05, 0x60, 0xac]);
        let classes = library_with(vec![calc]);
        let jvm = Jvm::new(config).unwrap().with_classes(classes).with_gc(gc.clone());
        let runtime = Runtime::new(jvm);
        let mut state = VirtualMachineState::new();
        let result = call(&runtime, &mut state, "Calc", "run", "()I", vec![]);
        assert_eq!(result, Invocation::Returned(Some(Value::Integer(3))));
        // Once for the raised flag, then every second instruction.
        assert_eq!(gc.collections(), 3);
        assert_eq!(state.instructions_executed(), 4);
    }

    #[test]
    fn unknown_opcodes_are_host_faults() {
        let runtime = runtime_with(vec![static_method_class("Bad", "()V", vec![0x00, 0xcb])]);
        let mut state = VirtualMachineState::new();
        let class = runtime.jvm().classes.find_class("Bad").unwrap();
        let method = class.get_method("run", "()V").unwrap();
        assert_eq!(
            runtime.execute_method(&mut state, class, method, vec![]),
            Err(RuntimeError::UnknownOpcode { opcode: 0xcb, pc: 1 })
        );
    }

    #[test]
    fn running_off_the_code_is_a_host_fault() {
        let runtime = runtime_with(vec![static_method_class("Bad", "()V", vec![0x00])]);
        let mut state = VirtualMachineState::new();
        let class = runtime.jvm().classes.find_class("Bad").unwrap();
        let method = class.get_method("run", "()V").unwrap();
        assert!(matches!(
            runtime.execute_method(&mut state, class, method, vec![]),
            Err(RuntimeError::CodeSegmentExhausted { .. })
        ));
    }
}
