//! Method invocation: the `invoke*` and `return` instructions, class
//! initialisation and re-entry from host code.
use std::sync::Arc;

use tracing::{debug, error, warn};

use crate::bytecode::OPCode;
use crate::error::{Result, RuntimeError};
use crate::exceptions::{
    ABSTRACT_METHOD_ERROR, INCOMPATIBLE_CLASS_CHANGE_ERROR, NO_CLASS_DEF_FOUND_ERROR,
    NO_SUCH_METHOD_ERROR, NULL_POINTER_EXCEPTION, STACK_OVERFLOW_ERROR, UNSATISFIED_LINK_ERROR,
};
use crate::heap::ObjectRef;
use crate::monitor::Monitor;
use crate::program::{
    parse_method_types, BaseTypeKind, Class, ConstantPoolEntry, InitAction, MemberRef, Method,
    JAVA_LANG_CLASS, JAVA_LANG_OBJECT,
};
use crate::resolver::is_subclass_of;
use crate::runtime::{Flow, Invocation, RunOutcome, Runtime};
use crate::state::VirtualMachineState;
use crate::value::Value;

const UNCAUGHT_EXCEPTION: &str = "uncaughtException";
const UNCAUGHT_EXCEPTION_DESCRIPTOR: &str = "(Ljava/lang/Thread;Ljava/lang/Throwable;)V";
const CLASS_INITIALISER: &str = "<clinit>";

impl Runtime {
    /// Calls `method` of `class` with `args` (receiver first) and runs it to
    /// completion. This is how hosts and natives enter the interpreter, it
    /// may be called while another invocation is running on `state`.
    ///
    /// An exception escaping the outermost invocation of a thread is handed
    /// to the thread's uncaught exception handler before being reported as
    /// `Invocation::Threw`. When nested, it stays pending in `state`.
    pub fn execute_method(
        &self,
        state: &mut VirtualMachineState,
        class: Arc<Class>,
        method: Arc<Method>,
        args: Vec<Value>,
    ) -> Result<Invocation> {
        if args.len() != method.arg_count() {
            return Err(RuntimeError::invalid_state(format!(
                "{} takes {} arguments, {} given",
                method.signature(),
                method.arg_count(),
                args.len()
            )));
        }
        debug!(method = %method.signature(), level = state.stack_level(), "execute method");
        let base = state.operand_depth();
        for arg in args {
            state.push_operand(arg);
        }

        state.push_and_zero_call_stack_depth();
        let outcome = self.invoke_method(state, class, Arc::clone(&method)).and_then(|entered| {
            if entered {
                self.run(state)
            } else {
                match state.pending_exception() {
                    // A native or the call itself threw with nothing below it.
                    Some(exception) if state.stack_level() == 0 => {
                        self.handle_unhandled_exception(state, exception)
                    }
                    Some(exception) => Ok(RunOutcome::ExceptionPending(exception)),
                    None => Ok(RunOutcome::Completed),
                }
            }
        });
        state.pop_call_stack_depth()?;

        match outcome? {
            RunOutcome::Completed => {
                let value = match method.return_type().t {
                    BaseTypeKind::Void => None,
                    _ => Some(state.pop_operand()?),
                };
                Ok(Invocation::Returned(value))
            }
            RunOutcome::Halted => Ok(Invocation::Halted),
            RunOutcome::ExceptionPending(exception) | RunOutcome::Uncaught(exception) => {
                // Whatever the failed call left on the caller's stack.
                while state.operand_depth() > base {
                    state.pop_operand()?;
                }
                Ok(Invocation::Threw(exception))
            }
        }
    }

    /// Calls `method` with its arguments already on the operand stack.
    /// Natives run to completion right away, interpreted methods get a new
    /// frame. Returns true when a frame was pushed.
    pub(crate) fn invoke_method(
        &self,
        state: &mut VirtualMachineState,
        class: Arc<Class>,
        method: Arc<Method>,
    ) -> Result<bool> {
        if method.is_abstract() {
            self.throw_exception_with_message(state, ABSTRACT_METHOD_ERROR, &method.signature())?;
            return Ok(false);
        }
        let monitor = match method.is_synchronized() {
            true => Some(self.method_monitor(state, &class, &method)?),
            false => None,
        };

        if method.is_native() {
            self.invoke_native(state, &method, monitor)?;
            return Ok(false);
        }

        if state.frame_count() >= self.jvm().config.max_frames {
            warn!(method = %method.signature(), frames = state.frame_count(), "stack overflow");
            self.throw_exception(state, STACK_OVERFLOW_ERROR)?;
            return Ok(false);
        }
        state.push_state(class, method)?;
        if let Some(monitor) = monitor {
            state.push_monitor(monitor)?;
        }
        state.increment_call_stack_depth()?;
        Ok(true)
    }

    // Object monitor of the receiver for instance methods, class monitor for
    // static ones.
    fn method_monitor(
        &self,
        state: &VirtualMachineState,
        class: &Arc<Class>,
        method: &Method,
    ) -> Result<Arc<Monitor>> {
        if method.is_static() {
            return Ok(Arc::clone(class.monitor()));
        }
        match state.peek_operand_from_back(method.arg_count())? {
            Value::Object(r) | Value::Array(r) => self.jvm().heap.monitor(*r),
            Value::ClassRef(class) => Ok(Arc::clone(class.monitor())),
            other => Err(RuntimeError::TypeMismatch {
                expected: "object",
                found: other.t().name(),
            }),
        }
    }

    fn invoke_native(
        &self,
        state: &mut VirtualMachineState,
        method: &Method,
        monitor: Option<Arc<Monitor>>,
    ) -> Result<()> {
        debug!(method = %method.signature(), "invoke native");
        if let Some(monitor) = &monitor {
            monitor.enter();
        }
        let executed = self.jvm().natives.execute(self, state, method);
        if let Some(monitor) = &monitor {
            monitor.exit();
        }
        if !executed? {
            warn!(method = %method.signature(), "no native implementation");
            self.throw_exception_with_message(state, UNSATISFIED_LINK_ERROR, &method.signature())?;
        }
        Ok(())
    }

    /// Class a method was declared in, the class of the frame it runs in.
    pub(crate) fn declaring_class(&self, method: &Method) -> Result<Arc<Class>> {
        self.jvm()
            .classes
            .find_class(&method.class_name)
            .ok_or_else(|| RuntimeError::ClassNotFound(method.class_name.clone()))
    }

    /// Looks a class up for the guest, raising `NoClassDefFoundError` when the
    /// library doesn't have it.
    pub(crate) fn resolve_class(
        &self,
        state: &mut VirtualMachineState,
        name: &str,
    ) -> Result<Option<Arc<Class>>> {
        match self.jvm().classes.find_class(name) {
            Some(class) => Ok(Some(class)),
            None => {
                self.throw_exception_with_message(state, NO_CLASS_DEF_FOUND_ERROR, name)?;
                Ok(None)
            }
        }
    }

    /// Initialises `class`, its superclasses first, running `<clinit>`
    /// re-entrantly. Returns false when the class can't be used, a guest
    /// exception is then pending: whatever the initialiser threw, or
    /// `NoClassDefFoundError` once an earlier initialisation failed.
    ///
    /// A thread that finds another one running the initialiser waits for it
    /// to finish.
    pub(crate) fn ensure_initialised(
        &self,
        state: &mut VirtualMachineState,
        class: &Arc<Class>,
    ) -> Result<bool> {
        match class.begin_initialisation() {
            InitAction::Ready => return Ok(true),
            InitAction::Failed => {
                let message = format!("Could not initialize class {}", class.name());
                self.throw_exception_with_message(state, NO_CLASS_DEF_FOUND_ERROR, &message)?;
                return Ok(false);
            }
            InitAction::Run => {}
        }
        let result = self.run_initialisers(state, class);
        let succeeded = matches!(result, Ok(true));
        class.finish_initialisation(succeeded);
        debug!(class = class.name(), succeeded, "class initialisation finished");
        result
    }

    fn run_initialisers(
        &self,
        state: &mut VirtualMachineState,
        class: &Arc<Class>,
    ) -> Result<bool> {
        if let Some(super_name) = class.super_class() {
            if let Some(super_class) = self.jvm().classes.find_class(super_name) {
                if !self.ensure_initialised(state, &super_class)? {
                    return Ok(false);
                }
            }
        }
        let Some(initialiser) = class.get_method(CLASS_INITIALISER, "()V") else {
            return Ok(true);
        };
        debug!(class = class.name(), "initialising class");
        match self.execute_method(state, Arc::clone(class), initialiser, Vec::new())? {
            Invocation::Returned(_) => Ok(true),
            Invocation::Threw(_) | Invocation::Halted => Ok(false),
        }
    }

    fn method_reference(&self, state: &mut VirtualMachineState) -> Result<MemberRef> {
        let index = state.current_frame_mut()?.read_u16()?;
        match state.current_class()?.constant(index)? {
            ConstantPoolEntry::MethodRef(reference)
            | ConstantPoolEntry::InterfaceMethodRef(reference) => Ok(reference.clone()),
            _ => Err(RuntimeError::InvalidConstant {
                index,
                expected: "method reference",
            }),
        }
    }

    fn resolve_method_or_throw(
        &self,
        state: &mut VirtualMachineState,
        reference: &MemberRef,
    ) -> Result<Option<Arc<Method>>> {
        let method = self.resolver().resolve_method(
            self.jvm().classes.as_ref(),
            &reference.class_name,
            &reference.name,
            &reference.descriptor,
        );
        if method.is_none() {
            let signature = format!(
                "{}.{}{}",
                reference.class_name, reference.name, reference.descriptor
            );
            self.throw_exception_with_message(state, NO_SUCH_METHOD_ERROR, &signature)?;
        }
        Ok(method)
    }

    pub(crate) fn invoke_static(&self, state: &mut VirtualMachineState) -> Result<Flow> {
        let reference = self.method_reference(state)?;
        if self.resolve_class(state, &reference.class_name)?.is_none() {
            return Ok(Flow::Continue);
        }
        let Some(method) = self.resolve_method_or_throw(state, &reference)? else {
            return Ok(Flow::Continue);
        };
        if !method.is_static() || method.is_abstract() {
            let signature = method.signature();
            return self.raise_with_message(state, INCOMPATIBLE_CLASS_CHANGE_ERROR, &signature);
        }
        let class = self.declaring_class(&method)?;
        if !self.ensure_initialised(state, &class)? {
            return Ok(Flow::Continue);
        }
        self.invoke_method(state, class, method)?;
        Ok(Flow::Continue)
    }

    pub(crate) fn invoke_special(&self, state: &mut VirtualMachineState) -> Result<Flow> {
        let reference = self.method_reference(state)?;
        let Some(resolved) = self.resolve_method_or_throw(state, &reference)? else {
            return Ok(Flow::Continue);
        };
        let signature = resolved.signature();
        if resolved.is_static() {
            return self.raise_with_message(state, INCOMPATIBLE_CLASS_CHANGE_ERROR, &signature);
        }
        let current = state.current_class()?;
        let Some(method) = self.resolver().select_special_method(
            self.jvm().classes.as_ref(),
            &current,
            &reference.class_name,
            resolved,
        ) else {
            return self.raise_with_message(state, ABSTRACT_METHOD_ERROR, &signature);
        };
        if state.peek_operand_from_back(method.arg_count())?.is_null() {
            return self.raise(state, NULL_POINTER_EXCEPTION);
        }
        let class = self.declaring_class(&method)?;
        self.invoke_method(state, class, method)?;
        Ok(Flow::Continue)
    }

    pub(crate) fn invoke_virtual(&self, state: &mut VirtualMachineState) -> Result<Flow> {
        let reference = self.method_reference(state)?;
        let receiver = self.receiver(state, &reference)?;
        if let Value::Array(array) = receiver {
            return self.invoke_array_method(state, array, &reference);
        }
        let Some(runtime_class) = self.receiver_class(state, &receiver)? else {
            return Ok(Flow::Continue);
        };
        let Some(resolved) = self.resolve_method_or_throw(state, &reference)? else {
            return Ok(Flow::Continue);
        };
        if resolved.is_static() {
            let signature = resolved.signature();
            return self.raise_with_message(state, INCOMPATIBLE_CLASS_CHANGE_ERROR, &signature);
        }
        // Private methods are never overridden.
        if resolved.is_private() {
            let class = self.declaring_class(&resolved)?;
            self.invoke_method(state, class, resolved)?;
            return Ok(Flow::Continue);
        }
        self.dispatch_on_receiver(state, &runtime_class, &reference)
    }

    pub(crate) fn invoke_interface(&self, state: &mut VirtualMachineState) -> Result<Flow> {
        let reference = self.method_reference(state)?;
        let frame = state.current_frame_mut()?;
        // Argument count and a zero byte, both redundant with the descriptor.
        frame.read_u8()?;
        frame.read_u8()?;

        let receiver = self.receiver(state, &reference)?;
        if let Value::Array(_) = receiver {
            return Err(RuntimeError::invalid_state(format!(
                "invokeinterface {}.{} on an array",
                reference.class_name, reference.name
            )));
        }
        let Some(runtime_class) = self.receiver_class(state, &receiver)? else {
            return Ok(Flow::Continue);
        };
        let classes = self.jvm().classes.as_ref();
        if !is_subclass_of(classes, runtime_class.name(), &reference.class_name) {
            let message = format!(
                "{} does not implement {}",
                runtime_class.name(),
                reference.class_name
            );
            return self.raise_with_message(state, INCOMPATIBLE_CLASS_CHANGE_ERROR, &message);
        }
        self.dispatch_on_receiver(state, &runtime_class, &reference)
    }

    // The receiver sits under the arguments.
    fn receiver(&self, state: &VirtualMachineState, reference: &MemberRef) -> Result<Value> {
        let (args, _) = parse_method_types(&reference.descriptor)?;
        Ok(state.peek_operand_from_back(args.len() + 1)?.clone())
    }

    // Class virtual dispatch starts from. Class objects are instances of
    // `java/lang/Class`. `None` once a guest exception was raised.
    fn receiver_class(
        &self,
        state: &mut VirtualMachineState,
        receiver: &Value,
    ) -> Result<Option<Arc<Class>>> {
        match receiver {
            Value::Null => {
                self.throw_exception(state, NULL_POINTER_EXCEPTION)?;
                Ok(None)
            }
            Value::Object(object) => self.jvm().heap.class_of(*object).map(Some),
            Value::ClassRef(_) => self.resolve_class(state, JAVA_LANG_CLASS),
            other => Err(RuntimeError::TypeMismatch {
                expected: "object",
                found: other.t().name(),
            }),
        }
    }

    // Selects the method from the receiver's runtime class.
    fn dispatch_on_receiver(
        &self,
        state: &mut VirtualMachineState,
        runtime_class: &Arc<Class>,
        reference: &MemberRef,
    ) -> Result<Flow> {
        let method = self.resolver().find_virtual_method(
            self.jvm().classes.as_ref(),
            runtime_class,
            &reference.name,
            &reference.descriptor,
        );
        let Some(method) = method else {
            let message = format!(
                "{}.{}{}",
                runtime_class.name(),
                reference.name,
                reference.descriptor
            );
            return self.raise_with_message(state, ABSTRACT_METHOD_ERROR, &message);
        };
        let class = self.declaring_class(&method)?;
        self.invoke_method(state, class, method)?;
        Ok(Flow::Continue)
    }

    // Arrays only answer `clone`, anything else means the method body is
    // broken.
    fn invoke_array_method(
        &self,
        state: &mut VirtualMachineState,
        array: ObjectRef,
        reference: &MemberRef,
    ) -> Result<Flow> {
        let on_object =
            reference.class_name == JAVA_LANG_OBJECT || reference.class_name.starts_with('[');
        let is_clone = reference.name == "clone" && reference.descriptor == "()Ljava/lang/Object;";
        if !on_object || !is_clone {
            return Err(RuntimeError::invalid_state(format!(
                "invokevirtual {}.{}{} on an array",
                reference.class_name, reference.name, reference.descriptor
            )));
        }
        state.pop_operand()?;
        if let Some(copy) = self.allocate(state, |heap| heap.clone_array(array))? {
            state.push_operand(Value::Array(copy));
        }
        Ok(Flow::Continue)
    }

    /// `ireturn` and friends: pops the frame, releasing its monitors, and
    /// hands the value to the caller.
    pub(crate) fn return_from_method(
        &self,
        state: &mut VirtualMachineState,
        opcode: OPCode,
    ) -> Result<Flow> {
        let method = state.current_method()?;
        let value = match opcode {
            OPCode::Return => None,
            _ => Some(state.pop_operand()?.coerce_to(method.return_type())?),
        };
        state.pop_state()?;
        if let Some(value) = value {
            state.push_operand(value);
        }
        if state.decrement_call_stack_depth()? == 0 {
            return Ok(Flow::ReenterCaller);
        }
        Ok(Flow::Continue)
    }

    /// Delivers an exception that unwound the outermost frame to the
    /// `uncaughtException` method of the thread's group.
    pub(crate) fn handle_unhandled_exception(
        &self,
        state: &mut VirtualMachineState,
        exception: ObjectRef,
    ) -> Result<RunOutcome> {
        state.take_pending_exception();
        let heap = &self.jvm().heap;
        let exception_class = heap.class_of(exception)?.name().to_string();
        let group = match state.thread_object() {
            Some(thread) => heap.get_field_by_name(thread, "group")?.map(|group| (thread, group)),
            None => None,
        };
        let Some((thread, Value::Object(group))) = group else {
            error!(exception = %exception_class, "uncaught exception with no thread group");
            return Ok(RunOutcome::Uncaught(exception));
        };

        let group_class = heap.class_of(group)?;
        let handler = self
            .resolver()
            .find_virtual_method(
                self.jvm().classes.as_ref(),
                &group_class,
                UNCAUGHT_EXCEPTION,
                UNCAUGHT_EXCEPTION_DESCRIPTOR,
            )
            .ok_or_else(|| RuntimeError::UnresolvedMethod {
                class: group_class.name().to_string(),
                name: UNCAUGHT_EXCEPTION.to_string(),
                descriptor: UNCAUGHT_EXCEPTION_DESCRIPTOR.to_string(),
            })?;
        debug!(
            exception = %exception_class,
            group = group_class.name(),
            "delivering uncaught exception"
        );
        let class = self.declaring_class(&handler)?;
        let args = vec![Value::Object(group), Value::Object(thread), Value::Object(exception)];
        if let Invocation::Threw(secondary) = self.execute_method(state, class, handler, args)? {
            // Nothing is left to hand it to.
            state.take_pending_exception();
            let secondary = heap.class_of(secondary)?.name().to_string();
            error!(exception = %secondary, "uncaught exception handler threw");
        }
        Ok(RunOutcome::Uncaught(exception))
    }
}
