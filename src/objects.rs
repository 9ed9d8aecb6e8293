//! Constants, objects, arrays, fields, type checks and monitors.
use std::sync::Arc;

use tracing::debug;

use crate::error::{Result, RuntimeError};
use crate::exceptions::{
    ARRAY_INDEX_OUT_OF_BOUNDS_EXCEPTION, ARRAY_STORE_EXCEPTION, CLASS_CAST_EXCEPTION,
    ILLEGAL_MONITOR_STATE_EXCEPTION, INCOMPATIBLE_CLASS_CHANGE_ERROR, INSTANTIATION_ERROR,
    NEGATIVE_ARRAY_SIZE_EXCEPTION, NO_SUCH_FIELD_ERROR, NULL_POINTER_EXCEPTION,
};
use crate::heap::{ArrayType, Heap, ObjectRef};
use crate::jvm::ClassLibrary;
use crate::monitor::Monitor;
use crate::program::{
    ConstantPoolEntry, Field, MemberRef, ACC_ABSTRACT, JAVA_LANG_CLASS, JAVA_LANG_OBJECT,
};
use crate::resolver::{instance_fields, is_subclass_of};
use crate::runtime::{pop_int, Flow, Runtime};
use crate::state::VirtualMachineState;
use crate::value::Value;

const JAVA_LANG_STRING: &str = "java/lang/String";
const JAVA_LANG_CLONEABLE: &str = "java/lang/Cloneable";
const JAVA_IO_SERIALIZABLE: &str = "java/io/Serializable";

impl Runtime {
    /// `ldc` and `ldc_w`.
    pub(crate) fn load_constant(
        &self,
        state: &mut VirtualMachineState,
        index: u16,
    ) -> Result<Flow> {
        let entry = state.current_class()?.constant(index)?.clone();
        match entry {
            ConstantPoolEntry::Integer(value) => state.push_operand(Value::Integer(value)),
            ConstantPoolEntry::Float(value) => state.push_operand(Value::Float(value)),
            ConstantPoolEntry::String(text) => {
                if let Some(string) = self.intern(state, &text)? {
                    state.push_operand(Value::Object(string));
                }
            }
            ConstantPoolEntry::Class(name) => {
                if let Some(class) = self.resolve_class(state, &name)? {
                    state.push_operand(Value::ClassRef(class));
                }
            }
            _ => {
                return Err(RuntimeError::InvalidConstant {
                    index,
                    expected: "int, float, string or class constant",
                })
            }
        }
        Ok(Flow::Continue)
    }

    /// `ldc2_w`.
    pub(crate) fn load_wide_constant(
        &self,
        state: &mut VirtualMachineState,
        index: u16,
    ) -> Result<Flow> {
        let value = match state.current_class()?.constant(index)? {
            ConstantPoolEntry::Long(value) => Value::Long(*value),
            ConstantPoolEntry::Double(value) => Value::Double(*value),
            _ => {
                return Err(RuntimeError::InvalidConstant {
                    index,
                    expected: "long or double constant",
                })
            }
        };
        state.push_operand(value);
        Ok(Flow::Continue)
    }

    // One `String` object per distinct literal, shared by every class.
    fn intern(&self, state: &mut VirtualMachineState, text: &str) -> Result<Option<ObjectRef>> {
        if let Some(string) = self.strings.lock().get(text) {
            return Ok(Some(*string));
        }
        let Some(string) = self.allocate(state, |_| self.new_string(text))? else {
            return Ok(None);
        };
        Ok(Some(*self.strings.lock().entry(text.to_string()).or_insert(string)))
    }

    /// Allocates a `java/lang/String` holding `text` as UTF-16 code units.
    pub fn new_string(&self, text: &str) -> Result<ObjectRef> {
        let classes = self.jvm().classes.as_ref();
        let heap = &self.jvm().heap;
        let class = classes
            .find_class(JAVA_LANG_STRING)
            .ok_or_else(|| RuntimeError::ClassNotFound(JAVA_LANG_STRING.to_string()))?;
        let field = self
            .resolver()
            .resolve_field(classes, JAVA_LANG_STRING, "value")
            .ok_or_else(|| RuntimeError::UnresolvedField {
                class: JAVA_LANG_STRING.to_string(),
                name: "value".to_string(),
            })?;
        let units = text.encode_utf16().map(Value::Char).collect();
        let value = heap.allocate_array_from(ArrayType::Char, "[C", units)?;
        let string = heap.allocate_object(Arc::clone(&class), instance_fields(classes, &class))?;
        heap.set_field(string, &field, Value::Array(value))?;
        Ok(string)
    }

    fn class_operand(&self, state: &mut VirtualMachineState) -> Result<String> {
        let index = state.current_frame_mut()?.read_u16()?;
        match state.current_class()?.constant(index)? {
            ConstantPoolEntry::Class(name) => Ok(name.clone()),
            _ => Err(RuntimeError::InvalidConstant {
                index,
                expected: "class reference",
            }),
        }
    }

    fn field_operand(&self, state: &mut VirtualMachineState) -> Result<MemberRef> {
        let index = state.current_frame_mut()?.read_u16()?;
        match state.current_class()?.constant(index)? {
            ConstantPoolEntry::FieldRef(reference) => Ok(reference.clone()),
            _ => Err(RuntimeError::InvalidConstant {
                index,
                expected: "field reference",
            }),
        }
    }

    fn resolve_field_or_throw(
        &self,
        state: &mut VirtualMachineState,
        reference: &MemberRef,
    ) -> Result<Option<Arc<Field>>> {
        if self.resolve_class(state, &reference.class_name)?.is_none() {
            return Ok(None);
        }
        let field = self
            .resolver()
            .resolve_field(self.jvm().classes.as_ref(), &reference.class_name, &reference.name);
        if field.is_none() {
            let name = format!("{}.{}", reference.class_name, reference.name);
            self.throw_exception_with_message(state, NO_SUCH_FIELD_ERROR, &name)?;
        }
        Ok(field)
    }

    // Static field access initialises the declaring class first.
    fn static_field(&self, state: &mut VirtualMachineState) -> Result<Option<Arc<Field>>> {
        let reference = self.field_operand(state)?;
        let Some(field) = self.resolve_field_or_throw(state, &reference)? else {
            return Ok(None);
        };
        if !field.is_static() {
            let name = format!("{}.{}", field.class_name, field.name);
            self.throw_exception_with_message(state, INCOMPATIBLE_CLASS_CHANGE_ERROR, &name)?;
            return Ok(None);
        }
        let class = self
            .jvm()
            .classes
            .find_class(&field.class_name)
            .ok_or_else(|| RuntimeError::ClassNotFound(field.class_name.clone()))?;
        if !self.ensure_initialised(state, &class)? {
            return Ok(None);
        }
        Ok(Some(field))
    }

    fn instance_field(&self, state: &mut VirtualMachineState) -> Result<Option<Arc<Field>>> {
        let reference = self.field_operand(state)?;
        let Some(field) = self.resolve_field_or_throw(state, &reference)? else {
            return Ok(None);
        };
        if field.is_static() {
            let name = format!("{}.{}", field.class_name, field.name);
            self.throw_exception_with_message(state, INCOMPATIBLE_CLASS_CHANGE_ERROR, &name)?;
            return Ok(None);
        }
        Ok(Some(field))
    }

    pub(crate) fn get_static(&self, state: &mut VirtualMachineState) -> Result<Flow> {
        if let Some(field) = self.static_field(state)? {
            state.push_operand(field.static_value());
        }
        Ok(Flow::Continue)
    }

    pub(crate) fn put_static(&self, state: &mut VirtualMachineState) -> Result<Flow> {
        if let Some(field) = self.static_field(state)? {
            let value = state.pop_operand()?.coerce_to(field.field_type())?;
            field.set_static_value(value);
        }
        Ok(Flow::Continue)
    }

    pub(crate) fn get_field(&self, state: &mut VirtualMachineState) -> Result<Flow> {
        let Some(field) = self.instance_field(state)? else {
            return Ok(Flow::Continue);
        };
        match state.pop_operand()? {
            Value::Null => self.raise(state, NULL_POINTER_EXCEPTION),
            Value::Object(object) => {
                let value = self.jvm().heap.get_field(object, &field)?;
                state.push_operand(value);
                Ok(Flow::Continue)
            }
            other => Err(RuntimeError::TypeMismatch {
                expected: "object",
                found: other.t().name(),
            }),
        }
    }

    pub(crate) fn put_field(&self, state: &mut VirtualMachineState) -> Result<Flow> {
        let Some(field) = self.instance_field(state)? else {
            return Ok(Flow::Continue);
        };
        let value = state.pop_operand()?.coerce_to(field.field_type())?;
        match state.pop_operand()? {
            Value::Null => self.raise(state, NULL_POINTER_EXCEPTION),
            Value::Object(object) => {
                self.jvm().heap.set_field(object, &field, value)?;
                Ok(Flow::Continue)
            }
            other => Err(RuntimeError::TypeMismatch {
                expected: "object",
                found: other.t().name(),
            }),
        }
    }

    pub(crate) fn new_object(&self, state: &mut VirtualMachineState) -> Result<Flow> {
        let name = self.class_operand(state)?;
        let Some(class) = self.resolve_class(state, &name)? else {
            return Ok(Flow::Continue);
        };
        if class.is_interface() || class.access_flags() & ACC_ABSTRACT != 0 {
            return self.raise_with_message(state, INSTANTIATION_ERROR, &name);
        }
        if !self.ensure_initialised(state, &class)? {
            return Ok(Flow::Continue);
        }
        let fields = instance_fields(self.jvm().classes.as_ref(), &class);
        if let Some(object) = self.allocate(state, |heap| heap.allocate_object(class, fields))? {
            state.push_operand(Value::Object(object));
        }
        Ok(Flow::Continue)
    }

    pub(crate) fn new_array(&self, state: &mut VirtualMachineState) -> Result<Flow> {
        let atype = state.current_frame_mut()?.read_u8()?;
        let element_type = ArrayType::from_atype(atype)
            .ok_or_else(|| RuntimeError::invalid_state(format!("newarray with atype {atype}")))?;
        let count = pop_int(state)?;
        if count < 0 {
            let message = count.to_string();
            return self.raise_with_message(state, NEGATIVE_ARRAY_SIZE_EXCEPTION, &message);
        }
        let descriptor = format!("[{}", element_type.descriptor());
        let length = count as usize;
        if let Some(array) =
            self.allocate(state, |heap| heap.allocate_array(element_type, &descriptor, length))?
        {
            state.push_operand(Value::Array(array));
        }
        Ok(Flow::Continue)
    }

    pub(crate) fn new_reference_array(&self, state: &mut VirtualMachineState) -> Result<Flow> {
        let name = self.class_operand(state)?;
        let count = pop_int(state)?;
        if !name.starts_with('[') && self.resolve_class(state, &name)?.is_none() {
            return Ok(Flow::Continue);
        }
        if count < 0 {
            let message = count.to_string();
            return self.raise_with_message(state, NEGATIVE_ARRAY_SIZE_EXCEPTION, &message);
        }
        let descriptor = match name.starts_with('[') {
            true => format!("[{name}"),
            false => format!("[L{name};"),
        };
        let length = count as usize;
        if let Some(array) = self.allocate(state, |heap| {
            heap.allocate_array(ArrayType::Reference, &descriptor, length)
        })? {
            state.push_operand(Value::Array(array));
        }
        Ok(Flow::Continue)
    }

    pub(crate) fn new_multi_array(&self, state: &mut VirtualMachineState) -> Result<Flow> {
        let descriptor = self.class_operand(state)?;
        let dimensions = state.current_frame_mut()?.read_u8()? as usize;
        let depth = descriptor.bytes().take_while(|b| *b == b'[').count();
        if dimensions == 0 || depth < dimensions {
            return Err(RuntimeError::invalid_state(format!(
                "multianewarray of {dimensions} dimensions for {descriptor}"
            )));
        }
        let mut counts = Vec::with_capacity(dimensions);
        for _ in 0..dimensions {
            counts.push(pop_int(state)?);
        }
        counts.reverse();
        if let Some(count) = counts.iter().find(|c| **c < 0) {
            let message = count.to_string();
            return self.raise_with_message(state, NEGATIVE_ARRAY_SIZE_EXCEPTION, &message);
        }
        if let Some(array) =
            self.allocate(state, |heap| allocate_multi_array(heap, &descriptor, &counts))?
        {
            state.push_operand(Value::Array(array));
        }
        Ok(Flow::Continue)
    }

    pub(crate) fn array_length(&self, state: &mut VirtualMachineState) -> Result<Flow> {
        match state.pop_operand()? {
            Value::Null => self.raise(state, NULL_POINTER_EXCEPTION),
            Value::Array(array) => {
                let length = self.jvm().heap.array_length(array)?;
                state.push_operand(Value::Integer(length as i32));
                Ok(Flow::Continue)
            }
            other => Err(RuntimeError::TypeMismatch {
                expected: "array",
                found: other.t().name(),
            }),
        }
    }

    // Pops the array reference under an index. `None` once a guest exception
    // was raised for a null reference or an index out of range.
    fn checked_array(
        &self,
        state: &mut VirtualMachineState,
        index: i32,
    ) -> Result<Option<ObjectRef>> {
        let array = match state.pop_operand()? {
            Value::Null => {
                self.throw_exception(state, NULL_POINTER_EXCEPTION)?;
                return Ok(None);
            }
            Value::Array(array) => array,
            other => {
                return Err(RuntimeError::TypeMismatch {
                    expected: "array",
                    found: other.t().name(),
                })
            }
        };
        let length = self.jvm().heap.array_length(array)?;
        if index < 0 || index as usize >= length {
            let message = format!("Index {index} out of bounds for length {length}");
            self.throw_exception_with_message(
                state,
                ARRAY_INDEX_OUT_OF_BOUNDS_EXCEPTION,
                &message,
            )?;
            return Ok(None);
        }
        Ok(Some(array))
    }

    /// `iaload` and friends. Sub-int elements are widened to int on the
    /// operand stack.
    pub(crate) fn array_load(
        &self,
        state: &mut VirtualMachineState,
        element_type: ArrayType,
    ) -> Result<Flow> {
        let index = pop_int(state)?;
        let Some(array) = self.checked_array(state, index)? else {
            return Ok(Flow::Continue);
        };
        let element = self
            .jvm()
            .heap
            .array_load(array, index)?
            .ok_or_else(|| RuntimeError::invalid_state("array shrank under a load"))?;
        let value = match element_type {
            ArrayType::Boolean | ArrayType::Byte | ArrayType::Char | ArrayType::Short => {
                Value::Integer(element.as_int()?)
            }
            _ => element,
        };
        state.push_operand(value);
        Ok(Flow::Continue)
    }

    /// `iastore` and friends. Nothing is written when an exception is raised.
    pub(crate) fn array_store(
        &self,
        state: &mut VirtualMachineState,
        element_type: ArrayType,
    ) -> Result<Flow> {
        let value = state.pop_operand()?;
        let index = pop_int(state)?;
        let Some(array) = self.checked_array(state, index)? else {
            return Ok(Flow::Continue);
        };
        let heap = &self.jvm().heap;
        let descriptor = heap.array_descriptor(array)?;
        let component = &descriptor[1..];
        let element = match element_type {
            ArrayType::Int => Value::Integer(value.as_int()?),
            ArrayType::Long => Value::Long(value.as_long()?),
            ArrayType::Float => Value::Float(value.as_float()?),
            ArrayType::Double => Value::Double(value.as_double()?),
            ArrayType::Char => Value::Char(value.as_int()? as u16),
            ArrayType::Short => Value::Short(value.as_int()? as i16),
            // `bastore` serves both byte and boolean arrays.
            ArrayType::Byte | ArrayType::Boolean => match ArrayType::from_descriptor(component) {
                ArrayType::Boolean => Value::Bool(value.as_int()? & 1 != 0),
                _ => Value::Byte(value.as_int()? as i8),
            },
            ArrayType::Reference => {
                let value = value.into_reference()?;
                if !value.is_null() {
                    let source = self.runtime_type_name(&value)?;
                    let target = component_name(component).unwrap_or(component);
                    if !is_assignable(self.jvm().classes.as_ref(), &source, target) {
                        let message = format!("{source} stored into {descriptor}");
                        return self.raise_with_message(state, ARRAY_STORE_EXCEPTION, &message);
                    }
                }
                value
            }
        };
        heap.array_store(array, index, element)?;
        Ok(Flow::Continue)
    }

    /// Class name of an object, descriptor of an array.
    pub(crate) fn runtime_type_name(&self, value: &Value) -> Result<String> {
        match value {
            Value::Object(object) => Ok(self.jvm().heap.class_of(*object)?.name().to_string()),
            Value::Array(array) => self.jvm().heap.array_descriptor(*array),
            Value::ClassRef(_) => Ok(JAVA_LANG_CLASS.to_string()),
            other => Err(RuntimeError::TypeMismatch {
                expected: "reference",
                found: other.t().name(),
            }),
        }
    }

    // Target of `checkcast` and `instanceof`, array classes aren't looked up.
    fn type_operand(&self, state: &mut VirtualMachineState) -> Result<Option<String>> {
        let name = self.class_operand(state)?;
        if !name.starts_with('[') && self.resolve_class(state, &name)?.is_none() {
            return Ok(None);
        }
        Ok(Some(name))
    }

    pub(crate) fn check_cast(&self, state: &mut VirtualMachineState) -> Result<Flow> {
        let Some(target) = self.type_operand(state)? else {
            return Ok(Flow::Continue);
        };
        let value = state.peek_operand()?.clone();
        if value.is_null() {
            return Ok(Flow::Continue);
        }
        let source = self.runtime_type_name(&value)?;
        if !is_assignable(self.jvm().classes.as_ref(), &source, &target) {
            let message = format!("class {source} cannot be cast to class {target}");
            return self.raise_with_message(state, CLASS_CAST_EXCEPTION, &message);
        }
        Ok(Flow::Continue)
    }

    pub(crate) fn instance_of(&self, state: &mut VirtualMachineState) -> Result<Flow> {
        let Some(target) = self.type_operand(state)? else {
            return Ok(Flow::Continue);
        };
        let value = state.pop_operand()?;
        let result = match value.is_null() {
            true => false,
            false => {
                let source = self.runtime_type_name(&value)?;
                is_assignable(self.jvm().classes.as_ref(), &source, &target)
            }
        };
        state.push_operand(Value::Integer(result as i32));
        Ok(Flow::Continue)
    }

    /// `athrow`.
    pub(crate) fn throw_reference(&self, state: &mut VirtualMachineState) -> Result<Flow> {
        match state.pop_operand()? {
            Value::Null => self.raise(state, NULL_POINTER_EXCEPTION),
            Value::Object(exception) => {
                debug!(exception = self.jvm().heap.class_of(exception)?.name(), "athrow");
                state.set_pending_exception(exception);
                Ok(Flow::Continue)
            }
            other => Err(RuntimeError::TypeMismatch {
                expected: "throwable",
                found: other.t().name(),
            }),
        }
    }

    fn monitor_of(&self, value: &Value) -> Result<Option<Arc<Monitor>>> {
        match value {
            Value::Null => Ok(None),
            Value::Object(r) | Value::Array(r) => self.jvm().heap.monitor(*r).map(Some),
            Value::ClassRef(class) => Ok(Some(Arc::clone(class.monitor()))),
            other => Err(RuntimeError::TypeMismatch {
                expected: "reference",
                found: other.t().name(),
            }),
        }
    }

    /// `monitorenter`. The monitor is recorded on the frame so it's released
    /// however the frame ends.
    pub(crate) fn monitor_enter(&self, state: &mut VirtualMachineState) -> Result<Flow> {
        let value = state.pop_operand()?;
        let Some(monitor) = self.monitor_of(&value)? else {
            return self.raise(state, NULL_POINTER_EXCEPTION);
        };
        state.push_monitor(monitor)?;
        Ok(Flow::Continue)
    }

    pub(crate) fn monitor_exit(&self, state: &mut VirtualMachineState) -> Result<Flow> {
        let value = state.pop_operand()?;
        let Some(monitor) = self.monitor_of(&value)? else {
            return self.raise(state, NULL_POINTER_EXCEPTION);
        };
        if !state.pop_monitor(&monitor)? {
            return self.raise(state, ILLEGAL_MONITOR_STATE_EXCEPTION);
        }
        Ok(Flow::Continue)
    }
}

fn allocate_multi_array(heap: &Heap, descriptor: &str, counts: &[i32]) -> Result<ObjectRef> {
    let component = &descriptor[1..];
    let length = counts[0] as usize;
    if counts.len() == 1 {
        return heap.allocate_array(ArrayType::from_descriptor(component), descriptor, length);
    }
    let mut elements = heap.reserve_elements(length)?;
    for _ in 0..length {
        let inner = allocate_multi_array(heap, component, &counts[1..])?;
        elements.push(Value::Array(inner));
    }
    heap.allocate_array_from(ArrayType::Reference, descriptor, elements)
}

// `Ljava/lang/String;` to `java/lang/String`, array descriptors stay as they
// are. Primitive descriptors have no class name.
pub(crate) fn component_name(descriptor: &str) -> Option<&str> {
    if descriptor.starts_with('[') {
        return Some(descriptor);
    }
    descriptor.strip_prefix('L').and_then(|d| d.strip_suffix(';'))
}

/// Assignment compatibility between runtime types, classes by name and
/// arrays by descriptor (`[I`, `[Ljava/lang/String;`).
pub fn is_assignable(classes: &dyn ClassLibrary, source: &str, target: &str) -> bool {
    if source == target {
        return true;
    }
    match (source.strip_prefix('['), target.strip_prefix('[')) {
        (None, None) => is_subclass_of(classes, source, target),
        (None, Some(_)) => false,
        (Some(_), None) => {
            matches!(target, JAVA_LANG_OBJECT | JAVA_LANG_CLONEABLE | JAVA_IO_SERIALIZABLE)
        }
        (Some(source), Some(target)) => match (component_name(source), component_name(target)) {
            (Some(source), Some(target)) => is_assignable(classes, source, target),
            // Distinct primitive components.
            _ => false,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exceptions::{ARITHMETIC_EXCEPTION, OUT_OF_MEMORY_ERROR};
    use crate::jvm::InMemoryClassLibrary;
    use crate::program::{ClassBuilder, MethodBuilder, ACC_INTERFACE, ACC_PUBLIC, ACC_STATIC};
    use crate::runtime::Invocation;
    use crate::testing::{call, returned, runtime_with, static_method_class, thrown_class};

    // Static method `run` of class `Test`, `code` gets the builder so it can
    // add the constants it refers to.
    fn run_method(
        descriptor: &str,
        code: impl FnOnce(&mut ClassBuilder) -> Vec<u8>,
        others: Vec<crate::program::Class>,
    ) -> (Runtime, Invocation) {
        let mut builder = ClassBuilder::new("Test");
        let code = code(&mut builder);
        builder.method(
            MethodBuilder::new("run", descriptor)
                .access_flags(ACC_STATIC)
                .max_locals(4)
                .code(code),
        );
        let mut classes = others;
        classes.push(builder.build().unwrap());
        let runtime = runtime_with(classes);
        let mut state = VirtualMachineState::new();
        let result = call(&runtime, &mut state, "Test", "run", descriptor, vec![]);
        (runtime, result)
    }

    fn hi_lo(index: u16) -> (u8, u8) {
        let [hi, lo] = index.to_be_bytes();
        (hi, lo)
    }

    fn detail_message(runtime: &Runtime, result: Invocation) -> String {
        let Invocation::Threw(exception) = result else {
            panic!("expected an exception, got {result:?}");
        };
        let heap = &runtime.jvm().heap;
        let field = heap.get_field_by_name(exception, "detailMessage").unwrap();
        let Some(Value::Object(message)) = field else {
            panic!("exception has no message");
        };
        heap.read_string(message).unwrap().unwrap()
    }

    #[test]
    fn string_literals_are_interned() {
        let mut builder = ClassBuilder::new("Test");
        let index = builder.string("hello") as u8;
        builder.method(
            MethodBuilder::new("run", "()Ljava/lang/String;")
                .access_flags(ACC_STATIC)
                .code(vec![0x12, index, 0xb0]),
        );
        let runtime = runtime_with(vec![builder.build().unwrap()]);
        let mut state = VirtualMachineState::new();
        let descriptor = "()Ljava/lang/String;";
        let first = returned(call(&runtime, &mut state, "Test", "run", descriptor, vec![]));
        let second = returned(call(&runtime, &mut state, "Test", "run", descriptor, vec![]));
        assert!(first.same_reference(&second));
        let Value::Object(string) = first else {
            panic!("ldc did not push an object");
        };
        assert_eq!(runtime.jvm().heap.read_string(string).unwrap().as_deref(), Some("hello"));
    }

    #[test]
    fn wide_constants_load_both_words() {
        let (_, result) = run_method(
            "()J",
            |b| {
                let (hi, lo) = hi_lo(b.constant(ConstantPoolEntry::Long(1 << 40)));
                vec![0x14, hi, lo, 0xad]
            },
            vec![],
        );
        assert_eq!(returned(result), Value::Long(1 << 40));
    }

    #[test]
    fn class_constants_push_class_references() {
        let (_, result) = run_method(
            "()Ljava/lang/Object;",
            |b| {
                let (hi, lo) = hi_lo(b.class_ref("java/lang/String"));
                vec![0x13, hi, lo, 0xb0]
            },
            vec![],
        );
        let Value::ClassRef(class) = returned(result) else {
            panic!("ldc_w of a class did not push a class reference");
        };
        assert_eq!(class.name(), JAVA_LANG_STRING);
    }

    fn point() -> crate::program::Class {
        let mut point = ClassBuilder::new("Point");
        point
            .field("x", "I", 0)
            .field("flag", "Z", ACC_STATIC)
            .method(MethodBuilder::new("<init>", "()V").code(vec![0xb1]));
        point.build().unwrap()
    }

    #[test]
    fn fields_round_trip_through_objects() {
        // new Point, dup, invokespecial <init>, astore_0, aload_0, bipush 7,
        // putfield x, aload_0, getfield x, ireturn
        let (_, result) = run_method(
            "()I",
            |b| {
                let (chi, clo) = hi_lo(b.class_ref("Point"));
                let (ihi, ilo) = hi_lo(b.method_ref("Point", "<init>", "()V"));
                let (fhi, flo) = hi_lo(b.field_ref("Point", "x", "I"));
                vec![
                    0xbb, chi, clo, 0x59, 0xb7, ihi, ilo, 0x4b, 0x2a, 0x10, 7, 0xb5, fhi, flo,
                    0x2a, 0xb4, fhi, flo, 0xac,
                ]
            },
            vec![point()],
        );
        assert_eq!(returned(result), Value::Integer(7));
    }

    #[test]
    fn getfield_on_null_raises_npe() {
        let (runtime, result) = run_method(
            "()I",
            |b| {
                let (hi, lo) = hi_lo(b.field_ref("Point", "x", "I"));
                vec![0x01, 0xb4, hi, lo, 0xac]
            },
            vec![point()],
        );
        assert_eq!(thrown_class(&runtime, result), NULL_POINTER_EXCEPTION);
    }

    #[test]
    fn static_booleans_keep_their_low_bit() {
        let (_, result) = run_method(
            "()I",
            |b| {
                let (hi, lo) = hi_lo(b.field_ref("Point", "flag", "Z"));
                vec![0x06, 0xb3, hi, lo, 0xb2, hi, lo, 0xac]
            },
            vec![point()],
        );
        assert_eq!(returned(result), Value::Integer(1));
    }

    #[test]
    fn missing_fields_raise_no_such_field_error() {
        let (runtime, result) = run_method(
            "()I",
            |b| {
                let (hi, lo) = hi_lo(b.field_ref("Point", "y", "I"));
                vec![0xb2, hi, lo, 0xac]
            },
            vec![point()],
        );
        assert_eq!(thrown_class(&runtime, result), NO_SUCH_FIELD_ERROR);
    }

    #[test]
    fn out_of_bounds_loads_report_index_and_length() {
        // iconst_3, newarray int, iconst_5, iaload, ireturn
        let (runtime, result) =
            run_method("()I", |_| vec![0x06, 0xbc, 10, 0x08, 0x2e, 0xac], vec![]);
        assert_eq!(
            detail_message(&runtime, result.clone()),
            "Index 5 out of bounds for length 3"
        );
        assert_eq!(thrown_class(&runtime, result), ARRAY_INDEX_OUT_OF_BOUNDS_EXCEPTION);
    }

    #[test]
    fn int_arrays_store_and_load() {
        // iconst_2, newarray int, astore_0, aload_0, iconst_1, bipush 9,
        // iastore, aload_0, iconst_1, iaload, ireturn
        let (_, result) = run_method(
            "()I",
            |_| vec![0x05, 0xbc, 10, 0x4b, 0x2a, 0x04, 0x10, 9, 0x4f, 0x2a, 0x04, 0x2e, 0xac],
            vec![],
        );
        assert_eq!(returned(result), Value::Integer(9));
    }

    #[test]
    fn bastore_truncates_by_array_kind() {
        // iconst_1, newarray boolean|byte, astore_0, aload_0, iconst_0,
        // sipush 0x0103, bastore, aload_0, iconst_0, baload, ireturn
        let code = |atype: u8| {
            vec![
                0x04, 0xbc, atype, 0x4b, 0x2a, 0x03, 0x11, 0x01, 0x03, 0x54, 0x2a, 0x03, 0x33,
                0xac,
            ]
        };
        let (_, booleans) = run_method("()I", |_| code(4), vec![]);
        assert_eq!(returned(booleans), Value::Integer(1));
        let (_, bytes) = run_method("()I", |_| code(8), vec![]);
        assert_eq!(returned(bytes), Value::Integer(3));
    }

    #[test]
    fn negative_sizes_raise() {
        let (runtime, result) = run_method("()I", |_| vec![0x02, 0xbc, 10, 0xbe, 0xac], vec![]);
        assert_eq!(thrown_class(&runtime, result), NEGATIVE_ARRAY_SIZE_EXCEPTION);
    }

    #[test]
    fn huge_arrays_raise_out_of_memory_error() {
        // iload_0, newarray int, areturn
        let class = static_method_class("Huge", "(I)[I", vec![0x1a, 0xbc, 10, 0xb0]);
        let runtime = runtime_with(vec![class]);
        let mut state = VirtualMachineState::new();
        let args = vec![Value::Integer(i32::MAX)];
        let result = call(&runtime, &mut state, "Huge", "run", "(I)[I", args);
        assert_eq!(thrown_class(&runtime, result), OUT_OF_MEMORY_ERROR);

        // The outer dimension of a multi array is checked the same way.
        let (runtime, result) = run_method(
            "()Ljava/lang/Object;",
            |b| {
                let (ihi, ilo) = hi_lo(b.constant(ConstantPoolEntry::Integer(i32::MAX)));
                let (hi, lo) = hi_lo(b.class_ref("[[I"));
                vec![0x13, ihi, ilo, 0x03, 0xc5, hi, lo, 2, 0xb0]
            },
            vec![],
        );
        assert_eq!(thrown_class(&runtime, result), OUT_OF_MEMORY_ERROR);
    }

    #[test]
    fn multi_arrays_nest_their_dimensions() {
        let (runtime, result) = run_method(
            "()Ljava/lang/Object;",
            |b| {
                let (hi, lo) = hi_lo(b.class_ref("[[I"));
                vec![0x05, 0x06, 0xc5, hi, lo, 2, 0xb0]
            },
            vec![],
        );
        let Value::Array(outer) = returned(result) else {
            panic!("multianewarray did not push an array");
        };
        let heap = &runtime.jvm().heap;
        assert_eq!(heap.array_length(outer).unwrap(), 2);
        assert_eq!(heap.array_descriptor(outer).unwrap(), "[[I");
        let Some(Value::Array(inner)) = heap.array_load(outer, 1).unwrap() else {
            panic!("inner dimension missing");
        };
        assert_eq!(heap.array_length(inner).unwrap(), 3);
        assert_eq!(heap.array_load(inner, 2).unwrap(), Some(Value::Integer(0)));
    }

    #[test]
    fn aastore_checks_the_component_type() {
        // iconst_1, anewarray String, iconst_0, new Object, dup,
        // invokespecial Object.<init>, aastore, return
        let (runtime, result) = run_method(
            "()V",
            |b| {
                let (shi, slo) = hi_lo(b.class_ref(JAVA_LANG_STRING));
                let (ohi, olo) = hi_lo(b.class_ref(JAVA_LANG_OBJECT));
                let (ihi, ilo) = hi_lo(b.method_ref(JAVA_LANG_OBJECT, "<init>", "()V"));
                vec![0x04, 0xbd, shi, slo, 0x03, 0xbb, ohi, olo, 0x59, 0xb7, ihi, ilo, 0x53, 0xb1]
            },
            vec![],
        );
        assert_eq!(thrown_class(&runtime, result), ARRAY_STORE_EXCEPTION);
    }

    #[test]
    fn checkcast_failures_raise_class_cast_exception() {
        let (runtime, result) = run_method(
            "()V",
            |b| {
                let (ohi, olo) = hi_lo(b.class_ref(JAVA_LANG_OBJECT));
                let (shi, slo) = hi_lo(b.class_ref(JAVA_LANG_STRING));
                vec![0xbb, ohi, olo, 0xc0, shi, slo, 0x57, 0xb1]
            },
            vec![],
        );
        assert_eq!(
            detail_message(&runtime, result),
            "class java/lang/Object cannot be cast to class java/lang/String"
        );
    }

    #[test]
    fn instanceof_handles_null_and_arrays() {
        // aconst_null instanceof Object, then int[] instanceof Cloneable.
        let (_, result) = run_method(
            "()I",
            |b| {
                let (ohi, olo) = hi_lo(b.class_ref(JAVA_LANG_OBJECT));
                let (chi, clo) = hi_lo(b.class_ref(JAVA_LANG_CLONEABLE));
                vec![0x01, 0xc1, ohi, olo, 0x04, 0xbc, 10, 0xc1, chi, clo, 0x60, 0xac]
            },
            vec![],
        );
        assert_eq!(returned(result), Value::Integer(1));
    }

    #[test]
    fn array_assignability() {
        let classes = InMemoryClassLibrary::bootstrap().unwrap();
        assert!(is_assignable(&classes, "[Ljava/lang/String;", "[Ljava/lang/Object;"));
        assert!(is_assignable(&classes, "[[I", "[Ljava/lang/Object;"));
        assert!(is_assignable(&classes, "[I", JAVA_IO_SERIALIZABLE));
        assert!(!is_assignable(&classes, "[I", "[J"));
        assert!(!is_assignable(&classes, "[Ljava/lang/Object;", "[Ljava/lang/String;"));
        assert!(!is_assignable(&classes, JAVA_LANG_OBJECT, "[I"));
        assert!(is_assignable(&classes, ARITHMETIC_EXCEPTION, "java/lang/Throwable"));
    }

    #[test]
    fn athrow_of_null_raises_npe() {
        let (runtime, result) = run_method("()V", |_| vec![0x01, 0xbf], vec![]);
        assert_eq!(thrown_class(&runtime, result), NULL_POINTER_EXCEPTION);
    }

    #[test]
    fn new_rejects_interfaces() {
        let mut interface = ClassBuilder::new("Shape");
        interface.access_flags(ACC_PUBLIC | ACC_INTERFACE | ACC_ABSTRACT);
        let (runtime, result) = run_method(
            "()V",
            |b| {
                let (hi, lo) = hi_lo(b.class_ref("Shape"));
                vec![0xbb, hi, lo, 0x57, 0xb1]
            },
            vec![interface.build().unwrap()],
        );
        assert_eq!(thrown_class(&runtime, result), INSTANTIATION_ERROR);
    }

    #[test]
    fn monitors_balance_and_are_released_with_the_frame() {
        let mut builder = ClassBuilder::new("Test");
        builder
            // aload_0, monitorenter, aload_0, monitorenter, aload_0,
            // monitorexit, return: one entry is still held on return.
            .method(
                MethodBuilder::new("hold", "(Ljava/lang/Object;)V")
                    .access_flags(ACC_STATIC)
                    .code(vec![0x2a, 0xc2, 0x2a, 0xc2, 0x2a, 0xc3, 0xb1]),
            )
            .method(
                MethodBuilder::new("release", "(Ljava/lang/Object;)V")
                    .access_flags(ACC_STATIC)
                    .code(vec![0x2a, 0xc3, 0xb1]),
            );
        let runtime = runtime_with(vec![builder.build().unwrap()]);
        let classes = runtime.jvm().classes.as_ref();
        let object_class = classes.find_class(JAVA_LANG_OBJECT).unwrap();
        let object = runtime.jvm().heap.allocate_object(object_class, Vec::new()).unwrap();
        let monitor = runtime.jvm().heap.monitor(object).unwrap();

        let mut state = VirtualMachineState::new();
        let args = vec![Value::Object(object)];
        let result =
            call(&runtime, &mut state, "Test", "hold", "(Ljava/lang/Object;)V", args.clone());
        assert_eq!(result, Invocation::Returned(None));
        assert_eq!(monitor.entry_count(), 0);

        let result = call(&runtime, &mut state, "Test", "release", "(Ljava/lang/Object;)V", args);
        assert_eq!(thrown_class(&runtime, result), ILLEGAL_MONITOR_STATE_EXCEPTION);
    }
}
