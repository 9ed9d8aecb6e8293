//! Bridge to methods implemented by the host.
//!
//! Native methods find their arguments on the caller's operand stack,
//! receiver first, exactly as the invoke instruction left them. They pop
//! what they consume and push their return value, if any.
use std::collections::HashMap;
use std::sync::Arc;

use tracing::error;

use crate::error::{Result, RuntimeError};
use crate::exceptions::{
    ARRAY_INDEX_OUT_OF_BOUNDS_EXCEPTION, ARRAY_STORE_EXCEPTION, NULL_POINTER_EXCEPTION,
};
use crate::heap::{ArrayType, ObjectRef};
use crate::objects::{component_name, is_assignable};
use crate::program::{Method, JAVA_LANG_CLASS};
use crate::runtime::Runtime;
use crate::state::VirtualMachineState;
use crate::value::Value;

pub type NativeFn =
    Arc<dyn Fn(&Runtime, &mut VirtualMachineState) -> Result<()> + Send + Sync>;

pub trait NativeBridge: Send + Sync {
    /// Runs the native implementation of `method`. Returns false, without
    /// touching the operand stack, when there is none.
    fn execute(
        &self,
        runtime: &Runtime,
        state: &mut VirtualMachineState,
        method: &Method,
    ) -> Result<bool>;
}

/// Native methods keyed by `class.name(descriptor)`.
#[derive(Default)]
pub struct NativeRegistry {
    functions: HashMap<String, NativeFn>,
}

impl NativeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with `Object.hashCode`, `Class.getName`, `System.arraycopy`
    /// and a `ThreadGroup.uncaughtException` that logs the exception.
    pub fn with_core_natives() -> Self {
        let mut registry = Self::new();
        registry.register("java/lang/Object", "hashCode", "()I", Arc::new(object_hash_code));
        registry.register(
            JAVA_LANG_CLASS,
            "getName",
            "()Ljava/lang/String;",
            Arc::new(class_get_name),
        );
        registry.register(
            "java/lang/System",
            "arraycopy",
            "(Ljava/lang/Object;ILjava/lang/Object;II)V",
            Arc::new(system_arraycopy),
        );
        registry.register(
            "java/lang/ThreadGroup",
            "uncaughtException",
            "(Ljava/lang/Thread;Ljava/lang/Throwable;)V",
            Arc::new(thread_group_uncaught_exception),
        );
        registry
    }

    pub fn register(&mut self, class: &str, name: &str, descriptor: &str, function: NativeFn) {
        self.functions
            .insert(format!("{class}.{name}{descriptor}"), function);
    }

    pub fn contains(&self, signature: &str) -> bool {
        self.functions.contains_key(signature)
    }
}

impl NativeBridge for NativeRegistry {
    fn execute(
        &self,
        runtime: &Runtime,
        state: &mut VirtualMachineState,
        method: &Method,
    ) -> Result<bool> {
        match self.functions.get(&method.signature()) {
            Some(function) => {
                function(runtime, state)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

// Identity hash. The handle index is stable for the object's lifetime and
// class objects live as long as their class.
fn object_hash_code(runtime: &Runtime, state: &mut VirtualMachineState) -> Result<()> {
    let hash = match state.pop_operand()? {
        Value::ClassRef(class) => Arc::as_ptr(&class) as usize as i32,
        other => match other.as_heap_ref()? {
            Some(r) => r.index() as i32,
            None => return runtime.throw_exception(state, NULL_POINTER_EXCEPTION),
        },
    };
    state.push_operand(Value::Integer(hash));
    Ok(())
}

// Binary name, `java.lang.String` for `java/lang/String`.
fn class_get_name(runtime: &Runtime, state: &mut VirtualMachineState) -> Result<()> {
    let name = match state.pop_operand()? {
        Value::ClassRef(class) => class.name().replace('/', "."),
        Value::Null => return runtime.throw_exception(state, NULL_POINTER_EXCEPTION),
        other => {
            return Err(RuntimeError::TypeMismatch {
                expected: "class",
                found: other.t().name(),
            })
        }
    };
    if let Some(string) = runtime.allocate(state, |_| runtime.new_string(&name))? {
        state.push_operand(Value::Object(string));
    }
    Ok(())
}

fn system_arraycopy(runtime: &Runtime, state: &mut VirtualMachineState) -> Result<()> {
    let length = state.pop_operand()?.as_int()?;
    let dest_pos = state.pop_operand()?.as_int()?;
    let dest = state.pop_operand()?.as_heap_ref()?;
    let src_pos = state.pop_operand()?.as_int()?;
    let src = state.pop_operand()?.as_heap_ref()?;
    let (Some(src), Some(dest)) = (src, dest) else {
        return runtime.throw_exception(state, NULL_POINTER_EXCEPTION);
    };
    copy_elements(runtime, state, (src, src_pos), (dest, dest_pos), length)
}

// Copies `length` elements between two (array, position) pairs. Reference
// elements that don't fit the destination stop the copy with an
// ArrayStoreException, the ones before them stay copied.
fn copy_elements(
    runtime: &Runtime,
    state: &mut VirtualMachineState,
    (src, src_pos): (ObjectRef, i32),
    (dest, dest_pos): (ObjectRef, i32),
    length: i32,
) -> Result<()> {
    let heap = &runtime.jvm().heap;
    if !heap.is_array(src)? || !heap.is_array(dest)? {
        return runtime.throw_exception(state, ARRAY_STORE_EXCEPTION);
    }
    let (src_type, src_descriptor) =
        heap.with_array(src, |a| Ok((a.element_type, a.descriptor.clone())))?;
    let (dest_type, dest_descriptor) =
        heap.with_array(dest, |a| Ok((a.element_type, a.descriptor.clone())))?;
    if src_type != dest_type {
        let message = format!("{src_descriptor} copied into {dest_descriptor}");
        return runtime.throw_exception_with_message(state, ARRAY_STORE_EXCEPTION, &message);
    }
    let src_len = heap.array_length(src)? as i64;
    let dest_len = heap.array_length(dest)? as i64;
    let (src_pos, dest_pos, length) = (src_pos as i64, dest_pos as i64, length as i64);
    if src_pos < 0
        || dest_pos < 0
        || length < 0
        || src_pos + length > src_len
        || dest_pos + length > dest_len
    {
        return runtime.throw_exception(state, ARRAY_INDEX_OUT_OF_BOUNDS_EXCEPTION);
    }
    let (src_pos, dest_pos, length) = (src_pos as usize, dest_pos as usize, length as usize);
    // Copy out first so overlapping ranges of the same array behave.
    let elements =
        heap.with_array(src, |a| Ok(a.elements[src_pos..src_pos + length].to_vec()))?;

    let classes = runtime.jvm().classes.as_ref();
    let mut rejected = None;
    if src_type == ArrayType::Reference
        && !is_assignable(classes, &src_descriptor, &dest_descriptor)
    {
        let component = &dest_descriptor[1..];
        let target = component_name(component).unwrap_or(component);
        for (index, element) in elements.iter().enumerate() {
            if element.is_null() {
                continue;
            }
            let source = runtime.runtime_type_name(element)?;
            if !is_assignable(classes, &source, target) {
                rejected = Some((index, source));
                break;
            }
        }
    }
    let copied = rejected.as_ref().map_or(length, |(index, _)| *index);
    heap.with_array_mut(dest, |a| {
        a.elements[dest_pos..dest_pos + copied].clone_from_slice(&elements[..copied]);
        Ok(())
    })?;
    match rejected {
        Some((_, source)) => {
            let message = format!("{source} stored into {dest_descriptor}");
            runtime.throw_exception_with_message(state, ARRAY_STORE_EXCEPTION, &message)
        }
        None => Ok(()),
    }
}

fn thread_group_uncaught_exception(
    runtime: &Runtime,
    state: &mut VirtualMachineState,
) -> Result<()> {
    let throwable = state.pop_operand()?.as_heap_ref()?;
    let _thread = state.pop_operand()?;
    let _group = state.pop_operand()?;
    let class = match throwable {
        Some(r) => runtime.jvm().heap.class_of(r)?.name().to_string(),
        None => "null".to_string(),
    };
    error!(exception = %class, "uncaught exception");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jvm::ClassLibrary;
    use crate::program::{ClassBuilder, MethodBuilder, ACC_STATIC};
    use crate::testing::{call, returned, runtime_with, thrown_class};

    const ARRAYCOPY_DESCRIPTOR: &str = "(Ljava/lang/Object;ILjava/lang/Object;II)V";

    // int[] a = {1, 2, 0, 0}; System.arraycopy(a, 0, a, 1, length);
    // return a[2];
    fn arraycopy_class(length: u8) -> crate::program::Class {
        let mut builder = ClassBuilder::new("Copy");
        let [hi, lo] = builder
            .method_ref("java/lang/System", "arraycopy", ARRAYCOPY_DESCRIPTOR)
            .to_be_bytes();
        builder.method(
            MethodBuilder::new("run", "()I")
                .access_flags(ACC_STATIC)
                .max_locals(1)
                .code(vec![
                    0x07, 0xbc, 10, 0x4b, // iconst_4, newarray int, astore_0
                    0x2a, 0x03, 0x04, 0x4f, // a[0] = 1
                    0x2a, 0x04, 0x05, 0x4f, // a[1] = 2
                    0x2a, 0x03, 0x2a, 0x04, 0x10, length, 0xb8, hi, lo, // arraycopy
                    0x2a, 0x05, 0x2e, 0xac, // return a[2]
                ]),
        );
        builder.build().unwrap()
    }

    #[test]
    fn arraycopy_handles_overlapping_ranges() {
        let runtime = runtime_with(vec![arraycopy_class(2)]);
        let mut state = VirtualMachineState::new();
        let result = call(&runtime, &mut state, "Copy", "run", "()I", vec![]);
        assert_eq!(returned(result), Value::Integer(2));
    }

    #[test]
    fn arraycopy_checks_bounds() {
        let runtime = runtime_with(vec![arraycopy_class(5)]);
        let mut state = VirtualMachineState::new();
        let result = call(&runtime, &mut state, "Copy", "run", "()I", vec![]);
        assert_eq!(thrown_class(&runtime, result), ARRAY_INDEX_OUT_OF_BOUNDS_EXCEPTION);
    }

    #[test]
    fn arraycopy_stops_at_the_first_incompatible_reference() {
        // System.arraycopy(objects, 0, strings, 0, 3)
        let mut builder = ClassBuilder::new("Copy");
        let [hi, lo] = builder
            .method_ref("java/lang/System", "arraycopy", ARRAYCOPY_DESCRIPTOR)
            .to_be_bytes();
        builder.method(
            MethodBuilder::new("run", "([Ljava/lang/Object;[Ljava/lang/String;)V")
                .access_flags(ACC_STATIC)
                .code(vec![0x2a, 0x03, 0x2b, 0x03, 0x06, 0xb8, hi, lo, 0xb1]),
        );
        let runtime = runtime_with(vec![builder.build().unwrap()]);
        let heap = &runtime.jvm().heap;
        let object_class = runtime.jvm().classes.find_class("java/lang/Object").unwrap();
        let text = runtime.new_string("text").unwrap();
        let object = heap.allocate_object(object_class, Vec::new()).unwrap();
        let objects = heap
            .allocate_array_from(
                ArrayType::Reference,
                "[Ljava/lang/Object;",
                vec![Value::Object(text), Value::Null, Value::Object(object)],
            )
            .unwrap();
        let strings = heap
            .allocate_array(ArrayType::Reference, "[Ljava/lang/String;", 3)
            .unwrap();

        let mut state = VirtualMachineState::new();
        let args = vec![Value::Array(objects), Value::Array(strings)];
        let descriptor = "([Ljava/lang/Object;[Ljava/lang/String;)V";
        let result = call(&runtime, &mut state, "Copy", "run", descriptor, args);
        assert_eq!(thrown_class(&runtime, result), ARRAY_STORE_EXCEPTION);
        assert_eq!(heap.array_load(strings, 0).unwrap(), Some(Value::Object(text)));
        assert_eq!(heap.array_load(strings, 2).unwrap(), Some(Value::Null));
    }

    #[test]
    fn class_names_use_dots() {
        // ldc_w class, invokevirtual Class.getName, areturn
        let mut builder = ClassBuilder::new("pkg/Named");
        let [chi, clo] = builder.class_ref("pkg/Named").to_be_bytes();
        let [hi, lo] = builder
            .method_ref(JAVA_LANG_CLASS, "getName", "()Ljava/lang/String;")
            .to_be_bytes();
        builder.method(
            MethodBuilder::new("run", "()Ljava/lang/String;")
                .access_flags(ACC_STATIC)
                .code(vec![0x13, chi, clo, 0xb6, hi, lo, 0xb0]),
        );
        let runtime = runtime_with(vec![builder.build().unwrap()]);
        let mut state = VirtualMachineState::new();
        let result = call(&runtime, &mut state, "pkg/Named", "run", "()Ljava/lang/String;", vec![]);
        let Value::Object(name) = returned(result) else {
            panic!("getName did not return a string");
        };
        let name = runtime.jvm().heap.read_string(name).unwrap();
        assert_eq!(name.as_deref(), Some("pkg.Named"));
    }

    #[test]
    fn hash_code_is_the_handle_index() {
        let runtime = runtime_with(vec![]);
        let classes = runtime.jvm().classes.as_ref();
        let class = classes.find_class("java/lang/Object").unwrap();
        let object = runtime.jvm().heap.allocate_object(class, Vec::new()).unwrap();
        let mut state = VirtualMachineState::new();
        let result = call(
            &runtime,
            &mut state,
            "java/lang/Object",
            "hashCode",
            "()I",
            vec![Value::Object(object)],
        );
        assert_eq!(returned(result), Value::Integer(object.index() as i32));
    }

    #[test]
    fn core_natives_are_registered_by_signature() {
        let registry = NativeRegistry::with_core_natives();
        assert!(registry.contains("java/lang/Object.hashCode()I"));
        assert!(registry.contains(&format!("java/lang/System.arraycopy{ARRAYCOPY_DESCRIPTOR}")));
        assert!(registry.contains("java/lang/Class.getName()Ljava/lang/String;"));
        assert!(!registry.contains("java/lang/Object.hashCode()J"));
    }
}
