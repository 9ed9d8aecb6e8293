//! Fixtures shared by the engine tests.
use std::sync::Arc;

use crate::config::EngineConfig;
use crate::jvm::{ClassLibrary, InMemoryClassLibrary, Jvm};
use crate::native::NativeRegistry;
use crate::program::{Class, ClassBuilder, MethodBuilder, ACC_STATIC};
use crate::runtime::{Invocation, Runtime};
use crate::state::VirtualMachineState;
use crate::value::Value;

/// Bootstrap library plus `classes`.
pub(crate) fn library_with(classes: Vec<Class>) -> Arc<InMemoryClassLibrary> {
    let library = Arc::new(InMemoryClassLibrary::bootstrap().unwrap());
    for class in classes {
        library.register(class);
    }
    library
}

pub(crate) fn runtime_with(classes: Vec<Class>) -> Runtime {
    runtime_with_config(EngineConfig::default(), classes)
}

pub(crate) fn runtime_with_config(config: EngineConfig, classes: Vec<Class>) -> Runtime {
    let jvm = Jvm::new(config).unwrap().with_classes(library_with(classes));
    Runtime::new(jvm)
}

pub(crate) fn runtime_with_natives(classes: Vec<Class>, natives: NativeRegistry) -> Runtime {
    let jvm = Jvm::new(EngineConfig::default())
        .unwrap()
        .with_classes(library_with(classes))
        .with_natives(Arc::new(natives));
    Runtime::new(jvm)
}

/// Class `name` with a single static method `run` made of `code`.
pub(crate) fn static_method_class(name: &str, descriptor: &str, code: Vec<u8>) -> Class {
    let mut builder = ClassBuilder::new(name);
    builder.method(
        MethodBuilder::new("run", descriptor)
            .access_flags(ACC_STATIC)
            .max_locals(8)
            .code(code),
    );
    builder.build().unwrap()
}

pub(crate) fn call(
    runtime: &Runtime,
    state: &mut VirtualMachineState,
    class: &str,
    name: &str,
    descriptor: &str,
    args: Vec<Value>,
) -> Invocation {
    let class = runtime.jvm().classes.find_class(class).unwrap();
    let method = class.get_method(name, descriptor).unwrap();
    runtime.execute_method(state, class, method, args).unwrap()
}

pub(crate) fn returned(invocation: Invocation) -> Value {
    match invocation {
        Invocation::Returned(Some(value)) => value,
        other => panic!("expected a return value, got {other:?}"),
    }
}

/// Name of the class of the exception `invocation` threw.
pub(crate) fn thrown_class(runtime: &Runtime, invocation: Invocation) -> String {
    match invocation {
        Invocation::Threw(exception) => runtime
            .jvm()
            .heap
            .class_of(exception)
            .unwrap()
            .name()
            .to_string(),
        other => panic!("expected an exception, got {other:?}"),
    }
}
