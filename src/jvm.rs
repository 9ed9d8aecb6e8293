//! VM context shared by the execution engine and its collaborators.
//!
//! `Jvm` bundles the class library, the heap, the collector, the native
//! bridge and the configuration. It is built once by the host and borrowed
//! by the engine, there is no global registry.
use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

use crate::config::EngineConfig;
use crate::error::Result;
use crate::gc::{GarbageCollector, NoopCollector};
use crate::heap::Heap;
use crate::native::{NativeBridge, NativeRegistry};
use crate::program::{
    Class, ClassBuilder, MethodBuilder, ACC_ABSTRACT, ACC_INTERFACE, ACC_NATIVE, ACC_PUBLIC,
    ACC_STATIC, JAVA_LANG_CLASS, JAVA_LANG_OBJECT,
};

/// Source of loaded classes. Implementations must be safe to share between
/// interpreter threads.
pub trait ClassLibrary: Send + Sync {
    fn find_class(&self, name: &str) -> Option<Arc<Class>>;
}

/// Class library backed by a map of already built classes.
#[derive(Debug, Default)]
pub struct InMemoryClassLibrary {
    classes: RwLock<HashMap<String, Arc<Class>>>,
}

impl InMemoryClassLibrary {
    pub fn new() -> Self {
        Self::default()
    }

    /// Library pre-populated with the `java/lang` classes the engine relies
    /// on: `Object`, `String`, the throwable hierarchy and the exceptions
    /// raised by the interpreter itself.
    pub fn bootstrap() -> Result<Self> {
        let library = Self::new();
        for class in core_classes()? {
            library.register(class);
        }
        Ok(library)
    }

    pub fn register(&self, class: Class) -> Arc<Class> {
        let class = Arc::new(class);
        debug!(class = class.name(), "registered class");
        self.classes
            .write()
            .insert(class.name().to_string(), Arc::clone(&class));
        class
    }

    pub fn len(&self) -> usize {
        self.classes.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ClassLibrary for InMemoryClassLibrary {
    fn find_class(&self, name: &str) -> Option<Arc<Class>> {
        self.classes.read().get(name).cloned()
    }
}

// Superclass of every throwable raised by the engine, in registration order.
const CORE_THROWABLES: &[(&str, &str)] = &[
    ("java/lang/Throwable", JAVA_LANG_OBJECT),
    ("java/lang/Exception", "java/lang/Throwable"),
    ("java/lang/Error", "java/lang/Throwable"),
    ("java/lang/RuntimeException", "java/lang/Exception"),
    ("java/lang/ReflectiveOperationException", "java/lang/Exception"),
    ("java/lang/ClassNotFoundException", "java/lang/ReflectiveOperationException"),
    ("java/lang/ArithmeticException", "java/lang/RuntimeException"),
    ("java/lang/ArrayStoreException", "java/lang/RuntimeException"),
    ("java/lang/ClassCastException", "java/lang/RuntimeException"),
    ("java/lang/IllegalMonitorStateException", "java/lang/RuntimeException"),
    ("java/lang/IndexOutOfBoundsException", "java/lang/RuntimeException"),
    ("java/lang/ArrayIndexOutOfBoundsException", "java/lang/IndexOutOfBoundsException"),
    ("java/lang/NegativeArraySizeException", "java/lang/RuntimeException"),
    ("java/lang/NullPointerException", "java/lang/RuntimeException"),
    ("java/lang/LinkageError", "java/lang/Error"),
    ("java/lang/NoClassDefFoundError", "java/lang/LinkageError"),
    ("java/lang/UnsatisfiedLinkError", "java/lang/LinkageError"),
    ("java/lang/IncompatibleClassChangeError", "java/lang/LinkageError"),
    ("java/lang/AbstractMethodError", "java/lang/IncompatibleClassChangeError"),
    ("java/lang/IllegalAccessError", "java/lang/IncompatibleClassChangeError"),
    ("java/lang/InstantiationError", "java/lang/IncompatibleClassChangeError"),
    ("java/lang/NoSuchFieldError", "java/lang/IncompatibleClassChangeError"),
    ("java/lang/NoSuchMethodError", "java/lang/IncompatibleClassChangeError"),
    ("java/lang/VirtualMachineError", "java/lang/Error"),
    ("java/lang/OutOfMemoryError", "java/lang/VirtualMachineError"),
    ("java/lang/StackOverflowError", "java/lang/VirtualMachineError"),
];

// aload_0, invokespecial #n, return
fn delegating_init(builder: &mut ClassBuilder, super_class: &str) -> MethodBuilder {
    let init = builder.method_ref(super_class, "<init>", "()V");
    let [hi, lo] = init.to_be_bytes();
    MethodBuilder::new("<init>", "()V").code(vec![0x2a, 0xb7, hi, lo, 0xb1])
}

fn core_classes() -> Result<Vec<Class>> {
    let mut classes = Vec::new();

    let mut object = ClassBuilder::new(JAVA_LANG_OBJECT);
    object
        .method(MethodBuilder::new("<init>", "()V").code(vec![0xb1]))
        .method(MethodBuilder::new("hashCode", "()I").access_flags(ACC_PUBLIC | ACC_NATIVE));
    classes.push(object.build()?);

    for name in ["java/lang/Cloneable", "java/io/Serializable"] {
        let mut interface = ClassBuilder::new(name);
        interface.access_flags(ACC_PUBLIC | ACC_INTERFACE | ACC_ABSTRACT);
        classes.push(interface.build()?);
    }

    let mut class = ClassBuilder::new(JAVA_LANG_CLASS);
    class.interface("java/io/Serializable").method(
        MethodBuilder::new("getName", "()Ljava/lang/String;").access_flags(ACC_PUBLIC | ACC_NATIVE),
    );
    classes.push(class.build()?);

    let mut string = ClassBuilder::new("java/lang/String");
    string.interface("java/io/Serializable").field("value", "[C", 0);
    classes.push(string.build()?);

    let mut system = ClassBuilder::new("java/lang/System");
    system.method(
        MethodBuilder::new("arraycopy", "(Ljava/lang/Object;ILjava/lang/Object;II)V")
            .access_flags(ACC_PUBLIC | ACC_STATIC | ACC_NATIVE),
    );
    classes.push(system.build()?);

    let mut thread_group = ClassBuilder::new("java/lang/ThreadGroup");
    thread_group.method(
        MethodBuilder::new("uncaughtException", "(Ljava/lang/Thread;Ljava/lang/Throwable;)V")
            .access_flags(ACC_PUBLIC | ACC_NATIVE),
    );
    classes.push(thread_group.build()?);

    let mut thread = ClassBuilder::new("java/lang/Thread");
    thread
        .field("group", "Ljava/lang/ThreadGroup;", 0)
        .field("name", "Ljava/lang/String;", 0);
    classes.push(thread.build()?);

    for (name, super_class) in CORE_THROWABLES {
        let mut throwable = ClassBuilder::new(name);
        throwable.super_class(super_class);
        if *name == "java/lang/Throwable" {
            throwable.field("detailMessage", "Ljava/lang/String;", 0);
        }
        let init = delegating_init(&mut throwable, super_class);
        throwable.method(init);
        classes.push(throwable.build()?);
    }
    Ok(classes)
}

/// VM context passed to the execution engine.
pub struct Jvm {
    pub classes: Arc<dyn ClassLibrary>,
    pub heap: Arc<Heap>,
    pub gc: Arc<dyn GarbageCollector>,
    pub natives: Arc<dyn NativeBridge>,
    pub config: EngineConfig,
}

impl Jvm {
    /// Context with the bootstrap class library, a heap sized from
    /// `config`, no collector and the core natives.
    pub fn new(config: EngineConfig) -> Result<Self> {
        Ok(Self {
            classes: Arc::new(InMemoryClassLibrary::bootstrap()?),
            heap: Arc::new(
                Heap::new(config.heap_capacity).with_max_array_length(config.max_array_length),
            ),
            gc: Arc::new(NoopCollector),
            natives: Arc::new(NativeRegistry::with_core_natives()),
            config,
        })
    }

    pub fn with_classes(mut self, classes: Arc<dyn ClassLibrary>) -> Self {
        self.classes = classes;
        self
    }

    pub fn with_gc(mut self, gc: Arc<dyn GarbageCollector>) -> Self {
        self.gc = gc;
        self
    }

    pub fn with_natives(mut self, natives: Arc<dyn NativeBridge>) -> Self {
        self.natives = natives;
        self
    }
}
