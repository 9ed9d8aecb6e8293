//! Abstract representation of loaded Java classes.
//!
//! Parsing class files is the class loader's job, the interpreter only ever
//! sees the already decoded model below: constant pools with their symbolic
//! references spelled out, methods with their code and exception tables, and
//! fields holding their static values.
use std::sync::Arc;
use std::thread::{self, ThreadId};

use once_cell::sync::Lazy;
use parking_lot::{Condvar, Mutex};
use regex::Regex;

use crate::error::{Result, RuntimeError};
use crate::monitor::Monitor;
use crate::value::Value;

pub const ACC_PUBLIC: u16 = 0x0001;
pub const ACC_PRIVATE: u16 = 0x0002;
pub const ACC_PROTECTED: u16 = 0x0004;
pub const ACC_STATIC: u16 = 0x0008;
pub const ACC_FINAL: u16 = 0x0010;
pub const ACC_SUPER: u16 = 0x0020;
pub const ACC_SYNCHRONIZED: u16 = 0x0020;
pub const ACC_NATIVE: u16 = 0x0100;
pub const ACC_INTERFACE: u16 = 0x0200;
pub const ACC_ABSTRACT: u16 = 0x0400;

pub const JAVA_LANG_OBJECT: &str = "java/lang/Object";
pub const JAVA_LANG_CLASS: &str = "java/lang/Class";

/// Field and method descriptor base types.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum BaseTypeKind {
    Int,
    Long,
    Float,
    Double,
    Void,
    Byte,
    Char,
    Short,
    Boolean,
    Reference,
    Array,
}

/// JVM value type.
#[derive(Debug, Clone, PartialEq)]
pub struct Type {
    pub t: BaseTypeKind,
    // Element type for arrays.
    pub sub_t: Option<Box<Type>>,
    // Class name for object references, `java/lang/String` style.
    pub class_name: Option<String>,
}

impl Type {
    fn base(t: BaseTypeKind) -> Self {
        Self {
            t,
            sub_t: None,
            class_name: None,
        }
    }

    /// Returns the size in words of a given type.
    pub fn size(&self) -> usize {
        match self.t {
            BaseTypeKind::Long | BaseTypeKind::Double => 2,
            BaseTypeKind::Void => 0,
            _ => 1,
        }
    }

    pub fn is_reference(&self) -> bool {
        matches!(self.t, BaseTypeKind::Reference | BaseTypeKind::Array)
    }
}

/// Parse a field descriptor, returns the type and how many characters of
/// `descriptor` it spans.
pub fn decode_type(descriptor: &str) -> Result<(Type, usize)> {
    let invalid = || RuntimeError::InvalidDescriptor(descriptor.to_string());
    let first = descriptor.chars().next().ok_or_else(invalid)?;
    let t = match first {
        'I' => Type::base(BaseTypeKind::Int),
        'J' => Type::base(BaseTypeKind::Long),
        'F' => Type::base(BaseTypeKind::Float),
        'D' => Type::base(BaseTypeKind::Double),
        'V' => Type::base(BaseTypeKind::Void),
        'B' => Type::base(BaseTypeKind::Byte),
        'C' => Type::base(BaseTypeKind::Char),
        'S' => Type::base(BaseTypeKind::Short),
        'Z' => Type::base(BaseTypeKind::Boolean),
        'L' => {
            let end = descriptor.find(';').ok_or_else(invalid)?;
            let t = Type {
                t: BaseTypeKind::Reference,
                sub_t: None,
                class_name: Some(descriptor[1..end].to_string()),
            };
            return Ok((t, end + 1));
        }
        '[' => {
            let (element, length) = decode_type(&descriptor[1..])?;
            let t = Type {
                t: BaseTypeKind::Array,
                sub_t: Some(Box::new(element)),
                class_name: None,
            };
            return Ok((t, length + 1));
        }
        _ => return Err(invalid()),
    };
    Ok((t, 1))
}

static METHOD_DESCRIPTOR: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\(([^\)]*)\)(.+)$").expect("valid descriptor regex"));

/// Parse method types, returns a tuple of argument types and return type.
pub fn parse_method_types(descriptor: &str) -> Result<(Vec<Type>, Type)> {
    let invalid = || RuntimeError::InvalidDescriptor(descriptor.to_string());
    let caps = METHOD_DESCRIPTOR.captures(descriptor).ok_or_else(invalid)?;
    let arg_string = caps.get(1).map_or("", |m| m.as_str());
    let return_type_string = caps.get(2).map_or("", |m| m.as_str());

    let (ret_type, length) = decode_type(return_type_string)?;
    if length != return_type_string.len() {
        return Err(invalid());
    }

    let mut types = Vec::new();
    let mut rest = arg_string;
    while !rest.is_empty() {
        let (t, length) = decode_type(rest)?;
        if t.t == BaseTypeKind::Void {
            return Err(invalid());
        }
        types.push(t);
        rest = &rest[length..];
    }
    Ok((types, ret_type))
}

/// Symbolic reference to a field or method.
#[derive(Debug, Clone, PartialEq)]
pub struct MemberRef {
    pub class_name: String,
    pub name: String,
    pub descriptor: String,
}

/// Constant pool entries with their indirections already followed.
#[derive(Debug, Clone, PartialEq)]
pub enum ConstantPoolEntry {
    // Slot 0 and the second slot of long and double constants.
    Null,
    Utf8(String),
    Integer(i32),
    Float(f32),
    Long(i64),
    Double(f64),
    Class(String),
    String(String),
    FieldRef(MemberRef),
    MethodRef(MemberRef),
    InterfaceMethodRef(MemberRef),
    NameAndType { name: String, descriptor: String },
    MethodHandle { kind: u8, reference: u16 },
    MethodType(String),
    InvokeDynamic { bootstrap: u16, name: String, descriptor: String },
}

impl ConstantPoolEntry {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Null => "null entry",
            Self::Utf8(_) => "utf8",
            Self::Integer(_) => "integer",
            Self::Float(_) => "float",
            Self::Long(_) => "long",
            Self::Double(_) => "double",
            Self::Class(_) => "class reference",
            Self::String(_) => "string",
            Self::FieldRef(_) => "field reference",
            Self::MethodRef(_) => "method reference",
            Self::InterfaceMethodRef(_) => "interface method reference",
            Self::NameAndType { .. } => "name and type",
            Self::MethodHandle { .. } => "method handle",
            Self::MethodType(_) => "method type",
            Self::InvokeDynamic { .. } => "invokedynamic",
        }
    }
}

/// One row of a method's exception table. The range is `[start_pc, end_pc)`
/// and a missing catch type catches everything (`finally` blocks).
#[derive(Debug, Clone, PartialEq)]
pub struct ExceptionTableEntry {
    pub start_pc: u16,
    pub end_pc: u16,
    pub handler_pc: u16,
    pub catch_type: Option<String>,
}

impl ExceptionTableEntry {
    pub fn new(start_pc: u16, end_pc: u16, handler_pc: u16, catch_type: Option<&str>) -> Self {
        Self {
            start_pc,
            end_pc,
            handler_pc,
            catch_type: catch_type.map(str::to_string),
        }
    }

    pub fn covers(&self, pc: usize) -> bool {
        (self.start_pc as usize) <= pc && pc < (self.end_pc as usize)
    }
}

/// Java class method representation for the interpreter.
#[derive(Debug)]
pub struct Method {
    pub name: String,
    pub descriptor: String,
    pub access_flags: u16,
    // Declaring class.
    pub class_name: String,
    return_type: Type,
    arg_types: Vec<Type>,
    pub max_stack: u16,
    pub max_locals: u16,
    pub code: Vec<u8>,
    pub exception_table: Vec<ExceptionTableEntry>,
}

impl Method {
    pub fn is_static(&self) -> bool {
        self.access_flags & ACC_STATIC != 0
    }

    pub fn is_native(&self) -> bool {
        self.access_flags & ACC_NATIVE != 0
    }

    pub fn is_abstract(&self) -> bool {
        self.access_flags & ACC_ABSTRACT != 0
    }

    pub fn is_synchronized(&self) -> bool {
        self.access_flags & ACC_SYNCHRONIZED != 0
    }

    pub fn is_private(&self) -> bool {
        self.access_flags & ACC_PRIVATE != 0
    }

    pub fn is_initialiser(&self) -> bool {
        self.name == "<init>"
    }

    pub fn arg_types(&self) -> &[Type] {
        &self.arg_types
    }

    pub fn return_type(&self) -> &Type {
        &self.return_type
    }

    /// Number of operand stack values the caller passes, `this` included.
    pub fn arg_count(&self) -> usize {
        self.arg_types.len() + usize::from(!self.is_static())
    }

    /// Number of local variable slots the arguments occupy, `this` included.
    pub fn arg_slots(&self) -> usize {
        self.arg_types.iter().map(Type::size).sum::<usize>() + usize::from(!self.is_static())
    }

    /// Full `Class.name(descriptor)` signature, used in logs and native
    /// lookups.
    pub fn signature(&self) -> String {
        format!("{}.{}{}", self.class_name, self.name, self.descriptor)
    }
}

/// Java class field. Static fields carry their value here, instance fields
/// live in the heap objects.
#[derive(Debug)]
pub struct Field {
    pub name: String,
    pub descriptor: String,
    pub access_flags: u16,
    pub class_name: String,
    field_type: Type,
    static_value: Mutex<Value>,
}

impl Field {
    pub fn new(class_name: &str, name: &str, descriptor: &str, access_flags: u16) -> Result<Self> {
        let (field_type, length) = decode_type(descriptor)?;
        if length != descriptor.len() || field_type.t == BaseTypeKind::Void {
            return Err(RuntimeError::InvalidDescriptor(descriptor.to_string()));
        }
        Ok(Self {
            name: name.to_string(),
            descriptor: descriptor.to_string(),
            access_flags,
            class_name: class_name.to_string(),
            static_value: Mutex::new(Value::default_for(&field_type)),
            field_type,
        })
    }

    pub fn is_static(&self) -> bool {
        self.access_flags & ACC_STATIC != 0
    }

    pub fn field_type(&self) -> &Type {
        &self.field_type
    }

    pub fn static_value(&self) -> Value {
        self.static_value.lock().clone()
    }

    pub fn set_static_value(&self, value: Value) {
        *self.static_value.lock() = value;
    }
}

/// Initialisation status of a class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitState {
    Uninitialised,
    // `<clinit>` is running on this thread.
    Initialising(ThreadId),
    Initialised,
    // `<clinit>` threw, every later use fails.
    Erroneous,
}

/// What `Class::begin_initialisation` asks the caller to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitAction {
    /// The caller owns the initialisation and must finish it.
    Run,
    /// Nothing left to do, the class is initialised or the current thread is
    /// already initialising it further down its own call chain.
    Ready,
    /// A previous initialisation failed.
    Failed,
}

/// A loaded class: constant pool, members and runtime state (initialisation
/// status and the class monitor used by static synchronized methods).
#[derive(Debug)]
pub struct Class {
    name: String,
    super_class: Option<String>,
    interfaces: Vec<String>,
    access_flags: u16,
    constant_pool: Vec<ConstantPoolEntry>,
    methods: Vec<Arc<Method>>,
    fields: Vec<Arc<Field>>,
    init_state: Mutex<InitState>,
    init_done: Condvar,
    monitor: Arc<Monitor>,
}

impl Class {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn super_class(&self) -> Option<&str> {
        self.super_class.as_deref()
    }

    pub fn interfaces(&self) -> &[String] {
        &self.interfaces
    }

    pub fn access_flags(&self) -> u16 {
        self.access_flags
    }

    pub fn is_interface(&self) -> bool {
        self.access_flags & ACC_INTERFACE != 0
    }

    pub fn has_super_flag(&self) -> bool {
        self.access_flags & ACC_SUPER != 0
    }

    pub fn monitor(&self) -> &Arc<Monitor> {
        &self.monitor
    }

    pub fn methods(&self) -> &[Arc<Method>] {
        &self.methods
    }

    pub fn fields(&self) -> &[Arc<Field>] {
        &self.fields
    }

    /// Returns the constant pool entry at `index`.
    pub fn constant(&self, index: u16) -> Result<&ConstantPoolEntry> {
        self.constant_pool
            .get(index as usize)
            .ok_or(RuntimeError::InvalidConstant {
                index,
                expected: "valid constant pool index",
            })
    }

    /// Method declared directly on this class.
    pub fn get_method(&self, name: &str, descriptor: &str) -> Option<Arc<Method>> {
        self.methods
            .iter()
            .find(|m| m.name == name && m.descriptor == descriptor)
            .cloned()
    }

    /// Field declared directly on this class.
    pub fn get_field(&self, name: &str) -> Option<Arc<Field>> {
        self.fields.iter().find(|f| f.name == name).cloned()
    }

    pub fn init_state(&self) -> InitState {
        *self.init_state.lock()
    }

    pub fn is_initialised(&self) -> bool {
        self.init_state() == InitState::Initialised
    }

    /// Claims the initialisation of this class for the current thread. Blocks
    /// while another thread is running the initialiser.
    pub fn begin_initialisation(&self) -> InitAction {
        let me = thread::current().id();
        let mut state = self.init_state.lock();
        loop {
            match *state {
                InitState::Uninitialised => {
                    *state = InitState::Initialising(me);
                    return InitAction::Run;
                }
                InitState::Initialising(owner) if owner == me => return InitAction::Ready,
                InitState::Initialising(_) => self.init_done.wait(&mut state),
                InitState::Initialised => return InitAction::Ready,
                InitState::Erroneous => return InitAction::Failed,
            }
        }
    }

    /// Publishes the outcome of an initialisation started with
    /// `begin_initialisation` and wakes the threads waiting for it.
    pub fn finish_initialisation(&self, succeeded: bool) {
        let mut state = self.init_state.lock();
        *state = match succeeded {
            true => InitState::Initialised,
            false => InitState::Erroneous,
        };
        self.init_done.notify_all();
    }
}

/// Assembles `Class` values by hand, for hosts that synthesise classes and
/// for tests.
#[derive(Debug)]
pub struct ClassBuilder {
    name: String,
    super_class: Option<String>,
    interfaces: Vec<String>,
    access_flags: u16,
    constant_pool: Vec<ConstantPoolEntry>,
    methods: Vec<MethodBuilder>,
    fields: Vec<(String, String, u16)>,
}

impl ClassBuilder {
    pub fn new(name: &str) -> Self {
        let super_class = (name != JAVA_LANG_OBJECT).then(|| JAVA_LANG_OBJECT.to_string());
        Self {
            name: name.to_string(),
            super_class,
            interfaces: Vec::new(),
            access_flags: ACC_PUBLIC | ACC_SUPER,
            constant_pool: vec![ConstantPoolEntry::Null],
            methods: Vec::new(),
            fields: Vec::new(),
        }
    }

    pub fn super_class(&mut self, name: &str) -> &mut Self {
        self.super_class = Some(name.to_string());
        self
    }

    pub fn interface(&mut self, name: &str) -> &mut Self {
        self.interfaces.push(name.to_string());
        self
    }

    pub fn access_flags(&mut self, flags: u16) -> &mut Self {
        self.access_flags = flags;
        self
    }

    pub fn field(&mut self, name: &str, descriptor: &str, access_flags: u16) -> &mut Self {
        self.fields
            .push((name.to_string(), descriptor.to_string(), access_flags));
        self
    }

    pub fn method(&mut self, method: MethodBuilder) -> &mut Self {
        self.methods.push(method);
        self
    }

    /// Adds a constant, reusing an identical existing entry. Returns its
    /// index.
    pub fn constant(&mut self, entry: ConstantPoolEntry) -> u16 {
        if let Some(index) = self.constant_pool.iter().position(|e| *e == entry) {
            if index != 0 {
                return index as u16;
            }
        }
        let wide = matches!(entry, ConstantPoolEntry::Long(_) | ConstantPoolEntry::Double(_));
        self.constant_pool.push(entry);
        let index = self.constant_pool.len() - 1;
        // Long and double constants take two entries.
        if wide {
            self.constant_pool.push(ConstantPoolEntry::Null);
        }
        index as u16
    }

    pub fn class_ref(&mut self, name: &str) -> u16 {
        self.constant(ConstantPoolEntry::Class(name.to_string()))
    }

    pub fn string(&mut self, text: &str) -> u16 {
        self.constant(ConstantPoolEntry::String(text.to_string()))
    }

    pub fn field_ref(&mut self, class: &str, name: &str, descriptor: &str) -> u16 {
        self.constant(ConstantPoolEntry::FieldRef(member(class, name, descriptor)))
    }

    pub fn method_ref(&mut self, class: &str, name: &str, descriptor: &str) -> u16 {
        self.constant(ConstantPoolEntry::MethodRef(member(class, name, descriptor)))
    }

    pub fn interface_method_ref(&mut self, class: &str, name: &str, descriptor: &str) -> u16 {
        self.constant(ConstantPoolEntry::InterfaceMethodRef(member(
            class, name, descriptor,
        )))
    }

    pub fn build(self) -> Result<Class> {
        let methods = self
            .methods
            .into_iter()
            .map(|m| m.build(&self.name).map(Arc::new))
            .collect::<Result<Vec<_>>>()?;
        let fields = self
            .fields
            .iter()
            .map(|(name, descriptor, flags)| {
                Field::new(&self.name, name, descriptor, *flags).map(Arc::new)
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Class {
            name: self.name,
            super_class: self.super_class,
            interfaces: self.interfaces,
            access_flags: self.access_flags,
            constant_pool: self.constant_pool,
            methods,
            fields,
            init_state: Mutex::new(InitState::Uninitialised),
            init_done: Condvar::new(),
            monitor: Arc::new(Monitor::new()),
        })
    }
}

fn member(class: &str, name: &str, descriptor: &str) -> MemberRef {
    MemberRef {
        class_name: class.to_string(),
        name: name.to_string(),
        descriptor: descriptor.to_string(),
    }
}

/// Builder for a single method, consumed by `ClassBuilder::method`.
#[derive(Debug, Clone)]
pub struct MethodBuilder {
    name: String,
    descriptor: String,
    access_flags: u16,
    max_stack: u16,
    max_locals: Option<u16>,
    code: Vec<u8>,
    exception_table: Vec<ExceptionTableEntry>,
}

impl MethodBuilder {
    pub fn new(name: &str, descriptor: &str) -> Self {
        Self {
            name: name.to_string(),
            descriptor: descriptor.to_string(),
            access_flags: ACC_PUBLIC,
            max_stack: 16,
            max_locals: None,
            code: Vec::new(),
            exception_table: Vec::new(),
        }
    }

    pub fn access_flags(mut self, flags: u16) -> Self {
        self.access_flags = flags;
        self
    }

    pub fn max_stack(mut self, max_stack: u16) -> Self {
        self.max_stack = max_stack;
        self
    }

    pub fn max_locals(mut self, max_locals: u16) -> Self {
        self.max_locals = Some(max_locals);
        self
    }

    pub fn code(mut self, code: Vec<u8>) -> Self {
        self.code = code;
        self
    }

    pub fn exception(mut self, entry: ExceptionTableEntry) -> Self {
        self.exception_table.push(entry);
        self
    }

    pub fn build(self, class_name: &str) -> Result<Method> {
        let (arg_types, return_type) = parse_method_types(&self.descriptor)?;
        let mut method = Method {
            name: self.name,
            descriptor: self.descriptor,
            access_flags: self.access_flags,
            class_name: class_name.to_string(),
            return_type,
            arg_types,
            max_stack: self.max_stack,
            max_locals: 0,
            code: self.code,
            exception_table: self.exception_table,
        };
        // Locals default to just what the arguments need.
        method.max_locals = self
            .max_locals
            .unwrap_or(method.arg_slots() as u16)
            .max(method.arg_slots() as u16);
        Ok(method)
    }
}
