//! Object heap.
//!
//! Objects and arrays live in an arena owned by the heap and are addressed by
//! `ObjectRef` handles. The interpreter copies handles around freely but never
//! owns the storage behind them, reclaiming it is up to the collector.
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

use crate::error::{Result, RuntimeError};
use crate::monitor::Monitor;
use crate::program::{Class, Field};
use crate::value::Value;

/// Handle to an object or array stored in the heap.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct ObjectRef(u32);

impl ObjectRef {
    pub fn index(&self) -> usize {
        self.0 as usize
    }
}

/// Element type of an array, numbered like the `atype` operand of
/// `newarray` for the primitive ones.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ArrayType {
    Boolean,
    Char,
    Float,
    Double,
    Byte,
    Short,
    Int,
    Long,
    Reference,
}

impl ArrayType {
    /// Decodes the `atype` operand of `newarray`.
    pub fn from_atype(atype: u8) -> Option<Self> {
        match atype {
            4 => Some(Self::Boolean),
            5 => Some(Self::Char),
            6 => Some(Self::Float),
            7 => Some(Self::Double),
            8 => Some(Self::Byte),
            9 => Some(Self::Short),
            10 => Some(Self::Int),
            11 => Some(Self::Long),
            _ => None,
        }
    }

    /// Array type for an element descriptor such as `I` or `Ljava/lang/Object;`.
    pub fn from_descriptor(descriptor: &str) -> Self {
        match descriptor.as_bytes().first() {
            Some(b'Z') => Self::Boolean,
            Some(b'C') => Self::Char,
            Some(b'F') => Self::Float,
            Some(b'D') => Self::Double,
            Some(b'B') => Self::Byte,
            Some(b'S') => Self::Short,
            Some(b'I') => Self::Int,
            Some(b'J') => Self::Long,
            _ => Self::Reference,
        }
    }

    pub const fn descriptor(&self) -> &'static str {
        match self {
            Self::Boolean => "Z",
            Self::Char => "C",
            Self::Float => "F",
            Self::Double => "D",
            Self::Byte => "B",
            Self::Short => "S",
            Self::Int => "I",
            Self::Long => "J",
            Self::Reference => "Ljava/lang/Object;",
        }
    }

    pub fn default_value(&self) -> Value {
        match self {
            Self::Boolean => Value::Bool(false),
            Self::Char => Value::Char(0),
            Self::Float => Value::Float(0.0),
            Self::Double => Value::Double(0.0),
            Self::Byte => Value::Byte(0),
            Self::Short => Value::Short(0),
            Self::Int => Value::Integer(0),
            Self::Long => Value::Long(0),
            Self::Reference => Value::Null,
        }
    }
}

/// Instance of a class.
#[derive(Debug)]
pub struct JavaObject {
    class: Arc<Class>,
    fields: Vec<(Arc<Field>, Value)>,
}

impl JavaObject {
    pub fn class(&self) -> &Arc<Class> {
        &self.class
    }

    fn slot(&self, field: &Field) -> Option<usize> {
        self.fields.iter().position(|(f, _)| {
            std::ptr::eq(f.as_ref(), field)
                || (f.name == field.name && f.class_name == field.class_name)
        })
    }
}

/// Array instance. `descriptor` is the array's own type, `[I` or
/// `[Ljava/lang/String;`.
#[derive(Debug)]
pub struct JavaArray {
    pub descriptor: String,
    pub element_type: ArrayType,
    pub elements: Vec<Value>,
}

#[derive(Debug)]
enum HeapEntry {
    Object(JavaObject),
    Array(JavaArray),
}

#[derive(Debug)]
struct Slot {
    entry: HeapEntry,
    monitor: Arc<Monitor>,
}

#[derive(Debug, Default)]
struct HeapInner {
    slots: Vec<Option<Slot>>,
    free: Vec<u32>,
    live: usize,
}

/// Arena of objects and arrays shared by every thread of the VM.
#[derive(Debug, Default)]
pub struct Heap {
    inner: RwLock<HeapInner>,
    // Maximum number of live entries, unbounded if `None`.
    capacity: Option<usize>,
    // Longest array a single allocation may ask for, unbounded if `None`.
    max_array_length: Option<usize>,
}

impl Heap {
    pub fn new(capacity: Option<usize>) -> Self {
        Self {
            inner: RwLock::new(HeapInner::default()),
            capacity,
            max_array_length: None,
        }
    }

    pub fn with_max_array_length(mut self, limit: Option<usize>) -> Self {
        self.max_array_length = limit;
        self
    }

    /// Number of live objects and arrays.
    pub fn len(&self) -> usize {
        self.inner.read().live
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn insert(&self, entry: HeapEntry, reserved: bool) -> Result<ObjectRef> {
        let mut inner = self.inner.write();
        if let Some(capacity) = self.capacity {
            if !reserved && inner.live >= capacity {
                debug!(capacity, "heap exhausted");
                return Err(RuntimeError::OutOfMemory { capacity });
            }
        }
        let slot = Slot {
            entry,
            monitor: Arc::new(Monitor::new()),
        };
        inner.live += 1;
        let index = match inner.free.pop() {
            Some(index) => {
                inner.slots[index as usize] = Some(slot);
                index
            }
            None => {
                inner.slots.push(Some(slot));
                (inner.slots.len() - 1) as u32
            }
        };
        Ok(ObjectRef(index))
    }

    /// Allocates an instance of `class` with the given instance fields set to
    /// their default values.
    pub fn allocate_object(
        &self,
        class: Arc<Class>,
        fields: Vec<Arc<Field>>,
    ) -> Result<ObjectRef> {
        self.allocate_object_inner(class, fields, false)
    }

    /// Same as `allocate_object` but ignores the heap capacity. Used to
    /// materialise `OutOfMemoryError` itself.
    pub fn allocate_reserved_object(
        &self,
        class: Arc<Class>,
        fields: Vec<Arc<Field>>,
    ) -> Result<ObjectRef> {
        self.allocate_object_inner(class, fields, true)
    }

    fn allocate_object_inner(
        &self,
        class: Arc<Class>,
        fields: Vec<Arc<Field>>,
        reserved: bool,
    ) -> Result<ObjectRef> {
        let fields = fields
            .into_iter()
            .map(|f| {
                let value = Value::default_for(f.field_type());
                (f, value)
            })
            .collect();
        self.insert(HeapEntry::Object(JavaObject { class, fields }), reserved)
    }

    /// Allocates an array of `length` default elements. Lengths over the
    /// limit, or that the allocator refuses, fail with `ArrayAllocation`
    /// before any element is built.
    pub fn allocate_array(
        &self,
        element_type: ArrayType,
        descriptor: &str,
        length: usize,
    ) -> Result<ObjectRef> {
        let mut elements = self.reserve_elements(length)?;
        elements.resize(length, element_type.default_value());
        let array = JavaArray {
            descriptor: descriptor.to_string(),
            element_type,
            elements,
        };
        self.insert(HeapEntry::Array(array), false)
    }

    /// Empty backing store with room for `length` elements.
    pub fn reserve_elements(&self, length: usize) -> Result<Vec<Value>> {
        if let Some(limit) = self.max_array_length.filter(|limit| length > *limit) {
            debug!(length, limit, "array too long");
            return Err(RuntimeError::ArrayAllocation { length });
        }
        let mut elements = Vec::new();
        elements
            .try_reserve_exact(length)
            .map_err(|_| RuntimeError::ArrayAllocation { length })?;
        Ok(elements)
    }

    /// Allocates an array initialised with `elements`.
    pub fn allocate_array_from(
        &self,
        element_type: ArrayType,
        descriptor: &str,
        elements: Vec<Value>,
    ) -> Result<ObjectRef> {
        let array = JavaArray {
            descriptor: descriptor.to_string(),
            element_type,
            elements,
        };
        self.insert(HeapEntry::Array(array), false)
    }

    /// Drops the entry behind `r`, the handle must not be used afterwards.
    pub fn free(&self, r: ObjectRef) -> Result<()> {
        let mut inner = self.inner.write();
        match inner.slots.get_mut(r.index()) {
            Some(slot @ Some(_)) => {
                *slot = None;
                inner.live -= 1;
                inner.free.push(r.0);
                Ok(())
            }
            _ => Err(RuntimeError::InvalidHandle(r.0)),
        }
    }

    fn with_entry<T>(&self, r: ObjectRef, f: impl FnOnce(&Slot) -> Result<T>) -> Result<T> {
        let inner = self.inner.read();
        match inner.slots.get(r.index()) {
            Some(Some(slot)) => f(slot),
            _ => Err(RuntimeError::InvalidHandle(r.0)),
        }
    }

    fn with_entry_mut<T>(
        &self,
        r: ObjectRef,
        f: impl FnOnce(&mut Slot) -> Result<T>,
    ) -> Result<T> {
        let mut inner = self.inner.write();
        match inner.slots.get_mut(r.index()) {
            Some(Some(slot)) => f(slot),
            _ => Err(RuntimeError::InvalidHandle(r.0)),
        }
    }

    pub fn is_array(&self, r: ObjectRef) -> Result<bool> {
        self.with_entry(r, |slot| Ok(matches!(slot.entry, HeapEntry::Array(_))))
    }

    /// Runtime class of an object.
    pub fn class_of(&self, r: ObjectRef) -> Result<Arc<Class>> {
        self.with_entry(r, |slot| match &slot.entry {
            HeapEntry::Object(obj) => Ok(Arc::clone(obj.class())),
            HeapEntry::Array(_) => Err(RuntimeError::TypeMismatch {
                expected: "object",
                found: "array",
            }),
        })
    }

    /// Monitor of an object or array. The monitor is handed out so callers
    /// can block on it without holding the heap lock.
    pub fn monitor(&self, r: ObjectRef) -> Result<Arc<Monitor>> {
        self.with_entry(r, |slot| Ok(Arc::clone(&slot.monitor)))
    }

    pub fn get_field(&self, r: ObjectRef, field: &Field) -> Result<Value> {
        self.with_entry(r, |slot| {
            let obj = as_object(&slot.entry)?;
            obj.slot(field)
                .map(|index| obj.fields[index].1.clone())
                .ok_or_else(|| RuntimeError::UnresolvedField {
                    class: obj.class.name().to_string(),
                    name: field.name.clone(),
                })
        })
    }

    pub fn set_field(&self, r: ObjectRef, field: &Field, value: Value) -> Result<()> {
        self.with_entry_mut(r, |slot| {
            let obj = match &mut slot.entry {
                HeapEntry::Object(obj) => obj,
                HeapEntry::Array(_) => {
                    return Err(RuntimeError::TypeMismatch {
                        expected: "object",
                        found: "array",
                    })
                }
            };
            match obj.slot(field) {
                Some(index) => {
                    obj.fields[index].1 = value;
                    Ok(())
                }
                None => Err(RuntimeError::UnresolvedField {
                    class: obj.class.name().to_string(),
                    name: field.name.clone(),
                }),
            }
        })
    }

    /// Looks an instance field up by name, nearest declaration first.
    pub fn get_field_by_name(&self, r: ObjectRef, name: &str) -> Result<Option<Value>> {
        self.with_entry(r, |slot| {
            let obj = as_object(&slot.entry)?;
            Ok(obj
                .fields
                .iter()
                .find(|(f, _)| f.name == name)
                .map(|(_, v)| v.clone()))
        })
    }

    pub fn array_length(&self, r: ObjectRef) -> Result<usize> {
        self.with_entry(r, |slot| Ok(as_array(&slot.entry)?.elements.len()))
    }

    pub fn array_descriptor(&self, r: ObjectRef) -> Result<String> {
        self.with_entry(r, |slot| Ok(as_array(&slot.entry)?.descriptor.clone()))
    }

    /// Reads element `index`, `None` when out of bounds.
    pub fn array_load(&self, r: ObjectRef, index: i32) -> Result<Option<Value>> {
        self.with_entry(r, |slot| {
            let array = as_array(&slot.entry)?;
            Ok(usize::try_from(index)
                .ok()
                .and_then(|i| array.elements.get(i))
                .cloned())
        })
    }

    /// Writes element `index`, returns false without storing when out of
    /// bounds.
    pub fn array_store(&self, r: ObjectRef, index: i32, value: Value) -> Result<bool> {
        self.with_array_mut(r, |array| {
            match usize::try_from(index)
                .ok()
                .and_then(|i| array.elements.get_mut(i))
            {
                Some(element) => {
                    *element = value;
                    Ok(true)
                }
                None => Ok(false),
            }
        })
    }

    /// Runs `f` with shared access to an array.
    pub fn with_array<T>(
        &self,
        r: ObjectRef,
        f: impl FnOnce(&JavaArray) -> Result<T>,
    ) -> Result<T> {
        self.with_entry(r, |slot| f(as_array(&slot.entry)?))
    }

    /// Runs `f` with exclusive access to an array.
    pub fn with_array_mut<T>(
        &self,
        r: ObjectRef,
        f: impl FnOnce(&mut JavaArray) -> Result<T>,
    ) -> Result<T> {
        self.with_entry_mut(r, |slot| match &mut slot.entry {
            HeapEntry::Array(array) => f(array),
            HeapEntry::Object(_) => Err(RuntimeError::TypeMismatch {
                expected: "array",
                found: "object",
            }),
        })
    }

    /// Shallow copy of an array, as done by `Object.clone` on arrays.
    pub fn clone_array(&self, r: ObjectRef) -> Result<ObjectRef> {
        let (element_type, descriptor, elements) = self.with_entry(r, |slot| {
            let array = as_array(&slot.entry)?;
            Ok((array.element_type, array.descriptor.clone(), array.elements.clone()))
        })?;
        self.allocate_array_from(element_type, &descriptor, elements)
    }

    /// Decodes a `java/lang/String` object through its `value` char array.
    pub fn read_string(&self, r: ObjectRef) -> Result<Option<String>> {
        let Some(Value::Array(chars)) = self.get_field_by_name(r, "value")? else {
            return Ok(None);
        };
        self.with_entry(chars, |slot| {
            let units = as_array(&slot.entry)?
                .elements
                .iter()
                .map(|v| v.as_int().map(|c| c as u16))
                .collect::<Result<Vec<_>>>()?;
            Ok(Some(String::from_utf16_lossy(&units)))
        })
    }
}

fn as_object(entry: &HeapEntry) -> Result<&JavaObject> {
    match entry {
        HeapEntry::Object(obj) => Ok(obj),
        HeapEntry::Array(_) => Err(RuntimeError::TypeMismatch {
            expected: "object",
            found: "array",
        }),
    }
}

fn as_array(entry: &HeapEntry) -> Result<&JavaArray> {
    match entry {
        HeapEntry::Array(array) => Ok(array),
        HeapEntry::Object(_) => Err(RuntimeError::TypeMismatch {
            expected: "array",
            found: "object",
        }),
    }
}
