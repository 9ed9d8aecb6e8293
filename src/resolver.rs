//! Symbolic reference resolution and method selection.
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::jvm::ClassLibrary;
use crate::program::{Class, Field, Method};

/// Resolves field and method references against the class library.
///
/// Field resolutions are memoised for the lifetime of the resolver keyed by
/// the (class name, field name) pair used in the reference.
#[derive(Debug, Default)]
pub struct MethodResolver {
    fields: Mutex<HashMap<(String, String), Arc<Field>>>,
    // Number of field lookups that had to walk the class hierarchy.
    field_walks: AtomicUsize,
}

impl MethodResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn field_walks(&self) -> usize {
        self.field_walks.load(Ordering::Acquire)
    }

    /// Resolves a field referenced as `class_name.field_name`, looking at the
    /// class, its superinterfaces and then its superclasses.
    pub fn resolve_field(
        &self,
        classes: &dyn ClassLibrary,
        class_name: &str,
        field_name: &str,
    ) -> Option<Arc<Field>> {
        let key = (class_name.to_string(), field_name.to_string());
        if let Some(field) = self.fields.lock().get(&key) {
            return Some(Arc::clone(field));
        }

        self.field_walks.fetch_add(1, Ordering::AcqRel);
        let field = find_field(classes, class_name, field_name)?;
        debug!(
            class = class_name,
            field = field_name,
            declared_in = %field.class_name,
            "resolved field"
        );
        // Another thread may have raced us, keep whichever landed first.
        let mut cache = self.fields.lock();
        Some(Arc::clone(cache.entry(key).or_insert(field)))
    }

    /// Resolves a method by name and descriptor starting at `class_name`,
    /// walking superclasses and then superinterfaces.
    pub fn resolve_method(
        &self,
        classes: &dyn ClassLibrary,
        class_name: &str,
        name: &str,
        descriptor: &str,
    ) -> Option<Arc<Method>> {
        let mut current = classes.find_class(class_name);
        while let Some(class) = current {
            if let Some(method) = class.get_method(name, descriptor) {
                return Some(method);
            }
            current = class.super_class().and_then(|s| classes.find_class(s));
        }
        find_interface_method(classes, class_name, name, descriptor)
    }

    /// Virtual dispatch: re-resolves `name` and `descriptor` from the
    /// receiver's runtime class upward. Falls back to default methods from
    /// the superinterfaces.
    pub fn find_virtual_method(
        &self,
        classes: &dyn ClassLibrary,
        runtime_class: &Arc<Class>,
        name: &str,
        descriptor: &str,
    ) -> Option<Arc<Method>> {
        let mut current = Some(Arc::clone(runtime_class));
        while let Some(class) = current {
            if let Some(method) = class.get_method(name, descriptor) {
                if !method.is_static() {
                    return Some(method);
                }
            }
            current = class.super_class().and_then(|s| classes.find_class(s));
        }
        find_interface_method(classes, runtime_class.name(), name, descriptor)
            .filter(|m| !m.is_abstract())
    }

    /// Selects the method an `invokespecial` actually runs. When the current
    /// class has ACC_SUPER set, the resolved class is one of its superclasses
    /// and the method isn't an instance initialiser, the lookup restarts at
    /// the direct superclass of the current class. Interfaces are never
    /// superclasses, their methods run as resolved. `None` means nothing
    /// implements it.
    pub fn select_special_method(
        &self,
        classes: &dyn ClassLibrary,
        current: &Class,
        resolved_class: &str,
        resolved: Arc<Method>,
    ) -> Option<Arc<Method>> {
        let uses_super_semantics = current.has_super_flag()
            && resolved_class != current.name()
            && !resolved.is_initialiser()
            && extends(classes, current, resolved_class);
        if !uses_super_semantics {
            return Some(resolved);
        }

        let mut next = current.super_class().and_then(|s| classes.find_class(s));
        while let Some(class) = next {
            if let Some(method) = class.get_method(&resolved.name, &resolved.descriptor) {
                return (!method.is_abstract()).then_some(method);
            }
            next = class.super_class().and_then(|s| classes.find_class(s));
        }
        None
    }
}

fn find_field(
    classes: &dyn ClassLibrary,
    class_name: &str,
    field_name: &str,
) -> Option<Arc<Field>> {
    let class = classes.find_class(class_name)?;
    if let Some(field) = class.get_field(field_name) {
        return Some(field);
    }
    for interface in class.interfaces() {
        if let Some(field) = find_field(classes, interface, field_name) {
            return Some(field);
        }
    }
    class
        .super_class()
        .and_then(|s| find_field(classes, s, field_name))
}

fn find_interface_method(
    classes: &dyn ClassLibrary,
    class_name: &str,
    name: &str,
    descriptor: &str,
) -> Option<Arc<Method>> {
    let class = classes.find_class(class_name)?;
    for interface in class.interfaces() {
        if let Some(method) = classes
            .find_class(interface)
            .and_then(|i| i.get_method(name, descriptor))
        {
            return Some(method);
        }
        if let Some(method) = find_interface_method(classes, interface, name, descriptor) {
            return Some(method);
        }
    }
    class
        .super_class()
        .and_then(|s| find_interface_method(classes, s, name, descriptor))
}

// True if `ancestor` is on the superclass chain of `class`.
fn extends(classes: &dyn ClassLibrary, class: &Class, ancestor: &str) -> bool {
    let mut next = class.super_class().and_then(|s| classes.find_class(s));
    while let Some(class) = next {
        if class.name() == ancestor {
            return true;
        }
        next = class.super_class().and_then(|s| classes.find_class(s));
    }
    false
}

/// True if `derived` is `ancestor`, extends it or implements it, directly
/// or not.
pub fn is_subclass_of(classes: &dyn ClassLibrary, derived: &str, ancestor: &str) -> bool {
    if derived == ancestor {
        return true;
    }
    let Some(class) = classes.find_class(derived) else {
        return false;
    };
    if class
        .interfaces()
        .iter()
        .any(|i| is_subclass_of(classes, i, ancestor))
    {
        return true;
    }
    match class.super_class() {
        Some(super_class) => is_subclass_of(classes, super_class, ancestor),
        None => false,
    }
}

/// Collects the instance fields of `class` and all its superclasses, the
/// layout of a freshly allocated object.
pub fn instance_fields(classes: &dyn ClassLibrary, class: &Arc<Class>) -> Vec<Arc<Field>> {
    let mut fields = Vec::new();
    let mut current = Some(Arc::clone(class));
    while let Some(c) = current {
        fields.extend(c.fields().iter().filter(|f| !f.is_static()).cloned());
        current = c.super_class().and_then(|s| classes.find_class(s));
    }
    fields
}
