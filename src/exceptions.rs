//! Exception table lookup and local catch.
use crate::error::Result;
use crate::heap::ObjectRef;
use crate::jvm::ClassLibrary;
use crate::program::{ExceptionTableEntry, Method};
use crate::resolver::is_subclass_of;
use crate::state::VirtualMachineState;
use crate::value::Value;

pub const ABSTRACT_METHOD_ERROR: &str = "java/lang/AbstractMethodError";
pub const ARITHMETIC_EXCEPTION: &str = "java/lang/ArithmeticException";
pub const ARRAY_INDEX_OUT_OF_BOUNDS_EXCEPTION: &str = "java/lang/ArrayIndexOutOfBoundsException";
pub const ARRAY_STORE_EXCEPTION: &str = "java/lang/ArrayStoreException";
pub const CLASS_CAST_EXCEPTION: &str = "java/lang/ClassCastException";
pub const ILLEGAL_MONITOR_STATE_EXCEPTION: &str = "java/lang/IllegalMonitorStateException";
pub const INCOMPATIBLE_CLASS_CHANGE_ERROR: &str = "java/lang/IncompatibleClassChangeError";
pub const INSTANTIATION_ERROR: &str = "java/lang/InstantiationError";
pub const NEGATIVE_ARRAY_SIZE_EXCEPTION: &str = "java/lang/NegativeArraySizeException";
pub const NO_CLASS_DEF_FOUND_ERROR: &str = "java/lang/NoClassDefFoundError";
pub const NO_SUCH_FIELD_ERROR: &str = "java/lang/NoSuchFieldError";
pub const NO_SUCH_METHOD_ERROR: &str = "java/lang/NoSuchMethodError";
pub const NULL_POINTER_EXCEPTION: &str = "java/lang/NullPointerException";
pub const OUT_OF_MEMORY_ERROR: &str = "java/lang/OutOfMemoryError";
pub const STACK_OVERFLOW_ERROR: &str = "java/lang/StackOverflowError";
pub const UNSATISFIED_LINK_ERROR: &str = "java/lang/UnsatisfiedLinkError";

/// First row of `method`'s exception table, in declaration order, whose range
/// covers `pc` and whose catch type is absent or an ancestor of
/// `exception_class`.
pub fn find_local_exception_table_entry<'m>(
    classes: &dyn ClassLibrary,
    method: &'m Method,
    pc: usize,
    exception_class: &str,
) -> Option<&'m ExceptionTableEntry> {
    method.exception_table.iter().find(|entry| {
        entry.covers(pc)
            && entry
                .catch_type
                .as_deref()
                .map_or(true, |catch_type| is_subclass_of(classes, exception_class, catch_type))
    })
}

pub fn can_exception_be_handled_locally(
    classes: &dyn ClassLibrary,
    method: &Method,
    pc: usize,
    exception_class: &str,
) -> bool {
    find_local_exception_table_entry(classes, method, pc, exception_class).is_some()
}

/// Drops the values the current frame pushed from `start_pc` onward.
/// Returns how many were removed.
pub fn rewind_operand_stack(state: &mut VirtualMachineState, start_pc: usize) -> Result<usize> {
    let count = state.count_stack_items_to_clear(start_pc);
    for _ in 0..count {
        state.pop_operand()?;
    }
    Ok(count)
}

/// Transfers control to `entry`'s handler with the exception as the only new
/// operand, and clears the pending exception.
pub fn catch_exception(
    state: &mut VirtualMachineState,
    entry: &ExceptionTableEntry,
    exception: ObjectRef,
) -> Result<()> {
    rewind_operand_stack(state, entry.start_pc as usize)?;
    state.current_frame_mut()?.jump(entry.handler_pc as usize)?;
    state.push_operand(Value::Object(exception));
    state.take_pending_exception();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jvm::InMemoryClassLibrary;
    use crate::program::{Class, ClassBuilder, MethodBuilder, ACC_STATIC};
    use std::sync::Arc;

    fn guarded_method() -> (Arc<Class>, Arc<Method>) {
        let mut builder = ClassBuilder::new("Guarded");
        builder.method(
            MethodBuilder::new("run", "()V")
                .access_flags(ACC_STATIC)
                .code(vec![0x00; 32])
                .exception(ExceptionTableEntry::new(
                    10,
                    20,
                    25,
                    Some("java/lang/ArithmeticException"),
                ))
                .exception(ExceptionTableEntry::new(0, 30, 28, Some("java/lang/Error")))
                .exception(ExceptionTableEntry::new(0, 30, 29, None)),
        );
        let class = Arc::new(builder.build().unwrap());
        let method = class.get_method("run", "()V").unwrap();
        (class, method)
    }

    #[test]
    fn first_matching_entry_wins() {
        let library = InMemoryClassLibrary::bootstrap().unwrap();
        let (_, method) = guarded_method();
        let entry =
            find_local_exception_table_entry(&library, &method, 15, ARITHMETIC_EXCEPTION).unwrap();
        assert_eq!(entry.handler_pc, 25);

        // Outside the first range, the catch-all row matches.
        let entry =
            find_local_exception_table_entry(&library, &method, 25, ARITHMETIC_EXCEPTION).unwrap();
        assert_eq!(entry.handler_pc, 29);

        // Subclasses of the catch type match.
        let entry =
            find_local_exception_table_entry(&library, &method, 12, STACK_OVERFLOW_ERROR).unwrap();
        assert_eq!(entry.handler_pc, 28);

        assert!(!can_exception_be_handled_locally(&library, &method, 31, "java/lang/Error"));
    }

    #[test]
    fn catch_rewinds_to_region_start() {
        let library = InMemoryClassLibrary::bootstrap().unwrap();
        let (class, method) = guarded_method();
        let mut state = VirtualMachineState::new();
        state.push_state(class, Arc::clone(&method)).unwrap();

        // Pushed by the instructions at 4, 10 and 12.
        for (pc, value) in [(4, 1), (10, 2), (12, 3)] {
            let frame = state.current_frame_mut().unwrap();
            frame.jump(pc).unwrap();
            frame.fetch_opcode().unwrap();
            state.push_operand(Value::Integer(value));
        }

        let exception = crate::heap::Heap::new(None)
            .allocate_array(crate::heap::ArrayType::Int, "[I", 0)
            .unwrap();
        state.set_pending_exception(exception);
        let entry = find_local_exception_table_entry(&library, &method, 15, ARITHMETIC_EXCEPTION)
            .unwrap()
            .clone();
        catch_exception(&mut state, &entry, exception).unwrap();

        let operands: Vec<_> = state.operands().cloned().collect();
        assert_eq!(operands, vec![Value::Integer(1), Value::Object(exception)]);
        assert_eq!(state.current_frame().unwrap().pc(), 25);
        assert!(!state.has_pending_exception());
    }
}
