//! coldbrew is a bytecode execution engine for the Java virtual machine.
//!
//! Classes come from a `ClassLibrary` as an already decoded model, the
//! `Runtime` interprets their methods against a per-thread
//! `VirtualMachineState` and a `Jvm` context holding the heap, the
//! collector and the native methods.
pub mod bytecode;
pub mod config;
pub mod error;
pub mod exceptions;
pub mod gc;
pub mod heap;
mod invoke;
pub mod jvm;
pub mod monitor;
pub mod native;
pub mod objects;
pub mod program;
pub mod resolver;
pub mod runtime;
pub mod safepoint;
pub mod state;
pub mod value;

#[cfg(test)]
mod testing;

pub use config::EngineConfig;
pub use error::{Result, RuntimeError};
pub use heap::ObjectRef;
pub use jvm::{ClassLibrary, InMemoryClassLibrary, Jvm};
pub use runtime::{Invocation, RunOutcome, Runtime};
pub use state::VirtualMachineState;
pub use value::Value;
