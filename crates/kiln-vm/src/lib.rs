//! Kiln Runtime
//!
//! Bytecode definitions, runtime values and the stack-based virtual machine
//! that executes compiled Kiln programs.
//!
//! # Value Representation
//!
//! Kiln is dynamically typed; every runtime value is a [`Value`]. Numbers are
//! IEEE-754 doubles and booleans/nil/ranges are stored inline. Heap objects
//! (strings, arrays, functions, classes, instances, modules) are
//! reference-counted with `Rc`; the VM is single-threaded, so arrays and
//! instance fields use `RefCell` for interior mutability.
//!
//! # Execution Model
//!
//! A [`Chunk`] holds a flat `Vec<u8>` of instructions, a constant pool and a
//! per-byte line table. The [`Vm`] runs chunks on a value stack with call
//! frames; slot 0 of each frame holds the callee (or the receiver for
//! methods), so `this` and named-function recursion are ordinary local reads.
//! `throw`/`try` unwind through a handler stack, and `import` executes each
//! module once in fresh globals, caching it by canonical path.

pub mod builtins;
pub mod chunk;
pub mod debug;
pub mod object;
pub mod value;
pub mod vm;

// Re-export core types for convenience
pub use chunk::{Chunk, OpCode};
pub use object::{BoundMethod, Class, Function, Instance, Iter, Module, Native, NativeFn};
pub use value::Value;
pub use vm::{CaptureSink, ModuleLoader, RuntimeError, Vm, MAX_FRAMES};
