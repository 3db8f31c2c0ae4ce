//! A small imperative scripting language: lexer, parser, single-pass
//! bytecode compiler, and a stack-based virtual machine with closures
//! and a mark-sweep collector.

pub mod bytecode;
pub mod error;
pub mod frontend;
pub mod lang;
pub mod repl;
pub mod runtime;

pub use error::{Diagnostic, ErrorKind, ErrorReporter};
pub use runtime::vm::{CaptureBuffer, InterpretResult, Vm};
