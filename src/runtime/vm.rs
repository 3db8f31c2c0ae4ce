use std::cell::RefCell;
use std::io::Write;
use std::rc::Rc;

use indexmap::IndexMap;

use crate::bytecode::compile::Compiler;
use crate::bytecode::op::OpCode;
use crate::error::{ErrorKind, ErrorReporter};
use crate::frontend::lexer::Lexer;
use crate::frontend::parser::Parser;
use crate::frontend::span::Span;
use crate::lang::value::{UpvalueId, Value};
use crate::runtime::builtins::{self, coerce_number};
use crate::runtime::gc::{Heap, ObjClosure, ObjUpvalue};

/// Maximum call-frame depth; exceeding it is a runtime stack overflow.
const FRAMES_MAX: usize = 64;

/// Outcome classification of one `interpret` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterpretResult {
    Ok,
    CompileError,
    RuntimeError,
}

impl InterpretResult {
    /// Process exit code: 0 success, 1 compile error, 2 runtime error.
    pub fn exit_code(self) -> i32 {
        match self {
            InterpretResult::Ok => 0,
            InterpretResult::CompileError => 1,
            InterpretResult::RuntimeError => 2,
        }
    }
}

/// One live activation: the executing closure, its instruction pointer,
/// and the stack slot where its window begins (slot 0 is the callee).
struct CallFrame {
    closure: crate::lang::value::ClosureId,
    ip: usize,
    base: usize,
}

/// A runtime fault carried up to `interpret`, which formats it together
/// with a stack trace.
struct RuntimeErr {
    message: String,
    line: u32,
}

/// An in-memory output sink, shareable with the code that wants to read
/// what the VM printed. Used by tests and anything else that needs to
/// capture `print` output instead of sending it to stdout.
#[derive(Clone, Default)]
pub struct CaptureBuffer(Rc<RefCell<Vec<u8>>>);

impl CaptureBuffer {
    pub fn new() -> Self {
        CaptureBuffer::default()
    }

    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.borrow()).to_string()
    }
}

impl Write for CaptureBuffer {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.borrow_mut().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// The bytecode virtual machine.
///
/// One `Vm` owns everything execution needs: the value stack, the call
/// frames, the insertion-ordered globals, the interned strings, and the
/// garbage-collected object heap. Reusing a `Vm` across `interpret`
/// calls keeps globals and the heap alive, which is what the REPL does.
pub struct Vm {
    stack: Vec<Value>,
    frames: Vec<CallFrame>,
    globals: IndexMap<Rc<str>, Value>,
    pub(crate) heap: Heap,
    /// Open upvalues, sorted by stack index, highest first.
    open_upvalues: Vec<(usize, UpvalueId)>,
    reporter: ErrorReporter,
    out: Box<dyn Write>,
    instructions: u64,
}

impl Default for Vm {
    fn default() -> Self {
        Vm::new()
    }
}

impl Vm {
    pub fn new() -> Self {
        Vm::with_output(Box::new(std::io::stdout()))
    }

    pub fn with_output(out: Box<dyn Write>) -> Self {
        let mut heap = Heap::new();
        let mut globals = IndexMap::new();
        for native in builtins::NATIVES {
            globals.insert(heap.intern(native.name), Value::Native(*native));
        }
        Vm {
            stack: Vec::with_capacity(256),
            frames: Vec::with_capacity(FRAMES_MAX),
            globals,
            heap,
            open_upvalues: Vec::new(),
            reporter: ErrorReporter::new(),
            out,
            instructions: 0,
        }
    }

    /// Runs one source program through the full pipeline.
    ///
    /// Each stage halts the pipeline when it reports: lexical errors skip
    /// parsing, front-end errors skip execution. All accumulated
    /// diagnostics are printed to stderr before returning.
    pub fn interpret(&mut self, source: &str) -> InterpretResult {
        self.reporter.clear();
        self.reporter.set_source(source);

        let tokens = Lexer::new(source, &mut self.reporter).scan_all();
        if self.reporter.has_errors() {
            self.reporter.print_all();
            return InterpretResult::CompileError;
        }

        let program = Parser::new(tokens, &mut self.reporter).parse();
        if self.reporter.has_errors() {
            self.reporter.print_all();
            return InterpretResult::CompileError;
        }

        let compiled = Compiler::new(&mut self.reporter, &mut self.heap).compile(&program);
        let Some(function) = compiled else {
            self.reporter.print_all();
            return InterpretResult::CompileError;
        };

        let closure = self.heap.alloc_closure(ObjClosure {
            function,
            upvalues: Vec::new(),
        });

        self.stack.clear();
        self.frames.clear();
        self.open_upvalues.clear();
        self.stack.push(Value::Closure(closure));
        self.frames.push(CallFrame {
            closure,
            ip: 0,
            base: 0,
        });

        match self.run() {
            Ok(()) => {
                self.stack.clear();
                InterpretResult::Ok
            }
            Err(error) => {
                self.report_runtime_error(error);
                InterpretResult::RuntimeError
            }
        }
    }

    // Dispatch loop

    fn run(&mut self) -> Result<(), RuntimeErr> {
        loop {
            let byte = self.read_byte();
            let op = OpCode::try_from(byte)
                .map_err(|b| self.error(format!("Unknown opcode {:#04x}.", b)))?;
            self.instructions += 1;

            match op {
                OpCode::Constant => {
                    let constant = self.read_constant();
                    self.push(constant);
                }
                OpCode::Nil => self.push(Value::Nil),
                OpCode::True => self.push(Value::Bool(true)),
                OpCode::False => self.push(Value::Bool(false)),

                OpCode::Add => {
                    let b = self.pop()?;
                    let a = self.pop()?;
                    match (&a, &b) {
                        (Value::Number(x), Value::Number(y)) => self.push(Value::Number(x + y)),
                        (Value::Str(x), Value::Str(y)) => {
                            let joined = format!("{}{}", x, y);
                            let interned = self.heap.intern(&joined);
                            self.push(Value::Str(interned));
                        }
                        _ => {
                            return Err(
                                self.error("Operands must be two numbers or two strings.")
                            );
                        }
                    }
                }
                OpCode::Subtract => {
                    let (a, b) = self.pop_numbers("Operands must be numbers.")?;
                    self.push(Value::Number(a - b));
                }
                OpCode::Multiply => {
                    let (a, b) = self.pop_numbers("Operands must be numbers.")?;
                    self.push(Value::Number(a * b));
                }
                OpCode::Divide => {
                    let (a, b) = self.pop_numbers("Operands must be numbers.")?;
                    if b == 0.0 {
                        return Err(self.error("Division by zero."));
                    }
                    self.push(Value::Number(a / b));
                }
                OpCode::Modulo => {
                    let (a, b) = self.pop_numbers("Operands must be numbers.")?;
                    if b == 0.0 {
                        return Err(self.error("Modulo by zero."));
                    }
                    self.push(Value::Number(a % b));
                }
                OpCode::Negate => {
                    let value = self.pop()?;
                    match value {
                        Value::Number(n) => self.push(Value::Number(-n)),
                        _ => return Err(self.error("Operand must be a number.")),
                    }
                }

                OpCode::Equal => {
                    let b = self.pop()?;
                    let a = self.pop()?;
                    self.push(Value::Bool(a.equals(&b)));
                }
                OpCode::NotEqual => {
                    let b = self.pop()?;
                    let a = self.pop()?;
                    self.push(Value::Bool(!a.equals(&b)));
                }
                OpCode::Less => self.comparison(|ord| ord == std::cmp::Ordering::Less)?,
                OpCode::LessEqual => self.comparison(|ord| ord != std::cmp::Ordering::Greater)?,
                OpCode::Greater => self.comparison(|ord| ord == std::cmp::Ordering::Greater)?,
                OpCode::GreaterEqual => self.comparison(|ord| ord != std::cmp::Ordering::Less)?,
                OpCode::Not => {
                    let value = self.pop()?;
                    self.push(Value::Bool(!value.is_truthy()));
                }

                OpCode::GetLocal => {
                    let slot = self.read_byte() as usize;
                    let base = self.frame().base;
                    let value = self.stack[base + slot].clone();
                    self.push(value);
                }
                OpCode::SetLocal => {
                    let slot = self.read_byte() as usize;
                    let base = self.frame().base;
                    let value = self.peek(0)?.clone();
                    self.stack[base + slot] = value;
                }
                OpCode::GetGlobal => {
                    let name = self.read_string_constant()?;
                    match self.globals.get(&name) {
                        Some(value) => {
                            let value = value.clone();
                            self.push(value);
                        }
                        None => {
                            return Err(
                                self.error(format!("Undefined variable '{}'.", name))
                            );
                        }
                    }
                }
                OpCode::SetGlobal => {
                    let name = self.read_string_constant()?;
                    let value = self.peek(0)?.clone();
                    self.globals.insert(name, value);
                }

                OpCode::Jump => {
                    let distance = self.read_u16() as usize;
                    self.frame_mut().ip += distance;
                }
                OpCode::JumpIfFalse => {
                    let distance = self.read_u16() as usize;
                    if !self.peek(0)?.is_truthy() {
                        self.frame_mut().ip += distance;
                    }
                }
                OpCode::JumpIfTrue => {
                    let distance = self.read_u16() as usize;
                    if self.peek(0)?.is_truthy() {
                        self.frame_mut().ip += distance;
                    }
                }
                OpCode::Loop => {
                    let distance = self.read_u16() as usize;
                    self.frame_mut().ip -= distance;
                }

                OpCode::Call => {
                    let argc = self.read_byte() as usize;
                    let callee = self.peek(argc)?.clone();
                    self.call_value(callee, argc)?;
                }
                OpCode::Return => {
                    let result = self.pop()?;
                    let frame = self.frames.pop().expect("active frame");
                    self.close_upvalues(frame.base);
                    self.stack.truncate(frame.base);
                    if self.frames.is_empty() {
                        return Ok(());
                    }
                    self.push(result);
                }

                OpCode::Pop => {
                    self.pop()?;
                }

                OpCode::Closure => {
                    let constant = self.read_constant();
                    let Value::Function(function) = constant else {
                        return Err(self.error("Closure constant is not a function."));
                    };
                    let upvalue_count = self.heap.function(function).upvalue_count;

                    let mut upvalues = Vec::with_capacity(upvalue_count);
                    for _ in 0..upvalue_count {
                        let is_local = self.read_byte() != 0;
                        let index = self.read_byte() as usize;
                        if is_local {
                            let base = self.frame().base;
                            upvalues.push(self.capture_upvalue(base + index));
                        } else {
                            let closure = self.frame().closure;
                            upvalues.push(self.heap.closure(closure).upvalues[index]);
                        }
                    }

                    self.maybe_collect();
                    let closure = self.heap.alloc_closure(ObjClosure { function, upvalues });
                    self.push(Value::Closure(closure));
                }
                OpCode::GetUpvalue => {
                    let index = self.read_byte() as usize;
                    let closure = self.frame().closure;
                    let id = self.heap.closure(closure).upvalues[index];
                    let value = match self.heap.upvalue(id) {
                        ObjUpvalue::Open(slot) => self.stack[*slot].clone(),
                        ObjUpvalue::Closed(value) => value.clone(),
                    };
                    self.push(value);
                }
                OpCode::SetUpvalue => {
                    let index = self.read_byte() as usize;
                    let closure = self.frame().closure;
                    let id = self.heap.closure(closure).upvalues[index];
                    let value = self.peek(0)?.clone();
                    match self.heap.upvalue_mut(id) {
                        ObjUpvalue::Open(slot) => {
                            let slot = *slot;
                            self.stack[slot] = value;
                        }
                        cell => *cell = ObjUpvalue::Closed(value),
                    }
                }
                OpCode::CloseUpvalue => {
                    let top = self.stack.len() - 1;
                    self.close_upvalues(top);
                    self.pop()?;
                }
            }
        }
    }

    // Calls

    fn call_value(&mut self, callee: Value, argc: usize) -> Result<(), RuntimeErr> {
        match callee {
            Value::Closure(id) => {
                let arity = self.heap.function(self.heap.closure(id).function).arity;
                if argc != arity as usize {
                    return Err(self.error(format!(
                        "Expected {} arguments but got {}.",
                        arity, argc
                    )));
                }
                if self.frames.len() >= FRAMES_MAX {
                    return Err(self.error("Stack overflow."));
                }
                self.frames.push(CallFrame {
                    closure: id,
                    ip: 0,
                    base: self.stack.len() - 1 - argc,
                });
                Ok(())
            }
            Value::Native(native) => {
                if let Some(arity) = native.arity {
                    if argc != arity as usize {
                        return Err(self.error(format!(
                            "Expected {} arguments but got {}.",
                            arity, argc
                        )));
                    }
                }
                let args = self.stack.split_off(self.stack.len() - argc);
                self.pop()?; // callee
                let result = (native.call)(self, &args).map_err(|message| self.error(message))?;
                self.push(result);
                Ok(())
            }
            other => Err(self.error(format!(
                "Can only call functions, got {}.",
                other.type_name()
            ))),
        }
    }

    // Upvalues

    fn capture_upvalue(&mut self, stack_index: usize) -> UpvalueId {
        for &(index, id) in &self.open_upvalues {
            if index == stack_index {
                return id;
            }
            if index < stack_index {
                break;
            }
        }

        let id = self.heap.alloc_upvalue(ObjUpvalue::Open(stack_index));
        let position = self
            .open_upvalues
            .iter()
            .position(|&(index, _)| index < stack_index)
            .unwrap_or(self.open_upvalues.len());
        self.open_upvalues.insert(position, (stack_index, id));
        id
    }

    /// Closes every open upvalue at or above `from`, hoisting the stack
    /// slot's current value into the heap cell.
    fn close_upvalues(&mut self, from: usize) {
        while let Some(&(index, id)) = self.open_upvalues.first() {
            if index < from {
                break;
            }
            let value = self.stack[index].clone();
            *self.heap.upvalue_mut(id) = ObjUpvalue::Closed(value);
            self.open_upvalues.remove(0);
        }
    }

    // Garbage collection

    fn maybe_collect(&mut self) {
        if self.heap.should_collect() {
            self.collect_garbage();
        }
    }

    /// A full mark-sweep cycle. Roots: the value stack, every frame's
    /// closure, the open-upvalue list, and all globals.
    pub fn collect_garbage(&mut self) {
        for value in &self.stack {
            self.heap.mark_value(value);
        }
        for frame in &self.frames {
            self.heap.mark_closure(frame.closure);
        }
        for &(_, id) in &self.open_upvalues {
            self.heap.mark_upvalue(id);
        }
        for value in self.globals.values() {
            self.heap.mark_value(value);
        }
        self.heap.trace_and_sweep();
    }

    // Comparison with coercion

    fn comparison(&mut self, accept: fn(std::cmp::Ordering) -> bool) -> Result<(), RuntimeErr> {
        let b = self.pop()?;
        let a = self.pop()?;

        let ordering = match (&a, &b) {
            (Value::Number(x), Value::Number(y)) => x.partial_cmp(y),
            (Value::Str(x), Value::Str(y)) => Some(x.cmp(y)),
            // Mixed types order numerically after toNumber coercion.
            _ => coerce_number(&a).partial_cmp(&coerce_number(&b)),
        };

        // NaN comparisons are false.
        self.push(Value::Bool(ordering.is_some_and(accept)));
        Ok(())
    }

    // Instruction stream access

    fn frame(&self) -> &CallFrame {
        self.frames.last().expect("active frame")
    }

    fn frame_mut(&mut self) -> &mut CallFrame {
        self.frames.last_mut().expect("active frame")
    }

    fn read_byte(&mut self) -> u8 {
        let frame = self.frame();
        let function = self.heap.closure(frame.closure).function;
        let byte = self.heap.function(function).chunk.code[frame.ip];
        self.frame_mut().ip += 1;
        byte
    }

    fn read_u16(&mut self) -> u16 {
        let high = self.read_byte();
        let low = self.read_byte();
        (u16::from(high) << 8) | u16::from(low)
    }

    fn read_constant(&mut self) -> Value {
        let index = self.read_byte() as usize;
        let frame = self.frame();
        let function = self.heap.closure(frame.closure).function;
        self.heap.function(function).chunk.constants[index].clone()
    }

    fn read_string_constant(&mut self) -> Result<Rc<str>, RuntimeErr> {
        match self.read_constant() {
            Value::Str(s) => Ok(s),
            other => Err(self.error(format!(
                "Expected a name constant, got {}.",
                other.type_name()
            ))),
        }
    }

    // Stack helpers

    fn push(&mut self, value: Value) {
        self.stack.push(value);
    }

    fn pop(&mut self) -> Result<Value, RuntimeErr> {
        self.stack
            .pop()
            .ok_or_else(|| self.error("Stack underflow."))
    }

    fn peek(&self, distance: usize) -> Result<&Value, RuntimeErr> {
        self.stack
            .len()
            .checked_sub(1 + distance)
            .and_then(|index| self.stack.get(index))
            .ok_or_else(|| self.error("Stack underflow."))
    }

    fn pop_numbers(&mut self, message: &str) -> Result<(f64, f64), RuntimeErr> {
        let b = self.pop()?;
        let a = self.pop()?;
        match (a, b) {
            (Value::Number(x), Value::Number(y)) => Ok((x, y)),
            _ => Err(self.error(message)),
        }
    }

    // Errors

    fn error(&self, message: impl Into<String>) -> RuntimeErr {
        let line = self
            .frames
            .last()
            .map(|frame| {
                let function = self.heap.closure(frame.closure).function;
                self.heap
                    .function(function)
                    .chunk
                    .line(frame.ip.saturating_sub(1))
            })
            .unwrap_or(0);
        RuntimeErr {
            message: message.into(),
            line,
        }
    }

    /// Prints the formatted runtime error plus a stack trace, innermost
    /// frame first, then resets execution state so the VM can be reused.
    fn report_runtime_error(&mut self, error: RuntimeErr) {
        self.reporter.report(
            ErrorKind::Runtime,
            error.message,
            Span::new(0, 0, error.line as usize, 0),
        );
        if let Some(diagnostic) = self.reporter.errors().last() {
            eprintln!("{}", diagnostic);
        }

        for frame in self.frames.iter().rev() {
            let closure = self.heap.closure(frame.closure);
            let function = self.heap.function(closure.function);
            let line = function.chunk.line(frame.ip.saturating_sub(1));
            match &function.name {
                Some(name) => eprintln!("[line {}] in {}()", line, name),
                None => eprintln!("[line {}] in script", line),
            }
        }

        self.stack.clear();
        self.frames.clear();
        self.open_upvalues.clear();
    }

    // Services for built-ins and the shell

    pub fn stringify(&self, value: &Value) -> String {
        self.heap.stringify(value)
    }

    pub(crate) fn intern(&mut self, text: &str) -> Rc<str> {
        self.heap.intern(text)
    }

    pub(crate) fn print_line(&mut self, text: &str) {
        let _ = writeln!(self.out, "{}", text);
        let _ = self.out.flush();
    }

    pub fn set_stress_mode(&mut self, enabled: bool) {
        self.heap.set_stress_mode(enabled);
    }

    /// Globals in insertion order, stringified for display.
    pub fn globals_snapshot(&self) -> Vec<(String, String)> {
        self.globals
            .iter()
            .map(|(name, value)| (name.to_string(), self.heap.stringify(value)))
            .collect()
    }

    pub fn instructions_executed(&self) -> u64 {
        self.instructions
    }

    pub fn bytes_allocated(&self) -> usize {
        self.heap.bytes_allocated()
    }

    pub fn gc_collections(&self) -> u64 {
        self.heap.collections()
    }

    pub fn live_objects(&self) -> usize {
        self.heap.live_objects()
    }

    pub fn interned_strings(&self) -> usize {
        self.heap.interned_strings()
    }

    /// Diagnostics accumulated by the most recent `interpret` call.
    pub fn last_errors(&self) -> &[crate::error::Diagnostic] {
        self.reporter.errors()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run_capture(source: &str) -> (InterpretResult, String) {
        let buffer = CaptureBuffer::new();
        let mut vm = Vm::with_output(Box::new(buffer.clone()));
        let result = vm.interpret(source);
        (result, buffer.contents())
    }

    #[test]
    fn test_arithmetic_precedence() {
        let (result, output) = run_capture("print(1 + 2 * 3);");
        assert_eq!(result, InterpretResult::Ok);
        assert_eq!(output, "7\n");
    }

    #[test]
    fn test_global_assignment() {
        let (result, output) = run_capture("let x = 10; x = x + 5; print(x);");
        assert_eq!(result, InterpretResult::Ok);
        assert_eq!(output, "15\n");
    }

    #[test]
    fn test_locals_and_scoping() {
        let (result, output) = run_capture(
            "{ let a = 1; { let b = 2; print(a + b); } print(a); }",
        );
        assert_eq!(result, InterpretResult::Ok);
        assert_eq!(output, "3\n1\n");
    }

    #[test]
    fn test_recursive_fibonacci() {
        let source =
            "fn fib(n) { if (n < 2) { return n; } return fib(n - 1) + fib(n - 2); } print(fib(10));";
        let (result, output) = run_capture(source);
        assert_eq!(result, InterpretResult::Ok);
        assert_eq!(output, "55\n");
    }

    #[test]
    fn test_closure_counter() {
        let source = "fn mk() { var c = 0; fn inc() { c = c + 1; return c; } return inc; } \
                      let f = mk(); print(f()); print(f()); print(f());";
        let (result, output) = run_capture(source);
        assert_eq!(result, InterpretResult::Ok);
        assert_eq!(output, "1\n2\n3\n");
    }

    #[test]
    fn test_string_concat_and_len() {
        let source = r#"let s = "foo"; print(s + "bar"); print(len(s + "bar"));"#;
        let (result, output) = run_capture(source);
        assert_eq!(result, InterpretResult::Ok);
        assert_eq!(output, "foobar\n6\n");
    }

    #[test]
    fn test_division_by_zero_is_a_runtime_error() {
        let (result, _) = run_capture("print(1/0);");
        assert_eq!(result, InterpretResult::RuntimeError);
        assert_eq!(result.exit_code(), 2);
    }

    #[test]
    fn test_modulo_by_zero_is_a_runtime_error() {
        let (result, _) = run_capture("let z = 0; print(5 % z);");
        assert_eq!(result, InterpretResult::RuntimeError);
    }

    #[test]
    fn test_undefined_variable() {
        let (result, _) = run_capture("print(missing);");
        assert_eq!(result, InterpretResult::RuntimeError);
    }

    #[test]
    fn test_while_loop() {
        let (result, output) = run_capture("var i = 0; while (i < 3) { print(i); i = i + 1; }");
        assert_eq!(result, InterpretResult::Ok);
        assert_eq!(output, "0\n1\n2\n");
    }

    #[test]
    fn test_break_exits_loop() {
        let source = "var i = 0; while (true) { if (i == 2) { break; } print(i); i = i + 1; } print(\"done\");";
        let (result, output) = run_capture(source);
        assert_eq!(result, InterpretResult::Ok);
        assert_eq!(output, "0\n1\ndone\n");
    }

    #[test]
    fn test_continue_skips_rest_of_body() {
        let source = "var i = 0; while (i < 4) { i = i + 1; if (i == 2) { continue; } print(i); }";
        let (result, output) = run_capture(source);
        assert_eq!(result, InterpretResult::Ok);
        assert_eq!(output, "1\n3\n4\n");
    }

    #[test]
    fn test_for_loop() {
        let (result, output) = run_capture("for (let i = 0; i < 3; i = i + 1) { print(i); }");
        assert_eq!(result, InterpretResult::Ok);
        assert_eq!(output, "0\n1\n2\n");
    }

    #[test]
    fn test_short_circuit_and() {
        let source = "fn boom() { return assert(false); } print(false && boom()); print(1 && 2);";
        let (result, output) = run_capture(source);
        assert_eq!(result, InterpretResult::Ok);
        assert_eq!(output, "false\n2\n");
    }

    #[test]
    fn test_short_circuit_or() {
        let source = "fn boom() { return assert(false); } print(1 || boom()); print(false || 2);";
        let (result, output) = run_capture(source);
        assert_eq!(result, InterpretResult::Ok);
        assert_eq!(output, "1\n2\n");
    }

    #[test]
    fn test_zero_and_empty_string_are_truthy() {
        let (result, output) = run_capture(
            r#"if (0) { print("zero"); } if ("") { print("empty"); } if (nil) { print("nil"); }"#,
        );
        assert_eq!(result, InterpretResult::Ok);
        assert_eq!(output, "zero\nempty\n");
    }

    #[test]
    fn test_wrong_argument_count() {
        let (result, _) = run_capture("fn two(a, b) { return a; } two(1);");
        assert_eq!(result, InterpretResult::RuntimeError);
    }

    #[test]
    fn test_calling_a_non_function() {
        let (result, _) = run_capture("let x = 3; x();");
        assert_eq!(result, InterpretResult::RuntimeError);
    }

    #[test]
    fn test_deep_recursion_overflows() {
        let (result, _) = run_capture("fn f() { return f(); } f();");
        assert_eq!(result, InterpretResult::RuntimeError);
    }

    #[test]
    fn test_builtins() {
        let source = r#"
            print(toString(42));
            print(toNumber("3.5"));
            print(toNumber(true));
            print(toNumber(nil));
            print(toNumber("junk"));
            print(range(3));
            assert(clock() > 0);
        "#;
        let (result, output) = run_capture(source);
        assert_eq!(result, InterpretResult::Ok);
        assert_eq!(output, "42\n3.5\n1\n0\n0\n0..3\n");
    }

    #[test]
    fn test_assert_failure() {
        let (result, _) = run_capture("assert(nil);");
        assert_eq!(result, InterpretResult::RuntimeError);
    }

    #[test]
    fn test_nan_equality_and_comparison() {
        // Repeated squaring overflows to infinity; inf - inf is NaN.
        let source = "var x = 10; var i = 0; while (i < 12) { x = x * x; i = i + 1; } \
                      let nan = x - x; print(nan == nan); print(nan < 1); print(nan >= 1);";
        let (result, output) = run_capture(source);
        assert_eq!(result, InterpretResult::Ok);
        // NaN equals itself; ordering against NaN is false.
        assert_eq!(output, "true\nfalse\nfalse\n");
    }

    #[test]
    fn test_function_printing() {
        let (result, output) = run_capture("fn named() { return nil; } print(named); print(print);");
        assert_eq!(result, InterpretResult::Ok);
        assert_eq!(output, "<fn named>\n<fn print>\n");
    }

    #[test]
    fn test_mixed_comparison_coerces() {
        let (result, output) = run_capture(r#"print("10" < 9);"#);
        assert_eq!(result, InterpretResult::Ok);
        // "10" coerces to 10, which is not below 9.
        assert_eq!(output, "false\n");
    }

    #[test]
    fn test_string_ordering_is_lexicographic() {
        let (result, output) = run_capture(r#"print("apple" < "banana"); print("b" < "a");"#);
        assert_eq!(result, InterpretResult::Ok);
        assert_eq!(output, "true\nfalse\n");
    }

    #[test]
    fn test_vm_reuse_keeps_globals() {
        let buffer = CaptureBuffer::new();
        let mut vm = Vm::with_output(Box::new(buffer.clone()));
        assert_eq!(vm.interpret("let x = 41;"), InterpretResult::Ok);
        assert_eq!(vm.interpret("print(x + 1);"), InterpretResult::Ok);
        assert_eq!(buffer.contents(), "42\n");
    }

    #[test]
    fn test_vm_usable_after_runtime_error() {
        let buffer = CaptureBuffer::new();
        let mut vm = Vm::with_output(Box::new(buffer.clone()));
        assert_eq!(vm.interpret("print(boom);"), InterpretResult::RuntimeError);
        assert_eq!(vm.interpret("print(\"ok\");"), InterpretResult::Ok);
        assert_eq!(buffer.contents(), "ok\n");
    }

    #[test]
    fn test_gc_stress_mode_output_is_identical() {
        let source = "fn mk() { var c = 0; fn inc() { c = c + 1; return c; } return inc; } \
                      let f = mk(); let g = mk(); print(f()); print(f()); print(g());";

        let plain = CaptureBuffer::new();
        let mut vm = Vm::with_output(Box::new(plain.clone()));
        assert_eq!(vm.interpret(source), InterpretResult::Ok);

        let stressed = CaptureBuffer::new();
        let mut vm = Vm::with_output(Box::new(stressed.clone()));
        vm.set_stress_mode(true);
        assert_eq!(vm.interpret(source), InterpretResult::Ok);

        assert_eq!(plain.contents(), stressed.contents());
        assert_eq!(plain.contents(), "1\n2\n1\n");
    }

    #[test]
    fn test_gc_reclaims_dead_closures() {
        let mut vm = Vm::new();
        let source = "fn mk() { var c = 0; fn inc() { c = c + 1; return c; } return inc; } \
                      { let t = mk(); t(); } 1;";
        assert_eq!(vm.interpret(source), InterpretResult::Ok);

        let before = vm.live_objects();
        vm.collect_garbage();
        let after = vm.live_objects();
        assert!(after <= before);
    }

    #[test]
    fn test_globals_snapshot_preserves_insertion_order() {
        let mut vm = Vm::new();
        assert_eq!(
            vm.interpret("let zebra = 1; let apple = 2;"),
            InterpretResult::Ok
        );
        let names: Vec<String> = vm
            .globals_snapshot()
            .into_iter()
            .map(|(name, _)| name)
            .collect();
        let zebra = names.iter().position(|n| n == "zebra").unwrap();
        let apple = names.iter().position(|n| n == "apple").unwrap();
        assert!(zebra < apple);
    }

    #[test]
    fn test_upvalue_closed_after_scope_exit() {
        let source = "var f = nil; { var local = 10; fn read() { return local; } f = read; } \
                      print(f());";
        let (result, output) = run_capture(source);
        assert_eq!(result, InterpretResult::Ok);
        assert_eq!(output, "10\n");
    }

    #[test]
    fn test_sibling_closures_share_one_cell() {
        let source = "fn pair() { var n = 0; fn bump() { n = n + 1; return n; } \
                      fn read() { return n; } print(bump()); print(read()); } pair();";
        let (result, output) = run_capture(source);
        assert_eq!(result, InterpretResult::Ok);
        assert_eq!(output, "1\n1\n");
    }

    #[test]
    fn test_compile_error_exit_code() {
        let (result, _) = run_capture("let = ;");
        assert_eq!(result, InterpretResult::CompileError);
        assert_eq!(result.exit_code(), 1);
    }

    #[test]
    fn test_print_is_variadic() {
        let (result, output) = run_capture(r#"print(1, "two", nil, true);"#);
        assert_eq!(result, InterpretResult::Ok);
        assert_eq!(output, "1 two nil true\n");
    }

    #[test]
    fn test_return_without_value_yields_nil() {
        let (result, output) = run_capture("fn f() { return; } print(f());");
        assert_eq!(result, InterpretResult::Ok);
        assert_eq!(output, "nil\n");
    }

    #[test]
    fn test_implicit_return_yields_nil() {
        let (result, output) = run_capture("fn f() { 1 + 1; } print(f());");
        assert_eq!(result, InterpretResult::Ok);
        assert_eq!(output, "nil\n");
    }
}
