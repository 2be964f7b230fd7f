//! The stack-based virtual machine.

use std::cell::RefCell;
use std::collections::HashMap;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::time::Instant;

use indexmap::IndexMap;
use thiserror::Error;

use crate::builtins;
use crate::chunk::OpCode;
use crate::debug;
use crate::object::{BoundMethod, Class, Function, Instance, Iter, Module};
use crate::value::{format_num, Value};

/// Hard cap on call depth; exceeding it is fatal, not catchable.
pub const MAX_FRAMES: usize = 256;

/// An uncaught runtime failure.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct RuntimeError {
    pub message: String,
    /// `[line N] in name` per active frame, innermost call first.
    pub traceback: Vec<String>,
}

/// Loads and compiles an imported module into its script function.
///
/// The driver installs a loader that runs the full pipeline; the VM itself
/// stays independent of the lexer, parser and compiler crates.
pub trait ModuleLoader {
    fn load(&self, path: &Path) -> Result<Rc<Function>, String>;
}

struct CallFrame {
    func: Rc<Function>,
    /// Offset of the next byte to execute in `func.chunk`.
    ip: usize,
    /// Stack slot of the callee; frame locals index from here, so slot 0 is
    /// the callee itself (or the receiver, for methods and ctors).
    base: usize,
    /// Class whose method table held the running method; `base` resolves
    /// from this class's superclass, not from the receiver's class.
    defining_class: Option<Rc<Class>>,
}

struct TryHandler {
    /// Jump target in the frame that pushed the handler.
    ip: usize,
    frame_count: usize,
    stack_len: usize,
}

/// Why execution is unwinding. `Throw` carries a catchable value; `Fatal`
/// (stack overflow, I/O failure, corrupt bytecode) skips every handler.
enum Unwind {
    Throw(Value),
    Fatal(String),
}

pub struct Vm {
    stack: Vec<Value>,
    frames: Vec<CallFrame>,
    globals: IndexMap<String, Value>,
    try_handlers: Vec<TryHandler>,
    /// Loaded modules, keyed by canonical path.
    modules: HashMap<PathBuf, Value>,
    /// Directories of the scripts currently executing; `import` paths
    /// resolve against the innermost one.
    dir_stack: Vec<PathBuf>,
    /// Canonical paths currently mid-load, for cycle detection.
    loading: Vec<PathBuf>,
    loader: Option<Box<dyn ModuleLoader>>,
    out: Box<dyn Write>,
    started: Instant,
    trace: bool,
}

impl Vm {
    pub fn new(out: Box<dyn Write>) -> Vm {
        let mut globals = IndexMap::new();
        builtins::register(&mut globals);
        Vm {
            stack: Vec::with_capacity(64),
            frames: Vec::with_capacity(16),
            globals,
            try_handlers: Vec::new(),
            modules: HashMap::new(),
            dir_stack: Vec::new(),
            loading: Vec::new(),
            loader: None,
            out,
            started: Instant::now(),
            trace: false,
        }
    }

    pub fn set_loader(&mut self, loader: Box<dyn ModuleLoader>) {
        self.loader = Some(loader);
    }

    /// Directory that the root script's imports resolve against.
    pub fn set_script_dir(&mut self, dir: PathBuf) {
        if self.dir_stack.is_empty() {
            self.dir_stack.push(dir);
        } else {
            self.dir_stack[0] = dir;
        }
    }

    /// Toggle per-instruction disassembly traces on stderr.
    pub fn set_trace(&mut self, on: bool) {
        self.trace = on;
    }

    /// Seconds since this VM was created; the `clock()` epoch.
    pub fn elapsed_seconds(&self) -> f64 {
        self.started.elapsed().as_secs_f64()
    }

    /// Look up a global by name, for the driver and tests.
    pub fn get_global(&self, name: &str) -> Option<Value> {
        self.globals.get(name).cloned()
    }

    /// Execute a compiled script on the current globals. Globals, loaded
    /// modules and the clock persist across calls, so a REPL can feed one
    /// script per line into the same VM.
    pub fn run(&mut self, script: Rc<Function>) -> Result<(), RuntimeError> {
        let frame_floor = self.frames.len();
        let handler_floor = self.try_handlers.len();
        self.stack.push(Value::Fn(Rc::clone(&script)));
        self.frames.push(CallFrame { func: script, ip: 0, base: self.stack.len() - 1, defining_class: None });
        match self.execute(frame_floor, handler_floor) {
            Ok(()) => Ok(()),
            Err(unwind) => {
                let error = self.unwind_to_error(unwind);
                self.stack.clear();
                self.frames.clear();
                self.try_handlers.clear();
                Err(error)
            }
        }
    }

    // ─── Dispatch loop ───

    /// Run until the frame stack drops back to `frame_floor`. Handlers at or
    /// below `handler_floor` belong to an outer context and are never
    /// consulted here; a throw that reaches the floor propagates as `Err`.
    fn execute(&mut self, frame_floor: usize, handler_floor: usize) -> Result<(), Unwind> {
        loop {
            if self.trace {
                self.trace_instruction();
            }
            let op = self.read_op()?;
            match op {
                OpCode::Constant => {
                    let value = self.read_constant();
                    self.stack.push(value);
                }
                OpCode::Nil => self.stack.push(Value::Nil),
                OpCode::True => self.stack.push(Value::Bool(true)),
                OpCode::False => self.stack.push(Value::Bool(false)),

                OpCode::Pop => {
                    self.pop();
                }
                OpCode::Dup => {
                    let top = self.peek(0);
                    self.stack.push(top);
                }
                OpCode::Dup2 => {
                    let b = self.peek(0);
                    let a = self.peek(1);
                    self.stack.push(a);
                    self.stack.push(b);
                }
                OpCode::Rot3 => {
                    let c = self.pop();
                    let b = self.pop();
                    let a = self.pop();
                    self.stack.push(c);
                    self.stack.push(a);
                    self.stack.push(b);
                }

                OpCode::GetLocal => {
                    let slot = self.read_u16() as usize;
                    let value = self.stack[self.top_frame().base + slot].clone();
                    self.stack.push(value);
                }
                OpCode::SetLocal => {
                    let slot = self.read_u16() as usize;
                    let value = self.peek(0);
                    let base = self.top_frame().base;
                    self.stack[base + slot] = value;
                }
                OpCode::DefineGlobal => {
                    let name = self.read_name()?;
                    let value = self.pop();
                    self.globals.insert(name.to_string(), value);
                }
                OpCode::GetGlobal => {
                    let name = self.read_name()?;
                    match self.globals.get(name.as_ref()) {
                        Some(value) => {
                            let value = value.clone();
                            self.stack.push(value);
                        }
                        None => self.rt_error(handler_floor, format!("undefined variable '{name}'"))?,
                    }
                }
                OpCode::SetGlobal => {
                    let name = self.read_name()?;
                    if self.globals.contains_key(name.as_ref()) {
                        let value = self.peek(0);
                        self.globals.insert(name.to_string(), value);
                    } else {
                        self.rt_error(handler_floor, format!("undefined variable '{name}'"))?;
                    }
                }

                OpCode::GetField => {
                    let name = self.read_name()?;
                    let target = self.pop();
                    match &target {
                        Value::Instance(instance) => {
                            let field = instance.fields.borrow().get(name.as_ref()).cloned();
                            if let Some(value) = field {
                                self.stack.push(value);
                            } else if let Some((method, defined_in)) =
                                Class::find_method(&instance.class, &name)
                            {
                                self.stack.push(Value::Bound(Rc::new(BoundMethod {
                                    receiver: target.clone(),
                                    method,
                                    defined_in,
                                })));
                            } else {
                                self.rt_error(handler_floor, format!("undefined property '{name}'"))?;
                            }
                        }
                        Value::Class(class) => match Class::find_static(class, &name) {
                            Some(method) => self.stack.push(Value::Fn(method)),
                            None => self.rt_error(
                                handler_floor,
                                format!("class '{}' has no static method '{name}'", class.name),
                            )?,
                        },
                        Value::Module(module) => match module.exports.get(name.as_ref()) {
                            Some(value) => {
                                let value = value.clone();
                                self.stack.push(value);
                            }
                            None => self.rt_error(
                                handler_floor,
                                format!("module '{}' has no member '{name}'", module.name),
                            )?,
                        },
                        other => self.rt_error(
                            handler_floor,
                            format!(
                                "can only access properties on instances, classes and modules, got {}",
                                other.type_name()
                            ),
                        )?,
                    }
                }
                OpCode::SetField => {
                    let name = self.read_name()?;
                    let value = self.pop();
                    let target = self.pop();
                    match &target {
                        Value::Instance(instance) => {
                            instance.fields.borrow_mut().insert(name.to_string(), value.clone());
                            self.stack.push(value);
                        }
                        Value::Module(_) => self.rt_error(
                            handler_floor,
                            format!("cannot assign to module member '{name}'"),
                        )?,
                        other => self.rt_error(
                            handler_floor,
                            format!("can only set fields on instances, got {}", other.type_name()),
                        )?,
                    }
                }
                OpCode::GetIndex => {
                    let index = self.pop();
                    let target = self.pop();
                    match (&target, &index) {
                        (Value::Array(items), Value::Num(n)) => {
                            let len = items.borrow().len();
                            match checked_index(*n, len) {
                                Ok(i) => {
                                    let value = items.borrow()[i].clone();
                                    self.stack.push(value);
                                }
                                Err(message) => self.rt_error(handler_floor, message)?,
                            }
                        }
                        (Value::Str(s), Value::Num(n)) => {
                            let chars: Vec<char> = s.chars().collect();
                            match checked_index(*n, chars.len()) {
                                Ok(i) => self.stack.push(Value::str(chars[i].to_string())),
                                Err(message) => self.rt_error(handler_floor, message)?,
                            }
                        }
                        (Value::Array(_) | Value::Str(_), other) => self.rt_error(
                            handler_floor,
                            format!("index must be a number, got {}", other.type_name()),
                        )?,
                        (other, _) => self.rt_error(
                            handler_floor,
                            format!("can only index arrays and strings, got {}", other.type_name()),
                        )?,
                    }
                }
                OpCode::SetIndex => {
                    let value = self.pop();
                    let index = self.pop();
                    let target = self.pop();
                    match (&target, &index) {
                        (Value::Array(items), Value::Num(n)) => {
                            let len = items.borrow().len();
                            match checked_index(*n, len) {
                                Ok(i) => {
                                    items.borrow_mut()[i] = value.clone();
                                    self.stack.push(value);
                                }
                                Err(message) => self.rt_error(handler_floor, message)?,
                            }
                        }
                        (Value::Array(_), other) => self.rt_error(
                            handler_floor,
                            format!("index must be a number, got {}", other.type_name()),
                        )?,
                        (other, _) => self.rt_error(
                            handler_floor,
                            format!("can only assign into arrays, got {}", other.type_name()),
                        )?,
                    }
                }

                OpCode::Add => {
                    let b = self.pop();
                    let a = self.pop();
                    match (&a, &b) {
                        (Value::Num(a), Value::Num(b)) => self.stack.push(Value::Num(a + b)),
                        (Value::Str(a), Value::Str(b)) => {
                            let mut joined = String::with_capacity(a.len() + b.len());
                            joined.push_str(a);
                            joined.push_str(b);
                            self.stack.push(Value::str(joined));
                        }
                        (Value::Array(a), Value::Array(b)) => {
                            let mut items = a.borrow().clone();
                            items.extend(b.borrow().iter().cloned());
                            self.stack.push(Value::array(items));
                        }
                        (a, b) => self.rt_error(
                            handler_floor,
                            format!(
                                "operands to '+' must be two numbers, two strings or two arrays, got {} and {}",
                                a.type_name(),
                                b.type_name()
                            ),
                        )?,
                    }
                }
                OpCode::Sub => self.num_binop(handler_floor, "-", |a, b| a - b)?,
                OpCode::Mul => self.num_binop(handler_floor, "*", |a, b| a * b)?,
                // IEEE semantics: dividing by zero yields an infinity.
                OpCode::Div => self.num_binop(handler_floor, "/", |a, b| a / b)?,
                OpCode::Mod => self.num_binop(handler_floor, "%", |a, b| a % b)?,
                OpCode::Neg => {
                    let value = self.pop();
                    match value {
                        Value::Num(n) => self.stack.push(Value::Num(-n)),
                        other => self.rt_error(
                            handler_floor,
                            format!("operand to '-' must be a number, got {}", other.type_name()),
                        )?,
                    }
                }
                OpCode::Not => {
                    let value = self.pop();
                    self.stack.push(Value::Bool(!value.truthiness()));
                }

                OpCode::Eq => {
                    let b = self.pop();
                    let a = self.pop();
                    self.stack.push(Value::Bool(a == b));
                }
                OpCode::NotEq => {
                    let b = self.pop();
                    let a = self.pop();
                    self.stack.push(Value::Bool(a != b));
                }
                OpCode::Lt => self.num_cmp(handler_floor, "<", |a, b| a < b)?,
                OpCode::LtEq => self.num_cmp(handler_floor, "<=", |a, b| a <= b)?,
                OpCode::Gt => self.num_cmp(handler_floor, ">", |a, b| a > b)?,
                OpCode::GtEq => self.num_cmp(handler_floor, ">=", |a, b| a >= b)?,
                OpCode::Is => {
                    let class_value = self.pop();
                    let value = self.pop();
                    match (&value, &class_value) {
                        (Value::Instance(instance), Value::Class(class)) => {
                            let result = Class::derives_from(&instance.class, class);
                            self.stack.push(Value::Bool(result));
                        }
                        (_, Value::Class(_)) => self.stack.push(Value::Bool(false)),
                        (_, other) => self.rt_error(
                            handler_floor,
                            format!("right operand to 'is' must be a class, got {}", other.type_name()),
                        )?,
                    }
                }
                OpCode::In => {
                    let container = self.pop();
                    let value = self.pop();
                    match (&value, &container) {
                        (needle, Value::Array(items)) => {
                            let found = items.borrow().iter().any(|item| item == needle);
                            self.stack.push(Value::Bool(found));
                        }
                        (Value::Str(needle), Value::Str(hay)) => {
                            self.stack.push(Value::Bool(hay.contains(needle.as_ref())));
                        }
                        (other, Value::Str(_)) => self.rt_error(
                            handler_floor,
                            format!(
                                "left operand to 'in' must be a string when testing a string, got {}",
                                other.type_name()
                            ),
                        )?,
                        (Value::Num(n), Value::Range { start, end, inclusive }) => {
                            let inside =
                                *n >= *start && if *inclusive { *n <= *end } else { *n < *end };
                            self.stack.push(Value::Bool(inside));
                        }
                        (other, Value::Range { .. }) => self.rt_error(
                            handler_floor,
                            format!(
                                "left operand to 'in' must be a number when testing a range, got {}",
                                other.type_name()
                            ),
                        )?,
                        (_, other) => self.rt_error(
                            handler_floor,
                            format!(
                                "right operand to 'in' must be an array, string or range, got {}",
                                other.type_name()
                            ),
                        )?,
                    }
                }

                OpCode::Range => {
                    let inclusive = self.read_byte() == 1;
                    let end = self.pop();
                    let start = self.pop();
                    match (&start, &end) {
                        (Value::Num(s), Value::Num(e)) => {
                            self.stack.push(Value::Range { start: *s, end: *e, inclusive });
                        }
                        (a, b) => self.rt_error(
                            handler_floor,
                            format!(
                                "range bounds must be numbers, got {} and {}",
                                a.type_name(),
                                b.type_name()
                            ),
                        )?,
                    }
                }
                OpCode::Array => {
                    let count = self.read_u16() as usize;
                    let start = self.stack.len() - count;
                    let items = self.stack.split_off(start);
                    self.stack.push(Value::array(items));
                }

                OpCode::Jump => {
                    let offset = self.read_u16() as usize;
                    self.top_frame_mut().ip += offset;
                }
                OpCode::JumpIfFalse => {
                    let offset = self.read_u16() as usize;
                    if !self.peek(0).truthiness() {
                        self.top_frame_mut().ip += offset;
                    }
                }
                OpCode::Loop => {
                    let offset = self.read_u16() as usize;
                    self.top_frame_mut().ip -= offset;
                }

                OpCode::Call => {
                    let argc = self.read_byte() as usize;
                    let callee = self.peek(argc);
                    self.call_value(callee, argc, handler_floor)?;
                }
                OpCode::Invoke => {
                    let name = self.read_name()?;
                    let argc = self.read_byte() as usize;
                    self.invoke(&name, argc, handler_floor)?;
                }
                OpCode::Ret => {
                    let result = self.pop();
                    let Some(frame) = self.frames.pop() else {
                        return Err(Unwind::Fatal("corrupt bytecode: RET with no frame".to_string()));
                    };
                    // Handlers opened by the returning frame die with it.
                    while self
                        .try_handlers
                        .last()
                        .is_some_and(|handler| handler.frame_count > self.frames.len())
                    {
                        self.try_handlers.pop();
                    }
                    self.stack.truncate(frame.base);
                    if self.frames.len() == frame_floor {
                        return Ok(());
                    }
                    self.stack.push(result);
                }
                OpCode::Print => {
                    let value = self.pop();
                    if let Err(e) = writeln!(self.out, "{value}") {
                        return Err(Unwind::Fatal(format!("i/o error: {e}")));
                    }
                }

                OpCode::Class => {
                    let name = self.read_name()?;
                    self.stack.push(Value::Class(Rc::new(Class::new(name.as_ref()))));
                }
                OpCode::Inherit => {
                    let superclass = self.pop();
                    let class_value = self.peek(0);
                    match (&class_value, &superclass) {
                        (Value::Class(class), Value::Class(parent)) => {
                            *class.superclass.borrow_mut() = Some(Rc::clone(parent));
                        }
                        (Value::Class(_), other) => self.rt_error(
                            handler_floor,
                            format!("superclass must be a class, got {}", other.type_name()),
                        )?,
                        _ => {
                            return Err(Unwind::Fatal(
                                "corrupt bytecode: INHERIT without a class".to_string(),
                            ))
                        }
                    }
                }
                OpCode::Method => {
                    let name = self.read_name()?;
                    let method = self.pop();
                    let class_value = self.peek(0);
                    match (&class_value, &method) {
                        (Value::Class(class), Value::Fn(func)) => {
                            class.methods.borrow_mut().insert(name.to_string(), Rc::clone(func));
                        }
                        _ => {
                            return Err(Unwind::Fatal(
                                "corrupt bytecode: METHOD without class and function".to_string(),
                            ))
                        }
                    }
                }
                OpCode::StaticMethod => {
                    let name = self.read_name()?;
                    let method = self.pop();
                    let class_value = self.peek(0);
                    match (&class_value, &method) {
                        (Value::Class(class), Value::Fn(func)) => {
                            class.statics.borrow_mut().insert(name.to_string(), Rc::clone(func));
                        }
                        _ => {
                            return Err(Unwind::Fatal(
                                "corrupt bytecode: STATIC_METHOD without class and function".to_string(),
                            ))
                        }
                    }
                }
                OpCode::GetBase => {
                    let name = self.read_name()?;
                    let receiver = self.pop();
                    let parent = self.base_class()?;
                    match Class::find_method(&parent, &name) {
                        Some((method, defined_in)) => {
                            self.stack.push(Value::Bound(Rc::new(BoundMethod {
                                receiver,
                                method,
                                defined_in,
                            })));
                        }
                        None => self.rt_error(handler_floor, format!("undefined property '{name}'"))?,
                    }
                }
                OpCode::InvokeBase => {
                    let name = self.read_name()?;
                    let argc = self.read_byte() as usize;
                    let parent = self.base_class()?;
                    match Class::find_method(&parent, &name) {
                        Some((method, defined_in)) => {
                            self.call_function(method, argc, Some(defined_in), handler_floor)?;
                        }
                        None => self.rt_error(handler_floor, format!("undefined property '{name}'"))?,
                    }
                }

                OpCode::IterNew => {
                    let value = self.pop();
                    let iter = match &value {
                        Value::Range { start, end, inclusive } => {
                            Iter::Range { next: *start, end: *end, inclusive: *inclusive }
                        }
                        Value::Array(items) => Iter::Array { items: items.borrow().clone(), pos: 0 },
                        Value::Str(s) => Iter::Str { chars: s.chars().collect(), pos: 0 },
                        other => {
                            self.rt_error(
                                handler_floor,
                                format!(
                                    "can only iterate ranges, arrays and strings, got {}",
                                    other.type_name()
                                ),
                            )?;
                            continue;
                        }
                    };
                    self.stack.push(Value::Iter(Rc::new(RefCell::new(iter))));
                }
                OpCode::IterNext => {
                    let exit = self.read_u16() as usize;
                    let top = self.peek(0);
                    let Value::Iter(iter) = top else {
                        return Err(Unwind::Fatal(
                            "corrupt bytecode: ITER_NEXT without an iterator".to_string(),
                        ));
                    };
                    let next = iter.borrow_mut().next();
                    match next {
                        Some(value) => self.stack.push(value),
                        None => self.top_frame_mut().ip += exit,
                    }
                }

                OpCode::TryPush => {
                    let offset = self.read_u16() as usize;
                    let handler_ip = self.top_frame().ip + offset;
                    self.try_handlers.push(TryHandler {
                        ip: handler_ip,
                        frame_count: self.frames.len(),
                        stack_len: self.stack.len(),
                    });
                }
                OpCode::TryPop => {
                    if self.try_handlers.pop().is_none() {
                        return Err(Unwind::Fatal(
                            "corrupt bytecode: TRY_POP with no handler".to_string(),
                        ));
                    }
                }
                OpCode::Throw => {
                    let value = self.pop();
                    self.throw(value, handler_floor)?;
                }

                OpCode::Import => {
                    let path = self.read_name()?;
                    self.import_module(&path, handler_floor)?;
                }
            }
        }
    }

    // ─── Calls ───

    fn call_value(&mut self, callee: Value, argc: usize, handler_floor: usize) -> Result<(), Unwind> {
        match callee {
            Value::Fn(func) => self.call_function(func, argc, None, handler_floor),
            Value::Bound(bound) => {
                // Receiver replaces the callee slot so `this` is slot 0.
                let base = self.stack.len() - argc - 1;
                self.stack[base] = bound.receiver.clone();
                self.call_function(
                    Rc::clone(&bound.method),
                    argc,
                    Some(Rc::clone(&bound.defined_in)),
                    handler_floor,
                )
            }
            Value::Class(class) => {
                let base = self.stack.len() - argc - 1;
                self.stack[base] = Value::Instance(Rc::new(Instance::new(Rc::clone(&class))));
                match Class::find_method(&class, "ctor") {
                    Some((ctor, defined_in)) => {
                        self.call_function(ctor, argc, Some(defined_in), handler_floor)
                    }
                    None if argc == 0 => Ok(()),
                    None => self.rt_error(
                        handler_floor,
                        format!("expected 0 arguments but got {argc}"),
                    ),
                }
            }
            Value::Native(native) => {
                if native.arity as usize != argc {
                    return self.rt_error(
                        handler_floor,
                        format!("expected {} arguments but got {argc}", native.arity),
                    );
                }
                let args = self.stack.split_off(self.stack.len() - argc);
                self.stack.pop();
                match (native.func)(self, &args) {
                    Ok(value) => {
                        self.stack.push(value);
                        Ok(())
                    }
                    Err(message) => self.rt_error(handler_floor, message),
                }
            }
            other => self.rt_error(
                handler_floor,
                format!("can only call functions and classes, got {}", other.type_name()),
            ),
        }
    }

    fn call_function(
        &mut self,
        func: Rc<Function>,
        argc: usize,
        defining_class: Option<Rc<Class>>,
        handler_floor: usize,
    ) -> Result<(), Unwind> {
        if func.arity as usize != argc {
            return self.rt_error(
                handler_floor,
                format!("expected {} arguments but got {argc}", func.arity),
            );
        }
        if self.frames.len() >= MAX_FRAMES {
            return Err(Unwind::Fatal("stack overflow".to_string()));
        }
        let base = self.stack.len() - argc - 1;
        self.frames.push(CallFrame { func, ip: 0, base, defining_class });
        Ok(())
    }

    /// `recv.name(args)` without materialising a bound method.
    fn invoke(&mut self, name: &str, argc: usize, handler_floor: usize) -> Result<(), Unwind> {
        let receiver = self.peek(argc);
        match &receiver {
            Value::Instance(instance) => {
                // Fields shadow methods, so a lambda stored in a field is
                // callable through the same syntax.
                let field = instance.fields.borrow().get(name).cloned();
                if let Some(value) = field {
                    let base = self.stack.len() - argc - 1;
                    self.stack[base] = value.clone();
                    return self.call_value(value, argc, handler_floor);
                }
                match Class::find_method(&instance.class, name) {
                    Some((method, defined_in)) => {
                        self.call_function(method, argc, Some(defined_in), handler_floor)
                    }
                    None => self.rt_error(handler_floor, format!("undefined property '{name}'")),
                }
            }
            Value::Class(class) => match Class::find_static(class, name) {
                Some(method) => self.call_function(method, argc, None, handler_floor),
                None => self.rt_error(
                    handler_floor,
                    format!("class '{}' has no static method '{name}'", class.name),
                ),
            },
            Value::Module(module) => match module.exports.get(name) {
                Some(value) => {
                    let value = value.clone();
                    let base = self.stack.len() - argc - 1;
                    self.stack[base] = value.clone();
                    self.call_value(value, argc, handler_floor)
                }
                None => self.rt_error(
                    handler_floor,
                    format!("module '{}' has no member '{name}'", module.name),
                ),
            },
            Value::Array(items) => {
                let items = Rc::clone(items);
                self.invoke_array(items, name, argc, handler_floor)
            }
            other => self.rt_error(
                handler_floor,
                format!(
                    "can only call methods on instances, classes, arrays and modules, got {}",
                    other.type_name()
                ),
            ),
        }
    }

    fn invoke_array(
        &mut self,
        items: Rc<RefCell<Vec<Value>>>,
        name: &str,
        argc: usize,
        handler_floor: usize,
    ) -> Result<(), Unwind> {
        match name {
            "push" => {
                if argc != 1 {
                    return self.rt_error(
                        handler_floor,
                        format!("expected 1 arguments but got {argc}"),
                    );
                }
                let value = self.pop();
                self.pop();
                items.borrow_mut().push(value);
                self.stack.push(Value::Nil);
                Ok(())
            }
            "pop" => {
                if argc != 0 {
                    return self.rt_error(
                        handler_floor,
                        format!("expected 0 arguments but got {argc}"),
                    );
                }
                self.pop();
                let popped = items.borrow_mut().pop();
                match popped {
                    Some(value) => {
                        self.stack.push(value);
                        Ok(())
                    }
                    None => self.rt_error(handler_floor, "pop from empty array".to_string()),
                }
            }
            _ => self.rt_error(handler_floor, format!("arrays have no method '{name}'")),
        }
    }

    // ─── Exceptions ───

    /// Raise `value`. When a handler above `handler_floor` exists, control
    /// transfers to it (frames, stack and ip restored, value pushed) and the
    /// dispatch loop simply continues; otherwise the throw propagates out.
    fn throw(&mut self, value: Value, handler_floor: usize) -> Result<(), Unwind> {
        if self.try_handlers.len() > handler_floor {
            let Some(handler) = self.try_handlers.pop() else {
                return Err(Unwind::Throw(value));
            };
            self.frames.truncate(handler.frame_count);
            self.stack.truncate(handler.stack_len);
            self.top_frame_mut().ip = handler.ip;
            self.stack.push(value);
            Ok(())
        } else {
            Err(Unwind::Throw(value))
        }
    }

    fn rt_error(&mut self, handler_floor: usize, message: String) -> Result<(), Unwind> {
        self.throw(Value::str(message), handler_floor)
    }

    fn base_class(&self) -> Result<Rc<Class>, Unwind> {
        let frame = self.top_frame();
        let Some(defining) = frame.defining_class.as_ref() else {
            return Err(Unwind::Fatal("corrupt bytecode: 'base' outside a method".to_string()));
        };
        let parent = defining.superclass.borrow().clone();
        parent.ok_or_else(|| Unwind::Fatal("corrupt bytecode: 'base' without a superclass".to_string()))
    }

    fn unwind_to_error(&self, unwind: Unwind) -> RuntimeError {
        let message = match unwind {
            Unwind::Throw(Value::Str(s)) => s.to_string(),
            Unwind::Throw(value) => format!("uncaught exception: {value}"),
            Unwind::Fatal(message) => message,
        };
        RuntimeError { message, traceback: self.traceback() }
    }

    fn traceback(&self) -> Vec<String> {
        self.frames
            .iter()
            .rev()
            .map(|frame| {
                let line = frame.func.chunk.line_at(frame.ip.saturating_sub(1));
                format!("[line {line}] in {}", frame.func.name)
            })
            .collect()
    }

    // ─── Imports ───

    /// Load the module at `rel_path` (relative to the importing script's
    /// directory) and push its value. Each module executes once, in fresh
    /// globals, and is cached by canonical path.
    fn import_module(&mut self, rel_path: &str, handler_floor: usize) -> Result<(), Unwind> {
        let base_dir = self.dir_stack.last().cloned().unwrap_or_else(|| PathBuf::from("."));
        let canonical = match base_dir.join(rel_path).canonicalize() {
            Ok(path) => path,
            Err(e) => {
                return self.rt_error(handler_floor, format!("cannot import '{rel_path}': {e}"))
            }
        };
        if let Some(module) = self.modules.get(&canonical) {
            let module = module.clone();
            self.stack.push(module);
            return Ok(());
        }
        if self.loading.contains(&canonical) {
            return self.rt_error(handler_floor, format!("circular import of '{rel_path}'"));
        }
        let Some(loader) = self.loader.as_ref() else {
            return self.rt_error(
                handler_floor,
                format!("cannot import '{rel_path}': no module loader installed"),
            );
        };
        let script = match loader.load(&canonical) {
            Ok(script) => script,
            Err(message) => {
                return self.rt_error(handler_floor, format!("cannot import '{rel_path}': {message}"))
            }
        };
        let name = canonical
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_else(|| "module".to_string());

        // The module body runs in fresh globals; only the natives carry over.
        let mut fresh = IndexMap::new();
        builtins::register(&mut fresh);
        let saved_globals = std::mem::replace(&mut self.globals, fresh);
        self.loading.push(canonical.clone());
        self.dir_stack.push(
            canonical.parent().map(Path::to_path_buf).unwrap_or_else(|| PathBuf::from(".")),
        );

        let result = self.run_nested(Rc::clone(&script));

        self.dir_stack.pop();
        self.loading.pop();
        let module_globals = std::mem::replace(&mut self.globals, saved_globals);

        match result {
            Ok(()) => {
                let module =
                    Value::Module(Rc::new(Module { name, exports: module_globals }));
                self.modules.insert(canonical, module.clone());
                self.stack.push(module);
                Ok(())
            }
            // Rethrow in the importing context, where outer handlers apply.
            Err(Unwind::Throw(value)) => self.throw(value, handler_floor),
            Err(fatal) => Err(fatal),
        }
    }

    fn run_nested(&mut self, script: Rc<Function>) -> Result<(), Unwind> {
        let frame_floor = self.frames.len();
        let handler_floor = self.try_handlers.len();
        self.stack.push(Value::Fn(Rc::clone(&script)));
        self.call_function(script, 0, None, handler_floor)?;
        self.execute(frame_floor, handler_floor)
    }

    // ─── Stack and decode helpers ───

    fn pop(&mut self) -> Value {
        self.stack.pop().unwrap_or(Value::Nil)
    }

    fn peek(&self, depth: usize) -> Value {
        self.stack[self.stack.len() - 1 - depth].clone()
    }

    fn top_frame(&self) -> &CallFrame {
        &self.frames[self.frames.len() - 1]
    }

    fn top_frame_mut(&mut self) -> &mut CallFrame {
        let last = self.frames.len() - 1;
        &mut self.frames[last]
    }

    fn read_op(&mut self) -> Result<OpCode, Unwind> {
        let byte = self.read_byte();
        OpCode::from_byte(byte)
            .ok_or_else(|| Unwind::Fatal(format!("corrupt bytecode: bad opcode {byte:#04x}")))
    }

    fn read_byte(&mut self) -> u8 {
        let frame = self.top_frame_mut();
        let byte = frame.func.chunk.code[frame.ip];
        frame.ip += 1;
        byte
    }

    fn read_u16(&mut self) -> u16 {
        let frame = self.top_frame_mut();
        let value = frame.func.chunk.read_u16(frame.ip);
        frame.ip += 2;
        value
    }

    fn read_constant(&mut self) -> Value {
        let index = self.read_u16() as usize;
        self.top_frame().func.chunk.constants[index].clone()
    }

    fn read_name(&mut self) -> Result<Rc<str>, Unwind> {
        match self.read_constant() {
            Value::Str(name) => Ok(name),
            other => Err(Unwind::Fatal(format!(
                "corrupt bytecode: name constant is {}",
                other.type_name()
            ))),
        }
    }

    fn num_binop(
        &mut self,
        handler_floor: usize,
        op_name: &str,
        apply: fn(f64, f64) -> f64,
    ) -> Result<(), Unwind> {
        let b = self.pop();
        let a = self.pop();
        match (&a, &b) {
            (Value::Num(a), Value::Num(b)) => {
                self.stack.push(Value::Num(apply(*a, *b)));
                Ok(())
            }
            (a, b) => self.rt_error(
                handler_floor,
                format!(
                    "operands to '{op_name}' must be numbers, got {} and {}",
                    a.type_name(),
                    b.type_name()
                ),
            ),
        }
    }

    fn num_cmp(
        &mut self,
        handler_floor: usize,
        op_name: &str,
        apply: fn(f64, f64) -> bool,
    ) -> Result<(), Unwind> {
        let b = self.pop();
        let a = self.pop();
        match (&a, &b) {
            (Value::Num(a), Value::Num(b)) => {
                self.stack.push(Value::Bool(apply(*a, *b)));
                Ok(())
            }
            (a, b) => self.rt_error(
                handler_floor,
                format!(
                    "operands to '{op_name}' must be numbers, got {} and {}",
                    a.type_name(),
                    b.type_name()
                ),
            ),
        }
    }

    fn trace_instruction(&self) {
        use std::fmt::Write as _;
        let mut stack_text = String::from("          ");
        for value in &self.stack {
            let _ = write!(stack_text, "[ {value} ]");
        }
        eprintln!("{stack_text}");
        let frame = self.top_frame();
        let (text, _) = debug::disassemble_instruction(&frame.func.chunk, frame.ip);
        eprintln!("{text}");
    }
}

/// Validate an index value against a container length.
fn checked_index(n: f64, len: usize) -> Result<usize, String> {
    if n.fract() != 0.0 {
        return Err(format!("index must be an integer, got {}", format_num(n)));
    }
    if n < 0.0 || n >= len as f64 {
        return Err(format!("index {} out of range (len {len})", format_num(n)));
    }
    Ok(n as usize)
}

/// Clonable in-memory sink for capturing VM output in tests and the
/// expected-output harness.
#[derive(Clone, Default)]
pub struct CaptureSink(Rc<RefCell<Vec<u8>>>);

impl CaptureSink {
    pub fn new() -> CaptureSink {
        CaptureSink::default()
    }

    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.borrow()).into_owned()
    }
}

impl Write for CaptureSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.borrow_mut().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::Chunk;

    fn script(build: impl FnOnce(&mut Chunk)) -> Rc<Function> {
        let mut func = Function::new("script", 0);
        build(&mut func.chunk);
        func.chunk.write_op(OpCode::Nil, 99);
        func.chunk.write_op(OpCode::Ret, 99);
        Rc::new(func)
    }

    fn run_capturing(script: Rc<Function>) -> (Result<(), RuntimeError>, String) {
        let sink = CaptureSink::new();
        let mut vm = Vm::new(Box::new(sink.clone()));
        let result = vm.run(script);
        (result, sink.contents())
    }

    fn emit_constant(chunk: &mut Chunk, value: Value, line: u32) {
        let idx = chunk.add_constant(value).unwrap();
        chunk.write_op(OpCode::Constant, line);
        chunk.write_u16(idx, line);
    }

    #[test]
    fn adds_and_prints_numbers() {
        let script = script(|chunk| {
            emit_constant(chunk, Value::Num(1.2), 1);
            emit_constant(chunk, Value::Num(3.4), 1);
            chunk.write_op(OpCode::Add, 1);
            chunk.write_op(OpCode::Print, 1);
        });
        let (result, output) = run_capturing(script);
        assert!(result.is_ok());
        assert_eq!(output, "4.6\n");
    }

    #[test]
    fn concatenates_strings() {
        let script = script(|chunk| {
            emit_constant(chunk, Value::str("foo"), 1);
            emit_constant(chunk, Value::str("bar"), 1);
            chunk.write_op(OpCode::Add, 1);
            chunk.write_op(OpCode::Print, 1);
        });
        let (result, output) = run_capturing(script);
        assert!(result.is_ok());
        assert_eq!(output, "foobar\n");
    }

    #[test]
    fn mixed_add_is_a_runtime_error() {
        let script = script(|chunk| {
            emit_constant(chunk, Value::Num(1.0), 3);
            emit_constant(chunk, Value::str("x"), 3);
            chunk.write_op(OpCode::Add, 3);
            chunk.write_op(OpCode::Print, 3);
        });
        let (result, output) = run_capturing(script);
        let err = result.unwrap_err();
        assert!(err.message.contains("operands to '+'"), "{}", err.message);
        assert_eq!(err.traceback, vec!["[line 3] in script"]);
        assert_eq!(output, "");
    }

    #[test]
    fn globals_round_trip() {
        let script = script(|chunk| {
            emit_constant(chunk, Value::Num(7.0), 1);
            let name = chunk.add_constant(Value::str("answer")).unwrap();
            chunk.write_op(OpCode::DefineGlobal, 1);
            chunk.write_u16(name, 1);
            chunk.write_op(OpCode::GetGlobal, 2);
            chunk.write_u16(name, 2);
            chunk.write_op(OpCode::Print, 2);
        });
        let (result, output) = run_capturing(script);
        assert!(result.is_ok());
        assert_eq!(output, "7\n");
    }

    #[test]
    fn undefined_global_reports_name() {
        let script = script(|chunk| {
            let name = chunk.add_constant(Value::str("nope")).unwrap();
            chunk.write_op(OpCode::GetGlobal, 5);
            chunk.write_u16(name, 5);
            chunk.write_op(OpCode::Print, 5);
        });
        let (result, _) = run_capturing(script);
        assert_eq!(run_err(result), "undefined variable 'nope'");
    }

    fn run_err(result: Result<(), RuntimeError>) -> String {
        result.unwrap_err().message
    }

    #[test]
    fn jump_if_false_takes_the_else_branch() {
        // if (false) print "yes"; else print "no";
        let script = script(|chunk| {
            chunk.write_op(OpCode::False, 1);
            chunk.write_op(OpCode::JumpIfFalse, 1);
            chunk.write_u16(8, 1);
            chunk.write_op(OpCode::Pop, 1);
            emit_constant(chunk, Value::str("yes"), 1);
            chunk.write_op(OpCode::Print, 1);
            chunk.write_op(OpCode::Jump, 1);
            chunk.write_u16(5, 1);
            chunk.write_op(OpCode::Pop, 1);
            emit_constant(chunk, Value::str("no"), 1);
            chunk.write_op(OpCode::Print, 1);
        });
        let (result, output) = run_capturing(script);
        assert!(result.is_ok());
        assert_eq!(output, "no\n");
    }

    #[test]
    fn calls_a_function_and_checks_arity() {
        let mut double = Function::new("double", 1);
        double.chunk.write_op(OpCode::GetLocal, 1);
        double.chunk.write_u16(1, 1);
        emit_constant(&mut double.chunk, Value::Num(2.0), 1);
        double.chunk.write_op(OpCode::Mul, 1);
        double.chunk.write_op(OpCode::Ret, 1);
        let double = Rc::new(double);

        let good = {
            let double = Rc::clone(&double);
            script(move |chunk| {
                emit_constant(chunk, Value::Fn(double), 2);
                emit_constant(chunk, Value::Num(21.0), 2);
                chunk.write_op(OpCode::Call, 2);
                chunk.write_byte(1, 2);
                chunk.write_op(OpCode::Print, 2);
            })
        };
        let (result, output) = run_capturing(good);
        assert!(result.is_ok());
        assert_eq!(output, "42\n");

        let bad = script(move |chunk| {
            emit_constant(chunk, Value::Fn(double), 2);
            chunk.write_op(OpCode::Call, 2);
            chunk.write_byte(0, 2);
            chunk.write_op(OpCode::Print, 2);
        });
        let (result, _) = run_capturing(bad);
        assert_eq!(run_err(result), "expected 1 arguments but got 0");
    }

    #[test]
    fn throw_is_caught_by_handler() {
        let script = script(|chunk| {
            chunk.write_op(OpCode::TryPush, 1);
            chunk.write_u16(7, 1);
            emit_constant(chunk, Value::str("boom"), 2);
            chunk.write_op(OpCode::Throw, 2);
            chunk.write_op(OpCode::Jump, 3);
            chunk.write_u16(1, 3);
            chunk.write_op(OpCode::Print, 4);
        });
        let (result, output) = run_capturing(script);
        assert!(result.is_ok(), "{result:?}");
        assert_eq!(output, "boom\n");
    }

    #[test]
    fn uncaught_throw_surfaces_the_value() {
        let script = script(|chunk| {
            emit_constant(chunk, Value::Num(42.0), 2);
            chunk.write_op(OpCode::Throw, 2);
        });
        let (result, _) = run_capturing(script);
        assert_eq!(run_err(result), "uncaught exception: 42");
    }

    #[test]
    fn deep_recursion_overflows_fatally() {
        let mut forever = Function::new("forever", 0);
        forever.chunk.write_op(OpCode::GetLocal, 1);
        forever.chunk.write_u16(0, 1);
        forever.chunk.write_op(OpCode::Call, 1);
        forever.chunk.write_byte(0, 1);
        forever.chunk.write_op(OpCode::Ret, 1);
        let forever = Rc::new(forever);

        // Even inside try/catch the overflow is not catchable.
        let script = script(move |chunk| {
            chunk.write_op(OpCode::TryPush, 1);
            chunk.write_u16(10, 1);
            emit_constant(chunk, Value::Fn(forever), 2);
            chunk.write_op(OpCode::Call, 2);
            chunk.write_byte(0, 2);
            chunk.write_op(OpCode::Pop, 2);
            chunk.write_op(OpCode::TryPop, 2);
            chunk.write_op(OpCode::Jump, 3);
            chunk.write_u16(1, 3);
            chunk.write_op(OpCode::Print, 4);
        });
        let (result, output) = run_capturing(script);
        let err = result.unwrap_err();
        assert_eq!(err.message, "stack overflow");
        assert_eq!(err.traceback.len(), MAX_FRAMES);
        assert_eq!(output, "");
    }

    #[test]
    fn iterates_a_range() {
        // for (i in 0..3) print i;
        let script = script(|chunk| {
            emit_constant(chunk, Value::Num(0.0), 1);
            emit_constant(chunk, Value::Num(3.0), 1);
            chunk.write_op(OpCode::Range, 1);
            chunk.write_byte(0, 1);
            chunk.write_op(OpCode::IterNew, 1);
            // loop head at offset 9
            chunk.write_op(OpCode::IterNext, 1);
            chunk.write_u16(4, 1);
            chunk.write_op(OpCode::Print, 1);
            chunk.write_op(OpCode::Loop, 1);
            chunk.write_u16(7, 1);
            // exit: pop the iterator
            chunk.write_op(OpCode::Pop, 1);
        });
        let (result, output) = run_capturing(script);
        assert!(result.is_ok(), "{result:?}");
        assert_eq!(output, "0\n1\n2\n");
    }

    #[test]
    fn capture_sink_reads_back() {
        let sink = CaptureSink::new();
        let mut writer = sink.clone();
        writeln!(writer, "hello").unwrap();
        assert_eq!(sink.contents(), "hello\n");
    }
}
