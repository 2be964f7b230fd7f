//! Heap object types: functions, classes, instances, modules, iterators.

use std::cell::RefCell;
use std::rc::Rc;

use indexmap::IndexMap;

use crate::chunk::Chunk;
use crate::value::Value;
use crate::vm::Vm;

/// A compiled Kiln function. The script top level and every `fn`, method
/// and lambda each compile to one of these.
#[derive(Debug, Default)]
pub struct Function {
    pub name: String,
    pub arity: u8,
    pub chunk: Chunk,
}

impl Function {
    pub fn new(name: impl Into<String>, arity: u8) -> Function {
        Function { name: name.into(), arity, chunk: Chunk::new() }
    }
}

/// Signature of a native function. Natives receive the VM (so `clock` can
/// read its start instant) and their arguments; an `Err` message becomes a
/// thrown, catchable runtime error.
pub type NativeFn = fn(&mut Vm, &[Value]) -> Result<Value, String>;

/// A built-in function implemented in Rust.
#[derive(Debug)]
pub struct Native {
    pub name: &'static str,
    pub arity: u8,
    pub func: NativeFn,
}

/// A class. The superclass link and method tables are populated by the
/// `Inherit`/`Method`/`StaticMethod` instructions after the class object
/// already exists, hence the interior mutability.
#[derive(Debug)]
pub struct Class {
    pub name: String,
    pub superclass: RefCell<Option<Rc<Class>>>,
    pub methods: RefCell<IndexMap<String, Rc<Function>>>,
    pub statics: RefCell<IndexMap<String, Rc<Function>>>,
}

impl Class {
    pub fn new(name: impl Into<String>) -> Class {
        Class {
            name: name.into(),
            superclass: RefCell::new(None),
            methods: RefCell::new(IndexMap::new()),
            statics: RefCell::new(IndexMap::new()),
        }
    }

    /// Look up an instance method, walking the superclass chain. Returns the
    /// method together with the class that defines it, which anchors `base`
    /// resolution inside the method body.
    pub fn find_method(class: &Rc<Class>, name: &str) -> Option<(Rc<Function>, Rc<Class>)> {
        let mut current = Rc::clone(class);
        loop {
            if let Some(method) = current.methods.borrow().get(name) {
                return Some((Rc::clone(method), Rc::clone(&current)));
            }
            let parent = current.superclass.borrow().clone();
            match parent {
                Some(parent) => current = parent,
                None => return None,
            }
        }
    }

    /// Look up a static method, walking the superclass chain.
    pub fn find_static(class: &Rc<Class>, name: &str) -> Option<Rc<Function>> {
        let mut current = Rc::clone(class);
        loop {
            if let Some(method) = current.statics.borrow().get(name) {
                return Some(Rc::clone(method));
            }
            let parent = current.superclass.borrow().clone();
            match parent {
                Some(parent) => current = parent,
                None => return None,
            }
        }
    }

    /// True if `class` is `target` or inherits from it; backs `is`.
    pub fn derives_from(class: &Rc<Class>, target: &Rc<Class>) -> bool {
        let mut current = Rc::clone(class);
        loop {
            if Rc::ptr_eq(&current, target) {
                return true;
            }
            let parent = current.superclass.borrow().clone();
            match parent {
                Some(parent) => current = parent,
                None => return false,
            }
        }
    }
}

/// An instance with open fields: assigning to a missing field creates it.
/// `IndexMap` keeps field order deterministic for printing and tests.
#[derive(Debug)]
pub struct Instance {
    pub class: Rc<Class>,
    pub fields: RefCell<IndexMap<String, Value>>,
}

impl Instance {
    pub fn new(class: Rc<Class>) -> Instance {
        Instance { class, fields: RefCell::new(IndexMap::new()) }
    }
}

/// A method bound to its receiver. `defined_in` is the class whose table
/// held the method, not the receiver's class.
#[derive(Debug)]
pub struct BoundMethod {
    pub receiver: Value,
    pub method: Rc<Function>,
    pub defined_in: Rc<Class>,
}

/// A loaded module: the globals its top level defined, frozen after the
/// module body finishes.
#[derive(Debug)]
pub struct Module {
    pub name: String,
    pub exports: IndexMap<String, Value>,
}

/// Iterator state for `for` loops.
#[derive(Debug)]
pub enum Iter {
    /// Counts up by 1. NaN bounds yield nothing.
    Range { next: f64, end: f64, inclusive: bool },
    /// Snapshot of the array's elements at loop entry, so mutation inside
    /// the body cannot skip or repeat elements.
    Array { items: Vec<Value>, pos: usize },
    /// Yields one-character strings.
    Str { chars: Vec<char>, pos: usize },
}

impl Iter {
    pub fn next(&mut self) -> Option<Value> {
        match self {
            Iter::Range { next, end, inclusive } => {
                let more = if *inclusive { *next <= *end } else { *next < *end };
                if !more {
                    return None;
                }
                let value = *next;
                *next += 1.0;
                Some(Value::Num(value))
            }
            Iter::Array { items, pos } => {
                let value = items.get(*pos).cloned()?;
                *pos += 1;
                Some(value)
            }
            Iter::Str { chars, pos } => {
                let c = chars.get(*pos).copied()?;
                *pos += 1;
                Some(Value::str(c.to_string()))
            }
        }
    }
}

// ═══════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════
