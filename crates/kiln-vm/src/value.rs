//! Runtime values.

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use crate::object::{BoundMethod, Class, Function, Instance, Iter, Module, Native};

/// A Kiln runtime value.
///
/// Numbers, booleans, nil and ranges live inline; everything else is a
/// reference-counted heap object. Cloning a `Value` is always cheap.
#[derive(Debug, Clone)]
pub enum Value {
    Nil,
    Bool(bool),
    /// The language's only number type: an IEEE-754 double.
    Num(f64),
    Str(Rc<str>),
    Array(Rc<RefCell<Vec<Value>>>),
    Range { start: f64, end: f64, inclusive: bool },
    Fn(Rc<Function>),
    Native(Rc<Native>),
    Class(Rc<Class>),
    Instance(Rc<Instance>),
    Bound(Rc<BoundMethod>),
    Module(Rc<Module>),
    /// Loop iterator state; lives only in a hidden `for` slot and is never
    /// observable from the language.
    Iter(Rc<RefCell<Iter>>),
}

impl Value {
    /// `nil` and `false` are falsey; everything else, including `0` and
    /// `""`, is truthy.
    pub fn truthiness(&self) -> bool {
        !matches!(self, Value::Nil | Value::Bool(false))
    }

    /// The name `type()` reports and error messages use.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Nil => "nil",
            Value::Bool(_) => "bool",
            Value::Num(_) => "num",
            Value::Str(_) => "str",
            Value::Array(_) => "array",
            Value::Range { .. } => "range",
            Value::Fn(_) | Value::Native(_) | Value::Bound(_) => "fn",
            Value::Class(_) => "class",
            Value::Instance(_) => "instance",
            Value::Module(_) => "module",
            Value::Iter(_) => "iter",
        }
    }

    pub fn str(s: impl Into<Rc<str>>) -> Value {
        Value::Str(s.into())
    }

    pub fn array(items: Vec<Value>) -> Value {
        Value::Array(Rc::new(RefCell::new(items)))
    }
}

/// Format a double the way the language prints it: shortest string that
/// round-trips, integral values without a decimal point.
pub fn format_num(value: f64) -> String {
    if value.is_nan() {
        return "NaN".to_string();
    }
    if value.is_infinite() {
        return if value > 0.0 { "Inf" } else { "-Inf" }.to_string();
    }
    format!("{value}")
}

impl PartialEq for Value {
    fn eq(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Nil, Value::Nil) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Num(a), Value::Num(b)) => a == b,
            (Value::Str(a), Value::Str(b)) => a == b,
            // Element-wise, with an identity fast path.
            (Value::Array(a), Value::Array(b)) => {
                Rc::ptr_eq(a, b) || *a.borrow() == *b.borrow()
            }
            (
                Value::Range { start: a0, end: a1, inclusive: ai },
                Value::Range { start: b0, end: b1, inclusive: bi },
            ) => a0 == b0 && a1 == b1 && ai == bi,
            (Value::Fn(a), Value::Fn(b)) => Rc::ptr_eq(a, b),
            (Value::Native(a), Value::Native(b)) => Rc::ptr_eq(a, b),
            (Value::Class(a), Value::Class(b)) => Rc::ptr_eq(a, b),
            (Value::Instance(a), Value::Instance(b)) => Rc::ptr_eq(a, b),
            (Value::Bound(a), Value::Bound(b)) => Rc::ptr_eq(a, b),
            (Value::Module(a), Value::Module(b)) => Rc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Nil => f.write_str("nil"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Num(n) => f.write_str(&format_num(*n)),
            Value::Str(s) => f.write_str(s),
            Value::Array(items) => {
                f.write_str("[")?;
                for (i, item) in items.borrow().iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{item}")?;
                }
                f.write_str("]")
            }
            Value::Range { start, end, inclusive } => {
                let dots = if *inclusive { "..." } else { ".." };
                write!(f, "{}{dots}{}", format_num(*start), format_num(*end))
            }
            Value::Fn(func) => write!(f, "<fn {}>", func.name),
            Value::Native(native) => write!(f, "<native fn {}>", native.name),
            Value::Class(class) => write!(f, "<cls {}>", class.name),
            Value::Instance(instance) => write!(f, "<{} instance>", instance.class.name),
            Value::Bound(bound) => write!(f, "<fn {}>", bound.method.name),
            Value::Module(module) => write!(f, "<module {}>", module.name),
            Value::Iter(_) => f.write_str("<iter>"),
        }
    }
}

// ═══════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::{Class, Instance};

    #[test]
    fn numbers_print_shortest_round_trip() {
        assert_eq!(format_num(832040.0), "832040");
        assert_eq!(format_num(0.0), "0");
        assert_eq!(format_num(-0.0), "-0");
        assert_eq!(format_num(3.14), "3.14");
        assert_eq!(format_num(0.1 + 0.2), "0.30000000000000004");
        assert_eq!(format_num(1.0 / 0.0), "Inf");
        assert_eq!(format_num(-1.0 / 0.0), "-Inf");
        assert_eq!(format_num(f64::NAN), "NaN");
    }

    #[test]
    fn truthiness_only_nil_and_false_are_falsey() {
        assert!(!Value::Nil.truthiness());
        assert!(!Value::Bool(false).truthiness());
        assert!(Value::Bool(true).truthiness());
        assert!(Value::Num(0.0).truthiness());
        assert!(Value::str("").truthiness());
        assert!(Value::array(vec![]).truthiness());
    }

    #[test]
    fn arrays_compare_element_wise() {
        let a = Value::array(vec![Value::Num(1.0), Value::str("x")]);
        let b = Value::array(vec![Value::Num(1.0), Value::str("x")]);
        let c = Value::array(vec![Value::Num(2.0)]);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn instances_compare_by_identity() {
        let class = Rc::new(Class::new("Point"));
        let a = Value::Instance(Rc::new(Instance::new(Rc::clone(&class))));
        let b = Value::Instance(Rc::new(Instance::new(Rc::clone(&class))));
        assert_eq!(a, a.clone());
        assert_ne!(a, b);
    }

    #[test]
    fn mixed_types_never_equal() {
        assert_ne!(Value::Num(0.0), Value::Bool(false));
        assert_ne!(Value::str("1"), Value::Num(1.0));
        assert_ne!(Value::Nil, Value::Bool(false));
    }

    #[test]
    fn display_forms() {
        let arr = Value::array(vec![Value::Num(1.0), Value::str("hi"), Value::Nil]);
        assert_eq!(arr.to_string(), "[1, hi, nil]");
        let range = Value::Range { start: 0.0, end: 5.0, inclusive: false };
        assert_eq!(range.to_string(), "0..5");
        let range = Value::Range { start: 1.0, end: 3.0, inclusive: true };
        assert_eq!(range.to_string(), "1...3");
        let class = Rc::new(Class::new("Greeter"));
        assert_eq!(Value::Class(Rc::clone(&class)).to_string(), "<cls Greeter>");
        let inst = Value::Instance(Rc::new(Instance::new(class)));
        assert_eq!(inst.to_string(), "<Greeter instance>");
    }
}
