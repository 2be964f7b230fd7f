//! Built-in native functions, installed into every fresh globals table.

use std::rc::Rc;
use std::thread;
use std::time::Duration;

use indexmap::IndexMap;

use crate::object::Native;
use crate::value::Value;
use crate::vm::Vm;

/// Install the default natives into a globals table. Called for the root
/// script's globals and again for each imported module's fresh globals.
pub fn register(globals: &mut IndexMap<String, Value>) {
    let natives = [
        Native { name: "clock", arity: 0, func: native_clock },
        Native { name: "sleep", arity: 1, func: native_sleep },
        Native { name: "str", arity: 1, func: native_str },
        Native { name: "len", arity: 1, func: native_len },
        Native { name: "type", arity: 1, func: native_type },
    ];
    for native in natives {
        globals.insert(native.name.to_string(), Value::Native(Rc::new(native)));
    }
}

/// Monotonic seconds since the VM started; two samples bracket a workload.
fn native_clock(vm: &mut Vm, _args: &[Value]) -> Result<Value, String> {
    Ok(Value::Num(vm.elapsed_seconds()))
}

/// Block for the given number of milliseconds.
fn native_sleep(_vm: &mut Vm, args: &[Value]) -> Result<Value, String> {
    let Value::Num(ms) = &args[0] else {
        return Err(format!("sleep() expects milliseconds as a number, got {}", args[0].type_name()));
    };
    if *ms > 0.0 {
        thread::sleep(Duration::from_millis(*ms as u64));
    }
    Ok(Value::Nil)
}

/// Convert any value to its printed form.
fn native_str(_vm: &mut Vm, args: &[Value]) -> Result<Value, String> {
    Ok(Value::str(args[0].to_string()))
}

/// Character count of a string or element count of an array.
fn native_len(_vm: &mut Vm, args: &[Value]) -> Result<Value, String> {
    match &args[0] {
        Value::Str(s) => Ok(Value::Num(s.chars().count() as f64)),
        Value::Array(items) => Ok(Value::Num(items.borrow().len() as f64)),
        other => Err(format!("len() expects a string or array, got {}", other.type_name())),
    }
}

/// Type name of a value, as used in error messages.
fn native_type(_vm: &mut Vm, args: &[Value]) -> Result<Value, String> {
    Ok(Value::str(args[0].type_name()))
}

// ═══════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::CaptureSink;

    fn test_vm() -> Vm {
        Vm::new(Box::new(CaptureSink::new()))
    }

    #[test]
    fn registers_all_natives() {
        let vm = test_vm();
        for name in ["clock", "sleep", "str", "len", "type"] {
            assert!(matches!(vm.get_global(name), Some(Value::Native(_))), "{name}");
        }
    }

    #[test]
    fn clock_is_monotonic() {
        let mut vm = test_vm();
        let Ok(Value::Num(a)) = native_clock(&mut vm, &[]) else { panic!() };
        let Ok(Value::Num(b)) = native_clock(&mut vm, &[]) else { panic!() };
        assert!(a >= 0.0);
        assert!(b >= a);
    }

    #[test]
    fn str_uses_display_forms() {
        let mut vm = test_vm();
        assert_eq!(native_str(&mut vm, &[Value::Num(832040.0)]), Ok(Value::str("832040")));
        assert_eq!(native_str(&mut vm, &[Value::Nil]), Ok(Value::str("nil")));
        assert_eq!(
            native_str(&mut vm, &[Value::array(vec![Value::Num(1.0), Value::Num(2.0)])]),
            Ok(Value::str("[1, 2]"))
        );
    }

    #[test]
    fn len_counts_chars_and_elements() {
        let mut vm = test_vm();
        assert_eq!(native_len(&mut vm, &[Value::str("héj")]), Ok(Value::Num(3.0)));
        assert_eq!(native_len(&mut vm, &[Value::array(vec![Value::Nil])]), Ok(Value::Num(1.0)));
        assert!(native_len(&mut vm, &[Value::Num(3.0)]).is_err());
    }

    #[test]
    fn type_names() {
        let mut vm = test_vm();
        assert_eq!(native_type(&mut vm, &[Value::Num(1.0)]), Ok(Value::str("num")));
        assert_eq!(native_type(&mut vm, &[Value::Bool(true)]), Ok(Value::str("bool")));
        assert_eq!(native_type(&mut vm, &[Value::str("")]), Ok(Value::str("str")));
    }

    #[test]
    fn sleep_rejects_non_numbers() {
        let mut vm = test_vm();
        assert!(native_sleep(&mut vm, &[Value::str("5")]).is_err());
        assert_eq!(native_sleep(&mut vm, &[Value::Num(0.0)]), Ok(Value::Nil));
    }
}
