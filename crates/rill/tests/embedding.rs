//! The host embedding surface: native functions and properties, package
//! registration with lazy initialisation and caching, security hooks and
//! value conversion.

use std::cell::Cell;
use std::rc::Rc;

use pretty_assertions::assert_eq;
use rill::{Module, Object, SecurityManager};

#[test]
fn native_functions_round_trip_values() {
    let mut module = Module::new("host.rl");
    module.bind_native("add_ints", |args| match args {
        [Object::Int(a), Object::Int(b)] => Ok(Object::Int(a + b)),
        _ => Err("add_ints takes two Ints".to_owned()),
    });
    assert_eq!(module.eval("add_ints(40, 2)").unwrap(), Object::Int(42));
}

#[test]
fn native_function_errors_surface_as_unknown_exception() {
    let mut module = Module::new("host.rl");
    module.bind_native("fail", |_| Err("backend unreachable".to_owned()));
    let err = module.eval("fail()").unwrap_err();
    assert_eq!(err.class_name, "UnknownException");
    assert!(err.message.contains("backend unreachable"));
    // Host failures are catchable in-language through the adapter class.
    module.bind_native("fail2", |_| Err("nope".to_owned()));
    assert_eq!(
        module.eval("try { fail2() } catch (e: UnknownException) { \"handled\" }").unwrap(),
        Object::Str("handled".into())
    );
}

#[test]
fn native_containers_convert_both_ways() {
    let mut module = Module::new("host.rl");
    module.bind_native("tally", |args| {
        let [Object::List(items)] = args else {
            return Err("tally takes a list".to_owned());
        };
        let sum: i64 = items
            .iter()
            .map(|o| match o {
                Object::Int(i) => *i,
                _ => 0,
            })
            .sum();
        Ok(Object::Map(vec![
            ("count".to_owned(), Object::Int(items.len() as i64)),
            ("sum".to_owned(), Object::Int(sum)),
        ]))
    });
    assert_eq!(
        module.eval("val t = tally([1, 2, 3])\nt[\"count\"] * 100 + t[\"sum\"]").unwrap(),
        Object::Int(306)
    );
}

#[test]
fn native_properties_read_and_write() {
    let state = Rc::new(Cell::new(10i64));
    let mut module = Module::new("host.rl");
    let read = Rc::clone(&state);
    let write = Rc::clone(&state);
    module.bind_property(
        "gauge",
        move || Ok(Object::Int(read.get())),
        Some(Box::new(move |v| match v {
            Object::Int(i) => {
                write.set(i);
                Ok(())
            }
            _ => Err("gauge takes an Int".to_owned()),
        })),
    );
    assert_eq!(module.eval("gauge + 1").unwrap(), Object::Int(11));
    module.eval("gauge = 50").unwrap();
    assert_eq!(state.get(), 50);
    assert_eq!(module.eval("gauge").unwrap(), Object::Int(50));
}

#[test]
fn bound_values_are_visible() {
    let module = Module::new("host.rl");
    module.bind_value("greeting", Object::Str("hi".into())).unwrap();
    let mut module = module;
    assert_eq!(module.eval("greeting + \"!\"").unwrap(), Object::Str("hi!".into()));
}

#[test]
fn source_packages_import_their_exports() {
    let mut module = Module::new("host.rl");
    module.register_package("math.extra", "fun double(x) = x * 2\nval answer = 42\n");
    assert_eq!(
        module.eval("import math.extra.*\ndouble(answer)").unwrap(),
        Object::Int(84)
    );
}

#[test]
fn private_package_bindings_are_not_exported() {
    let mut module = Module::new("host.rl");
    module.register_package("secrets", "private val hidden = 1\nval shown = 2\n");
    assert_eq!(module.eval("import secrets.*\nshown").unwrap(), Object::Int(2));
    let err = module.eval("import secrets.*\nhidden").unwrap_err();
    assert_eq!(err.class_name, "SymbolNotDefinedError");
}

#[test]
fn packages_initialise_once_and_cache() {
    let runs = Rc::new(Cell::new(0u32));
    let counter = Rc::clone(&runs);
    let mut module = Module::new("host.rl");
    module.register_package_native("counted", move |binder| {
        counter.set(counter.get() + 1);
        binder.bind_value("mark", Object::Int(7))
    });
    assert_eq!(module.eval("import counted.*\nmark").unwrap(), Object::Int(7));
    assert_eq!(module.eval("import counted.*\nmark").unwrap(), Object::Int(7));
    assert_eq!(runs.get(), 1, "re-imports must not re-run initialisation");
}

#[test]
fn unregistered_packages_fail_to_import() {
    let mut module = Module::new("host.rl");
    let err = module.eval("import nowhere.at.all").unwrap_err();
    assert_eq!(err.class_name, "SymbolNotDefinedError");
}

struct DenyList(&'static str);

impl SecurityManager for DenyList {
    fn check_import(&self, path: &str) -> bool {
        path != self.0
    }
}

#[test]
fn security_manager_gates_imports() {
    let mut module = Module::new("host.rl");
    module.register_package("net", "val open = true\n");
    module.register_package("fs", "val open = true\n");
    module.set_security(DenyList("net"));
    let err = module.eval("import net.*").unwrap_err();
    assert_eq!(err.class_name, "AccessError");
    assert_eq!(module.eval("import fs.*\nopen").unwrap(), Object::Bool(true));
}

#[test]
fn packages_can_define_classes() {
    let mut module = Module::new("host.rl");
    module.register_package(
        "shapes",
        "class Rect(val w, val h) {\n  fun area() = w * h\n}\n",
    );
    assert_eq!(
        module.eval("import shapes.*\nRect(6, 7).area()").unwrap(),
        Object::Int(42)
    );
}
