//! Error taxonomy, try/catch/finally, propagation, parse failures and
//! the host-facing exception surface.

use pretty_assertions::assert_eq;
use rill::{Object, eval_source};

fn eval(code: &str) -> Object {
    eval_source("test.rl", code).unwrap_or_else(|err| panic!("eval failed: {err}\nfor:\n{code}"))
}

fn eval_err(code: &str) -> rill::Exception {
    eval_source("test.rl", code).expect_err("expected an error")
}

#[test]
fn thrown_strings_wrap_into_exceptions() {
    let code = "var side = \"\"\nval r = try { throw \"e\" } catch { it.message } finally { side = \"f\" }\nr + side";
    assert_eq!(eval(code), Object::Str("ef".into()));
}

#[test]
fn finally_runs_on_the_success_path() {
    let code = "var side = \"\"\nval r = try { 42 } finally { side = \"f\" }\n[r, side]";
    assert_eq!(
        eval(code),
        Object::List(vec![Object::Int(42), Object::Str("f".into())])
    );
}

#[test]
fn catch_matches_by_class_ancestry() {
    let code = "try { [1][10] } catch (e: IndexOutOfBoundsError) { \"idx\" }";
    assert_eq!(eval(code), Object::Str("idx".into()));
    // The root class catches everything in the taxonomy.
    let code = "try { [1][10] } catch (e: Exception) { \"any\" }";
    assert_eq!(eval(code), Object::Str("any".into()));
    // A sibling class does not.
    let err = eval_err("try { [1][10] } catch (e: NullPointerError) { \"np\" }");
    assert_eq!(err.class_name, "IndexOutOfBoundsError");
}

#[test]
fn first_matching_clause_wins() {
    let code = "try { [1][10] } catch (e: IndexOutOfBoundsError) { \"specific\" } catch (e: Exception) { \"general\" }";
    assert_eq!(eval(code), Object::Str("specific".into()));
}

#[test]
fn try_catch_nests() {
    let code = "try {\n  try { throw \"inner\" } catch (e: NullPointerError) { \"wrong\" }\n} catch { \"outer:\" + it.message }";
    assert_eq!(eval(code), Object::Str("outer:inner".into()));
}

#[test]
fn rethrow_keeps_the_original_class() {
    let err = eval_err("try { [1][10] } catch (e: IndexOutOfBoundsError) { throw e }");
    assert_eq!(err.class_name, "IndexOutOfBoundsError");
}

#[test]
fn user_exception_classes_are_catchable() {
    let code = "class ParseFail(msg) : Exception(msg) {}\ntry { throw ParseFail(\"bad token\") } catch (e: ParseFail) { e.message }";
    assert_eq!(eval(code), Object::Str("bad token".into()));
    // And they match through the root class too.
    let code = "class ParseFail(msg) : Exception(msg) {}\ntry { throw ParseFail(\"x\") } catch (e: Exception) { \"caught\" }";
    assert_eq!(eval(code), Object::Str("caught".into()));
}

#[test]
fn user_exception_hierarchies_follow_linearization() {
    let code = "class AppError(msg) : Exception(msg) {}\nclass DbError(msg) : AppError(msg) {}\ntry { throw DbError(\"down\") } catch (e: AppError) { e.message }";
    assert_eq!(eval(code), Object::Str("down".into()));
}

#[test]
fn error_constructors_build_throwable_values() {
    let err = eval_err("throw IllegalStateError(\"wedged\")");
    assert_eq!(err.class_name, "IllegalStateError");
    assert_eq!(err.message, "wedged");
}

#[test]
fn asserts_require_check_map_to_their_classes() {
    assert_eq!(eval_err("assert(false)").class_name, "AssertionFailed");
    assert_eq!(eval_err("require(false, \"arg\")").class_name, "IllegalArgumentError");
    assert_eq!(eval_err("check(false)").class_name, "IllegalStateError");
    assert_eq!(eval("assert(true)\n1"), Object::Int(1));
    assert_eq!(eval_err("require(false, \"arg\")").message, "arg");
}

#[test]
fn common_runtime_error_classes() {
    assert_eq!(eval_err("undefined_name").class_name, "SymbolNotDefinedError");
    assert_eq!(eval_err("val x = null\nx.size").class_name, "NullPointerError");
    assert_eq!(eval_err("[1, 2][5]").class_name, "IndexOutOfBoundsError");
    assert_eq!(eval_err("[1, 2][-3]").class_name, "IndexOutOfBoundsError");
    assert_eq!(eval_err("1 / 0").class_name, "IllegalOperationError");
    assert_eq!(eval_err("val c\nc = 1\nc = 2").class_name, "IllegalAssignmentError");
    assert_eq!(eval_err("val c\nc").class_name, "IllegalStateError");
    assert_eq!(eval_err("true + 1").class_name, "IllegalOperationError");
    assert_eq!(eval_err("1 < \"a\"").class_name, "IllegalOperationError");
    assert_eq!(eval_err("if (1) { }").class_name, "IllegalArgumentError");
}

#[test]
fn iterator_protocol_raises_past_the_end() {
    let code = "val it = [1].iterator()\nit.next()\nit.next()";
    assert_eq!(eval_err(code).class_name, "IterationEndException");
    assert_eq!(eval("val it = [1, 2].iterator()\n[it.hasNext(), it.next()]"),
        Object::List(vec![Object::Bool(true), Object::Int(1)]));
}

#[test]
fn throwing_non_exceptions_is_rejected() {
    assert_eq!(eval_err("throw 42").class_name, "IllegalArgumentError");
}

#[test]
fn uncaught_errors_carry_positions() {
    let err = eval_err("val x = 1\n[9][4]");
    assert_eq!(err.class_name, "IndexOutOfBoundsError");
    let pos = err.pos.expect("position");
    assert_eq!(pos.line, 2);
    assert_eq!(err.line.as_deref(), Some("[9][4]"));
}

#[test]
fn parse_errors_are_fatal_and_positioned() {
    let err = eval_err("val x = ");
    assert_eq!(err.class_name, "SyntaxError");
    assert!(err.pos.is_some());
    let err = eval_err("\"unterminated");
    assert_eq!(err.class_name, "SyntaxError");
    let err = eval_err("/* open");
    assert_eq!(err.class_name, "SyntaxError");
    let err = eval_err("val 1x = 2");
    assert_eq!(err.class_name, "SyntaxError");
}

#[test]
fn break_outside_loops_is_an_error() {
    assert_eq!(eval_err("break").class_name, "IllegalOperationError");
    assert_eq!(eval_err("continue").class_name, "IllegalOperationError");
    assert_eq!(eval_err("return 1").class_name, "IllegalOperationError");
}

#[test]
fn catch_binding_defaults_to_it() {
    let code = "try { throw \"msg\" } catch { it.message }";
    assert_eq!(eval(code), Object::Str("msg".into()));
    let code = "try { throw \"msg\" } catch (e) { e.message }";
    assert_eq!(eval(code), Object::Str("msg".into()));
}

#[test]
fn finally_runs_while_unwinding_loops() {
    let code = "var side = 0\nval r = while (true) {\n  try { break \"out\" } finally { side = 7 }\n}\n[r, side]";
    assert_eq!(
        eval(code),
        Object::List(vec![Object::Str("out".into()), Object::Int(7)])
    );
}

#[test]
fn heap_limits_bound_runaway_programs() {
    let mut module = rill::Module::with_limits(
        "test.rl",
        rill::ResourceLimits {
            max_heap_cells: 300,
            max_call_depth: 64,
        },
    );
    let err = module
        .eval("val xs = []\nwhile (true) { xs.add([1]) }")
        .expect_err("expected the heap budget to trip");
    assert_eq!(err.class_name, "IllegalStateError");
}

#[test]
fn call_depth_is_bounded() {
    let mut module = rill::Module::with_limits(
        "test.rl",
        rill::ResourceLimits {
            max_heap_cells: 100_000,
            max_call_depth: 32,
        },
    );
    let err = module
        .eval("fun f(n) = f(n + 1)\nf(0)")
        .expect_err("expected the depth budget to trip");
    assert_eq!(err.class_name, "IllegalStateError");
}

#[test]
fn exceptions_render_with_class_and_position() {
    let err = eval_err("throw IllegalArgumentError(\"nope\")");
    let rendered = err.to_string();
    assert!(rendered.contains("IllegalArgumentError"), "got: {rendered}");
    assert!(rendered.contains("nope"), "got: {rendered}");
}
