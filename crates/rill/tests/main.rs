//! End-to-end semantics of the core evaluator: expressions, control
//! flow, loops, collections, destructuring, closures.

use pretty_assertions::assert_eq;
use rill::{Module, Object, eval_source};

fn eval(code: &str) -> Object {
    eval_source("test.rl", code).unwrap_or_else(|err| panic!("eval failed: {err}\nfor:\n{code}"))
}

fn ints(values: &[i64]) -> Object {
    Object::List(values.iter().map(|&i| Object::Int(i)).collect())
}

#[test]
fn arithmetic_stays_int_until_real() {
    assert_eq!(eval("1 + 2 * 3"), Object::Int(7));
    assert_eq!(eval("7 / 2"), Object::Int(3));
    assert_eq!(eval("-7 / 2"), Object::Int(-3), "integer division truncates toward zero");
    assert_eq!(eval("-7 % 2"), Object::Int(-1), "remainder keeps the dividend's sign");
    assert_eq!(eval("1 + 2.5"), Object::Real(3.5));
    assert_eq!(eval("1.0 + 2"), Object::Real(3.0));
}

#[test]
fn bitwise_is_int_only_and_masked() {
    assert_eq!(eval("6 & 3"), Object::Int(2));
    assert_eq!(eval("6 | 3"), Object::Int(7));
    assert_eq!(eval("6 ^ 3"), Object::Int(5));
    assert_eq!(eval("~0"), Object::Int(-1));
    assert_eq!(eval("1 << 3"), Object::Int(8));
    assert_eq!(eval("-8 >> 1"), Object::Int(-4), ">> is arithmetic");
    assert_eq!(eval("-1 >>> 60"), Object::Int(15), ">>> is logical");
    assert_eq!(eval("1 << 64"), Object::Int(1), "shift counts are masked to 0..63");
}

#[test]
fn comparison_and_identity() {
    assert_eq!(eval("1 == 1.0"), Object::Bool(true));
    assert_eq!(eval("\"a\" < \"b\""), Object::Bool(true));
    assert_eq!(eval("2 <=> 1"), Object::Int(1));
    assert_eq!(eval("1 <=> 1"), Object::Int(0));
    // `===` is reference identity: two list literals are distinct objects.
    assert_eq!(eval("[1] === [1]"), Object::Bool(false));
    assert_eq!(eval("[1] == [1]"), Object::Bool(true));
    assert_eq!(eval("val a = [1]\nval b = a\na === b"), Object::Bool(true));
    assert_eq!(eval("null == null"), Object::Bool(true));
    assert_eq!(eval("1 == true"), Object::Bool(false));
}

#[test]
fn logic_short_circuits() {
    assert_eq!(
        eval("var hit = false\nval f = { hit = true; true }\nfalse && f()\nhit"),
        Object::Bool(false)
    );
    assert_eq!(
        eval("var hit = false\nval f = { hit = true; true }\ntrue || f()\nhit"),
        Object::Bool(false)
    );
}

#[test]
fn block_value_is_last_statement() {
    assert_eq!(eval("val x = if (true) { 1\n2 } else { 3 }\nx"), Object::Int(2));
    assert_eq!(eval("if (false) { 1 }"), Object::Void);
}

#[test]
fn assignment_returns_rvalue() {
    assert_eq!(eval("var x = 0\nval y = (x = 5)\ny"), Object::Int(5));
    assert_eq!(eval("var x = 10\nx += 5\nx"), Object::Int(15));
}

#[test]
fn if_null_assignment() {
    assert_eq!(eval("var x = null\nx ?= 3\nx"), Object::Int(3));
    assert_eq!(eval("var x = 7\nx ?= 3\nx"), Object::Int(7));
}

#[test]
fn elvis_and_optional_chaining() {
    assert_eq!(eval("null ?: 5"), Object::Int(5));
    assert_eq!(eval("4 ?: 5"), Object::Int(4));
    assert_eq!(eval("val x = null\nx?.size"), Object::Null);
    assert_eq!(eval("val x = null\nx?[0]"), Object::Null);
}

#[test]
fn increment_decrement() {
    assert_eq!(
        eval("var i = 1\nval a = i++\nval b = ++i\n[a, i, b]"),
        ints(&[1, 3, 3])
    );
    assert_eq!(eval("var i = 5\ni--\n--i\ni"), Object::Int(3));
}

#[test]
fn late_init_val_single_assignment() {
    assert_eq!(eval("val x\nx = 5\nx"), Object::Int(5));
}

#[test]
fn while_loop_values() {
    // Broken with a value, the loop evaluates to that value.
    assert_eq!(eval("val r = while (true) { break \"ok\" }\nassert(r == \"ok\")\nr"), Object::Str("ok".into()));
    // Initially false condition without else is Void.
    assert_eq!(eval("while (false) { 1 }"), Object::Void);
    // Normal termination prefers the else block.
    assert_eq!(eval("var i = 0\nwhile (i < 3) { i += 1 } else { \"done\" }"), Object::Str("done".into()));
    // Otherwise the last body value.
    assert_eq!(eval("var i = 0\nwhile (i < 3) { i += 1\ni * 10 }"), Object::Int(30));
}

#[test]
fn do_while_condition_sees_body_scope() {
    assert_eq!(
        eval("var n = 0\ndo { val stop = n > 2\nn += 1 } while (!stop)\nn"),
        Object::Int(4)
    );
}

#[test]
fn for_over_ranges() {
    assert_eq!(eval("var s = 0\nfor (x in 1..5) { s += x }\ns"), Object::Int(15));
    assert_eq!(eval("var s = 0\nfor (x in 1..<5) { s += x }\ns"), Object::Int(10));
    assert_eq!(
        eval("val ys = []\nfor (x in 1..4) { ys.add(x * x) }\nys"),
        ints(&[1, 4, 9, 16])
    );
}

#[test]
fn for_range_matches_to_list() {
    assert_eq!(eval("val r = 3..7\nval ys = []\nfor (x in r) { ys.add(x) }\nys == r.toList()"), Object::Bool(true));
}

#[test]
fn char_ranges_iterate_code_points() {
    assert_eq!(
        eval("val cs = []\nfor (c in 'a'..'e') { cs.add(c) }\ncs.size"),
        Object::Int(5)
    );
    assert_eq!(eval("('a'..'e')[1]"), Object::Char('b'));
}

#[test]
fn labelled_break_and_continue() {
    assert_eq!(
        eval(
            "val hits = []\nouter@ for (i in 1..3) {\n  for (j in 1..3) {\n    if (j == 2) continue\n    if (i == 3) break@outer\n    hits.add(i * 10 + j)\n  }\n}\nhits"
        ),
        ints(&[11, 13, 21, 23])
    );
}

#[test]
fn break_targets_innermost_by_default() {
    assert_eq!(
        eval("var n = 0\nfor (i in 1..2) { for (j in 1..10) { if (j == 2) break\nn += 1 } }\nn"),
        Object::Int(2)
    );
}

#[test]
fn loop_else_skipped_on_break() {
    assert_eq!(
        eval("val r = for (i in 1..5) { if (i == 3) break \"hit\" } else { \"no\" }\nr"),
        Object::Str("hit".into())
    );
}

#[test]
fn when_matches_first_branch() {
    let code = "fun judge(x) {\n  when (x) {\n    1, 2 -> \"small\"\n    in 3..9 -> \"mid\"\n    is String -> \"text\"\n    else -> \"big\"\n  }\n}\n[judge(2), judge(5), judge(\"s\"), judge(100)]";
    assert_eq!(
        eval(code),
        Object::List(vec![
            Object::Str("small".into()),
            Object::Str("mid".into()),
            Object::Str("text".into()),
            Object::Str("big".into()),
        ])
    );
}

#[test]
fn when_without_match_is_void() {
    assert_eq!(eval("when (42) { 1 -> \"one\" }"), Object::Void);
}

#[test]
fn destructuring_with_splat() {
    assert_eq!(
        eval("val [a, mid..., z] = [1, 2, 3, 4, 5]\nassert(a == 1)\nassert(z == 5)\nmid"),
        ints(&[2, 3, 4])
    );
}

#[test]
fn destructuring_nested_and_reassignment() {
    assert_eq!(
        eval("val [[a, b], c] = [[1, 2], 3]\na + b + c"),
        Object::Int(6)
    );
    assert_eq!(
        eval("var x = 0\nvar y = 0\n[x, y] = [7, 8]\nx * 10 + y"),
        Object::Int(78)
    );
}

#[test]
fn list_operations() {
    assert_eq!(eval("[1, 2] + [3]"), ints(&[1, 2, 3]));
    assert_eq!(eval("val xs = [1, ...[2, 3], 4]\nxs"), ints(&[1, 2, 3, 4]));
    assert_eq!(eval("[1, 2, 3].size"), Object::Int(3));
    assert_eq!(eval("[10, 20, 30][-1]"), Object::Int(30));
    assert_eq!(eval("[10, 20, 30][0..1]"), ints(&[10, 20]));
    assert_eq!(eval("[3, 1, 2].sorted()"), ints(&[1, 2, 3]));
    assert_eq!(eval("[1, 2, 3].map { it * 2 }"), ints(&[2, 4, 6]));
    assert_eq!(eval("[1, 2, 3, 4].filter { it % 2 == 0 }"), ints(&[2, 4]));
    assert_eq!(eval("2 in [1, 2, 3]"), Object::Bool(true));
    assert_eq!(eval("9 !in [1, 2, 3]"), Object::Bool(true));
}

#[test]
fn list_concat_indexing_property() {
    let code = "val a = [1, 2, 3]\nval b = [4, 5]\nval c = a + b\nval ok = []\nfor (i in 0..<a.size) { ok.add(c[i] == a[i]) }\nfor (i in a.size..<c.size) { ok.add(c[i] == b[i - a.size]) }\nok.filter { !it }.size";
    assert_eq!(eval(code), Object::Int(0));
}

#[test]
fn map_literals_and_merge() {
    assert_eq!(
        eval("val m = {\"a\": 1, b: 2}\nm[\"a\"] + m[\"b\"]"),
        Object::Int(3)
    );
    assert_eq!(eval("val m = {a: 1}\nm[\"missing\"]"), Object::Null);
    // Rightmost wins in merges and spreads.
    assert_eq!(eval("({a: 1} + {a: 2, b: 3})[\"a\"]"), Object::Int(2));
    assert_eq!(eval("val m = {a: 1, ...{a: 9, c: 3}}\nm[\"a\"]"), Object::Int(9));
    // Shorthand `id:` binds the name's value.
    assert_eq!(eval("val tick = 5\nval m = {tick:}\nm[\"tick\"]"), Object::Int(5));
    assert_eq!(eval("\"a\" in {a: 1}"), Object::Bool(true));
}

#[test]
fn map_literal_equals_map_constructor() {
    assert_eq!(
        eval("{\"k\": 1, \"j\": 2} == Map(\"k\" => 1, \"j\" => 2)"),
        Object::Bool(true)
    );
    // Key ordering is not part of the equality contract.
    assert_eq!(
        eval("{\"k\": 1, \"j\": 2} == Map(\"j\" => 2, \"k\" => 1)"),
        Object::Bool(true)
    );
}

#[test]
fn map_merge_lookup_property() {
    let code = "val m1 = {a: 1, b: 2}\nval m2 = {b: 20, c: 30}\nval m = m1 + m2\n[m[\"a\"], m[\"b\"], m[\"c\"]]";
    assert_eq!(eval(code), ints(&[1, 20, 30]));
}

#[test]
fn entries_and_entry_values() {
    assert_eq!(eval("val e = \"k\" => 42\ne.key"), Object::Str("k".into()));
    assert_eq!(eval("val e = \"k\" => 42\ne.value"), Object::Int(42));
}

#[test]
fn sets_dedup_and_union() {
    assert_eq!(eval("val s = Set(1, 2, 2, 3)\ns.size"), Object::Int(3));
    assert_eq!(eval("(Set(1, 2) + Set(2, 3)).size"), Object::Int(3));
    assert_eq!(eval("(Set(1, 2, 3) - Set(2)).size"), Object::Int(2));
    assert_eq!(eval("2 in Set(1, 2)"), Object::Bool(true));
}

#[test]
fn string_indexing_and_methods() {
    assert_eq!(eval("\"abc\"[1]"), Object::Char('b'));
    assert_eq!(eval("\"hello\"[1..3]"), Object::Str("ell".into()));
    assert_eq!(eval("\"hello\"[1..<3]"), Object::Str("el".into()));
    assert_eq!(eval("\"abc\"[-1]"), Object::Char('c'));
    assert_eq!(eval("\"hello\"[Regex(\"l+\")]"), Object::Str("ll".into()));
    assert_eq!(eval("\"hello\"[Regex(\"zz\")]"), Object::Null);
    assert_eq!(eval("\"a,b,c\".split(\",\").size"), Object::Int(3));
    assert_eq!(eval("\"  pad  \".trim()"), Object::Str("pad".into()));
    assert_eq!(eval("\"ll\" in \"hello\""), Object::Bool(true));
    assert_eq!(eval("'e' in \"hello\""), Object::Bool(true));
    assert_eq!(eval("\"abc\" + 1"), Object::Str("abc1".into()));
    assert_eq!(eval("\"42\".toInt() + 1"), Object::Int(43));
}

#[test]
fn string_iteration_is_repeatable() {
    let code = "val s = \"abc\"\nval first = []\nval second = []\nfor (c in s) { first.add(c) }\nfor (c in s) { second.add(c) }\nfirst == second";
    assert_eq!(eval(code), Object::Bool(true));
}

#[test]
fn ranges_expose_bounds() {
    assert_eq!(eval("(1..5).size"), Object::Int(5));
    assert_eq!(eval("(1..<5).size"), Object::Int(4));
    assert_eq!(eval("(1..5).start"), Object::Int(1));
    assert_eq!(eval("3 in 1..5"), Object::Bool(true));
    assert_eq!(eval("5 in 1..<5"), Object::Bool(false));
    assert_eq!(eval("7 in 5.."), Object::Bool(true));
    assert_eq!(eval("3 in ..5"), Object::Bool(true));
    assert_eq!(eval("(2..6)[1]"), Object::Int(3));
}

#[test]
fn buffers_hold_bytes() {
    assert_eq!(eval("val b = Buffer(3)\nb[0] = 65\nb[0]"), Object::Int(65));
    assert_eq!(eval("Buffer(1, 2, 3).size"), Object::Int(3));
    assert_eq!(eval("Buffer(1, 2, 3)[-1]"), Object::Int(3));
    assert_eq!(eval("Buffer(1, 2) < Buffer(1, 3)"), Object::Bool(true));
    assert_eq!(eval("Buffer(9, 8, 7)[0..1].size"), Object::Int(2));
}

#[test]
fn frozen_containers_reject_mutation() {
    let err = eval_source("test.rl", "val xs = [1].freeze()\nxs.add(2)").unwrap_err();
    assert_eq!(err.class_name, "IllegalOperationError");
}

#[test]
fn lambdas_bind_it() {
    assert_eq!(eval("val f = { it * 2 }\nf(21)"), Object::Int(42));
    assert_eq!(eval("val f = { it }\nf()"), Object::Void);
    assert_eq!(eval("val f = { it }\nf(1, 2).size"), Object::Int(2));
    assert_eq!(eval("val add = { a, b -> a + b }\nadd(20, 22)"), Object::Int(42));
}

#[test]
fn closures_capture_their_creator_scope() {
    let code = "fun counter() {\n  var n = 0\n  { -> n += 1\nn }\n}\nval c = counter()\nc()\nc()\nc()";
    assert_eq!(eval(code), Object::Int(3));
    // Independent closures do not share state.
    let code = "fun counter() {\n  var n = 0\n  { -> n += 1\nn }\n}\nval a = counter()\nval b = counter()\na()\na()\nb()";
    assert_eq!(eval(code), Object::Int(1));
}

#[test]
fn defaults_named_args_and_variadics() {
    assert_eq!(eval("fun g(a, b = 10, c = 20) = a + b + c\ng(1)"), Object::Int(31));
    assert_eq!(eval("fun g(a, b = 10, c = 20) = a + b + c\ng(1, c: 2)"), Object::Int(13));
    assert_eq!(eval("fun h(first, rest...) = rest.size\nh(1, 2, 3, 4)"), Object::Int(3));
    assert_eq!(eval("fun h(first, rest...) = rest\nh(1)"), Object::List(vec![]));
    assert_eq!(eval("fun add(a, b) = a + b\nadd(...[19, 23])"), Object::Int(42));
    assert_eq!(
        eval("fun add(a, b) = a + b\nadd(...{\"a\": 1, \"b\": 2})"),
        Object::Int(3)
    );
    // Defaults may reference earlier parameters.
    assert_eq!(eval("fun g(a, b = a * 2) = b\ng(21)"), Object::Int(42));
}

#[test]
fn argument_evaluation_is_left_to_right() {
    let code = "val order = []\nfun note(tag, v) { order.add(tag)\nv }\nfun f(a, b, c) = 0\nf(note(1, 0), note(2, 0), note(3, 0))\norder";
    assert_eq!(eval(code), ints(&[1, 2, 3]));
}

#[test]
fn non_local_return_from_lambda() {
    let code = "fun f(xs) {\n  xs.forEach { if (it < 0) return@f \"neg\" }\n  \"pos\"\n}\n[f([1, -2, 3]), f([1, 2, 3])]";
    assert_eq!(
        eval(code),
        Object::List(vec![Object::Str("neg".into()), Object::Str("pos".into())])
    );
}

#[test]
fn labelled_lambda_return() {
    let code = "val f = @scan {\n  if (it > 10) return@scan \"big\"\n  \"small\"\n}\n[f(3), f(30)]";
    assert_eq!(
        eval(code),
        Object::List(vec![Object::Str("small".into()), Object::Str("big".into())])
    );
}

#[test]
fn trailing_lambda_and_chained_calls() {
    assert_eq!(
        eval("[1, 2, 3]\n  .map { it + 1 }\n  .filter { it > 2 }"),
        ints(&[3, 4])
    );
}

#[test]
fn value_semantics_for_numbers() {
    assert_eq!(eval("var a = 5\nvar b = a\nb += 1\na"), Object::Int(5));
    assert_eq!(eval("var a = true\nvar b = a\nb = false\na"), Object::Bool(true));
}

#[test]
fn reference_semantics_for_containers() {
    assert_eq!(eval("val a = [1]\nval b = a\nb.add(2)\na.size"), Object::Int(2));
}

#[test]
fn print_output_is_captured() {
    let mut module = Module::new("test.rl");
    let out = module.capture_output();
    module.eval("println(\"hello\", 42)\nprint(\"x\")").unwrap();
    assert_eq!(out.take(), "hello 42\nx");
}

#[test]
fn println_renders_values() {
    let mut module = Module::new("test.rl");
    let out = module.capture_output();
    module
        .eval("println([1, \"two\", 'c', 1.5, null, true])\nprintln(1.0)")
        .unwrap();
    assert_eq!(out.take(), "[1, \"two\", 'c', 1.5, null, true]\n1.0\n");
}

#[test]
fn module_state_persists_across_evals() {
    let mut module = Module::new("test.rl");
    module.eval("var total = 0").unwrap();
    module.eval("total += 40").unwrap();
    assert_eq!(module.eval("total + 2").unwrap(), Object::Int(42));
}
