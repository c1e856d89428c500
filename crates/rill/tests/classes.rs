//! The object model: user classes, multiple inheritance with C3
//! linearization, visibility, properties, enums, objects, delegation and
//! dynamic objects.

use pretty_assertions::assert_eq;
use rill::{Object, eval_source};

fn eval(code: &str) -> Object {
    eval_source("test.rl", code).unwrap_or_else(|err| panic!("eval failed: {err}\nfor:\n{code}"))
}

fn eval_err(code: &str) -> rill::Exception {
    eval_source("test.rl", code).expect_err("expected an error")
}

#[test]
fn instances_carry_fields_and_methods() {
    let code = "class Point(val x, val y) {\n  fun dist() = x * x + y * y\n}\nval p = Point(3, 4)\n[p.x, p.y, p.dist()]";
    assert_eq!(
        eval(code),
        Object::List(vec![Object::Int(3), Object::Int(4), Object::Int(25)])
    );
}

#[test]
fn mutable_fields_and_init_blocks() {
    let code = "class Counter() {\n  var n = 0\n  init { n = 10 }\n  fun bump() { n += 1\nn }\n}\nval c = Counter()\nc.bump()\nc.bump()";
    assert_eq!(eval(code), Object::Int(12));
}

#[test]
fn immutable_fields_reject_reassignment() {
    let err = eval_err("class A(val x) {}\nval a = A(1)\na.x = 2");
    assert_eq!(err.class_name, "IllegalAssignmentError");
}

#[test]
fn mro_diamond_linearization() {
    let code = "class A() {}\nclass B() : A() {}\nclass C() : A() {}\nclass D() : B(), C() {}\nval x = D()\nx::class::linearization.map { it.name }";
    assert_eq!(
        eval(code),
        Object::List(vec![
            Object::Str("D".into()),
            Object::Str("B".into()),
            Object::Str("C".into()),
            Object::Str("A".into()),
            Object::Str("Obj".into()),
        ])
    );
}

#[test]
fn ambiguous_member_resolves_to_leftmost_base() {
    let code = "class A() {}\nclass B() : A() { fun who() = \"B\" }\nclass C() : A() { fun who() = \"C\" }\nclass D() : B(), C() {}\nD().who()";
    assert_eq!(eval(code), Object::Str("B".into()));
}

#[test]
fn diamond_parent_initialises_once() {
    let code = "var inits = 0\nclass A() { init { inits += 1 } }\nclass B() : A() {}\nclass C() : A() {}\nclass D() : B(), C() {}\nD()\ninits";
    assert_eq!(eval(code), Object::Int(1));
}

#[test]
fn parents_initialise_before_children() {
    let code = "val order = []\nclass A() { init { order.add(\"A\") } }\nclass B() : A() { init { order.add(\"B\") } }\nclass C() : A() { init { order.add(\"C\") } }\nclass D() : B(), C() { init { order.add(\"D\") } }\nD()\norder";
    assert_eq!(
        eval(code),
        Object::List(vec![
            Object::Str("A".into()),
            Object::Str("B".into()),
            Object::Str("C".into()),
            Object::Str("D".into()),
        ])
    );
}

#[test]
fn base_constructor_args_see_header_params() {
    let code = "class A(val base) {}\nclass B(n) : A(n * 2) {}\nB(21).base";
    assert_eq!(eval(code), Object::Int(42));
}

#[test]
fn super_dispatches_past_the_declaring_class() {
    let code = "class A() { fun greet() = \"A\" }\nclass B() : A() { fun greet() = \"B+\" + super.greet() }\nB().greet()";
    assert_eq!(eval(code), Object::Str("B+A".into()));
}

#[test]
fn per_declaring_class_field_storage() {
    let code = "class A(val x) {}\nclass B() : A(1) {\n  val x = 10\n  fun own() = x\n  fun base() = this@A.x\n}\nval b = B()\n[b.own(), b.base(), b.x]";
    assert_eq!(
        eval(code),
        Object::List(vec![Object::Int(10), Object::Int(1), Object::Int(10)])
    );
}

#[test]
fn cast_views_select_declaring_class_storage() {
    let code = "class A(val x) {}\nclass B() : A(1) { val x = 10 }\nval b = B()\n(b as A).x";
    assert_eq!(eval(code), Object::Int(1));
}

#[test]
fn invalid_cast_raises() {
    let err = eval_err("class A() {}\nclass B() {}\nval a = A()\na as B");
    assert_eq!(err.class_name, "ClassCastError");
}

#[test]
fn is_checks_walk_the_linearization() {
    let code = "class A() {}\nclass B() : A() {}\nval b = B()\n[b is B, b is A, b is Obj, b !is String]";
    assert_eq!(
        eval(code),
        Object::List(vec![
            Object::Bool(true),
            Object::Bool(true),
            Object::Bool(true),
            Object::Bool(true),
        ])
    );
}

#[test]
fn private_members_are_invisible_outside() {
    let code = "class Safe() {\n  private val secret = 41\n  fun reveal() = secret + 1\n}\nSafe().reveal()";
    assert_eq!(eval(code), Object::Int(42));
    let err = eval_err("class Safe() { private val secret = 41 }\nSafe().secret");
    assert_eq!(err.class_name, "AccessError");
}

#[test]
fn protected_members_are_visible_to_subclasses_only() {
    let code = "class Base() {\n  protected val token = 7\n}\nclass Sub() : Base() {\n  fun read() = token\n}\nSub().read()";
    assert_eq!(eval(code), Object::Int(7));
    let err = eval_err("class Base() { protected val token = 7 }\nBase().token");
    assert_eq!(err.class_name, "AccessError");
}

#[test]
fn casts_do_not_bypass_visibility() {
    let err = eval_err("class Base() { private val v = 1 }\nclass Sub() : Base() {}\n(Sub() as Base).v");
    assert_eq!(err.class_name, "AccessError");
}

#[test]
fn properties_compute_without_backing_fields() {
    let code = "class Temp(var celsius) {\n  var fahrenheit\n    get() = celsius * 9 / 5 + 32\n    set(v) { celsius = (v - 32) * 5 / 9 }\n}\nval t = Temp(100)\nval before = t.fahrenheit\nt.fahrenheit = 32\n[before, t.celsius]";
    assert_eq!(eval(code), Object::List(vec![Object::Int(212), Object::Int(0)]));
}

#[test]
fn abstract_members_forbid_instantiation() {
    let err = eval_err("class Shape() { fun area() }\nShape()");
    assert_eq!(err.class_name, "IllegalOperationError");
    let code = "class Shape() { fun area() }\nclass Square(val s) : Shape() { fun area() = s * s }\nSquare(3).area()";
    assert_eq!(eval(code), Object::Int(9));
}

#[test]
fn interfaces_behave_as_abstract_classes() {
    let code = "interface Named { fun name() }\nclass User(val n) : Named { fun name() = n }\nval u = User(\"ada\")\n[u is Named, u.name() == \"ada\"]";
    assert_eq!(eval(code), Object::List(vec![Object::Bool(true), Object::Bool(true)]));
}

#[test]
fn object_declares_an_eager_singleton() {
    let code = "object Config {\n  val version = 3\n  fun describe() = \"v\" + version\n}\nConfig.describe()";
    assert_eq!(eval(code), Object::Str("v3".into()));
}

#[test]
fn static_members_live_on_the_class() {
    let code = "class Ids() {\n  static var next = 100\n  static fun take() { Ids.next += 1\nIds.next }\n}\nIds.take()\nIds.take()";
    assert_eq!(eval(code), Object::Int(102));
}

#[test]
fn nested_classes_are_class_members() {
    let code = "class Outer() {\n  class Inner(val v) {}\n}\nOuter::Inner(5).v";
    assert_eq!(eval(code), Object::Int(5));
}

#[test]
fn enum_entries_and_lookup() {
    let code = "enum Color { RED, GREEN, BLUE }\n[Color::entries.size, Color::RED.ordinal, Color::BLUE.ordinal]";
    assert_eq!(eval(code), Object::List(vec![Object::Int(3), Object::Int(0), Object::Int(2)]));
    assert_eq!(
        eval("enum Color { RED, GREEN }\nColor.valueOf(\"GREEN\").name"),
        Object::Str("GREEN".into())
    );
}

#[test]
fn enum_identity_and_ordering() {
    let code = "enum Color { RED, GREEN }\n[Color::RED == Color::RED, Color::RED === Color::RED, Color::RED < Color::GREEN]";
    assert_eq!(
        eval(code),
        Object::List(vec![Object::Bool(true), Object::Bool(true), Object::Bool(true)])
    );
}

#[test]
fn cross_enum_comparison_raises() {
    let err = eval_err("enum A { X }\nenum B { Y }\nA::X < B::Y");
    assert_eq!(err.class_name, "IllegalArgumentError");
}

#[test]
fn enum_value_of_unknown_name_raises() {
    let err = eval_err("enum Color { RED }\nColor.valueOf(\"PINK\")");
    assert_eq!(err.class_name, "IllegalArgumentError");
}

#[test]
fn user_compare_to_drives_operators() {
    let code = "class Money(val cents) {\n  fun compareTo(other) = cents - other.cents\n}\n[Money(100) == Money(100), Money(100) < Money(200), Money(300) <=> Money(100)]";
    assert_eq!(
        eval(code),
        Object::List(vec![Object::Bool(true), Object::Bool(true), Object::Int(1)])
    );
}

#[test]
fn user_operator_methods() {
    let code = "class Vec(val x, val y) {\n  fun plus(o) = Vec(x + o.x, y + o.y)\n}\nval v = Vec(1, 2) + Vec(3, 4)\n[v.x, v.y]";
    assert_eq!(eval(code), Object::List(vec![Object::Int(4), Object::Int(6)]));
}

#[test]
fn get_at_and_put_at_operators() {
    let code = "class Grid() {\n  val cells = {}\n  fun getAt(i) = cells[String(i)] ?: 0\n  fun putAt(i, v) { cells[String(i)] = v }\n}\nval g = Grid()\ng[3] = 7\n[g[3], g[9]]";
    assert_eq!(eval(code), Object::List(vec![Object::Int(7), Object::Int(0)]));
}

#[test]
fn user_iterables_drive_for_loops() {
    let code = "class Countdown(val from) {\n  fun iterator() {\n    var n = from\n    dynamic {\n      get { name ->\n        when (name) {\n          \"hasNext\" -> { -> n > 0 }\n          \"next\" -> { -> n -= 1\nn + 1 }\n          else -> null\n        }\n      }\n    }\n  }\n}\nval got = []\nfor (x in Countdown(3)) { got.add(x) }\ngot";
    assert_eq!(
        eval(code),
        Object::List(vec![Object::Int(3), Object::Int(2), Object::Int(1)])
    );
}

#[test]
fn delegated_bindings_route_reads_and_writes() {
    let code = "class Box(var v) {\n  fun getValue(thisRef, name) = v\n  fun setValue(thisRef, name, value) { v = value }\n}\nval b = Box(1)\nvar x by b\nval before = x\nx = 9\n[before, b.v]";
    assert_eq!(eval(code), Object::List(vec![Object::Int(1), Object::Int(9)]));
}

#[test]
fn delegate_bind_hook_replaces_the_delegate() {
    let code = "class Inner(val tag) {\n  fun getValue(thisRef, name) = tag + \":\" + name\n}\nclass Outer() {\n  fun bind(name, access, thisRef) = Inner(access)\n}\nval label by Outer()\nlabel";
    assert_eq!(eval(code), Object::Str("val:label".into()));
}

#[test]
fn delegated_functions_route_invocations() {
    let code = "class Fwd() {\n  fun invoke(thisRef, name, a, b) = name + \":\" + (a + b)\n}\nfun combine by Fwd()\ncombine(20, 22)";
    assert_eq!(eval(code), Object::Str("combine:42".into()));
}

#[test]
fn dynamic_objects_dispatch_members() {
    let code = "val obj = dynamic {\n  get { name -> name + \"!\" }\n}\nobj.hello";
    assert_eq!(eval(code), Object::Str("hello!".into()));
}

#[test]
fn dynamic_objects_store_through_set() {
    let code = "val log = []\nval obj = dynamic {\n  get { name -> log.size }\n  set { name, value -> log.add(name => value) }\n}\nobj.a = 1\nobj.b = 2\n[obj.anything, log[0].key]";
    assert_eq!(
        eval(code),
        Object::List(vec![Object::Int(2), Object::Str("a".into())])
    );
}

#[test]
fn annotations_wrap_function_bodies() {
    let code = "fun Twice(name, body) {\n  { a -> body(a) * 2 }\n}\n@Twice fun inc(a) = a + 1\ninc(5)";
    assert_eq!(eval(code), Object::Int(12));
}

#[test]
fn annotations_replace_field_values() {
    let code = "fun Tagged(name, value, prefix) = prefix + \":\" + value\n@Tagged(\"cfg\") val host = \"local\"\nhost";
    assert_eq!(eval(code), Object::Str("cfg:local".into()));
}

#[test]
fn reflective_class_values() {
    assert_eq!(eval("42::class.name"), Object::Str("Int".into()));
    assert_eq!(eval("\"s\"::class.name"), Object::Str("String".into()));
    assert_eq!(eval("[1]::class.name"), Object::Str("List".into()));
    assert_eq!(
        eval("class Widget() {}\nWidget()::class.name"),
        Object::Str("Widget".into())
    );
    assert_eq!(eval("42::class == 7::class"), Object::Bool(true));
}

#[test]
fn builtin_linearization_is_visible() {
    assert_eq!(
        eval("[1, 2]::class::linearization.map { it.name }"),
        Object::List(vec![
            Object::Str("List".into()),
            Object::Str("Array".into()),
            Object::Str("Collection".into()),
            Object::Str("Iterable".into()),
            Object::Str("Obj".into()),
        ])
    );
}
