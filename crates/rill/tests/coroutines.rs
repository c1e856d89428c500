//! Cooperative execution: launch/await, delay, mutexes, channels, cold
//! flows and cancellation.

use pretty_assertions::assert_eq;
use rill::{Object, eval_source};

fn eval(code: &str) -> Object {
    eval_source("test.rl", code).unwrap_or_else(|err| panic!("eval failed: {err}\nfor:\n{code}"))
}

fn eval_err(code: &str) -> rill::Exception {
    eval_source("test.rl", code).expect_err("expected an error")
}

fn ints(values: &[i64]) -> Object {
    Object::List(values.iter().map(|&i| Object::Int(i)).collect())
}

#[test]
fn launch_returns_an_awaitable_deferred() {
    assert_eq!(eval("val d = launch { delay(2)\n21 * 2 }\nd.await()"), Object::Int(42));
}

#[test]
fn launched_tasks_interleave_at_suspension_points() {
    let code = "val order = []\nval d = launch { order.add(\"task\") }\norder.add(\"main\")\ndelay(2)\norder.add(\"after\")\nd.await()\norder";
    assert_eq!(
        eval(code),
        Object::List(vec![
            Object::Str("main".into()),
            Object::Str("task".into()),
            Object::Str("after".into()),
        ])
    );
}

#[test]
fn completable_deferred_hands_a_value_across() {
    let code = "val d = CompletableDeferred()\nlaunch { delay(2)\nd.complete(7) }\nd.await()";
    assert_eq!(eval(code), Object::Int(7));
}

#[test]
fn deferred_status_flags() {
    let code = "val d = CompletableDeferred()\nval before = [d.isActive, d.isCompleted]\nd.complete(1)\nval after = [d.isActive, d.isCompleted]\nbefore + after";
    assert_eq!(
        eval(code),
        Object::List(vec![
            Object::Bool(true),
            Object::Bool(false),
            Object::Bool(false),
            Object::Bool(true),
        ])
    );
}

#[test]
fn task_failure_propagates_through_await() {
    let err = eval_err("val d = launch { throw \"boom\" }\nd.await()");
    assert_eq!(err.class_name, "Exception");
    assert_eq!(err.message, "boom");
}

#[test]
fn yield_gives_other_tasks_a_turn() {
    let code = "val order = []\nval d = launch { order.add(1) }\nyield()\norder.add(2)\nd.await()\norder";
    assert_eq!(eval(code), ints(&[1, 2]));
}

#[test]
fn mutex_serialises_critical_sections() {
    let code = "val m = Mutex()\nvar total = 0\nval tasks = [\n  launch { m.withLock { val seen = total\ndelay(1)\ntotal = seen + 1 } },\n  launch { m.withLock { val seen = total\ndelay(1)\ntotal = seen + 1 } }\n]\ntasks.forEach { it.await() }\ntotal";
    assert_eq!(eval(code), Object::Int(2));
}

#[test]
fn mutex_unlocks_on_failure_inside_with_lock() {
    let code = "val m = Mutex()\ntry { m.withLock { throw \"x\" } } catch { }\nm.isLocked";
    assert_eq!(eval(code), Object::Bool(false));
}

#[test]
fn unlocking_an_unlocked_mutex_raises() {
    let err = eval_err("Mutex().unlock()");
    assert_eq!(err.class_name, "IllegalStateError");
}

#[test]
fn channels_carry_values_in_order() {
    let code = "val ch = Channel(2)\nlaunch {\n  ch.send(1)\n  ch.send(2)\n  ch.close()\n}\n[ch.receive(), ch.receive()]";
    assert_eq!(eval(code), ints(&[1, 2]));
}

#[test]
fn receive_on_a_drained_closed_channel_raises() {
    let err = eval_err("val ch = Channel(1)\nch.close()\nch.receive()");
    assert_eq!(err.class_name, "IterationEndException");
}

#[test]
fn fibonacci_cold_flow() {
    let code = "val fib = flow {\n  var a = 0\n  var b = 1\n  while (true) {\n    emit(a)\n    val t = a + b\n    a = b\n    b = t\n  }\n}\nfib.take(21).toList()";
    assert_eq!(
        eval(code),
        ints(&[
            0, 1, 1, 2, 3, 5, 8, 13, 21, 34, 55, 89, 144, 233, 377, 610, 987, 1597, 2584, 4181,
            6765
        ])
    );
}

#[test]
fn cold_flows_restart_for_every_collection() {
    let code = "val fib = flow {\n  var a = 0\n  var b = 1\n  while (true) {\n    emit(a)\n    val t = a + b\n    a = b\n    b = t\n  }\n}\nval first = fib.take(8).toList()\nval second = fib.take(8).toList()\nfirst == second";
    assert_eq!(eval(code), Object::Bool(true));
}

#[test]
fn flow_map_transforms_emissions() {
    let code = "val f = flow {\n  for (i in 1..10) { emit(i) }\n}\nf.map { it * it }.take(3).toList()";
    assert_eq!(eval(code), ints(&[1, 4, 9]));
}

#[test]
fn flow_collect_drives_the_consumer() {
    let code = "val seen = []\nval f = flow { emit(1)\nemit(2) }\nf.collect { seen.add(it * 10) }\nseen";
    assert_eq!(eval(code), ints(&[10, 20]));
}

#[test]
fn cancellation_is_observed_at_suspension_points() {
    let code = "var cleaned = false\nval d = launch {\n  try { delay(60000) } finally { cleaned = true }\n}\ndelay(2)\nd.cancel()\ndelay(2)\n[cleaned, d.isActive]";
    assert_eq!(eval(code), Object::List(vec![Object::Bool(true), Object::Bool(false)]));
}

#[test]
fn awaiting_a_cancelled_deferred_raises() {
    let err = eval_err("val d = launch { delay(60000) }\ndelay(2)\nd.cancel()\nd.await()");
    assert_eq!(err.class_name, "IllegalStateError");
}

#[test]
fn deadlock_is_reported_not_hung() {
    let err = eval_err("CompletableDeferred().await()");
    assert_eq!(err.class_name, "IllegalStateError");
    assert!(err.message.contains("deadlock"), "got: {}", err.message);
}

#[test]
fn suspending_native_functions_do_not_block() {
    let mut module = rill::Module::new("test.rl");
    module.bind_native_async("fetch", |args| {
        Box::pin(async move {
            let Some(Object::Int(n)) = args.first() else {
                return Err("fetch takes an Int".to_owned());
            };
            Ok(Object::Int(n * 2))
        })
    });
    assert_eq!(module.eval("fetch(21)").unwrap(), Object::Int(42));
}
