//! `delay`, `launch`, `yield` and the `flow` builder.

use std::{
    future::Future,
    pin::Pin,
    rc::Rc,
    task::{Context, Poll},
    time::{Duration, Instant},
};

use crate::{
    args::ArgValues,
    exceptions::Exec,
    function::call_value,
    heap::HeapData,
    machine::Mx,
    sched::YieldNow,
    source::Span,
    tasks::{Deferred, complete_deferred},
    tracer::TraceEvent,
    types::{class::CoreClass, flow::FlowData},
    value::Value,
};

/// A timer sleep that also completes when its coroutine is cancelled, so
/// long delays do not outlive a cancelled task.
struct CancellableSleep<'a> {
    mx: &'a Mx,
    deadline: Instant,
}

impl Future for CancellableSleep<'_> {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let sched = &self.mx.sched;
        if Instant::now() >= self.deadline || sched.is_cancelled(sched.current_task()) {
            Poll::Ready(())
        } else {
            sched.register_timer(self.deadline, cx.waker().clone());
            Poll::Pending
        }
    }
}

/// `delay(millis)` - suspends the current coroutine without blocking the
/// carrier. Cancellation is observed on both sides of the sleep.
pub(crate) async fn delay(mx: &Mx, args: ArgValues, span: Span) -> Exec<Value> {
    let millis = match args.get_one("delay")? {
        Value::Int(ms) if ms >= 0 => ms as u64,
        Value::Real(s) if s >= 0.0 => (s * 1000.0) as u64,
        _ => {
            return Err(mx.raise_at(
                CoreClass::IllegalArgumentError,
                "delay takes a non-negative duration in milliseconds",
                span,
            ));
        }
    };
    mx.check_cancelled()?;
    CancellableSleep {
        mx,
        deadline: Instant::now() + Duration::from_millis(millis),
    }
    .await;
    mx.check_cancelled()?;
    Ok(Value::Void)
}

/// `launch { ... }` - spawns a coroutine and returns its deferred.
pub(crate) fn launch(mx: &Mx, args: ArgValues, span: Span) -> Exec<Value> {
    let body = args.get_one("launch")?;
    let deferred = mx.alloc(HeapData::Deferred(Deferred::pending()))?;
    let Value::Ref(deferred_id) = deferred else {
        unreachable!("alloc returns a ref");
    };

    let task_mx = Rc::clone(mx);
    let task = mx.sched.spawn(Box::pin(async move {
        let result = call_value(&task_mx, body, ArgValues::empty(), span).await;
        let failed = result.is_err();
        complete_deferred(&task_mx, deferred_id, result);
        let task = task_mx.sched.current_task();
        task_mx.tracer.borrow_mut().event(&TraceEvent::TaskComplete {
            task: task.raw(),
            failed,
        });
    }));
    {
        let mut heap = mx.heap.borrow_mut();
        if let HeapData::Deferred(d) = heap.get_mut(deferred_id) {
            d.task = Some(task);
        }
    }
    mx.tracer
        .borrow_mut()
        .event(&TraceEvent::TaskSpawn { task: task.raw() });
    Ok(deferred)
}

/// `yield()` - reschedules behind every already-runnable coroutine.
pub(crate) async fn yield_now(mx: &Mx, args: ArgValues) -> Exec<Value> {
    args.check_zero("yield")?;
    mx.check_cancelled()?;
    YieldNow::new().await;
    mx.check_cancelled()?;
    Ok(Value::Void)
}

/// `flow { emit(x) }` - builds a cold flow around the producer callable.
pub(crate) fn flow(mx: &Mx, args: ArgValues, _span: Span) -> Exec<Value> {
    let producer = args.get_one("flow")?;
    mx.alloc(HeapData::Flow(FlowData {
        producer,
        ops: Vec::new(),
    }))
}
