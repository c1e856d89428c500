//! Deferreds, mutexes and channels.
//!
//! These are the interpreter-level synchronisation primitives backing
//! `launch`, `CompletableDeferred`, `Mutex.withLock` and `Channel`. Each
//! lives on the heap; their futures hold the machine and a heap id,
//! re-checking state on every poll and parking their waker in the object
//! when they must wait. Waking is wake-all / re-check, which favours
//! simplicity over fairness.

use std::{
    future::Future,
    pin::Pin,
    task::{Context, Poll, Waker},
};

use crate::{
    exceptions::{Exec, Flow, Raised},
    heap::{HeapData, HeapId},
    machine::Mx,
    sched::TaskId,
    types::class::CoreClass,
    value::Value,
};

// --- deferred --------------------------------------------------------------

#[derive(Debug, Clone)]
pub(crate) enum DeferredState {
    Pending,
    Done(Value),
    Failed(Raised),
    Cancelled,
}

/// A handle to an asynchronous result (`launch` return values and
/// `CompletableDeferred()` instances).
#[derive(Debug)]
pub(crate) struct Deferred {
    pub state: DeferredState,
    pub wakers: Vec<Waker>,
    /// Backing coroutine when created by `launch`; cancelling the deferred
    /// cancels the task.
    pub task: Option<TaskId>,
}

impl Deferred {
    pub fn pending() -> Self {
        Self {
            state: DeferredState::Pending,
            wakers: Vec::new(),
            task: None,
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(self.state, DeferredState::Pending)
    }

    pub fn is_completed(&self) -> bool {
        matches!(self.state, DeferredState::Done(_) | DeferredState::Failed(_))
    }
}

/// Resolves a deferred and wakes every waiter.
///
/// Stray `break`/`continue`/`return` escaping a coroutine body would be a
/// parser bug; they are folded into a failure rather than a panic.
pub(crate) fn complete_deferred(mx: &Mx, id: HeapId, result: Exec<Value>) {
    let mut heap = mx.heap.borrow_mut();
    let HeapData::Deferred(deferred) = heap.get_mut(id) else {
        return;
    };
    if !matches!(deferred.state, DeferredState::Pending) {
        return;
    }
    deferred.state = match result {
        Ok(v) => DeferredState::Done(v),
        Err(Flow::Raise(raised)) => DeferredState::Failed(*raised),
        Err(Flow::Cancelled) => DeferredState::Cancelled,
        Err(Flow::StopFlow) | Err(Flow::Break { .. }) | Err(Flow::Continue { .. }) | Err(Flow::Return { .. }) => {
            DeferredState::Failed(Raised::new(
                crate::types::class::ClassRef::Builtin(CoreClass::IllegalStateError),
                "control-flow signal escaped a coroutine",
            ))
        }
    };
    let wakers = std::mem::take(&mut deferred.wakers);
    drop(heap);
    for waker in wakers {
        waker.wake();
    }
}

/// Marks a pending deferred cancelled, wakes waiters and cancels any
/// backing coroutine.
pub(crate) fn cancel_deferred(mx: &Mx, id: HeapId) {
    let task = {
        let mut heap = mx.heap.borrow_mut();
        let HeapData::Deferred(deferred) = heap.get_mut(id) else {
            return;
        };
        if !matches!(deferred.state, DeferredState::Pending) {
            return;
        }
        deferred.state = DeferredState::Cancelled;
        let wakers = std::mem::take(&mut deferred.wakers);
        let task = deferred.task;
        drop(heap);
        for waker in wakers {
            waker.wake();
        }
        task
    };
    if let Some(task) = task {
        mx.sched.cancel(task);
    }
}

/// `deferred.await()` - suspends until resolved.
pub(crate) struct AwaitDeferred {
    pub mx: Mx,
    pub id: HeapId,
}

impl Future for AwaitDeferred {
    type Output = Exec<Value>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if let Err(flow) = self.mx.check_cancelled() {
            return Poll::Ready(Err(flow));
        }
        let mut heap = self.mx.heap.borrow_mut();
        let HeapData::Deferred(deferred) = heap.get_mut(self.id) else {
            drop(heap);
            return Poll::Ready(Err(self.mx.raise(CoreClass::IllegalStateError, "not a deferred")));
        };
        match &deferred.state {
            DeferredState::Done(v) => Poll::Ready(Ok(*v)),
            DeferredState::Failed(raised) => {
                let raised = raised.clone();
                Poll::Ready(Err(Flow::Raise(Box::new(raised))))
            }
            DeferredState::Cancelled => {
                drop(heap);
                Poll::Ready(Err(self.mx.raise(CoreClass::IllegalStateError, "coroutine was cancelled")))
            }
            DeferredState::Pending => {
                deferred.wakers.push(cx.waker().clone());
                Poll::Pending
            }
        }
    }
}

// --- mutex -----------------------------------------------------------------

#[derive(Debug, Default)]
pub(crate) struct MutexState {
    pub locked: bool,
    pub wakers: Vec<Waker>,
}

/// `mutex.lock()` - suspends until the lock is free, then takes it.
pub(crate) struct LockMutex {
    pub mx: Mx,
    pub id: HeapId,
}

impl Future for LockMutex {
    type Output = Exec<()>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if let Err(flow) = self.mx.check_cancelled() {
            return Poll::Ready(Err(flow));
        }
        let mut heap = self.mx.heap.borrow_mut();
        let HeapData::Mutex(mutex) = heap.get_mut(self.id) else {
            drop(heap);
            return Poll::Ready(Err(self.mx.raise(CoreClass::IllegalStateError, "not a mutex")));
        };
        if mutex.locked {
            mutex.wakers.push(cx.waker().clone());
            Poll::Pending
        } else {
            mutex.locked = true;
            Poll::Ready(Ok(()))
        }
    }
}

/// Releases a mutex and wakes all contenders (they re-race for the lock).
pub(crate) fn mutex_unlock(mx: &Mx, id: HeapId) -> Exec<()> {
    let mut heap = mx.heap.borrow_mut();
    let HeapData::Mutex(mutex) = heap.get_mut(id) else {
        drop(heap);
        return Err(mx.raise(CoreClass::IllegalStateError, "not a mutex"));
    };
    if !mutex.locked {
        drop(heap);
        return Err(mx.raise(CoreClass::IllegalStateError, "unlock of an unlocked Mutex"));
    }
    mutex.locked = false;
    let wakers = std::mem::take(&mut mutex.wakers);
    drop(heap);
    for waker in wakers {
        waker.wake();
    }
    Ok(())
}

// --- channel ---------------------------------------------------------------

#[derive(Debug)]
pub(crate) struct ChannelState {
    /// Zero-capacity (rendezvous) channels are approximated with one slot.
    pub capacity: usize,
    pub queue: std::collections::VecDeque<Value>,
    pub closed: bool,
    pub send_wakers: Vec<Waker>,
    pub recv_wakers: Vec<Waker>,
}

impl ChannelState {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            queue: std::collections::VecDeque::new(),
            closed: false,
            send_wakers: Vec::new(),
            recv_wakers: Vec::new(),
        }
    }
}

pub(crate) struct ChannelSend {
    pub mx: Mx,
    pub id: HeapId,
    pub value: Value,
}

impl Future for ChannelSend {
    type Output = Exec<Value>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if let Err(flow) = self.mx.check_cancelled() {
            return Poll::Ready(Err(flow));
        }
        let mut heap = self.mx.heap.borrow_mut();
        let HeapData::Channel(chan) = heap.get_mut(self.id) else {
            drop(heap);
            return Poll::Ready(Err(self.mx.raise(CoreClass::IllegalStateError, "not a channel")));
        };
        if chan.closed {
            drop(heap);
            return Poll::Ready(Err(self.mx.raise(CoreClass::IllegalStateError, "send on a closed Channel")));
        }
        if chan.queue.len() < chan.capacity {
            chan.queue.push_back(self.value);
            let wakers = std::mem::take(&mut chan.recv_wakers);
            drop(heap);
            for waker in wakers {
                waker.wake();
            }
            Poll::Ready(Ok(Value::Void))
        } else {
            chan.send_wakers.push(cx.waker().clone());
            Poll::Pending
        }
    }
}

pub(crate) struct ChannelRecv {
    pub mx: Mx,
    pub id: HeapId,
}

impl Future for ChannelRecv {
    type Output = Exec<Value>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if let Err(flow) = self.mx.check_cancelled() {
            return Poll::Ready(Err(flow));
        }
        let mut heap = self.mx.heap.borrow_mut();
        let HeapData::Channel(chan) = heap.get_mut(self.id) else {
            drop(heap);
            return Poll::Ready(Err(self.mx.raise(CoreClass::IllegalStateError, "not a channel")));
        };
        if let Some(value) = chan.queue.pop_front() {
            let wakers = std::mem::take(&mut chan.send_wakers);
            drop(heap);
            for waker in wakers {
                waker.wake();
            }
            Poll::Ready(Ok(value))
        } else if chan.closed {
            drop(heap);
            Poll::Ready(Err(self
                .mx
                .raise(CoreClass::IterationEndException, "receive on an exhausted Channel")))
        } else {
            chan.recv_wakers.push(cx.waker().clone());
            Poll::Pending
        }
    }
}

/// Closes a channel; queued values stay receivable, further receives end
/// with `IterationEndException`.
pub(crate) fn channel_close(mx: &Mx, id: HeapId) -> Exec<()> {
    let mut heap = mx.heap.borrow_mut();
    let HeapData::Channel(chan) = heap.get_mut(id) else {
        drop(heap);
        return Err(mx.raise(CoreClass::IllegalStateError, "not a channel"));
    };
    chan.closed = true;
    let mut wakers = std::mem::take(&mut chan.send_wakers);
    wakers.extend(std::mem::take(&mut chan.recv_wakers));
    drop(heap);
    for waker in wakers {
        waker.wake();
    }
    Ok(())
}
