//! The single-carrier cooperative scheduler.
//!
//! Every coroutine is a boxed Rust future; the evaluator's implicit
//! suspension points (delay, awaits, channel and mutex operations) are the
//! only places control can change hands. The scheduler owns a slab of
//! spawned tasks, a wake queue fed by `std::task::Wake` wakers, and a
//! timer list; `block_on` drives the main future and interleaves spawned
//! tasks whenever it suspends.
//!
//! When nothing is runnable and no timer is armed, the program has
//! deadlocked; `block_on` reports that instead of hanging, which keeps
//! evaluation total.

use std::{
    cell::{Cell, RefCell},
    future::Future,
    pin::Pin,
    rc::Rc,
    sync::{Arc, Mutex},
    task::{Context, Poll, Wake, Waker},
    time::{Duration, Instant},
};

/// Identifier of a spawned coroutine. The main (block_on) future is task 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct TaskId(u32);

impl TaskId {
    pub const MAIN: Self = Self(0);

    pub fn raw(self) -> u32 {
        self.0
    }
}

type TaskFuture = Pin<Box<dyn Future<Output = ()>>>;

struct TaskEntry {
    future: TaskFuture,
    cancelled: Rc<Cell<bool>>,
}

/// Cross-thread-safe wake queue (wakers must be `Send + Sync` even though
/// this scheduler is single-carrier).
struct WakeQueue {
    woken: Mutex<Vec<TaskId>>,
}

struct TaskWaker {
    id: TaskId,
    queue: Arc<WakeQueue>,
}

impl Wake for TaskWaker {
    fn wake(self: Arc<Self>) {
        self.wake_by_ref();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        if let Ok(mut woken) = self.queue.woken.lock() {
            woken.push(self.id);
        }
    }
}

struct TimerEntry {
    deadline: Instant,
    waker: Waker,
}

#[derive(Default)]
struct SchedInner {
    /// Slab of spawned tasks; index + 1 is the task id (0 is main).
    tasks: Vec<Option<TaskEntry>>,
    timers: Vec<TimerEntry>,
}

pub(crate) struct Scheduler {
    inner: RefCell<SchedInner>,
    queue: Arc<WakeQueue>,
    /// Task currently being polled; suspension futures read this to find
    /// their owner's cancellation flag.
    current: Cell<TaskId>,
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler").finish_non_exhaustive()
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self {
            inner: RefCell::new(SchedInner::default()),
            queue: Arc::new(WakeQueue {
                woken: Mutex::new(Vec::new()),
            }),
            current: Cell::new(TaskId::MAIN),
        }
    }
}

impl Scheduler {
    fn waker(&self, id: TaskId) -> Waker {
        Waker::from(Arc::new(TaskWaker {
            id,
            queue: Arc::clone(&self.queue),
        }))
    }

    /// Registers a coroutine; it runs when the current task next suspends.
    pub fn spawn(&self, future: TaskFuture) -> TaskId {
        let mut inner = self.inner.borrow_mut();
        let entry = TaskEntry {
            future,
            cancelled: Rc::new(Cell::new(false)),
        };
        let slot = inner.tasks.iter().position(Option::is_none);
        let id = match slot {
            Some(i) => {
                inner.tasks[i] = Some(entry);
                TaskId(i as u32 + 1)
            }
            None => {
                inner.tasks.push(Some(entry));
                TaskId(inner.tasks.len() as u32)
            }
        };
        drop(inner);
        if let Ok(mut woken) = self.queue.woken.lock() {
            woken.push(id);
        }
        id
    }

    pub fn current_task(&self) -> TaskId {
        self.current.get()
    }

    /// Marks a task cancelled and wakes it so the flag is observed at its
    /// next (or pending) suspension point.
    pub fn cancel(&self, id: TaskId) {
        if id == TaskId::MAIN {
            return;
        }
        let inner = self.inner.borrow();
        if let Some(Some(entry)) = inner.tasks.get(id.0 as usize - 1) {
            entry.cancelled.set(true);
        }
        drop(inner);
        if let Ok(mut woken) = self.queue.woken.lock() {
            woken.push(id);
        }
    }

    /// Whether the given task has been cancelled. Main is never cancelled.
    pub fn is_cancelled(&self, id: TaskId) -> bool {
        if id == TaskId::MAIN {
            return false;
        }
        self.inner
            .borrow()
            .tasks
            .get(id.0 as usize - 1)
            .and_then(Option::as_ref)
            .is_some_and(|t| t.cancelled.get())
    }

    pub fn register_timer(&self, deadline: Instant, waker: Waker) {
        self.inner.borrow_mut().timers.push(TimerEntry { deadline, waker });
    }

    fn fire_due_timers(&self, now: Instant) -> bool {
        let due: Vec<TimerEntry> = {
            let mut inner = self.inner.borrow_mut();
            let mut due = Vec::new();
            let mut i = 0;
            while i < inner.timers.len() {
                if inner.timers[i].deadline <= now {
                    due.push(inner.timers.swap_remove(i));
                } else {
                    i += 1;
                }
            }
            due
        };
        let fired = !due.is_empty();
        for timer in due {
            timer.waker.wake();
        }
        fired
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.inner.borrow().timers.iter().map(|t| t.deadline).min()
    }

    fn poll_task(&self, id: TaskId) {
        let taken = {
            let mut inner = self.inner.borrow_mut();
            inner
                .tasks
                .get_mut(id.0 as usize - 1)
                .and_then(Option::take)
        };
        let Some(mut entry) = taken else {
            return; // already completed; spurious wake
        };
        let waker = self.waker(id);
        let mut cx = Context::from_waker(&waker);
        let prev = self.current.replace(id);
        let poll = entry.future.as_mut().poll(&mut cx);
        self.current.set(prev);
        if poll.is_pending() {
            self.inner.borrow_mut().tasks[id.0 as usize - 1] = Some(entry);
        }
    }

    /// Drives `main` to completion, interleaving spawned tasks.
    ///
    /// Returns `None` when execution deadlocks (everything suspended, no
    /// timer armed). Spawned tasks still pending when `main` completes are
    /// dropped - cancellation at end of module evaluation.
    pub fn block_on<T>(&self, main: impl Future<Output = T>) -> Option<T> {
        let mut main = std::pin::pin!(main);
        let main_waker = self.waker(TaskId::MAIN);
        let mut poll_main = true;
        loop {
            if poll_main {
                let mut cx = Context::from_waker(&main_waker);
                self.current.set(TaskId::MAIN);
                if let Poll::Ready(out) = main.as_mut().poll(&mut cx) {
                    self.inner.borrow_mut().tasks.clear();
                    return Some(out);
                }
            }
            let woken: Vec<TaskId> = {
                let mut queue = self.queue.woken.lock().ok()?;
                std::mem::take(&mut *queue)
            };
            poll_main = false;
            if woken.is_empty() {
                // Nothing runnable: advance time or report deadlock.
                let Some(deadline) = self.next_deadline() else {
                    return None;
                };
                let now = Instant::now();
                if deadline > now {
                    std::thread::sleep(deadline - now);
                }
                self.fire_due_timers(Instant::now());
                continue;
            }
            for id in woken {
                if id == TaskId::MAIN {
                    poll_main = true;
                } else {
                    self.poll_task(id);
                }
            }
        }
    }
}

/// Suspends the current coroutine until `deadline`.
pub(crate) struct Sleep<'a> {
    deadline: Instant,
    sched: &'a Scheduler,
}

impl Future for Sleep<'_> {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if Instant::now() >= self.deadline {
            Poll::Ready(())
        } else {
            self.sched.register_timer(self.deadline, cx.waker().clone());
            Poll::Pending
        }
    }
}

impl Scheduler {
    /// A future completing after `duration`, registered with this
    /// scheduler's timer list.
    pub fn sleep(&self, duration: Duration) -> Sleep<'_> {
        Sleep {
            deadline: Instant::now() + duration,
            sched: self,
        }
    }
}

/// Reschedules the current coroutine behind everything already woken.
pub(crate) struct YieldNow {
    yielded: bool,
}

impl YieldNow {
    pub fn new() -> Self {
        Self { yielded: false }
    }
}

impl Future for YieldNow {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if self.yielded {
            Poll::Ready(())
        } else {
            self.yielded = true;
            cx.waker().wake_by_ref();
            Poll::Pending
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_on_plain_future() {
        let sched = Scheduler::default();
        assert_eq!(sched.block_on(async { 41 + 1 }), Some(42));
    }

    #[test]
    fn yield_now_round_trips() {
        let sched = Scheduler::default();
        let out = sched.block_on(async {
            YieldNow::new().await;
            7
        });
        assert_eq!(out, Some(7));
    }

    #[test]
    fn spawned_tasks_run_while_main_sleeps() {
        let sched = Scheduler::default();
        let hit = Rc::new(Cell::new(false));
        let hit2 = Rc::clone(&hit);
        sched.spawn(Box::pin(async move {
            hit2.set(true);
        }));
        let out = sched.block_on(async {
            sched.sleep(Duration::from_millis(2)).await;
            3
        });
        assert_eq!(out, Some(3));
        assert!(hit.get());
    }

    #[test]
    fn deadlock_is_detected() {
        let sched = Scheduler::default();
        let out = sched.block_on(std::future::pending::<()>());
        assert_eq!(out, None);
    }
}
