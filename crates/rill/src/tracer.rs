//! Structured execution tracing.
//!
//! The evaluator reports a small set of events through an [`EvalTracer`];
//! the default [`NoopTracer`] compiles away to nothing interesting, while
//! [`StderrTracer`] gives a cheap execution log when debugging embedded
//! scripts.

use crate::source::Pos;

/// One traced event.
#[derive(Debug, Clone, PartialEq)]
pub enum TraceEvent<'a> {
    /// Entering a function or method call.
    CallEnter { name: &'a str, depth: usize },
    /// A runtime error was raised (before any catch handling).
    Raise { class_name: &'a str, message: &'a str, pos: Option<Pos> },
    /// A coroutine was spawned via `launch`.
    TaskSpawn { task: u32 },
    /// A spawned coroutine completed or failed.
    TaskComplete { task: u32, failed: bool },
    /// A package was imported (first initialisation only).
    Import { path: &'a str },
}

/// Receives structured events from the evaluator.
pub trait EvalTracer {
    fn event(&mut self, event: &TraceEvent<'_>);
}

/// Ignores all events.
#[derive(Debug, Default)]
pub struct NoopTracer;

impl EvalTracer for NoopTracer {
    fn event(&mut self, _event: &TraceEvent<'_>) {}
}

/// Logs every event to stderr, one line each.
#[derive(Debug, Default)]
pub struct StderrTracer;

impl EvalTracer for StderrTracer {
    fn event(&mut self, event: &TraceEvent<'_>) {
        match event {
            TraceEvent::CallEnter { name, depth } => {
                eprintln!("rill: {:indent$}call {name}", "", indent = depth.min(&40));
            }
            TraceEvent::Raise {
                class_name,
                message,
                pos,
            } => match pos {
                Some(pos) => eprintln!("rill: raise {class_name}: {message} at {pos}"),
                None => eprintln!("rill: raise {class_name}: {message}"),
            },
            TraceEvent::TaskSpawn { task } => eprintln!("rill: spawn task {task}"),
            TraceEvent::TaskComplete { task, failed } => {
                eprintln!("rill: task {task} {}", if *failed { "failed" } else { "done" });
            }
            TraceEvent::Import { path } => eprintln!("rill: import {path}"),
        }
    }
}
