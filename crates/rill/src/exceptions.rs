//! Error taxonomy and the control-flow signal type.
//!
//! Runtime errors, `break`/`continue`/`return` and task cancellation all
//! travel the same way: as the `Err` side of [`Exec`], unwinding node
//! execution until something handles them. Loops catch only their own
//! labels, call frames catch returns, `try` catches raises whose class is
//! an ancestor-or-equal of one of its clauses; everything else re-raises.

use std::fmt;

use crate::{
    heap::Heap,
    intern::{Interns, StringId},
    source::{Pos, Source, Span},
    types::class::ClassRef,
    value::Value,
};

/// Result of executing one node: a value, or a control-flow signal.
pub(crate) type Exec<T = Value> = Result<T, Flow>;

/// Control-flow signal unwinding the node tree.
#[derive(Debug)]
pub(crate) enum Flow {
    /// A raised error, caught by the nearest matching `try`.
    Raise(Box<Raised>),
    /// `break [@label] [value]` - caught by the targeted loop.
    Break {
        label: Option<StringId>,
        value: Value,
    },
    /// `continue [@label]` - caught by the targeted loop.
    Continue { label: Option<StringId> },
    /// `return [@label] [value]` - caught by the targeted call frame.
    Return {
        label: Option<StringId>,
        value: Value,
    },
    /// Internal: terminates a cold flow's producer from `take(n)`.
    StopFlow,
    /// The owning coroutine was cancelled at a suspension point.
    /// `finally` blocks run during unwinding; nothing else catches this.
    Cancelled,
}

/// A raised runtime error.
///
/// `value` holds the thrown instance when user code threw one (so a catch
/// binding observes the original object); builtin raises carry only class
/// and message and materialise an instance lazily when bound.
#[derive(Debug, Clone)]
pub(crate) struct Raised {
    pub class: ClassRef,
    pub message: String,
    pub span: Option<Span>,
    pub value: Option<Value>,
    pub cause: Option<Box<Raised>>,
}

impl Raised {
    pub fn new(class: ClassRef, message: impl Into<String>) -> Self {
        Self {
            class,
            message: message.into(),
            span: None,
            value: None,
            cause: None,
        }
    }

    /// Attaches an origin span if the error does not have one yet.
    ///
    /// Inner expressions raise without position; the nearest enclosing node
    /// that knows its span pins it on the way out.
    #[must_use]
    pub fn with_span(mut self, span: Span) -> Self {
        self.span.get_or_insert(span);
        self
    }

    /// Renders the public host-facing exception.
    pub fn to_exception(&self, heap: &Heap, interns: &Interns, source: &Source) -> Exception {
        Exception {
            class_name: self.class.name(heap, interns).into_owned(),
            message: self.message.clone(),
            pos: self.span.map(|s| source.pos_of(s.start)),
            line: self.span.map(|s| source.line_text(s.start).to_owned()),
            cause: self
                .cause
                .as_ref()
                .map(|c| Box::new(c.to_exception(heap, interns, source))),
        }
    }
}

impl Flow {
    /// Pins a span on a raise that has none; other signals pass through.
    #[must_use]
    pub fn with_span(self, span: Span) -> Self {
        match self {
            Self::Raise(raised) => Self::Raise(Box::new(raised.with_span(span))),
            other => other,
        }
    }
}

/// A parse-time failure; fatal for its compilation unit.
#[derive(Debug, Clone)]
pub(crate) struct SyntaxError {
    pub message: String,
    pub span: Span,
}

impl SyntaxError {
    pub fn new(message: impl Into<String>, span: Span) -> Self {
        Self {
            message: message.into(),
            span,
        }
    }

    pub fn to_exception(&self, source: &Source) -> Exception {
        Exception {
            class_name: "SyntaxError".to_owned(),
            message: self.message.clone(),
            pos: Some(source.pos_of(self.span.start)),
            line: Some(source.line_text(self.span.start).to_owned()),
            cause: None,
        }
    }
}

/// The error value that crosses the host boundary.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct Exception {
    /// Error class name (`"IndexOutOfBoundsError"`, user class names, or
    /// `"SyntaxError"` for parse failures).
    pub class_name: String,
    pub message: String,
    /// Origin position, when known.
    pub pos: Option<Pos>,
    /// Source line text at the origin, for rendering.
    pub line: Option<String>,
    pub cause: Option<Box<Exception>>,
}

impl fmt::Display for Exception {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.class_name, self.message)?;
        if let Some(pos) = self.pos {
            write!(f, " at {pos}")?;
            if let Some(line) = &self.line {
                write!(f, "\n    {}", line.trim_end())?;
            }
        }
        if let Some(cause) = &self.cause {
            write!(f, "\ncaused by: {cause}")?;
        }
        Ok(())
    }
}

impl std::error::Error for Exception {}
