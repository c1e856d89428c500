//! Global builtin functions and root-scope bindings.
//!
//! The root frame under every module carries the builtin classes (by
//! their surface names) and the global functions. Builtins are an enum so
//! they cost nothing to store in a `Value`.

mod asserts;
mod concurrency;
mod print;

use strum::{Display, IntoStaticStr};

use crate::{
    args::ArgValues,
    exceptions::Exec,
    machine::Mx,
    scope::Record,
    source::Span,
    types::class::{ClassRef, CoreClass},
    value::Value,
};

/// Global builtin functions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, IntoStaticStr)]
#[strum(serialize_all = "camelCase")]
pub(crate) enum BuiltinFn {
    Print,
    Println,
    Assert,
    Require,
    Check,
    Delay,
    Launch,
    Yield,
    Flow,
}

impl BuiltinFn {
    const ALL: &'static [Self] = &[
        Self::Print,
        Self::Println,
        Self::Assert,
        Self::Require,
        Self::Check,
        Self::Delay,
        Self::Launch,
        Self::Yield,
        Self::Flow,
    ];
}

pub(crate) async fn call_builtin(mx: &Mx, builtin: BuiltinFn, args: ArgValues, span: Span) -> Exec<Value> {
    match builtin {
        BuiltinFn::Print => print::print(mx, args, false),
        BuiltinFn::Println => print::print(mx, args, true),
        BuiltinFn::Assert => asserts::assert_like(mx, CoreClass::AssertionFailed, "assertion failed", args, span),
        BuiltinFn::Require => asserts::assert_like(
            mx,
            CoreClass::IllegalArgumentError,
            "requirement not met",
            args,
            span,
        ),
        BuiltinFn::Check => asserts::assert_like(mx, CoreClass::IllegalStateError, "check failed", args, span),
        BuiltinFn::Delay => concurrency::delay(mx, args, span).await,
        BuiltinFn::Launch => concurrency::launch(mx, args, span),
        BuiltinFn::Yield => concurrency::yield_now(mx, args).await,
        BuiltinFn::Flow => concurrency::flow(mx, args, span),
    }
}

/// Seeds the root frame with builtin classes and functions.
pub(crate) fn install(mx: &Mx) {
    let root = mx.root_scope;
    let mut bind = |name: &str, value: Value| {
        let id = mx.intern(name);
        mx.scopes.borrow_mut().declare(root, id, Record::immutable(value));
    };

    for builtin in BuiltinFn::ALL {
        bind((*builtin).into(), Value::Builtin(*builtin));
    }

    for core in [
        CoreClass::Obj,
        CoreClass::Int,
        CoreClass::Real,
        CoreClass::Bool,
        CoreClass::Char,
        CoreClass::Str,
        CoreClass::Iterable,
        CoreClass::Collection,
        CoreClass::Array,
        CoreClass::List,
        CoreClass::Set,
        CoreClass::Map,
        CoreClass::MapEntry,
        CoreClass::Range,
        CoreClass::Buffer,
        CoreClass::Iterator,
        CoreClass::Callable,
        CoreClass::Class,
        CoreClass::Regex,
        CoreClass::Mutex,
        CoreClass::Channel,
        CoreClass::Deferred,
        CoreClass::Exception,
        CoreClass::NullPointerError,
        CoreClass::AssertionFailed,
        CoreClass::ClassCastError,
        CoreClass::IndexOutOfBoundsError,
        CoreClass::IllegalArgumentError,
        CoreClass::IllegalAssignmentError,
        CoreClass::SymbolNotDefinedError,
        CoreClass::IterationEndException,
        CoreClass::AccessError,
        CoreClass::IllegalOperationError,
        CoreClass::IllegalStateError,
        CoreClass::NotImplementedError,
        CoreClass::UnknownException,
    ] {
        bind(core.into(), Value::Class(ClassRef::Builtin(core)));
    }
    // Aliases the surface documents alongside the canonical names.
    bind("SymbolNotFound", Value::Class(ClassRef::Builtin(CoreClass::SymbolNotDefinedError)));
    bind(
        "CompletableDeferred",
        Value::Class(ClassRef::Builtin(CoreClass::Deferred)),
    );
}
