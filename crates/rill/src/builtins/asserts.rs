//! `assert` / `require` / `check`.
//!
//! All three share one shape and differ only in the error class they
//! raise: `AssertionFailed`, `IllegalArgumentError` and
//! `IllegalStateError` respectively.

use crate::{
    args::ArgValues,
    exceptions::Exec,
    machine::Mx,
    source::Span,
    types::class::CoreClass,
    value::Value,
};

pub(crate) fn assert_like(
    mx: &Mx,
    class: CoreClass,
    default_msg: &str,
    args: ArgValues,
    span: Span,
) -> Exec<Value> {
    let (cond, message) = args.get_one_two(<&'static str>::from(class))?;
    let Some(ok) = cond.as_bool() else {
        return Err(mx.raise_at(
            CoreClass::IllegalArgumentError,
            "first argument must be a Bool condition",
            span,
        ));
    };
    if ok {
        return Ok(Value::Void);
    }
    let message = match message {
        Some(m) => mx.display(m),
        None => default_msg.to_owned(),
    };
    Err(mx.raise_at(class, message, span))
}
