//! `print` / `println`.

use crate::{args::ArgValues, exceptions::Exec, machine::Mx, value::Value};

/// Renders all arguments separated by spaces through the module's
/// [`crate::io::PrintWriter`].
pub(crate) fn print(mx: &Mx, args: ArgValues, newline: bool) -> Exec<Value> {
    let parts: Vec<String> = args.pos.iter().map(|v| mx.display(*v)).collect();
    let text = parts.join(" ");
    let mut out = mx.out.borrow_mut();
    if newline {
        out.println(&text);
    } else {
        out.print(&text);
    }
    Ok(Value::Void)
}
