//! Print output abstraction.
//!
//! The engine never writes to stdout directly; `print`/`println` go
//! through a [`PrintWriter`] so hosts can capture or redirect script
//! output. Tests use [`CollectStringPrint`].

/// Destination for script print output.
pub trait PrintWriter {
    fn print(&mut self, text: &str);

    fn println(&mut self, text: &str) {
        self.print(text);
        self.print("\n");
    }
}

/// Writes to the process stdout.
#[derive(Debug, Default)]
pub struct StdPrint;

impl PrintWriter for StdPrint {
    fn print(&mut self, text: &str) {
        print!("{text}");
    }
}

/// Discards all output.
#[derive(Debug, Default)]
pub struct NoPrint;

impl PrintWriter for NoPrint {
    fn print(&mut self, _text: &str) {}
}

/// Collects output into a string, for tests and capture-style embedding.
#[derive(Debug, Default)]
pub struct CollectStringPrint {
    output: String,
}

impl CollectStringPrint {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn output(&self) -> &str {
        &self.output
    }

    pub fn take(&mut self) -> String {
        std::mem::take(&mut self.output)
    }
}

impl PrintWriter for CollectStringPrint {
    fn print(&mut self, text: &str) {
        self.output.push_str(text);
    }
}
