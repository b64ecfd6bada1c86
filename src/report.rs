//! Line-oriented user-facing output with method prefixes.
//!
//! Every calibration routine prints through a [`Reporter`], which prepends a
//! two-character tag identifying the routine that produced the line, e.g.
//! `[IC] Iteration 3 (max 20)`. Tags live on a LIFO stack so nested
//! routines report under their own tag and the caller's tag is restored
//! automatically: [`Reporter::scope`] pushes and the returned guard pops on
//! drop, on every exit path.
//!
//! This channel is for the operator watching the calibration; diagnostics
//! go through `log` as usual.

use std::io::Write;
use std::ops::{Deref, DerefMut};

/// Maximum prefix nesting. Deeper pushes are ignored with a log warning.
const MAX_PREFIXES: usize = 10;

/// Prefixed line writer for calibration progress and results.
pub struct Reporter<W: Write> {
    out: W,
    prefixes: Vec<&'static str>,
}

impl<W: Write> Reporter<W> {
    pub fn new(out: W) -> Self {
        Self {
            out,
            prefixes: Vec::with_capacity(MAX_PREFIXES),
        }
    }

    /// Push `tag` for the duration of the returned guard.
    pub fn scope(&mut self, tag: &'static str) -> Scoped<'_, W> {
        if self.prefixes.len() < MAX_PREFIXES {
            self.prefixes.push(tag);
        } else {
            log::warn!("reporter prefix stack full, dropping tag {:?}", tag);
        }
        Scoped { reporter: self }
    }

    /// Write one prefixed line.
    pub fn line(&mut self, msg: &str) {
        match self.prefixes.last() {
            Some(tag) if !tag.is_empty() => {
                let _ = writeln!(self.out, "[{}] {}", tag, msg);
            }
            _ => {
                let _ = writeln!(self.out, "{}", msg);
            }
        }
    }

    /// Write text verbatim, no prefix, no newline.
    pub fn raw(&mut self, msg: &str) {
        let _ = write!(self.out, "{}", msg);
    }

    /// Visual separator line.
    pub fn blank(&mut self) {
        let _ = writeln!(self.out, " ");
    }

    /// Access the underlying writer (used by tests to inspect output).
    pub fn get_ref(&self) -> &W {
        &self.out
    }

    fn pop(&mut self) {
        if self.prefixes.pop().is_none() {
            log::warn!("reporter prefix stack popped while empty");
        }
    }
}

/// Guard returned by [`Reporter::scope`]; pops the tag when dropped.
pub struct Scoped<'a, W: Write> {
    reporter: &'a mut Reporter<W>,
}

impl<W: Write> Deref for Scoped<'_, W> {
    type Target = Reporter<W>;

    fn deref(&self) -> &Reporter<W> {
        self.reporter
    }
}

impl<W: Write> DerefMut for Scoped<'_, W> {
    fn deref_mut(&mut self) -> &mut Reporter<W> {
        self.reporter
    }
}

impl<W: Write> Drop for Scoped<'_, W> {
    fn drop(&mut self) {
        self.reporter.pop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text(reporter: &Reporter<Vec<u8>>) -> String {
        String::from_utf8(reporter.get_ref().clone()).unwrap()
    }

    #[test]
    fn test_prefixed_line() {
        let mut reporter = Reporter::new(Vec::new());
        {
            let mut scope = reporter.scope("DM");
            scope.line("probing");
        }
        assert_eq!(text(&reporter), "[DM] probing\n");
    }

    #[test]
    fn test_nested_scopes_restore_outer_tag() {
        let mut reporter = Reporter::new(Vec::new());
        {
            let mut outer = reporter.scope("IC");
            outer.line("outer before");
            {
                let mut inner = outer.scope("ES");
                inner.line("inner");
            }
            outer.line("outer after");
        }
        assert_eq!(
            text(&reporter),
            "[IC] outer before\n[ES] inner\n[IC] outer after\n"
        );
    }

    #[test]
    fn test_scope_pops_on_early_exit() {
        fn failing(reporter: &mut Reporter<Vec<u8>>) -> Result<(), ()> {
            let mut scope = reporter.scope("PR");
            scope.line("start");
            Err(())
        }

        let mut reporter = Reporter::new(Vec::new());
        let _ = failing(&mut reporter);
        reporter.line("back at top");
        assert_eq!(text(&reporter), "[PR] start\nback at top\n");
    }

    #[test]
    fn test_unprefixed_when_stack_empty() {
        let mut reporter = Reporter::new(Vec::new());
        reporter.line("hello");
        assert_eq!(text(&reporter), "hello\n");
    }
}
