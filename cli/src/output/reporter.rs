//! `TerminalReporter`: presentation-layer implementation of `ProgressReporter`.
//!
//! Wraps `&OutputContext` and implements the `application::ports::ProgressReporter`
//! trait so the orchestrator can emit progress events without depending on
//! any presentation type directly.

use std::cell::RefCell;

use indicatif::ProgressBar;
use crate::application::ports::ProgressReporter;
use crate::output::{Mark, OutputContext, progress};

/// Terminal progress reporter that wraps an `OutputContext`.
///
/// On a TTY each `step()` runs a spinner until the next event; otherwise
/// it prints a `→` step line. Everything is suppressed when `ctx.quiet`.
pub struct TerminalReporter<'a> {
    ctx: &'a OutputContext,
    active: RefCell<Option<(ProgressBar, String)>>,
}

impl<'a> TerminalReporter<'a> {
    /// Create a new `TerminalReporter` wrapping the given output context.
    #[must_use]
    pub fn new(ctx: &'a OutputContext) -> Self {
        Self {
            ctx,
            active: RefCell::new(None),
        }
    }

    /// Close the running spinner, keeping its line if `keep` is set.
    fn settle(&self, keep: bool) {
        if let Some((pb, message)) = self.active.borrow_mut().take() {
            if keep {
                progress::finish_ok(&pb, &message);
            } else {
                progress::finish_abandoned(&pb);
            }
        }
    }
}

impl ProgressReporter for TerminalReporter<'_> {
    fn step(&self, message: &str) {
        if self.ctx.quiet {
            return;
        }
        self.settle(true);
        if self.ctx.show_progress() {
            *self.active.borrow_mut() = Some((progress::spinner(message), message.to_string()));
        } else {
            self.ctx.line(Mark::Step, message);
        }
    }

    fn success(&self, message: &str) {
        if self.ctx.quiet {
            return;
        }
        self.settle(false);
        self.ctx.line(Mark::Ok, message);
    }

    fn warn(&self, message: &str) {
        if self.ctx.quiet {
            return;
        }
        self.settle(false);
        self.ctx.line(Mark::Warn, message);
    }
}

impl Drop for TerminalReporter<'_> {
    fn drop(&mut self) {
        self.settle(true);
    }
}
