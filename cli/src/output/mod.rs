//! Human and JSON output: status lines, run reports, spinners.

pub mod human;
pub mod json;
pub mod progress;
pub mod reporter;
pub mod styles;

use console::Term;
use owo_colors::{OwoColorize as _, Style};
pub use human::HumanRenderer;
pub use reporter::TerminalReporter;
pub use styles::Styles;

/// Prefix of a status line. The run reporter and the commands share them so
/// a run reads the same whether it came from `deploy` or `unlock`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mark {
    Step,
    Ok,
    Note,
    Warn,
    Fail,
}

impl Mark {
    #[must_use]
    pub fn glyph(self) -> &'static str {
        match self {
            Self::Step => "→",
            Self::Ok => "✓",
            Self::Note => "ℹ",
            Self::Warn => "!",
            Self::Fail => "✗",
        }
    }

    fn style(self, styles: &Styles) -> Style {
        match self {
            Self::Step | Self::Note => styles.info,
            Self::Ok => styles.success,
            Self::Warn => styles.warning,
            Self::Fail => styles.error,
        }
    }
}

/// Styling and terminal state for human output.
pub struct OutputContext {
    pub styles: Styles,
    /// Spinners only run on a TTY.
    pub is_tty: bool,
    /// `--quiet`: only failures are printed.
    pub quiet: bool,
}

impl OutputContext {
    /// Colour is off with `--no-color`, a non-empty `NO_COLOR`, or when
    /// stdout is not a terminal.
    #[must_use]
    pub fn new(no_color: bool, quiet: bool) -> Self {
        let is_tty = Term::stdout().is_term();
        let env_no_color = std::env::var_os("NO_COLOR").is_some_and(|v| !v.is_empty());

        let mut styles = Styles::default();
        if !no_color && !env_no_color && is_tty {
            styles.colorize();
        }
        Self {
            styles,
            is_tty,
            quiet,
        }
    }

    #[must_use]
    pub fn show_progress(&self) -> bool {
        self.is_tty && !self.quiet
    }

    /// Print `msg` behind `mark`. Failures go to stderr and ignore `quiet`.
    pub fn line(&self, mark: Mark, msg: &str) {
        let glyph_text = mark.glyph();
        let glyph = glyph_text.style(mark.style(&self.styles));
        match mark {
            Mark::Fail => eprintln!("  {glyph} {msg}"),
            _ if self.quiet => {}
            _ => println!("  {glyph} {msg}"),
        }
    }

    pub fn success(&self, msg: &str) {
        self.line(Mark::Ok, msg);
    }

    pub fn info(&self, msg: &str) {
        self.line(Mark::Note, msg);
    }

    pub fn warn(&self, msg: &str) {
        self.line(Mark::Warn, msg);
    }

    pub fn error(&self, msg: &str) {
        self.line(Mark::Fail, msg);
    }

    /// A status field such as `Lock:  free`, key dimmed.
    pub fn kv(&self, key: &str, value: &str) {
        if !self.quiet {
            println!("  {}  {value}", key.style(self.styles.dim));
        }
    }
}
