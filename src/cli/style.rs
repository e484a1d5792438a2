//! CLI styling helpers.
//!
//! Semantic wrappers over `owo-colors` with terminal detection, so the
//! command output degrades cleanly when piped.

use std::fmt::{self, Display};

use owo_colors::{OwoColorize, Stream, Style};

const ACCENT: Style = Style::new().cyan();
const SUCCESS: Style = Style::new().green();
const ERROR: Style = Style::new().red();
const MUTED: Style = Style::new().dimmed();

/// A value styled for a particular output stream.
pub struct Styled<T> {
    value: T,
    style: Style,
    stream: Stream,
}

impl<T: Display> Display for Styled<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}",
            self.value
                .if_supports_color(self.stream, |v| v.style(self.style))
        )
    }
}

/// Semantic styling for displayable values.
pub trait Stylize: Display + Sized {
    /// Primary information: URLs, branch names.
    fn accent(self) -> Styled<Self> {
        Styled {
            value: self,
            style: ACCENT,
            stream: Stream::Stdout,
        }
    }

    /// Completed work.
    fn success(self) -> Styled<Self> {
        Styled {
            value: self,
            style: SUCCESS,
            stream: Stream::Stdout,
        }
    }

    /// Failures, printed to stderr.
    fn error(self) -> Styled<Self> {
        Styled {
            value: self,
            style: ERROR,
            stream: Stream::Stderr,
        }
    }

    /// Secondary detail.
    fn muted(self) -> Styled<Self> {
        Styled {
            value: self,
            style: MUTED,
            stream: Stream::Stdout,
        }
    }
}

impl<T: Display> Stylize for T {}
