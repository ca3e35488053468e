//! User-facing message helpers for the rem CLI.
//!
//! Library crates report progress through `tracing`; anything meant for the
//! person at the keyboard goes through these macros instead, so that labels
//! are colored consistently and colors are suppressed when output is piped.

use std::io::Write;

use termcolor::{Color, ColorChoice, ColorSpec, StandardStream, WriteColor};

#[doc(hidden)]
pub fn labelled_stdout(label: &str, spec: ColorSpec) {
    let mut out = StandardStream::stdout(color_choice(atty::Stream::Stdout));
    write_label(&mut out, label, &spec);
}

#[doc(hidden)]
pub fn labelled_stderr(label: &str, spec: ColorSpec) {
    let mut err = StandardStream::stderr(color_choice(atty::Stream::Stderr));
    write_label(&mut err, label, &spec);
}

fn write_label(stream: &mut StandardStream, label: &str, spec: &ColorSpec) {
    let _ = stream.set_color(spec);
    let _ = write!(stream, "{label}");
    let _ = stream.reset();
    let _ = stream.flush();
}

fn color_choice(stream: atty::Stream) -> ColorChoice {
    if atty::is(stream) {
        ColorChoice::Auto
    } else {
        ColorChoice::Never
    }
}

/// A bold green progress label on stdout, e.g. `step!("Installed", "plugin {name}")`.
#[macro_export]
macro_rules! step {
    ($label:expr, $($arg:tt)*) => {{
        $crate::labelled_stdout($label, $crate::colors::bold_green());
        println!(" {}", format_args!($($arg)*));
    }};
}

/// A bold yellow `Warning:` line on stderr.
#[macro_export]
macro_rules! warn {
    ($($arg:tt)*) => {{
        $crate::labelled_stderr("Warning", $crate::colors::bold_yellow());
        eprintln!(": {}", format_args!($($arg)*));
    }};
}

/// A bold red `Error:` line on stderr.
#[macro_export]
macro_rules! error {
    ($($arg:tt)*) => {{
        $crate::labelled_stderr("Error", $crate::colors::bold_red());
        eprintln!(": {}", format_args!($($arg)*));
    }};
}

pub mod colors {
    use super::{Color, ColorSpec};

    pub fn bold_green() -> ColorSpec {
        bold(Color::Green)
    }

    pub fn bold_yellow() -> ColorSpec {
        bold(Color::Yellow)
    }

    pub fn bold_red() -> ColorSpec {
        bold(Color::Red)
    }

    fn bold(color: Color) -> ColorSpec {
        let mut spec = ColorSpec::new();
        spec.set_fg(Some(color)).set_bold(true);
        spec
    }
}
