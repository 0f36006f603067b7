//! Leveled console output
//!
//! Progress goes to stdout, errors to stderr. The outcome of a run (a fatal
//! error or a slide that could not be found) is always written, whatever
//! the configured level.
use std::fmt::Display;
use std::io::{self, Write};

use colored::{ColoredString, Colorize};
use crate::context;


#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Debug,
    #[default]
    Info,
    Warning,
    Error,
    Critical
}

impl LogLevel {
    fn tag(self) -> ColoredString {
        match self {
            LogLevel::Debug    => "DEBUG".red(),
            LogLevel::Info     => "+".blue(),
            LogLevel::Warning  => "!".yellow(),
            LogLevel::Error    => "ERROR".white().on_red(),
            LogLevel::Critical => "CRITICAL".white().on_red(),
        }
    }

    fn to_stderr(self) -> bool {
        self >= LogLevel::Error
    }
}

pub fn set_log_level(level: LogLevel) {
    context::access(|ctx| {
        ctx.log_level = level;
    })
}

pub fn should_log(level: LogLevel) -> bool {
    level >= context::access(|ctx| ctx.log_level)
}

fn write_line<W: Write>(out: &mut W, level: LogLevel, msg: impl Display) -> io::Result<()> {
    writeln!(out, "[{}] {}", level.tag(), msg)
}

fn emit(level: LogLevel, msg: impl Display) {
    // a closed console is not worth aborting a measurement over
    let _ = if level.to_stderr() {
        write_line(&mut io::stderr().lock(), level, msg)
    } else {
        write_line(&mut io::stdout().lock(), level, msg)
    };
}

fn log(level: LogLevel, msg: impl Display) {
    if should_log(level) {
        emit(level, msg);
    }
}

pub fn debug<T: Display>(msg: T) {
    log(LogLevel::Debug, msg)
}

pub fn info<T: Display>(msg: T) {
    log(LogLevel::Info, msg)
}

pub fn warn<T: Display>(msg: T) {
    log(LogLevel::Warning, msg)
}

pub fn error<T: Display>(msg: T) {
    log(LogLevel::Error, msg)
}

pub fn critical<T: Display>(msg: T) {
    log(LogLevel::Critical, msg)
}

/// `[ERROR] <step>: <cause>`, written regardless of log level
pub fn write_fatal<W: Write>(out: &mut W, step: &str, msg: impl Display) -> io::Result<()> {
    write_line(out, LogLevel::Error, format_args!("{step}: {msg}"))
}

pub const NOT_FOUND_NOTICE: &str = "Failed to determine kernel slide";

/// The negative outcome of a full sweep, written regardless of log level
pub fn write_not_found<W: Write>(out: &mut W) -> io::Result<()> {
    write_line(out, LogLevel::Error, NOT_FOUND_NOTICE)
}

/// Report a fatal error on stderr, tagged with the stage of the run that failed
pub fn fatal<T: Display>(step: &str, msg: T) {
    let _ = write_fatal(&mut io::stderr().lock(), step, msg);
}

/// Report on stderr that the sweep ended without a confirmed slide
pub fn not_found() {
    let _ = write_not_found(&mut io::stderr().lock());
}
