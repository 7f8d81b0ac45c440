//! Stage-labelled terminal progress lines.
//!
//! The loop's human-facing output is a stream of `[label] message` lines;
//! everything machine-readable goes to JSON artifacts instead. Labels carry
//! the stage context (`baseline:inner:tuning`, `iter 003:canary:a`).

use owo_colors::OwoColorize;

/// One progress line for a pipeline stage.
pub fn stage(label: &str, msg: &str) {
    println!("{} {msg}", format!("[{label}]").cyan());
}

/// A headline for session-level milestones (startup, acceptance, stop).
pub fn headline(label: &str, msg: &str) {
    println!("{} {msg}", format!("[{label}]").green().bold());
}

/// A warning line for skipped or failed gates.
pub fn warn(label: &str, msg: &str) {
    println!("{} {msg}", format!("[{label}]").yellow().bold());
}
