// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

//! Verbosity-gated diagnostics. The teacher carries no logging crate and
//! prints straight to stdout/stderr; this keeps that convention and only adds
//! a level check driven by the CLI's repeated `-v` flag, rather than pulling
//! in `log`/`env_logger`/`tracing` for a VMM this small.

use std::sync::atomic::{AtomicI32, Ordering};

static VERBOSITY: AtomicI32 = AtomicI32::new(0);

/// Sets the process-wide verbosity level, read from `--verbose`'s occurrence
/// count. Called once at startup before the VMM is brought up.
pub fn set_verbosity(level: i32) {
    VERBOSITY.store(level, Ordering::Relaxed);
}

pub fn verbosity() -> i32 {
    VERBOSITY.load(Ordering::Relaxed)
}

/// Prints to stderr only when the process verbosity is at least `level`.
/// Level 0 diagnostics (guest-fatal errors) should use `eprintln!` directly;
/// this is for the "unknown register"/"unhandled exit" class of notice that
/// would otherwise spam a quiet run.
#[macro_export]
macro_rules! log_if {
    ($level:expr, $($arg:tt)*) => {
        if $crate::logger::verbosity() >= $level {
            eprintln!($($arg)*);
        }
    };
}
