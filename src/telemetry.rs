// Copyright (c) 2018 Nuclear Furnace
//
// Permission is hereby granted, free of charge, to any person obtaining a copy
// of this software and associated documentation files (the "Software"), to deal
// in the Software without restriction, including without limitation the rights
// to use, copy, modify, merge, publish, distribute, sublicense, and/or sell
// copies of the Software, and to permit persons to whom the Software is
// furnished to do so, subject to the following conditions:
//
// The above copyright notice and this permission notice shall be included in all
// copies or substantial portions of the Software.
//
// THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
// IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
// FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
// AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
// LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING FROM,
// OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS IN THE
// SOFTWARE.
//! Process-wide logging setup. Generalizes `set_logger` (rotating file
//! handler vs. stream handler, verbose vs. info level) onto `tracing`.

use std::path::Path;
use std::sync::Once;

use tracing_subscriber::{fmt, EnvFilter};

static INIT: Once = Once::new();

/// Installs the global `tracing` subscriber. Idempotent: subsequent calls
/// are a no-op, so library code and tests can call it freely without
/// double-initializing. Writes to a daily-rotating file under `log_dir`
/// when given (spec.md 6's "rotating log files only"), otherwise to
/// stdout.
pub fn init(verbose: bool, log_dir: Option<&Path>) {
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(if verbose { "debug" } else { "info" }));

        match log_dir {
            Some(dir) => {
                let appender = tracing_appender::rolling::daily(dir, "batchgate.log");
                let (writer, guard) = tracing_appender::non_blocking(appender);
                // Leaking the guard is intentional: it must live for the
                // process lifetime to keep the background flush thread alive,
                // and this is the one process-wide singleton this crate allows
                // (SPEC_FULL.md 1.1).
                Box::leak(Box::new(guard));
                fmt().with_env_filter(filter).with_writer(writer).with_ansi(false).init();
            },
            None => {
                fmt().with_env_filter(filter).init();
            },
        }
    });
}
