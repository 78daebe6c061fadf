//! Per-test log capture.
//!
//! `tracing` normally has one global subscriber per process, which makes the output of tests that
//! run in parallel impossible to untangle.  [`test_with_logging`] gives each test its own
//! subscriber and its own tokio runtime, and prints that test's log events when it finishes.
use crate::Result;
use std::{
    cell::RefCell,
    future::Future,
    io::Write,
    panic::AssertUnwindSafe,
    sync::{Arc, Mutex},
    time::Duration,
};
use tracing_subscriber::fmt::MakeWriter;

/// Used when `RUST_LOG` isn't set
const DEFAULT_FILTER: &str = "h2=warn,hyper=info,rustls=info,aws=info,debug";

/// Collects the formatted log events of one test in memory
#[derive(Clone, Default)]
struct CapturedLogs {
    buffer: Arc<Mutex<Vec<u8>>>,
}

impl CapturedLogs {
    /// Take everything logged so far, leaving the buffer empty
    fn drain(&self) -> String {
        let buffer = match self.buffer.lock() {
            Ok(mut guard) => std::mem::take(&mut *guard),
            // A panic while a log event was being written; what's there is still worth printing
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        };

        String::from_utf8_lossy(&buffer).into_owned()
    }
}

impl<'a> Write for &'a CapturedLogs {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let mut guard = self
            .buffer
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        guard.extend_from_slice(buf);

        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for CapturedLogs {
    type Writer = &'a Self;

    fn make_writer(&'a self) -> Self::Writer {
        self
    }
}

fn make_dispatch(logs: CapturedLogs) -> tracing::Dispatch {
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::{fmt, EnvFilter};

    let format = fmt::layer()
        .with_level(true)
        .with_target(true)
        // Blocking threads and runtime workers interleave, so thread IDs matter
        .with_thread_ids(true)
        .with_thread_names(false)
        .with_writer(logs);

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    tracing::Dispatch::new(tracing_subscriber::registry().with(filter).with(format))
}

/// Run an async test with logging enabled.
///
/// Use this in place of `#[tokio::test]`.  It builds a dedicated multi-threaded tokio runtime
/// whose worker and blocking threads all use a `tracing` dispatcher created for this test alone,
/// so events from spawned tasks and `spawn_blocking` closures are captured along with the test's
/// own.  The captured events are printed when the test finishes, whether it passed, failed or
/// panicked.
pub fn test_with_logging(test: impl Future<Output = Result<()>>) -> Result<()> {
    let logs = CapturedLogs::default();
    let dispatch = make_dispatch(logs.clone());

    std::thread_local! {
        static THREAD_DISPATCH: RefCell<Option<tracing::subscriber::DefaultGuard>> = RefCell::new(None);
    }

    tracing::dispatcher::with_default(&dispatch, || {
        let mut builder = tokio::runtime::Builder::new_multi_thread();
        builder.enable_all();

        {
            let dispatch = dispatch.clone();
            builder.on_thread_start(move || {
                let guard = tracing::dispatcher::set_default(&dispatch);
                THREAD_DISPATCH.with(|cell| cell.replace(Some(guard)));
            });
        }
        builder.on_thread_stop(|| {
            THREAD_DISPATCH.with(|cell| cell.replace(None));
        });

        let runtime = builder.build()?;

        // Test futures aren't generally unwind safe, but the only thing that happens after a
        // panic is printing the logs and re-raising it
        let outcome = std::panic::catch_unwind(AssertUnwindSafe(move || {
            let result = runtime.block_on(test);
            runtime.shutdown_timeout(Duration::from_secs(10));

            result
        }));

        println!("Log events from this test: \n{}", logs.drain());

        match outcome {
            Ok(result) => result,
            Err(panic) => std::panic::resume_unwind(panic),
        }
    })
}
