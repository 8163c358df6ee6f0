//! Hand-rolled logging, in the same spirit as the teacher's own
//! `debug!`/`_debug!` macros over a `Write`-implementing console: no
//! `log`/`defmt` dependency, a small sink trait hosts wire up themselves.

use core::fmt;

/// A destination for log lines. Implement this over a UART, RTT channel,
/// or test-capture buffer. This repo runs single-threaded (spec.md §5),
/// so the trait only needs `Send` to live behind a `spin::Mutex`.
pub trait DebugSink: Send {
    fn write_str(&mut self, s: &str);
}

static SINK: spin::Mutex<Option<&'static mut dyn DebugSink>> = spin::Mutex::new(None);

/// Installs the sink used by the [`debug!`] macro for the remainder of
/// the program's life. Until this is called, log lines are discarded.
pub fn set_sink(sink: &'static mut dyn DebugSink) {
    *SINK.lock() = Some(sink);
}

struct SinkWriter<'a>(&'a mut dyn DebugSink);

impl fmt::Write for SinkWriter<'_> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.0.write_str(s);
        Ok(())
    }
}

/// Formats `args` through the global sink. Use the [`debug!`] macro
/// instead of calling this directly.
pub fn log_fmt(args: fmt::Arguments<'_>) {
    use fmt::Write;
    let mut guard = SINK.lock();
    let Some(sink) = guard.as_deref_mut() else {
        return;
    };
    let mut writer = SinkWriter(sink);
    let _ = writer.write_fmt(args);
    let _ = writer.write_str("\n");
}

/// Logs a line through the global debug sink.
#[macro_export]
macro_rules! debug {
    ($($arg:tt)*) => {
        $crate::debug::log_fmt(format_args!($($arg)*))
    };
}
