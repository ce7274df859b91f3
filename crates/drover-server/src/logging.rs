//! Log subscriber setup.
//!
//! The line format is picked once at boot: plain lines in single mode, lines
//! prefixed with `[pid]` when several worker processes share one stderr.

use std::fmt;

use tracing::{Event, Subscriber};
use tracing_subscriber::fmt::format::{DefaultFields, Format, Full, Writer};
use tracing_subscriber::fmt::time::SystemTime;
use tracing_subscriber::fmt::{
    FmtContext, FormatEvent, FormatFields, MakeWriter, Subscriber as FmtSubscriber,
};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Registry};

use drover_types::LogFormat;

/// Wraps the standard formatter and prefixes every line with the process id.
pub struct PrefixedFormat {
    pid: u32,
    inner: Format<Full, SystemTime>,
}

impl PrefixedFormat {
    pub fn new(pid: u32) -> Self {
        Self {
            pid,
            inner: Format::default().with_target(false),
        }
    }
}

impl<S, N> FormatEvent<S, N> for PrefixedFormat
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        write!(writer, "[{}] ", self.pid)?;
        self.inner.format_event(ctx, writer, event)
    }
}

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Install the global subscriber for a resolved format. `Auto` must already
/// be resolved; it falls back to the default format.
///
/// Safe to call more than once; later calls are no-ops.
pub fn init(format: LogFormat) {
    match format {
        LogFormat::Pid => init_with_format(PrefixedFormat::new(std::process::id())),
        LogFormat::Default | LogFormat::Auto => {
            let _ = tracing_subscriber::fmt()
                .with_env_filter(env_filter())
                .with_target(false)
                .with_writer(std::io::stderr)
                .try_init();
        }
    }
}

/// Install the global subscriber with a caller-supplied line formatter.
pub fn init_with_format<F>(format: F)
where
    F: FormatEvent<Registry, DefaultFields> + Send + Sync + 'static,
{
    let _ = formatted_subscriber(format, std::io::stderr).try_init();
}

/// Subscriber with the env filter, `format`, and `writer`.
pub fn formatted_subscriber<F, W>(
    format: F,
    writer: W,
) -> FmtSubscriber<DefaultFields, F, EnvFilter, W>
where
    F: FormatEvent<Registry, DefaultFields> + Send + Sync + 'static,
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    tracing_subscriber::fmt()
        .with_env_filter(env_filter())
        .with_writer(writer)
        .event_format(format)
        .finish()
}
