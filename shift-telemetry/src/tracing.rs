use shift_config::Environment;
use std::io::Error;
use std::io::Write;
use std::sync::OnceLock;
use std::{
    backtrace::{Backtrace, BacktraceStatus},
    panic::PanicHookInfo,
    sync::Once,
};
use thiserror::Error;
use tracing::subscriber::{SetGlobalDefaultError, set_global_default};
use tracing_appender::{
    non_blocking::WorkerGuard,
    rolling::{self, InitError},
};
use tracing_log::{LogTracer, log_tracer::SetLoggerError};
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::{EnvFilter, FmtSubscriber, Registry, fmt, layer::SubscriberExt};

/// JSON field naming the cell the process runs in.
const CELL_KEY_IN_LOG: &str = "cell";
/// JSON field naming the tablet (shard primary) the process serves.
const TABLET_KEY_IN_LOG: &str = "tablet";

/// Errors that can occur during tracing initialization.
#[derive(Debug, Error)]
pub enum TracingError {
    #[error("failed to build rolling file appender: {0}")]
    InitAppender(#[from] InitError),

    #[error("failed to init log tracer: {0}")]
    InitLogTracer(#[from] SetLoggerError),

    #[error("failed to set global default subscriber: {0}")]
    SetGlobalDefault(#[from] SetGlobalDefaultError),

    #[error("an io error occurred: {0}")]
    Io(#[from] Error),
}

/// Keeps buffered log lines alive until dropped.
///
/// Prod mode writes through a non-blocking appender whose [`WorkerGuard`] must outlive the
/// process' last log line.
#[must_use]
pub enum LogFlusher {
    Flusher(WorkerGuard),
    NullFlusher,
}

/// Identity of the process attached to every JSON log line.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogContext {
    pub cell: Option<String>,
    pub tablet: Option<String>,
}

impl LogContext {
    fn is_empty(&self) -> bool {
        self.cell.is_none() && self.tablet.is_none()
    }

    fn fields(&self) -> impl Iterator<Item = (&'static str, &str)> {
        [
            (CELL_KEY_IN_LOG, self.cell.as_deref()),
            (TABLET_KEY_IN_LOG, self.tablet.as_deref()),
        ]
        .into_iter()
        .filter_map(|(key, value)| value.map(|value| (key, value)))
    }
}

static LOG_CONTEXT: OnceLock<LogContext> = OnceLock::new();

/// Sets the process-wide log context. Only the first call has an effect.
pub fn set_global_log_context(context: LogContext) {
    let _ = LOG_CONTEXT.set(context);
}

pub fn get_global_log_context() -> Option<&'static LogContext> {
    LOG_CONTEXT.get()
}

/// Adds the context fields to a JSON log line, leaving fields already present untouched.
///
/// Returns `None` when the line is not a JSON object or nothing had to be added.
fn inject_context(line: &str, context: &LogContext) -> Option<String> {
    let serde_json::Value::Object(mut map) = serde_json::from_str(line).ok()? else {
        return None;
    };

    let mut injected = false;
    for (key, value) in context.fields() {
        if !map.contains_key(key) {
            map.insert(key.to_owned(), serde_json::Value::String(value.to_owned()));
            injected = true;
        }
    }

    if !injected {
        return None;
    }

    let modified = serde_json::to_string(&map).ok()?;
    if line.ends_with('\n') {
        Some(format!("{modified}\n"))
    } else {
        Some(modified)
    }
}

struct ContextInjectingWriter<W> {
    inner: W,
}

impl<W> ContextInjectingWriter<W> {
    fn new(inner: W) -> Self {
        Self { inner }
    }
}

impl<W> Write for ContextInjectingWriter<W>
where
    W: Write,
{
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        if let Some(context) = get_global_log_context()
            && !context.is_empty()
            && let Ok(line) = std::str::from_utf8(buf)
            && let Some(modified) = inject_context(line, context)
        {
            // The caller handed us `buf`, so report it as fully written.
            self.inner.write_all(modified.as_bytes())?;
            return Ok(buf.len());
        }

        self.inner.write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

static INIT_TEST_TRACING: Once = Once::new();

/// Initializes tracing for tests.
///
/// Does nothing unless `ENABLE_TRACING` is set:
/// ```bash
/// ENABLE_TRACING=1 cargo test test_name
/// ```
pub fn init_test_tracing() {
    INIT_TEST_TRACING.call_once(|| {
        if std::env::var("ENABLE_TRACING").is_ok() {
            // Without an explicit environment prod is assumed, which logs to files.
            Environment::Dev.set();
            let _log_flusher =
                init_tracing("test").expect("failed to initialize tracing for tests");
        }
    });
}

/// Initializes tracing for the application.
pub fn init_tracing(app_name: &str) -> Result<LogFlusher, TracingError> {
    init_tracing_with_context(app_name, LogContext::default())
}

/// Initializes tracing, attaching `context` to every JSON log line.
///
/// Prod and staging write JSON to daily rotated files under `logs/`. Dev writes pretty output
/// to the terminal. The default level is `info` unless `RUST_LOG` says otherwise.
pub fn init_tracing_with_context(
    app_name: &str,
    context: LogContext,
) -> Result<LogFlusher, TracingError> {
    if !context.is_empty() {
        set_global_log_context(context);
    }

    // Forward records of crates logging through `log`.
    LogTracer::init()?;

    let is_prod = Environment::load()?.is_prod();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into());

    let log_flusher = if is_prod {
        configure_prod_tracing(filter, app_name)?
    } else {
        configure_dev_tracing(filter)?
    };

    set_tracing_panic_hook();

    Ok(log_flusher)
}

fn configure_prod_tracing(filter: EnvFilter, app_name: &str) -> Result<LogFlusher, TracingError> {
    let file_appender = rolling::Builder::new()
        .filename_prefix(app_name)
        .filename_suffix("log")
        .rotation(rolling::Rotation::DAILY)
        .max_log_files(5)
        .build("logs")?;

    let (file_appender, guard) = tracing_appender::non_blocking(file_appender);

    let format = fmt::format()
        .with_level(true)
        .with_ansi(false)
        .with_target(false);

    let subscriber = Registry::default().with(filter).with(
        fmt::layer()
            .event_format(format)
            .with_writer(move || ContextInjectingWriter::new(file_appender.make_writer()))
            .json()
            .with_current_span(true)
            .with_span_list(true),
    );

    set_global_default(subscriber)?;

    Ok(LogFlusher::Flusher(guard))
}

fn configure_dev_tracing(filter: EnvFilter) -> Result<LogFlusher, TracingError> {
    let format = fmt::format()
        .with_level(true)
        .with_ansi(true)
        .pretty()
        .with_line_number(false)
        .with_file(false)
        .with_target(true);

    let subscriber = FmtSubscriber::builder()
        .event_format(format)
        .with_env_filter(filter)
        .finish();

    set_global_default(subscriber)?;

    Ok(LogFlusher::NullFlusher)
}

/// Routes panics through `tracing` before running the previous hook.
fn set_tracing_panic_hook() {
    let prev_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        panic_hook(info);
        prev_hook(info);
    }));
}

fn panic_hook(panic_info: &PanicHookInfo) {
    let backtrace = Backtrace::capture();
    let (backtrace, note) = match backtrace.status() {
        BacktraceStatus::Captured => (Some(backtrace), None),
        BacktraceStatus::Disabled => (
            None,
            Some("run with RUST_BACKTRACE=1 to display backtraces"),
        ),
        BacktraceStatus::Unsupported => {
            (None, Some("backtraces are not supported on this platform"))
        }
        _ => (None, Some("backtrace status is unknown")),
    };

    let payload = if let Some(s) = panic_info.payload().downcast_ref::<&str>() {
        s
    } else if let Some(s) = panic_info.payload().downcast_ref::<String>() {
        s
    } else {
        "unknown panic payload"
    };

    let location = panic_info.location().map(|location| location.to_string());

    tracing::error!(
        panic.payload = payload,
        panic.location = location,
        panic.backtrace = backtrace.map(tracing::field::display),
        panic.note = note,
        "a panic occurred",
    );
}
