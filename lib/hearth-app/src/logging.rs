//! Logging.

use std::{fmt, sync::Mutex};

use chrono::Utc;
use tracing::{field, level_filters::LevelFilter, Event, Subscriber};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    field::VisitOutput,
    fmt::{format::Writer, FmtContext, FormatEvent, FormatFields, FormattedFields},
    layer::SubscriberExt as _,
    registry::LookupSpan,
    util::SubscriberInitExt as _,
    EnvFilter, Layer as _,
};

const LOG_LEVEL_ENV: &str = "HEARTH_LOG_LEVEL";
const LOG_FORMAT_JSON_ENV: &str = "HEARTH_LOG_FORMAT_JSON";

static LOG_WRITER_GUARD: Mutex<Option<WorkerGuard>> = Mutex::new(None);

/// Logs a message to standard error and exits the process with a non-zero exit code.
pub fn fatal_and_exit(message: String) -> ! {
    eprintln!("FATAL: {}", message);
    std::process::exit(1);
}

/// Initializes the logging subsystem for `tracing`.
///
/// This function reads the `HEARTH_LOG_LEVEL` environment variable to determine the log filtering directives to use.
/// If the environment variable is not set, the default log level is `INFO`, or `default_level` if given. Additionally,
/// it reads the `HEARTH_LOG_FORMAT_JSON` environment variable to determine which output format to use. If it is set to
/// `true` or `1`, the logs will be formatted as JSON. Otherwise, logs are written in a compact, human-readable format.
///
/// Logs are written to standard error through a background writer. [`flush_logging`] must be called before the process
/// exits or replaces itself with another program, so that pending logs are written out.
///
/// # Errors
///
/// If the logging subsystem was already initialized, an error will be returned.
pub fn initialize_logging(
    default_level: Option<LevelFilter>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let is_json = std::env::var(LOG_FORMAT_JSON_ENV)
        .map(|s| s.trim().to_lowercase())
        .map(|s| s == "true" || s == "1")
        .unwrap_or(false);

    let level_filter = EnvFilter::builder()
        .with_default_directive(default_level.unwrap_or(LevelFilter::INFO).into())
        .with_env_var(LOG_LEVEL_ENV)
        .from_env_lossy();

    let (writer, guard) = tracing_appender::non_blocking(std::io::stderr());

    if is_json {
        let json_layer = tracing_subscriber::fmt::Layer::new()
            .json()
            .flatten_event(true)
            .with_current_span(true)
            .with_target(true)
            .with_writer(writer);

        tracing_subscriber::registry()
            .with(json_layer.with_filter(level_filter))
            .try_init()?;
    } else {
        let pretty_layer = tracing_subscriber::fmt::Layer::new()
            .event_format(PipeFormatter)
            .with_writer(writer);

        tracing_subscriber::registry()
            .with(pretty_layer.with_filter(level_filter))
            .try_init()?;
    }

    let mut slot = LOG_WRITER_GUARD.lock().unwrap_or_else(|e| e.into_inner());
    *slot = Some(guard);
    Ok(())
}

/// Writes out all pending logs and stops the background writer.
///
/// Logs emitted afterwards are discarded. Does nothing if logging was not initialized, or was already flushed.
pub fn flush_logging() {
    let guard = LOG_WRITER_GUARD.lock().unwrap_or_else(|e| e.into_inner()).take();
    drop(guard);
}

/// Formats events as pipe-separated sections.
///
/// ```text
/// 2026-01-31 23:59:59 UTC | INFO | worker{worker_name=web pid=42} | exit_code:100 | Worker stopped.
/// ```
struct PipeFormatter;

impl<S, N> FormatEvent<S, N> for PipeFormatter
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(&self, ctx: &FmtContext<'_, S, N>, mut writer: Writer<'_>, event: &Event<'_>) -> fmt::Result {
        write!(
            writer,
            "{} | {} |",
            Utc::now().format("%Y-%m-%d %H:%M:%S UTC"),
            event.metadata().level()
        )?;

        if let Some(scope) = ctx.event_scope() {
            let mut wrote_span = false;
            for span in scope.from_root() {
                write!(writer, " {}", span.name())?;

                let extensions = span.extensions();
                if let Some(fields) = extensions.get::<FormattedFields<N>>() {
                    if !fields.is_empty() {
                        write!(writer, "{{{}}}", fields)?;
                    }
                }
                wrote_span = true;
            }

            if wrote_span {
                write!(writer, " |")?;
            }
        }

        let mut visitor = PipeFieldVisitor::new(writer.by_ref());
        event.record(&mut visitor);
        visitor.finish()?;

        writeln!(writer)
    }
}

/// Field visitor that writes structured fields as `key:value` pairs, separated by commas, followed by the message.
///
/// Errors hit while writing are captured and returned when the visitor is finished. All operations after an error are
/// no-ops.
struct PipeFieldVisitor<'writer> {
    writer: Writer<'writer>,
    fields_written: usize,
    message: String,
    last_result: fmt::Result,
}

impl<'writer> PipeFieldVisitor<'writer> {
    fn new(writer: Writer<'writer>) -> Self {
        Self {
            writer,
            fields_written: 0,
            message: String::new(),
            last_result: Ok(()),
        }
    }

    fn try_write(&mut self, field: &field::Field, f: impl FnOnce(&mut dyn fmt::Write) -> fmt::Result) {
        if self.last_result.is_err() {
            return;
        }

        if field.name() == "message" {
            // The message always comes last.
            self.last_result = f(&mut self.message);
            return;
        }

        let separator = if self.fields_written == 0 { " " } else { "," };
        self.last_result = write!(self.writer, "{}{}:", separator, field.name());
        if self.last_result.is_err() {
            return;
        }

        self.last_result = f(&mut self.writer);
        if self.last_result.is_ok() {
            self.fields_written += 1;
        }
    }
}

impl field::Visit for PipeFieldVisitor<'_> {
    fn record_debug(&mut self, field: &field::Field, value: &dyn fmt::Debug) {
        self.try_write(field, |w| write!(w, "{:?}", value));
    }

    fn record_str(&mut self, field: &field::Field, value: &str) {
        self.try_write(field, |w| {
            if field.name() == "message" {
                w.write_str(value)
            } else {
                write!(w, "\"{}\"", value)
            }
        });
    }

    fn record_i64(&mut self, field: &field::Field, value: i64) {
        self.try_write(field, |w| write!(w, "{}", value));
    }

    fn record_u64(&mut self, field: &field::Field, value: u64) {
        self.try_write(field, |w| write!(w, "{}", value));
    }

    fn record_bool(&mut self, field: &field::Field, value: bool) {
        self.try_write(field, |w| write!(w, "{}", value));
    }
}

impl VisitOutput<fmt::Result> for PipeFieldVisitor<'_> {
    fn finish(mut self) -> fmt::Result {
        self.last_result?;

        if self.fields_written > 0 {
            write!(self.writer, " |")?;
        }

        if self.message.is_empty() {
            Ok(())
        } else {
            write!(self.writer, " {}", self.message)
        }
    }
}
