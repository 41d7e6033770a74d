//! Tracing subscriber setup.

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::format;
use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::util::SubscriberInitExt as _;

use std::fmt::Write as _;
use std::path::Path;

/// Longest `message` field written before it is cut.
const MAX_MESSAGE_CHARS: usize = 280;

fn truncate_for_log(message: &str, max_chars: usize) -> (&str, bool) {
    match message.char_indices().nth(max_chars) {
        Some((byte_index, _character)) => (&message[..byte_index], true),
        None => (message, false),
    }
}

/// Initialize tracing: compact terminal output, plus daily rolling files
/// when `log_dir` is set. `RUST_LOG` overrides the level when present.
///
/// Hold the returned guard for the process lifetime so buffered file
/// output is flushed on exit.
pub fn init_tracing(debug: bool, log_dir: Option<&Path>) -> Option<WorkerGuard> {
    let field_formatter = || {
        format::debug_fn(|writer, field, value| {
            let field_name = field.name();
            if field_name == "message" {
                let formatted = format!("{value:?}");
                let (truncated, was_truncated) = truncate_for_log(&formatted, MAX_MESSAGE_CHARS);
                if was_truncated {
                    write!(writer, "{}={}...", field_name, truncated)
                } else {
                    write!(writer, "{}={formatted}", field_name)
                }
            } else {
                write!(writer, "{}={value:?}", field_name)
            }
        })
    };

    let terminal_layer = tracing_subscriber::fmt::layer()
        .fmt_fields(field_formatter())
        .compact();

    let (file_layer, guard) = match log_dir {
        Some(dir) => {
            let file_appender = tracing_appender::rolling::daily(dir, "pals.log");
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .fmt_fields(field_formatter())
                .compact();
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(build_env_filter(debug))
        .with(terminal_layer)
        .with(file_layer)
        .init();

    guard
}

fn build_env_filter(debug: bool) -> tracing_subscriber::EnvFilter {
    if let Ok(filter) = tracing_subscriber::EnvFilter::try_from_default_env() {
        return filter;
    }
    if debug {
        tracing_subscriber::EnvFilter::new("debug")
    } else {
        tracing_subscriber::EnvFilter::new("info")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncate_for_log_handles_multibyte_characters() {
        let message = "abc→def";
        let (truncated, was_truncated) = truncate_for_log(message, 4);

        assert!(was_truncated);
        assert_eq!(truncated, "abc→");
    }

    #[test]
    fn truncate_for_log_returns_original_when_within_limit() {
        let message = "hello";
        let (truncated, was_truncated) = truncate_for_log(message, 10);

        assert!(!was_truncated);
        assert_eq!(truncated, "hello");
    }
}
