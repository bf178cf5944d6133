// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Log line formatting for the aggregator.
//!
//! Lines look like:
//! ```text
//! DD_AGGREGATOR | WARN | Total of 2 metrics failed to aggregate stale=2 invalid=0 context_overflow=0
//! ```

use crate::errors::Error;
use std::fmt;
use tracing_core::{Event, Subscriber};
use tracing_subscriber::fmt::{
    format::{self, FormatEvent, FormatFields},
    FmtContext, FormattedFields,
};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::EnvFilter;

const PREFIX: &str = "DD_AGGREGATOR";

/// Prefixes every event with `DD_AGGREGATOR` and its level, followed by the
/// active span scope.
#[derive(Debug, Clone, Copy)]
pub struct Formatter;

impl<S, N> FormatEvent<S, N> for Formatter
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: format::Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        write!(&mut writer, "{PREFIX} | {} | ", event.metadata().level())?;

        if let Some(scope) = ctx.event_scope() {
            for span in scope.from_root() {
                write!(writer, "{}", span.name())?;

                let ext = span.extensions();
                if let Some(fields) = ext.get::<FormattedFields<N>>() {
                    if !fields.is_empty() {
                        write!(writer, "{{{fields}}}")?;
                    }
                }
                write!(writer, ": ")?;
            }
        }

        ctx.field_format().format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}

/// Installs the global subscriber, logging to stderr. `directives` uses
/// `EnvFilter` syntax, e.g. `info` or `dogstatsd_demux=debug`.
pub fn init(directives: &str) -> Result<(), Error> {
    let filter = EnvFilter::try_new(directives)
        .map_err(|e| Error::InvalidConfig(format!("Invalid log level '{directives}': {e}")))?;

    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .event_format(Formatter)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| Error::InvalidConfig(format!("Logging already initialized: {e}")))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::io;
    use std::sync::{Arc, Mutex};
    use tracing::{info, info_span, warn};

    #[derive(Clone, Default)]
    struct Captured(Arc<Mutex<Vec<u8>>>);

    impl io::Write for Captured {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl Captured {
        fn text(&self) -> String {
            String::from_utf8(self.0.lock().unwrap().clone()).unwrap()
        }
    }

    fn capture(f: impl FnOnce()) -> String {
        let captured = Captured::default();
        let writer = captured.clone();
        let subscriber = tracing_subscriber::fmt::Subscriber::builder()
            .with_writer(move || writer.clone())
            .with_ansi(false)
            .event_format(Formatter)
            .finish();
        tracing::subscriber::with_default(subscriber, f);
        captured.text()
    }

    #[test]
    fn test_prefix_and_level() {
        let output = capture(|| info!("Flush completed"));
        assert_eq!(output, "DD_AGGREGATOR | INFO | Flush completed\n");
    }

    #[test]
    fn test_span_scope_and_fields() {
        let output = capture(|| {
            let span = info_span!("flush", cutoff = 120);
            let _entered = span.enter();
            warn!(stale = 2, "Samples rejected");
        });
        assert_eq!(
            output,
            "DD_AGGREGATOR | WARN | flush{cutoff=120}: Samples rejected stale=2\n"
        );
    }

    #[test]
    fn test_init_rejects_bad_directives() {
        assert!(matches!(
            init("dogstatsd_demux=nonsense[["),
            Err(Error::InvalidConfig(_))
        ));
    }
}
