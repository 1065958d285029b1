//! Link logging every operation and its results.

use super::chain::{Link, LinkObservable, Next};
use crate::{
    error::EdenLinkError,
    models::{LinkResult, Operation},
    observable::{operators::forward_to, Observable, Tap},
};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Whether a log line describes the request or its outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogDirection {
    /// `>>` operation leaving
    Up,
    /// `<<` result, error or completion arriving
    Down,
}

/// One log line before formatting.
#[derive(Debug, Clone)]
pub struct LogEntry {
    /// Direction
    pub direction: LogDirection,
    /// Operation the line is about
    pub op: Operation,
    /// Result for `Down` lines
    pub result: Option<Result<LinkResult, EdenLinkError>>,
    /// Time since the operation left, for `Down` lines
    pub elapsed: Option<Duration>,
}

impl fmt::Display for LogEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let arrow = match self.direction {
            LogDirection::Up => ">>",
            LogDirection::Down => "<<",
        };
        write!(f, "{} {} #{} {}", arrow, self.op.kind, self.op.id, self.op.path)?;
        if let Some(elapsed) = self.elapsed {
            write!(f, " {}ms", elapsed.as_millis())?;
        }
        match &self.result {
            Some(Err(e)) => write!(f, " error: {}", e),
            Some(Ok(LinkResult::Error { status, .. })) => write!(f, " status {}", status),
            _ => Ok(()),
        }
    }
}

type EnabledFn = dyn Fn(LogDirection, &Operation) -> bool + Send + Sync;
type SinkFn = dyn Fn(&LogEntry) + Send + Sync;

/// Logs `>> query #1 /path` when an operation starts and
/// `<< query #1 /path 12ms` for each result, through the `log` facade
/// unless a sink is set.
#[derive(Clone)]
pub struct LoggerLink {
    enabled: Arc<EnabledFn>,
    level: log::Level,
    sink: Option<Arc<SinkFn>>,
}

impl fmt::Debug for LoggerLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoggerLink")
            .field("level", &self.level)
            .field("sink", &self.sink.is_some())
            .finish_non_exhaustive()
    }
}

impl Default for LoggerLink {
    fn default() -> Self {
        Self::new()
    }
}

impl LoggerLink {
    /// Log everything at `debug`.
    pub fn new() -> Self {
        Self {
            enabled: Arc::new(|_, _| true),
            level: log::Level::Debug,
            sink: None,
        }
    }

    /// Only log lines `f` accepts.
    pub fn enabled(mut self, f: impl Fn(LogDirection, &Operation) -> bool + Send + Sync + 'static) -> Self {
        self.enabled = Arc::new(f);
        self
    }

    /// Level of successful lines. Errors are always logged at `warn`.
    pub fn level(mut self, level: log::Level) -> Self {
        self.level = level;
        self
    }

    /// Hand entries to `f` instead of `log`.
    pub fn sink(mut self, f: impl Fn(&LogEntry) + Send + Sync + 'static) -> Self {
        self.sink = Some(Arc::new(f));
        self
    }

    fn emit(&self, entry: LogEntry) {
        if !(self.enabled)(entry.direction, &entry.op) {
            return;
        }
        match &self.sink {
            Some(sink) => sink(&entry),
            None => {
                let level = match entry.result {
                    Some(Err(_)) | Some(Ok(LinkResult::Error { .. })) => log::Level::Warn,
                    _ => self.level,
                };
                log::log!(level, "[eden-link] {}", entry);
            },
        }
    }
}

impl Link for LoggerLink {
    fn run(&self, op: Operation, next: Next) -> LinkObservable {
        let logger = self.clone();
        Observable::new(move |subscriber| {
            let started = Instant::now();
            logger.emit(LogEntry {
                direction: LogDirection::Up,
                op: op.clone(),
                result: None,
                elapsed: None,
            });
            let (on_next, on_error) = (logger.clone(), logger.clone());
            let (next_op, error_op) = (op.clone(), op.clone());
            next.run(op.clone())
                .tap(
                    Tap::new()
                        .next(move |result: &LinkResult| {
                            on_next.emit(LogEntry {
                                direction: LogDirection::Down,
                                op: next_op.clone(),
                                result: Some(Ok(result.clone())),
                                elapsed: Some(started.elapsed()),
                            })
                        })
                        .error(move |e: &EdenLinkError| {
                            on_error.emit(LogEntry {
                                direction: LogDirection::Down,
                                op: error_op.clone(),
                                result: Some(Err(e.clone())),
                                elapsed: Some(started.elapsed()),
                            })
                        }),
                )
                .subscribe(forward_to(&subscriber))
                .into()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::links::chain::{create_chain, link};
    use crate::models::{OperationType, RequestParams};
    use crate::observable::first_value;
    use parking_lot::Mutex;
    use serde_json::json;

    #[tokio::test]
    async fn test_logs_request_and_response() {
        let lines = Arc::new(Mutex::new(Vec::new()));
        let sink = lines.clone();
        let logger = LoggerLink::new().sink(move |entry| sink.lock().push(entry.to_string()));
        let terminal = |_op: Operation, _next: Next| -> LinkObservable {
            LinkObservable::of(vec![LinkResult::data(json!(1))])
        };
        let op = Operation::new(1, OperationType::Query, "/users", RequestParams::get());
        first_value(create_chain(vec![link(logger), link(terminal)].into(), op), None)
            .await
            .unwrap();

        let lines = lines.lock();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0], ">> query #1 /users");
        assert!(lines[1].starts_with("<< query #1 /users "));
        assert!(lines[1].ends_with("ms"));
    }

    #[tokio::test]
    async fn test_enabled_filters_directions() {
        let lines = Arc::new(Mutex::new(Vec::new()));
        let sink = lines.clone();
        let logger = LoggerLink::new()
            .enabled(|direction, _| direction == LogDirection::Down)
            .sink(move |entry| sink.lock().push(entry.to_string()));
        let terminal = |_op: Operation, _next: Next| -> LinkObservable {
            Observable::error(EdenLinkError::TimeoutError("slow".into()))
        };
        let op = Operation::new(7, OperationType::Mutation, "/save", RequestParams::post());
        let result = first_value(create_chain(vec![link(logger), link(terminal)].into(), op), None).await;
        assert!(result.is_err());

        let lines = lines.lock();
        assert_eq!(lines.len(), 1);
        assert!(lines[0].starts_with("<< mutation #7 /save"));
        assert!(lines[0].contains("error:"));
    }
}
