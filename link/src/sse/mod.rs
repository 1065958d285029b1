//! Server-sent events.
//!
//! - [`decoder`]: incremental `text/event-stream` parser
//! - [`event_source`]: reconnecting HTTP event source and the factory seam
//! - [`consumer`]: resumable, classified event stream

pub mod consumer;
pub mod decoder;
pub mod event_source;

pub use consumer::{ConsumerEvent, SseOptions, SseStreamConsumer};
pub use decoder::{SseDecoder, SseEvent};
pub use event_source::{
    EventSourceFactory, EventSourceLike, HttpEventSource, HttpEventSourceFactory, SourceEvent,
};
