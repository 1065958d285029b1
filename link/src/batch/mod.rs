//! HTTP request batching.
//!
//! - [`dataloader`]: generic collect-then-dispatch window
//! - [`wire`]: GET/POST batch encoding and response demultiplexing

pub mod dataloader;
pub mod wire;

pub use dataloader::{all_abort_signals, BatchLoader, BatchResolver, DataLoader, DEFAULT_BATCH_WINDOW};
pub use wire::{
    decode_get_batch, decode_post_batch, encode_batch_headers, encode_get_batch,
    encode_post_batch, read_batch_response, BatchRequest, StreamedResult, RESERVED_HEADERS,
};
