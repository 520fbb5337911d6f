//! Library surface for the `broker` binary, split out so integration tests
//! can drive the axum router in-process without going through `main`.

#[macro_use]
extern crate tracing;

pub mod api;
pub mod codec;
pub mod config;
pub mod error;
pub mod extract;
pub mod log;
pub mod response;
pub mod state;
