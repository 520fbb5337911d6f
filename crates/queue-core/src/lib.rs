#[macro_use]
extern crate tracing;

pub mod backoff;
pub mod clock;
pub mod codec;
pub mod controllers;
pub mod error;
pub mod ids;
pub mod model;
pub mod traits;
pub mod validation;

pub use error::{BrokerError, BrokerResult};
