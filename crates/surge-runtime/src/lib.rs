#![forbid(unsafe_code)]
#![cfg_attr(not(test), deny(clippy::expect_used, clippy::unwrap_used))]

pub mod batch;
pub mod pipeline;
#[cfg(feature = "postgres")]
pub mod postgres;
pub mod progress;
pub mod statement;
pub mod store;
