//! Canonical danmaku message model and normalization.
//!
//! Raw upstream notification payloads are converted here into the canonical
//! [`Danmaku`] shape that downstream subscribers receive.

pub mod message;
pub mod normalizer;

pub use message::{Danmaku, Sender};
pub use normalizer::normalize;
