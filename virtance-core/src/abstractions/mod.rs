//! Trait seams over the environment so orchestration can be driven
//! deterministically in tests

pub mod time;

pub use time::{Clock, MockClock, SystemClock};
