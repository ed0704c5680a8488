mod demo;
mod health;

pub use demo::{MAX_DELAY_MS, delay, echo};
pub use health::health_check;
