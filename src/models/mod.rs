mod api;

pub use api::{DelayResponse, EchoResponse, HealthResponse};
