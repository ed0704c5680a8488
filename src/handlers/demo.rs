//! Demo endpoints for exercising the middleware stack.
//!
//! - `POST /echo` - returns the body, query and request ID it received
//! - `GET /delay/{ms}` - waits, stopping early when the request deadline fires

use std::time::{Duration, Instant};

use axum::Json;
use axum::body::Bytes;
use axum::extract::{Extension, Path, RawQuery};
use axum::http::HeaderMap;
use tracing::{debug, instrument};

use crate::error::{AppError, AppResult};
use crate::middleware::RequestDeadline;
use crate::middleware::request_id::REQUEST_ID_HEADER;
use crate::models::{DelayResponse, EchoResponse};

/// Longest delay `/delay/{ms}` accepts.
pub const MAX_DELAY_MS: u64 = 60_000;

#[instrument(skip_all)]
pub async fn echo(headers: HeaderMap, RawQuery(query): RawQuery, body: Bytes) -> Json<EchoResponse> {
    let request_id = headers
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    Json(EchoResponse {
        request_id,
        query,
        body: String::from_utf8_lossy(&body).into_owned(),
    })
}

/// Sleep for `ms` milliseconds.
///
/// Under a deadline guard the wait ends as soon as the guard gives up on the
/// request, so timed-out requests don't keep the worker busy.
#[instrument(skip(deadline))]
pub async fn delay(
    Path(ms): Path<u64>,
    deadline: Option<Extension<RequestDeadline>>,
) -> AppResult<Json<DelayResponse>> {
    if ms > MAX_DELAY_MS {
        return Err(AppError::BadRequest(format!(
            "delay must be at most {MAX_DELAY_MS} ms, got {ms}"
        )));
    }

    let start = Instant::now();
    let sleep = tokio::time::sleep(Duration::from_millis(ms));

    let completed = match deadline {
        Some(Extension(deadline)) => tokio::select! {
            () = sleep => true,
            () = deadline.cancelled() => false,
        },
        None => {
            sleep.await;
            true
        }
    };

    let waited_ms = u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX);
    if !completed {
        debug!(requested_ms = ms, waited_ms, "Delay cut short by request deadline");
    }

    Ok(Json(DelayResponse {
        requested_ms: ms,
        waited_ms,
        completed,
    }))
}
