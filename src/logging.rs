use axum::{
    body::Body,
    http::{Request, Response},
    middleware::Next,
};
use std::panic;
use tracing::{error, info_span, Instrument};
use uuid::Uuid;

pub const REQUEST_ID_HEADER: &str = "x-periscope-request-id";

/// Global panic hook that routes panics through tracing before the default
/// hook runs, so they land in the log files with request context.
pub fn setup_panic_hook() {
    let original_hook = panic::take_hook();
    panic::set_hook(Box::new(move |panic_info| {
        let payload = panic_info.payload();
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            *s
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.as_str()
        } else {
            "Unknown panic payload"
        };

        let location = panic_info
            .location()
            .map(|l| format!("{}:{}:{}", l.file(), l.line(), l.column()))
            .unwrap_or_else(|| "unknown location".to_string());

        error!(
            target: "panic",
            message = %message,
            location = %location,
            "FATAL: Application panicked"
        );

        original_hook(panic_info);
    }));
}

/// Tags every inbound request with a short id and wraps its handling in a
/// tracing span, so interleaved streams stay distinguishable in the logs.
pub async fn request_span_middleware(mut req: Request<Body>, next: Next) -> Response<Body> {
    let request_id: String = Uuid::new_v4().to_string().chars().take(8).collect();
    if let Ok(val) = request_id.parse() {
        req.headers_mut().insert(REQUEST_ID_HEADER, val);
    }

    let span = info_span!("request", id = %request_id);
    next.run(req).instrument(span).await
}
