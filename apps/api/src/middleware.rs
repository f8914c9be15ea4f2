use axum::extract::Request;
use axum::http::HeaderValue;
use axum::middleware::Next;
use axum::response::Response;
use tracing::warn;
use zonegrid_core::{RequestContext, RequestId};

/// Header carrying the request correlation id.
pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Header carrying the caller context JSON.
pub const CONTEXT_HEADER: &str = "x-context";

/// Assigns or adopts the `x-request-id`, parses the `x-context` caller
/// payload and injects both as extensions. The request id is echoed on the
/// response so callers can correlate jobs with their requests.
pub async fn request_identity(mut request: Request, next: Next) -> Response {
    let request_id = RequestId::from_header(
        request
            .headers()
            .get(REQUEST_ID_HEADER)
            .and_then(|value| value.to_str().ok()),
    );

    let context = match request
        .headers()
        .get(CONTEXT_HEADER)
        .and_then(|value| value.to_str().ok())
    {
        None => RequestContext::anonymous(),
        Some(raw) => RequestContext::from_header(raw).unwrap_or_else(|error| {
            warn!(%request_id, %error, "ignoring malformed x-context header");
            RequestContext::anonymous()
        }),
    };

    request.extensions_mut().insert(request_id);
    request.extensions_mut().insert(context);

    let mut response = next.run(request).await;

    if let Ok(value) = HeaderValue::from_str(request_id.to_string().as_str()) {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }

    response
}
