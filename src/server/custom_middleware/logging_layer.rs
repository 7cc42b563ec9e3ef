use axum::body::Body;
use axum::extract::Request;
use axum::http::{Method, StatusCode};
use axum::middleware::Next;
use axum::response::Response;
use tracing::{error, info, info_span, warn, Instrument};

// 1 MiB
const MAX_REQUEST_BODY_SIZE: usize = 1024 * 1024;

pub async fn middleware(request: Request, next: Next) -> Result<Response, StatusCode> {
    let (parts, body) = request.into_parts();

    let uri_path = parts.uri.path().to_string();
    let request_method = parts.method.clone();
    let request_query = parts.uri.query().map(ToString::to_string);

    if request_method == Method::GET {
        let span = info_span!("request", ?uri_path, ?request_method, ?request_query);

        async {
            info!(
                uri_path,
                ?request_method,
                ?request_query,
                "Processing request"
            );

            let request = Request::from_parts(parts, Body::empty());
            let response = next.run(request).await;

            Ok(log_response(
                &uri_path,
                &request_method,
                request_query.as_deref(),
                response,
            ))
        }
        .instrument(span)
        .await
    } else {
        let bytes = axum::body::to_bytes(body, MAX_REQUEST_BODY_SIZE)
            .await
            .map_err(|_| StatusCode::PAYLOAD_TOO_LARGE)?;
        let body_len = bytes.len();

        let span = info_span!("request", ?uri_path, ?request_method, ?request_query, body_len);

        async {
            info!(
                ?uri_path,
                ?request_method,
                ?request_query,
                body_len,
                "Processing request"
            );

            let request = Request::from_parts(parts, Body::from(bytes));
            let response = next.run(request).await;

            Ok(log_response(
                &uri_path,
                &request_method,
                request_query.as_deref(),
                response,
            ))
        }
        .instrument(span)
        .await
    }
}

fn log_response(
    uri_path: &str,
    request_method: &Method,
    request_query: Option<&str>,
    response: Response,
) -> Response {
    let response_status = response.status();

    if response_status.is_server_error() {
        error!(
            uri_path,
            ?request_method,
            ?request_query,
            ?response_status,
            "Error processing request"
        );
    } else if response_status.is_client_error() {
        warn!(
            uri_path,
            ?request_method,
            ?request_query,
            ?response_status,
            "Error processing request"
        );
    }

    info!(
        uri_path,
        ?request_method,
        ?request_query,
        ?response_status,
        "Finished processing request"
    );

    response
}
