//! Bearer-token authentication middleware.
//!
//! Tokens arrive in the `Authorization: Bearer ...` header, or — for SSE,
//! where the browser streaming API cannot attach headers — in a `?token=`
//! query parameter. The validated user id is inserted into request
//! extensions for handlers to pick up.

use axum::extract::{Request, State};
use axum::http::header;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};

use crate::error::ApiError;
use crate::state::SharedState;

/// The authenticated caller, available to handlers via `Extension`.
#[derive(Debug, Clone)]
pub struct CurrentUser {
    pub user_id: String,
}

/// Extract a bearer token from the Authorization header.
fn extract_bearer_token(req: &Request) -> Option<&str> {
    req.headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
}

/// Extract a token from the query string (SSE clients).
fn extract_query_token(req: &Request) -> Option<String> {
    req.uri().query().and_then(|query| {
        query.split('&').find_map(|pair| {
            let mut parts = pair.splitn(2, '=');
            match (parts.next(), parts.next()) {
                (Some("token"), Some(value)) => Some(value.to_string()),
                _ => None,
            }
        })
    })
}

/// Reject requests without a valid token; stamp the caller otherwise.
pub async fn auth_middleware(
    State(state): State<SharedState>,
    mut req: Request,
    next: Next,
) -> Response {
    let header_token = extract_bearer_token(&req).map(str::to_string);
    let token = header_token.or_else(|| extract_query_token(&req));

    let Some(token) = token else {
        return ApiError::Unauthorized.into_response();
    };

    match state.ctx.auth.verify(&token) {
        Ok(user_id) => {
            req.extensions_mut().insert(CurrentUser { user_id });
            next.run(req).await
        }
        Err(e) => {
            log::debug!("rejected token: {e}");
            ApiError::Unauthorized.into_response()
        }
    }
}
