//! Wires the document codec (§4.2) into the HTTP boundary: the response
//! encoding mirrors the request's `Content-Type` when a body was sent, or
//! its `Accept` header otherwise; unknown or absent values default to
//! JSON, exactly as `Encoding::from_content_type` already does for either
//! header.

use axum::extract::FromRequestParts;
use axum::http::header::{self, HeaderValue};
use axum::http::request::Parts;
use axum::response::{IntoResponse, Response};
use queue_core::codec::Encoding;
use serde::Serialize;
use std::convert::Infallible;

/// The encoding a handler should decode the request body with, and encode
/// its response in.
#[derive(Debug, Clone, Copy)]
pub struct Negotiated(pub Encoding);

impl<S> FromRequestParts<S> for Negotiated
where
    S: Send + Sync,
{
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let header_value = parts
            .headers
            .get(header::CONTENT_TYPE)
            .or_else(|| parts.headers.get(header::ACCEPT))
            .and_then(|value| value.to_str().ok());

        Ok(Self(Encoding::from_content_type(header_value)))
    }
}

/// A response body encoded in a [`Negotiated`] encoding, with a matching
/// `Content-Type` header.
pub struct Document<T>(pub T, pub Encoding);

impl<T: Serialize> IntoResponse for Document<T> {
    fn into_response(self) -> Response {
        match queue_core::codec::encode(&self.0, self.1) {
            Ok(bytes) => {
                let mut response = bytes.into_response();
                response
                    .headers_mut()
                    .insert(header::CONTENT_TYPE, HeaderValue::from_static(self.1.content_type()));
                response
            }
            Err(error) => crate::error::ApiError::from(error).into_response(),
        }
    }
}
