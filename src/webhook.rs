//! Inbound webhook payloads.

use axum::body::{Body, Bytes};
use axum::http::Request;
use axum::http::request::Parts;
use serde::Deserialize;

use crate::error::ParseError;

/// The two fields of a GitHub push event the relay acts on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushNotification {
    full_name: String,
    commit: String,
}

#[derive(Deserialize)]
struct RawPush {
    repository: Option<RawRepository>,
    after: Option<String>,
}

#[derive(Deserialize)]
struct RawRepository {
    full_name: Option<String>,
}

impl PushNotification {
    /// Decode and validate a push payload. Unknown fields are ignored.
    pub fn parse(body: &[u8]) -> Result<Self, ParseError> {
        let raw: RawPush = serde_json::from_slice(body)?;

        let full_name = raw
            .repository
            .and_then(|repo| repo.full_name)
            .filter(|name| !name.is_empty())
            .ok_or(ParseError::MissingField("repository.full_name"))?;
        let commit = raw
            .after
            .filter(|sha| !sha.is_empty())
            .ok_or(ParseError::MissingField("after"))?;

        if repo_name(&full_name).is_none() {
            return Err(ParseError::InvalidRepository(full_name));
        }

        Ok(Self { full_name, commit })
    }

    /// `owner/repo`.
    pub fn full_name(&self) -> &str {
        &self.full_name
    }

    /// The commit the push moved the ref to.
    pub fn commit(&self) -> &str {
        &self.commit
    }

    /// Final path segment of the repository name.
    pub fn repo_name(&self) -> &str {
        repo_name(&self.full_name).unwrap_or(&self.full_name)
    }
}

/// Last non-empty `/`-separated segment of `full_name`.
pub fn repo_name(full_name: &str) -> Option<&str> {
    full_name
        .rsplit('/')
        .next()
        .filter(|segment| !segment.is_empty() && *segment != "." && *segment != "..")
}

/// A request whose body has been read into memory so it can be inspected
/// and still forwarded unchanged.
#[derive(Debug)]
pub struct BufferedRequest {
    parts: Parts,
    body: Bytes,
}

impl BufferedRequest {
    /// Read the whole body, failing if it exceeds `limit` bytes.
    pub async fn from_request(request: Request<Body>, limit: usize) -> Result<Self, ParseError> {
        let (parts, body) = request.into_parts();
        let body = axum::body::to_bytes(body, limit)
            .await
            .map_err(|e| ParseError::Body(e.to_string()))?;
        Ok(Self { parts, body })
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Rebuild the original request, body included.
    pub fn into_request(self) -> Request<Body> {
        Request::from_parts(self.parts, Body::from(self.body))
    }
}
