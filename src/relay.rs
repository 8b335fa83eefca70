//! Streaming HTTP relay to a tunnel endpoint.

use std::net::SocketAddr;

use axum::body::{Body, Bytes};
use axum::extract::ConnectInfo;
use axum::http::{HeaderMap, HeaderValue, Request, Response, header};
use futures::{SinkExt, StreamExt};

use crate::error::RelayError;
use crate::tunnel::Endpoint;

/// Headers that describe a single connection and must not be forwarded.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Chunks buffered between the inbound body and the upstream request.
const BODY_CHANNEL_CAPACITY: usize = 8;

/// Forwards requests to an endpoint and streams the response back.
#[derive(Debug, Clone)]
pub struct Relay {
    client: reqwest::Client,
}

impl Relay {
    /// A relay that never follows redirects and ignores proxy settings.
    pub fn new() -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .no_proxy()
            .build()?;
        Ok(Self { client })
    }

    /// Forward `request` to `endpoint`, keeping method, path, query, headers
    /// and body. Redirects are returned to the caller, not followed.
    pub async fn forward(
        &self,
        request: Request<Body>,
        endpoint: &Endpoint,
    ) -> Result<Response<Body>, RelayError> {
        let (parts, body) = request.into_parts();

        let path_and_query = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        let url = endpoint
            .join(path_and_query)
            .map_err(|e| RelayError::InvalidUrl {
                url: format!("{endpoint}{path_and_query}"),
                reason: e.to_string(),
            })?;

        let client_addr = parts
            .extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| *addr);
        let mut headers = parts.headers;
        add_forwarding_headers(&mut headers, client_addr);
        remove_hop_by_hop_headers(&mut headers);
        headers.remove(header::HOST);

        tracing::info!(endpoint = %endpoint, method = %parts.method, path = %url.path(), "Proxying request");

        let upstream = self
            .client
            .request(parts.method, url)
            .headers(headers)
            .body(streaming_body(body))
            .send()
            .await
            .map_err(|source| RelayError::Upstream {
                endpoint: endpoint.to_string(),
                source,
            })?;

        let status = upstream.status();
        let mut response_headers = upstream.headers().clone();
        remove_hop_by_hop_headers(&mut response_headers);

        let mut response = Response::new(Body::from_stream(upstream.bytes_stream()));
        *response.status_mut() = status;
        *response.headers_mut() = response_headers;
        Ok(response)
    }
}

/// Pipe the inbound body into an upstream request body chunk by chunk.
fn streaming_body(body: Body) -> reqwest::Body {
    let (mut tx, rx) =
        futures::channel::mpsc::channel::<Result<Bytes, axum::Error>>(BODY_CHANNEL_CAPACITY);

    tokio::spawn(async move {
        let mut chunks = body.into_data_stream();
        while let Some(chunk) = chunks.next().await {
            let failed = chunk.is_err();
            if tx.send(chunk).await.is_err() || failed {
                break;
            }
        }
    });

    reqwest::Body::wrap_stream(rx)
}

fn add_forwarding_headers(headers: &mut HeaderMap, client_addr: Option<SocketAddr>) {
    if let Some(addr) = client_addr {
        let forwarded_for = headers
            .get("x-forwarded-for")
            .and_then(|h| h.to_str().ok())
            .map(|s| format!("{}, {}", s, addr.ip()))
            .unwrap_or_else(|| addr.ip().to_string());
        if let Ok(value) = HeaderValue::from_str(&forwarded_for) {
            headers.insert("x-forwarded-for", value);
        }
    }

    if let Some(host) = headers.get(header::HOST).cloned() {
        headers.insert("x-forwarded-host", host);
    }

    headers.insert("x-forwarded-proto", HeaderValue::from_static("http"));
}

fn remove_hop_by_hop_headers(headers: &mut HeaderMap) {
    let listed: Vec<String> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .map(|name| name.trim().to_ascii_lowercase())
        .filter(|name| !name.is_empty())
        .collect();

    for name in HOP_BY_HOP {
        headers.remove(*name);
    }
    for name in listed {
        headers.remove(name.as_str());
    }
}

#[cfg(test)]
mod tests {
    use axum::Router;
    use axum::http::{Method, StatusCode};
    use axum::response::{IntoResponse, Redirect};
    use axum::routing::get;
    use tokio::net::TcpListener;

    use super::*;

    /// Echoes method, selected headers, and body back as a plain-text dump.
    async fn echo(request: Request<Body>) -> impl IntoResponse {
        let (parts, body) = request.into_parts();
        let body = axum::body::to_bytes(body, usize::MAX).await.unwrap_or_default();
        let header = |name: &str| {
            parts
                .headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .unwrap_or("-")
                .to_string()
        };
        let dump = format!(
            "{} {}\nhost={}\nx-custom={}\nkeep-alive={}\nx-forwarded-for={}\nx-forwarded-host={}\nx-forwarded-proto={}\n",
            parts.method,
            parts.uri,
            header("host"),
            header("x-custom"),
            header("keep-alive"),
            header("x-forwarded-for"),
            header("x-forwarded-host"),
            header("x-forwarded-proto"),
        );
        let mut out = dump.into_bytes();
        out.extend_from_slice(&body);
        ([("x-upstream", "echo")], out)
    }

    async fn spawn_upstream() -> Endpoint {
        let app = Router::new()
            .route("/moved", get(|| async { Redirect::temporary("/elsewhere") }))
            .fallback(echo);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        Endpoint::from_socket_addr(addr)
    }

    async fn body_text(response: Response<Body>) -> String {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn test_forward_preserves_request() {
        let endpoint = spawn_upstream().await;
        let mut request = Request::builder()
            .method(Method::PUT)
            .uri("/hooks/deploy?ref=main")
            .header("host", "relay.example.com")
            .header("x-custom", "kept")
            .header("keep-alive", "timeout=5")
            .body(Body::from(r#"{"x":1}"#))
            .unwrap();
        request
            .extensions_mut()
            .insert(ConnectInfo(SocketAddr::from(([203, 0, 113, 7], 51000))));

        let response = Relay::new().unwrap().forward(request, &endpoint).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["x-upstream"], "echo");

        let text = body_text(response).await;
        assert!(text.starts_with("PUT /hooks/deploy?ref=main\n"));
        assert!(text.contains(&format!("host={}:{}\n", endpoint.host(), endpoint.port())));
        assert!(text.contains("x-custom=kept\n"));
        assert!(text.contains("keep-alive=-\n"));
        assert!(text.contains("x-forwarded-for=203.0.113.7\n"));
        assert!(text.contains("x-forwarded-host=relay.example.com\n"));
        assert!(text.contains("x-forwarded-proto=http\n"));
        assert!(text.ends_with(r#"{"x":1}"#));
    }

    #[tokio::test]
    async fn test_redirects_are_not_followed() {
        let endpoint = spawn_upstream().await;
        let request = Request::builder()
            .uri("/moved")
            .body(Body::empty())
            .unwrap();

        let response = Relay::new().unwrap().forward(request, &endpoint).await.unwrap();
        assert_eq!(response.status(), StatusCode::TEMPORARY_REDIRECT);
        assert_eq!(response.headers()["location"], "/elsewhere");
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_is_upstream_error() {
        // Bind then drop to get a port nothing listens on.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let endpoint = Endpoint::from_socket_addr(listener.local_addr().unwrap());
        drop(listener);

        let request = Request::builder().uri("/").body(Body::empty()).unwrap();
        let err = Relay::new().unwrap().forward(request, &endpoint).await.unwrap_err();
        assert!(matches!(err, RelayError::Upstream { .. }));
    }

    #[test]
    fn test_hop_by_hop_headers() {
        let mut headers = HeaderMap::new();
        headers.insert("connection", HeaderValue::from_static("keep-alive, x-custom"));
        headers.insert("keep-alive", HeaderValue::from_static("timeout=5"));
        headers.insert("transfer-encoding", HeaderValue::from_static("chunked"));
        headers.insert("x-custom", HeaderValue::from_static("value"));
        headers.insert("x-other", HeaderValue::from_static("value"));

        remove_hop_by_hop_headers(&mut headers);

        assert!(headers.get("connection").is_none());
        assert!(headers.get("keep-alive").is_none());
        assert!(headers.get("transfer-encoding").is_none());
        assert!(headers.get("x-custom").is_none());
        assert!(headers.get("x-other").is_some());
    }

    #[test]
    fn test_forwarded_for_appends() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", HeaderValue::from_static("10.0.0.1"));
        add_forwarding_headers(&mut headers, Some(SocketAddr::from(([192, 0, 2, 1], 4000))));
        assert_eq!(headers["x-forwarded-for"], "10.0.0.1, 192.0.2.1");
        assert_eq!(headers["x-forwarded-proto"], "http");
        assert!(headers.get("x-forwarded-host").is_none());
    }
}
