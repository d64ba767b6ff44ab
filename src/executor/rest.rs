//! REST executor: HTTP requests shaped by the schema's http mappings.
//!
//! One pooled client is built lazily per interface, honoring the
//! interface options (insecure TLS, extra headers). Responses decode by
//! content type; failed calls retry only when the error is a transient
//! network failure and the interface configured a retry budget.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::warn;
use reqwest::header::CONTENT_TYPE;
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::Mutex;

use crate::error::{BridgeError, Result};
use crate::schema::http::HttpConnMeta;
use crate::schema::proto::ProtoDescriptor;
use crate::schema::Descriptor;

use super::{Executor, InterfaceOpt};

/// Protocol options of a REST interface.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RestOptions {
    pub insecure_skip_verify: bool,
    pub headers: HashMap<String, String>,
    pub retry_count: u32,
    /// Duration string, e.g. `"50ms"` or `"1s"`.
    pub retry_interval: Option<String>,
}

impl RestOptions {
    fn retry_interval(&self) -> Duration {
        self.retry_interval
            .as_deref()
            .and_then(|s| parse_duration(s).ok())
            .unwrap_or(Duration::ZERO)
    }
}

/// Parses `"250ms"`-style duration strings.
pub(crate) fn parse_duration(s: &str) -> Result<Duration> {
    let s = s.trim();
    let split = s
        .find(|c: char| !c.is_ascii_digit() && c != '.')
        .ok_or_else(|| BridgeError::mapping(format!("invalid duration {s}: missing unit")))?;
    let (num, unit) = s.split_at(split);
    let num: f64 = num
        .parse()
        .map_err(|_| BridgeError::mapping(format!("invalid duration {s}")))?;
    let secs = match unit {
        "ns" => num / 1e9,
        "us" | "µs" => num / 1e6,
        "ms" => num / 1e3,
        "s" => num,
        "m" => num * 60.0,
        "h" => num * 3600.0,
        _ => return Err(BridgeError::mapping(format!("invalid duration unit {unit}"))),
    };
    Ok(Duration::from_secs_f64(secs))
}

pub(crate) fn new_executor(
    descriptor: Descriptor,
    opt: InterfaceOpt,
    options: &Value,
) -> Result<Arc<dyn Executor>> {
    let descriptor = descriptor
        .as_proto()
        .ok_or_else(|| BridgeError::schema("invalid descriptor type for rest"))?;
    let rest_opt = match options {
        Value::Null => RestOptions::default(),
        other => serde_json::from_value(other.clone())
            .map_err(|e| BridgeError::mapping(format!("incorrect rest option: {e}")))?,
    };
    Ok(Arc::new(RestExecutor {
        descriptor,
        opt,
        rest_opt,
        client: Mutex::new(None),
    }))
}

#[derive(Debug)]
pub(crate) struct RestExecutor {
    descriptor: Arc<ProtoDescriptor>,
    opt: InterfaceOpt,
    rest_opt: RestOptions,
    client: Mutex<Option<reqwest::Client>>,
}

impl RestExecutor {
    #[cfg(test)]
    fn with_options(
        descriptor: Arc<ProtoDescriptor>,
        opt: InterfaceOpt,
        rest_opt: RestOptions,
    ) -> Self {
        RestExecutor {
            descriptor,
            opt,
            rest_opt,
            client: Mutex::new(None),
        }
    }

    /// Returns the pooled client, building it on first use under the
    /// mutex so exactly one client exists per interface.
    async fn client(&self) -> Result<reqwest::Client> {
        let mut guard = self.client.lock().await;
        if let Some(client) = guard.as_ref() {
            return Ok(client.clone());
        }
        let mut builder = reqwest::Client::builder().timeout(self.opt.timeout);
        if self.rest_opt.insecure_skip_verify {
            builder = builder.danger_accept_invalid_certs(true);
        }
        let client = builder
            .build()
            .map_err(|e| BridgeError::connection(format!("fail to build http client: {e}")))?;
        *guard = Some(client.clone());
        Ok(client)
    }

    async fn send(&self, name: &str, hm: &HttpConnMeta) -> Result<Value> {
        let client = self.client().await?;
        let base = self.opt.addr.as_str().trim_end_matches('/');
        let url = format!("{base}{}", hm.uri);
        url::Url::parse(&url)
            .map_err(|e| BridgeError::invocation(format!("invalid url {url}: {e}")))?;
        let method = reqwest::Method::from_bytes(hm.method.as_bytes())
            .map_err(|e| BridgeError::invocation(format!("invalid http method {}: {e}", hm.method)))?;

        let mut request = client.request(method, &url);
        for (k, v) in &self.rest_opt.headers {
            request = request.header(k.as_str(), v.as_str());
        }
        if let Some(body) = &hm.body {
            request = request
                .header(CONTENT_TYPE, "application/json")
                .body(body.clone());
        }
        let response = request.send().await.map_err(classify)?;
        let status = response.status();
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();
        let body = response
            .bytes()
            .await
            .map_err(|e| BridgeError::invocation(format!("read response body error: {e}")))?;
        if !status.is_success() {
            return Err(BridgeError::invocation(format!(
                "http return code {} and error message {}",
                status.as_u16(),
                String::from_utf8_lossy(&body)
            )));
        }
        if content_type.starts_with("application/json") {
            self.descriptor.return_from_json(name, &body)
        } else if content_type.starts_with("text/plain") {
            self.descriptor.return_from_text(name, &body)
        } else {
            Err(BridgeError::invocation(format!(
                "unsupported response content type {content_type}"
            )))
        }
    }
}

/// Transport failures are recoverable connection errors; everything else
/// is a plain invocation failure.
fn classify(e: reqwest::Error) -> BridgeError {
    if e.is_connect() || e.is_timeout() || e.is_request() {
        BridgeError::connection(e.to_string())
    } else {
        BridgeError::invocation(e.to_string())
    }
}

#[async_trait]
impl Executor for RestExecutor {
    async fn invoke_function(&self, name: &str, params: &[Value]) -> Result<Value> {
        // The request is fully built before any network traffic, so
        // mapping errors (bad prefix, missing field) never hit the wire.
        let hm = self.descriptor.convert_http_mapping(name, params)?;
        let mut attempt: u32 = 0;
        loop {
            match self.send(name, &hm).await {
                Ok(v) => return Ok(v),
                Err(e) if e.is_recoverable() && attempt < self.rest_opt.retry_count => {
                    attempt += 1;
                    warn!(
                        "rest call {name} failed ({e}), retry {attempt}/{}",
                        self.rest_opt.retry_count
                    );
                    tokio::time::sleep(self.rest_opt.retry_interval()).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil;
    use axum::routing::post;
    use axum::{Json, Router};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn executor(addr: &str, rest_opt: RestOptions) -> RestExecutor {
        let dir = testutil::schema_dir();
        let descriptor = Arc::new(ProtoDescriptor::parse("hw.proto", &[dir]).unwrap());
        RestExecutor::with_options(
            descriptor,
            InterfaceOpt {
                addr: url::Url::parse(addr).unwrap(),
                timeout: Duration::from_millis(5000),
            },
            rest_opt,
        )
    }

    async fn serve(app: Router) -> std::net::SocketAddr {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        addr
    }

    #[tokio::test]
    async fn test_default_mapping_round_trip() {
        let app = Router::new().route(
            "/SayHello",
            post(|Json(body): Json<Value>| async move {
                Json(json!({"message": body["name"]}))
            }),
        );
        let addr = serve(app).await;
        let exe = executor(&format!("http://{addr}"), RestOptions::default());
        let out = exe
            .invoke_function("SayHello", &[json!("world")])
            .await
            .unwrap();
        assert_eq!(out, json!({"message": "world"}));
    }

    #[tokio::test]
    async fn test_text_plain_response() {
        let app = Router::new().route("/GetStatus", post(|| async { "true" }));
        let addr = serve(app).await;
        let exe = executor(&format!("http://{addr}"), RestOptions::default());
        let out = exe.invoke_function("GetStatus", &[]).await.unwrap();
        assert_eq!(out, json!(true));
    }

    #[tokio::test]
    async fn test_non_2xx_is_invocation_error() {
        let app = Router::new().route(
            "/SayHello",
            post(|| async { (axum::http::StatusCode::BAD_REQUEST, "bad input") }),
        );
        let addr = serve(app).await;
        let exe = executor(&format!("http://{addr}"), RestOptions::default());
        let err = exe
            .invoke_function("SayHello", &[json!("world")])
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::Invocation(_)));
        assert!(err.message().contains("400"));
        assert!(err.message().contains("bad input"));
    }

    #[tokio::test]
    async fn test_unsupported_content_type() {
        let app = Router::new().route(
            "/SayHello",
            post(|| async {
                (
                    [(axum::http::header::CONTENT_TYPE, "application/xml")],
                    "<x/>",
                )
            }),
        );
        let addr = serve(app).await;
        let exe = executor(&format!("http://{addr}"), RestOptions::default());
        let err = exe
            .invoke_function("SayHello", &[json!("world")])
            .await
            .unwrap_err();
        assert!(err
            .message()
            .contains("unsupported response content type application/xml"));
    }

    #[tokio::test]
    async fn test_retry_recovers_transient_failure() {
        // First connection is dropped before a response; the second
        // serves a proper reply. With retryCount=2 the call succeeds
        // after exactly one sleep.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let attempts = AtomicUsize::new(0);
            loop {
                let (mut socket, _) = listener.accept().await.unwrap();
                if attempts.fetch_add(1, Ordering::SeqCst) == 0 {
                    drop(socket); // simulated transient network failure
                    continue;
                }
                use tokio::io::{AsyncReadExt, AsyncWriteExt};
                let mut buf = [0u8; 4096];
                let _ = socket.read(&mut buf).await;
                let body = r#"{"message":"world"}"#;
                let response = format!(
                    "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: {}\r\n\r\n{}",
                    body.len(),
                    body
                );
                let _ = socket.write_all(response.as_bytes()).await;
            }
        });
        let exe = executor(
            &format!("http://{addr}"),
            RestOptions {
                retry_count: 2,
                retry_interval: Some("1ms".to_string()),
                ..Default::default()
            },
        );
        let out = exe
            .invoke_function("SayHello", &[json!("world")])
            .await
            .unwrap();
        assert_eq!(out, json!({"message": "world"}));
    }

    #[tokio::test]
    async fn test_no_retry_on_application_error() {
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        let app = Router::new().route(
            "/SayHello",
            post(move || {
                let seen = seen.clone();
                async move {
                    seen.fetch_add(1, Ordering::SeqCst);
                    (axum::http::StatusCode::INTERNAL_SERVER_ERROR, "boom")
                }
            }),
        );
        let addr = serve(app).await;
        let exe = executor(
            &format!("http://{addr}"),
            RestOptions {
                retry_count: 3,
                retry_interval: Some("1ms".to_string()),
                ..Default::default()
            },
        );
        let err = exe
            .invoke_function("SayHello", &[json!("world")])
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::Invocation(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_custom_headers_forwarded() {
        let app = Router::new().route(
            "/SayHello",
            post(|headers: axum::http::HeaderMap, Json(_): Json<Value>| async move {
                let token = headers
                    .get("x-api-key")
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or("")
                    .to_string();
                Json(json!({"message": token}))
            }),
        );
        let addr = serve(app).await;
        let mut headers = HashMap::new();
        headers.insert("x-api-key".to_string(), "secret".to_string());
        let exe = executor(
            &format!("http://{addr}"),
            RestOptions {
                headers,
                ..Default::default()
            },
        );
        let out = exe
            .invoke_function("SayHello", &[json!("world")])
            .await
            .unwrap();
        assert_eq!(out, json!({"message": "secret"}));
    }

    #[tokio::test]
    async fn test_prefix_mismatch_fails_before_any_request() {
        // nothing listens on this address; a mapping failure must
        // surface before the executor ever touches the network
        let dir = testutil::schema_dir();
        let descriptor = Arc::new(ProtoDescriptor::parse("messaging.proto", &[dir]).unwrap());
        let exe = RestExecutor::with_options(
            descriptor,
            InterfaceOpt {
                addr: url::Url::parse("http://127.0.0.1:1").unwrap(),
                timeout: Duration::from_millis(5000),
            },
            RestOptions::default(),
        );
        let err = exe
            .invoke_function("GetMessage", &[json!("message/123456")])
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::Mapping(_)));
        assert!(err.message().contains("must have prefix messages/"));
    }

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("1ms").unwrap(), Duration::from_millis(1));
        assert_eq!(parse_duration("2s").unwrap(), Duration::from_secs(2));
        assert_eq!(parse_duration("1.5s").unwrap(), Duration::from_millis(1500));
        assert!(parse_duration("10").is_err());
        assert!(parse_duration("10parsecs").is_err());
    }
}
