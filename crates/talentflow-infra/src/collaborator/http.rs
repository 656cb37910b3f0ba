//! HTTP `ApiClient` for api_call steps.
//!
//! A step names a service; the client joins the service's configured base
//! URL with the step's path and sends the resolved body as JSON. Response
//! bodies are parsed as JSON when possible and returned as a string
//! otherwise.

use std::collections::BTreeMap;
use std::time::Duration;

use serde_json::Value;
use talentflow_core::workflow::collaborator::{
    ApiClient, ApiRequest, CollaboratorError, CollaboratorFuture,
};

pub struct HttpApiClient {
    http: reqwest::Client,
    services: BTreeMap<String, String>,
}

impl HttpApiClient {
    pub fn new(
        services: BTreeMap<String, String>,
        timeout_secs: u64,
    ) -> Result<Self, CollaboratorError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .user_agent(concat!("talentflow/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| CollaboratorError::Request(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { http, services })
    }

    /// Full URL for `path` on `service`.
    pub fn url_for(&self, service: &str, path: &str) -> Result<String, CollaboratorError> {
        let base = self
            .services
            .get(service)
            .ok_or_else(|| CollaboratorError::NotRegistered {
                role: "service",
                name: service.to_string(),
            })?;
        Ok(format!(
            "{}/{}",
            base.trim_end_matches('/'),
            path.trim_start_matches('/')
        ))
    }

    async fn send(&self, request: &ApiRequest) -> Result<Value, CollaboratorError> {
        let url = self.url_for(&request.service, &request.path)?;
        let method: reqwest::Method = request.method.to_ascii_uppercase().parse().map_err(|_| {
            CollaboratorError::InvalidInput(format!("invalid HTTP method: {}", request.method))
        })?;

        let mut builder = self.http.request(method.clone(), &url);
        for (key, value) in &request.headers {
            builder = builder.header(key.as_str(), value.as_str());
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| CollaboratorError::Request(format!("{method} {url} failed: {e}")))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| CollaboratorError::Request(format!("failed to read response body: {e}")))?;

        tracing::info!(
            service = %request.service,
            %method,
            url = url.as_str(),
            status = status.as_u16(),
            body_len = text.len(),
            "api call completed"
        );

        if !status.is_success() {
            return Err(CollaboratorError::Status {
                status: status.as_u16(),
                body: text,
            });
        }
        if text.trim().is_empty() {
            return Ok(Value::Null);
        }
        Ok(serde_json::from_str(&text).unwrap_or(Value::String(text)))
    }
}

impl std::fmt::Debug for HttpApiClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpApiClient")
            .field("services", &self.services.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl ApiClient for HttpApiClient {
    fn call<'a>(&'a self, request: &'a ApiRequest) -> CollaboratorFuture<'a, Value> {
        Box::pin(self.send(request))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Serves one canned response and returns the raw request it received.
    async fn one_shot_server(
        status_line: &'static str,
        body: &'static str,
    ) -> (String, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut raw = Vec::new();
            let mut buf = [0u8; 4096];
            loop {
                let n = socket.read(&mut buf).await.unwrap();
                raw.extend_from_slice(&buf[..n]);
                let text = String::from_utf8_lossy(&raw);
                if let Some(head_end) = text.find("\r\n\r\n") {
                    let length = text[..head_end]
                        .lines()
                        .find_map(|l| {
                            l.to_ascii_lowercase()
                                .strip_prefix("content-length:")
                                .map(|v| v.trim().parse::<usize>().unwrap())
                        })
                        .unwrap_or(0);
                    if raw.len() >= head_end + 4 + length {
                        break;
                    }
                }
                if n == 0 {
                    break;
                }
            }
            let response = format!(
                "HTTP/1.1 {status_line}\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                body.len()
            );
            socket.write_all(response.as_bytes()).await.unwrap();
            socket.shutdown().await.unwrap();
            String::from_utf8_lossy(&raw).into_owned()
        });
        (base, handle)
    }

    fn client(service: &str, base: &str) -> HttpApiClient {
        let services = BTreeMap::from([(service.to_string(), base.to_string())]);
        HttpApiClient::new(services, 5).unwrap()
    }

    fn request(method: &str, body: Option<Value>) -> ApiRequest {
        ApiRequest {
            service: "hris".into(),
            method: method.into(),
            path: "/employees/e-17/leave".into(),
            headers: BTreeMap::from([("x-request-source".to_string(), "talentflow".to_string())]),
            body,
        }
    }

    #[test]
    fn url_joins_base_and_path() {
        let c = client("hris", "https://hris.internal/api/");
        assert_eq!(
            c.url_for("hris", "/employees").unwrap(),
            "https://hris.internal/api/employees"
        );
        let err = c.url_for("payroll", "/runs").unwrap_err();
        assert!(matches!(err, CollaboratorError::NotRegistered { role: "service", .. }));
    }

    #[tokio::test]
    async fn invalid_method_is_not_retryable() {
        let c = client("hris", "http://127.0.0.1:9");
        let err = c.call(&request("GE T", None)).await.unwrap_err();
        assert!(matches!(err, CollaboratorError::InvalidInput(_)), "got: {err}");
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn posts_json_and_parses_response() {
        let (base, server) = one_shot_server("201 Created", r#"{"leave_id":"lv-9"}"#).await;
        let c = client("hris", &base);

        let result = c
            .call(&request("post", Some(json!({ "days": 3 }))))
            .await
            .unwrap();
        assert_eq!(result, json!({ "leave_id": "lv-9" }));

        let raw = server.await.unwrap();
        assert!(raw.starts_with("POST /employees/e-17/leave HTTP/1.1"), "got: {raw}");
        assert!(raw.contains("x-request-source: talentflow"));
        assert!(raw.ends_with(r#"{"days":3}"#));
    }

    #[tokio::test]
    async fn server_errors_are_retryable_status() {
        let (base, server) = one_shot_server("503 Service Unavailable", "down").await;
        let c = client("hris", &base);

        let err = c.call(&request("GET", None)).await.unwrap_err();
        match &err {
            CollaboratorError::Status { status, body } => {
                assert_eq!(*status, 503);
                assert_eq!(body, "down");
            }
            other => panic!("expected status error, got {other}"),
        }
        assert!(err.is_retryable());
        server.await.unwrap();
    }
}
