//! Collector transport
//!
//! The worker only needs "post this form to this path, tell me whether it
//! worked". [`Connector`] opens a [`Transport`] when a worker starts and
//! again after every backoff; the HTTP implementation posts url-encoded
//! forms with `reqwest`.

use serde_json::Value;

use crate::error::{Error, Result};
use crate::metric::Payload;

/// Ordered url-encoded form fields
pub type Form = Vec<(String, String)>;

/// A handle able to submit forms to the collector
///
/// Owned by exactly one worker; never shared with submitting threads.
pub trait Transport: Send {
    /// Submit one form to `path`. Any non-2xx answer is an error.
    fn submit(&mut self, path: &str, form: &[(String, String)]) -> Result<()>;
}

/// Opens transports for the worker
pub trait Connector: Send + Sync {
    fn connect(&self) -> Result<Box<dyn Transport>>;

    /// Human-readable endpoint, for logs
    fn endpoint(&self) -> String;
}

/// Build the form for one metric submission
///
/// `api_key` first, then `data[][field]` pairs record by record, which a
/// Rack-style collector reads back as an array of hashes.
pub fn encode_form(api_key: &str, payload: &Payload) -> Form {
    let mut form = vec![("api_key".to_string(), api_key.to_string())];
    for record in payload.records() {
        for (field, value) in record {
            form.push((format!("data[][{}]", field), scalar_to_string(value)));
        }
    }
    form
}

fn scalar_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        nested => nested.to_string(),
    }
}

/// Connector for a real collector over HTTP(S)
pub struct HttpConnector {
    base_url: String,
}

impl HttpConnector {
    /// `base_url` is scheme, host and port, e.g. `http://localhost:10001`
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }
}

impl Connector for HttpConnector {
    fn connect(&self) -> Result<Box<dyn Transport>> {
        Ok(Box::new(HttpTransport::new(&self.base_url)?))
    }

    fn endpoint(&self) -> String {
        self.base_url.clone()
    }
}

/// HTTP transport driving an async `reqwest` client on its own runtime
///
/// The worker is a plain thread, so requests are run to completion with
/// `block_on` on a current-thread runtime owned by the transport.
pub struct HttpTransport {
    base_url: String,
    http_client: reqwest::Client,
    runtime: tokio::runtime::Runtime,
}

impl HttpTransport {
    pub fn new(base_url: &str) -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| Error::Runtime(format!("failed to create runtime: {}", e)))?;

        let http_client = reqwest::Client::builder()
            .build()
            .map_err(|e| Error::Config(format!("failed to create HTTP client: {}", e)))?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http_client,
            runtime,
        })
    }
}

impl Transport for HttpTransport {
    fn submit(&mut self, path: &str, form: &[(String, String)]) -> Result<()> {
        let url = format!("{}{}", self.base_url, path);
        let client = &self.http_client;

        self.runtime.block_on(async {
            let response = client
                .post(&url)
                .form(form)
                .send()
                .await
                .map_err(classify_request_error)?;

            let status = response.status();
            tracing::debug!(status = status.as_u16(), %url, "Sent returned");

            if status.is_success() {
                Ok(())
            } else {
                let body = response
                    .text()
                    .await
                    .unwrap_or_else(|_| "unknown".to_string());
                Err(Error::Status {
                    status: status.as_u16(),
                    body,
                })
            }
        })
    }
}

/// Split reqwest failures into the quiet "can't connect" class and the rest
fn classify_request_error(e: reqwest::Error) -> Error {
    if e.is_connect() {
        Error::Connect(e.to_string())
    } else {
        Error::Transport(format!("HTTP request failed: {}", e))
    }
}
