use std::fmt;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::runtime::Handle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Method::Get => write!(f, "GET"),
            Method::Post => write!(f, "POST"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ApiRequest {
    pub method: Method,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ApiResponse {
    pub status: u16,
    pub body: String,
}

/// Synchronous request/response capability.
pub trait Transport: Send + Sync {
    fn request(&self, request: &ApiRequest) -> Result<ApiResponse>;
}

/// `reqwest` over the process's tokio runtime. Must be called from plain
/// threads (workers, console), never from inside an async task.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    http: reqwest::Client,
    runtime: Handle,
}

impl HttpTransport {
    pub fn new(runtime: Handle) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("failed to build http client")?;

        Ok(Self { http, runtime })
    }
}

impl Transport for HttpTransport {
    fn request(&self, request: &ApiRequest) -> Result<ApiResponse> {
        self.runtime.block_on(async {
            let mut builder = match request.method {
                Method::Get => self.http.get(&request.url),
                Method::Post => self.http.post(&request.url),
            };

            for (name, value) in &request.headers {
                builder = builder.header(name.as_str(), value.as_str());
            }

            if let Some(body) = &request.body {
                builder = builder
                    .header("Content-Type", "application/json")
                    .body(body.clone());
            }

            let resp = builder
                .send()
                .await
                .with_context(|| format!("{} {} failed", request.method, request.url))?;

            let status = resp.status().as_u16();
            let body = resp.text().await.context("read response body failed")?;

            Ok(ApiResponse { status, body })
        })
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use parking_lot::Mutex;

    type Handler = Box<dyn Fn(&ApiRequest) -> Result<ApiResponse> + Send + Sync>;

    /// Answers every request with a closure and records what it was asked.
    pub struct FnTransport {
        handler: Handler,
        requests: Mutex<Vec<ApiRequest>>,
    }

    impl FnTransport {
        pub fn new(handler: impl Fn(&ApiRequest) -> Result<ApiResponse> + Send + Sync + 'static) -> Self {
            Self {
                handler: Box::new(handler),
                requests: Mutex::new(Vec::new()),
            }
        }

        pub fn requests(&self) -> Vec<ApiRequest> {
            self.requests.lock().clone()
        }
    }

    impl Transport for FnTransport {
        fn request(&self, request: &ApiRequest) -> Result<ApiResponse> {
            self.requests.lock().push(request.clone());
            (self.handler)(request)
        }
    }

    pub fn ok(body: impl Into<String>) -> Result<ApiResponse> {
        Ok(ApiResponse {
            status: 200,
            body: body.into(),
        })
    }
}
