//! Purpose: Define the request/response seam between the session manager and HTTP.
//! Exports: `Transport`, `TransportRequest`, `TransportResponse`, `RequestBody`, `Method`, `HttpTransport`.
//! Role: Everything above this module is transport-agnostic; the in-memory service plugs in here.
//! Invariants: Non-2xx statuses come back as responses; only I/O failures are errors.
//! Invariants: Streamed request bodies are sent with chunked transfer encoding.
#![allow(clippy::result_large_err)]

use std::fmt;
use std::io::{Cursor, Read};
use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;
use url::Url;

use crate::api::config::TunnelConfig;
use crate::core::error::{Error, ErrorKind};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Method {
    Get,
    Post,
    Put,
}

impl Method {
    pub fn as_str(self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub enum RequestBody {
    Empty,
    Bytes(Vec<u8>),
    Stream(Box<dyn Read + Send>),
}

impl RequestBody {
    /// Turns any body into a reader; servers consume all three shapes the same way.
    pub fn into_reader(self) -> Box<dyn Read + Send> {
        match self {
            RequestBody::Empty => Box::new(std::io::empty()),
            RequestBody::Bytes(bytes) => Box::new(Cursor::new(bytes)),
            RequestBody::Stream(reader) => reader,
        }
    }
}

impl fmt::Debug for RequestBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestBody::Empty => f.write_str("Empty"),
            RequestBody::Bytes(bytes) => write!(f, "Bytes({} bytes)", bytes.len()),
            RequestBody::Stream(_) => f.write_str("Stream"),
        }
    }
}

#[derive(Debug)]
pub struct TransportRequest {
    pub method: Method,
    /// Relative to the tunnel endpoint, without a leading slash.
    pub path: String,
    pub query: Vec<(String, String)>,
    pub headers: Vec<(String, String)>,
    pub body: RequestBody,
    pub timeout: Option<Duration>,
}

impl TransportRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            query: Vec::new(),
            headers: Vec::new(),
            body: RequestBody::Empty,
            timeout: None,
        }
    }

    pub fn with_query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_body(mut self, body: RequestBody) -> Self {
        self.body = body;
        self
    }

    pub fn with_json<T: Serialize>(self, body: &T) -> Result<Self, Error> {
        let payload = serde_json::to_vec(body).map_err(|err| {
            Error::new(ErrorKind::Internal)
                .with_message("failed to encode request json")
                .with_source(err)
        })?;
        Ok(self
            .with_header("Content-Type", "application/json")
            .with_body(RequestBody::Bytes(payload)))
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }

    pub fn query_param(&self, key: &str) -> Option<&str> {
        self.query
            .iter()
            .find(|(candidate, _)| candidate == key)
            .map(|(_, value)| value.as_str())
    }
}

pub struct TransportResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Box<dyn Read + Send>,
}

impl TransportResponse {
    pub fn new(status: u16) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: Box::new(std::io::empty()),
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_bytes(mut self, bytes: Vec<u8>) -> Self {
        self.body = Box::new(Cursor::new(bytes));
        self
    }

    pub fn with_reader(mut self, reader: Box<dyn Read + Send>) -> Self {
        self.body = reader;
        self
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }

    pub fn read_bytes(mut self) -> Result<Vec<u8>, Error> {
        let mut out = Vec::new();
        self.body.read_to_end(&mut out).map_err(|err| {
            Error::new(ErrorKind::Transport)
                .with_message("failed to read response body")
                .with_source(err)
        })?;
        Ok(out)
    }

    pub fn read_json<R: DeserializeOwned>(self) -> Result<R, Error> {
        let bytes = self.read_bytes()?;
        serde_json::from_slice(&bytes).map_err(|err| {
            Error::new(ErrorKind::Service)
                .with_message("invalid response json")
                .with_source(err)
        })
    }
}

impl fmt::Debug for TransportResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportResponse")
            .field("status", &self.status)
            .field("headers", &self.headers)
            .finish_non_exhaustive()
    }
}

fn find_header<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(candidate, _)| candidate.eq_ignore_ascii_case(name))
        .map(|(_, value)| value.as_str())
}

/// Executes one request. Implementations must be shareable across block workers.
pub trait Transport: Send + Sync {
    fn execute(&self, request: TransportRequest) -> Result<TransportResponse, Error>;
}

/// Pooled HTTP transport over a `ureq` agent.
pub struct HttpTransport {
    endpoint: Url,
    agent: ureq::Agent,
    headers: Vec<(String, String)>,
    timeout: Option<Duration>,
}

impl HttpTransport {
    pub fn new(endpoint: &str) -> Result<Self, Error> {
        Self::from_config(&TunnelConfig::new(endpoint)?)
    }

    pub fn from_config(config: &TunnelConfig) -> Result<Self, Error> {
        let endpoint = normalize_endpoint(config.endpoint.clone())?;
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(config.connect_timeout)
            .build();
        Ok(Self {
            endpoint,
            agent,
            headers: Vec::new(),
            timeout: config.http_timeout,
        })
    }

    /// Adds a header to every request, e.g. credentials from an outer signer.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    fn url_for(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.endpoint.as_str().trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }
}

impl Transport for HttpTransport {
    fn execute(&self, request: TransportRequest) -> Result<TransportResponse, Error> {
        let TransportRequest {
            method,
            path,
            query,
            headers,
            body,
            timeout,
        } = request;
        let mut call = self.agent.request(method.as_str(), &self.url_for(&path));
        for (key, value) in &query {
            call = call.query(key, value);
        }
        for (name, value) in self.headers.iter().chain(headers.iter()) {
            call = call.set(name, value);
        }
        let timeout = match (timeout, self.timeout) {
            (Some(request), Some(default)) => Some(request.min(default)),
            (request, default) => request.or(default),
        };
        if let Some(timeout) = timeout {
            call = call.timeout(timeout);
        }

        let result = match body {
            RequestBody::Empty => call.call(),
            RequestBody::Bytes(bytes) => call.send_bytes(&bytes),
            RequestBody::Stream(reader) => call.send(reader),
        };
        let response = match result {
            Ok(response) => response,
            Err(ureq::Error::Status(_, response)) => response,
            Err(ureq::Error::Transport(err)) => {
                return Err(Error::new(ErrorKind::Transport)
                    .with_message(format!("{method} {path} failed"))
                    .with_source(err));
            }
        };

        let status = response.status();
        let headers = response
            .headers_names()
            .into_iter()
            .filter_map(|name| {
                let value = response.header(&name)?.to_string();
                Some((name, value))
            })
            .collect();
        Ok(TransportResponse {
            status,
            headers,
            body: Box::new(response.into_reader()),
        })
    }
}

fn normalize_endpoint(mut endpoint: Url) -> Result<Url, Error> {
    if endpoint.cannot_be_a_base() || !matches!(endpoint.scheme(), "http" | "https") {
        return Err(Error::new(ErrorKind::Usage)
            .with_message("tunnel endpoint must be an http(s) url"));
    }
    endpoint.set_query(None);
    endpoint.set_fragment(None);
    Ok(endpoint)
}
