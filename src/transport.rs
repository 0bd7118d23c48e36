//! Fire-and-poll HTTP transport abstraction.
//!
//! The uploader never awaits a request. It issues one, keeps the returned
//! [`InFlight`] handle, and polls it on later steps.

use reqwest::{Method, StatusCode};

pub use crate::client::ClientError;

pub const CONTENT_TYPE_CSV: &str = "text/csv";

/// An outbound request relative to the transport's base URL.
#[derive(Debug, Clone, PartialEq)]
pub struct HttpRequest {
    pub method: Method,

    /// Path and query, starting with `/`
    pub path: String,

    pub body: Option<String>,

    pub headers: Vec<(String, String)>,
}

impl HttpRequest {
    pub fn get(path: impl Into<String>) -> Self {
        Self {
            method: Method::GET,
            path: path.into(),
            body: None,
            headers: Vec::new(),
        }
    }

    pub fn post(path: impl Into<String>, body: String, content_type: &str) -> Self {
        Self {
            method: Method::POST,
            path: path.into(),
            body: Some(body),
            headers: vec![("Content-Type".to_string(), content_type.to_string())],
        }
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// First value of header `name`, compared case-insensitively.
    pub fn header_value(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct HttpResponse {
    pub status: StatusCode,
    pub body: String,
}

/// State of an issued request.
#[derive(Debug, Clone, PartialEq)]
pub enum Readiness {
    Pending,
    Ready(HttpResponse),
    /// The request never produced a response.
    Failed(ClientError),
}

/// Handle to an issued request. Dropping it abandons the request.
pub trait InFlight: Send {
    fn poll(&mut self) -> Readiness;
}

pub trait Transport: Send {
    /// Whether a network path is currently available.
    fn connected(&self) -> bool {
        true
    }

    fn issue(&mut self, request: HttpRequest) -> Result<Box<dyn InFlight>, ClientError>;
}
