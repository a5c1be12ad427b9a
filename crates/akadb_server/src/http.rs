//! Transport-independent requests and responses.
//!
//! The server converts hyper's types into these at the socket edge, so the
//! router and handlers run (and are tested) without a connection.

use crate::error::{ServerError, ServerResult};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeMap;

/// A parsed request.
#[derive(Debug, Clone, Default)]
pub struct Request {
    /// Upper-case method.
    pub method: String,
    /// Decoded path without the query string.
    pub path: String,
    /// Decoded query parameters; the last value wins.
    pub query: BTreeMap<String, String>,
    /// Headers with lower-case names.
    pub headers: Vec<(String, String)>,
    /// Raw body.
    pub body: Vec<u8>,
}

impl Request {
    /// Builds a request from a method and a request target such as
    /// `/movies?node=2`.
    pub fn new(method: &str, target: &str) -> Self {
        let (path, query) = match target.split_once('?') {
            Some((path, query)) => (path, parse_query(query)),
            None => (target, BTreeMap::new()),
        };
        Self {
            method: method.to_ascii_uppercase(),
            path: percent_decode(path),
            query,
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    /// Sets a JSON body.
    #[must_use]
    pub fn with_json(mut self, body: &serde_json::Value) -> Self {
        self.body = body.to_string().into_bytes();
        self.headers
            .push(("content-type".into(), "application/json".into()));
        self
    }

    /// First header with the given (lower-case) name.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    /// A non-empty query parameter.
    pub fn param(&self, name: &str) -> Option<&str> {
        self.query
            .get(name)
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
    }

    /// Parses a query parameter.
    pub fn parse_param<T>(&self, name: &str) -> ServerResult<Option<T>>
    where
        T: std::str::FromStr,
        T::Err: std::fmt::Display,
    {
        self.param(name)
            .map(|raw| {
                raw.parse()
                    .map_err(|e| ServerError::invalid(format!("parameter `{name}`: {e}")))
            })
            .transpose()
    }

    /// Decodes the body as JSON. An empty body decodes as `{}`.
    pub fn json<T: DeserializeOwned>(&self) -> ServerResult<T> {
        if self.body.iter().all(u8::is_ascii_whitespace) {
            return Ok(serde_json::from_slice(b"{}")?);
        }
        Ok(serde_json::from_slice(&self.body)?)
    }
}

/// A response ready to be written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    /// Status code.
    pub status: u16,
    /// Content type of `body`.
    pub content_type: &'static str,
    /// Encoded body.
    pub body: Vec<u8>,
}

impl Response {
    /// A JSON response.
    pub fn json<T: Serialize>(status: u16, value: &T) -> Self {
        match serde_json::to_vec(value) {
            Ok(body) => Self {
                status,
                content_type: "application/json",
                body,
            },
            Err(e) => {
                tracing::error!(error = %e, "response encoding failed");
                Self {
                    status: 500,
                    content_type: "application/json",
                    body: br#"{"error":"response encoding failed","logs":[]}"#.to_vec(),
                }
            }
        }
    }

    /// An empty response.
    pub fn empty(status: u16) -> Self {
        Self {
            status,
            content_type: "text/plain",
            body: Vec::new(),
        }
    }

    /// Decodes the body, for tests and clients.
    pub fn json_body(&self) -> ServerResult<serde_json::Value> {
        Ok(serde_json::from_slice(&self.body)?)
    }
}

/// Splits `a=1&b=two` into decoded pairs.
pub fn parse_query(query: &str) -> BTreeMap<String, String> {
    query
        .split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            (percent_decode(key), percent_decode(value))
        })
        .collect()
}

/// Decodes `%XX` escapes and `+` as space. Invalid escapes are kept as is.
pub fn percent_decode(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            b'%' if i + 2 < bytes.len() => {
                match (hex(bytes[i + 1]), hex(bytes[i + 2])) {
                    (Some(hi), Some(lo)) => {
                        out.push(hi << 4 | lo);
                        i += 3;
                    }
                    _ => {
                        out.push(b'%');
                        i += 1;
                    }
                }
            }
            other => {
                out.push(other);
                i += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn hex(byte: u8) -> Option<u8> {
    match byte {
        b'0'..=b'9' => Some(byte - b'0'),
        b'a'..=b'f' => Some(byte - b'a' + 10),
        b'A'..=b'F' => Some(byte - b'A' + 10),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_query_strings() {
        let query = parse_query("title=The%20Clown&region=US&empty=&flag&q=a+b");
        assert_eq!(query["title"], "The Clown");
        assert_eq!(query["region"], "US");
        assert_eq!(query["empty"], "");
        assert_eq!(query["flag"], "");
        assert_eq!(query["q"], "a b");
    }

    #[test]
    fn percent_decode_keeps_bad_escapes() {
        assert_eq!(percent_decode("100%"), "100%");
        assert_eq!(percent_decode("%zz"), "%zz");
        assert_eq!(percent_decode("caf%C3%A9"), "café");
    }

    #[test]
    fn request_from_target() {
        let request = Request::new("post", "/insert?node=2&title=The%20Clown")
            .with_json(&serde_json::json!({"titleId": "tt1"}));
        assert_eq!(request.method, "POST");
        assert_eq!(request.path, "/insert");
        assert_eq!(request.param("node"), Some("2"));
        assert_eq!(request.parse_param::<u8>("node").unwrap(), Some(2));
        assert_eq!(request.param("title"), Some("The Clown"));
        assert_eq!(request.header("content-type"), Some("application/json"));
        let body: serde_json::Value = request.json().unwrap();
        assert_eq!(body["titleId"], "tt1");
    }

    #[test]
    fn empty_body_reads_as_empty_object() {
        let request = Request::new("POST", "/commit");
        let body: serde_json::Value = request.json().unwrap();
        assert_eq!(body, serde_json::json!({}));
        assert!(request.parse_param::<u8>("node").unwrap().is_none());
    }
}
