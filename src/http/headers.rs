//! HTTP header collection
//!
//! Ordered, case-insensitive header storage shared by the request header
//! parser and the multipart part-header parser.

use super::{Error, Result, MAX_HEADERS};
use std::fmt;

/// Header collection
///
/// Headers are stored in insertion order with case-insensitive name lookup.
/// Repeated names keep every value; `get` returns the first.
#[derive(Debug, Clone, Default)]
pub struct Headers {
    headers: Vec<(String, String)>,
}

impl Headers {
    pub fn new() -> Self {
        Headers {
            headers: Vec::new(),
        }
    }

    /// Insert a header, keeping earlier values for the same name.
    ///
    /// Insertions beyond `MAX_HEADERS` are dropped silently; the bounded
    /// header-block capacity upstream is what actually rejects oversized
    /// header sections.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        if self.headers.len() >= MAX_HEADERS {
            return;
        }
        self.headers.push((name.into(), value.into()));
    }

    /// First value for a header (case-insensitive)
    pub fn get(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.headers
            .iter()
            .any(|(n, _)| n.eq_ignore_ascii_case(name))
    }

    pub fn len(&self) -> usize {
        self.headers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.headers.is_empty()
    }

    pub fn clear(&mut self) {
        self.headers.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.headers.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    /// Parse a `Name: value` line into name and value.
    pub fn parse_header_line(line: &str) -> Result<(String, String)> {
        match line.find(':') {
            Some(colon_pos) => {
                let name = line[..colon_pos].trim().to_string();
                let value = line[colon_pos + 1..].trim().to_string();
                if name.is_empty() {
                    return Err(Error::InvalidHeader("Empty header name".to_string()));
                }
                Ok((name, value))
            }
            None => Err(Error::InvalidHeader(format!("No colon in header: {}", line))),
        }
    }
}

/// Extract the media type of a header value, i.e. the token before any
/// `;`-separated parameters: `multipart/form-data; boundary=x` yields
/// `multipart/form-data`.
pub fn media_type(value: &str) -> &str {
    value.split(';').next().unwrap_or("").trim()
}

/// Extract a `;`-separated parameter from a structured header value,
/// stripping optional double quotes: `form-data; name="schema"` with
/// parameter `name` yields `schema`.
pub fn header_param<'a>(value: &'a str, param: &str) -> Option<&'a str> {
    for part in value.split(';').skip(1) {
        let part = part.trim();
        if let Some(eq) = part.find('=') {
            if part[..eq].trim().eq_ignore_ascii_case(param) {
                let v = part[eq + 1..].trim();
                return Some(v.trim_matches('"'));
            }
        }
    }
    None
}

impl fmt::Display for Headers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (name, value) in &self.headers {
            writeln!(f, "{}: {}", name, value)?;
        }
        Ok(())
    }
}
