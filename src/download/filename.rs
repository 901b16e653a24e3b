//! Destination file names for downloads.
//!
//! Names come from the `Content-Disposition` header when the server sends one and
//! from the last URL path segment otherwise. Whatever the source, the result is a
//! single path component, so joining it onto the destination directory can never
//! leave that directory.

use reqwest::header::{CONTENT_DISPOSITION, HeaderMap};
use url::Url;

use super::error::{DownloadError, DownloadResult};

/// Resolves the file name for a response to `url`.
pub fn resolve_file_name(headers: &HeaderMap, url: &Url) -> DownloadResult<String> {
    let from_header = headers
        .get(CONTENT_DISPOSITION)
        .and_then(|v| v.to_str().ok())
        .and_then(parse_content_disposition)
        .and_then(|name| sanitize_file_name(&name));

    if let Some(name) = from_header {
        return Ok(name);
    }

    url_file_name(url).ok_or_else(|| DownloadError::UnresolvableFileName {
        url: url.to_string(),
    })
}

/// Last path segment of `url`, percent-decoded and sanitized.
pub fn url_file_name(url: &Url) -> Option<String> {
    let segment = url.path_segments()?.next_back()?;
    let decoded = urlencoding::decode(segment)
        .map(|d| d.into_owned())
        .unwrap_or_else(|_| segment.to_string());
    sanitize_file_name(&decoded)
}

/// Extracts the `filename*` (RFC 5987) or `filename` parameter.
pub fn parse_content_disposition(header: &str) -> Option<String> {
    let mut plain = None;
    for param in split_params(header) {
        let Some((key, value)) = param.split_once('=') else {
            continue;
        };
        match key.trim().to_ascii_lowercase().as_str() {
            "filename*" => {
                let value = unquote(value);
                // charset'language'percent-encoded
                let encoded = value.rsplit_once('\'').map_or(value.as_str(), |(_, v)| v);
                if let Ok(decoded) = urlencoding::decode(encoded) {
                    if !decoded.is_empty() {
                        return Some(decoded.into_owned());
                    }
                }
            }
            "filename" if plain.is_none() => {
                let value = unquote(value);
                let value = value.trim();
                if !value.is_empty() {
                    plain = Some(value.to_string());
                }
            }
            _ => {}
        }
    }
    plain
}

/// Splits a header into parameters on `;` outside double quotes.
fn split_params(header: &str) -> Vec<&str> {
    let mut params = Vec::new();
    let mut start = 0;
    let mut in_quotes = false;
    let mut chars = header.char_indices().peekable();

    while let Some((i, c)) = chars.next() {
        match c {
            '\\' if in_quotes && chars.peek().is_some_and(|&(_, next)| next == '"') => {
                chars.next();
            }
            '"' => in_quotes = !in_quotes,
            ';' if !in_quotes => {
                params.push(header[start..i].trim());
                start = i + 1;
            }
            _ => {}
        }
    }
    params.push(header[start..].trim());
    params
}

/// Value of a parameter, read up to the closing quote when it is quoted.
///
/// Only `\"` is treated as an escape, other backslashes are kept as sent.
fn unquote(value: &str) -> String {
    let value = value.trim();
    let Some(inner) = value.strip_prefix('"') else {
        return value.to_string();
    };

    let mut out = String::with_capacity(inner.len());
    let mut chars = inner.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '\\' if chars.peek() == Some(&'"') => {
                out.push('"');
                chars.next();
            }
            '"' => break,
            c => out.push(c),
        }
    }
    out
}

/// Reduces `name` to a single safe path component.
///
/// Anything before the last `/` or `\` is dropped and control characters are
/// removed. Returns `None` when nothing usable is left.
pub fn sanitize_file_name(name: &str) -> Option<String> {
    let last = name.rsplit(['/', '\\']).next().unwrap_or(name);
    let cleaned: String = last.chars().filter(|c| !c.is_control()).collect();
    let cleaned = cleaned.trim();

    match cleaned {
        "" | "." | ".." => None,
        _ => Some(cleaned.to_string()),
    }
}
