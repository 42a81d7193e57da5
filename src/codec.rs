//! Multipart `$batch` encoding and decoding.
//!
//! A request batch is one outer `multipart/mixed` envelope holding a single
//! changeset, which in turn holds one `application/http` part per record:
//!
//! ```text
//! --batch_<id>
//! Content-Type: multipart/mixed; boundary=changeset_<id>
//!
//! --changeset_<id>
//! Content-Type: application/http
//! Content-Transfer-Encoding: binary
//! Content-ID: 1
//!
//! POST A_FixedAsset HTTP/1.1
//! Content-Type: application/json
//! Accept: application/json
//!
//! {"CompanyCode":"1010", ...}
//! --changeset_<id>--
//!
//! --batch_<id>--
//! ```
//!
//! Responses mirror that layout. Decoding flattens nested changeset
//! responses into one ordered list of [`PartOutcome`]s which the caller
//! correlates positionally with the records it sent.

use std::collections::HashMap;

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use uuid::Uuid;

use crate::domain::Record;
use crate::error::Result;

const CRLF: &str = "\r\n";

/// Changeset responses nest one level below the batch; anything deeper is ignored.
const MAX_NESTING: usize = 2;

static STATUS_LINE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^HTTP/\d(?:\.\d)?\s+(\d{3})(?:\s+(.*))?$").expect("valid status-line regex")
});

/// Encoded request body plus the boundaries it was framed with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedBatch {
    pub batch_boundary: String,
    pub changeset_boundary: String,
    pub body: String,
    pub part_count: usize,
}

impl EncodedBatch {
    /// Value for the outer request's `Content-Type` header.
    pub fn content_type(&self) -> String {
        format!("multipart/mixed; boundary={}", self.batch_boundary)
    }
}

/// One decoded response part.
#[derive(Debug, Clone, PartialEq)]
pub struct PartOutcome {
    pub content_id: Option<String>,
    pub status: u16,
    pub status_text: String,
    /// Inner response headers, names lower-cased
    pub headers: HashMap<String, String>,
    /// Parsed JSON body; `None` if empty or unparseable
    pub body: Option<Value>,
    pub raw_body: String,
    /// The body was non-empty but not valid JSON
    pub parse_failed: bool,
}

impl PartOutcome {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status) && !self.parse_failed
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct MultipartCodec;

impl MultipartCodec {
    pub fn new() -> Self {
        Self
    }

    /// Encode records as one changeset of `POST <resource>` requests.
    ///
    /// Record order is preserved and part `n` (1-based) carries `Content-ID: n`.
    pub fn encode<R: Record>(&self, records: &[R], resource: &str) -> Result<EncodedBatch> {
        let batch_boundary = format!("batch_{}", boundary_id());
        let changeset_boundary = format!("changeset_{}", boundary_id());
        let resource = resource.trim_start_matches('/');

        let mut body = String::new();
        push_line(&mut body, &format!("--{batch_boundary}"));
        push_line(
            &mut body,
            &format!("Content-Type: multipart/mixed; boundary={changeset_boundary}"),
        );
        body.push_str(CRLF);

        for (position, record) in records.iter().enumerate() {
            let payload = serde_json::to_string(&record.to_payload()?)?;

            push_line(&mut body, &format!("--{changeset_boundary}"));
            push_line(&mut body, "Content-Type: application/http");
            push_line(&mut body, "Content-Transfer-Encoding: binary");
            push_line(&mut body, &format!("Content-ID: {}", position + 1));
            body.push_str(CRLF);
            push_line(&mut body, &format!("POST {resource} HTTP/1.1"));
            push_line(&mut body, "Content-Type: application/json");
            push_line(&mut body, "Accept: application/json");
            body.push_str(CRLF);
            push_line(&mut body, &payload);
        }

        push_line(&mut body, &format!("--{changeset_boundary}--"));
        body.push_str(CRLF);
        push_line(&mut body, &format!("--{batch_boundary}--"));

        Ok(EncodedBatch {
            batch_boundary,
            changeset_boundary,
            body,
            part_count: records.len(),
        })
    }

    /// Decode a multipart response body into its parts, in encountered order.
    ///
    /// A body that does not contain the boundary at all (e.g., a plain JSON
    /// error document) decodes to zero parts.
    pub fn decode(&self, body: &str, boundary: &str) -> Vec<PartOutcome> {
        let normalized = body.replace(CRLF, "\n");
        let mut parts = Vec::new();
        decode_into(&normalized, boundary, 0, &mut parts);
        parts
    }
}

/// Extract the `boundary` parameter from a `Content-Type` header value.
pub fn boundary_from_content_type(content_type: &str) -> Option<String> {
    content_type.split(';').skip(1).find_map(|param| {
        let (name, value) = param.split_once('=')?;
        if name.trim().eq_ignore_ascii_case("boundary") {
            let value = value.trim().trim_matches('"');
            (!value.is_empty()).then(|| value.to_string())
        } else {
            None
        }
    })
}

fn boundary_id() -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!("{}_{}", chrono::Utc::now().timestamp_millis(), &suffix[..12])
}

fn push_line(buf: &mut String, line: &str) {
    buf.push_str(line);
    buf.push_str(CRLF);
}

fn decode_into(body: &str, boundary: &str, depth: usize, out: &mut Vec<PartOutcome>) {
    let delimiter = format!("--{boundary}");
    if !body.contains(&delimiter) {
        return;
    }

    // The first segment is the preamble
    for segment in body.split(delimiter.as_str()).skip(1) {
        if segment.starts_with("--") {
            // Closing delimiter; the epilogue is ignored
            break;
        }
        // Drop the remainder of the delimiter line
        let segment = match segment.split_once('\n') {
            Some((_, rest)) => rest,
            None => continue,
        };
        if segment.trim().is_empty() {
            continue;
        }

        let (mime_headers, rest) = split_header_block(segment);

        let nested = mime_headers
            .get("content-type")
            .filter(|ct| ct.to_ascii_lowercase().starts_with("multipart/mixed"))
            .and_then(|ct| boundary_from_content_type(ct));
        if let Some(inner) = nested {
            if depth < MAX_NESTING {
                decode_into(rest, &inner, depth + 1, out);
            } else {
                tracing::warn!(boundary = %inner, "Ignoring multipart nested too deeply");
            }
            continue;
        }

        match parse_http_part(&mime_headers, rest) {
            Some(part) => out.push(part),
            None => tracing::debug!(
                segment_len = segment.len(),
                "Skipping multipart segment without a status line"
            ),
        }
    }
}

/// Split `Name: value` lines up to the first blank line from what follows.
///
/// Stops early at the first line that is not a header, so a body that
/// follows its headers without a blank line is still found.
fn split_header_block(text: &str) -> (HashMap<String, String>, &str) {
    let mut headers = HashMap::new();
    let mut offset = 0;

    for line in text.split_inclusive('\n') {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return (headers, &text[offset + line.len()..]);
        }
        match trimmed.split_once(':') {
            Some((name, value)) if is_header_name(name) => {
                headers.insert(name.to_ascii_lowercase(), value.trim().to_string());
            }
            _ => return (headers, &text[offset..]),
        }
        offset += line.len();
    }

    (headers, "")
}

fn is_header_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
}

fn parse_http_part(mime_headers: &HashMap<String, String>, text: &str) -> Option<PartOutcome> {
    let mut offset = 0;
    let mut status_match = None;

    for line in text.split_inclusive('\n') {
        offset += line.len();
        if let Some(caps) = STATUS_LINE.captures(line.trim()) {
            status_match = Some((
                caps.get(1)?.as_str().parse::<u16>().ok()?,
                caps.get(2)
                    .map(|m| m.as_str().trim().to_string())
                    .unwrap_or_default(),
            ));
            break;
        }
    }
    let (status, status_text) = status_match?;

    let after_status = &text[offset..];
    let (headers, body_text) = split_header_block(after_status);
    let raw_body = body_text.trim().to_string();

    let (body, parse_failed) = if raw_body.is_empty() {
        (None, false)
    } else {
        match serde_json::from_str::<Value>(&raw_body) {
            Ok(value) => (Some(value), false),
            Err(e) => {
                tracing::debug!(status, error = %e, "Part body is not valid JSON");
                (None, true)
            }
        }
    };

    let content_id = mime_headers
        .get("content-id")
        .or_else(|| headers.get("content-id"))
        .cloned();

    Some(PartOutcome {
        content_id,
        status,
        status_text,
        headers,
        body,
        raw_body,
        parse_failed,
    })
}
