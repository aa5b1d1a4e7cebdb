//! HAR 1.2 log schema and the converter that turns a recording into a
//! runnable load-test script.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::Write;
use std::fs;
use std::path::Path;

/// Top level object of a HAR log.
#[derive(Debug, Serialize, Deserialize)]
pub struct Har {
    pub log: Log,
}

/// The HTTP request and response log.
#[derive(Debug, Serialize, Deserialize)]
pub struct Log {
    pub creator: Creator,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub browser: Option<Browser>,
    pub version: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub comment: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pages: Vec<Page>,
    pub entries: Vec<Entry>,
}

/// The program that generated the log.
#[derive(Debug, Serialize, Deserialize)]
pub struct Creator {
    pub name: String,
    pub version: String,
}

/// The browser that created the log, when one did.
#[derive(Debug, Serialize, Deserialize)]
pub struct Browser {
    pub name: String,
    pub version: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub comment: String,
}

/// One exported web page; entries reference their parent page by id.
#[derive(Debug, Serialize, Deserialize)]
pub struct Page {
    #[serde(rename = "startedDateTime")]
    pub started_date_time: DateTime<Utc>,
    pub id: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub comment: String,
}

/// One logged request/response exchange.
#[derive(Debug, Serialize, Deserialize)]
pub struct Entry {
    #[serde(rename = "startedDateTime")]
    pub started_date_time: DateTime<Utc>,
    /// Required by the schema even though no fields are supported.
    pub cache: Cache,
    pub timings: Timings,
    pub request: Request,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response: Option<Response>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub pageref: String,
    #[serde(rename = "_id", default, skip_serializing_if = "String::is_empty")]
    pub id: String,
    #[serde(default)]
    pub time: f32,
}

/// Cache info carries no supported fields but the object must exist.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct Cache {}

/// Request-response phases, all in milliseconds.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct Timings {
    pub send: f32,
    pub wait: f32,
    pub receive: f32,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Request {
    #[serde(rename = "postData", skip_serializing_if = "Option::is_none")]
    pub post_data: Option<PostData>,
    pub url: String,
    #[serde(rename = "httpVersion", default)]
    pub http_version: String,
    #[serde(default)]
    pub comment: String,
    pub method: String,
    #[serde(default)]
    pub headers: Vec<Header>,
    #[serde(rename = "queryString", default)]
    pub query_string: Vec<QueryString>,
    #[serde(default)]
    pub cookies: Vec<Cookie>,
    #[serde(rename = "headersSize", default)]
    pub headers_size: i64,
    #[serde(rename = "bodySize", default)]
    pub body_size: i64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Response {
    pub content: Content,
    #[serde(rename = "redirectURL", default)]
    pub redirect_url: String,
    #[serde(rename = "statusText", default)]
    pub status_text: String,
    #[serde(rename = "httpVersion", default)]
    pub http_version: String,
    #[serde(default)]
    pub cookies: Vec<Cookie>,
    #[serde(default)]
    pub headers: Vec<Header>,
    pub status: i32,
    #[serde(rename = "headersSize", default)]
    pub headers_size: i64,
    #[serde(rename = "bodySize", default)]
    pub body_size: i64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Cookie {
    pub name: String,
    pub value: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub path: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub domain: String,
    #[serde(rename = "expires", default, skip_serializing_if = "String::is_empty")]
    pub expires: String,
    #[serde(rename = "httpOnly", default, skip_serializing_if = "std::ops::Not::not")]
    pub http_only: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub secure: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Header {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct QueryString {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PostData {
    #[serde(rename = "mimeType", default)]
    pub mime_type: String,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub params: Vec<Param>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Param {
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub value: String,
    #[serde(rename = "fileName", default, skip_serializing_if = "String::is_empty")]
    pub file_name: String,
    #[serde(rename = "contentType", default, skip_serializing_if = "String::is_empty")]
    pub content_type: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Content {
    #[serde(rename = "mimeType", default)]
    pub mime_type: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub text: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub encoding: String,
    #[serde(default)]
    pub size: i64,
}

pub fn convert_to_script<P: AsRef<Path>>(input: P) -> Result<String> {
    let content = fs::read_to_string(input)?;
    convert_from_string(&content)
}

/// Turns a HAR recording into a script replaying its requests in order.
pub fn convert_from_string(har_content: &str) -> Result<String> {
    let har: Har = serde_json::from_str(har_content)?;

    let mut js = String::new();
    writeln!(&mut js, "export const options = {{")?;
    writeln!(&mut js, "    vus: 1,")?;
    writeln!(&mut js, "    duration: '10s'")?;
    writeln!(&mut js, "}};")?;
    writeln!(&mut js)?;
    writeln!(&mut js, "export default function() {{")?;

    for entry in &har.log.entries {
        let req = &entry.request;
        writeln!(&mut js, "    http.request({{")?;
        writeln!(&mut js, "        method: '{}',", req.method)?;
        writeln!(&mut js, "        url: '{}',", req.url)?;

        if !req.headers.is_empty() {
            writeln!(&mut js, "        headers: {{")?;
            for header in &req.headers {
                let val = header.value.replace('\'', "\\'");
                writeln!(&mut js, "            '{}': '{}',", header.name, val)?;
            }
            writeln!(&mut js, "        }},")?;
        }

        if let Some(post) = &req.post_data {
            if !post.text.is_empty() {
                let escaped = post.text.replace('\'', "\\'");
                writeln!(&mut js, "        body: '{}',", escaped)?;
            }
        }

        writeln!(&mut js, "    }});")?;
        writeln!(&mut js, "    sleep(0.1);")?;
    }

    writeln!(&mut js, "}}")?;
    Ok(js)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry_json(request: &str) -> String {
        format!(
            r#"{{
                "log": {{
                    "version": "1.2",
                    "creator": {{"name": "recorder", "version": "0.4"}},
                    "entries": [{{
                        "startedDateTime": "2021-07-24T19:20:30.450Z",
                        "cache": {{}},
                        "timings": {{"send": 1.0, "wait": 38.5, "receive": 2.5}},
                        "request": {request}
                    }}]
                }}
            }}"#
        )
    }

    #[test]
    fn test_strict_schema_roundtrip() {
        let raw = entry_json(
            r#"{
                "method": "GET",
                "url": "https://example.com/api",
                "httpVersion": "HTTP/1.1",
                "headers": [{"name": "Accept", "value": "application/json"}],
                "queryString": [{"name": "q", "value": "1"}],
                "cookies": [],
                "headersSize": 120,
                "bodySize": 0
            }"#,
        );
        let har: Har = serde_json::from_str(&raw).unwrap();
        assert_eq!(har.log.version, "1.2");
        let entry = &har.log.entries[0];
        assert_eq!(entry.timings.wait, 38.5);
        assert_eq!(entry.request.query_string[0].name, "q");
        assert!(entry.response.is_none());

        let serialized = serde_json::to_string(&har).unwrap();
        // The cache object must survive as a mandatory empty object.
        assert!(serialized.contains("\"cache\":{}"));
        let back: Har = serde_json::from_str(&serialized).unwrap();
        assert_eq!(back.log.entries[0].request.url, "https://example.com/api");
    }

    #[test]
    fn test_missing_cache_is_rejected() {
        let raw = r#"{
            "log": {
                "version": "1.2",
                "creator": {"name": "r", "version": "1"},
                "entries": [{
                    "startedDateTime": "2021-07-24T19:20:30.450Z",
                    "timings": {"send": 0, "wait": 0, "receive": 0},
                    "request": {"method": "GET", "url": "https://a", "headers": []}
                }]
            }
        }"#;
        assert!(serde_json::from_str::<Har>(raw).is_err());
    }

    #[test]
    fn test_basic_conversion() {
        let raw = entry_json(r#"{"method": "GET", "url": "https://example.com/api", "headers": []}"#);
        let result = convert_from_string(&raw).unwrap();
        assert!(result.contains("method: 'GET'"));
        assert!(result.contains("url: 'https://example.com/api'"));
        assert!(result.contains("export const options"));
        assert!(result.contains("export default function()"));
    }

    #[test]
    fn test_conversion_with_post_data() {
        let raw = entry_json(
            r#"{
                "method": "POST",
                "url": "https://example.com/api",
                "headers": [{"name": "Content-Type", "value": "application/json"}],
                "postData": {"mimeType": "application/json", "text": "{\"key\": \"value\"}"}
            }"#,
        );
        let result = convert_from_string(&raw).unwrap();
        assert!(result.contains("method: 'POST'"));
        assert!(result.contains("body:"));
        assert!(result.contains("'Content-Type': 'application/json'"));
    }

    #[test]
    fn test_conversion_empty_entries() {
        let raw = r#"{
            "log": {
                "version": "1.2",
                "creator": {"name": "r", "version": "1"},
                "entries": []
            }
        }"#;
        let result = convert_from_string(raw).unwrap();
        assert!(!result.contains("http.request"));
    }

    #[test]
    fn test_conversion_invalid_json() {
        assert!(convert_from_string("not valid json").is_err());
    }
}
