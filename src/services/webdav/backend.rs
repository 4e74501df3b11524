//! HTTP session state and protocol plumbing for the webdav scheme.

use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use reqwest::{Client, Method, RequestBuilder, StatusCode};
use url::Url;

use super::{WebdavParams, MAX_REDIRECTS};
use crate::capability::Operation;
use crate::error::{ConnectError, Error, ErrorKind, OperationError};
use crate::metadata::Metadata;
use crate::operator::{Backend, Pager, VecPage};

static PROPFIND: Lazy<Method> =
    Lazy::new(|| Method::from_bytes(b"PROPFIND").expect("static method literal"));
static MKCOL: Lazy<Method> =
    Lazy::new(|| Method::from_bytes(b"MKCOL").expect("static method literal"));
static MOVE: Lazy<Method> =
    Lazy::new(|| Method::from_bytes(b"MOVE").expect("static method literal"));
static COPY: Lazy<Method> =
    Lazy::new(|| Method::from_bytes(b"COPY").expect("static method literal"));

const PROPFIND_BODY: &str = r#"<?xml version="1.0" encoding="utf-8" ?><D:propfind xmlns:D="DAV:"><D:prop><D:resourcetype/><D:getcontentlength/><D:getlastmodified/></D:prop></D:propfind>"#;

pub(crate) struct WebdavBackend {
    client: Client,
    base: Url,
    /// Precomputed `Basic` header. `None` only when both credentials were
    /// absent; an empty username or empty password still authenticates.
    auth: Option<String>,
}

impl WebdavBackend {
    pub(crate) fn new(params: WebdavParams) -> Result<Self, ConnectError> {
        let client = Client::builder()
            .danger_accept_invalid_certs(params.insecure_skip_verify)
            .redirect(reqwest::redirect::Policy::limited(MAX_REDIRECTS))
            .timeout(Duration::from_secs(60))
            .connect_timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| ConnectError::Unreachable {
                endpoint: params.endpoint.to_string(),
                reason: format!("HTTP client construction failed: {e}"),
            })?;
        Ok(Self {
            client,
            base: params.endpoint,
            auth: basic_auth_header(params.username.as_deref(), params.password.as_deref()),
        })
    }

    /// Full URL for a normalized backend path, percent-encoding each
    /// segment and preserving the directory marker.
    fn url_for(&self, path: &str) -> String {
        let base = self.base.as_str().trim_end_matches('/');
        let encoded: Vec<String> = path
            .split('/')
            .filter(|s| !s.is_empty())
            .map(|s| urlencoding::encode(s).into_owned())
            .collect();
        if encoded.is_empty() {
            return format!("{base}/");
        }
        let mut url = format!("{base}/{}", encoded.join("/"));
        if path.ends_with('/') {
            url.push('/');
        }
        url
    }

    fn request(&self, method: Method, url: &str) -> RequestBuilder {
        let mut req = self.client.request(method, url);
        if let Some(auth) = &self.auth {
            req = req.header(reqwest::header::AUTHORIZATION, auth.as_str());
        }
        req
    }

    /// Classify a transport-level failure. Redirect exhaustion is a
    /// connect-family error: the transport never settled on an endpoint to
    /// talk to, so no operation outcome exists to report.
    fn translate_transport(&self, op: Operation, key: &str, err: reqwest::Error) -> Error {
        if err.is_redirect() {
            return ConnectError::TooManyRedirects {
                endpoint: self.base.to_string(),
                limit: MAX_REDIRECTS,
            }
            .into();
        }
        let kind = if err.is_timeout() {
            ErrorKind::Timeout
        } else if err.is_connect() {
            ErrorKind::Unavailable
        } else {
            ErrorKind::Other(err.to_string())
        };
        OperationError::new(op, key, kind).into()
    }

    async fn propfind(
        &self,
        op: Operation,
        path: &str,
        depth: &str,
    ) -> Result<Vec<DavEntry>, Error> {
        let resp = self
            .request(PROPFIND.clone(), &self.url_for(path))
            .header("Depth", depth)
            .header(reqwest::header::CONTENT_TYPE, "application/xml")
            .body(PROPFIND_BODY)
            .send()
            .await
            .map_err(|e| self.translate_transport(op, path, e))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(OperationError::new(op, path, status_kind(status)).into());
        }
        let body = resp
            .text()
            .await
            .map_err(|e| self.translate_transport(op, path, e))?;
        parse_multistatus(&body)
            .map_err(|reason| OperationError::new(op, path, ErrorKind::Other(reason)).into())
    }

    /// Turn a response href into the backend key, stripping the endpoint's
    /// own path prefix.
    fn href_to_key(&self, href: &str) -> String {
        let raw_path = if href.starts_with("http://") || href.starts_with("https://") {
            Url::parse(href)
                .map(|u| u.path().to_string())
                .unwrap_or_else(|_| href.to_string())
        } else {
            href.to_string()
        };
        let decoded = urlencoding::decode(&raw_path)
            .map(|c| c.into_owned())
            .unwrap_or(raw_path);
        let base = self.base.path().trim_end_matches('/');
        let rel = decoded.strip_prefix(base).unwrap_or(&decoded);
        if rel.starts_with('/') {
            rel.to_string()
        } else {
            format!("/{rel}")
        }
    }

    /// Create every missing ancestor collection of `path`.
    async fn ensure_parents(&self, op: Operation, path: &str) -> Result<(), Error> {
        let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
        let mut current = String::new();
        for segment in segments.iter().take(segments.len().saturating_sub(1)) {
            current.push('/');
            current.push_str(segment);
            let resp = self
                .request(MKCOL.clone(), &self.url_for(&format!("{current}/")))
                .send()
                .await
                .map_err(|e| self.translate_transport(op, path, e))?;
            let status = resp.status();
            // 405 means the collection already exists.
            if !status.is_success() && status != StatusCode::METHOD_NOT_ALLOWED {
                return Err(OperationError::new(op, path, status_kind(status)).into());
            }
        }
        Ok(())
    }

    async fn move_or_copy(
        &self,
        op: Operation,
        method: Method,
        from: &str,
        to: &str,
    ) -> Result<(), Error> {
        let resp = self
            .request(method, &self.url_for(from))
            .header("Destination", self.url_for(to))
            .header("Overwrite", "F")
            .send()
            .await
            .map_err(|e| self.translate_transport(op, from, e))?;
        let status = resp.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(OperationError::new(op, from, status_kind(status)).into())
        }
    }
}

#[async_trait]
impl Backend for WebdavBackend {
    async fn read(&self, path: &str) -> Result<Bytes, Error> {
        let resp = self
            .request(Method::GET, &self.url_for(path))
            .send()
            .await
            .map_err(|e| self.translate_transport(Operation::Read, path, e))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(OperationError::new(Operation::Read, path, status_kind(status)).into());
        }
        resp.bytes()
            .await
            .map_err(|e| self.translate_transport(Operation::Read, path, e))
    }

    async fn write(&self, path: &str, value: Bytes) -> Result<(), Error> {
        let url = self.url_for(path);
        let resp = self
            .request(Method::PUT, &url)
            .body(value.clone())
            .send()
            .await
            .map_err(|e| self.translate_transport(Operation::Write, path, e))?;
        let mut status = resp.status();
        if status == StatusCode::CONFLICT {
            // Missing ancestor collection; create the chain and retry once.
            self.ensure_parents(Operation::Write, path).await?;
            status = self
                .request(Method::PUT, &url)
                .body(value)
                .send()
                .await
                .map_err(|e| self.translate_transport(Operation::Write, path, e))?
                .status();
        }
        if status.is_success() {
            Ok(())
        } else {
            Err(OperationError::new(Operation::Write, path, status_kind(status)).into())
        }
    }

    async fn delete(&self, path: &str) -> Result<(), Error> {
        let resp = self
            .request(Method::DELETE, &self.url_for(path))
            .send()
            .await
            .map_err(|e| self.translate_transport(Operation::Delete, path, e))?;
        let status = resp.status();
        // Absent keys delete successfully: delete is idempotent.
        if status.is_success() || status == StatusCode::NOT_FOUND {
            Ok(())
        } else {
            Err(OperationError::new(Operation::Delete, path, status_kind(status)).into())
        }
    }

    async fn stat(&self, path: &str) -> Result<Metadata, Error> {
        let entries = self.propfind(Operation::Stat, path, "0").await?;
        let entry = entries.into_iter().next().ok_or_else(|| {
            Error::from(OperationError::new(
                Operation::Stat,
                path,
                ErrorKind::NotFound,
            ))
        })?;
        let mut meta = if entry.is_dir {
            Metadata::dir()
        } else {
            Metadata::file(entry.content_length)
        };
        meta.last_modified = entry.last_modified;
        Ok(meta)
    }

    async fn list(&self, prefix: &str) -> Result<Pager, Error> {
        let dir = if prefix.ends_with('/') {
            prefix.to_string()
        } else {
            format!("{prefix}/")
        };
        let entries = self.propfind(Operation::List, &dir, "1").await?;
        let mut keys = Vec::with_capacity(entries.len());
        for entry in entries {
            let mut key = self.href_to_key(&entry.href);
            if entry.is_dir && !key.ends_with('/') {
                key.push('/');
            }
            // The listed collection reports itself first; skip it.
            if key.trim_end_matches('/') == dir.trim_end_matches('/') {
                continue;
            }
            keys.push(key);
        }
        Ok(Box::new(VecPage(Some(keys))))
    }

    async fn rename(&self, from: &str, to: &str) -> Result<(), Error> {
        self.move_or_copy(Operation::Rename, MOVE.clone(), from, to)
            .await
    }

    async fn copy(&self, from: &str, to: &str) -> Result<(), Error> {
        self.move_or_copy(Operation::Copy, COPY.clone(), from, to)
            .await
    }
}

fn basic_auth_header(username: Option<&str>, password: Option<&str>) -> Option<String> {
    if username.is_none() && password.is_none() {
        return None;
    }
    let credentials = format!(
        "{}:{}",
        username.unwrap_or_default(),
        password.unwrap_or_default()
    );
    let encoded = base64::engine::general_purpose::STANDARD.encode(credentials.as_bytes());
    Some(format!("Basic {encoded}"))
}

fn status_kind(status: StatusCode) -> ErrorKind {
    match status {
        StatusCode::NOT_FOUND => ErrorKind::NotFound,
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => ErrorKind::PermissionDenied,
        StatusCode::PRECONDITION_FAILED => ErrorKind::AlreadyExists,
        StatusCode::LOCKED | StatusCode::TOO_MANY_REQUESTS => ErrorKind::Unavailable,
        s if s.is_server_error() => ErrorKind::Unavailable,
        s => ErrorKind::Other(format!("unexpected HTTP status {s}")),
    }
}

/// One `<D:response>` of a multistatus body.
#[derive(Debug, Clone, PartialEq)]
struct DavEntry {
    href: String,
    is_dir: bool,
    content_length: u64,
    last_modified: Option<DateTime<Utc>>,
}

/// Parse a PROPFIND multistatus response, tolerating arbitrary namespace
/// prefixes and servers that report collections via either an empty or a
/// nested `resourcetype`.
fn parse_multistatus(xml: &str) -> Result<Vec<DavEntry>, String> {
    use quick_xml::events::Event;
    use quick_xml::Reader;

    let mut reader = Reader::from_str(xml);
    reader.trim_text(true);

    let mut entries = Vec::new();
    let mut href = String::new();
    let mut is_dir = false;
    let mut content_length: u64 = 0;
    let mut last_modified: Option<DateTime<Utc>> = None;
    let mut in_href = false;
    let mut in_length = false;
    let mut in_modified = false;

    loop {
        match reader.read_event() {
            Ok(Event::Start(ref e)) => {
                let local = e.local_name();
                match std::str::from_utf8(local.as_ref()).unwrap_or("") {
                    "response" => {
                        href.clear();
                        is_dir = false;
                        content_length = 0;
                        last_modified = None;
                    }
                    "href" => in_href = true,
                    "getcontentlength" => in_length = true,
                    "getlastmodified" => in_modified = true,
                    "collection" => is_dir = true,
                    _ => {}
                }
            }
            Ok(Event::Empty(ref e)) => {
                let local = e.local_name();
                if std::str::from_utf8(local.as_ref()).unwrap_or("") == "collection" {
                    is_dir = true;
                }
            }
            Ok(Event::Text(e)) => {
                let text = e.unescape().unwrap_or_default().to_string();
                if in_href {
                    href = text;
                } else if in_length {
                    content_length = text.parse().unwrap_or(0);
                } else if in_modified {
                    last_modified = DateTime::parse_from_rfc2822(&text)
                        .ok()
                        .map(|t| t.with_timezone(&Utc));
                }
            }
            Ok(Event::End(ref e)) => {
                let local = e.local_name();
                match std::str::from_utf8(local.as_ref()).unwrap_or("") {
                    "response" => {
                        if !href.is_empty() {
                            entries.push(DavEntry {
                                href: href.clone(),
                                is_dir,
                                content_length,
                                last_modified,
                            });
                        }
                    }
                    "href" => in_href = false,
                    "getcontentlength" => in_length = false,
                    "getlastmodified" => in_modified = false,
                    _ => {}
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(format!("malformed multistatus body: {e}")),
            _ => {}
        }
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigMap;
    use crate::services::webdav;

    const SAMPLE: &str = r#"<?xml version="1.0"?>
<D:multistatus xmlns:D="DAV:">
  <D:response>
    <D:href>/remote.php/dav/files/</D:href>
    <D:propstat><D:prop><D:resourcetype><D:collection/></D:resourcetype></D:prop></D:propstat>
  </D:response>
  <D:response>
    <D:href>/remote.php/dav/files/report%20final.txt</D:href>
    <D:propstat><D:prop>
      <D:resourcetype/>
      <D:getcontentlength>13</D:getcontentlength>
      <D:getlastmodified>Tue, 01 Jul 2025 10:00:00 GMT</D:getlastmodified>
    </D:prop></D:propstat>
  </D:response>
  <D:response>
    <D:href>/remote.php/dav/files/archive/</D:href>
    <D:propstat><D:prop><D:resourcetype><D:collection/></D:resourcetype></D:prop></D:propstat>
  </D:response>
</D:multistatus>"#;

    fn backend() -> WebdavBackend {
        let map: ConfigMap = [
            ("endpoint", "https://dav.example.com/remote.php/dav"),
            ("username", "foo"),
        ]
        .into_iter()
        .collect();
        WebdavBackend::new(webdav::validate(&map).unwrap()).unwrap()
    }

    #[test]
    fn multistatus_parsing() {
        let entries = parse_multistatus(SAMPLE).unwrap();
        assert_eq!(entries.len(), 3);
        assert!(entries[0].is_dir);
        assert!(!entries[1].is_dir);
        assert_eq!(entries[1].content_length, 13);
        assert!(entries[1].last_modified.is_some());
        assert_eq!(entries[1].href, "/remote.php/dav/files/report%20final.txt");
        assert!(entries[2].is_dir);
    }

    #[test]
    fn malformed_xml_is_an_error() {
        assert!(parse_multistatus("<D:multistatus><unterminated").is_err());
    }

    #[test]
    fn href_is_decoded_and_stripped_to_a_key() {
        let b = backend();
        assert_eq!(
            b.href_to_key("/remote.php/dav/files/report%20final.txt"),
            "/files/report final.txt"
        );
        assert_eq!(
            b.href_to_key("https://dav.example.com/remote.php/dav/files/a"),
            "/files/a"
        );
    }

    #[test]
    fn urls_are_segment_encoded() {
        let b = backend();
        assert_eq!(
            b.url_for("/files/report final.txt"),
            "https://dav.example.com/remote.php/dav/files/report%20final.txt"
        );
        assert_eq!(b.url_for("/"), "https://dav.example.com/remote.php/dav/");
        assert_eq!(
            b.url_for("/archive/"),
            "https://dav.example.com/remote.php/dav/archive/"
        );
    }

    #[test]
    fn auth_header_distinguishes_the_credential_shapes() {
        assert_eq!(basic_auth_header(None, None), None);
        // username-only, empty-password and anonymous are three cases.
        let user_only = basic_auth_header(Some("foo"), None).unwrap();
        let empty_pass = basic_auth_header(Some("foo"), Some("")).unwrap();
        let with_pass = basic_auth_header(Some("foo"), Some("s3cret")).unwrap();
        assert_eq!(user_only, empty_pass); // identical on the wire, by protocol
        assert_ne!(user_only, with_pass);
        // empty-username with a password is also valid.
        assert!(basic_auth_header(Some(""), Some("pw")).is_some());
    }
}
