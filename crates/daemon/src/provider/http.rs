use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use common::provider::{ContentSource, NodeId, ProviderError, RemoteEntry, RemoteTreeProvider};
use parking_lot::RwLock;
use reqwest::header::{HeaderMap, ACCEPT_RANGES, CONTENT_LENGTH, COOKIE, RANGE, RETRY_AFTER};
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use url::Url;

use super::wire::TreeResponse;

/// Provider talking to the ILIAS gateway over HTTP
///
/// The session is whatever the cookie file holds. It is read lazily and
/// forgotten whenever the gateway rejects it, so a refreshed cookie file is
/// picked up without restarting the mount.
pub struct HttpTreeProvider {
    base_url: Url,
    client: Client,
    session: Arc<Session>,
    request_timeout: Duration,
}

impl HttpTreeProvider {
    pub fn new(
        base_url: Url,
        cookie_file: impl Into<PathBuf>,
        request_timeout: Duration,
    ) -> Result<Self, ProviderError> {
        let client = Client::builder()
            .connect_timeout(request_timeout)
            .user_agent(concat!("ilias-fuse/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|err| ProviderError::Network(err.to_string()))?;

        Ok(Self {
            base_url,
            client,
            session: Arc::new(Session::new(cookie_file.into())),
            request_timeout,
        })
    }

    /// `{base}api/v0/{route}/{id}`, with the id as one encoded segment
    fn endpoint(&self, route: &str, id: &NodeId) -> Result<Url, ProviderError> {
        if matches!(id.as_str(), "" | "." | "..") {
            return Err(ProviderError::NotFound(id.clone()));
        }
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|()| ProviderError::Network(format!("base url {} cannot carry a path", self.base_url)))?
            .pop_if_empty()
            .extend(["api", "v0", route, id.as_str()]);
        Ok(url)
    }

    async fn request(&self, method: Method, url: Url) -> Result<RequestBuilder, ProviderError> {
        let mut builder = self.client.request(method, url);
        if let Some(cookie) = self.session.cookie().await? {
            builder = builder.header(COOKIE, cookie);
        }
        Ok(builder)
    }

    async fn send(&self, builder: RequestBuilder, id: &NodeId) -> Result<Response, ProviderError> {
        let response = builder
            .send()
            .await
            .map_err(|err| transport_error(err, self.request_timeout))?;
        check_status(response, id, &self.session)
    }
}

/// Cookie read from the cookie file, shared with open content sources
#[derive(Debug)]
struct Session {
    cookie_file: PathBuf,
    cookie: RwLock<Option<String>>,
}

impl Session {
    fn new(cookie_file: PathBuf) -> Self {
        Self {
            cookie_file,
            cookie: RwLock::new(None),
        }
    }

    fn is_loaded(&self) -> bool {
        self.cookie.read().is_some()
    }

    async fn cookie(&self) -> Result<Option<String>, ProviderError> {
        let loaded = self.cookie.read().clone();
        if loaded.is_some() {
            return Ok(loaded);
        }

        let cookie = match tokio::fs::read_to_string(&self.cookie_file).await {
            Ok(raw) => raw.trim().to_string(),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                tracing::warn!(path = %self.cookie_file.display(), "cookie file missing, sending no session");
                return Ok(None);
            }
            Err(err) => {
                return Err(ProviderError::Auth(format!(
                    "cannot read cookie file {}: {}",
                    self.cookie_file.display(),
                    err
                )))
            }
        };
        if cookie.is_empty() {
            return Ok(None);
        }

        tracing::debug!(path = %self.cookie_file.display(), "session loaded");
        *self.cookie.write() = Some(cookie.clone());
        Ok(Some(cookie))
    }

    fn invalidate(&self) {
        if self.cookie.write().take().is_some() {
            tracing::info!("session invalidated, cookie file will be re-read");
        }
    }
}

/// Pass successful (and 416) responses through, map the rest to errors
///
/// A rejected session is forgotten before the error is returned.
fn check_status(response: Response, id: &NodeId, session: &Session) -> Result<Response, ProviderError> {
    let status = response.status();
    if status.is_success() || status == StatusCode::RANGE_NOT_SATISFIABLE {
        return Ok(response);
    }

    let err = status_error(status, response.headers(), id);
    if let ProviderError::Auth(_) = err {
        session.invalidate();
    }
    tracing::debug!(node = %id, %status, error = %err, "gateway request failed");
    Err(err)
}

impl std::fmt::Debug for HttpTreeProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpTreeProvider")
            .field("base_url", &self.base_url.as_str())
            .field("cookie_file", &self.session.cookie_file)
            .field("session_loaded", &self.session.is_loaded())
            .finish()
    }
}

#[async_trait]
impl RemoteTreeProvider for HttpTreeProvider {
    async fn list_children(&self, id: &NodeId) -> Result<Vec<RemoteEntry>, ProviderError> {
        let url = self.endpoint("tree", id)?;
        let builder = self
            .request(Method::GET, url)
            .await?
            .timeout(self.request_timeout);
        let response = self.send(builder, id).await?;

        let body: TreeResponse = response
            .json()
            .await
            .map_err(|err| transport_error(err, self.request_timeout))?;
        body.children.into_iter().map(RemoteEntry::try_from).collect()
    }

    async fn open_content(&self, id: &NodeId) -> Result<Box<dyn ContentSource>, ProviderError> {
        let url = self.endpoint("content", id)?;
        let builder = self.request(Method::GET, url.clone()).await?;
        let response = self.send(builder, id).await?;

        let ranged = response
            .headers()
            .get(ACCEPT_RANGES)
            .and_then(|value| value.to_str().ok())
            .map(|value| value.eq_ignore_ascii_case("bytes"))
            .unwrap_or(false);

        if ranged {
            // Ranges are fetched on demand; the full body is never read
            drop(response);
            return Ok(Box::new(RangedContent {
                client: self.client.clone(),
                url,
                id: id.clone(),
                session: self.session.clone(),
                request_timeout: self.request_timeout,
                full_body: None,
            }));
        }

        Ok(Box::new(StreamedContent {
            response,
            request_timeout: self.request_timeout,
        }))
    }

    async fn content_length(&self, id: &NodeId) -> Result<Option<u64>, ProviderError> {
        let url = self.endpoint("content", id)?;
        let builder = self
            .request(Method::HEAD, url)
            .await?
            .timeout(self.request_timeout);
        let response = self.send(builder, id).await?;

        // HEAD bodies are empty, so the header is the only source
        Ok(response
            .headers()
            .get(CONTENT_LENGTH)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.parse().ok()))
    }

    fn invalidate_session(&self) {
        self.session.invalidate();
    }
}

/// Whole-body download read chunk by chunk
struct StreamedContent {
    response: Response,
    request_timeout: Duration,
}

#[async_trait]
impl ContentSource for StreamedContent {
    async fn next_chunk(&mut self) -> Result<Option<Bytes>, ProviderError> {
        self.response
            .chunk()
            .await
            .map_err(|err| transport_error(err, self.request_timeout))
    }
}

/// Content served through `Range` requests
struct RangedContent {
    client: Client,
    url: Url,
    id: NodeId,
    session: Arc<Session>,
    request_timeout: Duration,
    /// Whole body, kept once the gateway answered a range with all of it
    full_body: Option<Bytes>,
}

#[async_trait]
impl ContentSource for RangedContent {
    async fn next_chunk(&mut self) -> Result<Option<Bytes>, ProviderError> {
        Err(ProviderError::Unsupported("sequential reads on a ranged source"))
    }

    fn supports_range(&self) -> bool {
        true
    }

    async fn read_range(&mut self, offset: u64, len: u64) -> Result<Bytes, ProviderError> {
        if len == 0 {
            return Ok(Bytes::new());
        }
        if let Some(body) = &self.full_body {
            return Ok(slice_at(body, offset, len));
        }

        let last = offset.saturating_add(len - 1);
        let mut builder = self
            .client
            .get(self.url.clone())
            .header(RANGE, format!("bytes={}-{}", offset, last))
            .timeout(self.request_timeout);
        if let Some(cookie) = self.session.cookie().await? {
            builder = builder.header(COOKIE, cookie);
        }

        let response = builder
            .send()
            .await
            .map_err(|err| transport_error(err, self.request_timeout))?;
        let response = check_status(response, &self.id, &self.session)?;
        match response.status() {
            StatusCode::RANGE_NOT_SATISFIABLE => Ok(Bytes::new()),
            StatusCode::PARTIAL_CONTENT => response
                .bytes()
                .await
                .map_err(|err| transport_error(err, self.request_timeout)),
            status => {
                // Range ignored; keep the body so later reads stay local
                tracing::warn!(node = %self.id, %status, "gateway ignored range request, keeping full body");
                let body = response
                    .bytes()
                    .await
                    .map_err(|err| transport_error(err, self.request_timeout))?;
                let window = slice_at(&body, offset, len);
                self.full_body = Some(body);
                Ok(window)
            }
        }
    }
}

fn slice_at(body: &Bytes, offset: u64, len: u64) -> Bytes {
    let start = offset.min(body.len() as u64) as usize;
    let end = offset.saturating_add(len).min(body.len() as u64) as usize;
    body.slice(start..end)
}

fn status_error(status: StatusCode, headers: &HeaderMap, id: &NodeId) -> ProviderError {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            ProviderError::Auth(format!("gateway answered {} for {}", status, id))
        }
        StatusCode::NOT_FOUND => ProviderError::NotFound(id.clone()),
        StatusCode::TOO_MANY_REQUESTS => ProviderError::RateLimited {
            retry_after: retry_after(headers),
        },
        status => ProviderError::Network(format!("gateway answered {} for {}", status, id)),
    }
}

/// `Retry-After` in its delay-seconds form
fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

fn transport_error(err: reqwest::Error, timeout: Duration) -> ProviderError {
    if err.is_timeout() {
        ProviderError::Timeout(timeout)
    } else {
        ProviderError::Network(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    #[test]
    fn test_status_mapping() {
        let id = NodeId::new("file_1");
        let empty = HeaderMap::new();

        assert!(matches!(
            status_error(StatusCode::UNAUTHORIZED, &empty, &id),
            ProviderError::Auth(_)
        ));
        assert!(matches!(
            status_error(StatusCode::FORBIDDEN, &empty, &id),
            ProviderError::Auth(_)
        ));
        assert_eq!(
            status_error(StatusCode::NOT_FOUND, &empty, &id),
            ProviderError::NotFound(id.clone())
        );
        assert!(matches!(
            status_error(StatusCode::BAD_GATEWAY, &empty, &id),
            ProviderError::Network(_)
        ));

        let mut headers = HeaderMap::new();
        headers.insert(RETRY_AFTER, HeaderValue::from_static("120"));
        assert_eq!(
            status_error(StatusCode::TOO_MANY_REQUESTS, &headers, &id),
            ProviderError::RateLimited {
                retry_after: Some(Duration::from_secs(120))
            }
        );
    }

    #[test]
    fn test_retry_after_date_form_is_ignored() {
        let mut headers = HeaderMap::new();
        headers.insert(
            RETRY_AFTER,
            HeaderValue::from_static("Wed, 21 Oct 2015 07:28:00 GMT"),
        );
        assert_eq!(retry_after(&headers), None);
    }

    #[test]
    fn test_endpoints_extend_base_path() {
        let provider = HttpTreeProvider::new(
            Url::parse("https://gateway.example/ilias/").unwrap(),
            "cookies.txt",
            Duration::from_secs(5),
        )
        .unwrap();
        let url = provider.endpoint("tree", &NodeId::course(7)).unwrap();
        assert_eq!(url.as_str(), "https://gateway.example/ilias/api/v0/tree/crs_7");
    }

    #[test]
    fn test_opaque_ids_stay_one_segment() {
        let provider = HttpTreeProvider::new(
            Url::parse("https://gateway.example/").unwrap(),
            "cookies.txt",
            Duration::from_secs(5),
        )
        .unwrap();

        let url = provider.endpoint("tree", &NodeId::new("fold?x=1")).unwrap();
        assert_eq!(url.path(), "/api/v0/tree/fold%3Fx=1");
        assert_eq!(url.query(), None);

        let url = provider.endpoint("content", &NodeId::new("a#b")).unwrap();
        assert_eq!(url.path(), "/api/v0/content/a%23b");
        assert_eq!(url.fragment(), None);

        let url = provider.endpoint("tree", &NodeId::new("../x")).unwrap();
        assert_eq!(url.path(), "/api/v0/tree/..%2Fx");

        assert_eq!(
            provider.endpoint("tree", &NodeId::new("..")),
            Err(ProviderError::NotFound(NodeId::new("..")))
        );
    }

    #[test]
    fn test_slice_at_clamps_to_body() {
        let body = Bytes::from_static(b"0123456789");
        assert_eq!(&slice_at(&body, 2, 3)[..], b"234");
        assert_eq!(&slice_at(&body, 8, 10)[..], b"89");
        assert!(slice_at(&body, 20, 5).is_empty());
    }
}
