use std::io::{BufRead, BufReader};
use std::time::Duration;

use parking_lot::RwLock;
use reqwest::blocking::{Client as HttpClient, RequestBuilder, Response};
use reqwest::header::{ACCEPT, AUTHORIZATION, USER_AGENT};
use reqwest::Method;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, info};
use url::Url;

use crate::cancel::CancelToken;
use crate::error::StoreError;
use crate::feed::{EventParser, FeedEvent};
use crate::model::{DocumentRef, PatchOp};
use crate::store::{DocumentStore, LiveFeed, Session};

pub const DEFAULT_BASE_URL: &str = "http://localhost:3318";

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub base_url: String,
    pub database_path: String,
    pub auth_path: String,
    pub user_agent: String,
    pub timeout: Duration,
    pub http_client: Option<HttpClient>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            database_path: "/v1/owlchat".to_string(),
            auth_path: "/auth".to_string(),
            user_agent: format!("owlchat/{}", crate::VERSION),
            timeout: Duration::from_secs(20),
            http_client: None,
        }
    }
}

#[derive(Debug, Deserialize)]
struct PatchResponse {
    #[serde(default)]
    uri: String,
    #[serde(rename = "patchFailed", default)]
    patch_failed: bool,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    token: String,
}

/// Blocking HTTP client for an OwlDB database.
pub struct Client {
    http: HttpClient,
    feed_http: HttpClient,
    user_agent: String,
    base_url: Url,
    database_path: String,
    auth_path: String,
    token: RwLock<Option<String>>,
}

impl Client {
    pub fn new(config: ClientConfig) -> Result<Self, StoreError> {
        if config.user_agent.trim().is_empty() {
            return Err(StoreError::Transport("owldb client user agent required".into()));
        }
        let base_url = Url::parse(&config.base_url)?;
        let http = match config.http_client {
            Some(client) => client,
            None => HttpClient::builder().timeout(config.timeout).build()?,
        };
        // Live feeds stay open until cancelled, so they get no overall timeout.
        let feed_http = HttpClient::builder()
            .timeout(None::<Duration>)
            .connect_timeout(config.timeout)
            .build()?;

        Ok(Client {
            http,
            feed_http,
            user_agent: config.user_agent,
            base_url,
            database_path: normalize_prefix(&config.database_path),
            auth_path: normalize_prefix(&config.auth_path),
            token: RwLock::new(None),
        })
    }

    pub fn is_authenticated(&self) -> bool {
        self.token.read().is_some()
    }

    fn document_url(&self, path: &str, mode: Option<&str>) -> Result<Url, StoreError> {
        let mut url = self
            .base_url
            .join(&format!("{}{}", self.database_path, path))?;
        if let Some(mode) = mode {
            url.query_pairs_mut().append_pair("mode", mode);
        }
        Ok(url)
    }

    fn auth_url(&self) -> Result<Url, StoreError> {
        Ok(self.base_url.join(&self.auth_path)?)
    }

    fn builder(&self, http: &HttpClient, method: Method, url: Url) -> RequestBuilder {
        let mut req = http
            .request(method, url)
            .header(USER_AGENT, self.user_agent.clone());
        if let Some(token) = self.token.read().as_deref() {
            req = req.header(AUTHORIZATION, format!("Bearer {token}"));
        }
        req
    }

    fn send(
        &self,
        method: Method,
        url: Url,
        path: &str,
        body: Option<&Value>,
    ) -> Result<Response, StoreError> {
        let mut req = self
            .builder(&self.http, method.clone(), url)
            .header(ACCEPT, "application/json");
        if let Some(body) = body {
            req = req.json(body);
        }
        let resp = req.send()?;
        check_status(resp, &method, path)
    }
}

fn normalize_prefix(prefix: &str) -> String {
    let trimmed = prefix.trim().trim_end_matches('/');
    if trimmed.is_empty() {
        String::new()
    } else if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{trimmed}")
    }
}

fn check_status(resp: Response, method: &Method, path: &str) -> Result<Response, StoreError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().unwrap_or_default();
    Err(classify(status.as_u16(), method, path, body.trim()))
}

fn classify(status: u16, method: &Method, path: &str, body: &str) -> StoreError {
    let path = path.to_string();
    match status {
        400 | 409 | 412 if *method != Method::GET && *method != Method::DELETE => {
            StoreError::Conflict { path }
        }
        401 | 403 => StoreError::Unauthorized,
        404 => StoreError::NotFound { path },
        _ => StoreError::Transport(format!("owldb: {method} {path} returned {status}: {body}")),
    }
}

impl DocumentStore for Client {
    fn fetch_collection(&self, path: &str, cancel: &CancelToken) -> Result<Vec<Value>, StoreError> {
        if cancel.is_cancelled() {
            return Err(StoreError::Stale);
        }
        let url = self.document_url(path, None)?;
        let resp = self.send(Method::GET, url, path, None)?;
        if cancel.is_cancelled() {
            // Dropping the response closes the connection before the body is read.
            return Err(StoreError::Stale);
        }
        Ok(resp.json()?)
    }

    fn fetch_document(&self, path: &str) -> Result<Value, StoreError> {
        let url = self.document_url(path, None)?;
        Ok(self.send(Method::GET, url, path, None)?.json()?)
    }

    fn create_document(&self, path: &str, body: &Value) -> Result<DocumentRef, StoreError> {
        let url = self.document_url(path, Some("nooverwrite"))?;
        Ok(self.send(Method::PUT, url, path, Some(body))?.json()?)
    }

    fn create_collection(&self, path: &str) -> Result<DocumentRef, StoreError> {
        let url = self.document_url(path, None)?;
        Ok(self.send(Method::PUT, url, path, None)?.json()?)
    }

    fn append_document(&self, collection: &str, body: &Value) -> Result<DocumentRef, StoreError> {
        let url = self.document_url(collection, None)?;
        Ok(self
            .send(Method::POST, url, collection, Some(body))?
            .json()?)
    }

    fn patch_document(&self, path: &str, ops: &[PatchOp]) -> Result<(), StoreError> {
        let url = self.document_url(path, None)?;
        let body = serde_json::to_value(ops)
            .map_err(|err| StoreError::Transport(format!("encode patch: {err}")))?;
        let resp: PatchResponse = self
            .send(Method::PATCH, url, path, Some(&body))?
            .json()?;
        if resp.patch_failed {
            debug!(path, uri = %resp.uri, message = %resp.message, "patch rejected");
            return Err(StoreError::Conflict { path: path.into() });
        }
        Ok(())
    }

    fn delete_document(&self, path: &str) -> Result<(), StoreError> {
        let url = self.document_url(path, None)?;
        self.send(Method::DELETE, url, path, None)?;
        Ok(())
    }
}

impl LiveFeed for Client {
    fn subscribe(
        &self,
        path: &str,
        cancel: &CancelToken,
        on_event: &mut dyn FnMut(FeedEvent),
    ) -> Result<(), StoreError> {
        let url = self.document_url(path, Some("subscribe"))?;
        let resp = self
            .builder(&self.feed_http, Method::GET, url)
            .header(ACCEPT, "text/event-stream")
            .send()?;
        let resp = check_status(resp, &Method::GET, path)?;
        info!(path, "live feed opened");

        let mut reader = BufReader::new(resp);
        let mut parser = EventParser::new();
        let mut line = String::new();
        // The server writes a keep-alive line periodically, so a blocked read
        // wakes up and observes cancellation even on an idle channel.
        while !cancel.is_cancelled() {
            line.clear();
            let read = reader
                .read_line(&mut line)
                .map_err(|err| StoreError::Transport(format!("live feed read: {err}")))?;
            if read == 0 || cancel.is_cancelled() {
                break;
            }
            if let Some(event) = parser.push_line(&line) {
                on_event(event);
            }
        }
        info!(path, "live feed closed");
        Ok(())
    }
}

impl Session for Client {
    fn authenticate(&self, username: &str) -> Result<(), StoreError> {
        let url = self.auth_url()?;
        let body = json!({ "username": username });
        let resp = self.send(Method::POST, url, &self.auth_path, Some(&body))?;
        let token: TokenResponse = resp.json()?;
        *self.token.write() = Some(token.token);
        Ok(())
    }

    fn logout(&self) -> Result<(), StoreError> {
        if self.token.read().is_none() {
            return Err(StoreError::Unauthorized);
        }
        let url = self.auth_url()?;
        self.send(Method::DELETE, url, &self.auth_path, None)?;
        *self.token.write() = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::TokenSource;
    use crate::model::{ReactionKind, ReactionOp};
    use crossbeam_channel::{unbounded, Receiver};
    use std::io::{Read, Write};
    use std::thread;
    use std::time::Duration;
    use tiny_http::{Header, Response as HttpResponse, Server};

    struct Seen {
        method: String,
        url: String,
        authorization: Option<String>,
        body: String,
    }

    /// Serves `replies` in order and reports each request it saw.
    fn fake_owldb(replies: Vec<(u16, &'static str)>) -> (String, thread::JoinHandle<Vec<Seen>>) {
        let server = Server::http("127.0.0.1:0").unwrap();
        let base = format!("http://{}", server.server_addr().to_ip().unwrap());
        let handle = thread::spawn(move || {
            let mut seen = Vec::new();
            for (status, body) in replies {
                let mut request = server.recv().unwrap();
                let mut text = String::new();
                request.as_reader().read_to_string(&mut text).unwrap();
                seen.push(Seen {
                    method: request.method().to_string(),
                    url: request.url().to_string(),
                    authorization: request
                        .headers()
                        .iter()
                        .find(|header| header.field.equiv("Authorization"))
                        .map(|header| header.value.to_string()),
                    body: text,
                });
                let response = HttpResponse::from_string(body)
                    .with_status_code(status)
                    .with_header(
                        Header::from_bytes(&b"Content-Type"[..], &b"application/json"[..])
                            .unwrap(),
                    );
                request.respond(response).unwrap();
            }
            seen
        });
        (base, handle)
    }

    /// Answers one request with an open-ended event stream: `frames` first,
    /// then a keep-alive line for every tick until the ticks stop. Returns the
    /// requested url.
    fn streaming_owldb(
        frames: &'static str,
        ticks: Receiver<()>,
    ) -> (String, thread::JoinHandle<String>) {
        let server = Server::http("127.0.0.1:0").unwrap();
        let base = format!("http://{}", server.server_addr().to_ip().unwrap());
        let handle = thread::spawn(move || {
            let request = server.recv().unwrap();
            let url = request.url().to_string();
            let mut stream = request.into_writer();
            stream
                .write_all(
                    b"HTTP/1.1 200 OK\r\nContent-Type: text/event-stream\r\nConnection: close\r\n\r\n",
                )
                .unwrap();
            stream.write_all(frames.as_bytes()).unwrap();
            stream.flush().unwrap();
            while ticks.recv().is_ok() {
                if stream.write_all(b"\n").and_then(|_| stream.flush()).is_err() {
                    break;
                }
            }
            url
        });
        (base, handle)
    }

    fn client(base: String) -> Client {
        Client::new(ClientConfig {
            base_url: base,
            database_path: "v1/chat/".into(),
            ..ClientConfig::default()
        })
        .unwrap()
    }

    #[test]
    fn login_then_fetch_sends_bearer_token() {
        let (base, server) = fake_owldb(vec![
            (200, r#"{"token":"abc123"}"#),
            (200, r#"[{"path":"/team","doc":{},"meta":{}}]"#),
        ]);
        let client = client(base);
        client.authenticate("ana").unwrap();
        assert!(client.is_authenticated());
        let tokens = TokenSource::new();
        let docs = client.fetch_collection("/", tokens.current()).unwrap();
        assert_eq!(docs.len(), 1);

        let seen = server.join().unwrap();
        assert_eq!(seen[0].method, "POST");
        assert_eq!(seen[0].url, "/auth");
        assert!(seen[0].body.contains("\"ana\""));
        assert_eq!(seen[1].url, "/v1/chat/");
        assert_eq!(seen[1].authorization.as_deref(), Some("Bearer abc123"));
    }

    #[test]
    fn create_on_existing_path_is_conflict() {
        let (base, server) = fake_owldb(vec![(400, r#""already exists""#)]);
        let client = client(base);
        let err = client.create_document("/team", &json!({})).unwrap_err();
        assert_eq!(err.code(), "conflict");
        let seen = server.join().unwrap();
        assert_eq!(seen[0].method, "PUT");
        assert_eq!(seen[0].url, "/v1/chat/team?mode=nooverwrite");
    }

    #[test]
    fn failed_patch_is_reported() {
        let (base, server) = fake_owldb(vec![(
            200,
            r#"{"uri":"/v1/chat/p","patchFailed":true,"message":"missing field"}"#,
        )]);
        let client = client(base);
        let op = PatchOp::toggle(ReactionOp::Add, ReactionKind::Like, "ana");
        let err = client.patch_document("/p", &[op]).unwrap_err();
        assert_eq!(err, StoreError::Conflict { path: "/p".into() });
        let seen = server.join().unwrap();
        assert_eq!(seen[0].method, "PATCH");
        assert!(seen[0].body.contains("ArrayAdd"));
    }

    #[test]
    fn missing_document_is_not_found() {
        let (base, server) = fake_owldb(vec![(404, r#""not found""#)]);
        let client = client(base);
        let err = client.fetch_document("/gone").unwrap_err();
        assert_eq!(err.code(), "not-found");
        server.join().unwrap();
    }

    #[test]
    fn cancelled_fetch_never_hits_the_network() {
        let client = client(DEFAULT_BASE_URL.to_string());
        let mut tokens = TokenSource::new();
        let stale = tokens.current().clone();
        tokens.advance();
        assert_eq!(client.fetch_collection("/", &stale), Err(StoreError::Stale));
    }

    #[test]
    fn status_classification() {
        assert_eq!(
            classify(400, &Method::POST, "/c/", ""),
            StoreError::Conflict { path: "/c/".into() }
        );
        assert_eq!(classify(401, &Method::GET, "/", ""), StoreError::Unauthorized);
        assert!(matches!(
            classify(400, &Method::GET, "/", "bad"),
            StoreError::Transport(_)
        ));
        assert_eq!(normalize_prefix("v1/db/"), "/v1/db");
        assert_eq!(normalize_prefix(""), "");
    }

    #[test]
    fn live_feed_streams_events_until_the_token_moves_on() {
        let frames = concat!(
            "event: update\n",
            "data: {\"path\":\"/team/channels/general/posts/m1\",\"doc\":{\"msg\":\"hi\"}}\n",
            "\n",
            "\n",
        );
        let (tick, ticks) = unbounded();
        let (base, server) = streaming_owldb(frames, ticks);
        let client = client(base);
        let mut tokens = TokenSource::new();
        let token = tokens.current().clone();
        let (event_tx, events) = unbounded();
        let (done_tx, done) = unbounded();
        let feed = thread::spawn(move || {
            let result = client.subscribe("/team/channels/general/posts/", &token, &mut |event| {
                let _ = event_tx.send(event);
            });
            let _ = done_tx.send(result);
        });

        let event = events.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(matches!(event, FeedEvent::Update { .. }));
        assert_eq!(event.path(), "/team/channels/general/posts/m1");

        // Keep-alives on a current token leave the feed open.
        tick.send(()).unwrap();
        thread::sleep(Duration::from_millis(100));
        assert!(done.try_recv().is_err());

        tokens.advance();
        tick.send(()).unwrap();
        assert_eq!(done.recv_timeout(Duration::from_secs(5)).unwrap(), Ok(()));
        feed.join().unwrap();
        assert!(events.try_recv().is_err());

        drop(tick);
        let url = server.join().unwrap();
        assert!(url.starts_with("/v1/chat/team/channels/general/posts/"));
        assert!(url.contains("mode=subscribe"));
    }
}
