/**
 * This file is part of devsandbox-proxy.
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU Affero General Public License for more details.
 *
 * You should have received a copy of the GNU Affero General Public License
 * along with this program.  If not, see <http://www.gnu.org/licenses/>.
 */

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1 as server_http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tokio::net::TcpStream;
use tokio::sync::Notify;
use tokio_rustls::rustls;
use tokio_rustls::{TlsAcceptor, TlsConnector};

use crate::ask::{AskAction, AskChannel, AskRequest};
use crate::ca::CertificateAuthority;
use crate::config::redaction::RedactionAction;
use crate::creds::CredentialRegistry;
use crate::error::ProxyError;
use crate::filter::{FilterAction, FilterEngine};
use crate::logging::{RecordFields, RequestLogger, WarningLog};
use crate::redact::RedactionEngine;

type FullBody = Full<Bytes>;

const DEFAULT_MAX_PORT_RETRIES: u16 = 50;

fn block_response(reason: &str) -> Response<FullBody> {
    let body = format!("Request blocked by devsandbox filter: {reason}\n");
    Response::builder()
        .status(StatusCode::FORBIDDEN)
        .header("content-type", "text/plain; charset=utf-8")
        .header("x-blocked-by", "devsandbox-filter")
        .body(Full::new(Bytes::from(body)))
        .unwrap_or_else(|_| Response::new(Full::new(Bytes::new())))
}

fn error_response(status: StatusCode, message: &str) -> Response<FullBody> {
    Response::builder()
        .status(status)
        .header("content-type", "text/plain; charset=utf-8")
        .body(Full::new(Bytes::from(format!("{message}\n"))))
        .unwrap_or_else(|_| Response::new(Full::new(Bytes::new())))
}

pub struct ProxyServer {
    listen_addr: String,
    ca: Arc<CertificateAuthority>,
    filter: Arc<FilterEngine>,
    redaction: Arc<RedactionEngine>,
    credentials: Arc<CredentialRegistry>,
    ask: Option<Arc<AskChannel>>,
    logger: Arc<RequestLogger>,
    warning_log: Arc<WarningLog>,
    ask_timeout: Duration,
    running: AtomicBool,
    request_count: AtomicU64,
    shutdown: Notify,
}

impl ProxyServer {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        listen_addr: String,
        ca: Arc<CertificateAuthority>,
        filter: Arc<FilterEngine>,
        redaction: Arc<RedactionEngine>,
        credentials: Arc<CredentialRegistry>,
        ask: Option<Arc<AskChannel>>,
        logger: Arc<RequestLogger>,
        warning_log: Arc<WarningLog>,
        ask_timeout: Duration,
    ) -> ProxyServer {
        ProxyServer {
            listen_addr,
            ca,
            filter,
            redaction,
            credentials,
            ask,
            logger,
            warning_log,
            ask_timeout,
            running: AtomicBool::new(true),
            request_count: AtomicU64::new(0),
            shutdown: Notify::new(),
        }
    }

    /// Append a line to the durable proxy-warning log alongside the
    /// stdout trace event emitted at each call site.
    async fn log_warning(&self, message: &str, fields: &[(&str, &str)]) {
        let fields = fields.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        self.warning_log.warn(message, fields).await;
    }

    pub fn request_count(&self) -> u64 {
        self.request_count.load(Ordering::Relaxed)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    /// Stop accepting new connections and close the ask channel. Already
    /// accepted connections are left to finish on their own; idempotent.
    pub async fn stop(&self) {
        if self.running.swap(false, Ordering::Relaxed) {
            self.shutdown.notify_waiters();
            if let Some(ask) = &self.ask {
                ask.close().await;
            }
        }
    }

    /// Bind the listener, retrying on adjacent ports if the configured one
    /// is already taken, and serve connections until `stop` is called. The
    /// accept loop races against the shutdown notification so `stop`
    /// interrupts a blocked `accept()` immediately rather than waiting for
    /// the next incoming connection.
    pub async fn run(self: Arc<Self>) -> Result<SocketAddr, ProxyError> {
        let listener = bind_with_retry(&self.listen_addr).await?;
        let local_addr = listener.local_addr().map_err(ProxyError::Io)?;

        let server = self.clone();
        tokio::spawn(async move {
            loop {
                let accepted = tokio::select! {
                    biased;
                    _ = server.shutdown.notified() => break,
                    accepted = listener.accept() => accepted,
                };
                if !server.is_running() {
                    break;
                }
                match accepted {
                    Ok((stream, peer)) => {
                        let server = server.clone();
                        tokio::spawn(async move {
                            if let Err(err) = server.handle_connection(stream, peer).await {
                                tracing::warn!(peer = %peer, error = %err, "connection ended with error");
                                let peer = peer.to_string();
                                let err = err.to_string();
                                server
                                    .log_warning("connection ended with error", &[("peer", &peer), ("error", &err)])
                                    .await;
                            }
                        });
                    }
                    Err(err) => {
                        tracing::warn!(error = %err, "accept failed");
                        let err = err.to_string();
                        server.log_warning("accept failed", &[("error", &err)]).await;
                    }
                }
            }
        });

        Ok(local_addr)
    }

    async fn handle_connection(
        self: &Arc<Self>,
        stream: TcpStream,
        peer: SocketAddr,
    ) -> Result<(), ProxyError> {
        let server = self.clone();
        let io = TokioIo::new(stream);

        let service = service_fn(move |req: Request<Incoming>| {
            let server = server.clone();
            async move { Ok::<_, std::convert::Infallible>(server.route(req, peer).await) }
        });

        server_http1::Builder::new()
            .serve_connection(io, service)
            .with_upgrades()
            .await
            .map_err(|e| ProxyError::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))?;
        Ok(())
    }

    async fn route(self: Arc<Self>, req: Request<Incoming>, peer: SocketAddr) -> Response<FullBody> {
        self.request_count.fetch_add(1, Ordering::Relaxed);

        if req.method() == hyper::Method::CONNECT {
            self.handle_connect(req, peer).await
        } else {
            let host = req
                .uri()
                .host()
                .map(|h| h.to_string())
                .or_else(|| header_value(req.headers(), "host"))
                .unwrap_or_default();
            self.proxy_request(req, &host, false).await
        }
    }

    async fn handle_connect(self: Arc<Self>, req: Request<Incoming>, peer: SocketAddr) -> Response<FullBody> {
        let Some(authority) = req.uri().authority().cloned() else {
            return error_response(StatusCode::BAD_REQUEST, "CONNECT target missing authority");
        };
        let host = authority.host().to_string();
        let port = authority.port_u16().unwrap_or(443);

        let leaf = match self.ca.leaf_for_host(&host) {
            Ok(leaf) => leaf,
            Err(err) => {
                tracing::warn!(host = %host, error = %err, "failed to mint leaf certificate");
                let err = err.to_string();
                self.log_warning("failed to mint leaf certificate", &[("host", &host), ("error", &err)])
                    .await;
                return error_response(StatusCode::BAD_GATEWAY, "certificate authority error");
            }
        };

        let server = self.clone();
        tokio::spawn(async move {
            match hyper::upgrade::on(req).await {
                Ok(upgraded) => {
                    let host_for_log = host.clone();
                    if let Err(err) = server.tunnel_tls(upgraded, host, port, leaf, peer).await {
                        tracing::warn!(error = %err, "tls tunnel failed");
                        let err = err.to_string();
                        server
                            .log_warning("tls tunnel failed", &[("host", &host_for_log), ("error", &err)])
                            .await;
                    }
                }
                Err(err) => {
                    tracing::warn!(error = %err, "CONNECT upgrade failed");
                    let err = err.to_string();
                    server.log_warning("CONNECT upgrade failed", &[("error", &err)]).await;
                }
            }
        });

        Response::builder()
            .status(StatusCode::OK)
            .body(Full::new(Bytes::new()))
            .unwrap_or_else(|_| Response::new(Full::new(Bytes::new())))
    }

    async fn tunnel_tls(
        self: Arc<Self>,
        upgraded: hyper::upgrade::Upgraded,
        host: String,
        _port: u16,
        leaf: crate::ca::LeafCert,
        peer: SocketAddr,
    ) -> Result<(), ProxyError> {
        let server_config = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(vec![leaf.cert_der], leaf.key_der)
            .map_err(|e| ProxyError::ClientTls(std::io::Error::new(std::io::ErrorKind::Other, e)))?;

        let acceptor = TlsAcceptor::from(Arc::new(server_config));
        let tls_stream = acceptor
            .accept(TokioIo::new(upgraded))
            .await
            .map_err(ProxyError::ClientTls)?;

        let io = TokioIo::new(tls_stream);
        let server = self.clone();
        let host_for_service = host.clone();

        let service = service_fn(move |req: Request<Incoming>| {
            let server = server.clone();
            let host = host_for_service.clone();
            async move { Ok::<_, std::convert::Infallible>(server.proxy_request(req, &host, true).await) }
        });

        server_http1::Builder::new()
            .serve_connection(io, service)
            .await
            .map_err(|e| ProxyError::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))?;

        tracing::debug!(host = %host, peer = %peer, "tls tunnel closed");
        Ok(())
    }

    /// The shared request pipeline: capture -> inject -> filter -> ask ->
    /// redact -> forward -> log. Used both for the decrypted-in-tunnel
    /// path and for plain absolute-URI HTTP requests.
    async fn proxy_request(&self, req: Request<Incoming>, host: &str, tls: bool) -> Response<FullBody> {
        let start = Instant::now();
        let method = req.method().to_string();
        let path = req.uri().path().to_string();
        let url = format!("{}://{}{}", if tls { "https" } else { "http" }, host, req.uri());

        let (mut parts, body) = req.into_parts();
        let mut credential_injected = None;
        if let Some(name) = self.credentials.inject_for(host, &mut parts.headers) {
            credential_injected = Some(name.to_string());
        }
        let injected_headers = headers_to_map(&parts.headers);

        let body_bytes = match body.collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(_) => Bytes::new(),
        };
        let body_text = String::from_utf8_lossy(&body_bytes).into_owned();

        let decision = self.filter.decide(host, &path, &url);

        let mut filter_reason = decision.reason.clone();
        let final_action = match decision.action {
            FilterAction::Allow => FilterAction::Allow,
            FilterAction::Block => FilterAction::Block,
            FilterAction::Ask => {
                let (action, reason) =
                    self.resolve_ask(host, &path, &method, &url, &injected_headers, &body_text).await;
                filter_reason = reason;
                action
            }
        };

        if final_action == FilterAction::Block {
            self.logger
                .record(RecordFields {
                    method: &method,
                    url: &url,
                    host,
                    path: &path,
                    request_headers: &redact_request_headers_for_log(&injected_headers),
                    request_body: non_empty(&body_text),
                    status: None,
                    response_headers: &BTreeMap::new(),
                    response_body: None,
                    duration: start.elapsed(),
                    error: None,
                    filter_action: "block",
                    filter_reason: &filter_reason,
                    matched_rule: decision.matched_rule.clone(),
                    credential_injected,
                    redaction_action: None,
                    redaction_rules_applied: Vec::new(),
                })
                .await;
            return block_response(&filter_reason);
        }

        let redaction_result = self.redaction.scan(&url, &injected_headers, &body_text);
        let redaction_action_name = redaction_result.action.map(|a| redaction_action_name(a).to_string());

        // when the effective action is redact or block, every field the log
        // entry carries must come from the sanitized view, never the
        // original, or a secret caught only in the url or a non-sensitive
        // header would still reach disk in clear.
        let logged_url: &str = redaction_result.url.as_deref().unwrap_or(&url);
        let logged_headers_source = redaction_result.headers.clone().unwrap_or_else(|| injected_headers.clone());
        let logged_headers = redact_request_headers_for_log(&logged_headers_source);

        if redaction_result.action == Some(RedactionAction::Block) {
            self.logger
                .record(RecordFields {
                    method: &method,
                    url: logged_url,
                    host,
                    path: &path,
                    request_headers: &logged_headers,
                    request_body: redaction_result.body.clone().and_then(|b| non_empty(&b)),
                    status: None,
                    response_headers: &BTreeMap::new(),
                    response_body: None,
                    duration: start.elapsed(),
                    error: None,
                    filter_action: "allow",
                    filter_reason: &filter_reason,
                    matched_rule: decision.matched_rule.clone(),
                    credential_injected,
                    redaction_action: redaction_action_name,
                    redaction_rules_applied: redaction_result.matched_rule_names(),
                })
                .await;
            return block_response("a secret pattern was detected in the request");
        }

        let outbound_headers = match &redaction_result.headers {
            Some(sanitized) => map_to_headers(sanitized),
            None => parts.headers.clone(),
        };
        let outbound_body = redaction_result.body.clone().unwrap_or(body_text.clone());
        parts.headers = outbound_headers;

        // the sanitized url must also reach the upstream request, not just
        // the log: rebuild the request-target from the sanitized url's
        // path+query so a redacted secret in the query string is never
        // forwarded. `url` was built as `scheme://host` + the original
        // request-target, so that same prefix is stripped back off here.
        if let Some(sanitized_url) = &redaction_result.url {
            let original_target = parts.uri.to_string();
            if let Some(prefix) = url.strip_suffix(original_target.as_str()) {
                if let Some(sanitized_target) = sanitized_url.strip_prefix(prefix) {
                    if let Ok(new_uri) = sanitized_target.parse::<http::Uri>() {
                        parts.uri = new_uri;
                    }
                }
            }
        }

        let logged_request_body = non_empty(&outbound_body);
        let outbound = Request::from_parts(parts, Full::new(Bytes::from(outbound_body)));

        let upstream_result = if tls {
            self.forward_tls(outbound, host).await
        } else {
            self.forward_plain(outbound, host).await
        };

        let (status, response_headers, response_body, error) = match upstream_result {
            Ok(response) => {
                let (parts, body) = response.into_parts();
                let headers = headers_to_map(&parts.headers);
                let body_bytes = body.collect().await.map(|c| c.to_bytes()).unwrap_or_default();
                (Some(parts.status.as_u16()), headers, body_bytes, None)
            }
            Err(err) => {
                tracing::warn!(host = %host, error = %err, "upstream forward failed");
                let err_string = err.to_string();
                self.log_warning("upstream forward failed", &[("host", host), ("error", &err_string)])
                    .await;
                (None, BTreeMap::new(), Bytes::new(), Some(err_string))
            }
        };
        let logged_response_body = non_empty(&String::from_utf8_lossy(&response_body));

        self.logger
            .record(RecordFields {
                method: &method,
                url: logged_url,
                host,
                path: &path,
                request_headers: &logged_headers,
                request_body: logged_request_body,
                status,
                response_headers: &response_headers,
                response_body: logged_response_body,
                duration: start.elapsed(),
                error,
                filter_action: "allow",
                filter_reason: &filter_reason,
                matched_rule: decision.matched_rule.clone(),
                credential_injected,
                redaction_action: redaction_action_name,
                redaction_rules_applied: redaction_result.matched_rule_names(),
            })
            .await;

        match status {
            Some(code) => {
                let mut builder = Response::builder().status(code);
                for (k, v) in &response_headers {
                    builder = builder.header(k, v);
                }
                builder
                    .body(Full::new(response_body))
                    .unwrap_or_else(|_| error_response(StatusCode::BAD_GATEWAY, "upstream response error"))
            }
            None => error_response(StatusCode::BAD_GATEWAY, "upstream request failed"),
        }
    }

    /// Invoke the ask channel for a request the filter deferred. Returns
    /// the resolved action along with the reason to log; any channel
    /// failure (`NoMonitor`, `Timeout`, I/O) defaults to block and is
    /// reported as `unanswered: <cause>` per the logging contract.
    async fn resolve_ask(
        &self,
        host: &str,
        path: &str,
        method: &str,
        url: &str,
        headers: &BTreeMap<String, String>,
        body: &str,
    ) -> (FilterAction, String) {
        let Some(ask) = &self.ask else {
            return (FilterAction::Block, "unanswered: no ask channel configured".to_string());
        };

        let body_preview = if body.is_empty() {
            None
        } else {
            Some(body.chars().take(2048).collect::<String>())
        };

        let request = AskRequest {
            id: 0,
            method: method.to_string(),
            url: url.to_string(),
            host: host.to_string(),
            path: path.to_string(),
            headers: Some(headers.clone()),
            body_preview,
            timeout_secs: Some(self.ask_timeout.as_secs()),
        };

        match tokio::time::timeout(self.ask_timeout, ask.ask(request)).await {
            Ok(Ok(response)) => {
                if response.remember {
                    let remembered = if response.action == AskAction::Allow {
                        FilterAction::Allow
                    } else {
                        FilterAction::Block
                    };
                    self.filter.cache_decision(host, remembered);
                }
                if response.allow() {
                    (FilterAction::Allow, "allowed by user decision".to_string())
                } else {
                    (FilterAction::Block, "unanswered: denied via ask channel".to_string())
                }
            }
            Ok(Err(err)) => {
                tracing::warn!(host = %host, error = %err, "ask channel error, defaulting to block");
                let err_string = err.to_string();
                self.log_warning("ask channel error, defaulting to block", &[("host", host), ("error", &err_string)])
                    .await;
                (FilterAction::Block, format!("unanswered: {err_string}"))
            }
            Err(_) => {
                tracing::warn!(host = %host, "ask timed out, defaulting to block");
                self.log_warning("ask timed out, defaulting to block", &[("host", host)]).await;
                (FilterAction::Block, "unanswered: timeout".to_string())
            }
        }
    }

    async fn forward_tls(&self, req: Request<FullBody>, host: &str) -> Result<Response<Incoming>, ProxyError> {
        let addr = format!("{host}:443");
        let tcp = TcpStream::connect(&addr)
            .await
            .map_err(|e| ProxyError::UpstreamConnect { host: host.to_string(), source: e })?;

        let root_store =
            rustls::RootCertStore::from_iter(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let client_config = rustls::ClientConfig::builder()
            .with_root_certificates(root_store)
            .with_no_client_auth();
        let connector = TlsConnector::from(Arc::new(client_config));
        let server_name = rustls::pki_types::ServerName::try_from(host.to_string())
            .map_err(|e| ProxyError::UpstreamTls { host: host.to_string(), source: std::io::Error::new(std::io::ErrorKind::InvalidInput, e) })?;
        let tls_stream = connector
            .connect(server_name, tcp)
            .await
            .map_err(|e| ProxyError::UpstreamTls { host: host.to_string(), source: e })?;

        self.send_over(TokioIo::new(tls_stream), req, host).await
    }

    async fn forward_plain(&self, req: Request<FullBody>, host: &str) -> Result<Response<Incoming>, ProxyError> {
        let addr = if host.contains(':') { host.to_string() } else { format!("{host}:80") };
        let tcp = TcpStream::connect(&addr)
            .await
            .map_err(|e| ProxyError::UpstreamConnect { host: host.to_string(), source: e })?;
        self.send_over(TokioIo::new(tcp), req, host).await
    }

    async fn send_over<S>(&self, io: TokioIo<S>, req: Request<FullBody>, host: &str) -> Result<Response<Incoming>, ProxyError>
    where
        S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
    {
        let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
            .await
            .map_err(|e| ProxyError::UpstreamConnect { host: host.to_string(), source: std::io::Error::new(std::io::ErrorKind::Other, e) })?;

        tokio::spawn(async move {
            if let Err(err) = conn.await {
                tracing::debug!(error = %err, "upstream connection closed");
            }
        });

        sender
            .send_request(req)
            .await
            .map_err(|e| ProxyError::UpstreamConnect { host: host.to_string(), source: std::io::Error::new(std::io::ErrorKind::Other, e) })
    }
}

/// Bind `addr`, retrying on consecutive ports if it's taken, up to
/// `DEFAULT_MAX_PORT_RETRIES` times.
async fn bind_with_retry(addr: &str) -> Result<TcpListener, ProxyError> {
    match TcpListener::bind(addr).await {
        Ok(listener) => Ok(listener),
        Err(first_err) => {
            let socket: SocketAddr = addr
                .parse()
                .map_err(|_| ProxyError::Bind { addr: addr.to_string(), source: first_err })?;
            for offset in 1..=DEFAULT_MAX_PORT_RETRIES {
                let candidate = SocketAddr::new(socket.ip(), socket.port().wrapping_add(offset));
                if let Ok(listener) = TcpListener::bind(candidate).await {
                    tracing::info!(addr = %candidate, "bound proxy listener on fallback port");
                    return Ok(listener);
                }
            }
            Err(ProxyError::Bind { addr: addr.to_string(), source: first_err })
        }
    }
}

fn headers_to_map(headers: &http::HeaderMap) -> BTreeMap<String, String> {
    headers
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_str().unwrap_or("").to_string()))
        .collect()
}

fn map_to_headers(map: &BTreeMap<String, String>) -> http::HeaderMap {
    let mut headers = http::HeaderMap::with_capacity(map.len());
    for (k, v) in map {
        if let (Ok(name), Ok(value)) = (
            http::HeaderName::from_bytes(k.as_bytes()),
            http::HeaderValue::from_str(v),
        ) {
            headers.insert(name, value);
        }
    }
    headers
}

fn redaction_action_name(action: RedactionAction) -> &'static str {
    match action {
        RedactionAction::Log => "log",
        RedactionAction::Redact => "redact",
        RedactionAction::Block => "block",
    }
}

fn non_empty(text: &str) -> Option<String> {
    if text.is_empty() {
        None
    } else {
        Some(text.to_string())
    }
}

fn header_value(headers: &http::HeaderMap, key: &str) -> Option<String> {
    headers.get(key).and_then(|v| v.to_str().ok()).map(|s| s.to_string())
}

fn redact_request_headers_for_log(headers: &BTreeMap<String, String>) -> BTreeMap<String, String> {
    crate::logging::record::redact_always(headers)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_response_matches_the_documented_schema() {
        let response = block_response("matched rule: *.evil.example");
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert_eq!(
            response.headers().get("x-blocked-by").unwrap(),
            "devsandbox-filter"
        );
        assert_eq!(
            response.headers().get("content-type").unwrap(),
            "text/plain; charset=utf-8"
        );
    }

    #[test]
    fn map_to_headers_round_trips_string_values() {
        let mut map = BTreeMap::new();
        map.insert("x-custom".to_string(), "value".to_string());
        let headers = map_to_headers(&map);
        assert_eq!(headers.get("x-custom").unwrap(), "value");
    }
}
