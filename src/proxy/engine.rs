//! Resumable relay of upstream media
//!
//! The engine validates the destination, consults the circuit breaker,
//! takes an admission slot and then streams the upstream body into the
//! client response through a bounded channel. When an upstream attempt
//! ends early it silently fetches the rest of the range and keeps writing
//! into the same response. The client only notices if the retry budget
//! runs out, in which case the body errors and the connection closes.

use crate::admission::{AdmissionGate, AdmissionPermit, CircuitBreaker};
use crate::config::ProxySettings;
use crate::proxy::destination::{DestinationRejection, DestinationValidator};
use crate::proxy::range::{ByteRange, ContentRange};
use crate::proxy::transfer::{TransferPhase, TransferSession};
use crate::proxy::types::{ProxyError, ProxyResult};
use axum::body::Body;
use axum::response::Response;
use bytes::Bytes;
use futures_util::StreamExt;
use http::{header, HeaderMap, Method, StatusCode};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, instrument, warn};
use url::Url;

/// Upstream headers copied onto the client response
const MIRRORED_HEADERS: [header::HeaderName; 4] = [
    header::CONTENT_LENGTH,
    header::CONTENT_RANGE,
    header::CONTENT_TYPE,
    header::ACCEPT_RANGES,
];

type BodySender = mpsc::Sender<Result<Bytes, std::io::Error>>;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub max_retries: u32,
    pub retry_backoff: Duration,
    pub connect_timeout: Duration,
    pub stall_timeout: Duration,
    pub max_redirects: u32,
    pub channel_capacity: usize,
    pub user_agent: String,
}

impl EngineConfig {
    pub fn from_settings(settings: &ProxySettings) -> Self {
        Self {
            max_retries: settings.max_retries,
            retry_backoff: Duration::from_millis(settings.retry_backoff_ms),
            connect_timeout: Duration::from_secs(settings.connect_timeout_secs),
            stall_timeout: Duration::from_secs(settings.stall_timeout_secs),
            max_redirects: settings.max_redirects,
            channel_capacity: settings.channel_capacity.max(1),
            user_agent: settings.user_agent.clone(),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_retries: 6,
            retry_backoff: Duration::from_millis(250),
            connect_timeout: Duration::from_secs(10),
            stall_timeout: Duration::from_secs(20),
            max_redirects: 3,
            channel_capacity: 16,
            user_agent: "stream-relay".to_string(),
        }
    }
}

#[derive(Debug, Error)]
enum FetchError {
    #[error("upstream request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("redirect rejected: {0}")]
    Rejected(DestinationRejection),

    #[error("more than {0} redirects")]
    TooManyRedirects(u32),
}

impl From<FetchError> for ProxyError {
    fn from(error: FetchError) -> Self {
        match error {
            FetchError::Rejected(rejection) => ProxyError::DestinationRejected(rejection.to_string()),
            other => ProxyError::Upstream(other.to_string()),
        }
    }
}

/// How one upstream attempt ended
#[derive(Debug)]
enum AttemptEnd {
    /// Upstream signalled end of body, or every expected byte was delivered
    Ended,
    /// Error, premature close or stall
    Interrupted(String),
    /// The client response was dropped
    ClientGone,
}

pub struct ProxyEngine {
    client: reqwest::Client,
    validator: DestinationValidator,
    breaker: Arc<CircuitBreaker>,
    gate: AdmissionGate,
    config: EngineConfig,
}

impl ProxyEngine {
    pub fn new(
        validator: DestinationValidator,
        breaker: Arc<CircuitBreaker>,
        gate: AdmissionGate,
        config: EngineConfig,
    ) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .connect_timeout(config.connect_timeout)
            .user_agent(config.user_agent.clone())
            .build()?;
        Ok(Self {
            client,
            validator,
            breaker,
            gate,
            config,
        })
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub fn gate(&self) -> &AdmissionGate {
        &self.gate
    }

    /// Relay `raw_url` to the client, honouring an optional `Range` header
    #[instrument(skip_all, fields(method = %method))]
    pub async fn relay(
        self: &Arc<Self>,
        method: Method,
        raw_url: &str,
        range_header: Option<&str>,
    ) -> ProxyResult<Response> {
        let mut session = TransferSession::new(range_header.and_then(ByteRange::parse));

        let url = self.validator.check(raw_url).await.map_err(|rejection| {
            warn!(reason = %rejection, "Destination rejected");
            ProxyError::DestinationRejected(rejection.to_string())
        })?;

        if self.breaker.is_open() {
            let retry_after = self.breaker.retry_after().unwrap_or(Duration::from_secs(1));
            return Err(ProxyError::CircuitOpen { retry_after });
        }

        if method == Method::HEAD {
            return self.relay_head(url, session).await;
        }

        let permit = self.gate.enter(url.as_str()).await?;
        session.set_phase(TransferPhase::Admitted);

        let response = match self
            .fetch(Method::GET, url.clone(), Some(session.requested()))
            .await
        {
            Ok(response) => response,
            Err(error) => {
                if !matches!(error, FetchError::Rejected(_)) {
                    self.breaker.record_failure();
                }
                session.set_phase(TransferPhase::Failed);
                return Err(error.into());
            }
        };

        let status = response.status();
        if status != StatusCode::OK && status != StatusCode::PARTIAL_CONTENT {
            if status.is_server_error() {
                self.breaker.record_failure();
            }
            session.set_phase(TransferPhase::Failed);
            warn!(status = status.as_u16(), "Upstream refused the transfer");
            return Err(ProxyError::UpstreamStatus(status.as_u16()));
        }

        let (origin, end, expected) = describe_first_response(&response, session.requested());
        session.begin(origin, end, expected);
        info!(
            host = url.host_str().unwrap_or_default(),
            status = status.as_u16(),
            origin,
            expected_bytes = ?expected,
            "Streaming upstream body"
        );

        let mut builder = Response::builder().status(status.as_u16());
        copy_mirrored_headers(response.headers(), &mut builder);

        let (tx, rx) = mpsc::channel(self.config.channel_capacity);
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            engine.pump(url, session, response, tx, permit).await;
        });

        builder
            .body(Body::from_stream(ReceiverStream::new(rx)))
            .map_err(|e| ProxyError::Internal(e.to_string()))
    }

    async fn relay_head(&self, url: Url, mut session: TransferSession) -> ProxyResult<Response> {
        let response = match self
            .fetch(Method::HEAD, url, Some(session.requested()))
            .await
        {
            Ok(response) => response,
            Err(error) => {
                if !matches!(error, FetchError::Rejected(_)) {
                    self.breaker.record_failure();
                }
                session.set_phase(TransferPhase::Failed);
                return Err(error.into());
            }
        };

        let status = response.status();
        if status.is_server_error() {
            self.breaker.record_failure();
        } else if !status.is_client_error() {
            self.breaker.record_success();
        }
        session.set_phase(TransferPhase::Complete);

        let mut builder = Response::builder().status(status.as_u16());
        copy_mirrored_headers(response.headers(), &mut builder);
        builder
            .body(Body::empty())
            .map_err(|e| ProxyError::Internal(e.to_string()))
    }

    /// Issue one upstream request, following redirects by hand so that
    /// every hop is screened like the original destination
    async fn fetch(
        &self,
        method: Method,
        url: Url,
        range: Option<ByteRange>,
    ) -> Result<reqwest::Response, FetchError> {
        let mut current = url;
        for _ in 0..=self.config.max_redirects {
            let mut request = self.client.request(method.clone(), current.clone());
            if let Some(range) = range.filter(|range| !range.is_full()) {
                request = request.header(header::RANGE, range.header_value());
            }
            let response = request.send().await?;

            if !response.status().is_redirection() {
                return Ok(response);
            }
            let Some(location) = response
                .headers()
                .get(header::LOCATION)
                .and_then(|value| value.to_str().ok())
            else {
                return Ok(response);
            };

            let next = current
                .join(location)
                .map_err(|_| FetchError::Rejected(DestinationRejection::Unparsable))?;
            current = self
                .validator
                .check_url(next)
                .await
                .map_err(FetchError::Rejected)?;
            debug!(host = current.host_str().unwrap_or_default(), "Following upstream redirect");
        }
        Err(FetchError::TooManyRedirects(self.config.max_redirects))
    }

    /// Drive the transfer to completion, resuming as needed
    async fn pump(
        &self,
        url: Url,
        mut session: TransferSession,
        first: reqwest::Response,
        tx: BodySender,
        permit: AdmissionPermit,
    ) {
        let mut response = first;
        let mut skip = 0;

        loop {
            match self.forward(&mut session, response, skip, &tx).await {
                AttemptEnd::ClientGone => {
                    info!(forwarded = session.forwarded(), "Client went away; abandoning transfer");
                    permit.release();
                    return;
                }
                AttemptEnd::Ended if !session.is_short() => break,
                AttemptEnd::Ended => {
                    warn!(
                        forwarded = session.forwarded(),
                        expected = ?session.expected_total(),
                        "Upstream closed before the advertised length"
                    );
                }
                AttemptEnd::Interrupted(_) if session.is_satisfied() => break,
                AttemptEnd::Interrupted(reason) => {
                    warn!(forwarded = session.forwarded(), %reason, "Upstream attempt interrupted");
                }
            }

            match self.resume(&url, &mut session, &tx).await {
                Resumed::Continue(next, prefix) => {
                    response = next;
                    skip = prefix;
                }
                Resumed::AlreadyComplete => break,
                Resumed::ClientGone => {
                    permit.release();
                    return;
                }
                Resumed::Exhausted => {
                    session.set_phase(TransferPhase::Failed);
                    warn!(
                        retries = session.retry_count(),
                        forwarded = session.forwarded(),
                        "Retry budget exhausted; closing client response"
                    );
                    let _ = tx
                        .send(Err(std::io::Error::new(
                            std::io::ErrorKind::UnexpectedEof,
                            "upstream transfer failed",
                        )))
                        .await;
                    self.breaker.record_failure();
                    permit.release();
                    return;
                }
            }
        }

        session.set_phase(TransferPhase::Complete);
        info!(
            forwarded = session.forwarded(),
            retries = session.retry_count(),
            "Transfer complete"
        );
        self.breaker.record_success();
        permit.release();
    }

    /// Copy one upstream body into the client channel
    async fn forward(
        &self,
        session: &mut TransferSession,
        response: reqwest::Response,
        mut skip: u64,
        tx: &BodySender,
    ) -> AttemptEnd {
        let mut stream = response.bytes_stream();
        loop {
            let next = tokio::select! {
                biased;
                _ = tx.closed() => return AttemptEnd::ClientGone,
                next = tokio::time::timeout(self.config.stall_timeout, stream.next()) => next,
            };

            let mut chunk = match next {
                Err(_) => return AttemptEnd::Interrupted("stalled".to_string()),
                Ok(None) => return AttemptEnd::Ended,
                Ok(Some(Err(e))) => return AttemptEnd::Interrupted(e.to_string()),
                Ok(Some(Ok(chunk))) => chunk,
            };

            if skip > 0 {
                let dropped = skip.min(chunk.len() as u64);
                chunk = chunk.slice(dropped as usize..);
                skip -= dropped;
            }
            if let Some(remaining) = session.remaining() {
                if (chunk.len() as u64) > remaining {
                    chunk.truncate(remaining as usize);
                }
            }
            if chunk.is_empty() {
                if session.is_satisfied() {
                    return AttemptEnd::Ended;
                }
                continue;
            }

            let len = chunk.len();
            if tx.send(Ok(chunk)).await.is_err() {
                return AttemptEnd::ClientGone;
            }
            session.record_chunk(len);
            if session.is_satisfied() {
                return AttemptEnd::Ended;
            }
        }
    }

    /// Fetch the outstanding range, backing off between attempts
    async fn resume(
        &self,
        url: &Url,
        session: &mut TransferSession,
        tx: &BodySender,
    ) -> Resumed {
        loop {
            if session.retry_count() >= self.config.max_retries {
                return Resumed::Exhausted;
            }
            let attempt = session.begin_retry();
            let backoff = self.config.retry_backoff * attempt;
            tokio::select! {
                biased;
                _ = tx.closed() => return Resumed::ClientGone,
                _ = tokio::time::sleep(backoff) => {}
            }

            let wanted = session.resume_range();
            debug!(attempt, range = %wanted, "Resuming upstream transfer");
            let fetched = tokio::select! {
                biased;
                _ = tx.closed() => return Resumed::ClientGone,
                fetched = tokio::time::timeout(
                    self.config.stall_timeout,
                    self.fetch(Method::GET, url.clone(), Some(wanted)),
                ) => fetched,
            };
            let response = match fetched {
                Ok(Ok(response)) => response,
                Ok(Err(e)) => {
                    warn!(attempt, error = %e, "Resume request failed");
                    continue;
                }
                Err(_) => {
                    warn!(attempt, "Resume request got no response headers in time");
                    continue;
                }
            };

            match response.status() {
                StatusCode::PARTIAL_CONTENT => {
                    let served_from = response
                        .headers()
                        .get(header::CONTENT_RANGE)
                        .and_then(|value| value.to_str().ok())
                        .and_then(ContentRange::parse)
                        .map_or(wanted.start, |range| range.start);
                    if served_from > wanted.start {
                        warn!(attempt, served_from, wanted = wanted.start, "Resume left a gap");
                        continue;
                    }
                    session.set_phase(TransferPhase::Streaming);
                    return Resumed::Continue(response, wanted.start - served_from);
                }
                StatusCode::OK => {
                    debug!(attempt, "Upstream ignored the range; skipping delivered prefix");
                    session.set_phase(TransferPhase::Streaming);
                    return Resumed::Continue(response, session.next_offset());
                }
                StatusCode::RANGE_NOT_SATISFIABLE if session.expected_total().is_none() => {
                    return Resumed::AlreadyComplete;
                }
                status => {
                    warn!(attempt, status = status.as_u16(), "Resume answered with unexpected status");
                }
            }
        }
    }
}

enum Resumed {
    /// Keep streaming from this response after skipping the given byte count
    Continue(reqwest::Response, u64),
    AlreadyComplete,
    ClientGone,
    Exhausted,
}

/// Work out which absolute window the first reply covers and how many
/// bytes the client should expect
fn describe_first_response(
    response: &reqwest::Response,
    requested: ByteRange,
) -> (u64, Option<u64>, Option<u64>) {
    let content_length = response.content_length();
    if response.status() == StatusCode::PARTIAL_CONTENT {
        let content_range = response
            .headers()
            .get(header::CONTENT_RANGE)
            .and_then(|value| value.to_str().ok())
            .and_then(ContentRange::parse);
        match content_range {
            Some(range) => (range.start, Some(range.end), Some(range.byte_count())),
            None => (requested.start, requested.end, content_length),
        }
    } else {
        (0, None, content_length)
    }
}

fn copy_mirrored_headers(upstream: &HeaderMap, builder: &mut http::response::Builder) {
    let Some(headers) = builder.headers_mut() else {
        return;
    };
    for name in MIRRORED_HEADERS {
        if let Some(value) = upstream.get(&name) {
            headers.insert(name, value.clone());
        }
    }
}
