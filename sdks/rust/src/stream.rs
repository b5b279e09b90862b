//! Client side of the job event stream.
//!
//! A [`StreamReader`] opens the stream, decodes frames, keeps a
//! [`TargetRegistry`] of per-target state and calls the handlers registered
//! for each event kind. Two kinds of failure are kept apart:
//!
//! - an `error` *event* means one named target failed; other targets and the
//!   stream carry on ([`StreamReader::on_error`])
//! - a *connection error* means the stream itself failed: the server was never
//!   reached, refused the job, or the transport ended before `complete`
//!   ([`StreamReader::on_connection_error`])
//!
//! A job that fails before any target starts (for example a provider with no
//! credentials) is reported as a single `error` event, after which the server
//! ends the stream without `complete`. The reader reports that as
//! [`StreamEnd::JobFailed`], not as a connection error.

use std::collections::BTreeMap;

use futures::StreamExt;
use tokio_util::sync::CancellationToken;

use crate::types::{ErrorEvent, LatencyEvent, StreamEvent, TextEvent, Usage, UsageEvent};

// =============================================================================
// Frame decoding
// =============================================================================

/// One raw `event:`/`data:` frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub event: String,
    pub data: String,
}

/// Incremental decoder: feed arbitrary byte chunks, get whole frames back.
///
/// Chunks may split frames, lines, or multi-byte characters anywhere.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `chunk` and drain every complete frame.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Frame> {
        self.buf.extend_from_slice(chunk);
        let mut frames = Vec::new();
        while let Some((end, sep)) = find_boundary(&self.buf) {
            let raw: Vec<u8> = self.buf.drain(..end + sep).collect();
            if let Some(frame) = parse_frame(&String::from_utf8_lossy(&raw[..end])) {
                frames.push(frame);
            }
        }
        frames
    }

    /// Bytes held back waiting for the rest of a frame.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }
}

fn find_boundary(buf: &[u8]) -> Option<(usize, usize)> {
    let lf = buf.windows(2).position(|w| w == b"\n\n").map(|i| (i, 2));
    let crlf = buf.windows(4).position(|w| w == b"\r\n\r\n").map(|i| (i, 4));
    match (lf, crlf) {
        (Some(a), Some(b)) => Some(if a.0 <= b.0 { a } else { b }),
        (a, b) => a.or(b),
    }
}

fn parse_frame(block: &str) -> Option<Frame> {
    let mut event = None;
    let mut data: Vec<&str> = Vec::new();
    for line in block.lines() {
        let line = line.trim_end_matches('\r');
        if line.starts_with(':') {
            continue;
        }
        let (field, value) = line.split_once(':').unwrap_or((line, ""));
        let value = value.strip_prefix(' ').unwrap_or(value);
        match field {
            "event" => event = Some(value.to_string()),
            "data" => data.push(value),
            _ => {}
        }
    }
    if event.is_none() && data.is_empty() {
        return None;
    }
    Some(Frame {
        event: event.unwrap_or_else(|| "message".to_string()),
        data: data.join("\n"),
    })
}

// =============================================================================
// Per-target state
// =============================================================================

/// Accumulated state of one target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetState {
    /// Concatenation of every text delta so far.
    pub text: String,
    pub latency_ms: Option<u64>,
    pub usage: Option<Usage>,
    pub error: Option<ErrorEvent>,
    /// Still generating.
    pub loading: bool,
}

impl Default for TargetState {
    fn default() -> Self {
        Self {
            text: String::new(),
            latency_ms: None,
            usage: None,
            error: None,
            loading: true,
        }
    }
}

/// Per-target state keyed by `targetId`.
#[derive(Debug, Clone, Default)]
pub struct TargetRegistry {
    targets: BTreeMap<String, TargetState>,
}

impl TargetRegistry {
    pub fn get(&self, target_id: &str) -> Option<&TargetState> {
        self.targets.get(target_id)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &TargetState)> {
        self.targets.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    fn entry(&mut self, target_id: &str) -> &mut TargetState {
        self.targets.entry(target_id.to_string()).or_default()
    }

    fn apply(&mut self, event: &StreamEvent) {
        match event {
            StreamEvent::Text(e) => self.entry(&e.target_id).text.push_str(&e.text),
            StreamEvent::Latency(e) => self.entry(&e.target_id).latency_ms = Some(e.ms),
            StreamEvent::Usage(e) => {
                let state = self.entry(&e.target_id);
                state.usage = Some(e.usage);
                state.loading = false;
            }
            StreamEvent::Error(e) => {
                let state = self.entry(&e.target_id);
                state.error = Some(e.clone());
                state.loading = false;
            }
            StreamEvent::Complete => self.settle(),
        }
    }

    fn settle(&mut self) {
        for state in self.targets.values_mut() {
            state.loading = false;
        }
    }
}

// =============================================================================
// Reader
// =============================================================================

/// Why the stream itself failed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConnectionError {
    /// The request never reached the server.
    #[error("could not reach server: {0}")]
    Unreachable(String),
    /// The server answered with a non-success status instead of a stream.
    #[error("server responded {status}: {body}")]
    Status { status: u16, body: String },
    /// The transport failed mid-stream.
    #[error("stream dropped: {0}")]
    Dropped(String),
    /// The transport ended without a `complete` event.
    #[error("stream ended before completion")]
    EndedEarly,
    /// A frame could not be decoded.
    #[error("malformed {event} event: {message}")]
    Protocol { event: String, message: String },
}

/// How [`StreamReader::run`] finished.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEnd {
    /// `complete` arrived; every target settled.
    Complete,
    /// [`StreamReader::close`] was called.
    Closed,
    /// The whole job failed: the stream carried one `error` event and then
    /// ended. The error handler has been called; the connection-error handler
    /// has not.
    JobFailed(ErrorEvent),
    /// The connection failed; the connection-error handler has been called.
    Failed(ConnectionError),
}

/// Cloneable handle that closes a reader from elsewhere, including from
/// inside its own handlers.
#[derive(Debug, Clone)]
pub struct CloseHandle(CancellationToken);

impl CloseHandle {
    /// Close the stream. Calling this more than once is a no-op.
    pub fn close(&self) {
        self.0.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.0.is_cancelled()
    }
}

type Handler<T> = Box<dyn FnMut(&T) + Send>;

#[derive(Default)]
struct Handlers {
    text: Option<Handler<TextEvent>>,
    latency: Option<Handler<LatencyEvent>>,
    usage: Option<Handler<UsageEvent>>,
    error: Option<Handler<ErrorEvent>>,
    complete: Option<Box<dyn FnMut() + Send>>,
    connection_error: Option<Handler<ConnectionError>>,
}

/// Reader for one job's event stream.
pub struct StreamReader {
    request: Option<reqwest::RequestBuilder>,
    decoder: FrameDecoder,
    registry: TargetRegistry,
    handlers: Handlers,
    close: CloseHandle,
    completed: bool,
    events_seen: usize,
    first_error: Option<ErrorEvent>,
}

impl std::fmt::Debug for StreamReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamReader")
            .field("registry", &self.registry)
            .field("closed", &self.close.is_closed())
            .finish_non_exhaustive()
    }
}

impl StreamReader {
    pub(crate) fn new(request: reqwest::RequestBuilder) -> Self {
        Self {
            request: Some(request),
            decoder: FrameDecoder::new(),
            registry: TargetRegistry::default(),
            handlers: Handlers::default(),
            close: CloseHandle(CancellationToken::new()),
            completed: false,
            events_seen: 0,
            first_error: None,
        }
    }

    /// A reader with no transport, fed by hand through [`StreamReader::feed`].
    pub fn detached() -> Self {
        Self {
            request: None,
            decoder: FrameDecoder::new(),
            registry: TargetRegistry::default(),
            handlers: Handlers::default(),
            close: CloseHandle(CancellationToken::new()),
            completed: false,
            events_seen: 0,
            first_error: None,
        }
    }

    pub fn on_text(&mut self, f: impl FnMut(&TextEvent) + Send + 'static) -> &mut Self {
        self.handlers.text = Some(Box::new(f));
        self
    }

    pub fn on_latency(&mut self, f: impl FnMut(&LatencyEvent) + Send + 'static) -> &mut Self {
        self.handlers.latency = Some(Box::new(f));
        self
    }

    pub fn on_usage(&mut self, f: impl FnMut(&UsageEvent) + Send + 'static) -> &mut Self {
        self.handlers.usage = Some(Box::new(f));
        self
    }

    /// A named target failed. Not called for connection failures.
    pub fn on_error(&mut self, f: impl FnMut(&ErrorEvent) + Send + 'static) -> &mut Self {
        self.handlers.error = Some(Box::new(f));
        self
    }

    /// Every target settled. The transport is closed right after.
    pub fn on_complete(&mut self, f: impl FnMut() + Send + 'static) -> &mut Self {
        self.handlers.complete = Some(Box::new(f));
        self
    }

    /// The stream itself failed. Not called for per-target `error` events.
    pub fn on_connection_error(
        &mut self,
        f: impl FnMut(&ConnectionError) + Send + 'static,
    ) -> &mut Self {
        self.handlers.connection_error = Some(Box::new(f));
        self
    }

    pub fn registry(&self) -> &TargetRegistry {
        &self.registry
    }

    pub fn close_handle(&self) -> CloseHandle {
        self.close.clone()
    }

    /// Close the stream. Idempotent, and a no-op once the stream has
    /// completed or failed.
    pub fn close(&self) {
        self.close.close();
    }

    pub fn is_closed(&self) -> bool {
        self.close.is_closed()
    }

    /// Decode `chunk` and dispatch every complete frame in it.
    ///
    /// Returns `Ok(true)` once `complete` has been seen; later input is
    /// ignored.
    pub fn feed(&mut self, chunk: &[u8]) -> Result<bool, ConnectionError> {
        if self.is_closed() {
            return Ok(self.completed);
        }
        for frame in self.decoder.push(chunk) {
            let event = StreamEvent::decode(&frame.event, &frame.data).map_err(|e| {
                ConnectionError::Protocol {
                    event: frame.event.clone(),
                    message: e.to_string(),
                }
            })?;
            let Some(event) = event else { continue };
            self.events_seen += 1;
            if let (1, StreamEvent::Error(e)) = (self.events_seen, &event) {
                self.first_error = Some(e.clone());
            }
            self.registry.apply(&event);
            if self.dispatch(&event) {
                self.completed = true;
                self.close.close();
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn dispatch(&mut self, event: &StreamEvent) -> bool {
        let h = &mut self.handlers;
        match event {
            StreamEvent::Text(e) => call(&mut h.text, e),
            StreamEvent::Latency(e) => call(&mut h.latency, e),
            StreamEvent::Usage(e) => call(&mut h.usage, e),
            StreamEvent::Error(e) => call(&mut h.error, e),
            StreamEvent::Complete => {
                if let Some(f) = h.complete.as_mut() {
                    f();
                }
                return true;
            }
        }
        false
    }

    /// The job-level error, if the stream so far is exactly one `error`
    /// event and nothing else.
    fn job_error(&self) -> Option<&ErrorEvent> {
        (self.events_seen == 1).then_some(self.first_error.as_ref()).flatten()
    }

    /// Classify a transport that ended without `complete`.
    fn ended(&mut self) -> StreamEnd {
        match self.job_error().cloned() {
            Some(err) => {
                self.registry.settle();
                self.close.close();
                StreamEnd::JobFailed(err)
            }
            None => self.fail(ConnectionError::EndedEarly),
        }
    }

    fn fail(&mut self, err: ConnectionError) -> StreamEnd {
        self.registry.settle();
        call(&mut self.handlers.connection_error, &err);
        self.close.close();
        StreamEnd::Failed(err)
    }

    /// Open the transport and read until `complete`, [`close`](Self::close),
    /// or a connection failure.
    pub async fn run(&mut self) -> StreamEnd {
        let cancel = self.close.0.clone();
        if cancel.is_cancelled() {
            return StreamEnd::Closed;
        }
        let Some(request) = self.request.take() else {
            return StreamEnd::Closed;
        };

        let sent = tokio::select! {
            () = cancel.cancelled() => return StreamEnd::Closed,
            r = request.header(reqwest::header::ACCEPT, "text/event-stream").send() => r,
        };
        let response = match sent {
            Ok(r) => r,
            Err(e) => return self.fail(ConnectionError::Unreachable(e.to_string())),
        };
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return self.fail(ConnectionError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let mut bytes = response.bytes_stream();
        loop {
            let chunk = tokio::select! {
                () = cancel.cancelled() => return StreamEnd::Closed,
                c = bytes.next() => c,
            };
            match chunk {
                Some(Ok(chunk)) => match self.feed(&chunk) {
                    Ok(true) => return StreamEnd::Complete,
                    Ok(false) => {}
                    Err(e) => return self.fail(e),
                },
                Some(Err(e)) => return self.fail(ConnectionError::Dropped(e.to_string())),
                None => return self.ended(),
            }
        }
    }
}

fn call<T>(handler: &mut Option<Handler<T>>, value: &T) {
    if let Some(f) = handler.as_mut() {
        f(value);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;

    const STREAM: &str = concat!(
        "event: latency_ms\ndata: {\"targetId\":\"m1\",\"ms\":12}\n\n",
        "event: text\ndata: {\"targetId\":\"m1\",\"text\":\"Hel\"}\n\n",
        "event: text\ndata: {\"targetId\":\"m2\",\"text\":\"Bon\"}\n\n",
        "event: text\ndata: {\"targetId\":\"m1\",\"text\":\"lo\"}\n\n",
        "event: error\ndata: {\"targetId\":\"m2\",\"error\":\"boom\",\"errorType\":\"StreamError\"}\n\n",
        "event: usage\ndata: {\"targetId\":\"m1\",\"inputTokens\":3,\"outputTokens\":2,\"totalTokens\":5}\n\n",
        "event: complete\ndata: [DONE]\n\n",
    );

    #[test]
    fn test_decoder_handles_split_chunks() {
        let mut decoder = FrameDecoder::new();
        let bytes = STREAM.as_bytes();
        let mut frames = Vec::new();
        for chunk in bytes.chunks(7) {
            frames.extend(decoder.push(chunk));
        }
        assert_eq!(frames.len(), 7);
        assert_eq!(frames[1].event, "text");
        assert_eq!(frames[6].data, "[DONE]");
        assert_eq!(decoder.pending(), 0);
    }

    #[test]
    fn test_decoder_crlf_comments_and_multiline_data() {
        let mut decoder = FrameDecoder::new();
        let frames = decoder.push(b": keepalive\r\n\r\nevent: x\r\ndata: a\r\ndata: b\r\n\r\n");
        assert_eq!(
            frames,
            vec![Frame {
                event: "x".into(),
                data: "a\nb".into()
            }]
        );
    }

    #[test]
    fn test_decoder_multibyte_split() {
        let mut decoder = FrameDecoder::new();
        let frame = "event: text\ndata: {\"targetId\":\"m\",\"text\":\"héllo\"}\n\n".as_bytes();
        let split = frame.iter().position(|b| *b == 0xC3).unwrap() + 1;
        assert!(decoder.push(&frame[..split]).is_empty());
        let frames = decoder.push(&frame[split..]);
        assert!(frames[0].data.contains("héllo"));
    }

    #[test]
    fn test_reader_accumulates_per_target() {
        let mut reader = StreamReader::detached();
        let texts = Arc::new(Mutex::new(Vec::new()));
        let errors = Arc::new(Mutex::new(Vec::new()));
        let completed = Arc::new(Mutex::new(0));
        let conn_errors = Arc::new(Mutex::new(0));
        {
            let texts = Arc::clone(&texts);
            let errors = Arc::clone(&errors);
            let completed = Arc::clone(&completed);
            let conn_errors = Arc::clone(&conn_errors);
            reader
                .on_text(move |e| texts.lock().unwrap().push(e.text.clone()))
                .on_error(move |e| errors.lock().unwrap().push(e.target_id.clone()))
                .on_complete(move || *completed.lock().unwrap() += 1)
                .on_connection_error(move |_| *conn_errors.lock().unwrap() += 1);
        }

        let mut done = false;
        for chunk in STREAM.as_bytes().chunks(5) {
            done = reader.feed(chunk).unwrap();
        }
        assert!(done);

        let m1 = reader.registry().get("m1").unwrap();
        assert_eq!(m1.text, "Hello");
        assert_eq!(m1.latency_ms, Some(12));
        assert_eq!(m1.usage.map(|u| u.total_tokens), Some(5));
        assert!(!m1.loading);

        let m2 = reader.registry().get("m2").unwrap();
        assert_eq!(m2.text, "Bon");
        assert_eq!(m2.error.as_ref().map(|e| e.error_type.as_str()), Some("StreamError"));
        assert!(m2.usage.is_none());

        assert_eq!(*texts.lock().unwrap(), vec!["Hel", "Bon", "lo"]);
        assert_eq!(*errors.lock().unwrap(), vec!["m2"]);
        assert_eq!(*completed.lock().unwrap(), 1);
        assert_eq!(*conn_errors.lock().unwrap(), 0);
        assert!(reader.is_closed());
    }

    #[test]
    fn test_input_after_complete_is_ignored() {
        let mut reader = StreamReader::detached();
        reader.feed(b"event: complete\ndata: [DONE]\n\n").unwrap();
        reader
            .feed(b"event: text\ndata: {\"targetId\":\"late\",\"text\":\"x\"}\n\n")
            .unwrap();
        assert!(reader.registry().get("late").is_none());
    }

    #[test]
    fn test_malformed_event_is_protocol_error() {
        let mut reader = StreamReader::detached();
        let err = reader.feed(b"event: usage\ndata: {oops}\n\n").unwrap_err();
        assert!(matches!(err, ConnectionError::Protocol { ref event, .. } if event == "usage"));
    }

    #[test]
    fn test_close_is_idempotent() {
        let reader = StreamReader::detached();
        let handle = reader.close_handle();
        reader.close();
        reader.close();
        handle.close();
        assert!(reader.is_closed());
    }

    /// Serve one raw HTTP response with `body`, then close the connection.
    async fn serve_once(body: &'static str) -> String {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            let _ = socket.read(&mut buf).await;
            let head = "HTTP/1.1 200 OK\r\ncontent-type: text/event-stream\r\nconnection: close\r\n\r\n";
            socket.write_all(head.as_bytes()).await.unwrap();
            socket.write_all(body.as_bytes()).await.unwrap();
            socket.shutdown().await.unwrap();
        });
        format!("http://{addr}/api/jobs/stream?uid=x")
    }

    fn counting_reader(url: &str) -> (StreamReader, Arc<Mutex<usize>>, Arc<Mutex<Vec<ConnectionError>>>) {
        let mut reader = StreamReader::new(reqwest::Client::new().get(url));
        let target_errors = Arc::new(Mutex::new(0));
        let conn_errors = Arc::new(Mutex::new(Vec::new()));
        {
            let target_errors = Arc::clone(&target_errors);
            let conn_errors = Arc::clone(&conn_errors);
            reader
                .on_error(move |_| *target_errors.lock().unwrap() += 1)
                .on_connection_error(move |e| conn_errors.lock().unwrap().push(e.clone()));
        }
        (reader, target_errors, conn_errors)
    }

    #[tokio::test]
    async fn test_job_level_error_is_not_a_connection_error() {
        let url = serve_once(
            "event: error\ndata: {\"targetId\":\"gpt-4o\",\"error\":\"missing API key\",\"errorType\":\"ConfigurationError\"}\n\n",
        )
        .await;
        let (mut reader, target_errors, conn_errors) = counting_reader(&url);

        let end = reader.run().await;
        let StreamEnd::JobFailed(err) = &end else {
            panic!("expected JobFailed, got {end:?}");
        };
        assert_eq!(err.error_type, "ConfigurationError");
        assert_eq!(*target_errors.lock().unwrap(), 1);
        assert!(conn_errors.lock().unwrap().is_empty());
        assert!(!reader.registry().get("gpt-4o").unwrap().loading);
        assert!(reader.is_closed());
    }

    #[tokio::test]
    async fn test_cut_after_text_is_ended_early() {
        let url = serve_once(concat!(
            "event: text\ndata: {\"targetId\":\"m1\",\"text\":\"Hel\"}\n\n",
            "event: error\ndata: {\"targetId\":\"m2\",\"error\":\"boom\",\"errorType\":\"StreamError\"}\n\n",
        ))
        .await;
        let (mut reader, target_errors, conn_errors) = counting_reader(&url);

        assert_eq!(reader.run().await, StreamEnd::Failed(ConnectionError::EndedEarly));
        assert_eq!(*target_errors.lock().unwrap(), 1);
        assert_eq!(*conn_errors.lock().unwrap(), vec![ConnectionError::EndedEarly]);
    }

    #[tokio::test]
    async fn test_run_against_live_body_completes() {
        let url = serve_once(STREAM).await;
        let (mut reader, target_errors, conn_errors) = counting_reader(&url);

        assert_eq!(reader.run().await, StreamEnd::Complete);
        assert_eq!(reader.registry().get("m1").unwrap().text, "Hello");
        assert_eq!(*target_errors.lock().unwrap(), 1);
        assert!(conn_errors.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_run_after_close_does_not_connect() {
        let http = reqwest::Client::new();
        let mut reader = StreamReader::new(http.get("http://127.0.0.1:1/api/jobs/stream?uid=x"));
        let conn_errors = Arc::new(Mutex::new(0));
        let counter = Arc::clone(&conn_errors);
        reader.on_connection_error(move |_| *counter.lock().unwrap() += 1);
        reader.close();
        assert_eq!(reader.run().await, StreamEnd::Closed);
        assert_eq!(*conn_errors.lock().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_unreachable_server_is_connection_error() {
        let http = reqwest::Client::new();
        let mut reader = StreamReader::new(http.get("http://127.0.0.1:1/api/jobs/stream?uid=x"));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        reader.on_connection_error(move |e| sink.lock().unwrap().push(e.clone()));
        reader.on_error(|_| panic!("target error handler must not fire"));

        let end = reader.run().await;
        assert!(matches!(end, StreamEnd::Failed(ConnectionError::Unreachable(_))));
        assert_eq!(seen.lock().unwrap().len(), 1);
        assert!(reader.is_closed());
    }
}
