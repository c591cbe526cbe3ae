//! A bidirectional RPC link over one TCP stream.
//!
//! Both ends of a link are [`Connection`]s: either side can issue calls and
//! serve the other's. Each connection runs two tasks:
//!
//! - the reader deframes the byte stream, reassembles fragments, hands
//!   responses to the waiting caller and spawns a task per inbound request;
//! - the writer drains a queue of encoded frames onto the socket, so sends
//!   never block the caller.
//!
//! A transport failure on either task disconnects the link, which fails
//! every pending call.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{Span, debug, info, instrument, trace, warn};

use rpcwire_protocol::{Fragment, FragmentCodec, FrameCodec, Message, MessageKind, Reassembler};

use crate::config::ConnectionConfig;
use crate::correlation::{CorrelationTable, PendingGuard, WaitOutcome};
use crate::error::{ServerError, ServerResult};
use crate::handler::ServiceInvoker;
use crate::service::ServiceRegistry;

/// Capacity of a connection's event channel.
pub const EVENT_CAPACITY: usize = 64;

/// Lifecycle notifications published by a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// The link is up and both tasks are running.
    Connected { id: u64, peer: SocketAddr },
    /// The link is down; every pending call has been failed.
    Disconnected { id: u64, peer: SocketAddr },
    /// A read or write failed. Always followed by `Disconnected`.
    TransportError { id: u64, message: String },
}

struct Inner {
    id: u64,
    peer_addr: SocketAddr,
    local_addr: SocketAddr,
    config: ConnectionConfig,
    frames: Mutex<FrameCodec>,
    fragments: FragmentCodec,
    reassembler: Reassembler,
    correlation: Arc<CorrelationTable>,
    next_tag: AtomicI64,
    running: AtomicBool,
    outbound: mpsc::UnboundedSender<Bytes>,
    shutdown: watch::Sender<bool>,
    events: broadcast::Sender<ConnectionEvent>,
    invoker: ServiceInvoker,
}

/// Handle to a running link. Cheap to clone.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.inner.id)
            .field("peer_addr", &self.inner.peer_addr)
            .field("connected", &self.is_connected())
            .finish()
    }
}

impl Connection {
    /// Creates an event channel to pass to [`start`](Self::start).
    ///
    /// Subscribe before starting to observe the `Connected` event.
    pub fn event_channel() -> broadcast::Sender<ConnectionEvent> {
        broadcast::channel(EVENT_CAPACITY).0
    }

    /// Takes ownership of `stream` and starts the reader and writer tasks.
    ///
    /// Inbound requests are served from `services`. Must be called from
    /// within a Tokio runtime.
    pub fn start(
        stream: TcpStream,
        id: u64,
        config: ConnectionConfig,
        services: Arc<ServiceRegistry>,
        events: broadcast::Sender<ConnectionEvent>,
    ) -> ServerResult<Self> {
        config.validate()?;
        stream.set_nodelay(config.nodelay)?;
        let peer_addr = stream.peer_addr()?;
        let local_addr = stream.local_addr()?;

        let frames = FrameCodec::new(config.max_packet_size)?;
        let fragments = FragmentCodec::new(config.max_fragment_data)?;
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let (shutdown, shutdown_rx) = watch::channel(false);

        let connection = Self {
            inner: Arc::new(Inner {
                id,
                peer_addr,
                local_addr,
                correlation: Arc::new(CorrelationTable::new(config.pool_capacity)),
                config,
                frames: Mutex::new(frames),
                fragments,
                reassembler: Reassembler::new(),
                next_tag: AtomicI64::new(1),
                running: AtomicBool::new(true),
                outbound,
                shutdown,
                events,
                invoker: ServiceInvoker::new(services),
            }),
        };

        let (reader, writer) = stream.into_split();
        tokio::spawn(
            connection
                .clone()
                .read_loop(reader, shutdown_rx.clone()),
        );
        tokio::spawn(connection.clone().write_loop(writer, outbound_rx, shutdown_rx));

        info!(id, peer = %peer_addr, "Connection established");
        connection.emit(ConnectionEvent::Connected { id, peer: peer_addr });
        Ok(connection)
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.inner.peer_addr
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.inner.config
    }

    /// Services answering this link's inbound requests.
    pub fn services(&self) -> &Arc<ServiceRegistry> {
        self.inner.invoker.registry()
    }

    pub fn is_connected(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }

    /// Number of outbound calls waiting for a response.
    pub fn in_flight(&self) -> usize {
        self.inner.correlation.in_flight()
    }

    /// Subscribes to lifecycle events from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.inner.events.subscribe()
    }

    /// Resolves once the link has been disconnected.
    pub async fn closed(&self) {
        let mut stopped = self.inner.shutdown.subscribe();
        let _ = stopped.wait_for(|stopped| *stopped).await;
    }

    /// Stops both tasks, fails pending calls and releases the socket.
    ///
    /// Safe to call repeatedly and from any task.
    pub fn disconnect(&self) {
        if !self.inner.running.swap(false, Ordering::AcqRel) {
            return;
        }
        let _ = self.inner.shutdown.send(true);
        self.inner.correlation.close();
        self.inner.reassembler.clear();
        self.lock_frames().reset();

        info!(id = self.inner.id, peer = %self.inner.peer_addr, "Connection closed");
        self.emit(ConnectionEvent::Disconnected {
            id: self.inner.id,
            peer: self.inner.peer_addr,
        });
    }

    /// Issues a request under a fresh tag and waits for its response.
    ///
    /// A zero `timeout` waits until the response arrives or the link drops.
    pub async fn call(&self, request: Bytes, timeout: Duration) -> ServerResult<Bytes> {
        let guard = loop {
            let tag = self.inner.next_tag.fetch_add(1, Ordering::Relaxed);
            match self.inner.correlation.register(tag) {
                Err(ServerError::TagInUse { .. }) => continue,
                registered => break registered?,
            }
        };
        self.exchange(guard, request, timeout).await
    }

    /// Issues a request under a caller-chosen tag and waits for its response.
    ///
    /// Fails immediately if `tag` already has a call in flight.
    pub async fn send_and_wait(
        &self,
        tag: i64,
        request: Bytes,
        timeout: Duration,
    ) -> ServerResult<Bytes> {
        let guard = self.inner.correlation.register(tag)?;
        self.exchange(guard, request, timeout).await
    }

    /// Sends the response for an inbound request. Does not wait.
    pub fn send_response(&self, tag: i64, response: Bytes) -> ServerResult<()> {
        self.send_message(MessageKind::Response, tag, response)
    }

    #[instrument(
        name = "call",
        skip_all,
        fields(connection = self.inner.id, tag = guard.tag(), state = "sending")
    )]
    async fn exchange(
        &self,
        guard: PendingGuard,
        request: Bytes,
        timeout: Duration,
    ) -> ServerResult<Bytes> {
        let tag = guard.tag();
        let span = Span::current();
        if let Err(e) = self.send_message(MessageKind::Request, tag, request) {
            span.record("state", "faulted");
            return Err(e);
        }

        span.record("state", "waiting");
        let outcome = guard.wait(timeout).await;
        match outcome {
            WaitOutcome::Completed(data) => {
                span.record("state", "completed");
                trace!(bytes = data.len(), "Response received");
                Ok(data)
            }
            WaitOutcome::TimedOut => {
                span.record("state", "timed_out");
                debug!(?timeout, "Call timed out");
                Err(ServerError::Timeout { tag, timeout })
            }
            WaitOutcome::Closed => {
                span.record("state", "faulted");
                Err(ServerError::ConnectionClosed { tag })
            }
        }
    }

    /// Fragments, frames and queues one message.
    ///
    /// Every frame is checked against the packet limit before any is queued,
    /// so an oversized message never leaves a partial trail on the wire.
    fn send_message(&self, kind: MessageKind, tag: i64, payload: Bytes) -> ServerResult<()> {
        if !self.is_connected() {
            return Err(ServerError::NotConnected);
        }

        let fragments = self.inner.fragments.split(kind, tag, payload)?;
        let mut frames = Vec::with_capacity(fragments.len());
        {
            let codec = self.lock_frames();
            for fragment in &fragments {
                let encoded = fragment.encode()?;
                codec.check_len(encoded.len()).map_err(|e| {
                    ServerError::config(format!(
                        "{e}: max_fragment_data {} does not fit max_packet_size {}",
                        self.inner.fragments.max_data(),
                        codec.max_packet_size()
                    ))
                })?;
                frames.push(codec.encode(&encoded)?);
            }
        }

        trace!(?kind, tag, fragments = frames.len(), "Queueing message");
        for frame in frames {
            self.inner
                .outbound
                .send(frame)
                .map_err(|_| ServerError::NotConnected)?;
        }
        Ok(())
    }

    fn lock_frames(&self) -> MutexGuard<'_, FrameCodec> {
        self.inner.frames.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: ConnectionEvent) {
        // No subscribers is fine.
        let _ = self.inner.events.send(event);
    }

    fn report(&self, message: String) {
        warn!(id = self.inner.id, error = %message, "Transport error");
        self.emit(ConnectionEvent::TransportError {
            id: self.inner.id,
            message,
        });
    }

    async fn read_loop(self, mut reader: OwnedReadHalf, mut shutdown: watch::Receiver<bool>) {
        let mut buf = vec![0u8; self.inner.config.receive_buffer_size];
        loop {
            let read = tokio::select! {
                _ = shutdown.changed() => break,
                read = reader.read(&mut buf) => read,
            };
            match read {
                Ok(0) => {
                    debug!(id = self.inner.id, "Peer closed the stream");
                    break;
                }
                Ok(n) => {
                    if let Err(e) = self.on_received(&buf[..n]) {
                        self.report(e.to_string());
                        break;
                    }
                }
                Err(e) => {
                    if self.is_connected() {
                        self.report(e.to_string());
                    }
                    break;
                }
            }

            let max_age = self.inner.config.reassembly_timeout;
            if !max_age.is_zero() {
                let evicted = self.inner.reassembler.evict_stale(max_age);
                if evicted > 0 {
                    warn!(id = self.inner.id, evicted, "Dropped stale partial messages");
                }
            }
        }
        self.disconnect();
    }

    /// Deframes received bytes and dispatches every completed message.
    ///
    /// Only framing errors are fatal; a bad fragment inside a well-formed
    /// frame is dropped.
    fn on_received(&self, data: &[u8]) -> ServerResult<()> {
        let frames = {
            let mut codec = self.lock_frames();
            codec.feed(data);
            let mut frames = Vec::new();
            while let Some(frame) = codec.try_take_frame()? {
                frames.push(frame);
            }
            frames
        };

        for frame in frames {
            match Fragment::decode(frame) {
                Ok(fragment) => {
                    if let Err(e) = self.inner.reassembler.push(fragment) {
                        warn!(id = self.inner.id, error = %e, "Dropping fragment");
                    }
                }
                Err(e) => warn!(id = self.inner.id, error = %e, "Dropping malformed fragment"),
            }
        }

        while let Some(message) = self.inner.reassembler.try_pull() {
            self.dispatch(message);
        }
        Ok(())
    }

    fn dispatch(&self, message: Message) {
        match message.kind {
            MessageKind::Response => {
                if !self.inner.correlation.complete(message.tag, message.data) {
                    debug!(
                        id = self.inner.id,
                        tag = message.tag,
                        "Dropping response with no waiting caller"
                    );
                }
            }
            MessageKind::Request => {
                let connection = self.clone();
                tokio::spawn(async move {
                    let response = connection.inner.invoker.handle(&message.data).await;
                    if let Err(e) = connection.send_response(message.tag, response) {
                        debug!(
                            id = connection.inner.id,
                            tag = message.tag,
                            error = %e,
                            "Could not send response"
                        );
                    }
                });
            }
        }
    }

    async fn write_loop(
        self,
        mut writer: OwnedWriteHalf,
        mut outbound: mpsc::UnboundedReceiver<Bytes>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            let frame = tokio::select! {
                _ = shutdown.changed() => break,
                frame = outbound.recv() => frame,
            };
            let Some(frame) = frame else { break };
            if let Err(e) = writer.write_all(&frame).await {
                if self.is_connected() {
                    self.report(e.to_string());
                }
                break;
            }
        }
        let _ = writer.shutdown().await;
        self.disconnect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::{MethodEntry, ParamSpec, Service, ServiceFault};
    use rpcwire_protocol::{
        ErrorCode, Param, RequestEnvelope, decode_response, encode_request,
    };
    use serde_json::{Value, json};
    use tokio::net::TcpListener;

    fn services() -> Arc<ServiceRegistry> {
        let registry = ServiceRegistry::new();
        registry.register(
            Service::new("IService")
                .method(MethodEntry::new(
                    "Echo",
                    vec![ParamSpec::input("text")],
                    |args| Ok(Value::String(args.get(0)?)),
                ))
                .method(MethodEntry::new(
                    "Sleep",
                    vec![ParamSpec::input("ms")],
                    |args| {
                        std::thread::sleep(Duration::from_millis(args.get(0)?));
                        Ok(Value::Null)
                    },
                ))
                .method(MethodEntry::new("HelloMethod", vec![], |_| {
                    Err(ServiceFault::new("Hello from the other side"))
                })),
        );
        Arc::new(registry)
    }

    async fn pair(config: ConnectionConfig) -> (Connection, Connection) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());

        let client = Connection::start(
            client.unwrap(),
            1,
            config.clone(),
            Arc::new(ServiceRegistry::new()),
            Connection::event_channel(),
        )
        .unwrap();
        let server = Connection::start(
            accepted.unwrap().0,
            2,
            config,
            services(),
            Connection::event_channel(),
        )
        .unwrap();
        (client, server)
    }

    fn request(method: &str, params: Vec<Param>) -> Bytes {
        Bytes::from(encode_request(&RequestEnvelope::new("IService", method, params)).unwrap())
    }

    #[tokio::test]
    async fn call_round_trip() {
        let (client, _server) = pair(ConnectionConfig::default()).await;
        let response = client
            .call(
                request("Echo", vec![Param::new("text", "hello")]),
                Duration::from_secs(5),
            )
            .await
            .unwrap();
        let response = decode_response(&response).unwrap();
        assert_eq!(response.result, Some(json!("hello")));
        assert_eq!(client.in_flight(), 0);
    }

    #[tokio::test]
    async fn application_fault_reaches_caller() {
        let (client, _server) = pair(ConnectionConfig::default()).await;
        let response = client
            .call(request("HelloMethod", vec![]), Duration::from_secs(5))
            .await
            .unwrap();
        let error = decode_response(&response).unwrap().error.unwrap();
        assert!(ErrorCode::APPLICATION_RANGE.contains(&error.code.code()));
        assert_eq!(error.data.unwrap().message, "Hello from the other side");
    }

    #[tokio::test]
    async fn concurrent_calls_with_interleaved_fragments() {
        let config = ConnectionConfig::default().with_max_fragment_data(16);
        let (client, _server) = pair(config).await;

        let first = "a".repeat(5_000);
        let second = "b".repeat(7_000);
        let (one, two) = tokio::join!(
            client.call(
                request("Echo", vec![Param::new("text", first.clone())]),
                Duration::from_secs(10),
            ),
            client.call(
                request("Echo", vec![Param::new("text", second.clone())]),
                Duration::from_secs(10),
            ),
        );

        assert_eq!(decode_response(&one.unwrap()).unwrap().result, Some(json!(first)));
        assert_eq!(decode_response(&two.unwrap()).unwrap().result, Some(json!(second)));
    }

    #[tokio::test]
    async fn explicit_tag_in_use_is_rejected() {
        let (client, _server) = pair(ConnectionConfig::default()).await;
        let slow = client.send_and_wait(
            42,
            request("Sleep", vec![Param::new("ms", 200)]),
            Duration::from_secs(5),
        );
        let duplicate = async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            client
                .send_and_wait(42, request("Sleep", vec![Param::new("ms", 0)]), Duration::from_secs(5))
                .await
        };
        let (slow, duplicate) = tokio::join!(slow, duplicate);
        assert!(slow.is_ok());
        assert!(matches!(duplicate, Err(ServerError::TagInUse { tag: 42 })));
    }

    #[tokio::test]
    async fn timeout_releases_tag_and_late_response_is_dropped() {
        let (client, _server) = pair(ConnectionConfig::default()).await;
        let result = client
            .send_and_wait(
                7,
                request("Sleep", vec![Param::new("ms", 150)]),
                Duration::from_millis(20),
            )
            .await;
        assert!(matches!(result, Err(ServerError::Timeout { tag: 7, .. })));
        assert_eq!(client.in_flight(), 0);

        // The late response must not disturb a fresh call on the same tag.
        tokio::time::sleep(Duration::from_millis(200)).await;
        let response = client
            .send_and_wait(
                7,
                request("Echo", vec![Param::new("text", "again")]),
                Duration::from_secs(5),
            )
            .await
            .unwrap();
        assert_eq!(decode_response(&response).unwrap().result, Some(json!("again")));
    }

    #[tokio::test]
    async fn disconnect_fails_pending_calls() {
        let (client, _server) = pair(ConnectionConfig::default()).await;

        let waiting = {
            let client = client.clone();
            tokio::spawn(async move {
                client
                    .call(request("Sleep", vec![Param::new("ms", 500)]), Duration::ZERO)
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;
        client.disconnect();
        client.disconnect();

        assert!(matches!(
            waiting.await.unwrap(),
            Err(ServerError::ConnectionClosed { .. })
        ));
        assert!(matches!(
            client.call(request("Echo", vec![]), Duration::ZERO).await,
            Err(ServerError::NotConnected)
        ));
        client.closed().await;
    }

    #[tokio::test]
    async fn peer_close_is_observed() {
        let (client, server) = pair(ConnectionConfig::default()).await;
        let mut events = server.subscribe();

        client.disconnect();
        tokio::time::timeout(Duration::from_secs(5), server.closed())
            .await
            .unwrap();

        assert!(!server.is_connected());
        let event = events.recv().await.unwrap();
        assert!(matches!(event, ConnectionEvent::Disconnected { id: 2, .. }));
    }

    #[tokio::test]
    async fn connected_event_reaches_early_subscriber() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (stream, _accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());

        let events = Connection::event_channel();
        let mut rx = events.subscribe();
        let connection = Connection::start(
            stream.unwrap(),
            9,
            ConnectionConfig::default(),
            Arc::new(ServiceRegistry::new()),
            events,
        )
        .unwrap();

        assert_eq!(
            rx.recv().await.unwrap(),
            ConnectionEvent::Connected {
                id: 9,
                peer: connection.peer_addr()
            }
        );
    }

    #[tokio::test]
    async fn oversized_fragment_is_rejected_at_send_time() {
        let config = ConnectionConfig::default()
            .with_max_packet_size(255)
            .with_max_fragment_data(1_000);
        let (client, _server) = pair(config).await;

        let result = client
            .call(
                request("Echo", vec![Param::new("text", "x".repeat(500))]),
                Duration::from_secs(1),
            )
            .await;
        assert!(matches!(result, Err(ServerError::Config { .. })));
        assert_eq!(client.in_flight(), 0);

        // Small messages still fit.
        let response = client
            .call(
                request("Echo", vec![Param::new("text", "ok")]),
                Duration::from_secs(5),
            )
            .await
            .unwrap();
        assert_eq!(decode_response(&response).unwrap().result, Some(json!("ok")));
    }
}
