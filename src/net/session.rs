use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};

use crate::config::Config;
use crate::error::{ChimeError, Result};
use crate::net::protocol::{ClientMessage, ServerMessage};

/// Capacity of each per-session outbound queue.
const OUTBOUND_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Open,
    Closed,
    Failed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Connecting => "connecting",
            Self::Open => "open",
            Self::Closed => "closed",
            Self::Failed => "failed",
        })
    }
}

/// An open transport: a queue into the socket and a stream out of it.
///
/// Dropping `outbound` closes the transport. `inbound` ends when the server
/// goes away; an `Err` item reports why.
pub struct Link {
    pub outbound: mpsc::Sender<ClientMessage>,
    pub inbound: mpsc::Receiver<Result<ServerMessage>>,
}

/// Opens transports to the dialogue service.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn open(&self, config: &Config) -> Result<Link>;
}

#[derive(Debug)]
pub enum SessionEvent {
    /// Setup acknowledged; the session is usable.
    Opened,
    Message(ServerMessage),
    /// The server or transport ended the session.
    Closed { reason: String },
    /// The session could not be established or broke mid-stream.
    Failed(ChimeError),
}

/// A session event stamped with the generation it belongs to.
#[derive(Debug)]
pub struct Envelope {
    pub generation: u64,
    pub event: SessionEvent,
}

struct SessionHandle {
    generation: u64,
    outbound: mpsc::Sender<ClientMessage>,
    close: Option<oneshot::Sender<()>>,
}

/// The single duplex session. Every `connect` bumps the generation. Sends
/// from an older generation never reach the wire, and inbound events carry
/// their generation so stale ones can be dropped.
pub struct SessionChannel {
    connector: Arc<dyn Connector>,
    config: Arc<Config>,
    events: mpsc::Sender<Envelope>,
    current: Arc<AtomicU64>,
    handle: Option<SessionHandle>,
}

impl SessionChannel {
    #[must_use]
    pub fn new(
        connector: Arc<dyn Connector>,
        config: Arc<Config>,
        events: mpsc::Sender<Envelope>,
    ) -> Self {
        Self {
            connector,
            config,
            events,
            current: Arc::new(AtomicU64::new(0)),
            handle: None,
        }
    }

    /// True if `generation` is the session currently installed.
    #[must_use]
    pub fn is_current(&self, generation: u64) -> bool {
        self.handle
            .as_ref()
            .is_some_and(|h| h.generation == generation)
    }

    /// Start a new session, replacing any existing one. Returns its generation.
    ///
    /// The outbound queue exists immediately, so sends made while the session
    /// is still connecting wait for it rather than going anywhere else.
    pub fn connect(&mut self) -> u64 {
        self.close();

        let generation = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_CAPACITY);
        let (close_tx, close_rx) = oneshot::channel();

        let task = SessionTask {
            generation,
            connector: Arc::clone(&self.connector),
            config: Arc::clone(&self.config),
            events: self.events.clone(),
            current: Arc::clone(&self.current),
        };
        tokio::spawn(task.run(outbound_rx, close_rx));

        self.handle = Some(SessionHandle {
            generation,
            outbound: outbound_tx,
            close: Some(close_tx),
        });

        tracing::info!("session {generation}: connecting");
        generation
    }

    /// Queue a message on the latest session. Returns `false` if it was dropped.
    pub fn send(&self, message: ClientMessage) -> bool {
        let Some(handle) = self.handle.as_ref() else {
            tracing::debug!("no session, dropping {}", message.kind());
            return false;
        };

        match handle.outbound.try_send(message) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(m)) => {
                tracing::warn!(
                    "session {}: outbound queue full, dropping {}",
                    handle.generation,
                    m.kind()
                );
                false
            }
            Err(mpsc::error::TrySendError::Closed(m)) => {
                tracing::debug!(
                    "session {}: closed, dropping {}",
                    handle.generation,
                    m.kind()
                );
                false
            }
        }
    }

    /// Close the current session. Best-effort; never fails.
    pub fn close(&mut self) {
        let Some(mut handle) = self.handle.take() else {
            return;
        };
        if let Some(close) = handle.close.take()
            && close.send(()).is_err()
        {
            tracing::debug!("session {}: task already gone", handle.generation);
        }
        tracing::info!("session {}: closed", handle.generation);
    }
}

impl Drop for SessionChannel {
    fn drop(&mut self) {
        self.close();
    }
}

struct SessionTask {
    generation: u64,
    connector: Arc<dyn Connector>,
    config: Arc<Config>,
    events: mpsc::Sender<Envelope>,
    current: Arc<AtomicU64>,
}

impl SessionTask {
    fn is_stale(&self) -> bool {
        self.current.load(Ordering::SeqCst) != self.generation
    }

    async fn emit(&self, event: SessionEvent) -> bool {
        self.events
            .send(Envelope {
                generation: self.generation,
                event,
            })
            .await
            .is_ok()
    }

    async fn run(
        self,
        mut outbound: mpsc::Receiver<ClientMessage>,
        mut close: oneshot::Receiver<()>,
    ) {
        let generation = self.generation;

        let link = tokio::select! {
            biased;
            _ = &mut close => {
                tracing::debug!("session {generation}: closed while connecting");
                return;
            }
            link = self.connector.open(&self.config) => link,
        };

        let mut link = match link {
            Ok(link) => link,
            Err(e) => {
                tracing::error!("session {generation}: connect failed: {e}");
                self.emit(SessionEvent::Failed(connection_error(e))).await;
                return;
            }
        };

        if let Err(e) = self.handshake(&mut link, &mut close).await {
            if let Some(e) = e {
                tracing::error!("session {generation}: setup failed: {e}");
                self.emit(SessionEvent::Failed(e)).await;
            }
            return;
        }

        tracing::info!("session {generation}: open");
        if !self.emit(SessionEvent::Opened).await {
            return;
        }

        loop {
            tokio::select! {
                biased;
                _ = &mut close => {
                    tracing::debug!("session {generation}: close requested");
                    break;
                }
                incoming = link.inbound.recv() => match incoming {
                    Some(Ok(message)) => {
                        if !self.emit(SessionEvent::Message(message)).await {
                            break;
                        }
                    }
                    Some(Err(e)) => {
                        tracing::error!("session {generation}: transport error: {e}");
                        self.emit(SessionEvent::Failed(connection_error(e))).await;
                        break;
                    }
                    None => {
                        tracing::info!("session {generation}: server closed the connection");
                        self.emit(SessionEvent::Closed {
                            reason: "server closed the connection".to_string(),
                        })
                        .await;
                        break;
                    }
                },
                queued = outbound.recv() => {
                    let Some(message) = queued else {
                        break;
                    };
                    if self.is_stale() {
                        tracing::debug!(
                            "session {generation}: superseded, discarding {}",
                            message.kind()
                        );
                        continue;
                    }
                    if link.outbound.send(message).await.is_err() {
                        tracing::warn!("session {generation}: transport went away mid-send");
                        self.emit(SessionEvent::Closed {
                            reason: "transport closed".to_string(),
                        })
                        .await;
                        break;
                    }
                }
            }
        }
        // Dropping the link closes the transport.
    }

    /// Send setup and wait for the acknowledgement. `Err(None)` means the
    /// session was closed locally in the meantime.
    async fn handshake(
        &self,
        link: &mut Link,
        close: &mut oneshot::Receiver<()>,
    ) -> std::result::Result<(), Option<ChimeError>> {
        link.outbound
            .send(ClientMessage::setup(&self.config))
            .await
            .map_err(|_| {
                Some(ChimeError::Connection(
                    "transport closed before setup".to_string(),
                ))
            })?;

        loop {
            tokio::select! {
                biased;
                _ = &mut *close => return Err(None),
                incoming = link.inbound.recv() => match incoming {
                    Some(Ok(message)) if message.is_setup_complete() => return Ok(()),
                    Some(Ok(_)) => {
                        tracing::debug!("session {}: message before setupComplete, ignoring", self.generation);
                    }
                    Some(Err(e)) => return Err(Some(connection_error(e))),
                    None => {
                        return Err(Some(ChimeError::Connection(
                            "connection closed during setup".to_string(),
                        )));
                    }
                },
            }
        }
    }
}

/// Transport failures surface as `Connection` unless they already carry a
/// more specific kind (a missing API key stays a config error).
fn connection_error(e: ChimeError) -> ChimeError {
    match e {
        ChimeError::Connection(_) | ChimeError::Config(_) => e,
        other => ChimeError::Connection(other.to_string()),
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;
    use tokio::sync::{mpsc, oneshot};

    use super::{Connector, Link};
    use crate::config::Config;
    use crate::error::{ChimeError, Result};
    use crate::net::protocol::{ClientMessage, ServerMessage};

    /// Server side of one fake transport.
    pub struct FakeServer {
        pub from_client: mpsc::Receiver<ClientMessage>,
        pub to_client: mpsc::Sender<Result<ServerMessage>>,
    }

    impl FakeServer {
        pub async fn recv(&mut self) -> Option<ClientMessage> {
            self.from_client.recv().await
        }

        pub async fn push(&self, message: ServerMessage) {
            let _ = self.to_client.send(Ok(message)).await;
        }

        pub async fn push_json(&self, raw: &str) {
            let message =
                ServerMessage::parse(raw.as_bytes()).unwrap_or_else(|e| panic!("{e}"));
            self.push(message).await;
        }

        /// Receive the setup message and acknowledge it.
        pub async fn accept(&mut self) {
            match self.recv().await {
                Some(ClientMessage::Setup(_)) => {}
                other => panic!("expected setup, got {other:?}"),
            }
            self.push_json(r#"{"setupComplete":{}}"#).await;
        }
    }

    #[derive(Default)]
    struct Inner {
        servers: Vec<FakeServer>,
        gates: Vec<oneshot::Receiver<()>>,
        fail_next: Option<String>,
        opens: usize,
    }

    /// Connector handing out in-memory transports. Each `open` parks a
    /// `FakeServer` for the test to pick up with `next_server`.
    #[derive(Clone, Default)]
    pub struct FakeConnector {
        inner: Arc<Mutex<Inner>>,
        notify: Arc<tokio::sync::Notify>,
    }

    impl FakeConnector {
        fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
            self.inner.lock().unwrap_or_else(|e| panic!("{e}"))
        }

        pub fn fail_next(&self, reason: &str) {
            self.lock().fail_next = Some(reason.to_string());
        }

        /// Hold the next `open` until the returned sender fires.
        pub fn gate_next(&self) -> oneshot::Sender<()> {
            let (tx, rx) = oneshot::channel();
            self.lock().gates.push(rx);
            tx
        }

        pub fn opens(&self) -> usize {
            self.lock().opens
        }

        pub async fn next_server(&self) -> FakeServer {
            loop {
                let notified = self.notify.notified();
                if let Some(server) = {
                    let mut inner = self.lock();
                    if inner.servers.is_empty() {
                        None
                    } else {
                        Some(inner.servers.remove(0))
                    }
                } {
                    return server;
                }
                notified.await;
            }
        }
    }

    #[async_trait]
    impl Connector for FakeConnector {
        async fn open(&self, _config: &Config) -> Result<Link> {
            let gate = {
                let mut inner = self.lock();
                inner.opens += 1;
                if inner.gates.is_empty() {
                    None
                } else {
                    Some(inner.gates.remove(0))
                }
            };
            if let Some(gate) = gate {
                let _ = gate.await;
            }

            if let Some(reason) = self.lock().fail_next.take() {
                return Err(ChimeError::Connection(reason));
            }

            let (out_tx, out_rx) = mpsc::channel(256);
            let (in_tx, in_rx) = mpsc::channel(256);
            self.lock().servers.push(FakeServer {
                from_client: out_rx,
                to_client: in_tx,
            });
            self.notify.notify_waiters();
            Ok(Link {
                outbound: out_tx,
                inbound: in_rx,
            })
        }
    }
}
