use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::{self, Message};
use tracing::{debug, error};
use url::Url;

use crate::scheduling::task_queue::panic_message;

pub type Callback = Arc<dyn Fn() + Send + Sync>;
pub type TextCallback = Arc<dyn Fn(&str) + Send + Sync>;
pub type VetoCallback = Arc<dyn Fn() -> bool + Send + Sync>;
pub type TextVetoCallback = Arc<dyn Fn(&str) -> bool + Send + Sync>;
pub type StatusCallback = Arc<dyn Fn(u16) + Send + Sync>;

/// Lifecycle and traffic of one stream connection, in arrival order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    Open,
    Close,
    Fail(String),
    Interrupt,
    Ping(String),
    Pong(String),
    PongTimeout(String),
    Http(u16),
    Message(String),
}

/// Reactions to stream events. Unset handlers ignore the event.
#[derive(Clone, Default)]
pub struct StreamHandlers {
    pub on_open: Option<Callback>,
    pub on_close: Option<Callback>,
    pub on_fail: Option<TextCallback>,
    pub on_interrupt: Option<Callback>,
    /// Returning false vetoes the pong reply.
    pub on_ping: Option<TextVetoCallback>,
    pub on_pong: Option<TextCallback>,
    pub on_pong_timeout: Option<TextCallback>,
    /// Returning false vetoes the connection attempt.
    pub on_validate: Option<VetoCallback>,
    pub on_http: Option<StatusCallback>,
    pub on_message: Option<TextCallback>,
}

impl StreamHandlers {
    /// Runs the matching handler. A panicking handler is logged and treated
    /// as accepting. Returns false only when a ping handler vetoed.
    pub fn dispatch(&self, event: &StreamEvent) -> bool {
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| match event {
            StreamEvent::Open => call(&self.on_open),
            StreamEvent::Close => call(&self.on_close),
            StreamEvent::Interrupt => call(&self.on_interrupt),
            StreamEvent::Fail(reason) => call_text(&self.on_fail, reason),
            StreamEvent::Pong(payload) => call_text(&self.on_pong, payload),
            StreamEvent::PongTimeout(payload) => call_text(&self.on_pong_timeout, payload),
            StreamEvent::Message(text) => call_text(&self.on_message, text),
            StreamEvent::Http(status) => {
                if let Some(handler) = &self.on_http {
                    handler(*status);
                }
                true
            }
            StreamEvent::Ping(payload) => self.on_ping.as_ref().is_none_or(|handler| handler(payload.as_str())),
        }));

        outcome.unwrap_or_else(|payload| {
            error!("stream handler panicked: {}", panic_message(payload.as_ref()));
            true
        })
    }

    pub fn validate(&self) -> bool {
        self.on_validate.as_ref().is_none_or(|handler| handler())
    }
}

fn call(handler: &Option<Callback>) -> bool {
    if let Some(handler) = handler {
        handler();
    }
    true
}

fn call_text(handler: &Option<TextCallback>, text: &str) -> bool {
    if let Some(handler) = handler {
        handler(text);
    }
    true
}

/// Connection-oriented text stream. Events are delivered by `poll` on the
/// caller's thread.
pub trait MessageStream: Send + Sync {
    fn set_handlers(&self, handlers: StreamHandlers);
    /// Replaces any current connection.
    fn connect(&self, uri: &str) -> Result<()>;
    fn send(&self, text: &str) -> Result<()>;
    /// Dispatches queued events; returns how many.
    fn poll(&self) -> usize;
    fn connected(&self) -> bool;
    fn disconnect(&self);
}

#[derive(Debug, Clone, Copy)]
pub struct Keepalive {
    pub interval: Duration,
    pub timeout: Duration,
}

impl Default for Keepalive {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(20),
            timeout: Duration::from_secs(10),
        }
    }
}

struct Connection {
    outgoing: mpsc::UnboundedSender<String>,
    events: mpsc::UnboundedReceiver<StreamEvent>,
    connected: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

/// `tokio-tungstenite` client. The socket lives on the runtime; its events
/// queue up until the owner polls.
pub struct WebSocketStream {
    runtime: Handle,
    keepalive: Keepalive,
    handlers: Mutex<StreamHandlers>,
    connection: Mutex<Option<Connection>>,
}

impl WebSocketStream {
    pub fn new(runtime: Handle, keepalive: Keepalive) -> Self {
        Self {
            runtime,
            keepalive,
            handlers: Mutex::new(StreamHandlers::default()),
            connection: Mutex::new(None),
        }
    }
}

impl MessageStream for WebSocketStream {
    fn set_handlers(&self, handlers: StreamHandlers) {
        *self.handlers.lock() = handlers;
    }

    fn connect(&self, uri: &str) -> Result<()> {
        let url = Url::parse(uri).with_context(|| format!("invalid stream uri {uri}"))?;
        if !matches!(url.scheme(), "ws" | "wss") {
            bail!("unsupported stream scheme: {}", url.scheme());
        }

        let handlers = self.handlers.lock().clone();
        if !handlers.validate() {
            handlers.dispatch(&StreamEvent::Fail("connection vetoed".to_string()));
            return Ok(());
        }

        let (outgoing, outgoing_rx) = mpsc::unbounded_channel();
        let (events_tx, events) = mpsc::unbounded_channel();
        let connected = Arc::new(AtomicBool::new(false));

        let task = self.runtime.spawn(run_connection(
            url.to_string(),
            self.keepalive,
            events_tx,
            outgoing_rx,
            connected.clone(),
        ));

        let previous = self.connection.lock().replace(Connection {
            outgoing,
            events,
            connected,
            task,
        });

        if let Some(previous) = previous {
            previous.task.abort();
        }

        Ok(())
    }

    fn send(&self, text: &str) -> Result<()> {
        let guard = self.connection.lock();
        match guard.as_ref() {
            Some(connection) if connection.connected.load(Ordering::Acquire) => connection
                .outgoing
                .send(text.to_string())
                .map_err(|_| anyhow::anyhow!("stream writer has stopped")),
            _ => bail!("stream not connected"),
        }
    }

    fn poll(&self) -> usize {
        let events = {
            let mut guard = self.connection.lock();
            let Some(connection) = guard.as_mut() else {
                return 0;
            };

            let mut events = Vec::new();
            while let Ok(event) = connection.events.try_recv() {
                events.push(event);
            }
            events
        };

        // Handlers may reconnect, so they run with no lock held.
        let handlers = self.handlers.lock().clone();
        for event in &events {
            if !handlers.dispatch(event) {
                debug!(?event, "ping vetoed; pong already sent");
            }
        }

        events.len()
    }

    fn connected(&self) -> bool {
        self.connection
            .lock()
            .as_ref()
            .is_some_and(|connection| connection.connected.load(Ordering::Acquire))
    }

    fn disconnect(&self) {
        let Some(connection) = self.connection.lock().take() else {
            return;
        };

        connection.task.abort();
        connection.connected.store(false, Ordering::Release);

        let handlers = self.handlers.lock().clone();
        handlers.dispatch(&StreamEvent::Interrupt);
    }
}

impl Drop for WebSocketStream {
    fn drop(&mut self) {
        if let Some(connection) = self.connection.get_mut().take() {
            connection.task.abort();
        }
    }
}

async fn run_connection(
    uri: String,
    keepalive: Keepalive,
    events: mpsc::UnboundedSender<StreamEvent>,
    mut outgoing: mpsc::UnboundedReceiver<String>,
    connected: Arc<AtomicBool>,
) {
    let emit = |event: StreamEvent| {
        // The receiver is gone once the connection has been replaced.
        let _ = events.send(event);
    };

    let (stream, response) = match connect_async(uri.as_str()).await {
        Ok(pair) => pair,
        Err(tungstenite::Error::Http(response)) => {
            emit(StreamEvent::Http(response.status().as_u16()));
            emit(StreamEvent::Fail(format!("handshake rejected: {}", response.status())));
            return;
        }
        Err(e) => {
            emit(StreamEvent::Fail(e.to_string()));
            return;
        }
    };

    emit(StreamEvent::Http(response.status().as_u16()));
    connected.store(true, Ordering::Release);
    emit(StreamEvent::Open);
    debug!(uri, "stream connected");

    let (mut writer, mut reader) = stream.split();
    let mut heartbeat = time::interval_at(Instant::now() + keepalive.interval, keepalive.interval);
    let mut awaiting_pong: Option<(Instant, String)> = None;
    let mut pings_sent: u64 = 0;

    let outcome = loop {
        let pong_deadline = awaiting_pong.as_ref().map(|(deadline, _)| *deadline);

        tokio::select! {
            message = reader.next() => {
                match message {
                    Some(Ok(Message::Text(text))) => emit(StreamEvent::Message(text)),
                    Some(Ok(Message::Binary(binary))) => {
                        if let Ok(text) = String::from_utf8(binary) {
                            emit(StreamEvent::Message(text));
                        }
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        emit(StreamEvent::Ping(String::from_utf8_lossy(&payload).into_owned()));
                    }
                    Some(Ok(Message::Pong(payload))) => {
                        awaiting_pong = None;
                        emit(StreamEvent::Pong(String::from_utf8_lossy(&payload).into_owned()));
                    }
                    Some(Ok(Message::Close(frame))) => {
                        debug!(uri, ?frame, "stream closed by peer");
                        break Ok(());
                    }
                    Some(Ok(Message::Frame(_))) => {}
                    Some(Err(e)) => break Err(e.to_string()),
                    None => break Ok(()),
                }
            }
            Some(text) = outgoing.recv() => {
                if let Err(e) = writer.send(Message::Text(text)).await {
                    break Err(e.to_string());
                }
            }
            _ = heartbeat.tick() => {
                if awaiting_pong.is_none() {
                    pings_sent += 1;
                    let payload = format!("keepalive-{pings_sent}");
                    if let Err(e) = writer.send(Message::Ping(payload.clone().into_bytes())).await {
                        break Err(e.to_string());
                    }
                    awaiting_pong = Some((Instant::now() + keepalive.timeout, payload));
                }
            }
            _ = sleep_until(pong_deadline) => {
                if let Some((_, payload)) = awaiting_pong.take() {
                    emit(StreamEvent::PongTimeout(payload));
                }
                break Ok(());
            }
        }
    };

    connected.store(false, Ordering::Release);

    match outcome {
        Ok(()) => emit(StreamEvent::Close),
        Err(reason) => emit(StreamEvent::Fail(reason)),
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
