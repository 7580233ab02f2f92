use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use anyhow::Result;
use parking_lot::Mutex;
use tracing::{debug, error, info, trace, warn};

use crate::scheduling::{RecurringScheduler, Token};
use crate::venue::stream::{MessageStream, StreamHandlers, TextCallback};

pub const POLL_INTERVAL: Duration = Duration::from_millis(100);
pub const RETRY_DELAY: Duration = Duration::from_secs(2);

/// A named stream that stays connected: reconnects on close, retries failed
/// connects after a delay and is polled by a recurring job.
pub struct GameSocket {
    name: &'static str,
    stream: Arc<dyn MessageStream>,
    scheduler: Arc<RecurringScheduler>,
    uri: Mutex<Option<String>>,
    retry_at: Mutex<Option<Instant>>,
    polling: Mutex<Option<Token>>,
}

impl GameSocket {
    pub fn new(
        name: &'static str,
        stream: Arc<dyn MessageStream>,
        scheduler: Arc<RecurringScheduler>,
    ) -> Arc<Self> {
        Arc::new(Self {
            name,
            stream,
            scheduler,
            uri: Mutex::new(None),
            retry_at: Mutex::new(None),
            polling: Mutex::new(None),
        })
    }

    pub fn connect<F>(self: &Arc<Self>, uri: String, on_message: F) -> Result<()>
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        info!(socket = self.name, %uri, "connecting");

        *self.uri.lock() = Some(uri.clone());
        self.stream.set_handlers(self.handlers(Arc::new(on_message)));

        if let Err(e) = self.stream.connect(&uri) {
            error!(socket = self.name, "connect failed: {e:#}");
            self.retry_later();
        }

        let mut polling = self.polling.lock();
        if polling.is_none() {
            let socket = Arc::downgrade(self);
            *polling = Some(self.scheduler.insert(POLL_INTERVAL, move || poll_socket(&socket)));
        }

        Ok(())
    }

    fn handlers(self: &Arc<Self>, on_message: TextCallback) -> StreamHandlers {
        let name = self.name;
        let on_close = Arc::downgrade(self);
        let on_fail = Arc::downgrade(self);

        StreamHandlers {
            on_open: Some(Arc::new(move || info!(socket = name, "open"))),
            on_close: Some(Arc::new(move || {
                warn!(socket = name, "closed; reconnecting");
                if let Some(socket) = on_close.upgrade() {
                    socket.reconnect();
                }
            })),
            on_fail: Some(Arc::new(move |reason: &str| {
                error!(socket = name, reason, "failed");
                if let Some(socket) = on_fail.upgrade() {
                    socket.retry_later();
                }
            })),
            on_interrupt: Some(Arc::new(move || info!(socket = name, "interrupted"))),
            on_ping: Some(Arc::new(move |payload: &str| {
                trace!(socket = name, payload, "ping");
                true
            })),
            on_pong: Some(Arc::new(move |payload: &str| trace!(socket = name, payload, "pong"))),
            on_pong_timeout: Some(Arc::new(move |payload: &str| {
                warn!(socket = name, payload, "pong timeout")
            })),
            on_validate: Some(Arc::new(move || {
                debug!(socket = name, "validating connection");
                true
            })),
            on_http: Some(Arc::new(move |status: u16| debug!(socket = name, status, "upgrade response"))),
            on_message: Some(on_message),
        }
    }

    fn reconnect(&self) {
        let Some(uri) = self.uri.lock().clone() else {
            return;
        };

        if let Err(e) = self.stream.connect(&uri) {
            error!(socket = self.name, "reconnect failed: {e:#}");
            self.retry_later();
        }
    }

    fn retry_later(&self) {
        if self.uri.lock().is_some() {
            *self.retry_at.lock() = Some(Instant::now() + RETRY_DELAY);
        }
    }

    fn poll(&self) {
        let retry_due = {
            let mut retry_at = self.retry_at.lock();
            match *retry_at {
                Some(at) if at <= Instant::now() => {
                    *retry_at = None;
                    true
                }
                _ => false,
            }
        };

        if retry_due {
            info!(socket = self.name, "retrying connection");
            self.reconnect();
        }

        self.stream.poll();
    }

    pub fn connected(&self) -> bool {
        self.stream.connected()
    }

    /// Stops reconnecting and closes the stream.
    pub fn disconnect(&self) {
        *self.uri.lock() = None;
        *self.retry_at.lock() = None;
        self.stream.disconnect();
    }
}

fn poll_socket(socket: &Weak<GameSocket>) -> Result<()> {
    if let Some(socket) = socket.upgrade() {
        socket.poll();
    }
    Ok(())
}

impl Drop for GameSocket {
    fn drop(&mut self) {
        if let Some(token) = self.polling.get_mut().take() {
            self.scheduler.erase(token);
        }
    }
}
