use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use reqwest::Client;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error};

#[derive(Debug, Clone, PartialEq)]
pub struct NotificationListenerEvent {
    pub event_name: String,
    pub data: Option<String>,
}

pub type NotificationEventHandler = Box<dyn Fn(&NotificationListenerEvent) + Send + Sync>;

/// Incremental parser for the server-sent-events line protocol.
///
/// Records are `\n`- or `\r\n`-terminated. `:` lines are comments,
/// `event:` sets the pending event name, `data:` lines accumulate joined by
/// `\n`, and an empty line terminates the event. Anything else is ignored.
#[derive(Debug, Default)]
pub(crate) struct SseParser {
    pending_name: Option<String>,
    pending_data: Option<String>,
    partial_line: String,
}

impl SseParser {
    pub(crate) fn new() -> SseParser {
        SseParser::default()
    }

    pub(crate) fn feed(&mut self, chunk: &str) -> Vec<NotificationListenerEvent> {
        let mut events = Vec::new();
        for ch in chunk.chars() {
            if ch == '\n' {
                let line = std::mem::take(&mut self.partial_line);
                self.process_line(line.strip_suffix('\r').unwrap_or(&line), &mut events);
            } else {
                self.partial_line.push(ch);
            }
        }
        events
    }

    fn process_line(&mut self, line: &str, events: &mut Vec<NotificationListenerEvent>) {
        if line.is_empty() {
            if let Some(event_name) = self.pending_name.take() {
                events.push(NotificationListenerEvent {
                    event_name,
                    data: self.pending_data.take(),
                });
            } else {
                self.pending_data = None;
            }
            return;
        }
        if line.starts_with(':') {
            return;
        }
        if let Some(name) = line.strip_prefix("event:") {
            self.pending_name = Some(name.trim_start().to_string());
            return;
        }
        if let Some(payload) = line.strip_prefix("data:") {
            let payload = payload.strip_prefix(' ').unwrap_or(payload);
            match &mut self.pending_data {
                Some(data) => {
                    data.push('\n');
                    data.push_str(payload);
                }
                None => self.pending_data = Some(payload.to_string()),
            }
        }
    }
}

/// Consumes the push channel and invokes registered handlers per event name.
/// The worker blocks on network reads multiplexed with a cancellation
/// channel; `stop` unblocks an in-flight read and joins the worker.
pub struct NotificationListener {
    listen_url: String,
    app_key: String,
    http: Client,
    handlers: Arc<RwLock<HashMap<String, Vec<NotificationEventHandler>>>>,
    shutdown: watch::Sender<bool>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl NotificationListener {
    pub fn new(listen_url: impl Into<String>, app_key: impl Into<String>, http: Client) -> NotificationListener {
        let (shutdown, _) = watch::channel(false);
        NotificationListener {
            listen_url: listen_url.into(),
            app_key: app_key.into(),
            http,
            handlers: Arc::new(RwLock::new(HashMap::new())),
            shutdown,
            worker: Mutex::new(None),
        }
    }

    pub fn on(&self, event_name: &str, handler: NotificationEventHandler) {
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(event_name.to_string())
            .or_default()
            .push(handler);
    }

    pub fn start(&self) {
        let mut worker = self.worker.lock().unwrap_or_else(PoisonError::into_inner);
        if worker.is_some() {
            return;
        }
        let url = self.listen_url.clone();
        let app_key = self.app_key.clone();
        let http = self.http.clone();
        let handlers = self.handlers.clone();
        let mut shutdown = self.shutdown.subscribe();
        *worker = Some(tokio::spawn(async move {
            let mut response = tokio::select! {
                _ = shutdown.changed() => return,
                connected = http.get(&url).header("app_key", &app_key).send() => match connected {
                    Ok(response) => response,
                    Err(transport_error) => {
                        error!(%transport_error, "failed to open push channel");
                        return;
                    }
                },
            };
            debug!(status = response.status().as_u16(), "push channel open");
            let mut parser = SseParser::new();
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    chunk = response.chunk() => match chunk {
                        Ok(Some(bytes)) => {
                            let text = String::from_utf8_lossy(&bytes);
                            let events = parser.feed(&text);
                            dispatch(&handlers, &events);
                        }
                        Ok(None) => {
                            debug!("push channel closed by server");
                            break;
                        }
                        Err(transport_error) => {
                            error!(%transport_error, "push channel read failed");
                            break;
                        }
                    }
                }
            }
        }));
    }

    pub async fn stop(&self) {
        let _ = self.shutdown.send(true);
        let worker = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(worker) = worker {
            let _ = worker.await;
        }
    }

    /// Feeds raw protocol input through a fresh parser and dispatches the
    /// resulting events; exists for driving the listener without a socket.
    pub fn handle_input(&self, input: &str) {
        let mut parser = SseParser::new();
        let events = parser.feed(input);
        dispatch(&self.handlers, &events);
    }
}

fn dispatch(
    handlers: &Arc<RwLock<HashMap<String, Vec<NotificationEventHandler>>>>,
    events: &[NotificationListenerEvent],
) {
    let handlers = handlers.read().unwrap_or_else(PoisonError::into_inner);
    for event in events {
        if let Some(registered) = handlers.get(&event.event_name) {
            for handler in registered {
                handler(event);
            }
        }
    }
}
