//! Event bus: MPMC fan-out that decouples long-lived components from
//! external consumers (console UI, logging, etc).

use flume::{Receiver, Sender};

/// Global status event; every long-lived component publishes to the same sink.
#[derive(Debug, Clone)]
pub enum StatusEvent {
    /// Phase-1 screening result.
    Phase1Result { uri: String, reachable: bool },
    /// Phase-2 probe result (including cache hits).
    ProbeResult {
        uri: String,
        status: crate::core::model::Status,
        cached: bool,
    },
    /// Bridge lifecycle transitions.
    BridgeStarted { id: usize, uri: String, port: u16 },
    BridgeStopped { id: usize },
    /// Rotation completed.
    Rotated { id: usize, new_uri: String },
    /// Elastic resize completed.
    Resized { target: usize, actual: usize },
    /// Load balancer state.
    BalancerStarted { port: u16, strategy: String },
    BalancerStopped,
    /// Structured log line.
    Log { level: LogLevel, message: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

#[derive(Clone)]
pub struct EventSender {
    tx: Sender<StatusEvent>,
}

impl EventSender {
    pub fn new(tx: Sender<StatusEvent>) -> Self {
        Self { tx }
    }

    pub fn emit(&self, event: StatusEvent) {
        let _ = self.tx.send(event);
    }

    pub fn log(&self, level: LogLevel, message: impl Into<String>) {
        self.emit(StatusEvent::Log {
            level,
            message: message.into(),
        });
    }

    pub fn info(&self, message: impl Into<String>) {
        self.log(LogLevel::Info, message);
    }

    pub fn warn(&self, message: impl Into<String>) {
        self.log(LogLevel::Warn, message);
    }

    pub fn error(&self, message: impl Into<String>) {
        self.log(LogLevel::Error, message);
    }
}

pub struct EventReceiver {
    rx: Receiver<StatusEvent>,
}

impl EventReceiver {
    pub fn new(rx: Receiver<StatusEvent>) -> Self {
        Self { rx }
    }

    pub fn try_recv(&self) -> Option<StatusEvent> {
        self.rx.try_recv().ok()
    }

    pub async fn recv_async(&self) -> Option<StatusEvent> {
        self.rx.recv_async().await.ok()
    }

    pub fn inner(&self) -> &Receiver<StatusEvent> {
        &self.rx
    }
}

pub fn create_event_channel() -> (EventSender, EventReceiver) {
    let (tx, rx) = flume::unbounded();
    (EventSender::new(tx), EventReceiver::new(rx))
}
