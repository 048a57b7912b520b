//! Event system for UI decoupling.
//!
//! Allows CLI/GUI front-ends to follow an update without tight coupling
//! to the protocol engine. Observers are called synchronously and must
//! not block.

use std::fmt;

use tokio::sync::mpsc;

use crate::protocol::ObjectKind;

/// Log level for events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

/// Lifecycle of one `update()` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DfuState {
    /// Connecting and discovering the DFU channels.
    Connecting = 0,
    /// Transferring the init packet.
    Starting = 1,
    /// Transferring the firmware image.
    Uploading = 3,
    /// Waiting for the device to drop the link.
    Disconnecting = 5,
    /// Both objects installed.
    Completed = 6,
    /// Cancelled by `abort()`.
    Aborted = 7,
}

impl fmt::Display for DfuState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DfuState::Connecting => write!(f, "Connecting"),
            DfuState::Starting => write!(f, "Starting"),
            DfuState::Uploading => write!(f, "Uploading"),
            DfuState::Disconnecting => write!(f, "Disconnecting"),
            DfuState::Completed => write!(f, "Completed"),
            DfuState::Aborted => write!(f, "Aborted"),
        }
    }
}

/// Object a progress event refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressObject {
    Init,
    Firmware,
    Unknown,
}

impl From<ObjectKind> for ProgressObject {
    fn from(kind: ObjectKind) -> Self {
        match kind {
            ObjectKind::Command => ProgressObject::Init,
            ObjectKind::Data => ProgressObject::Firmware,
        }
    }
}

impl fmt::Display for ProgressObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProgressObject::Init => write!(f, "init"),
            ProgressObject::Firmware => write!(f, "firmware"),
            ProgressObject::Unknown => write!(f, "unknown"),
        }
    }
}

/// Events emitted by a DFU session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DfuEvent {
    /// Log message.
    Log { level: LogLevel, message: String },
    /// A failure the caller will also see as the `update()` result.
    Error { detail: String },
    /// Lifecycle state changed.
    StateChanged { state: DfuState },
    /// Bytes of `object` written so far.
    Progress {
        object: ProgressObject,
        current: u64,
        total: u64,
    },
}

/// Observer trait for receiving DFU events.
///
/// Implement this trait in your UI layer to receive updates.
pub trait DfuObserver: Send + Sync {
    /// Called when an event occurs.
    fn on_event(&self, event: &DfuEvent);
}

/// No-op observer that discards all events.
pub struct NullObserver;

impl DfuObserver for NullObserver {
    fn on_event(&self, _event: &DfuEvent) {}
}

/// Observer that logs events using tracing.
pub struct TracingObserver;

impl DfuObserver for TracingObserver {
    fn on_event(&self, event: &DfuEvent) {
        match event {
            DfuEvent::Log { level, message } => match level {
                LogLevel::Trace => tracing::trace!("{}", message),
                LogLevel::Debug => tracing::debug!("{}", message),
                LogLevel::Info => tracing::info!("{}", message),
                LogLevel::Warn => tracing::warn!("{}", message),
                LogLevel::Error => tracing::error!("{}", message),
            },
            DfuEvent::Error { detail } => {
                tracing::error!("Error: {}", detail);
            }
            DfuEvent::StateChanged { state } => {
                tracing::info!(state = %state, "State changed");
            }
            DfuEvent::Progress {
                object,
                current,
                total,
            } => {
                let pct = if *total > 0 {
                    (*current * 100) / *total
                } else {
                    0
                };
                tracing::debug!(object = %object, progress = %format!("{}%", pct), "Progress");
            }
        }
    }
}

/// Observer that forwards events into an unbounded channel.
///
/// Sending never blocks; events are dropped once the receiver is gone.
pub struct ChannelObserver {
    tx: mpsc::UnboundedSender<DfuEvent>,
}

impl ChannelObserver {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<DfuEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl DfuObserver for ChannelObserver {
    fn on_event(&self, event: &DfuEvent) {
        let _ = self.tx.send(event.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_codes() {
        assert_eq!(DfuState::Connecting as u8, 0);
        assert_eq!(DfuState::Starting as u8, 1);
        assert_eq!(DfuState::Uploading as u8, 3);
        assert_eq!(DfuState::Disconnecting as u8, 5);
        assert_eq!(DfuState::Completed as u8, 6);
        assert_eq!(DfuState::Aborted as u8, 7);
    }

    #[test]
    fn test_progress_object_labels() {
        assert_eq!(ProgressObject::from(ObjectKind::Command).to_string(), "init");
        assert_eq!(ProgressObject::from(ObjectKind::Data).to_string(), "firmware");
        assert_eq!(ProgressObject::Unknown.to_string(), "unknown");
    }

    #[test]
    fn test_channel_observer_forwards() {
        let (observer, mut rx) = ChannelObserver::new();
        observer.on_event(&DfuEvent::StateChanged {
            state: DfuState::Uploading,
        });
        assert_eq!(
            rx.try_recv().unwrap(),
            DfuEvent::StateChanged {
                state: DfuState::Uploading
            }
        );

        drop(rx);
        observer.on_event(&DfuEvent::Error {
            detail: "ignored".into(),
        });
    }
}
