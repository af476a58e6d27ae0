//! Side-channel supervisor
//!
//! During a restore the device pulls resources from the host through a
//! reverse proxy (or, on older stacks, an FDR trust channel). The proxy
//! implementation is a collaborator behind the `SideChannel` trait; the
//! supervisor starts it with the newest protocol it speaks, falls back on
//! rejection, relays its events to the log, and tears it down before the
//! session closes. A missing side channel degrades the restore, it does
//! not abort it.

use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

#[derive(Error, Debug)]
pub enum SideChannelError {
    #[error("device rejected side-channel protocol version {0}")]
    ProtocolRejected(u32),
    #[error("side channel failed: {0}")]
    Failed(String),
}

/// Events surfaced by the proxy implementation.
#[derive(Debug, Clone)]
pub enum ProxyEvent {
    Log(String),
    Status { code: i32, message: String },
}

/// Collaborator seam for the reverse proxy / FDR channel.
pub trait SideChannel: Send {
    /// Start proxying with the given protocol version.
    fn start(&mut self, protocol_version: u32) -> Result<(), SideChannelError>;

    /// Take the proxy's event stream. Yields `None` after the first call.
    fn take_events(&mut self) -> Option<mpsc::UnboundedReceiver<ProxyEvent>>;

    fn shutdown(&mut self);
}

/// Owns the side channel for the span of one restore session.
pub struct SideChannelSupervisor {
    client: Box<dyn SideChannel>,
    forwarder: Option<JoinHandle<()>>,
    active: bool,
}

impl SideChannelSupervisor {
    /// Start the side channel, preferring protocol 2 and falling back to 1.
    /// Failure leaves the supervisor inert; the restore proceeds without it.
    pub fn start(mut client: Box<dyn SideChannel>) -> Self {
        let active = match client.start(2) {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "Device didn't accept new side-channel protocol, trying the old one");
                match client.start(1) {
                    Ok(()) => true,
                    Err(e) => {
                        warn!(error = %e, "Side channel unavailable, continuing without it");
                        false
                    }
                }
            }
        };

        let forwarder = if active {
            info!("Side channel started");
            client.take_events().map(|mut events| {
                tokio::spawn(async move {
                    while let Some(event) = events.recv().await {
                        match event {
                            ProxyEvent::Log(message) => info!(target: "sidechannel", "{message}"),
                            ProxyEvent::Status { code, message } => {
                                info!(target: "sidechannel", code, "{message}")
                            }
                        }
                    }
                })
            })
        } else {
            None
        };

        Self {
            client,
            forwarder,
            active,
        }
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Tear the channel down. Called before the device session closes.
    pub fn shutdown(mut self) {
        if let Some(task) = self.forwarder.take() {
            task.abort();
        }
        self.client.shutdown();
        if self.active {
            info!("Side channel stopped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    struct MockChannel {
        accept_versions: Vec<u32>,
        shut_down: Arc<AtomicBool>,
    }

    impl MockChannel {
        fn accepting(versions: &[u32]) -> (Box<Self>, Arc<AtomicBool>) {
            let flag = Arc::new(AtomicBool::new(false));
            (
                Box::new(Self {
                    accept_versions: versions.to_vec(),
                    shut_down: flag.clone(),
                }),
                flag,
            )
        }
    }

    impl SideChannel for MockChannel {
        fn start(&mut self, protocol_version: u32) -> Result<(), SideChannelError> {
            if self.accept_versions.contains(&protocol_version) {
                Ok(())
            } else {
                Err(SideChannelError::ProtocolRejected(protocol_version))
            }
        }

        fn take_events(&mut self) -> Option<mpsc::UnboundedReceiver<ProxyEvent>> {
            None
        }

        fn shutdown(&mut self) {
            self.shut_down.store(true, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_prefers_protocol_two() {
        let (channel, shut_down) = MockChannel::accepting(&[2]);
        let supervisor = SideChannelSupervisor::start(channel);
        assert!(supervisor.is_active());
        supervisor.shutdown();
        assert!(shut_down.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_falls_back_to_protocol_one() {
        let (channel, _) = MockChannel::accepting(&[1]);
        let supervisor = SideChannelSupervisor::start(channel);
        assert!(supervisor.is_active());
    }

    #[tokio::test]
    async fn test_total_rejection_is_not_fatal() {
        let (channel, shut_down) = MockChannel::accepting(&[]);
        let supervisor = SideChannelSupervisor::start(channel);
        assert!(!supervisor.is_active());
        supervisor.shutdown();
        assert!(shut_down.load(Ordering::SeqCst));
    }
}
