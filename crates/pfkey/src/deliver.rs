//! The message delivery capability and an in-process implementation.
//!
//! The engine never touches sockets; finished messages go through a
//! [`MessageSink`]. [`EventHub`] is the bundled implementation: each
//! control channel is a tokio mpsc queue that can be consumed as a
//! [`MonitorStream`].

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio_stream::Stream;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::trace;

use crate::error::{Error, Result};
use crate::registry::{ChannelId, Registry};
use crate::types::SaType;

/// Who receives a finished message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryTarget {
    /// The named channel only (request/reply traffic).
    One(ChannelId),
    /// Every attached channel.
    All,
    /// Channels registered for this SA type (asynchronous
    /// notifications).
    Registered(SaType),
}

/// Delivery capability: hand a serialized message to its recipients.
///
/// `origin` names the channel the triggering request came in on, if any;
/// sinks may use it for promiscuous mirroring.
pub trait MessageSink: Send + Sync {
    /// Deliver `msg` to `target`.
    fn deliver(&self, origin: Option<ChannelId>, target: DeliveryTarget, msg: Bytes)
    -> Result<()>;
}

/// In-process delivery hub backed by unbounded tokio channels.
///
/// Shares the engine's [`Registry`] so it can resolve
/// [`DeliveryTarget::Registered`] itself.
pub struct EventHub {
    registry: Arc<Registry>,
    channels: Mutex<HashMap<ChannelId, mpsc::UnboundedSender<Bytes>>>,
}

impl EventHub {
    /// New hub resolving registered targets against `registry`.
    pub fn new(registry: Arc<Registry>) -> Self {
        Self {
            registry,
            channels: Mutex::new(HashMap::new()),
        }
    }

    /// Attach a channel and get the stream of messages delivered to it.
    /// Re-attaching an id replaces the previous stream.
    pub fn attach(&self, chan: ChannelId) -> MonitorStream {
        let (tx, rx) = mpsc::unbounded_channel();
        self.channels
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(chan, tx);
        MonitorStream { rx }
    }

    /// Detach a channel and drop its registrations.
    pub fn detach(&self, chan: ChannelId) {
        self.channels
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&chan);
        self.registry.deregister_channel(chan);
    }

    fn send_to(&self, chan: ChannelId, msg: &Bytes) -> bool {
        let map = self.channels.lock().unwrap_or_else(|e| e.into_inner());
        match map.get(&chan) {
            Some(tx) => tx.send(msg.clone()).is_ok(),
            None => false,
        }
    }

    fn all_channels(&self) -> Vec<ChannelId> {
        self.channels
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .copied()
            .collect()
    }
}

impl MessageSink for EventHub {
    fn deliver(
        &self,
        _origin: Option<ChannelId>,
        target: DeliveryTarget,
        msg: Bytes,
    ) -> Result<()> {
        match target {
            DeliveryTarget::One(chan) => {
                if !self.send_to(chan, &msg) {
                    return Err(Error::Delivery(format!("channel {chan} is gone")));
                }
            }
            DeliveryTarget::All => {
                for chan in self.all_channels() {
                    self.send_to(chan, &msg);
                }
            }
            DeliveryTarget::Registered(satype) => {
                let mut reached = 0usize;
                for chan in self.registry.registered(satype) {
                    if self.send_to(chan, &msg) {
                        reached += 1;
                    }
                }
                trace!(?satype, reached, "delivered registered notification");
            }
        }
        Ok(())
    }
}

/// Stream of messages delivered to one attached channel.
pub struct MonitorStream {
    rx: mpsc::UnboundedReceiver<Bytes>,
}

impl MonitorStream {
    /// Receive the next message, if the hub side is still attached.
    pub async fn recv(&mut self) -> Option<Bytes> {
        self.rx.recv().await
    }

    /// Non-blocking drain of everything currently queued.
    pub fn drain(&mut self) -> Vec<Bytes> {
        let mut out = Vec::new();
        while let Ok(msg) = self.rx.try_recv() {
            out.push(msg);
        }
        out
    }

    /// Adapter for stream combinators.
    pub fn into_stream(self) -> UnboundedReceiverStream<Bytes> {
        UnboundedReceiverStream::new(self.rx)
    }
}

impl Stream for MonitorStream {
    type Item = Bytes;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hub() -> (Arc<Registry>, EventHub) {
        let registry = Arc::new(Registry::new());
        let hub = EventHub::new(registry.clone());
        (registry, hub)
    }

    #[tokio::test]
    async fn one_and_all_delivery() {
        let (_reg, hub) = hub();
        let mut a = hub.attach(1);
        let mut b = hub.attach(2);
        hub.deliver(None, DeliveryTarget::One(1), Bytes::from_static(b"x"))
            .unwrap();
        hub.deliver(None, DeliveryTarget::All, Bytes::from_static(b"y"))
            .unwrap();
        assert_eq!(a.drain().len(), 2);
        assert_eq!(b.drain().len(), 1);
    }

    #[tokio::test]
    async fn registered_delivery_respects_registry() {
        let (reg, hub) = hub();
        let mut a = hub.attach(1);
        let mut b = hub.attach(2);
        reg.register(SaType::Esp, 2).unwrap();
        hub.deliver(
            None,
            DeliveryTarget::Registered(SaType::Esp),
            Bytes::from_static(b"n"),
        )
        .unwrap();
        assert!(a.drain().is_empty());
        assert_eq!(b.drain().len(), 1);
    }

    #[tokio::test]
    async fn one_to_missing_channel_errors() {
        let (_reg, hub) = hub();
        let err = hub
            .deliver(None, DeliveryTarget::One(9), Bytes::from_static(b"x"))
            .unwrap_err();
        assert!(matches!(err, Error::Delivery(_)));
    }

    #[tokio::test]
    async fn detach_drops_registrations() {
        let (reg, hub) = hub();
        let _s = hub.attach(3);
        reg.register(SaType::Ah, 3).unwrap();
        hub.detach(3);
        assert!(!reg.is_registered(3));
        assert!(
            hub.deliver(None, DeliveryTarget::One(3), Bytes::from_static(b"x"))
                .is_err()
        );
    }

    #[tokio::test]
    async fn stream_interface() {
        use tokio_stream::StreamExt;
        let (_reg, hub) = hub();
        let mut s = hub.attach(4);
        hub.deliver(None, DeliveryTarget::One(4), Bytes::from_static(b"m"))
            .unwrap();
        let got = s.next().await.unwrap();
        assert_eq!(&got[..], b"m");
    }
}
