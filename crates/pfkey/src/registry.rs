//! Listener registration: which control channels want asynchronous
//! notifications (expire, acquire) for which SA types, plus per-channel
//! promiscuous flags.

use std::collections::HashSet;
use std::sync::Mutex;

use crate::error::{Error, Result};
use crate::types::SaType;

/// Identifier of one control channel (socket, pipe, test harness slot).
pub type ChannelId = u32;

const SATYPE_SLOTS: usize = 11;

struct RegTables {
    by_satype: [Vec<ChannelId>; SATYPE_SLOTS],
    promisc: HashSet<ChannelId>,
}

/// Registration records: many-to-many between SA types and channels.
pub struct Registry {
    inner: Mutex<RegTables>,
}

impl Registry {
    pub(crate) fn new() -> Self {
        Self {
            inner: Mutex::new(RegTables {
                by_satype: Default::default(),
                promisc: HashSet::new(),
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RegTables> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register `chan` for `satype` notifications. A channel registers a
    /// given type at most once.
    pub fn register(&self, satype: SaType, chan: ChannelId) -> Result<()> {
        let mut t = self.lock();
        let slot = &mut t.by_satype[satype.wire() as usize];
        if slot.contains(&chan) {
            return Err(Error::AlreadyExists(format!(
                "channel {chan} already registered"
            )));
        }
        slot.push(chan);
        Ok(())
    }

    /// Remove every registration and flag for a departed channel.
    pub fn deregister_channel(&self, chan: ChannelId) {
        let mut t = self.lock();
        for slot in t.by_satype.iter_mut() {
            slot.retain(|c| *c != chan);
        }
        t.promisc.remove(&chan);
    }

    /// Channels registered for `satype`. [`SaType::Unspec`] notifications
    /// go to every channel registered for anything.
    pub fn registered(&self, satype: SaType) -> Vec<ChannelId> {
        let t = self.lock();
        if satype == SaType::Unspec {
            let mut out: Vec<ChannelId> = t.by_satype.iter().flatten().copied().collect();
            out.sort_unstable();
            out.dedup();
            return out;
        }
        t.by_satype[satype.wire() as usize].clone()
    }

    /// Whether the channel holds any registration.
    pub fn is_registered(&self, chan: ChannelId) -> bool {
        self.lock().by_satype.iter().any(|s| s.contains(&chan))
    }

    /// Toggle promiscuous delivery for a channel.
    pub fn set_promisc(&self, chan: ChannelId, on: bool) {
        let mut t = self.lock();
        if on {
            t.promisc.insert(chan);
        } else {
            t.promisc.remove(&chan);
        }
    }

    /// Whether the channel asked for promiscuous delivery.
    pub fn is_promisc(&self, chan: ChannelId) -> bool {
        self.lock().promisc.contains(&chan)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_and_duplicate() {
        let reg = Registry::new();
        reg.register(SaType::Esp, 1).unwrap();
        assert!(reg.register(SaType::Esp, 1).is_err());
        // same channel, different type is fine
        reg.register(SaType::Ah, 1).unwrap();
        assert_eq!(reg.registered(SaType::Esp), vec![1]);
        assert!(reg.is_registered(1));
    }

    #[test]
    fn unspec_reaches_every_registered_channel() {
        let reg = Registry::new();
        reg.register(SaType::Esp, 1).unwrap();
        reg.register(SaType::Ah, 2).unwrap();
        reg.register(SaType::Ah, 1).unwrap();
        assert_eq!(reg.registered(SaType::Unspec), vec![1, 2]);
        assert_eq!(reg.registered(SaType::IpComp), Vec::<ChannelId>::new());
    }

    #[test]
    fn deregister_clears_everything() {
        let reg = Registry::new();
        reg.register(SaType::Esp, 7).unwrap();
        reg.set_promisc(7, true);
        assert!(reg.is_promisc(7));
        reg.deregister_channel(7);
        assert!(!reg.is_registered(7));
        assert!(!reg.is_promisc(7));
    }
}
