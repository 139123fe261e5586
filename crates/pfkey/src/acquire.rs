//! Pending-negotiation bookkeeping.
//!
//! One record exists per in-flight negotiation; its counter suppresses
//! floods of identical negotiation requests until either a response
//! arrives (which resets the pressure) or the sweeper reaps the record.

use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};

use crate::types::{SaIndex, SaidxMatch, SpIndex};

/// One pending SA negotiation.
#[derive(Debug, Clone)]
pub struct AcquireRecord {
    /// The association identity being negotiated.
    pub saidx: SaIndex,
    /// Sequence number carried by the negotiation request; a GETSPI/ADD
    /// quoting it marks this negotiation as progressing.
    pub seq: u32,
    /// Creation time, seconds.
    pub created: u64,
    /// Suppressed repeats since the last emitted request.
    pub count: u32,
}

/// Decision from [`AcquireList::note`].
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum AcquireDecision {
    /// Emit a negotiation request with this sequence number.
    Emit(u32),
    /// Within the suppression window; nothing to send.
    Suppressed,
}

/// The list of pending SA negotiations.
pub struct AcquireList {
    inner: Mutex<Vec<AcquireRecord>>,
    seq: AtomicU32,
}

impl AcquireList {
    pub(crate) fn new() -> Self {
        Self {
            inner: Mutex::new(Vec::new()),
            seq: AtomicU32::new(0),
        }
    }

    fn next_seq(&self) -> u32 {
        // sequence numbers are nonzero so replies can always reference one
        let s = self.seq.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
        if s == 0 { self.next_seq() } else { s }
    }

    /// Record negotiation pressure for `saidx`.
    ///
    /// A missing record creates one and asks the caller to emit; an
    /// existing record suppresses up to `threshold` repeats, after which
    /// its counter resets and a fresh request goes out under the original
    /// sequence number.
    pub(crate) fn note(&self, saidx: &SaIndex, now: u64, threshold: u32) -> AcquireDecision {
        let mut list = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(rec) = list
            .iter_mut()
            .find(|r| r.saidx.matches(saidx, SaidxMatch::Exact))
        {
            if rec.count < threshold {
                rec.count += 1;
                return AcquireDecision::Suppressed;
            }
            rec.count = 0;
            return AcquireDecision::Emit(rec.seq);
        }
        let seq = self.next_seq();
        list.push(AcquireRecord {
            saidx: saidx.clone(),
            seq,
            created: now,
            count: 0,
        });
        AcquireDecision::Emit(seq)
    }

    /// A response referencing `seq` arrived: reset the record's pressure
    /// so follow-up traffic does not re-trigger negotiation, but leave it
    /// for the sweeper.
    pub(crate) fn done(&self, seq: u32, now: u64) -> bool {
        let mut list = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(rec) = list.iter_mut().find(|r| r.seq == seq) {
            rec.created = now;
            rec.count = 0;
            return true;
        }
        false
    }

    /// Drop records older than `lifetime`.
    pub(crate) fn sweep(&self, now: u64, lifetime: u64) {
        let mut list = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        list.retain(|r| now.saturating_sub(r.created) <= lifetime);
    }

    /// Current suppressed-repeat count for an identity, if a record
    /// exists.
    pub fn pressure(&self, saidx: &SaIndex) -> Option<u32> {
        let list = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        list.iter()
            .find(|r| r.saidx.matches(saidx, SaidxMatch::Exact))
            .map(|r| r.count)
    }

    /// Number of pending records.
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Whether no negotiation is pending.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// One pending inbound-triggered policy negotiation.
#[derive(Debug, Clone)]
pub struct PolicyAcquireRecord {
    /// The policy selector being negotiated.
    pub spidx: SpIndex,
    /// Creation time, seconds.
    pub created: u64,
    /// Suppressed repeats since the last emitted request.
    pub count: u32,
}

/// The list of pending policy negotiations; same suppression shape as
/// [`AcquireList`], keyed by exact policy selector.
pub struct PolicyAcquireList {
    inner: Mutex<Vec<PolicyAcquireRecord>>,
}

impl PolicyAcquireList {
    pub(crate) fn new() -> Self {
        Self {
            inner: Mutex::new(Vec::new()),
        }
    }

    /// Record pressure for `spidx`; returns true when a request should be
    /// emitted.
    pub(crate) fn note(&self, spidx: &SpIndex, now: u64, threshold: u32) -> bool {
        let mut list = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(rec) = list.iter_mut().find(|r| r.spidx.matches_exact(spidx)) {
            if rec.count < threshold {
                rec.count += 1;
                return false;
            }
            rec.count = 0;
            return true;
        }
        list.push(PolicyAcquireRecord {
            spidx: spidx.clone(),
            created: now,
            count: 0,
        });
        true
    }

    /// Drop records older than `lifetime`.
    pub(crate) fn sweep(&self, now: u64, lifetime: u64) {
        let mut list = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        list.retain(|r| now.saturating_sub(r.created) <= lifetime);
    }

    /// Number of pending records.
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Whether no policy negotiation is pending.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Direction, Endpoint, IpsecMode, IpsecProto, ULPROTO_ANY};

    fn saidx(dst: &str) -> SaIndex {
        SaIndex {
            proto: IpsecProto::Esp,
            mode: IpsecMode::Tunnel,
            reqid: 0,
            src: Endpoint::new("10.0.0.1".parse().unwrap(), 0),
            dst: Endpoint::new(dst.parse().unwrap(), 0),
        }
    }

    #[test]
    fn first_note_emits_then_suppresses() {
        let acq = AcquireList::new();
        let idx = saidx("10.0.0.2");
        let AcquireDecision::Emit(seq) = acq.note(&idx, 100, 10) else {
            panic!("first note must emit");
        };
        assert!(seq != 0);
        for _ in 0..10 {
            assert_eq!(acq.note(&idx, 101, 10), AcquireDecision::Suppressed);
        }
        assert_eq!(acq.pressure(&idx), Some(10));
        // pressure past the threshold re-emits under the same seq
        assert_eq!(acq.note(&idx, 102, 10), AcquireDecision::Emit(seq));
        assert_eq!(acq.pressure(&idx), Some(0));
    }

    #[test]
    fn distinct_identities_get_distinct_records() {
        let acq = AcquireList::new();
        assert!(matches!(
            acq.note(&saidx("10.0.0.2"), 1, 10),
            AcquireDecision::Emit(_)
        ));
        assert!(matches!(
            acq.note(&saidx("10.0.0.3"), 1, 10),
            AcquireDecision::Emit(_)
        ));
        assert_eq!(acq.len(), 2);
    }

    #[test]
    fn done_resets_pressure_but_keeps_record() {
        let acq = AcquireList::new();
        let idx = saidx("10.0.0.2");
        let AcquireDecision::Emit(seq) = acq.note(&idx, 100, 10) else {
            panic!();
        };
        acq.note(&idx, 100, 10);
        assert_eq!(acq.pressure(&idx), Some(1));
        assert!(acq.done(seq, 150));
        assert_eq!(acq.pressure(&idx), Some(0));
        assert_eq!(acq.len(), 1);
        assert!(!acq.done(0xdead, 150));
    }

    #[test]
    fn sweep_reaps_stale_records() {
        let acq = AcquireList::new();
        acq.note(&saidx("10.0.0.2"), 100, 10);
        acq.note(&saidx("10.0.0.3"), 130, 10);
        acq.sweep(125, 20);
        assert_eq!(acq.len(), 1);
        assert!(acq.pressure(&saidx("10.0.0.2")).is_none());
        assert!(acq.pressure(&saidx("10.0.0.3")).is_some());
    }

    #[test]
    fn policy_acquire_suppression() {
        let spacq = PolicyAcquireList::new();
        let spidx = SpIndex {
            dir: Direction::Outbound,
            src: Endpoint::new("10.0.0.1".parse().unwrap(), 0),
            dst: Endpoint::new("10.0.0.2".parse().unwrap(), 0),
            prefs: 32,
            prefd: 32,
            ul_proto: ULPROTO_ANY,
        };
        assert!(spacq.note(&spidx, 100, 3));
        assert!(!spacq.note(&spidx, 100, 3));
        assert!(!spacq.note(&spidx, 100, 3));
        assert!(!spacq.note(&spidx, 100, 3));
        assert!(spacq.note(&spidx, 100, 3));
        spacq.sweep(500, 20);
        assert!(spacq.is_empty());
    }
}
