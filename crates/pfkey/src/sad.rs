//! The Security Association Database: association heads grouping SAs by
//! (protocol, mode, reqid, endpoints), with an address-pair hash for head
//! lookup and a process-wide SPI hash for direct SA lookup.
//!
//! All three indices live under one reader/writer lock; every structural
//! change (link, unlink, state move) touches them atomically. Each SA
//! additionally carries a small mutex for its keying material and
//! lifetime limits so lifetime updates never take the store-wide lock.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU8, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tracing::debug;

use crate::error::{Error, Result};
use crate::keys::{KeyMaterial, Lifetime, ReplayWindow};
use crate::types::{Endpoint, IpsecProto, SaIndex, SaState, SaType, SaidxMatch};
use crate::xform::TransformProvider;

/// A security association head: owns the larval and alive lists of all
/// SAs sharing one [`SaIndex`].
#[derive(Debug)]
pub struct SaHead {
    /// The identity shared by this head's SAs.
    pub saidx: SaIndex,
    state: AtomicU8,
    lists: Mutex<SaLists>,
}

#[derive(Debug, Default)]
struct SaLists {
    larval: Vec<Arc<SecAssoc>>,
    /// Usable SAs (MATURE or DYING), newest first.
    alive: Vec<Arc<SecAssoc>>,
}

impl SaHead {
    /// A fresh head starts DEAD; it becomes MATURE when linked into the
    /// SAD with its first SA.
    pub(crate) fn new(saidx: SaIndex) -> Arc<Self> {
        Arc::new(Self {
            saidx,
            state: AtomicU8::new(SaState::Dead as u8),
            lists: Mutex::new(SaLists::default()),
        })
    }

    /// Current head state (MATURE while linked, DEAD once unlinked).
    pub fn state(&self) -> SaState {
        SaState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// The SA type of this head's protocol.
    pub fn satype(&self) -> SaType {
        self.saidx.proto.satype()
    }

    /// Whether both SA lists are empty.
    pub fn is_empty(&self) -> bool {
        let l = self.lock_lists();
        l.larval.is_empty() && l.alive.is_empty()
    }

    /// Copy of the larval list (sweep input).
    pub(crate) fn larval_snapshot(&self) -> Vec<Arc<SecAssoc>> {
        self.lock_lists().larval.clone()
    }

    /// Copy of the alive list, newest first (sweep input).
    pub(crate) fn alive_snapshot(&self) -> Vec<Arc<SecAssoc>> {
        self.lock_lists().alive.clone()
    }

    fn lock_lists(&self) -> MutexGuard<'_, SaLists> {
        self.lists.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Keying material and mutable limits of one SA, guarded by the SA's own
/// mutex.
#[derive(Debug, Default)]
pub struct SaCrypt {
    /// Authentication algorithm id.
    pub auth_alg: u8,
    /// Encryption algorithm id.
    pub enc_alg: u8,
    /// SA flags from the wire.
    pub flags: u32,
    /// Authentication key.
    pub key_auth: Option<KeyMaterial>,
    /// Encryption key.
    pub key_enc: Option<KeyMaterial>,
    /// Anti-replay state; absent for old-style SAs.
    pub replay: Option<ReplayWindow>,
    /// Hard lifetime limits.
    pub lft_hard: Option<Lifetime>,
    /// Soft lifetime limits.
    pub lft_soft: Option<Lifetime>,
    /// NAT-T encapsulation type; 0 when not NAT-translated.
    pub natt_type: u8,
    /// NAT-T source port, host order.
    pub natt_sport: u16,
    /// NAT-T destination port, host order.
    pub natt_dport: u16,
    /// Whether the transform provider accepted this SA.
    pub transform: bool,
}

/// A security association.
///
/// Reference-counted; the owning head's lists hold the authoritative
/// reference while linked, the SPI hash and any outstanding lookups hold
/// more. `spi` is kept in host order; it is byte-swapped at the wire.
pub struct SecAssoc {
    /// Security Parameter Index, host order, unique process-wide while
    /// linked.
    pub spi: u32,
    /// Sequence number of the request that created the SA; ties an SA
    /// back to the ACQUIRE that asked for it.
    pub seq: u32,
    /// Pid of the creating process; UPDATE must come from the same pid.
    pub pid: u32,
    head: Arc<SaHead>,
    state: AtomicU8,
    created: AtomicU64,
    first_used: AtomicU64,
    bytes: AtomicU64,
    allocations: AtomicU32,
    crypt: Mutex<SaCrypt>,
    xform: Option<Arc<dyn TransformProvider>>,
}

impl std::fmt::Debug for SecAssoc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecAssoc")
            .field("spi", &format_args!("{:#010x}", self.spi))
            .field("seq", &self.seq)
            .field("pid", &self.pid)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl Drop for SecAssoc {
    fn drop(&mut self) {
        // last reference: let the provider scrub any derived state; our
        // own key material zeroizes itself when SaCrypt drops
        let bound = self
            .crypt
            .get_mut()
            .map(|c| c.transform)
            .unwrap_or(false);
        if bound && let Some(xform) = &self.xform {
            xform.zeroize(self.spi);
        }
    }
}

impl SecAssoc {
    pub(crate) fn new(
        spi: u32,
        seq: u32,
        pid: u32,
        head: Arc<SaHead>,
        state: SaState,
        crypt: SaCrypt,
        now: u64,
    ) -> Arc<Self> {
        Self::with_transform(spi, seq, pid, head, state, crypt, now, None)
    }

    #[allow(clippy::too_many_arguments)]
    pub(crate) fn with_transform(
        spi: u32,
        seq: u32,
        pid: u32,
        head: Arc<SaHead>,
        state: SaState,
        crypt: SaCrypt,
        now: u64,
        xform: Option<Arc<dyn TransformProvider>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            spi,
            seq,
            pid,
            head,
            state: AtomicU8::new(state as u8),
            created: AtomicU64::new(now),
            first_used: AtomicU64::new(0),
            bytes: AtomicU64::new(0),
            allocations: AtomicU32::new(0),
            crypt: Mutex::new(crypt),
            xform,
        })
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SaState {
        SaState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn set_state(&self, state: SaState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// The owning association head.
    pub fn head(&self) -> &Arc<SaHead> {
        &self.head
    }

    /// Creation time, seconds.
    pub fn created(&self) -> u64 {
        self.created.load(Ordering::Acquire)
    }

    pub(crate) fn set_created(&self, now: u64) {
        self.created.store(now, Ordering::Release);
    }

    /// First-use time, seconds; 0 if never used.
    pub fn first_used(&self) -> u64 {
        self.first_used.load(Ordering::Acquire)
    }

    /// Record a data-plane use: stamps first use and counts an
    /// allocation.
    pub fn mark_used(&self, now: u64) {
        let _ = self
            .first_used
            .compare_exchange(0, now, Ordering::AcqRel, Ordering::Acquire);
        self.allocations.fetch_add(1, Ordering::Relaxed);
    }

    /// Account processed bytes against the current lifetime.
    pub fn add_bytes(&self, n: u64) {
        self.bytes.fetch_add(n, Ordering::Relaxed);
    }

    /// Snapshot of the current lifetime counters.
    pub fn current_lifetime(&self) -> Lifetime {
        Lifetime {
            allocations: self.allocations.load(Ordering::Relaxed),
            bytes: self.bytes.load(Ordering::Relaxed),
            addtime: self.created(),
            usetime: self.first_used(),
        }
    }

    /// Run `f` with the SA's keying state, under its fine-grained lock.
    pub fn with_crypt<R>(&self, f: impl FnOnce(&SaCrypt) -> R) -> R {
        f(&self.lock_crypt())
    }

    pub(crate) fn lock_crypt(&self) -> MutexGuard<'_, SaCrypt> {
        self.crypt.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Outcome of a link attempt under the write lock.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum LinkOutcome {
    /// Linked into the head and SPI hash.
    Linked,
    /// The head looked up earlier was concurrently unlinked; retry from
    /// lookup.
    Raced,
}

/// The SAD.
pub struct Sad {
    inner: RwLock<SadTables>,
}

struct SadTables {
    /// All heads, newest first (bulk operations walk this).
    heads: Vec<Arc<SaHead>>,
    /// Heads bucketed by address-pair hash.
    addr_hash: HashMap<u64, Vec<Arc<SaHead>>>,
    /// Every linked SA by host-order SPI; one entry per SPI by
    /// construction.
    spi_hash: HashMap<u32, Arc<SecAssoc>>,
}

impl Sad {
    pub(crate) fn new() -> Self {
        Self {
            inner: RwLock::new(SadTables {
                heads: Vec::new(),
                addr_hash: HashMap::new(),
                spi_hash: HashMap::new(),
            }),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, SadTables> {
        self.inner.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, SadTables> {
        self.inner.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Find a linked head matching `probe` at the given granularity.
    pub fn lookup_head(&self, probe: &SaIndex, how: SaidxMatch) -> Option<Arc<SaHead>> {
        let t = self.read();
        t.addr_hash
            .get(&probe.addr_hash())
            .into_iter()
            .flatten()
            .find(|h| h.state() != SaState::Dead && h.saidx.matches(probe, how))
            .cloned()
    }

    /// Direct SA lookup by host-order SPI, any state.
    pub fn lookup_by_spi(&self, spi: u32) -> Option<Arc<SecAssoc>> {
        self.read().spi_hash.get(&spi).cloned()
    }

    /// Whether any linked SA uses this SPI.
    pub fn contains_spi(&self, spi: u32) -> bool {
        self.read().spi_hash.contains_key(&spi)
    }

    /// Link a freshly built SA (and, for `is_new_head`, its head) into
    /// the store.
    ///
    /// The head was resolved outside the lock, so for an existing head
    /// this re-checks that a concurrent delete or flush has not unlinked
    /// it; callers loop back to lookup on [`LinkOutcome::Raced`]. A SPI
    /// collision at this point means another add won the race.
    pub(crate) fn link(&self, sa: &Arc<SecAssoc>, is_new_head: bool) -> Result<LinkOutcome> {
        let mut t = self.write();
        let head = sa.head();
        if !is_new_head && head.state() == SaState::Dead {
            return Ok(LinkOutcome::Raced);
        }
        if t.spi_hash.contains_key(&sa.spi) {
            return Err(Error::AlreadyExists(format!("SPI {:#x}", sa.spi)));
        }
        if is_new_head {
            head.state
                .store(SaState::Mature as u8, Ordering::Release);
            t.heads.insert(0, head.clone());
            t.addr_hash
                .entry(head.saidx.addr_hash())
                .or_default()
                .insert(0, head.clone());
        }
        {
            let mut lists = head.lock_lists();
            if sa.state() == SaState::Larval {
                lists.larval.insert(0, sa.clone());
            } else {
                lists.alive.insert(0, sa.clone());
            }
        }
        t.spi_hash.insert(sa.spi, sa.clone());
        Ok(LinkOutcome::Linked)
    }

    /// One-shot transition to DEAD: removes the SA from its head's list
    /// and the SPI hash. Idempotent; returns false when already dead.
    pub(crate) fn unlink(&self, sa: &Arc<SecAssoc>) -> bool {
        let mut t = self.write();
        self.unlink_locked(&mut t, sa)
    }

    fn unlink_locked(&self, t: &mut SadTables, sa: &Arc<SecAssoc>) -> bool {
        if sa.state() == SaState::Dead {
            return false;
        }
        {
            let mut lists = sa.head().lock_lists();
            if sa.state() == SaState::Larval {
                lists.larval.retain(|cur| !Arc::ptr_eq(cur, sa));
            } else {
                lists.alive.retain(|cur| !Arc::ptr_eq(cur, sa));
            }
        }
        t.spi_hash.remove(&sa.spi);
        sa.set_state(SaState::Dead);
        true
    }

    /// Move an SA to a usable state. LARVAL goes to the front of the
    /// alive list with a fresh creation time; DYING simply becomes MATURE
    /// again. Fails if the SA lost a race with delete/flush.
    pub(crate) fn promote(&self, sa: &Arc<SecAssoc>, now: u64) -> Result<()> {
        let t = self.write();
        match sa.state() {
            SaState::Dead => {
                return Err(Error::Mismatch("SA was unlinked".into()));
            }
            SaState::Larval => {
                let mut lists = sa.head().lock_lists();
                lists.larval.retain(|cur| !Arc::ptr_eq(cur, sa));
                lists.alive.insert(0, sa.clone());
                sa.set_created(now);
            }
            SaState::Mature | SaState::Dying => {}
        }
        sa.set_state(SaState::Mature);
        drop(t);
        Ok(())
    }

    /// Demote a MATURE SA to DYING (soft expiry). Keeps list position.
    pub(crate) fn demote(&self, sa: &Arc<SecAssoc>) -> bool {
        let _t = self.write();
        if sa.state() != SaState::Mature {
            return false;
        }
        sa.set_state(SaState::Dying);
        true
    }

    /// Choose a usable SA for an outbound packet. `prefer_old` picks the
    /// oldest of the merged MATURE/DYING list, otherwise the newest.
    pub fn allocate_outbound(&self, probe: &SaIndex, prefer_old: bool) -> Option<Arc<SecAssoc>> {
        let t = self.read();
        let head = t
            .addr_hash
            .get(&probe.addr_hash())
            .into_iter()
            .flatten()
            .find(|h| h.state() != SaState::Dead && h.saidx.matches(probe, SaidxMatch::ModeReqid))?;
        let lists = head.lock_lists();
        let sa = if prefer_old {
            lists.alive.last()
        } else {
            lists.alive.first()
        };
        sa.cloned()
    }

    /// Look up the SA protecting an inbound packet by SPI.
    ///
    /// The source address is deliberately not compared; only protocol and
    /// destination participate, and the destination port only when the SA
    /// is NAT-translated.
    pub fn allocate_inbound(
        &self,
        dst: &Endpoint,
        proto: IpsecProto,
        spi: u32,
    ) -> Option<Arc<SecAssoc>> {
        let t = self.read();
        let sa = t.spi_hash.get(&spi)?;
        if sa.state() == SaState::Larval {
            return None;
        }
        let saidx = &sa.head().saidx;
        if saidx.proto != proto {
            return None;
        }
        let chkport = dst.port != 0
            && sa.with_crypt(|c| c.natt_type != 0 && (dst.port != c.natt_dport));
        if chkport {
            return None;
        }
        if !saidx.dst.matches(dst, false) {
            return None;
        }
        Some(sa.clone())
    }

    /// Unlink every non-LARVAL SA whose head matches the address pair.
    /// Returns the unlinked SAs for the caller to release outside the
    /// lock.
    pub(crate) fn delete_all(&self, probe: &SaIndex) -> Vec<Arc<SecAssoc>> {
        let mut t = self.write();
        let heads: Vec<_> = t
            .heads
            .iter()
            .filter(|h| h.state() != SaState::Dead && h.saidx.matches(probe, SaidxMatch::Head))
            .cloned()
            .collect();
        let mut removed = Vec::new();
        for head in heads {
            let alive: Vec<_> = head.lock_lists().alive.clone();
            for sa in alive {
                if self.unlink_locked(&mut t, &sa) {
                    removed.push(sa);
                }
            }
        }
        removed
    }

    /// DEAD-mark and unindex every SA (and its head) matching the
    /// protocol filter, atomically. Returns the drained objects for
    /// release outside the lock.
    pub(crate) fn flush(
        &self,
        proto: Option<IpsecProto>,
    ) -> (Vec<Arc<SecAssoc>>, Vec<Arc<SaHead>>) {
        let mut t = self.write();
        let mut dead_sas = Vec::new();
        let mut dead_heads = Vec::new();
        let keep: Vec<_> = t
            .heads
            .iter()
            .filter(|h| proto.is_some_and(|p| h.saidx.proto != p))
            .cloned()
            .collect();
        let victims: Vec<_> = t
            .heads
            .iter()
            .filter(|h| proto.is_none_or(|p| h.saidx.proto == p))
            .cloned()
            .collect();
        for head in &victims {
            let drained: Vec<_> = {
                let mut lists = head.lock_lists();
                let lists = &mut *lists;
                lists
                    .larval
                    .drain(..)
                    .chain(lists.alive.drain(..))
                    .collect()
            };
            for sa in drained {
                t.spi_hash.remove(&sa.spi);
                sa.set_state(SaState::Dead);
                dead_sas.push(sa);
            }
            head.state.store(SaState::Dead as u8, Ordering::Release);
            t.addr_hash
                .entry(head.saidx.addr_hash())
                .or_default()
                .retain(|cur| !Arc::ptr_eq(cur, head));
            dead_heads.push(head.clone());
        }
        t.heads = keep;
        t.addr_hash.retain(|_, bucket| !bucket.is_empty());
        debug!(
            sas = dead_sas.len(),
            heads = dead_heads.len(),
            "flushed SAD"
        );
        (dead_sas, dead_heads)
    }

    /// Unlink a head if it is still linked and still empty. Used by the
    /// expiry sweep after its SAs are gone.
    pub(crate) fn unlink_head_if_empty(&self, head: &Arc<SaHead>) -> bool {
        let mut t = self.write();
        if head.state() == SaState::Dead || !head.is_empty() {
            return false;
        }
        head.state.store(SaState::Dead as u8, Ordering::Release);
        t.heads.retain(|cur| !Arc::ptr_eq(cur, head));
        t.addr_hash
            .entry(head.saidx.addr_hash())
            .or_default()
            .retain(|cur| !Arc::ptr_eq(cur, head));
        true
    }

    /// Snapshot all heads (for the sweep).
    pub(crate) fn heads_snapshot(&self) -> Vec<Arc<SaHead>> {
        self.read().heads.clone()
    }

    /// Snapshot heads and their SAs in dump order (alive before larval)
    /// with an optional protocol filter.
    pub fn snapshot(&self, proto: Option<IpsecProto>) -> Vec<(Arc<SaHead>, Vec<Arc<SecAssoc>>)> {
        let t = self.read();
        t.heads
            .iter()
            .filter(|h| proto.is_none_or(|p| h.saidx.proto == p))
            .map(|h| {
                let lists = h.lock_lists();
                let mut sas = lists.alive.clone();
                sas.extend(lists.larval.iter().cloned());
                (h.clone(), sas)
            })
            .collect()
    }

    /// Count SAs, optionally by protocol.
    pub fn sa_count(&self, proto: Option<IpsecProto>) -> usize {
        self.snapshot(proto).iter().map(|(_, sas)| sas.len()).sum()
    }

    /// Whether the SAD holds no heads at all.
    pub fn is_empty(&self) -> bool {
        self.read().heads.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::IpsecMode;

    fn ep(s: &str, port: u16) -> Endpoint {
        Endpoint::new(s.parse().unwrap(), port)
    }

    fn saidx(src: &str, dst: &str) -> SaIndex {
        SaIndex {
            proto: IpsecProto::Esp,
            mode: IpsecMode::Tunnel,
            reqid: 0,
            src: ep(src, 0),
            dst: ep(dst, 0),
        }
    }

    fn link_sa(sad: &Sad, spi: u32, state: SaState, idx: &SaIndex) -> Arc<SecAssoc> {
        let (head, is_new) = match sad.lookup_head(idx, SaidxMatch::ModeReqid) {
            Some(h) => (h, false),
            None => (SaHead::new(idx.clone()), true),
        };
        let sa = SecAssoc::new(spi, 0, 1, head, state, SaCrypt::default(), 100);
        assert_eq!(sad.link(&sa, is_new).unwrap(), LinkOutcome::Linked);
        sa
    }

    #[test]
    fn spi_uniqueness_enforced() {
        let sad = Sad::new();
        let idx = saidx("10.0.0.1", "10.0.0.2");
        let _a = link_sa(&sad, 0x300, SaState::Mature, &idx);
        let head = sad.lookup_head(&idx, SaidxMatch::ModeReqid).unwrap();
        let dup = SecAssoc::new(0x300, 0, 1, head, SaState::Mature, SaCrypt::default(), 100);
        assert!(matches!(
            sad.link(&dup, false),
            Err(Error::AlreadyExists(_))
        ));
        assert!(sad.contains_spi(0x300));
    }

    #[test]
    fn link_races_with_dead_head() {
        let sad = Sad::new();
        let idx = saidx("10.0.0.1", "10.0.0.2");
        let a = link_sa(&sad, 0x300, SaState::Mature, &idx);
        let head = a.head().clone();
        sad.unlink(&a);
        sad.unlink_head_if_empty(&head);
        let late = SecAssoc::new(0x301, 0, 1, head, SaState::Mature, SaCrypt::default(), 100);
        assert_eq!(sad.link(&late, false).unwrap(), LinkOutcome::Raced);
        assert!(!sad.contains_spi(0x301));
    }

    #[test]
    fn unlink_is_idempotent_and_unindexes() {
        let sad = Sad::new();
        let idx = saidx("10.0.0.1", "10.0.0.2");
        let sa = link_sa(&sad, 0x400, SaState::Mature, &idx);
        assert!(sad.contains_spi(0x400));
        assert!(sad.unlink(&sa));
        assert!(!sad.unlink(&sa));
        assert_eq!(sa.state(), SaState::Dead);
        assert!(!sad.contains_spi(0x400));
        assert!(sad.lookup_by_spi(0x400).is_none());
    }

    #[test]
    fn outbound_allocation_age_preference() {
        let sad = Sad::new();
        let idx = saidx("10.0.0.1", "10.0.0.2");
        let old = link_sa(&sad, 0x500, SaState::Mature, &idx);
        let newer = link_sa(&sad, 0x501, SaState::Mature, &idx);
        let got = sad.allocate_outbound(&idx, true).unwrap();
        assert!(Arc::ptr_eq(&got, &old));
        let got = sad.allocate_outbound(&idx, false).unwrap();
        assert!(Arc::ptr_eq(&got, &newer));
    }

    #[test]
    fn outbound_merges_mature_and_dying() {
        let sad = Sad::new();
        let idx = saidx("10.0.0.1", "10.0.0.2");
        let old = link_sa(&sad, 0x500, SaState::Mature, &idx);
        let _newer = link_sa(&sad, 0x501, SaState::Mature, &idx);
        assert!(sad.demote(&old));
        // a DYING SA stays eligible at its age rank
        let got = sad.allocate_outbound(&idx, true).unwrap();
        assert!(Arc::ptr_eq(&got, &old));
        assert_eq!(got.state(), SaState::Dying);
    }

    #[test]
    fn inbound_ignores_source_and_larval() {
        let sad = Sad::new();
        let idx = saidx("10.0.0.1", "10.0.0.2");
        let sa = link_sa(&sad, 0x600, SaState::Larval, &idx);
        assert!(
            sad.allocate_inbound(&ep("10.0.0.2", 0), IpsecProto::Esp, 0x600)
                .is_none()
        );
        sad.promote(&sa, 200).unwrap();
        let got = sad
            .allocate_inbound(&ep("10.0.0.2", 0), IpsecProto::Esp, 0x600)
            .unwrap();
        assert!(Arc::ptr_eq(&got, &sa));
        // wrong protocol or destination fails
        assert!(
            sad.allocate_inbound(&ep("10.0.0.2", 0), IpsecProto::Ah, 0x600)
                .is_none()
        );
        assert!(
            sad.allocate_inbound(&ep("10.0.0.9", 0), IpsecProto::Esp, 0x600)
                .is_none()
        );
    }

    #[test]
    fn inbound_checks_natt_port_only_when_translated() {
        let sad = Sad::new();
        let idx = saidx("10.0.0.1", "10.0.0.2");
        let sa = link_sa(&sad, 0x700, SaState::Mature, &idx);
        {
            let mut c = sa.lock_crypt();
            c.natt_type = 2;
            c.natt_dport = 4500;
        }
        assert!(
            sad.allocate_inbound(&ep("10.0.0.2", 4500), IpsecProto::Esp, 0x700)
                .is_some()
        );
        assert!(
            sad.allocate_inbound(&ep("10.0.0.2", 9), IpsecProto::Esp, 0x700)
                .is_none()
        );
        // port zero in the probe skips the check entirely
        assert!(
            sad.allocate_inbound(&ep("10.0.0.2", 0), IpsecProto::Esp, 0x700)
                .is_some()
        );
    }

    #[test]
    fn promote_larval_resets_age() {
        let sad = Sad::new();
        let idx = saidx("10.0.0.1", "10.0.0.2");
        let sa = link_sa(&sad, 0x800, SaState::Larval, &idx);
        assert_eq!(sa.created(), 100);
        sad.promote(&sa, 250).unwrap();
        assert_eq!(sa.state(), SaState::Mature);
        assert_eq!(sa.created(), 250);
        // promoted SA is now the newest alive entry
        let got = sad.allocate_outbound(&idx, false).unwrap();
        assert!(Arc::ptr_eq(&got, &sa));
    }

    #[test]
    fn promote_dead_fails() {
        let sad = Sad::new();
        let idx = saidx("10.0.0.1", "10.0.0.2");
        let sa = link_sa(&sad, 0x900, SaState::Mature, &idx);
        sad.unlink(&sa);
        assert!(sad.promote(&sa, 300).is_err());
    }

    #[test]
    fn delete_all_spares_larval() {
        let sad = Sad::new();
        let idx = saidx("10.0.0.1", "10.0.0.2");
        let _m = link_sa(&sad, 0xa00, SaState::Mature, &idx);
        let larval = link_sa(&sad, 0xa01, SaState::Larval, &idx);
        let probe = SaIndex {
            mode: IpsecMode::Any,
            ..idx.clone()
        };
        let removed = sad.delete_all(&probe);
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].spi, 0xa00);
        assert_eq!(larval.state(), SaState::Larval);
        assert!(sad.contains_spi(0xa01));
    }

    #[test]
    fn flush_filters_by_proto() {
        let sad = Sad::new();
        let esp = saidx("10.0.0.1", "10.0.0.2");
        let ah = SaIndex {
            proto: IpsecProto::Ah,
            src: ep("10.0.1.1", 0),
            dst: ep("10.0.1.2", 0),
            ..esp.clone()
        };
        let _e = link_sa(&sad, 0xb00, SaState::Mature, &esp);
        let _a = link_sa(&sad, 0xb01, SaState::Mature, &ah);
        let (sas, heads) = sad.flush(Some(IpsecProto::Esp));
        assert_eq!(sas.len(), 1);
        assert_eq!(heads.len(), 1);
        assert!(sad.contains_spi(0xb01));
        assert!(!sad.contains_spi(0xb00));
        let (sas, heads) = sad.flush(None);
        assert_eq!(sas.len(), 1);
        assert_eq!(heads.len(), 1);
        assert!(sad.is_empty());
    }

    #[test]
    fn empty_head_reclaim_rechecks() {
        let sad = Sad::new();
        let idx = saidx("10.0.0.1", "10.0.0.2");
        let sa = link_sa(&sad, 0xc00, SaState::Mature, &idx);
        let head = sa.head().clone();
        // not empty yet
        assert!(!sad.unlink_head_if_empty(&head));
        sad.unlink(&sa);
        assert!(sad.unlink_head_if_empty(&head));
        assert!(!sad.unlink_head_if_empty(&head));
        assert!(sad.is_empty());
    }
}
