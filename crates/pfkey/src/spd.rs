//! The Security Policy Database: priority-ordered per-direction chains
//! plus an id index, and the policy blob codec.

use std::sync::atomic::{AtomicU8, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tracing::debug;
use zerocopy::{FromBytes, IntoBytes};

use crate::builder::MsgBuilder;
use crate::error::{Error, Result};
use crate::ext::{SadbXIpsecRequest, decode_sockaddr, encode_sockaddr};
use crate::msg::sadb_align;
use crate::types::{
    Endpoint, IpsecMode, IpsecProto, MANUAL_REQID_MAX, PolicyAction, PolicyLevel, SpIndex,
};

const SP_ALIVE: u8 = 0;
const SP_DEAD: u8 = 1;

/// Maximum transform requests a single policy may chain.
pub const MAX_POLICY_REQUESTS: usize = 4;

/// One transform request in an IPsec policy: protocol, mode, level, and
/// optionally pinned tunnel endpoints.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IpsecRequest {
    /// IPsec protocol to apply.
    pub proto: IpsecProto,
    /// Transport or tunnel.
    pub mode: IpsecMode,
    /// How strictly an SA is required.
    pub level: PolicyLevel,
    /// Binding id for `Unique` level; 0 otherwise.
    pub reqid: u32,
    /// Tunnel source endpoint, when pinned.
    pub tunnel_src: Option<Endpoint>,
    /// Tunnel destination endpoint, when pinned.
    pub tunnel_dst: Option<Endpoint>,
}

/// A security policy. Reference-counted; the SPD chains own it while
/// ALIVE, lookups hold additional references.
#[derive(Debug)]
pub struct SecPolicy {
    /// Traffic selector.
    pub spidx: SpIndex,
    /// What to do with matching traffic.
    pub action: PolicyAction,
    /// Transform chain; non-empty iff `action` is `Ipsec`.
    pub requests: Vec<IpsecRequest>,
    /// Unique policy id.
    pub id: u32,
    /// Priority; lower sorts earlier in the chain.
    pub priority: u32,
    /// Creation time, seconds.
    pub created: u64,
    /// Hard lifetime in seconds since creation; 0 = none.
    pub lifetime: u64,
    /// Soft valid time in seconds since last use; 0 = none.
    pub validtime: u64,
    last_used: AtomicU64,
    state: AtomicU8,
}

impl SecPolicy {
    pub(crate) fn new(
        spidx: SpIndex,
        action: PolicyAction,
        requests: Vec<IpsecRequest>,
        id: u32,
        priority: u32,
        now: u64,
        lifetime: u64,
        validtime: u64,
    ) -> Arc<Self> {
        Arc::new(Self {
            spidx,
            action,
            requests,
            id,
            priority,
            created: now,
            lifetime,
            validtime,
            last_used: AtomicU64::new(now),
            state: AtomicU8::new(SP_ALIVE),
        })
    }

    /// Whether the policy is still linked into the SPD.
    pub fn is_alive(&self) -> bool {
        self.state.load(Ordering::Acquire) == SP_ALIVE
    }

    /// Last time a data-plane lookup matched this policy.
    pub fn last_used(&self) -> u64 {
        self.last_used.load(Ordering::Relaxed)
    }

    pub(crate) fn touch(&self, now: u64) {
        self.last_used.store(now, Ordering::Relaxed);
    }

    /// Write this policy as an x_policy extension, request records
    /// included.
    pub(crate) fn write_policy_ext(&self, b: &mut MsgBuilder) {
        if self.action != PolicyAction::Ipsec || self.requests.is_empty() {
            b.policy_hdr(
                self.action.wire(),
                self.spidx.dir.wire(),
                self.id,
                self.priority,
            );
            return;
        }
        let body = encode_requests(&self.requests);
        b.policy_with_requests(
            self.action.wire(),
            self.spidx.dir.wire(),
            self.id,
            self.priority,
            &body,
        );
    }
}

/// Encode request records for a policy extension body.
pub(crate) fn encode_requests(requests: &[IpsecRequest]) -> Vec<u8> {
    let mut out = Vec::new();
    for req in requests {
        let mut addrs = Vec::new();
        if let (Some(src), Some(dst)) = (&req.tunnel_src, &req.tunnel_dst) {
            addrs.extend_from_slice(&encode_sockaddr(src));
            addrs.extend_from_slice(&encode_sockaddr(dst));
        }
        let len = sadb_align(std::mem::size_of::<SadbXIpsecRequest>() + addrs.len());
        let rec = SadbXIpsecRequest {
            len: len as u16,
            proto: req.proto.number() as u16,
            mode: req.mode.wire(),
            level: req.level.wire(),
            reserved: 0,
            reqid: req.reqid,
            reserved2: 0,
        };
        let start = out.len();
        out.extend_from_slice(rec.as_bytes());
        out.extend_from_slice(&addrs);
        out.resize(start + len, 0);
    }
    out
}

/// Parse the request records of an IPsec policy extension.
///
/// `alloc_reqid` is consulted for `Unique`-level records carrying reqid 0
/// (or one above the manual range, which is replaced).
pub(crate) fn parse_requests(
    mut body: &[u8],
    mut alloc_reqid: impl FnMut() -> u32,
) -> Result<Vec<IpsecRequest>> {
    let mut requests = Vec::new();
    while !body.is_empty() {
        let (rec, _) = SadbXIpsecRequest::ref_from_prefix(body)
            .map_err(|_| Error::InvalidMessage("truncated ipsecrequest".into()))?;
        let rec_len = rec.len as usize;
        if rec_len < std::mem::size_of::<SadbXIpsecRequest>() || rec_len > body.len() {
            return Err(Error::InvalidMessage(format!(
                "invalid ipsecrequest length {rec_len}"
            )));
        }
        if requests.len() >= MAX_POLICY_REQUESTS {
            return Err(Error::InvalidMessage("too many ipsecrequests".into()));
        }
        let proto = IpsecProto::from_request(rec.proto)?;
        let mode = match IpsecMode::from_wire(rec.mode)? {
            IpsecMode::Any => {
                return Err(Error::InvalidMessage("request mode must be pinned".into()));
            }
            m => m,
        };
        let level = PolicyLevel::from_wire(rec.level)?;
        let reqid = if level == PolicyLevel::Unique {
            match rec.reqid {
                0 => alloc_reqid(),
                r if r > MANUAL_REQID_MAX => {
                    debug!(reqid = r, "reqid out of manual range, reassigned");
                    alloc_reqid()
                }
                r => r,
            }
        } else {
            0
        };

        let mut req = IpsecRequest {
            proto,
            mode,
            level,
            reqid,
            tunnel_src: None,
            tunnel_dst: None,
        };
        let tail = &body[std::mem::size_of::<SadbXIpsecRequest>()..rec_len];
        if !tail.is_empty() {
            let src = decode_sockaddr(tail)?;
            let src_len = tail[0] as usize;
            if tail.len() < src_len + 2 {
                return Err(Error::InvalidMessage(
                    "truncated tunnel endpoint pair".into(),
                ));
            }
            let dst = decode_sockaddr(&tail[src_len..])?;
            if src.family() != dst.family() {
                return Err(Error::InvalidMessage(
                    "tunnel endpoint family mismatch".into(),
                ));
            }
            req.tunnel_src = Some(src);
            req.tunnel_dst = Some(dst);
        }
        requests.push(req);
        body = &body[rec_len..];
    }
    if requests.is_empty() {
        return Err(Error::InvalidMessage("no valid transforms".into()));
    }
    Ok(requests)
}

/// The SPD: one priority-ordered chain per direction plus a lookup-by-id
/// index, all guarded by one reader/writer lock.
pub struct Spd {
    inner: RwLock<SpdTables>,
    generation: AtomicU32,
}

/// The lock-protected tables; exposed crate-internally so handlers can run
/// compound operations (lookup, unlink, insert) in one critical section.
pub(crate) struct SpdTables {
    chains: [Vec<Arc<SecPolicy>>; 2],
    by_id: std::collections::HashMap<u32, Arc<SecPolicy>>,
}

impl SpdTables {
    /// Exact-selector scan of one direction chain.
    pub(crate) fn find_exact(&self, spidx: &SpIndex) -> Option<Arc<SecPolicy>> {
        self.chains[spidx.dir.index()]
            .iter()
            .find(|sp| sp.spidx.matches_exact(spidx))
            .cloned()
    }

    pub(crate) fn contains_id(&self, id: u32) -> bool {
        self.by_id.contains_key(&id)
    }

    /// Insert keeping ascending priority; equal priorities stay in
    /// insertion order. Marks the policy ALIVE.
    pub(crate) fn insert(&mut self, sp: Arc<SecPolicy>) {
        let chain = &mut self.chains[sp.spidx.dir.index()];
        let pos = chain
            .iter()
            .position(|cur| sp.priority < cur.priority)
            .unwrap_or(chain.len());
        sp.state.store(SP_ALIVE, Ordering::Release);
        self.by_id.insert(sp.id, sp.clone());
        chain.insert(pos, sp);
    }

    /// One-shot ALIVE to DEAD transition; removes from the chain and the
    /// id index. Returns false if the policy was already unlinked.
    pub(crate) fn unlink(&mut self, sp: &Arc<SecPolicy>) -> bool {
        if sp.state.swap(SP_DEAD, Ordering::AcqRel) != SP_ALIVE {
            return false;
        }
        let chain = &mut self.chains[sp.spidx.dir.index()];
        chain.retain(|cur| !Arc::ptr_eq(cur, sp));
        self.by_id.remove(&sp.id);
        true
    }
}

impl Spd {
    pub(crate) fn new() -> Self {
        Self {
            inner: RwLock::new(SpdTables {
                chains: [Vec::new(), Vec::new()],
                by_id: std::collections::HashMap::new(),
            }),
            generation: AtomicU32::new(0),
        }
    }

    pub(crate) fn write(&self) -> RwLockWriteGuard<'_, SpdTables> {
        self.inner.write().unwrap_or_else(|e| e.into_inner())
    }

    fn read(&self) -> RwLockReadGuard<'_, SpdTables> {
        self.inner.read().unwrap_or_else(|e| e.into_inner())
    }

    /// Generation counter, bumped on every structural change.
    pub fn generation(&self) -> u32 {
        self.generation.load(Ordering::Acquire)
    }

    pub(crate) fn bump_generation(&self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
    }

    /// Exact identity lookup; returns a new reference.
    pub fn lookup_exact(&self, spidx: &SpIndex) -> Option<Arc<SecPolicy>> {
        self.read().find_exact(spidx)
    }

    /// Id lookup; returns a new reference.
    pub fn lookup_by_id(&self, id: u32) -> Option<Arc<SecPolicy>> {
        self.read().by_id.get(&id).cloned()
    }

    /// Packet-selector match: the chain is priority-ordered, so the first
    /// with-mask match is the highest-priority policy. Updates the
    /// policy's last-used time.
    pub fn lookup_match(&self, pkt: &SpIndex, now: u64) -> Option<Arc<SecPolicy>> {
        let sp = {
            let t = self.read();
            t.chains[pkt.dir.index()]
                .iter()
                .find(|sp| sp.spidx.matches_packet(pkt))
                .cloned()
        };
        if let Some(sp) = &sp {
            sp.touch(now);
        }
        sp
    }

    /// Unlink one policy; idempotent.
    pub fn unlink(&self, sp: &Arc<SecPolicy>) -> bool {
        let unlinked = self.write().unlink(sp);
        if unlinked {
            self.bump_generation();
        }
        unlinked
    }

    /// DEAD-mark and unindex everything in one critical section. The
    /// caller drops the returned references outside the lock.
    pub fn flush(&self) -> Vec<Arc<SecPolicy>> {
        let mut t = self.write();
        let mut drained = Vec::new();
        for chain in t.chains.iter_mut() {
            for sp in chain.drain(..) {
                sp.state.store(SP_DEAD, Ordering::Release);
                drained.push(sp);
            }
        }
        t.by_id.clear();
        drop(t);
        self.bump_generation();
        drained
    }

    /// Snapshot both chains in dump order (inbound, then outbound).
    pub fn snapshot(&self) -> Vec<Arc<SecPolicy>> {
        let t = self.read();
        t.chains.iter().flatten().cloned().collect()
    }

    /// Number of policies across both directions.
    pub fn len(&self) -> usize {
        let t = self.read();
        t.chains[0].len() + t.chains[1].len()
    }

    /// Whether the SPD holds no policies.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Direction, ULPROTO_ANY};

    fn ep(s: &str, port: u16) -> Endpoint {
        Endpoint::new(s.parse().unwrap(), port)
    }

    fn spidx(dir: Direction, src: &str, dst: &str) -> SpIndex {
        SpIndex {
            dir,
            src: ep(src, 0),
            dst: ep(dst, 0),
            prefs: 24,
            prefd: 24,
            ul_proto: ULPROTO_ANY,
        }
    }

    fn policy(id: u32, priority: u32, idx: SpIndex) -> Arc<SecPolicy> {
        SecPolicy::new(
            idx,
            PolicyAction::Bypass,
            Vec::new(),
            id,
            priority,
            100,
            0,
            0,
        )
    }

    #[test]
    fn priority_ordering_is_stable() {
        let spd = Spd::new();
        let a = policy(1, 10, spidx(Direction::Outbound, "10.0.0.0", "10.0.1.0"));
        let b = policy(2, 5, spidx(Direction::Outbound, "10.1.0.0", "10.1.1.0"));
        let c = policy(3, 10, spidx(Direction::Outbound, "10.2.0.0", "10.2.1.0"));
        {
            let mut t = spd.write();
            t.insert(a);
            t.insert(b);
            t.insert(c);
        }
        let order: Vec<u32> = spd.snapshot().iter().map(|sp| sp.id).collect();
        // 5 sorts first; the two priority-10 entries keep insertion order
        assert_eq!(order, vec![2, 1, 3]);
    }

    #[test]
    fn lookup_match_first_wins_and_touches() {
        let spd = Spd::new();
        let wide = policy(1, 20, spidx(Direction::Outbound, "10.0.0.0", "10.0.1.0"));
        let narrow = {
            let mut idx = spidx(Direction::Outbound, "10.0.0.0", "10.0.1.0");
            idx.prefs = 32;
            idx.src = ep("10.0.0.5", 0);
            policy(2, 10, idx)
        };
        {
            let mut t = spd.write();
            t.insert(wide);
            t.insert(narrow);
        }
        let pkt = SpIndex {
            dir: Direction::Outbound,
            src: ep("10.0.0.5", 1000),
            dst: ep("10.0.1.9", 80),
            prefs: 32,
            prefd: 32,
            ul_proto: 6,
        };
        let hit = spd.lookup_match(&pkt, 555).unwrap();
        assert_eq!(hit.id, 2);
        assert_eq!(hit.last_used(), 555);
        // same packet, same policy
        let again = spd.lookup_match(&pkt, 556).unwrap();
        assert!(Arc::ptr_eq(&hit, &again));
    }

    #[test]
    fn unlink_is_idempotent() {
        let spd = Spd::new();
        let sp = policy(9, 1, spidx(Direction::Inbound, "10.0.0.0", "10.0.1.0"));
        spd.write().insert(sp.clone());
        assert!(spd.lookup_by_id(9).is_some());
        assert!(spd.unlink(&sp));
        assert!(!spd.unlink(&sp));
        assert!(!sp.is_alive());
        assert!(spd.lookup_by_id(9).is_none());
        assert!(spd.lookup_exact(&sp.spidx).is_none());
    }

    #[test]
    fn flush_empties_everything() {
        let spd = Spd::new();
        for i in 0..4 {
            let dir = if i % 2 == 0 {
                Direction::Inbound
            } else {
                Direction::Outbound
            };
            spd.write()
                .insert(policy(i, i, spidx(dir, "10.0.0.0", "10.0.1.0")));
        }
        let drained = spd.flush();
        assert_eq!(drained.len(), 4);
        assert!(spd.is_empty());
        assert!(drained.iter().all(|sp| !sp.is_alive()));
    }

    #[test]
    fn generation_bumps() {
        let spd = Spd::new();
        let g0 = spd.generation();
        let sp = policy(1, 1, spidx(Direction::Inbound, "10.0.0.0", "10.0.1.0"));
        spd.write().insert(sp.clone());
        spd.bump_generation();
        spd.unlink(&sp);
        assert!(spd.generation() >= g0 + 2);
    }

    #[test]
    fn requests_roundtrip() {
        let reqs = vec![
            IpsecRequest {
                proto: IpsecProto::Esp,
                mode: IpsecMode::Tunnel,
                level: PolicyLevel::Require,
                reqid: 0,
                tunnel_src: Some(ep("192.0.2.1", 0)),
                tunnel_dst: Some(ep("192.0.2.2", 0)),
            },
            IpsecRequest {
                proto: IpsecProto::Ah,
                mode: IpsecMode::Transport,
                level: PolicyLevel::Unique,
                reqid: 77,
                tunnel_src: None,
                tunnel_dst: None,
            },
        ];
        let body = encode_requests(&reqs);
        assert_eq!(body.len() % 8, 0);
        let back = parse_requests(&body, || 1000).unwrap();
        assert_eq!(back, reqs);
    }

    #[test]
    fn unique_reqid_zero_gets_allocated() {
        let reqs = vec![IpsecRequest {
            proto: IpsecProto::Esp,
            mode: IpsecMode::Transport,
            level: PolicyLevel::Unique,
            reqid: 0,
            tunnel_src: None,
            tunnel_dst: None,
        }];
        let body = encode_requests(&reqs);
        let back = parse_requests(&body, || 0x4001).unwrap();
        assert_eq!(back[0].reqid, 0x4001);
    }

    #[test]
    fn parse_requests_rejects_garbage() {
        assert!(parse_requests(&[], || 1).is_err());
        let mut body = encode_requests(&[IpsecRequest {
            proto: IpsecProto::Esp,
            mode: IpsecMode::Transport,
            level: PolicyLevel::Use,
            reqid: 0,
            tunnel_src: None,
            tunnel_dst: None,
        }]);
        // corrupt the protocol number
        body[2] = 99;
        body[3] = 0;
        assert!(matches!(
            parse_requests(&body, || 1),
            Err(Error::ProtocolNotSupported(_))
        ));
    }
}
