//! The key store context: one per network namespace or tenant.
//!
//! Owns the SPD, the SAD, the negotiation and registration bookkeeping,
//! the identifier allocators, and the two external capabilities (message
//! delivery and transform provider). Every operation is a method here or
//! in the handler/sweep modules; there is no hidden global state.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use rand::Rng;
use tracing::{debug, warn};

use crate::acquire::{AcquireDecision, AcquireList, PolicyAcquireList};
use crate::builder::MsgBuilder;
use crate::config::KeyConfig;
use crate::deliver::{DeliveryTarget, EventHub, MessageSink};
use crate::error::{Error, Result};
use crate::ext::{
    EXT_ADDRESS_DST, EXT_ADDRESS_SRC, EXT_KEY_AUTH, EXT_KEY_ENCRYPT, EXT_LIFETIME_HARD,
    EXT_LIFETIME_SOFT, EXT_X_NAT_T_DPORT, EXT_X_NAT_T_SPORT, ParsedMsg, SAFLAG_DERIV, SAFLAG_OLD,
    SAFLAG_RAWCPI,
};
use crate::keys::{KeyMaterial, ReplayWindow};
use crate::msg::MsgType;
use crate::proposal::{AALG_NONE, AALG_NULL, EALG_NONE, EALG_NULL, write_proposal};
use crate::registry::{ChannelId, Registry};
use crate::sad::{LinkOutcome, Sad, SaCrypt, SaHead, SecAssoc};
use crate::spd::{SecPolicy, Spd};
use crate::types::{
    Endpoint, IpsecProto, MANUAL_REQID_MAX, SaIndex, SaType, SaidxMatch, SpIndex, ULPROTO_ANY,
};
use crate::xform::{KeyingView, TransformProvider};

/// Whether a new SA is keyed now or deferred to a later update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SaRequestKind {
    /// Reserve an SPI; keying arrives with a later update.
    GetSpi,
    /// Key the SA immediately.
    Add,
}

/// One instance of the SADB/SPD engine.
pub struct KeyStoreContext {
    pub(crate) config: KeyConfig,
    pub(crate) spd: Spd,
    pub(crate) sad: Sad,
    pub(crate) acq: AcquireList,
    pub(crate) spacq: PolicyAcquireList,
    registry: Arc<Registry>,
    pub(crate) sink: Arc<dyn MessageSink>,
    pub(crate) xform: Arc<dyn TransformProvider>,
    policy_id: AtomicU32,
    reqid: AtomicU32,
}

impl KeyStoreContext {
    /// Build a context around explicit capabilities.
    pub fn new(
        config: KeyConfig,
        sink: Arc<dyn MessageSink>,
        xform: Arc<dyn TransformProvider>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            spd: Spd::new(),
            sad: Sad::new(),
            acq: AcquireList::new(),
            spacq: PolicyAcquireList::new(),
            registry: Arc::new(Registry::new()),
            sink,
            xform,
            policy_id: AtomicU32::new(0),
            reqid: AtomicU32::new(MANUAL_REQID_MAX),
        })
    }

    /// Build a context delivering through an in-process [`EventHub`];
    /// returns both.
    pub fn with_hub(
        config: KeyConfig,
        xform: Arc<dyn TransformProvider>,
    ) -> (Arc<Self>, Arc<EventHub>) {
        let registry = Arc::new(Registry::new());
        let hub = Arc::new(EventHub::new(registry.clone()));
        let ctx = Arc::new(Self {
            config,
            spd: Spd::new(),
            sad: Sad::new(),
            acq: AcquireList::new(),
            spacq: PolicyAcquireList::new(),
            registry,
            sink: hub.clone(),
            xform,
            policy_id: AtomicU32::new(0),
            reqid: AtomicU32::new(MANUAL_REQID_MAX),
        });
        (ctx, hub)
    }

    /// The configuration this context runs with.
    pub fn config(&self) -> &KeyConfig {
        &self.config
    }

    /// The registration records shared with the delivery side.
    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// The security policy database.
    pub fn spd(&self) -> &Spd {
        &self.spd
    }

    /// The security association database.
    pub fn sad(&self) -> &Sad {
        &self.sad
    }

    /// Pending SA negotiations.
    pub fn acquires(&self) -> &AcquireList {
        &self.acq
    }

    /// Wall-clock seconds, the timescale of every lifetime in the store.
    pub fn now(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0)
    }

    pub(crate) fn sendup(
        &self,
        origin: Option<ChannelId>,
        target: DeliveryTarget,
        msg: bytes::Bytes,
    ) -> Result<()> {
        self.sink.deliver(origin, target, msg)
    }

    // ---- identifier allocators -------------------------------------

    /// Pick an unused SPI (host order) from `range`, or from the
    /// configured range. IPComp CPIs are 16-bit and get clamped.
    pub(crate) fn new_spi(&self, range: Option<(u32, u32)>, proto: IpsecProto) -> Result<u32> {
        let (mut min, mut max) =
            range.unwrap_or((self.config.spi_minval, self.config.spi_maxval));
        if proto == IpsecProto::IpComp {
            min = min.min(0xffff);
            max = max.min(0xffff);
            if min > max {
                std::mem::swap(&mut min, &mut max);
            }
        }
        if min > max {
            return Err(Error::InvalidMessage(format!("bad SPI range {min}..{max}")));
        }
        if min == max {
            if self.sad.contains_spi(min) {
                debug!(spi = min, "requested SPI exists already");
                return Err(Error::AlreadyExists(format!("SPI {min:#x}")));
            }
            return Ok(min);
        }
        let mut rng = rand::rng();
        for _ in 0..self.config.spi_trycnt {
            let candidate = rng.random_range(min..=max);
            if !self.sad.contains_spi(candidate) {
                return Ok(candidate);
            }
        }
        warn!("failed to allocate an SPI in {min:#x}..{max:#x}");
        Err(Error::AlreadyExists("SPI space exhausted".into()))
    }

    /// Pick an unused policy id. Runs under the SPD write lock via the
    /// caller-provided uniqueness check.
    pub(crate) fn new_policy_id(&self, in_use: impl Fn(u32) -> bool) -> Result<u32> {
        for _ in 0..self.config.spi_trycnt {
            let id = self.policy_id.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
            if id == 0 {
                continue;
            }
            if !in_use(id) {
                return Ok(id);
            }
        }
        Err(Error::NoResources("policy id space exhausted".into()))
    }

    /// Allocate a reqid above the manual range for a unique-level policy
    /// request.
    pub(crate) fn new_reqid(&self) -> u32 {
        loop {
            let id = self.reqid.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
            if id > MANUAL_REQID_MAX {
                return id;
            }
            // wrapped into the manual range; restart above it
            self.reqid.store(MANUAL_REQID_MAX, Ordering::Relaxed);
        }
    }

    // ---- SA creation and keying ------------------------------------

    /// Parse and validate the keying payload of an add/update message
    /// into an [`SaCrypt`], running the per-protocol shape checks and the
    /// transform provider. Applied only to LARVAL SAs. On failure every
    /// sensitive buffer built so far is zeroized on drop and the provider
    /// is told to scrub.
    pub(crate) fn build_sa_crypt(
        &self,
        satype: SaType,
        spi: u32,
        parsed: &ParsedMsg<'_>,
    ) -> Result<SaCrypt> {
        match self.try_build_sa_crypt(satype, spi, parsed) {
            Ok(crypt) => Ok(crypt),
            Err(err) => {
                self.xform.zeroize(spi);
                Err(err)
            }
        }
    }

    fn try_build_sa_crypt(
        &self,
        satype: SaType,
        spi: u32,
        parsed: &ParsedMsg<'_>,
    ) -> Result<SaCrypt> {
        let mut crypt = SaCrypt::default();

        // NAT-T comes first so the transform sees the final shape
        if parsed.natt_type().is_some() {
            let encap = parsed.natt_type().map(|t| t.encap).unwrap_or(0);
            crypt.natt_type = encap;
            crypt.natt_sport = parsed.natt_port(EXT_X_NAT_T_SPORT).unwrap_or(0);
            crypt.natt_dport = parsed.natt_port(EXT_X_NAT_T_DPORT).unwrap_or(0);
        }

        if let Some(sa) = parsed.sa() {
            crypt.auth_alg = sa.auth;
            crypt.enc_alg = sa.encrypt;
            crypt.flags = sa.flags;
            if sa.flags & SAFLAG_OLD == 0 {
                crypt.replay = Some(ReplayWindow::new(sa.replay));
            }
        }

        // authentication key
        if let Some((hdr, data)) = parsed.key(EXT_KEY_AUTH) {
            match satype {
                SaType::Ah | SaType::Esp | SaType::TcpSignature => {
                    if parsed.key_is_bare(EXT_KEY_AUTH) && crypt.auth_alg != AALG_NULL {
                        return Err(Error::InvalidMessage("invalid key_auth values".into()));
                    }
                }
                _ => {
                    return Err(Error::InvalidMessage("invalid key_auth values".into()));
                }
            }
            crypt.key_auth = Some(KeyMaterial::from_wire(hdr.bits, data)?);
        }

        // encryption key
        if let Some((hdr, data)) = parsed.key(EXT_KEY_ENCRYPT) {
            match satype {
                SaType::Esp => {
                    if parsed.key_is_bare(EXT_KEY_ENCRYPT) && crypt.enc_alg != EALG_NULL {
                        return Err(Error::InvalidMessage("invalid key_enc values".into()));
                    }
                    crypt.key_enc = Some(KeyMaterial::from_wire(hdr.bits, data)?);
                }
                SaType::IpComp => {
                    if !parsed.key_is_bare(EXT_KEY_ENCRYPT) {
                        return Err(Error::InvalidMessage("invalid key_enc values".into()));
                    }
                }
                _ => {
                    return Err(Error::InvalidMessage("invalid key_enc values".into()));
                }
            }
        }

        // per-protocol shape checks, then hand to the transform provider
        let proto = match satype.proto() {
            Some(p) => p,
            None => {
                return Err(Error::ProtocolNotSupported("satype unspec".into()));
            }
        };
        match proto {
            IpsecProto::Ah => {
                if crypt.flags & SAFLAG_DERIV != 0 {
                    return Err(Error::InvalidMessage(
                        "derived IV flag is invalid for AH".into(),
                    ));
                }
                if crypt.enc_alg != EALG_NONE {
                    return Err(Error::InvalidMessage(
                        "protocol and algorithm mismatched".into(),
                    ));
                }
            }
            IpsecProto::Esp => {
                if crypt.flags & (SAFLAG_OLD | SAFLAG_DERIV) == (SAFLAG_OLD | SAFLAG_DERIV) {
                    return Err(Error::InvalidMessage(
                        "derived IV flag is invalid for old-esp".into(),
                    ));
                }
            }
            IpsecProto::IpComp => {
                if crypt.auth_alg != AALG_NONE {
                    return Err(Error::InvalidMessage(
                        "protocol and algorithm mismatched".into(),
                    ));
                }
                if crypt.flags & SAFLAG_RAWCPI == 0 && spi >= 0x10000 {
                    return Err(Error::InvalidMessage("invalid cpi for IPComp".into()));
                }
            }
            IpsecProto::Tcp => {
                if crypt.enc_alg != EALG_NONE {
                    return Err(Error::InvalidMessage(
                        "protocol and algorithm mismatched".into(),
                    ));
                }
            }
        }
        self.xform.init(
            KeyingView {
                spi,
                auth_alg: crypt.auth_alg,
                enc_alg: crypt.enc_alg,
                flags: crypt.flags,
                key_auth: crypt.key_auth.as_ref(),
                key_enc: crypt.key_enc.as_ref(),
            },
            proto,
        )?;
        crypt.transform = true;

        // hard and soft limits travel together
        let hard = parsed.lifetime(EXT_LIFETIME_HARD);
        let soft = parsed.lifetime(EXT_LIFETIME_SOFT);
        if hard.is_some() != soft.is_some() {
            return Err(Error::InvalidMessage(
                "hard and soft lifetimes must both be present".into(),
            ));
        }
        crypt.lft_hard = hard;
        crypt.lft_soft = soft;

        Ok(crypt)
    }

    /// Create a new SA for `saidx` under `spi` and link it.
    ///
    /// `GetSpi` leaves the SA LARVAL and unkeyed; `Add` keys it from the
    /// message and links it MATURE. The association head is resolved (or
    /// allocated) outside the write lock, then the link step re-validates
    /// it and retries from lookup when a concurrent delete or flush won.
    pub(crate) fn new_sa(
        &self,
        kind: SaRequestKind,
        satype: SaType,
        saidx: &SaIndex,
        spi: u32,
        parsed: &ParsedMsg<'_>,
    ) -> Result<Arc<SecAssoc>> {
        if matches!(saidx.proto, IpsecProto::Ah | IpsecProto::Esp) && spi <= 255 {
            return Err(Error::InvalidMessage(format!(
                "illegal range of SPI {spi}"
            )));
        }
        let (state, mut crypt) = match kind {
            SaRequestKind::GetSpi => (crate::types::SaState::Larval, SaCrypt::default()),
            SaRequestKind::Add => (
                crate::types::SaState::Mature,
                self.build_sa_crypt(satype, spi, parsed)?,
            ),
        };
        let now = self.now();
        loop {
            let (head, is_new) = match self.sad.lookup_head(saidx, SaidxMatch::ModeReqid) {
                Some(head) => (head, false),
                None => (SaHead::new(saidx.clone()), true),
            };
            let sa = SecAssoc::with_transform(
                spi,
                parsed.hdr.seq,
                parsed.hdr.pid,
                head,
                state,
                crypt,
                now,
                Some(self.xform.clone()),
            );
            match self.sad.link(&sa, is_new)? {
                LinkOutcome::Linked => {
                    debug!(spi, ?kind, "linked new SA");
                    return Ok(sa);
                }
                LinkOutcome::Raced => {
                    // the head died between lookup and link; take the
                    // keying back and retry from lookup
                    crypt = std::mem::take(&mut *sa.lock_crypt());
                }
            }
        }
    }

    /// Key a LARVAL SA from an update message and promote it to MATURE.
    pub(crate) fn finalize_sa(
        &self,
        sa: &Arc<SecAssoc>,
        satype: SaType,
        parsed: &ParsedMsg<'_>,
    ) -> Result<()> {
        let crypt = self.build_sa_crypt(satype, sa.spi, parsed)?;
        *sa.lock_crypt() = crypt;
        self.sad.promote(sa, self.now())
    }

    /// Update the lifetimes of a MATURE or DYING SA; a DYING SA becomes
    /// MATURE again. Absent lifetime extensions on a MATURE SA clear the
    /// limits.
    pub(crate) fn update_sa_lifetimes(
        &self,
        sa: &Arc<SecAssoc>,
        parsed: &ParsedMsg<'_>,
    ) -> Result<()> {
        let hard = parsed.lifetime(EXT_LIFETIME_HARD);
        let soft = parsed.lifetime(EXT_LIFETIME_SOFT);
        if hard.is_some() != soft.is_some() {
            return Err(Error::InvalidMessage(
                "hard and soft lifetimes must both be present".into(),
            ));
        }
        if hard.is_some() || sa.state() == crate::types::SaState::Mature {
            let mut crypt = sa.lock_crypt();
            crypt.lft_hard = hard;
            crypt.lft_soft = soft;
        }
        self.sad.promote(sa, self.now())
    }

    // ---- data-plane lookup surface ---------------------------------

    /// Find the highest-priority policy matching a packet selector.
    pub fn allocate_policy(&self, pkt: &SpIndex) -> Option<Arc<SecPolicy>> {
        self.spd.lookup_match(pkt, self.now())
    }

    /// Choose an SA for an outbound packet, or trigger negotiation.
    /// `Ok(None)` means "pending": a negotiation request was recorded
    /// and possibly emitted.
    pub fn allocate_outbound(
        &self,
        saidx: &SaIndex,
        sp: Option<&Arc<SecPolicy>>,
    ) -> Result<Option<Arc<SecAssoc>>> {
        if let Some(sa) = self
            .sad
            .allocate_outbound(saidx, self.config.preferred_oldsa)
        {
            return Ok(Some(sa));
        }
        self.acquire(saidx, sp)?;
        Ok(None)
    }

    /// Look up the SA for an inbound packet by destination, protocol,
    /// and SPI.
    pub fn allocate_inbound(
        &self,
        dst: &Endpoint,
        proto: IpsecProto,
        spi: u32,
    ) -> Option<Arc<SecAssoc>> {
        self.sad.allocate_inbound(dst, proto, spi)
    }

    // ---- negotiation triggering ------------------------------------

    /// Ask the key-management listeners to negotiate an SA for `saidx`,
    /// rate-limited per identity: repeats within the suppression window
    /// only bump the pending record's counter.
    pub fn acquire(&self, saidx: &SaIndex, sp: Option<&Arc<SecPolicy>>) -> Result<()> {
        let now = self.now();
        let seq = match self.acq.note(saidx, now, self.config.blockacq_count) {
            AcquireDecision::Suppressed => return Ok(()),
            AcquireDecision::Emit(seq) => seq,
        };
        let satype = saidx.proto.satype();
        let mut b = MsgBuilder::new(MsgType::Acquire, satype.wire(), seq, 0);
        b.address(
            EXT_ADDRESS_SRC,
            &saidx.src,
            saidx.src.addr_bits(),
            ULPROTO_ANY,
        );
        b.address(
            EXT_ADDRESS_DST,
            &saidx.dst,
            saidx.dst.addr_bits(),
            ULPROTO_ANY,
        );
        if let Some(sp) = sp {
            sp.write_policy_ext(&mut b);
        }
        if !write_proposal(&mut b, saidx.proto, &self.config) {
            return Err(Error::NoResources("no acceptable proposal".into()));
        }
        debug!(seq, proto = ?saidx.proto, "emitting acquire");
        self.sendup(None, DeliveryTarget::Registered(satype), b.finish())
    }

    /// A get-spi or add quoting a pending negotiation's sequence number
    /// arrived: relieve the record's rate-limit pressure.
    pub(crate) fn acquire_done(&self, seq: u32) {
        if self.acq.done(seq, self.now()) {
            debug!(seq, "acquire answered");
        }
    }

    /// Ask the listeners to negotiate a policy for `spidx` (inbound
    /// trigger), with the same suppression discipline.
    pub fn acquire_policy(&self, spidx: &SpIndex) -> Result<()> {
        if !self
            .spacq
            .note(spidx, self.now(), self.config.blockacq_count)
        {
            return Ok(());
        }
        let b = MsgBuilder::new(MsgType::SpdAcquire, 0, 0, 0);
        self.sendup(
            None,
            DeliveryTarget::Registered(SaType::Unspec),
            b.finish(),
        )
    }

    // ---- teardown --------------------------------------------------

    /// Flush both stores and verify nothing else still references the
    /// drained objects. Call once all channels are gone.
    pub fn shutdown(&self) {
        let sps = self.spd.flush();
        let (sas, heads) = self.sad.flush(None);
        self.acq.sweep(u64::MAX, 0);
        self.spacq.sweep(u64::MAX, 0);
        for sa in &sas {
            debug_assert_eq!(Arc::strong_count(sa), 1, "SA still referenced at teardown");
        }
        drop(sas);
        for head in &heads {
            debug_assert_eq!(
                Arc::strong_count(head),
                1,
                "SAH still referenced at teardown"
            );
        }
        drop(heads);
        for sp in &sps {
            debug_assert_eq!(Arc::strong_count(sp), 1, "SP still referenced at teardown");
        }
        drop(sps);
        assert!(self.spd.is_empty(), "SPD not empty after teardown flush");
        assert!(self.sad.is_empty(), "SAD not empty after teardown flush");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::xform::NullTransform;
    use std::net::IpAddr;

    struct NullSink;
    impl MessageSink for NullSink {
        fn deliver(
            &self,
            _origin: Option<ChannelId>,
            _target: DeliveryTarget,
            _msg: bytes::Bytes,
        ) -> Result<()> {
            Ok(())
        }
    }

    fn ctx() -> Arc<KeyStoreContext> {
        KeyStoreContext::new(
            KeyConfig::default(),
            Arc::new(NullSink),
            Arc::new(NullTransform),
        )
    }

    fn ep(s: &str) -> Endpoint {
        Endpoint::new(s.parse::<IpAddr>().unwrap(), 0)
    }

    #[test]
    fn spi_allocation_range() {
        let c = ctx();
        let spi = c.new_spi(Some((0x1000, 0x1010)), IpsecProto::Esp).unwrap();
        assert!((0x1000..=0x1010).contains(&spi));
        let pinned = c.new_spi(Some((0x2000, 0x2000)), IpsecProto::Esp).unwrap();
        assert_eq!(pinned, 0x2000);
    }

    #[test]
    fn ipcomp_cpi_is_clamped() {
        let c = ctx();
        let cpi = c
            .new_spi(Some((0x10000, 0x20000)), IpsecProto::IpComp)
            .unwrap();
        assert!(cpi <= 0xffff);
    }

    #[test]
    fn reqid_allocation_stays_above_manual_range() {
        let c = ctx();
        for _ in 0..16 {
            assert!(c.new_reqid() > MANUAL_REQID_MAX);
        }
    }

    #[test]
    fn policy_id_skips_in_use() {
        let c = ctx();
        let first = c.new_policy_id(|_| false).unwrap();
        let second = c.new_policy_id(|id| id == first + 1).unwrap();
        assert_ne!(second, first + 1);
    }

    #[test]
    fn acquire_suppression_counts_both_calls() {
        let c = ctx();
        let saidx = SaIndex {
            proto: IpsecProto::Esp,
            mode: crate::types::IpsecMode::Tunnel,
            reqid: 0,
            src: ep("10.0.0.1"),
            dst: ep("10.0.0.2"),
        };
        c.acquire(&saidx, None).unwrap();
        c.acquire(&saidx, None).unwrap();
        assert_eq!(c.acquires().pressure(&saidx), Some(1));
        assert_eq!(c.acquires().len(), 1);
    }

    #[test]
    fn shutdown_on_empty_context() {
        let c = ctx();
        c.shutdown();
        assert!(c.spd().is_empty());
        assert!(c.sad().is_empty());
    }
}
