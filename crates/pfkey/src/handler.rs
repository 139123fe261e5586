//! Control-message processing: validation beyond the generic parser,
//! dispatch, and the per-operation handlers.
//!
//! Every inbound message ends in exactly one reply to the sender (or, for
//! dumps, one reply per item) or an error reply echoing the request
//! header. Asynchronous notifications never originate here; they come
//! from the sweeper and the acquire path.

use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, warn};

use crate::builder::{MsgBuilder, error_reply};
use crate::context::{KeyStoreContext, SaRequestKind};
use crate::deliver::DeliveryTarget;
use crate::error::{Error, Result};
use crate::ext::{
    AddressExt, EXT_ADDRESS_DST, EXT_ADDRESS_SRC, EXT_KEY_AUTH, EXT_KEY_ENCRYPT,
    EXT_LIFETIME_CURRENT, EXT_LIFETIME_HARD, EXT_LIFETIME_SOFT, EXT_MAX, EXT_PROPOSAL, EXT_SA,
    EXT_X_NAT_T_DPORT, EXT_X_NAT_T_SPORT, ParsedMsg,
};
use crate::msg::{MSG_HDRLEN, MsgType};
use crate::proposal::write_supported;
use crate::registry::ChannelId;
use crate::sad::SecAssoc;
use crate::spd::{SecPolicy, parse_requests};
use crate::types::{
    Direction, IpsecMode, IpsecProto, PolicyAction, SaIndex, SaState, SaType, SaidxMatch, SpIndex,
    ULPROTO_ANY,
};

impl KeyStoreContext {
    /// Process one control message from `chan`.
    ///
    /// Parse and semantic failures are answered with an error reply; the
    /// returned error is reserved for delivery problems and buffers too
    /// short to even echo.
    pub fn handle_message(&self, chan: ChannelId, buf: &[u8]) -> Result<()> {
        if buf.len() < MSG_HDRLEN {
            return Err(Error::Truncated {
                expected: MSG_HDRLEN,
                actual: buf.len(),
            });
        }
        let parsed = match ParsedMsg::parse(buf) {
            Ok(parsed) => parsed,
            Err(err) => {
                warn!(%err, "rejecting malformed message");
                return self.senderror(chan, buf, &err);
            }
        };
        if let Err(err) = check_satype(&parsed) {
            return self.senderror(chan, buf, &err);
        }
        let result = match parsed.msg_type {
            MsgType::GetSpi => self.op_getspi(chan, &parsed),
            MsgType::Update => self.op_update(chan, &parsed),
            MsgType::Add => self.op_add(chan, &parsed),
            MsgType::Delete => self.op_delete(chan, &parsed),
            MsgType::Get => self.op_get(chan, &parsed),
            MsgType::Acquire => self.op_acquire(chan, &parsed, buf),
            MsgType::Register => self.op_register(chan, &parsed),
            MsgType::Flush => self.op_flush(chan, &parsed),
            MsgType::Dump => self.op_dump(chan, &parsed),
            MsgType::Promisc => self.op_promisc(chan, &parsed, buf),
            MsgType::SpdAdd | MsgType::SpdSetIdx => self.op_spdadd(chan, &parsed, false),
            MsgType::SpdUpdate => self.op_spdadd(chan, &parsed, true),
            MsgType::SpdDelete => self.op_spddelete(chan, &parsed),
            MsgType::SpdDelete2 => self.op_spddelete2(chan, &parsed),
            MsgType::SpdGet => self.op_spdget(chan, &parsed),
            MsgType::SpdDump => self.op_spddump(chan, &parsed),
            MsgType::SpdFlush => self.op_spdflush(chan, &parsed, buf),
            // notification-only types never arrive as requests
            MsgType::Expire | MsgType::SpdExpire | MsgType::SpdAcquire => Err(
                Error::InvalidMessage(format!("{:?} is outbound only", parsed.msg_type)),
            ),
        };
        match result {
            Ok(()) => Ok(()),
            Err(err) => {
                debug!(ty = ?parsed.msg_type, %err, "request failed");
                self.senderror(chan, buf, &err)
            }
        }
    }

    fn senderror(&self, chan: ChannelId, buf: &[u8], err: &Error) -> Result<()> {
        self.sendup(
            Some(chan),
            DeliveryTarget::One(chan),
            error_reply(buf, err.errno()),
        )
    }

    // ---- SAD operations --------------------------------------------

    fn op_getspi(&self, chan: ChannelId, parsed: &ParsedMsg<'_>) -> Result<()> {
        let satype = SaType::from_wire(parsed.hdr.satype)?;
        let proto = proto_of(satype)?;
        let (src, dst) = addr_pair(parsed)?;
        let saidx = saidx_from(parsed, proto, &src, &dst)?;
        let range = parsed.spirange().map(|r| (r.min, r.max));

        let spi = self.new_spi(range, proto)?;
        let sa = self.new_sa(SaRequestKind::GetSpi, satype, &saidx, spi, parsed)?;
        if sa.seq != 0 {
            self.acquire_done(sa.seq);
        }

        let mut b = MsgBuilder::echoing(parsed.hdr);
        b.sa_ext(spi, 0, SaState::Larval as u8, 0, 0, 0);
        echo_exts(&mut b, parsed, &[EXT_ADDRESS_SRC, EXT_ADDRESS_DST]);
        b.set_seq(sa.seq);
        self.sendup(Some(chan), DeliveryTarget::One(chan), b.finish())
    }

    fn op_update(&self, chan: ChannelId, parsed: &ParsedMsg<'_>) -> Result<()> {
        let satype = SaType::from_wire(parsed.hdr.satype)?;
        let proto = proto_of(satype)?;
        let sa0 = parsed
            .sa()
            .ok_or_else(|| Error::InvalidMessage("missing SA extension".into()))?;
        let (src, dst) = addr_pair(parsed)?;
        let saidx = saidx_from(parsed, proto, &src, &dst)?;

        let spi = u32::from_be(sa0.spi);
        let sa = self
            .sad
            .lookup_by_spi(spi)
            .ok_or_else(|| Error::InvalidMessage(format!("no SA found for SPI {spi:#x}")))?;
        if sa.pid != parsed.hdr.pid {
            return Err(Error::InvalidMessage(format!(
                "pid mismatched (SPI {spi:#x}, pid {} vs. {})",
                sa.pid, parsed.hdr.pid
            )));
        }
        if !sa.head().saidx.matches(&saidx, SaidxMatch::ModeReqid) {
            return Err(Error::Mismatch(format!("saidx mismatched for SPI {spi:#x}")));
        }

        if sa.state() == SaState::Larval {
            require_proto_keys(parsed, satype)?;
            self.finalize_sa(&sa, satype, parsed)?;
        } else {
            // a keyed SA only accepts lifetime changes
            if parsed.has(EXT_KEY_AUTH) || parsed.has(EXT_KEY_ENCRYPT) {
                return Err(Error::InvalidMessage(
                    "keys may not change on a mature SA".into(),
                ));
            }
            self.update_sa_lifetimes(&sa, parsed)?;
        }

        let mut b = MsgBuilder::echoing(parsed.hdr);
        echo_all_but_keys(&mut b, parsed);
        self.sendup(Some(chan), DeliveryTarget::All, b.finish())
    }

    fn op_add(&self, chan: ChannelId, parsed: &ParsedMsg<'_>) -> Result<()> {
        let satype = SaType::from_wire(parsed.hdr.satype)?;
        let proto = proto_of(satype)?;
        let sa0 = parsed
            .sa()
            .ok_or_else(|| Error::InvalidMessage("missing SA extension".into()))?;
        require_proto_keys(parsed, satype)?;
        let (src, dst) = addr_pair(parsed)?;
        let saidx = saidx_from(parsed, proto, &src, &dst)?;

        let spi = u32::from_be(sa0.spi);
        if self.sad.lookup_by_spi(spi).is_some() {
            return Err(Error::AlreadyExists(format!("SPI {spi:#x}")));
        }
        let sa = self.new_sa(SaRequestKind::Add, satype, &saidx, spi, parsed)?;
        if sa.seq != 0 {
            self.acquire_done(sa.seq);
        }

        let mut b = MsgBuilder::echoing(parsed.hdr);
        echo_all_but_keys(&mut b, parsed);
        self.sendup(Some(chan), DeliveryTarget::All, b.finish())
    }

    fn op_delete(&self, chan: ChannelId, parsed: &ParsedMsg<'_>) -> Result<()> {
        let satype = SaType::from_wire(parsed.hdr.satype)?;
        let proto = proto_of(satype)?;
        let (src, dst) = addr_pair(parsed)?;
        let saidx = saidx_from_any(proto, &src, &dst);

        let Some(sa0) = parsed.sa() else {
            // delete every non-LARVAL SA for the address pair
            debug!("doing delete all");
            let removed = self.sad.delete_all(&saidx);
            debug!(count = removed.len(), "deleted SAs");
            drop(removed);
            let mut b = MsgBuilder::echoing(parsed.hdr);
            echo_exts(&mut b, parsed, &[EXT_ADDRESS_SRC, EXT_ADDRESS_DST]);
            return self.sendup(Some(chan), DeliveryTarget::All, b.finish());
        };

        let spi = u32::from_be(sa0.spi);
        let sa = self
            .sad
            .lookup_by_spi(spi)
            .ok_or_else(|| Error::Mismatch(format!("no SA found for SPI {spi:#x}")))?;
        if !sa.head().saidx.matches(&saidx, SaidxMatch::Head) {
            return Err(Error::Mismatch(format!("saidx mismatched for SPI {spi:#x}")));
        }
        self.sad.unlink(&sa);
        drop(sa);

        let mut b = MsgBuilder::echoing(parsed.hdr);
        echo_exts(
            &mut b,
            parsed,
            &[EXT_SA, EXT_ADDRESS_SRC, EXT_ADDRESS_DST],
        );
        self.sendup(Some(chan), DeliveryTarget::All, b.finish())
    }

    fn op_get(&self, chan: ChannelId, parsed: &ParsedMsg<'_>) -> Result<()> {
        let satype = SaType::from_wire(parsed.hdr.satype)?;
        let proto = proto_of(satype)?;
        let sa0 = parsed
            .sa()
            .ok_or_else(|| Error::InvalidMessage("missing SA extension".into()))?;
        let (src, dst) = addr_pair(parsed)?;
        let saidx = saidx_from_any(proto, &src, &dst);

        let spi = u32::from_be(sa0.spi);
        let sa = self
            .sad
            .lookup_by_spi(spi)
            .filter(|sa| sa.head().saidx.matches(&saidx, SaidxMatch::Head))
            .ok_or_else(|| Error::NotFound("no SA found".into()))?;

        let reply = dump_sa(&sa, MsgType::Get, satype, parsed.hdr.seq, parsed.hdr.pid);
        self.sendup(Some(chan), DeliveryTarget::One(chan), reply)
    }

    fn op_acquire(&self, chan: ChannelId, parsed: &ParsedMsg<'_>, buf: &[u8]) -> Result<()> {
        // a bare header is key management reporting progress (or an
        // error) for a pending negotiation
        if buf.len() == MSG_HDRLEN {
            if parsed.hdr.seq == 0 {
                debug!("acquire ack without sequence number");
                return Ok(());
            }
            self.acquire_done(parsed.hdr.seq);
            return Ok(());
        }

        let satype = SaType::from_wire(parsed.hdr.satype)?;
        let proto = proto_of(satype)?;
        if !parsed.has(EXT_PROPOSAL) {
            return Err(Error::InvalidMessage("missing proposal".into()));
        }
        let (src, dst) = addr_pair(parsed)?;
        let saidx = saidx_from_any(proto, &src, &dst);
        if self.sad.lookup_head(&saidx, SaidxMatch::ModeReqid).is_some() {
            return Err(Error::AlreadyExists("an SA exists already".into()));
        }
        self.acquire(&saidx, None)?;
        // relay the request to the registered key managers
        self.sendup(
            Some(chan),
            DeliveryTarget::Registered(satype),
            Bytes::copy_from_slice(buf),
        )
    }

    fn op_register(&self, chan: ChannelId, parsed: &ParsedMsg<'_>) -> Result<()> {
        let satype = SaType::from_wire(parsed.hdr.satype)?;
        if satype != SaType::Unspec {
            self.registry().register(satype, chan)?;
            debug!(?satype, chan, "registered listener");
        }
        let mut b = MsgBuilder::echoing(parsed.hdr);
        write_supported(&mut b);
        self.sendup(Some(chan), DeliveryTarget::Registered(satype), b.finish())
    }

    fn op_flush(&self, chan: ChannelId, parsed: &ParsedMsg<'_>) -> Result<()> {
        let satype = SaType::from_wire(parsed.hdr.satype)?;
        let (sas, heads) = self.sad.flush(satype.proto());
        drop(sas);
        drop(heads);
        let b = MsgBuilder::echoing(parsed.hdr);
        self.sendup(Some(chan), DeliveryTarget::All, b.finish())
    }

    fn op_dump(&self, chan: ChannelId, parsed: &ParsedMsg<'_>) -> Result<()> {
        let satype = SaType::from_wire(parsed.hdr.satype)?;
        let snapshot = self.sad.snapshot(satype.proto());
        let mut cnt: u32 = snapshot.iter().map(|(_, sas)| sas.len() as u32).sum();
        if cnt == 0 {
            return Err(Error::NotFound("SAD is empty".into()));
        }
        for (head, sas) in snapshot {
            for sa in sas {
                cnt -= 1;
                let reply = dump_sa(&sa, MsgType::Dump, head.satype(), cnt, parsed.hdr.pid);
                self.sendup(Some(chan), DeliveryTarget::One(chan), reply)?;
            }
        }
        Ok(())
    }

    fn op_promisc(&self, chan: ChannelId, parsed: &ParsedMsg<'_>, buf: &[u8]) -> Result<()> {
        if buf.len() == MSG_HDRLEN {
            match parsed.hdr.satype {
                0 | 1 => {
                    self.registry().set_promisc(chan, parsed.hdr.satype == 1);
                    let b = MsgBuilder::echoing(parsed.hdr);
                    self.sendup(Some(chan), DeliveryTarget::All, b.finish())
                }
                _ => Err(Error::InvalidMessage("invalid promisc toggle".into())),
            }
        } else {
            // passthrough: strip our header and let everyone see the rest
            self.sendup(
                Some(chan),
                DeliveryTarget::All,
                Bytes::copy_from_slice(&buf[MSG_HDRLEN..]),
            )
        }
    }

    // ---- SPD operations --------------------------------------------

    fn op_spdadd(&self, chan: ChannelId, parsed: &ParsedMsg<'_>, update: bool) -> Result<()> {
        let (xpl, body) = parsed
            .policy()
            .ok_or_else(|| Error::InvalidMessage("missing policy extension".into()))?;
        let (src, dst) = addr_pair(parsed)?;
        let dir = Direction::from_wire(xpl.dir)?;
        let action = PolicyAction::from_wire(xpl.ptype)?;
        if action == PolicyAction::Ipsec && body.is_empty() {
            return Err(Error::InvalidMessage("policy requests required".into()));
        }
        let spidx = spidx_from(dir, &src, &dst);
        let requests = if action == PolicyAction::Ipsec {
            parse_requests(body, || self.new_reqid())?
        } else {
            Vec::new()
        };
        let lft = parsed.lifetime(EXT_LIFETIME_HARD);
        let priority = xpl.priority;
        let now = self.now();

        // lookup, unlink-on-update, id assignment and insert share one
        // critical section so no concurrent exact-match lookup can see
        // the selector unbound mid-update
        let sp = {
            let mut t = self.spd.write();
            let old = t.find_exact(&spidx);
            match old {
                Some(old) if update => {
                    debug!(id = old.id, "unlinking SP for update");
                    t.unlink(&old);
                }
                Some(_) => {
                    return Err(Error::AlreadyExists("an SP entry exists already".into()));
                }
                None => {}
            }
            let id = self.new_policy_id(|id| t.contains_id(id))?;
            let sp = SecPolicy::new(
                spidx,
                action,
                requests,
                id,
                priority,
                now,
                lft.map(|l| l.addtime).unwrap_or(0),
                lft.map(|l| l.usetime).unwrap_or(0),
            );
            t.insert(sp.clone());
            sp
        };
        self.spd.bump_generation();

        let mut b = MsgBuilder::echoing(parsed.hdr);
        sp.write_policy_ext(&mut b);
        echo_exts(
            &mut b,
            parsed,
            &[EXT_LIFETIME_HARD, EXT_ADDRESS_SRC, EXT_ADDRESS_DST],
        );
        self.sendup(Some(chan), DeliveryTarget::All, b.finish())
    }

    fn op_spddelete(&self, chan: ChannelId, parsed: &ParsedMsg<'_>) -> Result<()> {
        let (xpl, _) = parsed
            .policy()
            .ok_or_else(|| Error::InvalidMessage("missing policy extension".into()))?;
        let (src, dst) = addr_pair(parsed)?;
        let dir = Direction::from_wire(xpl.dir)?;
        PolicyAction::from_wire(xpl.ptype)?;
        let spidx = spidx_from(dir, &src, &dst);

        let sp = self
            .spd
            .lookup_exact(&spidx)
            .ok_or_else(|| Error::NotFound("no SP found".into()))?;
        self.spd.unlink(&sp);

        let mut b = MsgBuilder::echoing(parsed.hdr);
        // answer with the id the selector resolved to
        b.policy_hdr(sp.action.wire(), sp.spidx.dir.wire(), sp.id, sp.priority);
        echo_exts(&mut b, parsed, &[EXT_ADDRESS_SRC, EXT_ADDRESS_DST]);
        self.sendup(Some(chan), DeliveryTarget::All, b.finish())
    }

    fn op_spddelete2(&self, chan: ChannelId, parsed: &ParsedMsg<'_>) -> Result<()> {
        let (xpl, _) = parsed
            .policy()
            .ok_or_else(|| Error::InvalidMessage("missing policy extension".into()))?;
        let sp = self
            .spd
            .lookup_by_id(xpl.id)
            .ok_or_else(|| Error::NotFound(format!("no SP found for id {}", xpl.id)))?;
        self.spd.unlink(&sp);

        let mut b = MsgBuilder::echoing(parsed.hdr);
        echo_exts(&mut b, parsed, &[crate::ext::EXT_X_POLICY]);
        self.sendup(Some(chan), DeliveryTarget::All, b.finish())
    }

    fn op_spdget(&self, chan: ChannelId, parsed: &ParsedMsg<'_>) -> Result<()> {
        let (xpl, _) = parsed
            .policy()
            .ok_or_else(|| Error::InvalidMessage("missing policy extension".into()))?;
        let sp = self
            .spd
            .lookup_by_id(xpl.id)
            .ok_or_else(|| Error::NotFound(format!("no SP found for id {}", xpl.id)))?;
        let reply = dump_sp(&sp, MsgType::SpdGet, parsed.hdr.seq, parsed.hdr.pid);
        self.sendup(Some(chan), DeliveryTarget::One(chan), reply)
    }

    fn op_spddump(&self, chan: ChannelId, parsed: &ParsedMsg<'_>) -> Result<()> {
        let policies = self.spd.snapshot();
        let mut cnt = policies.len() as u32;
        if cnt == 0 {
            return Err(Error::NotFound("SPD is empty".into()));
        }
        for sp in policies {
            cnt -= 1;
            let reply = dump_sp(&sp, MsgType::SpdDump, cnt, parsed.hdr.pid);
            self.sendup(Some(chan), DeliveryTarget::One(chan), reply)?;
        }
        Ok(())
    }

    fn op_spdflush(&self, chan: ChannelId, parsed: &ParsedMsg<'_>, buf: &[u8]) -> Result<()> {
        if buf.len() != MSG_HDRLEN {
            return Err(Error::InvalidMessage("spdflush takes no extensions".into()));
        }
        let drained = self.spd.flush();
        debug!(count = drained.len(), "flushed SPD");
        drop(drained);
        let b = MsgBuilder::echoing(parsed.hdr);
        self.sendup(Some(chan), DeliveryTarget::All, b.finish())
    }
}

/// SA-type/message-type cross checks done before dispatch.
fn check_satype(parsed: &ParsedMsg<'_>) -> Result<()> {
    if parsed.msg_type == MsgType::Promisc {
        // the toggle reuses the satype field as a boolean
        return Ok(());
    }
    let satype = SaType::from_wire(parsed.hdr.satype)?;
    if satype == SaType::Unspec && parsed.msg_type.needs_satype() {
        return Err(Error::InvalidMessage(format!(
            "must specify satype for {:?}",
            parsed.msg_type
        )));
    }
    if satype != SaType::Unspec && parsed.msg_type.is_spd_op() {
        return Err(Error::InvalidMessage(format!(
            "illegal satype {:?} for {:?}",
            satype, parsed.msg_type
        )));
    }
    Ok(())
}

fn proto_of(satype: SaType) -> Result<IpsecProto> {
    satype
        .proto()
        .ok_or_else(|| Error::InvalidMessage("satype carries no protocol".into()))
}

fn addr_pair(parsed: &ParsedMsg<'_>) -> Result<(AddressExt, AddressExt)> {
    match (
        parsed.address(EXT_ADDRESS_SRC),
        parsed.address(EXT_ADDRESS_DST),
    ) {
        (Some(src), Some(dst)) => Ok((src, dst)),
        _ => Err(Error::InvalidMessage(
            "missing source/destination address".into(),
        )),
    }
}

/// Association identity from a message: mode/reqid come from the sa2
/// extension when present; ports start zeroed and NAT-T fills them in.
fn saidx_from(
    parsed: &ParsedMsg<'_>,
    proto: IpsecProto,
    src: &AddressExt,
    dst: &AddressExt,
) -> Result<SaIndex> {
    let (mode, reqid) = match parsed.sa2() {
        Some(sa2) => (IpsecMode::from_wire(sa2.mode)?, sa2.reqid),
        None => (IpsecMode::Any, 0),
    };
    let mut saidx = saidx_from_any(proto, src, dst);
    saidx.mode = mode;
    saidx.reqid = reqid;
    if let Some(sport) = parsed.natt_port(EXT_X_NAT_T_SPORT) {
        saidx.src.port = sport;
    }
    if let Some(dport) = parsed.natt_port(EXT_X_NAT_T_DPORT) {
        saidx.dst.port = dport;
    }
    Ok(saidx)
}

fn saidx_from_any(proto: IpsecProto, src: &AddressExt, dst: &AddressExt) -> SaIndex {
    let mut src_ep = src.endpoint;
    let mut dst_ep = dst.endpoint;
    src_ep.port = 0;
    dst_ep.port = 0;
    SaIndex {
        proto,
        mode: IpsecMode::Any,
        reqid: 0,
        src: src_ep,
        dst: dst_ep,
    }
}

/// Policy selector from a message; selector ports stay as carried.
fn spidx_from(dir: Direction, src: &AddressExt, dst: &AddressExt) -> SpIndex {
    SpIndex {
        dir,
        src: src.endpoint,
        dst: dst.endpoint,
        prefs: src.prefixlen,
        prefd: dst.prefixlen,
        ul_proto: src.proto,
    }
}

/// The key shape every protocol insists on at add/finalize time.
fn require_proto_keys(parsed: &ParsedMsg<'_>, satype: SaType) -> Result<()> {
    match satype {
        SaType::Esp if !parsed.has(EXT_KEY_ENCRYPT) => {
            Err(Error::InvalidMessage("ESP requires an encryption key".into()))
        }
        SaType::Ah if !parsed.has(EXT_KEY_AUTH) => Err(Error::InvalidMessage(
            "AH requires an authentication key".into(),
        )),
        _ => Ok(()),
    }
}

/// Echo selected extensions of the request, in the given order, skipping
/// absent ones.
fn echo_exts(b: &mut MsgBuilder, parsed: &ParsedMsg<'_>, types: &[u16]) {
    for &ty in types {
        if let Some(raw) = parsed.ext(ty) {
            b.echo_ext(raw);
        }
    }
}

/// Echo every extension except the key blobs (add/update replies must not
/// leak key material to every listener).
fn echo_all_but_keys(b: &mut MsgBuilder, parsed: &ParsedMsg<'_>) {
    for ty in 1..=EXT_MAX {
        if ty == EXT_KEY_AUTH || ty == EXT_KEY_ENCRYPT {
            continue;
        }
        if let Some(raw) = parsed.ext(ty) {
            b.echo_ext(raw);
        }
    }
}

/// Serialize one SA the way get/dump replies and expire notifications
/// carry it.
pub(crate) fn dump_sa(
    sa: &Arc<SecAssoc>,
    ty: MsgType,
    satype: SaType,
    seq: u32,
    pid: u32,
) -> Bytes {
    let head = sa.head();
    let mut b = MsgBuilder::new(ty, satype.wire(), seq, pid);
    b.set_reserved(Arc::strong_count(sa) as u16);
    sa.with_crypt(|c| {
        b.sa_ext(
            sa.spi,
            c.replay.as_ref().map(|r| r.wsize).unwrap_or(0),
            sa.state() as u8,
            c.auth_alg,
            c.enc_alg,
            c.flags,
        );
        b.sa2(
            head.saidx.mode.wire(),
            c.replay.as_ref().map(|r| r.count).unwrap_or(0),
            head.saidx.reqid,
        );
        b.lifetime(EXT_LIFETIME_CURRENT, &sa.current_lifetime());
        if let Some(hard) = &c.lft_hard {
            b.lifetime(EXT_LIFETIME_HARD, hard);
        }
        if let Some(soft) = &c.lft_soft {
            b.lifetime(EXT_LIFETIME_SOFT, soft);
        }
        b.address(
            EXT_ADDRESS_SRC,
            &head.saidx.src,
            head.saidx.src.addr_bits(),
            ULPROTO_ANY,
        );
        b.address(
            EXT_ADDRESS_DST,
            &head.saidx.dst,
            head.saidx.dst.addr_bits(),
            ULPROTO_ANY,
        );
        if let Some(key) = &c.key_auth {
            b.key(EXT_KEY_AUTH, key);
        }
        if let Some(key) = &c.key_enc {
            b.key(EXT_KEY_ENCRYPT, key);
        }
        if c.natt_type != 0 {
            b.natt_type(c.natt_type);
            b.natt_port(EXT_X_NAT_T_SPORT, c.natt_sport);
            b.natt_port(EXT_X_NAT_T_DPORT, c.natt_dport);
        }
    });
    b.finish()
}

/// Serialize one SP the way spdget/spddump replies and policy expiry
/// notifications carry it.
pub(crate) fn dump_sp(sp: &Arc<SecPolicy>, ty: MsgType, seq: u32, pid: u32) -> Bytes {
    let mut b = MsgBuilder::new(ty, SaType::Unspec.wire(), seq, pid);
    b.set_reserved(Arc::strong_count(sp) as u16);
    b.address(
        EXT_ADDRESS_SRC,
        &sp.spidx.src,
        sp.spidx.prefs,
        sp.spidx.ul_proto,
    );
    b.address(
        EXT_ADDRESS_DST,
        &sp.spidx.dst,
        sp.spidx.prefd,
        sp.spidx.ul_proto,
    );
    sp.write_policy_ext(&mut b);
    if sp.lifetime != 0 || sp.validtime != 0 {
        b.lifetime(
            EXT_LIFETIME_CURRENT,
            &crate::keys::Lifetime {
                allocations: 0,
                bytes: 0,
                addtime: sp.created,
                usetime: sp.last_used(),
            },
        );
        b.lifetime(
            EXT_LIFETIME_HARD,
            &crate::keys::Lifetime {
                allocations: 0,
                bytes: 0,
                addtime: sp.lifetime,
                usetime: sp.validtime,
            },
        );
    }
    b.finish()
}
