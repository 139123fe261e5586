//! Serializable views of store contents for diagnostics and tooling.
//!
//! Key material is deliberately absent from these views; they are meant
//! for operator-facing output.

use serde::Serialize;

use crate::sad::SecAssoc;
use crate::spd::SecPolicy;
use crate::types::SaState;

/// Operator view of one SA.
#[derive(Debug, Clone, Serialize)]
pub struct SaInfo {
    /// SPI in host order.
    pub spi: u32,
    /// Protocol number.
    pub proto: u8,
    /// Mode on the wire.
    pub mode: u8,
    /// Request id.
    pub reqid: u32,
    /// Source address.
    pub src: String,
    /// Destination address.
    pub dst: String,
    /// Lifecycle state.
    pub state: String,
    /// Creation time, seconds.
    pub created: u64,
    /// Bytes processed.
    pub bytes: u64,
    /// Authentication algorithm id.
    pub auth_alg: u8,
    /// Encryption algorithm id.
    pub enc_alg: u8,
    /// Replay window size.
    pub replay_window: u8,
}

impl SaInfo {
    /// Snapshot an SA. Key bytes are never copied.
    pub fn of(sa: &SecAssoc) -> Self {
        let head = sa.head();
        let cur = sa.current_lifetime();
        sa.with_crypt(|c| Self {
            spi: sa.spi,
            proto: head.saidx.proto.number(),
            mode: head.saidx.mode.wire(),
            reqid: head.saidx.reqid,
            src: head.saidx.src.addr.to_string(),
            dst: head.saidx.dst.addr.to_string(),
            state: state_name(sa.state()).to_string(),
            created: cur.addtime,
            bytes: cur.bytes,
            auth_alg: c.auth_alg,
            enc_alg: c.enc_alg,
            replay_window: c.replay.as_ref().map(|r| r.wsize).unwrap_or(0),
        })
    }

    /// Render as JSON.
    pub fn to_json(&self) -> crate::Result<String> {
        serde_json::to_string(self).map_err(|e| crate::Error::NoResources(e.to_string()))
    }
}

/// Operator view of one policy.
#[derive(Debug, Clone, Serialize)]
pub struct SpInfo {
    /// Policy id.
    pub id: u32,
    /// Direction on the wire.
    pub dir: u8,
    /// Action on the wire.
    pub action: u16,
    /// Priority.
    pub priority: u32,
    /// Source selector as `addr/prefix`.
    pub src: String,
    /// Destination selector as `addr/prefix`.
    pub dst: String,
    /// Upper-layer protocol (255 = any).
    pub ul_proto: u8,
    /// Number of transform requests.
    pub requests: usize,
}

impl SpInfo {
    /// Snapshot a policy.
    pub fn of(sp: &SecPolicy) -> Self {
        Self {
            id: sp.id,
            dir: sp.spidx.dir.wire(),
            action: sp.action.wire(),
            priority: sp.priority,
            src: format!("{}/{}", sp.spidx.src.addr, sp.spidx.prefs),
            dst: format!("{}/{}", sp.spidx.dst.addr, sp.spidx.prefd),
            ul_proto: sp.spidx.ul_proto,
            requests: sp.requests.len(),
        }
    }

    /// Render as JSON.
    pub fn to_json(&self) -> crate::Result<String> {
        serde_json::to_string(self).map_err(|e| crate::Error::NoResources(e.to_string()))
    }
}

fn state_name(state: SaState) -> &'static str {
    match state {
        SaState::Larval => "larval",
        SaState::Mature => "mature",
        SaState::Dying => "dying",
        SaState::Dead => "dead",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sad::{SaCrypt, SaHead, SecAssoc};
    use crate::types::{Endpoint, IpsecMode, IpsecProto, SaIndex, SaState};

    #[test]
    fn sa_info_elides_keys() {
        let head = SaHead::new(SaIndex {
            proto: IpsecProto::Esp,
            mode: IpsecMode::Tunnel,
            reqid: 3,
            src: Endpoint::new("10.0.0.1".parse().unwrap(), 0),
            dst: Endpoint::new("10.0.0.2".parse().unwrap(), 0),
        });
        let mut crypt = SaCrypt::default();
        crypt.auth_alg = 3;
        crypt.key_auth = Some(
            crate::keys::KeyMaterial::from_wire(64, &[0xaa; 8]).unwrap(),
        );
        let sa = SecAssoc::new(0x1234, 0, 0, head, SaState::Mature, crypt, 42);
        let info = SaInfo::of(&sa);
        let json = info.to_json().unwrap();
        assert!(json.contains("\"spi\":4660"));
        assert!(json.contains("mature"));
        assert!(!json.to_lowercase().contains("aa"));
    }
}
