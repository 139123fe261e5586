//! Core value types: endpoints, protocol/mode/state enums, and the two
//! index structures (policy index and association index) with their
//! comparison rules.

use std::net::IpAddr;

use crate::error::{Error, Result};

/// Address family constants used on the wire.
pub const AF_INET: u8 = 2;
/// IPv6 address family on the wire.
pub const AF_INET6: u8 = 10;

/// Upper-layer protocol wildcard in a policy selector.
pub const ULPROTO_ANY: u8 = 255;

/// Highest reqid an operator may assign manually; the allocator hands out
/// values above this for `unique`-level requests.
pub const MANUAL_REQID_MAX: u32 = 0x3fff;

/// SA type carried in the message header (`sadb_msg_satype`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SaType {
    /// Unspecified; legal only for SPD and bulk operations.
    Unspec,
    /// Authentication Header.
    Ah,
    /// Encapsulating Security Payload.
    Esp,
    /// IP payload compression.
    IpComp,
    /// TCP-MD5 signature option.
    TcpSignature,
}

impl SaType {
    /// Decode the wire satype. Reserved-but-known types (RSVP, OSPFv2,
    /// RIPv2, Mobile IP) are reported as unsupported, everything else as
    /// invalid.
    pub fn from_wire(val: u8) -> Result<Self> {
        match val {
            0 => Ok(Self::Unspec),
            2 => Ok(Self::Ah),
            3 => Ok(Self::Esp),
            9 => Ok(Self::IpComp),
            10 => Ok(Self::TcpSignature),
            5..=8 => Err(Error::NotSupported(format!("satype {val}"))),
            _ => Err(Error::InvalidMessage(format!("invalid satype {val}"))),
        }
    }

    /// Wire encoding of this SA type.
    pub fn wire(&self) -> u8 {
        match self {
            Self::Unspec => 0,
            Self::Ah => 2,
            Self::Esp => 3,
            Self::IpComp => 9,
            Self::TcpSignature => 10,
        }
    }

    /// The IPsec protocol this SA type keys.
    pub fn proto(&self) -> Option<IpsecProto> {
        match self {
            Self::Unspec => None,
            Self::Ah => Some(IpsecProto::Ah),
            Self::Esp => Some(IpsecProto::Esp),
            Self::IpComp => Some(IpsecProto::IpComp),
            Self::TcpSignature => Some(IpsecProto::Tcp),
        }
    }
}

/// IPsec protocol (IP protocol numbers).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IpsecProto {
    /// Encapsulating Security Payload (50).
    Esp,
    /// Authentication Header (51).
    Ah,
    /// IP payload compression (108).
    IpComp,
    /// TCP (6), for TCP-MD5 associations.
    Tcp,
}

impl IpsecProto {
    /// Get the protocol number.
    pub fn number(&self) -> u8 {
        match self {
            Self::Esp => 50,
            Self::Ah => 51,
            Self::IpComp => 108,
            Self::Tcp => 6,
        }
    }

    /// Map back to the SA type used on the wire.
    pub fn satype(&self) -> SaType {
        match self {
            Self::Esp => SaType::Esp,
            Self::Ah => SaType::Ah,
            Self::IpComp => SaType::IpComp,
            Self::Tcp => SaType::TcpSignature,
        }
    }

    /// Decode a request-record protocol number.
    pub fn from_request(val: u16) -> Result<Self> {
        match val {
            50 => Ok(Self::Esp),
            51 => Ok(Self::Ah),
            108 => Ok(Self::IpComp),
            other => Err(Error::ProtocolNotSupported(format!(
                "request proto {other}"
            ))),
        }
    }
}

/// IPsec mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IpsecMode {
    /// Wildcard; matches any mode in lookups.
    Any,
    /// Transport mode.
    Transport,
    /// Tunnel mode.
    Tunnel,
}

impl IpsecMode {
    /// Decode the wire mode value.
    pub fn from_wire(val: u8) -> Result<Self> {
        match val {
            0 => Ok(Self::Any),
            1 => Ok(Self::Transport),
            2 => Ok(Self::Tunnel),
            other => Err(Error::InvalidMessage(format!("invalid mode {other}"))),
        }
    }

    /// Wire encoding.
    pub fn wire(&self) -> u8 {
        match self {
            Self::Any => 0,
            Self::Transport => 1,
            Self::Tunnel => 2,
        }
    }
}

/// Policy direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Incoming traffic.
    Inbound,
    /// Outgoing traffic.
    Outbound,
}

impl Direction {
    /// Decode the wire direction; only inbound/outbound are storable.
    pub fn from_wire(val: u8) -> Result<Self> {
        match val {
            1 => Ok(Self::Inbound),
            2 => Ok(Self::Outbound),
            other => Err(Error::InvalidMessage(format!(
                "invalid SP direction {other}"
            ))),
        }
    }

    /// Wire encoding.
    pub fn wire(&self) -> u8 {
        match self {
            Self::Inbound => 1,
            Self::Outbound => 2,
        }
    }

    /// Index into per-direction tables.
    pub(crate) fn index(&self) -> usize {
        match self {
            Self::Inbound => 0,
            Self::Outbound => 1,
        }
    }
}

/// Policy action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyAction {
    /// Drop matching traffic.
    Discard,
    /// Pass matching traffic in the clear.
    Bypass,
    /// Apply the policy's transform requests.
    Ipsec,
}

impl PolicyAction {
    /// Decode the wire policy type; only discard/none/ipsec are accepted
    /// for policy add and delete.
    pub fn from_wire(val: u16) -> Result<Self> {
        match val {
            0 => Ok(Self::Discard),
            1 => Ok(Self::Bypass),
            2 => Ok(Self::Ipsec),
            other => Err(Error::InvalidMessage(format!(
                "invalid policy type {other}"
            ))),
        }
    }

    /// Wire encoding.
    pub fn wire(&self) -> u16 {
        match self {
            Self::Discard => 0,
            Self::Bypass => 1,
            Self::Ipsec => 2,
        }
    }
}

/// Level of a policy transform request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyLevel {
    /// Use system default behavior.
    Default,
    /// Use an SA if one exists.
    Use,
    /// Require an SA.
    Require,
    /// Require an SA bound to this request's reqid.
    Unique,
}

impl PolicyLevel {
    /// Decode the wire level value.
    pub fn from_wire(val: u8) -> Result<Self> {
        match val {
            0 => Ok(Self::Default),
            1 => Ok(Self::Use),
            2 => Ok(Self::Require),
            3 => Ok(Self::Unique),
            other => Err(Error::InvalidMessage(format!("invalid level {other}"))),
        }
    }

    /// Wire encoding.
    pub fn wire(&self) -> u8 {
        match self {
            Self::Default => 0,
            Self::Use => 1,
            Self::Require => 2,
            Self::Unique => 3,
        }
    }
}

/// SA lifecycle state.
///
/// The only sanctioned backward transition is DYING back to MATURE via an
/// explicit update; DEAD is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum SaState {
    /// Allocated, keys may still be incomplete.
    Larval = 0,
    /// Fully keyed and usable.
    Mature = 1,
    /// Soft lifetime exceeded; still usable, preferentially replaced.
    Dying = 2,
    /// Unlinked, pending free.
    Dead = 3,
}

impl SaState {
    pub(crate) fn from_u8(val: u8) -> Self {
        match val {
            0 => Self::Larval,
            1 => Self::Mature,
            2 => Self::Dying,
            _ => Self::Dead,
        }
    }

    /// Usable for traffic (MATURE or DYING).
    pub fn is_alive(&self) -> bool {
        matches!(self, Self::Mature | Self::Dying)
    }
}

/// One traffic endpoint: address, port (0 = any), and IPv6 scope zone
/// (0 = wildcard).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Endpoint {
    /// IP address.
    pub addr: IpAddr,
    /// Transport port in host order; 0 matches any port.
    pub port: u16,
    /// IPv6 scope zone id; 0 for IPv4 and for wildcard scope.
    pub scope: u32,
}

impl Endpoint {
    /// Endpoint with a port.
    pub fn new(addr: IpAddr, port: u16) -> Self {
        Self {
            addr,
            port,
            scope: 0,
        }
    }

    /// Wire address family of this endpoint.
    pub fn family(&self) -> u8 {
        match self.addr {
            IpAddr::V4(_) => AF_INET,
            IpAddr::V6(_) => AF_INET6,
        }
    }

    /// Address width in bits (for prefix-length validation).
    pub fn addr_bits(&self) -> u8 {
        match self.addr {
            IpAddr::V4(_) => 32,
            IpAddr::V6(_) => 128,
        }
    }

    fn addr_octets(&self) -> [u8; 16] {
        let mut out = [0u8; 16];
        match self.addr {
            IpAddr::V4(a) => out[..4].copy_from_slice(&a.octets()),
            IpAddr::V6(a) => out.copy_from_slice(&a.octets()),
        }
        out
    }

    /// Full comparison; ports compared only when `ports` is set.
    ///
    /// IPv6 scope ids always compare exactly here, matching the exact
    /// sockaddr comparison of the classic implementations.
    pub fn matches(&self, other: &Endpoint, ports: bool) -> bool {
        if self.family() != other.family() {
            return false;
        }
        if self.addr != other.addr || self.scope != other.scope {
            return false;
        }
        !ports || self.port == other.port
    }

    /// Prefix comparison over the leading `bits` address bits.
    pub fn matches_prefix(&self, other: &Endpoint, bits: u8) -> bool {
        if self.family() != other.family() {
            return false;
        }
        bits_equal(&self.addr_octets(), &other.addr_octets(), bits)
    }
}

/// Compare the leading `bits` bits of two byte strings.
pub(crate) fn bits_equal(a: &[u8], b: &[u8], bits: u8) -> bool {
    let mut bits = bits as usize;
    let mut i = 0;
    while bits >= 8 {
        if a[i] != b[i] {
            return false;
        }
        i += 1;
        bits -= 8;
    }
    if bits > 0 {
        let mask = !((1u8 << (8 - bits)) - 1);
        if (a[i] & mask) != (b[i] & mask) {
            return false;
        }
    }
    true
}

/// Security policy index: the traffic selector identifying an SP.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpIndex {
    /// Traffic direction.
    pub dir: Direction,
    /// Source endpoint.
    pub src: Endpoint,
    /// Destination endpoint.
    pub dst: Endpoint,
    /// Source prefix length in bits.
    pub prefs: u8,
    /// Destination prefix length in bits.
    pub prefd: u8,
    /// Upper-layer protocol, or [`ULPROTO_ANY`].
    pub ul_proto: u8,
}

impl SpIndex {
    /// Exact identity comparison, used for duplicate detection and
    /// delete-by-selector. Prefix lengths, upper-layer protocol, addresses
    /// and ports must all be equal.
    pub fn matches_exact(&self, other: &SpIndex) -> bool {
        self.dir == other.dir
            && self.prefs == other.prefs
            && self.prefd == other.prefd
            && self.ul_proto == other.ul_proto
            && self.src.matches(&other.src, true)
            && self.dst.matches(&other.dst, true)
    }

    /// Selector-vs-packet comparison: `self` is the stored policy
    /// selector, `pkt` is built from a live packet. Ports match only when
    /// the policy pins them, addresses by prefix bit-compare, and an IPv6
    /// scope id of zero on either side is a wildcard.
    pub fn matches_packet(&self, pkt: &SpIndex) -> bool {
        if self.src.family() != pkt.src.family() || self.dst.family() != pkt.dst.family() {
            return false;
        }
        if self.ul_proto != ULPROTO_ANY && self.ul_proto != pkt.ul_proto {
            return false;
        }
        if self.src.port != 0 && self.src.port != pkt.src.port {
            return false;
        }
        if self.src.scope != 0 && pkt.src.scope != 0 && self.src.scope != pkt.src.scope {
            return false;
        }
        if !self.src.matches_prefix(&pkt.src, self.prefs) {
            return false;
        }
        if self.dst.port != 0 && self.dst.port != pkt.dst.port {
            return false;
        }
        if self.dst.scope != 0 && pkt.dst.scope != 0 && self.dst.scope != pkt.dst.scope {
            return false;
        }
        self.dst.matches_prefix(&pkt.dst, self.prefd)
    }
}

/// How to compare two [`SaIndex`] values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaidxMatch {
    /// Protocol, mode, reqid, and both endpoints including ports.
    Exact,
    /// Protocol and endpoints only; mode and reqid ignored.
    Head,
    /// Protocol and endpoints, plus mode/reqid wildcard rules: a nonzero
    /// probe reqid must match, and a non-`Any` stored mode must match.
    ModeReqid,
}

/// Security association index: the identity shared by all SAs under one
/// association head.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SaIndex {
    /// IPsec protocol.
    pub proto: IpsecProto,
    /// Mode; `Any` for delete/get requests that do not pin it.
    pub mode: IpsecMode,
    /// Operator or kernel assigned request id; 0 = none.
    pub reqid: u32,
    /// Source endpoint.
    pub src: Endpoint,
    /// Destination endpoint.
    pub dst: Endpoint,
}

impl SaIndex {
    /// Compare against `probe` at the given granularity. `self` is the
    /// stored index (on an association head), `probe` comes from a message
    /// or the data plane.
    pub fn matches(&self, probe: &SaIndex, how: SaidxMatch) -> bool {
        if self.proto != probe.proto {
            return false;
        }
        match how {
            SaidxMatch::Exact => {
                self.mode == probe.mode
                    && self.reqid == probe.reqid
                    && self.src.matches(&probe.src, true)
                    && self.dst.matches(&probe.dst, true)
            }
            SaidxMatch::Head | SaidxMatch::ModeReqid => {
                if how == SaidxMatch::ModeReqid {
                    if probe.reqid != 0 && self.reqid != probe.reqid {
                        return false;
                    }
                    if self.mode != IpsecMode::Any && self.mode != probe.mode {
                        return false;
                    }
                }
                // Ports participate only when the probe carries a full
                // NAT-T port pair.
                let ports = probe.src.port != 0 && probe.dst.port != 0;
                self.src.matches(&probe.src, ports) && self.dst.matches(&probe.dst, ports)
            }
        }
    }

    /// Hash key over the address pair, ignoring ports (they may be
    /// rewritten by NAT-T after the head is created).
    pub fn addr_hash(&self) -> u64 {
        use std::hash::{Hash, Hasher};
        let mut h = std::collections::hash_map::DefaultHasher::new();
        self.src.addr.hash(&mut h);
        self.dst.addr.hash(&mut h);
        h.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, Ipv6Addr};

    fn ep(s: &str, port: u16) -> Endpoint {
        Endpoint::new(s.parse().unwrap(), port)
    }

    #[test]
    fn satype_roundtrip() {
        assert_eq!(SaType::from_wire(3).unwrap(), SaType::Esp);
        assert_eq!(SaType::Esp.wire(), 3);
        assert_eq!(SaType::Esp.proto(), Some(IpsecProto::Esp));
        assert_eq!(IpsecProto::Esp.number(), 50);
        assert_eq!(IpsecProto::Ah.satype(), SaType::Ah);
    }

    #[test]
    fn satype_reserved_rejected() {
        assert!(matches!(SaType::from_wire(5), Err(Error::NotSupported(_))));
        assert!(matches!(
            SaType::from_wire(200),
            Err(Error::InvalidMessage(_))
        ));
    }

    #[test]
    fn bits_equal_partial_byte() {
        let a = Ipv4Addr::new(10, 0, 0, 5).octets();
        let b = Ipv4Addr::new(10, 0, 0, 200).octets();
        assert!(bits_equal(&a, &b, 24));
        assert!(!bits_equal(&a, &b, 32));
        let c = Ipv4Addr::new(10, 0, 1, 5).octets();
        assert!(!bits_equal(&a, &c, 24));
        assert!(bits_equal(&a, &c, 22));
    }

    #[test]
    fn spidx_exact_vs_mask() {
        let sp = SpIndex {
            dir: Direction::Outbound,
            src: ep("10.0.0.0", 0),
            dst: ep("10.0.1.0", 0),
            prefs: 24,
            prefd: 24,
            ul_proto: ULPROTO_ANY,
        };
        let pkt = SpIndex {
            dir: Direction::Outbound,
            src: ep("10.0.0.5", 1234),
            dst: ep("10.0.1.9", 80),
            prefs: 32,
            prefd: 32,
            ul_proto: 6,
        };
        assert!(!sp.matches_exact(&pkt));
        assert!(sp.matches_packet(&pkt));

        let miss = SpIndex {
            src: ep("10.0.2.5", 0),
            ..pkt.clone()
        };
        assert!(!sp.matches_packet(&miss));
    }

    #[test]
    fn spidx_pinned_port_and_proto() {
        let sp = SpIndex {
            dir: Direction::Inbound,
            src: ep("192.168.1.0", 500),
            dst: ep("192.168.2.0", 0),
            prefs: 24,
            prefd: 24,
            ul_proto: 17,
        };
        let mut pkt = SpIndex {
            dir: Direction::Inbound,
            src: ep("192.168.1.7", 500),
            dst: ep("192.168.2.7", 4500),
            prefs: 32,
            prefd: 32,
            ul_proto: 17,
        };
        assert!(sp.matches_packet(&pkt));
        pkt.src.port = 4500;
        assert!(!sp.matches_packet(&pkt));
        pkt.src.port = 500;
        pkt.ul_proto = 6;
        assert!(!sp.matches_packet(&pkt));
    }

    #[test]
    fn spidx_v6_scope_wildcard() {
        let mut src = ep("fe80::1", 0);
        src.scope = 0;
        let sp = SpIndex {
            dir: Direction::Outbound,
            src,
            dst: ep("fe80::2", 0),
            prefs: 128,
            prefd: 128,
            ul_proto: ULPROTO_ANY,
        };
        let mut pkt = sp.clone();
        pkt.src.scope = 7;
        assert!(sp.matches_packet(&pkt));
        let mut scoped = sp.clone();
        scoped.src.scope = 3;
        assert!(!scoped.matches_packet(&pkt));
        assert_eq!(
            sp.src.addr,
            IpAddr::V6("fe80::1".parse::<Ipv6Addr>().unwrap())
        );
    }

    #[test]
    fn saidx_match_granularities() {
        let stored = SaIndex {
            proto: IpsecProto::Esp,
            mode: IpsecMode::Tunnel,
            reqid: 42,
            src: ep("10.0.0.1", 0),
            dst: ep("10.0.0.2", 0),
        };
        let mut probe = stored.clone();
        assert!(stored.matches(&probe, SaidxMatch::Exact));

        probe.reqid = 0;
        probe.mode = IpsecMode::Any;
        assert!(!stored.matches(&probe, SaidxMatch::Exact));
        assert!(stored.matches(&probe, SaidxMatch::Head));
        // reqid 0 in the probe is a wildcard, but stored mode must match.
        assert!(!stored.matches(&probe, SaidxMatch::ModeReqid));
        probe.mode = IpsecMode::Tunnel;
        assert!(stored.matches(&probe, SaidxMatch::ModeReqid));

        probe.reqid = 43;
        assert!(!stored.matches(&probe, SaidxMatch::ModeReqid));
    }

    #[test]
    fn saidx_nat_t_ports() {
        let stored = SaIndex {
            proto: IpsecProto::Esp,
            mode: IpsecMode::Tunnel,
            reqid: 0,
            src: ep("10.0.0.1", 4500),
            dst: ep("10.0.0.2", 4500),
        };
        // Probe without ports ignores the stored NAT-T ports.
        let probe = SaIndex {
            src: ep("10.0.0.1", 0),
            dst: ep("10.0.0.2", 0),
            ..stored.clone()
        };
        assert!(stored.matches(&probe, SaidxMatch::Head));
        // Probe with a full port pair compares them.
        let probe = SaIndex {
            src: ep("10.0.0.1", 4500),
            dst: ep("10.0.0.2", 9999),
            ..stored.clone()
        };
        assert!(!stored.matches(&probe, SaidxMatch::Head));
    }
}
