//! PF_KEY extension handling: typed extension headers, the strict
//! length-validation tables, and the per-message extension index.
//!
//! Every extension opens with a `{len: u16, type: u16}` header where `len`
//! counts 8-byte units, so extensions are always 8-byte aligned on the
//! wire. A message may carry each extension type at most once.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::error::{Error, Result};
use crate::keys::Lifetime;
use crate::msg::{MSG_HDRLEN, MsgHdr, MsgType, PF_KEY_V2, SADB_ALIGNTO};
use crate::types::{AF_INET, AF_INET6, Endpoint};

// Extension types.
pub const EXT_RESERVED: u16 = 0;
pub const EXT_SA: u16 = 1;
pub const EXT_LIFETIME_CURRENT: u16 = 2;
pub const EXT_LIFETIME_HARD: u16 = 3;
pub const EXT_LIFETIME_SOFT: u16 = 4;
pub const EXT_ADDRESS_SRC: u16 = 5;
pub const EXT_ADDRESS_DST: u16 = 6;
pub const EXT_ADDRESS_PROXY: u16 = 7;
pub const EXT_KEY_AUTH: u16 = 8;
pub const EXT_KEY_ENCRYPT: u16 = 9;
pub const EXT_IDENTITY_SRC: u16 = 10;
pub const EXT_IDENTITY_DST: u16 = 11;
pub const EXT_SENSITIVITY: u16 = 12;
pub const EXT_PROPOSAL: u16 = 13;
pub const EXT_SUPPORTED_AUTH: u16 = 14;
pub const EXT_SUPPORTED_ENCRYPT: u16 = 15;
pub const EXT_SPIRANGE: u16 = 16;
pub const EXT_X_KMPRIVATE: u16 = 17;
pub const EXT_X_POLICY: u16 = 18;
pub const EXT_X_SA2: u16 = 19;
pub const EXT_X_NAT_T_TYPE: u16 = 20;
pub const EXT_X_NAT_T_SPORT: u16 = 21;
pub const EXT_X_NAT_T_DPORT: u16 = 22;
pub const EXT_X_NAT_T_OAI: u16 = 23;
pub const EXT_X_NAT_T_OAR: u16 = 24;
pub const EXT_X_NAT_T_FRAG: u16 = 25;
/// Highest known extension type.
pub const EXT_MAX: u16 = 25;

/// Per-type length bounds in bytes: `(min, max)`, `max == 0` means
/// unbounded, `min == 0` means the type is never acceptable on input.
const EXT_BOUNDS: [(usize, usize); EXT_MAX as usize + 1] = [
    (0, 0),   // RESERVED
    (16, 16), // SA
    (32, 32), // LIFETIME_CURRENT
    (32, 32), // LIFETIME_HARD
    (32, 32), // LIFETIME_SOFT
    (8, 0),   // ADDRESS_SRC
    (8, 0),   // ADDRESS_DST
    (8, 0),   // ADDRESS_PROXY
    (8, 0),   // KEY_AUTH
    (8, 0),   // KEY_ENCRYPT
    (16, 0),  // IDENTITY_SRC
    (16, 0),  // IDENTITY_DST
    (16, 0),  // SENSITIVITY
    (8, 0),   // PROPOSAL
    (8, 0),   // SUPPORTED_AUTH
    (8, 0),   // SUPPORTED_ENCRYPT
    (16, 16), // SPIRANGE
    (0, 0),   // X_KMPRIVATE
    (16, 0),  // X_POLICY
    (16, 16), // X_SA2
    (8, 8),   // X_NAT_T_TYPE
    (8, 8),   // X_NAT_T_SPORT
    (8, 8),   // X_NAT_T_DPORT
    (8, 0),   // X_NAT_T_OAI
    (8, 0),   // X_NAT_T_OAR
    (8, 8),   // X_NAT_T_FRAG
];

/// Generic extension header.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct ExtHdr {
    /// Length in 8-byte units including this header.
    pub len: u16,
    /// Extension type.
    pub ty: u16,
}

/// SA parameters extension (mirrors `struct sadb_sa`).
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct SadbSa {
    pub len: u16,
    pub ty: u16,
    /// SPI in network byte order.
    pub spi: u32,
    /// Replay window size in bytes of bitmap.
    pub replay: u8,
    /// SA state.
    pub state: u8,
    /// Authentication algorithm id.
    pub auth: u8,
    /// Encryption algorithm id.
    pub encrypt: u8,
    /// SA flags.
    pub flags: u32,
}

/// SA flag: old-style SA without replay protection.
pub const SAFLAG_OLD: u32 = 0x0001;
/// SA flag: IV derived from sequence number.
pub const SAFLAG_DERIV: u32 = 0x0010;
/// SA flag: treat an IPComp SPI as a raw CPI, skipping the 16-bit range
/// check.
pub const SAFLAG_RAWCPI: u32 = 0x0080;

/// Lifetime extension (current values or hard/soft limits).
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct SadbLifetime {
    pub len: u16,
    pub ty: u16,
    pub allocations: u32,
    pub bytes: u64,
    pub addtime: u64,
    pub usetime: u64,
}

impl SadbLifetime {
    /// Value-type view of this extension.
    pub fn to_lifetime(&self) -> Lifetime {
        Lifetime {
            allocations: self.allocations,
            bytes: self.bytes,
            addtime: self.addtime,
            usetime: self.usetime,
        }
    }
}

/// Address extension header; a socket address follows it.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct SadbAddress {
    pub len: u16,
    pub ty: u16,
    /// Upper-layer protocol this address is valid for.
    pub proto: u8,
    /// Prefix length in bits.
    pub prefixlen: u8,
    pub reserved: u16,
}

/// Key extension header; `bits/8` bytes of key material follow.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct SadbKey {
    pub len: u16,
    pub ty: u16,
    /// Key length in bits.
    pub bits: u16,
    pub reserved: u16,
}

/// SPI range extension.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct SadbSpirange {
    pub len: u16,
    pub ty: u16,
    /// Minimum acceptable SPI, host order.
    pub min: u32,
    /// Maximum acceptable SPI, host order.
    pub max: u32,
    pub reserved: u32,
}

/// Mode/sequence/reqid extension (mirrors `struct sadb_x_sa2`).
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct SadbXSa2 {
    pub len: u16,
    pub ty: u16,
    pub mode: u8,
    pub reserved: [u8; 3],
    /// Replay sequence snapshot in notifications; unused on input.
    pub sequence: u32,
    pub reqid: u32,
}

/// Policy extension header; ipsecrequest records follow for IPsec
/// policies.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct SadbXPolicy {
    pub len: u16,
    pub ty: u16,
    /// Policy action.
    pub ptype: u16,
    /// Direction.
    pub dir: u8,
    pub reserved: u8,
    /// Policy id; assigned by the store on add, meaningful on
    /// get/delete-by-id.
    pub id: u32,
    /// Priority; lower sorts earlier.
    pub priority: u32,
}

/// One transform request record inside a policy extension. Not itself an
/// extension; `len` is in bytes, a multiple of 8, and covers optional
/// trailing tunnel endpoint sockaddrs.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct SadbXIpsecRequest {
    /// Record length in bytes (multiple of 8).
    pub len: u16,
    /// IPsec protocol number.
    pub proto: u16,
    pub mode: u8,
    pub level: u8,
    pub reserved: u16,
    pub reqid: u32,
    pub reserved2: u32,
}

/// Proposal extension header; combination records follow.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct SadbProp {
    pub len: u16,
    pub ty: u16,
    /// Proposed replay window size.
    pub replay: u8,
    pub reserved: [u8; 3],
}

/// One acceptable algorithm combination inside a proposal.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct SadbComb {
    pub auth: u8,
    pub encrypt: u8,
    pub flags: u16,
    pub auth_minbits: u16,
    pub auth_maxbits: u16,
    pub encrypt_minbits: u16,
    pub encrypt_maxbits: u16,
    pub reserved: u32,
    pub soft_allocations: u32,
    pub hard_allocations: u32,
    pub soft_bytes: u64,
    pub hard_bytes: u64,
    pub soft_addtime: u64,
    pub hard_addtime: u64,
    pub soft_usetime: u64,
    pub hard_usetime: u64,
}

/// Supported-algorithms extension header; [`SadbAlg`] records follow.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct SadbSupported {
    pub len: u16,
    pub ty: u16,
    pub reserved: u32,
}

/// One algorithm description in a supported-algorithms extension.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct SadbAlg {
    pub id: u8,
    /// IV length for encryption algorithms.
    pub ivlen: u8,
    pub minbits: u16,
    pub maxbits: u16,
    pub reserved: u16,
}

/// Identity extension header (validated, contents not interpreted).
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct SadbIdent {
    pub len: u16,
    pub ty: u16,
    pub idtype: u16,
    pub reserved: u16,
    pub id: u64,
}

/// NAT-T encapsulation type extension.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct SadbXNatTType {
    pub len: u16,
    pub ty: u16,
    /// Encapsulation type (UDP variants).
    pub encap: u8,
    pub reserved: [u8; 3],
}

/// NAT-T port extension (source or destination).
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct SadbXNatTPort {
    pub len: u16,
    pub ty: u16,
    /// Port in network byte order.
    pub port: u16,
    pub reserved: u16,
}

/// NAT-T fragmentation hint extension.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct SadbXNatTFrag {
    pub len: u16,
    pub ty: u16,
    /// Fragment size hint.
    pub fraglen: u16,
    pub reserved: u16,
}

/// Wire sizes of the embedded socket addresses.
pub const SOCKADDR_IN_LEN: usize = 16;
pub const SOCKADDR_IN6_LEN: usize = 28;

/// Decoded address extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressExt {
    /// Upper-layer protocol.
    pub proto: u8,
    /// Prefix length in bits.
    pub prefixlen: u8,
    /// The embedded endpoint.
    pub endpoint: Endpoint,
}

/// Encode an endpoint as the trailing sockaddr of an address extension.
/// Returns the unpadded encoding; callers pad to 8 bytes.
pub(crate) fn encode_sockaddr(ep: &Endpoint) -> Vec<u8> {
    match ep.addr {
        IpAddr::V4(a) => {
            let mut out = vec![0u8; SOCKADDR_IN_LEN];
            out[0] = SOCKADDR_IN_LEN as u8;
            out[1] = AF_INET;
            out[2..4].copy_from_slice(&ep.port.to_be_bytes());
            out[4..8].copy_from_slice(&a.octets());
            out
        }
        IpAddr::V6(a) => {
            let mut out = vec![0u8; SOCKADDR_IN6_LEN];
            out[0] = SOCKADDR_IN6_LEN as u8;
            out[1] = AF_INET6;
            out[2..4].copy_from_slice(&ep.port.to_be_bytes());
            // flowinfo at 4..8 stays zero
            out[8..24].copy_from_slice(&a.octets());
            out[24..28].copy_from_slice(&ep.scope.to_be_bytes());
            out
        }
    }
}

/// Decode the sockaddr embedded at `data`. The leading length byte must be
/// consistent with the family and with the available bytes.
pub(crate) fn decode_sockaddr(data: &[u8]) -> Result<Endpoint> {
    if data.len() < 2 {
        return Err(Error::InvalidAddress("sockaddr truncated".into()));
    }
    let sa_len = data[0] as usize;
    let family = data[1];
    match family {
        AF_INET => {
            if sa_len != SOCKADDR_IN_LEN || data.len() < SOCKADDR_IN_LEN {
                return Err(Error::InvalidAddress(format!(
                    "bad sockaddr_in length {sa_len}"
                )));
            }
            let port = u16::from_be_bytes([data[2], data[3]]);
            let addr = Ipv4Addr::new(data[4], data[5], data[6], data[7]);
            Ok(Endpoint::new(IpAddr::V4(addr), port))
        }
        AF_INET6 => {
            if sa_len != SOCKADDR_IN6_LEN || data.len() < SOCKADDR_IN6_LEN {
                return Err(Error::InvalidAddress(format!(
                    "bad sockaddr_in6 length {sa_len}"
                )));
            }
            let port = u16::from_be_bytes([data[2], data[3]]);
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&data[8..24]);
            let mut ep = Endpoint::new(IpAddr::V6(Ipv6Addr::from(octets)), port);
            ep.scope = u32::from_be_bytes([data[24], data[25], data[26], data[27]]);
            Ok(ep)
        }
        other => Err(Error::AddressFamily(other)),
    }
}

fn addr_hdr_len() -> usize {
    std::mem::size_of::<SadbAddress>()
}

const fn carries_sockaddr(ty: u16) -> bool {
    matches!(
        ty,
        EXT_ADDRESS_SRC | EXT_ADDRESS_DST | EXT_ADDRESS_PROXY | EXT_X_NAT_T_OAI | EXT_X_NAT_T_OAR
    )
}

/// A parsed and fully length-validated PF_KEY message: the header plus one
/// slot per extension type (mirrors `struct sadb_msghdr`).
#[derive(Debug)]
pub struct ParsedMsg<'a> {
    /// The message header.
    pub hdr: &'a MsgHdr,
    /// The decoded message type.
    pub msg_type: MsgType,
    exts: [Option<&'a [u8]>; EXT_MAX as usize + 1],
}

impl<'a> ParsedMsg<'a> {
    /// Parse and validate a complete message buffer.
    ///
    /// Checks, in order: buffer covers the header; version; declared
    /// length equals buffer length; known message type; then for every
    /// extension: known/acceptable type, no duplicates, per-type length
    /// bounds, and a consistent embedded sockaddr for address-carrying
    /// types. Finally the paired source/destination extensions must agree
    /// on upper-layer protocol and address family, with prefix lengths in
    /// range.
    pub fn parse(buf: &'a [u8]) -> Result<Self> {
        let hdr = MsgHdr::from_bytes(buf)?;
        if hdr.version != PF_KEY_V2 {
            return Err(Error::InvalidMessage(format!(
                "version {} is mismatched",
                hdr.version
            )));
        }
        if hdr.total_len() != buf.len() {
            return Err(Error::InvalidMessage(format!(
                "declared length {} != buffer length {}",
                hdr.total_len(),
                buf.len()
            )));
        }
        let msg_type = MsgType::from_wire(hdr.msg_type)?;

        let mut exts: [Option<&[u8]>; EXT_MAX as usize + 1] = [None; EXT_MAX as usize + 1];
        let mut off = MSG_HDRLEN;
        let end = buf.len();
        while off < end {
            if end - off < std::mem::size_of::<ExtHdr>() {
                return Err(Error::InvalidExtension("trailing garbage".into()));
            }
            let (eh, _) = ExtHdr::ref_from_prefix(&buf[off..])
                .map_err(|_| Error::InvalidExtension("truncated header".into()))?;
            let elen = eh.len as usize * SADB_ALIGNTO;
            if elen < SADB_ALIGNTO || off + elen > end {
                return Err(Error::InvalidExtension(format!(
                    "bad length {elen} for type {}",
                    eh.ty
                )));
            }
            let ty = eh.ty;
            if ty > EXT_MAX {
                return Err(Error::InvalidExtension(format!("invalid type {ty}")));
            }
            let (min, max) = EXT_BOUNDS[ty as usize];
            if min == 0 {
                return Err(Error::InvalidExtension(format!("invalid type {ty}")));
            }
            if elen < min || (max != 0 && elen > max) {
                return Err(Error::InvalidExtension(format!(
                    "type {ty}: length {elen} outside [{min}, {max}]"
                )));
            }
            if exts[ty as usize].is_some() {
                return Err(Error::InvalidExtension(format!("duplicate type {ty}")));
            }
            let slice = &buf[off..off + elen];
            if carries_sockaddr(ty) {
                let sa = &slice[addr_hdr_len()..];
                decode_sockaddr(sa)?;
            }
            exts[ty as usize] = Some(slice);
            off += elen;
        }
        if off != end {
            return Err(Error::InvalidMessage("extension walk overran".into()));
        }

        let parsed = Self {
            hdr,
            msg_type,
            exts,
        };
        parsed.check_address_pair()?;
        Ok(parsed)
    }

    /// Cross-checks between paired source/destination address extensions.
    fn check_address_pair(&self) -> Result<()> {
        let (Some(src), Some(dst)) = (
            self.address(EXT_ADDRESS_SRC),
            self.address(EXT_ADDRESS_DST),
        ) else {
            return Ok(());
        };
        if src.proto != dst.proto {
            return Err(Error::InvalidAddress(
                "upper layer protocol mismatched".into(),
            ));
        }
        if src.endpoint.family() != dst.endpoint.family() {
            return Err(Error::InvalidAddress("address family mismatched".into()));
        }
        let plen = src.endpoint.addr_bits();
        if src.prefixlen > plen || dst.prefixlen > plen {
            return Err(Error::InvalidAddress(format!(
                "illegal prefixlen {}/{}",
                src.prefixlen, dst.prefixlen
            )));
        }
        Ok(())
    }

    /// Raw bytes of an extension (header included), if present.
    pub fn ext(&self, ty: u16) -> Option<&'a [u8]> {
        self.exts.get(ty as usize).copied().flatten()
    }

    /// Whether the extension is present.
    pub fn has(&self, ty: u16) -> bool {
        self.ext(ty).is_some()
    }

    fn typed<T: FromBytes + KnownLayout + Immutable>(&self, ty: u16) -> Option<&'a T> {
        let raw = self.ext(ty)?;
        T::ref_from_prefix(raw).ok().map(|(r, _)| r)
    }

    /// The SA extension.
    pub fn sa(&self) -> Option<&'a SadbSa> {
        self.typed(EXT_SA)
    }

    /// The mode/reqid extension.
    pub fn sa2(&self) -> Option<&'a SadbXSa2> {
        self.typed(EXT_X_SA2)
    }

    /// The SPI range extension.
    pub fn spirange(&self) -> Option<&'a SadbSpirange> {
        self.typed(EXT_SPIRANGE)
    }

    /// A lifetime extension as a value type.
    pub fn lifetime(&self, ty: u16) -> Option<Lifetime> {
        self.typed::<SadbLifetime>(ty).map(|l| l.to_lifetime())
    }

    /// A decoded address extension.
    pub fn address(&self, ty: u16) -> Option<AddressExt> {
        let raw = self.ext(ty)?;
        let hdr: &SadbAddress = SadbAddress::ref_from_prefix(raw).ok().map(|(r, _)| r)?;
        let endpoint = decode_sockaddr(&raw[addr_hdr_len()..]).ok()?;
        Some(AddressExt {
            proto: hdr.proto,
            prefixlen: hdr.prefixlen,
            endpoint,
        })
    }

    /// A key extension: its header and the raw key bytes after it.
    pub fn key(&self, ty: u16) -> Option<(&'a SadbKey, &'a [u8])> {
        let raw = self.ext(ty)?;
        let hdr: &SadbKey = SadbKey::ref_from_prefix(raw).ok().map(|(r, _)| r)?;
        Some((hdr, &raw[std::mem::size_of::<SadbKey>()..]))
    }

    /// Whether a key extension carries only its bare header (null key).
    pub fn key_is_bare(&self, ty: u16) -> bool {
        self.ext(ty)
            .is_some_and(|raw| raw.len() == std::mem::size_of::<SadbKey>())
    }

    /// The policy extension: its header and the request records after it.
    pub fn policy(&self) -> Option<(&'a SadbXPolicy, &'a [u8])> {
        let raw = self.ext(EXT_X_POLICY)?;
        let hdr: &SadbXPolicy = SadbXPolicy::ref_from_prefix(raw).ok().map(|(r, _)| r)?;
        Some((hdr, &raw[std::mem::size_of::<SadbXPolicy>()..]))
    }

    /// The NAT-T encapsulation type extension.
    pub fn natt_type(&self) -> Option<&'a SadbXNatTType> {
        self.typed(EXT_X_NAT_T_TYPE)
    }

    /// A NAT-T port extension, in host order.
    pub fn natt_port(&self, ty: u16) -> Option<u16> {
        self.typed::<SadbXNatTPort>(ty)
            .map(|p| u16::from_be(p.port))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::MsgBuilder;
    use crate::msg::MsgType;

    fn ep(s: &str, port: u16) -> Endpoint {
        Endpoint::new(s.parse().unwrap(), port)
    }

    #[test]
    fn struct_sizes() {
        assert_eq!(std::mem::size_of::<ExtHdr>(), 4);
        assert_eq!(std::mem::size_of::<SadbSa>(), 16);
        assert_eq!(std::mem::size_of::<SadbLifetime>(), 32);
        assert_eq!(std::mem::size_of::<SadbAddress>(), 8);
        assert_eq!(std::mem::size_of::<SadbKey>(), 8);
        assert_eq!(std::mem::size_of::<SadbSpirange>(), 16);
        assert_eq!(std::mem::size_of::<SadbXSa2>(), 16);
        assert_eq!(std::mem::size_of::<SadbXPolicy>(), 16);
        assert_eq!(std::mem::size_of::<SadbXIpsecRequest>(), 16);
        assert_eq!(std::mem::size_of::<SadbProp>(), 8);
        assert_eq!(std::mem::size_of::<SadbComb>(), 72);
        assert_eq!(std::mem::size_of::<SadbSupported>(), 8);
        assert_eq!(std::mem::size_of::<SadbAlg>(), 8);
    }

    #[test]
    fn sockaddr_roundtrip_v4() {
        let e = ep("192.168.1.1", 500);
        let enc = encode_sockaddr(&e);
        assert_eq!(enc.len(), SOCKADDR_IN_LEN);
        assert_eq!(decode_sockaddr(&enc).unwrap(), e);
    }

    #[test]
    fn sockaddr_roundtrip_v6() {
        let mut e = ep("2001:db8::1", 4500);
        e.scope = 9;
        let enc = encode_sockaddr(&e);
        assert_eq!(enc.len(), SOCKADDR_IN6_LEN);
        assert_eq!(decode_sockaddr(&enc).unwrap(), e);
    }

    #[test]
    fn sockaddr_bad_family() {
        let mut enc = encode_sockaddr(&ep("10.0.0.1", 0));
        enc[1] = 7;
        assert!(matches!(
            decode_sockaddr(&enc),
            Err(Error::AddressFamily(7))
        ));
    }

    #[test]
    fn parse_rejects_bad_version() {
        let b = MsgBuilder::new(MsgType::Flush, 0, 1, 2).finish();
        let mut buf = b.to_vec();
        buf[0] = 1;
        assert!(matches!(
            ParsedMsg::parse(&buf),
            Err(Error::InvalidMessage(_))
        ));
    }

    #[test]
    fn parse_rejects_length_mismatch() {
        let b = MsgBuilder::new(MsgType::Flush, 0, 1, 2).finish();
        let mut buf = b.to_vec();
        buf.extend_from_slice(&[0u8; 8]);
        assert!(matches!(
            ParsedMsg::parse(&buf),
            Err(Error::InvalidMessage(_))
        ));
    }

    #[test]
    fn parse_rejects_duplicate_ext() {
        let mut b = MsgBuilder::new(MsgType::GetSpi, 3, 1, 2);
        b.spirange(256, 4096);
        b.spirange(256, 4096);
        let buf = b.finish();
        let err = ParsedMsg::parse(&buf).unwrap_err();
        assert!(err.to_string().contains("duplicate"));
    }

    #[test]
    fn parse_rejects_unknown_ext() {
        let mut b = MsgBuilder::new(MsgType::GetSpi, 3, 1, 2);
        b.raw_ext(99, &[0u8; 4]);
        let buf = b.finish();
        assert!(matches!(
            ParsedMsg::parse(&buf),
            Err(Error::InvalidExtension(_))
        ));
    }

    #[test]
    fn parse_rejects_oversized_fixed_ext() {
        let mut b = MsgBuilder::new(MsgType::GetSpi, 3, 1, 2);
        // SPIRANGE is fixed at 16 bytes; pad it to 24.
        let mut body = SadbSpirange {
            min: 1,
            max: 2,
            ..Default::default()
        };
        body.len = 0; // patched by raw_ext
        body.ty = 0;
        let mut payload = body.as_bytes()[4..].to_vec();
        payload.extend_from_slice(&[0u8; 8]);
        b.raw_ext(EXT_SPIRANGE, &payload);
        let buf = b.finish();
        assert!(matches!(
            ParsedMsg::parse(&buf),
            Err(Error::InvalidExtension(_))
        ));
    }

    #[test]
    fn parse_rejects_family_mismatch() {
        let mut b = MsgBuilder::new(MsgType::Delete, 3, 1, 2);
        b.address(EXT_ADDRESS_SRC, &ep("10.0.0.1", 0), 32, 0);
        b.address(EXT_ADDRESS_DST, &ep("2001:db8::1", 0), 128, 0);
        let buf = b.finish();
        assert!(matches!(
            ParsedMsg::parse(&buf),
            Err(Error::InvalidAddress(_))
        ));
    }

    #[test]
    fn parse_rejects_bad_prefixlen() {
        let mut b = MsgBuilder::new(MsgType::Delete, 3, 1, 2);
        b.address(EXT_ADDRESS_SRC, &ep("10.0.0.1", 0), 33, 0);
        b.address(EXT_ADDRESS_DST, &ep("10.0.0.2", 0), 32, 0);
        let buf = b.finish();
        assert!(matches!(
            ParsedMsg::parse(&buf),
            Err(Error::InvalidAddress(_))
        ));
    }

    #[test]
    fn parse_extracts_extensions() {
        let mut b = MsgBuilder::new(MsgType::GetSpi, 3, 42, 7);
        b.address(EXT_ADDRESS_SRC, &ep("10.0.0.1", 0), 32, 0);
        b.address(EXT_ADDRESS_DST, &ep("10.0.0.2", 0), 32, 0);
        b.spirange(0x100, 0xffff);
        let buf = b.finish();
        let p = ParsedMsg::parse(&buf).unwrap();
        assert_eq!(p.msg_type, MsgType::GetSpi);
        assert_eq!(p.hdr.seq, 42);
        let src = p.address(EXT_ADDRESS_SRC).unwrap();
        assert_eq!(src.endpoint, ep("10.0.0.1", 0));
        assert_eq!(src.prefixlen, 32);
        let r = p.spirange().unwrap();
        assert_eq!((r.min, r.max), (0x100, 0xffff));
        assert!(!p.has(EXT_SA));
    }
}
