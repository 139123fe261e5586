//! Serialization of replies and notifications.
//!
//! [`MsgBuilder`] accumulates a header plus extensions into a `BytesMut`
//! and patches the unit-length field on [`MsgBuilder::finish`]. All
//! extension writers pad to the 8-byte boundary.

use bytes::{BufMut, Bytes, BytesMut};
use zerocopy::{Immutable, IntoBytes};

use crate::ext::{
    EXT_LIFETIME_CURRENT, EXT_LIFETIME_HARD, EXT_LIFETIME_SOFT, SadbAddress, SadbAlg, SadbKey,
    SadbLifetime, SadbSa, SadbSpirange, SadbSupported, SadbXNatTPort, SadbXNatTType, SadbXPolicy,
    SadbXSa2, encode_sockaddr,
};
use crate::keys::{KeyMaterial, Lifetime};
use crate::msg::{MSG_HDRLEN, MsgHdr, MsgType, SADB_ALIGNTO, sadb_align};
use crate::types::Endpoint;

/// Incremental PF_KEY message builder.
pub struct MsgBuilder {
    buf: BytesMut,
}

impl MsgBuilder {
    /// Start a fresh message.
    pub fn new(msg_type: MsgType, satype: u8, seq: u32, pid: u32) -> Self {
        let hdr = MsgHdr::new(msg_type, satype, seq, pid);
        let mut buf = BytesMut::with_capacity(128);
        buf.put_slice(hdr.as_bytes());
        Self { buf }
    }

    /// Start a reply that echoes a request header (type, satype, seq,
    /// pid), with errno cleared.
    pub fn echoing(hdr: &MsgHdr) -> Self {
        let mut copy = *hdr;
        copy.errno = 0;
        copy.reserved = 0;
        let mut buf = BytesMut::with_capacity(128);
        buf.put_slice(copy.as_bytes());
        Self { buf }
    }

    /// Override the sequence number in the header.
    pub fn set_seq(&mut self, seq: u32) {
        self.buf[8..12].copy_from_slice(&seq.to_ne_bytes());
    }

    /// Set the diagnostic reference count in the reserved field.
    pub fn set_reserved(&mut self, val: u16) {
        self.buf[6..8].copy_from_slice(&val.to_ne_bytes());
    }

    fn pad(&mut self) {
        let rem = self.buf.len() % SADB_ALIGNTO;
        if rem != 0 {
            self.buf.put_bytes(0, SADB_ALIGNTO - rem);
        }
    }

    /// Append an extension from its payload (everything after the 4-byte
    /// extension header). The length field covers the padded size.
    pub fn raw_ext(&mut self, ty: u16, payload: &[u8]) {
        let total = sadb_align(4 + payload.len());
        self.buf.put_u16_ne((total / SADB_ALIGNTO) as u16);
        self.buf.put_u16_ne(ty);
        self.buf.put_slice(payload);
        self.pad();
    }

    /// Copy an already-encoded extension (header included) from another
    /// message.
    pub fn echo_ext(&mut self, raw: &[u8]) {
        self.buf.put_slice(raw);
        self.pad();
    }

    /// Append a fully-formed extension struct whose first two fields are
    /// the length/type header. `len` must already be set by the caller.
    fn put_struct<T: IntoBytes + Immutable>(&mut self, v: &T) {
        self.buf.put_slice(v.as_bytes());
        self.pad();
    }

    /// SA parameters extension. `spi` is in host order.
    pub fn sa_ext(&mut self, spi: u32, replay: u8, state: u8, auth: u8, encrypt: u8, flags: u32) {
        let v = SadbSa {
            len: (std::mem::size_of::<SadbSa>() / SADB_ALIGNTO) as u16,
            ty: crate::ext::EXT_SA,
            spi: spi.to_be(),
            replay,
            state,
            auth,
            encrypt,
            flags,
        };
        self.put_struct(&v);
    }

    /// Mode/sequence/reqid extension.
    pub fn sa2(&mut self, mode: u8, sequence: u32, reqid: u32) {
        let v = SadbXSa2 {
            len: (std::mem::size_of::<SadbXSa2>() / SADB_ALIGNTO) as u16,
            ty: crate::ext::EXT_X_SA2,
            mode,
            reserved: [0; 3],
            sequence,
            reqid,
        };
        self.put_struct(&v);
    }

    /// Address extension with its trailing sockaddr.
    pub fn address(&mut self, ty: u16, ep: &Endpoint, prefixlen: u8, proto: u8) {
        let sa = encode_sockaddr(ep);
        let total = sadb_align(std::mem::size_of::<SadbAddress>() + sa.len());
        let hdr = SadbAddress {
            len: (total / SADB_ALIGNTO) as u16,
            ty,
            proto,
            prefixlen,
            reserved: 0,
        };
        self.buf.put_slice(hdr.as_bytes());
        self.buf.put_slice(&sa);
        self.pad();
    }

    /// Key extension.
    pub fn key(&mut self, ty: u16, km: &KeyMaterial) {
        let total = sadb_align(std::mem::size_of::<SadbKey>() + km.raw().len());
        let hdr = SadbKey {
            len: (total / SADB_ALIGNTO) as u16,
            ty,
            bits: km.bits(),
            reserved: 0,
        };
        self.buf.put_slice(hdr.as_bytes());
        self.buf.put_slice(km.raw());
        self.pad();
    }

    /// Lifetime extension.
    pub fn lifetime(&mut self, ty: u16, lt: &Lifetime) {
        debug_assert!(matches!(
            ty,
            EXT_LIFETIME_CURRENT | EXT_LIFETIME_HARD | EXT_LIFETIME_SOFT
        ));
        let v = SadbLifetime {
            len: (std::mem::size_of::<SadbLifetime>() / SADB_ALIGNTO) as u16,
            ty,
            allocations: lt.allocations,
            bytes: lt.bytes,
            addtime: lt.addtime,
            usetime: lt.usetime,
        };
        self.put_struct(&v);
    }

    /// SPI range extension.
    pub fn spirange(&mut self, min: u32, max: u32) {
        let v = SadbSpirange {
            len: (std::mem::size_of::<SadbSpirange>() / SADB_ALIGNTO) as u16,
            ty: crate::ext::EXT_SPIRANGE,
            min,
            max,
            reserved: 0,
        };
        self.put_struct(&v);
    }

    /// Bare policy extension header (no request records).
    pub fn policy_hdr(&mut self, ptype: u16, dir: u8, id: u32, priority: u32) {
        let v = SadbXPolicy {
            len: (std::mem::size_of::<SadbXPolicy>() / SADB_ALIGNTO) as u16,
            ty: crate::ext::EXT_X_POLICY,
            ptype,
            dir,
            reserved: 0,
            id,
            priority,
        };
        self.put_struct(&v);
    }

    /// Policy extension with pre-encoded request records.
    pub fn policy_with_requests(
        &mut self,
        ptype: u16,
        dir: u8,
        id: u32,
        priority: u32,
        requests: &[u8],
    ) {
        let total = sadb_align(std::mem::size_of::<SadbXPolicy>() + requests.len());
        let hdr = SadbXPolicy {
            len: (total / SADB_ALIGNTO) as u16,
            ty: crate::ext::EXT_X_POLICY,
            ptype,
            dir,
            reserved: 0,
            id,
            priority,
        };
        self.buf.put_slice(hdr.as_bytes());
        self.buf.put_slice(requests);
        self.pad();
    }

    /// Supported-algorithms extension.
    pub fn supported(&mut self, ty: u16, algs: &[SadbAlg]) {
        let total = sadb_align(
            std::mem::size_of::<SadbSupported>() + algs.len() * std::mem::size_of::<SadbAlg>(),
        );
        let hdr = SadbSupported {
            len: (total / SADB_ALIGNTO) as u16,
            ty,
            reserved: 0,
        };
        self.buf.put_slice(hdr.as_bytes());
        for alg in algs {
            self.buf.put_slice(alg.as_bytes());
        }
        self.pad();
    }

    /// NAT-T encapsulation type extension.
    pub fn natt_type(&mut self, encap: u8) {
        let v = SadbXNatTType {
            len: (std::mem::size_of::<SadbXNatTType>() / SADB_ALIGNTO) as u16,
            ty: crate::ext::EXT_X_NAT_T_TYPE,
            encap,
            reserved: [0; 3],
        };
        self.put_struct(&v);
    }

    /// NAT-T port extension; `port` in host order.
    pub fn natt_port(&mut self, ty: u16, port: u16) {
        let v = SadbXNatTPort {
            len: (std::mem::size_of::<SadbXNatTPort>() / SADB_ALIGNTO) as u16,
            ty,
            port: port.to_be(),
            reserved: 0,
        };
        self.put_struct(&v);
    }

    /// Current length in bytes.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Whether only the header has been written.
    pub fn is_empty(&self) -> bool {
        self.buf.len() == MSG_HDRLEN
    }

    /// Patch the header length and return the finished message.
    pub fn finish(mut self) -> Bytes {
        let units = (self.buf.len() / SADB_ALIGNTO) as u16;
        self.buf[4..6].copy_from_slice(&units.to_ne_bytes());
        self.buf.freeze()
    }
}

/// Build an error reply: the original message with the errno patched into
/// the header. The caller guarantees at least a full header.
pub fn error_reply(original: &[u8], errno: i32) -> Bytes {
    let mut buf = BytesMut::from(original);
    buf[2] = errno.clamp(0, 255) as u8;
    // a reply always describes exactly the bytes it carries
    let units = (buf.len() / SADB_ALIGNTO) as u16;
    buf[4..6].copy_from_slice(&units.to_ne_bytes());
    buf.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ext::{EXT_ADDRESS_DST, EXT_ADDRESS_SRC, EXT_KEY_AUTH, ParsedMsg};
    use crate::msg::MsgType;

    fn ep(s: &str, port: u16) -> Endpoint {
        Endpoint::new(s.parse().unwrap(), port)
    }

    #[test]
    fn finished_message_parses() {
        let mut b = MsgBuilder::new(MsgType::Add, 3, 9, 100);
        b.sa_ext(0x1234, 4, 1, 2, 12, 0);
        b.sa2(2, 0, 7);
        b.address(EXT_ADDRESS_SRC, &ep("10.1.0.1", 0), 32, 0);
        b.address(EXT_ADDRESS_DST, &ep("10.1.0.2", 0), 32, 0);
        let buf = b.finish();
        assert_eq!(buf.len() % SADB_ALIGNTO, 0);
        let p = ParsedMsg::parse(&buf).unwrap();
        let sa = p.sa().unwrap();
        assert_eq!(u32::from_be(sa.spi), 0x1234);
        assert_eq!(sa.encrypt, 12);
        let sa2 = p.sa2().unwrap();
        assert_eq!(sa2.reqid, 7);
        assert_eq!(
            p.address(EXT_ADDRESS_DST).unwrap().endpoint,
            ep("10.1.0.2", 0)
        );
    }

    #[test]
    fn v6_address_is_padded() {
        let mut b = MsgBuilder::new(MsgType::Delete, 3, 1, 1);
        b.address(EXT_ADDRESS_SRC, &ep("2001:db8::1", 0), 128, 0);
        b.address(EXT_ADDRESS_DST, &ep("2001:db8::2", 0), 128, 0);
        let buf = b.finish();
        // 16 header + 2 * align8(8 + 28)
        assert_eq!(buf.len(), 16 + 2 * 40);
        assert!(ParsedMsg::parse(&buf).is_ok());
    }

    #[test]
    fn key_extension_roundtrip() {
        let km = KeyMaterial::from_wire(160, &[0x5a; 20]).unwrap();
        let mut b = MsgBuilder::new(MsgType::Get, 3, 1, 1);
        b.key(EXT_KEY_AUTH, &km);
        let buf = b.finish();
        let p = ParsedMsg::parse(&buf).unwrap();
        let (hdr, data) = p.key(EXT_KEY_AUTH).unwrap();
        assert_eq!(hdr.bits, 160);
        assert_eq!(&data[..20], &[0x5a; 20]);
    }

    #[test]
    fn echoing_clears_errno() {
        let mut hdr = MsgHdr::new(MsgType::Update, 3, 5, 6);
        hdr.errno = 22;
        let b = MsgBuilder::echoing(&hdr);
        let buf = b.finish();
        let p = ParsedMsg::parse(&buf).unwrap();
        assert_eq!(p.hdr.errno, 0);
        assert_eq!(p.hdr.seq, 5);
    }

    #[test]
    fn error_reply_patches_errno_and_len() {
        let b = MsgBuilder::new(MsgType::Flush, 0, 3, 4).finish();
        let reply = error_reply(&b, libc::EINVAL);
        let hdr = MsgHdr::from_bytes(&reply).unwrap();
        assert_eq!(hdr.errno, libc::EINVAL as u8);
        assert_eq!(hdr.total_len(), reply.len());
        assert_eq!(hdr.seq, 3);
    }

    #[test]
    fn set_seq_and_reserved() {
        let mut b = MsgBuilder::new(MsgType::Dump, 3, 0, 0);
        b.set_seq(41);
        b.set_reserved(2);
        let buf = b.finish();
        let hdr = MsgHdr::from_bytes(&buf).unwrap();
        assert_eq!(hdr.seq, 41);
        assert_eq!(hdr.reserved, 2);
    }
}
