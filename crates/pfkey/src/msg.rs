//! PF_KEYv2 message header and message types.

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::error::{Error, Result};

/// Protocol version carried in every message.
pub const PF_KEY_V2: u8 = 2;

/// Message and extension alignment.
pub const SADB_ALIGNTO: usize = 8;

/// Align a length to the 8-byte message boundary.
#[inline]
pub const fn sadb_align(len: usize) -> usize {
    (len + SADB_ALIGNTO - 1) & !(SADB_ALIGNTO - 1)
}

/// Size of the fixed message header.
pub const MSG_HDRLEN: usize = std::mem::size_of::<MsgHdr>();

/// PF_KEY message header (mirrors `struct sadb_msg`).
///
/// `len` counts 8-byte units covering the header and all extensions.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct MsgHdr {
    /// Protocol version, always [`PF_KEY_V2`].
    pub version: u8,
    /// Message type.
    pub msg_type: u8,
    /// Error code on replies; 0 on success.
    pub errno: u8,
    /// SA type the message applies to.
    pub satype: u8,
    /// Total length in 8-byte units.
    pub len: u16,
    /// Reserved; replies carry the object's reference count here for
    /// diagnostics.
    pub reserved: u16,
    /// Sequence number, echoed in replies.
    pub seq: u32,
    /// Sender process id, echoed in replies.
    pub pid: u32,
}

impl MsgHdr {
    /// Create a new header; length is in bytes and converted to units.
    pub fn new(msg_type: MsgType, satype: u8, seq: u32, pid: u32) -> Self {
        Self {
            version: PF_KEY_V2,
            msg_type: msg_type.wire(),
            errno: 0,
            satype,
            len: (MSG_HDRLEN / SADB_ALIGNTO) as u16,
            reserved: 0,
            seq,
            pid,
        }
    }

    /// Total message length in bytes.
    pub fn total_len(&self) -> usize {
        self.len as usize * SADB_ALIGNTO
    }

    /// Convert header to bytes.
    pub fn as_bytes(&self) -> &[u8] {
        <Self as IntoBytes>::as_bytes(self)
    }

    /// Parse header from bytes.
    pub fn from_bytes(data: &[u8]) -> Result<&Self> {
        Self::ref_from_prefix(data)
            .map(|(r, _)| r)
            .map_err(|_| Error::Truncated {
                expected: MSG_HDRLEN,
                actual: data.len(),
            })
    }
}

/// PF_KEY message types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MsgType {
    /// Reserve an SPI, creating a LARVAL SA.
    GetSpi,
    /// Finalize a LARVAL SA (or adjust lifetimes of a mature one).
    Update,
    /// Add a fully-keyed SA in one shot.
    Add,
    /// Delete one SA by SPI, or all for an address pair.
    Delete,
    /// Fetch one SA.
    Get,
    /// Negotiation request/ack.
    Acquire,
    /// Register the channel for a protocol's notifications.
    Register,
    /// Lifetime expiry notification (outbound only).
    Expire,
    /// Flush the SAD.
    Flush,
    /// Dump every SA.
    Dump,
    /// Toggle promiscuous delivery for the channel.
    Promisc,
    /// Policy update (unlink old selector match, insert fresh).
    SpdUpdate,
    /// Policy add.
    SpdAdd,
    /// Policy delete by selector.
    SpdDelete,
    /// Policy get by id.
    SpdGet,
    /// Policy negotiation request (outbound only).
    SpdAcquire,
    /// Dump every policy.
    SpdDump,
    /// Flush the SPD.
    SpdFlush,
    /// Set a policy index entry (same handling as add).
    SpdSetIdx,
    /// Policy expiry notification (outbound only).
    SpdExpire,
    /// Policy delete by id.
    SpdDelete2,
}

impl MsgType {
    /// Decode a wire message type.
    pub fn from_wire(val: u8) -> Result<Self> {
        Ok(match val {
            1 => Self::GetSpi,
            2 => Self::Update,
            3 => Self::Add,
            4 => Self::Delete,
            5 => Self::Get,
            6 => Self::Acquire,
            7 => Self::Register,
            8 => Self::Expire,
            9 => Self::Flush,
            10 => Self::Dump,
            11 => Self::Promisc,
            13 => Self::SpdUpdate,
            14 => Self::SpdAdd,
            15 => Self::SpdDelete,
            16 => Self::SpdGet,
            17 => Self::SpdAcquire,
            18 => Self::SpdDump,
            19 => Self::SpdFlush,
            20 => Self::SpdSetIdx,
            21 => Self::SpdExpire,
            22 => Self::SpdDelete2,
            other => {
                return Err(Error::InvalidMessage(format!(
                    "invalid message type {other}"
                )));
            }
        })
    }

    /// Wire encoding.
    pub fn wire(&self) -> u8 {
        match self {
            Self::GetSpi => 1,
            Self::Update => 2,
            Self::Add => 3,
            Self::Delete => 4,
            Self::Get => 5,
            Self::Acquire => 6,
            Self::Register => 7,
            Self::Expire => 8,
            Self::Flush => 9,
            Self::Dump => 10,
            Self::Promisc => 11,
            Self::SpdUpdate => 13,
            Self::SpdAdd => 14,
            Self::SpdDelete => 15,
            Self::SpdGet => 16,
            Self::SpdAcquire => 17,
            Self::SpdDump => 18,
            Self::SpdFlush => 19,
            Self::SpdSetIdx => 20,
            Self::SpdExpire => 21,
            Self::SpdDelete2 => 22,
        }
    }

    /// SAD operations that require a concrete SA type in the header.
    pub fn needs_satype(&self) -> bool {
        matches!(
            self,
            Self::GetSpi
                | Self::Update
                | Self::Add
                | Self::Delete
                | Self::Get
                | Self::Acquire
                | Self::Expire
        )
    }

    /// SPD operations, for which a concrete SA type is illegal.
    pub fn is_spd_op(&self) -> bool {
        matches!(
            self,
            Self::SpdUpdate
                | Self::SpdAdd
                | Self::SpdDelete
                | Self::SpdGet
                | Self::SpdDump
                | Self::SpdFlush
                | Self::SpdSetIdx
                | Self::SpdDelete2
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn align() {
        assert_eq!(sadb_align(0), 0);
        assert_eq!(sadb_align(1), 8);
        assert_eq!(sadb_align(8), 8);
        assert_eq!(sadb_align(9), 16);
    }

    #[test]
    fn header_size() {
        assert_eq!(MSG_HDRLEN, 16);
    }

    #[test]
    fn header_roundtrip() {
        let mut hdr = MsgHdr::new(MsgType::Add, 3, 7, 1234);
        hdr.len = 5;
        let bytes = hdr.as_bytes().to_vec();
        let back = MsgHdr::from_bytes(&bytes).unwrap();
        assert_eq!(back.msg_type, MsgType::Add.wire());
        assert_eq!(back.total_len(), 40);
        assert_eq!(back.seq, 7);
        assert_eq!(back.pid, 1234);
    }

    #[test]
    fn msg_type_roundtrip() {
        for v in [1u8, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 13, 14, 15, 16, 17, 18, 19, 20, 21, 22] {
            assert_eq!(MsgType::from_wire(v).unwrap().wire(), v);
        }
        assert!(MsgType::from_wire(0).is_err());
        assert!(MsgType::from_wire(12).is_err());
        assert!(MsgType::from_wire(23).is_err());
    }

    #[test]
    fn satype_rules() {
        assert!(MsgType::GetSpi.needs_satype());
        assert!(!MsgType::Flush.needs_satype());
        assert!(MsgType::SpdAdd.is_spd_op());
        assert!(!MsgType::Add.is_spd_op());
    }
}
