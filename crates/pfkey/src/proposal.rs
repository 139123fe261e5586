//! Algorithm tables and proposal construction.
//!
//! The registered-listener reply enumerates the supported algorithms; a
//! negotiation request carries a proposal of acceptable combinations,
//! filtered by the configured minimum key sizes.

use zerocopy::IntoBytes;

use crate::builder::MsgBuilder;
use crate::config::KeyConfig;
use crate::ext::{
    EXT_PROPOSAL, EXT_SUPPORTED_AUTH, EXT_SUPPORTED_ENCRYPT, SadbAlg, SadbComb, SadbProp,
};
use crate::types::IpsecProto;

// Authentication algorithm ids.
pub const AALG_NONE: u8 = 0;
pub const AALG_MD5HMAC: u8 = 2;
pub const AALG_SHA1HMAC: u8 = 3;
pub const AALG_SHA2_256: u8 = 5;
pub const AALG_SHA2_384: u8 = 6;
pub const AALG_SHA2_512: u8 = 7;
pub const AALG_NULL: u8 = 251;

// Encryption algorithm ids.
pub const EALG_NONE: u8 = 0;
pub const EALG_DESCBC: u8 = 2;
pub const EALG_3DESCBC: u8 = 3;
pub const EALG_NULL: u8 = 11;
pub const EALG_AESCBC: u8 = 12;

// Compression algorithm ids.
pub const CALG_DEFLATE: u8 = 2;

/// One authentication algorithm.
#[derive(Debug, Clone, Copy)]
pub struct AuthAlg {
    pub id: u8,
    pub name: &'static str,
    /// Key size bounds in bits.
    pub minbits: u16,
    pub maxbits: u16,
}

/// One encryption algorithm.
#[derive(Debug, Clone, Copy)]
pub struct EncAlg {
    pub id: u8,
    pub name: &'static str,
    pub minbits: u16,
    pub maxbits: u16,
    /// IV length in bytes.
    pub ivlen: u8,
}

/// Supported authentication algorithms.
pub const AUTH_ALGS: &[AuthAlg] = &[
    AuthAlg {
        id: AALG_MD5HMAC,
        name: "hmac-md5",
        minbits: 128,
        maxbits: 128,
    },
    AuthAlg {
        id: AALG_SHA1HMAC,
        name: "hmac-sha1",
        minbits: 160,
        maxbits: 160,
    },
    AuthAlg {
        id: AALG_SHA2_256,
        name: "hmac-sha2-256",
        minbits: 256,
        maxbits: 256,
    },
    AuthAlg {
        id: AALG_SHA2_384,
        name: "hmac-sha2-384",
        minbits: 384,
        maxbits: 384,
    },
    AuthAlg {
        id: AALG_SHA2_512,
        name: "hmac-sha2-512",
        minbits: 512,
        maxbits: 512,
    },
    AuthAlg {
        id: AALG_NULL,
        name: "null",
        minbits: 8,
        maxbits: 2048,
    },
];

/// Supported encryption algorithms.
pub const ENC_ALGS: &[EncAlg] = &[
    EncAlg {
        id: EALG_DESCBC,
        name: "des-cbc",
        minbits: 64,
        maxbits: 64,
        ivlen: 8,
    },
    EncAlg {
        id: EALG_3DESCBC,
        name: "3des-cbc",
        minbits: 192,
        maxbits: 192,
        ivlen: 8,
    },
    EncAlg {
        id: EALG_NULL,
        name: "null",
        minbits: 0,
        maxbits: 2048,
        ivlen: 0,
    },
    EncAlg {
        id: EALG_AESCBC,
        name: "aes-cbc",
        minbits: 128,
        maxbits: 256,
        ivlen: 16,
    },
];

/// Look up an authentication algorithm by id.
pub fn auth_alg(id: u8) -> Option<&'static AuthAlg> {
    AUTH_ALGS.iter().find(|a| a.id == id)
}

/// Look up an encryption algorithm by id.
pub fn enc_alg(id: u8) -> Option<&'static EncAlg> {
    ENC_ALGS.iter().find(|a| a.id == id)
}

/// Append `supported_auth`/`supported_encrypt` extensions to a register
/// reply.
pub(crate) fn write_supported(b: &mut MsgBuilder) {
    let auth: Vec<SadbAlg> = AUTH_ALGS
        .iter()
        .map(|a| SadbAlg {
            id: a.id,
            ivlen: 0,
            minbits: a.minbits,
            maxbits: a.maxbits,
            reserved: 0,
        })
        .collect();
    b.supported(EXT_SUPPORTED_AUTH, &auth);
    let enc: Vec<SadbAlg> = ENC_ALGS
        .iter()
        .map(|a| SadbAlg {
            id: a.id,
            ivlen: a.ivlen,
            minbits: a.minbits,
            maxbits: a.maxbits,
            reserved: 0,
        })
        .collect();
    b.supported(EXT_SUPPORTED_ENCRYPT, &enc);
}

/// Lifetime template shared by every proposed combination: one day hard,
/// 80% soft, eight hours of idle use.
fn comb_lifetimes(comb: &mut SadbComb) {
    comb.soft_allocations = 1;
    comb.hard_allocations = 1;
    comb.hard_addtime = 86400;
    comb.soft_addtime = 86400 * 80 / 100;
    comb.hard_usetime = 28800;
    comb.soft_usetime = 28800 * 80 / 100;
}

fn esp_combs(cfg: &KeyConfig) -> Vec<SadbComb> {
    let mut out = Vec::new();
    for enc in ENC_ALGS {
        // skip algorithms the configured floor rules out entirely
        if enc.maxbits < cfg.esp_keymin {
            continue;
        }
        let encmin = enc.minbits.max(cfg.esp_keymin);
        if cfg.esp_auth {
            for auth in auth_combs(cfg.ah_keymin) {
                let mut comb = auth;
                comb.encrypt = enc.id;
                comb.encrypt_minbits = encmin;
                comb.encrypt_maxbits = enc.maxbits;
                out.push(comb);
            }
        } else {
            let mut comb = SadbComb::default();
            comb_lifetimes(&mut comb);
            comb.encrypt = enc.id;
            comb.encrypt_minbits = encmin;
            comb.encrypt_maxbits = enc.maxbits;
            out.push(comb);
        }
    }
    out
}

fn auth_combs(keymin: u16) -> Vec<SadbComb> {
    let mut out = Vec::new();
    for auth in AUTH_ALGS {
        if auth.id == AALG_NULL {
            continue;
        }
        if auth.minbits < keymin {
            continue;
        }
        let mut comb = SadbComb::default();
        comb_lifetimes(&mut comb);
        comb.auth = auth.id;
        comb.auth_minbits = auth.minbits;
        comb.auth_maxbits = auth.maxbits;
        out.push(comb);
    }
    out
}

fn ipcomp_combs() -> Vec<SadbComb> {
    let mut comb = SadbComb::default();
    comb_lifetimes(&mut comb);
    comb.encrypt = CALG_DEFLATE;
    vec![comb]
}

/// Append the proposal extension for a negotiation request; returns false
/// when no combination survives the configured minimums.
pub(crate) fn write_proposal(b: &mut MsgBuilder, proto: IpsecProto, cfg: &KeyConfig) -> bool {
    let combs = match proto {
        IpsecProto::Esp => esp_combs(cfg),
        IpsecProto::Ah | IpsecProto::Tcp => auth_combs(cfg.ah_keymin),
        IpsecProto::IpComp => ipcomp_combs(),
    };
    if combs.is_empty() {
        return false;
    }
    let mut payload = Vec::with_capacity(
        std::mem::size_of::<SadbProp>() - 4 + combs.len() * std::mem::size_of::<SadbComb>(),
    );
    // body after the generic extension header: replay + reserved
    let prop = SadbProp {
        len: 0,
        ty: 0,
        replay: 32,
        reserved: [0; 3],
    };
    payload.extend_from_slice(&prop.as_bytes()[4..]);
    for comb in &combs {
        payload.extend_from_slice(comb.as_bytes());
    }
    b.raw_ext(EXT_PROPOSAL, &payload);
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ext::ParsedMsg;
    use crate::msg::MsgType;
    use zerocopy::FromBytes;

    #[test]
    fn lookup_tables() {
        assert_eq!(auth_alg(AALG_SHA2_256).unwrap().minbits, 256);
        assert_eq!(enc_alg(EALG_AESCBC).unwrap().maxbits, 256);
        assert!(auth_alg(99).is_none());
    }

    fn parse_combs(buf: &[u8]) -> Vec<SadbComb> {
        let p = ParsedMsg::parse(buf).unwrap();
        let raw = p.ext(EXT_PROPOSAL).unwrap();
        let body = &raw[std::mem::size_of::<SadbProp>()..];
        body.chunks_exact(std::mem::size_of::<SadbComb>())
            .map(|c| SadbComb::read_from_bytes(c).unwrap())
            .collect()
    }

    #[test]
    fn esp_proposal_respects_keymin() {
        let cfg = KeyConfig::default();
        let mut b = MsgBuilder::new(MsgType::Acquire, 3, 1, 0);
        assert!(write_proposal(&mut b, IpsecProto::Esp, &cfg));
        let combs = parse_combs(&b.finish());
        // esp_keymin 256 rules out single-DES and 3DES; AES is clamped up
        assert!(combs.iter().all(|c| c.encrypt != EALG_DESCBC));
        assert!(combs.iter().all(|c| c.encrypt != EALG_3DESCBC));
        let aes = combs.iter().find(|c| c.encrypt == EALG_AESCBC).unwrap();
        assert_eq!(aes.encrypt_minbits, 256);
        assert_eq!(aes.encrypt_maxbits, 256);
        assert_eq!(aes.hard_addtime, 86400);
        assert_eq!(aes.soft_addtime, 69120);
    }

    #[test]
    fn ah_proposal_filters_small_keys() {
        let mut cfg = KeyConfig::default();
        cfg.ah_keymin = 256;
        let mut b = MsgBuilder::new(MsgType::Acquire, 2, 1, 0);
        assert!(write_proposal(&mut b, IpsecProto::Ah, &cfg));
        let combs = parse_combs(&b.finish());
        assert!(combs.iter().all(|c| c.auth_minbits >= 256));
        assert!(combs.iter().any(|c| c.auth == AALG_SHA2_512));
        assert!(combs.iter().all(|c| c.auth != AALG_MD5HMAC));
    }

    #[test]
    fn esp_auth_pairs_combinations() {
        let mut cfg = KeyConfig::default();
        cfg.esp_auth = true;
        cfg.esp_keymin = 128;
        let mut b = MsgBuilder::new(MsgType::Acquire, 3, 1, 0);
        assert!(write_proposal(&mut b, IpsecProto::Esp, &cfg));
        let combs = parse_combs(&b.finish());
        assert!(combs.iter().any(|c| c.auth != 0 && c.encrypt != 0));
    }

    #[test]
    fn impossible_minimum_yields_no_proposal() {
        let mut cfg = KeyConfig::default();
        cfg.esp_keymin = 4096;
        let mut b = MsgBuilder::new(MsgType::Acquire, 3, 1, 0);
        assert!(!write_proposal(&mut b, IpsecProto::Esp, &cfg));
    }

    #[test]
    fn supported_block_parses() {
        let mut b = MsgBuilder::new(MsgType::Register, 3, 1, 0);
        write_supported(&mut b);
        let buf = b.finish();
        let p = ParsedMsg::parse(&buf).unwrap();
        let raw = p.ext(EXT_SUPPORTED_AUTH).unwrap();
        let nalgs = (raw.len() - 8) / std::mem::size_of::<SadbAlg>();
        assert_eq!(nalgs, AUTH_ALGS.len());
        assert!(p.has(EXT_SUPPORTED_ENCRYPT));
    }
}
