//! The transform provider capability.
//!
//! The engine validates key shapes and lifecycle; the actual AH/ESP/IPComp
//! transforms live behind this trait. `init` runs after the per-protocol
//! shape checks and before the SA becomes usable; `zeroize` runs when an
//! SA's keying state is torn down so a provider can scrub any derived
//! state of its own.

use crate::error::Result;
use crate::keys::KeyMaterial;
use crate::types::IpsecProto;

/// Read-only view of an SA's keying parameters handed to a provider.
pub struct KeyingView<'a> {
    /// SPI in host order.
    pub spi: u32,
    /// Authentication algorithm id.
    pub auth_alg: u8,
    /// Encryption algorithm id.
    pub enc_alg: u8,
    /// SA flags.
    pub flags: u32,
    /// Authentication key, if any.
    pub key_auth: Option<&'a KeyMaterial>,
    /// Encryption key, if any.
    pub key_enc: Option<&'a KeyMaterial>,
}

/// Provider of the actual cryptographic transforms.
pub trait TransformProvider: Send + Sync {
    /// Accept or reject the keying of a new SA for `proto`.
    fn init(&self, view: KeyingView<'_>, proto: IpsecProto) -> Result<()>;

    /// The SA identified by `spi` is being torn down; scrub derived
    /// state. The engine zeroizes its own copies of the key material
    /// independently.
    fn zeroize(&self, spi: u32);
}

/// A provider that accepts every keying and keeps no state. Useful for
/// tests and for deployments that defer transform setup elsewhere.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullTransform;

impl TransformProvider for NullTransform {
    fn init(&self, _view: KeyingView<'_>, _proto: IpsecProto) -> Result<()> {
        Ok(())
    }

    fn zeroize(&self, _spi: u32) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_transform_accepts() {
        let p = NullTransform;
        let view = KeyingView {
            spi: 0x1000,
            auth_alg: 3,
            enc_alg: 12,
            flags: 0,
            key_auth: None,
            key_enc: None,
        };
        assert!(p.init(view, IpsecProto::Esp).is_ok());
        p.zeroize(0x1000);
    }
}
