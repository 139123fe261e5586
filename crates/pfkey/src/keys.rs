//! Key material, lifetime records, and replay-window state.

use std::fmt;

use crate::error::{Error, Result};

/// Raw key material with its declared bit length.
///
/// The backing bytes are zeroed when the value is dropped, so a failed
/// keying attempt never leaves key bytes behind in freed memory.
#[derive(Clone, PartialEq, Eq)]
pub struct KeyMaterial {
    bits: u16,
    data: Vec<u8>,
}

impl KeyMaterial {
    /// Build from a wire key extension payload. The declared bit length
    /// must fit in the supplied bytes.
    pub fn from_wire(bits: u16, data: &[u8]) -> Result<Self> {
        let need = (bits as usize).div_ceil(8);
        if data.len() < need {
            return Err(Error::InvalidExtension(format!(
                "key declares {bits} bits but carries {} bytes",
                data.len()
            )));
        }
        Ok(Self {
            bits,
            data: data[..need].to_vec(),
        })
    }

    /// Declared length in bits.
    pub fn bits(&self) -> u16 {
        self.bits
    }

    /// Key bytes.
    pub fn raw(&self) -> &[u8] {
        &self.data
    }

    /// True for a zero-length key (null algorithms).
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl Drop for KeyMaterial {
    fn drop(&mut self) {
        for b in self.data.iter_mut() {
            // volatile so the zeroing store is not optimized away
            unsafe { std::ptr::write_volatile(b, 0) };
        }
    }
}

impl fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // never log key bytes
        write!(f, "KeyMaterial({} bits)", self.bits)
    }
}

/// One lifetime record: the (allocations, bytes, addtime, usetime)
/// quadruple carried by lifetime extensions.
///
/// For limits, a zero field means "no limit on this axis". For current
/// values, `addtime` is the creation timestamp and `usetime` the
/// first-use timestamp.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Lifetime {
    /// Allocation (use) count.
    pub allocations: u32,
    /// Byte count.
    pub bytes: u64,
    /// Seconds since creation, or the creation time itself for current
    /// values.
    pub addtime: u64,
    /// Seconds since first use, or the first-use time itself.
    pub usetime: u64,
}

/// Anti-replay window state carried by an SA.
///
/// The engine only stores it; window advancement belongs to the transform
/// provider on the packet path.
#[derive(Debug, Clone)]
pub struct ReplayWindow {
    /// Window width in bytes of bitmap (as negotiated).
    pub wsize: u8,
    /// Highest sequence number seen.
    pub seq: u32,
    /// Packets accepted.
    pub count: u32,
    /// Seen-sequence bitmap.
    pub bitmap: Vec<u8>,
}

impl ReplayWindow {
    /// Fresh window of `wsize` bytes of bitmap.
    pub fn new(wsize: u8) -> Self {
        Self {
            wsize,
            seq: 0,
            count: 0,
            bitmap: vec![0; wsize as usize],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_material_length_check() {
        assert!(KeyMaterial::from_wire(128, &[0u8; 16]).is_ok());
        assert!(KeyMaterial::from_wire(128, &[0u8; 15]).is_err());
        // trailing padding beyond the declared bits is ignored
        let k = KeyMaterial::from_wire(20, &[0xff; 8]).unwrap();
        assert_eq!(k.raw().len(), 3);
        assert_eq!(k.bits(), 20);
    }

    #[test]
    fn key_material_debug_hides_bytes() {
        let k = KeyMaterial::from_wire(64, &[0xaa; 8]).unwrap();
        let s = format!("{k:?}");
        assert!(!s.contains("aa"));
        assert!(s.contains("64 bits"));
    }

    #[test]
    fn replay_window_sizing() {
        let w = ReplayWindow::new(4);
        assert_eq!(w.bitmap.len(), 4);
        assert_eq!(w.count, 0);
    }
}
