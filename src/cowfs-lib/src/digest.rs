use crate::{CowFsError, CowFsResult};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Hex length of every supported digest (both algorithms are 256-bit).
pub const DIGEST_HEX_LEN: usize = 64;

/// Content digest algorithm for the object store. Chosen once when a backend
/// is initialized and recorded in the format marker; never mixed afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DigestAlgo {
    Sha256,
    Blake3,
}

impl DigestAlgo {
    pub fn from_name(name: &str) -> CowFsResult<Self> {
        match name {
            "sha256" => Ok(DigestAlgo::Sha256),
            "blake3" => Ok(DigestAlgo::Blake3),
            other => Err(CowFsError::InvalidParam(format!(
                "unknown digest algorithm: {}",
                other
            ))),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            DigestAlgo::Sha256 => "sha256",
            DigestAlgo::Blake3 => "blake3",
        }
    }

    /// Hex digest of `data`, always `DIGEST_HEX_LEN` lowercase chars.
    pub fn hex_digest(&self, data: &[u8]) -> String {
        match self {
            DigestAlgo::Sha256 => {
                let mut hasher = Sha256::new();
                hasher.update(data);
                hex::encode(hasher.finalize())
            }
            DigestAlgo::Blake3 => blake3::hash(data).to_hex().to_string(),
        }
    }

    /// Digest of the empty byte sequence. Every freshly created file points
    /// at this object.
    pub fn empty_digest(&self) -> String {
        self.hex_digest(&[])
    }
}

impl Default for DigestAlgo {
    fn default() -> Self {
        DigestAlgo::Sha256
    }
}

pub fn is_valid_digest(s: &str) -> bool {
    s.len() == DIGEST_HEX_LEN && s.bytes().all(|b| b.is_ascii_hexdigit())
}
