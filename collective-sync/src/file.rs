//! On-remote format of a device's transaction log.
//!
//! ```text
//! "XXDKTXLOGHDR" + base64url(json(header)) + "\n" + base64url(ciphertext)
//! ```
//!
//! The header is plaintext so a reader can tell which device wrote a file
//! before decrypting it. Both base64 segments use the URL-safe alphabet with
//! padding.

use crate::error::{SyncError, SyncResult};
use base64::{Engine, engine::general_purpose::URL_SAFE};
use collective_types::InstanceId;
use serde::{Deserialize, Serialize};

/// Magic prefix of every log file.
pub const FILE_MAGIC: &str = "XXDKTXLOGHDR";

/// Current header version.
pub const HEADER_VERSION: u16 = 0;

const DELIMITER: u8 = b'\n';

/// Plaintext header of a log file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    pub version: u16,
    pub device: InstanceId,
}

impl Header {
    /// A current-version header for `device`.
    pub fn new(device: InstanceId) -> Self {
        Self {
            version: HEADER_VERSION,
            device,
        }
    }
}

/// Builds a log file from its header and encrypted patch.
pub fn encode_file(header: &Header, ciphertext: &[u8]) -> SyncResult<Vec<u8>> {
    let header_json = serde_json::to_vec(header)?;
    let header_b64 = URL_SAFE.encode(header_json);
    let body_b64 = URL_SAFE.encode(ciphertext);

    let mut out = Vec::with_capacity(FILE_MAGIC.len() + header_b64.len() + 1 + body_b64.len());
    out.extend_from_slice(FILE_MAGIC.as_bytes());
    out.extend_from_slice(header_b64.as_bytes());
    out.push(DELIMITER);
    out.extend_from_slice(body_b64.as_bytes());
    Ok(out)
}

/// Splits a log file into its header and encrypted patch.
pub fn decode_file(data: &[u8]) -> SyncResult<(Header, Vec<u8>)> {
    let rest = data
        .strip_prefix(FILE_MAGIC.as_bytes())
        .ok_or_else(|| SyncError::Codec("missing log file magic".to_string()))?;

    let split = rest
        .iter()
        .position(|b| *b == DELIMITER)
        .ok_or_else(|| SyncError::Codec("missing header delimiter".to_string()))?;
    let (header_b64, body_b64) = (&rest[..split], &rest[split + 1..]);

    let header_json = URL_SAFE
        .decode(header_b64)
        .map_err(|e| SyncError::Codec(format!("invalid header encoding: {e}")))?;
    let header: Header = serde_json::from_slice(&header_json)
        .map_err(|e| SyncError::Codec(format!("invalid header: {e}")))?;
    if header.version != HEADER_VERSION {
        return Err(SyncError::Codec(format!(
            "unsupported header version {}",
            header.version
        )));
    }

    let ciphertext = URL_SAFE
        .decode(body_b64)
        .map_err(|e| SyncError::Codec(format!("invalid body encoding: {e}")))?;

    Ok((header, ciphertext))
}

/// Remote path of `device`'s log: `<sync_path>/<key_id>/<device>`.
pub fn log_path(sync_path: &str, key_id: &str, device: &InstanceId) -> String {
    format!("{sync_path}/{key_id}/{device}")
}
