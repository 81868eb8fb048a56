//! Utility module
//!
//! Helpers shared by the client that do not belong to the protocol itself.

use base64::engine::general_purpose::URL_SAFE;
use base64::Engine as _;
use sha2::{Digest, Sha256};

/// Length of the identifier returned by [`gateway_unique_id`]
pub const UNIQUE_ID_LEN: usize = 10;

/// Derives a stable identifier for a gateway from its address
pub fn gateway_unique_id(host: &str, port: u16) -> String {
    let digest = Sha256::digest(format!("{}:{}", host, port).as_bytes());
    let mut encoded = URL_SAFE.encode(digest);
    encoded.truncate(UNIQUE_ID_LEN);
    encoded
}
