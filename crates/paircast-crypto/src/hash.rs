use paircast_proto::types::Topic;
use sha2::{Digest, Sha256};

pub fn sha256(data: &[u8]) -> [u8; 32] {
    let mut h = Sha256::new();
    h.update(data);
    let out = h.finalize();
    let mut arr = [0u8; 32];
    arr.copy_from_slice(&out);
    arr
}

/// Settled-topic derivation: topic = sha256(shared_secret).
pub fn derive_topic(shared_secret: &[u8]) -> Topic {
    Topic::from_raw(sha256(shared_secret))
}
