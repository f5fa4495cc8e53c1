use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use rand::{thread_rng, RngCore};

/// Raw entropy per nonce; encodes to 43 URL-safe characters
pub const NONCE_BYTES: usize = 32;

/// Generate a single-use nonce binding an authorization request to its callback
pub fn generate_nonce() -> String {
    let mut bytes = [0u8; NONCE_BYTES];
    thread_rng().fill_bytes(&mut bytes);

    URL_SAFE_NO_PAD.encode(bytes)
}
