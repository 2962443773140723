//! One-time approve/reject links for expense reviewers.
//!
//! [`issuer::TokenIssuer`] mints a pair of capability tokens when an expense
//! is submitted; [`consumer::TokenConsumer`] redeems one of them when the
//! reviewer follows a link built by [`link::ActionLink`].

pub mod consumer;
pub mod issuer;
pub mod link;

use base64::Engine;
use rand::rngs::OsRng;
use rand::RngCore;

/// Random bytes per token (256 bits).
pub const TOKEN_BYTES: usize = 32;

/// Longest token value accepted at the consume boundary. Anything longer is
/// not one of ours and is rejected before it reaches the store.
pub const MAX_TOKEN_LEN: usize = 128;

/// Draw a fresh token value from the operating system CSPRNG, encoded as
/// unpadded base64url so it can sit in a query string unescaped.
pub fn generate_token() -> String {
    let mut bytes = [0u8; TOKEN_BYTES];
    OsRng.fill_bytes(&mut bytes);
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes)
}
