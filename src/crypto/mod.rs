//! Session obfuscation.
//!
//! - [`VieCipher`]: bit-exact legacy cipher, for interoperability only
//! - [`generate_key`] and [`ServerKeyPolicy`]: handshake key choice
//!
//! The transport holds ciphers as `Box<dyn SessionCipher>`; [`establish`]
//! is the single place that picks the algorithm.

mod keys;
mod vie;

pub use keys::*;
pub use vie::VieCipher;

use crate::core::SessionCipher;

/// Build the cipher for a completed key exchange.
pub fn establish(client_key: i32, server_key: i32) -> Box<dyn SessionCipher> {
    Box::new(VieCipher::initialize(client_key, server_key))
}
