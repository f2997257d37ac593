//! Core traits for the Subspace transport.

/// A per-session obfuscation layer applied to every record after the
/// handshake.
///
/// Implementations must be length-preserving and must leave the first
/// `clear_prefix` bytes untouched so the receiver can classify a record
/// before decrypting it.
///
/// # Requirements
///
/// - `decrypt(&encrypt(d, p), p) == d` for every `d` and every `p` in 0..=2
/// - both peers of a session must construct equivalent ciphers from the
///   same key exchange
pub trait SessionCipher: Send + Sync {
    /// Short algorithm name for logs.
    fn name(&self) -> &'static str;

    /// Obfuscate `data`, leaving `clear_prefix` leading bytes as-is.
    fn encrypt(&self, data: &[u8], clear_prefix: usize) -> Vec<u8>;

    /// Reverse [`SessionCipher::encrypt`].
    fn decrypt(&self, data: &[u8], clear_prefix: usize) -> Vec<u8>;
}

impl std::fmt::Debug for dyn SessionCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionCipher")
            .field("name", &self.name())
            .finish()
    }
}
