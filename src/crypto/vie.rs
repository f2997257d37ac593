//! VIE stream obfuscation.
//!
//! The legacy cipher spoken by Subspace clients: a 130-word keystream
//! derived from the session key by a Park-Miller style recurrence, applied
//! to 32-bit little-endian words with ciphertext chaining.
//!
//! This is NOT encryption in any modern sense. Anyone who sees the
//! handshake can derive the keystream. It exists so that historical peers
//! can talk to us.

use crate::core::constants::VIE_TABLE_WORDS;
use crate::core::SessionCipher;

const WORD: usize = 4;

/// Keystream table plus the chain seed for one session.
#[derive(Clone)]
pub struct VieCipher {
    key: i32,
    table: [u32; VIE_TABLE_WORDS],
}

impl VieCipher {
    /// Cipher for a session whose agreed key is `session_key`.
    pub fn new(session_key: i32) -> Self {
        Self {
            key: session_key,
            table: keystream(session_key),
        }
    }

    /// Cipher for a completed Connect/ConnectResponse exchange.
    ///
    /// Both peers derive the keystream and the chain seed from the key
    /// carried in the ConnectResponse, so the client key only matters to
    /// servers that echo it back.
    pub fn initialize(_client_key: i32, server_key: i32) -> Self {
        Self::new(server_key)
    }

    /// The session key.
    pub fn key(&self) -> i32 {
        self.key
    }

    /// Keystream word `index`, cycling past the end of the table.
    pub fn table_word(&self, index: usize) -> u32 {
        self.table[index % VIE_TABLE_WORDS]
    }

    fn apply(&self, data: &[u8], clear_prefix: usize, decrypt: bool) -> Vec<u8> {
        let split = clear_prefix.min(data.len());
        let (clear, body) = data.split_at(split);

        let mut out = Vec::with_capacity(data.len() + WORD);
        out.extend_from_slice(clear);

        let mut chain = self.key as u32;
        for (i, chunk) in body.chunks(WORD).enumerate() {
            let mut word = [0u8; WORD];
            word[..chunk.len()].copy_from_slice(chunk);
            let input = u32::from_le_bytes(word);

            let output = input ^ self.table_word(i) ^ chain;
            chain = if decrypt { input } else { output };
            out.extend_from_slice(&output.to_le_bytes()[..chunk.len()]);
        }
        out
    }
}

impl SessionCipher for VieCipher {
    fn name(&self) -> &'static str {
        "vie"
    }

    fn encrypt(&self, data: &[u8], clear_prefix: usize) -> Vec<u8> {
        self.apply(data, clear_prefix, false)
    }

    fn decrypt(&self, data: &[u8], clear_prefix: usize) -> Vec<u8> {
        self.apply(data, clear_prefix, true)
    }
}

impl std::fmt::Debug for VieCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VieCipher")
            .field("key", &format_args!("{:#010x}", self.key as u32))
            .finish_non_exhaustive()
    }
}

/// Derive the keystream table for `key`.
///
/// Each step yields 16 bits; consecutive pairs form little-endian words.
/// The state stays within (-2^31, 2^31), so the products fit in `i64`.
fn keystream(key: i32) -> [u32; VIE_TABLE_WORDS] {
    let mut table = [0u32; VIE_TABLE_WORDS];
    let mut k = key as i64;

    for slot in table.iter_mut() {
        let mut halves = [0u32; 2];
        for half in halves.iter_mut() {
            let mut t = (k * 0x834E_0B5F) >> 48;
            t += t >> 31;
            // `%` truncates toward zero, matching the sign-following modulus.
            k = (k % 127_773) * 16_807 - t * 2836 + 123;
            if k == 0 || k & 0x8000_0000 != 0 {
                k += 0x7FFF_FFFF;
            }
            *half = (k & 0xFFFF) as u32;
        }
        *slot = halves[0] | (halves[1] << 16);
    }
    table
}
