//! Session key selection.

use rand::Rng;

/// Draw a random non-zero session key.
pub fn generate_key() -> i32 {
    let mut rng = rand::thread_rng();
    loop {
        let key: i32 = rng.r#gen();
        if key != 0 {
            return key;
        }
    }
}

/// How a server picks its key when answering a Connect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ServerKeyPolicy {
    /// Answer with the client's own key.
    #[default]
    Echo,
    /// Answer with a freshly generated key.
    Random,
}

impl ServerKeyPolicy {
    /// Server key for a Connect carrying `client_key`.
    pub fn server_key(self, client_key: i32) -> i32 {
        match self {
            Self::Echo => client_key,
            Self::Random => generate_key(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_key_nonzero() {
        for _ in 0..256 {
            assert_ne!(generate_key(), 0);
        }
    }

    #[test]
    fn test_echo_policy() {
        assert_eq!(ServerKeyPolicy::Echo.server_key(-42), -42);
        assert_eq!(ServerKeyPolicy::default(), ServerKeyPolicy::Echo);
    }

    #[test]
    fn test_random_policy() {
        let keys: Vec<i32> = (0..8).map(|_| ServerKeyPolicy::Random.server_key(7)).collect();
        assert!(keys.iter().all(|k| *k != 0));
        assert!(keys.iter().any(|k| *k != 7));
    }
}
