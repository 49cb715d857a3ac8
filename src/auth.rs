//! External Ingress Authenticator (C9, §4.9).
//!
//! Validates a presented API key against the configured keys for a queue.
//! Keys live in the config document (`ingress_auth`); an unknown queue name
//! is rejected regardless of the key presented (§8 boundary behavior).

use crate::config::Config;

pub fn authenticate(config: &Config, queue: &str, presented_key: &str) -> bool {
    match config.ingress_auth.get(queue) {
        Some(keys) => keys.iter().any(|k| k == presented_key),
        None => false,
    }
}
