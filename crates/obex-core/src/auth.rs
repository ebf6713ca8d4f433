//! OBEX digest authentication.
//!
//! The server challenges a connecting client with a random nonce. The client
//! answers with `MD5(nonce ":" password)`; the password itself is supplied by
//! the hosting application in response to an `AuthRequested` event.

use serde::{Deserialize, Serialize};

/// Nonce length in bytes
pub const NONCE_LEN: usize = 16;

/// Challenge sent in an Unauthorized connect response
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthChallenge {
    /// Random nonce
    pub nonce: [u8; NONCE_LEN],
    /// Client must send a user id
    pub user_id_required: bool,
    /// Optional realm shown to the user
    pub realm: Option<String>,
}

impl AuthChallenge {
    /// Fresh challenge with a random nonce
    #[must_use]
    pub fn generate(user_id_required: bool, realm: Option<String>) -> Self {
        Self {
            nonce: rand::random(),
            user_id_required,
            realm,
        }
    }

    /// Expected digest for `password`
    #[must_use]
    pub fn expected_digest(&self, password: &[u8]) -> [u8; 16] {
        let mut input = Vec::with_capacity(NONCE_LEN + 1 + password.len());
        input.extend_from_slice(&self.nonce);
        input.push(b':');
        input.extend_from_slice(password);
        md5::compute(&input).0
    }

    /// Check a client response against `password`
    #[must_use]
    pub fn verify(&self, response: &AuthDigest, password: &[u8]) -> bool {
        if let Some(nonce) = response.nonce {
            if nonce != self.nonce {
                return false;
            }
        }
        if self.user_id_required && response.user_id.as_deref().is_none_or(<[u8]>::is_empty) {
            return false;
        }
        constant_time_eq(&response.request_digest, &self.expected_digest(password))
    }
}

/// Authentication response header sent by the client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthDigest {
    /// `MD5(nonce ":" password)`
    pub request_digest: [u8; 16],
    /// Echoed nonce, if present
    pub nonce: Option<[u8; NONCE_LEN]>,
    /// User id, if present
    pub user_id: Option<Vec<u8>>,
}

impl AuthDigest {
    /// Build the response a client with `password` would send
    #[must_use]
    pub fn answer(challenge: &AuthChallenge, password: &[u8], user_id: Option<Vec<u8>>) -> Self {
        Self {
            request_digest: challenge.expected_digest(password),
            nonce: Some(challenge.nonce),
            user_id,
        }
    }
}

fn constant_time_eq(a: &[u8; 16], b: &[u8; 16]) -> bool {
    a.iter().zip(b.iter()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
