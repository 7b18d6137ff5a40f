//! Challenge/response credential hashing.
//!
//! The wire contract: `SHA256(challenge || ':' || SHA256(lower(user_id) ||
//! ':' || password))`, both digests raw binary.  Only the hashed copy of the
//! user id is lower-cased; `AuthRequest::user_id` carries it as typed.

use cdp_proto::{AuthRequest, ChallengeResponse};
use sha2::{Digest, Sha256};
use std::collections::HashMap;

pub const USERNAME_KEY: &str = "Username";
pub const PASSWORD_KEY: &str = "Password";

const PASSWORD_HASH_TYPE: &str = "PasswordHash";

/// Compute the password challenge response digest.
pub fn password_hash(challenge: &[u8], user_id: &str, password: &str) -> Vec<u8> {
    let mut inner = Sha256::new();
    inner.update(user_id.to_lowercase().as_bytes());
    inner.update(b":");
    inner.update(password.as_bytes());
    let user_pass_hash = inner.finalize();

    let mut outer = Sha256::new();
    outer.update(challenge);
    outer.update(b":");
    outer.update(user_pass_hash);
    outer.finalize().to_vec()
}

/// Compose an `AuthRequest` from embedder-supplied credentials.
///
/// Fails with `Unknown` when the `Username` or `Password` key is missing.
pub fn compose_auth_request(
    challenge: &[u8],
    credentials: &HashMap<String, String>,
) -> crate::Result<AuthRequest> {
    let user_id = credentials
        .get(USERNAME_KEY)
        .ok_or_else(|| crate::Error::Unknown("credentials are missing 'Username'".to_owned()))?;
    let password = credentials
        .get(PASSWORD_KEY)
        .ok_or_else(|| crate::Error::Unknown("credentials are missing 'Password'".to_owned()))?;

    Ok(AuthRequest {
        user_id: user_id.clone(),
        challenge_response: vec![ChallengeResponse {
            response_type: PASSWORD_HASH_TYPE.to_owned(),
            response: password_hash(challenge, user_id, password),
        }],
    })
}
