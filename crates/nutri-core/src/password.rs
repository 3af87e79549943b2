//! # Password Hashing
//!
//! PBKDF2-HMAC-SHA256 with a per-password random salt. Hashes are stored
//! in a self-describing string so the iteration count can be raised later
//! without invalidating existing hashes:
//!
//! ```text
//! pbkdf2-sha256$<iterations>$<salt, base64 no pad>$<hash, base64 no pad>
//! ```

use base64::engine::general_purpose::STANDARD_NO_PAD;
use base64::Engine as _;
use pbkdf2::pbkdf2_hmac;
use rand_core::{OsRng, RngCore};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use thiserror::Error;

/// Scheme tag at the start of every encoded hash.
const SCHEME: &str = "pbkdf2-sha256";

/// Default PBKDF2 iteration count.
pub const DEFAULT_ITERATIONS: u32 = 210_000;

const SALT_LEN: usize = 16;
const HASH_LEN: usize = 32;

/// Password hashing and policy errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PasswordError {
    /// Stored hash is not in the expected format.
    #[error("malformed password hash")]
    MalformedHash,

    /// Password does not satisfy the policy.
    #[error("password rejected: {0}")]
    Policy(String),
}

/// Complexity requirements for new passwords.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PasswordPolicy {
    /// Minimum length in characters.
    pub min_len: usize,
    /// Maximum length in characters.
    pub max_len: usize,
}

impl Default for PasswordPolicy {
    fn default() -> Self {
        Self {
            min_len: 8,
            max_len: 128,
        }
    }
}

impl PasswordPolicy {
    /// Check that `password` satisfies the policy.
    pub fn check(&self, password: &str) -> Result<(), PasswordError> {
        let len = password.chars().count();
        if len < self.min_len {
            return Err(PasswordError::Policy(format!(
                "must be at least {} characters",
                self.min_len
            )));
        }
        if len > self.max_len {
            return Err(PasswordError::Policy(format!(
                "must not exceed {} characters",
                self.max_len
            )));
        }
        if !password.chars().any(char::is_alphabetic) || !password.chars().any(|c| c.is_ascii_digit()) {
            return Err(PasswordError::Policy(
                "must contain at least one letter and one digit".to_string(),
            ));
        }
        Ok(())
    }
}

/// Hash `password` with a fresh random salt.
pub fn hash_password(password: &str, iterations: u32) -> String {
    let mut salt = [0u8; SALT_LEN];
    OsRng.fill_bytes(&mut salt);
    encode(password, &salt, iterations.max(1))
}

fn encode(password: &str, salt: &[u8], iterations: u32) -> String {
    let mut out = [0u8; HASH_LEN];
    pbkdf2_hmac::<Sha256>(password.as_bytes(), salt, iterations, &mut out);
    format!(
        "{SCHEME}${iterations}${}${}",
        STANDARD_NO_PAD.encode(salt),
        STANDARD_NO_PAD.encode(out)
    )
}

/// Verify `password` against an encoded hash in constant time.
///
/// Returns `Ok(false)` on mismatch and `Err` only when the stored hash is
/// malformed.
pub fn verify_password(password: &str, encoded: &str) -> Result<bool, PasswordError> {
    let mut parts = encoded.split('$');
    let (scheme, iterations, salt, hash) = match (
        parts.next(),
        parts.next(),
        parts.next(),
        parts.next(),
        parts.next(),
    ) {
        (Some(s), Some(i), Some(salt), Some(h), None) => (s, i, salt, h),
        _ => return Err(PasswordError::MalformedHash),
    };
    if scheme != SCHEME {
        return Err(PasswordError::MalformedHash);
    }
    let iterations: u32 = iterations.parse().map_err(|_| PasswordError::MalformedHash)?;
    if iterations == 0 {
        return Err(PasswordError::MalformedHash);
    }
    let salt = STANDARD_NO_PAD
        .decode(salt)
        .map_err(|_| PasswordError::MalformedHash)?;
    let expected = STANDARD_NO_PAD
        .decode(hash)
        .map_err(|_| PasswordError::MalformedHash)?;
    if expected.len() != HASH_LEN {
        return Err(PasswordError::MalformedHash);
    }

    let mut actual = [0u8; HASH_LEN];
    pbkdf2_hmac::<Sha256>(password.as_bytes(), &salt, iterations, &mut actual);
    Ok(actual.as_slice().ct_eq(expected.as_slice()).into())
}

#[cfg(test)]
mod tests {
    use super::*;

    // Low iteration count keeps the tests fast.
    const ITER: u32 = 1_000;

    #[test]
    fn hash_then_verify() {
        let hash = hash_password("s3cret-pass", ITER);
        assert!(hash.starts_with("pbkdf2-sha256$1000$"));
        assert!(verify_password("s3cret-pass", &hash).unwrap());
        assert!(!verify_password("s3cret-pasS", &hash).unwrap());
    }

    #[test]
    fn salts_differ() {
        assert_ne!(hash_password("same1234", ITER), hash_password("same1234", ITER));
    }

    #[test]
    fn known_vector_is_stable() {
        let a = encode("password1", b"fixed-salt-16byt", ITER);
        let b = encode("password1", b"fixed-salt-16byt", ITER);
        assert_eq!(a, b);
        assert!(verify_password("password1", &a).unwrap());
    }

    #[test]
    fn malformed_hashes_error() {
        for bad in [
            "",
            "plaintext",
            "bcrypt$10$abc$def",
            "pbkdf2-sha256$x$abc$def",
            "pbkdf2-sha256$0$abc$def",
            "pbkdf2-sha256$10$!!!$def",
            "pbkdf2-sha256$10$abc$def$extra",
        ] {
            assert_eq!(verify_password("pw", bad), Err(PasswordError::MalformedHash), "{bad}");
        }
    }

    #[test]
    fn policy_requires_letters_and_digits() {
        let policy = PasswordPolicy::default();
        assert!(policy.check("abcdefgh").is_err());
        assert!(policy.check("12345678").is_err());
        assert!(policy.check("abc123").is_err());
        assert!(policy.check("abcd1234").is_ok());
        assert!(policy.check(&"a1".repeat(65)).is_err());
    }
}
