//! Authentication plugins.
//!
//! - `mysql_native_password`:
//!   `SHA1(password) XOR SHA1(seed + SHA1(SHA1(password)))`
//! - `caching_sha2_password` fast path:
//!   `SHA256(password) XOR SHA256(SHA256(SHA256(password)) + seed)`.
//!   When the server asks for full authentication over a plaintext socket,
//!   the client requests the server's RSA public key and sends the
//!   NUL-terminated password, XORed with the seed, encrypted with OAEP.
//! - `sha256_password`: the same RSA exchange, PKCS#1 v1.5 padding.
//! - `mysql_clear_password`: the NUL-terminated password as is.

use marlin_core::{ConnectionError, ConnectionErrorKind, Error, Result};
use rand::rngs::OsRng;
use rsa::RsaPublicKey;
use rsa::pkcs1::DecodeRsaPublicKey;
use rsa::pkcs8::DecodePublicKey;
use sha1::Sha1;
use sha2::{Digest, Sha256};

/// Plugin names as sent by the server.
pub mod plugins {
    pub const MYSQL_NATIVE_PASSWORD: &str = "mysql_native_password";
    pub const CACHING_SHA2_PASSWORD: &str = "caching_sha2_password";
    pub const SHA256_PASSWORD: &str = "sha256_password";
    pub const MYSQL_CLEAR_PASSWORD: &str = "mysql_clear_password";
}

/// Extra-auth-data codes used by `caching_sha2_password`.
pub mod caching_sha2 {
    /// Client request for the server public key
    pub const REQUEST_PUBLIC_KEY: u8 = 0x02;
    pub const FAST_AUTH_SUCCESS: u8 = 0x03;
    pub const PERFORM_FULL_AUTH: u8 = 0x04;
}

/// A supported authentication plugin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthPlugin {
    NativePassword,
    CachingSha2,
    Sha256,
    ClearPassword,
}

impl AuthPlugin {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            plugins::MYSQL_NATIVE_PASSWORD => Some(AuthPlugin::NativePassword),
            plugins::CACHING_SHA2_PASSWORD => Some(AuthPlugin::CachingSha2),
            plugins::SHA256_PASSWORD => Some(AuthPlugin::Sha256),
            plugins::MYSQL_CLEAR_PASSWORD => Some(AuthPlugin::ClearPassword),
            _ => None,
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            AuthPlugin::NativePassword => plugins::MYSQL_NATIVE_PASSWORD,
            AuthPlugin::CachingSha2 => plugins::CACHING_SHA2_PASSWORD,
            AuthPlugin::Sha256 => plugins::SHA256_PASSWORD,
            AuthPlugin::ClearPassword => plugins::MYSQL_CLEAR_PASSWORD,
        }
    }

    /// First response to the server's challenge.
    ///
    /// `sha256_password` without a password sends an empty response; with a
    /// password it asks for the public key (a single `0x01`) and finishes
    /// with [`encrypt_password`].
    pub fn initial_response(self, password: &str, seed: &[u8]) -> Vec<u8> {
        match self {
            AuthPlugin::NativePassword => scramble_native(password, seed),
            AuthPlugin::CachingSha2 => scramble_caching_sha2(password, seed),
            AuthPlugin::Sha256 if password.is_empty() => Vec::new(),
            AuthPlugin::Sha256 => vec![0x01],
            AuthPlugin::ClearPassword => {
                let mut out = password.as_bytes().to_vec();
                out.push(0);
                out
            }
        }
    }

    /// Padding used when the password is RSA encrypted.
    pub const fn uses_oaep(self) -> bool {
        matches!(self, AuthPlugin::CachingSha2)
    }
}

/// Strip the trailing NUL the server appends to a 20-byte scramble.
fn seed_bytes(seed: &[u8]) -> &[u8] {
    match seed {
        [head @ .., 0] if head.len() == 20 => head,
        _ => seed.get(..20).unwrap_or(seed),
    }
}

fn xor(a: &[u8], b: &[u8]) -> Vec<u8> {
    a.iter().zip(b).map(|(x, y)| x ^ y).collect()
}

/// `mysql_native_password` scramble (20 bytes, empty for no password).
pub fn scramble_native(password: &str, seed: &[u8]) -> Vec<u8> {
    if password.is_empty() {
        return Vec::new();
    }
    let stage1 = Sha1::digest(password.as_bytes());
    let stage2 = Sha1::digest(stage1);
    let mut hasher = Sha1::new();
    hasher.update(seed_bytes(seed));
    hasher.update(stage2);
    xor(&stage1, &hasher.finalize())
}

/// `caching_sha2_password` fast-path scramble (32 bytes, empty for no
/// password).
pub fn scramble_caching_sha2(password: &str, seed: &[u8]) -> Vec<u8> {
    if password.is_empty() {
        return Vec::new();
    }
    let hash = Sha256::digest(password.as_bytes());
    let hash_hash = Sha256::digest(hash);
    let mut hasher = Sha256::new();
    hasher.update(hash_hash);
    hasher.update(seed_bytes(seed));
    xor(&hash, &hasher.finalize())
}

fn auth_failure(message: String) -> Error {
    Error::Connection(ConnectionError {
        kind: ConnectionErrorKind::Authentication,
        message,
        source: None,
    })
}

/// Encrypt the password with the server's RSA public key (PEM, SPKI or
/// PKCS#1).
pub fn encrypt_password(
    password: &str,
    seed: &[u8],
    public_key_pem: &[u8],
    use_oaep: bool,
) -> Result<Vec<u8>> {
    let seed = seed_bytes(seed);
    if seed.is_empty() {
        return Err(auth_failure("server sent an empty scramble".to_string()));
    }
    let mut plain = password.as_bytes().to_vec();
    plain.push(0);
    for (i, b) in plain.iter_mut().enumerate() {
        *b ^= seed[i % seed.len()];
    }

    let pem = std::str::from_utf8(public_key_pem)
        .map_err(|e| auth_failure(format!("server public key is not PEM text: {e}")))?;
    let key = RsaPublicKey::from_public_key_pem(pem)
        .or_else(|_| RsaPublicKey::from_pkcs1_pem(pem))
        .map_err(|e| auth_failure(format!("cannot parse server public key: {e}")))?;

    let encrypted = if use_oaep {
        key.encrypt(&mut OsRng, rsa::Oaep::new::<Sha1>(), &plain)
    } else {
        key.encrypt(&mut OsRng, rsa::Pkcs1v15Encrypt, &plain)
    };
    encrypted.map_err(|e| auth_failure(format!("RSA encryption failed: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plugin_names_round_trip() {
        for plugin in [
            AuthPlugin::NativePassword,
            AuthPlugin::CachingSha2,
            AuthPlugin::Sha256,
            AuthPlugin::ClearPassword,
        ] {
            assert_eq!(AuthPlugin::from_name(plugin.name()), Some(plugin));
        }
        assert_eq!(AuthPlugin::from_name("dialog"), None);
    }

    #[test]
    fn empty_password_sends_empty_scramble() {
        assert!(scramble_native("", &[0; 20]).is_empty());
        assert!(scramble_caching_sha2("", &[0; 20]).is_empty());
        assert!(AuthPlugin::Sha256.initial_response("", &[0; 20]).is_empty());
    }

    #[test]
    fn native_scramble_is_deterministic() {
        let seed = [0u8; 20];
        let scramble = scramble_native("secret", &seed);
        assert_eq!(scramble.len(), 20);
        assert_eq!(scramble, scramble_native("secret", &seed));
        assert_ne!(scramble, scramble_native("other", &seed));
    }

    #[test]
    fn caching_sha2_ignores_trailing_nul() {
        let mut seed = vec![7u8; 20];
        let plain = scramble_caching_sha2("secret", &seed);
        seed.push(0);
        assert_eq!(plain.len(), 32);
        assert_eq!(plain, scramble_caching_sha2("secret", &seed));
    }

    #[test]
    fn clear_password_is_nul_terminated() {
        assert_eq!(
            AuthPlugin::ClearPassword.initial_response("pw", &[]),
            b"pw\0".to_vec()
        );
    }

    #[test]
    fn bad_public_key_is_an_authentication_error() {
        let err = encrypt_password("pw", &[1; 20], b"not a key", true).unwrap_err();
        assert!(err.is_authentication());
    }
}
