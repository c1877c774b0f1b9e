use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};

use crate::error::{PixeError, Result};

pub const SALT_LEN: usize = 32;
pub const NONCE_LEN: usize = 12;
pub const TAG_LEN: usize = 16;

const PASSWORD_CHARSET: &[u8] =
    b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789!@#$%^&*";

/// Password-based AES-256-GCM over arbitrary buffers. Stateless; safe to
/// share across concurrent encode and decode pipelines.
#[derive(Debug, Clone)]
pub struct EncryptionService {
    iterations: u32,
}

impl Default for EncryptionService {
    fn default() -> Self {
        Self {
            iterations: 100_000,
        }
    }
}

impl EncryptionService {
    pub fn new(iterations: u32) -> Self {
        Self { iterations }
    }

    /// Output layout: `salt(32) || nonce(12) || ciphertext || tag(16)`.
    /// The iteration count is not stored in the envelope; decoders must be
    /// configured with the count the artifact was written with.
    pub fn encrypt(&self, plaintext: &[u8], password: &str) -> Result<Vec<u8>> {
        if password.is_empty() {
            return Err(PixeError::EmptyPassword);
        }

        let mut salt = [0u8; SALT_LEN];
        OsRng.fill_bytes(&mut salt);
        let key = self.derive_key(password, &salt);

        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key));
        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);

        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|_| PixeError::Encryption("aead seal failed".to_string()))?;

        let mut out = Vec::with_capacity(SALT_LEN + NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&salt);
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    pub fn decrypt(&self, encrypted: &[u8], password: &str) -> Result<Vec<u8>> {
        if password.is_empty() {
            return Err(PixeError::EmptyPassword);
        }
        if encrypted.len() < SALT_LEN + NONCE_LEN + TAG_LEN {
            return Err(PixeError::ShortCiphertext {
                len: encrypted.len(),
            });
        }

        let salt = &encrypted[..SALT_LEN];
        let nonce = &encrypted[SALT_LEN..SALT_LEN + NONCE_LEN];
        let ciphertext = &encrypted[SALT_LEN + NONCE_LEN..];

        let key = self.derive_key(password, salt);
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key));
        cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| PixeError::AuthenticationFailed)
    }

    fn derive_key(&self, password: &str, salt: &[u8]) -> [u8; 32] {
        let mut key = [0u8; 32];
        pbkdf2::pbkdf2_hmac::<Sha256>(password.as_bytes(), salt, self.iterations, &mut key);
        key
    }
}

/// Uniform draw from the 70-character password alphabet, rejection-sampled
/// to avoid modulo bias.
pub fn random_password(length: usize) -> String {
    let charset_len = PASSWORD_CHARSET.len() as u16; // 70
    let limit = (256 / charset_len) * charset_len; // 210
    let mut out = String::with_capacity(length);
    let mut buf = [0u8; 64];
    while out.len() < length {
        OsRng.fill_bytes(&mut buf);
        for byte in buf {
            if (byte as u16) < limit {
                out.push(PASSWORD_CHARSET[(byte as u16 % charset_len) as usize] as char);
                if out.len() == length {
                    break;
                }
            }
        }
    }
    out
}

/// SHA-256 hex of the password, for out-of-band verification only.
pub fn password_fingerprint(password: &str) -> String {
    hex::encode(Sha256::digest(password.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip() {
        let svc = EncryptionService::new(1000);
        let plaintext = b"attack at dawn";
        let encrypted = svc.encrypt(plaintext, "hunter2").unwrap();
        assert_eq!(
            encrypted.len(),
            plaintext.len() + SALT_LEN + NONCE_LEN + TAG_LEN
        );
        assert_eq!(svc.decrypt(&encrypted, "hunter2").unwrap(), plaintext);
    }

    #[test]
    fn wrong_password_fails_authentication() {
        let svc = EncryptionService::new(1000);
        let encrypted = svc.encrypt(b"secret", "right").unwrap();
        assert!(matches!(
            svc.decrypt(&encrypted, "wrong"),
            Err(PixeError::AuthenticationFailed)
        ));
    }

    #[test]
    fn tampered_byte_fails_authentication() {
        let svc = EncryptionService::new(1000);
        let mut encrypted = svc.encrypt(b"secret payload", "pw").unwrap();
        let last = encrypted.len() - 1;
        encrypted[last] ^= 0x01;
        assert!(matches!(
            svc.decrypt(&encrypted, "pw"),
            Err(PixeError::AuthenticationFailed)
        ));
    }

    #[test]
    fn short_buffer_is_rejected() {
        let svc = EncryptionService::default();
        assert!(matches!(
            svc.decrypt(&[0u8; 59], "pw"),
            Err(PixeError::ShortCiphertext { len: 59 })
        ));
    }

    #[test]
    fn empty_password_is_rejected() {
        let svc = EncryptionService::default();
        assert!(matches!(
            svc.encrypt(b"data", ""),
            Err(PixeError::EmptyPassword)
        ));
        assert!(matches!(
            svc.decrypt(&[0u8; 64], ""),
            Err(PixeError::EmptyPassword)
        ));
    }

    #[test]
    fn random_password_uses_charset() {
        let pw = random_password(64);
        assert_eq!(pw.len(), 64);
        assert!(pw.bytes().all(|b| PASSWORD_CHARSET.contains(&b)));
    }

    #[test]
    fn fingerprint_is_stable_hex() {
        let fp = password_fingerprint("correct horse");
        assert_eq!(fp.len(), 64);
        assert_eq!(fp, password_fingerprint("correct horse"));
        assert_ne!(fp, password_fingerprint("battery staple"));
    }
}
