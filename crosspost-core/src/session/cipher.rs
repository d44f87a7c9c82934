use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;

use super::{SessionError, SessionResult};

const NONCE_LEN: usize = 12;

/// AES-256-GCM sealing for persisted session bytes. The nonce is prepended to
/// the ciphertext and the whole blob is base64 encoded.
#[derive(Clone)]
pub struct SessionCipher {
    cipher: Aes256Gcm,
}

impl std::fmt::Debug for SessionCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SessionCipher(..)")
    }
}

impl SessionCipher {
    pub fn new(key: &[u8]) -> SessionResult<Self> {
        if key.len() != 32 {
            return Err(SessionError::Key(format!(
                "expected 32 byte key, got {}",
                key.len()
            )));
        }
        let key = Key::<Aes256Gcm>::from_slice(key);
        Ok(Self {
            cipher: Aes256Gcm::new(key),
        })
    }

    pub fn from_base64(encoded: &str) -> SessionResult<Self> {
        let key = STANDARD
            .decode(encoded.trim())
            .map_err(|err| SessionError::Key(err.to_string()))?;
        Self::new(&key)
    }

    pub fn from_env(var: &str) -> SessionResult<Self> {
        let value = std::env::var(var)
            .map_err(|_| SessionError::Key(format!("environment variable {var} is not set")))?;
        Self::from_base64(&value)
    }

    pub fn seal(&self, plaintext: &[u8]) -> SessionResult<Vec<u8>> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext)
            .map_err(|err| SessionError::Key(format!("encryption failed: {err}")))?;
        let mut combined = nonce.to_vec();
        combined.extend_from_slice(&ciphertext);
        Ok(STANDARD.encode(combined).into_bytes())
    }

    /// `None` for anything that does not authenticate under this key.
    pub fn open(&self, sealed: &[u8]) -> Option<Vec<u8>> {
        let text = std::str::from_utf8(sealed).ok()?;
        let combined = STANDARD.decode(text.trim()).ok()?;
        if combined.len() <= NONCE_LEN {
            return None;
        }
        let (nonce, ciphertext) = combined.split_at(NONCE_LEN);
        self.cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tampered_blob_does_not_open() {
        let cipher = SessionCipher::new(&[7u8; 32]).unwrap();
        let sealed = cipher.seal(b"{\"cookies\":[]}").unwrap();
        assert_eq!(cipher.open(&sealed).unwrap(), b"{\"cookies\":[]}");

        let other = SessionCipher::new(&[9u8; 32]).unwrap();
        assert!(other.open(&sealed).is_none());
        assert!(cipher.open(b"{\"plain\":true}").is_none());
    }

    #[test]
    fn rejects_short_keys() {
        assert!(matches!(
            SessionCipher::new(&[1u8; 16]),
            Err(SessionError::Key(_))
        ));
    }
}
