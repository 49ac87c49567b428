//! AES-256-GCM envelope encryption for tenant OAuth credentials.
//!
//! Every ciphertext is bound to the tenant name via AEAD associated data:
//! decrypting with the wrong tenant name fails authentication rather than
//! silently returning garbage. This is what prevents a ciphertext swap
//! across tenants in a compromised store from ever producing plaintext.

mod error;

use aes_gcm::{
    Aes256Gcm, Key, Nonce,
    aead::{Aead, KeyInit, OsRng, rand_core::RngCore},
};
use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use common::Secret;

pub use error::{Error, Result};

/// Current envelope scheme version. Bump when the wire format changes so
/// old ciphertexts can still be read during a key-rotation window.
const SCHEME_VERSION: u8 = 1;

const NONCE_LEN: usize = 12;
const KEY_LEN: usize = 32;

/// Envelope-encrypts and decrypts tenant secrets with a single process-wide key.
pub struct EncryptionService {
    key: Secret<[u8; KEY_LEN]>,
}

impl EncryptionService {
    /// Builds a service from a raw 32-byte key.
    pub fn new(key_bytes: [u8; KEY_LEN]) -> Self {
        Self { key: Secret::new(key_bytes) }
    }

    /// Builds a service from arbitrary-length bytes, validating the length.
    pub fn from_slice(key_bytes: &[u8]) -> Result<Self> {
        let key: [u8; KEY_LEN] =
            key_bytes.try_into().map_err(|_| Error::InvalidKeyLength(key_bytes.len()))?;
        Ok(Self::new(key))
    }

    /// Seals `plaintext`, binding the ciphertext to `tenant_name`.
    ///
    /// Output is `base64(version_byte || nonce || ciphertext_with_tag)`.
    pub fn encrypt(&self, plaintext: &str, tenant_name: &str) -> Result<String> {
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(self.key.expose()));

        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let sealed = cipher
            .encrypt(nonce, aes_gcm::aead::Payload { msg: plaintext.as_bytes(), aad: tenant_name.as_bytes() })
            .map_err(|_| Error::DecryptError)?;

        let mut out = Vec::with_capacity(1 + NONCE_LEN + sealed.len());
        out.push(SCHEME_VERSION);
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&sealed);

        Ok(BASE64.encode(out))
    }

    /// Opens a ciphertext produced by [`Self::encrypt`], verifying it was
    /// sealed for `tenant_name`.
    pub fn decrypt(&self, ciphertext: &str, tenant_name: &str) -> Result<String> {
        let raw = BASE64.decode(ciphertext).map_err(|_| Error::MalformedCiphertext)?;

        if raw.len() < 1 + NONCE_LEN {
            return Err(Error::Truncated);
        }

        let version = raw[0];
        if version != SCHEME_VERSION {
            return Err(Error::UnknownVersion(version));
        }

        let nonce = Nonce::from_slice(&raw[1..1 + NONCE_LEN]);
        let sealed = &raw[1 + NONCE_LEN..];

        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(self.key.expose()));
        let plaintext = cipher
            .decrypt(nonce, aes_gcm::aead::Payload { msg: sealed, aad: tenant_name.as_bytes() })
            .map_err(|_| Error::DecryptError)?;

        String::from_utf8(plaintext).map_err(|_| Error::DecryptError)
    }
}
