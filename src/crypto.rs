//! Token vault for connection credentials.
//!
//! Access and refresh tokens are stored with AES-256-GCM. The additional
//! authenticated data binds each ciphertext to its connection row so a token
//! copied onto another connection fails to decrypt.

#![allow(deprecated)]

use aes_gcm::{
    Aes256Gcm, Key, Nonce,
    aead::{Aead, AeadCore, KeyInit, OsRng, Payload},
};
use thiserror::Error;
use uuid::Uuid;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::models::connection::Model as ConnectionModel;

const VERSION_ENCRYPTED: u8 = 0x01;
const VERSION_FIELD_LEN: usize = 1;
const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;
const MIN_ENCRYPTED_LEN: usize = VERSION_FIELD_LEN + NONCE_LEN + TAG_LEN;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("encryption failed: {0}")]
    EncryptionFailed(String),
    #[error("decryption failed: {0}")]
    DecryptionFailed(String),
    #[error("invalid ciphertext format")]
    InvalidFormat,
    #[error("empty ciphertext")]
    EmptyCiphertext,
    #[error("key must be 32 bytes, got {0}")]
    InvalidKeyLength(usize),
}

/// 256-bit key wiped from memory on drop
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct CryptoKey(Vec<u8>);

impl CryptoKey {
    pub fn new(bytes: Vec<u8>) -> Result<Self, CryptoError> {
        if bytes.len() != 32 {
            return Err(CryptoError::InvalidKeyLength(bytes.len()));
        }
        Ok(CryptoKey(bytes))
    }

    fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl std::fmt::Debug for CryptoKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("CryptoKey([REDACTED])")
    }
}

/// Decrypted tokens of one connection.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct TokenPair {
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
}

impl std::fmt::Debug for TokenPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenPair")
            .field("access_token", &self.access_token.as_ref().map(|_| "***"))
            .field("refresh_token", &self.refresh_token.as_ref().map(|_| "***"))
            .finish()
    }
}

/// Encrypts and decrypts connection tokens with a single key.
#[derive(Debug, Clone)]
pub struct TokenVault {
    key: CryptoKey,
}

impl TokenVault {
    pub fn new(key: CryptoKey) -> Self {
        Self { key }
    }

    /// Builds the vault from the raw configured key bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        Ok(Self::new(CryptoKey::new(bytes.to_vec())?))
    }

    /// Encrypts a token for the connection identified by the triple.
    pub fn seal(
        &self,
        connection_id: Uuid,
        provider: &str,
        user_id: Uuid,
        token: &str,
    ) -> Result<Vec<u8>, CryptoError> {
        let aad = connection_aad(connection_id, provider, user_id);
        encrypt_bytes(&self.key, aad.as_bytes(), token.as_bytes())
    }

    /// Decrypts both stored tokens of a connection row.
    pub fn open_tokens(&self, connection: &ConnectionModel) -> Result<TokenPair, CryptoError> {
        let aad = connection_aad(connection.id, &connection.provider, connection.user_id);
        Ok(TokenPair {
            access_token: self.open_field(&aad, connection.access_token_ciphertext.as_deref())?,
            refresh_token: self.open_field(&aad, connection.refresh_token_ciphertext.as_deref())?,
        })
    }

    fn open_field(&self, aad: &str, stored: Option<&[u8]>) -> Result<Option<String>, CryptoError> {
        let Some(stored) = stored else {
            return Ok(None);
        };
        let bytes = decrypt_bytes(&self.key, aad.as_bytes(), stored)?;
        String::from_utf8(bytes)
            .map(Some)
            .map_err(|e| CryptoError::DecryptionFailed(format!("Invalid UTF-8: {}", e)))
    }
}

fn connection_aad(connection_id: Uuid, provider: &str, user_id: Uuid) -> String {
    format!("{}|{}|{}", connection_id, provider, user_id)
}

/// Encrypt bytes using AES-256-GCM; output is `version | nonce | ciphertext+tag`.
pub fn encrypt_bytes(
    key: &CryptoKey,
    aad: &[u8],
    plaintext: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key.as_bytes()));
    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);

    let mut ciphertext = cipher
        .encrypt(
            &nonce,
            Payload {
                msg: plaintext,
                aad,
            },
        )
        .map_err(|e| CryptoError::EncryptionFailed(e.to_string()))?;

    let mut result = Vec::with_capacity(VERSION_FIELD_LEN + NONCE_LEN + ciphertext.len());
    result.push(VERSION_ENCRYPTED);
    result.extend_from_slice(&nonce);
    result.append(&mut ciphertext);

    Ok(result)
}

/// Decrypt bytes produced by [`encrypt_bytes`].
///
/// Payloads without the version marker predate encryption and are returned
/// unchanged.
pub fn decrypt_bytes(
    key: &CryptoKey,
    aad: &[u8],
    ciphertext: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    if ciphertext.is_empty() {
        return Err(CryptoError::EmptyCiphertext);
    }

    if ciphertext[0] != VERSION_ENCRYPTED {
        return Ok(ciphertext.to_vec());
    }

    if ciphertext.len() < MIN_ENCRYPTED_LEN {
        return Err(CryptoError::InvalidFormat);
    }

    let nonce = Nonce::from_slice(&ciphertext[VERSION_FIELD_LEN..VERSION_FIELD_LEN + NONCE_LEN]);
    let tag_and_ct = &ciphertext[VERSION_FIELD_LEN + NONCE_LEN..];
    debug_assert!(tag_and_ct.len() >= TAG_LEN);

    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key.as_bytes()));
    cipher
        .decrypt(
            nonce,
            Payload {
                msg: tag_and_ct,
                aad,
            },
        )
        .map_err(|e| CryptoError::DecryptionFailed(e.to_string()))
}

/// Determine if a payload is using the encrypted format
pub fn is_encrypted_payload(ciphertext: &[u8]) -> bool {
    ciphertext.len() >= MIN_ENCRYPTED_LEN && ciphertext[0] == VERSION_ENCRYPTED
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn vault() -> TokenVault {
        TokenVault::from_bytes(&[9u8; 32]).expect("valid test key")
    }

    fn connection(access: Option<Vec<u8>>, refresh: Option<Vec<u8>>) -> ConnectionModel {
        ConnectionModel {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            provider: "spotify".to_string(),
            provider_user_id: Some("user-1".to_string()),
            status: "connected".to_string(),
            access_token_ciphertext: access,
            refresh_token_ciphertext: refresh,
            expires_at: None,
            scope: None,
            can_read: true,
            can_write: true,
            can_export: false,
            last_used_at: None,
            created_at: Utc::now().into(),
            updated_at: Utc::now().into(),
        }
    }

    #[test]
    fn sealed_tokens_open_on_same_connection() {
        let vault = vault();
        let mut conn = connection(None, None);
        conn.access_token_ciphertext = Some(
            vault
                .seal(conn.id, &conn.provider, conn.user_id, "access-abc")
                .unwrap(),
        );
        conn.refresh_token_ciphertext = Some(
            vault
                .seal(conn.id, &conn.provider, conn.user_id, "refresh-xyz")
                .unwrap(),
        );

        let tokens = vault.open_tokens(&conn).unwrap();
        assert_eq!(tokens.access_token.as_deref(), Some("access-abc"));
        assert_eq!(tokens.refresh_token.as_deref(), Some("refresh-xyz"));
    }

    #[test]
    fn token_moved_to_other_connection_fails() {
        let vault = vault();
        let original = connection(None, None);
        let sealed = vault
            .seal(original.id, &original.provider, original.user_id, "secret")
            .unwrap();

        let other = connection(Some(sealed), None);
        assert!(matches!(
            vault.open_tokens(&other),
            Err(CryptoError::DecryptionFailed(_))
        ));
    }

    #[test]
    fn tampered_ciphertext_fails() {
        let key = CryptoKey::new(vec![0u8; 32]).unwrap();
        let mut encrypted = encrypt_bytes(&key, b"aad", b"secret").unwrap();
        encrypted[13] ^= 0x01;

        assert!(decrypt_bytes(&key, b"aad", &encrypted).is_err());
    }

    #[test]
    fn legacy_plaintext_is_passed_through() {
        let vault = vault();
        let conn = connection(Some(b"plain-access".to_vec()), None);

        let tokens = vault.open_tokens(&conn).unwrap();
        assert_eq!(tokens.access_token.as_deref(), Some("plain-access"));
        assert_eq!(tokens.refresh_token, None);
        assert!(!is_encrypted_payload(b"plain-access"));
    }

    #[test]
    fn nonces_differ_between_encryptions() {
        let key = CryptoKey::new(vec![0u8; 32]).unwrap();
        let a = encrypt_bytes(&key, b"aad", b"same").unwrap();
        let b = encrypt_bytes(&key, b"aad", b"same").unwrap();
        assert_ne!(&a[1..13], &b[1..13]);
        assert!(is_encrypted_payload(&a));
    }

    #[test]
    fn truncated_payload_is_invalid() {
        let key = CryptoKey::new(vec![0u8; 32]).unwrap();
        let result = decrypt_bytes(&key, b"aad", &[VERSION_ENCRYPTED, 0x02]);
        assert!(matches!(result, Err(CryptoError::InvalidFormat)));
    }

    #[test]
    fn key_length_is_enforced() {
        assert!(matches!(
            CryptoKey::new(vec![0u8; 16]),
            Err(CryptoError::InvalidKeyLength(16))
        ));
    }

    #[test]
    fn debug_output_hides_tokens() {
        let pair = TokenPair {
            access_token: Some("very-secret".to_string()),
            refresh_token: None,
        };
        assert!(!format!("{:?}", pair).contains("very-secret"));
    }
}
