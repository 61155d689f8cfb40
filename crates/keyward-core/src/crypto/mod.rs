use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use rand::RngCore;
use rand::rngs::OsRng;

use crate::error::{KeywardError, Result};

/// AES-256-GCM nonce length in bytes.
pub const NONCE_LEN: usize = 12;

/// Encrypt `data` with AES-256-GCM under a caller-supplied AAD.
///
/// - Nonce: 12 random bytes from OsRng, prepended to the ciphertext
/// - Output layout: `nonce (12) || ciphertext`
pub fn seal(data: &[u8], key: &[u8; 32], aad: &[u8]) -> Result<Vec<u8>> {
    let cipher = Aes256Gcm::new_from_slice(key)
        .map_err(|e| KeywardError::Encryption(format!("Invalid key: {e}")))?;

    let mut nonce_bytes = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(nonce, aes_gcm::aead::Payload { msg: data, aad })
        .map_err(|e| KeywardError::Encryption(format!("Encryption failed: {e}")))?;

    let mut output = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    output.extend_from_slice(&nonce_bytes);
    output.extend_from_slice(&ciphertext);
    Ok(output)
}

/// Decrypt a `nonce || ciphertext` blob produced by [`seal`], verifying AAD.
pub fn open(blob: &[u8], key: &[u8; 32], aad: &[u8]) -> Result<Vec<u8>> {
    if blob.len() < NONCE_LEN {
        return Err(KeywardError::Decryption("Ciphertext too short".to_string()));
    }
    let (nonce_bytes, ciphertext) = blob.split_at(NONCE_LEN);

    let cipher = Aes256Gcm::new_from_slice(key)
        .map_err(|e| KeywardError::Decryption(format!("Invalid key: {e}")))?;

    let nonce = Nonce::from_slice(nonce_bytes);

    cipher
        .decrypt(
            nonce,
            aes_gcm::aead::Payload {
                msg: ciphertext,
                aad,
            },
        )
        .map_err(|e| KeywardError::Decryption(format!("Decryption failed: {e}")))
}
