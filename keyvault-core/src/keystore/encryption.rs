//! Authenticated encryption and decryption under AES-256 keys.
//!
//! Two payload framings exist and are never mixed for one alias:
//!
//! * **GCM** (preferred): `random_iv(12) || ciphertext_with_appended_tag`.
//!   A fresh random IV is generated on every call; the 128-bit tag
//!   authenticates the ciphertext.
//! * **Legacy CBC** (`AES/CBC/PKCS7`, not authenticated): `random_iv(16) ||
//!   ciphertext`. Plaintext is processed in fixed-size chunks so memory use
//!   stays independent of payload size; the final chunk carries the padding.
//!
//! Which framing a key uses is fixed at key creation by the platform
//! backend. Data framed one way is rejected when decrypted the other way.

use std::sync::Arc;

use aes::cipher::generic_array::GenericArray;
use aes::cipher::BlockDecryptMut;
use aes::cipher::BlockEncryptMut;
use aes::cipher::KeyIvInit;
use aes::Aes256;
use aes_gcm::aead::Aead;
use aes_gcm::aead::KeyInit;
use aes_gcm::Aes256Gcm;
use rand::rngs::OsRng;
use rand::RngCore;
use tracing::debug;

use crate::alias::alias;
use crate::alias::KeyAlias;
use crate::alias::KeyKind;
use crate::error::KeyStoreError;
use crate::policy::HardwareBackingPolicy;
use crate::security_level::SecurityLevel;
use crate::task;

use super::clean_kind;
use super::create_validated;
use super::ensure_exists;
use super::ensure_unlocked;
use super::EncryptionKeyBridge;

/// Size of the random IV prefixed to GCM-framed payloads.
pub const GCM_IV_LEN: usize = 12;
/// Size of the GCM authentication tag appended to the ciphertext.
pub const GCM_TAG_LEN: usize = 16;
/// Size of the random IV prefixed to legacy CBC-framed payloads.
pub const CBC_IV_LEN: usize = 16;
/// AES block size, which CBC ciphertext lengths are a multiple of.
pub const CBC_BLOCK_LEN: usize = 16;
/// Chunk size the legacy mode streams plaintext and ciphertext in.
pub const CHUNK_SIZE: usize = 1024;

type CbcEncryptor = cbc::Encryptor<Aes256>;
type CbcDecryptor = cbc::Decryptor<Aes256>;

/// The payload framing an encryption key was created with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncryptionMode {
    /// AES-256-GCM with a 128-bit tag.
    Gcm,
    /// AES-256-CBC with PKCS7 padding and chunked streaming. Not
    /// authenticated; only for platforms without efficient GCM streaming.
    LegacyCbc,
}

/// Encrypts `plaintext` in GCM framing with a fresh random IV.
pub(crate) fn seal_gcm(key: &[u8; 32], plaintext: &[u8]) -> Result<Vec<u8>, KeyStoreError> {
    let cipher = Aes256Gcm::new(GenericArray::from_slice(key));

    let mut iv = [0_u8; GCM_IV_LEN];
    OsRng.fill_bytes(&mut iv);

    let ciphertext = cipher
        .encrypt(GenericArray::from_slice(&iv), plaintext)
        .map_err(|_| KeyStoreError::encrypt("AES-GCM encryption failed"))?;

    let mut payload = Vec::with_capacity(GCM_IV_LEN + ciphertext.len());
    payload.extend_from_slice(&iv);
    payload.extend_from_slice(&ciphertext);

    Ok(payload)
}

/// Decrypts and authenticates a GCM-framed payload.
pub(crate) fn open_gcm(key: &[u8; 32], payload: &[u8]) -> Result<Vec<u8>, KeyStoreError> {
    if payload.len() < GCM_IV_LEN + GCM_TAG_LEN {
        return Err(KeyStoreError::decrypt(format!(
            "ciphertext of {} bytes is shorter than IV plus tag",
            payload.len()
        )));
    }

    let (iv, ciphertext) = payload.split_at(GCM_IV_LEN);
    let cipher = Aes256Gcm::new(GenericArray::from_slice(key));

    cipher
        .decrypt(GenericArray::from_slice(iv), ciphertext)
        .map_err(|_| KeyStoreError::decrypt("authentication failed: tag mismatch or wrong key"))
}

/// Encrypts `plaintext` in legacy CBC framing, streaming in fixed chunks.
pub(crate) fn seal_cbc_chunked(key: &[u8; 32], plaintext: &[u8]) -> Result<Vec<u8>, KeyStoreError> {
    let mut iv = [0_u8; CBC_IV_LEN];
    OsRng.fill_bytes(&mut iv);

    let mut encryptor =
        CbcEncryptor::new(GenericArray::from_slice(key), GenericArray::from_slice(&iv));

    let mut payload = Vec::with_capacity(CBC_IV_LEN + plaintext.len() + CBC_BLOCK_LEN);
    payload.extend_from_slice(&iv);

    // Full chunks stream through the cipher state; only the final, possibly
    // empty remainder is padded and sealed.
    let mut chunks = plaintext.chunks_exact(CHUNK_SIZE);
    let mut buffer = [0_u8; CHUNK_SIZE];
    for chunk in chunks.by_ref() {
        buffer.copy_from_slice(chunk);
        encrypt_blocks_in_place(&mut encryptor, &mut buffer);
        payload.extend_from_slice(&buffer);
    }

    let remainder = chunks.remainder();
    let pad_len = CBC_BLOCK_LEN - remainder.len() % CBC_BLOCK_LEN;
    let pad_byte = u8::try_from(pad_len).expect("PKCS7 padding fits in one byte");
    let mut last = Vec::with_capacity(remainder.len() + pad_len);
    last.extend_from_slice(remainder);
    last.resize(remainder.len() + pad_len, pad_byte);
    encrypt_blocks_in_place(&mut encryptor, &mut last);
    payload.extend_from_slice(&last);

    Ok(payload)
}

/// Decrypts a legacy CBC-framed payload, validating the PKCS7 padding.
pub(crate) fn open_cbc_chunked(key: &[u8; 32], payload: &[u8]) -> Result<Vec<u8>, KeyStoreError> {
    if payload.len() < CBC_IV_LEN + CBC_BLOCK_LEN {
        return Err(KeyStoreError::decrypt(format!(
            "ciphertext of {} bytes is shorter than IV plus one block",
            payload.len()
        )));
    }

    let (iv, ciphertext) = payload.split_at(CBC_IV_LEN);
    if ciphertext.len() % CBC_BLOCK_LEN != 0 {
        return Err(KeyStoreError::decrypt(
            "ciphertext length is not a multiple of the cipher block size",
        ));
    }

    let mut decryptor =
        CbcDecryptor::new(GenericArray::from_slice(key), GenericArray::from_slice(iv));

    let mut plaintext = Vec::with_capacity(ciphertext.len());
    for chunk in ciphertext.chunks(CHUNK_SIZE) {
        let mut buffer = chunk.to_vec();
        decrypt_blocks_in_place(&mut decryptor, &mut buffer);
        plaintext.extend_from_slice(&buffer);
    }

    let pad_byte = *plaintext.last().expect("length checked above");
    let pad_len = usize::from(pad_byte);
    if pad_len == 0 || pad_len > CBC_BLOCK_LEN || pad_len > plaintext.len() {
        return Err(KeyStoreError::decrypt("invalid PKCS7 padding"));
    }
    if !plaintext[plaintext.len() - pad_len..]
        .iter()
        .all(|&byte| byte == pad_byte)
    {
        return Err(KeyStoreError::decrypt("invalid PKCS7 padding"));
    }
    plaintext.truncate(plaintext.len() - pad_len);

    Ok(plaintext)
}

fn encrypt_blocks_in_place(encryptor: &mut CbcEncryptor, data: &mut [u8]) {
    for block in data.chunks_exact_mut(CBC_BLOCK_LEN) {
        encryptor.encrypt_block_mut(GenericArray::from_mut_slice(block));
    }
}

fn decrypt_blocks_in_place(decryptor: &mut CbcDecryptor, data: &mut [u8]) {
    for block in data.chunks_exact_mut(CBC_BLOCK_LEN) {
        decryptor.decrypt_block_mut(GenericArray::from_mut_slice(block));
    }
}

/// Identifier-keyed lifecycle and operations for hardware encryption keys.
#[derive(Debug)]
pub struct EncryptionKeyService<B> {
    bridge: Arc<B>,
    policy: HardwareBackingPolicy,
}

impl<B> EncryptionKeyService<B>
where
    B: EncryptionKeyBridge + 'static,
{
    /// Creates a service over the given platform bridge.
    pub const fn new(bridge: Arc<B>, policy: HardwareBackingPolicy) -> Self {
        Self { bridge, policy }
    }

    /// Returns a handle for the encryption key named by `identifier`,
    /// creating an AES-256 key inside secure hardware if none exists yet.
    ///
    /// # Errors
    ///
    /// Returns [`KeyStoreError::DeviceLocked`] while the device is locked,
    /// [`KeyStoreError::CreateKey`] on generation failure and
    /// [`KeyStoreError::MissingHardware`] if hardware-backing validation
    /// rejects the new key.
    pub async fn get_or_create(
        &self,
        identifier: &str,
    ) -> Result<EncryptionKeyHandle<B>, KeyStoreError> {
        let key_alias = alias(KeyKind::Encryption, identifier);
        debug!(alias = %key_alias, "resolving encryption key");

        let bridge = Arc::clone(&self.bridge);
        let policy = self.policy;
        let task_alias = key_alias.clone();
        task::blocking(move || {
            ensure_unlocked(bridge.as_ref())?;

            if !bridge.key_exists(&task_alias)? {
                create_validated(bridge.as_ref(), &task_alias, policy, |bridge, alias| {
                    bridge.generate_encryption_key(alias)
                })?;
            }

            Ok::<_, KeyStoreError>(())
        })
        .await?;

        Ok(EncryptionKeyHandle {
            bridge: Arc::clone(&self.bridge),
            alias: key_alias,
        })
    }

    /// Encrypts `plaintext` under an existing key. Repeated encryptions of
    /// the same plaintext produce different payloads because a fresh IV is
    /// drawn on every call.
    ///
    /// # Errors
    ///
    /// Returns [`KeyStoreError::FetchKey`] if no key exists under the
    /// identifier or [`KeyStoreError::Encrypt`] on cipher failure.
    pub async fn encrypt(&self, identifier: &str, plaintext: &[u8]) -> Result<Vec<u8>, KeyStoreError> {
        self.resolve(identifier).await?.encrypt(plaintext).await
    }

    /// Decrypts a payload produced by [`Self::encrypt`] for the same alias.
    ///
    /// # Errors
    ///
    /// Returns [`KeyStoreError::Decrypt`] if the payload was tampered with,
    /// framed for a different mode, or produced under a key that has since
    /// been deleted and re-created.
    pub async fn decrypt(
        &self,
        identifier: &str,
        ciphertext: &[u8],
    ) -> Result<Vec<u8>, KeyStoreError> {
        self.resolve(identifier).await?.decrypt(ciphertext).await
    }

    /// Removes the encryption key named by `identifier`, if present.
    ///
    /// # Errors
    ///
    /// Returns [`KeyStoreError::Delete`] if an existing entry cannot be
    /// removed.
    pub async fn delete(&self, identifier: &str) -> Result<(), KeyStoreError> {
        let key_alias = alias(KeyKind::Encryption, identifier);
        let bridge = Arc::clone(&self.bridge);
        task::blocking(move || bridge.delete(&key_alias)).await
    }

    /// Removes every encryption key, leaving other kinds untouched.
    ///
    /// # Errors
    ///
    /// Returns [`KeyStoreError::Delete`] if an entry cannot be removed.
    pub async fn clean(&self) -> Result<(), KeyStoreError> {
        let bridge = Arc::clone(&self.bridge);
        task::blocking(move || clean_kind(bridge.as_ref(), KeyKind::Encryption)).await
    }

    async fn resolve(&self, identifier: &str) -> Result<EncryptionKeyHandle<B>, KeyStoreError> {
        let key_alias = alias(KeyKind::Encryption, identifier);

        let bridge = Arc::clone(&self.bridge);
        let task_alias = key_alias.clone();
        task::blocking(move || ensure_exists(bridge.as_ref(), &task_alias)).await?;

        Ok(EncryptionKeyHandle {
            bridge: Arc::clone(&self.bridge),
            alias: key_alias,
        })
    }
}

/// One encryption key resident in secure hardware.
#[derive(Debug)]
pub struct EncryptionKeyHandle<B> {
    bridge: Arc<B>,
    alias: KeyAlias,
}

impl<B> EncryptionKeyHandle<B>
where
    B: EncryptionKeyBridge + 'static,
{
    /// The storage alias this handle refers to.
    #[must_use]
    pub const fn alias(&self) -> &KeyAlias {
        &self.alias
    }

    /// Encrypts `plaintext` under this key with a fresh IV.
    ///
    /// # Errors
    ///
    /// Returns [`KeyStoreError::Encrypt`] on cipher failure.
    pub async fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, KeyStoreError> {
        let bridge = Arc::clone(&self.bridge);
        let alias = self.alias.clone();
        let plaintext = plaintext.to_vec();
        task::blocking(move || bridge.encrypt(&alias, &plaintext)).await
    }

    /// Decrypts a payload produced under this key.
    ///
    /// # Errors
    ///
    /// Returns [`KeyStoreError::Decrypt`] on tampering or key mismatch.
    pub async fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, KeyStoreError> {
        let bridge = Arc::clone(&self.bridge);
        let alias = self.alias.clone();
        let ciphertext = ciphertext.to_vec();
        task::blocking(move || bridge.decrypt(&alias, &ciphertext)).await
    }

    /// The security level the platform currently reports for this key.
    ///
    /// # Errors
    ///
    /// Returns [`KeyStoreError::FetchKey`] if the key no longer exists.
    pub async fn security_level(&self) -> Result<SecurityLevel, KeyStoreError> {
        let bridge = Arc::clone(&self.bridge);
        let alias = self.alias.clone();
        task::blocking(move || bridge.security_level(&alias)).await
    }

    /// Removes the key from the store, consuming the handle.
    ///
    /// # Errors
    ///
    /// Returns [`KeyStoreError::Delete`] if the entry cannot be removed.
    pub async fn delete(self) -> Result<(), KeyStoreError> {
        let bridge = Arc::clone(&self.bridge);
        let alias = self.alias;
        task::blocking(move || bridge.delete(&alias)).await
    }
}
