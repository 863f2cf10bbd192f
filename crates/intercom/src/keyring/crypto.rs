use crate::config::KdfConfig;
use aes_gcm::{
    aead::{Aead as _, KeyInit as _},
    Aes256Gcm, Nonce,
};
use argon2::{Algorithm, Argon2, Params, Version};
use base64::Engine as _;
use ed25519_dalek::SigningKey;
use eyre::Context as _;
use hkdf::Hkdf;
use rand::Rng as _;
use secrecy::{ExposeSecret as _, SecretString};
use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};
use zeroize::Zeroizing;

const B64: base64::engine::GeneralPurpose = base64::engine::general_purpose::STANDARD;

/// Versioned AES-256-GCM ciphertext as stored in the vault.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CryptoBox {
    pub v: u8,
    pub nonce_b64: String,
    pub ct_b64: String,
}

pub fn random_salt16() -> [u8; 16] {
    let mut s = [0_u8; 16];
    rand::rng().fill_bytes(&mut s);
    s
}

/// Stretch a password into a 32-byte encryption key with argon2id.
pub fn derive_password_key(
    password: &SecretString,
    salt16: &[u8; 16],
    kdf: KdfConfig,
) -> eyre::Result<Zeroizing<[u8; 32]>> {
    let params = Params::new(kdf.memory_kib, kdf.iterations, 1, Some(32))
        .map_err(|e| eyre::eyre!("argon2 params: {e}"))?;
    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);
    let mut out = Zeroizing::new([0_u8; 32]);
    argon2
        .hash_password_into(password.expose_secret().as_bytes(), salt16, &mut *out)
        .map_err(|e| eyre::eyre!("argon2 hash: {e}"))?;
    Ok(out)
}

/// Deterministic ed25519 key for account `index` of a BIP-39 seed.
pub fn derive_account_key(seed: &[u8; 64], index: u32) -> eyre::Result<SigningKey> {
    let hk = Hkdf::<Sha256>::new(None, seed);
    let info = format!("intercom:account:{index}");
    let mut out = Zeroizing::new([0_u8; 32]);
    hk.expand(info.as_bytes(), &mut *out)
        .map_err(|e| eyre::eyre!("hkdf expand: {e}"))?;
    Ok(SigningKey::from_bytes(&out))
}

/// Short, stable identifier for a public key: `ed` + first 20 bytes of its SHA-256, in hex.
pub fn address_for(public_key: &[u8; 32]) -> String {
    let digest = Sha256::digest(public_key);
    let prefix = digest.get(..20).unwrap_or_default();
    format!("ed{}", hex::encode(prefix))
}

pub fn encrypt_aes_gcm(key32: &[u8; 32], plaintext: &[u8]) -> eyre::Result<CryptoBox> {
    let cipher = Aes256Gcm::new_from_slice(key32).context("aes init")?;
    let mut nonce = [0_u8; 12];
    rand::rng().fill_bytes(&mut nonce);
    let ct = cipher
        .encrypt(Nonce::from_slice(&nonce), plaintext)
        .map_err(|e| eyre::eyre!("aes encrypt: {e}"))?;

    Ok(CryptoBox {
        v: 1,
        nonce_b64: B64.encode(nonce),
        ct_b64: B64.encode(ct),
    })
}

pub fn decrypt_aes_gcm(key32: &[u8; 32], b: &CryptoBox) -> eyre::Result<Zeroizing<Vec<u8>>> {
    if b.v != 1 {
        eyre::bail!("unsupported CryptoBox version: {}", b.v);
    }
    let cipher = Aes256Gcm::new_from_slice(key32).context("aes init")?;
    let nonce = B64.decode(&b.nonce_b64).context("decode nonce")?;
    if nonce.len() != 12 {
        eyre::bail!("invalid nonce length");
    }
    let ct = B64.decode(&b.ct_b64).context("decode ciphertext")?;
    let pt = cipher
        .decrypt(Nonce::from_slice(&nonce), ct.as_ref())
        .map_err(|e| eyre::eyre!("aes decrypt: {e}"))?;
    Ok(Zeroizing::new(pt))
}
