//! Encrypted mnemonic vault and the accounts derived from it.
//!
//! The mnemonic is the only secret at rest, encrypted under an argon2id-stretched password
//! key. Account metadata (names, public keys) is stored in the clear so the locked wallet
//! can still be described.

pub mod crypto;

use crate::{
    config::KdfConfig,
    errors::IntercomError,
    storage::{migrations::Migration, KvStore, Storage},
};
use base64::Engine as _;
use bip39::{Language, Mnemonic};
use chrono::{DateTime, Utc};
use crypto::CryptoBox;
use ed25519_dalek::{Signer as _, SigningKey};
use eyre::Context as _;
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::info;
use zeroize::Zeroizing;

pub const KEY_SALT: &str = "vault_salt";
pub const KEY_KDF: &str = "vault_kdf";
pub const KEY_MNEMONIC: &str = "vault_mnemonic";
pub const KEY_ACCOUNTS: &str = "vault_accounts";
/// Where account metadata lived before it moved under [`KEY_ACCOUNTS`].
const LEGACY_KEY_ACCOUNTS: &str = "accounts";

/// Every key the vault migrations may read or write.
pub const VAULT_KEYS: [&str; 5] = [
    KEY_SALT,
    KEY_KDF,
    KEY_MNEMONIC,
    KEY_ACCOUNTS,
    LEGACY_KEY_ACCOUNTS,
];

const MNEMONIC_WORDS: usize = 12;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub index: u32,
    pub name: String,
    pub address: String,
    pub public_key: String,
    pub created_at: DateTime<Utc>,
}

fn move_legacy_accounts(data: &mut Map<String, Value>) -> eyre::Result<()> {
    if let Some(v) = data.remove(LEGACY_KEY_ACCOUNTS) {
        if !data.contains_key(KEY_ACCOUNTS) {
            data.insert(KEY_ACCOUNTS.to_owned(), v);
        }
    }
    Ok(())
}

/// Vaults written before KDF parameters were recorded used the built-in defaults.
fn record_legacy_kdf(data: &mut Map<String, Value>) -> eyre::Result<()> {
    if data.contains_key(KEY_SALT) && !data.contains_key(KEY_KDF) {
        let v = serde_json::to_value(KdfConfig::default()).context("encode kdf params")?;
        data.insert(KEY_KDF.to_owned(), v);
    }
    Ok(())
}

pub const MIGRATIONS: [Migration<Map<String, Value>>; 2] = [
    Migration {
        name: "0001_move_legacy_accounts",
        up: move_legacy_accounts,
    },
    Migration {
        name: "0002_record_kdf_params",
        up: record_legacy_kdf,
    },
];

/// Decrypted vault material, held only while the session is unlocked.
pub struct UnlockedVault {
    seed: Zeroizing<[u8; 64]>,
}

impl std::fmt::Debug for UnlockedVault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("UnlockedVault(..)")
    }
}

impl UnlockedVault {
    fn from_mnemonic(m: &Mnemonic) -> Self {
        Self {
            seed: Zeroizing::new(m.to_seed_normalized("")),
        }
    }

    pub fn signing_key(&self, index: u32) -> eyre::Result<SigningKey> {
        crypto::derive_account_key(&self.seed, index)
    }

    pub fn sign(&self, index: u32, message: &[u8]) -> eyre::Result<[u8; 64]> {
        Ok(self.signing_key(index)?.sign(message).to_bytes())
    }

    fn account(&self, index: u32, name: String) -> eyre::Result<Account> {
        let public = self.signing_key(index)?.verifying_key().to_bytes();
        Ok(Account {
            index,
            name,
            address: crypto::address_for(&public),
            public_key: hex::encode(public),
            created_at: Utc::now(),
        })
    }
}

#[derive(Debug)]
pub struct Keyring<S> {
    storage: Storage<S>,
    kdf: KdfConfig,
}

impl<S: KvStore> Keyring<S> {
    pub const fn new(storage: Storage<S>, kdf: KdfConfig) -> Self {
        Self { storage, kdf }
    }

    pub async fn migrate(&self) -> eyre::Result<()> {
        let fresh = self.storage.run_migrations(&VAULT_KEYS, &MIGRATIONS).await?;
        if !fresh.is_empty() {
            info!(count = fresh.len(), "vault storage migrated");
        }
        Ok(())
    }

    pub async fn is_initialized(&self) -> eyre::Result<bool> {
        Ok(self
            .storage
            .fetch::<CryptoBox>(KEY_MNEMONIC)
            .await?
            .is_some())
    }

    pub async fn accounts(&self) -> eyre::Result<Vec<Account>> {
        Ok(self.storage.fetch(KEY_ACCOUNTS).await?.unwrap_or_default())
    }

    pub async fn find_account(&self, address: &str) -> eyre::Result<Account> {
        self.accounts()
            .await?
            .into_iter()
            .find(|a| a.address == address)
            .ok_or_else(|| IntercomError::AccountNotFound(address.to_owned()).into())
    }

    /// Create the vault. With `phrase == None` a fresh mnemonic is generated and returned
    /// so the caller can show it once.
    pub async fn create(
        &self,
        password: &SecretString,
        phrase: Option<&str>,
    ) -> eyre::Result<(UnlockedVault, Option<Zeroizing<String>>)> {
        if self.is_initialized().await? {
            return Err(IntercomError::AlreadyInitialized.into());
        }

        let (mnemonic, generated) = match phrase {
            Some(p) => (
                Mnemonic::parse_in_normalized(Language::English, p.trim())
                    .map_err(|_invalid| IntercomError::InvalidMnemonic)?,
                false,
            ),
            None => (
                Mnemonic::generate_in(Language::English, MNEMONIC_WORDS)
                    .context("generate mnemonic")?,
                true,
            ),
        };
        let words = Zeroizing::new(mnemonic.to_string());

        let salt = crypto::random_salt16();
        let key = crypto::derive_password_key(password, &salt, self.kdf)?;
        let sealed = crypto::encrypt_aes_gcm(&key, words.as_bytes())?;

        let vault = UnlockedVault::from_mnemonic(&mnemonic);
        let first = vault.account(0, "Account 1".to_owned())?;

        let mut record = Map::new();
        record.insert(
            KEY_SALT.to_owned(),
            Value::String(base64::engine::general_purpose::STANDARD.encode(salt)),
        );
        record.insert(KEY_KDF.to_owned(), serde_json::to_value(self.kdf)?);
        record.insert(KEY_MNEMONIC.to_owned(), serde_json::to_value(&sealed)?);
        record.insert(KEY_ACCOUNTS.to_owned(), serde_json::to_value([&first])?);
        self.storage.put_record(record).await?;

        info!(address = %first.address, imported = !generated, "vault created");
        Ok((vault, generated.then_some(words)))
    }

    async fn open_mnemonic(&self, password: &SecretString) -> eyre::Result<Mnemonic> {
        let sealed: CryptoBox = self
            .storage
            .fetch(KEY_MNEMONIC)
            .await?
            .ok_or(IntercomError::NotInitialized)?;
        let salt_b64: String = self
            .storage
            .fetch(KEY_SALT)
            .await?
            .ok_or_else(|| eyre::eyre!("vault salt missing"))?;
        let salt: [u8; 16] = base64::engine::general_purpose::STANDARD
            .decode(salt_b64)
            .context("decode vault salt")?
            .try_into()
            .map_err(|_wrong_len| eyre::eyre!("vault salt must be 16 bytes"))?;
        let kdf: KdfConfig = self.storage.fetch(KEY_KDF).await?.unwrap_or_default();

        let key = crypto::derive_password_key(password, &salt, kdf)?;
        let plain =
            crypto::decrypt_aes_gcm(&key, &sealed).map_err(|_auth| IntercomError::InvalidPassword)?;
        let words = std::str::from_utf8(&plain).context("vault mnemonic is not utf-8")?;
        Mnemonic::parse_in_normalized(Language::English, words).context("stored mnemonic is invalid")
    }

    pub async fn unlock(&self, password: &SecretString) -> eyre::Result<UnlockedVault> {
        let m = self.open_mnemonic(password).await?;
        Ok(UnlockedVault::from_mnemonic(&m))
    }

    /// Check `password` and return the mnemonic words.
    pub async fn reveal_mnemonic(&self, password: &SecretString) -> eyre::Result<Zeroizing<String>> {
        let m = self.open_mnemonic(password).await?;
        Ok(Zeroizing::new(m.to_string()))
    }

    pub async fn create_account(
        &self,
        vault: &UnlockedVault,
        name: Option<String>,
    ) -> eyre::Result<Account> {
        let mut accounts = self.accounts().await?;
        let index = accounts
            .iter()
            .map(|a| a.index)
            .max()
            .map_or(0, |i| i.saturating_add(1));
        let name = name
            .map(|n| n.trim().to_owned())
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| format!("Account {}", accounts.len().saturating_add(1)));
        let account = vault.account(index, name)?;
        accounts.push(account.clone());
        self.storage.put(KEY_ACCOUNTS, &accounts).await?;
        info!(address = %account.address, index, "account created");
        Ok(account)
    }

    pub async fn rename_account(&self, address: &str, name: &str) -> eyre::Result<Account> {
        let name = name.trim();
        if name.is_empty() {
            eyre::bail!("account name must not be empty");
        }
        let mut accounts = self.accounts().await?;
        let account = accounts
            .iter_mut()
            .find(|a| a.address == address)
            .ok_or_else(|| IntercomError::AccountNotFound(address.to_owned()))?;
        name.clone_into(&mut account.name);
        let renamed = account.clone();
        self.storage.put(KEY_ACCOUNTS, &accounts).await?;
        Ok(renamed)
    }

    pub async fn remove_account(&self, address: &str) -> eyre::Result<()> {
        let mut accounts = self.accounts().await?;
        let before = accounts.len();
        accounts.retain(|a| a.address != address);
        if accounts.len() == before {
            return Err(IntercomError::AccountNotFound(address.to_owned()).into());
        }
        if accounts.is_empty() {
            return Err(IntercomError::LastAccount.into());
        }
        self.storage.put(KEY_ACCOUNTS, &accounts).await?;
        info!(address, "account removed");
        Ok(())
    }

    /// Wipe all stored state, vault included.
    pub async fn reset(&self) -> eyre::Result<()> {
        self.storage.clear().await?;
        info!("vault reset");
        Ok(())
    }
}
