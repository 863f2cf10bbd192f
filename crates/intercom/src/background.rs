//! Privileged side of the bridge: owns the keyring and the unlocked session.
//!
//! Every request goes through one [`SerialQueue`], so storage mutations, unlocks and
//! signatures never interleave no matter how many clients are connected.

use crate::{
    config::IntercomConfig,
    errors::IntercomError,
    intercom::{Request, Response, WalletState, WalletStatus},
    keyring::{Keyring, UnlockedVault},
    queue::SerialQueue,
    storage::{KvStore, Storage},
};
use eyre::Context as _;
use secrecy::SecretString;
use serde_json::Value;
use std::{
    future::Future,
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::sync::Mutex;
use tracing::{debug, info};

#[derive(Debug, Default)]
struct Session {
    vault: Option<UnlockedVault>,
    last_activity: Option<Instant>,
}

impl Session {
    fn lock(&mut self) {
        self.vault = None;
        self.last_activity = None;
    }

    fn unlock(&mut self, vault: UnlockedVault) {
        self.vault = Some(vault);
        self.last_activity = Some(Instant::now());
    }

    /// Drop the vault if it has been idle longer than `ttl`.
    fn expire(&mut self, ttl: Option<Duration>) {
        if let (Some(ttl), Some(last)) = (ttl, self.last_activity) {
            if self.vault.is_some() && last.elapsed() >= ttl {
                info!("session idle; auto-locking");
                self.lock();
            }
        }
    }

    fn touch(&mut self) {
        if self.vault.is_some() {
            self.last_activity = Some(Instant::now());
        }
    }

    fn vault(&self) -> eyre::Result<&UnlockedVault> {
        self.vault
            .as_ref()
            .ok_or_else(|| IntercomError::Locked.into())
    }
}

#[derive(Debug)]
struct Inner<S> {
    keyring: Keyring<S>,
    queue: SerialQueue,
    session: Mutex<Session>,
    auto_lock: Option<Duration>,
}

#[derive(Debug)]
pub struct Background<S> {
    inner: Arc<Inner<S>>,
}

impl<S> Clone for Background<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

fn secret(s: String) -> SecretString {
    SecretString::new(s.into())
}

impl<S: KvStore> Background<S> {
    /// Bring storage up to date and start with a locked session.
    pub async fn open(storage: Storage<S>, cfg: &IntercomConfig) -> eyre::Result<Self> {
        let keyring = Keyring::new(storage, cfg.kdf);
        keyring.migrate().await.context("migrate storage")?;
        let auto_lock = match cfg.session.auto_lock_seconds {
            0 => None,
            n => Some(Duration::from_secs(n)),
        };
        Ok(Self {
            inner: Arc::new(Inner {
                keyring,
                queue: SerialQueue::new(),
                session: Mutex::new(Session::default()),
                auto_lock,
            }),
        })
    }

    /// Queue `req` behind every request submitted before it.
    pub fn submit(&self, req: Request) -> impl Future<Output = eyre::Result<Response>> + Send {
        let this = self.clone();
        self.inner
            .queue
            .enqueue(move || async move { this.handle(req).await })
    }

    /// Wire-level entry point: decode, queue, encode. The queue position is taken
    /// immediately, before the returned future is polled.
    pub fn dispatch(&self, payload: Value) -> impl Future<Output = eyre::Result<Value>> + Send {
        let queued = serde_json::from_value::<Request>(payload)
            .map(|req| self.submit(req))
            .map_err(|e| IntercomError::InvalidRequest(e.to_string()));
        async move {
            let response = queued?.await?;
            serde_json::to_value(&response).context("encode response")
        }
    }

    async fn handle(&self, req: Request) -> eyre::Result<Response> {
        let kind = req.type_name();
        debug!(request = kind, "handling request");
        let keyring = &self.inner.keyring;
        let mut session = self.inner.session.lock().await;
        session.expire(self.inner.auto_lock);
        // Status polling is not user activity.
        if !matches!(req, Request::GetStateRequest) {
            session.touch();
        }

        let resp = match req {
            Request::GetStateRequest => {
                let status = if !keyring.is_initialized().await? {
                    WalletStatus::Idle
                } else if session.vault.is_some() {
                    WalletStatus::Ready
                } else {
                    WalletStatus::Locked
                };
                let accounts = if status == WalletStatus::Ready {
                    keyring.accounts().await?
                } else {
                    Vec::new()
                };
                Response::GetStateResponse {
                    state: WalletState { status, accounts },
                }
            }
            Request::NewWalletRequest { password, mnemonic } => {
                let (vault, shown) = keyring
                    .create(&secret(password), mnemonic.as_deref())
                    .await?;
                session.unlock(vault);
                Response::NewWalletResponse {
                    mnemonic: shown.map(|w| w.as_str().to_owned()),
                }
            }
            Request::UnlockRequest { password } => {
                let vault = keyring.unlock(&secret(password)).await?;
                session.unlock(vault);
                info!("session unlocked");
                Response::UnlockResponse
            }
            Request::LockRequest => {
                session.lock();
                info!("session locked");
                Response::LockResponse
            }
            Request::CreateAccountRequest { name } => {
                let account = keyring.create_account(session.vault()?, name).await?;
                Response::CreateAccountResponse { account }
            }
            Request::EditAccountNameRequest { address, name } => {
                session.vault()?;
                let account = keyring.rename_account(&address, &name).await?;
                Response::EditAccountNameResponse { account }
            }
            Request::RemoveAccountRequest { address, password } => {
                session.vault()?;
                keyring.unlock(&secret(password)).await?;
                keyring.remove_account(&address).await?;
                Response::RemoveAccountResponse
            }
            Request::RevealPublicKeyRequest { address } => {
                let account = keyring.find_account(&address).await?;
                Response::RevealPublicKeyResponse {
                    public_key: account.public_key,
                }
            }
            Request::RevealMnemonicRequest { password } => {
                session.vault()?;
                let words = keyring.reveal_mnemonic(&secret(password)).await?;
                Response::RevealMnemonicResponse {
                    mnemonic: words.as_str().to_owned(),
                }
            }
            Request::SignRequest { address, bytes } => {
                let vault = session.vault()?;
                let account = keyring.find_account(&address).await?;
                let message = hex::decode(bytes.trim_start_matches("0x"))
                    .context("bytes must be hex")?;
                let signature = vault.sign(account.index, &message)?;
                info!(address = %account.address, len = message.len(), "signed");
                Response::SignResponse {
                    signature: hex::encode(signature),
                }
            }
            Request::ResetWalletRequest { password } => {
                keyring.unlock(&secret(password)).await?;
                keyring.reset().await?;
                session.lock();
                Response::ResetWalletResponse
            }
        };
        Ok(resp)
    }
}
