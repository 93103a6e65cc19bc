// Ensures exactly one local wallet identity exists, loading or creating it.

use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::db::{RecordStore, WalletRecord};
use crate::identity::WalletIdentity;

pub struct WalletManager {
    store: Arc<dyn RecordStore>,
    current: Mutex<Option<WalletIdentity>>,
}

impl WalletManager {
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self {
            store,
            current: Mutex::new(None),
        }
    }

    /// Return the local identity, loading it from the store or generating
    /// and persisting a new one on first use.
    ///
    /// The lock is held for the whole call so two concurrent first calls
    /// cannot both generate a wallet.
    pub fn load_wallet(&self) -> Result<WalletIdentity> {
        let mut current = self.current.lock().expect("wallet mutex poisoned");
        if let Some(identity) = current.as_ref() {
            return Ok(identity.clone());
        }

        let identity = match self.store.find_wallet()? {
            Some(record) => {
                let identity = WalletIdentity::from_private_key(&record.private_key)
                    .context("stored wallet has an unusable private key")?;
                if identity.address() != record.address {
                    warn!(
                        stored = %record.address,
                        derived = %identity.address(),
                        "stored wallet address does not match its key, using derived address"
                    );
                }
                info!(address = %identity.address(), "loaded existing wallet");
                identity
            }
            None => {
                let identity = WalletIdentity::generate();
                self.store.create_wallet(&WalletRecord {
                    address: identity.address().to_string(),
                    private_key: identity.private_key().to_string(),
                })?;
                info!(address = %identity.address(), "created new wallet");
                identity
            }
        };

        *current = Some(identity.clone());
        Ok(identity)
    }

    /// The identity held in memory, if `load_wallet` has succeeded.
    pub fn current(&self) -> Option<WalletIdentity> {
        self.current.lock().expect("wallet mutex poisoned").clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{ChannelRecord, Database};
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Wraps a real database and counts every write.
    struct CountingStore {
        inner: Database,
        writes: AtomicUsize,
    }

    impl CountingStore {
        fn new() -> Self {
            Self {
                inner: Database::open(":memory:").unwrap(),
                writes: AtomicUsize::new(0),
            }
        }
    }

    impl RecordStore for CountingStore {
        fn find_wallet(&self) -> Result<Option<WalletRecord>> {
            self.inner.find_wallet()
        }
        fn create_wallet(&self, record: &WalletRecord) -> Result<()> {
            self.writes.fetch_add(1, Ordering::SeqCst);
            self.inner.create_wallet(record)
        }
        fn find_channel(&self, id: &str) -> Result<Option<ChannelRecord>> {
            self.inner.find_channel(id)
        }
        fn create_channel(&self, record: &ChannelRecord) -> Result<()> {
            self.writes.fetch_add(1, Ordering::SeqCst);
            self.inner.create_channel(record)
        }
    }

    #[test]
    fn first_load_creates_and_persists_wallet() {
        let store = Arc::new(CountingStore::new());
        let manager = WalletManager::new(store.clone());

        let identity = manager.load_wallet().unwrap();

        assert_eq!(store.writes.load(Ordering::SeqCst), 1);
        let record = store.find_wallet().unwrap().unwrap();
        assert_eq!(record.address, identity.address());
        assert_eq!(record.private_key, identity.private_key());
    }

    #[test]
    fn second_load_returns_same_identity_without_writing() {
        let store = Arc::new(CountingStore::new());
        let manager = WalletManager::new(store.clone());

        let first = manager.load_wallet().unwrap();
        let second = manager.load_wallet().unwrap();

        assert_eq!(first, second);
        assert_eq!(store.writes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn existing_wallet_is_reconstructed_not_regenerated() {
        let store = Arc::new(CountingStore::new());
        let original = WalletManager::new(store.clone()).load_wallet().unwrap();

        // A fresh manager over the same store simulates a restart.
        let restarted = WalletManager::new(store.clone());
        assert!(restarted.current().is_none());
        let loaded = restarted.load_wallet().unwrap();

        assert_eq!(loaded, original);
        assert_eq!(store.writes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn corrupt_stored_key_is_an_error() {
        let store = Arc::new(CountingStore::new());
        store
            .inner
            .create_wallet(&WalletRecord {
                address: "0x0000000000000000000000000000000000000001".into(),
                private_key: "not-a-key".into(),
            })
            .unwrap();

        let manager = WalletManager::new(store);
        assert!(manager.load_wallet().is_err());
        assert!(manager.current().is_none());
    }
}
