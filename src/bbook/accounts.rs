/// Account state and per-account serialization
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{Mutex, MutexGuard, RwLock};
use tracing::info;

use crate::error::{EngineError, Result};
use crate::types::{Account, Order, Position};

/// Everything owned by one account, guarded by one lock. All writes
/// to an account's positions, orders and balance mirror flow through
/// this book.
pub struct AccountBook {
    pub account: Account,
    pub positions: HashMap<u64, Position>,
    pub orders: HashMap<u64, Order>,
    /// Set while margin level sits below the margin-call threshold
    pub margin_called: bool,
}

pub struct AccountHandle {
    pub id: u64,
    book: Mutex<AccountBook>,
}

impl AccountHandle {
    pub async fn lock(&self) -> MutexGuard<'_, AccountBook> {
        self.book.lock().await
    }
}

pub struct AccountManager {
    accounts: RwLock<HashMap<u64, Arc<AccountHandle>>>,
    next_id: AtomicU64,
}

impl AccountManager {
    pub fn new() -> Self {
        AccountManager {
            accounts: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub async fn create(
        &self,
        username: String,
        currency: String,
        group_id: String,
        leverage: u32,
    ) -> Arc<AccountHandle> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let account = Account {
            id,
            username,
            currency,
            balance: 0.0,
            credit: 0.0,
            group_id,
            leverage: leverage.max(1),
            disabled: false,
            created_at: Utc::now(),
        };

        let handle = Arc::new(AccountHandle {
            id,
            book: Mutex::new(AccountBook {
                account,
                positions: HashMap::new(),
                orders: HashMap::new(),
                margin_called: false,
            }),
        });

        let mut accounts = self.accounts.write().await;
        accounts.insert(id, Arc::clone(&handle));
        info!(account_id = id, "Account created");
        handle
    }

    pub async fn get(&self, id: u64) -> Result<Arc<AccountHandle>> {
        let accounts = self.accounts.read().await;
        accounts
            .get(&id)
            .cloned()
            .ok_or(EngineError::AccountNotFound(id))
    }

    /// Handles for the given ids in ascending-id order. Callers lock
    /// the books in this order, which keeps multi-account tick
    /// evaluation deadlock-free.
    pub async fn get_sorted(&self, mut ids: Vec<u64>) -> Vec<Arc<AccountHandle>> {
        ids.sort_unstable();
        ids.dedup();
        let accounts = self.accounts.read().await;
        ids.into_iter().filter_map(|id| accounts.get(&id).cloned()).collect()
    }

    pub async fn all(&self) -> Vec<Arc<AccountHandle>> {
        let accounts = self.accounts.read().await;
        let mut handles: Vec<_> = accounts.values().cloned().collect();
        handles.sort_by_key(|h| h.id);
        handles
    }

    pub async fn set_disabled(&self, id: u64, disabled: bool) -> Result<()> {
        let handle = self.get(id).await?;
        let mut book = handle.lock().await;
        book.account.disabled = disabled;
        info!(account_id = id, disabled, "Account toggled");
        Ok(())
    }
}

impl Default for AccountManager {
    fn default() -> Self {
        Self::new()
    }
}
