use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use dealmint_core::{
    AppliedEntry, Balance, LedgerEntry, LedgerError, LedgerStore, NewLedgerEntry, Posting,
    PostingContext, entry_keys,
};
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

struct AffiliateAccount {
    balance: Balance,
    entries: Vec<LedgerEntry>,
    keys: HashMap<String, usize>,
}

impl AffiliateAccount {
    fn new(affiliate_id: Uuid) -> Self {
        Self {
            balance: Balance::empty(affiliate_id),
            entries: Vec::new(),
            keys: HashMap::new(),
        }
    }

    fn context_for(&self, posting: &Posting) -> PostingContext {
        match posting.conversion_id() {
            Some(conversion_id) => PostingContext {
                conversion_matured: self
                    .keys
                    .contains_key(&entry_keys::maturation(conversion_id)),
                conversion_reversed: self
                    .keys
                    .contains_key(&entry_keys::reversal(conversion_id)),
            },
            None => PostingContext::default(),
        }
    }
}

/// Ledger kept in process memory. Each affiliate has its own mutex, so writers for
/// different affiliates never wait on each other while writes for one affiliate are
/// serialized in acceptance order.
#[derive(Default)]
pub struct InMemoryLedgerStore {
    accounts: RwLock<HashMap<Uuid, Arc<Mutex<AffiliateAccount>>>>,
}

impl InMemoryLedgerStore {
    pub fn new() -> Self {
        Self::default()
    }

    async fn account(&self, affiliate_id: Uuid) -> Arc<Mutex<AffiliateAccount>> {
        if let Some(account) = self.accounts.read().await.get(&affiliate_id) {
            return Arc::clone(account);
        }

        let mut accounts = self.accounts.write().await;
        Arc::clone(
            accounts
                .entry(affiliate_id)
                .or_insert_with(|| Arc::new(Mutex::new(AffiliateAccount::new(affiliate_id)))),
        )
    }
}

#[async_trait]
impl LedgerStore for InMemoryLedgerStore {
    async fn apply(&self, entry: NewLedgerEntry) -> Result<AppliedEntry, LedgerError> {
        if entry.entry_key.trim().is_empty() {
            return Err(LedgerError::InvalidRequest(
                "entry_key is required".to_string(),
            ));
        }
        if entry.actor.trim().is_empty() {
            return Err(LedgerError::InvalidRequest("actor is required".to_string()));
        }

        let account = self.account(entry.affiliate_id).await;
        let mut account = account.lock().await;

        if let Some(&index) = account.keys.get(&entry.entry_key) {
            return Ok(AppliedEntry {
                entry: account.entries[index].clone(),
                balance: account.balance.clone(),
                fresh: false,
            });
        }

        let delta = entry.posting.delta(account.context_for(&entry.posting))?;
        let balance = account.balance.apply(&delta)?;

        let stored = LedgerEntry {
            id: Uuid::new_v4(),
            affiliate_id: entry.affiliate_id,
            sequence: balance.version,
            entry_key: entry.entry_key,
            posting: entry.posting,
            delta,
            actor: entry.actor,
            memo: entry.memo,
            balance_after: balance.clone(),
            recorded_at: entry.recorded_at,
        };

        let index = account.entries.len();
        account.keys.insert(stored.entry_key.clone(), index);
        account.entries.push(stored.clone());
        account.balance = balance.clone();

        Ok(AppliedEntry {
            entry: stored,
            balance,
            fresh: true,
        })
    }

    async fn balance(&self, affiliate_id: Uuid) -> Result<Balance, LedgerError> {
        let account = self.account(affiliate_id).await;
        let account = account.lock().await;
        Ok(account.balance.clone())
    }

    async fn entries(&self, affiliate_id: Uuid) -> Result<Vec<LedgerEntry>, LedgerError> {
        let account = self.account(affiliate_id).await;
        let account = account.lock().await;
        Ok(account.entries.clone())
    }

    async fn entry(
        &self,
        affiliate_id: Uuid,
        entry_key: &str,
    ) -> Result<Option<LedgerEntry>, LedgerError> {
        let account = self.account(affiliate_id).await;
        let account = account.lock().await;
        Ok(account
            .keys
            .get(entry_key)
            .map(|&index| account.entries[index].clone()))
    }
}
