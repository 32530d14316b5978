use std::collections::HashMap;

use async_trait::async_trait;
use dealmint_core::{Affiliate, AffiliateLink, AffiliateRegistry, AffiliateStatus, LedgerError};
use tokio::sync::RwLock;
use uuid::Uuid;

/// Registry backed by maps; seeded by tests and local tooling.
#[derive(Default)]
pub struct InMemoryAffiliateRegistry {
    affiliates: RwLock<HashMap<Uuid, Affiliate>>,
    links: RwLock<HashMap<Uuid, AffiliateLink>>,
}

impl InMemoryAffiliateRegistry {
    pub async fn upsert_affiliate(&self, affiliate: Affiliate) {
        self.affiliates.write().await.insert(affiliate.id, affiliate);
    }

    pub async fn upsert_link(&self, link: AffiliateLink) {
        self.links.write().await.insert(link.id, link);
    }

    pub async fn deactivate_link(&self, link_id: Uuid) -> Result<(), LedgerError> {
        let mut links = self.links.write().await;
        let link = links
            .get_mut(&link_id)
            .ok_or_else(|| LedgerError::not_found("affiliate link", link_id))?;
        link.active = false;
        Ok(())
    }

    pub async fn set_status(
        &self,
        affiliate_id: Uuid,
        status: AffiliateStatus,
    ) -> Result<(), LedgerError> {
        let mut affiliates = self.affiliates.write().await;
        let affiliate = affiliates
            .get_mut(&affiliate_id)
            .ok_or_else(|| LedgerError::not_found("affiliate", affiliate_id))?;
        affiliate.status = status;
        Ok(())
    }
}

#[async_trait]
impl AffiliateRegistry for InMemoryAffiliateRegistry {
    async fn affiliate(&self, affiliate_id: Uuid) -> Result<Option<Affiliate>, LedgerError> {
        Ok(self.affiliates.read().await.get(&affiliate_id).cloned())
    }

    async fn link(&self, link_id: Uuid) -> Result<Option<AffiliateLink>, LedgerError> {
        Ok(self.links.read().await.get(&link_id).cloned())
    }
}
