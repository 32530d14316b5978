use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use dealmint_core::{
    Affiliate, AffiliateLink, AffiliateRegistry, AttributionError, ClickEvent, ClickStore,
    LedgerError,
};
use tracing::{debug, info};
use uuid::Uuid;

use crate::token::{AttributionToken, TokenSigner};

#[derive(Debug, Clone)]
pub struct IssuedClick {
    pub token: String,
    pub click: ClickEvent,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct Attribution {
    pub affiliate: Affiliate,
    pub link: AffiliateLink,
    pub token: AttributionToken,
}

/// Issues click tokens and turns presented tokens back into the affiliate owed credit.
pub struct AttributionService {
    registry: Arc<dyn AffiliateRegistry>,
    clicks: Arc<dyn ClickStore>,
    signer: TokenSigner,
    window: Duration,
}

impl AttributionService {
    pub fn new(
        registry: Arc<dyn AffiliateRegistry>,
        clicks: Arc<dyn ClickStore>,
        signer: TokenSigner,
        window: Duration,
    ) -> Self {
        Self {
            registry,
            clicks,
            signer,
            window,
        }
    }

    pub async fn record_click(
        &self,
        link_id: Uuid,
        visitor_id: &str,
        now: DateTime<Utc>,
    ) -> Result<IssuedClick, LedgerError> {
        if visitor_id.trim().is_empty() {
            return Err(LedgerError::InvalidRequest(
                "visitor_id is required".to_string(),
            ));
        }

        let link = self
            .registry
            .link(link_id)
            .await?
            .ok_or_else(|| LedgerError::not_found("affiliate link", link_id))?;
        if !link.active {
            return Err(LedgerError::InvalidRequest(format!(
                "affiliate link {link_id} is no longer active"
            )));
        }

        let (token, raw) = self.signer.issue(link.id, now);
        let visitor_hash = self.signer.anonymize_visitor(visitor_id);
        let click = ClickEvent {
            id: Uuid::new_v4(),
            link_id: link.id,
            affiliate_id: link.affiliate_id,
            token_id: token.token_id,
            visitor_hash: visitor_hash.clone(),
            clicked_at: now,
        };

        self.clicks.record(click.clone()).await?;
        self.clicks.remember_token(&visitor_hash, &raw).await?;
        info!(
            link_id = %link.id,
            affiliate_id = %link.affiliate_id,
            token_id = %token.token_id,
            "click recorded"
        );

        Ok(IssuedClick {
            token: raw,
            click,
            expires_at: now + self.window,
        })
    }

    /// The visitor's most recent token, for conversions that arrive without one.
    pub async fn latest_token_for_visitor(
        &self,
        visitor_id: &str,
    ) -> Result<Option<String>, LedgerError> {
        let visitor_hash = self.signer.anonymize_visitor(visitor_id);
        self.clicks.latest_token(&visitor_hash).await
    }

    pub async fn resolve(
        &self,
        raw: &str,
        now: DateTime<Utc>,
    ) -> Result<Attribution, AttributionError> {
        let token = self.signer.verify(raw)?;
        let issued_at = token.issued_at().ok_or(AttributionError::InvalidToken)?;

        let elapsed = now - issued_at;
        if elapsed > self.window {
            debug!(token_id = %token.token_id, "attribution window elapsed");
            return Err(AttributionError::ExpiredAttribution {
                elapsed_secs: elapsed.num_seconds(),
            });
        }

        let link = self
            .registry
            .link(token.link_id)
            .await
            .map_err(|err| AttributionError::Lookup(err.to_string()))?
            .ok_or(AttributionError::UnknownLink(token.link_id))?;
        if !link.active {
            return Err(AttributionError::LinkInactive(link.id));
        }

        let affiliate = self
            .registry
            .affiliate(link.affiliate_id)
            .await
            .map_err(|err| AttributionError::Lookup(err.to_string()))?
            .ok_or(AttributionError::UnknownLink(link.id))?;
        if !affiliate.is_active() {
            return Err(AttributionError::LinkInactive(link.id));
        }

        Ok(Attribution {
            affiliate,
            link,
            token,
        })
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use dealmint_core::AffiliateStatus;
    use dealmint_eventstore::{InMemoryAffiliateRegistry, InMemoryClickStore};

    use super::*;

    struct Fixture {
        service: AttributionService,
        registry: Arc<InMemoryAffiliateRegistry>,
        clicks: Arc<InMemoryClickStore>,
        affiliate_id: Uuid,
        link_id: Uuid,
        other_link_id: Uuid,
    }

    async fn fixture() -> Fixture {
        let registry = Arc::new(InMemoryAffiliateRegistry::default());
        let clicks = Arc::new(InMemoryClickStore::default());
        let affiliate_id = Uuid::new_v4();
        registry
            .upsert_affiliate(Affiliate {
                id: affiliate_id,
                code: "SAVEBIG".to_string(),
                display_name: "Save Big Blog".to_string(),
                default_commission_rate: None,
                status: AffiliateStatus::Active,
                created_at: Utc::now(),
            })
            .await;

        let mut link_ids = Vec::new();
        for code in ["savebig-shoes", "savebig-tech"] {
            let link_id = Uuid::new_v4();
            registry
                .upsert_link(AffiliateLink {
                    id: link_id,
                    affiliate_id,
                    coupon_id: None,
                    tracking_code: code.to_string(),
                    commission_rate_override: None,
                    active: true,
                    created_at: Utc::now(),
                })
                .await;
            link_ids.push(link_id);
        }

        let service = AttributionService::new(
            registry.clone(),
            clicks.clone(),
            TokenSigner::new("attribution-test-secret-0123456789").unwrap(),
            Duration::days(30),
        );

        Fixture {
            service,
            registry,
            clicks,
            affiliate_id,
            link_id: link_ids[0],
            other_link_id: link_ids[1],
        }
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 5, 1, 8, 0, 0).unwrap()
    }

    #[tokio::test]
    async fn token_resolves_inside_the_window_only() {
        let fx = fixture().await;
        let issued = fx
            .service
            .record_click(fx.link_id, "visitor-1", t0())
            .await
            .unwrap();

        let attributed = fx
            .service
            .resolve(&issued.token, t0() + Duration::days(29))
            .await
            .unwrap();
        assert_eq!(attributed.affiliate.id, fx.affiliate_id);
        assert_eq!(attributed.link.id, fx.link_id);

        let at_boundary = fx
            .service
            .resolve(&issued.token, t0() + Duration::days(30))
            .await;
        assert!(at_boundary.is_ok());

        let expired = fx
            .service
            .resolve(
                &issued.token,
                t0() + Duration::days(30) + Duration::seconds(1),
            )
            .await
            .unwrap_err();
        assert!(matches!(
            expired,
            AttributionError::ExpiredAttribution { .. }
        ));
    }

    #[tokio::test]
    async fn last_click_wins_for_a_visitor() {
        let fx = fixture().await;
        fx.service
            .record_click(fx.link_id, "visitor-2", t0())
            .await
            .unwrap();
        let second = fx
            .service
            .record_click(fx.other_link_id, "visitor-2", t0() + Duration::hours(3))
            .await
            .unwrap();

        let latest = fx
            .service
            .latest_token_for_visitor("visitor-2")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(latest, second.token);

        let attribution = fx
            .service
            .resolve(&latest, t0() + Duration::days(1))
            .await
            .unwrap();
        assert_eq!(attribution.link.id, fx.other_link_id);
        assert_eq!(fx.clicks.count_for_affiliate(fx.affiliate_id).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn deactivated_link_stops_attributing() {
        let fx = fixture().await;
        let issued = fx
            .service
            .record_click(fx.link_id, "visitor-3", t0())
            .await
            .unwrap();
        fx.registry.deactivate_link(fx.link_id).await.unwrap();

        let err = fx
            .service
            .resolve(&issued.token, t0() + Duration::days(1))
            .await
            .unwrap_err();
        assert_eq!(err, AttributionError::LinkInactive(fx.link_id));

        let click_err = fx
            .service
            .record_click(fx.link_id, "visitor-3", t0())
            .await
            .unwrap_err();
        assert!(matches!(click_err, LedgerError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn suspended_affiliate_gets_no_credit() {
        let fx = fixture().await;
        let issued = fx
            .service
            .record_click(fx.link_id, "visitor-4", t0())
            .await
            .unwrap();
        fx.registry
            .set_status(fx.affiliate_id, AffiliateStatus::Suspended)
            .await
            .unwrap();

        assert_eq!(
            fx.service.resolve(&issued.token, t0()).await.unwrap_err(),
            AttributionError::LinkInactive(fx.link_id)
        );
    }
}
