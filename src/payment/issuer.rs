//! Challenge issuance.

use crate::clock::Clock;
use crate::error::{Error, Result};
use crate::payment::proof::{Network, PaymentRequirements};
use crate::store::ReferenceStore;
use chrono::Duration;
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

/// Default lifetime of an issued reference.
pub const DEFAULT_REFERENCE_TTL_SECS: u64 = 300;

/// Fresh references generated before giving up on collisions.
const MAX_ISSUE_ATTEMPTS: u32 = 3;

/// Settings fixed for every challenge an issuer produces.
#[derive(Debug, Clone)]
pub struct IssuerConfig {
    /// Address payments must go to.
    pub receiver_address: String,
    /// Cluster payments must be made on.
    pub network: Network,
    /// Token mint advertised in challenges. `None` for native transfers.
    pub mint: Option<String>,
    /// Reference lifetime.
    pub ttl: Duration,
}

impl Default for IssuerConfig {
    fn default() -> Self {
        Self {
            receiver_address: String::new(),
            network: Network::default(),
            mint: None,
            ttl: Duration::seconds(300),
        }
    }
}

/// Creates pending references and the matching payment requirements.
pub struct ChallengeIssuer {
    store: Arc<dyn ReferenceStore>,
    clock: Arc<dyn Clock>,
    config: IssuerConfig,
}

impl ChallengeIssuer {
    /// Create an issuer persisting into `store`.
    #[must_use]
    pub fn new(store: Arc<dyn ReferenceStore>, clock: Arc<dyn Clock>, config: IssuerConfig) -> Self {
        Self {
            store,
            clock,
            config,
        }
    }

    /// Issue a challenge for `amount` lamports.
    ///
    /// # Errors
    ///
    /// Returns an error if the reference cannot be persisted.
    pub async fn issue(&self, amount: u64) -> Result<PaymentRequirements> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let reference = Uuid::new_v4().to_string();
            let expires_at = self.clock.now() + self.config.ttl;

            match self
                .store
                .create_reference(&reference, amount, expires_at)
                .await
            {
                Ok(record) => {
                    debug!("Issued reference {} for {} lamports", reference, amount);
                    return Ok(PaymentRequirements {
                        amount,
                        receiver_address: self.config.receiver_address.clone(),
                        reference: record.reference,
                        network: self.config.network,
                        mint: self.config.mint.clone(),
                        expires_at: record.expires_at,
                    });
                }
                Err(Error::ReferenceExists(_)) if attempt < MAX_ISSUE_ATTEMPTS => {
                    warn!("Reference collision on {}, regenerating", reference);
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Issuer settings.
    #[must_use]
    pub fn config(&self) -> &IssuerConfig {
        &self.config
    }
}
