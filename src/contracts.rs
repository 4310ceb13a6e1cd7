//! Round-state sources consulted while classifying oracle failures.

use std::collections::HashSet;

use alloy::providers::{Provider, ProviderBuilder};
use alloy::rpc::types::Filter;
use alloy::sol;
use alloy::sol_types::SolEvent;
use alloy_primitives::{Address, B256};
use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::debug;
use url::Url;

sol! {
    #[sol(rpc)]
    interface IValidatorsRegistry {
        function get_deposit_root() external view returns (bytes32);

        event DepositEvent(
            bytes pubkey, bytes withdrawal_credentials, bytes amount, bytes signature, bytes index
        );
    }
}

/// Live root of the validators registry
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RegistryRootReader: Send + Sync {
    async fn registry_root(&self) -> Result<B256>;
}

/// Index the next registered validator will receive
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ValidatorIndexSource: Send + Sync {
    async fn next_validator_index(&self) -> Result<u64>;
}

/// Beacon deposit contract reader
#[derive(Debug, Clone)]
pub struct ValidatorsRegistry {
    rpc_url: Url,
    address: Address,
    from_block: u64,
}

impl ValidatorsRegistry {
    pub fn new(rpc_url: &str, address: Address) -> Result<Self> {
        let rpc_url = rpc_url
            .parse()
            .with_context(|| format!("Invalid execution endpoint: {}", rpc_url))?;
        Ok(Self {
            rpc_url,
            address,
            from_block: 0,
        })
    }

    /// First block scanned for deposit events
    pub fn with_from_block(mut self, from_block: u64) -> Self {
        self.from_block = from_block;
        self
    }

    pub fn address(&self) -> Address {
        self.address
    }
}

#[async_trait]
impl RegistryRootReader for ValidatorsRegistry {
    async fn registry_root(&self) -> Result<B256> {
        let provider = ProviderBuilder::new().on_http(self.rpc_url.clone());
        let contract = IValidatorsRegistry::new(self.address, provider);

        let root = contract
            .get_deposit_root()
            .call()
            .await
            .context("Failed to fetch validators registry root")?;
        debug!(%root, "fetched validators registry root");
        Ok(root)
    }
}

/// Validators get indexes in order of their first deposit; top-ups of an
/// already registered key do not allocate a new one.
#[async_trait]
impl ValidatorIndexSource for ValidatorsRegistry {
    async fn next_validator_index(&self) -> Result<u64> {
        let provider = ProviderBuilder::new().on_http(self.rpc_url.clone());

        let filter = Filter::new()
            .address(self.address)
            .event(IValidatorsRegistry::DepositEvent::SIGNATURE)
            .from_block(self.from_block);

        let logs = provider
            .get_logs(&filter)
            .await
            .context("Failed to fetch validators registry deposit events")?;
        let public_keys = logs
            .iter()
            .map(|log| {
                log.log_decode::<IValidatorsRegistry::DepositEvent>()
                    .map(|decoded| decoded.inner.data.pubkey)
                    .context("Failed to decode deposit event")
            })
            .collect::<Result<Vec<_>>>()?;

        let index = count_distinct_public_keys(&public_keys);
        debug!(deposits = logs.len(), index, "fetched next validator index");
        Ok(index)
    }
}

/// Number of distinct validator public keys among deposit events
pub fn count_distinct_public_keys<K: AsRef<[u8]>>(public_keys: &[K]) -> u64 {
    public_keys
        .iter()
        .map(AsRef::as_ref)
        .collect::<HashSet<&[u8]>>()
        .len() as u64
}
