//! One approval round: fan the request out to every oracle, walk each oracle's
//! replicas until one answers, and combine the answers against the threshold.

use std::sync::Arc;
use std::time::Duration;

use alloy_primitives::{Address, Bytes, B256};
use futures_util::future::join_all;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use reqwest::header::CONTENT_TYPE;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use thiserror::Error;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, error, info, warn};

use super::types::ApprovalRequest;
use crate::config::OraclesConfig;
use crate::contracts::{RegistryRootReader, ValidatorIndexSource};
use crate::oracles::{
    ApprovalCombiner, MajorityCombiner, NotEnoughOracleApprovals, OracleApproval, Oracles,
    OraclesApproval,
};

/// Failure of a single call to one replica
#[derive(Debug, Error)]
pub enum ReplicaError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

impl ReplicaError {
    /// Network and timeout failures may succeed on a second attempt
    pub fn is_transient(&self) -> bool {
        match self {
            ReplicaError::Http(err) => !err.is_decode() && !err.is_builder(),
            ReplicaError::Status { .. } | ReplicaError::InvalidResponse(_) => false,
        }
    }
}

/// Terminal outcome of one oracle's task
#[derive(Debug, Error)]
pub enum OracleError {
    #[error("Validators registry root changed: expected {expected}, actual {actual}")]
    RegistryRootChanged { expected: B256, actual: B256 },

    #[error("Validator index changed: expected {expected}, actual {actual}")]
    ValidatorIndexChanged { expected: u64, actual: u64 },

    #[error("Replica {endpoint} failed: {source}")]
    Replica {
        endpoint: String,
        #[source]
        source: ReplicaError,
    },

    #[error("Oracle has no replicas")]
    NoReplicas,

    #[error("Approval round timed out")]
    Timeout,

    #[error("Failed to check round state: {0}")]
    RoundState(#[source] anyhow::Error),
}

impl OracleError {
    /// The request no longer matches on-chain state and must be rebuilt
    pub fn is_stale_round(&self) -> bool {
        matches!(
            self,
            OracleError::RegistryRootChanged { .. } | OracleError::ValidatorIndexChanged { .. }
        )
    }
}

#[derive(Debug, Error)]
pub enum ApprovalError {
    #[error("Failed to serialize approval request: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Failed to build HTTP client: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Approval round must be rebuilt: {0}")]
    RoundChanged(String),

    #[error(transparent)]
    NotEnoughApprovals(#[from] NotEnoughOracleApprovals),
}

/// What a replica failure says about the round
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Transient,
    StaleRegistryRoot { live: B256 },
    StaleValidatorIndex { live: u64 },
}

/// Attempts per replica for transient failures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            delay,
        }
    }
}

impl From<&OraclesConfig> for RetryPolicy {
    fn from(config: &OraclesConfig) -> Self {
        Self::new(config.max_attempts, config.retry_delay())
    }
}

#[derive(Debug)]
pub struct OracleOutcome {
    pub address: Address,
    pub endpoints: Vec<String>,
    pub result: Result<OracleApproval, OracleError>,
}

/// Per-oracle outcomes of a round, in oracle address order
#[derive(Debug)]
pub struct ApprovalRoundReport {
    pub approved: usize,
    pub total: usize,
    pub failed_endpoints: Vec<String>,
    pub outcomes: Vec<OracleOutcome>,
}

impl ApprovalRoundReport {
    fn new(outcomes: Vec<OracleOutcome>) -> Self {
        let approved = outcomes.iter().filter(|o| o.result.is_ok()).count();
        let failed_endpoints = outcomes
            .iter()
            .filter(|o| o.result.is_err())
            .flat_map(|o| o.endpoints.iter().cloned())
            .collect();
        Self {
            approved,
            total: outcomes.len(),
            failed_endpoints,
            outcomes,
        }
    }

    /// Successful approvals keyed by oracle address
    pub fn approvals(&self) -> Vec<(Address, OracleApproval)> {
        self.outcomes
            .iter()
            .filter_map(|o| o.result.as_ref().ok().map(|a| (o.address, a.clone())))
            .collect()
    }

    pub fn stale_round(&self) -> Option<&OracleError> {
        self.outcomes
            .iter()
            .filter_map(|o| o.result.as_ref().err())
            .find(|e| e.is_stale_round())
    }
}

#[derive(Deserialize)]
struct ApprovalResponse {
    ipfs_hash: String,
    signature: String,
    deadline: u64,
}

pub struct OracleConsensusClient<R = StdRng> {
    registry_root: Arc<dyn RegistryRootReader>,
    validator_index: Arc<dyn ValidatorIndexSource>,
    combiner: Box<dyn ApprovalCombiner>,
    retry: RetryPolicy,
    timeout: Duration,
    rng: R,
}

impl OracleConsensusClient<StdRng> {
    pub fn new(
        registry_root: Arc<dyn RegistryRootReader>,
        validator_index: Arc<dyn ValidatorIndexSource>,
        config: &OraclesConfig,
    ) -> Self {
        Self {
            registry_root,
            validator_index,
            combiner: Box::new(MajorityCombiner),
            retry: RetryPolicy::from(config),
            timeout: config.timeout(),
            rng: StdRng::from_entropy(),
        }
    }
}

impl<R: Rng> OracleConsensusClient<R> {
    /// Replaces the source used to shuffle replicas
    pub fn with_rng<T: Rng>(self, rng: T) -> OracleConsensusClient<T> {
        OracleConsensusClient {
            registry_root: self.registry_root,
            validator_index: self.validator_index,
            combiner: self.combiner,
            retry: self.retry,
            timeout: self.timeout,
            rng,
        }
    }

    pub fn with_combiner(mut self, combiner: impl ApprovalCombiner + 'static) -> Self {
        self.combiner = Box::new(combiner);
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Shared budget for a whole round
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Runs a round and combines the approvals
    pub async fn request_approvals(
        &mut self,
        oracles: &Oracles,
        request: &ApprovalRequest,
    ) -> Result<OraclesApproval, ApprovalError> {
        let report = self.run_round(oracles, request).await?;
        self.combine(&report, oracles.validators_threshold)
    }

    /// Combines the approvals of a finished round.
    ///
    /// A stale round wins over a plain threshold miss.
    pub fn combine(
        &self,
        report: &ApprovalRoundReport,
        threshold: usize,
    ) -> Result<OraclesApproval, ApprovalError> {
        match self.combiner.combine(&report.approvals(), threshold) {
            Ok(approval) => Ok(approval),
            Err(not_enough) => match report.stale_round() {
                Some(stale) => Err(ApprovalError::RoundChanged(stale.to_string())),
                None => Err(ApprovalError::NotEnoughApprovals(not_enough)),
            },
        }
    }

    /// Queries every oracle concurrently under one shared deadline
    pub async fn run_round(
        &mut self,
        oracles: &Oracles,
        request: &ApprovalRequest,
    ) -> Result<ApprovalRoundReport, ApprovalError> {
        let payload = serde_json::to_vec(request)?;
        let client = Client::builder().timeout(self.timeout).build()?;
        let deadline = Instant::now() + self.timeout;

        info!(
            deadline = request.deadline,
            start_index = request.validator_index,
            oracles = oracles.len(),
            "Requesting approvals from oracles"
        );

        let plans: Vec<(Address, Vec<String>)> = oracles
            .iter()
            .map(|(address, endpoints)| {
                let mut shuffled = endpoints.clone();
                shuffled.shuffle(&mut self.rng);
                (*address, shuffled)
            })
            .collect();

        let this = &*self;
        let tasks = plans.iter().map(|(address, replicas)| {
            let task = this.request_oracle(&client, *address, replicas, &payload, request);
            async move {
                match timeout_at(deadline, task).await {
                    Ok(result) => result,
                    Err(_) => {
                        warn!(oracle = %address, "Oracle did not answer before the round deadline");
                        Err(OracleError::Timeout)
                    }
                }
            }
        });
        let results = join_all(tasks).await;

        let outcomes: Vec<OracleOutcome> = oracles
            .iter()
            .zip(results)
            .map(|((address, endpoints), result)| OracleOutcome {
                address: *address,
                endpoints: endpoints.clone(),
                result,
            })
            .collect();

        let report = ApprovalRoundReport::new(outcomes);
        info!(
            "Fetched approvals from {}/{} oracles",
            report.approved, report.total
        );
        if !report.failed_endpoints.is_empty() {
            error!(
                "Failed to get approvals from endpoints: {}",
                report.failed_endpoints.join(", ")
            );
        }
        Ok(report)
    }

    /// Walks the replicas in order; the first success ends the walk
    async fn request_oracle(
        &self,
        client: &Client,
        address: Address,
        replicas: &[String],
        payload: &[u8],
        request: &ApprovalRequest,
    ) -> Result<OracleApproval, OracleError> {
        let mut last_error = None;

        for endpoint in replicas {
            let mut attempt = 1;
            loop {
                let err = match send_approval_request(client, endpoint, payload).await {
                    Ok(approval) => {
                        debug!(oracle = %address, endpoint = %endpoint, "Received approval");
                        return Ok(approval);
                    }
                    Err(err) => err,
                };
                warn!(
                    oracle = %address,
                    endpoint = %endpoint,
                    attempt,
                    "Approval request failed: {}",
                    err
                );

                match self.classify_failure(request).await? {
                    FailureKind::StaleRegistryRoot { live } => {
                        return Err(OracleError::RegistryRootChanged {
                            expected: request.validators_root,
                            actual: live,
                        });
                    }
                    FailureKind::StaleValidatorIndex { live } => {
                        return Err(OracleError::ValidatorIndexChanged {
                            expected: request.validator_index,
                            actual: live,
                        });
                    }
                    FailureKind::Transient => {
                        let retry = err.is_transient() && attempt < self.retry.max_attempts;
                        last_error = Some(OracleError::Replica {
                            endpoint: endpoint.clone(),
                            source: err,
                        });
                        if !retry {
                            break;
                        }
                        attempt += 1;
                        tokio::time::sleep(self.retry.delay).await;
                    }
                }
            }
        }

        Err(last_error.unwrap_or(OracleError::NoReplicas))
    }

    /// Registry root first, then the validator index
    pub async fn classify_failure(
        &self,
        request: &ApprovalRequest,
    ) -> Result<FailureKind, OracleError> {
        let live_root = self
            .registry_root
            .registry_root()
            .await
            .map_err(OracleError::RoundState)?;
        if live_root != request.validators_root {
            return Ok(FailureKind::StaleRegistryRoot { live: live_root });
        }

        let live_index = self
            .validator_index
            .next_validator_index()
            .await
            .map_err(OracleError::RoundState)?;
        if live_index != request.validator_index {
            return Ok(FailureKind::StaleValidatorIndex { live: live_index });
        }

        Ok(FailureKind::Transient)
    }
}

async fn send_approval_request(
    client: &Client,
    endpoint: &str,
    payload: &[u8],
) -> Result<OracleApproval, ReplicaError> {
    let response = client
        .post(endpoint)
        .header(CONTENT_TYPE, "application/json")
        .body(payload.to_vec())
        .send()
        .await?;

    let status = response.status();
    if !status.is_success() {
        let body = error_body(endpoint, response.text().await);
        if status == StatusCode::BAD_REQUEST {
            warn!(endpoint = %endpoint, "Oracle rejected approval request: {}", body);
        }
        return Err(ReplicaError::Status {
            status: status.as_u16(),
            body,
        });
    }

    let body = response.bytes().await?;
    parse_approval(&body)
}

/// Body of an error response, or the reason it could not be read
fn error_body<E: std::fmt::Display>(endpoint: &str, body: Result<String, E>) -> String {
    match body {
        Ok(body) => body,
        Err(err) => {
            warn!(endpoint = %endpoint, "Failed to read error response body: {}", err);
            format!("<unreadable body: {}>", err)
        }
    }
}

fn parse_approval(body: &[u8]) -> Result<OracleApproval, ReplicaError> {
    let response: ApprovalResponse =
        serde_json::from_slice(body).map_err(|e| ReplicaError::InvalidResponse(e.to_string()))?;
    let signature = hex::decode(response.signature.trim_start_matches("0x"))
        .map_err(|e| ReplicaError::InvalidResponse(format!("signature is not hex: {}", e)))?;

    Ok(OracleApproval {
        ipfs_hash: response.ipfs_hash,
        signature: Bytes::from(signature),
        deadline: response.deadline,
    })
}
