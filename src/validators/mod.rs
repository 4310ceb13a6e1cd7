pub mod approval;
pub mod deposit_data;
pub mod keystores;
pub mod signing;
mod types;

pub use approval::{
    ApprovalError, ApprovalRoundReport, FailureKind, OracleConsensusClient, OracleError,
    OracleOutcome, ReplicaError, RetryPolicy,
};
pub use deposit_data::{generate_validators_tree, DepositData, DepositDataError};
pub use keystores::{load_keystores, KeystoreError, Keystores};
pub use signing::{ConsensusFork, ExitSignatureShards, SigningError, VoluntaryExit};
pub use types::{ApprovalRequest, DepositDataEntry, Validator, ValidatorsProof};
