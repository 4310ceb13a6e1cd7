pub mod config;
pub mod contracts;
pub mod oracles;
pub mod validators;

pub use config::{load_config, AppConfig};
pub use oracles::{MajorityCombiner, Oracles, OraclesApproval};
pub use validators::{DepositData, Keystores, OracleConsensusClient};
