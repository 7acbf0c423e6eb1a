//! Contract handler and contract store descriptors.
//!
//! The channel layer treats these as opaque comparison units: the contract
//! store is identified on the wire by its digest, and a contract handler is
//! echoed verbatim in the contract-address exchange.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::time::Duration;

/// Describes one deployed contract.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContractHandler {
    pub name: String,
    pub version: String,
    #[serde(skip)]
    pub gas_units: u64,

    #[serde(rename = "hashSolFile")]
    pub hash_sol_file: String,
    #[serde(skip)]
    pub hash_go_file: String,
    #[serde(rename = "hashBinRuntimeFile")]
    pub hash_bin_runtime_file: String,
}

impl ContractHandler {
    pub fn new(
        name: impl Into<String>,
        version: impl Into<String>,
        hash_sol_file: impl Into<String>,
        hash_bin_runtime_file: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            hash_sol_file: hash_sol_file.into(),
            hash_bin_runtime_file: hash_bin_runtime_file.into(),
            ..Default::default()
        }
    }
}

/// Equality ignores `gas_units` and `hash_go_file`, which never go over the wire.
impl PartialEq for ContractHandler {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
            && self.version == other.version
            && self.hash_sol_file == other.hash_sol_file
            && self.hash_bin_runtime_file == other.hash_bin_runtime_file
    }
}

impl Eq for ContractHandler {}

/// The set of contracts backing a channel, plus their timeouts.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContractStore {
    lib_signatures: ContractHandler,
    ms_contract: ContractHandler,
    vpc: ContractHandler,

    timeout_ms_contract: Duration,
    timeout_vpc_validity: Duration,
    timeout_vpc_extended_validity: Duration,
}

impl ContractStore {
    pub fn new(
        lib_signatures: ContractHandler,
        ms_contract: ContractHandler,
        vpc: ContractHandler,
    ) -> Self {
        Self {
            lib_signatures,
            ms_contract,
            vpc,
            ..Default::default()
        }
    }

    /// Set the ms contract, vpc validity and vpc extended validity timeouts.
    pub fn with_timeouts(
        mut self,
        ms_contract: Duration,
        vpc_validity: Duration,
        vpc_extended_validity: Duration,
    ) -> Self {
        self.timeout_ms_contract = ms_contract;
        self.timeout_vpc_validity = vpc_validity;
        self.timeout_vpc_extended_validity = vpc_extended_validity;
        self
    }

    pub fn lib_signatures(&self) -> &ContractHandler {
        &self.lib_signatures
    }

    pub fn ms_contract(&self) -> &ContractHandler {
        &self.ms_contract
    }

    pub fn vpc(&self) -> &ContractHandler {
        &self.vpc
    }

    /// Period after which finalize close/register may be called on the ms contract.
    pub fn timeout_ms_contract(&self) -> Duration {
        self.timeout_ms_contract
    }

    /// Period within which the peer must respond to a vpc closing event.
    pub fn timeout_vpc_validity(&self) -> Duration {
        self.timeout_vpc_validity
    }

    /// Period after which vpc finalize may be called.
    pub fn timeout_vpc_extended_validity(&self) -> Duration {
        self.timeout_vpc_extended_validity
    }

    /// SHA-256 over the runtime binary hashes of libsignatures, vpc and ms contract.
    ///
    /// This digest is the contract store version exchanged when opening a channel.
    /// Hashes that are not valid hex contribute nothing.
    pub fn sha256_sum(&self) -> Vec<u8> {
        let mut hasher = Sha256::new();
        for handler in [&self.lib_signatures, &self.vpc, &self.ms_contract] {
            hasher.update(hex::decode(&handler.hash_bin_runtime_file).unwrap_or_default());
        }
        hasher.finalize().to_vec()
    }
}
