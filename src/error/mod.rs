use thiserror::Error;

/// Exit code for faults caught at the top level rather than raised by a
/// component
pub const EXIT_UNEXPECTED: i32 = 99;

/// Failure taxonomy for one plugin invocation. Each variant maps to a
/// process exit code understood by the calling orchestrator.
#[derive(Debug, Error)]
pub enum CniError {
    /// `CNI_COMMAND` missing or unrecognized
    #[error("CNI_COMMAND was not set, or set to an invalid value: {0:?}")]
    InvalidCommand(String),

    /// Stdin could not be read or parsed as a network configuration
    #[error("failed to parse STDIN: {0:#}")]
    Parse(anyhow::Error),

    /// No network name could be resolved for this request
    #[error("no network specified")]
    NoNetwork,

    /// A name was resolved but no configured network matches it
    #[error("no matching network configured for {0:?}")]
    NoMatchingNetwork(String),

    /// The per-network lock file could not be opened or locked
    #[error("failed to acquire network lock: {0:#}")]
    Lock(anyhow::Error),

    /// A link/address/route/rule/namespace operation failed
    #[error("host interface operation failed: {0:#}")]
    Interface(anyhow::Error),

    /// The IPAM executable failed, timed out, or returned no usable address
    #[error("IPAM failure: {0:#}")]
    Allocation(anyhow::Error),

    /// Not enough data to build the success payload
    #[error("could not assemble result: {0}")]
    ResultAssembly(String),
}

impl CniError {
    /// The process exit code reported to the calling orchestrator
    pub fn exit_code(&self) -> i32 {
        match self {
            CniError::InvalidCommand(_) => 4,
            CniError::Parse(_) => 6,
            CniError::NoNetwork | CniError::NoMatchingNetwork(_) => 7,
            CniError::Lock(_) => 10,
            CniError::Interface(_) | CniError::Allocation(_) | CniError::ResultAssembly(_) => 11,
        }
    }
}
