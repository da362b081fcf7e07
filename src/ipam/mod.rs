//! Invocation of the external IPAM executable.
//!
//! The allocator is a separate program named by configuration and located
//! via `CNI_PATH`. It speaks a small environment-variable protocol: the
//! plugin sets `CNI_ARGS` to `CIDR=<subnet>;EXCLUDE_FIRST=<n>;EXCLUDE_LAST=<n>`
//! for allocation and `CIDR=<address>` for release, and reads the allocation
//! result back as CNI result JSON on stdout.

use anyhow::{anyhow, bail, Context, Result};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::debug;

use crate::types::Result as CniResult;

/// How long to wait for the IPAM executable
pub const DEFAULT_IPAM_TIMEOUT: Duration = Duration::from_secs(10);

/// Runs the external address allocator with a bounded deadline
pub struct IpamInvoker {
    executable: PathBuf,
    timeout: Duration,
}

impl IpamInvoker {
    pub fn new(executable: PathBuf) -> Self {
        Self {
            executable,
            timeout: DEFAULT_IPAM_TIMEOUT,
        }
    }

    /// Locate `plugin_type` in the `:`-separated `search_path`. Falls back
    /// to the first directory when nothing matches, so a missing executable
    /// only fails when it is actually invoked.
    pub fn from_search_path(search_path: &str, plugin_type: &str) -> Self {
        for dir in search_path.split(':').filter(|d| !d.is_empty()) {
            let candidate = Path::new(dir).join(plugin_type);
            if candidate.is_file() {
                return Self::new(candidate);
            }
        }
        let first = search_path.split(':').next().unwrap_or_default();
        Self::new(Path::new(first).join(plugin_type))
    }

    /// Override the deadline (used by tests)
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Request an address within `cidr`, reserving `exclude_first` and
    /// `exclude_last` addresses at the range boundaries. Fails when the
    /// result carries no usable address.
    pub async fn allocate(
        &self,
        cidr: &str,
        exclude_first: u32,
        exclude_last: u32,
    ) -> Result<CniResult> {
        debug!(cidr, "executing IPAM add");
        let stdout = self
            .run(&format!(
                "CIDR={cidr};EXCLUDE_FIRST={exclude_first};EXCLUDE_LAST={exclude_last}"
            ))
            .await?;
        let result: CniResult =
            serde_json::from_slice(&stdout).context("failed to parse IPAM result")?;
        if result.first_address().is_none() {
            bail!("no IP was found in the IPAM result");
        }
        Ok(result)
    }

    /// Return `address` to the allocator. Only the exit status matters.
    pub async fn release(&self, address: &str) -> Result<()> {
        debug!(address, "executing IPAM delete");
        self.run(&format!("CIDR={address}")).await?;
        Ok(())
    }

    async fn run(&self, cni_args: &str) -> Result<Vec<u8>> {
        let output = timeout(
            self.timeout,
            Command::new(&self.executable)
                .env("CNI_ARGS", cni_args)
                .stdin(Stdio::null())
                .kill_on_drop(true)
                .output(),
        )
        .await
        .map_err(|_| {
            // The executable may still complete after the deadline; any
            // allocation it made is not released here.
            anyhow!(
                "IPAM plugin {} deadline exceeded",
                self.executable.display()
            )
        })?
        .with_context(|| format!("failed to execute IPAM plugin {}", self.executable.display()))?;

        if !output.status.success() {
            bail!(
                "IPAM plugin {} exited with {}: {}",
                self.executable.display(),
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(output.stdout)
    }
}
