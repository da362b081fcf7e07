//! VXLAN overlay CNI plugin
//!
//! Provisions one VXLAN broadcast domain per logical network and attaches
//! containers to it through macvlan slave interfaces:
//! - discovers or creates the paired vxlan/macvlan host interfaces and the
//!   policy-routing bypass for each network, idempotently
//! - serializes all mutations to one network across process invocations
//!   with a named filesystem lock
//! - delegates address allocation to an external IPAM executable
//! - creates and deletes per-container link endpoints inside their network
//!   namespaces

pub mod commands;
pub mod config;
pub mod error;
pub mod hostiface;
pub mod ipam;
pub mod lock;
pub mod netstate;
pub mod plugin;
pub mod types;

// Re-export commonly used items
pub use config::{Config, NetworkSpec};
pub use error::CniError;
pub use hostiface::HostInterface;
pub use plugin::VxlanPlugin;
