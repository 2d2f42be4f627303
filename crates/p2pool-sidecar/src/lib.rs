//! p2pool-sidecar: supervision, health monitoring and RPC plumbing for a P2Pool process.

pub mod client;
pub mod config;
mod health;
pub mod process;
pub mod status;
mod supervisor;
mod version;

pub use client::{BlockTemplate, RpcClient, RpcError, ShareResult, ShareStatus};
pub use config::{
    Endpoint, HealthPolicy, HostConfig, ProcessConfig, RestartPolicy, ShutdownPolicy,
    resolve_binary_path,
};
pub use health::{DEFAULT_PROBE_TIMEOUT, HealthProbe, HttpHealthProbe, ProbeError};
pub use process::{LaunchSpec, ProcessHandle, ProcessLauncher, SpawnError, SystemLauncher};
pub use status::{HttpStatusSource, StatusCache, StatusSnapshot, StatusSource};
pub use supervisor::{
    HealthReport, ProcessSupervisor, SupervisorConfig, SupervisorError, SupervisorState,
};
pub use version::{SIDECAR_VERSION, user_agent};
