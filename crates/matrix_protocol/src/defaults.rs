//! Canonical default values shared across the framework.

/// Separator joining multi-part intranet call parameters.
pub const SPLIT: &str = "|";

pub const DEFAULT_PUBLIC_HOST: &str = "0.0.0.0";
pub const DEFAULT_PUBLIC_PORT: u16 = 8080;
pub const DEFAULT_INTRANET_HOST: &str = "0.0.0.0";
pub const DEFAULT_INTRANET_PORT: u16 = 8081;

/// Idle connection cap per intranet endpoint.
pub const DEFAULT_MAX_IDLE_CONNS_PER_HOST: usize = 10;
/// Pooled connections idle beyond this are closed by the janitor.
pub const DEFAULT_CONNECTION_EXPIRED_SECS: u64 = 300;
pub const DEFAULT_WRITE_TIMEOUT_SECS: u64 = 5;

/// Shared default cache sizing (MiB / seconds).
pub const DEFAULT_CACHE_MAX_MEN_MIB: u64 = 100;
pub const DEFAULT_CACHE_TTL_SECS: u64 = 1_800;

pub const DEFAULT_HEARTBEAT_REPORT_GAP_SECS: u64 = 30;

/// Cap on concurrently running in-process background tasks.
pub const DEFAULT_MAX_IN_PROCESS_TASKS: usize = 100;

/// Reserved version for internal/platform events; skips metadata lookup.
pub const INTERNAL_VERSION: &str = "0.0.0";
