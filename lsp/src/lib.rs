//! Supervised, pooled language server sessions.
//!
//! Layers, leaves first: [`codec`] frames JSON-RPC over byte streams,
//! [`Supervisor`] owns one child process per generation, [`ToolingGuard`]
//! and [`LifecycleHealth`] gate calls, and [`SessionPool`] leases sessions.

pub mod codec;
pub mod diagnostics;
pub mod error;
pub mod guard;
pub mod lifecycle;
pub mod metrics;
pub mod pool;
pub mod protocol;
pub mod supervisor;
pub mod types;

#[cfg(any(test, feature = "test-support"))]
pub mod testing;

pub use diagnostics::{BufferFlags, DiagnosticsBuffer};
pub use error::{LspError, LspErrorKind};
pub use guard::{GuardSnapshot, RunOptions, ToolingGuard};
pub use lifecycle::{LifecycleHealth, LifecycleSnapshot};
pub use metrics::{MethodSnapshot, RequestMetrics};
pub use pool::{Lease, PoolingSnapshot, SessionPool, SessionState, session_key};
pub use protocol::CapabilityMask;
pub use supervisor::{
    Launcher, LifecycleObserver, NotificationSink, ProcessLauncher, RequestOptions, Supervisor,
    SupervisorState,
};
pub use types::{
    CommandSpec, GuardOptions, LifecycleEvent, LifecycleOptions, SessionOptions, SupervisorOptions,
};
