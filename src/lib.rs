//! Core library for the Monkey job orchestrator.
//!
//! Jobs are submitted against a named provider, persisted as `QUEUED`, and
//! driven through machine provisioning, dependency installs, setup, the run
//! itself and cleanup. A periodic reconciliation loop claims queued jobs and
//! repairs jobs whose machines died, stalled or leaked.

pub mod api;
pub mod clock;
pub mod config;
pub mod context;
pub mod dispatch;
pub mod instance;
pub mod job;
pub mod monkeyfs;
pub mod provider;
pub mod provider_store;
pub mod reconcile;
pub mod remote;
pub mod store;
pub mod test_support;

pub use api::{ArtifactQuery, CheckResponse, SubmitError, SubmitResponse};
pub use clock::{Clock, FakeClock, SystemClock};
pub use config::{ConfigError, CoreConfig};
pub use context::{ContextError, Orchestrator};
pub use dispatch::{DispatchError, DispatchOutcome, Dispatcher};
pub use instance::{Instance, InstanceDetails, InstanceError};
pub use job::{JobRecord, JobSpec, JobState, JobUidGenerator, SpecError};
pub use monkeyfs::{ArtifactKind, MonkeyFs, MonkeyFsError};
pub use provider::{Provider, ProviderConfig, ProviderError, ProviderKind, ProviderRegistry};
pub use provider_store::{ProviderStore, ProviderStoreError};
pub use reconcile::{DispatchPool, DispatchStatus, PassReport, ReconciliationLoop};
pub use remote::{RemoteError, RemoteRunner};
pub use store::{FileJobStore, JobStore, MemoryJobStore, StoreError};
