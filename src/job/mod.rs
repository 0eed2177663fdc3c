//! Job model: lifecycle states, persisted records, submitted specs and
//! identifiers.

pub mod record;
pub mod spec;
pub mod state;
pub mod uid;

pub use record::{JobRecord, PhaseTimings};
pub use spec::{CodeItem, DataItem, EnvType, JobSpec, MachineParams, RunConfig, SpecError};
pub use state::{JobState, ParseJobStateError};
pub use uid::{JobUidGenerator, is_job_uid};
