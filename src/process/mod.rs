pub mod record;
pub mod spec;
pub mod supervisor;

pub use record::{ProcessRecord, RunLayout};
pub use spec::{HostTemplate, ProcessSpec};
pub use supervisor::{Launch, LifecycleState, ProcessHandle, ProcessSupervisor, StopOutcome};
