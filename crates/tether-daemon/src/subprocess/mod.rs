//! Backend process supervision.

mod diagnostics;
pub mod supervisor;

pub use diagnostics::DiagnosticBuffer;
pub use supervisor::{
    BackendEvent, BackendSender, ExitReport, ProcessSupervisor, SupervisorConfig, SupervisorError,
};
