//! Process isolation core.
//!
//! The engine builds one sandbox per job: the supervisor clones a proxy
//! into fresh namespaces, the proxy assembles the private root and forks
//! the payload, and the supervisor waits on exit, deadline, ceilings and
//! cancellation.

pub mod cancel;
pub mod engine;
pub mod proxy;
pub mod supervisor;
pub mod types;

pub use cancel::CancelToken;
pub use engine::{Execution, ExecutionContext, LinuxEngine, SandboxEngine};
