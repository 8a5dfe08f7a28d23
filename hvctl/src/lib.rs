//! Hyper-V management client with asynchronous job completion.
//!
//! Management calls against the hypervisor's object model return a numeric
//! code and, when the operation is long-running, a handle to a pending job.
//! The [`job`] module turns that two-shaped result into a single outcome by
//! polling the job to a terminal state. The [`vm`] and [`disk`] modules are
//! thin resource managers built on top of it.
//!
//! The crate never requests remote cancellation: a poll timeout is a local
//! give-up and the remote job keeps running. See [`job::resolve`].

pub mod disk;
pub mod error;
pub mod job;
pub mod session;
pub mod vm;

pub use disk::{DiskManager, GiB};
pub use error::{HvError, HvResult};
pub use job::{FailureKind, JobFailure, JobOutcome, JobState, PollSettings, ReturnCode, resolve};
pub use session::{JobHandle, ManagementSession, MethodOutput, ObjectHandle, ObjectPath};
pub use vm::{VirtualMachine, VirtualMachineManager};
