//! In-memory collaborators for tests and dry runs.
//!
//! Each fake records what it was asked to do so callers can assert on the
//! exact sequence of host mutations.

pub mod network;
pub mod probe;
pub mod supervisor;

pub use network::{FailPoint, FakeHostNetwork, Mutation};
pub use probe::{FakeContainerRuntime, ScriptedProbe};
pub use supervisor::{FakeSupervisor, SupervisorCall};
