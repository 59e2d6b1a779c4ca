//! Cross-platform process-tree supervisor: spawn a child, atomically group
//! it with every descendant it spawns, and guarantee the whole tree is
//! terminated before the supervised call returns.

pub mod descendants;
pub mod error;
pub mod kill_domain;
pub mod options;
pub mod supervisor;
pub mod verifier;

pub use descendants::DescendantEnumerator;
pub use error::SupervisionError;
pub use kill_domain::{KillDomain, PlatformKillDomain};
pub use options::{ChildHandle, SpawnRequest, SupervisionOutcome, SupervisorOptions};
pub use supervisor::{CancellationToken, Supervisor};
pub use verifier::VerifierProbe;
