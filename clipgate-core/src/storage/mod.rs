//! File lifecycle: the registry of produced files and the sweeps that delete
//! them.

mod probe;
mod reclaimer;
mod registry;

pub use probe::{DiskProbe, FsDiskProbe};
pub use reclaimer::{Reclaimer, SweepKind, SweepReport};
pub use registry::{FileRegistry, TrackedFile};
