// Aggregates the upstream transport seam, challenge detection, and the distress handling used by the session layer.

pub mod core;
pub mod detectors;
pub mod solvers;
