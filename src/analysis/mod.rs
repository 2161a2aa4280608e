/// Read-side analysis of the stored history.
///
/// Submodules:
/// - `summary`: statistics and anomaly flags over a window of snapshots.

pub mod summary;
