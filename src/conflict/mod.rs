/// This module contains the first-updater-wins write check.
pub mod detection;
/// This module contains row/range locks and deadlock detection.
pub mod lock_table;
