pub mod archive;
pub mod config;
pub mod controller;
pub mod error;
pub mod launcher;
pub mod metadata_store;
pub mod operations;
pub mod port_alloc;
pub mod port_probe;
pub mod scaffold;

pub use controller::{Action, ControllerHandle, ReconcileReport, SiteController};
pub use error::LifecycleError;
