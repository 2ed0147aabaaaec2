pub mod cli;
pub mod config;
pub mod controller;
pub mod crd;
pub mod plugin;
pub mod server;
pub mod trafficrouting;

pub use crate::controller::{reconcile, Context, ReconcileError};
