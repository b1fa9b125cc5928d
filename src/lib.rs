//! cloud-init-engine library
//!
//! A staged instance-configuration engine: resolve a datasource, process
//! user-data and vendor-data through part handlers, merge configuration and
//! run configuration modules under per-instance, per-boot or once-ever
//! semaphores.
//!
//! # Design Principles
//!
//! - **Safety First**: No unsafe code (`#![forbid(unsafe_code)]`)
//! - **Explicit context**: stages pass a [`cloud::Cloud`] to modules instead
//!   of sharing global state
//! - **Re-run safety**: a missing semaphore only ever causes a re-run
//! - **Backwards Compatible**: Parse existing cloud-config formats

pub mod cloud;
pub mod config;
pub mod datasources;
pub mod distro;
pub mod handlers;
pub mod modules;
pub mod network;
pub mod stages;
pub mod state;
pub mod template;
pub mod url_helper;
pub mod userdata;
pub mod util;

mod error;

pub use error::CloudInitError;
