//! A [`DeviceDriver`](policy_engine::DeviceDriver) whose device is a
//! canonical YAML configuration file.
//!
//! Refreshing reads and validates the file; applying a finalized decision
//! rewrites it in place and records the change in the decision log.
//!
//! ```rust,no_run
//! use std::path::Path;
//!
//! use file_driver::{settings, FileDriver};
//! use policy_engine::{DeviceDriver, PolicyEngine};
//!
//! # async fn example() -> anyhow::Result<()> {
//! let settings = settings::load(Path::new("rulewright.yaml"))?;
//! let driver = FileDriver::from_settings(&settings).await?;
//! let engine = PolicyEngine::new(settings.engine.clone());
//! driver.refresh_into(&engine).await?;
//! # Ok(())
//! # }
//! ```

pub mod apply;
mod driver;
pub mod settings;

pub use apply::AppliedChange;
pub use driver::FileDriver;
pub use settings::DriverSettings;
