//! Application module
//!
//! Wiring of the daemon: service construction, background tasks and the
//! supervised plugin lifecycle.

pub mod builder;
pub mod core;
pub mod services;
pub mod tasks;

pub use builder::ApplicationBuilder;
pub use self::core::Application;
pub use services::ApplicationServices;
