//! Device plugin domain: devices, their health, how they get allocated and
//! how the per-class plugins are kept alive.

pub mod allocation;
pub mod assignment;
pub mod device;
pub mod health;
pub mod inventory;
pub mod lifecycle;
pub mod mock;
pub mod reconcile;
pub mod resource;
pub mod supervisor;
