pub mod compat;
pub mod config;
pub mod db;
pub mod error;
pub mod mapping;
pub mod model;
pub mod notion;
pub mod store;
pub mod sync;
pub mod transform;
