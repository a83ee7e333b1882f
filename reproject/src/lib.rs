#![forbid(unsafe_code)]

mod config;
mod engine;
mod error;
mod executor;
mod migration;
mod plan;
mod projector;
mod replay;
mod table;
mod version;
mod view_schema;

pub mod tasks;

pub use config::*;
pub use engine::*;
pub use error::*;
pub use executor::*;
pub use migration::*;
pub use plan::*;
pub use projector::*;
pub use replay::*;
pub use table::*;
pub use version::*;
pub use view_schema::*;

pub use reproject_store as store;
