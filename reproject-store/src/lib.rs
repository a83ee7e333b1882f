#![forbid(unsafe_code)]

mod cursor;
mod engine;
mod error;
mod event;
mod store;

pub use cursor::*;
pub use engine::*;
pub use error::*;
pub use event::*;
pub use store::*;
