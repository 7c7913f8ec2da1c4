pub mod config;
pub mod entities;
pub mod entity;
pub mod errors;
pub mod harness;
pub mod mapper;
pub mod persistence;
pub mod query;
pub mod session;
pub mod store;
pub mod tracker;

pub use config::StoreConfig;
pub use entity::{Entity, Model};
pub use errors::{Result, RuntimeError};
pub use session::{SaveReport, Session};
pub use store::Store;
