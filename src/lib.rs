pub mod adapter;
pub mod codec;
pub mod compactor;
pub mod config;
pub mod dispatcher;
pub mod engine;
pub mod limits;
pub mod model;
pub mod notify;
pub mod observability;
pub mod registry;
pub mod store;
pub mod wal;
