pub mod config;
pub mod error;
pub mod export;
pub mod model;
pub mod pipeline;
pub mod queue;
pub mod registry;
pub mod resume;
pub mod series;
pub mod session;
pub mod source;
pub mod store;
