pub mod config;
pub mod decision;
pub mod error;
pub mod lock;
pub mod model;
pub mod reader;
pub mod recommender;
pub mod schedule;
pub mod scoring;
pub mod shutdown;
pub mod updater;

pub use config::RecommenderConfig;
pub use error::{RecoError, Result};
pub use model::{RecommendSettings, Snapshot};
pub use recommender::{Recommender, Status, UpdateJob};
