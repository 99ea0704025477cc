pub mod catalog;
pub mod config;
pub mod error;
pub mod platform;
pub mod playlist;
pub mod protocol;
pub mod settings;
pub mod store;

pub use catalog::{Catalog, Pack, SourceKind, Station};
pub use config::Config;
pub use error::{RadioError, Result};
pub use protocol::{Intent, Snapshot, StreamStatus};
pub use settings::Settings;
