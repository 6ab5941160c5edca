// Application layer - use cases and orchestration on top of the domain and
// the repository. `CardService` is what clients talk to.

pub mod aggregator;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod lifecycle;
pub mod service;

pub use aggregator::AccountAggregator;
pub use config::LedgerConfig;
pub use engine::LedgerEngine;
pub use error::*;
pub use events::CommitEvent;
pub use lifecycle::LifecycleManager;
pub use service::*;
