pub mod annotation;
pub mod commands;
pub mod config;
pub mod engine;
pub mod error;
pub mod link_index;
pub mod link_parser;
pub mod mark_sync;
pub mod metrics;
pub mod normalize;
pub mod origin;
pub mod persist;
pub mod reconciler;
pub mod resolver_queue;
pub mod search;
pub mod state_manager;
pub mod surface;

#[cfg(test)]
mod test_support;

pub use annotation::{AnnotationPatch, LinkAnnotation, LinkState, Variant};
pub use commands::LinkAction;
pub use config::EngineConfig;
pub use engine::Engine;
pub use error::{ConfigError, Result, SearchError, UnilinkError};
pub use normalize::normalize;
pub use origin::Origin;
pub use reconciler::{PageEvent, PageEventChannel};
pub use search::{InMemoryPages, PageCreator, PageRecord, PageSearch, SearchCandidate};
pub use surface::{AnnotatedSpan, EditorSurface};
