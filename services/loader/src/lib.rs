//! Progressive Loader - staged retrieval of image pixel data over HTTP
//!
//! This library retrieves frames in several quality tiers and streams each
//! refinement to a consumer as soon as it arrives. It handles:
//!
//! - Retrieve plans: which frames each stage fetches, and in what order
//! - Per-stage options keyed by transfer syntax and retrieve type
//! - Byte-range requests, multipart envelopes and partial response reassembly
//! - Most-recent-value delivery, so slow consumers skip stale refinements
//!
//! # Example
//!
//! ```rust,no_run
//! use progressive_loader::prelude::*;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = LoaderConfig::load()?;
//!     let loader = ProgressiveLoader::from_config(&config)?;
//!
//!     let request = LoadRequest::new(vec![FrameTarget::new(
//!         "1.2.3.4",
//!         "https://pacs/dicomweb/studies/1/series/2/instances/3/frames/1",
//!     )])
//!     .with_configuration(config.retrieve.clone());
//!
//!     let handle = loader.load(request, Arc::new(LoadSession::new()));
//!     consume(&handle.frames[0], &LoggingSink::new()).await?;
//!     Ok(())
//! }
//! ```

pub mod channel;
pub mod config;
pub mod error;
pub mod fetcher;
pub mod loader;
pub mod multipart;
pub mod options;
pub mod reassembly;
pub mod sink;
pub mod stages;

// Re-export main types
pub use channel::{PendingResult, ProgressiveChannel};
pub use config::{
    ConfigValidationError, HttpAuthConfig, HttpConfig, LoaderConfig, LoggingConfig,
    MetricsConfig,
};
pub use error::{ChannelError, LoadError, SinkError};
pub use fetcher::{FetchRequest, FetchResult, RangeFetcher};
pub use loader::{
    FrameResult, FrameTarget, LoadHandle, LoadRequest, LoadSession, LoadSummary,
    ProgressiveLoader,
};
pub use multipart::{parse_envelope, Envelope, ParseError};
pub use options::{resolve_options, ByteRange, QualityStatus, RetrieveOptions, StageOptions};
pub use reassembly::{PartialBuffers, Ticket};
pub use sink::{consume, DecodeSink, LoggingSink};
pub use stages::{
    FetchInstruction, RetrieveConfiguration, RetrieveStage, Selector, StagePlan, StageResolver,
};

pub use async_trait::async_trait;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::channel::ProgressiveChannel;
    pub use crate::config::LoaderConfig;
    pub use crate::error::{ChannelError, LoadError, SinkError};
    pub use crate::loader::{FrameResult, FrameTarget, LoadRequest, LoadSession, ProgressiveLoader};
    pub use crate::sink::{consume, DecodeSink, LoggingSink};
    pub use crate::stages::{RetrieveConfiguration, RetrieveStage, Selector};
    pub use async_trait::async_trait;
}
