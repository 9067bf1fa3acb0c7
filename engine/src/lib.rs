pub mod chain_tracker;
pub mod configuration;
mod error;
pub mod source;
pub mod stream;
pub mod testing;

pub use self::chain_tracker::{ChainTracker, HeadUpdate, StartingCursorValidation};
pub use self::configuration::{StreamConfiguration, StreamEngineOptions};
pub use self::error::{ChainTrackerError, ChainTrackerErrorExt, EngineError};
pub use self::source::{BlockSource, CursorTag};
pub use self::stream::StreamEngine;
