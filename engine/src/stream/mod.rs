mod engine;

pub use self::engine::StreamEngine;
