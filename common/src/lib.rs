pub mod chain;
mod core;
pub mod message;

pub use self::core::{testing::new_test_cursor, testing::new_test_hash, Cursor, Hash};
