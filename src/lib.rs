pub mod completion;
pub mod config;
pub mod cursor;
pub mod dictionary;
pub mod field;
pub mod mutator;
pub mod storage;
pub mod store;
pub mod watcher;
