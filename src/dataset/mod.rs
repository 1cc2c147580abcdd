pub mod config;
pub mod error;
pub mod file_list;
pub mod pair;
pub mod patches;
pub mod pipeline;
pub mod progress;
pub mod split;
