pub mod archive;
pub mod backup;
pub mod config;
pub mod export;
