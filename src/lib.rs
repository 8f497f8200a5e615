pub mod assistant;
pub mod audio;
pub mod config;
pub mod error;
pub mod net;
pub mod tools;
pub mod transcript;
