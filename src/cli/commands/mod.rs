pub mod config;
pub mod deploy;
pub mod validate;
