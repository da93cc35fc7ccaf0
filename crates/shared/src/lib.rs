pub mod config;
pub mod domain;
pub mod error;
pub mod hooks;
pub mod protocol;
