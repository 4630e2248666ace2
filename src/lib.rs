pub mod chain;
pub mod config;
pub mod logging;
pub mod messages;
pub mod messenger;
pub mod poll;
pub mod swap;
pub mod version;
