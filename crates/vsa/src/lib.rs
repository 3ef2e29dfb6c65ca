pub mod canvas;
pub mod channel;
pub mod config;
pub mod events;
pub mod session;
pub mod tools;
pub mod transcript;
