pub mod config;
pub mod daemon;
pub mod handler;
pub mod sessions;
pub mod socket;
