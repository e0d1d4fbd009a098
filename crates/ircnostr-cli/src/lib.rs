//! IRC/Nostr bridge command-line runner

pub mod app;
pub mod cli;
