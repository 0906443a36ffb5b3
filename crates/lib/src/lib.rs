//! # Atomic system upgrade and rollback
//!
//! Versions of the operating system are committed as full trees into one or
//! more repositories. Rolling back checks a version out next to the live
//! directories and swaps it in with renames, guarded by a persistent
//! progress ledger so that an interrupted swap is either finished or undone
//! on the next boot.

pub mod bootloader;
pub mod branch;
pub mod cli;
pub mod config;
mod error;
pub mod ledger;
pub mod lock;
pub mod notify;
pub mod progress;
pub mod replace;
pub mod repo;
pub mod space;
pub mod upgrader;
pub mod worker;

pub use error::{classify, Error};
