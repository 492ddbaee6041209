//! `tasksync`: offline-first sync engine for tasks, lists and labels.

pub mod cache;
pub mod config;
pub mod remote;
pub mod store;
pub mod sync;
