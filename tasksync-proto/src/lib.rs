//! Shared entity, action and record definitions for `TaskSync`.

pub mod action;
pub mod codec;
pub mod entity;
pub mod pending;
