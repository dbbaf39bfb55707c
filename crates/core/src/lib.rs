//! Reactive behavior engine for AI characters: triggers, strategies,
//! action programs and blueprint graphs.

pub mod action;
pub mod blueprint;
pub mod capability;
pub mod catalog;
pub mod config;
pub mod error;
pub mod runtime;
pub mod schema;
pub mod strategy;
pub mod trigger;
pub mod types;
