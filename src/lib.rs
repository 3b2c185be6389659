#![allow(unused_assignments)] // thiserror/miette proc macros trigger false positives

pub mod cli;
pub mod config;
pub mod connection;
pub mod error;
pub mod inventory;
pub mod lifecycle;
pub mod listeners;
pub mod reconciler;
pub mod registry;
pub mod runner;
pub mod status;
pub mod util;
