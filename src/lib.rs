//! rangekeeper - range-server recovery and failover
//!
//! A range server owns disjoint row ranges of sorted tables, logs every
//! mutation to a per-class commit log and records the ranges it owns in a
//! node-local metalog. This crate rebuilds that state after a restart and
//! moves the ranges of a failed server onto the survivors.

pub mod cli;
pub mod commitlog;
pub mod config;
pub mod crash_point;
pub mod failover;
pub mod metalog;
pub mod observability;
pub mod range;
pub mod recovery;
pub mod util;
