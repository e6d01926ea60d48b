//! Test utilities for the bulk writer and its benchmark harness.
//!
//! This crate provides utilities to facilitate testing of the bulk writer. See the modules for all
//! available utilities.

pub mod tracing;
