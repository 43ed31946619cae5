//! Task Judge - compiles, runs and scores the solutions of a task package
//!
//! - `engine`: compilation, executor backends, output judging
//! - `cache`: content-hash keyed results
//! - `scheduler`: job matrix, worker pool and live table
//! - `scoring`: contest types
//! - `validator`: expected scores regression check

pub mod cache;
pub mod config;
pub mod core;
pub mod engine;
pub mod package;
pub mod scheduler;
pub mod scoring;
pub mod validator;
