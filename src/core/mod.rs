//! Core environment logic: types, parsing, recipe and installer resolution, normalization.

pub mod config;
pub mod environment;
pub mod error;
pub mod hasher;
pub mod installer;
pub mod parser;
pub mod recipe;
pub mod types;
