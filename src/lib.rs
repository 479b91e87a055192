//! Compiler for map themes: expands builtin layer references, shared tag
//! renderings and overrides into self-contained theme documents, built on an
//! algebra of OpenStreetMap tag filters.

pub mod app;
pub mod config;
pub mod convert;
pub mod model;
pub mod prepare;
pub mod special;
pub mod tags;
pub mod utils;
