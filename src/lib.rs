//! File Reader Server Library
//!
//! Converts local files to markdown behind a content-addressed cache.
//!
//! # Modules
//!
//! - `cache`: namespaced, size-bounded on-disk LRU cache
//! - `parsers`: parser registry, lazy loader and format adapters
//! - `ocr`: text recognition backends for images
//! - `reader`: batch orchestration over storage, cache and parsers
//! - `mcp`: tool-call protocol over HTTP or stdio

pub mod cache;
pub mod config;
pub mod error;
pub mod mcp;
pub mod ocr;
pub mod parsers;
pub mod reader;
pub mod state;
