//! Extraction of fishing trip data into derived tables, and grouped reads of
//! those tables.
//!
//! A run renders one SQL template per sheet, materializes each result as a
//! table named `<PREFIX><SHEET>_<context id>`, and hands the caller an
//! [`context::ExtractionContext`] owning those tables.

pub mod aggregation;
pub mod catalog;
pub mod config;
pub mod context;
pub mod database;
pub mod errors;
pub mod filter;
pub mod format;
pub mod pipeline;
pub mod pmfm;
pub mod reader;
pub mod referential;
pub mod result;
pub mod service;
pub mod sheet;
pub mod sql;
pub mod strata;
pub mod template;

#[cfg(test)]
pub mod testutil;
