//! Payment result reconciliation for the barbershop kiosk.
//!
//! The payment terminal's native bridge reports outcomes over several
//! unreliable channels. This crate normalizes whatever arrives, lets exactly
//! one result through per armed attempt, and exposes the whole thing over a
//! small HTTP surface for the bridge and the kiosk UI.

pub mod api;
pub mod cache;
pub mod config;
pub mod error;
pub mod health;
pub mod logging;
pub mod middleware;
pub mod payments;
pub mod services;
pub mod workers;
