//! Recurring invoicing, promotional campaigns and referral discounts for reseller panels.
//!
//! `engine` holds the pure billing rules; `services` runs them against Postgres.

pub mod config;
pub mod dtos;
pub mod engine;
pub mod error;
pub mod handlers;
pub mod middleware;
pub mod models;
pub mod services;
pub mod startup;

pub use startup::AppState;
