//! HTTP request handlers.

pub mod auctions;
pub mod health;
pub mod search;

pub use health::health_check;
