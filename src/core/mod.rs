//! Task graph model: definitions, fingerprints and validation.

pub mod dag;
pub mod fingerprint;
pub mod task;
pub mod types;
