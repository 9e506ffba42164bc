//! API handlers module

pub mod admin;
pub mod dashboard;
pub mod health;
pub mod modules;
pub mod query;
