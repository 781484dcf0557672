//! API handlers module

pub mod catalog;
pub mod health;
pub mod turns;
