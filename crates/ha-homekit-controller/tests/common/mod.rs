//! Common test utilities for the HomeKit controller
//!
//! A scripted in-memory pairing, a recording entity behavior and fixture
//! accessory trees.

#![allow(dead_code)]

mod fixtures;
mod mock_entity;
mod mock_pairing;

pub use fixtures::*;
pub use mock_entity::*;
pub use mock_pairing::*;
