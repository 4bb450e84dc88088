//! Test doubles for the broker seam and observer traits.

pub mod mocks;
