//! Test doubles for the cloud link collaborators

pub mod mocks;
