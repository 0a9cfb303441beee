//! Integration test modules

mod agent;
mod provider;
mod store;
