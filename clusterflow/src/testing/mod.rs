//! In-memory fakes and fixtures for exercising steps and workflows without
//! a cloud.
//!
//! This module provides:
//! - Fake compute and network providers with call counters and failure
//!   injection
//! - A task store that fails on demand
//! - A recording step handler
//! - Task and store fixtures

mod fixtures;
mod mocks;
mod providers;
mod stores;

pub use fixtures::{blocks, seeded_store, two_step_task};
pub use mocks::RecordingHandler;
pub use providers::{FakeNodeProvider, FakeVpcNetwork};
pub use stores::FlakyTaskStore;
