//! Scenario tests for the item pipeline and the orchestrator.
//!
//! Both run against [fake_client::FakeArchive] and a temporary save directory.

#[cfg(test)]
mod orchestrator_test;
