//! Integration test suite for foreman.
//!
//! These tests drive the store, lifecycle manager, merge coordinator,
//! health monitor and control loop together against scripted workers and
//! temporary git repositories.
//!
//! # Test Categories
//!
//! - `workflow_e2e`: Task from queue to merged commit, and bus delivery
//! - `parallel_agents`: One live instance per agent type
//! - `conflict_resolution`: Merge ordering, conflicts and cleanup
//! - `recovery`: Crash escalation, zombie reaping and freeze handling
//!
//! # CI Compatibility
//!
//! Workers are in-memory fakes; only `git` is required on the host.

mod fixtures;

mod conflict_resolution;
mod parallel_agents;
mod recovery;
mod workflow_e2e;
