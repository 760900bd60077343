//! Scenario tests: whole pipelines with real shell steps in a temporary
//! workspace, and a recording fake in place of SSH

#![cfg(unix)]

mod helpers;

mod artifact_passing;
mod cancellation;
mod conditions;
mod deploy;
mod environment;
mod retries;
mod stage_gating;
mod timeouts;
