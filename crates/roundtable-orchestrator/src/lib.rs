// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT

pub mod agent;
pub mod history;
pub mod prompt;
pub mod run;
pub mod safety;

pub use agent::AgentId;
pub use run::{
    run as run_dialogue, run_with_invoker, Invoker, OrchestratorError, ProcessInvoker, RunLog, RunOutcome, RunRequest,
    RunStatus, TurnRecord,
};
pub use safety::SafetyPolicy;
