// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT

//! Envelope construction and the structural/semantic validator for
//! agent-produced JSON payloads (plan/delivery/review).

pub mod models;
pub mod validator;

pub use models::*;
pub use validator::{validate_reply, validate_value, PayloadKind, ProtocolValidationResult, ValidationError};
