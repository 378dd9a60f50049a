// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
mod bus;
mod events;

pub use bus::{BusError, EventBus};
pub use events::{
    AgentEvent, DenialReason, DiagnosticLevel, ErrorCode, PermissionScope, PolicyDecision,
    RememberPolicy,
};
