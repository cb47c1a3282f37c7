// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Splitting and roll-up policies.
//!
//! Policies are closed enumerations selected by name from configuration.
//! Start policies turn a workflow spec (or a parent element) into elements;
//! end policies turn a set of child elements into the parent's status.

pub mod end;
pub mod start;

pub use end::{EndPolicyArgs, EndPolicyKind, RollupResult};
pub use start::{SplitOutcome, StartPolicy, StartPolicyArgs, StartPolicyKind};
