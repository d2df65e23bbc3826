// /////////////////////////////////////////////////////////////////////////////
// KRAI Pipeline
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! Domain events and the broadcast port.

pub mod pipeline_events;

pub use pipeline_events::{BroadcastEventKind, BroadcastFrame, EventBroadcaster, NullBroadcaster};
