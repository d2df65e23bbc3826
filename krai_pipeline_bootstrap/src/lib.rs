// /////////////////////////////////////////////////////////////////////////////
// KRAI Pipeline
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

// Production code safety enforced via CI and `make lint-strict`
// (lib/bins checked separately from tests - tests may use unwrap/expect)

//! # Bootstrap Module
//!
//! The bootstrap module sits outside the enterprise application layers
//! (domain, application, infrastructure) and provides:
//!
//! - **Entry point scaffolding** - exit code mapping for CLI processes
//! - **Signal handling** - graceful shutdown on SIGTERM/SIGINT
//! - **Cancellation** - clone-able tokens passed into async tasks
//! - **Bootstrap logging** - a minimal logging trait usable before the
//!   full tracing stack is configured
//!
//! The application wires these at its composition root; nothing in here
//! depends on the domain.

pub mod exit_code;
pub mod logger;
pub mod shutdown;

pub use exit_code::ExitCode;
pub use logger::{BootstrapLogger, ConsoleLogger, NoopLogger};
pub use shutdown::{CancellationToken, ShutdownCoordinator, DEFAULT_GRACE_PERIOD_SECS};
