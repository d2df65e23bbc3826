// /////////////////////////////////////////////////////////////////////////////
// KRAI Pipeline
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Process Exit Codes
//!
//! Canonical exit code mapping for the pipeline CLIs:
//!
//! - `0` - success
//! - `1` - business failure (a document failed processing, a lookup found
//!   nothing, validation rejected the input)
//! - `2` - setup failure (bad configuration, unreachable database, bad
//!   arguments)
//!
//! Scripts drive retries and paging off these codes, so the mapping is a
//! public contract.

/// Exit status for a pipeline process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitCode {
    /// The requested operation completed
    Success,
    /// The operation ran but the business outcome was a failure
    BusinessFailure,
    /// The process could not be set up (config, environment, connectivity)
    SetupFailure,
}

impl ExitCode {
    /// The numeric code handed to the OS
    pub fn code(&self) -> i32 {
        match self {
            ExitCode::Success => 0,
            ExitCode::BusinessFailure => 1,
            ExitCode::SetupFailure => 2,
        }
    }

    /// Terminates the current process with this code
    pub fn exit(self) -> ! {
        std::process::exit(self.code())
    }
}

impl From<ExitCode> for i32 {
    fn from(code: ExitCode) -> Self {
        code.code()
    }
}
