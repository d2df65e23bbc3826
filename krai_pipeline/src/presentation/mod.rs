// /////////////////////////////////////////////////////////////////////////////
// KRAI Pipeline
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! Presentation layer: the validation front door and the CLI.

pub mod cli;
pub mod validation;

pub use validation::{MultipartPart, RequestHead, RequestValidator, ValidationErrorCode, ValidationFailure};
