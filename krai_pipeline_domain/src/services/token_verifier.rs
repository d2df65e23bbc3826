// /////////////////////////////////////////////////////////////////////////////
// KRAI Pipeline
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! Token verification port for the broadcast hub.
//!
//! Authentication itself lives outside the core. The hub only needs to
//! resolve a bearer token into a user id and permission list before
//! admitting a subscriber; how tokens are minted and validated is the
//! collaborator's business.

use crate::PipelineError;

/// A verified monitoring client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticatedUser {
    pub user_id: String,
    pub permissions: Vec<String>,
}

impl AuthenticatedUser {
    pub fn has_permission(&self, permission: &str) -> bool {
        self.permissions.iter().any(|p| p == permission)
    }
}

/// Resolves bearer tokens presented on monitoring connections.
pub trait TokenVerifier: Send + Sync {
    /// Returns the authenticated user, or a validation error for an
    /// invalid or expired token
    fn verify(&self, token: &str) -> Result<AuthenticatedUser, PipelineError>;
}
