// /////////////////////////////////////////////////////////////////////////////
// KRAI Pipeline
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! Shared-secret token verifier for standalone deployments.
//!
//! Production deployments verify JWTs at the auth collaborator and adapt
//! that service onto the `TokenVerifier` port. The CLI and small installs
//! use this single-token verifier configured from the environment.

use krai_pipeline_domain::{AuthenticatedUser, PipelineError, TokenVerifier};

/// Verifier accepting exactly one pre-shared token.
pub struct StaticTokenVerifier {
    token: String,
    user: AuthenticatedUser,
}

impl StaticTokenVerifier {
    pub fn new(token: impl Into<String>, user_id: impl Into<String>, permissions: Vec<String>) -> Self {
        Self {
            token: token.into(),
            user: AuthenticatedUser {
                user_id: user_id.into(),
                permissions,
            },
        }
    }

    /// A verifier granting `monitoring:read` to the given token
    pub fn monitoring(token: impl Into<String>) -> Self {
        Self::new(token, "monitoring", vec!["monitoring:read".to_string()])
    }
}

impl TokenVerifier for StaticTokenVerifier {
    fn verify(&self, token: &str) -> Result<AuthenticatedUser, PipelineError> {
        if token == self.token && !self.token.is_empty() {
            Ok(self.user.clone())
        } else {
            Err(PipelineError::validation_error("token not recognized"))
        }
    }
}
