// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Middleware modules (authentication, security, etc.).

pub mod auth;
pub mod security;
pub mod service_auth;

pub use auth::{require_auth, AuthUser, IdentityClaims};
pub use service_auth::{require_internal_caller, require_push_sender};
