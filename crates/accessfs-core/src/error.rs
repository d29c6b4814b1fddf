// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Error types for AccessFS Core

use std::io;

/// Core coordination error type
#[derive(thiserror::Error, Debug)]
pub enum CoreError {
    #[error("not found")]
    NotFound,
    #[error("permission denied")]
    PermissionDenied,
    #[error("no modification allowed")]
    NoModificationAllowed,
    #[error("not supported")]
    NotSupported,
    #[error("name not allowed")]
    InvalidName,
    #[error("too many open primitives")]
    TooManyOpenPrimitives,
    #[error("too many subscriptions")]
    TooManySubscriptions,
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

pub type CoreResult<T> = Result<T, CoreError>;
