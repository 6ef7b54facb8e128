/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("no uri or note payload provided")]
    MissingInput,
    #[error("uri {0} is of a local note, but it could not be parsed")]
    MalformedLocalUri(String),
    #[error("invalid uri to parse: {0}")]
    InvalidUri(String),
    #[error("invalid object type: {0}")]
    InvalidObjectType(String),
    #[error("invalid object author: {0}")]
    InvalidAuthor(String),
    #[error("invalid note payload: {0}")]
    InvalidPayload(String),
    #[error("object not found: {0}")]
    NotFound(String),
    #[error("cannot refetch a local note (it is not remote): {0}")]
    NotRemote(String),
    #[error("resolution depth {depth} exceeded at {uri}")]
    DepthExceeded { uri: String, depth: u32 },
    #[error("resolution cycle at {0}")]
    Cycle(String),
    #[error("remote fetch budget exhausted at {0}")]
    FetchBudgetExceeded(String),
    #[error("store invariant violated: {0}")]
    Invariant(String),
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

impl ResolveError {
    /// Outcomes a nested link (reply, quote) may swallow: the link stays
    /// unset and the outer resolution carries on.
    pub fn is_soft(&self) -> bool {
        matches!(
            self,
            ResolveError::NotFound(_)
                | ResolveError::InvalidUri(_)
                | ResolveError::InvalidObjectType(_)
                | ResolveError::InvalidAuthor(_)
                | ResolveError::InvalidPayload(_)
                | ResolveError::MalformedLocalUri(_)
                | ResolveError::DepthExceeded { .. }
                | ResolveError::Cycle(_)
                | ResolveError::FetchBudgetExceeded(_)
        )
    }

    /// Caller-side input problems, as opposed to store or invariant failures.
    pub fn is_input(&self) -> bool {
        matches!(
            self,
            ResolveError::MissingInput
                | ResolveError::MalformedLocalUri(_)
                | ResolveError::InvalidUri(_)
                | ResolveError::InvalidObjectType(_)
                | ResolveError::InvalidAuthor(_)
                | ResolveError::InvalidPayload(_)
                | ResolveError::NotRemote(_)
        )
    }
}

impl From<rusqlite::Error> for ResolveError {
    fn from(e: rusqlite::Error) -> Self {
        ResolveError::Store(e.into())
    }
}

pub type ResolveResult<T> = std::result::Result<T, ResolveError>;
