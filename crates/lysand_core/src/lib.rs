/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

pub mod config;
pub mod content;
pub mod error;
pub mod logging;
pub mod media;
pub mod model;
pub mod note_db;
pub mod notes;
pub mod object_fetch;
pub mod routes;
pub mod serialize;
pub mod thread;
pub mod users;
pub mod visibility;

pub use config::ServerConfig;
pub use error::{ResolveError, ResolveResult};
pub use model::{Note, User};
pub use note_db::NoteDb;
pub use notes::{NoteDraft, NoteEngine, NotePatch};

pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
