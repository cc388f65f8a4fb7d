use std::path::PathBuf;

use thiserror::Error;

/// Fatal conditions raised by the mirror itself, as opposed to the content
/// store ([`crate::store::StoreError`]).
#[derive(Debug, Error)]
pub enum MirrorError {
    #[error("page {page}: unrecognized history action {label:?}")]
    UnknownAction { page: String, label: String },

    #[error("page {page}: the current entry has no stored version to fetch")]
    NoStoredVersion { page: String },

    #[error("page {page}: cannot move, mirrored file {} is missing", .file.display())]
    MissingMovedFile { page: String, file: PathBuf },

    #[error("watermark exists but {} is not a repository", .root.display())]
    RepositoryMissing { root: PathBuf },

    #[error("`{command}` failed ({}): {stderr}", describe_status(.status))]
    Vcs {
        command: String,
        status: Option<i32>,
        stderr: String,
    },
}

fn describe_status(status: &Option<i32>) -> String {
    match status {
        Some(code) => format!("exit {code}"),
        None => "terminated by signal".to_string(),
    }
}
