//! Typed engine errors (spec §7).
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    /// An atom lookup saw a `/`. Programmer error; fatal.
    #[error("invalid atom name, contains '/': {0:?}")]
    InvalidName(String),

    /// A glob pattern failed to compile. Fatal at configuration time.
    #[error("invalid glob pattern: {0:?}")]
    InvalidGlob(String),

    /// No manifest found at the reverse-mount root. Fatal.
    #[error("not a beak archive: no manifest found at {0}")]
    NotABeakArchive(String),

    /// Manifest header/version mismatch or unparseable line. The manifest
    /// (and its point-in-time) is discarded; other points remain available.
    #[error("manifest corrupt at {0}: {1}")]
    ManifestCorrupt(String, String),

    /// Two retained paths collide once lowercased. Fatal scan-time error.
    #[error("case collision between {0:?} and {1:?}")]
    CaseCollision(String, String),

    /// Underlying open/pread/readlink failure.
    #[error("underlying I/O error on {0}: {1}")]
    UnderlyingIo(String, #[source] std::io::Error),

    /// Unknown path at serve time.
    #[error("not found: {0}")]
    NotFound(String),
}

impl EngineError {
    /// Maps to the libc errno the FUSE host should reply with.
    pub fn to_errno(&self) -> i32 {
        match self {
            EngineError::NotFound(_) => libc::ENOENT,
            EngineError::UnderlyingIo(_, _) => libc::EIO,
            EngineError::NotABeakArchive(_) => libc::ENOENT,
            EngineError::ManifestCorrupt(_, _) => libc::ENOENT,
            EngineError::CaseCollision(_, _) => libc::EINVAL,
            EngineError::InvalidGlob(_) => libc::EINVAL,
            EngineError::InvalidName(_) => libc::EINVAL,
        }
    }
}
