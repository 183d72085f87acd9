//! `beakfs`: mirrors a source directory tree as a synthetic collection of
//! content-addressed tar archives (and back again) via a user-space
//! filesystem interface. See `SPEC_FULL.md` for the full design.
pub mod cli;
pub mod error;
pub mod filesystem;
pub mod forward;
pub mod fuse_host;
pub mod hash;
pub mod manifest;
pub mod matchglob;
pub mod path;
pub mod reverse;
pub mod tarentry;
pub mod tarfile;
