//! Command-line surface (spec §1: explicitly out of scope for
//! *correctness* requirements, but wired end to end the way the teacher's
//! `main.rs` wires `Commands::Index`/`Commands::Mount` into `tar::index`/
//! `fs::mount`). Argument parsing itself carries no engine semantics.
use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Mirrors a source directory as a synthetic collection of content-
/// addressed tar archives, or reconstructs one back into a source tree.
#[derive(Parser)]
#[clap(author, version, about, long_about = None)]
pub struct Cli {
    #[clap(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Scan a source tree and report the storage directories and tars it
    /// would synthesize, without mounting anything.
    Scan {
        /// Directory to scan.
        #[clap(value_parser)]
        source: PathBuf,

        #[clap(flatten)]
        opts: ScanOpts,
    },

    /// Mount a synthetic forward view of a source tree.
    Mount {
        /// Directory to scan.
        #[clap(value_parser)]
        source: PathBuf,

        /// Mount point.
        #[clap(value_parser)]
        mount_point: PathBuf,

        #[clap(flatten)]
        opts: ScanOpts,
    },

    /// Mount a reverse-reconstructed view of a tree of manifest archives.
    ReverseMount {
        /// Directory holding the manifest archive tree (or a tree of
        /// point-in-time subdirectories, each holding one).
        #[clap(value_parser)]
        source: PathBuf,

        /// Mount point.
        #[clap(value_parser)]
        mount_point: PathBuf,

        /// `@N` selector; `@0` (the default) is the most recent point in
        /// time. Ignored if `source` is itself a single point in time
        /// (no recognizable point-in-time subdirectories).
        #[clap(long, default_value = "@0")]
        point_in_time: String,
    },
}

#[derive(clap::Args, Clone)]
pub struct ScanOpts {
    /// Forced storage-directory depth (spec §4.4).
    #[clap(long, default_value_t = 2)]
    pub depth: u32,

    /// Inclusion glob, may be repeated; applied in order with `--exclude`.
    #[clap(long = "include")]
    pub include: Vec<String>,

    /// Exclusion glob, may be repeated.
    #[clap(long = "exclude")]
    pub exclude: Vec<String>,

    /// Glob that forces a directory to become a storage directory.
    #[clap(long = "trigger-glob")]
    pub trigger_glob: Vec<String>,

    /// Target tar size, e.g. `10M`. Accepts `K`/`M`/`G`/`T` suffixes.
    #[clap(long, default_value = "10M")]
    pub target_size: String,

    /// Size at which a directory is forced to become a storage directory,
    /// e.g. `20M`. Defaults to twice `target-size`.
    #[clap(long)]
    pub trigger_size: Option<String>,

    /// One-line message recorded in every manifest header.
    #[clap(long, default_value = "")]
    pub message: String,
}

/// Parses `target-size`-style strings (`10M`, `512K`, `2G`, `1T`, or a
/// bare byte count) per spec §6.
pub fn parse_size(s: &str) -> Result<u64, String> {
    let s = s.trim();
    if s.is_empty() {
        return Err("empty size".to_string());
    }
    let (digits, mult) = match s.chars().last().unwrap() {
        'K' | 'k' => (&s[..s.len() - 1], 1024u64),
        'M' | 'm' => (&s[..s.len() - 1], 1024 * 1024),
        'G' | 'g' => (&s[..s.len() - 1], 1024 * 1024 * 1024),
        'T' | 't' => (&s[..s.len() - 1], 1024 * 1024 * 1024 * 1024),
        _ => (s, 1),
    };
    let n: u64 = digits.trim().parse().map_err(|_| format!("invalid size {s:?}"))?;
    Ok(n * mult)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_suffixed_sizes() {
        assert_eq!(parse_size("10M").unwrap(), 10 * 1024 * 1024);
        assert_eq!(parse_size("512K").unwrap(), 512 * 1024);
        assert_eq!(parse_size("2G").unwrap(), 2 * 1024 * 1024 * 1024);
        assert_eq!(parse_size("4096").unwrap(), 4096);
    }

    #[test]
    fn rejects_garbage_sizes() {
        assert!(parse_size("").is_err());
        assert!(parse_size("abc").is_err());
    }
}
