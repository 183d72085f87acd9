use anyhow::{anyhow, Context, Result};
use clap::Parser;
use log::info;

use beakfs::cli::{parse_size, Cli, Commands, ScanOpts};
use beakfs::filesystem::RealFileSystem;
use beakfs::forward::{ForwardConfig, ForwardEngine};
use beakfs::fuse_host::{mount_forward, mount_reverse};
use beakfs::matchglob::Match;
use beakfs::reverse::{discover_points_in_time, select_point_in_time, ReverseEngine};

fn build_config(opts: &ScanOpts) -> Result<ForwardConfig> {
    let mut config = ForwardConfig { forced_depth: opts.depth, ..ForwardConfig::default() };
    for pattern in &opts.include {
        config.filters.add_include(pattern).map_err(|e| anyhow!(e))?;
    }
    for pattern in &opts.exclude {
        config.filters.add_exclude(pattern).map_err(|e| anyhow!(e))?;
    }
    for pattern in &opts.trigger_glob {
        let mut m = Match::new();
        m.use_pattern(pattern).map_err(|e| anyhow!(e))?;
        config.trigger_globs.push(m);
    }
    config.target_size = parse_size(&opts.target_size).map_err(|e| anyhow!(e))?;
    config.trigger_size = match &opts.trigger_size {
        Some(s) => parse_size(s).map_err(|e| anyhow!(e))?,
        None => 2 * config.target_size,
    };
    config.message = opts.message.clone();
    Ok(config)
}

fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();
    match &cli.command {
        Commands::Scan { source, opts } => {
            let config = build_config(opts)?;
            let engine = ForwardEngine::scan(Box::new(RealFileSystem::new()), source.clone(), config)
                .with_context(|| format!("scanning {}", source.display()))?;
            let names = engine.readdir("")?;
            info!(target: "forward", "scanned {}: root lists {} entries", source.display(), names.len());
            println!("scanned {}: root lists {} entries", source.display(), names.len());
            Ok(())
        }
        Commands::Mount { source, mount_point, opts } => {
            let config = build_config(opts)?;
            let engine = ForwardEngine::scan(Box::new(RealFileSystem::new()), source.clone(), config)
                .with_context(|| format!("scanning {}", source.display()))?;
            info!(target: "fuse", "mounting forward view of {} at {}", source.display(), mount_point.display());
            mount_forward(engine, mount_point.to_str().ok_or_else(|| anyhow!("mount point is not valid UTF-8"))?)
                .with_context(|| format!("mounting {}", mount_point.display()))
        }
        Commands::ReverseMount { source, mount_point, point_in_time } => {
            let fs = RealFileSystem::new();
            let points = discover_points_in_time(&fs, source).map_err(|e| anyhow!(e))?;
            let root_abspath = if points.is_empty() {
                source.clone()
            } else {
                select_point_in_time(&points, point_in_time).map_err(|e| anyhow!(e))?.abspath
            };
            let engine = ReverseEngine::mount(Box::new(RealFileSystem::new()), root_abspath.clone())
                .with_context(|| format!("mounting manifest tree at {}", root_abspath.display()))?;
            info!(target: "fuse", "mounting reverse view of {} at {}", root_abspath.display(), mount_point.display());
            mount_reverse(engine, mount_point.to_str().ok_or_else(|| anyhow!("mount point is not valid UTF-8"))?)
                .with_context(|| format!("mounting {}", mount_point.display()))
        }
    }
}
