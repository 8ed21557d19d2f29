//! level-cache: maintenance tool for a multi-tier segment cache.
//!
//! Opens the cache described by the config file, runs one command against
//! it, and dumps state back to disk after anything that mutates it.

use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::Context;
use bytes::Bytes;
use clap::Parser;
use serde_json::{json, Value};
use tracing::info;

use level_cache::config::{Cli, Command};
use level_cache::{AuxSlot, Cache, CacheConfig, MapAuxiliary, ObjectId};

type CliCache = Cache<MapAuxiliary<Value>>;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        "level_cache=debug"
    } else {
        "level_cache=info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| filter.into()),
        )
        .with_target(true)
        .init();

    info!("level-cache v{}", env!("CARGO_PKG_VERSION"));

    let config = CacheConfig::load(&cli.config)
        .with_context(|| format!("loading config {}", cli.config.display()))?;
    info!(
        meta_dir = %config.meta_dir.display(),
        tiers = config.tiers.len(),
        action_parallel = config.action_parallel,
        "Configuration loaded"
    );

    let cache: CliCache = Cache::open(config, &|_: AuxSlot| MapAuxiliary::new())
        .await
        .context("opening cache")?;

    let mutated = run(&cache, cli.command).await?;
    if mutated {
        cache.dump().await.context("dumping cache state")?;
    }
    cache.close().await?;
    Ok(())
}

/// Execute one command. Returns whether cache state changed.
async fn run(cache: &CliCache, command: Command) -> anyhow::Result<bool> {
    match command {
        Command::Stats => {
            println!("items: {}", cache.registry().len().await);
            for stats in cache.tier_stats().await {
                println!(
                    "tier {} ({}): {} segments, {} bytes, capacity {} ({:.1}%)",
                    stats.level,
                    stats.name,
                    stats.segment_count,
                    stats.bytes_used,
                    stats.capacity,
                    stats.usage_fraction() * 100.0
                );
            }
            Ok(false)
        }

        Command::Put { id, file, expire } => {
            let id = parse_id(&id)?;
            let data = tokio::fs::read(&file)
                .await
                .with_context(|| format!("reading {}", file.display()))?;
            let size = data.len() as u64;

            let item = cache
                .add_item(id, expire, size, json!({ "file": file.display().to_string() }))
                .await?;
            if size > 0 {
                cache.add_segment(&id, 0, Bytes::from(data)).await?;
            }
            println!(
                "{id}: {size} bytes in {} segments of {} bytes",
                item.segment_count(),
                item.seg_size
            );
            Ok(true)
        }

        Command::Get { id, start, end, out } => {
            let id = parse_id(&id)?;
            let Some(fetched) = cache.get(&id, start, end).await? else {
                anyhow::bail!("{id} is not in the cache");
            };

            for (idx, tier) in fetched.hit_segments.iter().zip(&fetched.hit_tiers) {
                println!("segment {idx}: {tier}");
            }
            for range in &fetched.missed {
                println!("missed: {}..{}", range.start, range.end);
            }

            if let Some(out) = out {
                anyhow::ensure!(
                    fetched.is_complete(),
                    "{} segment(s) missing, not writing {}",
                    fetched.missed.len(),
                    out.display()
                );
                let mut data = Vec::with_capacity(fetched.len());
                for chunk in &fetched.chunks {
                    data.extend_from_slice(chunk);
                }
                tokio::fs::write(&out, data)
                    .await
                    .with_context(|| format!("writing {}", out.display()))?;
                println!("wrote {} bytes to {}", fetched.len(), out.display());
            }
            // Hits were promoted, so tier contents changed.
            Ok(!fetched.is_empty())
        }

        Command::Del { id } => {
            let id = parse_id(&id)?;
            let existed = cache.del(&id).await?;
            println!("{id}: {}", if existed { "deleted" } else { "not found" });
            Ok(true)
        }

        Command::PurgeExpired => {
            let expired = cache.registry().expired(unix_now()).await;
            let deleted = cache
                .del_batch(&|_: &MapAuxiliary<Value>| expired.clone())
                .await?;
            println!("purged {deleted} expired item(s)");
            Ok(true)
        }

        Command::Dump => Ok(true),
    }
}

fn parse_id(s: &str) -> anyhow::Result<ObjectId> {
    s.parse()
        .with_context(|| format!("invalid object id {s:?}"))
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or_default()
}
