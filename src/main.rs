//! canistore demo
//!
//! Writes assets, a filesystem tree and settings into a lazy cache, flushes
//! everything to an in-process canister with a progress bar, then reads it
//! all back through a cold cache and checks it byte for byte.

use anyhow::{bail, Context, Result};
use clap::Parser;
use parking_lot::Mutex;
use serde_json::json;
use std::sync::Arc;
use std::time::{Duration, Instant};

use canistore::callbacks::ItemProgress;
use canistore::cli::Args;
use canistore::codec;
use canistore::logging;
use canistore::memory_canister::MemoryCanister;
use canistore::progress::FlushProgress;
use canistore::{
    Blob, CacheConfig, CacheError, CacheKind, CacheManager, GetOptions, Payload, PutOptions, ValueType, WriteMode,
};

fn load_config(args: &Args) -> Result<CacheConfig> {
    let mut config = match &args.config {
        Some(path) => CacheConfig::load(path).with_context(|| format!("loading {}", path.display()))?,
        None => CacheConfig::default(),
    };
    if let Some(w) = args.workers {
        config.pool_size = w;
    }
    if let Some(c) = args.chunk_size {
        if c == 0 {
            bail!("--chunk-size must be positive");
        }
        config.chunk_size = c;
    }
    if let Some(t) = args.rpc_timeout_ms {
        config.rpc_timeout_ms = t;
    }
    if args.journal.is_some() {
        config.journal_path = args.journal.clone();
    }
    if args.log_file.is_some() {
        config.log_file = args.log_file.clone();
    }
    config.lazy_commit = true;
    Ok(config)
}

fn pattern(seed: usize, len: usize) -> Vec<u8> {
    (0..len).map(|i| ((i * 31 + seed * 7) % 251) as u8).collect()
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = load_config(&args)?;
    logging::init(&config.log_level);

    let canister = Arc::new(MemoryCanister::with_latency(Duration::from_millis(args.latency_ms)));
    let cache = CacheManager::new(canister.clone(), &config)?;
    let started = Instant::now();

    // Local writes only; nothing reaches the canister yet
    let mut written = Vec::with_capacity(args.assets);
    let mut total_bytes = 0u64;
    for i in 0..args.assets {
        let payload = Payload::Blob(Blob::new(pattern(i, args.asset_size), "application/octet-stream"));
        let uid = codec::content_uid(&payload);
        let name = format!("asset-{i}.bin");
        let report = cache
            .put(CacheKind::Asset, &uid, &name, payload.clone(), PutOptions::default())
            .await?;
        total_bytes += report.size as u64;
        written.push((uid, name, payload));
    }
    let tree = json!({
        "name": "root",
        "children": written
            .iter()
            .map(|(uid, name, _)| json!({ "name": name, "uid": uid }))
            .collect::<Vec<_>>(),
    });
    cache.put_fs(tree.clone(), PutOptions::default()).await?;
    for part in [json!({"color": "blue"}), json!({"font": "sans"})] {
        cache
            .put(CacheKind::Settings, "theme", "theme", part.into(), PutOptions::mode(WriteMode::Append))
            .await?;
    }
    println!(
        "Cached {} assets ({:.1} MB) + filesystem + settings; {} dirty",
        written.len(),
        total_bytes as f64 / 1_048_576.0,
        cache.dirty_count_all()
    );

    let progress = if args.quiet {
        FlushProgress::hidden()
    } else {
        FlushProgress::new(args.verbose)
    };
    let failures: Mutex<Vec<String>> = Mutex::new(Vec::new());
    let on_progress = |p: ItemProgress| progress.handle(p);
    let on_error = |kind: CacheKind, uid: &str, e: &CacheError| failures.lock().push(format!("{kind}/{uid}: {e}"));
    let summary = cache.flush_all(Some(&on_progress), Some(&on_error)).await?;

    let failures = failures.into_inner();
    if !failures.is_empty() {
        progress.finish_error(&format!("{} items", failures.len()));
        for f in &failures {
            eprintln!("  {f}");
        }
        bail!("{} commits failed", failures.len());
    }
    progress.finish_success(summary.committed as u64, total_bytes);

    // Cold read: a fresh cache has nothing local, so everything comes from the canister
    let cold = CacheManager::new(canister.clone(), &config)?;
    for (uid, name, payload) in &written {
        let got = cold
            .get(CacheKind::Asset, uid, GetOptions::expect(ValueType::Blob))
            .await
            .with_context(|| format!("{name} missing after flush"))?;
        if &got != payload {
            bail!("{name} came back different");
        }
    }
    if cold.get_fs().await? != tree {
        bail!("filesystem tree came back different");
    }
    let settings = cold.get_settings(&["theme".to_string()], None).await;
    if settings.get("theme") != Some(&json!({"color": "blue", "font": "sans"})) {
        bail!("theme setting came back different: {:?}", settings.get("theme"));
    }

    println!(
        "Verified {} assets, filesystem and settings in {:.2}s ({} remote calls)",
        written.len(),
        started.elapsed().as_secs_f64(),
        canister.calls().len()
    );
    if let Some(journal) = cache.journal() {
        let unsettled = journal.unsettled()?;
        println!("Journal {}: {} unsettled", journal.path().display(), unsettled.len());
    }
    Ok(())
}
