use anyhow::Result;
use canistore::callbacks::{CommitResult, ItemProgress};
use canistore::memory_canister::{MemoryCanister, RemoteCall};
use canistore::{CacheConfig, CacheError, CacheKind, CacheManager, GetOptions, Payload, PutOptions, WriteMode};
use parking_lot::Mutex;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

fn config() -> CacheConfig {
    CacheConfig {
        pool_size: 4,
        chunk_size: 16,
        ..CacheConfig::default()
    }
}

fn setting_writes(canister: &MemoryCanister) -> Vec<String> {
    canister
        .calls()
        .into_iter()
        .filter_map(|c| match c {
            RemoteCall::SetSetting { json, .. } => Some(json),
            _ => None,
        })
        .collect()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn eager_put_commits_and_cleans() -> Result<()> {
    let canister = Arc::new(MemoryCanister::new());
    let cache = CacheManager::new(canister.clone(), &CacheConfig::default())?;

    let report = cache
        .put(CacheKind::Asset, "u1", "f.txt", Payload::from("hello"), PutOptions::default().eager())
        .await?;
    assert!(report.stored && report.committed);

    let calls = canister.calls();
    assert_eq!(calls.len(), 3);
    assert!(matches!(&calls[0], RemoteCall::InitiateUpload { total_chunks: 1, .. }));
    assert!(matches!(&calls[1], RemoteCall::AddChunk { chunk_id: 0, chunk, .. } if chunk == br#""hello""#));
    assert!(matches!(&calls[2], RemoteCall::CommitUpload { uid } if uid == "u1"));

    let entry = cache.entry(CacheKind::Asset, "u1").expect("cached");
    assert!(!entry.meta.is_dirty);
    assert!(!entry.meta.commit_in_flight);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn setting_appends_merge_objects() -> Result<()> {
    let canister = Arc::new(MemoryCanister::new());
    let cache = CacheManager::new(canister.clone(), &config())?;

    for part in [json!({"a": 1}), json!({"b": 2})] {
        cache
            .put(CacheKind::Settings, "k", "k", part.into(), PutOptions::mode(WriteMode::Append))
            .await?;
    }
    let got = cache.get(CacheKind::Settings, "k", GetOptions::default()).await;
    assert_eq!(got, Some(Payload::from(json!({"a": 1, "b": 2}))));
    assert_eq!(cache.dirty_count(CacheKind::Settings), 1);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn commits_for_one_key_never_overlap() -> Result<()> {
    let canister = Arc::new(MemoryCanister::new());
    let cache = Arc::new(CacheManager::new(canister.clone(), &config())?);
    canister.hold_writes();

    let first = {
        let cache = cache.clone();
        tokio::spawn(async move {
            cache
                .put(CacheKind::Settings, "theme", "theme", json!("dark").into(), PutOptions::default().eager())
                .await
        })
    };
    while canister.peak_writes_in_flight() == 0 {
        tokio::time::sleep(Duration::from_millis(2)).await;
    }

    let second = {
        let cache = cache.clone();
        tokio::spawn(async move {
            cache
                .put(CacheKind::Settings, "theme", "theme", json!("light").into(), PutOptions::default().eager())
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    // The second write landed locally but its commit is parked behind the first
    assert_eq!(
        cache.get(CacheKind::Settings, "theme", GetOptions::default()).await,
        Some(Payload::from(json!("light")))
    );
    assert!(setting_writes(&canister).is_empty());

    canister.release_writes(1);
    let first = first.await??;
    assert!(first.stored);
    // A newer write arrived while committing, so the entry is still dirty
    assert!(!first.committed);

    canister.open_writes();
    let second = second.await??;
    assert!(second.committed);

    assert_eq!(setting_writes(&canister), vec!["\"dark\"".to_string(), "\"light\"".to_string()]);
    assert_eq!(canister.peak_writes_in_flight(), 1);
    assert_eq!(canister.setting("theme").as_deref(), Some("\"light\""));
    assert_eq!(cache.dirty_count(CacheKind::Settings), 0);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn failed_commit_keeps_entry_dirty() -> Result<()> {
    let canister = Arc::new(MemoryCanister::new());
    canister.fail_setting("k");
    let cache = CacheManager::new(canister.clone(), &config())?;

    let err = cache
        .put(CacheKind::Settings, "k", "k", json!(1).into(), PutOptions::default().eager())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "fetch");
    let entry = cache.entry(CacheKind::Settings, "k").expect("local write stands");
    assert!(entry.meta.is_dirty);
    assert!(!entry.meta.commit_in_flight);

    canister.clear_faults();
    let summary = cache.flush(CacheKind::Settings, None, None).await?;
    assert_eq!(summary.committed, 1);
    assert_eq!(cache.dirty_count(CacheKind::Settings), 0);
    assert_eq!(canister.setting("k").as_deref(), Some("1"));
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn older_write_is_dropped() -> Result<()> {
    let canister = Arc::new(MemoryCanister::new());
    let cache = CacheManager::new(canister.clone(), &config())?;

    cache.put_fs(json!({"v": 1}), PutOptions::default()).await?;
    let seen = cache.entry(CacheKind::Fs, "fs").expect("fs cached").meta.modified;

    let stale = cache
        .put_fs(json!({"v": 0}), PutOptions::default().modified_hint(seen))
        .await?;
    assert!(!stale.stored);
    assert_eq!(cache.get_fs().await?, json!({"v": 1}));

    let fresh = cache
        .put_fs(json!({"v": 2}), PutOptions::default().modified_hint(seen + 1))
        .await?;
    assert!(fresh.stored);
    assert_eq!(cache.get_fs().await?, json!({"v": 2}));
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn newer_wall_clock_hint_wins_after_a_write_burst() -> Result<()> {
    let canister = Arc::new(MemoryCanister::new());
    let cache = CacheManager::new(canister.clone(), &config())?;

    for i in 0..200 {
        cache.put_fs(json!({"v": i}), PutOptions::default()).await?;
    }
    let now = chrono::Utc::now().timestamp_millis() as u64;
    assert!(cache.entry(CacheKind::Fs, "fs").expect("fs cached").meta.modified <= now);

    let report = cache
        .put_fs(json!({"v": "latest"}), PutOptions::default().modified_hint(now + 1))
        .await?;
    assert!(report.stored);
    assert_eq!(cache.get_fs().await?, json!({"v": "latest"}));
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn callbacks_observe_the_settled_entry() -> Result<()> {
    let canister = Arc::new(MemoryCanister::new());
    let cache = Arc::new(CacheManager::new(canister.clone(), &config())?);
    let seen: Arc<Mutex<Vec<(String, bool, bool, bool)>>> = Arc::new(Mutex::new(Vec::new()));

    let observe = |kind: CacheKind, uid: &'static str| {
        let cache = cache.clone();
        let sink = seen.clone();
        PutOptions::default().on_commit(Box::new(move |r: &CommitResult| {
            let meta = cache.entry(kind, uid).expect("entry kept").meta;
            sink.lock()
                .push((uid.to_string(), r.is_ok(), meta.is_dirty, meta.commit_in_flight));
        }))
    };

    // Eager commit
    let report = cache
        .put(CacheKind::Asset, "u", "u.txt", Payload::from("now"), observe(CacheKind::Asset, "u").eager())
        .await?;
    assert!(report.committed);

    // Batched flush of every kind
    cache
        .put(CacheKind::Asset, "a", "a.txt", Payload::from("later"), observe(CacheKind::Asset, "a"))
        .await?;
    cache
        .put(CacheKind::Settings, "s", "s", json!({"k": 1}).into(), observe(CacheKind::Settings, "s"))
        .await?;
    cache.put_fs(json!({"root": []}), observe(CacheKind::Fs, "fs")).await?;
    cache.flush_all(None, None).await?;

    let mut seen = seen.lock().clone();
    seen.sort();
    let settled = |uid: &str| (uid.to_string(), true, false, false);
    assert_eq!(seen, vec![settled("a"), settled("fs"), settled("s"), settled("u")]);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn single_flush_reports_nothing_when_already_committed() -> Result<()> {
    let canister = Arc::new(MemoryCanister::new());
    let cache = Arc::new(CacheManager::new(canister.clone(), &config())?);
    canister.hold_writes();

    let eager = {
        let cache = cache.clone();
        tokio::spawn(async move {
            cache
                .put(CacheKind::Settings, "k", "k", json!(1).into(), PutOptions::default().eager())
                .await
        })
    };
    while canister.peak_writes_in_flight() == 0 {
        tokio::time::sleep(Duration::from_millis(2)).await;
    }

    let events: Mutex<Vec<ItemProgress>> = Mutex::new(Vec::new());
    let on_progress = |p: ItemProgress| events.lock().push(p);
    let (flushed, _) = tokio::join!(cache.flush(CacheKind::Settings, Some("k"), Some(&on_progress)), async {
        tokio::time::sleep(Duration::from_millis(30)).await;
        canister.open_writes();
    });
    assert_eq!(flushed?.committed, 0);
    assert!(events.into_inner().is_empty());
    assert!(eager.await??.committed);
    assert_eq!(cache.dirty_count(CacheKind::Settings), 0);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn flush_all_reports_estimate_then_items_in_kind_order() -> Result<()> {
    let canister = Arc::new(MemoryCanister::new());
    let cache = CacheManager::new(canister.clone(), &config())?;

    cache.put(CacheKind::Asset, "a1", "a1.txt", Payload::from("first asset"), PutOptions::default()).await?;
    cache.put(CacheKind::Asset, "a2", "a2.txt", Payload::from("second"), PutOptions::default()).await?;
    cache.put_fs(json!({"children": []}), PutOptions::default()).await?;
    cache.put(CacheKind::Settings, "theme", "theme", json!({"c": 1}).into(), PutOptions::default()).await?;
    assert_eq!(cache.dirty_count_all(), 4);

    let events: Mutex<Vec<ItemProgress>> = Mutex::new(Vec::new());
    let on_progress = |p: ItemProgress| events.lock().push(p);
    let summary = cache.flush_all(Some(&on_progress), None).await?;
    assert_eq!(summary.committed, 4);
    assert_eq!(cache.dirty_count_all(), 0);

    let events = events.into_inner();
    assert_eq!(events.len(), 5);
    assert_eq!(events[0], ItemProgress::Estimation { items: 4 });
    let mut assets: Vec<&str> = events[1..3]
        .iter()
        .map(|e| match e {
            ItemProgress::Progress { uid, .. } => uid.as_str(),
            other => panic!("unexpected {other:?}"),
        })
        .collect();
    assets.sort();
    assert_eq!(assets, vec!["a1", "a2"]);
    assert_eq!(events[3], ItemProgress::item("fs", "Filesystem"));
    assert_eq!(events[4], ItemProgress::item("theme", "theme"));
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn flush_all_error_callback_vs_propagation() -> Result<()> {
    let canister = Arc::new(MemoryCanister::new());
    canister.fail_commit("bad");
    let cache = CacheManager::new(canister.clone(), &config())?;

    cache.put(CacheKind::Asset, "good", "good", Payload::from("ok"), PutOptions::default()).await?;
    cache.put(CacheKind::Asset, "bad", "bad", Payload::from("nope"), PutOptions::default()).await?;
    cache.put(CacheKind::Settings, "s", "s", json!(true).into(), PutOptions::default()).await?;

    // Without a handler the failing kind stops the flush
    let err = cache.flush_all(None, None).await.unwrap_err();
    assert_eq!(err.kind(), "assetCommit");
    assert!(canister.asset("good").is_some());
    assert_eq!(cache.dirty_count(CacheKind::Asset), 1);
    assert_eq!(cache.dirty_count(CacheKind::Settings), 1);

    // With a handler every kind runs and failures are reported per item
    let failures: Mutex<Vec<(CacheKind, String)>> = Mutex::new(Vec::new());
    let on_error = |kind: CacheKind, uid: &str, _e: &CacheError| failures.lock().push((kind, uid.to_string()));
    let summary = cache.flush_all(None, Some(&on_error)).await?;
    assert_eq!(summary.committed, 1);
    assert_eq!(summary.failed, 1);
    assert_eq!(failures.into_inner(), vec![(CacheKind::Asset, "bad".to_string())]);
    assert_eq!(cache.dirty_count(CacheKind::Settings), 0);
    assert!(cache.entry(CacheKind::Asset, "bad").expect("kept").meta.is_dirty);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn commit_callbacks_fire_once_per_settle() -> Result<()> {
    let canister = Arc::new(MemoryCanister::new());
    canister.fail_commit("b");
    let cache = CacheManager::new(canister.clone(), &config())?;
    let seen: Arc<Mutex<Vec<(String, bool)>>> = Arc::new(Mutex::new(Vec::new()));

    for uid in ["a", "b"] {
        let sink = seen.clone();
        let tag = uid.to_string();
        let opts = PutOptions::default().on_commit(Box::new(move |r: &CommitResult| sink.lock().push((tag, r.is_ok()))));
        cache.put(CacheKind::Asset, uid, uid, Payload::from(uid), opts).await?;
    }
    let failures = Mutex::new(0usize);
    let on_error = |_: CacheKind, _: &str, _: &CacheError| *failures.lock() += 1;
    cache.flush_all(None, Some(&on_error)).await?;

    let mut seen = seen.lock().clone();
    seen.sort();
    assert_eq!(seen, vec![("a".to_string(), true), ("b".to_string(), false)]);
    assert_eq!(failures.into_inner(), 1);
    assert_eq!(cache.client().callbacks().pending(CacheKind::Asset, "b"), 0);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cold_cache_reads_through_and_creates_defaults() -> Result<()> {
    let canister = Arc::new(MemoryCanister::new());
    canister.seed_setting("lang", r#""en""#);
    canister.seed_filesystem(r#"{"name":"root"}"#);
    let cache = CacheManager::new(canister.clone(), &config())?;

    assert_eq!(cache.get_fs().await?, json!({"name": "root"}));
    let settings = cache
        .get_settings(&["lang".to_string(), "missing".to_string()], None)
        .await;
    assert_eq!(settings.len(), 1);
    assert_eq!(settings["lang"], json!("en"));
    assert_eq!(cache.dirty_count_all(), 0);

    let created = cache
        .get(CacheKind::Settings, "fresh", GetOptions::expect(canistore::ValueType::Json).or_create())
        .await;
    assert!(created.is_some());
    assert_eq!(cache.dirty_count(CacheKind::Settings), 1);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn remove_logs_remote_failures() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let log_path = dir.path().join("events.log");
    let canister = Arc::new(MemoryCanister::new());
    let cfg = CacheConfig {
        log_file: Some(log_path.clone()),
        ..config()
    };
    let cache = CacheManager::new(canister.clone(), &cfg)?;

    cache
        .put(CacheKind::Asset, "x", "x.txt", Payload::from("bye"), PutOptions::default().eager())
        .await?;
    assert!(cache.remove(CacheKind::Asset, "x").await?.is_some());
    assert!(canister.asset("x").is_none());
    assert!(!cache.in_cache(CacheKind::Asset, "x"));

    let err = cache.remove(CacheKind::Asset, "x").await.unwrap_err();
    assert_eq!(err.kind(), "assetNotFound");

    let text = std::fs::read_to_string(&log_path)?;
    assert!(text.contains("COMMIT kind=asset uid=x"));
    assert!(text.contains("ERROR ctx=remove uid=x"));
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn journal_tracks_unsettled_commits() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let canister = Arc::new(MemoryCanister::new());
    canister.fail_filesystem(true);
    let cfg = CacheConfig {
        journal_path: Some(dir.path().join("commits.jsonl")),
        ..config()
    };
    let cache = CacheManager::new(canister.clone(), &cfg)?;

    cache.put(CacheKind::Settings, "ok", "ok", json!(1).into(), PutOptions::default()).await?;
    cache.put_fs(json!({}), PutOptions::default()).await?;
    let on_error = |_: CacheKind, _: &str, _: &CacheError| {};
    cache.flush_all(None, Some(&on_error)).await?;

    let journal = cache.journal().expect("journal configured");
    assert_eq!(journal.unsettled()?, vec![(CacheKind::Fs, "fs".to_string())]);
    assert_eq!(journal.read_log()?.len(), 4);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn slow_chunks_time_out_and_stay_dirty() -> Result<()> {
    let canister = Arc::new(MemoryCanister::with_latency(Duration::from_millis(200)));
    let cfg = CacheConfig {
        rpc_timeout_ms: 20,
        ..config()
    };
    let cache = CacheManager::new(canister.clone(), &cfg)?;

    let err = cache
        .put(CacheKind::Asset, "slow", "slow", Payload::from("tick tock"), PutOptions::default().eager())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "timeout");
    assert!(cache.entry(CacheKind::Asset, "slow").expect("kept").meta.is_dirty);
    assert!(canister.asset("slow").is_none());
    Ok(())
}
