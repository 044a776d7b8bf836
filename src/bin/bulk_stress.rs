//! SpiteDocs Bulk Operation Stress Binary
//!
//! Loads a collection, then deletes or patches all of it while other writers
//! keep adding documents, and verifies the job stayed within its scope.
//! Run with: `cargo run --bin bulk_stress -- [OPTIONS]`
//!
//! # Examples
//!
//! ```bash
//! # Default: load 10000 documents, delete them all
//! cargo run --release --bin bulk_stress
//!
//! # Throttled patch with concurrent inserts, debug logging
//! RUST_LOG=spitedocs=debug cargo run --release --bin bulk_stress -- \
//!     --action patch --max-ops 2000 --noise 500
//! ```

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use serde_json::json;
use spitedocs::{
    CollectionOperationOptions, DatabaseConfig, DocumentDatabase, Etag, PatchRequest,
    PutDocumentCommand,
};
use tracing_subscriber::EnvFilter;

#[derive(Clone, Copy, PartialEq, Eq)]
enum Action {
    Delete,
    Patch,
}

/// Stress run configuration
struct Config {
    /// Documents loaded before the job starts
    num_documents: usize,
    /// Concurrent loader tasks
    concurrency: usize,
    /// What the job does
    action: Action,
    /// Throttle for the job
    max_ops: Option<u32>,
    /// Documents inserted into the collection while the job runs
    noise: usize,
    /// Path to database file (or temp if None)
    db_path: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            num_documents: 10_000,
            concurrency: 10,
            action: Action::Delete,
            max_ops: None,
            noise: 0,
            db_path: None,
        }
    }
}

const COLLECTION: &str = "Stress";

fn parse_args() -> Config {
    let args: Vec<String> = std::env::args().collect();
    let mut config = Config::default();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--documents" | "-n" => {
                i += 1;
                config.num_documents = args[i].parse().expect("Invalid --documents value");
            }
            "--concurrency" | "-c" => {
                i += 1;
                config.concurrency = args[i].parse().expect("Invalid --concurrency value");
            }
            "--action" | "-a" => {
                i += 1;
                config.action = match args[i].as_str() {
                    "delete" => Action::Delete,
                    "patch" => Action::Patch,
                    other => {
                        eprintln!("Unknown action: {}", other);
                        std::process::exit(1);
                    }
                };
            }
            "--max-ops" | "-m" => {
                i += 1;
                config.max_ops = Some(args[i].parse().expect("Invalid --max-ops value"));
            }
            "--noise" => {
                i += 1;
                config.noise = args[i].parse().expect("Invalid --noise value");
            }
            "--db" | "-d" => {
                i += 1;
                config.db_path = Some(args[i].clone());
            }
            "--help" | "-h" => {
                println!(
                    r#"SpiteDocs Bulk Stress

Usage: bulk_stress [OPTIONS]

Options:
  -n, --documents <N>    Documents to load (default: 10000)
  -c, --concurrency <N>  Concurrent loader tasks (default: 10)
  -a, --action <A>       delete | patch (default: delete)
  -m, --max-ops <K>      Throttle the job to K documents per second
  --noise <N>            Documents inserted while the job runs (default: 0)
  -d, --db <PATH>        Database path (default: temp file)
  -h, --help             Show this help

Environment:
  RUST_LOG               Log filter (default: spitedocs=info)
  SPITEDOCS_*            Database configuration overrides
"#
                );
                std::process::exit(0);
            }
            arg => {
                eprintln!("Unknown argument: {}", arg);
                std::process::exit(1);
            }
        }
        i += 1;
    }

    config
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("spitedocs=info")),
        )
        .init();

    let config = parse_args();

    println!("SpiteDocs Bulk Stress");
    println!("=====================");
    println!("Documents:   {}", config.num_documents);
    println!("Concurrency: {}", config.concurrency);
    println!(
        "Action:      {}",
        match config.action {
            Action::Delete => "delete",
            Action::Patch => "patch",
        }
    );
    println!(
        "Max ops/s:   {}",
        config
            .max_ops
            .map_or_else(|| "unlimited".to_string(), |k| k.to_string())
    );
    println!("Noise:       {}", config.noise);
    println!();

    let temp_dir = std::env::temp_dir().join(format!("spitedocs-stress-{}", std::process::id()));
    std::fs::create_dir_all(&temp_dir).expect("create temp dir");
    let db_path = config
        .db_path
        .clone()
        .unwrap_or_else(|| temp_dir.join("stress.db").to_string_lossy().to_string());

    println!("Database:    {}", db_path);
    println!();

    let db_config = DatabaseConfig::from_env().expect("invalid SPITEDOCS_* configuration");
    let db = DocumentDatabase::open_with_config(&db_path, db_config)
        .await
        .expect("open database");

    // Load
    println!("Loading documents...");
    let start = Instant::now();
    let mut handles = Vec::new();
    let per_task = config.num_documents / config.concurrency.max(1);

    for task_id in 0..config.concurrency {
        let db = db.clone();
        handles.push(tokio::spawn(async move {
            for i in 0..per_task {
                let key = format!("stress/{}-{}", task_id, i);
                db.put(PutDocumentCommand::new(
                    key,
                    COLLECTION,
                    json!({"task": task_id, "index": i, "counter": 0}),
                ))
                .await
                .expect("load document");
            }
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }
    println!("  Loaded in {:?}", start.elapsed());

    let scope = db.collection_scope(COLLECTION).await.unwrap();
    println!(
        "  Scope: {} documents, high water etag {}",
        scope.total_count, scope.high_water
    );
    println!();

    // Noise writers keep adding documents while the job runs
    let running = Arc::new(AtomicBool::new(true));
    let noise_written = Arc::new(AtomicU64::new(0));
    let noise = {
        let db = db.clone();
        let running = running.clone();
        let noise_written = noise_written.clone();
        let total = config.noise;
        tokio::spawn(async move {
            for i in 0..total {
                if !running.load(Ordering::Relaxed) {
                    break;
                }
                db.put(PutDocumentCommand::new(
                    format!("noise/{}", i),
                    COLLECTION,
                    json!({"noise": true}),
                ))
                .await
                .expect("noise write");
                noise_written.fetch_add(1, Ordering::Relaxed);
            }
        })
    };

    println!("Running bulk job...");
    let options = CollectionOperationOptions {
        max_ops_per_second: config.max_ops,
    };
    let on_progress = |p: spitedocs::DeterminateProgress| {
        println!("  progress: {}/{}", p.processed, p.total);
    };

    let start = Instant::now();
    let result = match config.action {
        Action::Delete => db.delete_collection(COLLECTION, options, on_progress).await,
        Action::Patch => {
            let patch = PatchRequest::new("this.counter += $by; this.stressed = true")
                .with_value("by", json!(1));
            db.patch_collection(COLLECTION, options, &patch, on_progress).await
        }
    }
    .expect("bulk job");
    let elapsed = start.elapsed();

    running.store(false, Ordering::Relaxed);
    noise.await.unwrap();

    println!();
    println!("Results");
    println!("-------");
    println!("Processed:       {}", result.total);
    println!("Noise written:   {}", noise_written.load(Ordering::Relaxed));
    println!("Duration:        {:?}", elapsed);
    println!(
        "Throughput:      {:.2} documents/sec",
        result.total as f64 / elapsed.as_secs_f64()
    );
    if let Some(k) = config.max_ops {
        let floor = (scope.total_count as f64 / k as f64).ceil() - 1.0;
        println!("Throttle floor:  {:.0}s", floor.max(0.0));
    }
    println!();

    // Verify invariants
    println!("Verifying invariants...");

    assert_eq!(
        result.total, scope.total_count,
        "processed {} but scope had {}",
        result.total, scope.total_count
    );
    println!("  Processed count matches scope ✓");

    let mut after = Etag::ZERO;
    let mut in_scope_left = 0u64;
    let mut unpatched = 0u64;
    loop {
        let documents = db.read_collection(COLLECTION, after, 1024).await.unwrap();
        let Some(last) = documents.last() else {
            break;
        };
        after = last.etag;

        for document in &documents {
            let is_noise = document.key.as_str().starts_with("noise/");
            match config.action {
                Action::Delete if !is_noise => in_scope_left += 1,
                Action::Patch if !is_noise && document.data["stressed"] != json!(true) => {
                    unpatched += 1
                }
                _ => {}
            }
            if is_noise {
                assert!(
                    document.data.get("stressed").is_none(),
                    "noise document {} was processed",
                    document.key
                );
            }
        }
    }

    match config.action {
        Action::Delete => {
            assert_eq!(in_scope_left, 0, "{} in-scope documents survived", in_scope_left);
            println!("  All in-scope documents deleted ✓");
        }
        Action::Patch => {
            assert_eq!(unpatched, 0, "{} in-scope documents unpatched", unpatched);
            println!("  All in-scope documents patched ✓");
        }
    }
    println!("  No document above the high water was touched ✓");

    db.shutdown().await;

    println!();
    println!("Bulk stress PASSED ✓");
}
