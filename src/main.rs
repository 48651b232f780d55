use anyhow::Result;
use chrono::{Duration as ChronoDuration, Utc};
use clap::Parser;
use std::sync::Arc;
use tokio::time::{sleep, Duration};

use track_pipeline_rs::{
    Coordinates, JobQueue, KalmanBank, MapMatcher, MemoryStore, NewRawSample, OsrmClient,
    PipelineConfig, SampleQuery, SampleStore, TrackProcessor,
};

#[derive(Parser, Debug)]
#[command(name = "track_pipeline")]
#[command(about = "GPS track-processing worker pool", long_about = None)]
struct Args {
    /// OSRM base URL (overrides OSRM_BASE_URL)
    #[arg(long)]
    osrm_url: Option<String>,

    /// Worker count (overrides WORKER_CONCURRENCY)
    #[arg(long)]
    workers: Option<usize>,

    /// Replay raw samples from a JSON file (array of NewRawSample)
    /// instead of synthesizing demo tracks
    #[arg(long)]
    replay: Option<String>,

    /// Synthetic samples per device when no replay file is given
    #[arg(long, default_value = "60")]
    samples: usize,

    /// Number of synthetic devices
    #[arg(long, default_value = "3")]
    devices: usize,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    let mut config = PipelineConfig::from_env();
    if let Some(url) = args.osrm_url.clone() {
        config.osrm_base_url = Some(url);
    }
    if let Some(workers) = args.workers {
        config.queue.workers = workers;
    }

    println!("[{}] Track pipeline starting", ts_now());
    println!("  Workers: {}", config.queue.workers);
    println!("  Rate limit: {}/s", config.queue.rate_limit_per_sec);
    println!(
        "  Stop threshold: {} m, stale age: {} s, context: {} points, min confidence: {}",
        config.processor.stop_threshold_m,
        config.processor.stale_age_secs,
        config.processor.context_points,
        config.processor.min_confidence
    );

    // No OSRM endpoint means every move settles on the Kalman fallback
    // path; the pipeline still runs.
    let osrm_url = config.osrm_base_url.clone().unwrap_or_else(|| {
        log::warn!("OSRM_BASE_URL not set, moves will fall back to Kalman-only");
        "http://127.0.0.1:5000".to_string()
    });
    let matcher = Arc::new(OsrmClient::new(&osrm_url));
    if matcher.health_check().await {
        println!("[{}] OSRM reachable at {}", ts_now(), osrm_url);
    } else {
        println!(
            "[{}] OSRM probe failed for {}; continuing with Kalman fallback",
            ts_now(),
            osrm_url
        );
    }

    let store = Arc::new(MemoryStore::new());
    let kalman = Arc::new(KalmanBank::new(config.kalman));
    let processor = Arc::new(TrackProcessor::new(
        store.clone(),
        matcher.clone() as Arc<dyn MapMatcher>,
        kalman,
        config.processor.clone(),
    ));
    let queue = Arc::new(JobQueue::start(config.queue.clone(), processor.clone()));

    // Periodic status line on stderr, clear of the stdout summary.
    let status_queue = queue.clone();
    let status_processor = processor.clone();
    let status_handle = tokio::spawn(async move {
        loop {
            sleep(Duration::from_secs(2)).await;
            let q = status_queue.stats();
            let p = status_processor.stats();
            eprintln!(
                "[STATUS] queued={} in_flight={} completed={} failed={} | raw_first={} kalman={} osrm={} fallback={} stops={} skips={}",
                q.queued,
                q.in_flight,
                q.completed,
                q.failed,
                p.raw_first,
                p.kalman,
                p.osrm,
                p.kalman_fallback,
                p.stops_coalesced,
                p.skipped_out_of_order
            );
        }
    });

    println!("[{}] Feeding samples...", ts_now());
    let fed = tokio::select! {
        fed = feed(&args, store.as_ref(), &queue) => fed?,
        _ = shutdown_signal() => {
            println!("[{}] Signal received during feed, draining...", ts_now());
            0
        }
    };

    // Let in-flight work settle, unless a signal asks for an early drain.
    loop {
        let stats = queue.stats();
        if stats.queued == 0 && stats.in_flight == 0 {
            break;
        }
        tokio::select! {
            _ = sleep(Duration::from_millis(200)) => {}
            _ = shutdown_signal() => {
                println!("[{}] Signal received, draining...", ts_now());
                break;
            }
        }
    }

    queue.shutdown().await;
    status_handle.abort();

    let queue_stats = queue.stats();
    let pipeline_stats = processor.stats();
    let emitted = store.list_processed(&SampleQuery::default()).await?;

    println!("\n=== Final Stats ===");
    println!("Samples fed: {}", fed);
    println!(
        "Jobs: completed={} failed={} coalesced={}",
        queue_stats.completed, queue_stats.failed, queue_stats.coalesced
    );
    println!(
        "Methods: raw_first={} kalman={} osrm={} kalman_fallback={}",
        pipeline_stats.raw_first,
        pipeline_stats.kalman,
        pipeline_stats.osrm,
        pipeline_stats.kalman_fallback
    );
    println!(
        "Stops coalesced: {}, out-of-order skips: {}",
        pipeline_stats.stops_coalesced, pipeline_stats.skipped_out_of_order
    );
    println!("Processed samples emitted: {}", emitted.total);
    let dead_letters = queue.failed_jobs();
    if !dead_letters.is_empty() {
        println!("Dead letters: {}", dead_letters.len());
        for job in dead_letters.iter().take(5) {
            println!("  {} after {} attempt(s): {}", job.job_id, job.attempts, job.error);
        }
    }

    Ok(())
}

/// Insert raw samples and enqueue their ids; returns the count fed.
async fn feed(args: &Args, store: &MemoryStore, queue: &JobQueue) -> Result<usize> {
    match &args.replay {
        Some(path) => feed_replay(path, store, queue).await,
        None => feed_synthetic(args.devices, args.samples, store, queue).await,
    }
}

async fn feed_replay(path: &str, store: &MemoryStore, queue: &JobQueue) -> Result<usize> {
    let content = std::fs::read_to_string(path)?;
    let samples: Vec<NewRawSample> = serde_json::from_str(&content)?;
    let count = samples.len();

    for sample in samples {
        let id = store.insert_raw(sample).await?;
        queue.enqueue(&id);
        sleep(Duration::from_millis(5)).await;
    }
    println!("[{}] Replayed {} samples from {}", ts_now(), count, path);
    Ok(count)
}

/// Walk each synthetic device north-east in ~44 m hops, with a short
/// dwell in the middle to exercise stop coalescing.
async fn feed_synthetic(
    devices: usize,
    samples: usize,
    store: &MemoryStore,
    queue: &JobQueue,
) -> Result<usize> {
    let start = Utc::now() - ChronoDuration::seconds((samples as i64) * 5);
    let mut fed = 0usize;

    for step in 0..samples {
        for device in 0..devices {
            let device_id = format!("demo-device-{}", device);
            // Dwell for a few steps mid-track.
            let dwell = step > samples / 2 && step <= samples / 2 + 3;
            let progress = (if dwell { samples / 2 } else { step }) as f64;

            let coords = Coordinates::new(
                28.6129 + device as f64 * 0.01 + progress * 0.0003,
                77.2295 + progress * 0.0003,
            );
            let sample = NewRawSample::new(
                &device_id,
                start + ChronoDuration::seconds((step as i64) * 5),
                coords,
            )
            .with_accuracy(8.0);

            let id = store.insert_raw(sample).await?;
            queue.enqueue(&id);
            fed += 1;
        }
        sleep(Duration::from_millis(10)).await;
    }
    Ok(fed)
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        let mut term = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        {
            Ok(signal) => signal,
            Err(_) => {
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

fn ts_now() -> String {
    Utc::now().format("%H:%M:%S").to_string()
}
