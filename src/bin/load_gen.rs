use clap::Parser;
use rand_distr::{Beta, Distribution};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tokio::time;

const DETECTORS: [&str; 3] = ["sam3", "gpt4", "scene_graph"];
const PROPERTY_TYPES: [&str; 3] = ["residential", "commercial", "industrial"];
const REGIONS: [&str; 5] = ["london", "leeds", "bristol", "york", "hull"];

#[derive(Parser, Debug, Clone)]
#[command(name = "load_gen", about = "Synthetic assessments against the gatekeeper")]
struct Args {
    #[arg(long, default_value = "http://127.0.0.1:3000")]
    target: String,

    #[arg(long, default_value_t = 16)]
    concurrency: usize,

    #[arg(long, default_value_t = 30)]
    duration_secs: u64,

    /// Fraction of decisions that receive a validated outcome
    #[arg(long, default_value_t = 0.5)]
    outcome_rate: f64,
}

/// One synthetic assessment with inline detector evidence. Damage is drawn
/// first; detector confidences follow a Beta skewed by it.
fn synthetic_request() -> (serde_json::Value, bool) {
    let mut rng = rand::rng();
    let damaged = fastrand::f64() < 0.7;
    let (a, b) = if damaged { (8.0, 2.0) } else { (2.0, 8.0) };
    let confidence = Beta::new(a, b).map(|d| d.sample(&mut rng)).unwrap_or(0.5);

    let evidence: Vec<serde_json::Value> = DETECTORS
        .iter()
        .map(|id| {
            let jitter = (fastrand::f64() - 0.5) * 0.1;
            serde_json::json!({
                "detector_id": id,
                "bounding_boxes": [{ "x": 0.0, "y": 0.0, "width": 32.0, "height": 32.0 }],
                "confidence": (confidence + jitter).clamp(0.0, 1.0),
                "class_label": "roof_damage"
            })
        })
        .collect();

    let request = serde_json::json!({
        "assessment_id": format!("assess_{}", fastrand::u64(..)),
        "property_type": PROPERTY_TYPES[fastrand::usize(..PROPERTY_TYPES.len())],
        "property_age_years": fastrand::f64() * 120.0,
        "region": REGIONS[fastrand::usize(..REGIONS.len())],
        "lighting_quality": 0.5 + fastrand::f64() * 0.5,
        "image_clarity": 0.5 + fastrand::f64() * 0.5,
        "safety_critical": fastrand::f64() < 0.05,
        "num_damage_sites": fastrand::usize(0..6),
        "evidence": evidence
    });
    (request, damaged)
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    println!("Safe automation load generator");
    println!("Target: {} | Concurrency: {} | Duration: {}s", args.target, args.concurrency, args.duration_secs);

    let client = match reqwest::Client::builder()
        .pool_max_idle_per_host(args.concurrency)
        .tcp_nodelay(true)
        .build()
    {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to build HTTP client: {e}");
            std::process::exit(1);
        }
    };

    let decisions = Arc::new(AtomicUsize::new(0));
    let automated = Arc::new(AtomicUsize::new(0));
    let outcomes = Arc::new(AtomicUsize::new(0));
    let failures = Arc::new(AtomicUsize::new(0));
    let start_time = Instant::now();
    let mut handles = Vec::new();

    for _ in 0..args.concurrency {
        let client = client.clone();
        let args = args.clone();
        let decisions = decisions.clone();
        let automated = automated.clone();
        let outcomes = outcomes.clone();
        let failures = failures.clone();

        handles.push(tokio::spawn(async move {
            let decide_url = format!("{}/decide", args.target);
            let outcome_url = format!("{}/outcome", args.target);
            while start_time.elapsed().as_secs() < args.duration_secs {
                let (request, damaged) = synthetic_request();

                let response = match client.post(&decide_url).json(&request).send().await {
                    Ok(resp) if resp.status().is_success() => resp.json::<serde_json::Value>().await.ok(),
                    _ => None,
                };
                let Some(decision) = response else {
                    failures.fetch_add(1, Ordering::Relaxed);
                    continue;
                };
                decisions.fetch_add(1, Ordering::Relaxed);
                let automate = decision["action"] == "AUTOMATE";
                if automate {
                    automated.fetch_add(1, Ordering::Relaxed);
                }

                if fastrand::f64() >= args.outcome_rate {
                    continue;
                }
                // an automated decision on a damaged property that was in fact missed
                let sfn = automate && damaged && fastrand::f64() < 0.001;
                let outcome = serde_json::json!({
                    "decision_id": decision["decision_id"],
                    "safety_false_negative": sfn,
                    "realized_reward": if automate && !sfn { 1.0 } else { 0.2 },
                    "damage_confirmed": damaged,
                    "validated_at": chrono::Utc::now()
                });
                match client.post(&outcome_url).json(&outcome).send().await {
                    Ok(resp) if resp.status().is_success() => {
                        outcomes.fetch_add(1, Ordering::Relaxed);
                    }
                    _ => {
                        failures.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }
        }));
    }

    let monitor_total = decisions.clone();
    let duration_secs = args.duration_secs;
    let monitor = tokio::spawn(async move {
        let mut last_count = 0;
        let monitor_start = Instant::now();
        loop {
            time::sleep(Duration::from_secs(1)).await;
            let current = monitor_total.load(Ordering::Relaxed);
            let rate = current - last_count;
            last_count = current;
            println!("[{:02}s] decisions/s: {:<8} | Total: {}", monitor_start.elapsed().as_secs(), rate, current);
            if monitor_start.elapsed().as_secs() >= duration_secs {
                break;
            }
        }
    });

    for h in handles {
        let _ = h.await;
    }
    let _ = monitor.await;

    let duration = start_time.elapsed();
    let total = decisions.load(Ordering::SeqCst);
    let automated = automated.load(Ordering::SeqCst);

    println!("\n=== Load Report ===");
    println!("Decisions:        {}", total);
    println!("Automated:        {}", automated);
    println!("Outcomes posted:  {}", outcomes.load(Ordering::SeqCst));
    println!("Failed requests:  {}", failures.load(Ordering::SeqCst));
    println!("Duration:         {:.2?}", duration);
    println!("Throughput:       {:.0} decisions/s", total as f64 / duration.as_secs_f64());
    if total > 0 {
        println!("Automation rate:  {:.2}%", automated as f64 / total as f64 * 100.0);
    }
}
