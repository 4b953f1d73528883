use std::env;
use std::fs;
use std::path::PathBuf;
use std::time::Instant;

use seqcrdt_core::{ListCrdt, ReplicaId};

const CI_CONFIG: &[(u64, u64)] = &[(100, 5), (1_000, 1), (10_000, 1)];

const LOCAL_CONFIG: &[(u64, u64)] = &[(1, 1), (10, 1), (100, 1), (1_000, 1), (10_000, 1)];

#[derive(serde::Serialize)]
#[serde(rename_all = "camelCase")]
struct Output {
    implementation: &'static str,
    storage: &'static str,
    workload: String,
    timestamp: String,
    name: String,
    total_ops: u64,
    duration_ms: f64,
    ops_per_sec: f64,
    extra: Extra,
    source_file: Option<String>,
}

#[derive(serde::Serialize)]
#[serde(rename_all = "camelCase")]
struct Extra {
    count: u64,
    mode: &'static str,
    saved_bytes: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    iterations: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    avg_duration_ms: Option<f64>,
}

fn is_ci() -> bool {
    env::var("CI").map(|v| v == "true").unwrap_or(false)
}

/// Types `count` characters, deletes every other one, then saves and reloads.
fn run_benchmark(replica: &ReplicaId, count: u64) -> (f64, usize) {
    let mut list = ListCrdt::new(replica.clone()).unwrap();

    let start = Instant::now();
    for i in 0..count {
        let c = char::from(b'a' + (i % 26) as u8);
        list.insert(i as usize, c).unwrap();
    }
    for i in (0..count as usize).step_by(2).rev() {
        list.delete(i).unwrap();
    }
    let saved = list.save();
    let mut reloaded = ListCrdt::<char>::new(replica.clone()).unwrap();
    reloaded.load(&saved).unwrap();
    (start.elapsed().as_secs_f64() * 1000.0, saved.len())
}

fn main() {
    let config: &[(u64, u64)] = if is_ci() { CI_CONFIG } else { LOCAL_CONFIG };

    let mut out_dir: Option<PathBuf> = None;
    let mut custom_config: Option<Vec<(u64, u64)>> = None;
    for arg in env::args().skip(1) {
        if let Some(val) = arg.strip_prefix("--count=") {
            let count = val.parse().unwrap_or(500);
            custom_config = Some(vec![(count, 1)]);
        } else if let Some(val) = arg.strip_prefix("--counts=") {
            let parsed: Vec<(u64, u64)> = val
                .split(',')
                .filter_map(|s| s.trim().parse::<u64>().ok())
                .map(|c| (c, 1))
                .collect();
            if !parsed.is_empty() {
                custom_config = Some(parsed);
            }
        } else if let Some(val) = arg.strip_prefix("--out-dir=") {
            out_dir = Some(PathBuf::from(val));
        }
    }

    let config = custom_config.as_deref().unwrap_or(config);
    let out_dir = out_dir.unwrap_or_else(|| PathBuf::from("benchmarks/core"));
    fs::create_dir_all(&out_dir).expect("mkdirs");

    let replica = ReplicaId::new("core");
    for &(count, iterations) in config {
        let runs: Vec<(f64, usize)> = (0..iterations.max(1))
            .map(|_| run_benchmark(&replica, count))
            .collect();
        let saved_bytes = runs.last().map_or(0, |r| r.1);
        let avg = runs.iter().map(|r| r.0).sum::<f64>() / runs.len() as f64;
        let (iterations_opt, avg_duration_ms) = if iterations > 1 {
            (Some(iterations), Some(avg))
        } else {
            (None, None)
        };

        let workload_name = format!("type-delete-{}", count);
        let out_path = out_dir.join(format!("memory-{}.json", workload_name));
        let total_ops = count + count.div_ceil(2);

        let output = Output {
            implementation: "core-list",
            storage: "memory",
            workload: workload_name.clone(),
            timestamp: chrono::Utc::now().to_rfc3339(),
            name: workload_name,
            total_ops,
            duration_ms: avg,
            ops_per_sec: if avg > 0.0 {
                total_ops as f64 / avg * 1000.0
            } else {
                f64::INFINITY
            },
            extra: Extra {
                count,
                mode: "sequential",
                saved_bytes,
                iterations: iterations_opt,
                avg_duration_ms,
            },
            source_file: Some(out_path.display().to_string()),
        };

        let json = serde_json::to_string_pretty(&output).expect("serialize");
        fs::write(&out_path, &json).expect("write output");
        println!("{}", json);
    }
}
