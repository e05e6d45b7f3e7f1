fn main() {
    if let Err(e) = run() {
        eprintln!("benchmark failed: {e}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), String> {
    use serde::Serialize;
    use std::collections::BTreeMap;
    use std::path::PathBuf;
    use std::time::{Duration, Instant};
    use vigil_core::{
        buffering::chunk::StreamKind,
        capture::{ChunkRead, SyntheticConfig, SyntheticSource},
        classifier::Origin,
        features::FeatureExtractor,
        stability::{Applied, StabilityEngine},
        sync::Synchronizer,
        ActivityClassifier, CaptureSource, EngineConfig, PipelineClock, RuleClassifier,
    };

    #[derive(Debug)]
    struct Args {
        seconds: u64,
        iterations: usize,
        output: Option<PathBuf>,
    }

    #[derive(Debug, Clone, Serialize)]
    struct StageSummary {
        stage: String,
        runs: usize,
        p50_us: f64,
        p95_us: f64,
        avg_us: f64,
    }

    #[derive(Debug, Clone, Serialize)]
    struct Summary {
        simulated_seconds: u64,
        iterations: usize,
        chunks: u64,
        samples: u64,
        transitions: u64,
        wall_ms: f64,
        labels: BTreeMap<String, u64>,
        stages: Vec<StageSummary>,
    }

    fn parse_args() -> Result<Args, String> {
        let mut seconds: u64 = 60;
        let mut iterations: usize = 1;
        let mut output: Option<PathBuf> = None;

        let mut it = std::env::args().skip(1);
        while let Some(arg) = it.next() {
            match arg.as_str() {
                "--seconds" => {
                    let Some(v) = it.next() else {
                        return Err("missing value for --seconds".into());
                    };
                    seconds = v
                        .parse::<u64>()
                        .map_err(|_| "invalid value for --seconds".to_string())?
                        .clamp(1, 3_600);
                }
                "--iterations" => {
                    let Some(v) = it.next() else {
                        return Err("missing value for --iterations".into());
                    };
                    iterations = v
                        .parse::<usize>()
                        .map_err(|_| "invalid value for --iterations".to_string())?
                        .clamp(1, 10);
                }
                "--output" => {
                    let Some(v) = it.next() else {
                        return Err("missing value for --output".into());
                    };
                    output = Some(PathBuf::from(v));
                }
                "--help" | "-h" => {
                    println!(
                        "Usage: cargo run -p vigil-core --bin benchmark -- \\
  [--seconds <n>] [--iterations <n>] [--output <file.json>]"
                    );
                    std::process::exit(0);
                }
                other => {
                    return Err(format!("unknown argument: {other}"));
                }
            }
        }
        Ok(Args {
            seconds,
            iterations,
            output,
        })
    }

    fn percentile(values: &[f64], p: f64) -> f64 {
        if values.is_empty() {
            return 0.0;
        }
        let mut sorted = values.to_vec();
        sorted.sort_by(|a, b| a.total_cmp(b));
        let idx = ((sorted.len() - 1) as f64 * p.clamp(0.0, 1.0)).round() as usize;
        sorted[idx.min(sorted.len() - 1)]
    }

    fn summarize(stage: &str, values: &[f64]) -> StageSummary {
        StageSummary {
            stage: stage.to_string(),
            runs: values.len(),
            p50_us: percentile(values, 0.50),
            p95_us: percentile(values, 0.95),
            avg_us: if values.is_empty() {
                0.0
            } else {
                values.iter().sum::<f64>() / values.len() as f64
            },
        }
    }

    fn micros(started: Instant) -> f64 {
        started.elapsed().as_secs_f64() * 1_000_000.0
    }

    let args = parse_args()?;
    let config = EngineConfig::default();
    let synthetic = SyntheticConfig {
        realtime: false,
        ..SyntheticConfig::default()
    };
    let interval = synthetic.frame_interval.min(synthetic.audio_chunk);
    let steps = (Duration::from_secs(args.seconds).as_nanos() / interval.as_nanos().max(1)) as u64;

    println!(
        "Running Vigil pipeline benchmark over {}s of synthetic capture (iterations={})",
        args.seconds, args.iterations
    );

    let mut stage_times: BTreeMap<&str, Vec<f64>> = BTreeMap::new();
    let mut labels: BTreeMap<String, u64> = BTreeMap::new();
    let (mut chunks, mut samples, mut transitions) = (0u64, 0u64, 0u64);
    let wall = Instant::now();

    for iteration in 1..=args.iterations {
        let clock = PipelineClock::new();
        let source = SyntheticSource::new(synthetic.clone());
        let mut session = source.connect(clock).map_err(|e| e.to_string())?;
        let mut sync = Synchronizer::new(config.sync_config());
        let mut extractor = FeatureExtractor::new(config.features.clone());
        let mut classifier = RuleClassifier::default();
        let mut stability =
            StabilityEngine::new(config.stability_config(), config.labels.clone(), clock.now_ns());

        for _ in 0..steps {
            for stream in StreamKind::ALL {
                let chunk = match session
                    .next(stream, Duration::ZERO)
                    .map_err(|e| e.to_string())?
                {
                    ChunkRead::Chunk(chunk) => chunk,
                    ChunkRead::Unavailable => continue,
                };
                chunks += 1;

                let started = Instant::now();
                let ready = sync.push(chunk);
                stage_times.entry("synchronize").or_default().push(micros(started));

                for sample in ready {
                    samples += 1;
                    let started = Instant::now();
                    let Ok(vector) = extractor.extract(&sample) else {
                        continue;
                    };
                    stage_times.entry("extract").or_default().push(micros(started));

                    let started = Instant::now();
                    let classification = classifier
                        .classify(&vector, &config.labels, config.classifier_timeout)
                        .map_err(|e| e.to_string())?;
                    stage_times.entry("classify").or_default().push(micros(started));

                    let started = Instant::now();
                    let applied =
                        stability.apply(&classification, Origin::Automatic, classification.timestamp);
                    stage_times.entry("stabilize").or_default().push(micros(started));

                    *labels
                        .entry(classification.label.as_str().to_string())
                        .or_default() += 1;
                    if matches!(applied, Applied::Transition(_)) {
                        transitions += 1;
                    }
                }
            }
        }
        session.close();
        println!("iteration {iteration}/{} done", args.iterations);
    }

    let summary = Summary {
        simulated_seconds: args.seconds,
        iterations: args.iterations,
        chunks,
        samples,
        transitions,
        wall_ms: wall.elapsed().as_secs_f64() * 1000.0,
        labels,
        stages: stage_times
            .iter()
            .map(|(stage, values)| summarize(stage, values))
            .collect(),
    };

    println!(
        "Done. chunks={} samples={} transitions={} wall={:.1}ms",
        summary.chunks, summary.samples, summary.transitions, summary.wall_ms
    );

    let json = serde_json::to_string_pretty(&summary).map_err(|e| e.to_string())?;
    if let Some(out) = args.output {
        if let Some(parent) = out.parent() {
            std::fs::create_dir_all(parent).map_err(|e| e.to_string())?;
        }
        std::fs::write(&out, json).map_err(|e| e.to_string())?;
        println!("Wrote benchmark report: {}", out.display());
    } else {
        println!("{json}");
    }

    Ok(())
}
