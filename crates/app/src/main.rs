mod wav;

use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use beatline_core::{
    vibe, Analysis, Analyzer, BeatEngine, CachedAnalysis, Coverage, EngineConfig, MemoryPcm,
    PcmSource, PersistentCache, Result,
};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

const TICK: Duration = Duration::from_millis(16);

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => EngineConfig::load(path)?,
        None => EngineConfig::default(),
    };
    let cache = open_cache(cli.cache_dir.clone(), cli.no_cache)?;

    match cli.command {
        Commands::Analyze { input, output } => run_analyze(config, &input, output.as_deref()).await,
        Commands::Precompute { input } => run_precompute(config, cache, &input).await,
        Commands::Play {
            input,
            start,
            seconds,
            speed,
        } => run_play(config, cache, &input, start, seconds, speed).await,
    }
}

fn open_cache(dir: Option<PathBuf>, disabled: bool) -> Result<Option<PersistentCache>> {
    if disabled {
        return Ok(None);
    }
    let dir = match dir {
        Some(dir) => dir,
        None => PersistentCache::default_dir()?,
    };
    tracing::debug!(dir = %dir.display(), "using analysis cache");
    Ok(Some(PersistentCache::new(dir)))
}

/// Decodes `input` and aligns the analysis rate with the file.
fn load_input(config: &mut EngineConfig, input: &Path) -> Result<MemoryPcm> {
    let pcm = wav::load(input)?;
    config.analyzer.sample_rate = pcm.sample_rate();
    config.analyzer.validate()?;
    Ok(pcm)
}

async fn analyze_whole(config: &EngineConfig, pcm: MemoryPcm) -> Result<Analysis> {
    let analyzer = Analyzer::new(config.analyzer.clone())?;
    let cancel = CancellationToken::new();
    let analysis =
        tokio::task::spawn_blocking(move || analyzer.analyze_source(&pcm, &cancel)).await??;
    Ok(analysis)
}

async fn run_analyze(mut config: EngineConfig, input: &Path, output: Option<&Path>) -> Result<()> {
    let pcm = load_input(&mut config, input)?;
    let duration = pcm.duration();
    tracing::info!(input = %input.display(), duration, "analysing");

    let analysis = analyze_whole(&config, pcm).await?;
    let report = serde_json::json!({
        "file": input.display().to_string(),
        "duration": duration,
        "tempo": analysis.tempo,
        "scores": analysis.scores,
        "events": analysis.events,
    });
    let text = serde_json::to_string_pretty(&report)?;
    match output {
        Some(path) => std::fs::write(path, text)?,
        None => println!("{text}"),
    }
    tracing::info!(events = analysis.events.len(), "analysis complete");
    Ok(())
}

async fn run_precompute(
    mut config: EngineConfig,
    cache: Option<PersistentCache>,
    input: &Path,
) -> Result<()> {
    let Some(cache) = cache else {
        tracing::warn!("cache disabled, nothing to precompute");
        return Ok(());
    };
    let pcm = load_input(&mut config, input)?;
    let identity = pcm.identity();
    let duration = pcm.duration();
    if let Some(record) = cache.load(&identity, duration, &config.analyzer) {
        if record.is_complete() {
            tracing::info!(file = %identity.filename, "already cached");
            return Ok(());
        }
    }

    let analysis = analyze_whole(&config, pcm).await?;
    let mut record = CachedAnalysis::new(duration, config.analyzer.clone());
    record.coverage = Coverage::full(duration);
    record.tempo = analysis.tempo;
    record.scores = analysis.scores;
    if let Some(scores) = analysis.scores {
        let decision = vibe::evaluate(&scores);
        record.vibe_mode = Some(decision.mode);
        record.vibe_confidence = Some(decision.confidence);
    }
    record.events = analysis.events;
    cache.save(&identity, &record)?;
    tracing::info!(
        file = %identity.filename,
        events = record.events.len(),
        dir = %cache.dir().display(),
        "precomputed"
    );
    Ok(())
}

async fn run_play(
    mut config: EngineConfig,
    cache: Option<PersistentCache>,
    input: &Path,
    start: f64,
    seconds: Option<f64>,
    speed: f64,
) -> Result<()> {
    let pcm = load_input(&mut config, input)?;
    let duration = pcm.duration();
    let end = seconds.map_or(duration, |s| (start + s).min(duration));

    let mut engine = BeatEngine::new(config, cache)?;
    let outcome = engine.load(Arc::new(pcm)).await?;
    tracing::info!(cache = ?outcome.cache, delivered = outcome.delivered, "playback ready");
    if start > 0.0 {
        engine.seek(start);
    }

    let mut ticker = tokio::time::interval(TICK);
    let step = TICK.as_secs_f64() * speed.max(0.01);
    let mut now = start;
    let mut phase = engine.vibe_phase();
    while now <= end {
        ticker.tick().await;
        for event in engine.tick(now) {
            println!("{}", serde_json::to_string(&event)?);
        }
        if engine.vibe_phase() != phase {
            phase = engine.vibe_phase();
            tracing::info!(?phase, confidence = engine.vibe_confidence(), "vibe changed");
        }
        now += step;
    }

    let report = engine.stop().await;
    let stats = engine.stats();
    tracing::info!(
        avg_skew_ms = stats.avg_skew_ms,
        fired = stats.fired,
        coalesced = stats.coalesced,
        dropped_conflict = stats.dropped_conflict,
        dropped_stale = stats.dropped_stale,
        "playback finished"
    );
    if let Some(error) = report.and_then(|r| r.error) {
        tracing::warn!(%error, "lookahead stopped early");
    }
    Ok(())
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .try_init();
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Musical structure extraction for live visuals", long_about = None)]
struct Cli {
    /// JSON engine configuration; missing fields use defaults.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Directory for analysis records. Defaults to the user cache directory.
    #[arg(long, global = true)]
    cache_dir: Option<PathBuf>,
    /// Never read or write analysis records.
    #[arg(long, global = true)]
    no_cache: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Analyse a WAV file and print tempo, vibe scores and events as JSON.
    Analyze {
        input: PathBuf,
        /// Write the report here instead of stdout.
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Analyse a WAV file completely and store the result in the cache.
    Precompute { input: PathBuf },
    /// Simulate playback and print events as they fire.
    Play {
        input: PathBuf,
        /// Playback start position in seconds.
        #[arg(long, default_value_t = 0.0)]
        start: f64,
        /// Stop after this many seconds of playback.
        #[arg(long)]
        seconds: Option<f64>,
        /// Clock speed multiplier.
        #[arg(long, default_value_t = 1.0)]
        speed: f64,
    },
}
