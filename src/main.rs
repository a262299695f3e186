use clap::{Parser, ValueEnum};
use rolling_output::{
    FakeTokenSource, FormatterKind, GenerationInput, RollingBatch, RollingConfig, config,
    stream_batch,
};
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::filter::LevelFilter;

/// Most verbose events written to stderr.
#[derive(Copy, Clone, Debug, ValueEnum)]
enum LogLevel {
    Error,
    Warn,
    Info,
    /// Request completion and coalescing.
    Debug,
    /// Every accepted token.
    Trace,
}

impl LogLevel {
    fn filter(self) -> LevelFilter {
        match self {
            LogLevel::Error => LevelFilter::ERROR,
            LogLevel::Warn => LevelFilter::WARN,
            LogLevel::Info => LevelFilter::INFO,
            LogLevel::Debug => LevelFilter::DEBUG,
            LogLevel::Trace => LevelFilter::TRACE,
        }
    }
}

#[derive(Parser, Debug)]
#[command(name = "rollout", about = "Stream fake generations through a rolling batch")]
struct Cli {
    /// Prompts, one request each
    #[arg(required = true)]
    prompts: Vec<String>,

    /// Emit one JSON record per token instead of a single document
    #[arg(long)]
    stream: bool,

    /// Include generation details in the output
    #[arg(long)]
    details: bool,

    /// Prefix the prompt to the generated text
    #[arg(long)]
    return_full_text: bool,

    /// Built-in formatter, overrides --stream
    #[arg(long, value_enum)]
    output_formatter: Option<FormatterKind>,

    /// Tokens to generate per request
    #[arg(long)]
    max_new_tokens: Option<usize>,

    /// Wrap document output in a one-element array
    #[arg(long, env = "OPTION_TGI_COMPAT")]
    tgi_compat: bool,

    /// Optional config TOML with a [rolling] table
    #[arg(long)]
    config: Option<PathBuf>,

    /// Outputs the transport may hold before backpressure kicks in
    #[arg(long, default_value_t = 1)]
    channel_capacity: usize,

    /// Delay before the consumer reads each output
    #[arg(long, default_value_t = 0)]
    consumer_delay_ms: u64,

    /// Delay between generation steps
    #[arg(long, default_value_t = 5)]
    step_interval_ms: u64,

    /// Logging verbosity level
    #[arg(long, default_value = "info")]
    log_level: LogLevel,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    tracing_subscriber::fmt()
        .with_max_level(cli.log_level.filter())
        .with_writer(std::io::stderr)
        .init();

    let mut cfg = match &cli.config {
        Some(path) => RollingConfig::load(path)?,
        None => RollingConfig::default(),
    }
    .with_env_overrides()?;
    if let Some(n) = cli.max_new_tokens {
        cfg.max_new_tokens = n;
    }
    config::set_strict_compat_mode(cli.tgi_compat || cfg.strict_compat_mode);

    let inputs: Vec<GenerationInput> = cli
        .prompts
        .iter()
        .enumerate()
        .map(|(i, prompt)| -> anyhow::Result<GenerationInput> {
            let mut input = GenerationInput::new(i as u64, prompt.as_str())
                .param("stream", cli.stream)
                .param("details", cli.details)
                .param("return_full_text", cli.return_full_text);
            if let Some(kind) = cli.output_formatter {
                input = input.param("output_formatter", serde_json::to_value(kind)?);
            }
            Ok(input)
        })
        .collect::<anyhow::Result<_>>()?;

    let (tx, mut rx) = mpsc::channel(cli.channel_capacity.max(1));
    let step_interval = Duration::from_millis(cli.step_interval_ms);
    let producer = tokio::spawn(async move {
        let mut batch = RollingBatch::new(FakeTokenSource::new(), cfg);
        stream_batch(&mut batch, inputs, tx, step_interval).await
    });

    let delay = Duration::from_millis(cli.consumer_delay_ms);
    let mut chunks = 0usize;
    while let Some(output) = rx.recv().await {
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        chunks += 1;
        println!("[{}] {}", output.request_id, output.data.trim_end());
    }
    let failures = producer.await??;
    for failure in &failures {
        warn!(request_id = failure.request_id, error = %failure.error, "request failed");
    }
    info!(chunks, failed = failures.len(), "done");
    Ok(())
}
