use std::{
    path::{Path, PathBuf},
    process::ExitCode,
    sync::Arc,
};

use clap::{Args as ClapArgs, Parser, Subcommand, ValueEnum};
use onboarding_eval::{
    eval::generate::generate_default_matrix,
    load_scenarios,
    providers::{openai::OpenAI, openrouter::OpenRouter},
    AgentUnderTest, EvalConfig, EvalError, EvalRunner, LLMProvider, LlmJudge, LoadedScenario,
    OnboardingAgent, RunReport, ToolMode,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Clone, ValueEnum)]
enum ProviderKind {
    Openai,
    Openrouter,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum ReportFormat {
    Json,
    Jsonl,
}

#[derive(Parser)]
#[command(name = "onboarding-eval")]
#[command(about = "Step and trajectory evaluations for the onboarding agent")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Drive and grade scenarios
    Run(RunArgs),
    /// Write the default generated step tasks
    Generate {
        /// Output directory for task directories
        #[arg(long, default_value = "scenarios/step/generated")]
        output: PathBuf,
    },
}

#[derive(ClapArgs)]
struct RunArgs {
    /// Scenario file, task directory, or directory tree
    #[arg(long, default_value = "scenarios")]
    scenarios: PathBuf,

    /// YAML run configuration
    #[arg(long)]
    config: Option<PathBuf>,

    /// Provider for both the agent and the judge
    #[arg(long, value_enum, default_value = "openai")]
    provider: ProviderKind,

    /// Agent model (overrides the config file)
    #[arg(long)]
    agent_model: Option<String>,

    /// Judge model (overrides the config file)
    #[arg(long)]
    judge_model: Option<String>,

    /// Tool backend: mock or real
    #[arg(long)]
    tool_mode: Option<ToolMode>,

    /// Scenarios evaluated at once
    #[arg(long)]
    concurrency: Option<usize>,

    /// Fail trajectories whose turn notes disagree with the actual stage
    #[arg(long)]
    strict_notes: bool,

    /// Run only scenarios whose id contains this substring (repeatable)
    #[arg(long)]
    filter: Vec<String>,

    /// Report path
    #[arg(long)]
    out: Option<PathBuf>,

    #[arg(long, value_enum, default_value = "json")]
    format: ReportFormat,

    /// Skip the agent and judge health checks
    #[arg(long)]
    skip_preflight: bool,
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info,onboarding_eval=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn default_out_path(format: ReportFormat) -> PathBuf {
    let ts = chrono::Utc::now().format("%Y%m%dT%H%M%SZ").to_string();
    let extension = match format {
        ReportFormat::Json => "json",
        ReportFormat::Jsonl => "jsonl",
    };
    PathBuf::from(format!("runs/{ts}.{extension}"))
}

fn load_config(args: &RunArgs) -> Result<EvalConfig, EvalError> {
    let mut config = match &args.config {
        Some(path) => EvalConfig::from_yaml_file(path)?,
        None => EvalConfig::default(),
    };
    if let Some(model) = &args.agent_model {
        config.agent_model = model.clone();
    }
    if let Some(model) = &args.judge_model {
        config.judge_model = model.clone();
    }
    if let Some(mode) = args.tool_mode {
        config.tool_mode = mode;
    }
    if let Some(concurrency) = args.concurrency {
        config.concurrency = concurrency;
    }
    if args.strict_notes {
        config.strict_turn_notes = true;
    }
    config.validate()?;
    Ok(config)
}

fn filter_scenarios(mut scenarios: Vec<LoadedScenario>, filters: &[String]) -> Vec<LoadedScenario> {
    if filters.is_empty() {
        return scenarios;
    }
    scenarios.retain(|s| filters.iter().any(|f| s.id().contains(f)));
    scenarios
}

fn print_report(report: &RunReport, out_path: &Path) {
    let summary = &report.summary;
    println!(
        "Results: {}/{} passed, {} failed, {} errored, {} cancelled, {} malformed, mean score {:.3}, output {}",
        summary.passed,
        summary.total,
        summary.failed,
        summary.errored,
        summary.cancelled,
        summary.malformed,
        summary.mean_score,
        out_path.display()
    );
    for (name, score) in &summary.mean_sub_scores {
        println!("  {name}: {score:.3}");
    }
    for record in &report.records {
        if record.verdict.passed() {
            continue;
        }
        eprintln!(
            "FAIL {} ({:?}, score {:.3})",
            record.scenario_id,
            record.verdict.status(),
            record.verdict.score()
        );
        for failure in record.verdict.failures() {
            eprintln!("  - [{}] {}", failure.check, failure.message);
        }
    }
}

async fn run(args: RunArgs) -> Result<ExitCode, Box<dyn std::error::Error>> {
    let config = load_config(&args)?;

    let scenarios = filter_scenarios(load_scenarios(&args.scenarios)?, &args.filter);
    if scenarios.is_empty() {
        eprintln!("{}", EvalError::NoScenarios);
        return Ok(ExitCode::from(2));
    }

    let provider: Arc<dyn LLMProvider> = match args.provider {
        ProviderKind::Openai => Arc::new(OpenAI::from_env()?),
        ProviderKind::Openrouter => Arc::new(OpenRouter::from_env()?),
    };

    let tool_mode = config.tool_mode;
    let prototype = OnboardingAgent::new(
        Arc::clone(&provider),
        config.agent_model.clone(),
        Arc::new(onboarding_eval::onboarding_registry(tool_mode)),
    )?
    .with_max_email_retries(config.max_email_retries);
    let judge = Arc::new(LlmJudge::new(Arc::clone(&provider), config.judge_model.clone()));

    let runner = EvalRunner::new(
        config,
        judge,
        &onboarding_eval::onboarding_registry(tool_mode),
    )?;

    if !args.skip_preflight {
        if let Err(error) = runner.preflight(&prototype).await {
            eprintln!("preflight failed: {error}");
            return Ok(ExitCode::from(2));
        }
    }

    let report = runner
        .run(
            |_| -> Arc<dyn AgentUnderTest> {
                Arc::new(
                    prototype
                        .clone()
                        .with_functions(Arc::new(onboarding_eval::onboarding_registry(tool_mode))),
                )
            },
            scenarios,
        )
        .await;

    let out_path = args.out.unwrap_or_else(|| default_out_path(args.format));
    match args.format {
        ReportFormat::Json => report.write_json(&out_path)?,
        ReportFormat::Jsonl => report.write_jsonl(&out_path)?,
    }
    print_report(&report, &out_path);

    Ok(if report.all_passed() {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(1)
    })
}

#[tokio::main]
async fn main() -> Result<ExitCode, Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    init_tracing();

    let cli = Cli::parse();
    match cli.command {
        Command::Run(args) => run(args).await,
        Command::Generate { output } => {
            let count = generate_default_matrix(&output)?;
            println!("Generated {count} tasks in {}", output.display());
            Ok(ExitCode::SUCCESS)
        }
    }
}
