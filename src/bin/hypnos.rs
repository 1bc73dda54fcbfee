//! Hypnos CLI - Command-line interface for Synheart Hypnos
//!
//! Commands:
//! - classify: Label every heart-rate reading of an export
//! - calibrate: Learn parameters from a labelled export
//! - evaluate: Score a classifier against the export's stage labels
//! - compare: Score scoring-term presets (and a threshold grid) side by side
//! - validate: Validate raw record schema
//! - doctor: Diagnose configuration and parameter files

use clap::{Args, Parser, Subcommand, ValueEnum};
use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing::level_filters::LevelFilter;

use synheart_hypnos::calibrator::AdaptiveCalibrator;
use synheart_hypnos::encoder::{decode_parameters, ReportEncoder};
use synheart_hypnos::evaluation::ConfusionMatrix;
use synheart_hypnos::schema::{RawRecordAdapter, RecordStream, SanitizedInput, SCHEMA_VERSION};
use synheart_hypnos::session::SessionSegmenter;
use synheart_hypnos::{
    ClassifierConfig, ComparisonReport, EvaluationMode, EvaluationReport, Evaluator, ScoringTerms,
    Stage, StageClassifier, Variant, HYPNOS_VERSION, PRODUCER_NAME,
};

/// Hypnos - Streaming sleep stage classification from heart rate
#[derive(Parser)]
#[command(name = "hypnos")]
#[command(author = "Synheart AI Inc")]
#[command(version = HYPNOS_VERSION)]
#[command(about = "Classify sleep stages from heart-rate data", long_about = None)]
struct Cli {
    /// Log level written to stderr (error, warn, info, debug, trace)
    #[arg(long, global = true, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Label every heart-rate reading (NDJSON output)
    Classify {
        #[command(flatten)]
        input: InputArgs,

        /// Output file path (use - for stdout)
        #[arg(short, long, default_value = "-")]
        output: PathBuf,

        /// Learned parameters from `hypnos calibrate`
        #[arg(long)]
        params: Option<PathBuf>,

        #[command(flatten)]
        terms: TermArgs,
    },

    /// Learn awake priors, transitions and the awake threshold
    Calibrate {
        #[command(flatten)]
        input: InputArgs,

        /// Output file path (use - for stdout)
        #[arg(short, long, default_value = "-")]
        output: PathBuf,
    },

    /// Evaluate a classifier against the stage labels of the input
    Evaluate {
        #[command(flatten)]
        input: InputArgs,

        /// Classifier to evaluate
        #[arg(long, value_enum, default_value = "streaming")]
        mode: ModeArg,

        /// Use default parameters instead of learning from the input
        #[arg(long)]
        no_learn: bool,

        #[command(flatten)]
        terms: TermArgs,

        /// Output the report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Compare scoring-term presets side by side on the same sessions
    Compare {
        #[command(flatten)]
        input: InputArgs,

        /// Use default parameters instead of learning from the input
        #[arg(long)]
        no_learn: bool,

        /// Mean-diff thresholds to sweep for every preset (comma-separated)
        #[arg(long, value_delimiter = ',')]
        thresholds: Vec<f64>,

        /// Output the report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Validate raw record schema
    Validate {
        #[command(flatten)]
        input: InputArgs,

        /// Output validation report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Diagnose configuration and parameter files
    Doctor {
        /// Check a configuration file
        #[arg(long)]
        config: Option<PathBuf>,

        /// Check a learned parameters file
        #[arg(long)]
        params: Option<PathBuf>,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(Args)]
struct InputArgs {
    /// Input file path (use - for stdin)
    #[arg(short, long, default_value = "-")]
    input: PathBuf,

    /// Input format
    #[arg(long, value_enum, default_value = "export")]
    input_format: InputFormat,

    /// Classifier configuration (JSON; missing fields take defaults)
    #[arg(long)]
    config: Option<PathBuf>,
}

#[derive(Args)]
struct TermArgs {
    /// Use the fixed-threshold baseline (disables every optional term)
    #[arg(long)]
    baseline: bool,

    /// Disable the time-prior blend in the awake gate
    #[arg(long)]
    no_time_prior: bool,

    /// Disable the prior-scaled awake threshold
    #[arg(long)]
    no_dynamic_threshold: bool,

    /// Disable transition smoothing
    #[arg(long)]
    no_smoothing: bool,
}

impl TermArgs {
    fn apply(&self, base: ScoringTerms) -> ScoringTerms {
        if self.baseline {
            return ScoringTerms::baseline();
        }
        ScoringTerms {
            time_prior_blend: base.time_prior_blend && !self.no_time_prior,
            dynamic_threshold: base.dynamic_threshold && !self.no_dynamic_threshold,
            transition_smoothing: base.transition_smoothing && !self.no_smoothing,
        }
    }
}

#[derive(Clone, ValueEnum)]
enum InputFormat {
    /// Export document with hrSamples and sleepStages arrays
    Export,
    /// Newline-delimited JSON records tagged with `kind`
    Ndjson,
}

#[derive(Clone, Copy, ValueEnum)]
enum ModeArg {
    /// Streaming decision machine
    Streaming,
    /// Batch HMM decoding
    Hmm,
}

impl From<ModeArg> for EvaluationMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Streaming => EvaluationMode::Streaming,
            ModeArg::Hmm => EvaluationMode::Hmm,
        }
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let level = cli.log_level.parse::<LevelFilter>().unwrap_or(LevelFilter::WARN);
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .with_writer(io::stderr)
        .init();

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            let error = CliError::from(e);
            eprintln!(
                "{}",
                serde_json::to_string(&error).unwrap_or_else(|_| "Unknown error".to_string())
            );
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<(), HypnosCliError> {
    match cli.command {
        Commands::Classify {
            input,
            output,
            params,
            terms,
        } => cmd_classify(&input, &output, params.as_deref(), &terms),

        Commands::Calibrate { input, output } => cmd_calibrate(&input, &output),

        Commands::Evaluate {
            input,
            mode,
            no_learn,
            terms,
            json,
        } => cmd_evaluate(&input, mode.into(), !no_learn, &terms, json),

        Commands::Compare {
            input,
            no_learn,
            thresholds,
            json,
        } => cmd_compare(&input, !no_learn, &thresholds, json),

        Commands::Validate { input, json } => cmd_validate(&input, json),

        Commands::Doctor {
            config,
            params,
            json,
        } => cmd_doctor(config.as_deref(), params.as_deref(), json),
    }
}

fn cmd_classify(
    args: &InputArgs,
    output: &Path,
    params: Option<&Path>,
    terms: &TermArgs,
) -> Result<(), HypnosCliError> {
    let mut config = load_config(args.config.as_deref())?;
    config.terms = terms.apply(config.terms);

    let input = load_input(args)?;
    if input.samples.is_empty() {
        return Err(HypnosCliError::NoSamples);
    }

    let classifier = match params {
        Some(path) => {
            let params = decode_parameters(&fs::read_to_string(path)?)?;
            StageClassifier::with_parameters(config, params)
        }
        None => StageClassifier::new(config),
    };

    let classifications = classifier.classify_stream(&input.samples);
    tracing::info!(samples = classifications.len(), "classification complete");

    let ndjson = ReportEncoder::new().encode_ndjson(&classifications)?;
    write_output(output, &ndjson)
}

fn cmd_calibrate(args: &InputArgs, output: &Path) -> Result<(), HypnosCliError> {
    let config = load_config(args.config.as_deref())?;
    let input = load_input(args)?;
    if input.records.is_empty() {
        return Err(HypnosCliError::NoStages);
    }

    let sessions = SessionSegmenter::new(config.session_gap_hours).segment(&input.records)?;
    let (params, report) = AdaptiveCalibrator::new(config).calibrate(&sessions, &input.samples);
    if !report.is_fully_learned() {
        tracing::warn!(
            sessions_used = report.sessions_used,
            fallback_bins = report.fallback_bins.len(),
            "some parameters fell back to defaults"
        );
    }

    let json = ReportEncoder::new().encode_calibration(&params, &report)?;
    write_output(output, &(json + "\n"))
}

fn cmd_evaluate(
    args: &InputArgs,
    mode: EvaluationMode,
    learn: bool,
    terms: &TermArgs,
    json: bool,
) -> Result<(), HypnosCliError> {
    let mut config = load_config(args.config.as_deref())?;
    config.terms = terms.apply(config.terms);

    let input = load_input(args)?;
    if input.records.is_empty() {
        return Err(HypnosCliError::NoStages);
    }

    let mut report = Evaluator::new(config, mode)
        .with_learning(learn)
        .evaluate(&input.records, &input.samples)?;
    report.input = Some(input.report);

    if json {
        println!("{}", ReportEncoder::new().encode_evaluation(&report)?);
    } else {
        print_evaluation(&report);
    }
    Ok(())
}

fn cmd_compare(
    args: &InputArgs,
    learn: bool,
    thresholds: &[f64],
    json: bool,
) -> Result<(), HypnosCliError> {
    let config = load_config(args.config.as_deref())?;
    let input = load_input(args)?;
    if input.records.is_empty() {
        return Err(HypnosCliError::NoStages);
    }

    let variants = if thresholds.is_empty() {
        Variant::presets()
    } else {
        Variant::threshold_grid(thresholds)
    };
    let report = Evaluator::new(config, EvaluationMode::Streaming)
        .with_learning(learn)
        .compare(&variants, &input.records, &input.samples)?;

    if json {
        println!("{}", ReportEncoder::new().encode_comparison(&report)?);
    } else {
        print_comparison(&report);
    }
    Ok(())
}

fn print_comparison(report: &ComparisonReport) {
    println!("Comparison Report");
    println!("=================");
    println!("Sessions evaluated: {}", report.sessions_evaluated);
    println!("Sessions skipped:   {}", report.sessions_skipped);
    println!("Samples:            {}", report.samples);
    println!();
    println!(
        "{:<22}{:>10}{:>10}{:>10}{:>10}{:>10}{:>10}",
        "variant", "threshold", "accuracy", "rem_sens", "rem_f1", "awk_sens", "awk_prec"
    );
    for row in &report.rows {
        let threshold = row
            .variant
            .threshold
            .map(|t| format!("{:.2}", t))
            .unwrap_or_else(|| "-".to_string());
        let m = &row.metrics;
        println!(
            "{:<22}{:>10}{:>10.3}{:>10.3}{:>10.3}{:>10.3}{:>10.3}",
            row.variant.label,
            threshold,
            m.accuracy,
            m.rem_sensitivity,
            m.rem_f1,
            m.awake_sensitivity,
            m.awake_precision
        );
    }
}

fn print_evaluation(report: &EvaluationReport) {
    let m = &report.metrics;
    println!("Evaluation Report ({})", report.mode.as_str());
    println!("==========================");
    println!("Sessions evaluated: {}", report.sessions_evaluated);
    println!("Sessions skipped:   {}", report.sessions_skipped);
    println!("Samples:            {}", report.samples);
    println!(
        "Terms:              time_prior_blend={} dynamic_threshold={} transition_smoothing={}",
        report.terms.time_prior_blend,
        report.terms.dynamic_threshold,
        report.terms.transition_smoothing
    );
    println!();
    println!("Accuracy:          {:.3}", m.accuracy);
    println!("REM sensitivity:   {:.3}", m.rem_sensitivity);
    println!("REM specificity:   {:.3}", m.rem_specificity);
    println!("REM precision:     {:.3}", m.rem_precision);
    println!("REM F1:            {:.3}", m.rem_f1);
    println!("Awake sensitivity: {:.3}", m.awake_sensitivity);
    println!("Awake precision:   {:.3}", m.awake_precision);
    println!();
    print_confusion(&report.confusion);
}

fn print_confusion(cm: &ConfusionMatrix) {
    println!("Confusion (rows actual, columns predicted):");
    print!("{:>8}", "");
    for predicted in Stage::ALL {
        print!("{:>8}", predicted.as_str());
    }
    println!();
    for actual in Stage::ALL {
        print!("{:>8}", actual.as_str());
        for predicted in Stage::ALL {
            print!("{:>8}", cm.count(actual, predicted));
        }
        println!();
    }
}

fn cmd_validate(args: &InputArgs, json: bool) -> Result<(), HypnosCliError> {
    let input = load_input(args)?;
    let sanitize = &input.report;

    let mut errors: Vec<ValidationErrorDetail> = sanitize
        .dropped
        .iter()
        .map(|d| ValidationErrorDetail {
            stream: match d.stream {
                RecordStream::HeartRate => "heart_rate".to_string(),
                RecordStream::Stage => "stage".to_string(),
            },
            index: d.index,
            error: d.issue.to_string(),
        })
        .collect();

    // structural checks only apply to what survived sanitizing
    if !input.records.is_empty() {
        let config = load_config(args.config.as_deref())?;
        if let Err(e) = SessionSegmenter::new(config.session_gap_hours).segment(&input.records) {
            errors.push(ValidationErrorDetail {
                stream: "stage".to_string(),
                index: 0,
                error: e.to_string(),
            });
        }
    }

    let report = ValidationReport {
        schema_version: SCHEMA_VERSION.to_string(),
        hr_records: sanitize.hr_total,
        stage_records: sanitize.stage_total,
        valid_hr_records: input.samples.len(),
        valid_stage_records: input.records.len(),
        errors,
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("Validation Report");
        println!("=================");
        println!("Schema:             {}", report.schema_version);
        println!("Heart-rate records: {} ({} valid)", report.hr_records, report.valid_hr_records);
        println!(
            "Stage records:      {} ({} valid)",
            report.stage_records, report.valid_stage_records
        );

        if !report.errors.is_empty() {
            println!("\nErrors:");
            for err in &report.errors {
                println!("  - {} record {}: {}", err.stream, err.index, err.error);
            }
        }
    }

    if report.errors.is_empty() {
        Ok(())
    } else {
        Err(HypnosCliError::ValidationFailed(report.errors.len()))
    }
}

fn cmd_doctor(
    config: Option<&Path>,
    params: Option<&Path>,
    json: bool,
) -> Result<(), HypnosCliError> {
    let mut checks: Vec<DoctorCheck> = vec![
        DoctorCheck {
            name: "hypnos_version".to_string(),
            status: CheckStatus::Ok,
            message: format!("Hypnos version {}", HYPNOS_VERSION),
        },
        DoctorCheck {
            name: "schema_version".to_string(),
            status: CheckStatus::Ok,
            message: format!("Input schema: {}", SCHEMA_VERSION),
        },
    ];

    if let Some(path) = config {
        checks.push(check_file("config", path, |content| {
            ClassifierConfig::from_json(content).map(|c| {
                format!(
                    "Configuration valid (session gap {}h, sleep latency {} min)",
                    c.session_gap_hours,
                    c.sleep_latency_minutes()
                )
            })
        }));
    }

    if let Some(path) = params {
        checks.push(check_file("params", path, |content| {
            decode_parameters(content).map(|p| {
                format!(
                    "Parameters valid ({} learned awake bins, threshold {:.2})",
                    p.awake_prior.bins.len(),
                    p.mean_diff_threshold
                )
            })
        }));
    }

    let stdin_check = if atty::is(atty::Stream::Stdin) {
        DoctorCheck {
            name: "stdin".to_string(),
            status: CheckStatus::Ok,
            message: "stdin is a TTY (pass --input for file input)".to_string(),
        }
    } else {
        DoctorCheck {
            name: "stdin".to_string(),
            status: CheckStatus::Ok,
            message: "stdin is a pipe (ready for --input -)".to_string(),
        }
    };
    checks.push(stdin_check);

    let report = DoctorReport {
        producer: PRODUCER_NAME.to_string(),
        version: HYPNOS_VERSION.to_string(),
        checks,
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("Hypnos Doctor Report");
        println!("====================");
        println!("Producer: {}", report.producer);
        println!("Version:  {}", report.version);
        println!("\nChecks:");

        for check in &report.checks {
            let status_icon = match check.status {
                CheckStatus::Ok => "[OK]",
                CheckStatus::Warning => "[WARN]",
                CheckStatus::Error => "[ERR]",
            };
            println!("  {} {}: {}", status_icon, check.name, check.message);
        }
    }

    let has_errors = report.checks.iter().any(|c| matches!(c.status, CheckStatus::Error));
    if has_errors {
        Err(HypnosCliError::DoctorFailed)
    } else {
        Ok(())
    }
}

// Helper functions

fn check_file<F>(name: &str, path: &Path, parse: F) -> DoctorCheck
where
    F: FnOnce(&str) -> Result<String, synheart_hypnos::ComputeError>,
{
    let (status, message) = if !path.exists() {
        (CheckStatus::Warning, format!("{} does not exist", path.display()))
    } else {
        match fs::read_to_string(path) {
            Ok(content) => match parse(&content) {
                Ok(message) => (CheckStatus::Ok, message),
                Err(e) => (CheckStatus::Error, e.to_string()),
            },
            Err(e) => (CheckStatus::Error, format!("Cannot read {}: {}", path.display(), e)),
        }
    };
    DoctorCheck {
        name: name.to_string(),
        status,
        message,
    }
}

fn read_input(path: &Path) -> Result<String, HypnosCliError> {
    if path.to_string_lossy() == "-" {
        let mut buffer = String::new();
        io::stdin().read_to_string(&mut buffer)?;
        Ok(buffer)
    } else {
        Ok(fs::read_to_string(path)?)
    }
}

fn load_input(args: &InputArgs) -> Result<SanitizedInput, HypnosCliError> {
    let data = read_input(&args.input)?;
    let input = match args.input_format {
        InputFormat::Export => RawRecordAdapter::load_export(&data)?,
        InputFormat::Ndjson => RawRecordAdapter::load_ndjson(&data)?,
    };
    let report = &input.report;
    if !report.dropped.is_empty() {
        tracing::warn!(
            hr_dropped = report.hr_dropped(),
            stage_dropped = report.stage_dropped(),
            "dropped malformed records"
        );
    }
    Ok(input)
}

fn load_config(path: Option<&Path>) -> Result<ClassifierConfig, HypnosCliError> {
    match path {
        Some(path) => Ok(ClassifierConfig::from_json(&fs::read_to_string(path)?)?),
        None => Ok(ClassifierConfig::default()),
    }
}

fn write_output(output: &Path, data: &str) -> Result<(), HypnosCliError> {
    if output.to_string_lossy() == "-" {
        print!("{}", data);
    } else {
        fs::write(output, data)?;
    }
    Ok(())
}

// Error types

#[derive(Debug)]
enum HypnosCliError {
    Io(io::Error),
    Compute(synheart_hypnos::ComputeError),
    Json(serde_json::Error),
    Validation(synheart_hypnos::schema::ValidationError),
    NoSamples,
    NoStages,
    ValidationFailed(usize),
    DoctorFailed,
}

impl From<io::Error> for HypnosCliError {
    fn from(e: io::Error) -> Self {
        HypnosCliError::Io(e)
    }
}

impl From<synheart_hypnos::ComputeError> for HypnosCliError {
    fn from(e: synheart_hypnos::ComputeError) -> Self {
        HypnosCliError::Compute(e)
    }
}

impl From<serde_json::Error> for HypnosCliError {
    fn from(e: serde_json::Error) -> Self {
        HypnosCliError::Json(e)
    }
}

impl From<synheart_hypnos::schema::ValidationError> for HypnosCliError {
    fn from(e: synheart_hypnos::schema::ValidationError) -> Self {
        HypnosCliError::Validation(e)
    }
}

#[derive(serde::Serialize)]
struct CliError {
    code: String,
    message: String,
    hint: Option<String>,
}

impl From<HypnosCliError> for CliError {
    fn from(e: HypnosCliError) -> Self {
        match e {
            HypnosCliError::Io(e) => CliError {
                code: "IO_ERROR".to_string(),
                message: e.to_string(),
                hint: Some("Check file paths and permissions".to_string()),
            },
            HypnosCliError::Compute(e) => CliError {
                code: "COMPUTE_ERROR".to_string(),
                message: e.to_string(),
                hint: Some(format!("Ensure input matches the {} schema", SCHEMA_VERSION)),
            },
            HypnosCliError::Json(e) => CliError {
                code: "JSON_ERROR".to_string(),
                message: e.to_string(),
                hint: Some("Check JSON syntax".to_string()),
            },
            HypnosCliError::Validation(e) => CliError {
                code: "VALIDATION_ERROR".to_string(),
                message: e.to_string(),
                hint: Some("Run 'hypnos validate' for details".to_string()),
            },
            HypnosCliError::NoSamples => CliError {
                code: "NO_SAMPLES".to_string(),
                message: "No valid heart-rate samples found in input".to_string(),
                hint: Some("Ensure hrSamples is present and not empty".to_string()),
            },
            HypnosCliError::NoStages => CliError {
                code: "NO_STAGES".to_string(),
                message: "No valid stage records found in input".to_string(),
                hint: Some("Calibration and evaluation need labelled sleepStages".to_string()),
            },
            HypnosCliError::ValidationFailed(count) => CliError {
                code: "VALIDATION_FAILED".to_string(),
                message: format!("{} records failed validation", count),
                hint: Some("Fix validation errors and retry".to_string()),
            },
            HypnosCliError::DoctorFailed => CliError {
                code: "DOCTOR_FAILED".to_string(),
                message: "One or more health checks failed".to_string(),
                hint: Some("Review the doctor report for details".to_string()),
            },
        }
    }
}

// Report types

#[derive(serde::Serialize)]
struct ValidationReport {
    schema_version: String,
    hr_records: usize,
    stage_records: usize,
    valid_hr_records: usize,
    valid_stage_records: usize,
    errors: Vec<ValidationErrorDetail>,
}

#[derive(serde::Serialize)]
struct ValidationErrorDetail {
    stream: String,
    index: usize,
    error: String,
}

#[derive(serde::Serialize)]
struct DoctorReport {
    producer: String,
    version: String,
    checks: Vec<DoctorCheck>,
}

#[derive(serde::Serialize)]
struct DoctorCheck {
    name: String,
    status: CheckStatus,
    message: String,
}

#[derive(serde::Serialize)]
enum CheckStatus {
    Ok,
    Warning,
    Error,
}
