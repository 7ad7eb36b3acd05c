use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use crossbeam_channel::unbounded;
use dejaview::analyzer::{triage_to_report, TriageAnalyzer};
use dejaview::decrypt::{decode_base64, CommandDecryptor, DecodedPayload, ViewStateDecryptor};
use dejaview::extractor::{ArtifactStore, Extractor};
use dejaview::gadgets::{default_catalog, GadgetCatalog};
use dejaview::models::{RunSummary, ViewStateEvent};
use dejaview::{output, parser};
use log::{info, warn};
use std::fs;
use std::path::PathBuf;
use std::thread;
use std::time::Instant;

#[derive(Parser)]
#[command(
    name = "dejaview",
    about = "Triage decrypted ASP.NET ViewStates for embedded executables and .NET gadget chains",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Directory for carved executables, named by MD5
    #[arg(long, global = true, default_value = ".")]
    artifact_dir: PathBuf,

    /// Do not write carved executables to disk
    #[arg(long, global = true, default_value_t = false)]
    no_artifacts: bool,

    /// Additional gadget rules (TOML)
    #[arg(long, global = true, value_name = "FILE")]
    rules: Option<PathBuf>,

    /// Use only the rules from --rules instead of adding them to the built-in catalog
    #[arg(long, global = true, default_value_t = false, requires = "rules")]
    replace_rules: bool,

    /// Worker threads (defaults to the number of CPUs)
    #[arg(short, long, global = true)]
    jobs: Option<usize>,
}

#[derive(Subcommand)]
enum Commands {
    /// Decrypt ViewStates from event logs or the command line and write a report
    Triage {
        /// Report file
        #[arg(short, long, value_name = "FILE")]
        output: PathBuf,
        /// Line delimited file of 1316 / 4009 event logs
        #[arg(short, long, value_name = "FILE")]
        logs: Option<PathBuf>,
        /// Single ViewState payload (base64)
        #[arg(short, long, value_name = "B64")]
        payload: Option<String>,
        #[arg(short, long, value_enum, default_value = "tsv")]
        format: output::OutputFormat,
        /// ViewStates are already decrypted; only base64-decode them
        #[arg(long, default_value_t = false, conflicts_with = "decrypt_cmd")]
        decoded: bool,
        /// External tool that decrypts a ViewState read from stdin and prints base64
        #[arg(long, value_name = "PROGRAM")]
        decrypt_cmd: Option<PathBuf>,
        /// Argument passed to the decryption tool (repeatable)
        #[arg(long = "decrypt-arg", value_name = "ARG", allow_hyphen_values = true)]
        decrypt_args: Vec<String>,
    },
    /// Scan a single decrypted payload file
    Scan {
        #[arg(value_name = "FILE")]
        file: PathBuf,
        /// The file holds base64 text rather than raw bytes
        #[arg(long, default_value_t = false)]
        base64: bool,
    },
    /// List the active gadget rules
    Rules {
        /// Print the catalog as TOML
        #[arg(long, default_value_t = false)]
        dump: bool,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .format_timestamp_micros()
        .init();

    if let Some(jobs) = cli.jobs {
        rayon::ThreadPoolBuilder::new()
            .num_threads(jobs)
            .build_global()
            .context("Failed to configure worker pool")?;
    }

    let catalog = load_catalog(&cli)?;
    let extractor = if cli.no_artifacts {
        Extractor::detached()
    } else {
        Extractor::new(Some(ArtifactStore::new(&cli.artifact_dir)))
    };

    match &cli.command {
        Commands::Triage {
            output,
            logs,
            payload,
            format,
            decoded,
            decrypt_cmd,
            decrypt_args,
        } => {
            if logs.is_none() && payload.is_none() {
                bail!("Must provide either an event log file or a payload string");
            }

            let decryptor: Box<dyn ViewStateDecryptor> = match (decrypt_cmd, decoded) {
                (Some(program), _) => Box::new(CommandDecryptor::new(program, decrypt_args.clone())),
                (None, true) => Box::new(DecodedPayload),
                (None, false) => bail!("Either --decrypt-cmd or --decoded must be specified"),
            };

            let start_time = Instant::now();
            let mut events = Vec::new();
            if let Some(logs) = logs {
                let parsed = parser::read_log(logs)
                    .with_context(|| format!("Failed to read event log: {}", logs.display()))?;
                if parsed.malformed > 0 {
                    warn!("{} truncated events were skipped", parsed.malformed);
                }
                events.extend(parsed.events);
            }
            if let Some(payload) = payload {
                events.push(ViewStateEvent::from_payload(payload.trim()));
            }

            let analyzer = TriageAnalyzer::new(decryptor.as_ref(), extractor, &catalog);
            let writer = output::ReportWriter::new().with_format(*format);

            let (progress_tx, progress_rx) = unbounded::<f32>();
            let progress_task = thread::spawn(move || {
                let mut last = 0.0;
                for progress in progress_rx.iter() {
                    let rounded = (progress / 25.0).floor() * 25.0;
                    if rounded > last && rounded <= 100.0 {
                        info!("Triage progress: {}%", rounded);
                        last = rounded;
                    }
                }
            });

            let result = triage_to_report(&analyzer, &events, &writer, output, |progress| {
                let _ = progress_tx.send(progress);
            });
            drop(progress_tx);
            let _ = progress_task.join();

            let summary: RunSummary = result.context("Triage failed")?;
            println!("{}", summary);
            info!(
                "All done in {:?}. Output written as {} to {}",
                start_time.elapsed(),
                format.extension().to_uppercase(),
                output.display()
            );
        }
        Commands::Scan { file, base64 } => {
            let data = fs::read(file)
                .with_context(|| format!("Failed to read payload file: {}", file.display()))?;
            let blob = if *base64 {
                decode_base64(&String::from_utf8_lossy(&data))
                    .with_context(|| format!("{} is not valid base64", file.display()))?
            } else {
                data
            };

            let extraction = extractor.extract(&blob);
            let gadgets = catalog.scan(&blob);
            let result = serde_json::json!({
                "file": file.display().to_string(),
                "size": blob.len(),
                "executable": extraction,
                "suspicious_gadgets": gadgets,
            });
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        Commands::Rules { dump } => {
            if *dump {
                print!("{}", catalog.to_toml()?);
            } else {
                println!("Active gadget rules ({}):", catalog.len());
                for rule in catalog.rules() {
                    let tokens: Vec<String> = rule.tokens.iter().map(|t| t.to_string()).collect();
                    println!("- {}: {}", rule.name, tokens.join(" .. "));
                }
            }
        }
    }

    Ok(())
}

fn load_catalog(cli: &Cli) -> Result<GadgetCatalog> {
    let mut catalog = if cli.replace_rules {
        GadgetCatalog::new(Vec::new())?
    } else {
        default_catalog().clone()
    };
    if let Some(path) = &cli.rules {
        let extra = GadgetCatalog::load(path)
            .with_context(|| format!("Failed to load gadget rules: {}", path.display()))?;
        catalog.extend(extra).context("Invalid gadget rules")?;
    }
    Ok(catalog)
}
