use std::path::PathBuf;
use std::process::{ExitCode, Stdio};
use std::sync::Arc;
use std::time::Instant;

use clap::{Arg, ArgAction, ArgMatches, Command};
use log::{error, info, warn};

use audiobook_pipeline::{
    AudioFormat, Book, CancelFlag, Config, Credentials, DefaultChapterSource, FfmpegConcat,
    GoogleTtsClient, Pipeline, PipelineError, RunReport, SynthesisError,
};

const EXIT_FATAL: u8 = 1;
const EXIT_PARTIAL: u8 = 2;
const EXIT_INTERRUPTED: u8 = 130;

fn build_cli() -> Command {
    Command::new("Audiobook Pipeline")
    .version("1.0")
    .about("Converts web-hosted books into per-chapter audiobook files using cloud TTS")
    .arg(
        Arg::new("manifest")
        .value_name("MANIFEST")
        .help("Book manifest (JSON with title, author and chapter sources)")
        .value_parser(clap::value_parser!(PathBuf))
        .required(true),
    )
    .arg(
        Arg::new("output")
        .short('o')
        .long("output-dir")
        .value_name("DIR")
        .help("Base output directory")
        .value_parser(clap::value_parser!(PathBuf)),
    )
    .arg(
        Arg::new("voice")
        .long("voice")
        .value_name("NAME")
        .help("Voice name, e.g. ru-RU-Wavenet-B"),
    )
    .arg(
        Arg::new("language")
        .long("language")
        .value_name("CODE")
        .help("Voice language code, e.g. ru-RU"),
    )
    .arg(
        Arg::new("speaking_rate")
        .long("speaking-rate")
        .value_name("FLOAT")
        .help("Speaking rate (0.25-4.0)")
        .value_parser(clap::value_parser!(f32)),
    )
    .arg(
        Arg::new("pitch")
        .long("pitch")
        .value_name("FLOAT")
        .help("Pitch in semitones (-20.0-20.0)")
        .allow_negative_numbers(true)
        .value_parser(clap::value_parser!(f32)),
    )
    .arg(
        Arg::new("format")
        .short('f')
        .long("format")
        .value_name("FORMAT")
        .help("Output audio format")
        .value_parser(["mp3", "ogg", "wav"]),
    )
    .arg(
        Arg::new("force")
        .long("force")
        .help("Reprocess chapters even if their audio already exists")
        .action(ArgAction::SetTrue),
    )
    .arg(
        Arg::new("extract_only")
        .long("extract-only")
        .help("Stop after writing the cleaned chapter text")
        .action(ArgAction::SetTrue),
    )
    .arg(
        Arg::new("config")
        .long("config")
        .value_name("FILE")
        .help("JSON config file; command-line flags override it")
        .value_parser(clap::value_parser!(PathBuf)),
    )
    .arg(
        Arg::new("verbose")
        .short('v')
        .long("verbose")
        .help("Debug logging")
        .action(ArgAction::SetTrue),
    )
    .arg(
        Arg::new("no_progress")
        .long("no-progress")
        .help("Do not draw the progress bar")
        .action(ArgAction::SetTrue),
    )
}

/// Defaults, then the config file, then flags.
fn load_config(matches: &ArgMatches) -> Result<Config, PipelineError> {
    let mut config = match matches.get_one::<PathBuf>("config") {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };

    if let Some(dir) = matches.get_one::<PathBuf>("output") {
        config.output.base_dir = dir.clone();
    }
    if let Some(voice) = matches.get_one::<String>("voice") {
        config.voice.name = voice.clone();
    }
    if let Some(language) = matches.get_one::<String>("language") {
        config.voice.language_code = language.clone();
    }
    if let Some(rate) = matches.get_one::<f32>("speaking_rate") {
        config.voice.speaking_rate = *rate;
    }
    if let Some(pitch) = matches.get_one::<f32>("pitch") {
        config.voice.pitch = *pitch;
    }
    if let Some(format) = matches.get_one::<String>("format") {
        config.output.audio_format = AudioFormat::parse(format)
            .ok_or_else(|| PipelineError::Config(format!("unsupported format: {format}")))?;
    }
    if matches.get_flag("force") {
        config.force_reprocess = true;
    }
    if matches.get_flag("extract_only") {
        config.extract_only = true;
    }
    if matches.get_flag("no_progress") {
        config.show_progress = false;
    }

    config.validate()?;
    Ok(config)
}

fn init_logging(verbose: bool) {
    let default_filter = if verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter))
        .format_timestamp_secs()
        .init();
}

async fn check_ffmpeg(program: &str) -> Result<(), PipelineError> {
    let available = tokio::process::Command::new(program)
        .arg("-version")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await
        .map(|status| status.success())
        .unwrap_or(false);

    if available {
        Ok(())
    } else {
        Err(PipelineError::Config(format!(
            "{program} not found. Please install ffmpeg or set ffmpeg_path in the config"
        )))
    }
}

/// Requests a graceful stop. Returns true if one was already requested.
fn interrupt(cancel: &CancelFlag) -> bool {
    if cancel.is_cancelled() {
        return true;
    }
    cancel.cancel();
    false
}

async fn run(matches: &ArgMatches) -> Result<RunReport, PipelineError> {
    let config = load_config(matches)?;
    let manifest = matches
        .get_one::<PathBuf>("manifest")
        .ok_or_else(|| PipelineError::Config("missing manifest path".into()))?;
    let book = Book::load(manifest)?;

    let credentials = match Credentials::from_env() {
        Ok(credentials) => credentials,
        // Never used in extract-only runs.
        Err(_) if config.extract_only => Credentials::ApiKey(String::new()),
        Err(SynthesisError::Auth(message)) => return Err(PipelineError::Auth(message)),
        Err(e) => return Err(PipelineError::Config(e.to_string())),
    };
    if !config.extract_only {
        check_ffmpeg(&config.ffmpeg_path).await?;
    }

    let source = DefaultChapterSource::new(&config)
        .map_err(|e| PipelineError::Config(e.to_string()))?
        .with_chapter_urls(book.chapters.iter().map(|c| &c.source));
    let synthesizer = GoogleTtsClient::new(
        credentials,
        config.output.audio_format,
        config.timeouts.synthesis(),
    )
    .map_err(|e| PipelineError::Config(e.to_string()))?;
    let concat = FfmpegConcat::new(config.ffmpeg_path.clone(), config.timeouts.merge());

    let cancel = CancelFlag::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        while tokio::signal::ctrl_c().await.is_ok() {
            if interrupt(&on_interrupt) {
                error!("Second interrupt, exiting now");
                std::process::exit(EXIT_INTERRUPTED.into());
            }
            warn!("Interrupt received, stopping after the current step (press Ctrl-C again to exit now)");
        }
    });

    info!(
        "Voice {} ({}), format {}",
        config.voice.name,
        config.voice.language_code,
        config.output.audio_format.extension()
    );
    let output_dir = book.output_dir(&config.output.base_dir);
    let pipeline = Pipeline::new(config, Arc::new(source), Arc::new(synthesizer), Arc::new(concat))
        .with_cancel_flag(cancel);

    let report = pipeline.run(&book).await?;
    println!("📁 Output saved to: {}", output_dir.display());
    Ok(report)
}

#[tokio::main]
async fn main() -> ExitCode {
    let matches = build_cli().get_matches();
    init_logging(matches.get_flag("verbose"));

    let start_time = Instant::now();
    match run(&matches).await {
        Ok(report) if report.has_failures() => {
            println!(
                "⚠️  Finished in {:.2?} with {} failed chapter(s); run again to retry them",
                start_time.elapsed(),
                report.failed()
            );
            ExitCode::from(EXIT_PARTIAL)
        }
        Ok(_) => {
            println!("✅ Conversion completed in {:.2?}", start_time.elapsed());
            ExitCode::SUCCESS
        }
        Err(PipelineError::Interrupted) => {
            error!("{}", PipelineError::Interrupted);
            ExitCode::from(EXIT_INTERRUPTED)
        }
        Err(e) => {
            error!("{}", e);
            ExitCode::from(EXIT_FATAL)
        }
    }
}
