//! # Mullama Bridge CLI
//!
//! Drives one session from the terminal.
//!
//! ```bash
//! mullama-bridge chat --model model.gguf "Tell me a story"
//! mullama-bridge vision --image cat.jpeg "What is in this photo?"
//! mullama-bridge bench --model model.gguf --pp 512 --tg 128
//! ```

use std::io::{self, Write};
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use futures::StreamExt;
use mullama_bridge::{init_logging, BridgeConfig, BridgeError, Conversation, Session};
use tracing::error;

#[derive(Parser)]
#[command(name = "mullama-bridge")]
#[command(author, version, about = "Single-lane llama.cpp session from the terminal")]
#[command(propagate_version = true)]
struct Cli {
    /// JSON configuration file (MULLAMA_* variables apply on top)
    #[arg(short, long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Text completion with a GGUF model
    Chat {
        /// Model path (default: model.path from the configuration)
        #[arg(short, long)]
        model: Option<PathBuf>,

        /// Prompt; reads prompts line by line from stdin when omitted
        prompt: Option<String>,
    },

    /// Ask a question about an image
    Vision {
        /// Image file to embed
        #[arg(short, long)]
        image: PathBuf,

        /// Vision language model (default: vision.model_path)
        #[arg(long)]
        model: Option<String>,

        /// Multimodal projector (default: vision.mmproj_path)
        #[arg(long)]
        mmproj: Option<String>,

        /// Question; may contain an <image> placeholder
        #[arg(default_value = "What's the main content of this photo?")]
        prompt: String,
    },

    /// Prompt-processing and text-generation throughput
    Bench {
        /// Model path (default: model.path from the configuration)
        #[arg(short, long)]
        model: Option<PathBuf>,

        /// Prompt tokens processed per run
        #[arg(long, default_value = "512")]
        pp: i32,

        /// Tokens generated per run
        #[arg(long, default_value = "128")]
        tg: i32,

        /// Parallel sequences during generation
        #[arg(long, default_value = "1")]
        pl: i32,

        /// Number of runs
        #[arg(long, default_value = "1")]
        nr: i32,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if let Err(e) = run(cli).await {
        error!(error = %e, "command failed");
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn load_config(cli: &Cli) -> Result<BridgeConfig, BridgeError> {
    let mut config = match &cli.config {
        Some(path) => BridgeConfig::from_json_file(path)?,
        None => BridgeConfig::default(),
    };
    config.apply_env()?;
    if let Some(level) = &cli.log_level {
        config.logging.level = level.clone();
    }
    Ok(config)
}

fn model_path(explicit: Option<PathBuf>, config: &BridgeConfig) -> Result<PathBuf, BridgeError> {
    match explicit {
        Some(path) => Ok(path),
        None if !config.model.path.is_empty() => Ok(PathBuf::from(&config.model.path)),
        None => Err(BridgeError::ConfigError(
            "no model given; pass --model or set model.path".to_string(),
        )),
    }
}

async fn run(cli: Cli) -> Result<(), BridgeError> {
    let mut config = load_config(&cli)?;
    init_logging(&config.logging);

    match cli.command {
        Commands::Chat { model, prompt } => {
            let path = model_path(model, &config)?;
            let session = Session::native(config)?;
            session.load(&path).await?;

            let result = match prompt {
                Some(prompt) => stream_reply(&session, &prompt).await,
                None => chat_loop(&session).await,
            };
            session.shutdown().await?;
            result
        }
        Commands::Vision {
            image,
            model,
            mmproj,
            prompt,
        } => {
            if let Some(model) = model {
                config.vision.model_path = model;
            }
            if let Some(mmproj) = mmproj {
                config.vision.mmproj_path = mmproj;
            }
            let session = Session::native(config)?;
            session.load_vision_session().await?;

            let file = tokio::fs::File::open(&image).await?;
            session.load_image_from_reader(file).await?;

            let result = stream_reply(&session, &prompt).await;
            session.shutdown().await?;
            result
        }
        Commands::Bench {
            model,
            pp,
            tg,
            pl,
            nr,
        } => {
            let path = model_path(model, &config)?;
            let session = Session::native(config)?;
            session.load(&path).await?;
            let report = session.bench(pp, tg, pl, nr).await;
            session.shutdown().await?;
            println!("{}", report?);
            Ok(())
        }
    }
}

async fn stream_reply(session: &Session, prompt: &str) -> Result<(), BridgeError> {
    let mut stream = session.generate(prompt);
    let mut stdout = io::stdout();
    while let Some(fragment) = stream.next().await {
        print!("{}", fragment?);
        stdout.flush()?;
    }
    println!();
    Ok(())
}

async fn chat_loop(session: &Session) -> Result<(), BridgeError> {
    let mut conversation = Conversation::new();
    let stdin = io::stdin();
    let mut line = String::new();

    loop {
        print!("> ");
        io::stdout().flush()?;
        line.clear();
        if stdin.read_line(&mut line)? == 0 {
            break;
        }
        let prompt = line.trim();
        if prompt.is_empty() {
            continue;
        }

        conversation.push_user_text(prompt);
        let mut printed = 0;
        conversation
            .reply_with(session, prompt, |text| {
                print!("{}", &text[printed..]);
                printed = text.len();
                let _ = io::stdout().flush();
            })
            .await?;
        println!();
    }
    Ok(())
}
