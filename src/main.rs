use clap::{Parser, Subcommand};
use cuspak::{inspect, pack, unpack, PackOptions, ProgressSink, Strategy, UnpackOptions};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

/// Build info from build.rs
const PROFILE: &str = env!("CUSPAK_PROFILE");
const GIT_HASH: &str = env!("CUSPAK_GIT_HASH");

fn get_version() -> &'static str {
    use std::sync::OnceLock;
    static VERSION_STRING: OnceLock<String> = OnceLock::new();
    VERSION_STRING.get_or_init(|| {
        format!("{} {} ({})", env!("CARGO_PKG_VERSION"), PROFILE, GIT_HASH)
    })
}

#[derive(Parser)]
#[command(name = "cuspak")]
#[command(author, about = "Encrypted multi-file container", long_about = None)]
struct Cli {
    /// Print version
    #[arg(short = 'V', long)]
    version: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Pack files into a container
    #[command(alias = "p")]
    Pack {
        /// Input files
        #[arg(required = true)]
        inputs: Vec<PathBuf>,

        /// Output container path
        #[arg(short, long)]
        output: PathBuf,

        /// Secret key (prompted when omitted, unless --plain)
        #[arg(long)]
        secret: Option<String>,

        /// Write an unencrypted container
        #[arg(long)]
        plain: bool,

        /// Payload strategy
        #[arg(long, default_value = "sequential", value_parser = parse_strategy)]
        strategy: Strategy,

        /// Plaintext chunk size in bytes (chunked strategy)
        #[arg(long, default_value = "65536")]
        chunk_size: u32,
    },

    /// Unpack a container
    #[command(alias = "x")]
    Unpack {
        /// Container file
        input: PathBuf,

        /// Output directory
        #[arg(short, long, default_value = ".")]
        output: PathBuf,

        /// Secret key (prompted when needed and omitted)
        #[arg(long)]
        secret: Option<String>,
    },

    /// Show information about a container
    #[command(alias = "i")]
    Info {
        /// Container file
        input: PathBuf,

        /// Secret key (entry listing of encrypted containers needs it)
        #[arg(long)]
        secret: Option<String>,

        /// Emit JSON instead of a table
        #[arg(long)]
        json: bool,
    },
}

fn parse_strategy(s: &str) -> Result<Strategy, String> {
    s.parse().map_err(|e| format!("{}", e))
}

fn progress_bar_sink(prefix: &str) -> (ProgressBar, Arc<dyn ProgressSink>) {
    let pb = ProgressBar::new(0);
    pb.set_style(
        ProgressStyle::with_template(
            "{prefix:.bold} [{bar:40.cyan/blue}] {bytes}/{total_bytes} {msg}",
        )
        .unwrap()
        .progress_chars("=>-"),
    );
    pb.set_prefix(prefix.to_string());

    let sink = {
        let pb = pb.clone();
        move |processed: u64, total: u64| {
            if pb.length() != Some(total) {
                pb.set_length(total);
            }
            pb.set_position(processed);
        }
    };
    (pb, Arc::new(sink))
}

fn prompt_secret(confirm: bool) -> Result<Vec<u8>, String> {
    let secret = rpassword::prompt_password("Secret: ").map_err(|e| e.to_string())?;
    if secret.is_empty() {
        return Err("secret must not be empty".into());
    }
    if confirm {
        let again = rpassword::prompt_password("Confirm: ").map_err(|e| e.to_string())?;
        if secret != again {
            return Err("secrets do not match".into());
        }
    }
    Ok(secret.into_bytes())
}

fn run_pack(
    inputs: Vec<PathBuf>,
    output: PathBuf,
    secret: Option<String>,
    plain: bool,
    strategy: Strategy,
    chunk_size: u32,
) -> Result<(), String> {
    let secret = if plain {
        None
    } else {
        Some(match secret {
            Some(s) => s.into_bytes(),
            None => prompt_secret(true)?,
        })
    };

    let (pb, sink) = progress_bar_sink("pack");
    let options = PackOptions {
        strategy,
        chunk_size,
        progress: Some(sink),
        ..Default::default()
    };

    let path = pack(&inputs, &output, secret.as_deref(), &options).map_err(|e| e.to_string())?;
    pb.finish_and_clear();
    println!("Packed {} file(s) into {}", inputs.len(), path.display());
    Ok(())
}

fn run_unpack(input: PathBuf, output: PathBuf, secret: Option<String>) -> Result<(), String> {
    // Only ask for a secret when the container actually needs one
    let secret = match secret {
        Some(s) => Some(s.into_bytes()),
        None => {
            let info = inspect(&input, None).map_err(|e| e.to_string())?;
            if info.encrypted {
                Some(prompt_secret(false)?)
            } else {
                None
            }
        }
    };

    let (pb, sink) = progress_bar_sink("unpack");
    let options = UnpackOptions {
        progress: Some(sink),
        ..Default::default()
    };

    let extracted =
        unpack(&input, &output, secret.as_deref(), &options).map_err(|e| e.to_string())?;
    pb.finish_and_clear();
    println!("Extracted {} file(s) to {}", extracted.len(), output.display());
    for path in &extracted {
        println!("  {}", path.display());
    }
    Ok(())
}

fn run_info(input: PathBuf, secret: Option<String>, json: bool) -> Result<(), String> {
    let secret = secret.map(String::into_bytes);
    let info = inspect(&input, secret.as_deref()).map_err(|e| e.to_string())?;

    if json {
        println!("{}", info.to_json().map_err(|e| e.to_string())?);
        return Ok(());
    }

    println!("Cuspak Container");
    println!("================");
    println!("File: {}", input.display());
    println!("Version: {}", info.version);
    println!("Encrypted: {}", if info.encrypted { "yes" } else { "no" });
    println!("Container size: {}", format_size(info.container_size));

    match info.entries {
        Some(entries) => {
            if let Some(strategy) = info.strategy {
                println!("Strategy: {}", strategy);
            }
            if let Some(chunk_size) = info.chunk_size {
                println!("Chunk size: {}", format_size(chunk_size as u64));
            }
            if let Some(total) = info.total_size {
                println!("Content size: {}", format_size(total));
            }
            println!();
            println!("Entries ({}):", entries.len());
            for entry in entries {
                println!(
                    "  {}  {}  {}",
                    entry.path,
                    format_size(entry.size),
                    &entry.content_hash[..16]
                );
            }
        }
        None => {
            println!();
            println!("Header is encrypted; supply --secret to list entries.");
        }
    }
    Ok(())
}

fn format_size(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.1} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    if cli.version {
        println!("cuspak {}", get_version());
        return ExitCode::SUCCESS;
    }

    let command = match cli.command {
        Some(cmd) => cmd,
        None => {
            use clap::CommandFactory;
            Cli::command().print_help().unwrap();
            println!();
            return ExitCode::SUCCESS;
        }
    };

    let result = match command {
        Commands::Pack {
            inputs,
            output,
            secret,
            plain,
            strategy,
            chunk_size,
        } => run_pack(inputs, output, secret, plain, strategy, chunk_size),
        Commands::Unpack {
            input,
            output,
            secret,
        } => run_unpack(input, output, secret),
        Commands::Info {
            input,
            secret,
            json,
        } => run_info(input, secret, json),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}
