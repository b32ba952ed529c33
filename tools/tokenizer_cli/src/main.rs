use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::fs;
use std::path::PathBuf;
use tokenizer::{LatexTokenizer, VocabBuilder};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build a vocabulary from formula files
    Build {
        /// Formula files, one formula per line
        #[arg(required = true)]
        files: Vec<PathBuf>,

        /// Output vocabulary JSON
        #[arg(short, long, default_value = "data/vocab.json")]
        output: PathBuf,

        /// Maximum vocabulary size, special tokens included
        #[arg(short, long)]
        max_size: Option<usize>,

        /// Minimum number of occurrences for a token to be kept
        #[arg(long, default_value_t = 1)]
        min_frequency: u32,
    },
    /// Encode a formula to token ids
    Encode {
        /// Path to vocab.json
        #[arg(long, default_value = "data/vocab.json")]
        vocab: PathBuf,

        /// Formula to encode
        #[arg(short, long)]
        text: String,
    },
    /// Decode token ids to a formula
    Decode {
        /// Path to vocab.json
        #[arg(long, default_value = "data/vocab.json")]
        vocab: PathBuf,

        /// IDs to decode (comma separated)
        #[arg(short, long)]
        ids: String,
    },
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    match cli.command {
        Commands::Build {
            files,
            output,
            max_size,
            min_frequency,
        } => {
            log::info!("Building vocabulary from {:?}", files);
            let vocab = VocabBuilder::new(min_frequency, max_size)
                .build(files.as_slice())
                .context("Failed to build vocabulary")?;

            if let Some(parent) = output.parent().filter(|p| !p.as_os_str().is_empty()) {
                fs::create_dir_all(parent)?;
            }
            vocab.save(&output).context("Failed to save vocab")?;
            println!("Saved {} tokens to {:?}", vocab.len(), output);
        }
        Commands::Encode { vocab, text } => {
            let tokenizer = LatexTokenizer::load(&vocab).context("Failed to load tokenizer")?;
            println!("Encoded IDs: {:?}", tokenizer.encode(&text));
        }
        Commands::Decode { vocab, ids } => {
            let tokenizer = LatexTokenizer::load(&vocab).context("Failed to load tokenizer")?;
            let id_list = ids
                .split(',')
                .map(|s| s.trim().parse::<i64>().with_context(|| format!("Invalid ID {s:?}")))
                .collect::<Result<Vec<_>>>()?;
            println!("Decoded text: {}", tokenizer.decode(&id_list));
        }
    }

    Ok(())
}
