//! Ask a Gemini model questions about a repository from the command line.
//!
//! Reads the API key from `GEMINI_API_KEY` and an optional GitHub token from
//! `GITHUB_TOKEN`.
//!
//! # Examples
//!
//! ```sh
//! # Analyze a local project and ask one question
//! repolens --repo ./my-project --analyze --query "Where is the config parsed?"
//!
//! # A GitHub repository on a specific branch, continuing a saved session
//! repolens --repo https://github.com/octo/demo --branch dev \
//!   --session demo.json --query "And who calls it?"
//!
//! # Pipe the question from stdin
//! echo "Summarize the architecture" | repolens --repo . --stdin
//! ```

use clap::Parser;
use repolens::context::ExclusionNotice;
use repolens::prelude::*;
use repolens::session::RepoBinding;
use std::io::{self, Read, Write};
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Ask a Gemini model questions about a repository.
#[derive(Parser)]
#[command(name = "repolens")]
struct Cli {
    // ── Repository ─────────────────────────────────────────────
    /// GitHub URL or local folder to talk about
    #[arg(long)]
    repo: Option<String>,

    /// Branch or commit to read from
    #[arg(long)]
    branch: Option<String>,

    /// Analyze the repository before asking (always done when nothing was
    /// analyzed yet)
    #[arg(long)]
    analyze: bool,

    /// File extensions to analyze, e.g. `.rs`
    #[arg(long = "ext")]
    extensions: Vec<String>,

    // ── Question ───────────────────────────────────────────────
    /// Question to ask
    #[arg(long)]
    query: Option<String>,

    /// Read the question (or extra text for it) from stdin
    #[arg(long)]
    stdin: bool,

    // ── Session ────────────────────────────────────────────────
    /// Session file: loaded if it exists, saved after the round
    #[arg(long)]
    session: Option<PathBuf>,

    // ── Model ──────────────────────────────────────────────────
    /// Model to use
    #[arg(long, default_value = DEFAULT_MODEL)]
    model: String,

    /// Maximum tokens in the response
    #[arg(long, default_value_t = DEFAULT_MAX_OUTPUT_TOKENS)]
    max_output_tokens: u32,

    /// Additional instructions for the model
    #[arg(long)]
    instructions: Option<String>,

    /// Language of the answers
    #[arg(long, default_value = "English")]
    language: String,

    /// Send whole files instead of retrieved chunks
    #[arg(long)]
    whole_file: bool,

    /// Files the model may request per question (0 disables requests)
    #[arg(long)]
    hops: Option<u32>,

    /// Print the answer as it arrives
    #[arg(long)]
    stream: bool,

    /// List the available models and exit
    #[arg(long)]
    list_models: bool,
}

// ── Event handler ──────────────────────────────────────────────────

/// Prints progress and warnings to stderr, streamed text to stdout.
struct CliEventHandler {
    streaming: bool,
}

impl EventHandler for CliEventHandler {
    fn on_event(&self, event: &ConversationEvent<'_>) {
        match event {
            ConversationEvent::Progress {
                message,
                current,
                total,
            } => eprintln!("  [{current}/{total}] {message}"),
            ConversationEvent::Excluded(notice) => print_notice(notice),
            ConversationEvent::CountingDegraded => {
                eprintln!("  [warning] token counts are estimated this round");
            }
            ConversationEvent::FileRequested { path } => eprintln!("  [file] fetching {path}"),
            ConversationEvent::FileRequestFailed { path, reason } => {
                eprintln!("  [file] {path}: {reason}");
            }
            ConversationEvent::TextDelta(text) if self.streaming => {
                let mut out = io::stdout().lock();
                let _ = out.write_all(text.as_bytes());
                let _ = out.flush();
            }
            _ => {}
        }
    }
}

fn print_notice(notice: &ExclusionNotice) {
    eprintln!("  [context] {notice}");
}

// ── Helpers ────────────────────────────────────────────────────────

fn build_question(cli: &Cli) -> Result<String> {
    let piped = if cli.stdin {
        let mut buf = String::new();
        io::stdin().read_to_string(&mut buf)?;
        Some(buf)
    } else {
        None
    };
    match (&cli.query, piped) {
        (Some(q), Some(p)) => Ok(format!("{q}\n\n{p}")),
        (Some(q), None) => Ok(q.clone()),
        (None, Some(p)) => Ok(p),
        (None, None) => Err(Error::InvalidInput("provide --query, --stdin, or both".into())),
    }
}

fn is_remote(source: &str) -> bool {
    source.starts_with("http://")
        || source.starts_with("https://")
        || source.starts_with("github.com/")
}

fn open_repository(source: &str) -> Result<Arc<dyn RepositoryProvider>> {
    if is_remote(source) {
        Ok(Arc::new(GitHubRepository::from_url(source, github_token())?))
    } else {
        Ok(Arc::new(LocalRepository::new(source)?))
    }
}

fn build_config(cli: &Cli) -> AssistantConfig {
    let mut config = AssistantConfig::default()
        .with_model(cli.model.clone())
        .with_max_output_tokens(cli.max_output_tokens)
        .with_response_language(cli.language.clone())
        .with_streaming(cli.stream);
    if let Some(instructions) = &cli.instructions {
        config = config.with_instructions(instructions.clone());
    }
    if !cli.extensions.is_empty() {
        config = config.with_extensions(cli.extensions.clone());
    }
    if cli.whole_file {
        config = config.with_context_mode(ContextMode::WholeFile);
    }
    if let Some(hops) = cli.hops {
        config = config.with_max_file_hops(hops);
    }
    config
}

async fn run(cli: &Cli) -> Result<()> {
    let llm = Arc::new(GeminiClient::new(gemini_api_key()?)?);

    if cli.list_models {
        for model in llm.list_models().await? {
            println!("{model}");
        }
        return Ok(());
    }

    let question = build_question(cli)?;
    let config = build_config(cli);
    config.validate()?;

    let store = JsonSessionStore;
    let saved = match &cli.session {
        Some(path) if path.exists() => Some(store.load(path)?),
        _ => None,
    };

    let binding = cli
        .repo
        .clone()
        .map(|source| RepoBinding {
            source,
            branch: cli.branch.clone(),
        })
        .or_else(|| saved.as_ref().and_then(|s| s.repository.clone()));

    let mut conversation = Conversation::new(llm.clone(), config)
        .with_vector_store(Arc::new(InMemoryVectorStore::new()));
    if let Some(binding) = &binding {
        info!("Opening repository {}", binding.source);
        conversation = conversation
            .with_repository(open_repository(&binding.source)?)
            .with_branch(binding.branch.clone());
    }

    if let Some(state) = saved {
        let current = conversation.repository().map(|r| r.source());
        let same_repo = state.repository.as_ref().map(|b| b.source.clone()) == current;
        conversation.restore(state).await?;
        if !same_repo {
            conversation.invalidate_context().await?;
        }
        if cli.branch.is_some() {
            conversation.set_branch(cli.branch.clone()).await?;
        }
    }

    let flag = conversation.cancellation_flag();
    let llm_handle = llm.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("  Cancelling...");
            flag.cancel();
            llm_handle.cancel();
        }
    });

    let handler = CliEventHandler {
        streaming: cli.stream,
    };

    if conversation.repository().is_some() && (cli.analyze || conversation.file_tree().is_none()) {
        match conversation.analyze(&handler).await {
            Ok(report) => eprintln!(
                "  Analyzed {} file(s), {} skipped",
                report.analyzed_paths.len(),
                report.skipped.len()
            ),
            Err(e @ (Error::RateLimited(_) | Error::Cancelled)) => {
                warn!("Analysis stopped early: {e}");
            }
            Err(e) => return Err(e),
        }
    }

    let report = conversation.send(&question, &handler).await?;
    match &report.answer {
        Some(_) if cli.stream => println!(),
        Some(answer) => println!("{answer}"),
        None => {
            if let Some(failed) = &report.failed_request {
                eprintln!("Could not load `{}`: {}", failed.path, failed.failure);
            }
        }
    }

    if let Some(path) = &cli.session {
        store.save(path, &conversation.to_state())?;
        eprintln!("  Session saved to {}", path.display());
    }
    Ok(())
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("repolens=info")),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
        .init();

    let cli = Cli::parse();
    if let Err(e) = run(&cli).await {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}
