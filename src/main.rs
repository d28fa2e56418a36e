use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use tracing::{error, info};

use mimic_bot::config::{self, Config};
use mimic_bot::slack::SlackTransport;
use mimic_bot::{corpus, telemetry, text};
use mimic_bot::{Bot, BotSettings, CommandDispatcher, DispatchConfig, ModelStore, Namespace};

/// Exit status when no chat credentials are configured.
const EXIT_NO_CREDENTIALS: u8 = 255;

#[derive(Parser, Debug)]
#[command(name = "mimic-bot", version, about = "Learns how a channel talks and impersonates its members")]
struct Cli {
    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    /// Settings directory holding config.toml, bot.key and stored models
    #[arg(long, env = config::HOME_ENV, global = true)]
    home: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Connect to Slack and start learning and answering
    Run {
        /// Slack bot token
        #[arg(short, long, env = "MIMIC_BOT_TOKEN", hide_env_values = true)]
        key: Option<String>,
    },
    /// Add a reference text that `write <name>` can imitate
    AddText {
        /// Name to store the text under (lowercased, spaces become underscores)
        name: String,
        /// Plain text, .gz, .tar, .tar.gz/.tgz or .zip file
        file: PathBuf,
        /// Skip sentences with brackets or unbalanced quotes
        #[arg(long)]
        strict: bool,
    },
    /// Run one invocation locally and print the reply
    Ask {
        /// Identity that `me` resolves to
        #[arg(long = "as")]
        requester: Option<String>,
        /// Invocation, e.g. `impersonate everyone` or `write moby dick`
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        tokens: Vec<String>,
    },
    /// List stored model keys
    List {
        #[arg(value_enum)]
        namespace: NamespaceArg,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum NamespaceArg {
    Chains,
    Texts,
}

impl From<NamespaceArg> for Namespace {
    fn from(arg: NamespaceArg) -> Self {
        match arg {
            NamespaceArg::Chains => Namespace::Chains,
            NamespaceArg::Texts => Namespace::Texts,
        }
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    telemetry::init(cli.verbose);

    let root = cli.home.clone().unwrap_or_else(config::settings_root);
    match execute(cli.command, &root) {
        Ok(code) => code,
        Err(e) => {
            error!("{e:#}");
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn execute(command: Command, root: &Path) -> Result<ExitCode> {
    let config = Config::load(root).context("failed to load configuration")?;
    let store = Arc::new(
        ModelStore::open(root, config.model.state_size)
            .with_context(|| format!("failed to open model store in {}", root.display()))?,
    );

    match command {
        Command::Run { key } => run(&config, store, key.as_deref(), root),
        Command::AddText { name, file, strict } => {
            add_text(&config, &store, &name, &file, strict)?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Ask { requester, tokens } => {
            let dispatcher = CommandDispatcher::new(
                store,
                DispatchConfig {
                    bot_name: config.bot.name.clone().unwrap_or_else(|| "mimic".to_string()),
                    max_attempts: config.model.max_attempts,
                },
            );
            println!("{}", dispatcher.dispatch(&tokens, requester.as_deref()));
            Ok(ExitCode::SUCCESS)
        }
        Command::List { namespace } => {
            for key in store.keys(namespace.into())? {
                println!("{key}");
            }
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn run(config: &Config, store: Arc<ModelStore>, key: Option<&str>, root: &Path) -> Result<ExitCode> {
    let Some(token) = config.resolve_token(key, root) else {
        eprintln!(
            "No slack token found! Pass --key, set MIMIC_BOT_TOKEN, or write it to {}",
            config::key_path(root).display()
        );
        return Ok(ExitCode::from(EXIT_NO_CREDENTIALS));
    };

    let shutdown = Arc::new(AtomicBool::new(false));
    for signal in [signal_hook::consts::SIGINT, signal_hook::consts::SIGTERM] {
        signal_hook::flag::register(signal, Arc::clone(&shutdown))
            .context("failed to install signal handler")?;
    }

    let transport = SlackTransport::new(
        &token,
        &config.transport.api_base,
        config.transport.channels_per_poll,
    )?;
    let mut bot = Bot::new(transport, store, BotSettings::from(config));
    let stats = bot.run(&shutdown).context("failed to connect to slack")?;
    info!(
        polls = stats.polls,
        learned = stats.learned,
        replies = stats.replies,
        "stopped cleanly"
    );
    Ok(ExitCode::SUCCESS)
}

fn add_text(config: &Config, store: &ModelStore, name: &str, file: &Path, strict: bool) -> Result<()> {
    let key = text::text_key(&[name]);
    anyhow::ensure!(!key.is_empty(), "text name must contain at least one word");

    let texts = corpus::read_texts(file)?;
    anyhow::ensure!(!texts.is_empty(), "no readable text found in {}", file.display());

    let mut options = config.build_options();
    if strict {
        options.accept_any_sentence = false;
    }

    info!(key = %key, file = %file.display(), "building reference text");
    let model = corpus::build_model(&texts, &options)?;
    anyhow::ensure!(!model.is_empty(), "{} produced no usable sentences", file.display());

    store.save(&key, Namespace::Texts, &model)?;
    info!(
        key = %key,
        sentences = model.corpus_size(),
        states = model.state_count(),
        "reference text saved"
    );
    println!("Added `{name}`; use it with: write {}", key.replace('_', " "));
    Ok(())
}
