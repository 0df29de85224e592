use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::prelude::*;

mod cli;
mod config;

use crate::config::HirelaneConfig;

#[derive(Parser)]
#[command(name = "hirelane")]
#[command(about = "Hirelane job marketplace client: account session and messaging")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Custom data directory (defaults to ~/.hirelane)
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Sign in and store the session token
    Login(LoginArgs),

    /// Create an account and sign in
    Register(RegisterArgs),

    /// End the session and forget the stored token
    Logout,

    /// Show the state of the stored session token
    Status(StatusArgs),

    /// List conversations with unread counts
    Conversations(ConversationsArgs),

    /// Open a conversation and chat in it
    Chat(ChatArgs),

    /// Print the effective configuration
    Config,
}

#[derive(Parser)]
struct LoginArgs {
    #[arg(short, long)]
    email: String,

    /// Read from the terminal when omitted
    #[arg(long)]
    password: Option<String>,
}

#[derive(Parser)]
struct RegisterArgs {
    #[arg(short, long)]
    name: String,

    #[arg(short, long)]
    email: String,

    /// Read from the terminal when omitted
    #[arg(long)]
    password: Option<String>,

    /// Account role, e.g. `candidate` or `employer`
    #[arg(long)]
    role: Option<String>,
}

#[derive(Parser)]
struct StatusArgs {
    /// Output as JSON
    #[arg(long)]
    json: bool,
}

#[derive(Parser)]
struct ConversationsArgs {
    /// Output as JSON
    #[arg(long)]
    json: bool,
}

#[derive(Parser)]
struct ChatArgs {
    /// Conversation to open
    conversation_id: String,

    /// The other participant, when the conversation is not in your list yet
    #[arg(long = "with")]
    with_user: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_directive = if cli.debug {
        "hirelane=debug,hirelane_session=debug,hirelane_realtime=debug,info"
    } else {
        "hirelane=info,warn"
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(env_filter)
        .init();

    let config = HirelaneConfig::new(cli.data_dir)?;

    match cli.command {
        Commands::Login(args) => cli::login_command(&config, args.email, args.password).await,
        Commands::Register(args) => {
            cli::register_command(&config, args.name, args.email, args.password, args.role).await
        }
        Commands::Logout => cli::logout_command(&config).await,
        Commands::Status(args) => cli::status_command(&config, args.json),
        Commands::Conversations(args) => cli::conversations_command(&config, args.json).await,
        Commands::Chat(args) => {
            cli::chat_command(&config, &args.conversation_id, args.with_user.as_deref()).await
        }
        Commands::Config => cli::config_command(&config),
    }
}
