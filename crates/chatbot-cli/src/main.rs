use std::io::Write;
use std::sync::Arc;

use anyhow::{Context, Result};
use chatbot_core::models::{ChatSummary, Message, Sender};
use chatbot_core::services::{AuthProvider, GoogleNonce};
use chatbot_core::{ChatListReconciler, ChatSession, Phase, RequestOutcome, SessionEvent};
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

mod backend;

use backend::Backend;

#[derive(Parser)]
#[command(name = "chatbot", version, about = "Streaming chat with a Gemini assistant")]
struct Cli {
    /// Log at debug level (RUST_LOG still applies)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Email a one-time sign-in code
    Login { email: String },
    /// Sign in with the emailed code
    Verify { email: String, code: String },
    /// Sign in with a Google ID token
    Google {
        id_token: String,
        /// Raw nonce whose hash was sent to Google
        #[arg(long)]
        nonce: Option<String>,
    },
    /// Print a fresh nonce for Google sign-in (raw and hashed)
    Nonce,
    Logout,
    Whoami,
    /// List chats
    Chats {
        #[arg(long)]
        archived: bool,
        /// Keep following changes until Ctrl-C
        #[arg(long)]
        watch: bool,
    },
    /// Chat interactively; each line is a prompt, Ctrl-C cancels the answer
    Chat {
        /// Continue an existing chat
        #[arg(long)]
        id: Option<String>,
    },
    Archive { id: String },
    Unarchive { id: String },
    Delete { id: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    // Logs go to stderr so answers on stdout stay clean
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into()),
        )
        .with_writer(std::io::stderr)
        .init();

    // Everything except `nonce` needs the configured stores.
    match cli.command {
        Command::Nonce => {
            let nonce = GoogleNonce::generate();
            println!("raw:    {}", nonce.raw);
            println!("hashed: {}", nonce.hashed);
        }
        Command::Login { email } => {
            let backend = Backend::load().await?;
            backend.auth()?.send_otp(&email).await?;
            println!("Code sent to {email}");
        }
        Command::Verify { email, code } => {
            let backend = Backend::load().await?;
            let user = backend.auth()?.verify_otp(&email, &code).await?;
            println!("Signed in as {}", user.email.unwrap_or(user.id));
        }
        Command::Google { id_token, nonce } => {
            let backend = Backend::load().await?;
            let user = backend
                .auth()?
                .sign_in_with_id_token(&id_token, nonce.as_deref())
                .await?;
            println!("Signed in as {}", user.email.unwrap_or(user.id));
        }
        Command::Logout => {
            let backend = Backend::load().await?;
            backend.auth()?.sign_out().await?;
            println!("Signed out");
        }
        Command::Whoami => whoami(&Backend::load().await?)?,
        Command::Chats { archived, watch } => {
            list_chats(&Backend::load().await?, archived, watch).await?
        }
        Command::Chat { id } => chat(&Backend::load().await?, id).await?,
        Command::Archive { id } => {
            let backend = Backend::load().await?;
            let session = open(&backend, &id).await?;
            session.set_archived(true).await?;
            println!("Archived {id}");
        }
        Command::Unarchive { id } => {
            let backend = Backend::load().await?;
            let session = open(&backend, &id).await?;
            session.set_archived(false).await?;
            println!("Unarchived {id}");
        }
        Command::Delete { id } => {
            let backend = Backend::load().await?;
            let mut session = open(&backend, &id).await?;
            session.delete_chat().await?;
            println!("Deleted {id}");
        }
    }

    Ok(())
}

fn whoami(backend: &Backend) -> Result<()> {
    match &backend.auth {
        Some(auth) => match auth.current_user() {
            Some(user) => {
                println!("id:    {}", user.id);
                if let Some(email) = user.email {
                    println!("email: {email}");
                }
                if let Some(name) = user.name {
                    println!("name:  {name}");
                }
            }
            None => println!("Not signed in"),
        },
        None => println!("{} (local)", backend.user_id()?),
    }
    Ok(())
}

async fn open(backend: &Backend, id: &str) -> Result<ChatSession> {
    let mut session = backend.session();
    session
        .open(id)
        .await
        .with_context(|| format!("Failed to open chat {id}"))?;
    Ok(session)
}

fn print_summaries(list: &[ChatSummary]) {
    if list.is_empty() {
        println!("(no chats)");
        return;
    }
    for summary in list {
        println!(
            "{}  {}  {}",
            summary.created_at.format("%Y-%m-%d %H:%M"),
            summary.chat_id,
            summary.user_line
        );
        if let Some(answer) = &summary.assistant_line {
            println!("    {answer}");
        }
    }
}

async fn list_chats(backend: &Backend, archived: bool, watch: bool) -> Result<()> {
    let reconciler = Arc::new(ChatListReconciler::new(
        backend.store.clone(),
        backend.user_id()?,
        archived,
    ));

    if !watch {
        reconciler.resync().await.context("Failed to load chats")?;
        print_summaries(&reconciler.summaries());
        return Ok(());
    }

    let shutdown = CancellationToken::new();
    let mut rx = reconciler.subscribe();
    let runner = tokio::spawn({
        let reconciler = reconciler.clone();
        let feed = backend.feed.clone();
        let backoff = backend.settings.reconnect_backoff();
        let shutdown = shutdown.clone();
        async move { reconciler.run(feed, backoff, shutdown).await }
    });

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            changed = rx.changed() => {
                if changed.is_err() {
                    break;
                }
                let list = rx.borrow_and_update().clone();
                println!("--");
                print_summaries(&list);
            }
        }
    }

    shutdown.cancel();
    runner.await.context("Chat list task failed")?;
    Ok(())
}

fn print_message(message: &Message) {
    let who = match message.sender {
        Sender::User => "you",
        Sender::Assistant => "model",
    };
    println!("{who}> {}", message.content);
}

async fn chat(backend: &Backend, id: Option<String>) -> Result<()> {
    let mut session = match id {
        Some(id) => {
            let session = open(backend, &id).await?;
            for message in session.snapshot().messages {
                print_message(&message);
            }
            session
        }
        None => backend.session(),
    };
    let canceller = session.canceller();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        print!("you> ");
        std::io::stdout().flush()?;

        let line = tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            line = lines.next_line() => line?,
        };
        let Some(line) = line else { break };
        let prompt = line.trim();
        if prompt.is_empty() {
            continue;
        }

        let mut events = session.subscribe();
        if let Err(e) = session.send_prompt(prompt).await {
            eprintln!("Could not send: {e}");
            continue;
        }

        print!("model> ");
        std::io::stdout().flush()?;
        let mut printed = false;
        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    if canceller.cancel() {
                        info!("Cancelling answer");
                    }
                }
                event = events.recv() => match event {
                    Ok(SessionEvent::Fragment { text }) => {
                        print!("{text}");
                        std::io::stdout().flush()?;
                        printed = true;
                    }
                    Ok(SessionEvent::PhaseChanged(Phase::Idle)) => break,
                    Ok(_) => {}
                    Err(RecvError::Lagged(skipped)) => warn!(skipped, "Missed session events"),
                    Err(RecvError::Closed) => break,
                },
            }
        }

        match session.wait().await {
            Some(RequestOutcome::Completed(_)) => println!(),
            Some(RequestOutcome::Cancelled(message)) => {
                if !printed {
                    print!("{}", message.content);
                }
                println!(" [cancelled]");
            }
            Some(RequestOutcome::Failed(notice)) => {
                println!();
                eprintln!("{notice}");
            }
            Some(RequestOutcome::CommitFailed { error, .. }) => {
                println!();
                eprintln!("Answer not saved: {error}");
            }
            None => println!(),
        }

        if let Some(chat_id) = session.chat_id() {
            info!(chat_id = %chat_id, "Turn finished");
        }
    }

    session.cancel_and_wait().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_nonce_parses_without_other_arguments() {
        let cli = Cli::try_parse_from(["chatbot", "nonce"]).unwrap();
        assert!(matches!(cli.command, Command::Nonce));
        assert!(!cli.verbose);
    }
}
