use std::collections::HashSet;
use std::path::PathBuf;

use chrono::Local;
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::{self, error::RecvError};

use palaver::{
    ContentKind, ConversationId, Draft, GatewayConfig, Message, MessageId, MessageView,
    NO_CONVERSATIONS_PLACEHOLDER, Palaver, PalaverConfig, PalaverError, SendOutcome, Session,
    StreamUpdate,
};

/// Terminal client for Palaver conversations
#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    /// Account email
    #[clap(long, env = "PALAVER_EMAIL", global = true)]
    email: Option<String>,

    /// Account password
    #[clap(long, env = "PALAVER_PASSWORD", hide_env_values = true, global = true)]
    password: Option<String>,

    /// Directory for application logs
    #[clap(long, value_name = "PATH", default_value = "logs", global = true)]
    logs_dir: PathBuf,

    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List conversations with their latest message
    Chats,

    /// Show a conversation's messages
    Thread {
        conversation_id: String,

        /// Keep streaming new messages and read replies from stdin
        #[clap(long)]
        follow: bool,
    },

    /// Send a text message
    Send {
        conversation_id: String,

        #[clap(required = true, num_args = 1..)]
        text: Vec<String>,
    },

    /// Upload a file and send its link
    Upload {
        conversation_id: String,

        #[clap(value_name = "PATH")]
        path: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<(), PalaverError> {
    let args = Args::parse();

    let config = PalaverConfig::new(&args.logs_dir, GatewayConfig::from_env()?);
    let palaver = match Palaver::initialize(config) {
        Ok(palaver) => palaver,
        Err(err) => {
            eprintln!("Failed to initialize Palaver: {}", err);
            std::process::exit(1);
        }
    };

    let (Some(email), Some(password)) = (args.email.as_deref(), args.password.as_deref()) else {
        return Err(PalaverError::Authentication(
            "Pass --email and --password or set PALAVER_EMAIL and PALAVER_PASSWORD".to_string(),
        ));
    };
    let session = palaver.sign_in(email, password).await?;

    match args.command {
        Command::Chats => list_chats(&palaver, &session).await,
        Command::Thread {
            conversation_id,
            follow,
        } => show_thread(&palaver, &session, ConversationId::from(conversation_id), follow).await,
        Command::Send {
            conversation_id,
            text,
        } => {
            let mut draft = Draft::new(text.join(" "));
            let conversation_id = ConversationId::from(conversation_id);
            match palaver
                .send_text(&session, &conversation_id, &mut draft)
                .await?
            {
                SendOutcome::Sent(_) => println!("Sent."),
                SendOutcome::Skipped => println!("Nothing to send."),
            }
            Ok(())
        }
        Command::Upload {
            conversation_id,
            path,
        } => upload(&palaver, &session, &ConversationId::from(conversation_id), &path).await,
    }
}

async fn list_chats(palaver: &Palaver, session: &Session) -> Result<(), PalaverError> {
    let items = palaver.get_chat_list(session).await?;
    if items.is_empty() {
        println!("{}", NO_CONVERSATIONS_PLACEHOLDER);
        return Ok(());
    }

    for item in items {
        println!(
            "({}) {}  [{}]\n    {}  {}",
            item.initial, item.name, item.id, item.preview, item.preview_time
        );
    }
    Ok(())
}

async fn show_thread(
    palaver: &Palaver,
    session: &Session,
    conversation_id: ConversationId,
    follow: bool,
) -> Result<(), PalaverError> {
    let header = palaver.conversation_header(session, &conversation_id).await;
    println!("== {} ==", header.title);

    let mut reconciler = palaver.open_message_stream(session);
    let mut updates = reconciler.subscribe();
    reconciler.select(Some(conversation_id.clone())).await;

    loop {
        match updates.recv().await {
            Ok(StreamUpdate::Loaded { .. }) => break,
            Ok(StreamUpdate::Failed { reason, .. }) => {
                reconciler.teardown().await;
                return Err(PalaverError::Fetch(reason));
            }
            Ok(_) | Err(RecvError::Lagged(_)) => continue,
            Err(RecvError::Closed) => return Ok(()),
        }
    }

    let me = session.email();
    let mut shown = HashSet::new();
    for message in reconciler.messages().await {
        print_message(&message, me);
        shown.insert(message.id);
    }

    if follow {
        follow_thread(palaver, session, &conversation_id, updates, shown).await?;
    }

    reconciler.teardown().await;
    Ok(())
}

async fn follow_thread(
    palaver: &Palaver,
    session: &Session,
    conversation_id: &ConversationId,
    mut updates: broadcast::Receiver<StreamUpdate>,
    mut shown: HashSet<MessageId>,
) -> Result<(), PalaverError> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let me = session.email();

    println!("-- type a message, /upload <path> to send a file, /quit to leave --");

    loop {
        tokio::select! {
            update = updates.recv() => match update {
                Ok(StreamUpdate::Appended { message, .. }) => {
                    // Appends racing the initial listing were already printed
                    if shown.insert(message.id.clone()) {
                        print_message(&message, me);
                    }
                }
                Ok(StreamUpdate::Resynced { added, .. }) => {
                    for message in added {
                        if shown.insert(message.id.clone()) {
                            print_message(&message, me);
                        }
                    }
                }
                Ok(StreamUpdate::LiveFeedLost { reason, .. }) => {
                    eprintln!("Live updates stopped: {}", reason);
                }
                Ok(_) | Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => return Ok(()),
            },
            line = lines.next_line() => {
                let Some(line) = line? else {
                    return Ok(());
                };
                let line = line.trim();
                if line == "/quit" {
                    return Ok(());
                }
                let result = match line.strip_prefix("/upload ") {
                    Some(path) => {
                        upload(palaver, session, conversation_id, &PathBuf::from(path.trim())).await
                    }
                    None => {
                        let mut draft = Draft::new(line);
                        palaver
                            .send_text(session, conversation_id, &mut draft)
                            .await
                            .map(|_| ())
                    }
                };
                if let Err(e) = result {
                    eprintln!("Not sent: {}", e);
                }
            }
        }
    }
}

async fn upload(
    palaver: &Palaver,
    session: &Session,
    conversation_id: &ConversationId,
    path: &std::path::Path,
) -> Result<(), PalaverError> {
    let bytes = tokio::fs::read(path).await?;
    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();

    let sent = palaver
        .send_file(session, conversation_id, &file_name, bytes)
        .await?;
    println!("Uploaded {}", sent.content);
    Ok(())
}

fn print_message(message: &Message, me: Option<&str>) {
    let view = MessageView::render(message, me, Local::now());
    let author = if view.is_mine {
        "me".to_string()
    } else {
        format!("[{}] {}", view.icon.label(), view.sender)
    };
    let body = match view.kind {
        ContentKind::Image => format!("[image] {}", view.content),
        ContentKind::Video => format!("[video] {}", view.content),
        ContentKind::Text => view.content,
    };
    println!("{}  {}: {}", view.time, author, body);
}
