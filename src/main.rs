use std::path::PathBuf;

use log::{debug, error, info, warn};
use room_sync::{
    ClientConfig, ConnectionManager, HistorySource, Message, MessageKind, RestHistory, Room,
    RoomSession, SessionUpdate, SyncError, Transport,
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;

fn format_message(message: &Message) -> String {
    let time = message.created_at.format("%H:%M");
    let author = message.author_name().unwrap_or("system");
    let pending = if message.is_optimistic() { " (sending)" } else { "" };
    if message.deleted {
        format!("[{time}] {author}: <message deleted>")
    } else if message.kind == MessageKind::System {
        format!("[{time}] * {}", message.text)
    } else {
        format!("[{time}] {author}: {}{pending}", message.text)
    }
}

fn render<T: Transport, H: HistorySource>(session: &RoomSession<'_, T, H>, update: SessionUpdate) {
    match update {
        SessionUpdate::HistoryLoaded { .. } | SessionUpdate::HistoryMerged { .. } => {
            for message in session.timeline() {
                println!("{}", format_message(&message));
            }
        }
        SessionUpdate::LoadFailed(e) => {
            eprintln!("Could not load room history: {e}. Type /retry to try again.");
        }
        SessionUpdate::MessageAdded(id) | SessionUpdate::MessageDeleted(id) => {
            if let Some(message) = session.timeline().iter().find(|m| m.id == id) {
                println!("{}", format_message(message));
            }
        }
        SessionUpdate::MessagePromoted { temp_id, id } => {
            debug!("{} confirmed as {}", temp_id, id);
        }
        SessionUpdate::PresenceChanged {
            participant_id,
            online,
        } => {
            let name = session.participant_name(&participant_id).unwrap_or(&participant_id);
            println!("* {} is {}", name, if online { "online" } else { "offline" });
        }
        SessionUpdate::TypingChanged => {
            let mut names: Vec<String> = session
                .typing()
                .into_iter()
                .map(|id| session.participant_name(&id).map_or(id.clone(), str::to_string))
                .collect();
            names.sort();
            if !names.is_empty() {
                println!("* {} typing...", names.join(", "));
            }
        }
    }
}

async fn run(
    connection: &mut ConnectionManager,
    history: &RestHistory,
    config: &ClientConfig,
    room_id: &str,
    errors: &mut mpsc::UnboundedReceiver<SyncError>,
) -> Result<(), SyncError> {
    let mut session = RoomSession::new(
        connection,
        history,
        config.participant.clone(),
        config.typing.clone(),
    );
    session.select_room(Room::new(room_id, room_id));
    let mut input = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            update = session.next_update() => match update {
                Some(update) => render(&session, update),
                None => return Ok(()),
            },
            line = input.next_line() => {
                let line = match line {
                    Ok(Some(line)) => line,
                    Ok(None) => return Ok(()),
                    Err(e) => {
                        error!("Failed to read input: {}", e);
                        return Ok(());
                    }
                };
                let line = line.trim();
                if line == "/quit" {
                    return Ok(());
                } else if line == "/retry" {
                    session.retry_history()?;
                } else if let Some(id) = line.strip_prefix("/room ") {
                    session.select_room(Room::new(id.trim(), id.trim()));
                } else if let Some(id) = line.strip_prefix("/delete ") {
                    if let Err(e) = session.delete_message(id.trim()) {
                        eprintln!("{e}");
                    }
                } else if !line.is_empty() {
                    let echo = session.send_message(line)?;
                    println!("{}", format_message(&echo));
                }
            }
            Some(e) = errors.recv() => {
                if e.is_fatal() {
                    return Err(e);
                }
                warn!("{}", e);
            }
        }
    }
}

#[tokio::main]
async fn main() {
    env_logger::Builder::new()
        .filter_level(log::LevelFilter::Info)
        .parse_default_env()
        .init();

    let mut args = std::env::args().skip(1);
    let Some(room_id) = args.next() else {
        eprintln!("usage: room-sync <room-id> [config.toml]");
        std::process::exit(2);
    };
    let config_path = args.next().map(PathBuf::from);

    let config = match ClientConfig::load(config_path.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            error!("{}", e);
            std::process::exit(1);
        }
    };

    let (error_tx, mut error_rx) = mpsc::unbounded_channel();
    let mut connection = match ConnectionManager::connect(config.clone(), error_tx).await {
        Ok(connection) => connection,
        Err(e) => {
            error!("Could not connect to {}: {}", config.ws_url, e);
            std::process::exit(1);
        }
    };
    let history = RestHistory::from_config(&config);

    let outcome = run(&mut connection, &history, &config, &room_id, &mut error_rx).await;
    connection.close().await;

    if let Err(e) = outcome {
        error!("{}", e);
        if e.is_user_visible() {
            eprintln!("{e}");
        }
        std::process::exit(1);
    }
    info!("Bye");
}
