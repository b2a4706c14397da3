mod cli;

use clap::Parser;
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::cli::{Cli, Commands};
use parley_core::{
    Config, ConfigLoader, DomainError, MessageStore, ParleyError, RoomKey, StoreBackend,
    TokenEntry,
};
use parley_gateway::{GatewayServer, MethodHandlers, SessionController, TokenAuth};
use parley_store::SqliteStore;

#[tokio::main]
async fn main() -> Result<(), ParleyError> {
    let cli = Cli::parse();

    let dev = matches!(&cli.command, Some(Commands::Serve { dev: true, .. }));
    init_tracing(dev);

    // Handle Init command immediately
    if let Some(Commands::Init) = &cli.command {
        return handle_init();
    }

    // Handle ConfigSample immediately without loading config
    if let Some(Commands::ConfigSample { output }) = &cli.command {
        let path = output
            .clone()
            .unwrap_or_else(|| PathBuf::from("./parley.sample.yaml"));
        Config::sample().save(&path)?;
        println!("✅ Sample config written to {}", path.display());
        return Ok(());
    }

    let config = ConfigLoader::load_or_default(cli.config_path.as_deref())?;

    match cli.command {
        None => handle_serve(&config, None, None, false, false).await,
        Some(Commands::Serve {
            host,
            port,
            dev,
            allow_unauthenticated,
        }) => handle_serve(&config, host, port, dev, allow_unauthenticated).await,
        Some(Commands::AddUser {
            user_id,
            name,
            avatar,
        }) => {
            let store = open_sqlite(&config)?;
            let name = name.unwrap_or_else(|| user_id.clone());
            store.add_user(&user_id, &name, avatar.as_deref()).await?;
            println!("✅ User {} ({}) saved", user_id, name);
            Ok(())
        }
        Some(Commands::AddRoom {
            room_id,
            name,
            created_by,
        }) => {
            let store = open_sqlite(&config)?;
            let name = name.unwrap_or_else(|| room_id.clone());
            store
                .add_room(&room_id, &name, created_by.as_deref())
                .await?;
            println!("✅ Room {} ({}) created", room_id, name);
            Ok(())
        }
        Some(Commands::AddMember { room_id, user_id }) => {
            let store = open_sqlite(&config)?;
            store.add_member(&room_id, &user_id).await?;
            println!("✅ {} is now a member of {}", user_id, room_id);
            Ok(())
        }
        Some(Commands::History { room, pair, limit }) => {
            handle_history(&config, room, pair, limit).await
        }
        Some(Commands::IssueToken {
            user_id,
            role,
            save,
        }) => handle_issue_token(config, &cli.config_path, user_id, role, save),
        Some(Commands::Init) | Some(Commands::ConfigSample { .. }) => Ok(()),
    }
}

fn init_tracing(dev: bool) {
    let default_filter = if dev {
        "parley=debug,parley_gateway=debug,parley_store=debug,info"
    } else {
        "parley=info,parley_gateway=info,warn"
    };
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer())
        .init();
}

fn print_banner() {
    println!(
        r#"
    ____             __
   / __ \____ ______/ /__  __  __
  / /_/ / __ `/ ___/ / _ \/ / / /
 / ____/ /_/ / /  / /  __/ /_/ /
/_/    \__,_/_/  /_/\___/\__, /
                        /____/
    "#
    );
}

fn handle_init() -> Result<(), ParleyError> {
    println!("Parley init");
    println!("===========");

    let config_path = Config::default_path();
    if config_path.exists() {
        print!(
            "⚠️  Config already exists at {}. Overwrite? [y/N] ",
            config_path.display()
        );
        io::stdout().flush()?;

        let mut input = String::new();
        io::stdin().read_line(&mut input)?;
        if !input.trim().eq_ignore_ascii_case("y") {
            println!("Cancelled");
            return Ok(());
        }
    }

    let mut config = Config::sample();
    // Replace the placeholder with a usable token
    for entry in &mut config.auth.tokens {
        entry.token = TokenAuth::generate_token();
    }
    config.save(&config_path)?;

    println!("✅ Config written to {}", config_path.display());
    println!("   Database: {}", config.store.db_path.display());
    for entry in &config.auth.tokens {
        println!("   Token for {}: {}", entry.user_id, entry.token);
    }
    Ok(())
}

async fn handle_serve(
    config: &Config,
    host: Option<String>,
    port: Option<u16>,
    dev: bool,
    allow_unauthenticated: bool,
) -> Result<(), ParleyError> {
    let mut gateway_config = config.gateway.clone();
    if let Some(host) = host {
        gateway_config.host = host;
    }
    if let Some(port) = port {
        gateway_config.port = port;
    }
    let allow_unauthenticated = allow_unauthenticated || gateway_config.allow_unauthenticated;
    gateway_config.allow_unauthenticated = allow_unauthenticated;

    print_banner();
    println!("Parley gateway starting...");
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    println!("  Host:    {}", gateway_config.host);
    println!("  Port:    {}", gateway_config.port);
    println!("  Path:    {}", gateway_config.ws_path);
    println!("  Store:   {:?}", config.store.backend);
    println!("  Mode:    {}", if dev { "development" } else { "production" });
    println!(
        "  Auth:    {}",
        if allow_unauthenticated {
            "off (unsafe)"
        } else {
            "on"
        }
    );
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    println!();
    if allow_unauthenticated {
        tracing::warn!("Gateway unauthenticated mode is enabled. This is unsafe for production.");
    }

    let collaborators = parley_store::open_backend(&config.store)?;
    let controller = Arc::new(SessionController::new(collaborators, &config.relay));
    let auth = TokenAuth::from_config(&config.auth)?;
    info!("Loaded {} bearer token(s)", auth.token_count().await);

    let handlers = MethodHandlers::new(controller, Arc::new(auth), allow_unauthenticated);
    let server = GatewayServer::new(gateway_config, config.relay.clone(), handlers);

    server
        .start()
        .await
        .map_err(|e| {
            ParleyError::Domain(DomainError::Gateway {
                reason: format!("{:#}", e),
            })
        })
}

fn open_sqlite(config: &Config) -> Result<SqliteStore, ParleyError> {
    if config.store.backend != StoreBackend::Sqlite {
        tracing::warn!(
            "store.backend is not sqlite; using {} anyway",
            config.store.db_path.display()
        );
    }
    Ok(SqliteStore::open(&config.store.db_path)?)
}

async fn handle_history(
    config: &Config,
    room: Option<String>,
    pair: Option<Vec<String>>,
    limit: usize,
) -> Result<(), ParleyError> {
    let key = match (room, pair.as_deref()) {
        (Some(room_id), None) => RoomKey::group(room_id),
        (None, Some([a, b])) => RoomKey::direct(a, b),
        _ => {
            return Err(ParleyError::Other(
                "Pass either --room <ROOM> or --pair <USER_A> <USER_B>".to_string(),
            ))
        }
    };

    let store = open_sqlite(config)?;
    let messages = store.fetch_history(&key).await?;
    if messages.is_empty() {
        println!("No messages in {}", key);
        return Ok(());
    }

    let skip = messages.len().saturating_sub(limit);
    println!("📜 {} ({} message(s))", key, messages.len());
    for message in &messages[skip..] {
        let text = message.body.text.as_deref().unwrap_or("");
        let attachment = message
            .body
            .attachment
            .as_deref()
            .map(|a| format!(" [{}]", a))
            .unwrap_or_default();
        let unread = if message.receiver_id.is_some() && !message.is_read {
            " *"
        } else {
            ""
        };
        println!(
            "  #{:<5} {}  {}: {}{}{}",
            message.seq,
            message.created_at.format("%Y-%m-%d %H:%M:%S"),
            message.sender_id,
            text,
            attachment,
            unread
        );
    }
    Ok(())
}

fn handle_issue_token(
    mut config: Config,
    config_path: &Option<String>,
    user_id: String,
    role: String,
    save: bool,
) -> Result<(), ParleyError> {
    if user_id.trim().is_empty() {
        return Err(ParleyError::config_invalid("user_id", "User id cannot be empty"));
    }

    let entry = TokenEntry {
        token: TokenAuth::generate_token(),
        user_id,
        role,
    };

    if save {
        let path = config_path
            .as_ref()
            .map(PathBuf::from)
            .unwrap_or_else(Config::default_path);
        config.auth.tokens.push(entry.clone());
        config.save(&path)?;
        println!("✅ Token for {} added to {}", entry.user_id, path.display());
    }

    let snippet = serde_yml::to_string(&vec![entry])?;
    println!("auth:\n  tokens:");
    for line in snippet.lines() {
        println!("    {}", line);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_history_requires_exactly_one_target() {
        let config = Config::default();
        let result = tokio_test::block_on(handle_history(&config, None, None, 10));
        assert!(result.is_err());

        let pair = Some(vec!["a".to_string(), "b".to_string()]);
        let result = tokio_test::block_on(handle_history(
            &config,
            Some("r".to_string()),
            pair,
            10,
        ));
        assert!(result.is_err());
    }

    #[test]
    fn test_issue_token_rejects_blank_user() {
        let result = handle_issue_token(
            Config::default(),
            &None,
            "  ".to_string(),
            "user".to_string(),
            false,
        );
        assert!(result.is_err());
    }
}
