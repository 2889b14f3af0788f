use clap::{Parser, Subcommand};
use directories::BaseDirs;
use rustyline::{error::ReadlineError, DefaultEditor};
use tokio::runtime::Runtime;

use strata_client::Client;

/// Strata command-line client.
#[derive(Parser)]
#[command(name = "stratactl", author, version, about = "Strata CLI Tool", long_about = None)]
struct Cli {
    /// Proxy address. Falls back to the first line of $HOME/.stratarc.
    #[arg(long)]
    addr: Option<String>,

    /// Execute one fan-out statement and exit.
    #[arg(short = 'e', long = "exec")]
    sql: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Ask the proxy which shard owns a key.
    Route {
        #[arg(long)]
        key: i64,
    },

    /// Hash a key locally over N shards (no proxy involved).
    HashRoute {
        #[arg(long)]
        key: i64,
        #[arg(long, default_value_t = 4)]
        shards: u64,
    },

    /// Show endpoint health as seen by the proxy.
    Health,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let addr = cli
        .addr
        .or_else(addr_from_rc)
        .unwrap_or_else(|| "127.0.0.1:7433".to_string());

    if let Some(sql) = cli.sql {
        let rt = Runtime::new()?;
        return rt.block_on(async {
            let mut client = Client::connect(&addr).await?;
            print_result(client.fan_out(&sql, &[]).await?);
            Ok(())
        });
    }

    match cli.command {
        Some(Commands::Route { key }) => {
            let rt = Runtime::new()?;
            let shard_id = rt.block_on(async {
                let mut client = Client::connect(&addr).await?;
                client.route(key).await
            })?;
            println!("shard_id={shard_id}");
            return Ok(());
        }

        Some(Commands::HashRoute { key, shards }) => {
            use strata_router::Router;
            let router = strata_router::HashRouter::new(shards);
            println!("shard_id={}", router.shard_for_key(key)?);
            return Ok(());
        }

        Some(Commands::Health) => {
            let rt = Runtime::new()?;
            let endpoints = rt.block_on(async {
                let mut client = Client::connect(&addr).await?;
                client.health().await
            })?;
            for e in endpoints {
                println!("{}  {}", if e.up { "up  " } else { "down" }, e.endpoint);
            }
            return Ok(());
        }

        None => {}
    }

    interactive_shell(&addr);
    Ok(())
}

/// Read the proxy address from $HOME/.stratarc if present.
fn addr_from_rc() -> Option<String> {
    let base = BaseDirs::new()?;
    let path = base.home_dir().join(".stratarc");
    let content = std::fs::read_to_string(path).ok()?;
    let line = content.lines().next()?.trim();
    (!line.is_empty()).then(|| line.to_string())
}

fn print_result(result: strata_client::QueryResult) {
    if !result.columns.is_empty() {
        println!("{}", result.columns.join(" | "));
    }
    for row in &result.rows {
        let cells: Vec<&str> = row.iter().map(|c| c.as_deref().unwrap_or("NULL")).collect();
        println!("{}", cells.join(" | "));
    }
    println!("({} row(s))", result.rows.len());
    for w in &result.warnings {
        eprintln!("warning: {w}");
    }
}

/// Interactive readline shell. Plain statements fan out to every shard;
/// `@<key> <sql>` routes to the shard owning the key.
fn interactive_shell(addr: &str) {
    let mut rl = match DefaultEditor::new() {
        Ok(rl) => rl,
        Err(e) => {
            eprintln!("failed to init editor: {e}");
            return;
        }
    };
    let rt = match Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("failed to start runtime: {e}");
            return;
        }
    };
    let prompt = "stratactl> ";

    loop {
        match rl.readline(prompt) {
            Ok(line) => {
                let trimmed = line.trim();
                if trimmed.eq_ignore_ascii_case("exit") || trimmed.eq("\\q") {
                    break;
                }
                if trimmed.is_empty() {
                    continue;
                }
                let _ = rl.add_history_entry(trimmed);
                if let Err(e) = rt.block_on(dispatch(addr, trimmed)) {
                    eprintln!("Error: {e}");
                }
            }
            Err(ReadlineError::Interrupted) | Err(ReadlineError::Eof) => break,
            Err(err) => {
                eprintln!("Readline error: {err}");
                break;
            }
        }
    }
}

async fn dispatch(addr: &str, line: &str) -> anyhow::Result<()> {
    let mut client = Client::connect(addr).await?;
    if line == "\\health" {
        for e in client.health().await? {
            println!("{}  {}", if e.up { "up  " } else { "down" }, e.endpoint);
        }
        return Ok(());
    }
    if let Some(rest) = line.strip_prefix("\\route ") {
        let key: i64 = rest.trim().parse()?;
        println!("shard_id={}", client.route(key).await?);
        return Ok(());
    }
    if let Some(rest) = line.strip_prefix('@') {
        let (key_str, sql) = rest
            .split_once(char::is_whitespace)
            .ok_or_else(|| anyhow::anyhow!("usage: @<key> <sql>"))?;
        let key: i64 = key_str.parse()?;
        print_result(client.query(key, sql.trim(), &[]).await?);
        return Ok(());
    }
    print_result(client.fan_out(line, &[]).await?);
    Ok(())
}
