//! Interactive REPL.

use crate::commands::{format_tuples, format_value, info, parse_args, parse_index, parse_space};
use colored::Colorize;
use iproto_client::Client;
use iproto_protocol::Select;
use rustyline::error::ReadlineError;
use rustyline::history::DefaultHistory;
use rustyline::{Config, Editor};

const HELP_TEXT: &str = r#"
Available commands:
  help                            Show this help
  ping                            Ping the server
  info                            Show greeting and negotiated features

  eval <expr>                     Evaluate a Lua expression
  call <function> [args...]       Call a stored function (JSON args)
  select <space> [key_json] [limit]  Select tuples by primary key
  sql <statement>                 Execute an SQL statement

  watch-once <key>                Print the current value of a watcher key
  auth <user> [password]          Authenticate as another user
  reconnect                       Open a fresh connection

  quit, exit                      Exit the REPL
"#;

pub async fn run(client: Client, addr: &str) -> Result<(), Box<dyn std::error::Error>> {
    println!("{}", "iproto CLI".bold().cyan());
    println!("Connecting to {}...", addr);

    client.connect().await?;
    println!("{}", "Connected!".green());

    // Create readline editor
    let config = Config::builder()
        .history_ignore_space(true)
        .auto_add_history(true)
        .build();
    let mut rl: Editor<(), DefaultHistory> = Editor::with_config(config)?;

    // Load history
    let history_path = std::env::var("HOME")
        .map(|h| std::path::PathBuf::from(h).join(".iproto_history"))
        .unwrap_or_else(|_| ".iproto_history".into());
    let _ = rl.load_history(&history_path);

    println!("Type 'help' for available commands.\n");

    loop {
        let prompt = format!("{} ", format!("{}>", addr).cyan());
        match rl.readline(&prompt) {
            Ok(line) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }

                match execute_repl_command(&client, line).await {
                    Ok(Some(output)) => println!("{}\n", output),
                    Ok(None) => break, // Exit command
                    Err(e) => println!("{}: {}\n", "Error".red(), e),
                }
            }
            Err(ReadlineError::Interrupted) => {
                println!("^C");
                continue;
            }
            Err(ReadlineError::Eof) => {
                println!("^D");
                break;
            }
            Err(err) => {
                println!("{}: {:?}", "Error".red(), err);
                break;
            }
        }
    }

    // Save history
    let _ = rl.save_history(&history_path);

    client.close().await;
    println!("{}", "Disconnected.".dimmed());

    Ok(())
}

async fn execute_repl_command(
    client: &Client,
    line: &str,
) -> Result<Option<String>, Box<dyn std::error::Error>> {
    let (cmd, rest) = match line.split_once(char::is_whitespace) {
        Some((cmd, rest)) => (cmd.to_lowercase(), rest.trim()),
        None => (line.to_lowercase(), ""),
    };
    let args: Vec<String> = rest.split_whitespace().map(str::to_string).collect();

    match cmd.as_str() {
        "help" | "?" => Ok(Some(HELP_TEXT.to_string())),

        "quit" | "exit" | "q" => Ok(None),

        "ping" => {
            client.ping().await?;
            Ok(Some("PONG".green().to_string()))
        }

        "info" => Ok(Some(info(client)?)),

        "eval" | "e" => {
            if rest.is_empty() {
                return Ok(Some("Usage: eval <expr>".to_string()));
            }
            let result = client.eval(rest, vec![]).await?;
            Ok(Some(format_value(&result)))
        }

        "call" => {
            let Some((function, call_args)) = args.split_first() else {
                return Ok(Some("Usage: call <function> [args...]".to_string()));
            };
            let call_args = parse_args(call_args)?;
            let result = client.call(function, call_args).await?;
            Ok(Some(format_value(&result)))
        }

        "select" | "s" => {
            let Some(space) = args.first() else {
                return Ok(Some(
                    "Usage: select <space> [key_json] [limit]".to_string(),
                ));
            };
            let key = parse_args(args.get(1..2).unwrap_or_default())?;
            let key = match key.into_iter().next() {
                Some(iproto_protocol::Value::Array(parts)) => parts,
                Some(single) => vec![single],
                None => Vec::new(),
            };
            let limit = args.get(2).and_then(|s| s.parse().ok()).unwrap_or(100);

            let select = Select::new(parse_space(space))
                .index(parse_index("0"))
                .key(key)
                .limit(limit);
            let tuples = client.select(select).await?;
            Ok(Some(format_tuples(&tuples)))
        }

        "sql" => {
            if rest.is_empty() {
                return Ok(Some("Usage: sql <statement>".to_string()));
            }
            let reply = client.execute(rest, vec![]).await?;
            Ok(Some(match reply.data() {
                Some(rows) => format_tuples(rows),
                None => "OK".green().to_string(),
            }))
        }

        "watch-once" | "wo" => {
            let Some(key) = args.first() else {
                return Ok(Some("Usage: watch-once <key>".to_string()));
            };
            let value = client.watch_once(key).await?;
            Ok(Some(format_value(&value)))
        }

        "auth" => {
            let Some(user) = args.first() else {
                return Ok(Some("Usage: auth <user> [password]".to_string()));
            };
            let password = args.get(1).map(String::as_str).unwrap_or("");
            client.authorize(user, password).await?;
            Ok(Some(format!("{} as {}", "Authorized".green(), user.cyan())))
        }

        "reconnect" => {
            client.reconnect().await?;
            Ok(Some("Reconnected".green().to_string()))
        }

        _ => Ok(Some(format!(
            "Unknown command: {}. Type 'help' for help.",
            cmd
        ))),
    }
}
