//! Command execution.

use crate::Commands;
use base64::Engine;
use colored::Colorize;
use iproto_client::Client;
use iproto_protocol::auth::scramble as chap_sha1;
use iproto_protocol::keys::body;
use iproto_protocol::{IndexRef, Select, SpaceRef, Value};

/// Executes a command and returns the formatted output.
pub async fn execute(client: &Client, cmd: Commands) -> Result<String, Box<dyn std::error::Error>> {
    match cmd {
        Commands::Repl => unreachable!(),

        Commands::Ping => {
            client.ping().await?;
            Ok("PONG".green().to_string())
        }

        Commands::Info => info(client),

        Commands::Eval { expr, args } => {
            let args = parse_args(&args)?;
            let result = client.eval(&expr, args).await?;
            Ok(format_value(&result))
        }

        Commands::Call { function, args } => {
            let args = parse_args(&args)?;
            let result = client.call(&function, args).await?;
            Ok(format_value(&result))
        }

        Commands::Select {
            space,
            key,
            index,
            limit,
            offset,
        } => {
            let key = match parse_json_arg(&key)? {
                Value::Array(parts) => parts,
                single => vec![single],
            };
            let select = Select::new(parse_space(&space))
                .index(parse_index(&index))
                .key(key)
                .limit(limit)
                .offset(offset);
            let tuples = client.select(select).await?;
            Ok(format_tuples(&tuples))
        }

        Commands::Execute { sql, binds } => {
            let binds = parse_args(&binds)?;
            let reply = client.execute(sql.as_str(), binds).await?;
            match reply.data() {
                Some(rows) => Ok(format_tuples(rows)),
                None => match reply.get(body::SQL_INFO) {
                    Some(info) => Ok(format!("{} {}", "OK".green(), format_value(info))),
                    None => Ok("OK".green().to_string()),
                },
            }
        }

        Commands::WatchOnce { key } => {
            let value = client.watch_once(&key).await?;
            Ok(format_value(&value))
        }

        // Watch streams events and is handled directly in main.rs
        Commands::Watch { .. } => unreachable!(),

        // Scramble is handled directly in main.rs (no server connection needed)
        Commands::Scramble { .. } => unreachable!(),
    }
}

/// Describes the connected server.
pub fn info(client: &Client) -> Result<String, Box<dyn std::error::Error>> {
    let conn = client.connection();
    let greeting = conn.greeting()?;
    let server = conn.server_info()?;

    let mut output = format!(
        "{} {}\n  Protocol: {} (version {})\n  Features: {}",
        greeting.product.bold(),
        greeting.version.cyan(),
        greeting.protocol,
        server.protocol_version,
        server.features.to_string().yellow()
    );
    if let Some(uuid) = greeting.instance_uuid {
        output.push_str(&format!("\n  Instance: {}", uuid));
    }
    if let Some(auth) = &server.auth_type {
        output.push_str(&format!("\n  Auth: {}", auth));
    }
    if let Some(user) = conn.authorized_user() {
        output.push_str(&format!("\n  User: {}", user));
    }
    if let Some(version) = conn.schema_version() {
        output.push_str(&format!("\n  Schema version: {}", version));
    }
    Ok(output)
}

/// Computes the base64 chap-sha1 scramble for a base64 greeting salt.
pub fn scramble(salt: &str, password: &str) -> Result<String, Box<dyn std::error::Error>> {
    let engine = base64::engine::general_purpose::STANDARD;
    let salt = engine.decode(salt.trim())?;
    if salt.len() < iproto_protocol::greeting::SCRAMBLE_SALT_SIZE {
        return Err(format!("salt too short: {} bytes", salt.len()).into());
    }
    Ok(hex::encode(chap_sha1(&salt, password)))
}

pub fn parse_space(arg: &str) -> SpaceRef {
    match arg.parse::<u32>() {
        Ok(id) => SpaceRef::Id(id),
        Err(_) => SpaceRef::Name(arg.to_string()),
    }
}

pub fn parse_index(arg: &str) -> IndexRef {
    match arg.parse::<u32>() {
        Ok(id) => IndexRef::Id(id),
        Err(_) => IndexRef::Name(arg.to_string()),
    }
}

/// Parses each argument as JSON; bare words that are not JSON become
/// strings.
pub fn parse_args(args: &[String]) -> Result<Vec<Value>, Box<dyn std::error::Error>> {
    args.iter()
        .map(|arg| match serde_json::from_str::<serde_json::Value>(arg) {
            Ok(json) => Ok(json_to_value(json)),
            Err(_) if !looks_like_json(arg) => Ok(Value::from(arg.as_str())),
            Err(e) => Err(e.into()),
        })
        .collect()
}

fn looks_like_json(arg: &str) -> bool {
    matches!(arg.trim_start().chars().next(), Some('[' | '{' | '"'))
}

/// Parses a JSON argument (either inline JSON or @file.json).
pub fn parse_json_arg(arg: &str) -> Result<Value, Box<dyn std::error::Error>> {
    let json: serde_json::Value = if let Some(path) = arg.strip_prefix('@') {
        let content = std::fs::read_to_string(path)?;
        serde_json::from_str(&content)?
    } else {
        serde_json::from_str(arg)?
    };
    Ok(json_to_value(json))
}

pub fn json_to_value(json: serde_json::Value) -> Value {
    match json {
        serde_json::Value::Null => Value::Nil,
        serde_json::Value::Bool(b) => Value::Boolean(b),
        serde_json::Value::Number(n) => {
            if let Some(u) = n.as_u64() {
                Value::from(u)
            } else if let Some(i) = n.as_i64() {
                Value::from(i)
            } else {
                Value::from(n.as_f64().unwrap_or_default())
            }
        }
        serde_json::Value::String(s) => Value::from(s),
        serde_json::Value::Array(items) => {
            Value::Array(items.into_iter().map(json_to_value).collect())
        }
        serde_json::Value::Object(fields) => Value::Map(
            fields
                .into_iter()
                .map(|(k, v)| (Value::from(k), json_to_value(v)))
                .collect(),
        ),
    }
}

pub fn value_to_json(value: &Value) -> serde_json::Value {
    match value {
        Value::Nil => serde_json::Value::Null,
        Value::Boolean(b) => serde_json::Value::Bool(*b),
        Value::Integer(i) => match (i.as_u64(), i.as_i64()) {
            (Some(u), _) => serde_json::Value::from(u),
            (None, Some(i)) => serde_json::Value::from(i),
            (None, None) => serde_json::Value::Null,
        },
        Value::F32(f) => serde_json::Value::from(*f as f64),
        Value::F64(f) => serde_json::Value::from(*f),
        Value::String(s) => match s.as_str() {
            Some(s) => serde_json::Value::from(s),
            None => serde_json::Value::from(hex::encode(s.as_bytes())),
        },
        Value::Binary(bytes) => serde_json::Value::from(hex::encode(bytes)),
        Value::Array(items) => serde_json::Value::Array(items.iter().map(value_to_json).collect()),
        Value::Map(entries) => {
            let fields = entries
                .iter()
                .map(|(k, v)| {
                    let key = match k {
                        Value::String(s) => s.as_str().unwrap_or_default().to_string(),
                        other => other.to_string(),
                    };
                    (key, value_to_json(v))
                })
                .collect();
            serde_json::Value::Object(fields)
        }
        Value::Ext(ty, bytes) => serde_json::json!({ "ext": ty, "data": hex::encode(bytes) }),
    }
}

/// Formats a value as pretty JSON for display.
pub fn format_value(value: &Value) -> String {
    let json = value_to_json(value);
    serde_json::to_string_pretty(&json).unwrap_or_else(|_| json.to_string())
}

/// One tuple per line.
pub fn format_tuples(value: &Value) -> String {
    match value {
        Value::Array(tuples) if tuples.is_empty() => "No tuples".yellow().to_string(),
        Value::Array(tuples) => tuples
            .iter()
            .map(|tuple| value_to_json(tuple).to_string())
            .collect::<Vec<_>>()
            .join("\n"),
        other => format_value(other),
    }
}
