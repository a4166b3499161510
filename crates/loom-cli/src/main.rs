use std::fmt::Write as _;

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use loom_core::now_stamp;
use serde_json::Value;

#[derive(Debug, Parser)]
#[command(name = "loom")]
#[command(about = "Client for a shared loom tree server")]
struct Cli {
    #[arg(long, env = "LOOM_SERVER", default_value = "http://127.0.0.1:8080")]
    server: String,
    #[arg(long, env = "LOOM_SECRET")]
    secret: String,
    #[arg(long, env = "LOOM_TREE_ID")]
    tree_id: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Create one node; the server mints an id when none is given.
    Create(CreateArgs),
    /// Rewrite a node's text/author/timestamp in place.
    Update(UpdateArgs),
    Delete(DeleteArgs),
    Get(IdArgs),
    Root,
    Children(IdArgs),
    Parents(IdArgs),
    Ids,
    /// Fetch the whole tree as an id-keyed map.
    Tree,
    Count,
    Exists(IdArgs),
    /// Incremental pull: nodes mutated strictly after the cursor.
    Sync(SinceArgs),
    /// History log, optionally only entries after a cursor. The only
    /// feed that shows deletes.
    History(HistoryArgs),
}

#[derive(Debug, Args)]
struct CreateArgs {
    #[arg(long)]
    id: Option<String>,
    #[arg(long = "parent")]
    parents: Vec<String>,
    #[arg(long)]
    text: String,
    #[arg(long)]
    author: String,
    /// Defaults to the current time at second precision.
    #[arg(long)]
    timestamp: Option<String>,
}

#[derive(Debug, Args)]
struct UpdateArgs {
    #[arg(long)]
    id: String,
    #[arg(long)]
    text: String,
    #[arg(long)]
    author: String,
    #[arg(long)]
    timestamp: Option<String>,
}

#[derive(Debug, Args)]
struct DeleteArgs {
    #[arg(long)]
    id: String,
    #[arg(long)]
    author: String,
}

#[derive(Debug, Args)]
struct IdArgs {
    #[arg(long)]
    id: String,
}

#[derive(Debug, Args)]
struct SinceArgs {
    #[arg(long)]
    since: String,
}

#[derive(Debug, Args)]
struct HistoryArgs {
    #[arg(long)]
    since: Option<String>,
}

struct ServerClient {
    base: String,
    secret: String,
    tree_id: String,
}

impl ServerClient {
    fn new(server: &str, secret: String, tree_id: String) -> Self {
        Self { base: server.trim_end_matches('/').to_string(), secret, tree_id }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base)
    }

    fn call(&self, method: &str, path: &str, body: Option<Value>) -> Result<Value> {
        let request = ureq::request(method, &self.url(path))
            .set("Authorization", &self.secret)
            .set("Tree-Id", &self.tree_id);
        let result = match body {
            Some(value) => request.send_json(value),
            None => request.call(),
        };
        let response = match result {
            Ok(response) => response,
            Err(ureq::Error::Status(code, response)) => {
                let detail = response
                    .into_json::<Value>()
                    .map(|value| value.to_string())
                    .unwrap_or_else(|_| "<no body>".to_string());
                return Err(anyhow!("server returned HTTP {code}: {detail}"));
            }
            Err(err) => return Err(err).context("request failed"),
        };
        let value: Value =
            response.into_json().context("server response is not JSON")?;
        if value.get("success").and_then(Value::as_bool) == Some(false) {
            let detail = value
                .get("error")
                .and_then(Value::as_str)
                .unwrap_or("unknown error");
            return Err(anyhow!("server refused request: {detail}"));
        }
        Ok(value)
    }

    fn get(&self, path: &str) -> Result<Value> {
        self.call("GET", path, None)
    }
}

/// Percent-encode one path segment (node ids and timestamp cursors may
/// contain spaces and other reserved characters).
fn encode_segment(raw: &str) -> String {
    let mut encoded = String::with_capacity(raw.len());
    for byte in raw.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                encoded.push(byte as char);
            }
            other => {
                let _ = write!(encoded, "%{other:02X}");
            }
        }
    }
    encoded
}

fn print_value(value: &Value) -> Result<()> {
    let rendered =
        serde_json::to_string_pretty(value).context("failed to render response")?;
    println!("{rendered}");
    Ok(())
}

fn stamp_or_now(supplied: Option<String>) -> Result<String> {
    match supplied {
        Some(stamp) => Ok(stamp),
        None => Ok(now_stamp()?),
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let client = ServerClient::new(&cli.server, cli.secret, cli.tree_id);

    let value = match cli.command {
        Command::Create(args) => {
            let timestamp = stamp_or_now(args.timestamp)?;
            let mut node = serde_json::json!({
                "parentIds": args.parents,
                "text": args.text,
                "author": args.author,
                "timestamp": timestamp,
            });
            if let (Some(map), Some(id)) = (node.as_object_mut(), args.id) {
                map.insert("id".to_string(), Value::String(id));
            }
            client.call("POST", "/nodes", Some(Value::Array(vec![node])))?
        }
        Command::Update(args) => {
            let timestamp = stamp_or_now(args.timestamp)?;
            client.call(
                "PUT",
                &format!("/nodes/{}", encode_segment(&args.id)),
                Some(serde_json::json!({
                    "text": args.text,
                    "author": args.author,
                    "timestamp": timestamp,
                })),
            )?
        }
        Command::Delete(args) => client.call(
            "DELETE",
            &format!(
                "/nodes/{}?author={}",
                encode_segment(&args.id),
                encode_segment(&args.author)
            ),
            None,
        )?,
        Command::Get(args) => client.get(&format!("/nodes/{}", encode_segment(&args.id)))?,
        Command::Root => client.get("/nodes/root")?,
        Command::Children(args) => {
            client.get(&format!("/nodes/{}/children", encode_segment(&args.id)))?
        }
        Command::Parents(args) => {
            client.get(&format!("/nodes/{}/parents", encode_segment(&args.id)))?
        }
        Command::Ids => client.get("/nodes/ids")?,
        Command::Tree => client.get("/nodes")?,
        Command::Count => client.get("/nodes/count")?,
        Command::Exists(args) => {
            client.get(&format!("/nodes/exists/{}", encode_segment(&args.id)))?
        }
        Command::Sync(args) => {
            client.get(&format!("/nodes/get/{}", encode_segment(&args.since)))?
        }
        Command::History(args) => match args.since {
            Some(since) => client.get(&format!("/history/{}", encode_segment(&since)))?,
            None => client.get("/history")?,
        },
    };

    print_value(&value)
}
