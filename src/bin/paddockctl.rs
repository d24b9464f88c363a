use anyhow::Result;
use clap::{Parser, Subcommand};
use serde_json::Value;

#[derive(Parser)]
#[command(name = "paddockctl")]
#[command(about = "CLI for paddock cluster management")]
struct Cli {
    #[arg(short, long, default_value = "http://127.0.0.1:8443")]
    addr: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    Info,

    #[command(subcommand)]
    Member(MemberCommands),

    Enable {
        #[arg(short, long)]
        name: String,
    },

    Operations,
}

#[derive(Subcommand)]
enum MemberCommands {
    List,
    Show {
        name: String,
    },
    Add {
        name: String,
    },
    Remove {
        name: String,

        #[arg(long)]
        force: bool,
    },
    Evacuate {
        name: String,

        #[arg(short, long)]
        mode: Option<String>,
    },
    Restore {
        name: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let client = reqwest::Client::new();
    let base_url = cli.addr;

    match cli.command {
        Commands::Info => {
            let resp: Value = client
                .get(format!("{}/1.0/cluster", base_url))
                .send()
                .await?
                .json()
                .await?;
            println!("{}", serde_json::to_string_pretty(&resp)?);
        }
        Commands::Enable { name } => {
            let body = serde_json::json!({
                "server_name": name,
                "enabled": true,
            });
            let resp: Value = client
                .put(format!("{}/1.0/cluster", base_url))
                .json(&body)
                .send()
                .await?
                .json()
                .await?;
            println!("{}", serde_json::to_string_pretty(&resp)?);
        }
        Commands::Member(cmd) => match cmd {
            MemberCommands::List => {
                let resp: Value = client
                    .get(format!("{}/1.0/cluster/members?recursion=1", base_url))
                    .send()
                    .await?
                    .json()
                    .await?;
                println!("{}", serde_json::to_string_pretty(&resp)?);
            }
            MemberCommands::Show { name } => {
                let resp: Value = client
                    .get(format!("{}/1.0/cluster/members/{}", base_url, name))
                    .send()
                    .await?
                    .json()
                    .await?;
                println!("{}", serde_json::to_string_pretty(&resp)?);
            }
            MemberCommands::Add { name } => {
                let body = serde_json::json!({ "server_name": name });
                let resp: Value = client
                    .post(format!("{}/1.0/cluster/members", base_url))
                    .json(&body)
                    .send()
                    .await?
                    .json()
                    .await?;

                if let Some(token) = resp.pointer("/metadata/token").and_then(|v| v.as_str()) {
                    println!("Member {} join token:", name);
                    println!("{}", token);
                } else {
                    println!("{}", serde_json::to_string_pretty(&resp)?);
                }
            }
            MemberCommands::Remove { name, force } => {
                let force = if force { "1" } else { "0" };
                let resp = client
                    .delete(format!(
                        "{}/1.0/cluster/members/{}?force={}",
                        base_url, name, force
                    ))
                    .send()
                    .await?;
                println!("{}", resp.status());
            }
            MemberCommands::Evacuate { name, mode } => {
                let mut body = serde_json::json!({ "action": "evacuate" });
                if let Some(mode) = mode {
                    body["mode"] = serde_json::json!(mode);
                }
                let resp: Value = client
                    .post(format!("{}/1.0/cluster/members/{}/state", base_url, name))
                    .json(&body)
                    .send()
                    .await?
                    .json()
                    .await?;
                println!("{}", serde_json::to_string_pretty(&resp)?);
            }
            MemberCommands::Restore { name } => {
                let body = serde_json::json!({ "action": "restore" });
                let resp: Value = client
                    .post(format!("{}/1.0/cluster/members/{}/state", base_url, name))
                    .json(&body)
                    .send()
                    .await?
                    .json()
                    .await?;
                println!("{}", serde_json::to_string_pretty(&resp)?);
            }
        },
        Commands::Operations => {
            let resp: Value = client
                .get(format!("{}/1.0/operations", base_url))
                .send()
                .await?
                .json()
                .await?;
            println!("{}", serde_json::to_string_pretty(&resp)?);
        }
    }

    Ok(())
}
