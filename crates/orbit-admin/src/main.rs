mod client;

use clap::{Parser, Subcommand};
use client::ApiClient;
use comfy_table::{presets::UTF8_FULL, Table};
use serde_json::{json, Value};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "orbit")]
#[command(about = "Orbit cluster admin CLI", long_about = None)]
struct Args {
    /// Engine REST API address
    #[arg(long, default_value = "http://127.0.0.1:6500", env = "ORBIT_API")]
    api: String,

    /// Output format (json, table, yaml)
    #[arg(short, long, default_value = "table")]
    format: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Check that the node's API answers
    Ping,

    /// Open the node's store on the given advertise address
    Setup {
        /// IP address peers reach this node on
        address: String,
    },

    /// Form a new cluster with the node as its only member
    Bootstrap,

    /// Add a node to the cluster (run against the leader)
    Join {
        /// ID of the joining node
        node_id: String,

        /// Consensus address of the joining node, e.g. 10.0.0.2:6501
        address: String,
    },

    /// Show cluster nodes
    Nodes,

    /// Show the whole cluster state
    State,

    /// Compact the node's consensus log
    Snapshot,

    /// List users
    Users,

    /// Create a user
    Signup {
        #[arg(long)]
        name: String,
        #[arg(long)]
        username: String,
        #[arg(long)]
        email: String,
        #[arg(long, env = "ORBIT_PASSWORD")]
        password: String,
    },

    /// Remove a user
    RemoveUser {
        /// User ID
        id: String,
    },

    /// Create a namespace
    CreateNamespace { name: String },

    /// Create a repository
    CreateRepository {
        name: String,

        /// Namespace name or ID
        #[arg(short, long)]
        namespace: Option<String>,
    },

    /// List deployments
    Deployments,

    /// Create a deployment
    CreateDeployment {
        name: String,

        /// Repository ID, name or namespace/name
        #[arg(short, long)]
        repository: String,

        #[arg(short, long)]
        branch: Option<String>,

        /// Subdirectory holding the build definition
        #[arg(short, long, default_value = "")]
        path: String,

        /// Namespace name or ID
        #[arg(short, long)]
        namespace: Option<String>,
    },

    /// Show a deployment's build logs
    Logs {
        /// Deployment ID
        id: String,

        /// Only this build key
        #[arg(short, long)]
        key: Option<String>,
    },

    /// Start building a deployment
    Build {
        /// Deployment ID
        id: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let client = ApiClient::new(&args.api);
    let format = args.format.as_str();

    match args.command {
        Commands::Ping => {
            println!("{}", client.get_text("/").await?);
        }

        Commands::Setup { address } => {
            let response = client.post("/setup", json!({ "address": address })).await?;
            print_value(format, &response, || {
                println!(
                    "Node {} ready, consensus address {}",
                    response["node_id"].as_str().unwrap_or(""),
                    response["raft_address"].as_str().unwrap_or("")
                );
            })?;
        }

        Commands::Bootstrap => {
            client.post("/cluster/bootstrap", json!({})).await?;
            println!("Cluster bootstrapped");
        }

        Commands::Join { node_id, address } => {
            client
                .post("/cluster/join", json!({ "node_id": node_id, "address": address }))
                .await?;
            println!("Node {} joined", node_id);
        }

        Commands::Nodes => {
            let response = client.get("/nodes").await?;
            print_value(format, &response, || {
                println!(
                    "Node {} ({}), term {}",
                    response["node_id"].as_str().unwrap_or(""),
                    response["status"].as_str().unwrap_or(""),
                    response["term"]
                );
                let mut table = table(vec!["Node", "Address", "Leader"]);
                for node in response["nodes"].as_array().into_iter().flatten() {
                    table.add_row(vec![
                        node["node_id"].as_str().unwrap_or(""),
                        node["address"].as_str().unwrap_or(""),
                        if node["leader"].as_bool().unwrap_or(false) { "*" } else { "" },
                    ]);
                }
                println!("{table}");
            })?;
        }

        Commands::State => {
            let response = client.get("/state").await?;
            // No table form for nested state
            let format = if format == "table" { "yaml" } else { format };
            print_value(format, &response, || {})?;
        }

        Commands::Snapshot => {
            let response = client.post("/snapshot", json!({})).await?;
            println!("Snapshot taken at index {}", response["index"]);
        }

        Commands::Users => {
            let response = client.get("/users").await?;
            print_value(format, &response, || {
                let mut table = table(vec!["ID", "Name", "Username", "Email", "Created"]);
                for user in response.as_array().into_iter().flatten() {
                    table.add_row(vec![
                        user["id"].as_str().unwrap_or(""),
                        user["name"].as_str().unwrap_or(""),
                        user["username"].as_str().unwrap_or(""),
                        user["email"].as_str().unwrap_or(""),
                        user["created_at"].as_str().unwrap_or(""),
                    ]);
                }
                println!("{table}");
            })?;
        }

        Commands::Signup {
            name,
            username,
            email,
            password,
        } => {
            let body = json!({
                "name": name,
                "username": username,
                "email": email,
                "password": password,
            });
            let response = client.post("/user", body).await?;
            println!("User created: {}", response["id"].as_str().unwrap_or(""));
        }

        Commands::RemoveUser { id } => {
            client.delete(&format!("/user/{}", id)).await?;
            println!("User removed");
        }

        Commands::CreateNamespace { name } => {
            let response = client.post("/namespaces", json!({ "name": name })).await?;
            println!("Namespace created: {}", response["id"].as_str().unwrap_or(""));
        }

        Commands::CreateRepository { name, namespace } => {
            let response = client
                .post("/repositories", json!({ "name": name, "namespace": namespace }))
                .await?;
            println!("Repository created: {}", response["id"].as_str().unwrap_or(""));
        }

        Commands::Deployments => {
            let response = client.get("/deployments").await?;
            print_value(format, &response, || {
                let mut table = table(vec!["ID", "Name", "Repository", "Branch", "Path", "Builds"]);
                for deployment in response.as_array().into_iter().flatten() {
                    let builds = deployment["build_logs"]
                        .as_object()
                        .map_or(0, |logs| logs.len());
                    table.add_row(vec![
                        deployment["id"].as_str().unwrap_or(""),
                        deployment["name"].as_str().unwrap_or(""),
                        deployment["repository"].as_str().unwrap_or(""),
                        deployment["branch"].as_str().unwrap_or("master"),
                        deployment["path"].as_str().unwrap_or(""),
                        &builds.to_string(),
                    ]);
                }
                println!("{table}");
            })?;
        }

        Commands::CreateDeployment {
            name,
            repository,
            branch,
            path,
            namespace,
        } => {
            let body = json!({
                "name": name,
                "repository": repository,
                "branch": branch,
                "path": path,
                "namespace": namespace,
            });
            let response = client.post("/deployments", body).await?;
            println!("Deployment created: {}", response["id"].as_str().unwrap_or(""));
        }

        Commands::Logs { id, key } => {
            let response = client.get(&format!("/deployments/{}", id)).await?;
            let logs = response["build_logs"].as_object().cloned().unwrap_or_default();
            for (build_key, lines) in logs {
                if key.as_deref().map_or(false, |k| k != build_key) {
                    continue;
                }
                println!("==> {}", build_key);
                for line in lines.as_array().into_iter().flatten() {
                    println!("{}", line.as_str().unwrap_or(""));
                }
            }
        }

        Commands::Build { id } => {
            client
                .post(&format!("/deployments/{}/build", id), json!({}))
                .await?;
            println!("Build of {} started", id);
        }
    }

    Ok(())
}

fn table(header: Vec<&str>) -> Table {
    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_header(header);
    table
}

fn print_value(format: &str, value: &Value, as_table: impl FnOnce()) -> anyhow::Result<()> {
    match format {
        "json" => println!("{}", serde_json::to_string_pretty(value)?),
        "yaml" => print!("{}", serde_yaml::to_string(value)?),
        _ => as_table(),
    }
    Ok(())
}
