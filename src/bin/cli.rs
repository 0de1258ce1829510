use clap::{Parser, Subcommand};
use reqwest::Client;
use serde_json::json;
use std::fs;

#[derive(Parser)]
#[command(name = "vectordb-cli")]
#[command(about = "CLI for the vector database service", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[arg(short, long, default_value = "http://localhost:11111")]
    url: String,
}

#[derive(Subcommand)]
enum Commands {
    Register {
        #[arg(short, long)]
        username: String,
        #[arg(short, long)]
        password: String,
    },
    Login {
        #[arg(short, long)]
        username: String,
        #[arg(short, long)]
        password: String,
    },
    Logout,
    CreateDataset {
        #[arg(short, long)]
        name: String,
        #[arg(short, long)]
        dimensions: usize,
        #[arg(short, long, default_value = "cosine")]
        metric: String,
        #[arg(short, long, default_value = "default")]
        index_type: String,
    },
    ListDatasets,
    GetDataset {
        #[arg(short, long)]
        id: String,
    },
    DeleteDataset {
        #[arg(short, long)]
        id: String,
    },
    DatasetStats {
        #[arg(short, long)]
        id: String,
    },
    /// Inserts a single vector; `--values` is a comma-separated float list.
    Insert {
        #[arg(short, long)]
        dataset: String,
        #[arg(short = 'D', long)]
        document_id: String,
        #[arg(short, long)]
        values: String,
        #[arg(short, long)]
        content: Option<String>,
    },
    GetVector {
        #[arg(short, long)]
        dataset: String,
        #[arg(short, long)]
        id: String,
    },
    DeleteVector {
        #[arg(short, long)]
        dataset: String,
        #[arg(short, long)]
        id: String,
    },
    Search {
        #[arg(short, long)]
        dataset: String,
        #[arg(short, long)]
        values: String,
        #[arg(short, long, default_value_t = 10)]
        top_k: usize,
    },
    SearchText {
        #[arg(short, long)]
        dataset: String,
        #[arg(short, long)]
        query: String,
    },
    SearchHybrid {
        #[arg(short, long)]
        dataset: String,
        #[arg(short, long)]
        values: String,
        #[arg(short, long)]
        query: String,
        #[arg(short, long, default_value = "rrf")]
        fusion_method: String,
    },
    RebuildIndex {
        #[arg(short, long)]
        dataset: String,
    },
    CreateBackup {
        #[arg(short, long)]
        tenant: String,
        #[arg(short = 'd', long = "dataset", value_delimiter = ',')]
        dataset_ids: Vec<String>,
    },
    RateLimitStatus {
        #[arg(short, long)]
        tenant: String,
    },
}

fn token() -> String {
    fs::read_to_string(".vectordb_token").unwrap_or_default()
}

fn parse_values(values: &str) -> Vec<f32> {
    values.split(',').filter_map(|v| v.trim().parse::<f32>().ok()).collect()
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let client = Client::new();

    match cli.command {
        Commands::Register { username, password } => {
            let res = client
                .post(format!("{}/api/v1/auth/register", cli.url))
                .json(&json!({ "username": username, "password": password }))
                .send()
                .await?;
            println!("{}", res.text().await?);
        }
        Commands::Login { username, password } => {
            let res = client
                .post(format!("{}/api/v1/auth/login", cli.url))
                .json(&json!({ "username": username, "password": password }))
                .send()
                .await?;
            if res.status().is_success() {
                let body: serde_json::Value = res.json().await?;
                if let Some(token) = body.get("token").and_then(|t| t.as_str()) {
                    fs::write(".vectordb_token", token)?;
                    println!("Logged in as {username}. Token saved to .vectordb_token");
                } else {
                    println!("Login succeeded but no token was returned: {body}");
                }
            } else {
                println!("Login failed: {}", res.text().await?);
            }
        }
        Commands::Logout => {
            let _ = fs::remove_file(".vectordb_token");
            println!("Logged out (token removed).");
        }
        Commands::CreateDataset { name, dimensions, metric, index_type } => {
            let res = client
                .post(format!("{}/api/v1/datasets", cli.url))
                .header("Authorization", format!("Bearer {}", token()))
                .json(&json!({
                    "name": name,
                    "dimensions": dimensions,
                    "metric": metric,
                    "index_type": index_type,
                }))
                .send()
                .await?;
            println!("{}", res.text().await?);
        }
        Commands::ListDatasets => {
            let res = client
                .get(format!("{}/api/v1/datasets", cli.url))
                .header("Authorization", format!("Bearer {}", token()))
                .send()
                .await?;
            println!("{}", res.text().await?);
        }
        Commands::GetDataset { id } => {
            let res = client.get(format!("{}/api/v1/datasets/{}", cli.url, id)).send().await?;
            println!("{}", res.text().await?);
        }
        Commands::DeleteDataset { id } => {
            let res = client.delete(format!("{}/api/v1/datasets/{}", cli.url, id)).send().await?;
            println!("status: {}", res.status());
        }
        Commands::DatasetStats { id } => {
            let res = client.get(format!("{}/api/v1/datasets/{}/stats", cli.url, id)).send().await?;
            println!("{}", res.text().await?);
        }
        Commands::Insert { dataset, document_id, values, content } => {
            let res = client
                .post(format!("{}/api/v1/datasets/{}/vectors", cli.url, dataset))
                .header("Authorization", format!("Bearer {}", token()))
                .json(&json!({
                    "vectors": [{
                        "document_id": document_id,
                        "values": parse_values(&values),
                        "content": content,
                    }],
                }))
                .send()
                .await?;
            println!("{}", res.text().await?);
        }
        Commands::GetVector { dataset, id } => {
            let res = client.get(format!("{}/api/v1/datasets/{}/vectors/{}", cli.url, dataset, id)).send().await?;
            println!("{}", res.text().await?);
        }
        Commands::DeleteVector { dataset, id } => {
            let res = client.delete(format!("{}/api/v1/datasets/{}/vectors/{}", cli.url, dataset, id)).send().await?;
            println!("status: {}", res.status());
        }
        Commands::Search { dataset, values, top_k } => {
            let res = client
                .post(format!("{}/api/v1/datasets/{}/search", cli.url, dataset))
                .json(&json!({ "query_vector": parse_values(&values), "top_k": top_k }))
                .send()
                .await?;
            println!("{}", res.text().await?);
        }
        Commands::SearchText { dataset, query } => {
            let res = client
                .post(format!("{}/api/v1/datasets/{}/search/text", cli.url, dataset))
                .json(&json!({ "query_text": query }))
                .send()
                .await?;
            println!("{}", res.text().await?);
        }
        Commands::SearchHybrid { dataset, values, query, fusion_method } => {
            let res = client
                .post(format!("{}/api/v1/datasets/{}/search/hybrid", cli.url, dataset))
                .json(&json!({
                    "query_vector": parse_values(&values),
                    "query_text": query,
                    "fusion_method": fusion_method,
                }))
                .send()
                .await?;
            println!("{}", res.text().await?);
        }
        Commands::RebuildIndex { dataset } => {
            let res = client
                .post(format!("{}/api/v1/datasets/{}/index", cli.url, dataset))
                .header("Authorization", format!("Bearer {}", token()))
                .send()
                .await?;
            println!("{}", res.text().await?);
        }
        Commands::CreateBackup { tenant, dataset_ids } => {
            let res = client
                .post(format!("{}/api/v1/backups", cli.url))
                .header("Authorization", format!("Bearer {}", token()))
                .json(&json!({ "tenant_id": tenant, "dataset_ids": dataset_ids }))
                .send()
                .await?;
            println!("{}", res.text().await?);
        }
        Commands::RateLimitStatus { tenant } => {
            let res = client.get(format!("{}/api/v1/rate-limits/{}", cli.url, tenant)).send().await?;
            println!("{}", res.text().await?);
        }
    }

    Ok(())
}
