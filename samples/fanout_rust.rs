//! Routed writes and a cross-shard read using strata_client.
use strata_client::Client;
#[tokio::main]
async fn main() {
    let mut cli = Client::connect("127.0.0.1:7433").await.unwrap();
    cli.execute(41, "INSERT INTO users(id, name) VALUES ($1, $2)", &["41", "ada"]).await.unwrap();
    cli.execute(1007, "INSERT INTO users(id, name) VALUES ($1, $2)", &["1007", "grace"]).await.unwrap();
    let all = cli.fan_out("SELECT name FROM users", &[]).await.unwrap();
    println!("users across all shards: {}", all.rows.len());
}
