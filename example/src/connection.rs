use std::env::var;
use pgpipe::{Client, Config, Connection, Result};

pub async fn main() -> Result<()> {
    let config = Config::parse(&var("DATABASE_URL").unwrap())?;
    let client = Client::connect(&config).await?;
    client.query("SELECT 1").await?;
    client.end().await?;

    let client = Client::connect_env().await?;
    client.query("SELECT 1").await?;
    client.end().await?;

    // a bare connection, handed over to a client after startup
    let conn = Connection::connect_env().await?;
    assert!(conn.backend_key_data().is_some());
    let client = Client::from_connection(conn);
    client.query("SELECT 1").await?;

    // ending twice is fine
    client.end().await?;
    client.end().await?;
    assert!(client.is_closed());

    Ok(())
}
