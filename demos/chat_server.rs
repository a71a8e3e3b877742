use framed_chat::ChatServer;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    console_subscriber::init();
    info!("Starting chat server on 127.0.0.1:55555");
    let server = ChatServer::new("127.0.0.1:55555").await?;
    server.run().await?;
    Ok(())
}
