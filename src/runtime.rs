use anyhow::Result;
use tokio::runtime::Runtime;

use crate::server::ChatServer;

/// Manually create a tokio runtime
pub fn create_runtime() -> Result<Runtime> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(num_cpus::get())
        .thread_name("framed-chat-worker")
        .thread_stack_size(3 * 1024 * 1024)
        .enable_all()
        .build()?;
    Ok(runtime)
}

/// Builds a runtime and drives a chat server on `addr` until shutdown.
/// Blocking entry point for callers that do not bring their own runtime.
pub fn run_server(addr: &str) -> Result<()> {
    let runtime = create_runtime()?;
    runtime.block_on(async {
        let server = ChatServer::new(addr).await?;
        server.run().await
    })
}
