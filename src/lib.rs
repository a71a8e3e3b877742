pub mod client;
pub mod protocol;
pub mod registry;
pub mod runtime;
pub mod server;

// Re-export public items for convenience
pub use runtime::run_server;
pub use server::{ChatServer, ShutdownHandle};
