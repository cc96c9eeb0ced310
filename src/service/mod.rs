pub use app_error::{AppError, AppResult};
pub use config::{
    NetworkConfig, RequestHandlerPool, ServerConfig, SessionConfig, WorkPoolConfig,
    MAX_STREAM_PROT_LEN, SMB_PORT, SOCKET_BACKLOG,
};
pub use shutdown::{Shutdown, ShutdownNotifier};
pub use smb_server::SmbServer;
pub use tracing_config::{setup_local_tracing, setup_tracing, TracingGuard};

mod app_error;
mod config;
mod server;
mod shutdown;
mod smb_server;
mod tracing_config;
