mod network;
mod request;
mod service;
mod utils;
mod work;

pub use network::{
    Connection, ConnectionRegistry, ConnectionStats, ConnectionStatus, Credits, PendingRequest,
    RecvVectored, RequestGuard, SecurityContext, SessionHeader, SessionMessageType, TcpReceiver,
    TcpTransport, Transport, VectoredReader, SESSION_HEADER_SIZE,
};
pub use request::{
    complete_async, handle_work, BasicOps, ConnectionOps, Disposition, Smb2Command, Smb2Header,
    SMB2_FLAGS_ASYNC_COMMAND, SMB2_FLAGS_SERVER_TO_REDIR, SMB2_HEADER_SIZE, SMB2_PROTO_ID,
    STATUS_CANCELLED, STATUS_INSUFFICIENT_RESOURCES, STATUS_INVALID_PARAMETER,
    STATUS_NOT_SUPPORTED, STATUS_PENDING, STATUS_SUCCESS,
};
pub use service::{
    setup_local_tracing, setup_tracing, AppError, AppResult, NetworkConfig, RequestHandlerPool,
    ServerConfig, SessionConfig, Shutdown, ShutdownNotifier, SmbServer, TracingGuard,
    WorkPoolConfig, MAX_STREAM_PROT_LEN, SMB_PORT, SOCKET_BACKLOG,
};
pub use utils::{IdAllocator, WorkQueue, WorkSender};
pub use work::{
    classify_request, lock_mode_for, BufferCache, BufferHandle, BufferMode, LockMode, Work,
    WorkLinks, WorkPool,
};
