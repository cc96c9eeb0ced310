use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::{AppError, AppResult};

pub const SMB_PORT: u16 = 445;
pub const SOCKET_BACKLOG: u32 = 16;
/// 24-bit length field of the session header.
pub const MAX_STREAM_PROT_LEN: usize = 0x00FF_FFFF;

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct NetworkConfig {
    pub ip: String,
    pub port: u16,
    /// interfaces the listening socket is bound to, empty means all
    pub interfaces: Vec<String>,
    pub backlog: u32,
    pub recv_timeout_ms: u64,
    pub send_timeout_ms: u64,
    pub max_message_size: usize,
    pub max_connections: usize,
    /// idle time after which a connection without open files is dropped, 0 disables
    pub deadtime_secs: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        NetworkConfig {
            ip: "0.0.0.0".to_string(),
            port: SMB_PORT,
            interfaces: Vec::new(),
            backlog: SOCKET_BACKLOG,
            recv_timeout_ms: 7_000,
            send_timeout_ms: 5_000,
            max_message_size: MAX_STREAM_PROT_LEN,
            max_connections: 1024,
            deadtime_secs: 0,
        }
    }
}

impl NetworkConfig {
    pub fn recv_timeout(&self) -> Duration {
        Duration::from_millis(self.recv_timeout_ms)
    }
    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }
    pub fn deadtime(&self) -> Option<Duration> {
        (self.deadtime_secs > 0).then(|| Duration::from_secs(self.deadtime_secs))
    }
}

/// Object pool and response buffer settings.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct WorkPoolConfig {
    /// maximum number of outstanding work units
    pub capacity: usize,
    pub cache_response_buffers: bool,
    pub cache_aux_buffers: bool,
    pub response_buffer_size: usize,
    pub buffer_cache_limit: usize,
}

impl Default for WorkPoolConfig {
    fn default() -> Self {
        WorkPoolConfig {
            capacity: 4096,
            cache_response_buffers: true,
            cache_aux_buffers: false,
            response_buffer_size: 64 * 1024,
            buffer_cache_limit: 256,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct RequestHandlerPool {
    pub channel_capacity: usize,
    /// 0 means one worker per cpu
    pub num_workers: usize,
    pub monitor_interval_ms: u64,
}

impl Default for RequestHandlerPool {
    fn default() -> Self {
        RequestHandlerPool {
            channel_capacity: 1024,
            num_workers: 0,
            monitor_interval_ms: 5_000,
        }
    }
}

impl RequestHandlerPool {
    pub fn worker_count(&self) -> usize {
        if self.num_workers == 0 {
            num_cpus::get()
        } else {
            self.num_workers
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct SessionConfig {
    pub max_credits: u16,
    pub max_async_ids: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            max_credits: 8192,
            max_async_ids: 0xFFFF,
        }
    }
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    pub network: NetworkConfig,
    pub work_pool: WorkPoolConfig,
    pub request_handler_pool: RequestHandlerPool,
    pub session: SessionConfig,
}

impl ServerConfig {
    pub fn set_up_config<P: AsRef<Path>>(path: P) -> AppResult<ServerConfig> {
        let path_str = path
            .as_ref()
            .to_str()
            .ok_or(AppError::InvalidValue(format!(
                "config file path: {}",
                path.as_ref().to_string_lossy()
            )))?;
        let config = config::Config::builder()
            .add_source(config::File::with_name(path_str))
            .build()?;

        let server_config: ServerConfig = config.try_deserialize()?;
        server_config.validate()?;

        Ok(server_config)
    }

    pub fn validate(&self) -> AppResult<()> {
        if self.network.max_message_size > MAX_STREAM_PROT_LEN {
            return Err(AppError::InvalidValue(format!(
                "max_message_size {} exceeds session header limit {}",
                self.network.max_message_size, MAX_STREAM_PROT_LEN
            )));
        }
        if self.work_pool.capacity == 0 {
            return Err(AppError::InvalidValue("work_pool.capacity is 0".into()));
        }
        if self.session.max_credits == 0 {
            return Err(AppError::InvalidValue("session.max_credits is 0".into()));
        }
        if self.request_handler_pool.channel_capacity == 0 {
            return Err(AppError::InvalidValue(
                "request_handler_pool.channel_capacity is 0".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::Builder;

    #[test]
    fn test_partial_file_keeps_defaults() -> AppResult<()> {
        let mut file = Builder::new().suffix(".toml").tempfile()?;
        writeln!(file, "[network]\nport = 10445\ninterfaces = [\"eth0\"]")?;
        writeln!(file, "[session]\nmax_credits = 512")?;

        let config = ServerConfig::set_up_config(file.path())?;
        assert_eq!(config.network.port, 10445);
        assert_eq!(config.network.interfaces, vec!["eth0".to_string()]);
        assert_eq!(config.network.backlog, SOCKET_BACKLOG);
        assert_eq!(config.network.recv_timeout(), Duration::from_secs(7));
        assert_eq!(config.session.max_credits, 512);
        assert_eq!(config.work_pool.capacity, 4096);
        Ok(())
    }

    #[test]
    fn test_oversized_message_limit_rejected() -> AppResult<()> {
        let mut file = Builder::new().suffix(".toml").tempfile()?;
        writeln!(file, "[network]\nmax_message_size = 33554432")?;

        let result = ServerConfig::set_up_config(file.path());
        assert!(matches!(result, Err(AppError::InvalidValue(_))));
        Ok(())
    }

    #[test]
    fn test_deadtime_disabled_by_default() {
        let config = ServerConfig::default();
        assert!(config.network.deadtime().is_none());
        assert!(config.request_handler_pool.worker_count() > 0);
    }
}
