// Copyright 2025 jonefeewang@gmail.com
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    /// connection observed dead, or the receive was interrupted for good
    #[error("connection shut down")]
    Shutdown,

    /// transport failed in a way the session layer may recover from
    #[error("connection needs reconnect")]
    ReconnectNeeded,

    #[error("allocation failed: {0}")]
    AllocationFailed(String),

    #[error("identifier space exhausted: {0}")]
    IdExhausted(String),

    /// general errors
    #[error("illegal state: {0}")]
    IllegalState(String),

    #[error("malformed protocol : {0}")]
    MalformedProtocol(String),

    #[error("invalid value: {0}")]
    InvalidValue(String),

    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    #[error("I/O error: {0}")]
    DetailedIo(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("config file error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("tracing setup error: {0}")]
    Tracing(String),
}

impl AppError {
    /// Errors that end the current message cycle on a connection.
    pub fn is_connection_fatal(&self) -> bool {
        matches!(
            self,
            AppError::Shutdown
                | AppError::ReconnectNeeded
                | AppError::Io(_)
                | AppError::DetailedIo(_)
                | AppError::MalformedProtocol(_)
        )
    }
}

impl From<tracing::subscriber::SetGlobalDefaultError> for AppError {
    fn from(value: tracing::subscriber::SetGlobalDefaultError) -> Self {
        AppError::Tracing(value.to_string())
    }
}
