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

use tokio::sync::watch;

/// Sender side of the server-wide stop signal.
#[derive(Debug)]
pub struct ShutdownNotifier {
    tx: watch::Sender<bool>,
}

impl ShutdownNotifier {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        ShutdownNotifier { tx }
    }

    pub fn subscribe(&self) -> Shutdown {
        Shutdown::new(self.tx.subscribe())
    }

    pub fn notify(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_notified(&self) -> bool {
        *self.tx.borrow()
    }
}

impl Default for ShutdownNotifier {
    fn default() -> Self {
        Self::new()
    }
}

/// Receiver side. Unlike a broadcast receiver it can also be polled
/// synchronously, which the connection liveness check relies on.
#[derive(Debug, Clone)]
pub struct Shutdown {
    notify: watch::Receiver<bool>,
}

impl Shutdown {
    pub fn new(notify: watch::Receiver<bool>) -> Shutdown {
        Shutdown { notify }
    }

    pub fn is_shutdown(&self) -> bool {
        *self.notify.borrow()
    }

    /// Resolves once a stop was requested or the notifier is gone.
    pub async fn recv(&mut self) {
        let _ = self.notify.wait_for(|stopped| *stopped).await;
    }
}
