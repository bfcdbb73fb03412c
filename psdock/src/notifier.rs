// Copyright (c) 2023 Yan Ka, Chiu.
// All rights reserved.
//
// Redistribution and use in source and binary forms, with or without
// modification, are permitted provided that the following conditions
// are met:
// 1. Redistributions of source code must retain the above copyright
//    notice, this list of conditions, and the following disclaimer,
//    without modification, immediately at the beginning of the file.
// 2. The name of the author may not be used to endorse or promote products
//    derived from this software without specific prior written permission.
//
// THIS SOFTWARE IS PROVIDED BY THE AUTHOR AND CONTRIBUTORS ``AS IS'' AND
// ANY EXPRESS OR IMPLIED WARRANTIES, INCLUDING, BUT NOT LIMITED TO, THE
// IMPLIED WARRANTIES OF MERCHANTABILITY AND FITNESS FOR A PARTICULAR PURPOSE
// ARE DISCLAIMED. IN NO EVENT SHALL THE AUTHOR OR CONTRIBUTORS BE LIABLE FOR
// ANY DIRECT, INDIRECT, INCIDENTAL, SPECIAL, EXEMPLARY, OR CONSEQUENTIAL
// DAMAGES (INCLUDING, BUT NOT LIMITED TO, PROCUREMENT OF SUBSTITUTE GOODS
// OR SERVICES; LOSS OF USE, DATA, OR PROFITS; OR BUSINESS INTERRUPTION)
// HOWEVER CAUSED AND ON ANY THEORY OF LIABILITY, WHETHER IN CONTRACT, STRICT
// LIABILITY, OR TORT (INCLUDING NEGLIGENCE OR OTHERWISE) ARISING IN ANY WAY
// OUT OF THE USE OF THIS SOFTWARE, EVEN IF ADVISED OF THE POSSIBILITY OF
// SUCH DAMAGE.

use serde::Serialize;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, error, info};

pub const NOTIFY_TIMEOUT: Duration = Duration::from_secs(10);

/// Lifecycle of the supervised process as seen by the web hook, in order
#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum PsStatus {
    Starting,
    Running,
    Crashed,
}

#[derive(Serialize)]
struct Payload {
    ps: PayloadStatus,
}

#[derive(Serialize)]
struct PayloadStatus {
    status: PsStatus,
}

/// Sends status changes to a web hook. Transitions only move forward: a status equal to or
/// before the last one sent is dropped. Without a web hook every notification is a no-op.
#[derive(Debug)]
pub struct StatusNotifier {
    target: Option<(String, reqwest::Client)>,
    last: Mutex<Option<PsStatus>>,
}

impl StatusNotifier {
    pub fn new(web_hook: Option<&str>) -> StatusNotifier {
        let target = web_hook.filter(|url| !url.is_empty()).and_then(|url| {
            // certificates of https hooks are not verified
            let client = reqwest::Client::builder()
                .danger_accept_invalid_certs(url.starts_with("https"))
                .timeout(NOTIFY_TIMEOUT)
                .build();
            match client {
                Ok(client) => Some((url.to_string(), client)),
                Err(err) => {
                    error!("cannot build web hook client for {url}: {err}");
                    None
                }
            }
        });
        StatusNotifier {
            target,
            last: Mutex::new(None),
        }
    }

    pub fn disabled() -> StatusNotifier {
        StatusNotifier::new(None)
    }

    /// Deliver `status`, returns whether it was accepted by the hook. Failures are logged, never
    /// retried.
    pub async fn notify(&self, status: PsStatus) -> bool {
        let Some((url, client)) = &self.target else {
            return false;
        };
        // held during delivery, statuses reach the hook in order
        let mut last = self.last.lock().await;
        if let Some(previous) = *last {
            if status <= previous {
                debug!("dropping out of order status {status:?}, last sent {previous:?}");
                return false;
            }
        }
        *last = Some(status);

        let payload = Payload {
            ps: PayloadStatus { status },
        };
        match client.put(url).json(&payload).send().await {
            Ok(response) if response.status().is_success() => {
                info!("web hook notified: {status:?}");
                true
            }
            Ok(response) => {
                error!(
                    "failed to notify web hook {url}: expected status 200 .. 299, got {}",
                    response.status()
                );
                false
            }
            Err(err) => {
                error!("failed to notify web hook {url}: {err}");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::HookServer;

    #[test]
    fn test_payload() {
        let payload = Payload {
            ps: PayloadStatus {
                status: PsStatus::Running,
            },
        };
        assert_eq!(
            serde_json::to_string(&payload).unwrap(),
            r#"{"ps":{"status":"running"}}"#
        );
    }

    #[tokio::test]
    async fn test_no_web_hook() {
        let notifier = StatusNotifier::new(Some(""));
        assert!(!notifier.notify(PsStatus::Starting).await);
        assert!(!StatusNotifier::disabled().notify(PsStatus::Crashed).await);
    }

    #[tokio::test]
    async fn test_notify_in_order() {
        let server = HookServer::start(200).await;
        let notifier = StatusNotifier::new(Some(&server.url));
        assert!(notifier.notify(PsStatus::Starting).await);
        assert!(notifier.notify(PsStatus::Running).await);
        assert!(!notifier.notify(PsStatus::Starting).await);
        assert!(!notifier.notify(PsStatus::Running).await);
        assert!(notifier.notify(PsStatus::Crashed).await);
        assert!(!notifier.notify(PsStatus::Crashed).await);

        let requests = server.requests();
        assert!(requests.iter().all(|(method, _)| method == "PUT"));
        assert_eq!(server.statuses(), vec!["starting", "running", "crashed"]);
    }

    #[tokio::test]
    async fn test_error_status_is_not_fatal() {
        let server = HookServer::start(500).await;
        let notifier = StatusNotifier::new(Some(&server.url));
        assert!(!notifier.notify(PsStatus::Starting).await);
        // a failed delivery still counts as the current status
        assert!(!notifier.notify(PsStatus::Starting).await);
        notifier.notify(PsStatus::Crashed).await;
        assert_eq!(server.statuses(), vec!["starting", "crashed"]);
    }

    #[tokio::test]
    async fn test_unreachable_hook() {
        let notifier = StatusNotifier::new(Some("http://127.0.0.1:9/ps"));
        assert!(!notifier.notify(PsStatus::Starting).await);
    }
}
