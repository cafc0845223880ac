#![forbid(unsafe_code)]

// Status reporting - progress lines to the tracing log, mirrored to a remote log service when one answers

use serde::Serialize;
use std::sync::{Arc, Mutex};
use tracing::{info, warn};
use url::Url;

/// Where progress lines go besides the local log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReportingContext {
    /// Console only
    NoSession,
    Remote { endpoint: Url, session: String },
}

#[derive(Serialize)]
struct LogLine<'a> {
    session: &'a str,
    message: String,
}

/// Fans progress lines out to tracing, a transcript and the remote sink.
#[derive(Clone)]
pub struct StatusReporter {
    client: reqwest::Client,
    context: ReportingContext,
    transcript: Arc<Mutex<Vec<String>>>,
}

/// Joins relative paths under the endpoint rather than replacing its last segment.
fn with_trailing_slash(mut endpoint: Url) -> Url {
    if !endpoint.path().ends_with('/') {
        let path = format!("{}/", endpoint.path());
        endpoint.set_path(&path);
    }
    endpoint
}

impl StatusReporter {
    /// Console-only reporter.
    pub fn local() -> Self {
        Self::with_context(ReportingContext::NoSession)
    }

    pub fn with_context(context: ReportingContext) -> Self {
        Self {
            client: reqwest::Client::new(),
            context,
            transcript: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Fetches a session id from `endpoint`. Any failure falls back to console only.
    pub async fn connect(endpoint: Option<Url>) -> Self {
        let Some(endpoint) = endpoint else {
            return Self::local();
        };
        let endpoint = with_trailing_slash(endpoint);
        let client = reqwest::Client::new();

        match Self::fetch_session(&client, &endpoint).await {
            Ok(session) => {
                info!("Remote logging to {} with session {}", endpoint, session);
                Self {
                    client,
                    context: ReportingContext::Remote { endpoint, session },
                    transcript: Arc::new(Mutex::new(Vec::new())),
                }
            }
            Err(e) => {
                warn!("Remote logging disabled, no session from {}: {}", endpoint, e);
                Self::local()
            }
        }
    }

    async fn fetch_session(client: &reqwest::Client, endpoint: &Url) -> anyhow::Result<String> {
        let url = endpoint.join("session")?;
        let session = client
            .get(url)
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;
        Ok(session.trim().to_string())
    }

    pub fn context(&self) -> &ReportingContext {
        &self.context
    }

    /// Every line reported so far, in order.
    pub fn transcript(&self) -> Vec<String> {
        self.transcript
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Logs `line` and mirrors it remotely. Remote failures never propagate.
    pub async fn report(&self, line: impl Into<String>) {
        let line = line.into();
        info!("{}", line);
        self.transcript
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(line.clone());

        let ReportingContext::Remote { endpoint, session } = &self.context else {
            return;
        };
        let body = LogLine {
            session,
            message: format!("{line}\n"),
        };
        let result = match endpoint.join("log") {
            Ok(url) => self
                .client
                .post(url)
                .json(&body)
                .send()
                .await
                .and_then(|r| r.error_for_status())
                .map(|_| ())
                .map_err(anyhow::Error::from),
            Err(e) => Err(anyhow::Error::from(e)),
        };
        if let Err(e) = result {
            warn!("Failed to mirror log line: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_no_endpoint_is_console_only() {
        let reporter = StatusReporter::connect(None).await;
        assert_eq!(reporter.context(), &ReportingContext::NoSession);

        reporter.report("Testing 1 channel").await;
        reporter.report("Success").await;
        assert_eq!(reporter.transcript(), vec!["Testing 1 channel", "Success"]);
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_falls_back() {
        // Nothing listens on the discard port
        let endpoint = Url::parse("http://127.0.0.1:9/").unwrap();
        let reporter = StatusReporter::connect(Some(endpoint)).await;
        assert_eq!(reporter.context(), &ReportingContext::NoSession);
    }

    #[test]
    fn test_trailing_slash() {
        let base = with_trailing_slash(Url::parse("http://localhost:4443/logger").unwrap());
        assert_eq!(base.join("log").unwrap().as_str(), "http://localhost:4443/logger/log");
        let root = with_trailing_slash(Url::parse("http://localhost:4443").unwrap());
        assert_eq!(root.join("session").unwrap().as_str(), "http://localhost:4443/session");
    }
}
