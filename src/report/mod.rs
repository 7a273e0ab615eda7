//! Failure reporting to an external issue tracker.
//!
//! A stage failure files one issue per dataset: before creating anything,
//! the reporter searches open issues for the dataset token in the title and
//! skips the create when a matching issue already exists. Reporting is a
//! best-effort side channel; callers treat its errors as log-worthy, never
//! as pipeline failures.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::stages::StageKind;
use crate::status::LogEntry;

#[derive(Error, Debug)]
pub enum ReportError {
    #[error("Tracker request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Tracker API returned {status}: {body}")]
    Api { status: u16, body: String },

    #[error("Credential error: {0}")]
    Auth(String),
}

/// Everything the reporter needs to describe one stage failure.
#[derive(Debug, Clone)]
pub struct FailureReport {
    pub dataset_id: i64,
    pub stage: StageKind,
    pub message: String,
    /// Most recent error log entries for the dataset, newest first.
    pub recent_errors: Vec<LogEntry>,
}

impl FailureReport {
    /// The dataset token used for issue deduplication.
    pub fn title_token(&self) -> String {
        format!("[dataset-{}]", self.dataset_id)
    }

    pub fn title(&self) -> String {
        format!(
            "{} {} stage failed during processing",
            self.title_token(),
            self.stage
        )
    }

    pub fn body(&self) -> String {
        let mut body = format!(
            "Automated report from the processing worker.\n\n\
             * Dataset: `{}`\n* Stage: `{}`\n\n## Failure\n\n```\n{}\n```\n",
            self.dataset_id, self.stage, self.message
        );
        if !self.recent_errors.is_empty() {
            body.push_str("\n## Recent errors\n\n");
            for entry in &self.recent_errors {
                body.push_str(&format!(
                    "* `{}` {}\n",
                    entry.created_at.format("%Y-%m-%d %H:%M:%S"),
                    entry.message
                ));
            }
        }
        body
    }
}

/// Seam between the pipeline executor and the tracker backend.
#[async_trait]
pub trait FailureReporter: Send + Sync {
    async fn report(&self, failure: &FailureReport) -> Result<(), ReportError>;
}

/// Supplies and refreshes tracker credentials.
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    async fn token(&self) -> Result<String, ReportError>;

    /// Called after a 401; returns a fresh token for one retry.
    async fn refresh(&self) -> Result<String, ReportError>;
}

/// Fixed token from configuration. Refresh hands back the same token.
pub struct StaticToken(String);

impl StaticToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }
}

#[async_trait]
impl CredentialProvider for StaticToken {
    async fn token(&self) -> Result<String, ReportError> {
        Ok(self.0.clone())
    }

    async fn refresh(&self) -> Result<String, ReportError> {
        Ok(self.0.clone())
    }
}

/// Fallback reporter when no tracker is configured. Failures still land in
/// the worker log.
pub struct LogReporter;

#[async_trait]
impl FailureReporter for LogReporter {
    async fn report(&self, failure: &FailureReport) -> Result<(), ReportError> {
        warn!(
            dataset_id = failure.dataset_id,
            stage = %failure.stage,
            "Stage failed (no tracker configured): {}",
            failure.message
        );
        Ok(())
    }
}

#[derive(Deserialize)]
struct IssueSummary {
    title: String,
    #[serde(default)]
    number: u64,
}

#[derive(Serialize)]
struct NewIssue<'a> {
    title: String,
    body: String,
    labels: &'a [&'a str],
}

/// Reporter backed by a GitHub-style issues API.
pub struct TrackerReporter {
    http: reqwest::Client,
    api_base: String,
    repo: String,
    credentials: Arc<dyn CredentialProvider>,
}

impl TrackerReporter {
    pub fn new(
        api_base: impl Into<String>,
        repo: impl Into<String>,
        credentials: Arc<dyn CredentialProvider>,
    ) -> Self {
        Self {
            http: reqwest::Client::new(),
            api_base: api_base.into().trim_end_matches('/').to_string(),
            repo: repo.into(),
            credentials,
        }
    }

    fn issues_url(&self) -> String {
        format!("{}/repos/{}/issues", self.api_base, self.repo)
    }

    async fn authorized(
        &self,
        build: impl Fn(&reqwest::Client) -> reqwest::RequestBuilder,
    ) -> Result<reqwest::Response, ReportError> {
        let token = self.credentials.token().await?;
        let response = build(&self.http)
            .header("Authorization", format!("Bearer {token}"))
            .header("Accept", "application/vnd.github+json")
            .header("User-Agent", "canopy-processor")
            .send()
            .await?;

        if response.status().as_u16() != 401 {
            return Ok(response);
        }

        debug!("Tracker rejected credentials, refreshing and retrying once");
        let token = self.credentials.refresh().await?;
        let response = build(&self.http)
            .header("Authorization", format!("Bearer {token}"))
            .header("Accept", "application/vnd.github+json")
            .header("User-Agent", "canopy-processor")
            .send()
            .await?;
        Ok(response)
    }

    async fn open_issue_exists(&self, token: &str) -> Result<bool, ReportError> {
        let url = self.issues_url();
        let response = self
            .authorized(|http| {
                http.get(&url)
                    .query(&[("state", "open"), ("per_page", "100")])
            })
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(ReportError::Api {
                status: status.as_u16(),
                body: response.text().await.unwrap_or_default(),
            });
        }

        let issues: Vec<IssueSummary> = response.json().await?;
        Ok(issues.iter().any(|i| i.title.contains(token)))
    }

    async fn create_issue(&self, failure: &FailureReport) -> Result<u64, ReportError> {
        let url = self.issues_url();
        let issue = NewIssue {
            title: failure.title(),
            body: failure.body(),
            labels: &["processing-failure", "automated"],
        };

        let response = self
            .authorized(|http| http.post(&url).json(&issue))
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(ReportError::Api {
                status: status.as_u16(),
                body: response.text().await.unwrap_or_default(),
            });
        }

        let created: IssueSummary = response.json().await?;
        Ok(created.number)
    }
}

#[async_trait]
impl FailureReporter for TrackerReporter {
    async fn report(&self, failure: &FailureReport) -> Result<(), ReportError> {
        let token = failure.title_token();
        if self.open_issue_exists(&token).await? {
            info!(
                dataset_id = failure.dataset_id,
                "Open tracker issue already exists, skipping report"
            );
            return Ok(());
        }

        let number = self.create_issue(failure).await?;
        info!(
            dataset_id = failure.dataset_id,
            stage = %failure.stage,
            issue = number,
            "Filed tracker issue for stage failure"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::LogLevel;
    use chrono::Utc;

    fn report() -> FailureReport {
        FailureReport {
            dataset_id: 42,
            stage: StageKind::Metadata,
            message: "exit code 137".to_string(),
            recent_errors: vec![LogEntry {
                dataset_id: 42,
                level: LogLevel::Error,
                message: "oom killed".to_string(),
                created_at: Utc::now(),
            }],
        }
    }

    #[test]
    fn test_title_carries_dataset_token() {
        let r = report();
        assert!(r.title().contains("[dataset-42]"));
        assert!(r.title().contains("metadata"));
    }

    #[test]
    fn test_body_includes_failure_and_recent_errors() {
        let body = report().body();
        assert!(body.contains("exit code 137"));
        assert!(body.contains("oom killed"));
    }

    #[test]
    fn test_token_is_discriminating() {
        // dataset 4 must not match an issue for dataset 42.
        let r4 = FailureReport {
            dataset_id: 4,
            ..report()
        };
        assert!(!report().title().contains(&r4.title_token()));
    }
}
