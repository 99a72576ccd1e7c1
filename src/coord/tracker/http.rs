//! HTTP backend: `POST`/`GET {base}/tickets/{id}/comments`.

use std::time::Duration;

use serde::Deserialize;
use tracing::debug;

use super::{TicketTracker, check_next_seq, last_seq};
use crate::coord::error::{CoordError, Result};
use crate::coord::ledger::LedgerEntry;
use crate::coord::task::validate_id;

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum EntriesResponse {
    Wrapped { entries: Vec<LedgerEntry> },
    Bare(Vec<LedgerEntry>),
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum TicketsResponse {
    Wrapped { tickets: Vec<String> },
    Bare(Vec<String>),
}

pub struct HttpTracker {
    base: String,
    token: Option<String>,
    agent: ureq::Agent,
}

impl std::fmt::Debug for HttpTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpTracker")
            .field("base", &self.base)
            .field("token", &self.token.as_ref().map(|_| "<redacted>"))
            .finish_non_exhaustive()
    }
}

impl HttpTracker {
    pub fn new(base: &str, token: Option<String>, timeout_secs: u64) -> Self {
        let agent: ureq::Agent = ureq::Agent::config_builder()
            .timeout_global(Some(Duration::from_secs(timeout_secs)))
            .build()
            .into();
        Self {
            base: base.trim_end_matches('/').to_string(),
            token,
            agent,
        }
    }

    fn comments_url(&self, task_id: &str) -> String {
        format!("{}/tickets/{task_id}/comments", self.base)
    }

    fn auth(&self) -> Option<String> {
        self.token.as_ref().map(|t| format!("Bearer {t}"))
    }

    fn get(&self, url: &str) -> Result<Option<String>> {
        let mut request = self.agent.get(url).header("Accept", "application/json");
        if let Some(auth) = self.auth() {
            request = request.header("Authorization", &auth);
        }
        match request.call() {
            Ok(response) => response
                .into_body()
                .read_to_string()
                .map(Some)
                .map_err(|e| CoordError::Tracker(format!("GET {url}: {e}"))),
            Err(ureq::Error::StatusCode(404)) => Ok(None),
            Err(e) => Err(CoordError::Tracker(format!("GET {url}: {e}"))),
        }
    }
}

impl TicketTracker for HttpTracker {
    fn name(&self) -> &'static str {
        "http"
    }

    fn append(&self, entry: &LedgerEntry) -> Result<()> {
        validate_id(&entry.task_id)?;
        check_next_seq(entry, last_seq(&self.entries(&entry.task_id)?))?;
        let url = self.comments_url(&entry.task_id);
        let body = serde_json::to_string(entry)?;
        let mut request = self
            .agent
            .post(&url)
            .header("Content-Type", "application/json");
        if let Some(auth) = self.auth() {
            request = request.header("Authorization", &auth);
        }
        request
            .send(body.as_str())
            .map_err(|e| CoordError::Tracker(format!("POST {url}: {e}")))?;
        debug!(task = %entry.task_id, seq = entry.seq, "ledger entry posted");
        Ok(())
    }

    fn entries(&self, task_id: &str) -> Result<Vec<LedgerEntry>> {
        validate_id(task_id)?;
        let url = self.comments_url(task_id);
        let Some(body) = self.get(&url)? else {
            return Ok(Vec::new());
        };
        let parsed: EntriesResponse = serde_json::from_str(&body)
            .map_err(|e| CoordError::Tracker(format!("GET {url}: unexpected body: {e}")))?;
        Ok(match parsed {
            EntriesResponse::Wrapped { entries } | EntriesResponse::Bare(entries) => entries,
        })
    }

    fn task_ids(&self) -> Result<Vec<String>> {
        let url = format!("{}/tickets", self.base);
        let Some(body) = self.get(&url)? else {
            return Err(CoordError::Unsupported("listing tasks"));
        };
        let parsed: TicketsResponse = serde_json::from_str(&body)
            .map_err(|e| CoordError::Tracker(format!("GET {url}: unexpected body: {e}")))?;
        Ok(match parsed {
            TicketsResponse::Wrapped { tickets } | TicketsResponse::Bare(tickets) => tickets,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn urls_strip_trailing_slash() {
        let t = HttpTracker::new("https://tickets.example.com/api/", None, 5);
        assert_eq!(
            t.comments_url("tk-1"),
            "https://tickets.example.com/api/tickets/tk-1/comments"
        );
    }

    #[test]
    fn debug_redacts_token() {
        let t = HttpTracker::new("http://x", Some("s3cret".into()), 5);
        let dbg = format!("{t:?}");
        assert!(!dbg.contains("s3cret"));
        assert!(dbg.contains("<redacted>"));
    }

    #[test]
    fn both_response_shapes_parse() {
        let wrapped = r#"{"entries": []}"#;
        assert!(matches!(
            serde_json::from_str::<EntriesResponse>(wrapped).unwrap(),
            EntriesResponse::Wrapped { .. }
        ));
        let bare = r#"["tk-1", "tk-2"]"#;
        let TicketsResponse::Bare(ids) = serde_json::from_str::<TicketsResponse>(bare).unwrap() else {
            panic!("expected bare list");
        };
        assert_eq!(ids.len(), 2);
    }
}
