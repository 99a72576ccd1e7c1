//! Bones backend: ledger entries as comments on a bone, via the `bn` CLI.
//!
//! Each entry is one comment whose body is `relay:v1 <json>`. Comments
//! without the marker belong to humans and other tools and are ignored.

use std::time::Duration;

use serde::Deserialize;
use tracing::{debug, warn};

use super::{TicketTracker, check_next_seq, last_seq};
use crate::coord::error::{CoordError, Result};
use crate::coord::ledger::LedgerEntry;
use crate::coord::task::validate_id;
use crate::subprocess::Tool;

pub const COMMENT_PREFIX: &str = "relay:v1 ";

#[derive(Debug, Clone, thiserror::Error)]
pub enum AdapterError {
    #[error("failed to parse {tool} output: {detail}")]
    ParseFailed { tool: &'static str, detail: String },
}

/// One comment from `bn comments --format json`. Older `bn` builds call the
/// body `text` or `content`.
#[derive(Debug, Clone, Deserialize)]
struct BoneComment {
    #[serde(default, alias = "text", alias = "content")]
    body: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum CommentsResponse {
    Wrapped {
        #[serde(default)]
        comments: Vec<BoneComment>,
    },
    Bare(Vec<BoneComment>),
}

/// Parse `bn comments <id> --format json` into comment bodies.
pub fn parse_comments(json: &str) -> std::result::Result<Vec<String>, AdapterError> {
    if json.trim().is_empty() {
        return Ok(Vec::new());
    }
    let response: CommentsResponse =
        serde_json::from_str(json).map_err(|e| AdapterError::ParseFailed {
            tool: "bn comments",
            detail: e.to_string(),
        })?;
    let comments = match response {
        CommentsResponse::Wrapped { comments } | CommentsResponse::Bare(comments) => comments,
    };
    Ok(comments.into_iter().map(|c| c.body).collect())
}

#[derive(Debug, Clone)]
pub struct BonesTracker {
    workspace: Option<String>,
    timeout: Duration,
}

impl BonesTracker {
    pub fn new(workspace: Option<String>, timeout_secs: u64) -> Self {
        Self {
            workspace,
            timeout: Duration::from_secs(timeout_secs),
        }
    }

    fn bn(&self, args: &[&str]) -> Result<Tool> {
        let tool = Tool::new("bn").args(args).timeout(self.timeout);
        match &self.workspace {
            Some(ws) => tool.in_workspace(ws).map_err(|e| CoordError::Tracker(format!("{e:#}"))),
            None => Ok(tool),
        }
    }
}

impl TicketTracker for BonesTracker {
    fn name(&self) -> &'static str {
        "bones"
    }

    fn append(&self, entry: &LedgerEntry) -> Result<()> {
        validate_id(&entry.task_id)?;
        // bn has no conditional append; replay drops a duplicate that slips through.
        check_next_seq(entry, last_seq(&self.entries(&entry.task_id)?))?;
        let body = format!("{COMMENT_PREFIX}{}", serde_json::to_string(entry)?);
        self.bn(&["bone", "comment", "add", &entry.task_id, &body])?
            .run_ok()
            .map_err(|e| CoordError::Tracker(format!("{e:#}")))?;
        debug!(bone = %entry.task_id, seq = entry.seq, "ledger comment added");
        Ok(())
    }

    fn entries(&self, task_id: &str) -> Result<Vec<LedgerEntry>> {
        validate_id(task_id)?;
        let output = self
            .bn(&["comments", task_id, "--format", "json"])?
            .run_ok()
            .map_err(|e| CoordError::Tracker(format!("{e:#}")))?;
        let bodies = parse_comments(&output.stdout).map_err(|e| CoordError::Tracker(e.to_string()))?;
        Ok(entries_from_bodies(task_id, &bodies))
    }
}

fn entries_from_bodies(task_id: &str, bodies: &[String]) -> Vec<LedgerEntry> {
    bodies
        .iter()
        .filter_map(|body| body.trim_start().strip_prefix(COMMENT_PREFIX))
        .filter_map(|json| match serde_json::from_str::<LedgerEntry>(json) {
            Ok(entry) if entry.task_id == task_id => Some(entry),
            Ok(entry) => {
                warn!(bone = task_id, found = %entry.task_id, "ledger comment for another task ignored");
                None
            }
            Err(e) => {
                warn!(bone = task_id, error = %e, "malformed ledger comment ignored");
                None
            }
        })
        .collect()
}
