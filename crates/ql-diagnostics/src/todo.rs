//! TODO.md inventory and triage.
//!
//! TODO.md is human-edited; the engine performs conservative line-level
//! edits only. It owns a small set of subsections:
//! `## Auto-Detected Issues (from troubleshooting log)` (synthesized
//! entries, one per app per day), `## Next Session` and `## Parking Lot`
//! (triage targets). `## Support Codes` and `## Auto-Detected` sections
//! stop normal item counting.

use parking_lot::Mutex;
use ql_common::Result;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// One checklist item surfaced to the triage UI.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TodoItem {
    pub text: String,
    pub priority: String,
    pub section: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub marked_for_implement: bool,
    pub marked_parking: bool,
    pub is_auto_detected: bool,
    pub original_text: String,
}

/// Full inventory of TODO.md.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TodoInventory {
    pub count: usize,
    pub items: Vec<String>,
    pub items_with_priority: Vec<TodoItem>,
}

/// Requested disposition for one item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriageActionKind {
    Parking,
    Implement,
    Dontdo,
}

/// One triage instruction from the client.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TriageAction {
    pub text: String,
    #[serde(default)]
    pub priority: Option<String>,
    pub action: TriageActionKind,
}

/// Item removed by a `dontdo` triage; the caller records the resolution.
#[derive(Debug, Clone)]
pub struct CancelledItem {
    pub text: String,
    pub was_auto_detected: bool,
}

/// Counts returned to the client, plus the cancelled items.
#[derive(Debug, Default)]
pub struct TriageOutcome {
    pub parking: u32,
    pub implement: u32,
    pub dontdo: u32,
    pub cancelled: Vec<CancelledItem>,
}

/// TODO.md accessor.
pub struct TodoFile {
    path: PathBuf,
    edit_lock: Mutex<()>,
}

const AUTO_SECTION: &str = "## Auto-Detected Issues (from troubleshooting log)";

impl TodoFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            edit_lock: Mutex::new(()),
        }
    }

    fn read_content(&self) -> Result<String> {
        match std::fs::read_to_string(&self.path) {
            Ok(content) => Ok(content),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(String::new()),
            Err(e) => Err(e.into()),
        }
    }

    fn write_content(&self, content: &str) -> Result<()> {
        let temp = self.path.with_extension("md.tmp");
        std::fs::write(&temp, content)?;
        std::fs::rename(&temp, &self.path)?;
        Ok(())
    }

    /// Scan TODO.md into an inventory.
    pub fn inventory(&self) -> Result<TodoInventory> {
        let content = self.read_content()?;
        let lines: Vec<&str> = content.lines().collect();

        let mut items: Vec<TodoItem> = Vec::new();
        let mut section = String::new();
        let mut counting = true;
        let mut in_auto = false;

        for (idx, line) in lines.iter().enumerate() {
            if let Some(heading) = line.strip_prefix("## ") {
                section = heading.trim().to_string();
                in_auto = section.starts_with("Auto-Detected");
                counting = !(in_auto || section.starts_with("Support Codes"));
                continue;
            }

            if in_auto {
                if let Some(header) = line.strip_prefix("### ") {
                    items.push(TodoItem {
                        text: format!("[Auto] {}", header.trim()),
                        priority: "High".to_string(),
                        section: section.clone(),
                        description: None,
                        marked_for_implement: false,
                        marked_parking: false,
                        is_auto_detected: true,
                        original_text: line.to_string(),
                    });
                }
                continue;
            }

            if !counting {
                continue;
            }

            if let Some(text) = unchecked_item_text(line) {
                let description = lines
                    .get(idx + 1)
                    .and_then(|next| next.trim_start().strip_prefix('>'))
                    .map(|d| d.trim().to_string());

                let priority = match section.split_whitespace().next() {
                    Some("High") => "High",
                    Some("Low") => "Low",
                    _ => "Medium",
                };

                items.push(TodoItem {
                    text: text.to_string(),
                    priority: priority.to_string(),
                    section: section.clone(),
                    description,
                    marked_for_implement: section.starts_with("Next Session"),
                    marked_parking: section.starts_with("Parking Lot"),
                    is_auto_detected: false,
                    original_text: line.to_string(),
                });
            }
        }

        Ok(TodoInventory {
            count: items.len(),
            items: items.iter().map(|i| i.text.clone()).collect(),
            items_with_priority: items,
        })
    }

    /// Insert a synthesized entry for `app` dated `date` (YYYY-MM-DD).
    ///
    /// Idempotent: at most one entry matching `[date] app` per day. Returns
    /// whether a new entry was written.
    pub fn insert_auto_todo(
        &self,
        app: &str,
        date: &str,
        error_type: &str,
        recent_failures: u32,
    ) -> Result<bool> {
        let _guard = self.edit_lock.lock();
        let content = self.read_content()?;

        let marker = format!("[{}] {}", date, app);
        if content.contains(&marker) {
            return Ok(false);
        }

        let mut lines: Vec<String> = content.lines().map(str::to_string).collect();
        let heading_idx = match lines.iter().position(|l| l.starts_with("## Auto-Detected")) {
            Some(idx) => idx,
            None => {
                // Create the section before Support Codes, else at the end.
                let insert_at = lines
                    .iter()
                    .position(|l| l.starts_with("## Support Codes"))
                    .unwrap_or(lines.len());
                lines.insert(insert_at, String::new());
                lines.insert(insert_at + 1, AUTO_SECTION.to_string());
                insert_at + 1
            }
        };

        let block = vec![
            String::new(),
            format!("### {} recurring {}", marker, error_type),
            format!(
                "- [ ] Investigate {}: {} {} failure(s) in the last 7 days",
                app, recent_failures, error_type
            ),
        ];
        for (offset, line) in block.into_iter().enumerate() {
            lines.insert(heading_idx + 1 + offset, line);
        }

        self.write_content(&(lines.join("\n") + "\n"))?;
        Ok(true)
    }

    /// Apply triage actions. `dontdo` items are removed and returned for
    /// resolution recording by the caller.
    pub fn apply_triage(&self, actions: &[TriageAction]) -> Result<TriageOutcome> {
        let _guard = self.edit_lock.lock();
        let mut lines: Vec<String> = self.read_content()?.lines().map(str::to_string).collect();
        let mut outcome = TriageOutcome::default();

        for action in actions {
            let Some((start, end)) = locate_block(&lines, &action.text) else {
                continue;
            };
            lines.drain(start..end);

            match action.action {
                TriageActionKind::Parking => {
                    insert_under_parking(&mut lines, &action.text);
                    outcome.parking += 1;
                }
                TriageActionKind::Implement => {
                    insert_under_next_session(&mut lines, &action.text);
                    outcome.implement += 1;
                }
                TriageActionKind::Dontdo => {
                    outcome.dontdo += 1;
                    outcome.cancelled.push(CancelledItem {
                        text: action.text.clone(),
                        was_auto_detected: action.text.starts_with("[Auto] "),
                    });
                }
            }
        }

        self.write_content(&(lines.join("\n") + "\n"))?;
        Ok(outcome)
    }

    /// Delete the first unchecked item whose text contains `needle`.
    /// Returns the removed item text, if any.
    pub fn remove_first_matching(&self, needle: &str) -> Result<Option<String>> {
        let _guard = self.edit_lock.lock();
        let mut lines: Vec<String> = self.read_content()?.lines().map(str::to_string).collect();

        let Some(idx) = lines
            .iter()
            .position(|l| unchecked_item_text(l).map_or(false, |t| t.contains(needle)))
        else {
            return Ok(None);
        };

        let removed = unchecked_item_text(&lines[idx]).unwrap_or_default().to_string();
        let mut end = idx + 1;
        while end < lines.len() && lines[end].trim_start().starts_with('>') {
            end += 1;
        }
        lines.drain(idx..end);

        self.write_content(&(lines.join("\n") + "\n"))?;
        Ok(Some(removed))
    }
}

fn unchecked_item_text(line: &str) -> Option<&str> {
    line.trim_start().strip_prefix("- [ ]").map(str::trim)
}

/// Find the line range of the item named by a triage action.
///
/// `[Auto] `-prefixed texts address a `### ` header and its contiguous
/// block (up to the next `## ` or `### ` heading); everything else
/// addresses the `- [ ]` line containing the text plus its description
/// lines.
fn locate_block(lines: &[String], text: &str) -> Option<(usize, usize)> {
    if let Some(header) = text.strip_prefix("[Auto] ") {
        let start = lines
            .iter()
            .position(|l| l.starts_with("### ") && l.contains(header))?;
        let end = lines[start + 1..]
            .iter()
            .position(|l| l.starts_with("## ") || l.starts_with("### "))
            .map(|offset| start + 1 + offset)
            .unwrap_or(lines.len());
        Some((start, end))
    } else {
        let start = lines
            .iter()
            .position(|l| unchecked_item_text(l).map_or(false, |t| t.contains(text)))?;
        let mut end = start + 1;
        while end < lines.len() && lines[end].trim_start().starts_with('>') {
            end += 1;
        }
        Some((start, end))
    }
}

fn insert_under_parking(lines: &mut Vec<String>, text: &str) {
    let heading_idx = match lines.iter().position(|l| l.starts_with("## Parking Lot")) {
        Some(idx) => idx,
        None => {
            let insert_at = lines
                .iter()
                .position(|l| l.starts_with("## Support Codes"))
                .unwrap_or(lines.len());
            lines.insert(insert_at, String::new());
            lines.insert(insert_at + 1, "## Parking Lot".to_string());
            insert_at + 1
        }
    };
    lines.insert(heading_idx + 1, format!("- [ ] {}", text));
}

fn insert_under_next_session(lines: &mut Vec<String>, text: &str) {
    let heading_idx = match lines.iter().position(|l| l.starts_with("## Next Session")) {
        Some(idx) => idx,
        None => {
            let insert_at = lines
                .iter()
                .position(|l| l.starts_with("## "))
                .unwrap_or(0);
            lines.insert(insert_at, "## Next Session".to_string());
            lines.insert(insert_at + 1, String::new());
            insert_at
        }
    };
    // New implement items go to the top of the section.
    lines.insert(heading_idx + 1, format!("- [ ] {}", text));
}
