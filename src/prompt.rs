//! Artifact path derivation and the instruction payload fed to the runner.
//!
//! The artifact path is derived once per pick and handed to both the
//! instructions and the validator, so a run crossing midnight still
//! validates the file it asked for.

use std::path::PathBuf;

use chrono::NaiveDate;

use crate::model::QueueItem;

/// Directory (relative to the workspace root) research artifacts land in.
pub const RESEARCH_DIR: &str = "research";

/// Companion log the runner appends one line to per session.
pub const SESSION_LOG: &str = "sessions.md";

/// Lowercase, runs of anything outside `[a-z0-9]` collapsed to one `-`,
/// no leading or trailing `-`.
pub fn slug(topic: &str) -> String {
    let mut out = String::with_capacity(topic.len());
    let mut pending_dash = false;
    for c in topic.chars().flat_map(char::to_lowercase) {
        if c.is_ascii_lowercase() || c.is_ascii_digit() {
            if pending_dash && !out.is_empty() {
                out.push('-');
            }
            pending_dash = false;
            out.push(c);
        } else {
            pending_dash = true;
        }
    }
    out
}

/// `research/{date}-{slug}.md`, relative to the workspace root.
pub fn artifact_path(item: &QueueItem, date: NaiveDate) -> PathBuf {
    PathBuf::from(RESEARCH_DIR).join(format!("{}-{}.md", date.format("%Y-%m-%d"), slug(&item.topic)))
}

/// Build the instructions for one research session.
pub fn build_instructions(item: &QueueItem, artifact: &std::path::Path, date: NaiveDate) -> String {
    let today = date.format("%Y-%m-%d");
    let output = artifact.display();
    let tags = item.tags.join(", ");
    let search_terms = if item.tags.is_empty() {
        first_words(&item.topic, 3)
    } else {
        item.tags.iter().take(3).cloned().collect::<Vec<_>>().join(" ")
    };

    format!(
        r#"You are conducting an automated research session. Follow the protocol exactly.

## Your Task

Research topic: "{topic}"
Description: {description}
Tags: {tags}
Output file: {output}
Today's date: {today}

## Session Protocol

### Step 1: Orient
1. Read the project conventions file and `{session_log}` to see what has been explored recently.
2. Look for existing principles and prior research related to: {search_terms}
3. Note what already exists so you don't duplicate it.

### Step 2: Research
1. Research the topic on the web using authoritative sources (official docs, recognized experts, reputable engineering blogs).
2. Aim for at least 5 distinct sources.
3. Cover current best practices, trade-offs, decision frameworks, concrete examples, and emerging trends.

### Step 3: Write Research File
Write `{output}` in exactly this format:

```markdown
---
date: {today}
topic: {topic}
status: complete
tags: [{tags}]
---

# {topic}

## Context
Why this was investigated. Reference the description: "{description}"

## Findings
The core content, in subsections, with inline source links (aim for 5000+ characters).

## Open Questions
What remains unclear or worth further investigation.

## Extracted Principles
Principles distilled from this research.
```

### Step 4: Update Sessions Log
Append a single line to `{session_log}`:
`{today} | [automated] {topic} | {output} | <brief summary of key findings>`

### Step 5: Commit
Stage the files you created or modified and run `git commit -m "[automated] Research: {topic}"`.

## Rules
- Do NOT modify the project conventions file or anything under automation/.
- Do NOT run git push; the worker publishes after validating your output.
- Stay on topic and cite sources inline."#,
        topic = item.topic,
        description = item.description,
        session_log = SESSION_LOG,
    )
}

fn first_words(s: &str, n: usize) -> String {
    s.split_whitespace().take(n).collect::<Vec<_>>().join(" ")
}
