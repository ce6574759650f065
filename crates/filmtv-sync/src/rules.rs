use std::path::Path;

use filmtv_core::BroadcastEventDraft;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum RulesError {
    #[error("reading {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing title rules: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("invalid title pattern {pattern:?}: {source}")]
    Pattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },
}

#[derive(Debug, Clone, Deserialize)]
struct TitleRulesFile {
    #[allow(dead_code)]
    version: u32,
    #[serde(default)]
    ignore: Vec<String>,
    #[serde(default)]
    transform: Vec<TransformRuleSpec>,
}

#[derive(Debug, Clone, Deserialize)]
struct TransformRuleSpec {
    pattern: String,
    #[serde(default = "default_replacement")]
    replacement: String,
}

fn default_replacement() -> String {
    "$1".to_string()
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RulesOutcome {
    pub ignored: usize,
    pub transformed: usize,
}

/// Title post-filters applied to freshly fetched events before they are
/// reconciled: ignore patterns drop the event, transform patterns rewrite
/// its title.
#[derive(Debug, Clone, Default)]
pub struct TitleRules {
    ignore: Vec<Regex>,
    transform: Vec<(Regex, String)>,
}

impl TitleRules {
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, RulesError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| RulesError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_yaml_str(&text)
    }

    pub fn from_yaml_str(text: &str) -> Result<Self, RulesError> {
        let file: TitleRulesFile = serde_yaml::from_str(text)?;
        let compile = |pattern: &str| {
            Regex::new(pattern).map_err(|source| RulesError::Pattern {
                pattern: pattern.to_string(),
                source,
            })
        };
        Ok(Self {
            ignore: file
                .ignore
                .iter()
                .map(|p| compile(p.as_str()))
                .collect::<Result<_, _>>()?,
            transform: file
                .transform
                .iter()
                .map(|rule| Ok((compile(rule.pattern.as_str())?, rule.replacement.clone())))
                .collect::<Result<_, RulesError>>()?,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.ignore.is_empty() && self.transform.is_empty()
    }

    pub fn apply(
        &self,
        events: Vec<BroadcastEventDraft>,
    ) -> (Vec<BroadcastEventDraft>, RulesOutcome) {
        let mut outcome = RulesOutcome::default();
        let mut kept = Vec::with_capacity(events.len());

        for mut event in events {
            if self.ignore.iter().any(|re| re.is_match(&event.title)) {
                debug!(id = event.id, title = %event.title, "ignoring title");
                outcome.ignored += 1;
                continue;
            }

            let mut changed = false;
            for (re, replacement) in &self.transform {
                if re.is_match(&event.title) {
                    let rewritten = re.replace_all(&event.title, replacement.as_str()).into_owned();
                    changed |= rewritten != event.title;
                    event.title = rewritten;
                }
            }
            if changed {
                debug!(id = event.id, title = %event.title, "rewrote title");
                outcome.transformed += 1;
            }
            kept.push(event);
        }

        (kept, outcome)
    }
}
