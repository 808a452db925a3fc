//! Jurisdictional context supplied by the user.
//!
//! Every field is optional and unknown keys are preserved. Input that
//! fails a strict typed check is relocated into the free-text notes
//! field rather than discarded.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Result of a strict field assignment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldOutcome {
    /// The value parsed and was stored in the typed field.
    Accepted,
    /// The value failed the typed check and was appended to `notes`.
    Relocated,
}

/// User-supplied local context for policy adaptation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JurisdictionContext {
    pub jurisdiction: Option<String>,
    pub population: Option<String>,
    pub economic_context: Option<String>,
    pub existing_policies: Option<String>,
    pub political_landscape: Option<String>,
    pub budget: Option<String>,
    pub local_challenges: Option<String>,
    pub stakeholders: Option<String>,
    pub demographics: Option<String>,
    pub prior_attempts: Option<String>,
    pub budget_cycle: Option<String>,
    pub election_timeline: Option<String>,

    /// Whether the user wants per-stakeholder detail in comparisons.
    pub stakeholder_detail: Option<bool>,

    /// Free-text notes. Also absorbs any input that failed a strict
    /// typed field so that context is never lost.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub notes: String,

    /// Unknown keys, preserved verbatim.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, String>,
}

impl JurisdictionContext {
    /// Set the yes/no stakeholder-detail flag from raw user input.
    ///
    /// Anything that does not parse as yes/no lands in `notes`.
    pub fn set_stakeholder_detail(&mut self, raw: &str) -> FieldOutcome {
        match parse_yes_no(raw) {
            Some(value) => {
                self.stakeholder_detail = Some(value);
                FieldOutcome::Accepted
            }
            None => {
                self.absorb("stakeholder detail", raw);
                FieldOutcome::Relocated
            }
        }
    }

    /// Store an unrecognized key without dropping it.
    pub fn set_extra(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.extra.insert(key.into(), value.into());
    }

    /// Append a labelled fragment to the free-text notes.
    pub fn absorb(&mut self, label: &str, raw: &str) {
        if !self.notes.is_empty() {
            self.notes.push('\n');
        }
        self.notes.push_str(label);
        self.notes.push_str(": ");
        self.notes.push_str(raw.trim());
    }

    /// Number of populated fields, counting notes and extras.
    pub fn field_count(&self) -> usize {
        let named = [
            &self.jurisdiction,
            &self.population,
            &self.economic_context,
            &self.existing_policies,
            &self.political_landscape,
            &self.budget,
            &self.local_challenges,
            &self.stakeholders,
            &self.demographics,
            &self.prior_attempts,
            &self.budget_cycle,
            &self.election_timeline,
        ];
        let mut count = named.iter().filter(|f| f.is_some()).count();
        if self.stakeholder_detail.is_some() {
            count += 1;
        }
        if !self.notes.is_empty() {
            count += 1;
        }
        count + self.extra.len()
    }

    pub fn is_empty(&self) -> bool {
        self.field_count() == 0
    }

    /// Render the context as labelled lines for prompt construction.
    pub fn to_prompt_lines(&self) -> Vec<String> {
        let mut lines = Vec::new();
        let mut push = |label: &str, value: &Option<String>| {
            if let Some(v) = value {
                lines.push(format!("- {}: {}", label, v));
            }
        };
        push("Jurisdiction", &self.jurisdiction);
        push("Population", &self.population);
        push("Economic context", &self.economic_context);
        push("Existing policies", &self.existing_policies);
        push("Political landscape", &self.political_landscape);
        push("Budget", &self.budget);
        push("Local challenges", &self.local_challenges);
        push("Key stakeholders", &self.stakeholders);
        push("Demographics", &self.demographics);
        push("Prior attempts", &self.prior_attempts);
        push("Budget cycle", &self.budget_cycle);
        push("Election timeline", &self.election_timeline);
        for (key, value) in &self.extra {
            lines.push(format!("- {}: {}", key, value));
        }
        if !self.notes.is_empty() {
            lines.push(format!("- Notes: {}", self.notes));
        }
        lines
    }
}

fn parse_yes_no(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "y" | "yes" | "true" => Some(true),
        "n" | "no" | "false" => Some(false),
        _ => None,
    }
}
