use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// One replayable browser action. Stored as JSON inside a playbook row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Action {
    Navigate {
        url: String,
    },
    /// Click the first selector that is visible, trying `fallbacks` in order.
    Click {
        selector: String,
        #[serde(default)]
        fallbacks: Vec<String>,
        #[serde(default)]
        optional: bool,
    },
    /// Fill a field; `value` may contain `{{var}}` placeholders. Skipped when
    /// the resolved value is empty.
    Fill {
        selector: String,
        value: String,
        #[serde(default)]
        optional: bool,
    },
    /// Fixed pause plus up to `jitter_ms` of random extra.
    Wait {
        ms: u64,
        #[serde(default)]
        jitter_ms: u64,
    },
    WaitForVisible {
        selector: String,
        timeout_ms: u64,
        #[serde(default)]
        optional: bool,
    },
    /// Click whichever transient overlay close button is visible, if any.
    /// Never fails.
    DismissOverlays {
        selectors: Vec<String>,
    },
    /// Checkpoint on the current URL. With `fail_if = false` the step fails
    /// when the URL does not contain `contains`; with `fail_if = true` it
    /// fails when it does.
    AssertUrl {
        contains: String,
        #[serde(default)]
        fail_if: bool,
        message: String,
    },
    /// Checkpoint on visible page text, matched as a case-insensitive regex.
    /// Polarity as for `AssertUrl`.
    AssertText {
        pattern: String,
        #[serde(default)]
        fail_if: bool,
        message: String,
    },
}

impl Action {
    pub fn is_optional(&self) -> bool {
        match self {
            Action::Click { optional, .. }
            | Action::Fill { optional, .. }
            | Action::WaitForVisible { optional, .. } => *optional,
            Action::DismissOverlays { .. } | Action::Wait { .. } => true,
            Action::Navigate { .. } | Action::AssertUrl { .. } | Action::AssertText { .. } => false,
        }
    }

    /// Short human-readable label for step logs. Never includes fill values.
    pub fn describe(&self) -> String {
        match self {
            Action::Navigate { url } => format!("navigate {url}"),
            Action::Click { selector, .. } => format!("click {selector}"),
            Action::Fill { selector, .. } => format!("fill {selector}"),
            Action::Wait { ms, jitter_ms } => format!("wait {ms}ms(+{jitter_ms})"),
            Action::WaitForVisible { selector, .. } => format!("wait_for {selector}"),
            Action::DismissOverlays { selectors } => format!("dismiss_overlays x{}", selectors.len()),
            Action::AssertUrl { contains, .. } => format!("assert_url {contains}"),
            Action::AssertText { pattern, .. } => format!("assert_text /{pattern}/"),
        }
    }
}

/// Values substituted into `{{name}}` placeholders during replay.
#[derive(Clone, Default)]
pub struct TemplateVars {
    values: HashMap<String, String>,
}

impl TemplateVars {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, name: &str, value: impl Into<String>) -> &mut Self {
        self.values.insert(name.to_string(), value.into());
        self
    }

    /// Replace every `{{name}}`. Unknown names resolve to the empty string so
    /// a template field with no value is skipped rather than typed literally.
    pub fn render(&self, template: &str) -> String {
        let mut out = String::with_capacity(template.len());
        let mut rest = template;
        while let Some(start) = rest.find("{{") {
            out.push_str(&rest[..start]);
            let after = &rest[start + 2..];
            match after.find("}}") {
                Some(end) => {
                    let name = after[..end].trim();
                    if let Some(v) = self.values.get(name) {
                        out.push_str(v);
                    }
                    rest = &after[end + 2..];
                }
                None => {
                    out.push_str(&rest[start..]);
                    rest = "";
                }
            }
        }
        out.push_str(rest);
        out
    }
}

// Values are credentials; keep them out of debug output.
impl std::fmt::Debug for TemplateVars {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut keys: Vec<&String> = self.values.keys().collect();
        keys.sort();
        f.debug_struct("TemplateVars").field("keys", &keys).finish()
    }
}
