use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

use crate::error::{PatchError, Result};

pub const MODIFIED_MESSAGE: &str = "Modified";
pub const UNEXPECTED_MESSAGE: &str = "Unexpected file";
pub const ALREADY_EXISTS_MESSAGE: &str = "Already exists";
pub const ABSENT_MESSAGE: &str = "Absent";
pub const ACCESS_DENIED_MESSAGE: &str = "Access denied";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Kind {
    Error,
    Conflict,
}

/// The operation a result is reported against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Action {
    Create,
    Update,
    Delete,
    Validate,
}

/// A resolution the caller may pick for a result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Resolution {
    /// Stop the whole patch before anything is touched.
    Abort,
    /// Skip the action, leaving the path as it is.
    Ignore,
    /// Keep the local content; the action is skipped.
    Keep,
    /// Write the patch content over whatever is there.
    Overwrite,
    /// Remove the path as the patch says.
    Delete,
}

impl Resolution {
    /// Whether choosing this option means the action does not run.
    pub fn skips_action(self) -> bool {
        matches!(self, Resolution::Ignore | Resolution::Keep)
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Resolution::Abort => "abort",
            Resolution::Ignore => "ignore",
            Resolution::Keep => "keep",
            Resolution::Overwrite => "overwrite",
            Resolution::Delete => "delete",
        };
        f.write_str(name)
    }
}

impl std::str::FromStr for Resolution {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "abort" => Ok(Resolution::Abort),
            "ignore" => Ok(Resolution::Ignore),
            "keep" => Ok(Resolution::Keep),
            "overwrite" => Ok(Resolution::Overwrite),
            "delete" => Ok(Resolution::Delete),
            other => Err(format!("unknown resolution: {other}")),
        }
    }
}

/// One detected problem with applying a single action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationResult {
    pub kind: Kind,
    pub path: String,
    pub action: Action,
    pub message: String,
    pub options: Vec<Resolution>,
}

impl ValidationResult {
    pub fn new(
        kind: Kind,
        path: impl Into<String>,
        action: Action,
        message: impl Into<String>,
        options: Vec<Resolution>,
    ) -> Self {
        debug_assert!(!options.is_empty(), "a result must offer at least one option");
        ValidationResult {
            kind,
            path: path.into(),
            action,
            message: message.into(),
            options,
        }
    }

    pub fn offers(&self, option: Resolution) -> bool {
        self.options.contains(&option)
    }

    /// The option used when the caller accepts defaults.
    pub fn default_option(&self) -> Resolution {
        self.options.first().copied().unwrap_or(Resolution::Abort)
    }
}

impl fmt::Display for ValidationResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let options: Vec<String> = self.options.iter().map(ToString::to_string).collect();
        write!(
            f,
            "{:?} {:?} {}: {} [{}]",
            self.kind,
            self.action,
            self.path,
            self.message,
            options.join(", ")
        )
    }
}

/// Options for a conflict where the patch wants to `primary` the path.
pub(crate) fn conflict_options(primary: Resolution, strict: bool) -> Vec<Resolution> {
    if strict {
        vec![primary]
    } else {
        vec![primary, Resolution::Keep]
    }
}

/// Options for an error the patch cannot work around.
pub(crate) fn error_options(strict: bool) -> Vec<Resolution> {
    if strict {
        vec![Resolution::Abort]
    } else {
        vec![Resolution::Ignore]
    }
}

/// The caller's choices, keyed by path.
#[derive(Debug, Clone, Default)]
pub struct Resolutions {
    chosen: HashMap<String, Resolution>,
    accept_defaults: bool,
}

impl Resolutions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pick the first offered option for every result without an explicit choice.
    pub fn accepting_defaults() -> Self {
        Resolutions {
            chosen: HashMap::new(),
            accept_defaults: true,
        }
    }

    pub fn choose(&mut self, path: impl Into<String>, option: Resolution) -> &mut Self {
        self.chosen.insert(path.into(), option);
        self
    }

    pub fn get(&self, path: &str) -> Option<Resolution> {
        self.chosen.get(path).copied()
    }

    /// Check every result has an offered choice and settle the final decision per path.
    pub fn settle(&self, results: &[ValidationResult]) -> Result<HashMap<String, Resolution>> {
        let mut settled = HashMap::with_capacity(results.len());
        for result in results {
            let option = match self.get(&result.path) {
                Some(option) if result.offers(option) => option,
                Some(option) => {
                    return Err(PatchError::InvalidResolution {
                        path: result.path.clone(),
                        option: option.to_string(),
                    })
                }
                None if self.accept_defaults => result.default_option(),
                None => return Err(PatchError::Unresolved(result.path.clone())),
            };
            if option == Resolution::Abort {
                return Err(PatchError::Aborted(result.path.clone()));
            }
            settled.insert(result.path.clone(), option);
        }
        Ok(settled)
    }
}
