//! Permission modes and the static policy store.
//!
//! The policy store is consulted read-only on every decision: blacklist first,
//! then whitelist, then the default mode for scopes with no explicit override.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// How tool requests in a scope are decided.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum PermissionMode {
    /// Approve every request.
    #[default]
    Auto,
    /// Approve every request, annotated for audit.
    Skip,
    /// Wait for an explicit decision.
    Manual,
    /// A mode name this build does not understand.
    Unrecognized(String),
}

impl PermissionMode {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Auto => "auto",
            Self::Skip => "skip",
            Self::Manual => "manual",
            Self::Unrecognized(name) => name,
        }
    }

    /// Parse a mode name, case-insensitively. Unknown names are kept as
    /// [`PermissionMode::Unrecognized`] so the decision path can reject them.
    pub fn parse(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto" => Self::Auto,
            "skip" => Self::Skip,
            "manual" => Self::Manual,
            _ => Self::Unrecognized(s.to_string()),
        }
    }

    pub const fn is_recognized(&self) -> bool {
        !matches!(self, Self::Unrecognized(_))
    }
}

impl fmt::Display for PermissionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PermissionMode {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self::parse(s))
    }
}

impl From<String> for PermissionMode {
    fn from(s: String) -> Self {
        Self::parse(&s)
    }
}

impl From<PermissionMode> for String {
    fn from(mode: PermissionMode) -> Self {
        mode.as_str().to_string()
    }
}

/// Read-only policy consulted at decision time.
pub trait PolicyStore: Send + Sync {
    /// Tool is always denied.
    fn is_blacklisted(&self, tool_name: &str) -> bool;
    /// Tool is always approved (unless blacklisted).
    fn is_whitelisted(&self, tool_name: &str) -> bool;
    /// Mode for scopes with no explicit override.
    fn default_mode(&self) -> PermissionMode;
}

/// Policy built from fixed tool lists, usually loaded from configuration.
///
/// Entries match a tool name exactly, `*` matches everything, and a trailing
/// `*` matches by prefix (`"mcp__*"`).
#[derive(Debug, Clone, Default)]
pub struct StaticPolicy {
    default_mode: PermissionMode,
    blacklist: Vec<String>,
    whitelist: Vec<String>,
}

impl StaticPolicy {
    pub fn new(default_mode: PermissionMode) -> Self {
        Self {
            default_mode,
            blacklist: Vec::new(),
            whitelist: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_blacklist<I, S>(mut self, tools: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.blacklist.extend(tools.into_iter().map(Into::into));
        self
    }

    #[must_use]
    pub fn with_whitelist<I, S>(mut self, tools: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.whitelist.extend(tools.into_iter().map(Into::into));
        self
    }

    pub fn from_config(config: &crate::config::PermissionConfig) -> Self {
        Self::new(config.default_mode.clone())
            .with_blacklist(config.blacklist.iter().cloned())
            .with_whitelist(config.whitelist.iter().cloned())
    }
}

impl PolicyStore for StaticPolicy {
    fn is_blacklisted(&self, tool_name: &str) -> bool {
        self.blacklist.iter().any(|p| matches_tool(p, tool_name))
    }

    fn is_whitelisted(&self, tool_name: &str) -> bool {
        self.whitelist.iter().any(|p| matches_tool(p, tool_name))
    }

    fn default_mode(&self) -> PermissionMode {
        self.default_mode.clone()
    }
}

/// Check if a tool name matches a pattern.
pub fn matches_tool(pattern: &str, tool_name: &str) -> bool {
    if pattern == "*" {
        return true;
    }
    if let Some(prefix) = pattern.strip_suffix('*') {
        return tool_name.starts_with(prefix);
    }
    pattern == tool_name
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matches_exact_tool() {
        assert!(matches_tool("Bash", "Bash"));
        assert!(!matches_tool("Bash", "Read"));
    }

    #[test]
    fn matches_wildcard_tool() {
        assert!(matches_tool("mcp__*", "mcp__github__create_pr"));
        assert!(!matches_tool("mcp__*", "Bash"));
    }

    #[test]
    fn matches_star_all() {
        assert!(matches_tool("*", "anything"));
    }

    #[test]
    fn parse_modes_case_insensitively() {
        assert_eq!(PermissionMode::parse("AUTO"), PermissionMode::Auto);
        assert_eq!(PermissionMode::parse(" manual "), PermissionMode::Manual);
        assert_eq!(PermissionMode::parse("skip"), PermissionMode::Skip);
        assert_eq!(
            PermissionMode::parse("yolo"),
            PermissionMode::Unrecognized("yolo".into())
        );
    }

    #[test]
    fn mode_serde_uses_plain_strings() {
        let json = serde_json::to_string(&PermissionMode::Manual).ok();
        assert_eq!(json.as_deref(), Some(r#""manual""#));
        let mode: Option<PermissionMode> = serde_json::from_str(r#""bogus""#).ok();
        assert_eq!(mode, Some(PermissionMode::Unrecognized("bogus".into())));
    }

    #[test]
    fn static_policy_lists() {
        let policy = StaticPolicy::new(PermissionMode::Manual)
            .with_blacklist(["Bash"])
            .with_whitelist(["Read", "Bash"]);
        assert!(policy.is_blacklisted("Bash"));
        assert!(policy.is_whitelisted("Read"));
        assert!(!policy.is_whitelisted("Write"));
        assert_eq!(policy.default_mode(), PermissionMode::Manual);
    }
}
