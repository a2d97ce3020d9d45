//! Approval Manager / command policy (spec §4.4).
//!
//! Governs the single most privileged tool this gateway exposes: arbitrary
//! shell-command execution. Denylist patterns are checked first and always
//! win; only commands that survive the denylist are checked against the
//! allowlist of permitted leading tokens. A command's working directory is
//! additionally restricted to fall under one of the configured cwd prefixes.

use std::path::{Path, PathBuf};

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::PolicyError;

/// Token substituted for the runtime's workspace root in `cwdPrefix`
/// entries, so a policy file can be portable across machines (spec §6).
pub const WORKSPACE_ROOT_TOKEN: &str = "$workspaceRoot";

/// Default deny patterns, shipped with every fresh policy file
/// (SPEC_FULL §B.5): recursive root delete, curl/wget piped to a shell,
/// privilege escalation, world-writable permission changes, writes under
/// `/dev/`, and `eval`/`exec`-style constructs.
pub const DEFAULT_DENY_PATTERNS: &[&str] = &[
    r"rm\s+-rf\s+/(\s|$)",
    r"rm\s+-rf\s+~",
    r"curl[^|]*\|\s*sh",
    r"wget[^|]*\|\s*sh",
    r"\bsudo\b",
    r"\bsu\s+-",
    r"chmod\s+-R\s+777",
    r">\s*/dev/sd",
    r"\beval\b",
    r"\bexec\s*\(",
    r":\(\)\s*\{",
];

/// Outcome of a command policy check (spec §4.4).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicyDecision {
    /// The command may run without further gating.
    Allow,
    /// The command must be routed through the Approval Flow first.
    RequireApproval,
    /// The command is forbidden outright, with a human-readable reason.
    Deny(String),
}

/// Leading command tokens permitted to run without approval, and the
/// working-directory prefixes a command's cwd must fall under.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Allowlist {
    /// e.g. `"ls"`, `"git"`, `"cat"`.
    pub commands: Vec<String>,
    /// May contain `$workspaceRoot`, expanded on load (spec §6).
    #[serde(rename = "cwdPrefix")]
    pub cwd_prefix: Vec<String>,
}

/// Regex patterns; any match denies the command outright.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Denylist {
    pub patterns: Vec<String>,
}

/// Allow/deny policy for the privileged command-execution tool, loaded from
/// `$HOME/.moonbot/exec-approvals.json` (spec §4.4, §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandPolicy {
    pub allowlist: Allowlist,
    pub denylist: Denylist,
}

impl CommandPolicy {
    /// The default policy written by `gateway policy init` when no policy
    /// file exists yet. `cwdPrefix` is seeded with the literal
    /// [`WORKSPACE_ROOT_TOKEN`], so the generated file stays portable; call
    /// [`CommandPolicy::resolve_workspace_root`] once loaded to expand it.
    pub fn default_for(workspace_root: &Path) -> Self {
        let _ = workspace_root;
        Self {
            allowlist: Allowlist {
                commands: vec![
                    "ls".into(),
                    "cat".into(),
                    "grep".into(),
                    "git".into(),
                    "echo".into(),
                    "pwd".into(),
                    "find".into(),
                ],
                cwd_prefix: vec![WORKSPACE_ROOT_TOKEN.to_string()],
            },
            denylist: Denylist {
                patterns: DEFAULT_DENY_PATTERNS.iter().map(|s| s.to_string()).collect(),
            },
        }
    }

    /// Serialize as JSON for `gateway policy init`.
    pub fn to_json(&self) -> Result<String, PolicyError> {
        serde_json::to_string_pretty(self).map_err(|e| PolicyError::InvalidPolicyFile(e.to_string()))
    }

    /// Load a policy file from disk and expand any `$workspaceRoot` tokens
    /// in `cwdPrefix` against `workspace_root`.
    pub fn load(path: &Path, workspace_root: &Path) -> Result<Self, PolicyError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| PolicyError::InvalidPolicyFile(e.to_string()))?;
        let mut policy: Self =
            serde_json::from_str(&text).map_err(|e| PolicyError::InvalidPolicyFile(e.to_string()))?;
        policy.resolve_workspace_root(workspace_root);
        Ok(policy)
    }

    /// Replace every `$workspaceRoot` token in `cwdPrefix` with the
    /// concrete path. Entries without the token are left untouched, so an
    /// operator can also list additional fixed prefixes.
    pub fn resolve_workspace_root(&mut self, workspace_root: &Path) {
        let root = workspace_root.display().to_string();
        for prefix in &mut self.allowlist.cwd_prefix {
            if prefix.contains(WORKSPACE_ROOT_TOKEN) {
                *prefix = prefix.replace(WORKSPACE_ROOT_TOKEN, &root);
            }
        }
    }

    /// Check a shell command and its working directory against this policy.
    ///
    /// Denylist patterns are evaluated first and always win over the
    /// allowlist, per spec §4.4.
    pub fn check(&self, command: &str, cwd: &Path) -> PolicyDecision {
        if let Err(e) = self.check_cwd(cwd) {
            return PolicyDecision::Deny(e.to_string());
        }

        for pattern in &self.denylist.patterns {
            match Regex::new(pattern) {
                Ok(re) if re.is_match(command) => {
                    return PolicyDecision::Deny(format!(
                        "command matched deny pattern `{pattern}`"
                    ));
                }
                _ => continue,
            }
        }

        let leading_token = command.split_whitespace().next().unwrap_or("");
        if self.allowlist.commands.iter().any(|t| t == leading_token) {
            PolicyDecision::Allow
        } else {
            PolicyDecision::RequireApproval
        }
    }

    fn check_cwd(&self, cwd: &Path) -> Result<(), PolicyError> {
        let matches_any = self
            .allowlist
            .cwd_prefix
            .iter()
            .any(|prefix| cwd.starts_with(PathBuf::from(prefix)));
        if matches_any {
            Ok(())
        } else {
            Err(PolicyError::CwdOutsideRoot(cwd.display().to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> CommandPolicy {
        let mut p = CommandPolicy::default_for(Path::new("/home/user/workspace"));
        p.resolve_workspace_root(Path::new("/home/user/workspace"));
        p
    }

    #[test]
    fn deny_pattern_wins_even_for_allowlisted_leading_token() {
        let p = policy();
        let decision = p.check("git reset --hard; rm -rf / ", Path::new("/home/user/workspace"));
        assert!(matches!(decision, PolicyDecision::Deny(_)));
    }

    #[test]
    fn allowlisted_token_is_allowed() {
        let p = policy();
        let decision = p.check("ls -la", Path::new("/home/user/workspace"));
        assert_eq!(decision, PolicyDecision::Allow);
    }

    #[test]
    fn unknown_leading_token_requires_approval() {
        let p = policy();
        let decision = p.check("npm install", Path::new("/home/user/workspace"));
        assert_eq!(decision, PolicyDecision::RequireApproval);
    }

    #[test]
    fn cwd_outside_every_prefix_is_denied() {
        let p = policy();
        let decision = p.check("ls", Path::new("/etc"));
        assert!(matches!(decision, PolicyDecision::Deny(_)));
    }

    #[test]
    fn cwd_matching_any_configured_prefix_is_allowed() {
        let mut p = policy();
        p.allowlist.cwd_prefix.push("/srv/shared".to_string());
        let decision = p.check("ls", Path::new("/srv/shared/project"));
        assert_eq!(decision, PolicyDecision::Allow);
    }

    #[test]
    fn sudo_is_always_denied() {
        let p = policy();
        let decision = p.check("sudo rm file", Path::new("/home/user/workspace"));
        assert!(matches!(decision, PolicyDecision::Deny(_)));
    }

    #[test]
    fn workspace_root_token_is_expanded_on_load() {
        let dir = tempfile::tempdir().unwrap();
        let workspace_root = dir.path().join("workspace");
        let policy = CommandPolicy::default_for(&workspace_root);
        let path = dir.path().join("exec-approvals.json");
        std::fs::write(&path, policy.to_json().unwrap()).unwrap();

        let loaded = CommandPolicy::load(&path, &workspace_root).unwrap();
        assert_eq!(
            loaded.allowlist.cwd_prefix,
            vec![workspace_root.display().to_string()]
        );
    }
}
