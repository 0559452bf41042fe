//! Permission profiles applied to spawned agents.
//!
//! Each agent role maps to one profile. A profile translates to the agent
//! CLI's tool allowlist plus a non-interactive permission mode; the
//! orchestrator runs headless with a closed stdin, so a flag set that could
//! raise an interactive approval prompt is a configuration error.

use thiserror::Error;

/// Tool and filesystem restrictions for a spawned agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PermissionProfile {
    /// Read and search only; shell restricted to non-mutating commands.
    ReadOnly,
    /// Read/search plus edit/write; shell restricted to build and test.
    #[default]
    Write,
    /// Read/search plus shell for running tests; no edit/write.
    Verify,
    /// Read/search plus writes limited to design-document paths.
    Design,
}

/// Error raised at startup for permission configurations that could block a
/// headless run on an interactive prompt.
#[derive(Debug, Error)]
#[error(
    "permission configuration would leave approval prompts interactive; \
     a headless runner with a closed stdin cannot answer them"
)]
pub struct InteractivePermissionsError;

impl PermissionProfile {
    /// Resolve the profile for a named agent role. Unknown roles get the
    /// writing profile; verification and design roles are recognized by
    /// conventional name.
    pub fn for_role(role: Option<&str>) -> Self {
        match role {
            Some("verifier") | Some("validator") => Self::Verify,
            Some("analyst") | Some("reviewer") => Self::ReadOnly,
            Some("designer") | Some("architect") => Self::Design,
            _ => Self::Write,
        }
    }

    /// Tool allowlist in the agent CLI's rule syntax.
    pub fn allowed_tools(self) -> Vec<&'static str> {
        match self {
            Self::ReadOnly => vec![
                "Read",
                "Glob",
                "Grep",
                "Bash(git log:*)",
                "Bash(git diff:*)",
                "Bash(git show:*)",
            ],
            Self::Write => vec![
                "Read",
                "Glob",
                "Grep",
                "Edit",
                "Write",
                "Bash(git:*)",
                "Bash(cargo:*)",
                "Bash(make:*)",
                "Bash(npm test:*)",
            ],
            Self::Verify => vec!["Read", "Glob", "Grep", "Bash"],
            Self::Design => vec!["Read", "Glob", "Grep", "Write(./docs/**)", "Write(./plans/**)"],
        }
    }

    /// Tools explicitly denied regardless of the allowlist.
    pub fn disallowed_tools(self) -> Vec<&'static str> {
        match self {
            Self::ReadOnly => vec!["Edit", "Write", "WebFetch"],
            Self::Write => vec!["WebFetch"],
            Self::Verify => vec!["Edit", "Write", "WebFetch"],
            Self::Design => vec!["Edit", "WebFetch"],
        }
    }

    /// Build the spawn flags for this profile.
    ///
    /// `suppress_prompts` comes from configuration and must be `true`: the
    /// flags always pin a non-interactive permission mode, and refusing the
    /// interactive combination here is what makes a misconfiguration fail at
    /// startup instead of hanging a child.
    pub fn spawn_args(
        self,
        suppress_prompts: bool,
    ) -> Result<Vec<String>, InteractivePermissionsError> {
        if !suppress_prompts {
            return Err(InteractivePermissionsError);
        }
        let mut args = vec![
            "--allowedTools".to_owned(),
            self.allowed_tools().join(","),
            "--disallowedTools".to_owned(),
            self.disallowed_tools().join(","),
            "--permission-mode".to_owned(),
            "bypassPermissions".to_owned(),
        ];
        // Filesystem scope: every profile is confined to the working
        // directory handed to the agent.
        args.push("--add-dir".to_owned());
        args.push(".".to_owned());
        Ok(args)
    }
}
