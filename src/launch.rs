//! Process launch resolution
//!
//! Maps an activation mode to the command line used to spawn the language
//! server. Run mode targets the installed binary and may attach the server's
//! `-o <file>` diagnostic-log flag; Debug mode assumes a developer iterating
//! against a freshly built binary on `PATH`, with no extra arguments.
//!
//! Resolution is a pure mapping. A command that cannot actually be executed
//! is only discovered when the session spawns it.

use std::path::PathBuf;

/// Default server executable name, resolved via the ambient search path.
pub const DEFAULT_SERVER_PROGRAM: &str = "trunkls";

/// How the hosting environment was activated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchMode {
    /// Ordinary activation against the installed server
    Run,
    /// Activation under a development harness or debugger
    Debug,
}

/// Immutable command line for one launch variant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchConfig {
    /// The mode this configuration belongs to
    pub mode: LaunchMode,
    /// Executable path or bare command name
    pub command: String,
    /// Arguments, in order; may be empty
    pub args: Vec<String>,
}

/// Where to find the server and where it may write its diagnostic log.
///
/// Environment-dependent paths are inputs here rather than constants baked
/// into the resolver, since install locations differ per machine.
#[derive(Debug, Clone)]
pub struct ServerLocation {
    /// Bare command name, resolved via the ambient search path
    pub program: String,
    /// Installation-time-known absolute path, preferred in Run mode
    pub install_path: Option<PathBuf>,
    /// Diagnostic log destination attached as `-o <path>` in Run mode
    pub run_log_file: Option<PathBuf>,
}

impl Default for ServerLocation {
    fn default() -> Self {
        Self {
            program: DEFAULT_SERVER_PROGRAM.to_string(),
            install_path: None,
            run_log_file: None,
        }
    }
}

impl ServerLocation {
    /// Resolve the launch configuration for one mode.
    pub fn resolve(&self, mode: LaunchMode) -> LaunchConfig {
        match mode {
            LaunchMode::Run => {
                let command = self
                    .install_path
                    .as_ref()
                    .map(|p| p.to_string_lossy().into_owned())
                    .unwrap_or_else(|| self.program.clone());
                let args = self
                    .run_log_file
                    .as_ref()
                    .map(|p| vec!["-o".to_string(), p.to_string_lossy().into_owned()])
                    .unwrap_or_default();
                LaunchConfig {
                    mode,
                    command,
                    args,
                }
            }
            LaunchMode::Debug => LaunchConfig {
                mode,
                command: self.program.clone(),
                args: Vec::new(),
            },
        }
    }

    /// Resolve both variants; the client needs the full pair even though only
    /// one is spawned per activation.
    pub fn launch_options(&self) -> LaunchOptions {
        LaunchOptions {
            run: self.resolve(LaunchMode::Run),
            debug: self.resolve(LaunchMode::Debug),
        }
    }
}

/// The pair of launch variants handed to the client.
#[derive(Debug, Clone)]
pub struct LaunchOptions {
    pub run: LaunchConfig,
    pub debug: LaunchConfig,
}

impl LaunchOptions {
    /// Select the configuration for the active mode.
    pub fn for_mode(&self, mode: LaunchMode) -> &LaunchConfig {
        match mode {
            LaunchMode::Run => &self.run,
            LaunchMode::Debug => &self.debug,
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_returns_nonempty_command_for_all_modes() {
        let location = ServerLocation::default();
        for mode in [LaunchMode::Run, LaunchMode::Debug] {
            let config = location.resolve(mode);
            assert!(!config.command.is_empty());
            assert_eq!(config.mode, mode);
        }
    }

    #[test]
    fn test_run_mode_prefers_install_path_and_log_flag() {
        let location = ServerLocation {
            program: "trunkls".to_string(),
            install_path: Some(PathBuf::from("/opt/htmx/bin/trunkls")),
            run_log_file: Some(PathBuf::from("/tmp/trunkls.log")),
        };

        let config = location.resolve(LaunchMode::Run);
        assert_eq!(config.command, "/opt/htmx/bin/trunkls");
        assert_eq!(config.args, vec!["-o", "/tmp/trunkls.log"]);
    }

    #[test]
    fn test_debug_mode_uses_bare_program_without_args() {
        let location = ServerLocation {
            program: "trunkls".to_string(),
            install_path: Some(PathBuf::from("/opt/htmx/bin/trunkls")),
            run_log_file: Some(PathBuf::from("/tmp/trunkls.log")),
        };

        let config = location.resolve(LaunchMode::Debug);
        assert_eq!(config.command, "trunkls");
        assert!(config.args.is_empty());
    }

    #[test]
    fn test_run_mode_without_overrides_falls_back_to_search_path() {
        let config = ServerLocation::default().resolve(LaunchMode::Run);
        assert_eq!(config.command, DEFAULT_SERVER_PROGRAM);
        assert!(config.args.is_empty());
    }

    #[test]
    fn test_launch_options_select_by_mode() {
        let options = ServerLocation::default().launch_options();
        assert_eq!(options.for_mode(LaunchMode::Run).mode, LaunchMode::Run);
        assert_eq!(options.for_mode(LaunchMode::Debug).mode, LaunchMode::Debug);
    }
}
