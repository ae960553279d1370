use std::string::String;

/// Driver-level tunables. The original reads these from a runtime config
/// file; that parsing lives outside this core, so the struct carries the
/// resolved values with sensible defaults.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DriverCfg {
    /// Size of the user table; also bounds one selection scan.
    pub max_users: usize,
    /// Frame-stack capacity.
    pub max_call_depth: usize,
    /// Nesting limit for catch error contexts.
    pub max_error_contexts: usize,
    /// Message printed when a command matches nothing and no per-user
    /// failure message is installed. A trailing newline is appended.
    pub default_fail_message: Option<String>,
}

impl DriverCfg {
    pub fn with_max_users(mut self, max_users: usize) -> Self {
        self.max_users = max_users;
        self
    }

    pub fn with_max_call_depth(mut self, max_call_depth: usize) -> Self {
        self.max_call_depth = max_call_depth;
        self
    }

    pub fn with_max_error_contexts(mut self, max_error_contexts: usize) -> Self {
        self.max_error_contexts = max_error_contexts;
        self
    }

    pub fn with_default_fail_message(mut self, msg: &str) -> Self {
        self.default_fail_message = Some(String::from(msg));
        self
    }
}

impl Default for DriverCfg {
    fn default() -> Self {
        Self {
            max_users: 64,
            max_call_depth: 150,
            max_error_contexts: 25,
            default_fail_message: None,
        }
    }
}
