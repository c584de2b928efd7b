//! Dispatcher configuration.
//!
//! Settings are plain data. They are read once at startup, either from
//! [`DispatcherConfig::default`] plus builder setters or from the process
//! environment via [`DispatcherConfig::from_env`].

use crate::crash::CrashEnvironment;

/// Environment variable enabling development-mode reporting.
pub const ENV_DEV_MODE: &str = "DESKCORE_DEV_MODE";
/// Environment variable overriding the anonymous install identifier.
pub const ENV_INSTALL_ID: &str = "DESKCORE_INSTALL_ID";
/// Environment variable setting the rejection escalation threshold.
pub const ENV_ESCALATE_REJECTIONS_AFTER: &str = "DESKCORE_ESCALATE_REJECTIONS_AFTER";

/// Where unrecovered errors go.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ReportingMode {
    /// Send reports to the error sink.
    #[default]
    Production,
    /// Skip the sink and log the error and its crash context verbosely.
    Development,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatcherConfig {
    pub reporting: ReportingMode,
    /// Anonymous identifier attached to every report.
    pub install_id: String,
    /// Operating system identifier attached to every report.
    pub os: String,
    /// Raise the fatal signal once this many unhandled rejections have been
    /// recorded. `None` never escalates.
    pub escalate_rejections_after: Option<u32>,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            reporting: ReportingMode::Production,
            install_id: uuid::Uuid::new_v4().to_string(),
            os: default_os(),
            escalate_rejections_after: None,
        }
    }
}

impl DispatcherConfig {
    /// Construct a config from process environment variables.
    ///
    /// Unset or unparseable variables fall back to the defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Construct a config from an arbitrary variable lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        if lookup(ENV_DEV_MODE).is_some_and(|value| parse_bool(&value)) {
            config.reporting = ReportingMode::Development;
        }
        if let Some(install_id) = lookup(ENV_INSTALL_ID)
            .map(|value| value.trim().to_owned())
            .filter(|value| !value.is_empty())
        {
            config.install_id = install_id;
        }
        if let Some(raw) = lookup(ENV_ESCALATE_REJECTIONS_AFTER) {
            match raw.trim().parse::<u32>() {
                Ok(0) => {}
                Ok(threshold) => config.escalate_rejections_after = Some(threshold),
                Err(err) => {
                    tracing::warn!(variable = ENV_ESCALATE_REJECTIONS_AFTER, value = %raw, error = %err, "ignoring invalid value");
                }
            }
        }
        config
    }

    pub fn is_development(&self) -> bool {
        self.reporting == ReportingMode::Development
    }

    /// The baseline facts attached to every crash context.
    pub fn environment(&self) -> CrashEnvironment {
        CrashEnvironment {
            os: self.os.clone(),
            install_id: self.install_id.clone(),
        }
    }
}

fn default_os() -> String {
    format!("{}-{}", std::env::consts::OS, std::env::consts::ARCH)
}

fn parse_bool(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}
