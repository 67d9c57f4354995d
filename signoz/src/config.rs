use std::collections::HashMap;
use std::io;
use std::path::Path;

use serde::Deserialize;

use crate::error::SignozError;

const ENV_ENABLED: &str = "SIGNOZ_ENABLED";
const ENV_SERVICE_NAME: &str = "SIGNOZ_SERVICE_NAME";
const ENV_OTLP_ENDPOINT: &str = "SIGNOZ_OTLP_ENDPOINT";

const DEFAULT_METRICS_INTERVAL_SECS: u64 = 60;

/// Settings read from the `[signoz]` table of the host's configuration file.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SignozSettings {
    /// Master switch. When off nothing is registered.
    pub enabled: bool,
    /// Falls back to the application name when unset or blank.
    pub service_name: Option<String>,
    pub service_name_suffix: Option<String>,
    pub otlp_endpoint: Option<String>,
    pub otlp_protocol: OtlpProtocol,
    pub otlp_headers: HashMap<String, String>,
    pub use_console_export: bool,
    pub use_otlp_export: bool,
    pub export_logs: bool,
    pub export_traces: bool,
    pub export_metrics: bool,
    pub metrics_interval_secs: u64,
}

impl Default for SignozSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            service_name: None,
            service_name_suffix: None,
            otlp_endpoint: None,
            otlp_protocol: OtlpProtocol::default(),
            otlp_headers: HashMap::new(),
            use_console_export: false,
            use_otlp_export: true,
            export_logs: false,
            export_traces: true,
            export_metrics: true,
            metrics_interval_secs: DEFAULT_METRICS_INTERVAL_SECS,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OtlpProtocol {
    /// OTLP over gRPC (tonic).
    #[default]
    Grpc,
    /// OTLP over HTTP with binary protobuf
    HttpBinary,
    /// OTLP over HTTP with JSON payload
    HttpJson,
}

/// Identity of the host application, used for the telemetry resource.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AppInfo {
    pub name: String,
    pub version: String,
}

impl AppInfo {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct SettingsFile {
    #[serde(default)]
    signoz: SignozSettings,
}

impl SignozSettings {
    pub fn from_toml_str(contents: &str) -> Result<Self, SignozError> {
        let file: SettingsFile = toml::from_str(contents)?;
        Ok(file.signoz)
    }

    /// Load settings from `path`. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self, SignozError> {
        match std::fs::read_to_string(path) {
            Ok(contents) => Self::from_toml_str(&contents).inspect_err(|err| {
                tracing::error!("Failed to parse {}: {err}", path.display());
            }),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                tracing::info!("{} not found, telemetry settings use defaults", path.display());
                Ok(Self::default())
            }
            Err(source) => Err(SignozError::Io {
                path: path.to_path_buf(),
                source,
            }),
        }
    }

    pub fn apply_env_overrides(self) -> Self {
        self.apply_overrides_from(|key| std::env::var(key).ok())
    }

    pub fn apply_overrides_from(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(raw) = lookup(ENV_ENABLED) {
            match parse_flag(&raw) {
                Some(enabled) => self.enabled = enabled,
                None => tracing::warn!("ignoring {ENV_ENABLED}={raw}: expected true or false"),
            }
        }
        if let Some(name) = lookup(ENV_SERVICE_NAME).filter(|v| !v.trim().is_empty()) {
            self.service_name = Some(name);
        }
        if let Some(endpoint) = lookup(ENV_OTLP_ENDPOINT).filter(|v| !v.trim().is_empty()) {
            self.otlp_endpoint = Some(endpoint);
        }
        self
    }

    /// Service name reported in the resource: the configured name (or
    /// `app_name`), lowercased, with `-{suffix}` appended when a suffix is set.
    pub fn resolved_service_name(&self, app_name: &str) -> String {
        let base = self
            .service_name
            .as_deref()
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .unwrap_or(app_name)
            .to_lowercase();

        match self
            .service_name_suffix
            .as_deref()
            .map(str::trim)
            .filter(|suffix| !suffix.is_empty())
        {
            Some(suffix) => format!("{base}-{}", suffix.to_lowercase()),
            None => base,
        }
    }

    /// The OTLP endpoint to export to, if OTLP export is switched on.
    pub fn otlp_target(&self) -> Option<&str> {
        if !self.use_otlp_export {
            return None;
        }
        self.otlp_endpoint
            .as_deref()
            .map(str::trim)
            .filter(|endpoint| !endpoint.is_empty())
    }
}

fn parse_flag(raw: &str) -> Option<bool> {
    match raw.trim() {
        "1" => Some(true),
        "0" => Some(false),
        v if v.eq_ignore_ascii_case("true") => Some(true),
        v if v.eq_ignore_ascii_case("false") => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    #[test]
    fn defaults_match_documented_values() {
        let settings = SignozSettings::default();

        assert!(!settings.enabled);
        assert!(settings.use_otlp_export);
        assert!(settings.export_traces);
        assert!(settings.export_metrics);
        assert!(!settings.export_logs);
        assert!(!settings.use_console_export);
        assert_eq!(settings.otlp_protocol, OtlpProtocol::Grpc);
    }

    #[test]
    fn parses_signoz_table() {
        let settings = SignozSettings::from_toml_str(
            r#"
            [signoz]
            enabled = true
            service_name = "Orders"
            otlp_endpoint = "http://collector:4317"
            otlp_protocol = "http-json"
            export_logs = true
            export_metrics = false

            [signoz.otlp_headers]
            signoz-access-token = "secret"
            "#,
        )
        .expect("valid settings");

        assert!(settings.enabled);
        assert_eq!(settings.service_name.as_deref(), Some("Orders"));
        assert_eq!(settings.otlp_protocol, OtlpProtocol::HttpJson);
        assert!(settings.export_logs);
        assert!(!settings.export_metrics);
        assert!(settings.export_traces);
        assert_eq!(
            settings.otlp_headers.get("signoz-access-token").map(String::as_str),
            Some("secret")
        );
    }

    #[test]
    fn missing_table_yields_defaults() {
        let settings = SignozSettings::from_toml_str("[other]\nkey = 1\n").expect("valid toml");
        assert_eq!(settings, SignozSettings::default());
    }

    #[test]
    fn rejects_wrong_types() {
        let err = SignozSettings::from_toml_str("[signoz]\nenabled = \"yes\"\n")
            .expect_err("enabled must be a bool");
        assert!(matches!(err, SignozError::Config(_)));
    }

    #[test]
    fn load_missing_file_uses_defaults() {
        let tmp = TempDir::new().expect("temp dir");
        let settings = SignozSettings::load(&tmp.path().join("absent.toml")).expect("defaults");
        assert_eq!(settings, SignozSettings::default());
    }

    #[test]
    fn load_reads_file() {
        let tmp = TempDir::new().expect("temp dir");
        let path = tmp.path().join("app.toml");
        std::fs::write(&path, "[signoz]\nenabled = true\nuse_console_export = true\n")
            .expect("write settings");

        let settings = SignozSettings::load(&path).expect("settings");
        assert!(settings.enabled);
        assert!(settings.use_console_export);
    }

    #[test]
    fn service_name_falls_back_to_app_name() {
        let mut settings = SignozSettings::default();
        assert_eq!(settings.resolved_service_name("Billing.Api"), "billing.api");

        settings.service_name = Some("  ".to_string());
        assert_eq!(settings.resolved_service_name("Billing"), "billing");

        settings.service_name = Some("Checkout".to_string());
        settings.service_name_suffix = Some("Worker".to_string());
        assert_eq!(settings.resolved_service_name("Billing"), "checkout-worker");
    }

    #[test]
    fn otlp_target_requires_flag_and_endpoint() {
        let mut settings = SignozSettings::default();
        assert_eq!(settings.otlp_target(), None);

        settings.otlp_endpoint = Some("http://collector:4317".to_string());
        assert_eq!(settings.otlp_target(), Some("http://collector:4317"));

        settings.use_otlp_export = false;
        assert_eq!(settings.otlp_target(), None);
    }

    #[test]
    fn env_overrides_replace_file_values() {
        let settings = SignozSettings::default().apply_overrides_from(|key| match key {
            ENV_ENABLED => Some("TRUE".to_string()),
            ENV_SERVICE_NAME => Some("inventory".to_string()),
            ENV_OTLP_ENDPOINT => Some("http://otel:4317".to_string()),
            _ => None,
        });

        assert!(settings.enabled);
        assert_eq!(settings.service_name.as_deref(), Some("inventory"));
        assert_eq!(settings.otlp_endpoint.as_deref(), Some("http://otel:4317"));
    }

    #[test]
    fn invalid_enabled_override_is_ignored() {
        let settings = SignozSettings {
            enabled: true,
            ..Default::default()
        }
        .apply_overrides_from(|key| (key == ENV_ENABLED).then(|| "maybe".to_string()));

        assert!(settings.enabled);
    }
}
