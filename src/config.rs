use crate::dn::Dn;
use crate::ldif::ImportPolicy;
use crate::schema::SchemaOptions;
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Naming context served by the directory; substituted for `${ldapBaseDn}` in LDIF.
    pub root_dn: String,
    pub manager_dn: String,
    pub manager_password: String,
    #[serde(default = "default_listen_address")]
    pub listen_address: String,
    #[serde(default = "default_listen_port_plain")]
    pub listen_port_plain: u16,
    /// LDAPS port; requires `tls`.
    pub listen_port_tls: Option<u16>,
    pub tls: Option<TlsConfig>,
    #[serde(default)]
    pub enforce_single_structural_object_class: bool,
    #[serde(default = "default_true")]
    pub enforce_attribute_syntax_compliance: bool,
    /// Concurrent client connections; -1 means unbounded.
    #[serde(default = "default_max_connections")]
    pub max_connections: i64,
    #[serde(default = "default_true")]
    pub allow_anonymous_bind: bool,
    #[serde(default = "default_true")]
    pub allow_anonymous_read: bool,
    /// Server-side cap on search results; 0 means unlimited.
    #[serde(default)]
    pub size_limit: usize,
    /// Bound on store lock acquisition before an operation fails with `busy`.
    #[serde(default = "default_lock_timeout_ms")]
    pub lock_timeout_ms: u64,
    #[serde(default)]
    pub import_policy: ImportPolicy,
    /// Merge the built-in standard schema under `schema_files`.
    #[serde(default = "default_true")]
    pub include_standard_schema: bool,
    /// Extra schema files merged over the built-in standard schema.
    #[serde(default)]
    pub schema_files: Vec<String>,
    /// Seed LDIF files imported at startup.
    #[serde(default)]
    pub ldif_files: Vec<String>,
    /// Optional HTTP listen address for metrics and health (e.g. "0.0.0.0:9090"). Endpoints: GET /metrics (Prometheus), GET /health (liveness), GET /ready (readiness).
    pub metrics_listen: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TlsConfig {
    /// PEM certificate chain.
    pub cert_file: String,
    /// PEM private key (PKCS#8 or RSA).
    pub key_file: String,
}

fn default_listen_address() -> String {
    "0.0.0.0".to_string()
}

fn default_listen_port_plain() -> u16 {
    1389
}

fn default_true() -> bool {
    true
}

fn default_max_connections() -> i64 {
    -1
}

fn default_lock_timeout_ms() -> u64 {
    5000
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_str(&content)
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(content: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let root = Dn::parse(&self.root_dn).context("root_dn")?;
        if root.is_root() {
            bail!("root_dn must not be empty");
        }
        Dn::parse(&self.manager_dn).context("manager_dn")?;
        if self.max_connections < -1 {
            bail!("max_connections must be -1 (unbounded) or a positive number");
        }
        if let Some(port) = self.listen_port_tls {
            if self.tls.is_none() {
                bail!("listen_port_tls is set but no tls section is configured");
            }
            if port == self.listen_port_plain && port != 0 {
                bail!("listen_port_tls and listen_port_plain must differ");
            }
        }
        Ok(())
    }

    pub fn naming_context(&self) -> Result<Dn> {
        Ok(Dn::parse(&self.root_dn)?)
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    /// `None` when connections are unbounded.
    pub fn connection_limit(&self) -> Option<usize> {
        usize::try_from(self.max_connections).ok()
    }

    pub fn schema_options(&self) -> SchemaOptions {
        SchemaOptions {
            enforce_single_structural: self.enforce_single_structural_object_class,
            enforce_syntax: self.enforce_attribute_syntax_compliance,
        }
    }

    pub fn plain_listen_addr(&self) -> String {
        format!("{}:{}", self.listen_address, self.listen_port_plain)
    }

    pub fn tls_listen_addr(&self) -> Option<String> {
        self.listen_port_tls
            .map(|port| format!("{}:{}", self.listen_address, port))
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            root_dn: "dc=example,dc=com".to_string(),
            manager_dn: "cn=Directory Manager".to_string(),
            manager_password: "password".to_string(),
            listen_address: default_listen_address(),
            listen_port_plain: default_listen_port_plain(),
            listen_port_tls: None,
            tls: None,
            enforce_single_structural_object_class: false,
            enforce_attribute_syntax_compliance: true,
            max_connections: default_max_connections(),
            allow_anonymous_bind: true,
            allow_anonymous_read: true,
            size_limit: 0,
            lock_timeout_ms: default_lock_timeout_ms(),
            import_policy: ImportPolicy::default(),
            include_standard_schema: true,
            schema_files: vec![],
            ldif_files: vec![],
            metrics_listen: None,
        }
    }
}
