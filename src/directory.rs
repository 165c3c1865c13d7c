//! Directory lifecycle: schema, store and seed data behind one handle.

use crate::config::Config;
use crate::dn::Dn;
use crate::error::{DirectoryError, DirectoryResult};
use crate::ldap_handler::Session;
use crate::ldif::{self, ImportPolicy};
use crate::schema::{Schema, SchemaDefinition};
use crate::store::{DitStore, ImportReport};
use anyhow::{Context, Result};
use std::fs;
use std::sync::Arc;
use tracing::{info, warn};

pub(crate) struct Shared {
    pub(crate) config: Config,
    pub(crate) store: DitStore,
    pub(crate) manager_dn: Dn,
}

/// An open directory. Cloning yields another handle to the same tree.
#[derive(Clone)]
pub struct Directory {
    shared: Arc<Shared>,
}

impl Directory {
    /// Open a directory over `schema`, seeded with LDIF documents.
    ///
    /// `${ldapBaseDn}` in the documents is replaced with the configured root DN.
    /// Seed records are loaded with the configured import policy.
    pub async fn open<S: AsRef<str>>(
        config: Config,
        schema: Schema,
        seed_ldif: &[S],
    ) -> DirectoryResult<Directory> {
        let root = Dn::parse(&config.root_dn)?;
        let manager_dn = Dn::parse(&config.manager_dn)?;
        let schema = Arc::new(schema.with_options(config.schema_options()));
        let store = DitStore::new(schema, vec![root], config.lock_timeout());
        let directory = Directory {
            shared: Arc::new(Shared {
                config,
                store,
                manager_dn,
            }),
        };
        let policy = directory.shared.config.import_policy;
        for text in seed_ldif {
            directory.import_ldif(text.as_ref(), policy).await?;
        }
        info!(
            "Directory open for {} ({} entries)",
            directory.shared.config.root_dn,
            directory.shared.store.entry_count().await?
        );
        Ok(directory)
    }

    /// Open a directory from the schema and LDIF files named in `config`.
    pub async fn load(config: Config) -> Result<Directory> {
        let mut definitions = Vec::with_capacity(config.schema_files.len() + 1);
        if config.include_standard_schema {
            definitions.push(SchemaDefinition::standard()?);
        }
        for path in &config.schema_files {
            let text = fs::read_to_string(path)
                .with_context(|| format!("Failed to read schema file {}", path))?;
            let definition = SchemaDefinition::parse(&text)
                .with_context(|| format!("Failed to parse schema file {}", path))?;
            info!(
                "Loaded schema {}: {} attribute types, {} object classes",
                path,
                definition.attribute_types.len(),
                definition.object_classes.len()
            );
            definitions.push(definition);
        }
        let schema = Schema::merge(definitions).context("Failed to merge schema")?;

        let mut seeds = Vec::with_capacity(config.ldif_files.len());
        for path in &config.ldif_files {
            let text = fs::read_to_string(path)
                .with_context(|| format!("Failed to read LDIF file {}", path))?;
            seeds.push(text);
        }
        Directory::open(config, schema, &seeds)
            .await
            .context("Failed to open directory")
    }

    /// A new session, initially unauthenticated.
    pub fn connection(&self) -> Session {
        Session::new(self.clone())
    }

    pub fn config(&self) -> &Config {
        &self.shared.config
    }

    pub fn schema(&self) -> &Arc<Schema> {
        self.shared.store.schema()
    }

    pub fn store(&self) -> &DitStore {
        &self.shared.store
    }

    pub(crate) fn manager_dn(&self) -> &Dn {
        &self.shared.manager_dn
    }

    pub fn is_closed(&self) -> bool {
        self.shared.store.is_closed()
    }

    /// Load LDIF text. Under `SkipInvalid` malformed records are skipped
    /// and reported along with records the store rejected.
    pub async fn import_ldif(
        &self,
        text: &str,
        policy: ImportPolicy,
    ) -> DirectoryResult<ImportReport> {
        let text = ldif::substitute_base_dn(text, &self.shared.config.root_dn);
        match policy {
            ImportPolicy::Abort => {
                let records = ldif::parse(&text)?;
                self.shared.store.import(records, policy).await
            }
            ImportPolicy::SkipInvalid => {
                let mut records = Vec::new();
                let mut malformed = Vec::new();
                for result in ldif::parse_records(&text) {
                    match result {
                        Ok(record) => records.push(record),
                        Err(e) => {
                            let line = match &e {
                                DirectoryError::Ldif { line, .. } => *line,
                                _ => 0,
                            };
                            warn!("Skipping malformed LDIF record: {}", e);
                            malformed.push((line, e));
                        }
                    }
                }
                let mut report = self.shared.store.import(records, policy).await?;
                report.skipped.extend(malformed);
                report.skipped.sort_by_key(|(line, _)| *line);
                Ok(report)
            }
        }
    }

    /// The whole tree as an LDIF document, parents before children.
    pub async fn export_ldif(&self) -> DirectoryResult<String> {
        let entries = self.shared.store.entries().await?;
        Ok(ldif::to_ldif(&entries))
    }

    /// Idempotent. Later requests on any session fail with `unavailable`.
    pub async fn close(&self) {
        self.shared.store.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::Filter;
    use crate::store::SearchScope;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const SEED: &str = "\
version: 1

dn: ${ldapBaseDn}
objectClass: top
objectClass: domain
dc: example

dn: ou=people,${ldapBaseDn}
objectClass: top
objectClass: organizationalUnit
ou: people

dn: cn=admin,${ldapBaseDn}
objectClass: top
objectClass: person
cn: admin
sn: Administrator
userPassword: secret
";

    async fn open(seed: &str) -> Directory {
        Directory::open(Config::default(), Schema::standard().unwrap(), &[seed])
            .await
            .unwrap()
    }

    async fn count(directory: &Directory, filter: &str) -> usize {
        directory
            .store()
            .search(
                &Dn::parse("dc=example,dc=com").unwrap(),
                SearchScope::WholeSubtree,
                Filter::parse(filter).unwrap(),
            )
            .await
            .unwrap()
            .count()
    }

    #[tokio::test]
    async fn test_open_substitutes_base_dn() {
        let directory = open(SEED).await;
        assert_eq!(directory.store().entry_count().await.unwrap(), 3);
        assert_eq!(count(&directory, "(cn=admin)").await, 1);
        assert_eq!(count(&directory, "(cn=nobody)").await, 0);
    }

    #[tokio::test]
    async fn test_open_aborts_on_bad_seed() {
        let bad = format!("{}\ndn: cn=broken,${{ldapBaseDn}}\nobjectClass: person\ncn: broken\n", SEED);
        let result =
            Directory::open(Config::default(), Schema::standard().unwrap(), &[bad.as_str()]).await;
        assert!(matches!(result, Err(DirectoryError::Ldif { line: 20, .. })));
    }

    #[tokio::test]
    async fn test_import_skip_invalid_reports_lines() {
        let directory = open(SEED).await;
        let text = "\
dn: cn=ok,${ldapBaseDn}
objectClass: person
cn: ok
sn: Fine

dn: not a dn
cn: x

dn: cn=incomplete,${ldapBaseDn}
objectClass: person
cn: incomplete
";
        let report = directory
            .import_ldif(text, ImportPolicy::SkipInvalid)
            .await
            .unwrap();
        assert_eq!(report.imported, 1);
        let lines: Vec<usize> = report.skipped.iter().map(|(line, _)| *line).collect();
        assert_eq!(lines, vec![6, 9]);
        assert_eq!(directory.store().entry_count().await.unwrap(), 4);
    }

    #[tokio::test]
    async fn test_export_reimports() {
        let directory = open(SEED).await;
        let exported = directory.export_ldif().await.unwrap();
        assert!(exported.starts_with("version: 1\n"));
        assert!(exported.contains("dn: cn=admin,dc=example,dc=com\n"));

        let copy = open(&exported).await;
        assert_eq!(
            copy.store().entries().await.unwrap(),
            directory.store().entries().await.unwrap()
        );
    }

    #[tokio::test]
    async fn test_load_reads_files() {
        let mut schema_file = NamedTempFile::new().unwrap();
        schema_file
            .write_all(
                b"attributetype ( 1.3.6.1.4.1.99999.1.1 NAME 'badgeNumber'\n  EQUALITY integerMatch\n  SYNTAX 1.3.6.1.4.1.1466.115.121.1.27 SINGLE-VALUE )\n\nobjectclass ( 1.3.6.1.4.1.99999.2.1 NAME 'badgeHolder'\n  SUP top AUXILIARY MAY badgeNumber )\n",
            )
            .unwrap();
        let mut ldif_file = NamedTempFile::new().unwrap();
        ldif_file
            .write_all(
                format!(
                    "{}\ndn: cn=guard,${{ldapBaseDn}}\nobjectClass: person\nobjectClass: badgeHolder\ncn: guard\nsn: Guard\nbadgeNumber: 42\n",
                    SEED
                )
                .as_bytes(),
            )
            .unwrap();

        let config = Config {
            schema_files: vec![schema_file.path().display().to_string()],
            ldif_files: vec![ldif_file.path().display().to_string()],
            ..Config::default()
        };
        let directory = Directory::load(config).await.unwrap();
        assert!(directory.schema().attribute_type("badgeNumber").is_some());
        assert_eq!(count(&directory, "(badgeNumber>=40)").await, 1);
    }

    #[tokio::test]
    async fn test_load_accepts_core_schema_with_descriptions() {
        let mut schema_file = NamedTempFile::new().unwrap();
        schema_file
            .write_all(
                b"attributetype ( 2.5.4.41 NAME 'name'\n  DESC 'RFC4519: common supertype of name attributes'\n  EQUALITY caseIgnoreMatch\n  SUBSTR caseIgnoreSubstringsMatch\n  SYNTAX 1.3.6.1.4.1.1466.115.121.1.15 )\n\nattributetype ( 2.5.4.3 NAME ( 'cn' 'commonName' )\n  DESC 'RFC4519: common name(s) for which the entity is known by'\n  SUP name )\n",
            )
            .unwrap();
        let config = Config {
            schema_files: vec![schema_file.path().display().to_string()],
            ..Config::default()
        };
        let directory = Directory::load(config).await.unwrap();
        assert!(directory.schema().attribute_type("commonName").is_some());
        assert!(directory.schema().is_subtype_of("commonName", "name"));
    }

    #[tokio::test]
    async fn test_load_without_standard_schema() {
        let mut schema_file = NamedTempFile::new().unwrap();
        schema_file
            .write_all(b"attributetype ( 1.3.6.1.4.1.99999.1.2 NAME 'tag' SYNTAX 1.3.6.1.4.1.1466.115.121.1.15 )\n")
            .unwrap();
        let config = Config {
            include_standard_schema: false,
            schema_files: vec![schema_file.path().display().to_string()],
            ..Config::default()
        };
        let directory = Directory::load(config).await.unwrap();
        assert!(directory.schema().attribute_type("tag").is_some());
        assert!(directory.schema().attribute_type("cn").is_none());
    }

    #[tokio::test]
    async fn test_load_missing_file_fails() {
        let config = Config {
            ldif_files: vec!["/nonexistent/seed.ldif".to_string()],
            ..Config::default()
        };
        assert!(Directory::load(config).await.is_err());
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let directory = open(SEED).await;
        directory.close().await;
        directory.close().await;
        assert!(directory.is_closed());
        assert!(matches!(
            directory.export_ldif().await,
            Err(DirectoryError::Unavailable(_))
        ));
    }
}
