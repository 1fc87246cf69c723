//! Replicator configuration and validation.
//!
//! Everything an embedding front end can configure lives here, validated at
//! build time so misconfiguration fails before anything connects. The
//! option set mirrors the external surface: entry-point address, checkpoint
//! path, namespace filter and rename, sink specs, dump and batching knobs,
//! projection and authentication.

use std::fs;
use std::path::PathBuf;

use crate::document::FieldProjection;
use crate::errors::ConfigError;
use crate::namespace::{Namespace, NamespaceConfig};
use crate::oplog::update_spec::UpdatePolicy;
use crate::sinks::{self, AutoCommit, SinkOptions, SinkSpec};
use crate::source::Credentials;
use crate::tailer::TailerSettings;

/// Default progress publish cadence, in log entries.
pub const DEFAULT_BATCH_SIZE: usize = 1000;
/// Default name of the document id field.
pub const DEFAULT_UNIQUE_KEY: &str = "_id";

/// A validated replicator configuration.
#[derive(Debug, Clone)]
pub struct ReplicatorConfig {
    /// host:port of the router (sharded) or a replica-set member.
    pub main_address: String,
    /// Path of the durable checkpoint file.
    pub checkpoint_path: PathBuf,
    /// Included namespaces; empty means all non-system namespaces.
    pub namespace_set: Vec<Namespace>,
    /// Destination namespaces, pairing with `namespace_set`; empty means
    /// the identity mapping.
    pub dest_namespace_set: Vec<Namespace>,
    /// Name of the document id field.
    pub unique_key: String,
    /// Optional admin credentials.
    pub credentials: Option<Credentials>,
    /// Configured sinks in declaration order.
    pub sinks: Vec<SinkSpec>,
    /// Whether a missing checkpoint triggers an initial collection dump.
    pub collection_dump: bool,
    /// Progress publish cadence, in log entries.
    pub batch_size: usize,
    /// Projection allow-list; id, `ns` and `_ts` are always kept.
    pub fields: Option<Vec<String>>,
    /// Sink commit cadence in seconds; 0 commits per write, unset never
    /// commits explicitly.
    pub auto_commit_interval: Option<u64>,
    /// Downgrade dump-time sink failures to warnings.
    pub continue_on_error: bool,
    /// Policy for update specs with unsupported operators.
    pub update_policy: UpdatePolicy,
}

impl ReplicatorConfig {
    pub fn builder(
        main_address: impl Into<String>,
        checkpoint_path: impl Into<PathBuf>,
    ) -> ReplicatorConfigBuilder {
        ReplicatorConfigBuilder::new(main_address, checkpoint_path)
    }

    pub fn namespace_config(&self) -> Result<NamespaceConfig, ConfigError> {
        NamespaceConfig::new(
            self.namespace_set.clone(),
            self.dest_namespace_set.clone(),
        )
    }

    pub fn projection(&self) -> FieldProjection {
        FieldProjection::new(self.fields.clone())
    }

    pub fn tailer_settings(&self) -> TailerSettings {
        TailerSettings {
            batch_size: self.batch_size,
            collection_dump: self.collection_dump,
            continue_on_error: self.continue_on_error,
            unique_key: self.unique_key.clone(),
            update_policy: self.update_policy,
        }
    }

    pub fn sink_options(&self) -> SinkOptions {
        SinkOptions {
            url: None,
            unique_key: self.unique_key.clone(),
            auto_commit: AutoCommit::from_secs(self.auto_commit_interval),
        }
    }
}

/// Builder with build-time validation.
#[derive(Debug, Clone)]
pub struct ReplicatorConfigBuilder {
    main_address: String,
    checkpoint_path: PathBuf,
    namespaces: Vec<String>,
    dest_namespaces: Vec<String>,
    unique_key: String,
    username: Option<String>,
    password: Option<String>,
    password_file: Option<PathBuf>,
    sink_names: Vec<String>,
    target_urls: Vec<String>,
    no_dump: bool,
    batch_size: usize,
    fields: Option<Vec<String>>,
    auto_commit_interval: Option<u64>,
    continue_on_error: bool,
    update_policy: UpdatePolicy,
}

impl ReplicatorConfigBuilder {
    fn new(main_address: impl Into<String>, checkpoint_path: impl Into<PathBuf>) -> Self {
        Self {
            main_address: main_address.into(),
            checkpoint_path: checkpoint_path.into(),
            namespaces: Vec::new(),
            dest_namespaces: Vec::new(),
            unique_key: DEFAULT_UNIQUE_KEY.to_string(),
            username: None,
            password: None,
            password_file: None,
            sink_names: Vec::new(),
            target_urls: Vec::new(),
            no_dump: false,
            batch_size: DEFAULT_BATCH_SIZE,
            fields: None,
            auto_commit_interval: None,
            continue_on_error: false,
            update_policy: UpdatePolicy::default(),
        }
    }

    /// The namespaces to replicate. Empty means everything non-system.
    pub fn namespace_set<I, S>(mut self, namespaces: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.namespaces = namespaces.into_iter().map(Into::into).collect();
        self
    }

    /// Destination namespaces, pairing one-to-one with the namespace set.
    pub fn dest_namespace_set<I, S>(mut self, namespaces: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dest_namespaces = namespaces.into_iter().map(Into::into).collect();
        self
    }

    pub fn unique_key(mut self, unique_key: impl Into<String>) -> Self {
        self.unique_key = unique_key.into();
        self
    }

    pub fn auth_username(mut self, username: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self
    }

    pub fn auth_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    /// Read the password from a file at build time.
    pub fn auth_password_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.password_file = Some(path.into());
        self
    }

    /// Registered sink type names, in declaration order.
    pub fn doc_managers<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.sink_names = names.into_iter().map(Into::into).collect();
        self
    }

    /// Per-sink target URLs; extra URLs share the last sink type.
    pub fn target_urls<I, S>(mut self, urls: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.target_urls = urls.into_iter().map(Into::into).collect();
        self
    }

    /// Disable the initial collection dump.
    pub fn no_dump(mut self) -> Self {
        self.no_dump = true;
        self
    }

    pub fn batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Projection allow-list; the id, `ns` and `_ts` fields are always
    /// exported.
    pub fn fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.fields = Some(fields.into_iter().map(Into::into).collect());
        self
    }

    pub fn auto_commit_interval(mut self, seconds: u64) -> Self {
        self.auto_commit_interval = Some(seconds);
        self
    }

    pub fn continue_on_error(mut self) -> Self {
        self.continue_on_error = true;
        self
    }

    pub fn update_policy(mut self, policy: UpdatePolicy) -> Self {
        self.update_policy = policy;
        self
    }

    /// Validate and build the configuration.
    pub fn build(self) -> Result<ReplicatorConfig, ConfigError> {
        let namespace_set: Vec<Namespace> = self
            .namespaces
            .iter()
            .map(|name| name.parse())
            .collect::<Result<_, _>>()?;
        let dest_namespace_set: Vec<Namespace> = self
            .dest_namespaces
            .iter()
            .map(|name| name.parse())
            .collect::<Result<_, _>>()?;
        // Surfaces length mismatches and duplicates now instead of at
        // supervisor construction.
        NamespaceConfig::new(namespace_set.clone(), dest_namespace_set.clone())?;

        let mut password = self.password;
        if password.is_none() {
            if let Some(path) = &self.password_file {
                let contents =
                    fs::read_to_string(path).map_err(|err| ConfigError::AuthFile {
                        path: path.display().to_string(),
                        message: err.to_string(),
                    })?;
                password = Some(contents.trim().to_string());
            }
        }
        let credentials = match (self.username, password) {
            (Some(username), Some(password)) => Some(Credentials { username, password }),
            (Some(_), None) => return Err(ConfigError::MissingPassword),
            (None, _) => None,
        };

        let sinks = sinks::pair_sinks(&self.sink_names, &self.target_urls)?;

        Ok(ReplicatorConfig {
            main_address: self.main_address,
            checkpoint_path: self.checkpoint_path,
            namespace_set,
            dest_namespace_set,
            unique_key: self.unique_key,
            credentials,
            sinks,
            collection_dump: !self.no_dump,
            batch_size: self.batch_size.max(1),
            fields: self.fields,
            auto_commit_interval: self.auto_commit_interval,
            continue_on_error: self.continue_on_error,
            update_policy: self.update_policy,
        })
    }
}
