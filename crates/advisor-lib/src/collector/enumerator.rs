//! Resource enumeration
//!
//! Lists the database instances in scope for one target as a lazy sequence.
//! Pages are requested from the directory only as the caller pulls nodes, and
//! every call to [`ResourceEnumerator::list`] starts a fresh listing.

use super::{ClusterDescription, ClusterDirectory, DirectoryError, InstanceDescription, Page};
use crate::credentials::ScopedCredential;
use crate::error::EnumError;
use crate::models::{ComputeNode, Target};
use crate::retry::{drive, Disposition, RetryPolicy};
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::debug;

/// PostgreSQL-family engines collected by default
pub const DEFAULT_ENGINES: &[&str] = &["aurora-postgresql", "postgres"];

#[derive(Debug, Clone)]
pub struct EnumeratorConfig {
    pub engines: Vec<String>,
    pub retry: RetryPolicy,
}

impl Default for EnumeratorConfig {
    fn default() -> Self {
        Self {
            engines: DEFAULT_ENGINES.iter().map(|e| e.to_string()).collect(),
            retry: RetryPolicy::default(),
        }
    }
}

impl EnumeratorConfig {
    fn accepts(&self, engine: &str) -> bool {
        self.engines.iter().any(|e| e.eq_ignore_ascii_case(engine))
    }
}

pub struct ResourceEnumerator {
    directory: Arc<dyn ClusterDirectory>,
    config: Arc<EnumeratorConfig>,
}

impl ResourceEnumerator {
    pub fn new(directory: Arc<dyn ClusterDirectory>, config: EnumeratorConfig) -> Self {
        Self {
            directory,
            config: Arc::new(config),
        }
    }

    /// Start a new listing for the target
    pub fn list(&self, cred: ScopedCredential, target: Target) -> NodeListing {
        NodeListing {
            directory: self.directory.clone(),
            config: self.config.clone(),
            cred,
            target,
            phase: Phase::Clusters { marker: None },
            buffer: VecDeque::new(),
            matched_clusters: 0,
        }
    }

    /// Drain a listing into a vector
    pub async fn list_all(
        &self,
        cred: ScopedCredential,
        target: Target,
    ) -> Result<Vec<ComputeNode>, EnumError> {
        let mut listing = self.list(cred, target);
        let mut nodes = Vec::new();
        while let Some(node) = listing.next().await {
            nodes.push(node?);
        }
        Ok(nodes)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Phase {
    Clusters { marker: Option<String> },
    Instances { marker: Option<String> },
    StandaloneLookup,
    Done,
}

/// Lazy, finite sequence of nodes for one target
pub struct NodeListing {
    directory: Arc<dyn ClusterDirectory>,
    config: Arc<EnumeratorConfig>,
    cred: ScopedCredential,
    target: Target,
    phase: Phase,
    buffer: VecDeque<ComputeNode>,
    matched_clusters: usize,
}

impl NodeListing {
    pub fn target(&self) -> &Target {
        &self.target
    }

    /// Nodes already listed but not yet handed out. Ends the listing without
    /// another directory call.
    pub fn drain_buffered(&mut self) -> Vec<ComputeNode> {
        self.phase = Phase::Done;
        self.buffer.drain(..).collect()
    }

    /// Next node, or `None` once the listing is exhausted.
    ///
    /// After an error the listing is finished.
    pub async fn next(&mut self) -> Option<Result<ComputeNode, EnumError>> {
        loop {
            if let Some(node) = self.buffer.pop_front() {
                return Some(Ok(node));
            }

            let step = match self.phase.clone() {
                Phase::Done => return None,
                Phase::Clusters { marker } => self.step_clusters(marker).await,
                Phase::Instances { marker } => self.step_instances(marker).await,
                Phase::StandaloneLookup => self.step_standalone().await,
            };

            if let Err(err) = step {
                self.phase = Phase::Done;
                self.buffer.clear();
                return Some(Err(err));
            }
        }
    }

    async fn step_clusters(&mut self, marker: Option<String>) -> Result<(), EnumError> {
        let filter = self.target.cluster_filter().map(str::to_string);
        let page = match self
            .with_retry(|dir, cred, region| {
                let filter = filter.clone();
                let marker = marker.clone();
                async move {
                    dir.describe_clusters(&cred, &region, filter.as_deref(), marker.as_deref())
                        .await
                }
            })
            .await
        {
            Ok(page) => page,
            // A filter naming an absent cluster is not an error
            Err(DirectoryError::NotFound(_)) if filter.is_some() => Page::last(Vec::new()),
            Err(err) => return Err(self.map_error(err)),
        };

        for cluster in page.items {
            self.push_cluster(cluster)?;
        }

        self.phase = match (page.marker, self.target.cluster_filter()) {
            (Some(next), _) => Phase::Clusters { marker: Some(next) },
            (None, None) => Phase::Instances { marker: None },
            (None, Some(_)) if self.matched_clusters == 0 => Phase::StandaloneLookup,
            (None, Some(_)) => Phase::Done,
        };
        Ok(())
    }

    async fn step_instances(&mut self, marker: Option<String>) -> Result<(), EnumError> {
        let page = self
            .with_retry(|dir, cred, region| {
                let marker = marker.clone();
                async move {
                    dir.describe_instances(&cred, &region, None, marker.as_deref())
                        .await
                }
            })
            .await
            .map_err(|e| self.map_error(e))?;

        for instance in page.items {
            self.push_standalone(instance)?;
        }

        self.phase = match page.marker {
            Some(next) => Phase::Instances { marker: Some(next) },
            None => Phase::Done,
        };
        Ok(())
    }

    /// No cluster matched the filter; the name may be a standalone instance
    async fn step_standalone(&mut self) -> Result<(), EnumError> {
        self.phase = Phase::Done;
        let Some(instance_id) = self.target.cluster_filter().map(str::to_string) else {
            return Ok(());
        };

        let page = match self
            .with_retry(|dir, cred, region| {
                let instance_id = instance_id.clone();
                async move {
                    dir.describe_instances(&cred, &region, Some(&instance_id), None)
                        .await
                }
            })
            .await
        {
            Ok(page) => page,
            Err(DirectoryError::NotFound(_)) => return Ok(()),
            Err(err) => return Err(self.map_error(err)),
        };

        for instance in page.items {
            if instance.instance_id == instance_id {
                self.push_standalone(instance)?;
            }
        }
        Ok(())
    }

    fn push_cluster(&mut self, cluster: ClusterDescription) -> Result<(), EnumError> {
        if cluster.cluster_id.is_empty() {
            return Err(self.malformed("cluster without identifier"));
        }
        if let Some(filter) = self.target.cluster_filter() {
            if cluster.cluster_id != filter {
                return Ok(());
            }
        }
        self.matched_clusters += 1;
        if !self.config.accepts(&cluster.engine) {
            debug!(cluster_id = %cluster.cluster_id, engine = %cluster.engine, "Skipping cluster engine");
            return Ok(());
        }

        for member in cluster.members {
            let engine = if member.engine.is_empty() {
                cluster.engine.clone()
            } else {
                member.engine
            };
            let node = self.node(
                cluster.cluster_id.clone(),
                member.instance_id,
                member.instance_class,
                engine,
                member.engine_version,
                member.is_cluster_writer,
            )?;
            self.buffer.push_back(node);
        }
        Ok(())
    }

    /// Standalone primaries become single-node clusters; members and replicas are skipped
    fn push_standalone(&mut self, instance: InstanceDescription) -> Result<(), EnumError> {
        if instance.cluster_id.is_some()
            || instance.read_replica_source.is_some()
            || !self.config.accepts(&instance.engine)
        {
            return Ok(());
        }
        let node = self.node(
            instance.instance_id.clone(),
            instance.instance_id,
            instance.instance_class,
            instance.engine,
            instance.engine_version,
            true,
        )?;
        self.buffer.push_back(node);
        Ok(())
    }

    fn node(
        &self,
        cluster_id: String,
        instance_id: String,
        instance_class: String,
        engine: String,
        engine_version: String,
        is_writer: bool,
    ) -> Result<ComputeNode, EnumError> {
        if instance_id.is_empty() {
            return Err(self.malformed("instance without identifier"));
        }
        if instance_class.is_empty() {
            return Err(self.malformed(&format!("instance {} has no class", instance_id)));
        }
        Ok(ComputeNode {
            cluster_id,
            instance_id,
            account_id: self.target.account_id().to_string(),
            region: self.target.region().to_string(),
            instance_class,
            engine,
            engine_version,
            is_writer,
        })
    }

    async fn with_retry<T, F, Fut>(&self, call: F) -> Result<T, DirectoryError>
    where
        F: Fn(Arc<dyn ClusterDirectory>, ScopedCredential, String) -> Fut,
        Fut: std::future::Future<Output = Result<T, DirectoryError>>,
    {
        drive(
            &self.config.retry,
            |_| {
                call(
                    self.directory.clone(),
                    self.cred.clone(),
                    self.target.region().to_string(),
                )
            },
            classify,
        )
        .await
        .map_err(|exhausted| exhausted.error)
    }

    fn map_error(&self, err: DirectoryError) -> EnumError {
        match err {
            DirectoryError::Malformed(reason) => EnumError::Malformed {
                target: self.target.to_string(),
                reason,
            },
            other => EnumError::Unreachable {
                target: self.target.to_string(),
                reason: other.to_string(),
            },
        }
    }

    fn malformed(&self, reason: &str) -> EnumError {
        EnumError::Malformed {
            target: self.target.to_string(),
            reason: reason.to_string(),
        }
    }
}

fn classify(err: &DirectoryError) -> Disposition {
    match err {
        DirectoryError::Throttled { retry_after } => Disposition::Retry { hint: *retry_after },
        DirectoryError::Unavailable(_) => Disposition::Retry { hint: None },
        _ => Disposition::Fatal,
    }
}
