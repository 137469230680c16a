//! Component tests for enumeration, fetching and orchestration
//!
//! These tests run the collector against in-memory fakes of the resource
//! directory, telemetry API and identity service.

#[cfg(test)]
mod fakes {
    use crate::collector::*;
    use crate::credentials::{
        AssumeRoleError, BrokerConfig, CredentialBroker, RoleAssumer, RoleRef, ScopedCredential,
        TrustGraph,
    };
    use crate::models::{ComputeNode, TimeRange};
    use crate::observability::{CollectorMetrics, StructuredLogger};
    use crate::retry::RetryPolicy;
    use async_trait::async_trait;
    use chrono::{Duration as ChronoDuration, TimeZone, Utc};
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    pub const CENTRAL: &str = "111111111111";
    pub const ACCOUNT_A: &str = "222222222222";
    pub const ACCOUNT_B: &str = "333333333333";
    pub const REGION: &str = "us-east-1";

    /// Ten hourly points: `[10, 20, ..., 100]`
    pub fn tens() -> Vec<f64> {
        (1..=10).map(|i| (i * 10) as f64).collect()
    }

    /// Ten-hour window, so a complete series has ten samples
    pub fn window() -> TimeRange {
        let start = Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap();
        TimeRange::new(start, start + ChronoDuration::hours(10)).unwrap()
    }

    pub fn fast_retry() -> RetryPolicy {
        RetryPolicy::default()
            .base_delay(Duration::from_millis(1))
            .max_delay(Duration::from_millis(5))
            .jitter(false)
    }

    pub fn credential(account_id: &str) -> ScopedCredential {
        ScopedCredential::new(
            &RoleRef::new(account_id, "PostgresMetricsUploader"),
            "key",
            "secret",
            "token",
            Utc::now() + ChronoDuration::hours(1),
        )
    }

    pub fn node(account_id: &str, instance_id: &str) -> ComputeNode {
        ComputeNode {
            cluster_id: "orders".to_string(),
            instance_id: instance_id.to_string(),
            account_id: account_id.to_string(),
            region: REGION.to_string(),
            instance_class: "db.r6g.large".to_string(),
            engine: "aurora-postgresql".to_string(),
            engine_version: "15.4".to_string(),
            is_writer: false,
        }
    }

    pub fn member(instance_id: &str, writer: bool) -> InstanceDescription {
        InstanceDescription {
            instance_id: instance_id.to_string(),
            instance_class: "db.r6g.large".to_string(),
            engine: "aurora-postgresql".to_string(),
            engine_version: "15.4".to_string(),
            cluster_id: None,
            is_cluster_writer: writer,
            read_replica_source: None,
        }
    }

    pub fn cluster(cluster_id: &str, members: &[&str]) -> ClusterDescription {
        ClusterDescription {
            cluster_id: cluster_id.to_string(),
            engine: "aurora-postgresql".to_string(),
            members: members
                .iter()
                .enumerate()
                .map(|(i, id)| {
                    let mut m = member(id, i == 0);
                    m.cluster_id = Some(cluster_id.to_string());
                    m
                })
                .collect(),
        }
    }

    pub struct FakeAssumer;

    #[async_trait]
    impl RoleAssumer for FakeAssumer {
        async fn assume_role(
            &self,
            _caller: Option<&ScopedCredential>,
            role: &RoleRef,
            _session_name: &str,
        ) -> Result<ScopedCredential, AssumeRoleError> {
            Ok(ScopedCredential::new(
                role,
                "key",
                "secret",
                "token",
                Utc::now() + ChronoDuration::hours(1),
            ))
        }
    }

    /// Directory serving clusters one per page
    #[derive(Default)]
    pub struct FakeDirectory {
        pub clusters: Vec<ClusterDescription>,
        pub instances: Vec<InstanceDescription>,
        pub throttles: AtomicU32,
        pub unreachable: bool,
        pub malformed: bool,
        pub cluster_calls: AtomicU32,
    }

    impl FakeDirectory {
        pub fn with_clusters(clusters: Vec<ClusterDescription>) -> Self {
            Self {
                clusters,
                ..Default::default()
            }
        }
    }

    #[async_trait]
    impl ClusterDirectory for FakeDirectory {
        async fn describe_clusters(
            &self,
            _cred: &ScopedCredential,
            _region: &str,
            cluster_filter: Option<&str>,
            marker: Option<&str>,
        ) -> Result<Page<ClusterDescription>, DirectoryError> {
            self.cluster_calls.fetch_add(1, Ordering::SeqCst);
            if self
                .throttles
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(DirectoryError::Throttled {
                    retry_after: Some(Duration::from_millis(1)),
                });
            }
            if self.unreachable {
                return Err(DirectoryError::Unavailable("connection refused".into()));
            }
            if self.malformed {
                return Err(DirectoryError::Malformed("unexpected body".into()));
            }

            let matching: Vec<&ClusterDescription> = self
                .clusters
                .iter()
                .filter(|c| cluster_filter.map_or(true, |f| c.cluster_id == f))
                .collect();
            if cluster_filter.is_some() && matching.is_empty() {
                return Err(DirectoryError::NotFound("cluster".into()));
            }

            let idx: usize = marker.and_then(|m| m.parse().ok()).unwrap_or(0);
            Ok(Page {
                items: matching.get(idx).map(|c| (*c).clone()).into_iter().collect(),
                marker: (idx + 1 < matching.len()).then(|| (idx + 1).to_string()),
            })
        }

        async fn describe_instances(
            &self,
            _cred: &ScopedCredential,
            _region: &str,
            instance_filter: Option<&str>,
            _marker: Option<&str>,
        ) -> Result<Page<InstanceDescription>, DirectoryError> {
            let items: Vec<InstanceDescription> = self
                .instances
                .iter()
                .filter(|i| instance_filter.map_or(true, |f| i.instance_id == f))
                .cloned()
                .collect();
            if instance_filter.is_some() && items.is_empty() {
                return Err(DirectoryError::NotFound("instance".into()));
            }
            Ok(Page::last(items))
        }
    }

    #[derive(Clone)]
    pub enum Behavior {
        Series(Vec<f64>),
        Deny,
        ThrottleThen(u32, Vec<f64>),
        Hang,
        Slow(Duration, Vec<f64>),
        /// `(hour offset, value)` points served `page_size` at a time
        Paged(Vec<(i64, f64)>, usize),
    }

    /// Telemetry API whose answer depends on the instance id
    pub struct FakeMetricsApi {
        behaviors: HashMap<String, Behavior>,
        default: Behavior,
        calls: Mutex<HashMap<String, u32>>,
        in_flight: Mutex<HashMap<String, usize>>,
        peak: Mutex<HashMap<String, usize>>,
    }

    impl FakeMetricsApi {
        pub fn new(default: Behavior) -> Self {
            Self {
                behaviors: HashMap::new(),
                default,
                calls: Mutex::new(HashMap::new()),
                in_flight: Mutex::new(HashMap::new()),
                peak: Mutex::new(HashMap::new()),
            }
        }

        pub fn with(mut self, instance_id: &str, behavior: Behavior) -> Self {
            self.behaviors.insert(instance_id.to_string(), behavior);
            self
        }

        pub fn calls(&self, instance_id: &str) -> u32 {
            self.calls
                .lock()
                .unwrap()
                .get(instance_id)
                .copied()
                .unwrap_or(0)
        }

        /// Highest number of concurrent calls seen for one account
        pub fn peak(&self, account_id: &str) -> usize {
            self.peak
                .lock()
                .unwrap()
                .get(account_id)
                .copied()
                .unwrap_or(0)
        }

        fn series_page(query: &MetricQuery, values: &[f64]) -> MetricPage {
            MetricPage {
                datapoints: values
                    .iter()
                    .enumerate()
                    .map(|(i, v)| Datapoint {
                        timestamp: query.start + ChronoDuration::hours(i as i64),
                        value: *v,
                    })
                    .collect(),
                next_token: None,
            }
        }
    }

    #[async_trait]
    impl MetricsApi for FakeMetricsApi {
        async fn get_metric_page(
            &self,
            cred: &ScopedCredential,
            query: &MetricQuery,
        ) -> Result<MetricPage, MetricsApiError> {
            let call = {
                let mut calls = self.calls.lock().unwrap();
                let entry = calls.entry(query.instance_id.clone()).or_insert(0);
                *entry += 1;
                *entry
            };
            let behavior = self
                .behaviors
                .get(&query.instance_id)
                .unwrap_or(&self.default)
                .clone();

            match behavior {
                Behavior::Series(values) => Ok(Self::series_page(query, &values)),
                Behavior::Deny => Err(MetricsApiError::PermissionDenied(
                    "not authorized to read metrics".into(),
                )),
                Behavior::ThrottleThen(n, values) => {
                    if call <= n {
                        Err(MetricsApiError::Throttled {
                            retry_after: Some(Duration::from_millis(1)),
                        })
                    } else {
                        Ok(Self::series_page(query, &values))
                    }
                }
                Behavior::Hang => std::future::pending().await,
                Behavior::Slow(delay, values) => {
                    let account = cred.account_id().to_string();
                    {
                        let mut in_flight = self.in_flight.lock().unwrap();
                        let current = in_flight.entry(account.clone()).or_insert(0);
                        *current += 1;
                        let mut peak = self.peak.lock().unwrap();
                        let p = peak.entry(account.clone()).or_insert(0);
                        *p = (*p).max(*current);
                    }
                    tokio::time::sleep(delay).await;
                    {
                        let mut in_flight = self.in_flight.lock().unwrap();
                        if let Some(current) = in_flight.get_mut(&account) {
                            *current -= 1;
                        }
                    }
                    Ok(Self::series_page(query, &values))
                }
                Behavior::Paged(points, page_size) => {
                    let offset: usize = query
                        .next_token
                        .as_deref()
                        .and_then(|t| t.parse().ok())
                        .unwrap_or(0);
                    let end = (offset + page_size).min(points.len());
                    Ok(MetricPage {
                        datapoints: points[offset..end]
                            .iter()
                            .map(|(h, v)| Datapoint {
                                timestamp: query.start + ChronoDuration::hours(*h),
                                value: *v,
                            })
                            .collect(),
                        next_token: (end < points.len()).then(|| end.to_string()),
                    })
                }
            }
        }
    }

    pub fn noop_limiters() -> LimiterFactory {
        Arc::new(|_| Arc::new(NoopLimiter) as Arc<dyn RateLimiter>)
    }

    pub fn fetcher(api: Arc<FakeMetricsApi>, timeout: Duration) -> TelemetryFetcher {
        TelemetryFetcher::new(
            api,
            FetchConfig {
                retry: fast_retry(),
                timeout,
                ..FetchConfig::default()
            },
            CollectorMetrics::new(),
        )
    }

    pub fn enumerator(directory: Arc<FakeDirectory>) -> ResourceEnumerator {
        ResourceEnumerator::new(
            directory,
            EnumeratorConfig {
                retry: fast_retry(),
                ..EnumeratorConfig::default()
            },
        )
    }

    pub fn orchestrator(
        directory: Arc<FakeDirectory>,
        api: Arc<FakeMetricsApi>,
        fetch_timeout: Duration,
        max_in_flight_per_scope: usize,
    ) -> CollectionOrchestrator {
        orchestrator_with(
            directory,
            api,
            fetch_timeout,
            CollectionConfig {
                max_in_flight_per_scope,
                timeout_grace: Duration::from_millis(50),
                setup_timeout: Duration::from_secs(5),
                run_timeout: None,
            },
        )
    }

    pub fn orchestrator_with(
        directory: Arc<FakeDirectory>,
        api: Arc<FakeMetricsApi>,
        fetch_timeout: Duration,
        config: CollectionConfig,
    ) -> CollectionOrchestrator {
        let table = TrustGraph::central_hub(
            RoleRef::new(CENTRAL, "CrossAccountS3Access"),
            [ACCOUNT_A, ACCOUNT_B],
            "PostgresMetricsUploader",
        )
        .resolve();
        let broker = CredentialBroker::new(Arc::new(FakeAssumer), table, BrokerConfig::default());

        CollectionOrchestrator::new(
            Arc::new(broker),
            Arc::new(enumerator(directory)),
            Arc::new(fetcher(api, fetch_timeout)),
            noop_limiters(),
            config,
            CollectorMetrics::new(),
            StructuredLogger::new("test"),
        )
    }
}

#[cfg(test)]
mod enumerator_tests {
    use super::fakes::*;
    use crate::collector::*;
    use crate::error::EnumError;
    use crate::models::Target;
    use std::sync::atomic::Ordering;
    use std::sync::Arc;

    fn target() -> Target {
        Target::new(ACCOUNT_A, REGION)
    }

    #[tokio::test]
    async fn test_lists_cluster_members_across_pages() {
        let directory = Arc::new(FakeDirectory::with_clusters(vec![
            cluster("orders", &["orders-1", "orders-2"]),
            cluster("billing", &["billing-1"]),
        ]));
        let nodes = enumerator(directory.clone())
            .list_all(credential(ACCOUNT_A), target())
            .await
            .unwrap();

        let ids: Vec<&str> = nodes.iter().map(|n| n.instance_id.as_str()).collect();
        assert_eq!(ids, vec!["orders-1", "orders-2", "billing-1"]);
        assert!(nodes[0].is_writer);
        assert!(!nodes[1].is_writer);
        assert_eq!(nodes[2].cluster_id, "billing");
        assert!(nodes.iter().all(|n| n.account_id == ACCOUNT_A && n.region == REGION));
        assert_eq!(directory.cluster_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_drain_buffered_ends_listing_without_calls() {
        let directory = Arc::new(FakeDirectory::with_clusters(vec![
            cluster("orders", &["orders-1", "orders-2", "orders-3"]),
            cluster("billing", &["billing-1"]),
        ]));
        let mut listing = enumerator(directory.clone()).list(credential(ACCOUNT_A), target());

        let first = listing.next().await.unwrap().unwrap();
        assert_eq!(first.instance_id, "orders-1");

        let rest: Vec<String> = listing
            .drain_buffered()
            .into_iter()
            .map(|n| n.instance_id)
            .collect();
        assert_eq!(rest, vec!["orders-2", "orders-3"]);
        assert!(listing.next().await.is_none());
        assert_eq!(directory.cluster_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_standalone_instances_become_single_node_clusters() {
        let mut replica = member("reports-replica", false);
        replica.read_replica_source = Some("reports".into());
        let mut mysql = member("legacy", false);
        mysql.engine = "mysql".into();
        let mut clustered = member("orders-1", true);
        clustered.cluster_id = Some("orders".into());

        let directory = Arc::new(FakeDirectory {
            clusters: vec![cluster("orders", &["orders-1"])],
            instances: vec![member("reports", false), replica, mysql, clustered],
            ..Default::default()
        });
        let nodes = enumerator(directory)
            .list_all(credential(ACCOUNT_A), target())
            .await
            .unwrap();

        assert_eq!(nodes.len(), 2);
        let standalone = &nodes[1];
        assert_eq!(standalone.instance_id, "reports");
        assert_eq!(standalone.cluster_id, "reports");
        assert!(standalone.is_writer);
    }

    #[tokio::test]
    async fn test_filter_for_absent_cluster_is_empty() {
        let directory = Arc::new(FakeDirectory::with_clusters(vec![cluster(
            "orders",
            &["orders-1"],
        )]));
        let nodes = enumerator(directory)
            .list_all(credential(ACCOUNT_A), target().with_cluster("missing"))
            .await
            .unwrap();
        assert!(nodes.is_empty());
    }

    #[tokio::test]
    async fn test_filter_falls_back_to_standalone_instance() {
        let directory = Arc::new(FakeDirectory {
            clusters: vec![cluster("orders", &["orders-1"])],
            instances: vec![member("reports", false)],
            ..Default::default()
        });
        let nodes = enumerator(directory)
            .list_all(credential(ACCOUNT_A), target().with_cluster("reports"))
            .await
            .unwrap();

        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].cluster_id, "reports");
    }

    #[tokio::test]
    async fn test_filter_selects_one_cluster() {
        let directory = Arc::new(FakeDirectory::with_clusters(vec![
            cluster("orders", &["orders-1"]),
            cluster("billing", &["billing-1", "billing-2"]),
        ]));
        let nodes = enumerator(directory)
            .list_all(credential(ACCOUNT_A), target().with_cluster("billing"))
            .await
            .unwrap();
        assert_eq!(nodes.len(), 2);
        assert!(nodes.iter().all(|n| n.cluster_id == "billing"));
    }

    #[tokio::test]
    async fn test_throttled_listing_is_retried() {
        let directory = Arc::new(FakeDirectory::with_clusters(vec![cluster(
            "orders",
            &["orders-1"],
        )]));
        directory.throttles.store(2, Ordering::SeqCst);

        let nodes = enumerator(directory.clone())
            .list_all(credential(ACCOUNT_A), target())
            .await
            .unwrap();
        assert_eq!(nodes.len(), 1);
        assert_eq!(directory.cluster_calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_unreachable_and_malformed_directories() {
        let unreachable = Arc::new(FakeDirectory {
            unreachable: true,
            ..Default::default()
        });
        let err = enumerator(unreachable)
            .list_all(credential(ACCOUNT_A), target())
            .await
            .unwrap_err();
        assert!(matches!(err, EnumError::Unreachable { .. }));

        let malformed = Arc::new(FakeDirectory {
            malformed: true,
            ..Default::default()
        });
        let err = enumerator(malformed.clone())
            .list_all(credential(ACCOUNT_A), target())
            .await
            .unwrap_err();
        assert!(matches!(err, EnumError::Malformed { .. }));
        // Malformed responses are not retried
        assert_eq!(malformed.cluster_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_listing_is_lazy_and_restartable() {
        let directory = Arc::new(FakeDirectory::with_clusters(vec![
            cluster("orders", &["orders-1"]),
            cluster("billing", &["billing-1"]),
        ]));
        let enumerator = enumerator(directory.clone());

        let mut listing = enumerator.list(credential(ACCOUNT_A), target());
        assert!(listing.next().await.unwrap().is_ok());
        // Only the first page has been requested so far
        assert_eq!(directory.cluster_calls.load(Ordering::SeqCst), 1);

        let again = enumerator
            .list_all(credential(ACCOUNT_A), target())
            .await
            .unwrap();
        assert_eq!(again.len(), 2);
    }
}

#[cfg(test)]
mod fetcher_tests {
    use super::fakes::*;
    use crate::collector::*;
    use crate::error::FetchError;
    use crate::models::{CollectionStatus, UtilizationRecord};
    use chrono::Utc;
    use std::sync::Arc;
    use std::time::Duration;

    fn ctx() -> FetchContext {
        FetchContext {
            run_id: "run-1".to_string(),
            limiter: Arc::new(NoopLimiter),
            deadline: None,
        }
    }

    fn without_timing(mut record: UtilizationRecord) -> UtilizationRecord {
        record.collected_at = chrono::DateTime::<Utc>::MIN_UTC;
        record
    }

    #[tokio::test]
    async fn test_complete_series_aggregates() {
        let api = Arc::new(FakeMetricsApi::new(Behavior::Series(tens())));
        let outcome = fetcher(api, Duration::from_secs(5))
            .fetch(&credential(ACCOUNT_A), &node(ACCOUNT_A, "orders-1"), &window(), &ctx())
            .await;

        let record = outcome.record;
        assert!(outcome.error.is_none());
        assert_eq!(record.collection_status, CollectionStatus::Complete);
        assert_eq!(record.sample_count, 10);
        assert!((record.avg_cpu_pct - 55.0).abs() < 1e-9);
        assert!((record.p95_cpu_pct - 95.0).abs() < 1e-9);
        assert_eq!(record.max_cpu_pct, 100.0);
        assert_eq!(record.run_id, "run-1");
    }

    #[tokio::test]
    async fn test_throttled_three_times_matches_first_try() {
        let api = Arc::new(
            FakeMetricsApi::new(Behavior::Series(tens()))
                .with("throttled", Behavior::ThrottleThen(3, tens())),
        );
        let fetcher = fetcher(api.clone(), Duration::from_secs(5));

        let mut first_try = fetcher
            .fetch(&credential(ACCOUNT_A), &node(ACCOUNT_A, "throttled"), &window(), &ctx())
            .await;
        assert_eq!(api.calls("throttled"), 4);
        assert!(first_try.error.is_none());

        let direct = fetcher
            .fetch(&credential(ACCOUNT_A), &node(ACCOUNT_A, "throttled"), &window(), &ctx())
            .await;
        assert_eq!(api.calls("throttled"), 5);

        first_try.record = without_timing(first_try.record);
        assert_eq!(first_try.record.collection_status, CollectionStatus::Complete);
        assert_eq!(first_try.record, without_timing(direct.record));
    }

    #[tokio::test]
    async fn test_throttling_exhausts_retry_budget() {
        let api = Arc::new(FakeMetricsApi::new(Behavior::ThrottleThen(100, tens())));
        let outcome = fetcher(api.clone(), Duration::from_secs(5))
            .fetch(&credential(ACCOUNT_A), &node(ACCOUNT_A, "hot"), &window(), &ctx())
            .await;

        assert_eq!(outcome.error, Some(FetchError::Throttled { attempts: 5 }));
        assert_eq!(outcome.record.collection_status, CollectionStatus::Failed);
        assert_eq!(api.calls("hot"), 5);
    }

    #[tokio::test]
    async fn test_permission_denied_is_not_retried() {
        let api = Arc::new(FakeMetricsApi::new(Behavior::Deny));
        let outcome = fetcher(api.clone(), Duration::from_secs(5))
            .fetch(&credential(ACCOUNT_A), &node(ACCOUNT_A, "locked"), &window(), &ctx())
            .await;

        assert!(matches!(outcome.error, Some(FetchError::PermissionDenied { .. })));
        assert_eq!(outcome.record.collection_status, CollectionStatus::Failed);
        assert_eq!(outcome.record.sample_count, 0);
        assert!(outcome.record.failure_reason.is_some());
        assert_eq!(api.calls("locked"), 1);
    }

    #[tokio::test]
    async fn test_pages_are_merged_in_time_order() {
        // Out of order, with one duplicated hour and one point outside the window
        let points = vec![(3, 40.0), (0, 10.0), (1, 20.0), (1, 20.0), (2, 30.0), (12, 99.0)];
        let api = Arc::new(FakeMetricsApi::new(Behavior::Paged(points, 2)));
        let outcome = fetcher(api.clone(), Duration::from_secs(5))
            .fetch(&credential(ACCOUNT_A), &node(ACCOUNT_A, "paged"), &window(), &ctx())
            .await;

        let record = outcome.record;
        assert_eq!(api.calls("paged"), 3);
        assert_eq!(record.sample_count, 4);
        assert_eq!(record.collection_status, CollectionStatus::Partial);
        assert_eq!(record.max_cpu_pct, 40.0);
        let values: Vec<f64> = record.cpu_series.iter().map(|p| p.value).collect();
        assert_eq!(values, vec![10.0, 20.0, 30.0, 40.0]);
    }

    #[tokio::test]
    async fn test_hung_fetch_times_out() {
        let api = Arc::new(FakeMetricsApi::new(Behavior::Hang));
        let outcome = fetcher(api, Duration::from_millis(50))
            .fetch(&credential(ACCOUNT_A), &node(ACCOUNT_A, "stuck"), &window(), &ctx())
            .await;

        assert!(matches!(outcome.error, Some(FetchError::Timeout { .. })));
        assert_eq!(outcome.record.collection_status, CollectionStatus::Failed);
    }

    #[tokio::test]
    async fn test_context_deadline_overrides_fetch_timeout() {
        let api = Arc::new(FakeMetricsApi::new(Behavior::Hang));
        let ctx = FetchContext {
            deadline: Some(tokio::time::Instant::now() + Duration::from_millis(50)),
            ..ctx()
        };
        let outcome = fetcher(api, Duration::from_secs(30))
            .fetch(&credential(ACCOUNT_A), &node(ACCOUNT_A, "stuck"), &window(), &ctx)
            .await;

        match outcome.error {
            Some(FetchError::Timeout { elapsed }) => assert!(elapsed < Duration::from_secs(5)),
            other => panic!("expected timeout, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_expired_credential_stops_before_calling() {
        use crate::credentials::{RoleRef, ScopedCredential};

        let expired = ScopedCredential::new(
            &RoleRef::new(ACCOUNT_A, "PostgresMetricsUploader"),
            "key",
            "secret",
            "token",
            Utc::now() - chrono::Duration::minutes(1),
        );
        let api = Arc::new(FakeMetricsApi::new(Behavior::Series(tens())));
        let outcome = fetcher(api.clone(), Duration::from_secs(5))
            .fetch(&expired, &node(ACCOUNT_A, "orders-1"), &window(), &ctx())
            .await;

        assert!(matches!(
            outcome.error,
            Some(FetchError::CredentialExpired { .. })
        ));
        assert_eq!(outcome.record.collection_status, CollectionStatus::Failed);
        assert_eq!(api.calls("orders-1"), 0);
    }
}

#[cfg(test)]
mod orchestrator_tests {
    use super::fakes::*;
    use crate::collector::*;
    use crate::error::{AuthError, FetchError, TargetError};
    use crate::models::{CollectionStatus, Target};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    fn ten_node_cluster() -> Vec<ClusterDescription> {
        let ids: Vec<String> = (1..=10).map(|i| format!("orders-{}", i)).collect();
        let refs: Vec<&str> = ids.iter().map(String::as_str).collect();
        vec![cluster("orders", &refs)]
    }

    #[tokio::test]
    async fn test_two_permanent_failures_out_of_ten() {
        let directory = Arc::new(FakeDirectory::with_clusters(ten_node_cluster()));
        let api = Arc::new(
            FakeMetricsApi::new(Behavior::Series(tens()))
                .with("orders-3", Behavior::Deny)
                .with("orders-7", Behavior::Deny),
        );

        let report = orchestrator(directory, api, Duration::from_secs(5), 4)
            .run(
                vec![Target::new(ACCOUNT_A, REGION)],
                window(),
                CancellationToken::new(),
            )
            .await;

        assert_eq!(report.records.len(), 10);
        assert_eq!(report.successful().count(), 8);
        assert_eq!(report.node_failures.len(), 2);
        assert!(report
            .node_failures
            .iter()
            .all(|f| matches!(f.error, FetchError::PermissionDenied { .. })));

        let mut failed: Vec<&str> = report
            .records
            .iter()
            .filter(|r| r.collection_status == CollectionStatus::Failed)
            .map(|r| r.node_id.as_str())
            .collect();
        failed.sort();
        assert_eq!(failed, vec!["orders-3", "orders-7"]);

        assert_eq!(report.summary.complete, 8);
        assert_eq!(report.summary.failed, 2);
        assert_eq!(report.summary.total_nodes(), 10);
        assert!(report.target_failures.is_empty());
    }

    #[tokio::test]
    async fn test_target_failure_does_not_stop_other_targets() {
        let directory = Arc::new(FakeDirectory::with_clusters(vec![cluster(
            "orders",
            &["orders-1"],
        )]));
        let api = Arc::new(FakeMetricsApi::new(Behavior::Series(tens())));

        let report = orchestrator(directory, api, Duration::from_secs(5), 4)
            .run(
                vec![
                    Target::new("999999999999", REGION),
                    Target::new(ACCOUNT_A, REGION),
                    Target::new("bogus", REGION),
                ],
                window(),
                CancellationToken::new(),
            )
            .await;

        assert_eq!(report.records.len(), 1);
        assert_eq!(report.target_failures.len(), 2);
        assert!(matches!(
            report.target_failures[0].error,
            TargetError::Auth(AuthError::Untrusted { .. })
        ));
        assert!(matches!(
            report.target_failures[1].error,
            TargetError::Auth(AuthError::InvalidTarget { .. })
        ));
        assert_eq!(report.summary.targets_ok, 1);
        assert_eq!(report.summary.targets_failed, 2);
    }

    #[tokio::test]
    async fn test_in_flight_fetches_capped_per_scope() {
        let directory = Arc::new(FakeDirectory::with_clusters(ten_node_cluster()));
        let api = Arc::new(FakeMetricsApi::new(Behavior::Slow(
            Duration::from_millis(20),
            tens(),
        )));

        let report = orchestrator(directory, api.clone(), Duration::from_secs(5), 2)
            .run(
                vec![Target::new(ACCOUNT_A, REGION), Target::new(ACCOUNT_B, REGION)],
                window(),
                CancellationToken::new(),
            )
            .await;

        assert_eq!(report.records.len(), 20);
        assert_eq!(report.summary.complete, 20);
        assert!(api.peak(ACCOUNT_A) <= 2);
        assert!(api.peak(ACCOUNT_B) <= 2);
        assert!(api.peak(ACCOUNT_A) >= 1);
    }

    #[tokio::test]
    async fn test_hung_node_does_not_block_run() {
        let directory = Arc::new(FakeDirectory::with_clusters(vec![cluster(
            "orders",
            &["orders-1", "orders-2"],
        )]));
        let api = Arc::new(
            FakeMetricsApi::new(Behavior::Series(tens())).with("orders-2", Behavior::Hang),
        );

        let report = orchestrator(directory, api, Duration::from_millis(100), 4)
            .run(
                vec![Target::new(ACCOUNT_A, REGION)],
                window(),
                CancellationToken::new(),
            )
            .await;

        assert_eq!(report.records.len(), 2);
        assert_eq!(report.summary.complete, 1);
        assert_eq!(report.node_failures.len(), 1);
        assert!(matches!(
            report.node_failures[0].error,
            FetchError::Timeout { .. }
        ));
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let directory = Arc::new(FakeDirectory::with_clusters(ten_node_cluster()));
        let api = Arc::new(FakeMetricsApi::new(Behavior::Series(tens())));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let report = orchestrator(directory, api, Duration::from_secs(5), 4)
            .run(vec![Target::new(ACCOUNT_A, REGION)], window(), cancel)
            .await;

        assert!(report.records.is_empty());
        assert_eq!(report.target_failures.len(), 1);
        assert_eq!(report.target_failures[0].error, TargetError::Cancelled);
        assert!(report.summary.cancelled);
    }

    #[tokio::test]
    async fn test_cancellation_is_graceful() {
        let directory = Arc::new(FakeDirectory::with_clusters(vec![cluster(
            "orders",
            &["orders-1", "orders-2", "orders-3"],
        )]));
        let api = Arc::new(FakeMetricsApi::new(Behavior::Slow(
            Duration::from_millis(150),
            tens(),
        )));
        let orchestrator = orchestrator(directory, api.clone(), Duration::from_secs(5), 1);
        let cancel = CancellationToken::new();

        let run = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                orchestrator
                    .run(vec![Target::new(ACCOUNT_A, REGION)], window(), cancel)
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(40)).await;
        cancel.cancel();
        let report = run.await.unwrap();

        // The in-flight fetch finished; every node already listed is reported
        let mut ids: Vec<&str> = report.records.iter().map(|r| r.node_id.as_str()).collect();
        ids.sort();
        assert_eq!(ids, vec!["orders-1", "orders-2", "orders-3"]);
        assert_eq!(report.summary.complete, 1);
        assert_eq!(report.summary.failed, 2);
        assert_eq!(report.node_failures.len(), 2);
        assert!(report
            .node_failures
            .iter()
            .all(|f| f.error == FetchError::Cancelled));
        assert_eq!(api.calls("orders-2"), 0);
        assert_eq!(api.calls("orders-3"), 0);
        assert!(report.summary.cancelled);
    }

    #[tokio::test]
    async fn test_run_timeout_bounds_slow_fetches() {
        let directory = Arc::new(FakeDirectory::with_clusters(vec![cluster(
            "orders",
            &["orders-1", "orders-2"],
        )]));
        let api = Arc::new(
            FakeMetricsApi::new(Behavior::Series(tens())).with("orders-2", Behavior::Hang),
        );
        let orchestrator = orchestrator_with(
            directory,
            api,
            Duration::from_secs(30),
            CollectionConfig {
                run_timeout: Some(Duration::from_millis(100)),
                timeout_grace: Duration::from_millis(50),
                ..CollectionConfig::default()
            },
        );

        let started = std::time::Instant::now();
        let report = orchestrator
            .run(vec![Target::new(ACCOUNT_A, REGION)], window(), CancellationToken::new())
            .await;

        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(report.records.len(), 2);
        assert_eq!(report.summary.complete, 1);
        assert_eq!(report.node_failures.len(), 1);
        assert_eq!(report.node_failures[0].node_id, "orders-2");
        assert!(matches!(
            report.node_failures[0].error,
            FetchError::Timeout { .. }
        ));
    }
}
