//! Status reports answering `RetrieveConnectionStatus`
//!
//! Retrieval never fails. When the driver reports fewer children than the
//! spec expects and the connection is failed or unknown, each missing
//! child gets a `Closed` placeholder instead of leaving a gap.

use crate::core::session::SessionSnapshot;
use crate::core::types::{ConnectionId, ConnectivityStatus, DesiredStatus, RecoveryStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    Client,
    Source,
    Target,
    Tunnel,
}

/// Live status of one child resource as reported by the driver
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceStatus {
    pub kind: ResourceKind,
    pub address: Option<String>,
    pub status: ConnectivityStatus,
    pub detail: String,
    pub since: DateTime<Utc>,
}

impl ResourceStatus {
    pub fn new(
        kind: ResourceKind,
        address: Option<String>,
        status: ConnectivityStatus,
        detail: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            address,
            status,
            detail: detail.into(),
            since: Utc::now(),
        }
    }

    fn placeholder(kind: ResourceKind, address: &str, since: DateTime<Utc>) -> Self {
        Self {
            kind,
            address: Some(address.to_string()),
            status: ConnectivityStatus::Closed,
            detail: "not running".to_string(),
            since,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionStatusReport {
    pub connection_id: ConnectionId,
    pub live_status: ConnectivityStatus,
    pub desired_status: DesiredStatus,
    pub recovery_status: RecoveryStatus,
    pub status_detail: String,
    pub status_since: DateTime<Utc>,
    pub failure_count: u32,
    pub resources: Vec<ResourceStatus>,
}

impl ConnectionStatusReport {
    pub fn resources_of(&self, kind: ResourceKind) -> impl Iterator<Item = &ResourceStatus> {
        self.resources.iter().filter(move |r| r.kind == kind)
    }
}

/// Merge the session view with whatever the driver reported
pub fn build_report(snapshot: &SessionSnapshot, mut resources: Vec<ResourceStatus>) -> ConnectionStatusReport {
    let needs_placeholders = matches!(
        snapshot.current_status,
        ConnectivityStatus::Failed | ConnectivityStatus::Unknown
    );

    if needs_placeholders {
        let since = snapshot.status_since;

        let expected_sources: Vec<&str> = snapshot.spec.consumer_addresses().collect();
        let missing_sources = missing_addresses(&resources, ResourceKind::Source, expected_sources);
        let expected_targets = snapshot.spec.targets.iter().map(|t| t.address.as_str());
        let missing_targets = missing_addresses(&resources, ResourceKind::Target, expected_targets);

        for address in missing_sources {
            resources.push(ResourceStatus::placeholder(ResourceKind::Source, &address, since));
        }
        for address in missing_targets {
            resources.push(ResourceStatus::placeholder(ResourceKind::Target, &address, since));
        }
    }

    ConnectionStatusReport {
        connection_id: snapshot.connection_id.clone(),
        live_status: snapshot.current_status,
        desired_status: snapshot.desired_status,
        recovery_status: snapshot.recovery_status,
        status_detail: snapshot.status_detail.clone(),
        status_since: snapshot.status_since,
        failure_count: snapshot.failure_count,
        resources,
    }
}

/// Expected addresses with no reported resource of `kind`; each report
/// accounts for one expected occurrence of its address
fn missing_addresses<'a>(
    reported: &[ResourceStatus],
    kind: ResourceKind,
    expected: impl IntoIterator<Item = &'a str>,
) -> Vec<String> {
    let mut running: Vec<&str> = reported
        .iter()
        .filter(|r| r.kind == kind)
        .filter_map(|r| r.address.as_deref())
        .collect();

    expected
        .into_iter()
        .filter(|address| match running.iter().position(|r| r == address) {
            Some(found) => {
                running.swap_remove(found);
                false
            }
            None => true,
        })
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::session::ConnectionSession;
    use crate::core::types::{ConnectionSpec, SourceSpec, TargetSpec};

    fn spec() -> ConnectionSpec {
        let mut spec = ConnectionSpec::new("orders", "amqp-091", "amqp://broker");
        spec.sources.push(SourceSpec {
            addresses: vec!["orders.in".into()],
            consumer_count: 2,
        });
        spec.targets.push(TargetSpec {
            address: "orders.out".into(),
            topics: vec![],
            issued_ack_label: None,
        });
        spec
    }

    #[test]
    fn test_failed_connection_gets_placeholders() {
        let session = ConnectionSession::new(spec()).with_status(ConnectivityStatus::Failed, "down");
        let running = vec![ResourceStatus::new(
            ResourceKind::Source,
            Some("orders.in".into()),
            ConnectivityStatus::Open,
            "consuming",
        )];

        let report = build_report(&session.snapshot(), running);
        assert_eq!(report.resources_of(ResourceKind::Source).count(), 2);
        assert_eq!(report.resources_of(ResourceKind::Target).count(), 1);

        let placeholder = report.resources_of(ResourceKind::Target).next().unwrap();
        assert_eq!(placeholder.status, ConnectivityStatus::Closed);
        assert_eq!(placeholder.address.as_deref(), Some("orders.out"));
    }

    #[test]
    fn test_placeholders_follow_missing_addresses() {
        let mut spec = spec();
        spec.sources = vec![SourceSpec {
            addresses: vec!["a".into(), "b".into()],
            consumer_count: 1,
        }];
        let session = ConnectionSession::new(spec).with_status(ConnectivityStatus::Unknown, "restarting");
        let running = vec![ResourceStatus::new(
            ResourceKind::Source,
            Some("b".into()),
            ConnectivityStatus::Open,
            "consuming",
        )];

        let report = build_report(&session.snapshot(), running);
        let mut sources: Vec<_> = report
            .resources_of(ResourceKind::Source)
            .map(|r| (r.address.clone().unwrap(), r.status))
            .collect();
        sources.sort_by(|x, y| x.0.cmp(&y.0));

        assert_eq!(
            sources,
            vec![
                ("a".to_string(), ConnectivityStatus::Closed),
                ("b".to_string(), ConnectivityStatus::Open),
            ]
        );
    }

    #[test]
    fn test_open_connection_reports_as_is() {
        let session = ConnectionSession::new(spec()).with_status(ConnectivityStatus::Open, "connected");
        let report = build_report(&session.snapshot(), vec![]);

        assert!(report.resources.is_empty());
        assert_eq!(report.live_status, ConnectivityStatus::Open);
    }
}
