//! Compliance gate.
//!
//! A transition may only be submitted for a target whose latest compliance
//! evaluation is on record and still references an image the control plane
//! holds. The local record is consulted first, so a missing record is
//! decided without any remote call.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use orbit_core::{ImageRef, TargetRef, TaskId};
use orbit_store::{ComplianceRecord, ComplianceStatus, Store};
use serde::Serialize;

use crate::client::{with_reauth, ControlPlaneClient};
use crate::error::Result;

/// Why the gate refused a transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DenyReason {
    /// No compliance evaluation is on record for the target.
    NoRecord,
    /// The evaluation found the target incompatible with the image.
    Incompatible {
        /// Evaluated image.
        image: ImageRef,
    },
    /// The evaluation is older than the configured maximum age.
    Stale {
        /// Evaluated image.
        image: ImageRef,
        /// Age of the record in seconds.
        age_seconds: u64,
    },
    /// The evaluated image is no longer present in the control plane.
    ImageMissing {
        /// Evaluated image.
        image: ImageRef,
    },
    /// The target already runs the evaluated image.
    TargetAlreadyTransitioned {
        /// Evaluated image.
        image: ImageRef,
    },
}

impl fmt::Display for DenyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoRecord => f.write_str("no compliance evaluation on record"),
            Self::Incompatible { image } => write!(f, "incompatible with image {image}"),
            Self::Stale { image, age_seconds } => {
                write!(f, "evaluation against {image} is {age_seconds}s old")
            }
            Self::ImageMissing { image } => write!(f, "image {image} no longer exists"),
            Self::TargetAlreadyTransitioned { image } => {
                write!(f, "target already runs image {image}")
            }
        }
    }
}

/// Gate verdict.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateDecision {
    /// The transition may proceed onto `image`.
    Allow {
        /// Image to transition onto.
        image: ImageRef,
    },
    /// The transition must not be submitted.
    Deny(DenyReason),
}

/// Pre-transition compliance check backed by the snapshot cache.
pub struct ComplianceGate {
    client: Arc<dyn ControlPlaneClient>,
    store: Arc<dyn Store>,
    max_record_age: Option<Duration>,
}

impl ComplianceGate {
    /// Create a gate. `max_record_age` of `None` disables the staleness check.
    #[must_use]
    pub fn new(
        client: Arc<dyn ControlPlaneClient>,
        store: Arc<dyn Store>,
        max_record_age: Option<Duration>,
    ) -> Self {
        Self {
            client,
            store,
            max_record_age,
        }
    }

    /// Decide whether a transition of `target` may be submitted.
    ///
    /// # Errors
    ///
    /// Returns store and transport errors unchanged; they are never turned
    /// into a denial.
    pub async fn check(&self, target: &TargetRef) -> Result<GateDecision> {
        let Some(record) = self.store.latest_record(target)? else {
            return Ok(Self::deny(target, DenyReason::NoRecord));
        };
        let image = record.image;

        if record.status == ComplianceStatus::Incompatible {
            return Ok(Self::deny(target, DenyReason::Incompatible { image }));
        }

        if let Some(max_age) = self.max_record_age {
            let age = (Utc::now() - record.evaluated_at)
                .to_std()
                .unwrap_or(Duration::ZERO);
            if age > max_age {
                return Ok(Self::deny(
                    target,
                    DenyReason::Stale {
                        image,
                        age_seconds: age.as_secs(),
                    },
                ));
            }
        }

        let client = self.client.as_ref();
        let image_ref = &image;
        if !with_reauth(client, move || client.image_exists(image_ref)).await? {
            return Ok(Self::deny(target, DenyReason::ImageMissing { image }));
        }

        let state = with_reauth(client, move || client.get_target(target)).await?;
        if state.and_then(|s| s.current_image).as_ref() == Some(&image) {
            return Ok(Self::deny(target, DenyReason::TargetAlreadyTransitioned { image }));
        }

        tracing::debug!(target_ref = %target, image = %image, "Compliance gate allows transition");
        Ok(GateDecision::Allow { image })
    }

    /// Fetch the control plane's latest evaluation for `target` and write it
    /// through to the store.
    ///
    /// Returns the stored record, or `None` if the control plane has no
    /// evaluation.
    ///
    /// # Errors
    ///
    /// Returns transport and store errors.
    pub async fn record_evaluation(
        &self,
        target: &TargetRef,
        task_id: Option<&TaskId>,
    ) -> Result<Option<ComplianceRecord>> {
        let client = self.client.as_ref();
        let Some(report) = with_reauth(client, move || client.get_compliance(target)).await?
        else {
            tracing::warn!(target_ref = %target, "Compliance check finished without a report");
            return Ok(None);
        };

        let record = ComplianceRecord {
            target: target.clone(),
            image: report.image,
            status: report.status,
            evaluated_at: report.evaluated_at,
            task_id: task_id.cloned(),
        };
        self.store.put_record(&record)?;

        tracing::info!(
            target_ref = %target,
            image = %record.image,
            status = ?record.status,
            "Recorded compliance evaluation"
        );
        Ok(Some(record))
    }

    /// Make sure the evaluation produced by `task_id` is in the store.
    ///
    /// A check submitted without being monitored never reaches the store on
    /// its own. This is a no-op if the latest record already came from
    /// `task_id`.
    ///
    /// # Errors
    ///
    /// Returns transport and store errors.
    pub async fn sync_evaluation(
        &self,
        target: &TargetRef,
        task_id: &TaskId,
    ) -> Result<Option<ComplianceRecord>> {
        if let Some(record) = self.store.latest_record(target)? {
            if record.task_id.as_ref() == Some(task_id) {
                return Ok(Some(record));
            }
        }
        self.record_evaluation(target, Some(task_id)).await
    }

    fn deny(target: &TargetRef, reason: DenyReason) -> GateDecision {
        tracing::info!(target_ref = %target, reason = %reason, "Compliance gate denies transition");
        GateDecision::Deny(reason)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockControlPlane;
    use crate::types::ComplianceReport;
    use orbit_store::RocksStore;
    use tempfile::TempDir;

    struct Fixture {
        mock: Arc<MockControlPlane>,
        store: Arc<RocksStore>,
        _dir: TempDir,
    }

    impl Fixture {
        fn gate(&self, max_record_age: Option<Duration>) -> ComplianceGate {
            ComplianceGate::new(self.mock.clone(), self.store.clone(), max_record_age)
        }
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        Fixture {
            mock: Arc::new(MockControlPlane::new()),
            store: Arc::new(RocksStore::open(dir.path()).unwrap()),
            _dir: dir,
        }
    }

    fn target(s: &str) -> TargetRef {
        s.parse().unwrap()
    }

    fn image(s: &str) -> ImageRef {
        ImageRef::new(s).unwrap()
    }

    fn record(target_ref: &str, image_ref: &str, status: ComplianceStatus) -> ComplianceRecord {
        ComplianceRecord {
            target: target(target_ref),
            image: image(image_ref),
            status,
            evaluated_at: Utc::now() - chrono::Duration::hours(2),
            task_id: None,
        }
    }

    #[tokio::test]
    async fn missing_record_denies_without_remote_calls() {
        let f = fixture();
        let decision = f.gate(None).check(&target("wld/cl02")).await.unwrap();
        assert_eq!(decision, GateDecision::Deny(DenyReason::NoRecord));
        assert_eq!(f.mock.remote_calls(), 0);
    }

    #[tokio::test]
    async fn allows_with_record_and_image() {
        let f = fixture();
        f.store
            .put_record(&record("wld/cl01", "img-8", ComplianceStatus::NonCompliant))
            .unwrap();
        f.mock.add_image(image("img-8"));
        f.mock.add_target(&target("wld/cl01"), Some(image("img-7")));

        let decision = f.gate(None).check(&target("wld/cl01")).await.unwrap();
        assert_eq!(decision, GateDecision::Allow { image: image("img-8") });
    }

    #[tokio::test]
    async fn dangling_image_denies() {
        let f = fixture();
        f.store
            .put_record(&record("wld/cl01", "img-8", ComplianceStatus::NonCompliant))
            .unwrap();

        let decision = f.gate(None).check(&target("wld/cl01")).await.unwrap();
        assert_eq!(
            decision,
            GateDecision::Deny(DenyReason::ImageMissing { image: image("img-8") })
        );
    }

    #[tokio::test]
    async fn incompatible_record_denies() {
        let f = fixture();
        f.store
            .put_record(&record("wld/cl01", "img-8", ComplianceStatus::Incompatible))
            .unwrap();
        f.mock.add_image(image("img-8"));

        let decision = f.gate(None).check(&target("wld/cl01")).await.unwrap();
        assert!(matches!(
            decision,
            GateDecision::Deny(DenyReason::Incompatible { .. })
        ));
    }

    #[tokio::test]
    async fn stale_record_denies_only_when_enforced() {
        let f = fixture();
        f.store
            .put_record(&record("wld/cl01", "img-8", ComplianceStatus::NonCompliant))
            .unwrap();
        f.mock.add_image(image("img-8"));

        let strict = f.gate(Some(Duration::from_secs(3600)));
        assert!(matches!(
            strict.check(&target("wld/cl01")).await.unwrap(),
            GateDecision::Deny(DenyReason::Stale { .. })
        ));

        let lenient = f.gate(None);
        assert!(matches!(
            lenient.check(&target("wld/cl01")).await.unwrap(),
            GateDecision::Allow { .. }
        ));
    }

    #[tokio::test]
    async fn already_transitioned_denies() {
        let f = fixture();
        f.store
            .put_record(&record("wld/cl01", "img-8", ComplianceStatus::Compliant))
            .unwrap();
        f.mock.add_image(image("img-8"));
        f.mock.add_target(&target("wld/cl01"), Some(image("img-8")));

        let decision = f.gate(None).check(&target("wld/cl01")).await.unwrap();
        assert!(matches!(
            decision,
            GateDecision::Deny(DenyReason::TargetAlreadyTransitioned { .. })
        ));
    }

    #[tokio::test]
    async fn record_evaluation_writes_through() {
        let f = fixture();
        let cl01 = target("wld/cl01");
        f.mock.set_compliance(
            &cl01,
            ComplianceReport {
                image: image("img-8"),
                status: ComplianceStatus::NonCompliant,
                evaluated_at: Utc::now(),
            },
        );
        let task_id = TaskId::new("task-0001").unwrap();

        let gate = f.gate(None);
        let stored = gate
            .record_evaluation(&cl01, Some(&task_id))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(stored.task_id, Some(task_id));
        assert_eq!(f.store.latest_record(&cl01).unwrap().unwrap(), stored);
    }

    #[tokio::test]
    async fn record_evaluation_without_report() {
        let f = fixture();
        let gate = f.gate(None);
        assert!(gate
            .record_evaluation(&target("wld/cl01"), None)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn sync_evaluation_fetches_once_per_task() {
        let f = fixture();
        let cl01 = target("wld/cl01");
        f.mock.set_compliance(
            &cl01,
            ComplianceReport {
                image: image("img-8"),
                status: ComplianceStatus::NonCompliant,
                evaluated_at: Utc::now(),
            },
        );
        let task_id = TaskId::new("task-0003").unwrap();
        let gate = f.gate(None);

        let first = gate.sync_evaluation(&cl01, &task_id).await.unwrap().unwrap();
        let calls = f.mock.remote_calls();
        let second = gate.sync_evaluation(&cl01, &task_id).await.unwrap().unwrap();

        assert_eq!(first, second);
        assert_eq!(first.task_id, Some(task_id));
        assert_eq!(f.mock.remote_calls(), calls);
        assert_eq!(f.store.latest_record(&cl01).unwrap(), Some(first));
    }
}
