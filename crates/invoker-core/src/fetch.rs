//! Build retrieval for every device slot, with guaranteed cleanup.
//!
//! A successful fetch yields [`FetchedBuilds`], which owns every record
//! together with the provider that produced it. Cleanup consumes it, so each
//! record is released exactly once. A failed fetch cleans up on the spot and
//! reports what it cleaned in the returned [`FetchFailure`].

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use invoker_domain::{
    BuildProvider, BuildRecord, BuildRequest, Device, InvocationContext, InvocationError, Result,
    COMMAND_ARGS_KEY,
};

use crate::obs;

// ---------------------------------------------------------------------------
// FetchedBuilds / CleanupReport
// ---------------------------------------------------------------------------

/// A fetched record and the provider responsible for releasing it.
pub struct FetchedBuild {
    pub slot: String,
    pub provider: Arc<dyn BuildProvider>,
    pub record: BuildRecord,
}

impl std::fmt::Debug for FetchedBuild {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FetchedBuild")
            .field("slot", &self.slot)
            .field("provider", &self.provider.name())
            .field("build_id", &self.record.build_id)
            .finish()
    }
}

/// Every record obtained by one fetch, in slot order.
#[derive(Debug, Default)]
pub struct FetchedBuilds {
    entries: Vec<FetchedBuild>,
}

impl FetchedBuilds {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, slot: &str, provider: Arc<dyn BuildProvider>, record: BuildRecord) {
        self.entries.push(FetchedBuild {
            slot: slot.to_string(),
            provider,
            record,
        });
    }

    pub fn entries(&self) -> &[FetchedBuild] {
        &self.entries
    }

    pub fn get(&self, slot: &str) -> Option<&BuildRecord> {
        self.entries
            .iter()
            .find(|e| e.slot == slot)
            .map(|e| &e.record)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Release every record through its provider. All cleanups are
    /// attempted; failures are reported, never raised.
    pub async fn clean_up(self) -> CleanupReport {
        let mut report = CleanupReport::default();
        for entry in self.entries {
            report.attempted += 1;
            if let Err(error) = entry.provider.clean_up(&entry.record).await {
                obs::emit_cleanup_failed(&entry.record.build_id, entry.provider.name(), &error);
                report.failures.push(CleanupFailure {
                    slot: entry.slot,
                    build_id: entry.record.build_id,
                    provider: entry.provider.name().to_string(),
                    error,
                });
            }
        }
        report
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CleanupFailure {
    pub slot: String,
    pub build_id: String,
    pub provider: String,
    pub error: InvocationError,
}

/// Outcome of one cleanup pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CleanupReport {
    pub attempted: usize,
    pub failures: Vec<CleanupFailure>,
}

impl CleanupReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    /// One line per failed cleanup, for surfacing as warnings.
    pub fn warnings(&self) -> Vec<String> {
        self.failures
            .iter()
            .map(|f| {
                format!(
                    "cleanup of build {} ({}) by {} failed: {}",
                    f.build_id, f.slot, f.provider, f.error
                )
            })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// BuildFetcher
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
#[error("build fetch for slot {slot} failed: {error}")]
pub struct FetchFailure {
    pub slot: String,
    pub error: InvocationError,
    /// What was released after the failure.
    pub cleanup: CleanupReport,
}

pub struct BuildFetcher {
    providers: Vec<(String, Arc<dyn BuildProvider>)>,
    command_line: String,
}

impl BuildFetcher {
    pub fn new(providers: Vec<(String, Arc<dyn BuildProvider>)>, command_line: &[String]) -> Self {
        Self {
            providers,
            command_line: command_line.join(" "),
        }
    }

    fn provider_for(&self, slot: &str) -> Option<Arc<dyn BuildProvider>> {
        self.providers
            .iter()
            .find(|(name, _)| name == slot)
            .map(|(_, provider)| Arc::clone(provider))
    }

    /// Fetch one build per slot of `context`, in slot order.
    ///
    /// Stops at the first slot without a build. Every record obtained so far,
    /// plus a placeholder for the failing slot, is cleaned up before the
    /// failure is returned. The context receives a copy of each record.
    pub async fn fetch(
        &self,
        context: &mut InvocationContext,
    ) -> std::result::Result<FetchedBuilds, FetchFailure> {
        let slots: Vec<(String, Arc<dyn Device>)> = context
            .slots()
            .iter()
            .map(|s| (s.name.clone(), Arc::clone(&s.device)))
            .collect();
        let mut fetched = FetchedBuilds::new();

        for (slot, device) in slots {
            let Some(provider) = self.provider_for(&slot) else {
                let error = InvocationError::Config(format!("no build provider for slot {slot}"));
                obs::emit_fetch_failed(&slot, &error);
                let cleanup = fetched.clean_up().await;
                return Err(FetchFailure {
                    slot,
                    error,
                    cleanup,
                });
            };

            let outcome = {
                let request = BuildRequest {
                    slot: &slot,
                    device: &device,
                    context: provider
                        .wants_invocation_context()
                        .then_some(&*context),
                };
                provider.get_build(&request).await
            };

            let (record, error) = match outcome {
                Ok(Some(record)) => (record, None),
                Ok(None) => (
                    BuildRecord::placeholder(),
                    Some(InvocationError::build_retrieval("No build found to test.")),
                ),
                Err(err) => (BuildRecord::placeholder(), Some(err)),
            };
            let record = self.stamp(record, device.as_ref());
            if let Err(err) = context.set_build(&slot, record.clone()) {
                tracing::warn!(slot = %slot, error = %err, "could not record build on context");
            }
            fetched.push(&slot, provider, record);

            if let Some(error) = error {
                obs::emit_fetch_failed(&slot, &error);
                let cleanup = fetched.clean_up().await;
                return Err(FetchFailure {
                    slot,
                    error,
                    cleanup,
                });
            }
        }
        Ok(fetched)
    }

    fn stamp(&self, mut record: BuildRecord, device: &dyn Device) -> BuildRecord {
        record.device_serial = Some(device.serial());
        record.add_attribute(COMMAND_ARGS_KEY, self.command_line.clone());
        record
    }
}

// ---------------------------------------------------------------------------
// ExistingBuildProvider
// ---------------------------------------------------------------------------

/// Serves a build fetched earlier (by a parent invocation) and hands its
/// cleanup back to the provider that produced it.
pub struct ExistingBuildProvider {
    name: String,
    build: BuildRecord,
    original: Arc<dyn BuildProvider>,
}

impl ExistingBuildProvider {
    pub fn new(build: BuildRecord, original: Arc<dyn BuildProvider>) -> Self {
        Self {
            name: format!("existing:{}", original.name()),
            build,
            original,
        }
    }
}

#[async_trait]
impl BuildProvider for ExistingBuildProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn get_build(&self, _request: &BuildRequest<'_>) -> Result<Option<BuildRecord>> {
        Ok(Some(self.build.clone()))
    }

    async fn clean_up(&self, build: &BuildRecord) -> Result<()> {
        self.original.clean_up(build).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use invoker_domain::fakes::{BuildOutcome, CallLog, FakeBuildProvider, FakeDevice};

    fn two_device_context() -> InvocationContext {
        InvocationContext::new("suite")
            .with_device("device1", Arc::new(FakeDevice::new("serial-1")))
            .with_device("device2", Arc::new(FakeDevice::new("serial-2")))
    }

    #[tokio::test]
    async fn test_fetch_stamps_serial_and_command_line() {
        let log = CallLog::new();
        let fetcher = BuildFetcher::new(
            vec![
                ("device1".to_string(), Arc::new(FakeBuildProvider::returning("p1", "100", log.clone())) as Arc<dyn BuildProvider>),
                ("device2".to_string(), Arc::new(FakeBuildProvider::returning("p2", "200", log.clone())) as Arc<dyn BuildProvider>),
            ],
            &["run".to_string(), "suite".to_string()],
        );
        let mut ctx = two_device_context();

        let builds = fetcher.fetch(&mut ctx).await.expect("fetch");

        assert_eq!(builds.len(), 2);
        let second = builds.get("device2").expect("device2 build");
        assert_eq!(second.device_serial.as_deref(), Some("serial-2"));
        assert_eq!(
            second.attributes.get(COMMAND_ARGS_KEY).map(String::as_str),
            Some("run suite")
        );
        assert_eq!(ctx.build("device1").map(|b| b.build_id.as_str()), Some("100"));
        assert_eq!(log.count("p1", "clean_up"), 0);

        let report = builds.clean_up().await;
        assert_eq!(report.attempted, 2);
        assert!(report.is_clean());
    }

    #[tokio::test]
    async fn test_second_slot_failure_cleans_first_build_and_placeholder() {
        let log = CallLog::new();
        let p1 = Arc::new(FakeBuildProvider::returning("p1", "100", log.clone()));
        let p2 = Arc::new(FakeBuildProvider::new(
            "p2",
            BuildOutcome::Fail(InvocationError::build_retrieval("artifact server down")),
            log.clone(),
        ));
        let fetcher = BuildFetcher::new(
            vec![
                ("device1".to_string(), p1.clone() as Arc<dyn BuildProvider>),
                ("device2".to_string(), p2.clone() as Arc<dyn BuildProvider>),
            ],
            &[],
        );
        let mut ctx = two_device_context();

        let failure = fetcher.fetch(&mut ctx).await.unwrap_err();

        assert_eq!(failure.slot, "device2");
        assert_eq!(failure.cleanup.attempted, 2);
        assert_eq!(p1.cleaned_builds().len(), 1);
        let placeholder = &p2.cleaned_builds()[0];
        assert!(placeholder.placeholder);
        assert_eq!(placeholder.device_serial.as_deref(), Some("serial-2"));
        assert!(ctx.build("device2").expect("placeholder on context").placeholder);
    }

    #[tokio::test]
    async fn test_missing_build_fails_and_stops() {
        let log = CallLog::new();
        let fetcher = BuildFetcher::new(
            vec![
                ("device1".to_string(), Arc::new(FakeBuildProvider::new("p1", BuildOutcome::NoBuild, log.clone())) as Arc<dyn BuildProvider>),
                ("device2".to_string(), Arc::new(FakeBuildProvider::returning("p2", "200", log.clone())) as Arc<dyn BuildProvider>),
            ],
            &[],
        );
        let mut ctx = two_device_context();

        let failure = fetcher.fetch(&mut ctx).await.unwrap_err();

        assert_eq!(
            failure.error,
            InvocationError::build_retrieval("No build found to test.")
        );
        assert_eq!(log.count("p2", "get_build"), 0);
        assert_eq!(log.count("p1", "clean_up"), 1);
    }

    #[tokio::test]
    async fn test_failing_cleanup_does_not_skip_others() {
        let log = CallLog::new();
        let mut builds = FetchedBuilds::new();
        builds.push(
            "device1",
            Arc::new(
                FakeBuildProvider::returning("p1", "100", log.clone())
                    .failing_cleanup(InvocationError::runtime("disk busy")),
            ),
            BuildRecord::new("100"),
        );
        builds.push(
            "device2",
            Arc::new(FakeBuildProvider::returning("p2", "200", log.clone())),
            BuildRecord::new("200"),
        );

        let report = builds.clean_up().await;

        assert_eq!(report.attempted, 2);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].build_id, "100");
        assert!(report.warnings()[0].contains("disk busy"));
        assert_eq!(log.components_in("clean_up"), vec!["p1", "p2"]);
    }

    #[tokio::test]
    async fn test_context_passed_only_when_wanted() {
        let log = CallLog::new();
        let fetcher = BuildFetcher::new(
            vec![
                ("device1".to_string(), Arc::new(FakeBuildProvider::returning("p1", "1", log.clone()).wanting_context()) as Arc<dyn BuildProvider>),
                ("device2".to_string(), Arc::new(FakeBuildProvider::returning("p2", "2", log.clone())) as Arc<dyn BuildProvider>),
            ],
            &[],
        );
        let mut ctx = two_device_context();

        let builds = fetcher.fetch(&mut ctx).await.expect("fetch");

        assert_eq!(log.details_of("p1", "get_build"), vec![Some("suite".to_string())]);
        assert_eq!(log.details_of("p2", "get_build"), vec![None]);
        builds.clean_up().await;
    }

    #[tokio::test]
    async fn test_existing_provider_delegates_cleanup() {
        let log = CallLog::new();
        let original = Arc::new(FakeBuildProvider::returning("p1", "100", log.clone()));
        let existing = ExistingBuildProvider::new(BuildRecord::new("100-clone"), original.clone());
        let device: Arc<dyn Device> = Arc::new(FakeDevice::new("serial-1"));

        let build = existing
            .get_build(&BuildRequest {
                slot: "default",
                device: &device,
                context: None,
            })
            .await
            .expect("get_build")
            .expect("build");
        existing.clean_up(&build).await.expect("clean_up");

        assert_eq!(log.count("p1", "get_build"), 0);
        assert_eq!(original.cleaned_builds(), vec![BuildRecord::new("100-clone")]);
    }
}
