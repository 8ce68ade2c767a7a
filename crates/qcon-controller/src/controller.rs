use std::{sync::Arc, time::Duration};

use bytes::Bytes;
use qcon_relay::UpstreamConnector;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use uuid::Uuid;

use crate::{
    instance::{EmulatorInstance, LaunchSpec},
    metrics::Metrics,
    platform::Platform,
    registry::{Evicted, Registry},
    testrun::{Callback, RunTarget, Subscription, TestOptions, TestRequest, TestRun},
    ControllerConfig, ControllerError, StartupError,
};

/// Instances not pinged for longer than this are reaped.
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(300);

const CALLBACK_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Deserialize)]
pub struct LaunchRequest {
    pub token: String,
    pub platform: String,
    pub version: String,
    #[serde(default)]
    pub tz_offset: Option<i32>,
    #[serde(default)]
    pub oauth: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Launched {
    pub id: Uuid,
    pub companion_ws_port: u16,
    pub vnc_display: u16,
    pub vnc_ws_port: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TestStart {
    Started,
    /// A run was already in progress; nothing changed.
    Running,
}

/// Admission, lookup and teardown of every instance this process runs.
pub struct Controller {
    config: Arc<ControllerConfig>,
    registry: Registry,
    connector: UpstreamConnector,
    http: reqwest::Client,
    metrics: Metrics,
}

impl Controller {
    pub fn new(config: ControllerConfig) -> Result<Self, StartupError> {
        let connector = match &config.ssl_root {
            Some(ca_bundle) => UpstreamConnector::with_ca_bundle(ca_bundle)?,
            None => UpstreamConnector::plain(),
        };
        let http = reqwest::Client::builder()
            .timeout(CALLBACK_TIMEOUT)
            .build()?;

        Ok(Self {
            registry: Registry::new(config.emulator_limit),
            config: Arc::new(config),
            connector,
            http,
            metrics: Metrics::new(),
        })
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    pub fn connector(&self) -> &UpstreamConnector {
        &self.connector
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    pub async fn render_metrics(&self) -> String {
        self.metrics
            .render_prometheus(self.registry.len().await, self.registry.slots_in_use())
    }

    pub async fn instance(&self, id: Uuid) -> Option<Arc<EmulatorInstance>> {
        self.registry.get(&id).await
    }

    pub async fn instance_count(&self) -> usize {
        self.registry.len().await
    }

    /// Starts a new instance.
    ///
    /// Checks run in order: credential, capacity, then the platform and version selectors. All
    /// three happen before anything is allocated.
    pub async fn launch(
        &self,
        credential: Option<&str>,
        request: LaunchRequest,
    ) -> Result<Launched, ControllerError> {
        if let Err(err) = self.authorize(credential) {
            self.metrics.launch_rejected();
            return Err(err);
        }

        let Some(slot) = self.registry.try_admit() else {
            self.metrics.launch_rejected();
            return Err(ControllerError::AtCapacity {
                limit: self.registry.limit(),
            });
        };

        let platform = match validate_selectors(&request.platform, &request.version) {
            Ok(platform) => platform,
            Err(err) => {
                self.metrics.launch_rejected();
                return Err(err);
            }
        };

        let id = Uuid::new_v4();
        let spec = LaunchSpec {
            token: request.token,
            platform,
            version: request.version,
            tz_offset: request.tz_offset.unwrap_or(0),
            oauth: request.oauth,
        };
        let instance = match EmulatorInstance::launch(id, spec, Arc::clone(&self.config)).await {
            Ok(instance) => instance,
            Err(err) => {
                self.metrics.launch_failed();
                return Err(err.into());
            }
        };

        instance.touch(Instant::now());
        let ports = instance.ports();
        if let Err(evicted) = self.registry.insert(Arc::clone(&instance), slot).await {
            tracing::info!(instance = %id, "controller shut down during launch");
            self.teardown(evicted).await;
            return Err(ControllerError::AtCapacity {
                limit: self.registry.limit(),
            });
        }

        self.metrics.launch_succeeded();
        tracing::info!(
            instance = %id,
            platform = %platform,
            companion_ws = ports.companion_ws,
            vnc_ws = ports.vnc_ws,
            "instance ready"
        );
        Ok(Launched {
            id,
            companion_ws_port: ports.companion_ws,
            vnc_display: ports.vnc_display,
            vnc_ws_port: ports.vnc_ws,
        })
    }

    /// Keepalive. A registered instance whose processes died is torn down and reported dead.
    pub async fn ping(&self, id: Uuid) -> bool {
        let Some(instance) = self.registry.get(&id).await else {
            return false;
        };

        if instance.is_alive().await {
            instance.touch(Instant::now());
            return true;
        }

        tracing::info!(instance = %id, "instance is no longer running");
        if let Some(evicted) = self.registry.remove(&id).await {
            self.teardown(evicted).await;
        }
        false
    }

    /// Stops and forgets an instance. Unknown ids are a no-op.
    pub async fn kill(&self, id: Uuid) {
        if let Some(evicted) = self.registry.remove(&id).await {
            tracing::info!(instance = %id, "killing instance");
            self.teardown(evicted).await;
        }
    }

    /// Kills every instance and refuses new ones.
    pub async fn shutdown(&self) {
        let evicted = self.registry.drain().await;
        tracing::info!(count = evicted.len(), "killing all instances");
        for evicted in evicted {
            self.teardown(evicted).await;
        }
    }

    /// Kills every instance whose last ping is more than `idle_timeout` before `now`.
    pub async fn reap_idle(&self, now: Instant, idle_timeout: Duration) -> usize {
        let stale = self
            .registry
            .remove_where(|instance| {
                now.saturating_duration_since(instance.last_ping()) > idle_timeout
            })
            .await;

        let reaped = stale.len();
        for evicted in stale {
            tracing::info!(instance = %evicted.instance.id(), "reaping idle instance");
            self.teardown(evicted).await;
        }
        self.metrics.instances_reaped(reaped);
        reaped
    }

    /// Starts a harness run against a live instance. A run already in progress is left alone.
    pub async fn start_test(
        &self,
        id: Uuid,
        credential: Option<&str>,
        archive: Bytes,
        callback: Option<Callback>,
        options: TestOptions,
    ) -> Result<TestStart, ControllerError> {
        self.authorize(credential)?;
        let instance = self
            .registry
            .get(&id)
            .await
            .ok_or(ControllerError::UnknownInstance)?;

        let mut slot = instance.test_run_slot().lock().await;
        if slot.as_ref().is_some_and(|run| !run.is_finished()) {
            return Ok(TestStart::Running);
        }
        // `kill` cancels before it empties this slot, so a run started past this check is
        // always seen and killed by it.
        if instance.is_shutting_down() {
            return Err(ControllerError::UnknownInstance);
        }

        let ports = instance.ports();
        let request = TestRequest {
            archive,
            target: RunTarget {
                console: ports.console,
                companion_link: ports.companion_link,
            },
            callback,
            options,
        };
        let run = TestRun::start(request, &self.config.harness, self.http.clone()).await?;
        *slot = Some(run);

        self.metrics.test_run_started();
        tracing::info!(instance = %id, update = options.update, "test run started");
        Ok(TestStart::Started)
    }

    /// Output of the instance's current or last test run; `None` if it never had one.
    pub async fn test_output(&self, id: Uuid) -> Result<Option<Subscription>, ControllerError> {
        let instance = self
            .registry
            .get(&id)
            .await
            .ok_or(ControllerError::UnknownInstance)?;
        let slot = instance.test_run_slot().lock().await;
        Ok(slot.as_ref().map(|run| run.subscribe()))
    }

    /// Stops the instance's test run, if any.
    pub async fn kill_test(&self, id: Uuid) {
        let Some(instance) = self.registry.get(&id).await else {
            return;
        };
        let run = instance.test_run_slot().lock().await.take();
        if let Some(run) = run {
            run.kill().await;
        }
    }

    fn authorize(&self, credential: Option<&str>) -> Result<(), ControllerError> {
        match credential {
            Some(credential)
                if constant_time_eq(credential.as_bytes(), self.config.launch_auth.as_bytes()) =>
            {
                Ok(())
            }
            _ => Err(ControllerError::Unauthorized),
        }
    }

    /// Kills an evicted instance, then releases its slot.
    async fn teardown(&self, evicted: Evicted) {
        let Evicted { instance, slot } = evicted;
        let result = instance.kill().await;
        if let Err(err) = &result {
            tracing::error!(instance = %instance.id(), "failed to kill instance: {err}");
        }
        self.metrics.instance_killed(result.is_ok());
        drop(slot);
    }
}

/// Platform and version end up as path components under the image root.
fn validate_selectors(platform: &str, version: &str) -> Result<Platform, ControllerError> {
    for (field, value) in [("platform", platform), ("version", version)] {
        if !is_path_component(value) {
            return Err(ControllerError::Validation {
                field,
                value: value.to_string(),
            });
        }
    }

    platform.parse().map_err(|_| ControllerError::Validation {
        field: "platform",
        value: platform.to_string(),
    })
}

fn is_path_component(value: &str) -> bool {
    !value.is_empty()
        && value != "."
        && value != ".."
        && !value.contains(['/', '\\', '\0'])
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }

    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b) {
        diff |= x ^ y;
    }
    diff == 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{alloc::Ports, instance::InstanceState};

    fn controller(limit: usize) -> Controller {
        let mut config = ControllerConfig::new("/q", "/i", "/v", "secret");
        config.emulator_limit = limit;
        Controller::new(config).unwrap()
    }

    fn request(platform: &str, version: &str) -> LaunchRequest {
        LaunchRequest {
            token: "0123456789".into(),
            platform: platform.into(),
            version: version.into(),
            tz_offset: None,
            oauth: None,
        }
    }

    async fn register(controller: &Controller) -> Arc<EmulatorInstance> {
        let spec = LaunchSpec {
            token: "token".into(),
            platform: Platform::Basalt,
            version: "4.0".into(),
            tz_offset: 0,
            oauth: None,
        };
        let ports = Ports {
            console: 1,
            companion_link: 2,
            companion_ws: 3,
            vnc_display: 4,
            vnc_ws: 5,
            gdb: None,
        };
        let instance = Arc::new(EmulatorInstance::new(
            Uuid::new_v4(),
            spec,
            Arc::clone(&controller.config),
            ports,
        ));
        let slot = controller.registry.try_admit().unwrap();
        controller
            .registry
            .insert(Arc::clone(&instance), slot)
            .await
            .unwrap();
        instance
    }

    #[test]
    fn selectors_must_be_single_path_components() {
        assert_eq!(validate_selectors("basalt", "4.0").unwrap(), Platform::Basalt);
        for (platform, version) in [
            ("basalt/evil", "4.0"),
            ("basalt", "../4.0"),
            ("basalt", "4.0\\x"),
            ("basalt", ".."),
            ("basalt", ""),
            ("tintin", "4.0"),
        ] {
            let err = validate_selectors(platform, version).unwrap_err();
            assert!(matches!(err, ControllerError::Validation { .. }), "{err}");
        }
    }

    #[test]
    fn credentials_compare_exactly() {
        assert!(constant_time_eq(b"secret", b"secret"));
        assert!(!constant_time_eq(b"secret", b"secreT"));
        assert!(!constant_time_eq(b"secret", b"secret2"));
    }

    #[tokio::test]
    async fn launch_checks_credential_before_capacity() {
        let controller = controller(0);

        let err = controller
            .launch(Some("wrong"), request("basalt", "4.0"))
            .await
            .unwrap_err();
        assert!(matches!(err, ControllerError::Unauthorized));
        let err = controller
            .launch(None, request("basalt", "4.0"))
            .await
            .unwrap_err();
        assert!(matches!(err, ControllerError::Unauthorized));

        let err = controller
            .launch(Some("secret"), request("basalt", "4.0"))
            .await
            .unwrap_err();
        assert!(matches!(err, ControllerError::AtCapacity { limit: 0 }));
    }

    #[tokio::test]
    async fn path_separator_rejected_before_spawn() {
        let controller = controller(1);
        let err = controller
            .launch(Some("secret"), request("basalt/evil", "4.0"))
            .await
            .unwrap_err();
        assert!(matches!(err, ControllerError::Validation { field: "platform", .. }));
        // The slot taken for the rejected launch is free again.
        assert!(controller.registry.try_admit().is_some());
    }

    #[tokio::test]
    async fn ping_unknown_is_dead_without_mutation() {
        let controller = controller(2);
        let instance = register(&controller).await;

        assert!(!controller.ping(Uuid::new_v4()).await);
        assert_eq!(controller.instance_count().await, 1);
        assert!(controller.instance(instance.id()).await.is_some());
    }

    #[tokio::test]
    async fn ping_dead_instance_evicts_it() {
        let controller = controller(2);
        let instance = register(&controller).await;

        assert!(!controller.ping(instance.id()).await);
        assert!(controller.instance(instance.id()).await.is_none());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn ping_live_instance_refreshes_keepalive() {
        let controller = controller(2);
        let instance = register(&controller).await;
        let spawn = || {
            tokio::process::Command::new("sleep")
                .arg("30")
                .kill_on_drop(true)
                .spawn()
                .unwrap()
        };
        instance.adopt(spawn(), spawn()).await;
        let before = instance.last_ping();

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(controller.ping(instance.id()).await);
        assert!(instance.last_ping() > before);

        controller.kill(instance.id()).await;
        assert!(!instance.is_alive().await);
    }

    #[tokio::test]
    async fn kill_is_idempotent() {
        let controller = controller(1);
        let instance = register(&controller).await;

        controller.kill(instance.id()).await;
        controller.kill(instance.id()).await;
        controller.kill(Uuid::new_v4()).await;
        assert_eq!(controller.instance_count().await, 0);
        // The killed instance's slot was released.
        assert!(controller.registry.try_admit().is_some());
    }

    #[tokio::test]
    async fn reaper_threshold_is_exclusive_of_recent_pings() {
        let controller = controller(2);
        let stale = register(&controller).await;
        let fresh = register(&controller).await;

        let now = Instant::now();
        stale.touch(now);
        fresh.touch(now + Duration::from_secs(2));

        let reaped = controller
            .reap_idle(now + Duration::from_secs(301), IDLE_TIMEOUT)
            .await;
        assert_eq!(reaped, 1);
        assert!(controller.instance(stale.id()).await.is_none());
        // 299 seconds since its last ping.
        assert!(controller.instance(fresh.id()).await.is_some());
    }

    #[tokio::test]
    async fn shutdown_kills_everything_and_closes_admission() {
        let controller = controller(2);
        register(&controller).await;
        register(&controller).await;

        controller.shutdown().await;
        assert_eq!(controller.instance_count().await, 0);
        let err = controller
            .launch(Some("secret"), request("basalt", "4.0"))
            .await
            .unwrap_err();
        assert!(matches!(err, ControllerError::AtCapacity { .. }));
    }

    #[tokio::test]
    async fn test_endpoints_require_a_registered_instance() {
        let controller = controller(1);
        let err = controller
            .start_test(
                Uuid::new_v4(),
                Some("secret"),
                Bytes::new(),
                None,
                TestOptions::default(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ControllerError::UnknownInstance));

        let instance = register(&controller).await;
        let err = controller
            .start_test(
                instance.id(),
                Some("nope"),
                Bytes::new(),
                None,
                TestOptions::default(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ControllerError::Unauthorized));
        assert!(controller.test_output(instance.id()).await.unwrap().is_none());
        controller.kill_test(instance.id()).await;
    }

    #[cfg(unix)]
    fn sleeper() -> tokio::process::Child {
        tokio::process::Command::new("sleep")
            .arg("30")
            .kill_on_drop(true)
            .spawn()
            .unwrap()
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn failed_kills_do_not_stop_the_sweep() {
        let mut config = ControllerConfig::new("/q", "/i", "/v", "secret");
        config.kill = crate::process::KillBudget {
            attempts: 0,
            interval: Duration::from_millis(100),
        };
        let controller = Controller::new(config).unwrap();
        let first = register(&controller).await;
        let second = register(&controller).await;
        first.adopt(sleeper(), sleeper()).await;
        second.adopt(sleeper(), sleeper()).await;

        let now = Instant::now();
        first.touch(now);
        second.touch(now);
        let reaped = controller
            .reap_idle(now + Duration::from_secs(301), IDLE_TIMEOUT)
            .await;

        assert_eq!(reaped, 2);
        assert_eq!(controller.instance_count().await, 0);
        assert!(!first.is_alive().await);
        assert!(!second.is_alive().await);
        let metrics = controller.render_metrics().await;
        assert!(metrics.contains("qcon_kill_failures_total 2\n"), "{metrics}");
        assert!(metrics.contains("qcon_instances_reaped_total 2\n"), "{metrics}");
        // Slots are released even when the processes outlived the budget.
        assert!(metrics.contains("qcon_slots_in_use 0\n"), "{metrics}");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_refused_once_kill_has_started() {
        let controller = controller(1);
        let instance = register(&controller).await;
        instance.adopt(sleeper(), sleeper()).await;

        // Park `kill` after it has cancelled but before it has touched any state.
        let slot = instance.test_run_slot().lock().await;
        let killing = tokio::spawn({
            let instance = Arc::clone(&instance);
            async move { instance.kill().await }
        });
        while !instance.is_shutting_down() {
            tokio::task::yield_now().await;
        }
        assert_eq!(instance.state().await, InstanceState::Ready);
        drop(slot);

        let err = controller
            .start_test(
                instance.id(),
                Some("secret"),
                Bytes::new(),
                None,
                TestOptions::default(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ControllerError::UnknownInstance));

        killing.await.unwrap().unwrap();
        assert!(instance.test_run_slot().lock().await.is_none());
    }
}
