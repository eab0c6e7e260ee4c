use std::io::Write;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use halo_core::{
    Capability, DeviceIdentity, FirmwareChannel, FirmwareInfo, HardwareInfo, OtaPriority, Qos,
};
use halo_prime::bootstrap::BootstrapOrchestrator;
use halo_prime::cache::{Cache, MemoryCache};
use halo_prime::config::{Config, ConfigError, ResolutionMode};
use halo_prime::credentials::{
    CredentialError, CredentialIssuer, IssuedCredential, RandomCredentialIssuer,
};
use halo_prime::idempotency::IdempotencyGuard;
use jiff::SignedDuration;
use tempfile::NamedTempFile;

const EXAMPLE_CONFIG: &str = include_str!("../halo-prime.example.toml");

struct CountingIssuer {
    inner: RandomCredentialIssuer,
    calls: AtomicUsize,
}

impl CountingIssuer {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: RandomCredentialIssuer::new(SignedDuration::from_hours(24), 32),
            calls: AtomicUsize::new(0),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CredentialIssuer for CountingIssuer {
    async fn issue(
        &self,
        device_id: &str,
        tenant_id: &str,
    ) -> Result<IssuedCredential, CredentialError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.inner.issue(device_id, tenant_id).await
    }
}

#[derive(Debug, thiserror::Error)]
#[error("cache backend offline")]
struct Offline;

struct FailingCache;

#[async_trait]
impl Cache for FailingCache {
    type Error = Offline;

    async fn get(&self, _key: &str) -> Result<Option<String>, Self::Error> {
        Err(Offline)
    }

    async fn set(&self, _key: &str, _value: String, _ttl: Duration) -> Result<(), Self::Error> {
        Err(Offline)
    }

    async fn insert_if_absent(
        &self,
        _key: &str,
        _value: String,
        _ttl: Duration,
    ) -> Result<String, Self::Error> {
        Err(Offline)
    }
}

fn sensor(device_id: &str) -> DeviceIdentity {
    DeviceIdentity {
        device_id: device_id.into(),
        mac: "02:42:AC:11:00:02".into(),
        device_type: "sensor".into(),
        hardware: HardwareInfo {
            version: Some("rev-c".into()),
            serial: Some("SN-0001".into()),
        },
        firmware: FirmwareInfo {
            current: Some("1.0.0".into()),
            build: Some("1000".into()),
            min_required: None,
            channel: Some(FirmwareChannel::Beta),
        },
        capabilities: Box::new([Capability {
            name: "gps".into(),
            version: Some("2".into()),
        }]),
        tenant_id: Some("default".into()),
    }
}

fn guard_with<C: Cache>(
    config: &Config,
    issuer: Arc<CountingIssuer>,
    cache: C,
) -> IdempotencyGuard<C> {
    let orchestrator = BootstrapOrchestrator::from_config(config, issuer);
    IdempotencyGuard::new(Arc::new(orchestrator), cache)
}

fn load_from_file(content: &str) -> Result<Config, ConfigError> {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(content.as_bytes()).unwrap();
    Config::load(file.path())
}

#[tokio::test]
async fn beta_sensor_receives_full_contract() {
    let guard = guard_with(&Config::default(), CountingIssuer::new(), MemoryCache::new());
    let envelope = guard.handle(&sensor("dev-1"), None, Some("msg-1")).await;

    assert_eq!(envelope.code, 200);
    assert!(envelope.error_code.is_none());
    assert!(guard.orchestrator().verify_signature(&envelope));

    let data = envelope.data.unwrap();
    let topics = &data.cfg.topics;
    assert_eq!(topics.telemetry_pub, "iot/default/sensor/dev-1/telemetry");
    assert_eq!(topics.ota_progress_pub, "iot/default/sensor/dev-1/ota/progress");
    assert_eq!(topics.shadow_desired_sub, "iot/default/sensor/dev-1/shadow/desired");

    assert_eq!(data.policies.qos_retain.len(), 9);
    assert!(data.policies.acl.topics().all(|t| topics.contains(t)));
    let status = data
        .policies
        .qos_retain
        .iter()
        .find(|e| e.topic == topics.status_pub)
        .unwrap();
    assert_eq!((status.qos, status.retain), (Qos::AtLeastOnce, true));

    assert!(data.ota.available);
    let target = data.ota.target_firmware.as_ref().unwrap();
    assert_eq!(target.version, "1.3.0-beta.1");
    assert_eq!(target.constraints.hardware_version.as_deref(), Some("rev-c"));
    assert_eq!(data.ota.strategy.priority, OtaPriority::Medium);

    assert_eq!(data.mqtt.client_id, "dev-1");
    assert_eq!(data.mqtt.password.len(), 32);
    assert!(data.cfg.expires_at > data.cfg.issued_at);
    assert!(data.cfg.expires_at <= data.mqtt.password_expires_at);

    let wire = serde_json::to_value(&data).unwrap();
    assert!(wire["cfg"]["topics"]["cmdSub"].is_string());
    assert_eq!(wire["policies"]["qosRetain"][0]["qos"], 1);
    assert!(wire["ota"]["targetFirmware"].is_object());
}

#[tokio::test]
async fn retry_with_same_message_id_replays_envelope() {
    let issuer = CountingIssuer::new();
    let guard = guard_with(&Config::default(), Arc::clone(&issuer), MemoryCache::new());

    let first = guard.handle(&sensor("dev-2"), None, Some("msg-1")).await;
    let second = guard.handle(&sensor("dev-2"), None, Some("msg-1")).await;

    assert_eq!(
        serde_json::to_string(&first).unwrap(),
        serde_json::to_string(&second).unwrap()
    );
    assert_eq!(issuer.calls(), 1);

    let third = guard.handle(&sensor("dev-2"), None, Some("msg-2")).await;
    assert_eq!(issuer.calls(), 2);
    assert_ne!(
        first.data.unwrap().mqtt.password,
        third.data.unwrap().mqtt.password
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_retries_converge_on_one_envelope() {
    let guard = Arc::new(guard_with(
        &Config::default(),
        CountingIssuer::new(),
        MemoryCache::new(),
    ));

    let handles: Vec<_> = (0..16)
        .map(|_| {
            let guard = Arc::clone(&guard);
            tokio::spawn(async move {
                let envelope = guard.handle(&sensor("dev-3"), None, Some("msg-race")).await;
                serde_json::to_string(&envelope).unwrap()
            })
        })
        .collect();

    let mut envelopes = Vec::new();
    for handle in handles {
        envelopes.push(handle.await.unwrap());
    }

    assert!(envelopes.iter().all(|e| e == &envelopes[0]));
}

#[tokio::test]
async fn failing_cache_still_answers() {
    let issuer = CountingIssuer::new();
    let guard = guard_with(&Config::default(), Arc::clone(&issuer), FailingCache);

    let first = guard.handle(&sensor("dev-4"), None, Some("msg-1")).await;
    let second = guard.handle(&sensor("dev-4"), None, Some("msg-1")).await;

    assert_eq!(first.code, 200);
    assert_eq!(second.code, 200);
    // Without a cache every retry is orchestrated again.
    assert_eq!(issuer.calls(), 2);
}

#[tokio::test]
async fn every_bootstrap_issues_a_fresh_password() {
    let issuer = CountingIssuer::new();
    let guard = guard_with(&Config::default(), Arc::clone(&issuer), MemoryCache::new());

    let mut passwords = std::collections::HashSet::new();
    for _ in 0..5 {
        let envelope = guard.handle(&sensor("dev-5"), None, None).await;
        passwords.insert(envelope.data.unwrap().mqtt.password);
    }

    assert_eq!(passwords.len(), 5);
    assert_eq!(issuer.calls(), 5);
}

#[tokio::test]
async fn resolution_mode_decides_unknown_device_types() {
    let strict = load_from_file(EXAMPLE_CONFIG).unwrap();
    assert_eq!(strict.bootstrap.resolution_mode, ResolutionMode::Strict);

    let mut toaster = sensor("dev-6");
    toaster.device_type = "toaster".into();

    let guard = guard_with(&strict, CountingIssuer::new(), MemoryCache::new());
    let envelope = guard.handle(&toaster, None, Some("msg-1")).await;
    assert_eq!(envelope.code, 422);
    assert_eq!(envelope.error_code.as_deref(), Some("UNKNOWN_DEVICE_TYPE"));
    assert!(envelope.data.is_none());

    let permissive = load_from_file(
        &EXAMPLE_CONFIG.replace("resolution_mode = \"strict\"", "resolution_mode = \"permissive\""),
    )
    .unwrap();
    let guard = guard_with(&permissive, CountingIssuer::new(), MemoryCache::new());
    let envelope = guard.handle(&toaster, None, Some("msg-1")).await;
    assert_eq!(envelope.code, 200);

    let data = envelope.data.unwrap();
    assert!(data.cfg.degraded);
    assert!(!data.ota.available);
    assert!(data.ota.target_firmware.is_none());
    assert_eq!(guard.orchestrator().registry().stats().fallbacks, 1);
}

#[tokio::test]
async fn example_config_tenant_policy_applies() {
    let config = load_from_file(EXAMPLE_CONFIG).unwrap();
    let guard = guard_with(&config, CountingIssuer::new(), MemoryCache::new());

    // acme only allows stable, so a beta device gets no upgrade.
    let envelope = guard.handle(&sensor("dev-7"), Some("acme"), None).await;
    assert_eq!(envelope.code, 400, "identity claims a different tenant");

    let mut acme_device = sensor("dev-7");
    acme_device.tenant_id = Some("acme".into());
    let data = guard
        .handle(&acme_device, None, None)
        .await
        .data
        .unwrap();
    assert!(!data.ota.available);

    let telemetry = data
        .policies
        .qos_retain
        .iter()
        .find(|e| e.topic == data.cfg.topics.telemetry_pub)
        .unwrap();
    assert_eq!(telemetry.qos, Qos::AtMostOnce);
    let reported = data
        .policies
        .qos_retain
        .iter()
        .find(|e| e.topic == data.cfg.topics.shadow_reported_pub)
        .unwrap();
    assert!(reported.retain);

    assert_eq!(data.mqtt.brokers[0].url, "mqtts://broker-a.example.com:8883");
    assert_eq!(data.shadow_desired.thresholds["temperatureHigh"], 45.0);
}

#[tokio::test]
async fn app_state_warms_configured_tenants() {
    let config = load_from_file(EXAMPLE_CONFIG).unwrap();
    let state = halo_prime::app_state(&config, MemoryCache::new());

    let stats = state.registry.stats();
    assert_eq!(stats.tenants, 2);
    assert_eq!(stats.resolvers, 4);
    assert_eq!(stats.constructions, 4);
    assert!(state.registry.is_tenant_registered("acme"));
    assert_eq!(
        state.registry.tenant_device_types("default"),
        vec!["gateway".to_string(), "sensor".to_string()]
    );
}

#[test]
fn out_of_range_qos_override_fails_to_load() {
    let bad = EXAMPLE_CONFIG.replace(
        "\"telemetry\" = { qos = 0, retain = false }",
        "\"telemetry\" = { qos = 3, retain = false }",
    );
    assert!(matches!(load_from_file(&bad), Err(ConfigError::Parse(_))));
}

#[test]
fn missing_file_is_an_io_error() {
    let dir = tempfile::tempdir().unwrap();
    let missing = dir.path().join("absent.toml");
    assert!(matches!(Config::load(&missing), Err(ConfigError::Io(_))));
}
