use super::*;
use crate::channel::SecretSubmission;
use crate::config::{EnforcerConfig, RetryCfg};
use crate::device::{DeviceClass, EnforcementState};
use crate::error::TokenError;
use crate::events::{EnforcerEvent, EventType};
use crate::fake::FakePlatform;
use crate::operation::Phase;
use protocol::ErrorKind;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Barrier;
use std::time::{Duration, Instant};
use tempfile::{tempdir, TempDir};
use usb_enforcer_provider::{DevType, DeviceProperties, FilesystemType, LuksVersion};

const GOOD_PASSPHRASE: &[u8] = b"correcthorsebatterystaple1";

struct Harness {
    dir: TempDir,
    platform: Arc<FakePlatform>,
    ctx: Arc<EnforcerContext<FakePlatform>>,
    service: EnforcerService<FakePlatform>,
}

fn sample_config(root: &Path) -> EnforcerConfig {
    let mut config = EnforcerConfig::default();
    config.mount.mount_root = root.join("media").display().to_string();
    config.staging.root = root.join("staging").display().to_string();
    config.encryption.min_passphrase_length = 12;
    config.retry = RetryCfg {
        max_attempts: 3,
        base_delay_ms: 1,
        max_delay_ms: 2,
        jitter_ratio: 0.0,
    };
    config
}

fn harness_with(adjust: impl FnOnce(&mut EnforcerConfig)) -> Harness {
    let dir = tempdir().unwrap();
    let mut config = sample_config(dir.path());
    adjust(&mut config);
    let platform = Arc::new(FakePlatform::new(dir.path()));
    let ctx = EnforcerContext::new(config, platform.clone());
    let engine = Arc::new(EnforcementEngine::new(ctx.clone()));
    let service = EnforcerService::new(engine);
    Harness {
        dir,
        platform,
        ctx,
        service,
    }
}

fn harness() -> Harness {
    harness_with(|_| {})
}

impl Harness {
    fn plug(&self, path: &str) -> EnforcerResult<EnforcementState> {
        self.service
            .engine()
            .device_added(self.platform.props(path))
    }

    fn token(&self, path: &str, kind: OperationKind, passphrase: &[u8]) -> EnforcerResult<String> {
        self.service.submit_secret(SecretSubmission {
            device: path.to_string(),
            kind,
            passphrase: SecretBytes::from(passphrase),
        })
    }

    /// Wait for the operation on `path` to finish and the device to leave
    /// `Suspended`. Returns the settled state, `None` once the device is gone.
    fn settle(&self, path: &str) -> Option<EnforcementState> {
        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            let state = self.ctx.registry().state_of(path);
            let busy = self.ctx.operations().contains(path);
            if !busy && state != Some(EnforcementState::Suspended) {
                return state;
            }
            assert!(Instant::now() < deadline, "operation on {path} never settled");
            thread::sleep(Duration::from_millis(10));
        }
    }

    fn mountpoint(&self, path: &str) -> PathBuf {
        PathBuf::from(self.service.device_status(path).unwrap().mountpoint.unwrap())
    }
}

fn drain(rx: &mut broadcast::Receiver<EnforcerEvent>) -> Vec<EnforcerEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

fn has_event(events: &[EnforcerEvent], path: &str, event_type: EventType) -> bool {
    events
        .iter()
        .any(|e| e.path == path && e.event_type == event_type)
}

#[test]
fn plaintext_exfat_insert_is_announced_and_write_blocked() {
    let h = harness();
    let mut rx = h.service.subscribe();
    h.platform.add_plaintext("/dev/sdb1", "exfat");

    assert_eq!(h.plug("/dev/sdb1").unwrap(), EnforcementState::ReadOnlyEnforced);

    let events = drain(&mut rx);
    assert!(has_event(&events, "/dev/sdb1", EventType::Added));
    assert!(has_event(&events, "/dev/sdb1", EventType::EnforcementApplied));
    assert!(h.platform.write_block("/dev/sdb1").is_err());

    let summary = h.service.device_status("/dev/sdb1").unwrap();
    assert_eq!(summary.class, DeviceClass::PlaintextPartition);
    assert_eq!(summary.state, EnforcementState::ReadOnlyEnforced);
}

#[test]
fn exempted_group_members_keep_write_access() {
    let h = harness_with(|cfg| cfg.policy.exempted_groups = vec!["dlp-exempt".into()]);
    h.platform.add_plaintext("/dev/sdb1", "ext4");
    h.platform.add_plaintext("/dev/sdc1", "vfat");

    h.platform.set_groups(&["users", "dlp-exempt"]);
    assert_eq!(h.plug("/dev/sdb1").unwrap(), EnforcementState::Exempt);
    assert!(h.platform.write_block("/dev/sdb1").is_ok());

    h.platform.set_groups(&["users"]);
    assert_eq!(h.plug("/dev/sdc1").unwrap(), EnforcementState::ReadOnlyEnforced);
}

#[test]
fn transient_busy_is_retried_then_reported() {
    let h = harness();
    let mut rx = h.service.subscribe();
    h.platform.add_plaintext("/dev/sdb1", "exfat");
    h.platform.add_plaintext("/dev/sdc1", "exfat");

    h.platform.busy_for("/dev/sdb1", 2);
    assert_eq!(h.plug("/dev/sdb1").unwrap(), EnforcementState::ReadOnlyEnforced);

    h.platform.busy_for("/dev/sdc1", 10);
    let err = h.plug("/dev/sdc1").unwrap_err();
    assert!(matches!(err, EnforcerError::Enforcement { .. }));
    assert_eq!(
        h.ctx.registry().state_of("/dev/sdc1"),
        Some(EnforcementState::Unmonitored)
    );
    assert!(has_event(
        &drain(&mut rx),
        "/dev/sdc1",
        EventType::EnforcementFailed
    ));

    // The other device is unaffected.
    assert_eq!(
        h.ctx.registry().state_of("/dev/sdb1"),
        Some(EnforcementState::ReadOnlyEnforced)
    );
}

#[test]
fn mapper_inherits_usb_bus_from_backing_device() {
    let h = harness();
    h.platform
        .add_luks("/dev/sdb1", LuksVersion::Luks2, GOOD_PASSPHRASE, "exfat");
    assert_eq!(h.plug("/dev/sdb1").unwrap(), EnforcementState::WriteAllowed);

    let mut mapper = DeviceProperties::new("/dev/dm-0", DevType::Disk);
    mapper.is_mapper = true;
    mapper.parent = Some("/dev/sdb1".into());
    mapper.fs_type = Some("exfat".into());
    let state = h.service.engine().device_added(mapper).unwrap();

    assert_eq!(state, EnforcementState::WriteAllowed);
    let summary = h.service.device_status("/dev/dm-0").unwrap();
    assert_eq!(summary.class, DeviceClass::Mapper);
    assert_eq!(summary.bus.as_deref(), Some("usb"));
}

#[test]
fn short_passphrase_never_gets_a_token() {
    let h = harness();
    h.platform.add_plaintext("/dev/sdb1", "exfat");
    h.plug("/dev/sdb1").unwrap();

    let err = h
        .token("/dev/sdb1", OperationKind::Encrypt, b"hunter2")
        .unwrap_err();
    assert!(matches!(
        err,
        EnforcerError::PassphraseTooShort { min: 12, got: 7 }
    ));
    assert!(h.ctx.tokens().is_empty());
}

#[test]
fn encrypt_turns_plaintext_into_writable_luks2() {
    let h = harness();
    let mut rx = h.service.subscribe();
    h.platform.add_plaintext("/dev/sdb1", "exfat");
    h.plug("/dev/sdb1").unwrap();

    let token = h
        .token("/dev/sdb1", OperationKind::Encrypt, GOOD_PASSPHRASE)
        .unwrap();
    let options = EncryptOptions {
        filesystem_type: Some(FilesystemType::Exfat),
        ..EncryptOptions::default()
    };
    h.service
        .request_encrypt("/dev/sdb1", &token, options)
        .unwrap();

    assert_eq!(h.settle("/dev/sdb1"), Some(EnforcementState::WriteAllowed));
    let summary = h.service.device_status("/dev/sdb1").unwrap();
    assert_eq!(summary.class, DeviceClass::Luks2);
    assert!(summary.operation.is_none());
    assert!(h.platform.write_block("/dev/sdb1").is_ok());

    let mountpoint = h.mountpoint("/dev/sdb1");
    assert!(mountpoint.ends_with("usbenc-sdb1"));
    assert!(h.platform.is_mounted(&mountpoint));

    let calls = h.platform.calls();
    assert!(calls
        .iter()
        .any(|c| c == "luksFormat /dev/sdb1 argon2id aes-xts-plain64"));
    assert!(calls
        .iter()
        .any(|c| c.starts_with("mkfs exfat /dev/mapper/usbenc-sdb1")));

    let events = drain(&mut rx);
    let phases: Vec<_> = events
        .iter()
        .filter(|e| e.event_type == EventType::OperationPhase)
        .map(|e| e.detail.clone())
        .collect();
    assert_eq!(
        phases,
        vec![
            "validate",
            "luks-format",
            "open",
            "make-filesystem",
            "mount",
            "finalize"
        ]
    );
    assert!(has_event(&events, "/dev/sdb1", EventType::OperationStarted));
    assert!(has_event(&events, "/dev/sdb1", EventType::OperationCompleted));
}

#[test]
fn encrypt_with_preserve_keeps_content_and_removes_staging() {
    let h = harness();
    let backing = h.platform.add_plaintext("/dev/sdb1", "vfat");
    fs::create_dir_all(backing.join("notes")).unwrap();
    fs::write(backing.join("notes/plan.txt"), b"ship it on friday").unwrap();
    h.plug("/dev/sdb1").unwrap();

    let token = h
        .token("/dev/sdb1", OperationKind::Encrypt, GOOD_PASSPHRASE)
        .unwrap();
    let options = EncryptOptions {
        preserve_data: true,
        ..EncryptOptions::default()
    };
    h.service
        .request_encrypt("/dev/sdb1", &token, options)
        .unwrap();

    assert_eq!(h.settle("/dev/sdb1"), Some(EnforcementState::WriteAllowed));
    let mountpoint = h.mountpoint("/dev/sdb1");
    assert_eq!(
        fs::read(mountpoint.join("notes/plan.txt")).unwrap(),
        b"ship it on friday"
    );

    let staging_root = h.dir.path().join("staging");
    let leftovers: Vec<_> = fs::read_dir(&staging_root).unwrap().collect();
    assert!(leftovers.is_empty(), "staging not cleaned: {leftovers:?}");

    // The temporary plaintext mount is gone once the device is released.
    let preserve_dirs: Vec<_> = fs::read_dir(h.dir.path().join("media"))
        .unwrap()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_name().to_string_lossy().starts_with(".preserve-"))
        .collect();
    assert!(preserve_dirs.is_empty(), "preserve mounts left: {preserve_dirs:?}");
}

#[test]
fn failed_mkfs_is_phase_tagged_and_cleans_up() {
    let h = harness();
    let mut rx = h.service.subscribe();
    h.platform.add_plaintext("/dev/sdb1", "exfat");
    h.plug("/dev/sdb1").unwrap();
    h.platform.fail_mkfs();

    let token = h
        .token("/dev/sdb1", OperationKind::Encrypt, GOOD_PASSPHRASE)
        .unwrap();
    h.service
        .request_encrypt("/dev/sdb1", &token, EncryptOptions::default())
        .unwrap();
    h.settle("/dev/sdb1");

    let events = drain(&mut rx);
    let failure = events
        .iter()
        .find(|e| e.event_type == EventType::OperationFailed)
        .expect("failure event");
    assert!(failure
        .detail
        .starts_with(Phase::MakeFilesystem.as_str()));
    assert!(h.platform.active_mappings().is_empty());
    assert!(h.ctx.operations().is_empty());
}

#[test]
fn second_encrypt_during_operation_is_rejected() {
    let h = harness();
    h.platform.add_plaintext("/dev/sdb1", "exfat");
    h.plug("/dev/sdb1").unwrap();

    let id = h
        .service
        .engine()
        .begin_operation("/dev/sdb1", OperationKind::Encrypt)
        .unwrap();
    let token = h
        .token("/dev/sdb1", OperationKind::Encrypt, GOOD_PASSPHRASE)
        .unwrap();

    let err = h
        .service
        .request_encrypt("/dev/sdb1", &token, EncryptOptions::default())
        .unwrap_err();
    assert!(matches!(err, EnforcerError::OperationInProgress(_)));
    assert_eq!(h.ctx.operations().len(), 1);
    assert_eq!(h.ctx.tokens().pending(), 1);

    h.service.engine().operation_ended(
        &id,
        OperationOutcome::Failed {
            phase: Phase::Validate,
            message: "cancelled by test".into(),
        },
    );
    assert_eq!(h.settle("/dev/sdb1"), Some(EnforcementState::ReadOnlyEnforced));
}

#[test]
fn racing_requests_start_one_operation_and_keep_the_losing_token() {
    let h = harness();
    h.platform.add_plaintext("/dev/sdb1", "exfat");
    h.plug("/dev/sdb1").unwrap();

    let tokens: Vec<String> = (0..2)
        .map(|_| {
            h.token("/dev/sdb1", OperationKind::Encrypt, GOOD_PASSPHRASE)
                .unwrap()
        })
        .collect();
    let barrier = Barrier::new(tokens.len());

    let results: Vec<EnforcerResult<OperationId>> = thread::scope(|scope| {
        let handles: Vec<_> = tokens
            .iter()
            .map(|token| {
                let service = &h.service;
                let barrier = &barrier;
                scope.spawn(move || {
                    barrier.wait();
                    service.request_encrypt("/dev/sdb1", token, EncryptOptions::default())
                })
            })
            .collect();
        handles.into_iter().map(|handle| handle.join().unwrap()).collect()
    });

    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    let lost = results.iter().find_map(|r| r.as_ref().err()).unwrap();
    // Ineligible when the winner already finished and the device is LUKS2.
    assert!(matches!(
        lost,
        EnforcerError::OperationInProgress(_) | EnforcerError::Ineligible { .. }
    ));
    assert_eq!(h.ctx.tokens().pending(), 1);

    assert_eq!(h.settle("/dev/sdb1"), Some(EnforcementState::WriteAllowed));
}

#[test]
fn rejected_token_leaves_no_operation_behind() {
    let h = harness();
    h.platform.add_plaintext("/dev/sdb1", "exfat");
    h.plug("/dev/sdb1").unwrap();
    let mut rx = h.service.subscribe();

    let err = h
        .service
        .request_encrypt("/dev/sdb1", "not-a-token", EncryptOptions::default())
        .unwrap_err();
    assert!(matches!(err, EnforcerError::Token(TokenError::NotFound)));
    assert!(h.ctx.operations().is_empty());
    assert_eq!(
        h.ctx.registry().state_of("/dev/sdb1"),
        Some(EnforcementState::ReadOnlyEnforced)
    );
    assert!(!has_event(
        &drain(&mut rx),
        "/dev/sdb1",
        EventType::OperationStarted
    ));
}

#[test]
fn slow_session_lookup_does_not_stall_operation_start() {
    let h = harness_with(|cfg| cfg.policy.exempted_groups = vec!["dlp-exempt".into()]);
    h.platform.add_plaintext("/dev/sdb1", "exfat");
    h.platform.add_plaintext("/dev/sdc1", "exfat");
    h.plug("/dev/sdc1").unwrap();

    h.platform.slow_sessions(Duration::from_millis(1500));
    let engine = h.service.engine().clone();
    let props = h.platform.props("/dev/sdb1");
    let plugging = thread::spawn(move || engine.device_added(props));
    thread::sleep(Duration::from_millis(200));

    let started = Instant::now();
    let id = h
        .service
        .engine()
        .begin_operation("/dev/sdc1", OperationKind::Encrypt)
        .unwrap();
    assert!(started.elapsed() < Duration::from_millis(750));

    assert_eq!(
        plugging.join().unwrap().unwrap(),
        EnforcementState::ReadOnlyEnforced
    );
    h.platform.slow_sessions(Duration::ZERO);
    h.service.engine().operation_ended(
        &id,
        OperationOutcome::Failed {
            phase: Phase::Validate,
            message: "cancelled by test".into(),
        },
    );
    assert_eq!(h.settle("/dev/sdc1"), Some(EnforcementState::ReadOnlyEnforced));
}

#[test]
fn active_operation_holds_device_suspended() {
    let h = harness();
    h.platform.add_plaintext("/dev/sdb1", "exfat");
    h.plug("/dev/sdb1").unwrap();

    let id = h
        .service
        .engine()
        .begin_operation("/dev/sdb1", OperationKind::Encrypt)
        .unwrap();
    let calls_before = h.platform.calls().len();

    // A change event mid-operation must not touch the block device.
    assert_eq!(h.plug("/dev/sdb1").unwrap(), EnforcementState::Suspended);
    assert_eq!(h.platform.calls().len(), calls_before);
    assert_eq!(
        h.ctx.registry().state_of("/dev/sdb1"),
        Some(EnforcementState::Suspended)
    );

    h.service.engine().operation_ended(
        &id,
        OperationOutcome::Succeeded { mountpoint: None },
    );
    assert_eq!(
        h.ctx.registry().state_of("/dev/sdb1"),
        Some(EnforcementState::ReadOnlyEnforced)
    );
}

#[test]
fn removal_while_suspended_aborts_operation() {
    let h = harness();
    let mut rx = h.service.subscribe();
    h.platform.add_plaintext("/dev/sdb1", "exfat");
    h.plug("/dev/sdb1").unwrap();
    let id = h
        .service
        .engine()
        .begin_operation("/dev/sdb1", OperationKind::Encrypt)
        .unwrap();

    h.platform.unplug("/dev/sdb1");
    h.service.engine().device_removed("/dev/sdb1");

    assert!(!h.ctx.registry().contains("/dev/sdb1"));
    assert!(h.ctx.operations().get("/dev/sdb1").unwrap().aborted);
    assert!(h.service.engine().is_aborted(&id));
    let events = drain(&mut rx);
    assert!(has_event(&events, "/dev/sdb1", EventType::Removed));
    assert!(has_event(&events, "/dev/sdb1", EventType::OperationAborted));

    h.service.engine().operation_ended(
        &id,
        OperationOutcome::Failed {
            phase: Phase::LuksFormat,
            message: "device was removed".into(),
        },
    );
    assert!(h.ctx.operations().is_empty());
    assert!(!h.ctx.registry().contains("/dev/sdb1"));
}

#[test]
fn tokens_are_single_use_through_the_api() {
    let h = harness();
    h.platform
        .add_luks("/dev/sdc1", LuksVersion::Luks2, GOOD_PASSPHRASE, "ext4");
    h.plug("/dev/sdc1").unwrap();

    let token = h
        .token("/dev/sdc1", OperationKind::Unlock, GOOD_PASSPHRASE)
        .unwrap();
    h.service.request_unlock("/dev/sdc1", &token).unwrap();
    assert_eq!(h.settle("/dev/sdc1"), Some(EnforcementState::WriteAllowed));
    assert!(h.platform.is_mounted(&h.mountpoint("/dev/sdc1")));

    let err = h.service.request_unlock("/dev/sdc1", &token).unwrap_err();
    assert!(matches!(err, EnforcerError::Token(TokenError::Consumed)));
}

#[test]
fn encrypt_token_cannot_unlock() {
    let h = harness();
    h.platform
        .add_luks("/dev/sdc1", LuksVersion::Luks2, GOOD_PASSPHRASE, "ext4");
    h.plug("/dev/sdc1").unwrap();

    let token = h
        .token("/dev/sdc1", OperationKind::Encrypt, GOOD_PASSPHRASE)
        .unwrap();
    let err = h.service.request_unlock("/dev/sdc1", &token).unwrap_err();
    assert!(matches!(err, EnforcerError::Token(TokenError::KindMismatch)));
    assert!(h.ctx.operations().is_empty());
}

#[test]
fn luks1_unlocks_read_only_when_allowed() {
    let h = harness();
    h.platform
        .add_luks("/dev/sdd1", LuksVersion::Luks1, b"legacy-secret", "ext4");
    assert_eq!(h.plug("/dev/sdd1").unwrap(), EnforcementState::ReadOnlyEnforced);

    let token = h
        .token("/dev/sdd1", OperationKind::Unlock, b"legacy-secret")
        .unwrap();
    h.service.request_unlock("/dev/sdd1", &token).unwrap();
    assert_eq!(
        h.settle("/dev/sdd1"),
        Some(EnforcementState::ReadOnlyEnforced)
    );

    let calls = h.platform.calls();
    assert!(calls.iter().any(|c| c == "open /dev/sdd1 usbenc-sdd1 ro=true"));
    assert!(calls
        .iter()
        .any(|c| c.starts_with("mount /dev/mapper/usbenc-sdd1") && c.ends_with(",ro")));
}

#[test]
fn luks1_unlock_refused_when_policy_forbids() {
    let h = harness_with(|cfg| cfg.policy.allow_luks1_readonly = false);
    h.platform
        .add_luks("/dev/sdd1", LuksVersion::Luks1, b"legacy-secret", "ext4");
    h.plug("/dev/sdd1").unwrap();

    let token = h
        .token("/dev/sdd1", OperationKind::Unlock, b"legacy-secret")
        .unwrap();
    let err = h.service.request_unlock("/dev/sdd1", &token).unwrap_err();
    assert!(matches!(err, EnforcerError::Ineligible { .. }));
    assert_eq!(h.ctx.tokens().pending(), 1);
}

#[test]
fn wrong_passphrase_fails_in_open_phase() {
    let h = harness();
    let mut rx = h.service.subscribe();
    h.platform
        .add_luks("/dev/sdc1", LuksVersion::Luks2, GOOD_PASSPHRASE, "ext4");
    h.plug("/dev/sdc1").unwrap();

    let token = h
        .token("/dev/sdc1", OperationKind::Unlock, b"not the passphrase")
        .unwrap();
    h.service.request_unlock("/dev/sdc1", &token).unwrap();
    assert_eq!(h.settle("/dev/sdc1"), Some(EnforcementState::WriteAllowed));

    let events = drain(&mut rx);
    let failure = events
        .iter()
        .find(|e| e.event_type == EventType::OperationFailed)
        .expect("failure event");
    assert!(failure.detail.starts_with("open:"));
    assert!(h.service.device_status("/dev/sdc1").unwrap().mountpoint.is_none());
}

#[test]
fn handle_maps_errors_to_kinds() {
    let h = harness();
    match h.service.handle(ApiRequest::GetDeviceStatus {
        path: "/dev/nope".into(),
    }) {
        ApiResponse::Error { kind, .. } => assert_eq!(kind, ErrorKind::NotFound),
        other => panic!("unexpected response {other:?}"),
    }
    assert!(matches!(
        h.service.handle(ApiRequest::Ping),
        ApiResponse::Pong { .. }
    ));

    h.platform.add_plaintext("/dev/sdb1", "exfat");
    h.plug("/dev/sdb1").unwrap();
    match h.service.handle(ApiRequest::ListDevices) {
        ApiResponse::Devices { devices } => {
            assert_eq!(devices.len(), 1);
            assert_eq!(devices[0].state, EnforcementState::ReadOnlyEnforced);
        }
        other => panic!("unexpected response {other:?}"),
    }
}

#[test]
fn reaper_scrubs_expired_tokens() {
    let h = harness_with(|cfg| cfg.secrets.token_ttl_secs = 0);
    h.token("/dev/sdb1", OperationKind::Unlock, b"whatever").unwrap();
    assert_eq!(h.service.purge_tokens(), 1);
    assert!(h.ctx.tokens().is_empty());
}
