//! Client and helper talking over a real Unix socket, with the emulated SMC
//! standing in for the hardware.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use sf_core::smc::{EmulatedSmc, RegisterKey};
use sf_core::{
    BackendKind, FixedLoad, HelperClient, HelperTransport, PermissionState, SmcError, SmcService,
    SmcSettings,
};
use sf_helper::{bind, serve, HardwareService, ServerConfig};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

struct Harness {
    _dir: tempfile::TempDir,
    socket: std::path::PathBuf,
    smc: EmulatedSmc,
    shutdown: Option<oneshot::Sender<()>>,
    server: JoinHandle<()>,
}

impl Harness {
    fn start() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("smcfan.sock");
        let smc = EmulatedSmc::macbook_pro();
        let hardware = Arc::new(HardwareService::new(Box::new(smc.clone())));

        let config = ServerConfig {
            verify_client_exe: false,
            ..ServerConfig::default()
        };
        let listener = bind(&socket, config.socket_mode).unwrap();
        let (tx, rx) = oneshot::channel();
        let server = tokio::spawn(serve(listener, hardware, config, async {
            let _ = rx.await;
        }));

        Self {
            _dir: dir,
            socket,
            smc,
            shutdown: Some(tx),
            server,
        }
    }

    fn client(&self) -> HelperClient {
        client_for(&self.socket)
    }

    async fn stop(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        let _ = self.server.await;
    }
}

fn client_for(socket: &Path) -> HelperClient {
    HelperClient::new(socket, Duration::from_secs(2), 3, 100)
}

#[tokio::test]
async fn test_reads_through_helper() {
    let harness = Harness::start();
    let client = harness.client();

    client.connect().await.unwrap();
    assert!(harness.smc.is_open());

    assert_eq!(client.read_key("TC0P").await.unwrap(), 45.5);
    assert_eq!(client.read_key("TC0D").await.unwrap(), 48.25);

    let keys = client.read_all_temperature_keys().await.unwrap();
    assert!(keys.contains(&"TG0P".to_string()));

    assert_eq!(client.get_fan_count().await.unwrap(), 2);
    let fan = client.get_fan_info(1).await.unwrap();
    assert_eq!((fan.min, fan.max, fan.current), (1300.0, 5500.0, 2100.0));

    let status = client.check_status().await.unwrap();
    assert!(status.connected);
    assert_eq!(status.driver, "emulated");
    assert!(!client.get_version().await.unwrap().is_empty());

    client.disconnect().await.unwrap();
    assert!(!harness.smc.is_open());
    harness.stop().await;
}

#[tokio::test]
async fn test_fan_writes_reach_registers() {
    let harness = Harness::start();
    let client = harness.client();
    client.connect().await.unwrap();

    client.set_fan_speed(0, 3000.0).await.unwrap();
    let target = RegisterKey::parse("F0Tg").unwrap();
    let mode = RegisterKey::parse("F0Md").unwrap();
    assert_eq!(harness.smc.value(target), Some(3000.0));
    assert_eq!(harness.smc.value(mode), Some(1.0));

    client.set_fan_auto_mode(0).await.unwrap();
    assert_eq!(harness.smc.value(mode), Some(0.0));

    // rejected by the helper, registers untouched
    let err = client.set_fan_speed(0, 9000.0).await.unwrap_err();
    assert!(matches!(err, SmcError::ValueOutOfRange(_)));
    assert!(err.is_validation());
    assert_eq!(harness.smc.value(target), Some(3000.0));

    harness.stop().await;
}

#[tokio::test]
async fn test_helper_errors_keep_their_class() {
    let harness = Harness::start();
    let client = harness.client();
    client.connect().await.unwrap();

    let err = client.read_key("TZ9Z").await.unwrap_err();
    assert!(matches!(err, SmcError::ReadFailed { ref key, .. } if key == "TZ9Z"));

    let err = client.get_fan_info(7).await.unwrap_err();
    assert!(!matches!(err, SmcError::IpcProtocol(_)));
    assert!(err.is_validation());

    harness.stop().await;
}

#[tokio::test]
async fn test_service_against_live_helper() {
    let harness = Harness::start();
    let service = SmcService::with_transport(
        Arc::new(harness.client()),
        SmcSettings::default(),
        Arc::new(FixedLoad(0.2)),
    );

    assert_eq!(service.connect().await.unwrap(), PermissionState::Granted);
    assert_eq!(service.backend_kind(), BackendKind::Real);

    assert_eq!(service.read_temperature("TA0P").await.unwrap(), 27.5);
    let fans = service.all_fans().await.unwrap();
    assert_eq!(fans.len(), 2);
    assert!(fans.iter().all(|f| !f.simulated));

    // checked against the fan's range before anything is sent
    let err = service.set_fan_speed(1, 100.0).await.unwrap_err();
    assert!(matches!(err, SmcError::FanSpeedOutOfRange { .. }));

    service.set_fan_speed(1, 2500.0).await.unwrap();
    assert_eq!(harness.smc.value(RegisterKey::parse("F1Tg").unwrap()), Some(2500.0));

    service.disconnect().await.unwrap();
    harness.stop().await;
}

#[tokio::test]
async fn test_denied_open_falls_back_to_simulation() {
    let harness = Harness::start();
    harness
        .smc
        .set_open_failure(Some(sf_core::smc::OpenFailure::PermissionDenied));

    let service = SmcService::with_transport(
        Arc::new(harness.client()),
        SmcSettings::default(),
        Arc::new(FixedLoad(0.2)),
    );

    assert!(service.connect().await.is_err());
    assert_eq!(service.permission_state(), PermissionState::Denied);
    assert_eq!(service.backend_kind(), BackendKind::Simulated);

    let value = service.read_temperature("TC0P").await.unwrap();
    assert!((0.0..=110.0).contains(&value));

    harness.stop().await;
}

#[tokio::test]
async fn test_helper_range_rejection_surfaces_through_service() {
    let harness = Harness::start();
    let service = SmcService::with_transport(
        Arc::new(harness.client()),
        SmcSettings::default(),
        Arc::new(FixedLoad(0.2)),
    );
    service.connect().await.unwrap();
    service.fan_info(1).await.unwrap();

    // the firmware narrows the range after the client looked at it
    harness.smc.set(RegisterKey::parse("F1Mx").unwrap(), 2000.0);
    let target = RegisterKey::parse("F1Tg").unwrap();
    let before = harness.smc.value(target);

    let err = service.set_fan_speed(1, 2500.0).await.unwrap_err();
    assert!(err.is_validation());
    assert_eq!(harness.smc.value(target), before);
    assert_eq!(service.permission_state(), PermissionState::Granted);
    assert_eq!(service.backend_kind(), BackendKind::Real);

    service.disconnect().await.unwrap();
    harness.stop().await;
}
