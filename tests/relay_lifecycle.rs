//! Stream relay plane driven end to end with a stand-in transcoder.
//!
//! Ports used here sit far above the default pool so a concurrently
//! running gateway cannot collide with the tests.

use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::sync::Arc;
use std::time::Duration;

use printcam_gateway::stream_relay::{
    StreamEndpoint, StreamRelayConfig, StreamRelayManager, StreamSource,
};

fn fake_transcoder(dir: &tempfile::TempDir, body: &str) -> String {
    let path = dir.path().join("fake-ffmpeg");
    let mut file = std::fs::File::create(&path).unwrap();
    writeln!(file, "#!/bin/sh\n{}", body).unwrap();
    let mut perms = file.metadata().unwrap().permissions();
    perms.set_mode(0o755);
    file.set_permissions(perms).unwrap();
    path.to_str().unwrap().to_string()
}

fn manager(program: String, base_port: u16) -> Arc<StreamRelayManager> {
    StreamRelayManager::new(StreamRelayConfig {
        transcoder_program: program,
        base_port,
        idle_grace: Duration::from_secs(60),
    })
}

#[tokio::test]
async fn test_relay_listener_reachable_until_stopped() {
    let dir = tempfile::tempdir().unwrap();
    let program = fake_transcoder(&dir, "exec tail -f /dev/null");
    let manager = manager(program, 29800);

    let endpoint = manager
        .start_stream(
            "printer_a",
            StreamSource::classify("rtsps://10.0.0.4:322/streaming/live/1"),
            None,
        )
        .await
        .unwrap();
    let StreamEndpoint::Relay { port } = endpoint else {
        panic!("rtsp source must produce a relay endpoint");
    };
    assert_eq!(port, 29800);

    assert!(tokio::net::TcpStream::connect(("127.0.0.1", port))
        .await
        .is_ok());
    assert_eq!(manager.viewer_count("printer_a").await, Some(0));

    assert!(manager.stop_stream("printer_a").await);
    assert!(manager.viewer_count("printer_a").await.is_none());
    assert!(tokio::net::TcpStream::connect(("127.0.0.1", port))
        .await
        .is_err());

    manager.shutdown_all().await;
}

#[tokio::test]
async fn test_operator_pinned_port_is_honored() {
    let dir = tempfile::tempdir().unwrap();
    let program = fake_transcoder(&dir, "exec tail -f /dev/null");
    let manager = manager(program, 29810);

    let endpoint = manager
        .start_stream(
            "printer_b",
            StreamSource::Rtsp("rtsp://10.0.0.5/live".into()),
            Some(29817),
        )
        .await
        .unwrap();
    assert_eq!(endpoint, StreamEndpoint::Relay { port: 29817 });

    let infos = manager.list_relays().await;
    assert_eq!(infos.len(), 1);
    assert_eq!(infos[0].port, 29817);

    manager.shutdown_all().await;
}

#[tokio::test]
async fn test_dying_transcoder_is_restarted_in_place() {
    let dir = tempfile::tempdir().unwrap();
    // Lives long enough to pass the startup check, then exits.
    let program = fake_transcoder(&dir, "exec sleep 2");
    let manager = manager(program, 29820);

    let endpoint = manager
        .start_stream(
            "printer_c",
            StreamSource::Rtsp("rtsp://10.0.0.6/live".into()),
            None,
        )
        .await
        .unwrap();
    assert_eq!(endpoint, StreamEndpoint::Relay { port: 29820 });

    // Startup check 0.5s + death at 2s + liveness poll + restart delay.
    tokio::time::sleep(Duration::from_millis(3500)).await;

    let infos = manager.list_relays().await;
    assert_eq!(infos.len(), 1, "relay must survive a transcoder death");
    assert!(infos[0].restart_count >= 1);
    assert_eq!(infos[0].port, 29820);

    manager.shutdown_all().await;
}

#[tokio::test]
async fn test_crash_looping_transcoder_fails_and_frees_the_port() {
    let dir = tempfile::tempdir().unwrap();
    // Survives the startup check but never runs long enough to count as
    // stable, so the restarts run out.
    let program = fake_transcoder(&dir, "exec sleep 1");
    let manager = manager(program, 29830);

    let endpoint = manager
        .start_stream(
            "printer_d",
            StreamSource::Rtsp("rtsp://10.0.0.7/live".into()),
            None,
        )
        .await
        .unwrap();
    assert_eq!(endpoint, StreamEndpoint::Relay { port: 29830 });

    // Three restarts at roughly three seconds per cycle, then the fourth
    // death tears the relay down.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(30);
    while manager.viewer_count("printer_d").await.is_some() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "relay still listed after its restarts ran out"
        );
        tokio::time::sleep(Duration::from_millis(500)).await;
    }
    assert!(manager.list_relays().await.is_empty());

    // The relay vanishes from the listing just before the teardown frees
    // the port, so the pinned re-bind may need a few tries.
    let endpoint = loop {
        match manager
            .start_stream(
                "printer_e",
                StreamSource::Rtsp("rtsp://10.0.0.8/live".into()),
                Some(29830),
            )
            .await
        {
            Ok(endpoint) => break endpoint,
            Err(_) => {
                assert!(
                    tokio::time::Instant::now() < deadline,
                    "port 29830 was never released"
                );
                tokio::time::sleep(Duration::from_millis(250)).await;
            }
        }
    };
    assert_eq!(endpoint, StreamEndpoint::Relay { port: 29830 });

    manager.shutdown_all().await;
}
