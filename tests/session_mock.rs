//! Integration tests driving a full session over the in-memory serial link.

use cn0503::config::Settings;
use cn0503::dispatcher::ModelEvent;
use cn0503::model::device::DeviceState;
use cn0503::protocol::command::config_query_sequence;
use cn0503::transport::{LinkEvent, MockConnector, MockDevice};
use cn0503::{Cn0503Error, Session};
use std::io::Write;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

const WAIT: Duration = Duration::from_secs(5);

/// Settings with short pacing so a full configuration read takes well under a second.
fn fast_settings() -> Settings {
    let toml_str = r#"
        [serial]
        read_timeout_ms = 50

        [protocol]
        inter_command_delay_ms = 1
        slow_char_delay_ms = 1
        command_settle_ms = 1
    "#;
    toml::from_str(toml_str).expect("Failed to parse test settings")
}

fn connected() -> (Session, MockDevice) {
    connected_with(fast_settings())
}

fn connected_with(settings: Settings) -> (Session, MockDevice) {
    let connector = MockConnector::new(["/dev/ttyMOCK0"]);
    let session = Session::with_connector(settings, Arc::new(connector.clone()))
        .expect("Failed to create session");
    session.connect("/dev/ttyMOCK0").expect("Failed to connect");
    let device = connector.device().expect("No link opened");
    (session, device)
}

fn wait_until<F: Fn() -> bool>(condition: F) -> bool {
    let deadline = Instant::now() + WAIT;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    condition()
}

#[test]
fn test_get_config_sends_full_query_sequence() {
    let (session, device) = connected();
    session.get_config(false).unwrap();

    let mut expected = vec!["IDLE 1".to_string(); 4];
    expected.extend(config_query_sequence());
    assert!(device.wait_for(WAIT, |lines| lines.len() >= expected.len()));
    assert_eq!(device.written_lines(), expected);
    assert!(session.drain_events().contains(&ModelEvent::ModelUpdated));
}

#[test]
fn test_get_config_with_defaults_writes_ratios_first() {
    let (session, device) = connected();
    session.get_config(true).unwrap();

    assert!(device.wait_for(WAIT, |lines| lines.last().is_some_and(|l| l == "RATMASK F")));
    let lines = device.written_lines();
    let arat = lines
        .iter()
        .position(|l| l == "DEF0 ARAT A1#2048-A2#2048-/")
        .expect("default ratio not written");
    let sube = lines
        .iter()
        .position(|l| l == "DEF0 SUBE 0")
        .expect("subtract flag not written");
    let query = lines.iter().position(|l| l == "DEF0? ARAT").unwrap();
    assert!(arat < sube && sube < query);
    assert!(lines.contains(&"DEF3 ARAT D2#2048-D1#2048-/".to_string()));
    assert!(lines.contains(&"DEF1 SUBE 1".to_string()));
}

#[test]
fn test_def_echo_updates_model_once() {
    let (session, device) = connected();
    session.send_command("DEF2", "RATB 5").unwrap();
    assert!(device.wait_for(WAIT, |lines| lines == ["DEF2 RATB 5".to_string()]));

    device.push_line("RESP: DEF2 RATB=5.000000");
    assert!(wait_until(|| session.model().channels[2].baseline_ratio == 5.0));
    assert_eq!(session.drain_events(), vec![ModelEvent::ModelUpdated]);

    // The same value again changes nothing
    device.push_line("RESP: DEF2 RATB=5.000000");
    device.push_line("RESP: INFO done");
    thread::sleep(Duration::from_millis(200));
    assert!(session.drain_events().is_empty());
}

#[test]
fn test_malformed_lines_are_reported_and_skipped() {
    let (session, device) = connected();
    device.push_line("garbage");
    device.push_line("RESP: DEF9 RATB=1.0");
    device.push_line("RESP: ODR=2.5");

    assert!(wait_until(|| session.model().odr() == 2.5));
    assert_eq!(session.diagnostics().errors().len(), 2);
}

#[test]
fn test_lost_link_is_signalled_once() {
    let (session, device) = connected();
    let link_events = session.link_events();

    device.hang_up();
    assert_eq!(
        link_events.recv_timeout(WAIT).unwrap(),
        LinkEvent::ConnectionLost {
            port: "/dev/ttyMOCK0".to_string()
        }
    );
    assert!(!session.is_connected());
    assert!(!session.disconnect());
    assert!(link_events.recv_timeout(Duration::from_millis(200)).is_err());
    assert!(matches!(
        session.send_raw("ODR?"),
        Err(Cn0503Error::NotConnected)
    ));
}

#[test]
fn test_same_port_reconnects_right_after_disconnect() {
    let connector = MockConnector::new(["/dev/ttyMOCK0"]);
    let mut settings = fast_settings();
    // Longer than the whole test; the port must not stay held for this long
    settings.serial.read_timeout_ms = 5000;
    let session = Session::with_connector(settings, Arc::new(connector.clone())).unwrap();

    session.connect("/dev/ttyMOCK0").unwrap();
    let first = connector.device().unwrap();
    assert!(session.disconnect());
    assert!(!first.is_open());

    session.connect("/dev/ttyMOCK0").unwrap();
    assert_eq!(connector.open_count(), 2);
    assert!(session.is_connected());

    let device = connector.device().unwrap();
    device.push_line("RESP: ODR=4");
    assert!(wait_until(|| session.model().odr() == 4.0));
    session.send_raw("ODR?").unwrap();
    assert!(device.wait_for(WAIT, |lines| lines == ["ODR?".to_string()]));
}

#[test]
fn test_streaming_device_gets_one_character_at_a_time() {
    let mut settings = fast_settings();
    settings.protocol.slow_char_delay_ms = 10;
    let delay = Duration::from_millis(10);
    let (session, device) = connected_with(settings);

    // Idle: the whole command in one write
    session.send_raw("ODR?").unwrap();
    assert!(device.wait_for(WAIT, |lines| lines == ["ODR?".to_string()]));
    assert_eq!(device.writes().len(), 1);

    device.push_line("RESP: IDLE=0");
    assert!(wait_until(|| session.model().state == DeviceState::Streaming));

    session.send_raw("MODE?").unwrap();
    assert!(device.wait_for(WAIT, |lines| lines.len() == 2));
    assert_eq!(device.written_lines(), vec!["ODR?", "MODE?"]);

    let writes = device.writes();
    let paced = &writes[1..];
    let chunks: Vec<&[u8]> = paced.iter().map(|(_, chunk)| chunk.as_slice()).collect();
    assert_eq!(chunks, vec![b"M" as &[u8], b"O", b"D", b"E", b"?", b"\n"]);

    // The caller sleeps between characters; allow one interval of writer jitter
    let span = paced[5].0.duration_since(paced[0].0);
    assert!(span >= delay * 4, "six characters arrived within {span:?}");
}

#[test]
fn test_flash_apply_triggers_resync() {
    let (_session, device) = connected();
    device.push_line("RESP: FL_APPLY");

    assert!(device.wait_for(WAIT, |lines| lines.last().is_some_and(|l| l == "RATMASK F")));
    let lines = device.written_lines();
    assert!(lines.contains(&"NUMRAT?".to_string()));
    assert!(lines.contains(&"DEF3? SUBE".to_string()));
}

#[test]
fn test_load_config_stages_file() {
    let (session, device) = connected();
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(
        file,
        "# ADPD4100 colorimeter\n10B 03FC\nDEF0 ARAT A1#2048-A2#2048-/\nODR 2 # rate\nbogus line"
    )
    .unwrap();

    let count = session.load_config(file.path()).unwrap();
    assert_eq!(count, 3);

    assert!(device.wait_for(WAIT, |lines| lines.len() >= 6));
    assert_eq!(
        device.written_lines(),
        vec![
            "IDLE 1",
            "IDLE 1",
            "FL_CLEARBUF",
            "FL_WRITE REG 10B 03FC",
            "FL_WRITE DEF0 ARAT A1#2048-A2#2048-/",
            "FL_WRITE ODR 2",
        ]
    );
    let errors = session.diagnostics().errors();
    assert_eq!(errors.len(), 1);
    assert!(errors[0].message.contains("bogus line"));
}

#[test]
fn test_read_data_collects_requested_samples() {
    let (session, device) = connected();

    let far_end = device.clone();
    let responder = thread::spawn(move || {
        assert!(far_end.wait_for(WAIT, |lines| lines.iter().any(|l| l == "STREAM 3")));
        far_end.push_line("RESP: STREAM 3");
        for i in 0..3 {
            far_end.push_line(&format!("DATF {i}.5 1.0 2.0 3.0"));
        }
    });

    let columns = session.read_data(3, WAIT).unwrap();
    responder.join().unwrap();

    assert_eq!(columns.len(), 4);
    assert_eq!(columns[0], vec![0.5, 1.5, 2.5]);
    assert_eq!(columns[3], vec![3.0, 3.0, 3.0]);
    assert_eq!(session.model().state, DeviceState::Streaming);

    // Stopping was requested after the samples arrived
    assert!(device.wait_for(WAIT, |lines| lines.ends_with(&[
        "IDLE 1".to_string(),
        "IDLE 1".to_string()
    ])));
}

#[test]
fn test_read_data_times_out_and_stops() {
    let (session, device) = connected();
    let result = session.read_data(5, Duration::from_millis(200));
    assert!(matches!(result, Err(Cn0503Error::Timeout(_))));
    assert!(device.wait_for(WAIT, |lines| lines.last().is_some_and(|l| l == "IDLE 1")));
}

#[test]
fn test_flash_dump_and_save_round_trip() {
    let (session, device) = connected();

    let far_end = device.clone();
    let responder = thread::spawn(move || {
        assert!(far_end.wait_for(WAIT, |lines| lines.iter().any(|l| l == "FL_DUMP")));
        far_end.push_line("RESP: FL_DUMP REG 0F 8000");
        far_end.push_line("RESP: FL_DUMP REG 10B 03FC");
        far_end.push_line("RESP: FL_DUMP DEF0 RATB 1.25");
        far_end.push_line("RESP: FL_DUMP ODR 2");
    });

    let dump = session
        .flash_dump(Duration::from_millis(200), WAIT)
        .unwrap();
    responder.join().unwrap();
    assert_eq!(dump.len(), 4);

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("saved.cfg");
    session.save_config(&path).unwrap();

    let text = std::fs::read_to_string(&path).unwrap();
    assert!(text.contains("REG 10B 03FC"));
    assert!(!text.contains("0F 8000"));
    assert!(text.contains("DEF0 RATB 1.25"));
    assert!(text.contains("ODR 2"));

    // The saved file stages cleanly
    let parsed = cn0503::protocol::config_file::parse(&text);
    assert!(parsed.rejected.is_empty());
    assert_eq!(parsed.commands.len(), 3);
}
