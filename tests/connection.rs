//! Connection lifecycle tests against loopback TCP.
//!
//! Each test plays the device side of the wire: accept (or dial), answer
//! the configuration request, and stream frames with deliberately awkward
//! chunking.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;

use gridscope::codec::{self, FrameCodec};
use gridscope::{
    AnalogChannel, AnalogKind, CommandCode, ConfigurationFrame, ConnectionConfig, ConnectionState,
    DataFrame, DecodeError, DigitalChannel, Gridscope, ListenPolicy, NominalFrequency,
    PhasorChannel, PhasorKind, PhasorValue, PmuConnection, PmuError, PmuEvent, ProtocolVariant,
    ReconnectPolicy, StatusWord, TransportKind, ValueFormat,
};

const DEVICE_ID: u16 = 7;
const VARIANT: ProtocolVariant = ProtocolVariant::IeeeC37118V2;

fn fixture_config() -> ConfigurationFrame {
    ConfigurationFrame {
        device_id: DEVICE_ID,
        station_name: "SUBSTATION 7".into(),
        time_base: 1_000_000,
        nominal_freq: NominalFrequency::Hz60,
        data_rate: 30,
        revision: 1,
        format: ValueFormat::default(),
        phasors: vec![PhasorChannel {
            label: "VA".into(),
            kind: PhasorKind::Voltage,
            scale: 915_527,
        }],
        analogs: vec![AnalogChannel {
            label: "ANALOG1".into(),
            kind: AnalogKind::RmsOfAnalogInput,
            scale: 1,
        }],
        digitals: vec![DigitalChannel {
            bit_labels: (0..16).map(|i| format!("BIT{i}")).collect(),
            normal_mask: 0,
            valid_mask: 0xFFFF,
        }],
        soc: 1_700_000_000,
        fracsec: 0,
    }
}

fn fixture_data(config: &Arc<ConfigurationFrame>) -> DataFrame {
    DataFrame {
        device_id: DEVICE_ID,
        soc: 1_700_000_001,
        fracsec: 500_000,
        status: StatusWord(0),
        phasors: vec![PhasorValue::Rectangular { real: 1_200.0, imaginary: -345.0 }],
        frequency: 12.0,
        rocof: -3.0,
        analogs: vec![41.0],
        digitals: vec![0x0001],
        config: Arc::clone(config),
    }
}

async fn next_event(connection: &mut PmuConnection) -> PmuEvent {
    timeout(Duration::from_secs(5), connection.next_event())
        .await
        .expect("timed out waiting for event")
        .expect("event channel closed")
}

/// Skip over status changes until a non-status event arrives.
async fn next_payload_event(connection: &mut PmuConnection) -> PmuEvent {
    loop {
        match next_event(connection).await {
            PmuEvent::StatusChanged(_) => continue,
            event => return event,
        }
    }
}

async fn wait_for_state(connection: &mut PmuConnection, wanted: ConnectionState) {
    loop {
        if connection.state() == wanted {
            return;
        }
        match next_event(connection).await {
            PmuEvent::StatusChanged(state) if state == wanted => return,
            _ => continue,
        }
    }
}

/// Accept one client, swallow its configuration request, and send the
/// fixture configuration back. Returns the device-side stream.
async fn accept_and_configure(listener: TcpListener) -> Result<TcpStream> {
    let (mut stream, _) = listener.accept().await?;
    let codec = codec::for_variant(VARIANT);

    let mut buf = [0u8; 64];
    let n = stream.read(&mut buf).await?;
    assert!(n > 0, "expected a configuration request");

    stream.write_all(&codec.encode_configuration(&fixture_config()).unwrap()).await?;
    Ok(stream)
}

#[tokio::test]
async fn frame_split_across_reads_arrives_exactly_once() -> Result<()> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;

    let device = tokio::spawn(async move {
        let mut stream = accept_and_configure(listener).await.unwrap();

        let codec = codec::for_variant(VARIANT);
        let config = Arc::new(fixture_config());
        let frame = codec.encode_data(&fixture_data(&config)).unwrap();

        // Deliver the frame in two awkward chunks.
        stream.write_all(&frame[..5]).await.unwrap();
        stream.flush().await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        stream.write_all(&frame[5..]).await.unwrap();
        stream
    });

    let config = ConnectionConfig::tcp_client("127.0.0.1", addr.port(), VARIANT, DEVICE_ID);
    let mut connection = Gridscope::connect(config).await?;

    match next_payload_event(&mut connection).await {
        PmuEvent::ConfigurationReceived(received) => {
            assert_eq!(received.station_name, "SUBSTATION 7");
        }
        other => panic!("expected configuration, got {other:?}"),
    }

    match next_payload_event(&mut connection).await {
        PmuEvent::DataReceived(frame) => {
            assert_eq!(frame.soc, 1_700_000_001);
            assert_eq!(frame.phasors.len(), 1);
        }
        other => panic!("expected data frame, got {other:?}"),
    }

    let stats = connection.stats();
    assert_eq!(stats.frames_received, 2);
    assert_eq!(stats.data_frames, 1);
    assert_eq!(stats.framing_errors, 0);

    let _device = device.await?;
    connection.stop().await;
    Ok(())
}

#[tokio::test]
async fn corrupted_frame_is_a_fault_not_a_disconnect() -> Result<()> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;

    let device = tokio::spawn(async move {
        let mut stream = accept_and_configure(listener).await.unwrap();

        let codec = codec::for_variant(VARIANT);
        let config = Arc::new(fixture_config());
        let mut bad = codec.encode_data(&fixture_data(&config)).unwrap();
        let tail = bad.len() - 1;
        bad[tail] ^= 0xFF; // break the checksum

        stream.write_all(&bad).await.unwrap();
        stream.write_all(&codec.encode_data(&fixture_data(&config)).unwrap()).await.unwrap();
        stream
    });

    let config = ConnectionConfig::tcp_client("127.0.0.1", addr.port(), VARIANT, DEVICE_ID);
    let mut connection = Gridscope::connect(config).await?;

    loop {
        match next_payload_event(&mut connection).await {
            PmuEvent::ConfigurationReceived(_) => continue,
            PmuEvent::Fault(PmuError::Decode(_)) => break,
            other => panic!("expected a decode fault first, got {other:?}"),
        }
    }

    // The good frame after the corrupt one still arrives, still Connected.
    match next_payload_event(&mut connection).await {
        PmuEvent::DataReceived(_) => {}
        other => panic!("expected data frame, got {other:?}"),
    }
    assert_eq!(connection.state(), ConnectionState::Connected);
    assert_eq!(connection.stats().checksum_failures, 1);

    let _device = device.await?;
    connection.stop().await;
    Ok(())
}

#[tokio::test]
async fn send_command_outside_connected_is_rejected() -> Result<()> {
    // A port with nothing listening, and a reconnect policy so start()
    // succeeds and keeps retrying in the background.
    let addr = {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        listener.local_addr()?
    };

    let mut config = ConnectionConfig::tcp_client("127.0.0.1", addr.port(), VARIANT, DEVICE_ID);
    config.reconnect = ReconnectPolicy { max_retries: 10, backoff_ms: 200 };
    let connection = Gridscope::connect(config).await?;

    assert_ne!(connection.state(), ConnectionState::Connected);
    let err = connection.send_command(CommandCode::TurnOnTransmission, Vec::new()).await;
    assert!(matches!(err, Err(PmuError::Protocol(_))), "got {err:?}");
    assert_eq!(connection.stats().commands_sent, 0);
    Ok(())
}

#[tokio::test]
async fn reconnect_exhaustion_ends_in_error() -> Result<()> {
    let addr = {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        listener.local_addr()?
    };

    let mut config = ConnectionConfig::tcp_client("127.0.0.1", addr.port(), VARIANT, DEVICE_ID);
    config.reconnect = ReconnectPolicy { max_retries: 3, backoff_ms: 100 };
    let mut connection = Gridscope::connect(config).await?;

    // Initial attempt plus three retries, each a counted transport fault.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while connection.stats().transport_errors < 4 {
        assert!(tokio::time::Instant::now() < deadline, "retries never exhausted");
        tokio::time::sleep(Duration::from_millis(25)).await;
    }

    // Settled: no further attempts, parked in Error.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(connection.state(), ConnectionState::Error);

    let stats = connection.stats();
    assert_eq!(stats.reconnect_attempts, 3);
    assert_eq!(stats.transport_errors, 4);

    // Only an explicit reset leaves Error, and it lands in Idle.
    connection.reset().await?;
    assert_eq!(connection.state(), ConnectionState::Idle);
    assert!(connection.reset().await.is_err());
    Ok(())
}

#[tokio::test]
async fn listen_mode_walks_through_listening() -> Result<()> {
    // Learn a free port, then hand it to the server transport.
    let port = {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        listener.local_addr()?.port()
    };

    let config = ConnectionConfig {
        transport: TransportKind::TcpServer {
            interface: "127.0.0.1".into(),
            port,
            policy: ListenPolicy::RejectNew,
        },
        ..ConnectionConfig::tcp_client("unused", 0, VARIANT, DEVICE_ID)
    };
    let mut connection = Gridscope::connect(config).await?;
    wait_for_state(&mut connection, ConnectionState::Listening).await;

    // The device dials in; the connection must request configuration.
    let mut device = TcpStream::connect(("127.0.0.1", port)).await?;
    wait_for_state(&mut connection, ConnectionState::Connected).await;

    let mut buf = [0u8; 64];
    let n = timeout(Duration::from_secs(5), device.read(&mut buf)).await??;
    let codec = codec::for_variant(VARIANT);
    let header = codec.decode_header(&buf[..n]).unwrap();
    assert_eq!(header.frame_type, gridscope::FrameType::Command);

    connection.stop().await;
    assert_eq!(connection.state(), ConnectionState::Idle);
    Ok(())
}

#[tokio::test]
async fn stop_discards_partial_frames() -> Result<()> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;

    let device = tokio::spawn(async move {
        let mut stream = accept_and_configure(listener).await.unwrap();

        let codec = codec::for_variant(VARIANT);
        let config = Arc::new(fixture_config());
        let frame = codec.encode_data(&fixture_data(&config)).unwrap();
        // Only half the frame ever goes out.
        stream.write_all(&frame[..frame.len() / 2]).await.unwrap();
        stream.flush().await.unwrap();
        tokio::time::sleep(Duration::from_secs(2)).await;
        stream
    });

    let config = ConnectionConfig::tcp_client("127.0.0.1", addr.port(), VARIANT, DEVICE_ID);
    let mut connection = Gridscope::connect(config).await?;

    match next_payload_event(&mut connection).await {
        PmuEvent::ConfigurationReceived(_) => {}
        other => panic!("expected configuration, got {other:?}"),
    }

    tokio::time::sleep(Duration::from_millis(100)).await;
    connection.stop().await;
    assert_eq!(connection.state(), ConnectionState::Idle);

    // Drain whatever is queued: no data frame may have been emitted.
    while let Some(event) = connection.next_event().await {
        assert!(
            !matches!(event, PmuEvent::DataReceived(_)),
            "partial frame must not be emitted"
        );
    }
    assert_eq!(connection.stats().data_frames, 0);

    device.abort();
    Ok(())
}

#[tokio::test]
async fn snapshot_seeded_connection_decodes_data_immediately() -> Result<()> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;

    let device = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        // No configuration exchange: straight to data.
        let codec = codec::for_variant(VARIANT);
        let config = Arc::new(fixture_config());
        stream.write_all(&codec.encode_data(&fixture_data(&config)).unwrap()).await.unwrap();

        // A seeded connection must not request configuration; nothing to
        // read means the device-side read times out below.
        let mut buf = [0u8; 64];
        timeout(Duration::from_millis(300), stream.read(&mut buf)).await
    });

    let bytes = gridscope::snapshot::save(&fixture_config(), VARIANT)?;
    let seed = gridscope::snapshot::load(VARIANT, &bytes)?;

    let config = ConnectionConfig::tcp_client("127.0.0.1", addr.port(), VARIANT, DEVICE_ID);
    let mut connection = Gridscope::connect_with_snapshot(config, seed).await?;

    match next_payload_event(&mut connection).await {
        PmuEvent::DataReceived(frame) => {
            assert_eq!(frame.config.station_name, "SUBSTATION 7");
        }
        other => panic!("expected data frame, got {other:?}"),
    }

    let device_read = device.await?;
    assert!(device_read.is_err(), "seeded connection must not send a configuration request");

    connection.stop().await;
    Ok(())
}

#[tokio::test]
async fn mismatched_data_replays_after_its_configuration_arrives() -> Result<()> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;

    let device = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let codec = codec::for_variant(VARIANT);

        let mut other = fixture_config();
        other.device_id = 99;
        other.station_name = "SUBSTATION 99".into();
        let other = Arc::new(other);
        let mut data = fixture_data(&other);
        data.device_id = 99;

        // Data for device 99 lands while the connection still holds the
        // seeded device-7 configuration; its own configuration follows.
        stream.write_all(&codec.encode_data(&data).unwrap()).await.unwrap();
        stream.write_all(&codec.encode_configuration(&other).unwrap()).await.unwrap();
        stream
    });

    let config = ConnectionConfig::tcp_client("127.0.0.1", addr.port(), VARIANT, DEVICE_ID);
    let mut connection = Gridscope::connect_with_snapshot(config, fixture_config()).await?;

    // The mismatch is a counted fault, not a silent discard.
    match next_payload_event(&mut connection).await {
        PmuEvent::Fault(PmuError::Decode(DecodeError::MissingConfiguration {
            device_id: 99,
        })) => {}
        other => panic!("expected a missing-configuration fault, got {other:?}"),
    }
    match next_payload_event(&mut connection).await {
        PmuEvent::ConfigurationReceived(received) => assert_eq!(received.device_id, 99),
        other => panic!("expected configuration, got {other:?}"),
    }

    // The retained raw image decodes against the new configuration.
    match next_payload_event(&mut connection).await {
        PmuEvent::DataReceived(frame) => {
            assert_eq!(frame.device_id, 99);
            assert_eq!(frame.config.station_name, "SUBSTATION 99");
        }
        other => panic!("expected the replayed data frame, got {other:?}"),
    }
    assert_eq!(connection.stats().data_frames, 1);
    assert_eq!(connection.stats().frames_dropped, 0);

    let _device = device.await?;
    connection.stop().await;
    Ok(())
}
