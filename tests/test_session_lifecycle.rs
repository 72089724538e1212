//! End-to-end lifecycle tests against the in-memory transport
//!
//! Time is paused in every test, so backoff and heart-beat intervals elapse
//! instantly once the session is idle.


use brokerlink::error::{AuthFailureKind, SessionError};
use brokerlink::protocol::{headers, Command, HeartBeat, ProtocolError};
use brokerlink::transport::TransportError;
use brokerlink::{ClientEvent, CloseReason, ConnectionState};
use bytes::Bytes;
use std::time::Duration;
use test_helpers::*;

#[tokio::test(start_paused = true)]
async fn test_connect_walks_through_handshake_states() {
    // Arrange
    let (client, transport, mut events) = start_client(test_settings());

    // Act
    client.connect(TOKEN).await.unwrap();
    let mut connection = transport.next_connection().await.unwrap();
    let connect = connection.accept().await.unwrap();

    // Assert
    let states = states_until(&mut events, |s| s.is_connected()).await;
    assert_eq!(
        states,
        vec![
            ConnectionState::Connecting,
            ConnectionState::Authenticating,
            ConnectionState::Connected,
        ]
    );
    assert_eq!(connect.command, Command::Connect);
    assert_eq!(connect.get(headers::ACCEPT_VERSION), Some("1.2"));
    assert_eq!(connect.get(headers::HOST), Some("mock.local"));
    assert_eq!(
        connect.get(headers::AUTHORIZATION),
        Some("Bearer test-bearer-token")
    );
}

#[tokio::test(start_paused = true)]
async fn test_credential_never_reaches_endpoint_or_events() {
    let (client, transport, mut events) = start_client(test_settings());
    let connection = connect_and_accept(&client, &transport).await;
    connection.drop_link();
    client
        .wait_for_state(|s| matches!(s, ConnectionState::ReconnectWaiting { .. }), Duration::from_secs(5))
        .await
        .unwrap();

    for endpoint in transport.endpoints() {
        assert!(!endpoint.as_str().contains(TOKEN));
    }
    for event in drain_events(&mut events) {
        assert!(!format!("{event:?}").contains(TOKEN));
    }
    assert!(!format!("{client:?}").contains(TOKEN));
}

#[tokio::test(start_paused = true)]
async fn test_connect_is_noop_while_active() {
    let (client, transport, _events) = start_client(test_settings());
    let _connection = connect_and_accept(&client, &transport).await;

    client.connect(TOKEN).await.unwrap();
    tokio::time::sleep(Duration::from_secs(1)).await;

    assert_eq!(client.state(), ConnectionState::Connected);
    assert_eq!(transport.open_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_link_drop_reconnects_with_backoff() {
    // Arrange
    let (client, transport, mut events) = start_client(test_settings());
    let connection = connect_and_accept(&client, &transport).await;
    drain_events(&mut events);

    // Act
    connection.drop_link();
    let mut second = transport.next_connection().await.unwrap();
    second.accept().await.unwrap();

    // Assert
    let states = states_until(&mut events, |s| s.is_connected()).await;
    assert_eq!(
        states,
        vec![
            ConnectionState::ReconnectWaiting {
                attempt: 1,
                delay: Duration::from_millis(100),
            },
            ConnectionState::Connecting,
            ConnectionState::Authenticating,
            ConnectionState::Connected,
        ]
    );
    assert_eq!(transport.open_count(), 2);
    assert_eq!(client.stats().await.unwrap().reconnect_count, 1);
}

#[tokio::test(start_paused = true)]
async fn test_backoff_grows_then_resets_after_success() {
    let (client, transport, mut events) = start_client(test_settings());
    transport.fail_next_opens(3);

    client.connect(TOKEN).await.unwrap();
    let mut connection = transport.next_connection().await.unwrap();
    connection.accept().await.unwrap();
    let states = states_until(&mut events, |s| s.is_connected()).await;

    let delays: Vec<(u32, Duration)> = states
        .iter()
        .filter_map(|s| match s {
            ConnectionState::ReconnectWaiting { attempt, delay } => Some((*attempt, *delay)),
            _ => None,
        })
        .collect();
    assert_eq!(
        delays,
        vec![
            (1, Duration::from_millis(100)),
            (2, Duration::from_millis(200)),
            (3, Duration::from_millis(400)),
        ]
    );

    // A fresh drop starts from the base delay again
    connection.drop_link();
    let state = next_state(&mut events).await;
    assert_eq!(
        state,
        ConnectionState::ReconnectWaiting {
            attempt: 1,
            delay: Duration::from_millis(100),
        }
    );
}

#[tokio::test(start_paused = true)]
async fn test_transport_error_triggers_reconnect() {
    let (client, transport, mut events) = start_client(test_settings());
    let connection = connect_and_accept(&client, &transport).await;
    drain_events(&mut events);

    connection.fail(TransportError::Io("connection reset by peer".to_string()));

    let state = next_state(&mut events).await;
    assert!(matches!(state, ConnectionState::ReconnectWaiting { attempt: 1, .. }));
    assert!(transport.next_connection().await.is_some());
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_during_reconnect_wait_cancels_timer() {
    // Arrange
    let (client, transport, _events) = start_client(test_settings());
    let connection = connect_and_accept(&client, &transport).await;
    connection.drop_link();
    client
        .wait_for_state(|s| matches!(s, ConnectionState::ReconnectWaiting { .. }), Duration::from_secs(5))
        .await
        .unwrap();

    // Act
    client.disconnect().await;
    tokio::time::sleep(Duration::from_secs(60)).await;

    // Assert
    assert_eq!(
        client.state(),
        ConnectionState::Closed(CloseReason::ClientDisconnect)
    );
    assert_eq!(transport.open_count(), 1);
    assert!(transport.try_next_connection().await.is_none());
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_while_connected_sends_disconnect_and_closes_link() {
    let (client, transport, _events) = start_client(test_settings());
    let mut connection = connect_and_accept(&client, &transport).await;

    client.disconnect().await;

    let frame = connection.next_frame().await.unwrap();
    assert_eq!(frame.command, Command::Disconnect);
    connection.wait_closed().await;
    assert!(connection.is_closed_by_client());
    assert!(client.state().is_closed());
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_during_open_closes_late_link() {
    // Arrange
    let (client, transport, _events) = start_client(test_settings());
    transport.set_open_delay(Some(Duration::from_secs(5)));
    client.connect(TOKEN).await.unwrap();
    assert_eq!(client.state(), ConnectionState::Connecting);

    // Act
    client.disconnect().await;
    let mut late = transport.next_connection().await.unwrap();

    // Assert
    assert!(late.next_frame().await.is_none(), "no CONNECT on a superseded link");
    assert!(late.is_closed_by_client());
    assert_eq!(
        client.state(),
        ConnectionState::Closed(CloseReason::ClientDisconnect)
    );
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_after_disconnect_is_allowed() {
    let (client, transport, _events) = start_client(test_settings());
    let _first = connect_and_accept(&client, &transport).await;
    client.disconnect().await;

    let _second = connect_and_accept(&client, &transport).await;

    assert_eq!(client.state(), ConnectionState::Connected);
    assert_eq!(transport.open_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_max_attempts_closes_with_retries_exhausted() {
    let mut settings = test_settings();
    settings.reconnect.max_attempts = Some(2);
    let (client, transport, _events) = start_client(settings);
    transport.fail_next_opens(10);

    client.connect(TOKEN).await.unwrap();
    let result = client.wait_until_connected(Duration::from_secs(30)).await;

    assert!(matches!(result, Err(SessionError::SessionClosed)));
    assert!(matches!(
        client.state(),
        ConnectionState::Closed(CloseReason::RetriesExhausted(_))
    ));
    assert_eq!(transport.open_count(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_connect_timeout_when_broker_never_answers() {
    let (client, transport, mut events) = start_client(test_settings());
    client.connect(TOKEN).await.unwrap();
    let mut silent = transport.next_connection().await.unwrap();
    assert_eq!(silent.next_frame().await.unwrap().command, Command::Connect);

    let states = states_until(&mut events, |s| {
        matches!(s, ConnectionState::ReconnectWaiting { .. })
    })
    .await;

    assert_eq!(states[1], ConnectionState::Authenticating);
    assert_eq!(
        states.last(),
        Some(&ConnectionState::ReconnectWaiting {
            attempt: 1,
            delay: Duration::from_millis(100),
        })
    );
    silent.wait_closed().await;
    assert!(silent.is_closed_by_client());
}

#[tokio::test(start_paused = true)]
async fn test_connect_timeout_reports_timed_out_diagnostic() {
    let mut settings = test_settings();
    settings.connect_timeout = Duration::from_secs(2);
    let (client, transport, mut events) = start_client(settings);
    client.connect(TOKEN).await.unwrap();
    let _silent = transport.next_connection().await.unwrap();

    let diagnostic = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            if let Ok(ClientEvent::Diagnostic(error)) = events.recv().await {
                return error;
            }
        }
    })
    .await
    .unwrap();

    assert!(matches!(
        diagnostic,
        SessionError::Transport(TransportError::TimedOut(_))
    ));
}

#[tokio::test(start_paused = true)]
async fn test_terminal_auth_failure_closes_without_retry() {
    // Arrange
    let (client, transport, _events) = start_client(test_settings());
    client.connect(TOKEN).await.unwrap();
    let mut connection = transport.next_connection().await.unwrap();

    // Act
    connection.reject("Invalid token").await.unwrap();
    let result = client.wait_until_connected(Duration::from_secs(5)).await;
    tokio::time::sleep(Duration::from_secs(60)).await;

    // Assert
    match result {
        Err(SessionError::Auth { kind, .. }) => assert_eq!(kind, AuthFailureKind::Terminal),
        other => panic!("expected terminal auth error, got {other:?}"),
    }
    assert!(matches!(
        client.state(),
        ConnectionState::Closed(CloseReason::AuthRejected(_))
    ));
    assert_eq!(transport.open_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_transient_auth_failure_retries() {
    let (client, transport, _events) = start_client(test_settings());
    client.connect(TOKEN).await.unwrap();
    let mut first = transport.next_connection().await.unwrap();
    first.reject("Server overloaded, try again later").await.unwrap();

    let mut second = transport.next_connection().await.unwrap();
    second.accept().await.unwrap();

    client
        .wait_until_connected(Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(transport.open_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_ambiguous_auth_failures_are_bounded() {
    let mut settings = test_settings();
    settings.max_ambiguous_auth_retries = 2;
    let (client, transport, _events) = start_client(settings);
    client.connect(TOKEN).await.unwrap();

    for _ in 0..3 {
        let mut connection = transport.next_connection().await.unwrap();
        connection.reject("unexpected handshake state").await.unwrap();
    }

    let state = client
        .wait_for_state(|s| s.is_closed(), Duration::from_secs(10))
        .await
        .unwrap();
    assert!(matches!(
        state,
        ConnectionState::Closed(CloseReason::AuthRejected(_))
    ));
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(transport.open_count(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_error_frame_while_connected_reconnects() {
    let (client, transport, mut events) = start_client(test_settings());
    let connection = connect_and_accept(&client, &transport).await;
    drain_events(&mut events);

    connection.send_frame(
        &brokerlink::protocol::Frame::new(Command::Error).header(headers::MESSAGE, "queue deleted"),
    );

    let saw_broker_error = tokio::time::timeout(Duration::from_secs(5), async {
        let mut saw_broker_error = false;
        loop {
            match events.recv().await {
                Ok(ClientEvent::Diagnostic(SessionError::Broker { .. })) => saw_broker_error = true,
                Ok(ClientEvent::StateChanged(ConnectionState::ReconnectWaiting { .. })) => {
                    return saw_broker_error
                }
                Ok(_) => {}
                Err(e) => panic!("event stream failed: {e}"),
            }
        }
    })
    .await
    .unwrap();

    assert!(saw_broker_error);
    assert!(transport.next_connection().await.is_some());
}

#[tokio::test(start_paused = true)]
async fn test_malformed_frame_triggers_reconnect() {
    let (client, transport, mut events) = start_client(test_settings());
    let connection = connect_and_accept(&client, &transport).await;
    drain_events(&mut events);

    connection.send_bytes(Bytes::from_static(b"BOGUS\n\n\0"));

    let diagnostic = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Ok(ClientEvent::Diagnostic(error)) = events.recv().await {
                return error;
            }
        }
    })
    .await
    .unwrap();
    assert!(matches!(diagnostic, SessionError::Protocol(_)));
    client
        .wait_for_state(|s| matches!(s, ConnectionState::ReconnectWaiting { .. }), Duration::from_secs(5))
        .await
        .unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_hostile_content_length_triggers_reconnect() {
    // Arrange
    let (client, transport, mut events) = start_client(test_settings());
    let connection = connect_and_accept(&client, &transport).await;
    drain_events(&mut events);

    // Act: a declared length that cannot be added to the header offset
    connection.send_bytes(Bytes::from(format!(
        "MESSAGE\ndestination:/q\ncontent-length:{}\n\nab\0",
        usize::MAX
    )));

    // Assert
    let diagnostic = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Ok(ClientEvent::Diagnostic(error)) = events.recv().await {
                return error;
            }
        }
    })
    .await
    .unwrap();
    assert!(matches!(
        diagnostic,
        SessionError::Protocol(ProtocolError::FrameTooLarge { .. })
    ));
    client
        .wait_for_state(|s| matches!(s, ConnectionState::ReconnectWaiting { .. }), Duration::from_secs(5))
        .await
        .unwrap();

    let mut second = transport.next_connection().await.unwrap();
    second.accept().await.unwrap();
    client
        .wait_for_state(|s| s.is_connected(), Duration::from_secs(5))
        .await
        .unwrap();
    assert!(client.stats().await.is_ok());
}

#[tokio::test(start_paused = true)]
async fn test_heartbeat_silence_triggers_reconnect() {
    // Arrange
    let mut settings = test_settings();
    settings.heartbeat = HeartBeat::new(Duration::from_secs(1), Duration::from_secs(1));
    let (client, transport, _events) = start_client(settings);
    client.connect(TOKEN).await.unwrap();
    let mut connection = transport.next_connection().await.unwrap();
    connection
        .accept_with_heartbeat(HeartBeat::new(Duration::from_secs(1), Duration::from_secs(1)))
        .await
        .unwrap();
    client
        .wait_until_connected(Duration::from_secs(5))
        .await
        .unwrap();

    // Act: the broker goes silent
    let state = client
        .wait_for_state(|s| matches!(s, ConnectionState::ReconnectWaiting { .. }), Duration::from_secs(10))
        .await
        .unwrap();

    // Assert
    assert!(matches!(state, ConnectionState::ReconnectWaiting { attempt: 1, .. }));
    connection.wait_closed().await;
    assert!(connection.heartbeats_received() >= 1);
}

#[tokio::test(start_paused = true)]
async fn test_inbound_heartbeats_keep_session_alive() {
    let mut settings = test_settings();
    settings.heartbeat = HeartBeat::new(Duration::from_secs(1), Duration::from_secs(1));
    let (client, transport, _events) = start_client(settings);
    client.connect(TOKEN).await.unwrap();
    let mut connection = transport.next_connection().await.unwrap();
    connection
        .accept_with_heartbeat(HeartBeat::new(Duration::from_secs(1), Duration::from_secs(1)))
        .await
        .unwrap();

    for _ in 0..10 {
        tokio::time::sleep(Duration::from_secs(1)).await;
        connection.send_heartbeat();
    }

    assert_eq!(client.state(), ConnectionState::Connected);
    assert_eq!(transport.open_count(), 1);
    connection.drain_frames();
    assert!(connection.heartbeats_received() >= 5);
}

#[tokio::test(start_paused = true)]
async fn test_heartbeat_timers_do_not_leak_across_links() {
    // Arrange: heart-beats on the first link only
    let mut settings = test_settings();
    settings.heartbeat = HeartBeat::new(Duration::from_secs(1), Duration::from_secs(1));
    let (client, transport, _events) = start_client(settings);
    client.connect(TOKEN).await.unwrap();
    let mut first = transport.next_connection().await.unwrap();
    first
        .accept_with_heartbeat(HeartBeat::new(Duration::from_secs(1), Duration::from_secs(1)))
        .await
        .unwrap();
    client
        .wait_until_connected(Duration::from_secs(5))
        .await
        .unwrap();

    // Act
    first.drop_link();
    let mut second = transport.next_connection().await.unwrap();
    second.accept().await.unwrap();
    client
        .wait_until_connected(Duration::from_secs(5))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_secs(30)).await;

    // Assert
    assert_eq!(client.state(), ConnectionState::Connected);
    assert_eq!(transport.open_count(), 2);
    second.drain_frames();
    assert_eq!(second.heartbeats_received(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_session_stops_when_last_handle_dropped() {
    let (client, transport, _events) = start_client(test_settings());
    let mut connection = connect_and_accept(&client, &transport).await;
    let mut state = client.state_changes();

    drop(client);

    let frame = connection.next_frame().await.unwrap();
    assert_eq!(frame.command, Command::Disconnect);
    connection.wait_closed().await;
    state.changed().await.ok();
    assert!(state.borrow().is_closed());
}
