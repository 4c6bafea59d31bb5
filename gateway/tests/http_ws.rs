use std::{net::SocketAddr, time::Duration};

use common_sync::{
    clock,
    message::{self, ClientMessage, PlaybackAction, Role, RoomUser, ServerMessage},
    telemetry,
};

use futures_util::{SinkExt, StreamExt};
use reqwest::StatusCode;
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};

type BoxError = common_sync::metrics::BoxError;
type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn spawn_gateway() -> Result<
    (
        SocketAddr,
        oneshot::Sender<()>,
        tokio::task::JoinHandle<()>,
    ),
    BoxError,
> {
    telemetry::init("gateway-test");

    let app = gateway::build_router();
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;

    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let server = tokio::spawn(async move {
        let shutdown = async {
            let _ = shutdown_rx.await;
        };

        if let Err(err) = axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown)
        .await
        {
            tracing::error!(%err, "gateway test server failed");
        }
    });

    Ok((addr, shutdown_tx, server))
}

async fn connect_ws(addr: SocketAddr) -> Result<WsStream, BoxError> {
    let (ws, _) = connect_async(format!("ws://{}/ws", addr)).await?;
    Ok(ws)
}

async fn send(ws: &mut WsStream, msg: &ClientMessage) -> Result<(), BoxError> {
    let bytes = message::encode(msg)?;
    ws.send(Message::Binary(bytes)).await?;
    Ok(())
}

async fn recv(ws: &mut WsStream) -> Result<ServerMessage, BoxError> {
    loop {
        let frame = tokio::time::timeout(Duration::from_secs(2), ws.next())
            .await?
            .ok_or("websocket closed before a message arrived")??;
        match frame {
            Message::Binary(bytes) => return Ok(message::decode(&bytes)?),
            Message::Ping(_) | Message::Pong(_) => continue,
            other => return Err(format!("unexpected websocket frame: {other:?}").into()),
        }
    }
}

fn display_names(users: &[RoomUser]) -> Vec<&str> {
    users.iter().map(|u| u.display_name.as_str()).collect()
}

#[tokio::test]
async fn http_endpoints_work() -> Result<(), BoxError> {
    let (addr, shutdown_tx, server) = spawn_gateway().await?;
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(2))
        .build()?;
    let base = format!("http://{}", addr);

    let health = client.get(format!("{base}/healthz")).send().await?;
    assert_eq!(StatusCode::OK, health.status());

    let version_resp = client.get(format!("{base}/version")).send().await?;
    assert_eq!(StatusCode::OK, version_resp.status());
    let version_body: serde_json::Value = version_resp.json().await?;
    assert_eq!("gateway", version_body["name"]);

    let metrics_resp = client.get(format!("{base}/metrics")).send().await?;
    assert_eq!(StatusCode::OK, metrics_resp.status());
    let metrics_text = metrics_resp.text().await?;
    assert!(metrics_text.contains("gateway_http_requests_total"));

    shutdown_tx.send(()).ok();
    let _ = server.await.expect("gateway server task panicked");
    Ok(())
}

#[tokio::test]
async fn clock_probe_echoes_nonce_with_server_time() -> Result<(), BoxError> {
    let (addr, shutdown_tx, server) = spawn_gateway().await?;
    let mut ws = connect_ws(addr).await?;

    // Every fresh connection is greeted with the room listing.
    match recv(&mut ws).await? {
        ServerMessage::RoomsList { rooms } => assert!(rooms.is_empty()),
        other => panic!("expected rooms_list on attach, got {other:?}"),
    }

    let before = clock::timestamp_ms();
    send(&mut ws, &ClientMessage::SyncTime { nonce: 7 }).await?;
    match recv(&mut ws).await? {
        ServerMessage::SyncTimeResponse {
            nonce,
            reference_time_ms,
        } => {
            assert_eq!(7, nonce);
            let after = clock::timestamp_ms();
            assert!(
                reference_time_ms >= before && reference_time_ms <= after,
                "server time {reference_time_ms} outside [{before}, {after}]"
            );
        }
        other => panic!("expected sync_time_response, got {other:?}"),
    }

    ws.close(None).await?;
    shutdown_tx.send(()).ok();
    let _ = server.await.expect("gateway server task panicked");
    Ok(())
}

#[tokio::test]
async fn join_playback_and_queue_flow() -> Result<(), BoxError> {
    let (addr, shutdown_tx, server) = spawn_gateway().await?;

    let mut host = connect_ws(addr).await?;
    match recv(&mut host).await? {
        ServerMessage::RoomsList { rooms } => assert!(rooms.is_empty()),
        other => panic!("expected rooms_list on attach, got {other:?}"),
    }

    send(
        &mut host,
        &ClientMessage::JoinRoom {
            room_id: "5012".into(),
            display_name: "ngoc".into(),
        },
    )
    .await?;

    // Creator becomes host and gets no catch-up snapshot.
    match recv(&mut host).await? {
        ServerMessage::UserRole { role } => assert_eq!(Role::Host, role),
        other => panic!("expected user_role, got {other:?}"),
    }
    match recv(&mut host).await? {
        ServerMessage::UpdateUsers { users } => assert_eq!(vec!["ngoc"], display_names(&users)),
        other => panic!("expected update_users, got {other:?}"),
    }
    match recv(&mut host).await? {
        ServerMessage::RoomsList { rooms } => {
            assert_eq!(1, rooms.len());
            assert_eq!("5012", rooms[0].room_id);
            assert_eq!(None, rooms[0].title);
            assert!(!rooms[0].playing);
        }
        other => panic!("expected rooms_list, got {other:?}"),
    }

    let mut listener = connect_ws(addr).await?;
    match recv(&mut listener).await? {
        ServerMessage::RoomsList { rooms } => assert_eq!(1, rooms.len()),
        other => panic!("expected rooms_list on attach, got {other:?}"),
    }

    send(
        &mut listener,
        &ClientMessage::JoinRoom {
            room_id: "5012".into(),
            display_name: "minh".into(),
        },
    )
    .await?;

    match recv(&mut listener).await? {
        ServerMessage::UserRole { role } => assert_eq!(Role::Listener, role),
        other => panic!("expected user_role, got {other:?}"),
    }
    // A joiner that did not create the room gets the catch-up snapshot.
    match recv(&mut listener).await? {
        ServerMessage::InitialSync {
            media_id,
            playing,
            position_secs,
            sequence,
            queue,
            ..
        } => {
            assert_eq!(None, media_id);
            assert!(!playing);
            assert_eq!(0.0, position_secs);
            assert_eq!(0, sequence);
            assert!(queue.is_empty());
        }
        other => panic!("expected initial_sync, got {other:?}"),
    }
    match recv(&mut listener).await? {
        ServerMessage::UpdateUsers { users } => {
            assert_eq!(vec!["ngoc", "minh"], display_names(&users));
        }
        other => panic!("expected update_users, got {other:?}"),
    }
    match recv(&mut listener).await? {
        ServerMessage::RoomsList { rooms } => assert_eq!(2, rooms[0].participants),
        other => panic!("expected rooms_list, got {other:?}"),
    }

    // The host sees the roster change too.
    match recv(&mut host).await? {
        ServerMessage::UpdateUsers { users } => {
            assert_eq!(vec!["ngoc", "minh"], display_names(&users));
        }
        other => panic!("expected update_users, got {other:?}"),
    }
    match recv(&mut host).await? {
        ServerMessage::RoomsList { .. } => {}
        other => panic!("expected rooms_list, got {other:?}"),
    }

    // Host starts a track: song first, then the play action, then the listing.
    send(
        &mut host,
        &ClientMessage::PlaySong {
            room_id: "5012".into(),
            media_id: "dQw4w9WgXcQ".into(),
            title: "Never Gonna Give You Up".into(),
        },
    )
    .await?;

    for ws in [&mut host, &mut listener] {
        match recv(ws).await? {
            ServerMessage::ReceiveSong { media_id, title } => {
                assert_eq!("dQw4w9WgXcQ", media_id);
                assert_eq!("Never Gonna Give You Up", title);
            }
            other => panic!("expected receive_song, got {other:?}"),
        }
        match recv(ws).await? {
            ServerMessage::ReceiveAction { action } => assert_eq!(PlaybackAction::Play, action),
            other => panic!("expected receive_action, got {other:?}"),
        }
        match recv(ws).await? {
            ServerMessage::RoomsList { rooms } => {
                assert_eq!(Some("Never Gonna Give You Up".to_string()), rooms[0].title);
                assert!(rooms[0].playing);
            }
            other => panic!("expected rooms_list, got {other:?}"),
        }
    }

    // Position reports fan out to listeners only, with climbing sequences.
    send(
        &mut host,
        &ClientMessage::TimeUpdate {
            room_id: "5012".into(),
            position_secs: 12.5,
            reference_now_ms: clock::timestamp_ms(),
        },
    )
    .await?;
    match recv(&mut listener).await? {
        ServerMessage::ReceiveTime {
            position_secs,
            sequence,
            ..
        } => {
            assert_eq!(12.5, position_secs);
            assert_eq!(1, sequence);
        }
        other => panic!("expected receive_time, got {other:?}"),
    }

    send(
        &mut host,
        &ClientMessage::TimeUpdate {
            room_id: "5012".into(),
            position_secs: 13.0,
            reference_now_ms: clock::timestamp_ms(),
        },
    )
    .await?;
    match recv(&mut listener).await? {
        ServerMessage::ReceiveTime { sequence, .. } => assert_eq!(2, sequence),
        other => panic!("expected receive_time, got {other:?}"),
    }

    // Queue a track, then advance to it.
    send(
        &mut host,
        &ClientMessage::AddToQueue {
            room_id: "5012".into(),
            media_id: "9bZkp7q19f0".into(),
            title: "Gangnam Style".into(),
        },
    )
    .await?;
    for ws in [&mut host, &mut listener] {
        match recv(ws).await? {
            ServerMessage::UpdateQueue { queue } => {
                assert_eq!(1, queue.len());
                assert_eq!("9bZkp7q19f0", queue[0].media_id);
            }
            other => panic!("expected update_queue, got {other:?}"),
        }
    }

    send(
        &mut host,
        &ClientMessage::PlayNext {
            room_id: "5012".into(),
        },
    )
    .await?;
    for ws in [&mut host, &mut listener] {
        match recv(ws).await? {
            ServerMessage::ReceiveSong { media_id, .. } => assert_eq!("9bZkp7q19f0", media_id),
            other => panic!("expected receive_song, got {other:?}"),
        }
        match recv(ws).await? {
            ServerMessage::UpdateQueue { queue } => assert!(queue.is_empty()),
            other => panic!("expected update_queue, got {other:?}"),
        }
        match recv(ws).await? {
            ServerMessage::ReceiveAction { action } => assert_eq!(PlaybackAction::Play, action),
            other => panic!("expected receive_action, got {other:?}"),
        }
        match recv(ws).await? {
            ServerMessage::RoomsList { rooms } => {
                assert_eq!(Some("Gangnam Style".to_string()), rooms[0].title);
            }
            other => panic!("expected rooms_list, got {other:?}"),
        }
    }

    host.close(None).await?;
    listener.close(None).await?;
    shutdown_tx.send(()).ok();
    let _ = server.await.expect("gateway server task panicked");
    Ok(())
}

#[tokio::test]
async fn host_enforcement_and_failover() -> Result<(), BoxError> {
    let (addr, shutdown_tx, server) = spawn_gateway().await?;

    let mut host = connect_ws(addr).await?;
    let _ = recv(&mut host).await?; // rooms_list on attach
    send(
        &mut host,
        &ClientMessage::JoinRoom {
            room_id: "6303".into(),
            display_name: "ngoc".into(),
        },
    )
    .await?;
    for _ in 0..3 {
        let _ = recv(&mut host).await?; // user_role, update_users, rooms_list
    }

    let mut listener = connect_ws(addr).await?;
    let _ = recv(&mut listener).await?;
    send(
        &mut listener,
        &ClientMessage::JoinRoom {
            room_id: "6303".into(),
            display_name: "minh".into(),
        },
    )
    .await?;
    for _ in 0..4 {
        let _ = recv(&mut listener).await?; // user_role, initial_sync, update_users, rooms_list
    }
    for _ in 0..2 {
        let _ = recv(&mut host).await?; // update_users, rooms_list
    }

    // A listener's playback command is rejected server-side. The clock probe
    // after it proves the command was already processed, so the very next
    // broadcast the listener sees must come from the host's play_song.
    send(
        &mut listener,
        &ClientMessage::PlayerAction {
            room_id: "6303".into(),
            action: PlaybackAction::Pause,
        },
    )
    .await?;
    send(&mut listener, &ClientMessage::SyncTime { nonce: 42 }).await?;
    match recv(&mut listener).await? {
        ServerMessage::SyncTimeResponse { nonce, .. } => assert_eq!(42, nonce),
        other => panic!("expected sync_time_response, got {other:?}"),
    }

    send(
        &mut host,
        &ClientMessage::PlaySong {
            room_id: "6303".into(),
            media_id: "dQw4w9WgXcQ".into(),
            title: "Never Gonna Give You Up".into(),
        },
    )
    .await?;
    match recv(&mut listener).await? {
        ServerMessage::ReceiveSong { .. } => {}
        other => panic!("rejected pause must produce no broadcast, got {other:?}"),
    }
    for _ in 0..2 {
        let _ = recv(&mut listener).await?; // receive_action, rooms_list
    }
    for _ in 0..3 {
        let _ = recv(&mut host).await?; // receive_song, receive_action, rooms_list
    }

    // Host drops away; the remaining listener is promoted and its commands
    // start taking effect.
    host.close(None).await?;
    match recv(&mut listener).await? {
        ServerMessage::UserRole { role } => assert_eq!(Role::Host, role),
        other => panic!("expected promotion to host, got {other:?}"),
    }
    match recv(&mut listener).await? {
        ServerMessage::UpdateUsers { users } => assert_eq!(vec!["minh"], display_names(&users)),
        other => panic!("expected update_users, got {other:?}"),
    }
    match recv(&mut listener).await? {
        ServerMessage::RoomsList { rooms } => assert_eq!(1, rooms[0].participants),
        other => panic!("expected rooms_list, got {other:?}"),
    }

    send(
        &mut listener,
        &ClientMessage::PlayerAction {
            room_id: "6303".into(),
            action: PlaybackAction::Pause,
        },
    )
    .await?;
    match recv(&mut listener).await? {
        ServerMessage::RoomsList { rooms } => assert!(!rooms[0].playing),
        other => panic!("expected rooms_list after accepted pause, got {other:?}"),
    }

    listener.close(None).await?;
    shutdown_tx.send(()).ok();
    let _ = server.await.expect("gateway server task panicked");
    Ok(())
}
