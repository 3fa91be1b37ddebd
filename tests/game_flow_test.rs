use actix_web::{web, App};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use pixsim_relay::broker::Broker;
use pixsim_relay::catalog::MapCatalog;
use pixsim_relay::compiler::ControllerSet;
use pixsim_relay::handlers::game_ws;
use pixsim_relay::pixels::{LookupTable, PixelConverter};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout, Duration};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

const TABLE: &str = "\
id,rps,bps,psp,standard
0,air,00,0,air
1,stone,10,1,stone
2,grass,21,2,grass
";

type WsWrite = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;
type WsRead = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

fn test_broker() -> Arc<Broker> {
    let lookup = LookupTable::from_csv(TABLE).unwrap();
    let mut extracted = HashMap::new();
    extracted.insert(
        pixsim_relay::models::DialectId::Rps,
        json!({ "air": 0, "stone": 5, "grass": 6 }),
    );
    extracted.insert(
        pixsim_relay::models::DialectId::Bps,
        json!({ "00": 0, "10": 11, "21": 12 }),
    );
    let converter = Arc::new(PixelConverter::build(&lookup, &extracted));
    Broker::with_key_bits(
        converter,
        Arc::new(MapCatalog::empty()),
        Arc::new(ControllerSet::empty()),
        1024,
    )
    .unwrap()
}

fn start_server(broker: Arc<Broker>) -> actix_test::TestServer {
    actix_test::start(move || {
        App::new()
            .app_data(web::Data::from(broker.clone()))
            .route("/pixsim-api/game", web::get().to(game_ws))
    })
}

async fn connect(srv: &actix_test::TestServer) -> (WsWrite, WsRead) {
    let url = format!("ws://127.0.0.1:{}/pixsim-api/game", srv.addr().port());
    let (stream, _) = connect_async(&url).await.expect("ws connect failed");
    stream.split()
}

async fn send_json(write: &mut WsWrite, value: Value) {
    write
        .send(Message::Text(value.to_string().into()))
        .await
        .expect("ws send failed");
}

async fn recv_json(read: &mut WsRead) -> Value {
    loop {
        let msg = timeout(Duration::from_secs(3), read.next())
            .await
            .expect("timed out waiting for event")
            .expect("stream ended")
            .expect("ws error");
        match msg {
            Message::Text(text) => return serde_json::from_str(&text).unwrap(),
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("unexpected frame: {:?}", other),
        }
    }
}

/// Handshake as `username` speaking `dialect`; consumes the key offer and
/// the ack.
async fn handshake(write: &mut WsWrite, read: &mut WsRead, username: &str, dialect: &str) {
    let offer = recv_json(read).await;
    assert_eq!(offer["type"], "requestClientInfo");
    assert_eq!(offer["data"]["kty"], "RSA");
    send_json(
        write,
        json!({ "type": "clientInfo", "data": { "username": username, "client": dialect } }),
    )
    .await;
    let ack = recv_json(read).await;
    assert_eq!(ack["type"], "clientInfoRecieved");
}

fn tick_frame(grid: Vec<u8>, amounts: Value) -> Value {
    json!({
        "type": "tick",
        "data": {
            "grid": grid,
            "teamGrid": [0, 1],
            "booleanGrids": [[1, 0]],
            "origin": "sim",
            "data": { "tick": 1, "teamPixelAmounts": [amounts, []] }
        }
    })
}

#[actix_rt::test]
async fn minimal_match_setup_and_first_tick() {
    let srv = start_server(test_broker());

    let (mut wa, mut ra) = connect(&srv).await;
    handshake(&mut wa, &mut ra, "ada", "rps").await;

    send_json(&mut wa, json!({ "type": "createGame" })).await;
    let code = {
        let event = recv_json(&mut ra).await;
        assert_eq!(event["type"], "gameCode");
        event["data"].as_str().unwrap().to_string()
    };
    assert_eq!(recv_json(&mut ra).await["type"], "joinSuccess");
    assert_eq!(recv_json(&mut ra).await["type"], "gameType");
    assert_eq!(recv_json(&mut ra).await["type"], "updateTeamLists");
    send_json(&mut wa, json!({ "type": "teamSize", "data": 1 })).await;
    assert_eq!(recv_json(&mut ra).await["type"], "updateTeamLists");

    let (mut wb, mut rb) = connect(&srv).await;
    handshake(&mut wb, &mut rb, "bob", "rps").await;

    send_json(
        &mut wb,
        json!({ "type": "getPublicRooms", "data": { "type": "pixelcrash", "spectating": false } }),
    )
    .await;
    let listing = recv_json(&mut rb).await;
    assert_eq!(listing["type"], "publicRooms");
    assert_eq!(listing["data"][0]["code"], code.as_str());
    assert_eq!(listing["data"][0]["hostName"], "ada");

    send_json(
        &mut wb,
        json!({ "type": "joinGame", "data": { "code": code, "spectating": false } }),
    )
    .await;

    // the exact post-join sequence
    let join = recv_json(&mut rb).await;
    assert_eq!(join["type"], "joinSuccess");
    assert_eq!(join["data"], 1);
    let game_type = recv_json(&mut rb).await;
    assert_eq!(game_type["type"], "gameType");
    assert_eq!(game_type["data"], "pixelcrash");
    let rosters = recv_json(&mut rb).await;
    assert_eq!(rosters["type"], "updateTeamLists");
    assert_eq!(rosters["data"]["teamA"], json!(["ada"]));
    assert_eq!(rosters["data"]["teamB"], json!(["bob"]));
    assert_eq!(rosters["data"]["spectators"], json!([]));
    assert_eq!(rosters["data"]["teamSize"], 1);

    // host sees the join too
    assert_eq!(recv_json(&mut ra).await["type"], "updateTeamLists");

    send_json(&mut wa, json!({ "type": "startGame" })).await;
    assert_eq!(recv_json(&mut ra).await["type"], "gameStart");
    assert_eq!(recv_json(&mut rb).await["type"], "gameStart");

    send_json(&mut wa, json!({ "type": "ready" })).await;
    send_json(&mut wb, json!({ "type": "ready" })).await;
    sleep(Duration::from_millis(200)).await;

    send_json(
        &mut wa,
        tick_frame(vec![0x80, 5], json!([0, 0, 0, 0, 0, 3])),
    )
    .await;
    let tick = recv_json(&mut rb).await;
    assert_eq!(tick["type"], "tick");
    assert_eq!(tick["data"]["grid"], json!([0x80, 5]));
    assert_eq!(tick["data"]["data"]["tick"], 1);
}

#[actix_rt::test]
async fn cross_dialect_tick_translation() {
    let srv = start_server(test_broker());

    let (mut wa, mut ra) = connect(&srv).await;
    handshake(&mut wa, &mut ra, "ada", "rps").await;
    send_json(&mut wa, json!({ "type": "createGame" })).await;
    let code = recv_json(&mut ra).await["data"].as_str().unwrap().to_string();

    // bps teammate and an rps spectator
    let (mut wb, mut rb) = connect(&srv).await;
    handshake(&mut wb, &mut rb, "bob", "bps").await;
    send_json(
        &mut wb,
        json!({ "type": "joinGame", "data": { "code": code, "spectating": false } }),
    )
    .await;
    let (mut ws, mut rs) = connect(&srv).await;
    handshake(&mut ws, &mut rs, "watcher", "rps").await;
    send_json(
        &mut ws,
        json!({ "type": "joinGame", "data": { "code": code, "spectating": true } }),
    )
    .await;
    sleep(Duration::from_millis(100)).await;

    send_json(&mut wa, json!({ "type": "startGame" })).await;
    send_json(&mut wa, json!({ "type": "ready" })).await;
    send_json(&mut wb, json!({ "type": "ready" })).await;
    sleep(Duration::from_millis(200)).await;

    // grid and amounts hold the rps numeric for canonical "stone"
    send_json(
        &mut wa,
        tick_frame(vec![0x80, 5], json!([0, 0, 0, 0, 0, 7])),
    )
    .await;

    let tick_b = loop {
        let event = recv_json(&mut rb).await;
        if event["type"] == "tick" {
            break event;
        }
    };
    // the bps receiver gets the bps numeric for "stone": the count moves
    // from index 5 to index 11
    assert_eq!(tick_b["data"]["grid"], json!([0x80, 11]));
    assert_eq!(
        tick_b["data"]["data"]["teamPixelAmounts"][0],
        json!([0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 7])
    );
    // the flag byte is untouched
    assert_eq!(tick_b["data"]["teamGrid"], json!([0, 1]));

    let tick_s = loop {
        let event = recv_json(&mut rs).await;
        if event["type"] == "tick" {
            break event;
        }
    };
    // the same-dialect receiver gets byte-identical data
    assert_eq!(tick_s["data"]["grid"], json!([0x80, 5]));
    assert_eq!(
        tick_s["data"]["data"]["teamPixelAmounts"][0],
        json!([0, 0, 0, 0, 0, 7])
    );
}

#[actix_rt::test]
async fn host_misbehavior_ends_the_game() {
    let srv = start_server(test_broker());

    let (mut wa, mut ra) = connect(&srv).await;
    handshake(&mut wa, &mut ra, "ada", "rps").await;
    send_json(&mut wa, json!({ "type": "createGame" })).await;
    let code = recv_json(&mut ra).await["data"].as_str().unwrap().to_string();

    let (mut wb, mut rb) = connect(&srv).await;
    handshake(&mut wb, &mut rb, "bob", "rps").await;
    send_json(
        &mut wb,
        json!({ "type": "joinGame", "data": { "code": code, "spectating": false } }),
    )
    .await;
    sleep(Duration::from_millis(100)).await;

    send_json(&mut wa, json!({ "type": "startGame" })).await;
    send_json(&mut wa, json!({ "type": "ready" })).await;
    send_json(&mut wb, json!({ "type": "ready" })).await;
    sleep(Duration::from_millis(200)).await;

    // a tick whose payload is not even an object
    send_json(&mut wa, json!({ "type": "tick", "data": 123 })).await;

    let mut saw_game_end = 0;
    loop {
        let event = recv_json(&mut rb).await;
        if event["type"] == "gameEnd" {
            saw_game_end += 1;
            break;
        }
    }
    assert_eq!(saw_game_end, 1);

    // the room is gone from subsequent listings
    send_json(
        &mut wb,
        json!({ "type": "getPublicRooms", "data": { "type": "pixelcrash", "spectating": false } }),
    )
    .await;
    let listing = recv_json(&mut rb).await;
    assert_eq!(listing["type"], "publicRooms");
    assert_eq!(listing["data"], json!([]));
}

#[actix_rt::test]
async fn full_teams_force_spectator() {
    let srv = start_server(test_broker());

    let (mut wa, mut ra) = connect(&srv).await;
    handshake(&mut wa, &mut ra, "ada", "rps").await;
    send_json(&mut wa, json!({ "type": "createGame" })).await;
    let code = recv_json(&mut ra).await["data"].as_str().unwrap().to_string();

    let (mut wb, mut rb) = connect(&srv).await;
    handshake(&mut wb, &mut rb, "bob", "rps").await;
    send_json(
        &mut wb,
        json!({ "type": "joinGame", "data": { "code": code.clone(), "spectating": false } }),
    )
    .await;
    sleep(Duration::from_millis(100)).await;

    // both teams are full at teamSize 1; eve is forced to spectate
    let (mut we, mut re) = connect(&srv).await;
    handshake(&mut we, &mut re, "eve", "rps").await;
    send_json(
        &mut we,
        json!({ "type": "joinGame", "data": { "code": code, "spectating": false } }),
    )
    .await;
    let forced = recv_json(&mut re).await;
    assert_eq!(forced["type"], "forcedSpectator");
    let join = recv_json(&mut re).await;
    assert_eq!(join["type"], "joinSuccess");
    assert_eq!(join["data"], 2);
}

#[actix_rt::test]
async fn create_game_spam_destroys_the_offender() {
    let srv = start_server(test_broker());

    let (mut wa, mut ra) = connect(&srv).await;
    handshake(&mut wa, &mut ra, "ada", "rps").await;
    send_json(&mut wa, json!({ "type": "createGame" })).await;
    send_json(&mut wa, json!({ "type": "createGame" })).await;

    // the connection dies
    let mut closed = false;
    for _ in 0..20 {
        match timeout(Duration::from_secs(1), ra.next()).await {
            Ok(None) | Ok(Some(Ok(Message::Close(_)))) | Ok(Some(Err(_))) => {
                closed = true;
                break;
            }
            Ok(Some(Ok(_))) => continue,
            Err(_) => break,
        }
    }
    assert!(closed, "offender connection should have been closed");
}

#[actix_rt::test]
async fn fourth_connection_from_one_ip_is_rejected() {
    let srv = start_server(test_broker());
    let url = format!("ws://127.0.0.1:{}/pixsim-api/game", srv.addr().port());

    let _c1 = connect_async(&url).await.expect("first connect");
    let _c2 = connect_async(&url).await.expect("second connect");
    let _c3 = connect_async(&url).await.expect("third connect");
    assert!(
        connect_async(&url).await.is_err(),
        "fourth connection in the window must be dropped"
    );
}

#[actix_rt::test]
async fn invalid_handshake_destroys_the_handler() {
    let srv = start_server(test_broker());
    let (mut w, mut r) = connect(&srv).await;

    let offer = recv_json(&mut r).await;
    assert_eq!(offer["type"], "requestClientInfo");
    send_json(
        &mut w,
        json!({ "type": "clientInfo", "data": { "username": "ada", "client": "mystery" } }),
    )
    .await;

    let mut closed = false;
    for _ in 0..20 {
        match timeout(Duration::from_secs(1), r.next()).await {
            Ok(None) | Ok(Some(Ok(Message::Close(_)))) | Ok(Some(Err(_))) => {
                closed = true;
                break;
            }
            Ok(Some(Ok(_))) => continue,
            Err(_) => break,
        }
    }
    assert!(closed, "handshake violation should close the connection");
}

#[actix_rt::test]
async fn pre_handshake_frames_are_ignored() {
    let srv = start_server(test_broker());
    let (mut w, mut r) = connect(&srv).await;

    let offer = recv_json(&mut r).await;
    assert_eq!(offer["type"], "requestClientInfo");

    // unrecognized pre-handshake traffic must not kill the connection
    send_json(&mut w, json!({ "type": "createGame" })).await;
    send_json(&mut w, json!({ "type": "ping" })).await;
    send_json(
        &mut w,
        json!({ "type": "clientInfo", "data": { "username": "ada", "client": "rps" } }),
    )
    .await;
    let ack = recv_json(&mut r).await;
    assert_eq!(ack["type"], "clientInfoRecieved");

    // post-handshake ping answers pong
    send_json(&mut w, json!({ "type": "ping" })).await;
    assert_eq!(recv_json(&mut r).await["type"], "pong");
}

#[actix_rt::test]
async fn input_is_funneled_to_the_host_translated() {
    let srv = start_server(test_broker());

    let (mut wa, mut ra) = connect(&srv).await;
    handshake(&mut wa, &mut ra, "ada", "rps").await;
    send_json(&mut wa, json!({ "type": "createGame" })).await;
    let code = recv_json(&mut ra).await["data"].as_str().unwrap().to_string();

    let (mut wb, mut rb) = connect(&srv).await;
    handshake(&mut wb, &mut rb, "bob", "bps").await;
    send_json(
        &mut wb,
        json!({ "type": "joinGame", "data": { "code": code, "spectating": false } }),
    )
    .await;
    sleep(Duration::from_millis(100)).await;

    send_json(&mut wa, json!({ "type": "startGame" })).await;
    send_json(&mut wa, json!({ "type": "ready" })).await;
    send_json(&mut wb, json!({ "type": "ready" })).await;
    sleep(Duration::from_millis(200)).await;

    // bob paints with bps "stone" (11); ada must see rps "stone" (5)
    send_json(
        &mut wb,
        json!({ "type": "input", "data": { "type": 0, "data": [2, 3, 0, 0, 1, 11] } }),
    )
    .await;
    let input = loop {
        let event = recv_json(&mut ra).await;
        if event["type"] == "input" {
            break event;
        }
    };
    assert_eq!(input["data"]["type"], 0);
    assert_eq!(input["data"]["team"], 1);
    assert_eq!(input["data"]["data"], json!([2, 3, 0, 0, 1, 5]));
}
