use std::{
    io::{ErrorKind, Read, Write},
    net::{SocketAddr, TcpListener, UdpSocket},
    sync::{
        mpsc::{self, Sender},
        Arc, Mutex,
    },
    thread,
    time::{Duration, Instant},
};

use realtime_rtc::{
    signaling::{exchange_sdp, fetch_credential, EphemeralCredential},
    util::host_address,
    Direction, Event, LogEntry, RelayConfig, RelayError, RelayHandle, SessionRelay, SessionState,
};
use rouille::{Request, Response, Server};
use str0m::{
    change::SdpOffer,
    net::{Protocol, Receive},
    Candidate, Input, Output, Rtc,
};

const TOKEN_BODY: &str = r#"{"client_secret":{"value":"ek_test","expires_at":4102444800}}"#;

/// A loopback HTTP server that stops when dropped.
struct TestServer {
    url: String,
    _stop: Sender<()>,
}

fn serve<F>(handler: F) -> TestServer
where
    F: Send + Sync + 'static + Fn(&Request) -> Response,
{
    let server = Server::new("127.0.0.1:0", handler).expect("starting the test server");
    let url = format!("http://{}", server.server_addr());
    let (_, stop) = server.stoppable();
    TestServer { url, _stop: stop }
}

fn body_of(request: &Request) -> String {
    let mut body = String::new();
    if let Some(mut data) = request.data() {
        data.read_to_string(&mut body).expect("body to be readable");
    }
    body
}

fn token_response() -> Response {
    Response::from_data("application/json", TOKEN_BODY)
}

/// Answers an SDP offer the way the realtime endpoint would.
fn answer_offer(request: &Request) -> Response {
    let Ok(offer) = SdpOffer::from_sdp_string(&body_of(request)) else {
        return Response::text("bad offer").with_status_code(400);
    };

    let mut rtc = Rtc::new();
    let candidate = Candidate::host("127.0.0.1:3478".parse().unwrap(), "udp").unwrap();
    rtc.add_local_candidate(candidate);

    match rtc.sdp_api().accept_offer(offer) {
        Ok(answer) => Response::from_data("application/sdp", answer.to_sdp_string()),
        Err(e) => Response::text(e.to_string()).with_status_code(500),
    }
}

/// Serves `/token` and an answering `/v1/realtime`.
fn realtime_server() -> TestServer {
    serve(|request| match request.url().as_str() {
        "/token" => token_response(),
        "/v1/realtime" => answer_offer(request),
        _ => Response::empty_404(),
    })
}

fn config_for(server: &TestServer) -> RelayConfig {
    RelayConfig {
        token_url: format!("{}/token", server.url),
        realtime_url: format!("{}/v1/realtime", server.url),
        model: "gpt-test".to_string(),
        ..Default::default()
    }
}

fn credential() -> EphemeralCredential {
    serde_json::from_str(r#"{"value":"ek_test"}"#).unwrap()
}

#[tokio::test]
async fn fetch_credential_reads_client_secret() {
    let server = serve(|_| token_response());
    let client = reqwest::Client::new();

    let credential = fetch_credential(&client, &format!("{}/token", server.url))
        .await
        .unwrap();

    assert_eq!(credential.value, "ek_test");
    assert_eq!(
        credential.expires_at().map(|t| t.timestamp()),
        Some(4_102_444_800)
    );
}

#[tokio::test]
async fn fetch_credential_rejects_error_status() {
    let server = serve(|_| Response::text("boom").with_status_code(500));
    let client = reqwest::Client::new();

    let result = fetch_credential(&client, &format!("{}/token", server.url)).await;

    assert!(matches!(result, Err(RelayError::Credential(_))));
}

#[tokio::test]
async fn fetch_credential_rejects_missing_secret() {
    let server = serve(|_| Response::from_data("application/json", r#"{"id":"sess_1"}"#));
    let client = reqwest::Client::new();

    let result = fetch_credential(&client, &format!("{}/token", server.url)).await;

    assert!(matches!(result, Err(RelayError::Credential(_))));
}

#[derive(Debug, Default, Clone)]
struct SeenRequest {
    method: String,
    authorization: Option<String>,
    content_type: Option<String>,
    model: Option<String>,
    body: String,
}

#[tokio::test]
async fn exchange_sdp_posts_offer_with_bearer_credential() {
    let seen = Arc::new(Mutex::new(SeenRequest::default()));
    let recorded = seen.clone();
    let server = serve(move |request| {
        *recorded.lock().unwrap() = SeenRequest {
            method: request.method().to_string(),
            authorization: request.header("Authorization").map(str::to_string),
            content_type: request.header("Content-Type").map(str::to_string),
            model: request.get_param("model"),
            body: body_of(request),
        };
        Response::from_data("application/sdp", "v=0\r\nanswer\r\n")
    });
    let client = reqwest::Client::new();

    let answer = exchange_sdp(
        &client,
        &format!("{}/v1/realtime", server.url),
        "gpt-test",
        &credential(),
        "v=0\r\noffer\r\n".to_string(),
    )
    .await
    .unwrap();

    assert_eq!(answer, "v=0\r\nanswer\r\n");

    let seen = seen.lock().unwrap().clone();
    assert_eq!(seen.method, "POST");
    assert_eq!(seen.authorization.as_deref(), Some("Bearer ek_test"));
    assert_eq!(seen.content_type.as_deref(), Some("application/sdp"));
    assert_eq!(seen.model.as_deref(), Some("gpt-test"));
    assert_eq!(seen.body, "v=0\r\noffer\r\n");
}

#[tokio::test]
async fn exchange_sdp_surfaces_rejection() {
    let server = serve(|_| Response::text("invalid credential").with_status_code(401));
    let client = reqwest::Client::new();

    let result = exchange_sdp(
        &client,
        &format!("{}/v1/realtime", server.url),
        "gpt-test",
        &credential(),
        "v=0\r\n".to_string(),
    )
    .await;

    match result {
        Err(RelayError::Negotiation(message)) => {
            assert!(message.contains("401"));
            assert!(message.contains("invalid credential"));
        }
        other => panic!("expected a negotiation error, got {other:?}"),
    }
}

#[tokio::test]
async fn exchange_sdp_reports_truncated_answer_as_negotiation_failure() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let url = format!("http://{}/v1/realtime", listener.local_addr().unwrap());
    thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        let mut request = Vec::new();
        let mut buf = [0; 1024];
        while !String::from_utf8_lossy(&request).ends_with("v=0\r\n") {
            let n = stream.read(&mut buf).unwrap();
            if n == 0 {
                break;
            }
            request.extend_from_slice(&buf[..n]);
        }
        // Promises more body than it sends, then hangs up.
        stream
            .write_all(b"HTTP/1.1 200 OK\r\nContent-Type: application/sdp\r\nContent-Length: 512\r\n\r\nv=0\r\n")
            .unwrap();
    });
    let client = reqwest::Client::new();

    let result = exchange_sdp(&client, &url, "gpt-test", &credential(), "v=0\r\n".to_string()).await;

    match result {
        Err(RelayError::Negotiation(message)) => assert!(message.contains("reading answer")),
        other => panic!("expected a negotiation error, got {other:?}"),
    }
}

#[tokio::test]
async fn stop_before_start_leaves_session_inactive() {
    let relay = SessionRelay::spawn(RelayConfig::default());

    assert_eq!(relay.stop().await.unwrap(), None);
    assert_eq!(relay.stop().await.unwrap(), None);
    assert_eq!(relay.state(), SessionState::Inactive);
}

#[tokio::test]
async fn send_without_session_is_dropped() {
    let relay = SessionRelay::spawn(RelayConfig::default());

    relay.send(Event::response_create()).unwrap();
    relay.send_text("hi").unwrap();

    assert!(relay.events().await.unwrap().is_empty());
    assert_eq!(relay.state(), SessionState::Inactive);
}

#[tokio::test]
async fn start_negotiates_then_stop_resets() {
    let server = realtime_server();
    let relay = SessionRelay::spawn(config_for(&server));

    relay.start().await.unwrap();
    assert_eq!(relay.state(), SessionState::Connecting);

    // Nothing is written before the channel opens.
    relay.send_text("too early").unwrap();
    assert!(relay.events().await.unwrap().is_empty());

    assert_eq!(relay.stop().await.unwrap(), None);
    assert_eq!(relay.state(), SessionState::Inactive);
}

#[tokio::test]
async fn failed_credential_fetch_aborts_start() {
    let server = serve(|_| Response::empty_404());
    let relay = SessionRelay::spawn(config_for(&server));

    let result = relay.start().await;

    assert!(matches!(result, Err(RelayError::Credential(_))));
    assert_eq!(relay.state(), SessionState::Inactive);
}

#[tokio::test]
async fn rejected_offer_aborts_start() {
    let server = serve(|request| match request.url().as_str() {
        "/token" => token_response(),
        _ => Response::text("model not found").with_status_code(404),
    });
    let relay = SessionRelay::spawn(config_for(&server));

    let result = relay.start().await;

    assert!(matches!(result, Err(RelayError::Negotiation(_))));
    assert_eq!(relay.state(), SessionState::Inactive);

    // A failed start can be retried.
    let retry = relay.start().await;
    assert!(matches!(retry, Err(RelayError::Negotiation(_))));
}

#[tokio::test]
async fn stop_while_connecting_cancels_start() {
    let server = serve(|_| {
        thread::sleep(Duration::from_secs(2));
        token_response()
    });
    let relay = SessionRelay::spawn(config_for(&server));

    let starting = {
        let relay = relay.clone();
        tokio::spawn(async move { relay.start().await })
    };
    relay
        .wait_for_state(SessionState::Connecting)
        .await
        .unwrap();

    assert!(matches!(
        relay.start().await,
        Err(RelayError::AlreadyStarted)
    ));

    relay.stop().await.unwrap();

    assert!(matches!(
        starting.await.unwrap(),
        Err(RelayError::Stopped)
    ));
    assert_eq!(relay.state(), SessionState::Inactive);
}

/// Serves `/token` and a `/v1/realtime` that answers with a live peer.
///
/// Every payload the remote peer receives on the data channel is forwarded
/// on the returned receiver. After the first one it replies with a frame that
/// is not JSON followed by a `session.created` event.
fn live_realtime_server() -> (TestServer, mpsc::Receiver<String>) {
    let (tx, rx) = mpsc::channel();
    let tx = Mutex::new(tx);
    let server = serve(move |request| match request.url().as_str() {
        "/token" => token_response(),
        "/v1/realtime" => {
            let offer = SdpOffer::from_sdp_string(&body_of(request)).expect("a valid offer");

            let socket = UdpSocket::bind(SocketAddr::new(host_address(), 0)).unwrap();
            let addr = socket.local_addr().unwrap();
            let mut rtc = Rtc::new();
            rtc.add_local_candidate(Candidate::host(addr, "udp").unwrap());
            let answer = rtc.sdp_api().accept_offer(offer).expect("offer to be accepted");

            let received = tx.lock().unwrap().clone();
            thread::spawn(move || run_remote_peer(rtc, socket, received));

            Response::from_data("application/sdp", answer.to_sdp_string())
        }
        _ => Response::empty_404(),
    });
    (server, rx)
}

fn run_remote_peer(mut rtc: Rtc, socket: UdpSocket, received: Sender<String>) {
    let local_addr = socket.local_addr().unwrap();
    let deadline = Instant::now() + Duration::from_secs(30);
    let mut buf = vec![0; 2000];
    let mut replied = false;

    while rtc.is_alive() && Instant::now() < deadline {
        // Poll until timeout
        let timeout = loop {
            match rtc.poll_output() {
                Ok(Output::Timeout(t)) => break t,
                Ok(Output::Transmit(t)) => {
                    let _ = socket.send_to(&t.contents, t.destination);
                }
                Ok(Output::Event(str0m::Event::ChannelData(data))) => {
                    if !replied {
                        replied = true;
                        let mut channel = rtc.channel(data.id).expect("channel to be open");
                        channel.write(false, b"not json").unwrap();
                        channel
                            .write(false, br#"{"type":"session.created","event_id":"evt_remote"}"#)
                            .unwrap();
                    }
                    let _ = received.send(String::from_utf8_lossy(&data.data).into_owned());
                }
                Ok(Output::Event(_)) => {}
                Err(_) => return,
            }
        };

        // The read timeout is not allowed to be 0.
        let wait = timeout
            .saturating_duration_since(Instant::now())
            .max(Duration::from_millis(1));
        socket.set_read_timeout(Some(wait)).unwrap();

        buf.resize(2000, 0);
        let input = match socket.recv_from(&mut buf) {
            Ok((n, source)) => {
                buf.truncate(n);
                let Ok(contents) = buf.as_slice().try_into() else {
                    continue;
                };
                Input::Receive(
                    Instant::now(),
                    Receive {
                        proto: Protocol::Udp,
                        source,
                        destination: local_addr,
                        contents,
                    },
                )
            }
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                Input::Timeout(Instant::now())
            }
            Err(e) => panic!("UdpSocket read failed: {e:?}"),
        };

        if rtc.handle_input(input).is_err() {
            return;
        }
    }
}

/// Polls the relay log until a server event shows up.
async fn wait_for_server_event(relay: &RelayHandle) -> Vec<LogEntry> {
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        let log = relay.events().await.unwrap();
        if log.iter().any(|e| e.direction == Direction::Server) {
            return log;
        }
        assert!(Instant::now() < deadline, "no server event arrived: {log:?}");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn live_session_relays_events_both_ways() {
    let (server, from_client) = live_realtime_server();
    let relay = SessionRelay::spawn(config_for(&server));

    relay.start().await.unwrap();
    tokio::time::timeout(
        Duration::from_secs(10),
        relay.wait_for_state(SessionState::Active),
    )
    .await
    .expect("data channel to open")
    .unwrap();
    assert!(relay.events().await.unwrap().is_empty());

    relay.send_text("Hello there").unwrap();

    let delivered: Vec<Event> = tokio::task::spawn_blocking(move || {
        (0..2)
            .map(|_| from_client.recv_timeout(Duration::from_secs(10)).unwrap())
            .map(|payload| Event::parse(payload.as_bytes()).unwrap())
            .collect()
    })
    .await
    .unwrap();
    assert_eq!(delivered[0].event_type(), Some("conversation.item.create"));
    assert_eq!(
        delivered[0].get("item").unwrap()["content"][0]["text"],
        "Hello there"
    );
    assert_eq!(delivered[1].event_type(), Some("response.create"));

    // The frame that is not JSON never makes it into the log.
    let log = wait_for_server_event(&relay).await;
    let seen: Vec<(Direction, Option<&str>)> = log
        .iter()
        .map(|e| (e.direction, e.event.event_type()))
        .collect();
    assert_eq!(
        seen,
        [
            (Direction::Server, Some("session.created")),
            (Direction::Client, Some("response.create")),
            (Direction::Client, Some("conversation.item.create")),
        ]
    );
    assert_eq!(log[2].event.event_id(), delivered[0].event_id());
    assert_eq!(log[1].event.event_id(), delivered[1].event_id());

    assert_eq!(relay.stop().await.unwrap(), None);
    assert_eq!(relay.state(), SessionState::Inactive);
}
