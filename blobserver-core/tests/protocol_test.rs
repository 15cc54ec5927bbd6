//! Control-protocol scenarios driven straight through the handlers, plus the
//! per-frame stream observed by a loopback UDP subscriber.

use std::net::UdpSocket;
use std::sync::Arc;
use std::time::Duration;

use blobserver_core::message;
use blobserver_core::message::Message;
use blobserver_core::runtime::App;
use blobserver_core::server;
use blobserver_core::server::handlers;
use rosc::{decoder, OscPacket, OscType};

fn connect_message(port: u16, detector: &str) -> Message {
    message!["127.0.0.1", port as i32, detector, "Pattern", 0]
}

fn connect_flow(app: &Arc<App>, port: u16) -> i32 {
    let (_, reply) = handlers::connect(app, &connect_message(port, "LightSpots"))
        .expect("connect must reply");
    assert_eq!(reply.str_at(0).unwrap(), "Connected");
    reply.int_at(1).unwrap()
}

#[test]
fn test_connect_disconnect_round_trip() {
    let subscriber = UdpSocket::bind("127.0.0.1:0").unwrap();
    subscriber
        .set_read_timeout(Some(Duration::from_millis(200)))
        .unwrap();
    let port = subscriber.local_addr().unwrap().port();

    let app = Arc::new(App::new(false));
    let id = connect_flow(&app, port);
    assert!(id >= 1);
    assert_eq!(app.flows.lock().unwrap().len(), 1);
    assert_eq!(app.sources.lock().unwrap().len(), 1);

    // The "Disconnected" ack goes out once, on the flow's own endpoint; the
    // handler itself has nothing further to send.
    let reply = handlers::disconnect(&app, &message!["127.0.0.1", id]);
    assert!(reply.is_none());
    let (addr, args) = recv_osc(&subscriber).expect("Disconnected ack");
    assert_eq!(addr, "/blobserver/disconnect");
    assert_eq!(args[0], OscType::String("Disconnected".into()));
    assert!(
        recv_osc(&subscriber).is_none(),
        "the ack must not be duplicated"
    );
    assert!(app.flows.lock().unwrap().is_empty());

    // The source lingers until the next grab sweep notices it is unused.
    assert_eq!(app.sources.lock().unwrap().len(), 1);
    app.grab_sweep();
    assert!(app.sources.lock().unwrap().is_empty());
}

#[test]
fn test_replies_ride_the_connect_endpoint() {
    // A subscriber on a non-default port: every flow-scoped reply must land
    // here, never on the default reply port.
    let subscriber = UdpSocket::bind("127.0.0.1:0").unwrap();
    subscriber
        .set_read_timeout(Some(Duration::from_millis(200)))
        .unwrap();
    let port = subscriber.local_addr().unwrap().port();
    assert_ne!(port, 9000);

    let app = Arc::new(App::new(false));
    let id = connect_flow(&app, port);

    let (client, _) = handlers::get_parameter(
        &app,
        &message!["127.0.0.1", id, "Detector", "detectionLevel"],
    )
    .unwrap();
    assert_eq!(client.port(), port);

    // In-flow setParameter errors use the same endpoint.
    let (client, reply) = handlers::set_parameter(
        &app,
        &message!["127.0.0.1", id, "Source", 7, "width", 320],
    )
    .unwrap();
    assert_eq!(reply.str_at(0).unwrap(), "Wrong source index");
    assert_eq!(client.port(), port);

    // End to end through the dispatcher: the reply datagram arrives on the
    // connect-time port.
    server::dispatch(
        &app,
        server::PATH_GET_PARAMETER,
        &message!["127.0.0.1", id, "Detector", "detectionLevel"],
    );
    let (addr, args) = recv_osc(&subscriber).expect("reply on the connect port");
    assert_eq!(addr, "/blobserver/getParameter");
    assert_eq!(args[0], OscType::String("detectionLevel".into()));
}

#[test]
fn test_flow_ids_from_connect_are_strictly_increasing() {
    let app = Arc::new(App::new(false));
    let first = connect_flow(&app, 9000);
    let second = connect_flow(&app, 9000);
    let third = connect_flow(&app, 9001);
    assert!(first < second && second < third);
}

#[test]
fn test_sources_are_shared_between_flows() {
    let app = Arc::new(App::new(false));
    let first = connect_flow(&app, 9000);
    let _second = connect_flow(&app, 9001);

    // Both flows asked for (Pattern, 0): one physical source.
    assert_eq!(app.sources.lock().unwrap().len(), 1);

    handlers::disconnect(&app, &message!["127.0.0.1", first]);
    app.grab_sweep();
    // Still referenced by the surviving flow.
    assert_eq!(app.sources.lock().unwrap().len(), 1);
}

#[test]
fn test_connect_error_replies_leave_state_unchanged() {
    let app = Arc::new(App::new(false));

    let (_, reply) = handlers::connect(&app, &message!["127.0.0.1", 9000]).unwrap();
    assert_eq!(reply.str_at(0).unwrap(), "Too few arguments");

    let (_, reply) =
        handlers::connect(&app, &connect_message(9000, "NoSuchDetector")).unwrap();
    assert_eq!(reply.str_at(0).unwrap(), "Detector type not recognized");

    let (_, reply) = handlers::connect(
        &app,
        &message!["127.0.0.1", 9000, "LightSpots", "NoSuchSource", 0],
    )
    .unwrap();
    assert_eq!(reply.str_at(0).unwrap(), "Unable to create source NoSuchSource");

    // Pattern refuses out-of-range sub-sources at connect time.
    let (_, reply) = handlers::connect(
        &app,
        &message!["127.0.0.1", 9000, "LightSpots", "Pattern", 99],
    )
    .unwrap();
    assert_eq!(reply.str_at(0).unwrap(), "Unable to connect to source Pattern");

    let (_, reply) = handlers::connect(
        &app,
        &message!["127.0.0.1", 9000, "LightSpots", "Pattern", 0, "Pattern"],
    )
    .unwrap();
    assert_eq!(reply.str_at(0).unwrap(), "Missing sub-source number");

    assert!(app.flows.lock().unwrap().is_empty());
    assert!(app.sources.lock().unwrap().is_empty());
}

#[test]
fn test_set_parameter_routes_to_detector_and_source() {
    let app = Arc::new(App::new(false));
    let id = connect_flow(&app, 9000);

    let reply = handlers::set_parameter(
        &app,
        &message!["127.0.0.1", id, "Detector", "detectionLevel", 123],
    );
    assert!(reply.is_none(), "successful set has no error reply");

    let (_, value) = handlers::get_parameter(
        &app,
        &message!["127.0.0.1", id, "Detector", "detectionLevel"],
    )
    .unwrap();
    assert_eq!(value.str_at(0).unwrap(), "detectionLevel");
    assert_eq!(value.int_at(1).unwrap(), 123);

    handlers::set_parameter(
        &app,
        &message!["127.0.0.1", id, "Source", 0, "width", 320],
    );
    let (_, value) = handlers::get_parameter(
        &app,
        &message!["127.0.0.1", id, "Sources", 0, "width"],
    )
    .unwrap();
    assert_eq!(value.int_at(1).unwrap(), 320);

    // Round-trip of the identity parameter.
    let (_, value) =
        handlers::get_parameter(&app, &message!["127.0.0.1", id, "Sources", 0, "id"]).unwrap();
    assert_eq!(value.int_at(1).unwrap(), 0);
}

#[test]
fn test_unknown_flow_id_is_a_silent_no_op() {
    let app = Arc::new(App::new(false));
    let reply = handlers::set_parameter(&app, &message!["127.0.0.1", 999, "Start"]);
    assert!(reply.is_none());
    let reply = handlers::disconnect(&app, &message!["127.0.0.1", 999]);
    assert!(reply.is_none());
}

#[test]
fn test_enumeration_replies() {
    let app = Arc::new(App::new(false));

    let (_, reply) = handlers::detectors(&app, &message!["127.0.0.1"]).unwrap();
    let names: Vec<&str> = (0..reply.len())
        .map(|i| reply.str_at(i).unwrap())
        .collect();
    assert!(names.contains(&"LightSpots"));
    assert!(names.contains(&"MeanOutliers"));

    let (_, reply) = handlers::sources(&app, &message!["127.0.0.1"]).unwrap();
    let names: Vec<&str> = (0..reply.len())
        .map(|i| reply.str_at(i).unwrap())
        .collect();
    assert!(names.contains(&"Pattern"));
    assert!(names.contains(&"Shmdata"));

    // With a class name, the reply enumerates that class's sub-sources.
    let (_, reply) = handlers::sources(&app, &message!["127.0.0.1", "Pattern"]).unwrap();
    assert_eq!(reply.len(), 5);
    assert_eq!(reply.int_at(0).unwrap(), 0);
}

// ── Per-frame stream ──────────────────────────────────────────────────────────

fn recv_osc(socket: &UdpSocket) -> Option<(String, Vec<OscType>)> {
    let mut buf = [0u8; 8192];
    let (len, _) = socket.recv_from(&mut buf).ok()?;
    match decoder::decode_udp(&buf[..len]) {
        Ok((_, OscPacket::Message(msg))) => Some((msg.addr, msg.args)),
        _ => None,
    }
}

#[test]
fn test_start_stop_gates_the_frame_stream() {
    let subscriber = UdpSocket::bind("127.0.0.1:0").unwrap();
    subscriber
        .set_read_timeout(Some(Duration::from_millis(200)))
        .unwrap();
    let port = subscriber.local_addr().unwrap().port();

    let app = Arc::new(App::new(false));
    let id = connect_flow(&app, port);

    // Until Start, cycles emit nothing for this flow.
    app.grab_sweep();
    app.process_cycle();
    assert!(recv_osc(&subscriber).is_none(), "no frames before Start");

    handlers::set_parameter(&app, &message!["127.0.0.1", id, "Start"]);
    app.grab_sweep();
    app.process_cycle();

    let (addr, args) = recv_osc(&subscriber).expect("startFrame after Start");
    assert_eq!(addr, "/blobserver/startFrame");
    assert_eq!(args[1], OscType::Int(id));

    // Everything up to endFrame belongs to this frame; blob messages ride the
    // detector's own path.
    let mut saw_end = false;
    let mut blob_messages = 0;
    while let Some((addr, _)) = recv_osc(&subscriber) {
        match addr.as_str() {
            "/blobserver/endFrame" => {
                saw_end = true;
                break;
            }
            "/blobserver/lightSpots" => blob_messages += 1,
            other => panic!("unexpected message {other}"),
        }
    }
    assert!(saw_end, "frame envelope must close");
    assert!(blob_messages > 0, "pattern spots should be detected");

    handlers::set_parameter(&app, &message!["127.0.0.1", id, "Stop"]);
    app.process_cycle();
    assert!(recv_osc(&subscriber).is_none(), "no frames after Stop");
    assert_eq!(app.flows.lock().unwrap().len(), 1, "Stop keeps the flow");
}

#[test]
fn test_output_image_matches_first_frame_dimensions() {
    let app = Arc::new(App::new(false));
    let id = connect_flow(&app, 9000);
    handlers::set_parameter(&app, &message!["127.0.0.1", id, "Start"]);

    app.grab_sweep();
    app.process_cycle();

    let flows = app.flows.lock().unwrap();
    let output = flows[0].detector.output();
    // Pattern's default frame is 640×480.
    assert_eq!((output.width, output.height), (640, 480));
}
