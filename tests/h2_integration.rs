//! HTTP/2 client connection integration tests
//!
//! Each test drives a real `Connection` against a scripted peer:
//! - Handshake and SETTINGS exchange
//! - Request/response framing and flow control
//! - Concurrent stream limits and GOAWAY
//! - Stream errors, timeouts and shutdown

mod common;

use common::{get, init_tracing, post, start, MockPeer};
use h2mux::http::h2::frames::{FrameFlags, FrameType};
use h2mux::http::h2::pool::PooledBuf;
use h2mux::http::h2::{ConnectionBuilder, ConnectionState, Error, ErrorCode};
use h2mux::http::{HttpRequest, Method};
use std::collections::VecDeque;
use std::io::Read;
use std::net::{TcpListener, TcpStream};
use std::thread;
use std::time::{Duration, Instant};

fn wait_until(mut done: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(3);
    while Instant::now() < deadline {
        if done() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    false
}

#[test]
fn test_handshake_advertises_settings() {
    init_tracing();
    let (connection, server) = start(
        ConnectionBuilder::new().initial_window_size(1 << 20),
        |mut peer| {
            let client = peer.handshake(&[(0x3, 10), (0x5, 32768)]);
            let update = peer.read_frame();
            let ack = peer.read_frame();
            peer.drain_until_eof();
            (client, update, ack)
        },
    );
    let connection = connection.unwrap();
    assert_eq!(connection.state(), ConnectionState::Connected);
    assert!(connection.is_active());
    assert_eq!(connection.remote_settings().max_concurrent_streams(), 10);
    assert_eq!(connection.remote_settings().max_frame_size(), 32768);
    assert_eq!(connection.negotiated_protocol(), None);
    connection.close();
    let (client, update, ack) = server.join().unwrap();

    assert!(client.contains(&(0x2, 0)));
    assert!(client.contains(&(0x4, 1 << 20)));
    assert_eq!(update.frame_type, FrameType::WindowUpdate);
    assert_eq!(update.stream_id, 0);
    assert_eq!(update.window_increment().unwrap(), (1 << 20) - 65535);
    assert_eq!(ack.frame_type, FrameType::Settings);
    assert!(ack.flags.is_ack());
}

#[test]
fn test_settings_timeout() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let server = thread::spawn(move || {
        let (stream, _) = listener.accept().unwrap();
        thread::sleep(Duration::from_millis(500));
        drop(stream);
    });

    let stream = TcpStream::connect(addr).unwrap();
    let result = ConnectionBuilder::new()
        .settings_timeout(Duration::from_millis(100))
        .connect(stream);
    assert!(matches!(result, Err(Error::SettingsTimeout)));
    server.join().unwrap();
}

#[test]
fn test_first_frame_must_be_settings() {
    let (connection, server) = start(ConnectionBuilder::new(), |mut peer| {
        peer.read_client_preface();
        peer.writer().write_ping(false, [0; 8]).unwrap();
        peer.flush();
        peer.drain_until_eof()
    });
    assert!(matches!(connection, Err(Error::Protocol(_))));
    server.join().unwrap();
}

// Scenario: 10-byte body on default settings
#[test]
fn test_small_post() {
    let (connection, server) = start(ConnectionBuilder::new(), |mut peer| {
        peer.handshake(&[]);
        let request = peer.read_request();
        let data = peer.expect(FrameType::Data);
        peer.respond(request.stream_id, 200, true);
        (request, data)
    });
    let connection = connection.unwrap();

    let exchange = connection.send(post("/upload", b"0123456789")).unwrap();
    assert_eq!(exchange.stream_id(), 1);
    assert_eq!(exchange.status().unwrap(), 200);
    let mut body = Vec::new();
    exchange.response_body().read_to_end(&mut body).unwrap();
    assert!(body.is_empty());

    let (request, data) = server.join().unwrap();
    assert_eq!(request.stream_id, 1);
    assert!(!request.end_stream);
    assert_eq!(request.get(":method"), Some("POST"));
    assert_eq!(request.get(":path"), Some("/upload"));
    assert_eq!(request.get(":scheme"), Some("http"));
    assert_eq!(data.stream_id, 1);
    assert_eq!(&data.payload[..], b"0123456789");
    assert!(data.flags.is_end_stream());
}

#[test]
fn test_get_response_body() {
    let (connection, server) = start(ConnectionBuilder::new(), |mut peer| {
        peer.handshake(&[]);
        let request = peer.read_request();
        peer.send_headers(
            request.stream_id,
            &[(":status", "200"), ("content-type", "text/plain"), ("content-length", "11")],
            false,
        );
        peer.send_data(request.stream_id, b"hello ", false);
        peer.send_data(request.stream_id, b"world", true);
        request
    });
    let connection = connection.unwrap();

    let exchange = connection.send(get("/greeting")).unwrap();
    assert_eq!(exchange.status().unwrap(), 200);
    assert_eq!(exchange.headers().unwrap().get("content-type"), Some("text/plain"));
    let mut body = String::new();
    exchange.response_body().read_to_string(&mut body).unwrap();
    assert_eq!(body, "hello world");
    assert!(exchange.is_closed());

    let request = server.join().unwrap();
    assert!(request.end_stream);
    assert_eq!(request.get(":authority"), Some("localhost"));
}

// Scenario: stream window starts at zero
#[test]
fn test_zero_initial_window_blocks_until_update() {
    let (connection, server) = start(ConnectionBuilder::new(), |mut peer| {
        peer.handshake(&[(0x4, 0)]);
        let request = peer.read_request();
        thread::sleep(Duration::from_millis(200));
        peer.writer().write_window_update(request.stream_id, 4).unwrap();
        peer.flush();
        let first = peer.expect(FrameType::Data);
        peer.writer().write_window_update(request.stream_id, 100).unwrap();
        peer.flush();
        let rest = peer.read_body(request.stream_id);
        peer.respond(request.stream_id, 200, true);
        (first, rest)
    });
    let connection = connection.unwrap();

    let started = Instant::now();
    let exchange = connection.send(post("/", b"0123456789")).unwrap();
    assert!(started.elapsed() >= Duration::from_millis(150));
    assert_eq!(exchange.status().unwrap(), 200);

    let (first, rest) = server.join().unwrap();
    assert_eq!(&first.payload[..], b"0123");
    assert!(!first.flags.is_end_stream());
    assert_eq!(rest, b"456789");
}

/// Next frame that is not a WINDOW_UPDATE must be a SETTINGS ACK
fn expect_settings_ack<S: std::io::Read + std::io::Write>(peer: &mut MockPeer<S>) {
    loop {
        let frame = peer.read_frame();
        if frame.frame_type == FrameType::WindowUpdate {
            continue;
        }
        assert_eq!(frame.frame_type, FrameType::Settings, "unexpected frame {:?}", frame);
        assert!(frame.flags.is_ack());
        return;
    }
}

#[test]
fn test_settings_shrink_while_writer_blocked() {
    let payload: Vec<u8> = (0..100_000u32).map(|i| (i % 241) as u8).collect();
    let (connection, server) = start(ConnectionBuilder::new(), |mut peer| {
        peer.handshake(&[]);
        let request = peer.read_request();

        // Let the client exhaust both default windows without crediting
        let mut body = Vec::new();
        while body.len() < 65535 {
            let frame = peer.expect(FrameType::Data);
            assert!(!frame.flags.is_end_stream());
            body.extend_from_slice(&frame.payload);
        }
        assert_eq!(body.len(), 65535);

        // Shut the stream window (it goes negative) but open the connection
        peer.writer().write_settings(&[(0x4, 0)]).unwrap();
        peer.writer().write_window_update(0, 100_000).unwrap();
        peer.flush();
        expect_settings_ack(&mut peer);
        thread::sleep(Duration::from_millis(200));

        // Nothing may be sent until the second SETTINGS restores credit
        peer.writer().write_settings(&[(0x4, 200_000)]).unwrap();
        peer.flush();
        expect_settings_ack(&mut peer);

        body.extend(peer.read_body(request.stream_id));
        peer.respond(request.stream_id, 200, true);
        body
    });
    let connection = connection.unwrap();

    let exchange = connection.send(post("/shrink", &payload)).unwrap();
    assert_eq!(exchange.status().unwrap(), 200);
    assert_eq!(server.join().unwrap(), payload);
}

#[test]
fn test_large_body_uses_window_updates() {
    let payload: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
    let (connection, server) = start(ConnectionBuilder::new(), |mut peer| {
        peer.handshake(&[]);
        let request = peer.read_request();
        let body = peer.read_body(request.stream_id);
        peer.respond(request.stream_id, 204, true);
        body
    });
    let connection = connection.unwrap();

    let exchange = connection.send(post("/bulk", &payload)).unwrap();
    assert_eq!(exchange.status().unwrap(), 204);
    assert_eq!(server.join().unwrap(), payload);
}

#[test]
fn test_large_response_replenishes_receive_window() {
    let (connection, server) = start(ConnectionBuilder::new(), |mut peer| {
        peer.handshake(&[]);
        let request = peer.read_request();
        peer.respond(request.stream_id, 200, false);
        // 60000 bytes fit the initial window; the rest must wait for credit
        for _ in 0..6 {
            peer.send_data(request.stream_id, &[7u8; 10_000], false);
        }
        let mut connection_credit = 0;
        let mut stream_credit = 0;
        while connection_credit == 0 || stream_credit == 0 {
            let frame = peer.read_frame();
            if frame.frame_type == FrameType::WindowUpdate {
                let increment = frame.window_increment().unwrap();
                if frame.stream_id == 0 {
                    connection_credit += increment;
                } else {
                    stream_credit += increment;
                }
            }
        }
        peer.send_data(request.stream_id, &[7u8; 10_000], true);
        (connection_credit, stream_credit)
    });
    let connection = connection.unwrap();

    let exchange = connection.send(get("/large")).unwrap();
    let mut body = Vec::new();
    exchange.response_body().read_to_end(&mut body).unwrap();
    assert_eq!(body.len(), 70_000);
    assert!(body.iter().all(|b| *b == 7));

    let (connection_credit, stream_credit) = server.join().unwrap();
    assert!(connection_credit > 0);
    assert!(stream_credit > 0);
}

#[test]
fn test_concurrent_streams_limit() {
    let (connection, server) = start(ConnectionBuilder::new(), |mut peer| {
        peer.handshake(&[(0x3, 1)]);
        let first = peer.read_request();
        peer.respond(first.stream_id, 200, true);
        let second = peer.read_request();
        peer.respond(second.stream_id, 200, true);
        (first.stream_id, second.stream_id)
    });
    let connection = connection.unwrap();

    let first = connection.send(get("/one")).unwrap();
    assert_eq!(connection.active_stream_count(), 1);
    assert!(!connection.can_accept_more_streams());
    assert_eq!(connection.active_stream_count_if_accepting(), None);
    match connection.send(get("/two")) {
        Err(Error::TooManyStreams { active, limit }) => {
            assert_eq!(active, 1);
            assert_eq!(limit, 1);
        }
        other => panic!("expected TooManyStreams, got {:?}", other),
    }

    let mut body = Vec::new();
    first.response_body().read_to_end(&mut body).unwrap();
    assert!(wait_until(|| connection.can_accept_more_streams()));

    let second = connection.send(get("/two")).unwrap();
    assert_eq!(second.status().unwrap(), 200);
    assert_eq!(server.join().unwrap(), (1, 3));
}

#[test]
fn test_parallel_requests() {
    let (connection, server) = start(ConnectionBuilder::new(), |mut peer| {
        peer.handshake(&[]);
        let requests: Vec<_> = (0..4).map(|_| peer.read_request()).collect();
        // Answer in reverse order
        for request in requests.iter().rev() {
            let path = request.get(":path").unwrap().to_string();
            peer.respond(request.stream_id, 200, false);
            peer.send_data(request.stream_id, path.as_bytes(), true);
        }
    });
    let connection = std::sync::Arc::new(connection.unwrap());

    let clients: Vec<_> = (0..4)
        .map(|i| {
            let connection = connection.clone();
            thread::spawn(move || {
                let path = format!("/item/{}", i);
                let exchange = connection.send(get(&path)).unwrap();
                let mut body = String::new();
                exchange.response_body().read_to_string(&mut body).unwrap();
                assert_eq!(body, path);
                exchange.stream_id()
            })
        })
        .collect();

    let mut ids: Vec<u32> = clients.into_iter().map(|c| c.join().unwrap()).collect();
    ids.sort_unstable();
    assert_eq!(ids, vec![1, 3, 5, 7]);
    server.join().unwrap();
}

// Scenario: GOAWAY below an in-flight stream
#[test]
fn test_goaway_refuses_higher_streams() {
    let (connection, server) = start(ConnectionBuilder::new(), |mut peer| {
        peer.handshake(&[]);
        let ids: Vec<u32> = (0..4).map(|_| peer.read_request().stream_id).collect();
        let mut goaway = Vec::new();
        goaway.extend_from_slice(&5u32.to_be_bytes());
        goaway.extend_from_slice(&ErrorCode::NoError.as_u32().to_be_bytes());
        peer.send_frame(FrameType::Goaway, 0, 0, &goaway);
        thread::sleep(Duration::from_millis(100));
        for id in [1, 3, 5] {
            peer.respond(id, 200, false);
            peer.send_data(id, b"done", true);
        }
        ids
    });
    let connection = connection.unwrap();

    let exchanges: Vec<_> = (0..4)
        .map(|i| connection.send(get(&format!("/{}", i))).unwrap())
        .collect();

    match exchanges[3].status() {
        Err(Error::RefusedStream {
            stream_id,
            last_stream_id,
            ..
        }) => {
            assert_eq!(stream_id, 7);
            assert_eq!(last_stream_id, 5);
        }
        other => panic!("expected RefusedStream, got {:?}", other),
    }
    assert!(!connection.validate_for_reuse());
    assert!(connection.send(get("/late")).is_err());

    for exchange in &exchanges[..3] {
        let mut body = String::new();
        exchange.response_body().read_to_string(&mut body).unwrap();
        assert_eq!(body, "done");
    }
    assert_eq!(server.join().unwrap(), vec![1, 3, 5, 7]);
}

#[test]
fn test_goaway_with_error_closes_connection() {
    let (connection, server) = start(ConnectionBuilder::new(), |mut peer| {
        peer.handshake(&[]);
        peer.read_request();
        let mut goaway = Vec::new();
        goaway.extend_from_slice(&0u32.to_be_bytes());
        goaway.extend_from_slice(&ErrorCode::EnhanceYourCalm.as_u32().to_be_bytes());
        goaway.extend_from_slice(b"slow down");
        peer.send_frame(FrameType::Goaway, 0, 0, &goaway);
    });
    let connection = connection.unwrap();

    let exchange = connection.send(get("/")).unwrap();
    assert!(exchange.status().is_err());
    server.join().unwrap();

    assert!(wait_until(|| connection.state() == ConnectionState::Closed));
    assert!(!connection.is_active());
    assert!(connection.send(get("/")).is_err());
}

// Scenario: duplicate :status
#[test]
fn test_malformed_response_resets_only_that_stream() {
    let (connection, server) = start(ConnectionBuilder::new(), |mut peer| {
        peer.handshake(&[]);
        let first = peer.read_request();
        peer.send_headers(first.stream_id, &[(":status", "200"), (":status", "200")], true);
        let rst = peer.expect(FrameType::RstStream);
        let second = peer.read_request();
        peer.respond(second.stream_id, 200, true);
        peer.drain_until_eof();
        rst
    });
    let connection = connection.unwrap();

    let first = connection.send(get("/bad")).unwrap();
    assert!(matches!(
        first.status(),
        Err(Error::StreamProtocol { stream_id: 1, .. })
    ));

    let second = connection.send(get("/good")).unwrap();
    assert_eq!(second.status().unwrap(), 200);
    assert!(connection.is_active());
    connection.close();

    let rst = server.join().unwrap();
    assert_eq!(rst.stream_id, 1);
    assert_eq!(rst.rst_error_code().unwrap(), ErrorCode::ProtocolError.as_u32());
}

// Scenario: body shorter than content-length
#[test]
fn test_content_length_mismatch_at_eof() {
    let (connection, server) = start(ConnectionBuilder::new(), |mut peer| {
        peer.handshake(&[]);
        let request = peer.read_request();
        peer.send_headers(
            request.stream_id,
            &[(":status", "200"), ("content-length", "100")],
            false,
        );
        peer.send_data(request.stream_id, &[1u8; 90], true);
    });
    let connection = connection.unwrap();

    let exchange = connection.send(get("/short")).unwrap();
    assert_eq!(exchange.status().unwrap(), 200);

    let mut chunks: VecDeque<PooledBuf> = VecDeque::new();
    let mut received = 0;
    let err = loop {
        match exchange.drain_chunks(&mut chunks, 16) {
            Ok(Some(_)) => {
                received += chunks.drain(..).map(|c| c.len()).sum::<usize>();
            }
            Ok(None) => panic!("EOF without content-length check"),
            Err(err) => break err,
        }
    };
    assert_eq!(received, 90);
    match err {
        Error::ContentLengthMismatch {
            expected, received, ..
        } => {
            assert_eq!(expected, 100);
            assert_eq!(received, 90);
        }
        other => panic!("expected ContentLengthMismatch, got {:?}", other),
    }
    server.join().unwrap();
}

#[test]
fn test_head_ignores_content_length() {
    let (connection, server) = start(ConnectionBuilder::new(), |mut peer| {
        peer.handshake(&[]);
        let request = peer.read_request();
        peer.send_headers(
            request.stream_id,
            &[(":status", "200"), ("content-length", "1234")],
            true,
        );
    });
    let connection = connection.unwrap();

    let request = HttpRequest::builder()
        .method(Method::Head)
        .uri("http://localhost/resource")
        .build()
        .unwrap();
    let exchange = connection.send(request).unwrap();
    let mut body = Vec::new();
    exchange.response_body().read_to_end(&mut body).unwrap();
    assert!(body.is_empty());
    server.join().unwrap();
}

#[test]
fn test_informational_and_trailers() {
    let (connection, server) = start(ConnectionBuilder::new(), |mut peer| {
        peer.handshake(&[]);
        let request = peer.read_request();
        peer.send_headers(
            request.stream_id,
            &[(":status", "103"), ("link", "</style.css>; rel=preload")],
            false,
        );
        peer.respond(request.stream_id, 200, false);
        peer.send_data(request.stream_id, b"abc", false);
        peer.send_headers(request.stream_id, &[("grpc-status", "0")], true);
    });
    let connection = connection.unwrap();

    let exchange = connection.send(get("/rpc")).unwrap();
    assert_eq!(exchange.status().unwrap(), 200);
    let mut body = String::new();
    exchange.response_body().read_to_string(&mut body).unwrap();
    assert_eq!(body, "abc");

    let trailers = exchange.trailers().unwrap().unwrap();
    assert_eq!(trailers.get("grpc-status"), Some("0"));
    let informational = exchange.informational_responses();
    assert_eq!(informational.len(), 1);
    assert_eq!(informational[0].status, 103);
    assert!(informational[0].headers.contains("link"));
    server.join().unwrap();
}

#[test]
fn test_request_trailers_follow_body() {
    let (connection, server) = start(ConnectionBuilder::new(), |mut peer| {
        peer.handshake(&[]);
        let request = peer.read_request();
        let data = peer.expect(FrameType::Data);
        let trailers = peer.expect(FrameType::Headers);
        let fields = peer.decode(&trailers);
        peer.respond(request.stream_id, 200, true);
        (request, data, trailers.flags, fields)
    });
    let connection = connection.unwrap();

    let request = HttpRequest::builder()
        .method(Method::Post)
        .uri("http://localhost/upload")
        .body("hello")
        .trailer("x-checksum", "5d41402a")
        .build()
        .unwrap();
    let exchange = connection.send(request).unwrap();
    assert_eq!(exchange.status().unwrap(), 200);

    let (request, data, flags, fields) = server.join().unwrap();
    assert!(!request.end_stream);
    assert_eq!(&data.payload[..], b"hello");
    assert!(!data.flags.is_end_stream());
    assert!(flags.is_end_stream());
    assert_eq!(
        fields,
        vec![("x-checksum".to_string(), "5d41402a".to_string())]
    );
}

#[test]
fn test_streaming_request_body() {
    let (connection, server) = start(ConnectionBuilder::new(), |mut peer| {
        peer.handshake(&[]);
        let request = peer.read_request();
        let body = peer.read_body(request.stream_id);
        peer.respond(request.stream_id, 201, true);
        body
    });
    let connection = connection.unwrap();

    let request = HttpRequest::builder()
        .method(Method::Put)
        .uri("http://localhost/stream")
        .streaming_body(None)
        .build()
        .unwrap();
    let exchange = connection.send(request).unwrap();
    {
        use std::io::Write;
        let mut body = exchange.request_body();
        body.write_all(b"part one, ").unwrap();
        body.write_all(b"part two").unwrap();
        body.finish().unwrap();
    }
    assert_eq!(exchange.status().unwrap(), 201);
    assert_eq!(server.join().unwrap(), b"part one, part two");
}

#[test]
fn test_ping_is_acknowledged() {
    let (connection, server) = start(ConnectionBuilder::new(), |mut peer| {
        peer.handshake(&[]);
        peer.writer().write_ping(false, *b"pingpong").unwrap();
        peer.flush();
        peer.expect(FrameType::Ping)
    });
    let _connection = connection.unwrap();

    let ack = server.join().unwrap();
    assert!(ack.flags.is_ack());
    assert_eq!(ack.ping_data().unwrap(), *b"pingpong");
}

#[test]
fn test_settings_update_is_acknowledged() {
    let (connection, server) = start(ConnectionBuilder::new(), |mut peer| {
        peer.handshake(&[]);
        peer.writer().write_settings(&[(0x3, 2), (0x5, 20000)]).unwrap();
        peer.flush();
        loop {
            let frame = peer.read_frame();
            if frame.frame_type == FrameType::Settings && frame.flags.is_ack() {
                break;
            }
        }
    });
    let connection = connection.unwrap();
    server.join().unwrap();

    assert!(wait_until(|| connection.remote_settings().max_concurrent_streams() == 2));
    assert_eq!(connection.remote_settings().max_frame_size(), 20000);
}

#[test]
fn test_invalid_settings_is_connection_error() {
    let (connection, server) = start(ConnectionBuilder::new(), |mut peer| {
        peer.handshake(&[]);
        peer.writer().write_settings(&[(0x2, 2)]).unwrap();
        peer.flush();
        peer.drain_until_eof()
    });
    let connection = connection.unwrap();

    let frames = server.join().unwrap();
    let goaway = frames
        .iter()
        .find(|f| f.frame_type == FrameType::Goaway)
        .expect("GOAWAY before close");
    assert_eq!(
        goaway.goaway().unwrap().error_code,
        ErrorCode::ProtocolError.as_u32()
    );
    assert!(wait_until(|| connection.state() == ConnectionState::Closed));
}

#[test]
fn test_push_promise_is_connection_error() {
    let (connection, server) = start(ConnectionBuilder::new(), |mut peer| {
        peer.handshake(&[]);
        let request = peer.read_request();
        let mut payload = 2u32.to_be_bytes().to_vec();
        payload.extend_from_slice(&[0x82]);
        peer.send_frame(
            FrameType::PushPromise,
            FrameFlags::END_HEADERS,
            request.stream_id,
            &payload,
        );
        peer.drain_until_eof()
    });
    let connection = connection.unwrap();

    let exchange = connection.send(get("/")).unwrap();
    assert!(exchange.status().is_err());
    let frames = server.join().unwrap();
    assert!(frames.iter().any(|f| f.frame_type == FrameType::Goaway));
    assert_eq!(connection.state(), ConnectionState::Closed);
}

#[test]
fn test_undecodable_header_block_is_compression_error() {
    let (connection, server) = start(ConnectionBuilder::new(), |mut peer| {
        peer.handshake(&[]);
        let request = peer.read_request();
        // Dynamic table size update with a truncated integer
        peer.send_frame(
            FrameType::Headers,
            FrameFlags::END_HEADERS | FrameFlags::END_STREAM,
            request.stream_id,
            &[0x3f],
        );
        peer.drain_until_eof()
    });
    let connection = connection.unwrap();

    let exchange = connection.send(get("/")).unwrap();
    match exchange.status() {
        Err(Error::Compression(_)) => {}
        other => panic!("expected compression error, got {:?}", other),
    }
    let frames = server.join().unwrap();
    let goaway = frames
        .iter()
        .find(|f| f.frame_type == FrameType::Goaway)
        .expect("GOAWAY after decode failure")
        .goaway()
        .unwrap();
    assert_eq!(goaway.error_code, ErrorCode::CompressionError.as_u32());
    assert_eq!(connection.state(), ConnectionState::Closed);
    assert!(!connection.is_active());
}

#[test]
fn test_peer_reset_fails_exchange() {
    let (connection, server) = start(ConnectionBuilder::new(), |mut peer| {
        peer.handshake(&[]);
        let request = peer.read_request();
        peer.send_frame(
            FrameType::RstStream,
            0,
            request.stream_id,
            &ErrorCode::RefusedStream.as_u32().to_be_bytes(),
        );
    });
    let connection = connection.unwrap();

    let exchange = connection.send(get("/")).unwrap();
    match exchange.status() {
        Err(Error::StreamReset { stream_id, code }) => {
            assert_eq!(stream_id, 1);
            assert_eq!(code, ErrorCode::RefusedStream.as_u32());
        }
        other => panic!("expected StreamReset, got {:?}", other),
    }
    server.join().unwrap();
    assert!(wait_until(|| connection.active_stream_count() == 0));
}

#[test]
fn test_read_timeout_cancels_stream() {
    let (connection, server) = start(
        ConnectionBuilder::new().read_timeout(Duration::from_millis(300)),
        |mut peer| {
            peer.handshake(&[]);
            peer.read_request();
            let rst = peer.expect(FrameType::RstStream);
            peer.drain_until_eof();
            rst
        },
    );
    let connection = connection.unwrap();

    let started = Instant::now();
    let exchange = connection.send(get("/slow")).unwrap();
    match exchange.status() {
        Err(err @ Error::ReadTimeout { .. }) => assert!(err.is_timeout()),
        other => panic!("expected ReadTimeout, got {:?}", other),
    }
    assert!(started.elapsed() >= Duration::from_millis(250));
    assert!(connection.is_active());
    connection.close();

    let rst = server.join().unwrap();
    assert_eq!(rst.stream_id, 1);
    assert_eq!(rst.rst_error_code().unwrap(), ErrorCode::Cancel.as_u32());
}

#[test]
fn test_dropping_exchange_cancels_stream() {
    let (connection, server) = start(ConnectionBuilder::new(), |mut peer| {
        peer.handshake(&[]);
        peer.read_request();
        peer.expect(FrameType::RstStream)
    });
    let connection = connection.unwrap();

    let exchange = connection.send(get("/abandoned")).unwrap();
    drop(exchange);

    let rst = server.join().unwrap();
    assert_eq!(rst.rst_error_code().unwrap(), ErrorCode::Cancel.as_u32());
    assert_eq!(connection.active_stream_count(), 0);
}

#[test]
fn test_peer_disconnect_fails_pending_exchange() {
    let (connection, server) = start(ConnectionBuilder::new(), |mut peer: MockPeer<TcpStream>| {
        peer.handshake(&[]);
        peer.read_request();
    });
    let connection = connection.unwrap();

    let exchange = connection.send(get("/")).unwrap();
    server.join().unwrap();
    assert!(exchange.status().is_err());
    assert!(wait_until(|| connection.state() == ConnectionState::Closed));
    assert!(connection.send(get("/")).is_err());
}

#[test]
fn test_close_sends_goaway() {
    let (connection, server) = start(
        ConnectionBuilder::new().graceful_shutdown(Duration::from_millis(200)),
        |mut peer| {
            peer.handshake(&[]);
            peer.drain_until_eof()
        },
    );
    let connection = connection.unwrap();
    connection.close();
    assert_eq!(connection.state(), ConnectionState::Closed);
    assert!(!connection.is_active());

    let frames = server.join().unwrap();
    let goaway = frames
        .iter()
        .find(|f| f.frame_type == FrameType::Goaway)
        .expect("GOAWAY on close")
        .goaway()
        .unwrap();
    assert_eq!(goaway.error_code, ErrorCode::NoError.as_u32());
    assert_eq!(goaway.last_stream_id, 0);

    // Closing twice is harmless
    connection.close();
    assert!(matches!(
        connection.send(get("/")),
        Err(Error::ConnectionClosed)
    ));
}

#[test]
fn test_idle_time_tracks_activity() {
    let (connection, server) = start(ConnectionBuilder::new(), |mut peer| {
        peer.handshake(&[]);
        let request = peer.read_request();
        peer.respond(request.stream_id, 200, true);
        peer.drain_until_eof();
    });
    let connection = connection.unwrap();

    let exchange = connection.send(get("/")).unwrap();
    assert_eq!(connection.idle_time_nanos(), 0);
    let mut body = Vec::new();
    exchange.response_body().read_to_end(&mut body).unwrap();

    thread::sleep(Duration::from_millis(50));
    assert!(connection.idle_time_nanos() >= 40_000_000);
    assert_eq!(connection.active_stream_count_if_accepting(), Some(0));
    connection.close();
    server.join().unwrap();
}
