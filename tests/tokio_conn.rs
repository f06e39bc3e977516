//! End-to-end driver scenarios against an in-process mock server speaking
//! the real wire protocol: magic + SCRAM-SHA-256 handshake over
//! NUL-terminated JSON, then token-framed query traffic.

use serde_json::{Value, json};
use tokio::time::{Duration, timeout};

use zero_reql::{Conn, Deadline, Error, Opts, RunOptions};

const TICK: Duration = Duration::from_secs(5);

mod mock {
    use base64::Engine as _;
    use base64::engine::general_purpose::STANDARD as BASE64;
    use serde_json::{Value, json};
    use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
    use tokio::net::{TcpListener, TcpStream};

    use zero_reql::constant::HANDSHAKE_MAGIC;
    use zero_reql::scram;

    pub type Server = BufReader<TcpStream>;

    pub async fn listen() -> (TcpListener, u16) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        (listener, port)
    }

    pub async fn accept_raw(listener: &TcpListener) -> Server {
        let (stream, _) = listener.accept().await.unwrap();
        BufReader::new(stream)
    }

    /// Accept one connection and drive the server side of the handshake,
    /// verifying the client proof against `password`. On a bad proof the
    /// server reports an authentication error and leaves the rest to the
    /// client.
    pub async fn accept(listener: &TcpListener, password: &str) -> Server {
        let mut server = accept_raw(listener).await;

        let mut magic = [0u8; 4];
        server.read_exact(&mut magic).await.unwrap();
        assert_eq!(magic, HANDSHAKE_MAGIC);
        send_document(
            &mut server,
            &json!({
                "success": true,
                "min_protocol_version": 0,
                "max_protocol_version": 0,
                "server_version": "2.4.4",
            }),
        )
        .await;

        let client_first = read_document(&mut server).await;
        assert_eq!(client_first["protocol_version"], json!(0));
        assert_eq!(
            client_first["authentication_method"],
            json!("SCRAM-SHA-256")
        );
        let auth = client_first["authentication"].as_str().unwrap();
        let client_first_bare = auth.strip_prefix("n,,").unwrap().to_string();
        let client_nonce = client_first_bare.split_once(",r=").unwrap().1.to_string();

        let nonce = format!("{client_nonce}3rfcNHYJY1ZVvWVs7j");
        let salt = b"dbdriver mock salt";
        let iterations = 1024;
        let server_first = format!("r={},s={},i={}", nonce, BASE64.encode(salt), iterations);
        send_document(
            &mut server,
            &json!({"success": true, "authentication": server_first}),
        )
        .await;

        let client_final_doc = read_document(&mut server).await;
        let client_final = client_final_doc["authentication"].as_str().unwrap();
        let (without_proof, proof) = client_final.rsplit_once(",p=").unwrap();
        assert_eq!(without_proof, format!("c=biws,r={nonce}"));

        let expected = scram::generate_client_proof(
            &client_first_bare,
            &server_first,
            without_proof,
            password,
            salt,
            iterations,
        );
        if BASE64.decode(proof).unwrap() == expected.proof {
            send_document(
                &mut server,
                &json!({
                    "success": true,
                    "authentication": format!("v={}", BASE64.encode(expected.server_signature)),
                }),
            )
            .await;
        } else {
            send_document(
                &mut server,
                &json!({
                    "success": false,
                    "error": "Wrong password",
                    "error_code": 12,
                }),
            )
            .await;
        }
        server
    }

    pub async fn send_document(server: &mut Server, doc: &Value) {
        let mut out = serde_json::to_vec(doc).unwrap();
        out.push(0);
        server.write_all(&out).await.unwrap();
    }

    pub async fn read_document(server: &mut Server) -> Value {
        let mut buf = Vec::new();
        server.read_until(0, &mut buf).await.unwrap();
        assert_eq!(buf.pop(), Some(0));
        serde_json::from_slice(&buf).unwrap()
    }

    /// Read one query frame; the declared length must cover the payload
    /// exactly or the read desynchronizes, which fails the test.
    pub async fn read_frame(server: &mut Server) -> (u64, Vec<u8>) {
        let mut header = [0u8; 12];
        server.read_exact(&mut header).await.unwrap();
        let token = u64::from_be_bytes(header[..8].try_into().unwrap());
        let len = u32::from_le_bytes(header[8..].try_into().unwrap()) as usize;
        let mut payload = vec![0u8; len];
        server.read_exact(&mut payload).await.unwrap();
        (token, payload)
    }

    pub async fn read_query(server: &mut Server) -> (u64, Value) {
        let (token, payload) = read_frame(server).await;
        (token, serde_json::from_slice(&payload).unwrap())
    }

    pub async fn write_response(server: &mut Server, token: u64, body: &Value) {
        let payload = serde_json::to_vec(body).unwrap();
        let mut frame = token.to_be_bytes().to_vec();
        frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        frame.extend_from_slice(&payload);
        server.write_all(&frame).await.unwrap();
    }
}

fn opts(port: u16) -> Opts {
    Opts {
        host: "127.0.0.1".to_string(),
        port,
        ..Opts::default()
    }
}

#[tokio::test]
async fn connects_and_filters_admin_users() {
    let (listener, port) = mock::listen().await;
    let server = tokio::spawn(async move {
        let mut server = mock::accept(&listener, "").await;
        let (token, query) = mock::read_query(&mut server).await;
        assert_eq!(query[0], json!(1));
        mock::write_response(
            &mut server,
            token,
            &json!({"t": 2, "r": [{"id": "admin", "password": false}]}),
        )
        .await;
    });

    let conn = Conn::connect(opts(port)).await.unwrap();
    // rethinkdb.users.filter({password: false})
    let query = json!([
        39,
        [[15, [[14, ["rethinkdb"]], "users"]], {"password": false}]
    ]);
    let rows = conn
        .run(query)
        .await
        .unwrap()
        .into_cursor()
        .unwrap()
        .all()
        .await
        .unwrap();
    assert_eq!(rows, vec![json!({"id": "admin", "password": false})]);
    server.await.unwrap();
}

#[tokio::test]
async fn authenticates_with_a_password() {
    let (listener, port) = mock::listen().await;
    let server = tokio::spawn(async move {
        let mut server = mock::accept(&listener, "secret").await;
        let (token, query) = mock::read_query(&mut server).await;
        assert_eq!(query, json!([1, [59], {}]));
        mock::write_response(&mut server, token, &json!({"t": 1, "r": [["rethinkdb", "test"]]}))
            .await;
    });

    let conn = Conn::connect(Opts {
        password: "secret".to_string(),
        ..opts(port)
    })
    .await
    .unwrap();
    let dbs = conn.run(json!([59])).await.unwrap().into_atom().unwrap();
    assert_eq!(dbs, json!(["rethinkdb", "test"]));
    server.await.unwrap();
}

#[tokio::test]
async fn wrong_password_is_an_auth_failure() {
    let (listener, port) = mock::listen().await;
    let server = tokio::spawn(async move {
        let _server = mock::accept(&listener, "secret").await;
    });

    let err = Conn::connect(Opts {
        password: "nope".to_string(),
        ..opts(port)
    })
    .await
    .unwrap_err();
    match err {
        Error::AuthFailed(message) => assert_eq!(message, "Wrong password"),
        other => panic!("expected an auth failure, got {other}"),
    }
    server.await.unwrap();
}

#[tokio::test]
async fn rejected_magic_surfaces_the_server_json() {
    let (listener, port) = mock::listen().await;
    let server = tokio::spawn(async move {
        let mut server = mock::accept_raw(&listener).await;
        let mut magic = [0u8; 4];
        tokio::io::AsyncReadExt::read_exact(&mut server, &mut magic)
            .await
            .unwrap();
        mock::send_document(&mut server, &json!({"success": false, "error": "bad magic"})).await;
        // The client must close its end.
        let mut rest = Vec::new();
        let n = tokio::io::AsyncReadExt::read_to_end(&mut server, &mut rest)
            .await
            .unwrap();
        assert_eq!(n, 0);
    });

    let err = Conn::connect(opts(port)).await.unwrap_err();
    match err {
        Error::Handshake(body) => assert_eq!(body["error"], json!("bad magic")),
        other => panic!("expected a handshake error, got {other}"),
    }
    server.await.unwrap();
}

#[tokio::test]
async fn concurrent_queries_resolve_by_token() {
    let (listener, port) = mock::listen().await;
    let server = tokio::spawn(async move {
        let mut server = mock::accept(&listener, "").await;
        // Collect all three before answering in reverse arrival order; every
        // allocated token must be distinct.
        let mut frames = Vec::new();
        for _ in 0..3 {
            frames.push(mock::read_query(&mut server).await);
        }
        let mut tokens: Vec<u64> = frames.iter().map(|(token, _)| *token).collect();
        tokens.dedup();
        assert_eq!(tokens.len(), 3);

        for (token, query) in frames.iter().rev() {
            let marker = query[1][1].clone();
            mock::write_response(&mut server, *token, &json!({"t": 1, "r": [marker]})).await;
        }
    });

    let conn = Conn::connect(opts(port)).await.unwrap();
    let mut callers = Vec::new();
    for i in 0..3 {
        let conn = conn.clone();
        callers.push(tokio::spawn(async move {
            let atom = conn
                .run(json!(["marker", i]))
                .await
                .unwrap()
                .into_atom()
                .unwrap();
            assert_eq!(atom, json!(i));
        }));
    }
    for caller in callers {
        timeout(TICK, caller).await.unwrap().unwrap();
    }
    server.await.unwrap();
}

#[tokio::test]
async fn per_query_timeout_drops_the_late_response() {
    let (listener, port) = mock::listen().await;
    let server = tokio::spawn(async move {
        let mut server = mock::accept(&listener, "").await;
        let (stalled_token, _) = mock::read_query(&mut server).await;
        // The second query only arrives after the first timed out client-side.
        let (fresh_token, _) = mock::read_query(&mut server).await;
        mock::write_response(&mut server, stalled_token, &json!({"t": 1, "r": ["too late"]}))
            .await;
        mock::write_response(&mut server, fresh_token, &json!({"t": 1, "r": ["fresh"]})).await;
    });

    let conn = Conn::connect(opts(port)).await.unwrap();
    let err = conn
        .run_with_opts(
            json!([59]),
            RunOptions::with_timeout(Deadline::After(Duration::from_millis(50))),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Timeout));

    // The late response for the stalled token is silently discarded; the
    // connection keeps working.
    let atom = conn
        .run(json!([59]))
        .await
        .unwrap()
        .into_atom()
        .unwrap();
    assert_eq!(atom, json!("fresh"));
    server.await.unwrap();
}

#[tokio::test]
async fn cursor_pulls_batches_in_order() {
    let (listener, port) = mock::listen().await;
    let server = tokio::spawn(async move {
        let mut server = mock::accept(&listener, "").await;
        let (token, _) = mock::read_query(&mut server).await;
        mock::write_response(&mut server, token, &json!({"t": 3, "r": [1, 2]})).await;

        for batch in [json!({"t": 3, "r": [3, 4]}), json!({"t": 2, "r": [5]})] {
            let (continue_token, continuation) = mock::read_query(&mut server).await;
            assert_eq!(continue_token, token);
            assert_eq!(continuation, json!([2]));
            mock::write_response(&mut server, token, &batch).await;
        }
    });

    let conn = Conn::connect(opts(port)).await.unwrap();
    let mut cursor = conn
        .run(json!([15, [[14, ["test"]], "posts"]]))
        .await
        .unwrap()
        .into_cursor()
        .unwrap();

    let mut batches = Vec::new();
    while let Some(batch) = cursor.next_batch().await.unwrap() {
        batches.push(batch);
    }
    assert_eq!(
        batches,
        vec![
            vec![json!(1), json!(2)],
            vec![json!(3), json!(4)],
            vec![json!(5)],
        ]
    );
    server.await.unwrap();
}

#[tokio::test]
async fn cursor_push_mode_emits_one_done() {
    let (listener, port) = mock::listen().await;
    let server = tokio::spawn(async move {
        let mut server = mock::accept(&listener, "").await;
        let (token, _) = mock::read_query(&mut server).await;
        mock::write_response(&mut server, token, &json!({"t": 3, "r": ["a"]})).await;

        let (_, continuation) = mock::read_query(&mut server).await;
        assert_eq!(continuation, json!([2]));
        mock::write_response(&mut server, token, &json!({"t": 2, "r": ["b", "c"]})).await;
    });

    let conn = Conn::connect(opts(port)).await.unwrap();
    let cursor = conn
        .run(json!([15, [[14, ["test"]], "posts"]]))
        .await
        .unwrap()
        .into_cursor()
        .unwrap();

    let mut events = cursor.activate();
    let mut rows = Vec::new();
    let mut done = 0;
    while let Some(event) = timeout(TICK, events.recv()).await.unwrap() {
        match event {
            zero_reql::CursorEvent::Batch(batch) => rows.extend(batch),
            zero_reql::CursorEvent::Done => done += 1,
            zero_reql::CursorEvent::Error(err) => panic!("cursor failed: {err}"),
        }
    }
    assert_eq!(done, 1, "exactly one terminal message");
    assert_eq!(rows, vec![json!("a"), json!("b"), json!("c")]);
    server.await.unwrap();
}

#[tokio::test]
async fn insert_raw_splices_the_document_bytes() {
    let raw = br#"[{"id": 1, "note": "kept verbatim"}, {"id": 2}]"#;

    let (listener, port) = mock::listen().await;
    let server = tokio::spawn(async move {
        let mut server = mock::accept(&listener, "").await;
        let (token, payload) = mock::read_frame(&mut server).await;

        // The raw document bytes appear untouched inside the wrapper.
        let payload_text = String::from_utf8(payload).unwrap();
        assert!(payload_text.contains(std::str::from_utf8(raw).unwrap()));
        let query: Value = serde_json::from_str(&payload_text).unwrap();
        assert_eq!(
            query,
            json!([
                1,
                [56, [[15, [[14, ["mydb"]], "users"]], [{"id": 1, "note": "kept verbatim"}, {"id": 2}]]],
                {"conflict": "error"}
            ])
        );
        mock::write_response(&mut server, token, &json!({"t": 1, "r": [{"inserted": 2}]})).await;
    });

    let conn = Conn::connect(opts(port)).await.unwrap();
    let summary = conn
        .insert_raw(
            "mydb",
            "users",
            raw.to_vec(),
            &json!({"conflict": "error"}),
            Deadline::Default,
        )
        .await
        .unwrap()
        .into_atom()
        .unwrap();
    assert_eq!(summary, json!({"inserted": 2}));
    server.await.unwrap();
}

#[tokio::test]
async fn close_fails_outstanding_callers_exactly_once() {
    let (listener, port) = mock::listen().await;
    let server = tokio::spawn(async move {
        let mut server = mock::accept(&listener, "").await;
        // Swallow the query and never answer.
        let _ = mock::read_query(&mut server).await;
        server
    });

    let conn = Conn::connect(opts(port)).await.unwrap();
    let pending = {
        let conn = conn.clone();
        tokio::spawn(async move {
            conn.run_with_opts(json!([59]), RunOptions::with_timeout(Deadline::Never))
                .await
        })
    };

    // Give the submission time to reach the wire, then tear down.
    let mut server = timeout(TICK, server).await.unwrap().unwrap();
    conn.close().await.unwrap();

    let err = timeout(TICK, pending).await.unwrap().unwrap().unwrap_err();
    assert!(matches!(err, Error::Closed));

    // Closed is terminal: new submissions fail immediately, and closing
    // again is a no-op.
    let err = conn.run(json!([59])).await.unwrap_err();
    assert!(matches!(err, Error::Closed));
    conn.close().await.unwrap();

    // The driver dropped its socket.
    let mut rest = Vec::new();
    let n = tokio::io::AsyncReadExt::read_to_end(&mut server, &mut rest)
        .await
        .unwrap();
    assert_eq!(n, 0);
}

#[tokio::test]
async fn noreply_wait_and_server_info() {
    let (listener, port) = mock::listen().await;
    let server = tokio::spawn(async move {
        let mut server = mock::accept(&listener, "").await;

        let (token, query) = mock::read_query(&mut server).await;
        assert_eq!(query, json!([4]));
        mock::write_response(&mut server, token, &json!({"t": 4, "r": []})).await;

        let (token, query) = mock::read_query(&mut server).await;
        assert_eq!(query, json!([5]));
        mock::write_response(
            &mut server,
            token,
            &json!({"t": 5, "r": [{"id": "1d8e8057", "name": "mock", "proxy": false}]}),
        )
        .await;
    });

    let conn = Conn::connect(opts(port)).await.unwrap();
    conn.noreply_wait().await.unwrap();
    let info = conn.server_info().await.unwrap();
    assert_eq!(info["name"], json!("mock"));
    server.await.unwrap();
}

#[tokio::test]
async fn server_error_response_carries_kind_and_payload() {
    let (listener, port) = mock::listen().await;
    let server = tokio::spawn(async move {
        let mut server = mock::accept(&listener, "").await;
        let (token, _) = mock::read_query(&mut server).await;
        mock::write_response(
            &mut server,
            token,
            &json!({"t": 18, "e": 3100000, "r": ["Database `nope` does not exist."], "b": []}),
        )
        .await;
    });

    let conn = Conn::connect(opts(port)).await.unwrap();
    let err = conn.run(json!([14, ["nope"]])).await.unwrap_err();
    match err {
        Error::ServerError(server_err) => {
            assert_eq!(
                server_err.error_type,
                Some(zero_reql::constant::ErrorType::NonExistence)
            );
            assert_eq!(server_err.payload, json!("Database `nope` does not exist."));
        }
        other => panic!("expected a server error, got {other}"),
    }
    server.await.unwrap();
}

#[tokio::test]
async fn default_db_is_injected_into_global_opts() {
    let (listener, port) = mock::listen().await;
    let server = tokio::spawn(async move {
        let mut server = mock::accept(&listener, "").await;
        let (token, query) = mock::read_query(&mut server).await;
        assert_eq!(query[2], json!({"db": [14, ["blog"]]}));
        mock::write_response(&mut server, token, &json!({"t": 1, "r": [0]})).await;
    });

    let conn = Conn::connect(Opts {
        db: Some("blog".to_string()),
        ..opts(port)
    })
    .await
    .unwrap();
    conn.run(json!([59])).await.unwrap();
    server.await.unwrap();
}
