//! Client and server talking over real loopback sockets.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde_json::{Value, json};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

use rpcwire_client::diagnostics::{self, Diagnostics, DiagnosticsClient};
use rpcwire_client::{ClientError, Connector, RemoteInterface, RemoteMethod, RpcClient};
use rpcwire_protocol::{
    ErrorCode, Fragment, FragmentCodec, FrameCodec, MessageKind, Param, Reassembler,
    RequestEnvelope, ResponseEnvelope, decode_request, decode_response, encode_request,
    encode_response,
};
use rpcwire_server::{
    ConnectionConfig, MethodEntry, ParamSpec, RpcServer, ServerConfig, ServerError, Service,
    ServiceFault, ServiceRegistry,
};

fn test_service() -> Service {
    Service::new("IService")
        .method(
            MethodEntry::new("HelloMethod", vec![ParamSpec::input("name")], |args| {
                let name: String = args.get(0)?;
                Err(ServiceFault::new(format!("hello {name} is not allowed")))
            })
            .void(),
        )
        .method(
            MethodEntry::new(
                "HelloMethod",
                vec![
                    ParamSpec::input("valueA"),
                    ParamSpec::input("valueB"),
                    ParamSpec::input("valueC"),
                ],
                |args| {
                    let a: i64 = args.get(0)?;
                    let b: f64 = args.get(1)?;
                    let c: String = args.get(2)?;
                    Err(ServiceFault::new(format!("HelloMethod rejected {a}, {b:.1}, {c}")))
                },
            )
            .void(),
        )
        .method(MethodEntry::new("Greet", vec![ParamSpec::input("name")], |args| {
            let name: String = args.get(0)?;
            Ok(json!(format!("hi {name}")))
        }))
        .method(MethodEntry::new(
            "Greet",
            vec![ParamSpec::input("first"), ParamSpec::input("last")],
            |args| {
                let first: String = args.get(0)?;
                let last: String = args.get(1)?;
                Ok(json!(format!("hi {first} {last}")))
            },
        ))
        .method(MethodEntry::new("Sleep", vec![ParamSpec::input("ms")], |args| {
            let ms: u64 = args.get(0)?;
            std::thread::sleep(Duration::from_millis(ms));
            Ok(json!(ms))
        }))
        .method(MethodEntry::new(
            "Split",
            vec![ParamSpec::input("text"), ParamSpec::output("words")],
            |args| {
                let text: String = args.get(0)?;
                let words: Vec<&str> = text.split_whitespace().collect();
                args.set(1, &words)?;
                Ok(json!(words.len()))
            },
        ))
}

async fn start_server(connection: ConnectionConfig) -> Arc<RpcServer> {
    let services = ServiceRegistry::new();
    services.register(test_service());
    services.register(diagnostics::service());

    let config = ServerConfig::new("127.0.0.1:0".parse().unwrap()).with_connection(connection);
    let server = Arc::new(RpcServer::bind(config, Arc::new(services)).await.unwrap());
    let running = server.clone();
    tokio::spawn(async move {
        let _ = running.run().await;
    });
    server
}

async fn connect(server: &RpcServer, config: ConnectionConfig) -> RpcClient {
    Connector::new(server.local_addr().unwrap().to_string())
        .with_config(config)
        .connect()
        .await
        .unwrap()
}

#[tokio::test]
async fn application_fault_reaches_caller() {
    let server = start_server(ConnectionConfig::default()).await;
    let client = connect(&server, ConnectionConfig::default()).await;

    let proxy = client.proxy(RemoteInterface::new("IService"));
    let hello = RemoteMethod::new("HelloMethod", vec![ParamSpec::input("name")]).void();
    let err = proxy.invoke(&hello, &mut [json!("bob")]).await.unwrap_err();

    assert!(err.code().is_application());
    let remote = err.remote().unwrap();
    let data = remote.data.as_ref().unwrap();
    assert_eq!(data.message, "hello bob is not allowed");
    assert_eq!(data.source.as_deref(), Some("IService.HelloMethod"));
    assert!(client.is_connected());
}

#[tokio::test]
async fn typed_hello_method_failure_round_trip() {
    let server = start_server(ConnectionConfig::default()).await;
    let client = connect(&server, ConnectionConfig::default()).await;

    let request = RequestEnvelope::new(
        "IService",
        "HelloMethod",
        vec![
            Param::new("valueA", 1),
            Param::new("valueB", 2.0),
            Param::new("valueC", "3"),
        ],
    );
    let response = client.request(&request).await.unwrap();
    assert!(!response.is_success());

    let error = response.into_outcome().unwrap_err();
    assert!(ErrorCode::APPLICATION_RANGE.contains(&error.code.code()));
    let data = error.data.unwrap();
    assert_eq!(data.message, "HelloMethod rejected 1, 2.0, 3");
    assert_eq!(data.source.as_deref(), Some("IService.HelloMethod"));
}

#[tokio::test]
async fn concurrent_calls_with_interleaved_fragments() {
    let config = ConnectionConfig::default().with_max_fragment_data(16);
    let server = start_server(config.clone()).await;
    let client = connect(&server, config).await;
    let diagnostics = DiagnosticsClient::new(&client);

    let first = "a".repeat(500);
    let second = "b".repeat(700);
    let (a, b) = tokio::join!(diagnostics.echo(&first), diagnostics.echo(&second));

    assert_eq!(a.unwrap(), first);
    assert_eq!(b.unwrap(), second);
    assert_eq!(client.connection().in_flight(), 0);
}

#[tokio::test]
async fn timeout_releases_the_call() {
    let server = start_server(ConnectionConfig::default()).await;
    let client = connect(&server, ConnectionConfig::default()).await;

    let sleep = RemoteMethod::new("Sleep", vec![ParamSpec::input("ms")]);
    let impatient = client
        .proxy(RemoteInterface::new("IService"))
        .with_timeout(Duration::from_millis(50));
    let err = impatient.invoke(&sleep, &mut [json!(300)]).await.unwrap_err();

    assert!(matches!(
        err,
        ClientError::Transport(ServerError::Timeout { .. })
    ));
    assert_eq!(err.code(), ErrorCode::TIMEOUT);
    assert_eq!(client.connection().in_flight(), 0);

    // The late reply is discarded and the link keeps working.
    tokio::time::sleep(Duration::from_millis(350)).await;
    let patient = client.proxy(RemoteInterface::new("IService"));
    let slept: u64 = patient.call(&sleep, &mut [json!(1)]).await.unwrap();
    assert_eq!(slept, 1);
}

#[tokio::test]
async fn overloads_resolve_by_parameter_names() {
    let server = start_server(ConnectionConfig::default()).await;
    let client = connect(&server, ConnectionConfig::default()).await;

    let one = RequestEnvelope::new("IService", "Greet", vec![Param::new("name", "ann")]);
    let response = client.request(&one).await.unwrap();
    assert_eq!(response.into_outcome().unwrap().0, json!("hi ann"));

    let two = RequestEnvelope::new(
        "IService",
        "Greet",
        vec![Param::new("first", "ann"), Param::new("last", "lee")],
    );
    let response = client.request(&two).await.unwrap();
    assert_eq!(response.into_outcome().unwrap().0, json!("hi ann lee"));

    let wrong = RequestEnvelope::new("IService", "Greet", vec![Param::new("nick", "al")]);
    let error = client.request(&wrong).await.unwrap().into_outcome().unwrap_err();
    assert_eq!(error.code, ErrorCode::INVALID_PARAMS);

    let missing = RequestEnvelope::new("IService", "Wave", vec![]);
    let error = client.request(&missing).await.unwrap().into_outcome().unwrap_err();
    assert_eq!(error.code, ErrorCode::METHOD_NOT_FOUND);

    let unknown = RequestEnvelope::new("INothing", "Wave", vec![]);
    let error = client.request(&unknown).await.unwrap().into_outcome().unwrap_err();
    assert_eq!(error.code, ErrorCode::TYPE_NOT_FOUND);
}

#[tokio::test]
async fn out_and_ref_arguments_are_written_back() {
    let server = start_server(ConnectionConfig::default()).await;
    let client = connect(&server, ConnectionConfig::default()).await;

    let mut a = json!("left");
    let mut b = json!({"right": true});
    DiagnosticsClient::new(&client)
        .swap(&mut a, &mut b)
        .await
        .unwrap();
    assert_eq!(a, json!({"right": true}));
    assert_eq!(b, json!("left"));

    let split = RemoteMethod::new(
        "Split",
        vec![ParamSpec::input("text"), ParamSpec::output("words")],
    );
    let mut args = [json!("one two three"), json!("ignored")];
    let count = client
        .proxy(RemoteInterface::new("IService"))
        .invoke(&split, &mut args)
        .await
        .unwrap();
    assert_eq!(count, json!(3));
    assert_eq!(args[1], json!(["one", "two", "three"]));
}

#[tokio::test]
async fn diagnostics_round_trip() {
    let server = start_server(ConnectionConfig::default()).await;
    let client = connect(&server, ConnectionConfig::default()).await;
    let diagnostics = DiagnosticsClient::new(&client);

    assert_eq!(diagnostics.echo("ping").await.unwrap(), "ping");
    assert_eq!(diagnostics.add(40, 2).await.unwrap(), 42);

    let overflow = diagnostics.add(i64::MAX, 1).await.unwrap_err();
    assert!(overflow.code().is_application());

    let err = diagnostics.fail("boom").await.unwrap_err();
    let data = err.remote().and_then(|e| e.data.as_ref()).unwrap();
    let chain: Vec<_> = data.chain().map(|d| d.message.as_str()).collect();
    assert_eq!(chain, ["boom", "requested failure"]);
}

#[tokio::test]
async fn server_calls_back_into_the_client() {
    let services = ServiceRegistry::new();
    services.register(diagnostics::service());
    let config = ServerConfig::new("127.0.0.1:0".parse().unwrap());
    let server = RpcServer::bind(config, Arc::new(services)).await.unwrap();

    let callbacks = ServiceRegistry::new();
    callbacks.register(Service::new("IClientCallback").method(MethodEntry::new(
        "Notify",
        vec![ParamSpec::input("event")],
        |args| {
            let event: String = args.get(0)?;
            Ok(json!(format!("client saw {event}")))
        },
    )));
    let connector = Connector::new(server.local_addr().unwrap().to_string())
        .with_services(Arc::new(callbacks));

    let (accepted, client) = tokio::join!(server.accept(), connector.connect());
    let accepted = accepted.unwrap();
    let client = client.unwrap();

    // The client keeps calling the server while the server calls back.
    let request = RequestEnvelope::new(
        "IClientCallback",
        "Notify",
        vec![Param::new("event", "started")],
    );
    let callback = accepted.call(
        Bytes::from(encode_request(&request).unwrap()),
        Duration::from_secs(5),
    );
    let diagnostics = DiagnosticsClient::new(&client);
    let (callback, echoed) = tokio::join!(callback, diagnostics.echo("forward"));

    let response = decode_response(&callback.unwrap()).unwrap();
    assert_eq!(
        response.into_outcome().unwrap().0,
        json!("client saw started")
    );
    assert_eq!(echoed.unwrap(), "forward");
}

#[tokio::test]
async fn mismatched_echo_is_rejected() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap().to_string();

    // A peer that answers every request with the wrong parameter names.
    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut frames = FrameCodec::new(65_535).unwrap();
        let reassembler = Reassembler::new();
        let mut buf = vec![0u8; 4096];
        loop {
            let n = match stream.read(&mut buf).await {
                Ok(0) | Err(_) => return,
                Ok(n) => n,
            };
            frames.feed(&buf[..n]);
            while let Some(frame) = frames.try_take_frame().unwrap() {
                reassembler.push(Fragment::decode(frame).unwrap()).unwrap();
            }
            while let Some(message) = reassembler.try_pull() {
                let request = decode_request(&message.data).unwrap();
                assert_eq!(request.method, "Echo");
                let response = ResponseEnvelope::success(
                    Some(Value::String("forged".into())),
                    vec![Param::new("other", "forged")],
                );
                let data = Bytes::from(encode_response(&response).unwrap());
                for fragment in FragmentCodec::default()
                    .split(MessageKind::Response, message.tag, data)
                    .unwrap()
                {
                    let frame = frames.encode(&fragment.encode().unwrap()).unwrap();
                    stream.write_all(&frame).await.unwrap();
                }
            }
        }
    });

    let client = Connector::new(address).connect().await.unwrap();
    let err = DiagnosticsClient::new(&client).echo("hi").await.unwrap_err();
    assert!(matches!(err, ClientError::ResponseMismatch(_)));
    assert_eq!(err.code(), ErrorCode::RESPONSE_PARAM_MISMATCH);
}

#[tokio::test]
async fn server_shutdown_fails_the_client() {
    let server = start_server(ConnectionConfig::default()).await;
    let client = connect(&server, ConnectionConfig::default()).await;
    let diagnostics = DiagnosticsClient::new(&client);
    assert_eq!(diagnostics.echo("before").await.unwrap(), "before");

    server.shutdown();
    client.connection().closed().await;

    assert!(!client.is_connected());
    let err = diagnostics.echo("after").await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::NETWORK_ERROR);
}

#[tokio::test]
async fn connect_from_settings_honours_address() {
    let server = start_server(ConnectionConfig::default()).await;
    let settings = rpcwire_client::config::ConnectionSettings {
        address: server.local_addr().unwrap().to_string(),
        ..Default::default()
    };
    let client = RpcClient::connect(&settings).await.unwrap();
    assert_eq!(
        client.connection().peer_addr(),
        server.local_addr().unwrap()
    );
    client.disconnect();
    assert!(!client.is_connected());
}
