// Tests for the transport layer: in-memory ordering, wire framing over
// real TCP, and playing a compiled choreography across sockets.

use chorale::compiler::{compile_str, Context};
use chorale::runtime::transport::Transport;
use chorale::runtime::{
    in_memory_network, play_role, RoleConfig, RuntimeError, TcpTransport, Value,
};
use chorale::Role;
use tokio::net::{TcpListener, TcpStream};

#[tokio::test]
async fn test_in_memory_fifo_per_pair() {
    let mut net = in_memory_network(2);
    let mut b = net.pop().expect("endpoint");
    let mut a = net.pop().expect("endpoint");
    for n in 1..=3 {
        a.send(1, Value::Int(n)).await.expect("send");
    }
    for n in 1..=3 {
        assert_eq!(b.recv(0).await.expect("recv"), Value::Int(n));
    }
}

#[tokio::test]
async fn test_in_memory_rejects_unknown_peer() {
    let mut net = in_memory_network(2);
    let err = net[0].send(5, Value::Nil).await.expect_err("no channel");
    assert!(matches!(err, RuntimeError::Transport(_)));
}

async fn tcp_pair() -> (TcpStream, TcpStream) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    let (client, server) = tokio::join!(TcpStream::connect(addr), listener.accept());
    (client.expect("connect"), server.expect("accept").0)
}

#[tokio::test]
async fn test_tcp_framing_round_trip() {
    let (left, right) = tcp_pair().await;
    let mut a = TcpTransport::new(vec![None, Some(left)]);
    let mut b = TcpTransport::new(vec![Some(right), None]);

    let payload = Value::Vector(vec![
        Value::Int(42),
        Value::Str("hello".to_string()),
        Value::Map(vec![(Value::Keyword("k".to_string()), Value::Bool(true))]),
    ]);
    a.send(1, payload.clone()).await.expect("send");
    assert_eq!(b.recv(0).await.expect("recv"), payload);
}

#[tokio::test]
async fn test_tcp_rejects_closures() {
    let (left, _right) = tcp_pair().await;
    let mut a = TcpTransport::new(vec![None, Some(left)]);
    let chor = Value::Chor(chorale::runtime::ChorClosure {
        name: "x".to_string(),
        pos: 0,
        map: vec![],
    });
    let err = a.send(1, chor).await.expect_err("closures do not serialize");
    assert!(matches!(err, RuntimeError::Serialization(_)));
}

#[tokio::test]
async fn test_play_roles_over_tcp() {
    let ctx = Context::new();
    let defs = compile_str(&ctx, "(defchor incr [A B] (-> A A) [x] (B->A (B (inc (A->B x)))))")
        .expect("compiles");
    let def = defs[0].clone();

    let (left, right) = tcp_pair().await;
    let mut a_config = RoleConfig {
        role: Role::new("A"),
        transport: TcpTransport::new(vec![None, Some(left)]),
    };
    let mut b_config = RoleConfig {
        role: Role::new("B"),
        transport: TcpTransport::new(vec![Some(right), None]),
    };
    let (at_a, at_b) = tokio::join!(
        play_role(&ctx, &mut a_config, &def, vec![Value::Int(41)]),
        play_role(&ctx, &mut b_config, &def, vec![]),
    );
    assert_eq!(at_a.expect("A succeeds"), Value::Int(42));
    assert_eq!(at_b.expect("B succeeds"), Value::Noop);
}

#[tokio::test]
async fn test_host_cannot_pass_tuple_parameters() {
    let ctx = Context::new();
    let defs = compile_str(
        &ctx,
        "(defchor open [A B] (-> [A B] A) [p] (unpack [[x y] p] x))",
    )
    .expect("compiles");
    let mut net = in_memory_network(2);
    let mut config = RoleConfig { role: Role::new("A"), transport: net.remove(0) };
    let err = play_role(&ctx, &mut config, &defs[0], vec![Value::Vector(vec![Value::Int(1)])])
        .await
        .expect_err("tuple parameters cannot cross the host boundary");
    assert!(matches!(err, RuntimeError::BadArgument(_)), "{err:?}");
}
