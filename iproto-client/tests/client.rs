mod common;

use common::{watch_key, MockServer, ServerConn};
use iproto_client::{Client, TransactionState};
use iproto_protocol::keys::body;
use iproto_protocol::{Body, RequestType, TxnIsolation, Value};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(5);

#[tokio::test]
async fn test_call_eval_and_ping() {
    let server = MockServer::start(|mut conn: ServerConn| async move {
        conn.handshake().await;
        while let Some(message) = conn.recv().await {
            if message.header.request_type() == Some(RequestType::Eval) {
                let expr = message.body.get_str(body::EXPR).unwrap_or_default().to_string();
                conn.reply_data(message.sync(), vec![Value::from(expr)])
                    .await;
            } else {
                conn.answer(message).await;
            }
        }
    })
    .await;

    let client = Client::new(server.config());
    client.connect().await.unwrap();
    assert!(client.is_connected());

    client.ping().await.unwrap();
    let echoed = client
        .call("echo", vec![Value::from(1), Value::from("two")])
        .await
        .unwrap();
    assert_eq!(echoed, Value::Array(vec![Value::from(1), Value::from("two")]));

    let evaluated = client.eval("return 1 + 1", vec![]).await.unwrap();
    assert_eq!(evaluated, Value::Array(vec![Value::from("return 1 + 1")]));

    client.close().await;
    assert!(!client.is_connected());
}

#[tokio::test]
async fn test_prepare_and_execute() {
    let server = MockServer::start(|mut conn: ServerConn| async move {
        conn.handshake().await;
        while let Some(message) = conn.recv().await {
            let sync = message.sync();
            match message.header.request_type() {
                Some(RequestType::Prepare) => {
                    let reply = Body::new()
                        .with(body::STMT_ID, 42u64)
                        .with(body::BIND_COUNT, 1u64);
                    conn.reply(sync, reply).await;
                }
                Some(RequestType::Execute) => {
                    assert_eq!(message.body.get_u64(body::STMT_ID), Some(42));
                    let binds = message.body.get(body::SQL_BIND).cloned().unwrap_or(Value::Nil);
                    conn.reply(sync, Body::new().with(body::DATA, Value::Array(vec![binds])))
                        .await;
                }
                _ => conn.answer(message).await,
            }
        }
    })
    .await;

    let client = Client::new(server.config());
    client.connect().await.unwrap();

    let prepared = client.prepare("SELECT ?").await.unwrap();
    assert_eq!(prepared.stmt_id, 42);
    assert_eq!(prepared.bind_count, 1);

    let reply = client
        .execute(prepared.stmt_id, vec![Value::from(5)])
        .await
        .unwrap();
    assert_eq!(
        reply.data(),
        Some(&Value::Array(vec![Value::Array(vec![Value::from(5)])]))
    );
}

#[tokio::test]
async fn test_reconnect_resubscribes_watchers() {
    let (tx, mut rx) = mpsc::unbounded_channel::<(usize, String)>();
    let connections = Arc::new(AtomicUsize::new(0));
    let counter = connections.clone();
    let server = MockServer::start(move |mut conn: ServerConn| {
        let tx = tx.clone();
        let index = counter.fetch_add(1, Ordering::SeqCst);
        async move {
            conn.handshake().await;
            while let Some(message) = conn.recv().await {
                if message.header.request_type() == Some(RequestType::Watch) {
                    if let Some(key) = watch_key(&message) {
                        let _ = tx.send((index, key));
                    }
                }
                conn.answer(message).await;
            }
        }
    })
    .await;

    let client = Client::new(server.config());
    client.connect().await.unwrap();
    let _a = client.watch("a").await.unwrap();
    let _b = client.watch("b").await.unwrap();

    let expected: BTreeSet<String> = ["a", "b", "box.shutdown"]
        .into_iter()
        .map(String::from)
        .collect();

    let mut first = BTreeSet::new();
    while first.len() < expected.len() {
        let (index, key) = timeout(WAIT, rx.recv()).await.unwrap().unwrap();
        assert_eq!(index, 0);
        first.insert(key);
    }
    assert_eq!(first, expected);

    client.reconnect().await.unwrap();
    assert!(client.is_connected());

    let mut second = BTreeSet::new();
    while second.len() < expected.len() {
        let (index, key) = timeout(WAIT, rx.recv()).await.unwrap().unwrap();
        assert_eq!(index, 1);
        second.insert(key);
    }
    assert_eq!(second, expected);
    assert_eq!(server.accepted(), 2);
}

#[tokio::test]
async fn test_transaction_commit() {
    let server = MockServer::start(|mut conn: ServerConn| async move {
        conn.handshake().await;
        while let Some(message) = conn.recv().await {
            let sync = message.sync();
            match message.header.request_type() {
                Some(RequestType::Begin | RequestType::Commit | RequestType::Insert) => {
                    assert!(message.header.stream_id.is_some());
                    let tuple = message.body.get(body::TUPLE).cloned();
                    let reply = match tuple {
                        Some(tuple) => Body::new().with(body::DATA, Value::Array(vec![tuple])),
                        None => Body::new(),
                    };
                    conn.reply(sync, reply).await;
                }
                _ => conn.answer(message).await,
            }
        }
    })
    .await;

    let client = Client::new(server.config());
    client.connect().await.unwrap();

    let txn = client
        .transaction(Some(Duration::from_secs(1)), TxnIsolation::ReadCommitted)
        .await
        .unwrap();
    let stream_id = txn.stream_id();
    let conn = client.connection();
    assert_eq!(conn.stream_state(stream_id), Some(TransactionState::Active));

    let inserted = txn
        .request(iproto_protocol::Request::insert(512u32, vec![Value::from(1)]))
        .await
        .unwrap();
    assert_eq!(
        inserted.data(),
        Some(&Value::Array(vec![Value::Array(vec![Value::from(1)])]))
    );

    txn.commit().await.unwrap();
    assert_eq!(conn.stream_state(stream_id), Some(TransactionState::Committed));
}
