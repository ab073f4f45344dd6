// Transports
//
// The transport contract is send/recv only: a value sent from one endpoint
// to another arrives exactly once, in FIFO order per (src, dst) pair. The
// in-memory transport backs simulation; the TCP transport frames each
// message with an 8-byte big-endian length prefix followed by the
// serialized payload.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};

use crate::runtime::{RuntimeError, Value};

/// A role's view of the network: peers are addressed by locator index.
#[async_trait]
pub trait Transport: Send {
    async fn send(&mut self, to: usize, value: Value) -> Result<(), RuntimeError>;
    async fn recv(&mut self, from: usize) -> Result<Value, RuntimeError>;
}

/// One recorded communication action.
#[derive(Debug, Clone, PartialEq)]
pub struct CommEvent {
    pub from: usize,
    pub to: usize,
    pub value: Value,
}

/// In-memory transport over per-pair unbounded channels.
pub struct InMemoryTransport {
    index: usize,
    outgoing: HashMap<usize, UnboundedSender<Value>>,
    incoming: HashMap<usize, UnboundedReceiver<Value>>,
}

impl InMemoryTransport {
    pub fn index(&self) -> usize {
        self.index
    }
}

/// Build a fully connected in-memory network for `n` roles.
pub fn in_memory_network(n: usize) -> Vec<InMemoryTransport> {
    let mut endpoints: Vec<InMemoryTransport> = (0..n)
        .map(|index| InMemoryTransport { index, outgoing: HashMap::new(), incoming: HashMap::new() })
        .collect();
    for src in 0..n {
        for dst in 0..n {
            if src == dst {
                continue;
            }
            let (tx, rx) = unbounded_channel();
            endpoints[src].outgoing.insert(dst, tx);
            endpoints[dst].incoming.insert(src, rx);
        }
    }
    endpoints
}

#[async_trait]
impl Transport for InMemoryTransport {
    async fn send(&mut self, to: usize, value: Value) -> Result<(), RuntimeError> {
        tracing::trace!(from = self.index, to, "in-memory send");
        let sender = self
            .outgoing
            .get(&to)
            .ok_or_else(|| RuntimeError::Transport(format!("no channel from {} to {to}", self.index)))?;
        sender
            .send(value)
            .map_err(|_| RuntimeError::Transport(format!("channel from {} to {to} closed", self.index)))
    }

    async fn recv(&mut self, from: usize) -> Result<Value, RuntimeError> {
        tracing::trace!(to = self.index, from, "in-memory recv");
        let receiver = self
            .incoming
            .get_mut(&from)
            .ok_or_else(|| RuntimeError::Transport(format!("no channel from {from} to {}", self.index)))?;
        receiver
            .recv()
            .await
            .ok_or_else(|| RuntimeError::Transport(format!("channel from {from} to {} closed", self.index)))
    }
}

/// Middleware that records every send into a shared log before forwarding.
pub struct Recording<T> {
    inner: T,
    role: usize,
    log: Arc<Mutex<Vec<CommEvent>>>,
}

impl<T> Recording<T> {
    pub fn new(inner: T, role: usize, log: Arc<Mutex<Vec<CommEvent>>>) -> Self {
        Recording { inner, role, log }
    }
}

#[async_trait]
impl<T: Transport> Transport for Recording<T> {
    async fn send(&mut self, to: usize, value: Value) -> Result<(), RuntimeError> {
        self.log
            .lock()
            .expect("communication log poisoned")
            .push(CommEvent { from: self.role, to, value: value.clone() });
        self.inner.send(to, value).await
    }

    async fn recv(&mut self, from: usize) -> Result<Value, RuntimeError> {
        self.inner.recv(from).await
    }
}

/// Serializable mirror of [`Value`]; closures do not travel.
#[derive(Debug, Serialize, Deserialize)]
enum WireValue {
    Noop,
    Nil,
    Bool(bool),
    Int(i64),
    Str(String),
    Sym(String),
    Keyword(String),
    Vector(Vec<WireValue>),
    Map(Vec<(WireValue, WireValue)>),
    Set(Vec<WireValue>),
}

impl TryFrom<&Value> for WireValue {
    type Error = RuntimeError;

    fn try_from(value: &Value) -> Result<Self, Self::Error> {
        Ok(match value {
            Value::Noop => WireValue::Noop,
            Value::Nil => WireValue::Nil,
            Value::Bool(b) => WireValue::Bool(*b),
            Value::Int(n) => WireValue::Int(*n),
            Value::Str(s) => WireValue::Str(s.clone()),
            Value::Sym(s) => WireValue::Sym(s.clone()),
            Value::Keyword(k) => WireValue::Keyword(k.clone()),
            Value::Vector(items) => {
                WireValue::Vector(items.iter().map(WireValue::try_from).collect::<Result<_, _>>()?)
            }
            Value::Map(pairs) => WireValue::Map(
                pairs
                    .iter()
                    .map(|(k, v)| Ok((WireValue::try_from(k)?, WireValue::try_from(v)?)))
                    .collect::<Result<_, RuntimeError>>()?,
            ),
            Value::Set(items) => {
                WireValue::Set(items.iter().map(WireValue::try_from).collect::<Result<_, _>>()?)
            }
            Value::Fn(_) | Value::Chor(_) | Value::Builtin(_) => {
                return Err(RuntimeError::Serialization(
                    "closures cannot be sent over the wire".to_string(),
                ))
            }
        })
    }
}

impl From<WireValue> for Value {
    fn from(wire: WireValue) -> Self {
        match wire {
            WireValue::Noop => Value::Noop,
            WireValue::Nil => Value::Nil,
            WireValue::Bool(b) => Value::Bool(b),
            WireValue::Int(n) => Value::Int(n),
            WireValue::Str(s) => Value::Str(s),
            WireValue::Sym(s) => Value::Sym(s),
            WireValue::Keyword(k) => Value::Keyword(k),
            WireValue::Vector(items) => Value::Vector(items.into_iter().map(Value::from).collect()),
            WireValue::Map(pairs) => {
                Value::Map(pairs.into_iter().map(|(k, v)| (Value::from(k), Value::from(v))).collect())
            }
            WireValue::Set(items) => Value::Set(items.into_iter().map(Value::from).collect()),
        }
    }
}

/// TCP transport: one stream per peer, length-prefixed bincode payloads.
pub struct TcpTransport {
    peers: Vec<Option<TcpStream>>,
}

impl TcpTransport {
    pub fn new(peers: Vec<Option<TcpStream>>) -> Self {
        TcpTransport { peers }
    }

    fn peer(&mut self, index: usize) -> Result<&mut TcpStream, RuntimeError> {
        self.peers
            .get_mut(index)
            .and_then(Option::as_mut)
            .ok_or_else(|| RuntimeError::Transport(format!("no connection to peer {index}")))
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn send(&mut self, to: usize, value: Value) -> Result<(), RuntimeError> {
        let wire = WireValue::try_from(&value)?;
        let payload =
            bincode::serialize(&wire).map_err(|e| RuntimeError::Serialization(e.to_string()))?;
        tracing::trace!(to, size = payload.len(), "tcp send");
        let stream = self.peer(to)?;
        stream
            .write_all(&(payload.len() as u64).to_be_bytes())
            .await
            .map_err(|e| RuntimeError::Transport(e.to_string()))?;
        stream.write_all(&payload).await.map_err(|e| RuntimeError::Transport(e.to_string()))?;
        Ok(())
    }

    async fn recv(&mut self, from: usize) -> Result<Value, RuntimeError> {
        let stream = self.peer(from)?;
        let mut prefix = [0u8; 8];
        stream.read_exact(&mut prefix).await.map_err(|e| RuntimeError::Transport(e.to_string()))?;
        let len = u64::from_be_bytes(prefix) as usize;
        let mut payload = vec![0u8; len];
        stream.read_exact(&mut payload).await.map_err(|e| RuntimeError::Transport(e.to_string()))?;
        tracing::trace!(from, size = len, "tcp recv");
        let wire: WireValue =
            bincode::deserialize(&payload).map_err(|e| RuntimeError::Serialization(e.to_string()))?;
        Ok(Value::from(wire))
    }
}
