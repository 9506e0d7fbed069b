// In-memory stand-ins for PostgreSQL and Redis used by the integration tests
#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use redis::{Arg, Cmd, ErrorKind, RedisError, RedisResult, Value};
use resilient_store::config::StoreConfig;
use resilient_store::db::{ConnectionFactory, RawConnection, RawCursor, Row};
use resilient_store::errors::DatabaseError;
use resilient_store::store::{ResilientStoreClient, StoreTransport};
use serde_json::{json, Value as JsonValue};
use std::collections::{HashMap, HashSet, VecDeque};
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

// ---------------------------------------------------------------------------
// Database
// ---------------------------------------------------------------------------

/// A database that journals statements
///
/// Statements run inside a session are pending until commit. `SELECT`
/// returns one row per committed statement plus the session's pending ones.
/// Any statement containing `FAIL` is rejected.
#[derive(Default)]
pub struct FakeDatabase {
    state: Mutex<DbState>,
}

#[derive(Default)]
struct DbState {
    opened: usize,
    closed: usize,
    committed: Vec<String>,
    refuse_connections: bool,
    connect_delay: Option<Duration>,
}

impl FakeDatabase {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn opened(&self) -> usize {
        self.state.lock().opened
    }

    pub fn closed(&self) -> usize {
        self.state.lock().closed
    }

    pub fn committed(&self) -> Vec<String> {
        self.state.lock().committed.clone()
    }

    pub fn refuse_connections(&self, refuse: bool) {
        self.state.lock().refuse_connections = refuse;
    }

    pub fn set_connect_delay(&self, delay: Duration) {
        self.state.lock().connect_delay = Some(delay);
    }

    pub fn connector(self: &Arc<Self>) -> Arc<dyn ConnectionFactory> {
        Arc::new(FakeConnector(Arc::clone(self)))
    }
}

struct FakeConnector(Arc<FakeDatabase>);

#[async_trait]
impl ConnectionFactory for FakeConnector {
    async fn connect(&self) -> Result<Box<dyn RawConnection>, DatabaseError> {
        let delay = self.0.state.lock().connect_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.0.state.lock();
        if state.refuse_connections {
            return Err(DatabaseError::ConnectionFailed("connection refused".to_string()));
        }
        state.opened += 1;
        Ok(Box::new(FakeSession {
            db: Arc::clone(&self.0),
            pending: Vec::new(),
        }))
    }
}

struct FakeSession {
    db: Arc<FakeDatabase>,
    pending: Vec<String>,
}

#[async_trait]
impl RawConnection for FakeSession {
    async fn cursor(&mut self) -> Result<Box<dyn RawCursor + '_>, DatabaseError> {
        Ok(Box::new(FakeCursor {
            session: self,
            rows: Vec::new(),
        }))
    }

    async fn commit(&mut self) -> Result<(), DatabaseError> {
        let pending = std::mem::take(&mut self.pending);
        self.db.state.lock().committed.extend(pending);
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), DatabaseError> {
        self.pending.clear();
        Ok(())
    }

    async fn close(self: Box<Self>) -> Result<(), DatabaseError> {
        self.db.state.lock().closed += 1;
        Ok(())
    }
}

struct FakeCursor<'s> {
    session: &'s mut FakeSession,
    rows: Vec<Row>,
}

#[async_trait]
impl RawCursor for FakeCursor<'_> {
    async fn execute(&mut self, query: &str, _params: &[JsonValue]) -> Result<(), DatabaseError> {
        if query.contains("FAIL") {
            return Err(DatabaseError::QueryFailed(format!(
                "syntax error at or near \"FAIL\" in {}",
                query
            )));
        }

        if query.trim_start().to_uppercase().starts_with("SELECT") {
            let committed = self.session.db.committed();
            self.rows = committed
                .iter()
                .chain(self.session.pending.iter())
                .map(|statement| row(statement))
                .collect();
        } else {
            self.session.pending.push(query.to_string());
        }
        Ok(())
    }

    async fn fetch_all(&mut self) -> Result<Vec<Row>, DatabaseError> {
        Ok(std::mem::take(&mut self.rows))
    }

    async fn close(&mut self) -> Result<(), DatabaseError> {
        Ok(())
    }
}

fn row(statement: &str) -> Row {
    let mut row = Row::new();
    row.insert("statement".to_string(), json!(statement));
    row
}

// ---------------------------------------------------------------------------
// Key-value store
// ---------------------------------------------------------------------------

enum Entry {
    Text(Vec<u8>),
    Hash(HashMap<Vec<u8>, Vec<u8>>),
    List(VecDeque<Vec<u8>>),
    Set(HashSet<Vec<u8>>),
}

#[derive(Default)]
struct Keyspace {
    entries: HashMap<String, Entry>,
    expiry: HashMap<String, i64>,
}

impl Keyspace {
    fn remove(&mut self, key: &str) -> bool {
        self.expiry.remove(key);
        self.entries.remove(key).is_some()
    }
}

/// A single-database Redis emulation covering the client's command surface
#[derive(Default)]
pub struct MemoryRedis {
    keyspace: Mutex<Keyspace>,
    down: AtomicBool,
    failures_left: AtomicUsize,
    calls: AtomicUsize,
    disconnected: AtomicBool,
}

impl MemoryRedis {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Refuse every command until brought back up
    pub fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }

    /// Refuse only the next `count` commands
    pub fn fail_next(&self, count: usize) {
        self.failures_left.store(count, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn is_disconnected(&self) -> bool {
        self.disconnected.load(Ordering::SeqCst)
    }

    /// Store raw bytes under a key, bypassing the client's encoding
    pub fn put_raw(&self, key: &str, bytes: &[u8]) {
        self.keyspace
            .lock()
            .entries
            .insert(key.to_string(), Entry::Text(bytes.to_vec()));
    }

    /// Raw bytes of a string key
    pub fn raw(&self, key: &str) -> Option<Vec<u8>> {
        match self.keyspace.lock().entries.get(key) {
            Some(Entry::Text(bytes)) => Some(bytes.clone()),
            _ => None,
        }
    }

    fn refuse(&self) -> bool {
        if self.down.load(Ordering::SeqCst) {
            return true;
        }
        self.failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok()
    }

    fn run(&self, args: Vec<Vec<u8>>) -> RedisResult<Value> {
        let (name, args) = args
            .split_first()
            .ok_or_else(|| response_error("ERR empty command"))?;
        let name = String::from_utf8_lossy(name).to_uppercase();
        let mut ks = self.keyspace.lock();

        match name.as_str() {
            "PING" => Ok(Value::Status("PONG".to_string())),
            "FLUSHDB" => {
                ks.entries.clear();
                ks.expiry.clear();
                Ok(Value::Okay)
            }
            "SET" => {
                let key = key_at(args, 0)?;
                let value = arg_at(args, 1)?.to_vec();
                let mut expire = None;
                let mut only_if_absent = false;
                let mut rest = args[2..].iter();
                while let Some(flag) = rest.next() {
                    match String::from_utf8_lossy(flag).to_uppercase().as_str() {
                        "NX" => only_if_absent = true,
                        "EX" => {
                            let seconds = rest.next().ok_or_else(|| response_error("ERR syntax error"))?;
                            expire = Some(parse_int(seconds)?);
                        }
                        _ => return Err(response_error("ERR syntax error")),
                    }
                }
                if only_if_absent && ks.entries.contains_key(&key) {
                    return Ok(Value::Nil);
                }
                ks.remove(&key);
                ks.entries.insert(key.clone(), Entry::Text(value));
                if let Some(seconds) = expire {
                    ks.expiry.insert(key, seconds);
                }
                Ok(Value::Okay)
            }
            "GET" => match ks.entries.get(&key_at(args, 0)?) {
                None => Ok(Value::Nil),
                Some(Entry::Text(bytes)) => Ok(Value::Data(bytes.clone())),
                Some(_) => Err(wrong_type()),
            },
            "DEL" => {
                let mut removed = 0;
                for key in args {
                    if ks.remove(&String::from_utf8_lossy(key)) {
                        removed += 1;
                    }
                }
                Ok(Value::Int(removed))
            }
            "EXISTS" => Ok(Value::Int(ks.entries.contains_key(&key_at(args, 0)?) as i64)),
            "EXPIRE" => {
                let key = key_at(args, 0)?;
                let seconds = parse_int(arg_at(args, 1)?)?;
                if !ks.entries.contains_key(&key) {
                    return Ok(Value::Int(0));
                }
                ks.expiry.insert(key, seconds);
                Ok(Value::Int(1))
            }
            "TTL" => {
                let key = key_at(args, 0)?;
                if !ks.entries.contains_key(&key) {
                    return Ok(Value::Int(-2));
                }
                Ok(Value::Int(ks.expiry.get(&key).copied().unwrap_or(-1)))
            }
            "HSET" => {
                let key = key_at(args, 0)?;
                let field = arg_at(args, 1)?.to_vec();
                let value = arg_at(args, 2)?.to_vec();
                let entry = ks.entries.entry(key).or_insert_with(|| Entry::Hash(HashMap::new()));
                match entry {
                    Entry::Hash(hash) => Ok(Value::Int(hash.insert(field, value).is_none() as i64)),
                    _ => Err(wrong_type()),
                }
            }
            "HGET" => match ks.entries.get(&key_at(args, 0)?) {
                None => Ok(Value::Nil),
                Some(Entry::Hash(hash)) => Ok(hash
                    .get(arg_at(args, 1)?)
                    .map_or(Value::Nil, |v| Value::Data(v.clone()))),
                Some(_) => Err(wrong_type()),
            },
            "HGETALL" => match ks.entries.get(&key_at(args, 0)?) {
                None => Ok(Value::Bulk(vec![])),
                Some(Entry::Hash(hash)) => Ok(Value::Bulk(
                    hash.iter()
                        .flat_map(|(f, v)| [Value::Data(f.clone()), Value::Data(v.clone())])
                        .collect(),
                )),
                Some(_) => Err(wrong_type()),
            },
            "HDEL" => {
                let key = key_at(args, 0)?;
                match ks.entries.get_mut(&key) {
                    None => Ok(Value::Int(0)),
                    Some(Entry::Hash(hash)) => {
                        let removed = args[1..].iter().filter(|f| hash.remove(*f).is_some()).count();
                        Ok(Value::Int(removed as i64))
                    }
                    Some(_) => Err(wrong_type()),
                }
            }
            "LPUSH" | "RPUSH" => {
                let key = key_at(args, 0)?;
                let entry = ks.entries.entry(key).or_insert_with(|| Entry::List(VecDeque::new()));
                match entry {
                    Entry::List(list) => {
                        for value in &args[1..] {
                            if name == "LPUSH" {
                                list.push_front(value.clone());
                            } else {
                                list.push_back(value.clone());
                            }
                        }
                        Ok(Value::Int(list.len() as i64))
                    }
                    _ => Err(wrong_type()),
                }
            }
            "LPOP" | "RPOP" => {
                let key = key_at(args, 0)?;
                let (popped, drained) = match ks.entries.get_mut(&key) {
                    None => return Ok(Value::Nil),
                    Some(Entry::List(list)) => {
                        let popped = if name == "LPOP" { list.pop_front() } else { list.pop_back() };
                        (popped, list.is_empty())
                    }
                    Some(_) => return Err(wrong_type()),
                };
                if drained {
                    ks.remove(&key);
                }
                Ok(popped.map_or(Value::Nil, Value::Data))
            }
            "LLEN" => match ks.entries.get(&key_at(args, 0)?) {
                None => Ok(Value::Int(0)),
                Some(Entry::List(list)) => Ok(Value::Int(list.len() as i64)),
                Some(_) => Err(wrong_type()),
            },
            "SADD" => {
                let key = key_at(args, 0)?;
                let entry = ks.entries.entry(key).or_insert_with(|| Entry::Set(HashSet::new()));
                match entry {
                    Entry::Set(set) => {
                        let added = args[1..].iter().filter(|v| set.insert(v.to_vec())).count();
                        Ok(Value::Int(added as i64))
                    }
                    _ => Err(wrong_type()),
                }
            }
            "SREM" => match ks.entries.get_mut(&key_at(args, 0)?) {
                None => Ok(Value::Int(0)),
                Some(Entry::Set(set)) => {
                    let removed = args[1..].iter().filter(|v| set.remove(*v)).count();
                    Ok(Value::Int(removed as i64))
                }
                Some(_) => Err(wrong_type()),
            },
            "SMEMBERS" => match ks.entries.get(&key_at(args, 0)?) {
                None => Ok(Value::Bulk(vec![])),
                Some(Entry::Set(set)) => Ok(Value::Bulk(set.iter().cloned().map(Value::Data).collect())),
                Some(_) => Err(wrong_type()),
            },
            "KEYS" => {
                let pattern = key_at(args, 0)?;
                let mut keys: Vec<&String> =
                    ks.entries.keys().filter(|k| glob_match(&pattern, k)).collect();
                keys.sort();
                Ok(Value::Bulk(
                    keys.into_iter().map(|k| Value::Data(k.as_bytes().to_vec())).collect(),
                ))
            }
            other => Err(response_error(&format!("ERR unknown command '{}'", other))),
        }
    }
}

#[async_trait]
impl StoreTransport for MemoryRedis {
    async fn send(&self, cmd: &Cmd) -> RedisResult<Value> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.refuse() {
            return Err(RedisError::from(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                "Connection refused (os error 111)",
            )));
        }

        let args = cmd
            .args_iter()
            .filter_map(|arg| match arg {
                Arg::Simple(bytes) => Some(bytes.to_vec()),
                Arg::Cursor => None,
            })
            .collect();
        self.run(args)
    }

    async fn disconnect(&self) -> RedisResult<()> {
        self.disconnected.store(true, Ordering::SeqCst);
        Ok(())
    }
}

fn arg_at(args: &[Vec<u8>], index: usize) -> RedisResult<&[u8]> {
    args.get(index)
        .map(Vec::as_slice)
        .ok_or_else(|| response_error("ERR wrong number of arguments"))
}

fn key_at(args: &[Vec<u8>], index: usize) -> RedisResult<String> {
    arg_at(args, index).map(|bytes| String::from_utf8_lossy(bytes).into_owned())
}

fn parse_int(bytes: &[u8]) -> RedisResult<i64> {
    String::from_utf8_lossy(bytes)
        .parse()
        .map_err(|_| response_error("ERR value is not an integer or out of range"))
}

/// `*` matches any run of characters; everything else matches literally
fn glob_match(pattern: &str, key: &str) -> bool {
    match pattern.split_once('*') {
        None => pattern == key,
        Some((prefix, rest)) => {
            let Some(tail) = key.strip_prefix(prefix) else {
                return false;
            };
            if rest.is_empty() {
                return true;
            }
            (0..=tail.len())
                .filter(|i| tail.is_char_boundary(*i))
                .any(|i| glob_match(rest, &tail[i..]))
        }
    }
}

fn wrong_type() -> RedisError {
    RedisError::from((
        ErrorKind::TypeError,
        "WRONGTYPE Operation against a key holding the wrong kind of value",
    ))
}

fn response_error(message: &str) -> RedisError {
    RedisError::from((ErrorKind::ResponseError, "response error", message.to_string()))
}

/// Store config with short, deterministic retry delays
pub fn store_config() -> StoreConfig {
    StoreConfig {
        max_retries: 3,
        retry_delay_ms: 100,
        backoff_factor: 2.0,
        retry_jitter: 0.0,
        ..StoreConfig::default()
    }
}

pub fn store_client(redis: &Arc<MemoryRedis>) -> ResilientStoreClient {
    ResilientStoreClient::with_transport(store_config(), redis.clone())
        .expect("valid store config")
}
