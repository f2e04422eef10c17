//! Typed server-facing requests.
//!
//! A [`Request`] knows its type code, how to render its body, which
//! negotiated features it depends on, and a short human description used in
//! timeout errors and logs.

use crate::auth::{CHAP_SHA1, SCRAMBLE_SIZE};
use crate::feature::{Feature, FeatureSet};
use crate::keys::{body, RequestType};
use crate::message::Body;
use rmpv::Value;
use std::fmt;
use std::time::Duration;

/// Space addressed by numeric id or by name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SpaceRef {
    Id(u32),
    Name(String),
}

/// Index addressed by numeric id or by name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IndexRef {
    Id(u32),
    Name(String),
}

impl SpaceRef {
    fn is_name(&self) -> bool {
        matches!(self, SpaceRef::Name(_))
    }

    fn write(&self, out: &mut Body) {
        match self {
            SpaceRef::Id(id) => out.insert(body::SPACE_ID, *id),
            SpaceRef::Name(name) => out.insert(body::SPACE_NAME, name.as_str()),
        };
    }
}

impl IndexRef {
    fn is_name(&self) -> bool {
        matches!(self, IndexRef::Name(_))
    }

    fn write(&self, out: &mut Body) {
        match self {
            IndexRef::Id(id) => out.insert(body::INDEX_ID, *id),
            IndexRef::Name(name) => out.insert(body::INDEX_NAME, name.as_str()),
        };
    }
}

impl Default for IndexRef {
    fn default() -> Self {
        IndexRef::Id(0)
    }
}

impl From<u32> for SpaceRef {
    fn from(id: u32) -> Self {
        SpaceRef::Id(id)
    }
}

impl From<&str> for SpaceRef {
    fn from(name: &str) -> Self {
        SpaceRef::Name(name.to_string())
    }
}

impl From<u32> for IndexRef {
    fn from(id: u32) -> Self {
        IndexRef::Id(id)
    }
}

impl From<&str> for IndexRef {
    fn from(name: &str) -> Self {
        IndexRef::Name(name.to_string())
    }
}

impl fmt::Display for SpaceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SpaceRef::Id(id) => write!(f, "{}", id),
            SpaceRef::Name(name) => write!(f, "'{}'", name),
        }
    }
}

impl fmt::Display for IndexRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IndexRef::Id(id) => write!(f, "{}", id),
            IndexRef::Name(name) => write!(f, "'{}'", name),
        }
    }
}

/// Index iterator used by `SELECT`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(u8)]
pub enum IteratorType {
    #[default]
    Eq = 0,
    Req = 1,
    All = 2,
    Lt = 3,
    Le = 4,
    Ge = 5,
    Gt = 6,
    BitsAllSet = 7,
    BitsAnySet = 8,
    BitsAllNotSet = 9,
    Overlaps = 10,
    Neighbor = 11,
}

/// Transaction isolation level sent with `BEGIN`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(u8)]
pub enum TxnIsolation {
    #[default]
    Default = 0,
    ReadCommitted = 1,
    ReadConfirmed = 2,
    BestEffort = 3,
}

/// Pagination cursor for `SELECT`.
#[derive(Debug, Clone, PartialEq)]
pub enum After {
    /// Opaque position returned by a previous select with `fetch_position`.
    Position(Vec<u8>),
    /// Last tuple of the previous page.
    Tuple(Value),
}

/// `SELECT` request.
#[derive(Debug, Clone, PartialEq)]
pub struct Select {
    pub space: SpaceRef,
    pub index: IndexRef,
    pub key: Vec<Value>,
    pub limit: u32,
    pub offset: u32,
    pub iterator: IteratorType,
    pub after: Option<After>,
    pub fetch_position: bool,
}

impl Select {
    pub fn new(space: impl Into<SpaceRef>) -> Self {
        Self {
            space: space.into(),
            index: IndexRef::default(),
            key: Vec::new(),
            limit: u32::MAX,
            offset: 0,
            iterator: IteratorType::default(),
            after: None,
            fetch_position: false,
        }
    }

    pub fn index(mut self, index: impl Into<IndexRef>) -> Self {
        self.index = index.into();
        self
    }

    pub fn key(mut self, key: Vec<Value>) -> Self {
        self.key = key;
        self
    }

    pub fn limit(mut self, limit: u32) -> Self {
        self.limit = limit;
        self
    }

    pub fn offset(mut self, offset: u32) -> Self {
        self.offset = offset;
        self
    }

    pub fn iterator(mut self, iterator: IteratorType) -> Self {
        self.iterator = iterator;
        self
    }

    pub fn after(mut self, after: After) -> Self {
        self.after = Some(after);
        self
    }

    pub fn fetch_position(mut self, fetch: bool) -> Self {
        self.fetch_position = fetch;
        self
    }
}

/// SQL statement addressed by text or by prepared statement id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Statement {
    Text(String),
    Id(u64),
}

impl From<&str> for Statement {
    fn from(sql: &str) -> Self {
        Statement::Text(sql.to_string())
    }
}

impl From<u64> for Statement {
    fn from(id: u64) -> Self {
        Statement::Id(id)
    }
}

/// A request the client can send.
#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    Select(Select),
    Insert {
        space: SpaceRef,
        tuple: Value,
    },
    Replace {
        space: SpaceRef,
        tuple: Value,
    },
    Update {
        space: SpaceRef,
        index: IndexRef,
        key: Value,
        ops: Value,
    },
    Delete {
        space: SpaceRef,
        index: IndexRef,
        key: Value,
    },
    Upsert {
        space: SpaceRef,
        tuple: Value,
        ops: Value,
    },
    Call {
        function: String,
        args: Vec<Value>,
    },
    Eval {
        expr: String,
        args: Vec<Value>,
    },
    Execute {
        statement: Statement,
        binds: Vec<Value>,
    },
    Prepare {
        statement: Statement,
    },
    Ping,
    Id {
        version: u64,
        features: FeatureSet,
    },
    Auth {
        user: String,
        scramble: [u8; SCRAMBLE_SIZE],
    },
    Watch {
        key: String,
    },
    Unwatch {
        key: String,
    },
    WatchOnce {
        key: String,
    },
    Begin {
        timeout: Option<Duration>,
        isolation: TxnIsolation,
    },
    Commit,
    Rollback,
}

impl Request {
    pub fn insert(space: impl Into<SpaceRef>, tuple: Vec<Value>) -> Self {
        Request::Insert {
            space: space.into(),
            tuple: Value::Array(tuple),
        }
    }

    pub fn replace(space: impl Into<SpaceRef>, tuple: Vec<Value>) -> Self {
        Request::Replace {
            space: space.into(),
            tuple: Value::Array(tuple),
        }
    }

    pub fn update(
        space: impl Into<SpaceRef>,
        index: impl Into<IndexRef>,
        key: Vec<Value>,
        ops: Vec<Value>,
    ) -> Self {
        Request::Update {
            space: space.into(),
            index: index.into(),
            key: Value::Array(key),
            ops: Value::Array(ops),
        }
    }

    pub fn delete(space: impl Into<SpaceRef>, index: impl Into<IndexRef>, key: Vec<Value>) -> Self {
        Request::Delete {
            space: space.into(),
            index: index.into(),
            key: Value::Array(key),
        }
    }

    pub fn upsert(space: impl Into<SpaceRef>, tuple: Vec<Value>, ops: Vec<Value>) -> Self {
        Request::Upsert {
            space: space.into(),
            tuple: Value::Array(tuple),
            ops: Value::Array(ops),
        }
    }

    pub fn call(function: impl Into<String>, args: Vec<Value>) -> Self {
        Request::Call {
            function: function.into(),
            args,
        }
    }

    pub fn eval(expr: impl Into<String>, args: Vec<Value>) -> Self {
        Request::Eval {
            expr: expr.into(),
            args,
        }
    }

    pub fn execute(statement: impl Into<Statement>, binds: Vec<Value>) -> Self {
        Request::Execute {
            statement: statement.into(),
            binds,
        }
    }

    pub fn prepare(sql: impl Into<String>) -> Self {
        Request::Prepare {
            statement: Statement::Text(sql.into()),
        }
    }

    /// Returns the wire type of this request.
    pub fn request_type(&self) -> RequestType {
        match self {
            Request::Select(_) => RequestType::Select,
            Request::Insert { .. } => RequestType::Insert,
            Request::Replace { .. } => RequestType::Replace,
            Request::Update { .. } => RequestType::Update,
            Request::Delete { .. } => RequestType::Delete,
            Request::Upsert { .. } => RequestType::Upsert,
            Request::Call { .. } => RequestType::Call,
            Request::Eval { .. } => RequestType::Eval,
            Request::Execute { .. } => RequestType::Execute,
            Request::Prepare { .. } => RequestType::Prepare,
            Request::Ping => RequestType::Ping,
            Request::Id { .. } => RequestType::Id,
            Request::Auth { .. } => RequestType::Auth,
            Request::Watch { .. } => RequestType::Watch,
            Request::Unwatch { .. } => RequestType::Unwatch,
            Request::WatchOnce { .. } => RequestType::WatchOnce,
            Request::Begin { .. } => RequestType::Begin,
            Request::Commit => RequestType::Commit,
            Request::Rollback => RequestType::Rollback,
        }
    }

    /// `WATCH` and `UNWATCH` are fire-and-forget: the server never replies.
    pub fn expects_reply(&self) -> bool {
        !matches!(self, Request::Watch { .. } | Request::Unwatch { .. })
    }

    /// Features the server must have negotiated for this request to be valid.
    pub fn required_features(&self) -> FeatureSet {
        let mut features = FeatureSet::empty();
        match self {
            Request::Select(select) => {
                if select.space.is_name() || select.index.is_name() {
                    features.insert(Feature::SpaceAndIndexNames);
                }
                if select.after.is_some() || select.fetch_position {
                    features.insert(Feature::Pagination);
                }
            }
            Request::Insert { space, .. }
            | Request::Replace { space, .. }
            | Request::Upsert { space, .. } => {
                if space.is_name() {
                    features.insert(Feature::SpaceAndIndexNames);
                }
            }
            Request::Update { space, index, .. } | Request::Delete { space, index, .. } => {
                if space.is_name() || index.is_name() {
                    features.insert(Feature::SpaceAndIndexNames);
                }
            }
            Request::Watch { .. } | Request::Unwatch { .. } => {
                features.insert(Feature::Watchers);
            }
            Request::WatchOnce { .. } => {
                features.insert(Feature::WatchOnce);
            }
            Request::Begin { .. } | Request::Commit | Request::Rollback => {
                features.insert(Feature::Transactions);
            }
            _ => {}
        }
        features
    }

    /// Renders the request body.
    pub fn body(&self) -> Body {
        let mut out = Body::new();
        match self {
            Request::Select(select) => {
                select.space.write(&mut out);
                select.index.write(&mut out);
                out.insert(body::LIMIT, select.limit);
                out.insert(body::OFFSET, select.offset);
                out.insert(body::ITERATOR, select.iterator as u8);
                out.insert(body::KEY, Value::Array(select.key.clone()));
                match &select.after {
                    Some(After::Position(pos)) => {
                        out.insert(body::AFTER_POSITION, Value::Binary(pos.clone()));
                    }
                    Some(After::Tuple(tuple)) => {
                        out.insert(body::AFTER_TUPLE, tuple.clone());
                    }
                    None => {}
                }
                if select.fetch_position {
                    out.insert(body::FETCH_POSITION, true);
                }
            }
            Request::Insert { space, tuple } | Request::Replace { space, tuple } => {
                space.write(&mut out);
                out.insert(body::TUPLE, tuple.clone());
            }
            Request::Update {
                space,
                index,
                key,
                ops,
            } => {
                space.write(&mut out);
                index.write(&mut out);
                out.insert(body::KEY, key.clone());
                // UPDATE carries its operations under TUPLE.
                out.insert(body::TUPLE, ops.clone());
            }
            Request::Delete { space, index, key } => {
                space.write(&mut out);
                index.write(&mut out);
                out.insert(body::KEY, key.clone());
            }
            Request::Upsert { space, tuple, ops } => {
                space.write(&mut out);
                out.insert(body::TUPLE, tuple.clone());
                out.insert(body::OPS, ops.clone());
            }
            Request::Call { function, args } => {
                out.insert(body::FUNCTION_NAME, function.as_str());
                out.insert(body::TUPLE, Value::Array(args.clone()));
            }
            Request::Eval { expr, args } => {
                out.insert(body::EXPR, expr.as_str());
                out.insert(body::TUPLE, Value::Array(args.clone()));
            }
            Request::Execute { statement, binds } => {
                write_statement(statement, &mut out);
                out.insert(body::SQL_BIND, Value::Array(binds.clone()));
                out.insert(body::OPTIONS, Value::Array(Vec::new()));
            }
            Request::Prepare { statement } => {
                write_statement(statement, &mut out);
            }
            Request::Ping | Request::Commit | Request::Rollback => {}
            Request::Id { version, features } => {
                out.insert(body::VERSION, *version);
                out.insert(
                    body::FEATURES,
                    Value::Array(features.codes().into_iter().map(Value::from).collect()),
                );
            }
            Request::Auth { user, scramble } => {
                out.insert(body::USER_NAME, user.as_str());
                out.insert(
                    body::TUPLE,
                    Value::Array(vec![Value::from(CHAP_SHA1), Value::Binary(scramble.to_vec())]),
                );
            }
            Request::Watch { key } | Request::Unwatch { key } | Request::WatchOnce { key } => {
                out.insert(body::EVENT_KEY, key.as_str());
            }
            Request::Begin { timeout, isolation } => {
                if let Some(timeout) = timeout {
                    out.insert(body::TIMEOUT, timeout.as_secs_f64());
                }
                if *isolation != TxnIsolation::Default {
                    out.insert(body::TXN_ISOLATION, *isolation as u8);
                }
            }
        }
        out
    }

    /// Short description naming the request, used in timeout errors.
    pub fn describe(&self) -> String {
        let ty = self.request_type();
        match self {
            Request::Select(select) => format!("{} from space {}", ty, select.space),
            Request::Insert { space, .. }
            | Request::Replace { space, .. }
            | Request::Update { space, .. }
            | Request::Delete { space, .. }
            | Request::Upsert { space, .. } => format!("{} on space {}", ty, space),
            Request::Call { function, .. } => format!("{} '{}'", ty, function),
            Request::Eval { expr, .. } => {
                let mut snippet: String = expr.chars().take(40).collect();
                if snippet.len() < expr.len() {
                    snippet.push_str("...");
                }
                format!("{} '{}'", ty, snippet)
            }
            Request::Execute { statement, .. } | Request::Prepare { statement } => match statement
            {
                Statement::Id(id) => format!("{} statement {}", ty, id),
                Statement::Text(_) => format!("{} sql", ty),
            },
            Request::Auth { user, .. } => format!("{} as '{}'", ty, user),
            Request::Watch { key } | Request::Unwatch { key } | Request::WatchOnce { key } => {
                format!("{} '{}'", ty, key)
            }
            _ => ty.to_string(),
        }
    }
}

impl From<Select> for Request {
    fn from(select: Select) -> Self {
        Request::Select(select)
    }
}

fn write_statement(statement: &Statement, out: &mut Body) {
    match statement {
        Statement::Text(sql) => out.insert(body::SQL_TEXT, sql.as_str()),
        Statement::Id(id) => out.insert(body::STMT_ID, *id),
    };
}
