use std::fmt;

/// A parsed server response.
///
/// Replies are produced by the frame codec, handed to the waiter that issued
/// the matching command, and dropped once consumed. Consumers pattern-match;
/// there is intentionally no trait-object hierarchy here.
#[derive(Clone, PartialEq)]
pub enum Reply {
    /// RESP `+` simple string.
    Simple(Vec<u8>),
    /// RESP `-` error line, kept as raw bytes so redirect/condition prefixes
    /// can be inspected without a lossy conversion.
    Error(Vec<u8>),
    /// RESP `:` integer.
    Int(i64),
    /// RESP `$` bulk string. `None` is the RESP2 null bulk (`$-1`).
    Bulk(Option<Vec<u8>>),
    /// RESP `*` array. `None` is the RESP2 null array (`*-1`).
    Array(Option<Vec<Reply>>),
    /// RESP3 `_` null.
    Null,
    /// RESP3 `,` double.
    Double(f64),
    /// RESP3 `#` boolean.
    Boolean(bool),
    /// RESP3 `(` big number, kept as the raw decimal bytes.
    BigNumber(Vec<u8>),
    /// RESP3 `%` map of key/value pairs, in wire order.
    Map(Vec<(Reply, Reply)>),
    /// RESP3 `~` set.
    Set(Vec<Reply>),
    /// RESP3 `>` out-of-band push.
    Push(Vec<Reply>),
    /// RESP3 `=` verbatim string with its three-byte format prefix.
    Verbatim { format: [u8; 3], data: Vec<u8> },
    /// RESP3 `|` attribute map attached to the value that follows it.
    Attribute {
        attrs: Vec<(Reply, Reply)>,
        inner: Box<Reply>,
    },
}

impl Reply {
    /// The canonical `+OK` reply.
    pub fn okay() -> Reply {
        Reply::Simple(b"OK".to_vec())
    }

    pub fn is_okay(&self) -> bool {
        matches!(self.data(), Reply::Simple(s) if s == b"OK")
    }

    /// Looks through any attribute wrapper to the value it decorates.
    pub fn data(&self) -> &Reply {
        match self {
            Reply::Attribute { inner, .. } => inner.data(),
            other => other,
        }
    }

    /// Consumes any attribute wrapper, yielding the decorated value.
    pub fn into_data(self) -> Reply {
        match self {
            Reply::Attribute { inner, .. } => inner.into_data(),
            other => other,
        }
    }

    /// Byte payload of string-shaped replies.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self.data() {
            Reply::Simple(s) => Some(s),
            Reply::Bulk(Some(s)) => Some(s),
            Reply::Verbatim { data, .. } => Some(data),
            Reply::BigNumber(s) => Some(s),
            _ => None,
        }
    }

    /// Lossy UTF-8 view of string-shaped replies.
    pub fn as_text(&self) -> Option<String> {
        self.as_bytes()
            .map(|b| String::from_utf8_lossy(b).into_owned())
    }

    pub fn as_int(&self) -> Option<i64> {
        match self.data() {
            Reply::Int(n) => Some(*n),
            _ => None,
        }
    }

    /// Elements of sequence-shaped replies.
    pub fn as_items(&self) -> Option<&[Reply]> {
        match self.data() {
            Reply::Array(Some(items)) => Some(items),
            Reply::Set(items) => Some(items),
            Reply::Push(items) => Some(items),
            _ => None,
        }
    }

    pub fn into_items(self) -> Option<Vec<Reply>> {
        match self.into_data() {
            Reply::Array(Some(items)) => Some(items),
            Reply::Set(items) => Some(items),
            Reply::Push(items) => Some(items),
            _ => None,
        }
    }

    /// True for both RESP2 (`$-1`/`*-1`) and RESP3 (`_`) null shapes.
    pub fn is_null(&self) -> bool {
        matches!(
            self.data(),
            Reply::Null | Reply::Bulk(None) | Reply::Array(None)
        )
    }

    pub(crate) fn simple_matches(&self, expected: &[u8]) -> bool {
        matches!(self.data(), Reply::Simple(s) if s == expected)
    }
}

fn fmt_bytes(f: &mut fmt::Formatter<'_>, bytes: &[u8]) -> fmt::Result {
    write!(f, "{:?}", String::from_utf8_lossy(bytes))
}

impl fmt::Debug for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reply::Simple(s) => {
                write!(f, "simple(")?;
                fmt_bytes(f, s)?;
                write!(f, ")")
            }
            Reply::Error(s) => {
                write!(f, "error(")?;
                fmt_bytes(f, s)?;
                write!(f, ")")
            }
            Reply::Int(n) => write!(f, "int({n})"),
            Reply::Bulk(None) => write!(f, "bulk(nil)"),
            Reply::Bulk(Some(s)) => {
                write!(f, "bulk(")?;
                fmt_bytes(f, s)?;
                write!(f, ")")
            }
            Reply::Array(None) => write!(f, "array(nil)"),
            Reply::Array(Some(items)) => f.debug_list().entries(items).finish(),
            Reply::Null => write!(f, "null"),
            Reply::Double(d) => write!(f, "double({d})"),
            Reply::Boolean(b) => write!(f, "boolean({b})"),
            Reply::BigNumber(s) => {
                write!(f, "big-number(")?;
                fmt_bytes(f, s)?;
                write!(f, ")")
            }
            Reply::Map(pairs) => f.debug_map().entries(pairs.iter().map(|(k, v)| (k, v))).finish(),
            Reply::Set(items) => {
                write!(f, "set")?;
                f.debug_list().entries(items).finish()
            }
            Reply::Push(items) => {
                write!(f, "push")?;
                f.debug_list().entries(items).finish()
            }
            Reply::Verbatim { format, data } => {
                write!(f, "verbatim({}:", String::from_utf8_lossy(format))?;
                fmt_bytes(f, data)?;
                write!(f, ")")
            }
            Reply::Attribute { attrs, inner } => {
                write!(f, "attribute(")?;
                f.debug_map()
                    .entries(attrs.iter().map(|(k, v)| (k, v)))
                    .finish()?;
                write!(f, ", {inner:?})")
            }
        }
    }
}
