use std::ops::BitOr;

use crate::routing;

/// Behaviour flags carried by a command through admission, selection and the
/// bridge. Stored as a plain bitset so copies are free on the hot path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CommandFlags(u16);

impl CommandFlags {
    pub const NONE: CommandFlags = CommandFlags(0);
    /// Complete the caller's future on queue acceptance; discard the reply.
    pub const FIRE_AND_FORGET: CommandFlags = CommandFlags(1 << 0);
    /// Fail on MOVED/ASK instead of following the redirect.
    pub const NO_REDIRECT: CommandFlags = CommandFlags(1 << 1);
    pub const DEMAND_PRIMARY: CommandFlags = CommandFlags(1 << 2);
    pub const DEMAND_REPLICA: CommandFlags = CommandFlags(1 << 3);
    pub const PREFER_PRIMARY: CommandFlags = CommandFlags(1 << 4);
    pub const PREFER_REPLICA: CommandFlags = CommandFlags(1 << 5);
    /// Issued by the multiplexer itself (handshake, tracer, probes). Bypasses
    /// the backlog and is admitted before the bridge is fully established.
    pub const INTERNAL_CALL: CommandFlags = CommandFlags(1 << 6);
    /// Jump the backlog queue.
    pub const HIGH_PRIORITY: CommandFlags = CommandFlags(1 << 7);
    /// Append an ECHO tracer to the write and verify its token on reply.
    pub const HIGH_INTEGRITY: CommandFlags = CommandFlags(1 << 8);

    pub fn contains(self, other: CommandFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: CommandFlags) {
        self.0 |= other.0;
    }
}

impl BitOr for CommandFlags {
    type Output = CommandFlags;

    fn bitor(self, rhs: CommandFlags) -> CommandFlags {
        CommandFlags(self.0 | rhs.0)
    }
}

/// Conversion of argument values into RESP bulk-string bytes.
pub trait ToArgs {
    fn write_args(&self, out: &mut Vec<Vec<u8>>);
}

impl ToArgs for &[u8] {
    fn write_args(&self, out: &mut Vec<Vec<u8>>) {
        out.push(self.to_vec());
    }
}

impl ToArgs for Vec<u8> {
    fn write_args(&self, out: &mut Vec<Vec<u8>>) {
        out.push(self.clone());
    }
}

impl ToArgs for &str {
    fn write_args(&self, out: &mut Vec<Vec<u8>>) {
        out.push(self.as_bytes().to_vec());
    }
}

impl ToArgs for String {
    fn write_args(&self, out: &mut Vec<Vec<u8>>) {
        out.push(self.as_bytes().to_vec());
    }
}

macro_rules! itoa_to_args {
    ($($ty:ty),*) => {
        $(impl ToArgs for $ty {
            fn write_args(&self, out: &mut Vec<Vec<u8>>) {
                let mut buf = itoa::Buffer::new();
                out.push(buf.format(*self).as_bytes().to_vec());
            }
        })*
    };
}

itoa_to_args!(i16, i32, i64, u16, u32, u64, usize);

impl ToArgs for f64 {
    fn write_args(&self, out: &mut Vec<Vec<u8>>) {
        out.push(format_double(*self).into_bytes());
    }
}

impl<T: ToArgs> ToArgs for &T {
    fn write_args(&self, out: &mut Vec<Vec<u8>>) {
        (*self).write_args(out);
    }
}

/// Shortest round-trip rendering, with the wire spellings for the
/// non-finite values.
pub(crate) fn format_double(value: f64) -> String {
    if value.is_nan() {
        "nan".to_owned()
    } else if value.is_infinite() {
        if value.is_sign_negative() {
            "-inf".to_owned()
        } else {
            "inf".to_owned()
        }
    } else {
        let mut buf = ryu::Buffer::new();
        buf.format_finite(value).to_owned()
    }
}

/// An issued unit of work: the command token, its arguments, routing inputs
/// and behaviour flags.
#[derive(Debug, Clone)]
pub struct Cmd {
    args: Vec<Vec<u8>>,
    flags: CommandFlags,
    db: i16,
    hash_slot: Option<u16>,
    cross_slot: bool,
}

/// Shortcut for starting a command, mirroring the builder chain style used
/// throughout the crate: `cmd("SET").arg_key("foo").arg("bar")`.
pub fn cmd(name: &str) -> Cmd {
    Cmd::new(name)
}

impl Cmd {
    pub fn new(name: &str) -> Cmd {
        Cmd {
            args: vec![name.as_bytes().to_vec()],
            flags: CommandFlags::NONE,
            db: -1,
            hash_slot: None,
            cross_slot: false,
        }
    }

    /// Appends a non-key argument.
    pub fn arg<T: ToArgs>(mut self, arg: T) -> Cmd {
        arg.write_args(&mut self.args);
        self
    }

    /// Appends a key argument and folds it into the command's hash slot.
    /// Keys that land on different slots poison the command; admission
    /// rejects it with `CrossSlot`.
    pub fn arg_key(mut self, key: impl AsRef<[u8]>) -> Cmd {
        let key = key.as_ref();
        let slot = routing::hash_slot(key);
        match self.hash_slot {
            None => self.hash_slot = Some(slot),
            Some(existing) if existing != slot => self.cross_slot = true,
            Some(_) => {}
        }
        self.args.push(key.to_vec());
        self
    }

    pub fn flags(mut self, flags: CommandFlags) -> Cmd {
        self.flags.insert(flags);
        self
    }

    pub fn db(mut self, db: i16) -> Cmd {
        self.db = db;
        self
    }

    pub(crate) fn get_flags(&self) -> CommandFlags {
        self.flags
    }

    pub(crate) fn get_db(&self) -> i16 {
        self.db
    }

    pub fn hash_slot(&self) -> Option<u16> {
        self.hash_slot
    }

    pub(crate) fn is_cross_slot(&self) -> bool {
        self.cross_slot
    }

    /// The command token (`argv[0]`).
    pub fn name(&self) -> &[u8] {
        &self.args[0]
    }

    /// Exact byte length of the packed form, for buffer pre-allocation.
    pub(crate) fn packed_len(&self) -> usize {
        let mut len = 1 + decimal_len(self.args.len() as u64) + 2;
        for arg in &self.args {
            len += 1 + decimal_len(arg.len() as u64) + 2 + arg.len() + 2;
        }
        len
    }

    /// Encodes the command as a RESP array of bulk strings, the only frame
    /// shape ever sent, regardless of the negotiated protocol version.
    pub(crate) fn write_packed(&self, out: &mut Vec<u8>) {
        let mut itoa_buf = itoa::Buffer::new();
        out.reserve(self.packed_len());
        out.push(b'*');
        out.extend_from_slice(itoa_buf.format(self.args.len()).as_bytes());
        out.extend_from_slice(b"\r\n");
        for arg in &self.args {
            out.push(b'$');
            out.extend_from_slice(itoa_buf.format(arg.len()).as_bytes());
            out.extend_from_slice(b"\r\n");
            out.extend_from_slice(arg);
            out.extend_from_slice(b"\r\n");
        }
    }

    pub fn packed(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.packed_len());
        self.write_packed(&mut out);
        out
    }
}

fn decimal_len(mut n: u64) -> usize {
    let mut len = 1;
    while n >= 10 {
        n /= 10;
        len += 1;
    }
    len
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packs_as_resp_array_of_bulks() {
        let c = cmd("SET").arg_key("foo").arg("bar");
        assert_eq!(
            c.packed(),
            b"*3\r\n$3\r\nSET\r\n$3\r\nfoo\r\n$3\r\nbar\r\n".to_vec()
        );
        assert_eq!(c.packed_len(), c.packed().len());
    }

    #[test]
    fn integer_args_render_decimal() {
        let c = cmd("EXPIRE").arg_key("k").arg(3600_i64);
        assert_eq!(
            c.packed(),
            b"*3\r\n$6\r\nEXPIRE\r\n$1\r\nk\r\n$4\r\n3600\r\n".to_vec()
        );
    }

    #[test]
    fn double_args_cover_non_finite() {
        assert_eq!(format_double(f64::INFINITY), "inf");
        assert_eq!(format_double(f64::NEG_INFINITY), "-inf");
        assert_eq!(format_double(f64::NAN), "nan");
        assert_eq!(format_double(1.5), "1.5");
    }

    #[test]
    fn same_hash_tag_does_not_poison() {
        let c = cmd("MSET")
            .arg_key("{user}.a")
            .arg("1")
            .arg_key("{user}.b")
            .arg("2");
        assert!(!c.is_cross_slot());
        assert!(c.hash_slot().is_some());
    }

    #[test]
    fn differing_slots_poison() {
        let c = cmd("MGET").arg_key("foo").arg_key("bar");
        assert!(c.is_cross_slot());
    }

    #[test]
    fn flag_bitset() {
        let mut flags = CommandFlags::NONE;
        assert!(!flags.contains(CommandFlags::INTERNAL_CALL));
        flags.insert(CommandFlags::INTERNAL_CALL | CommandFlags::HIGH_PRIORITY);
        assert!(flags.contains(CommandFlags::INTERNAL_CALL));
        assert!(flags.contains(CommandFlags::HIGH_PRIORITY));
        assert!(!flags.contains(CommandFlags::HIGH_INTEGRITY));
    }
}
