#![allow(dead_code)]

//! In-process scripted server speaking just enough RESP for the scenarios:
//! a TCP listener whose connections parse inbound command arrays, answer
//! through a per-test handler (falling back to a canned handshake), track
//! subscriber state for pub/sub fan-out, and can be force-disconnected to
//! exercise the reconnect path.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};

use redimux::Options;

// ---- RESP encoding helpers ---------------------------------------------

pub fn simple(s: &str) -> Vec<u8> {
    format!("+{s}\r\n").into_bytes()
}

pub fn error(s: &str) -> Vec<u8> {
    format!("-{s}\r\n").into_bytes()
}

pub fn int(n: i64) -> Vec<u8> {
    format!(":{n}\r\n").into_bytes()
}

pub fn bulk(data: &[u8]) -> Vec<u8> {
    let mut out = format!("${}\r\n", data.len()).into_bytes();
    out.extend_from_slice(data);
    out.extend_from_slice(b"\r\n");
    out
}

pub fn nil() -> Vec<u8> {
    b"$-1\r\n".to_vec()
}

pub fn null_array() -> Vec<u8> {
    b"*-1\r\n".to_vec()
}

pub fn array(parts: Vec<Vec<u8>>) -> Vec<u8> {
    let mut out = format!("*{}\r\n", parts.len()).into_bytes();
    for part in parts {
        out.extend_from_slice(&part);
    }
    out
}

pub fn message_frame(channel: &[u8], payload: &[u8]) -> Vec<u8> {
    array(vec![bulk(b"message"), bulk(channel), bulk(payload)])
}

// ---- handler plumbing ---------------------------------------------------

pub enum Action {
    Reply(Vec<u8>),
    /// Swallow the command without replying (simulates a stalled server).
    Ignore,
    Close,
}

fn upper(name: &[u8]) -> String {
    String::from_utf8_lossy(name).to_ascii_uppercase()
}

/// Canned responses for everything the client's handshake issues, so test
/// handlers only script the commands they care about.
pub fn default_handshake(args: &[Vec<u8>]) -> Option<Vec<u8>> {
    match upper(&args[0]).as_str() {
        "PING" => Some(simple("PONG")),
        "ECHO" => Some(bulk(&args[1])),
        "AUTH" | "SELECT" => Some(simple("OK")),
        "CLIENT" => match upper(&args[1]).as_str() {
            "ID" => Some(int(7)),
            _ => Some(simple("OK")),
        },
        "INFO" => Some(bulk(
            b"# Replication\r\nrole:master\r\nredis_version:7.2.0\r\n",
        )),
        "CONFIG" => {
            let parameter = args.get(2).cloned().unwrap_or_default();
            let value: &[u8] = if parameter == b"databases" {
                b"16"
            } else {
                b"noeviction"
            };
            Some(array(vec![bulk(&parameter), bulk(value)]))
        }
        "CLUSTER" => Some(error("ERR This instance has cluster support disabled")),
        "SUBSCRIBE" | "PSUBSCRIBE" | "SSUBSCRIBE" => {
            let word = upper(&args[0]).to_ascii_lowercase();
            Some(array(vec![bulk(word.as_bytes()), bulk(&args[1]), int(1)]))
        }
        "UNSUBSCRIBE" | "PUNSUBSCRIBE" | "SUNSUBSCRIBE" => {
            let word = upper(&args[0]).to_ascii_lowercase();
            Some(array(vec![bulk(word.as_bytes()), bulk(&args[1]), int(0)]))
        }
        _ => None,
    }
}

/// Parses one `*N` command array of bulk strings from the front of `buf`.
fn parse_command(buf: &[u8]) -> Option<(Vec<Vec<u8>>, usize)> {
    fn line(buf: &[u8], pos: usize) -> Option<(&[u8], usize)> {
        let at = buf[pos..].windows(2).position(|w| w == b"\r\n")?;
        Some((&buf[pos..pos + at], pos + at + 2))
    }

    if buf.first() != Some(&b'*') {
        panic!(
            "mock server got a non-array frame: {:?}",
            String::from_utf8_lossy(&buf[..buf.len().min(64)])
        );
    }
    let (header, mut pos) = line(buf, 1)?;
    let count: usize = std::str::from_utf8(header).ok()?.parse().ok()?;
    let mut args = Vec::with_capacity(count);
    for _ in 0..count {
        if buf.get(pos) != Some(&b'$') {
            return None;
        }
        let (len_field, next) = line(buf, pos + 1)?;
        let len: usize = std::str::from_utf8(len_field).ok()?.parse().ok()?;
        if buf.len() < next + len + 2 {
            return None;
        }
        args.push(buf[next..next + len].to_vec());
        pos = next + len + 2;
    }
    Some((args, pos))
}

struct ConnHandle {
    out: mpsc::UnboundedSender<Vec<u8>>,
    subscribed: Arc<AtomicBool>,
}

pub struct MockServer {
    pub port: u16,
    conns: Arc<Mutex<Vec<ConnHandle>>>,
    kill: broadcast::Sender<()>,
    /// Every command ever parsed, for assertions about what reached us.
    commands: Arc<Mutex<Vec<Vec<Vec<u8>>>>>,
}

impl MockServer {
    pub async fn start<H>(handler: H) -> MockServer
    where
        H: Fn(&[Vec<u8>]) -> Action + Send + Sync + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let conns: Arc<Mutex<Vec<ConnHandle>>> = Arc::new(Mutex::new(Vec::new()));
        let commands: Arc<Mutex<Vec<Vec<Vec<u8>>>>> = Arc::new(Mutex::new(Vec::new()));
        let (kill, _) = broadcast::channel(16);
        let handler = Arc::new(handler);

        let accept_conns = conns.clone();
        let accept_commands = commands.clone();
        let accept_kill = kill.clone();
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    return;
                };
                let _ = stream.set_nodelay(true);
                let handler = handler.clone();
                let conns = accept_conns.clone();
                let commands = accept_commands.clone();
                let kill_rx = accept_kill.subscribe();
                tokio::spawn(serve(stream, handler, conns, commands, kill_rx));
            }
        });

        MockServer {
            port,
            conns,
            kill,
            commands,
        }
    }

    pub fn config_string(&self) -> String {
        format!("127.0.0.1:{}", self.port)
    }

    /// Base options for tests: short timeouts, fast heartbeat, no
    /// tie-breaker probing.
    pub fn options(&self) -> Options {
        let mut options = Options::parse(&self.config_string()).unwrap();
        tune(&mut options);
        options
    }

    /// Pushes a pub/sub message to every connection in subscriber mode.
    pub fn publish(&self, channel: &[u8], payload: &[u8]) {
        let frame = message_frame(channel, payload);
        let conns = self.conns.lock().unwrap();
        for conn in conns.iter() {
            if conn.subscribed.load(Ordering::Relaxed) {
                let _ = conn.out.send(frame.clone());
            }
        }
    }

    /// Severs every live connection; the listener keeps accepting, so the
    /// client's reconnect will land back here.
    pub fn force_disconnect(&self) {
        let _ = self.kill.send(());
        self.conns.lock().unwrap().clear();
    }

    pub fn count_commands(&self, name: &str) -> usize {
        self.commands
            .lock()
            .unwrap()
            .iter()
            .filter(|args| args[0].eq_ignore_ascii_case(name.as_bytes()))
            .count()
    }

    pub fn saw_command_with_arg(&self, name: &str, arg: &[u8]) -> bool {
        self.commands
            .lock()
            .unwrap()
            .iter()
            .any(|args| args[0].eq_ignore_ascii_case(name.as_bytes()) && args.get(1).is_some_and(|a| a == arg))
    }
}

pub fn tune(options: &mut Options) {
    options.heartbeat_interval = Duration::from_millis(100);
    options.connect_timeout = Duration::from_secs(2);
    options.sync_timeout = Duration::from_secs(2);
    options.async_timeout = Duration::from_secs(2);
    options.tie_breaker = None;
}

async fn serve(
    stream: tokio::net::TcpStream,
    handler: Arc<dyn Fn(&[Vec<u8>]) -> Action + Send + Sync>,
    conns: Arc<Mutex<Vec<ConnHandle>>>,
    commands: Arc<Mutex<Vec<Vec<Vec<u8>>>>>,
    mut kill_rx: broadcast::Receiver<()>,
) {
    let (mut read_half, mut write_half) = stream.into_split();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Vec<u8>>();
    let subscribed = Arc::new(AtomicBool::new(false));
    conns.lock().unwrap().push(ConnHandle {
        out: out_tx.clone(),
        subscribed: subscribed.clone(),
    });

    let mut buf: Vec<u8> = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        tokio::select! {
            outbound = out_rx.recv() => {
                let Some(bytes) = outbound else { return };
                if write_half.write_all(&bytes).await.is_err() {
                    return;
                }
            }
            _ = kill_rx.recv() => {
                return;
            }
            read = read_half.read(&mut chunk) => {
                let n = match read {
                    Ok(0) | Err(_) => return,
                    Ok(n) => n,
                };
                buf.extend_from_slice(&chunk[..n]);
                while let Some((args, used)) = parse_command(&buf) {
                    buf.drain(..used);
                    commands.lock().unwrap().push(args.clone());
                    if matches!(
                        upper(&args[0]).as_str(),
                        "SUBSCRIBE" | "PSUBSCRIBE" | "SSUBSCRIBE"
                    ) {
                        subscribed.store(true, Ordering::Relaxed);
                    }
                    match handler(&args) {
                        Action::Reply(bytes) => {
                            let _ = out_tx.send(bytes);
                        }
                        Action::Ignore => {}
                        Action::Close => return,
                    }
                }
            }
        }
    }
}
