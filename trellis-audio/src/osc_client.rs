//! UDP OSC connection to a SuperCollider-compatible server.
//!
//! Outgoing packets are encoded with `rosc` and sent from the caller's
//! thread. A receive thread decodes replies and forwards the ones the core
//! waits on (`/status.reply`, `/g_queryTree.reply`, `/done`, `/fail`) over a
//! channel.

use std::net::UdpSocket;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use rosc::{OscBundle, OscMessage, OscPacket, OscTime, OscType};
use trellis_types::{BackendStatus, ServerNode};

use crate::backend::{BackendError, BackendResult};

/// Seconds between the NTP epoch (1900) and the Unix epoch (1970).
const NTP_UNIX_OFFSET: u64 = 2_208_988_800;

/// Replies forwarded from the receive thread.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerReply {
    Status(BackendStatus),
    Tree(ServerNode),
    Done(String),
    Fail { command: String, error: String },
}

pub struct OscClient {
    socket: UdpSocket,
    server_addr: String,
    replies: Receiver<ServerReply>,
    reply_timeout: Duration,
    shutdown: Arc<AtomicBool>,
    recv_thread: Option<JoinHandle<()>>,
}

fn float_arg(args: &[OscType], index: usize) -> f32 {
    match args.get(index) {
        Some(OscType::Float(v)) => *v,
        Some(OscType::Int(v)) => *v as f32,
        Some(OscType::Double(v)) => *v as f32,
        _ => 0.0,
    }
}

fn int_arg(args: &[OscType], index: usize) -> Option<i32> {
    match args.get(index) {
        Some(OscType::Int(v)) => Some(*v),
        Some(OscType::Float(v)) => Some(*v as i32),
        _ => None,
    }
}

/// Parse `/status.reply`: [unused, ugens, synths, groups, synthdefs, avg_cpu, peak_cpu, ...]
pub fn parse_status_reply(args: &[OscType]) -> Option<BackendStatus> {
    if args.len() < 7 {
        return None;
    }
    Some(BackendStatus {
        ugens: int_arg(args, 1)?,
        synths: int_arg(args, 2)?,
        groups: int_arg(args, 3)?,
        synthdefs: int_arg(args, 4)?,
        average_cpu: float_arg(args, 5),
        peak_cpu: float_arg(args, 6),
    })
}

/// Parse `/g_queryTree.reply`.
///
/// Layout: flag, then depth-first nodes as `id, child_count` where a child
/// count of -1 marks a synth followed by its def name and, when the flag is
/// set, `control_count` name/value pairs.
pub fn parse_query_tree_reply(args: &[OscType]) -> Option<ServerNode> {
    let with_controls = int_arg(args, 0)? != 0;
    let mut cursor = 1;
    parse_tree_node(args, &mut cursor, with_controls)
}

fn parse_tree_node(args: &[OscType], cursor: &mut usize, with_controls: bool) -> Option<ServerNode> {
    let id = int_arg(args, *cursor)?;
    let child_count = int_arg(args, *cursor + 1)?;
    *cursor += 2;
    if child_count < 0 {
        let def = match args.get(*cursor) {
            Some(OscType::String(s)) => s.clone(),
            _ => return None,
        };
        *cursor += 1;
        let mut controls = Vec::new();
        if with_controls {
            let count = int_arg(args, *cursor)?;
            *cursor += 1;
            for _ in 0..count {
                let name = match args.get(*cursor) {
                    Some(OscType::String(s)) => s.clone(),
                    Some(OscType::Int(i)) => i.to_string(),
                    _ => return None,
                };
                controls.push((name, float_arg(args, *cursor + 1)));
                *cursor += 2;
            }
        }
        return Some(ServerNode::Synth { id, def, controls });
    }
    let mut children = Vec::with_capacity(child_count as usize);
    for _ in 0..child_count {
        children.push(parse_tree_node(args, cursor, with_controls)?);
    }
    Some(ServerNode::Group { id, children })
}

fn handle_osc_packet(packet: &OscPacket, replies: &Sender<ServerReply>) {
    match packet {
        OscPacket::Message(msg) => {
            let reply = match msg.addr.as_str() {
                "/status.reply" => parse_status_reply(&msg.args).map(ServerReply::Status),
                "/g_queryTree.reply" => parse_query_tree_reply(&msg.args).map(ServerReply::Tree),
                "/done" => match msg.args.first() {
                    Some(OscType::String(cmd)) => Some(ServerReply::Done(cmd.clone())),
                    _ => None,
                },
                "/fail" => {
                    let command = match msg.args.first() {
                        Some(OscType::String(s)) => s.clone(),
                        _ => String::new(),
                    };
                    let error = match msg.args.get(1) {
                        Some(OscType::String(s)) => s.clone(),
                        _ => String::new(),
                    };
                    log::warn!(target: "audio::osc", "server reported failure: {} {}", command, error);
                    Some(ServerReply::Fail { command, error })
                }
                _ => None,
            };
            if let Some(reply) = reply {
                let _ = replies.send(reply);
            }
        }
        OscPacket::Bundle(bundle) => {
            for p in &bundle.content {
                handle_osc_packet(p, replies);
            }
        }
    }
}

impl OscClient {
    pub fn new(server_addr: &str, reply_timeout: Duration) -> std::io::Result<Self> {
        let socket = UdpSocket::bind("0.0.0.0:0")?;
        let (tx, rx) = crossbeam_channel::unbounded();
        let shutdown = Arc::new(AtomicBool::new(false));

        // Clone socket for receive thread
        let recv_socket = socket.try_clone()?;
        recv_socket.set_read_timeout(Some(Duration::from_millis(50)))?;
        let stop = Arc::clone(&shutdown);

        let handle = thread::spawn(move || {
            let mut buf = [0u8; 65_536];
            while !stop.load(Ordering::Relaxed) {
                match recv_socket.recv(&mut buf) {
                    Ok(n) => {
                        if let Ok((_, packet)) = rosc::decoder::decode_udp(&buf[..n]) {
                            handle_osc_packet(&packet, &tx);
                        }
                    }
                    Err(ref e)
                        if e.kind() == std::io::ErrorKind::WouldBlock
                            || e.kind() == std::io::ErrorKind::TimedOut =>
                    {
                        continue
                    }
                    Err(_) => break,
                }
            }
        });

        Ok(Self {
            socket,
            server_addr: server_addr.to_string(),
            replies: rx,
            reply_timeout,
            shutdown,
            recv_thread: Some(handle),
        })
    }

    pub fn send_message(&self, addr: &str, args: Vec<OscType>) -> std::io::Result<()> {
        let msg = OscPacket::Message(OscMessage {
            addr: addr.to_string(),
            args,
        });
        self.send_packet(&msg)
    }

    pub fn send_bundle(&self, messages: Vec<OscMessage>, time: OscTime) -> std::io::Result<()> {
        let bundle = OscPacket::Bundle(OscBundle {
            timetag: time,
            content: messages.into_iter().map(OscPacket::Message).collect(),
        });
        self.send_packet(&bundle)
    }

    fn send_packet(&self, packet: &OscPacket) -> std::io::Result<()> {
        let buf = rosc::encoder::encode(packet)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string()))?;
        self.socket.send_to(&buf, &self.server_addr)?;
        Ok(())
    }

    /// Register for server notifications. Fails if the server does not answer.
    pub fn notify(&self) -> BackendResult {
        self.drain();
        self.send_message("/notify", vec![OscType::Int(1)])?;
        self.wait_for(|reply| match reply {
            ServerReply::Done(cmd) if cmd == "/notify" => Some(()),
            ServerReply::Fail { command, .. } if command == "/notify" => Some(()),
            _ => None,
        })
    }

    pub fn query_status(&self) -> BackendResult<BackendStatus> {
        self.drain();
        self.send_message("/status", vec![])?;
        self.wait_for(|reply| match reply {
            ServerReply::Status(status) => Some(*status),
            _ => None,
        })
    }

    pub fn query_tree(&self) -> BackendResult<ServerNode> {
        self.drain();
        self.send_message("/g_queryTree", vec![OscType::Int(0), OscType::Int(1)])?;
        self.wait_for(|reply| match reply {
            ServerReply::Tree(tree) => Some(tree.clone()),
            _ => None,
        })
    }

    fn drain(&self) {
        while self.replies.try_recv().is_ok() {}
    }

    fn wait_for<T>(&self, mut matcher: impl FnMut(&ServerReply) -> Option<T>) -> BackendResult<T> {
        let deadline = Instant::now() + self.reply_timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.replies.recv_timeout(remaining) {
                Ok(reply) => {
                    if let Some(value) = matcher(&reply) {
                        return Ok(value);
                    }
                }
                Err(RecvTimeoutError::Timeout) => {
                    return Err(BackendError(format!(
                        "no reply from {} within {:?}",
                        self.server_addr, self.reply_timeout
                    )))
                }
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(BackendError("reply channel closed".to_string()))
                }
            }
        }
    }

    pub fn server_addr(&self) -> &str {
        &self.server_addr
    }
}

impl Drop for OscClient {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        if let Some(handle) = self.recv_thread.take() {
            let _ = handle.join();
        }
    }
}

/// Timetag for "now + offset" seconds.
pub fn osc_time_from_now(offset_secs: f64) -> OscTime {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        + Duration::from_secs_f64(offset_secs.max(0.0));
    let seconds = (now.as_secs() + NTP_UNIX_OFFSET) as u32;
    let fractional = ((now.subsec_nanos() as u64) << 32) / 1_000_000_000;
    OscTime {
        seconds,
        fractional: fractional as u32,
    }
}

/// The special "execute immediately" timetag.
pub fn osc_time_immediate() -> OscTime {
    OscTime {
        seconds: 0,
        fractional: 1,
    }
}
