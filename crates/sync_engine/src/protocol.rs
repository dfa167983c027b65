//! Wire protocol
//!
//! ASCII messages, one per frame, each terminated by [`FRAME_TERMINATOR`]:
//!
//! ```text
//! MC:<seq>|<execute_at_us>|<count>|<amp>,<finger>,<freq>,<dur>,<flags>[,<delta_ms>]|...
//! MC_ACK:<seq>
//! PING:<seq>|<t1>
//! PONG:<seq>|<t2>|<t3>[|<t4>]
//! STOP:<seq>
//! PULSE:<finger>|<amplitude>|<duration_ms>|<count>
//! ```
//!
//! Numbers are decimal; timestamps are microseconds of the sender's clock.
//! `flags` bit 0 marks the last event of a macrocycle.

use std::fmt::{self, Write as _};
use std::str::FromStr;

use bytes::{Bytes, BytesMut};
use contracts::{CapacityError, ProtocolError, StagedEvent, MACROCYCLE_MAX_EVENTS};

/// End-of-message sentinel (ASCII EOT)
pub const FRAME_TERMINATOR: u8 = 0x04;

/// Largest frame accepted by [`Framer`], terminator included
pub const MAX_FRAME_LEN: usize = 512;

pub const FLAG_LAST: u8 = 0x01;

/// Sequences further than this behind the last accepted one mean the peer
/// restarted
pub const RESTART_WINDOW: u32 = 64;

/// `a` is strictly newer than `b` under wrapping serial arithmetic
pub fn seq_is_newer(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) > 0
}

/// One event block of a macrocycle
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MacrocycleEvent {
    pub amplitude: u8,
    pub finger: u8,
    pub frequency_hz: u16,
    pub duration_ms: u16,
    /// Offset from the macrocycle base time
    pub delta_ms: u32,
}

/// Batch of at most [`MACROCYCLE_MAX_EVENTS`] events sharing a base time
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Macrocycle {
    pub seq: u32,
    /// Base time in the sender's clock
    pub execute_at_us: u64,
    events: [MacrocycleEvent; MACROCYCLE_MAX_EVENTS],
    len: usize,
}

impl Macrocycle {
    pub fn new(seq: u32, execute_at_us: u64) -> Self {
        Self {
            seq,
            execute_at_us,
            events: [MacrocycleEvent::default(); MACROCYCLE_MAX_EVENTS],
            len: 0,
        }
    }

    /// Append an event; a full batch is left untouched
    pub fn push(&mut self, event: MacrocycleEvent) -> Result<(), CapacityError> {
        if self.len == MACROCYCLE_MAX_EVENTS {
            return Err(CapacityError::full(MACROCYCLE_MAX_EVENTS));
        }
        self.events[self.len] = event;
        self.len += 1;
        Ok(())
    }

    pub fn events(&self) -> &[MacrocycleEvent] {
        &self.events[..self.len]
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Activation time of `event` in the sender's clock, `None` on overflow
    fn activation_at(&self, event: &MacrocycleEvent) -> Option<u64> {
        self.execute_at_us
            .checked_add(u64::from(event.delta_ms).checked_mul(1_000)?)
    }

    /// Staged form of event `index`, still in the sender's time base
    pub fn staged(&self, index: usize) -> Option<StagedEvent> {
        let ev = self.events().get(index)?;
        Some(StagedEvent {
            sequence: self.seq,
            remote_execute_at: self.activation_at(ev)?,
            finger: ev.finger,
            amplitude: ev.amplitude,
            frequency_hz: ev.frequency_hz,
            duration_ms: ev.duration_ms,
            is_first_in_batch: index == 0,
            is_last_in_batch: index + 1 == self.len,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Message {
    Macrocycle(Macrocycle),
    MacrocycleAck { seq: u32 },
    Ping { seq: u32, t1: u64 },
    /// Without `t4` this is the follower's reply; with it, the leader's
    /// completed exchange report
    Pong {
        seq: u32,
        t2: u64,
        t3: u64,
        t4: Option<u64>,
    },
    Stop { seq: u32 },
    Pulse {
        finger: u8,
        amplitude: u8,
        duration_ms: u16,
        count: u8,
    },
}

impl Message {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Macrocycle(_) => "MC",
            Self::MacrocycleAck { .. } => "MC_ACK",
            Self::Ping { .. } => "PING",
            Self::Pong { .. } => "PONG",
            Self::Stop { .. } => "STOP",
            Self::Pulse { .. } => "PULSE",
        }
    }

    /// Serialize, terminator included
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(64);
        // Writing into BytesMut cannot fail
        let _ = write!(buf, "{self}");
        buf.extend_from_slice(&[FRAME_TERMINATOR]);
        buf.freeze()
    }

    /// Parse one frame body (terminator already stripped)
    pub fn parse_frame(frame: &[u8]) -> Result<Self, ProtocolError> {
        let text = std::str::from_utf8(frame).map_err(|_| ProtocolError::NotText)?;
        text.parse()
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Macrocycle(mc) => {
                write!(f, "MC:{}|{}|{}", mc.seq, mc.execute_at_us, mc.len)?;
                for (i, ev) in mc.events().iter().enumerate() {
                    let flags = if i + 1 == mc.len { FLAG_LAST } else { 0 };
                    write!(
                        f,
                        "|{},{},{},{},{}",
                        ev.amplitude, ev.finger, ev.frequency_hz, ev.duration_ms, flags
                    )?;
                    if ev.delta_ms != 0 {
                        write!(f, ",{}", ev.delta_ms)?;
                    }
                }
                Ok(())
            }
            Self::MacrocycleAck { seq } => write!(f, "MC_ACK:{seq}"),
            Self::Ping { seq, t1 } => write!(f, "PING:{seq}|{t1}"),
            Self::Pong { seq, t2, t3, t4 } => {
                write!(f, "PONG:{seq}|{t2}|{t3}")?;
                match t4 {
                    Some(t4) => write!(f, "|{t4}"),
                    None => Ok(()),
                }
            }
            Self::Stop { seq } => write!(f, "STOP:{seq}"),
            Self::Pulse {
                finger,
                amplitude,
                duration_ms,
                count,
            } => write!(f, "PULSE:{finger}|{amplitude}|{duration_ms}|{count}"),
        }
    }
}

/// Ordered field reader for one message
struct Fields<I> {
    kind: &'static str,
    iter: I,
}

impl<'a, I: Iterator<Item = &'a str>> Fields<I> {
    fn new(kind: &'static str, iter: I) -> Self {
        Self { kind, iter }
    }

    fn next<T: FromStr>(&mut self, name: &str) -> Result<T, ProtocolError> {
        let raw = self
            .iter
            .next()
            .ok_or_else(|| ProtocolError::malformed(self.kind, format!("missing {name}")))?;
        raw.trim()
            .parse()
            .map_err(|_| ProtocolError::malformed(self.kind, format!("invalid {name} '{raw}'")))
    }

    fn optional<T: FromStr>(&mut self, name: &str) -> Result<Option<T>, ProtocolError> {
        match self.iter.next() {
            None => Ok(None),
            Some(raw) => raw.trim().parse().map(Some).map_err(|_| {
                ProtocolError::malformed(self.kind, format!("invalid {name} '{raw}'"))
            }),
        }
    }

    fn finish(mut self) -> Result<(), ProtocolError> {
        match self.iter.next() {
            None => Ok(()),
            Some(extra) => Err(ProtocolError::malformed(
                self.kind,
                format!("unexpected field '{extra}'"),
            )),
        }
    }
}

fn parse_event_block(block: &str) -> Result<(MacrocycleEvent, u8), ProtocolError> {
    let mut f = Fields::new("MC", block.split(','));
    let event = MacrocycleEvent {
        amplitude: f.next("amplitude")?,
        finger: f.next("finger")?,
        frequency_hz: f.next("frequency")?,
        duration_ms: f.next("duration")?,
        delta_ms: 0,
    };
    let flags: u8 = f.next("flags")?;
    let delta_ms = f.optional("delta")?.unwrap_or(0);
    f.finish()?;
    Ok((MacrocycleEvent { delta_ms, ..event }, flags))
}

fn parse_macrocycle(body: &str) -> Result<Macrocycle, ProtocolError> {
    let mut parts = body.split('|');
    let mut header = Fields::new("MC", parts.by_ref().take(3));
    let seq = header.next("seq")?;
    let execute_at_us = header.next("execute_at")?;
    let count: usize = header.next("count")?;

    if count > MACROCYCLE_MAX_EVENTS {
        return Err(ProtocolError::TooManyEvents {
            count,
            max: MACROCYCLE_MAX_EVENTS,
        });
    }

    let blocks: Vec<&str> = parts.filter(|b| !b.trim().is_empty()).collect();
    if blocks.len() != count {
        return Err(ProtocolError::CountMismatch {
            declared: count,
            actual: blocks.len(),
        });
    }

    let mut mc = Macrocycle::new(seq, execute_at_us);
    for (i, block) in blocks.iter().enumerate() {
        let (event, flags) = parse_event_block(block)?;
        // Deactivation must stay representable too
        let end = mc
            .activation_at(&event)
            .and_then(|at| at.checked_add(u64::from(event.duration_ms) * 1_000));
        if end.is_none() {
            return Err(ProtocolError::malformed(
                "MC",
                format!("event {i} overflows the timestamp range"),
            ));
        }
        let is_last = i + 1 == count;
        if flags & FLAG_LAST != 0 && !is_last {
            return Err(ProtocolError::malformed(
                "MC",
                format!("event {i} flagged last of {count}"),
            ));
        }
        mc.push(event)
            .map_err(|_| ProtocolError::TooManyEvents {
                count,
                max: MACROCYCLE_MAX_EVENTS,
            })?;
    }
    Ok(mc)
}

impl FromStr for Message {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let text = s.trim();
        let (kind, body) = text
            .split_once(':')
            .ok_or_else(|| ProtocolError::UnknownKind(text.to_string()))?;

        let message = match kind {
            "MC" => Self::Macrocycle(parse_macrocycle(body)?),
            "MC_ACK" => {
                let mut f = Fields::new("MC_ACK", body.split('|'));
                let seq = f.next("seq")?;
                f.finish()?;
                Self::MacrocycleAck { seq }
            }
            "PING" => {
                let mut f = Fields::new("PING", body.split('|'));
                let msg = Self::Ping {
                    seq: f.next("seq")?,
                    t1: f.next("t1")?,
                };
                f.finish()?;
                msg
            }
            "PONG" => {
                let mut f = Fields::new("PONG", body.split('|'));
                let msg = Self::Pong {
                    seq: f.next("seq")?,
                    t2: f.next("t2")?,
                    t3: f.next("t3")?,
                    t4: f.optional("t4")?,
                };
                f.finish()?;
                msg
            }
            "STOP" => {
                let mut f = Fields::new("STOP", body.split('|'));
                let seq = f.next("seq")?;
                f.finish()?;
                Self::Stop { seq }
            }
            "PULSE" => {
                let mut f = Fields::new("PULSE", body.split('|'));
                let finger = f.next("finger")?;
                let amplitude = f.next("amplitude")?;
                let duration_ms = f.next("duration")?;
                let count: u8 = f.next("count")?;
                f.finish()?;
                if !(1..=2).contains(&count) {
                    return Err(ProtocolError::malformed(
                        "PULSE",
                        format!("count {count} not in 1..=2"),
                    ));
                }
                Self::Pulse {
                    finger,
                    amplitude,
                    duration_ms,
                    count,
                }
            }
            other => return Err(ProtocolError::UnknownKind(other.to_string())),
        };
        Ok(message)
    }
}

/// Reassembles frames from an unframed byte stream
///
/// Bytes accumulate until the terminator; an incomplete frame means "wait
/// for more". More than `max_len` bytes without a terminator are discarded.
#[derive(Debug)]
pub struct Framer {
    buf: BytesMut,
    max_len: usize,
    overflows: u64,
}

impl Framer {
    pub fn new(max_len: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(max_len * 2),
            max_len,
            overflows: 0,
        }
    }

    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Next complete message, or `None` to wait for more bytes
    pub fn next_message(&mut self) -> Option<Result<Message, ProtocolError>> {
        match self.buf.iter().position(|&b| b == FRAME_TERMINATOR) {
            Some(end) if end >= self.max_len => {
                let _ = self.buf.split_to(end + 1);
                self.overflows += 1;
                Some(Err(ProtocolError::FrameOverflow { max: self.max_len }))
            }
            Some(end) => {
                let frame = self.buf.split_to(end + 1);
                Some(Message::parse_frame(&frame[..end]))
            }
            None if self.buf.len() > self.max_len => {
                self.buf.clear();
                self.overflows += 1;
                Some(Err(ProtocolError::FrameOverflow { max: self.max_len }))
            }
            None => None,
        }
    }

    /// Bytes waiting for a terminator
    pub fn pending(&self) -> usize {
        self.buf.len()
    }

    pub fn overflows(&self) -> u64 {
        self.overflows
    }

    pub fn reset(&mut self) {
        self.buf.clear();
    }
}

impl Default for Framer {
    fn default() -> Self {
        Self::new(MAX_FRAME_LEN)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(finger: u8, delta_ms: u32) -> MacrocycleEvent {
        MacrocycleEvent {
            amplitude: 80,
            finger,
            frequency_hz: 250,
            duration_ms: 100,
            delta_ms,
        }
    }

    #[test]
    fn test_macrocycle_wire_format() {
        let mut mc = Macrocycle::new(5, 1_000_000);
        mc.push(event(1, 0)).unwrap();
        mc.push(event(2, 167)).unwrap();

        let text = Message::Macrocycle(mc).to_string();
        assert_eq!(text, "MC:5|1000000|2|80,1,250,100,0|80,2,250,100,1,167");
    }

    #[test]
    fn test_full_macrocycle_survives_encode_parse() {
        let mut mc = Macrocycle::new(u32::MAX, u64::MAX / 3);
        for i in 0..12u8 {
            mc.push(MacrocycleEvent {
                amplitude: i * 8,
                finger: i % 4,
                frequency_hz: 150 + u16::from(i),
                duration_ms: 50 + u16::from(i),
                delta_ms: u32::from(i) * 33,
            })
            .unwrap();
        }

        let bytes = Message::Macrocycle(mc).encode();
        assert!(bytes.len() <= MAX_FRAME_LEN);
        assert_eq!(*bytes.last().unwrap(), FRAME_TERMINATOR);

        let parsed = Message::parse_frame(&bytes[..bytes.len() - 1]).unwrap();
        assert_eq!(parsed, Message::Macrocycle(mc));
    }

    #[test]
    fn test_thirteenth_event_rejected() {
        let mut mc = Macrocycle::new(1, 0);
        for i in 0..12 {
            mc.push(event(i % 4, u32::from(i))).unwrap();
        }
        let err = mc.push(event(0, 999)).unwrap_err();
        assert_eq!(err.capacity, 12);
        assert_eq!(mc.len(), 12);
        assert_eq!(mc.events()[11].delta_ms, 11);
    }

    #[test]
    fn test_macrocycle_count_checks() {
        assert_eq!(
            "MC:1|100|2|80,1,250,100,1".parse::<Message>(),
            Err(ProtocolError::CountMismatch {
                declared: 2,
                actual: 1
            })
        );

        let blocks = vec!["50,0,200,100,0"; 13].join("|");
        assert_eq!(
            format!("MC:1|100|13|{blocks}").parse::<Message>(),
            Err(ProtocolError::TooManyEvents { count: 13, max: 12 })
        );
    }

    #[test]
    fn test_macrocycle_timestamp_overflow_rejected() {
        for text in [
            "MC:1|18446744073709551615|1|80,0,250,100,1,1",
            "MC:1|18446744073709551000|1|80,0,250,100,1",
            "MC:1|18446744073000000000|1|80,0,250,100,1,4294967295",
        ] {
            assert!(
                matches!(text.parse::<Message>(), Err(ProtocolError::Malformed { kind: "MC", .. })),
                "accepted {text}"
            );
        }

        // Largest base whose burst still ends in range
        let edge = u64::MAX - 100_000;
        let msg: Message = format!("MC:1|{edge}|1|80,0,250,100,1").parse().unwrap();
        let Message::Macrocycle(mc) = msg else {
            panic!("expected macrocycle");
        };
        assert_eq!(mc.staged(0).unwrap().remote_execute_at, edge);
    }

    #[test]
    fn test_staged_conversion_marks_batch_edges() {
        let msg: Message = "MC:9|2000000|3|80,0,250,100,0|80,1,250,100,0,40|60,2,200,50,1,80"
            .parse()
            .unwrap();
        let Message::Macrocycle(mc) = msg else {
            panic!("expected macrocycle");
        };

        let first = mc.staged(0).unwrap();
        let last = mc.staged(2).unwrap();
        assert!(first.is_first_in_batch && !first.is_last_in_batch);
        assert!(last.is_last_in_batch && !last.is_first_in_batch);
        assert_eq!(last.remote_execute_at, 2_080_000);
        assert_eq!(last.sequence, 9);
        assert!(mc.staged(3).is_none());
    }

    #[test]
    fn test_keepalive_messages() {
        assert_eq!(
            "PING:7|1000".parse::<Message>(),
            Ok(Message::Ping { seq: 7, t1: 1000 })
        );
        assert_eq!(
            "PONG:7|1000|1010|1025".parse::<Message>(),
            Ok(Message::Pong {
                seq: 7,
                t2: 1000,
                t3: 1010,
                t4: Some(1025)
            })
        );
        assert_eq!(
            "PONG:7|1000|1010\r\n".parse::<Message>(),
            Ok(Message::Pong {
                seq: 7,
                t2: 1000,
                t3: 1010,
                t4: None
            })
        );
    }

    #[test]
    fn test_malformed_messages() {
        assert!(matches!(
            "PING:7".parse::<Message>(),
            Err(ProtocolError::Malformed { kind: "PING", .. })
        ));
        assert!(matches!(
            "PING:x|1".parse::<Message>(),
            Err(ProtocolError::Malformed { kind: "PING", .. })
        ));
        assert!(matches!(
            "STOP:1|2".parse::<Message>(),
            Err(ProtocolError::Malformed { kind: "STOP", .. })
        ));
        assert!(matches!(
            "PULSE:0|50|100|3".parse::<Message>(),
            Err(ProtocolError::Malformed { kind: "PULSE", .. })
        ));
        assert_eq!(
            "HELLO:1".parse::<Message>(),
            Err(ProtocolError::UnknownKind("HELLO".into()))
        );
        assert_eq!(
            Message::parse_frame(&[0xff, 0xfe]),
            Err(ProtocolError::NotText)
        );
    }

    #[test]
    fn test_framer_waits_for_terminator() {
        let mut framer = Framer::default();
        framer.push(b"PING:3|12");
        assert!(framer.next_message().is_none());
        assert_eq!(framer.pending(), 9);

        framer.push(b"34\x04MC_ACK:2\x04STO");
        assert_eq!(
            framer.next_message(),
            Some(Ok(Message::Ping { seq: 3, t1: 1234 }))
        );
        assert_eq!(
            framer.next_message(),
            Some(Ok(Message::MacrocycleAck { seq: 2 }))
        );
        assert!(framer.next_message().is_none());

        framer.push(b"P:4\x04");
        assert_eq!(framer.next_message(), Some(Ok(Message::Stop { seq: 4 })));
    }

    #[test]
    fn test_framer_recovers_after_garbage() {
        let mut framer = Framer::new(32);
        framer.push(&[b'x'; 40]);
        assert_eq!(
            framer.next_message(),
            Some(Err(ProtocolError::FrameOverflow { max: 32 }))
        );
        assert_eq!(framer.overflows(), 1);

        framer.push(b"junk\x04PING:1|1\x04");
        assert!(matches!(framer.next_message(), Some(Err(_))));
        assert_eq!(
            framer.next_message(),
            Some(Ok(Message::Ping { seq: 1, t1: 1 }))
        );
    }

    #[test]
    fn test_sequence_wraparound() {
        assert!(seq_is_newer(1, 0));
        assert!(seq_is_newer(0, u32::MAX));
        assert!(!seq_is_newer(5, 5));
        assert!(!seq_is_newer(u32::MAX, 2));
    }
}
