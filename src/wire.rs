//! Wire envelope, opcodes, and dispatch event vocabulary.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Gateway opcodes carried in the envelope's `op` field.
///
/// `Serialize`/`Deserialize` are implemented by hand in `mod repr` below
/// (as a bare integer), since pulling in `serde_repr` for one enum isn't
/// worth the extra dependency.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum Opcode {
    Dispatch = 0,
    Heartbeat = 1,
    Identify = 2,
    PresenceUpdate = 3,
    VoiceStateUpdate = 4,
    Resume = 6,
    Reconnect = 7,
    RequestGuildMembers = 8,
    InvalidSession = 9,
    Hello = 10,
    HeartbeatAck = 11,
}

/// The wire envelope: `{ op, t, s, d }`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub op: Opcode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub t: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub s: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub d: Option<Value>,
}

impl Envelope {
    pub fn hello(heartbeat_interval_ms: u64) -> Self {
        Self {
            op: Opcode::Hello,
            t: None,
            s: None,
            d: Some(serde_json::json!({ "heartbeat_interval": heartbeat_interval_ms })),
        }
    }

    pub fn heartbeat_ack() -> Self {
        Self {
            op: Opcode::HeartbeatAck,
            t: None,
            s: None,
            d: None,
        }
    }

    pub fn reconnect(reason: &str) -> Self {
        Self {
            op: Opcode::Reconnect,
            t: None,
            s: None,
            d: Some(serde_json::json!({ "reason": reason })),
        }
    }

    pub fn invalid_session(resumable: bool) -> Self {
        Self {
            op: Opcode::InvalidSession,
            t: None,
            s: None,
            d: Some(serde_json::json!({ "resumable": resumable })),
        }
    }

    /// An error event sent in place of a state transition when the client
    /// sends an opcode that isn't valid for its current state — the
    /// connection stays open.
    pub fn error(message: &str) -> Self {
        Self {
            op: Opcode::Dispatch,
            t: Some(DispatchType::Error.as_str().to_string()),
            s: None,
            d: Some(serde_json::json!({ "message": message })),
        }
    }

    pub fn dispatch(seq: i64, event_type: DispatchType, payload: Value) -> Self {
        Self {
            op: Opcode::Dispatch,
            t: Some(event_type.as_str().to_string()),
            s: Some(seq),
            d: Some(payload),
        }
    }

    /// Like [`Envelope::dispatch`], but for callers (the event bridge) that
    /// only have the event type as the string already stamped by
    /// [`DispatchType::as_str`] — avoids a string round-trip through the
    /// enum just to get back what it started as.
    pub fn dispatch_str(seq: i64, event_type: &str, payload: Value) -> Self {
        Self {
            op: Opcode::Dispatch,
            t: Some(event_type.to_string()),
            s: Some(seq),
            d: Some(payload),
        }
    }

    /// Encode once for handoff to a send queue, which only ever moves
    /// opaque `Value`s so it never needs to know about `Envelope` itself.
    pub fn to_json(&self) -> Value {
        serde_json::to_value(self).expect("Envelope serializes infallibly")
    }
}

/// A dispatch event queued on a connection's send queue before a sequence
/// number has been assigned. The hub's fan-out only ever moves opaque
/// `Value`s, so this is encoded as `{"t": ..., "d": ...}` and decoded again
/// by the writer loop, which is the only place that knows the connection's
/// current sequence counter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboundEvent {
    pub t: String,
    pub d: Value,
}

impl OutboundEvent {
    pub fn new(event_type: DispatchType, payload: Value) -> Self {
        Self {
            t: event_type.as_str().to_string(),
            d: payload,
        }
    }

    pub fn to_json(&self) -> Value {
        serde_json::to_value(self).expect("OutboundEvent serializes infallibly")
    }

    pub fn from_json(value: Value) -> Option<Self> {
        serde_json::from_value(value).ok()
    }
}

/// A signal telling the writer loop to send a transport close frame and
/// stop, rather than an envelope to serialize and write as-is. Carries the
/// resolved numeric code and reason instead of a `CloseCode` so it survives
/// a round trip through the send queue's plain `Value` payloads.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloseSignal {
    pub code: u16,
    pub reason: String,
}

impl CloseSignal {
    pub fn new(code: CloseCode) -> Self {
        Self {
            code: code.code(),
            reason: code.reason().to_string(),
        }
    }
}

/// What a connection's send queue actually carries: a dispatch event still
/// waiting for a sequence number (the common case — hub fan-out and the
/// event bridge only ever produce this), a fully-formed control envelope
/// that must go out exactly as built (the drain manager's `RECONNECT`
/// broadcast, which has no sequence number at all), or a close signal that
/// isn't an envelope at all.
///
/// `#[serde(untagged)]` disambiguates structurally: a `Control` envelope
/// always carries `op`, a `Close` signal always carries `code`/`reason` and
/// never `op` or `t`/`d`, and an `Event` carries `t`/`d` and neither of the
/// others — no field ordering tricks needed.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum QueuedFrame {
    Control(Envelope),
    Close(CloseSignal),
    Event(OutboundEvent),
}

impl QueuedFrame {
    pub fn from_json(value: Value) -> Option<Self> {
        serde_json::from_value(value).ok()
    }

    pub fn to_json(&self) -> Value {
        serde_json::to_value(self).expect("QueuedFrame serializes infallibly")
    }
}

/// Parsed payload of an inbound Identify frame.
#[derive(Debug, Deserialize)]
pub struct IdentifyData {
    pub token: String,
    #[serde(default)]
    pub client_type: Option<String>,
}

/// Parsed payload of an inbound Resume frame.
#[derive(Debug, Deserialize)]
pub struct ResumeData {
    pub token: String,
    pub resume_key: String,
    #[serde(default)]
    pub seq: i64,
}

/// Parsed payload of an inbound Heartbeat frame.
#[derive(Debug, Deserialize, Default)]
pub struct HeartbeatData {
    #[serde(default)]
    pub seq: Option<i64>,
}

/// Parsed payload of an inbound `SUBSCRIBE`/`UNSUBSCRIBE` dispatch. Exactly
/// one of `channel_id`/`server_id` is expected to be set; both absent is
/// treated as an invalid id and ignored.
#[derive(Debug, Deserialize, Default)]
pub struct SubscribePayload {
    #[serde(default)]
    pub channel_id: Option<String>,
    #[serde(default)]
    pub server_id: Option<String>,
}

/// Dispatch event type vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchType {
    Ready,
    Resumed,
    Error,
    MessageCreate,
    MessageUpdate,
    MessageDelete,
    MessageDeleteBulk,
    MessageReactionAdd,
    MessageReactionRemove,
    MessageReactionRemoveAll,
    TypingStart,
    ChannelCreate,
    ChannelUpdate,
    ChannelDelete,
    ChannelPinsUpdate,
    GuildCreate,
    GuildUpdate,
    GuildDelete,
    GuildMemberAdd,
    GuildMemberUpdate,
    GuildMemberRemove,
    GuildMembersChunk,
    GuildBanAdd,
    GuildBanRemove,
    PresenceUpdate,
    VoiceStateUpdate,
    UserUpdate,
}

impl DispatchType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ready => "READY",
            Self::Resumed => "RESUMED",
            Self::Error => "ERROR",
            Self::MessageCreate => "MESSAGE_CREATE",
            Self::MessageUpdate => "MESSAGE_UPDATE",
            Self::MessageDelete => "MESSAGE_DELETE",
            Self::MessageDeleteBulk => "MESSAGE_DELETE_BULK",
            Self::MessageReactionAdd => "MESSAGE_REACTION_ADD",
            Self::MessageReactionRemove => "MESSAGE_REACTION_REMOVE",
            Self::MessageReactionRemoveAll => "MESSAGE_REACTION_REMOVE_ALL",
            Self::TypingStart => "TYPING_START",
            Self::ChannelCreate => "CHANNEL_CREATE",
            Self::ChannelUpdate => "CHANNEL_UPDATE",
            Self::ChannelDelete => "CHANNEL_DELETE",
            Self::ChannelPinsUpdate => "CHANNEL_PINS_UPDATE",
            Self::GuildCreate => "GUILD_CREATE",
            Self::GuildUpdate => "GUILD_UPDATE",
            Self::GuildDelete => "GUILD_DELETE",
            Self::GuildMemberAdd => "GUILD_MEMBER_ADD",
            Self::GuildMemberUpdate => "GUILD_MEMBER_UPDATE",
            Self::GuildMemberRemove => "GUILD_MEMBER_REMOVE",
            Self::GuildMembersChunk => "GUILD_MEMBERS_CHUNK",
            Self::GuildBanAdd => "GUILD_BAN_ADD",
            Self::GuildBanRemove => "GUILD_BAN_REMOVE",
            Self::PresenceUpdate => "PRESENCE_UPDATE",
            Self::VoiceStateUpdate => "VOICE_STATE_UPDATE",
            Self::UserUpdate => "USER_UPDATE",
        }
    }
}

/// Target topic class a dispatch event is routed at.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Topic {
    Channel(String),
    Server(String),
    User(String),
}

/// Close codes used on the WebSocket transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseCode {
    AuthenticationFailed,
    InvalidSession,
    SessionTimedOut,
    GoingAway,
    ServiceRestart,
}

impl CloseCode {
    pub fn code(&self) -> u16 {
        match self {
            Self::AuthenticationFailed => 4001,
            Self::InvalidSession => 4006,
            Self::SessionTimedOut => 4009,
            Self::GoingAway => 1001,
            Self::ServiceRestart => 1012,
        }
    }

    pub fn reason(&self) -> &'static str {
        match self {
            Self::AuthenticationFailed => "authentication failed",
            Self::InvalidSession => "invalid session",
            Self::SessionTimedOut => "session timed out",
            Self::GoingAway => "server going away",
            Self::ServiceRestart => "service restart",
        }
    }
}

// `serde_repr`-style int (de)serialization for `Opcode`, hand-rolled since
// we don't otherwise need the `serde_repr` crate.
mod repr {
    use super::Opcode;
    use serde::de::{self, Deserializer, Unexpected};
    use serde::ser::Serializer;
    use serde::{Deserialize, Serialize};

    impl Serialize for Opcode {
        fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
            serializer.serialize_i32(*self as i32)
        }
    }

    impl<'de> Deserialize<'de> for Opcode {
        fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
            let v = i32::deserialize(deserializer)?;
            Opcode::from_i32(v).ok_or_else(|| {
                de::Error::invalid_value(Unexpected::Signed(v as i64), &"a known opcode")
            })
        }
    }

    impl Opcode {
        fn from_i32(v: i32) -> Option<Self> {
            Some(match v {
                0 => Self::Dispatch,
                1 => Self::Heartbeat,
                2 => Self::Identify,
                3 => Self::PresenceUpdate,
                4 => Self::VoiceStateUpdate,
                6 => Self::Resume,
                7 => Self::Reconnect,
                8 => Self::RequestGuildMembers,
                9 => Self::InvalidSession,
                10 => Self::Hello,
                11 => Self::HeartbeatAck,
                _ => return None,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_roundtrips_through_json() {
        let env = Envelope::dispatch(1, DispatchType::Ready, serde_json::json!({"v": 10}));
        let json = serde_json::to_string(&env).unwrap();
        let back: Envelope = serde_json::from_str(&json).unwrap();
        assert_eq!(back.op, Opcode::Dispatch);
        assert_eq!(back.t.as_deref(), Some("READY"));
        assert_eq!(back.s, Some(1));
    }

    #[test]
    fn opcode_rejects_unknown_values() {
        let err = serde_json::from_str::<Opcode>("99");
        assert!(err.is_err());
    }

    #[test]
    fn outbound_event_roundtrips_and_carries_no_sequence() {
        let ev = OutboundEvent::new(DispatchType::MessageCreate, serde_json::json!({"id": "m1"}));
        let json = ev.to_json();
        assert!(json.get("s").is_none());
        let back = OutboundEvent::from_json(json).unwrap();
        assert_eq!(back.t, "MESSAGE_CREATE");
    }

    #[test]
    fn queued_frame_distinguishes_control_envelopes_from_events() {
        let control = QueuedFrame::from_json(Envelope::reconnect("bye").to_json()).unwrap();
        assert!(matches!(control, QueuedFrame::Control(e) if e.op == Opcode::Reconnect));

        let event = OutboundEvent::new(DispatchType::MessageCreate, serde_json::json!({"id": "m1"}));
        let queued = QueuedFrame::from_json(event.to_json()).unwrap();
        assert!(matches!(queued, QueuedFrame::Event(e) if e.t == "MESSAGE_CREATE"));

        let close = QueuedFrame::from_json(QueuedFrame::Close(CloseSignal::new(CloseCode::GoingAway)).to_json()).unwrap();
        assert!(matches!(close, QueuedFrame::Close(s) if s.code == 1001));
    }

    #[test]
    fn close_codes_have_expected_values() {
        assert_eq!(CloseCode::AuthenticationFailed.code(), 4001);
        assert_eq!(CloseCode::InvalidSession.code(), 4006);
        assert_eq!(CloseCode::SessionTimedOut.code(), 4009);
        assert_eq!(CloseCode::GoingAway.code(), 1001);
        assert_eq!(CloseCode::ServiceRestart.code(), 1012);
    }
}
