//! Event Bridge: translates domain events from the rest of the platform
//! into wire dispatch events and the topic(s) they fan out to.
//!
//! The domain event shape here is a tagged enum describing what happened,
//! independent of how it gets encoded on the wire.

use std::sync::Arc;

use chrono::SecondsFormat;
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::warn;

use crate::distributed::DistributedHub;
use crate::hub::Target;
use crate::wire::{DispatchType, OutboundEvent};

/// Everything the rest of the platform can tell the gateway happened. Each
/// variant carries just enough identity to route it; the event body itself
/// is left as an opaque `Value` and forwarded unchanged — the bridge does
/// not reshape domain payloads beyond timestamp normalization.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DomainEvent {
    MessageCreated { channel_id: String, message: Value },
    MessageUpdated { channel_id: String, message: Value },
    MessageDeleted { channel_id: String, message_id: String },
    MessageDeleteBulk { channel_id: String, message_ids: Vec<String> },
    ReactionAdded { channel_id: String, message_id: String, reaction: Value },
    ReactionRemoved { channel_id: String, message_id: String, reaction: Value },
    ReactionsCleared { channel_id: String, message_id: String },
    TypingStarted { channel_id: String, user_id: String },
    ChannelCreated { server_id: Option<String>, channel: Value },
    ChannelUpdated { server_id: Option<String>, channel: Value },
    ChannelDeleted { server_id: Option<String>, channel_id: String },
    ChannelPinsUpdated { channel_id: String, last_pin_timestamp: Option<String> },
    ServerCreated { server_id: String, server: Value },
    ServerUpdated { server_id: String, server: Value },
    ServerDeleted { server_id: String },
    MemberJoined { server_id: String, member: Value },
    MemberUpdated { server_id: String, member: Value },
    MemberLeft { server_id: String, user_id: String },
    MemberKicked { server_id: String, user_id: String },
    MembersChunk { server_id: String, members: Vec<Value> },
    MemberBanned { server_id: String, user_id: String, reason: Option<String> },
    MemberUnbanned { server_id: String, user_id: String },
    /// Fans out to every server the user is a member of, not a single topic.
    PresenceUpdated { user_id: String, server_ids: Vec<String>, presence: Value },
    VoiceStateUpdated { server_id: String, user_id: String, state: Value },
    UserUpdated { user_id: String, user: Value },
}

/// One wire-ready dispatch: which topic it fans out on, its event type, and
/// its (already-normalized) payload.
pub struct RoutedEvent {
    pub target: Target,
    pub dispatch_type: DispatchType,
    pub payload: Value,
}

/// Parse a raw domain event and expand it into the dispatch(es) it produces.
/// A malformed or unrecognized event is logged and dropped rather than
/// propagated — one bad upstream message must never take the bridge down.
pub fn bridge(raw: Value) -> Vec<RoutedEvent> {
    match serde_json::from_value::<DomainEvent>(raw) {
        Ok(event) => route(event),
        Err(e) => {
            warn!(error = %e, "dropping domain event with unrecognized shape");
            Vec::new()
        }
    }
}

fn route(event: DomainEvent) -> Vec<RoutedEvent> {
    use DomainEvent::*;

    let single = |target: Target, dispatch_type: DispatchType, mut payload: Value| {
        normalize_timestamps(&mut payload);
        normalize_ids(&mut payload);
        vec![RoutedEvent { target, dispatch_type, payload }]
    };

    match event {
        MessageCreated { channel_id, message } => {
            single(Target::Channel(channel_id), DispatchType::MessageCreate, message)
        }
        MessageUpdated { channel_id, message } => {
            single(Target::Channel(channel_id), DispatchType::MessageUpdate, message)
        }
        MessageDeleted { channel_id, message_id } => single(
            Target::Channel(channel_id.clone()),
            DispatchType::MessageDelete,
            serde_json::json!({ "channel_id": channel_id, "id": message_id }),
        ),
        MessageDeleteBulk { channel_id, message_ids } => single(
            Target::Channel(channel_id.clone()),
            DispatchType::MessageDeleteBulk,
            serde_json::json!({ "channel_id": channel_id, "ids": message_ids }),
        ),
        ReactionAdded { channel_id, message_id, reaction } => single(
            Target::Channel(channel_id.clone()),
            DispatchType::MessageReactionAdd,
            merge_ids(reaction, &channel_id, &message_id),
        ),
        ReactionRemoved { channel_id, message_id, reaction } => single(
            Target::Channel(channel_id.clone()),
            DispatchType::MessageReactionRemove,
            merge_ids(reaction, &channel_id, &message_id),
        ),
        ReactionsCleared { channel_id, message_id } => single(
            Target::Channel(channel_id.clone()),
            DispatchType::MessageReactionRemoveAll,
            serde_json::json!({ "channel_id": channel_id, "message_id": message_id }),
        ),
        TypingStarted { channel_id, user_id } => single(
            Target::Channel(channel_id.clone()),
            DispatchType::TypingStart,
            serde_json::json!({ "channel_id": channel_id, "user_id": user_id }),
        ),
        ChannelCreated { server_id, channel } => {
            single(channel_target(server_id, &channel), DispatchType::ChannelCreate, channel)
        }
        ChannelUpdated { server_id, channel } => {
            single(channel_target(server_id, &channel), DispatchType::ChannelUpdate, channel)
        }
        ChannelDeleted { server_id, channel_id } => single(
            server_id.map(Target::Server).unwrap_or(Target::Channel(channel_id.clone())),
            DispatchType::ChannelDelete,
            serde_json::json!({ "id": channel_id }),
        ),
        ChannelPinsUpdated { channel_id, last_pin_timestamp } => single(
            Target::Channel(channel_id.clone()),
            DispatchType::ChannelPinsUpdate,
            serde_json::json!({ "channel_id": channel_id, "last_pin_timestamp": last_pin_timestamp }),
        ),
        ServerCreated { server_id, server } => {
            single(Target::Server(server_id), DispatchType::GuildCreate, server)
        }
        ServerUpdated { server_id, server } => {
            single(Target::Server(server_id), DispatchType::GuildUpdate, server)
        }
        ServerDeleted { server_id } => single(
            Target::Server(server_id.clone()),
            DispatchType::GuildDelete,
            serde_json::json!({ "id": server_id }),
        ),
        MemberJoined { server_id, member } => {
            single(Target::Server(server_id), DispatchType::GuildMemberAdd, member)
        }
        MemberUpdated { server_id, member } => {
            single(Target::Server(server_id), DispatchType::GuildMemberUpdate, member)
        }
        MemberLeft { server_id, user_id } | MemberKicked { server_id, user_id } => single(
            Target::Server(server_id.clone()),
            DispatchType::GuildMemberRemove,
            serde_json::json!({ "server_id": server_id, "user_id": user_id }),
        ),
        MembersChunk { server_id, members } => single(
            Target::Server(server_id.clone()),
            DispatchType::GuildMembersChunk,
            serde_json::json!({ "server_id": server_id, "members": members }),
        ),
        MemberBanned { server_id, user_id, reason } => single(
            Target::Server(server_id.clone()),
            DispatchType::GuildBanAdd,
            serde_json::json!({ "server_id": server_id, "user_id": user_id, "reason": reason }),
        ),
        MemberUnbanned { server_id, user_id } => single(
            Target::Server(server_id.clone()),
            DispatchType::GuildBanRemove,
            serde_json::json!({ "server_id": server_id, "user_id": user_id }),
        ),
        PresenceUpdated { user_id, server_ids, presence } => server_ids
            .into_iter()
            .map(|server_id| {
                let mut payload = presence.clone();
                normalize_timestamps(&mut payload);
                normalize_ids(&mut payload);
                if let Value::Object(ref mut map) = payload {
                    map.insert("user_id".to_string(), Value::String(user_id.clone()));
                }
                RoutedEvent {
                    target: Target::Server(server_id),
                    dispatch_type: DispatchType::PresenceUpdate,
                    payload,
                }
            })
            .collect(),
        VoiceStateUpdated { server_id, user_id, state } => single(
            Target::Server(server_id),
            DispatchType::VoiceStateUpdate,
            merge_ids(state, "", &user_id),
        ),
        UserUpdated { user_id, user } => {
            single(Target::User(user_id), DispatchType::UserUpdate, user)
        }
    }
}

/// Spawn the task that drains the domain event bus into hub fan-out. The
/// bus itself is an external collaborator the gateway subscribes to — this
/// only owns the translation and delivery once a raw event value arrives
/// on `inbound_rx`.
pub fn spawn_pump(hub: Arc<DistributedHub>, mut inbound_rx: mpsc::UnboundedReceiver<Value>) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(raw) = inbound_rx.recv().await {
            for routed in bridge(raw) {
                let event = OutboundEvent::new(routed.dispatch_type, routed.payload).to_json();
                match routed.target {
                    Target::Channel(id) => {
                        hub.send_to_channel(&id, event).await;
                    }
                    Target::Server(id) => {
                        hub.send_to_server(&id, event).await;
                    }
                    Target::User(id) => {
                        hub.send_to_user(&id, event).await;
                    }
                }
            }
        }
    })
}

fn channel_target(server_id: Option<String>, channel: &Value) -> Target {
    match server_id {
        Some(id) => Target::Server(id),
        None => {
            let channel_id = channel.get("id").and_then(Value::as_str).unwrap_or_default();
            Target::Channel(channel_id.to_string())
        }
    }
}

fn merge_ids(mut payload: Value, channel_id: &str, entity_id: &str) -> Value {
    if let Value::Object(ref mut map) = payload {
        if !channel_id.is_empty() {
            map.entry("channel_id").or_insert_with(|| Value::String(channel_id.to_string()));
        }
        map.entry("id").or_insert_with(|| Value::String(entity_id.to_string()));
    }
    payload
}

/// Normalize any top-level RFC3339 timestamp field to an RFC3339 string with
/// fixed millisecond precision. Fields that aren't parseable timestamps are
/// left untouched.
fn normalize_timestamps(payload: &mut Value) {
    let Value::Object(map) = payload else { return };
    for (key, value) in map.iter_mut() {
        if !(key.ends_with("_at") || key == "timestamp") {
            continue;
        }
        if let Value::String(s) = value {
            if let Ok(parsed) = chrono::DateTime::parse_from_rfc3339(s) {
                *value = Value::String(parsed.to_rfc3339_opts(SecondsFormat::Millis, true));
            }
        }
    }
}

/// Lowercase any top-level id field that's already hex, so mixed-case
/// upstream ids arrive on the wire in one canonical form. Ids that aren't
/// hex (ULIDs, for instance) are left untouched rather than reinterpreted.
const ID_FIELDS: [&str; 4] = ["channel_id", "server_id", "message_id", "user_id"];

fn normalize_ids(payload: &mut Value) {
    let Value::Object(map) = payload else { return };
    for key in ID_FIELDS {
        if let Some(Value::String(s)) = map.get_mut(key) {
            if !s.is_empty() && s.chars().all(|c| c.is_ascii_hexdigit()) {
                *s = s.to_ascii_lowercase();
            }
        }
    }
    if let Some(Value::String(s)) = map.get_mut("id") {
        if !s.is_empty() && s.chars().all(|c| c.is_ascii_hexdigit()) {
            *s = s.to_ascii_lowercase();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_created_routes_to_its_channel() {
        let raw = serde_json::json!({
            "type": "message_created",
            "channel_id": "c1",
            "message": { "id": "m1", "created_at": "2024-01-01T00:00:00Z" }
        });
        let routed = bridge(raw);
        assert_eq!(routed.len(), 1);
        assert!(matches!(&routed[0].target, Target::Channel(id) if id == "c1"));
        assert_eq!(routed[0].dispatch_type.as_str(), "MESSAGE_CREATE");
        assert_eq!(routed[0].payload["created_at"], "2024-01-01T00:00:00.000Z");
    }

    #[test]
    fn hex_ids_are_lowercased() {
        let raw = serde_json::json!({
            "type": "message_deleted",
            "channel_id": "1A2B3C",
            "message_id": "DEADBEEF"
        });
        let routed = bridge(raw);
        assert_eq!(routed[0].payload["channel_id"], "1a2b3c");
        assert_eq!(routed[0].payload["id"], "deadbeef");
    }

    #[test]
    fn presence_update_fans_out_to_every_server() {
        let raw = serde_json::json!({
            "type": "presence_updated",
            "user_id": "u1",
            "server_ids": ["s1", "s2"],
            "presence": { "status": "online" }
        });
        let routed = bridge(raw);
        assert_eq!(routed.len(), 2);
        assert!(matches!(&routed[0].target, Target::Server(id) if id == "s1"));
        assert!(matches!(&routed[1].target, Target::Server(id) if id == "s2"));
    }

    #[test]
    fn unrecognized_event_shape_is_dropped_not_panicked() {
        let raw = serde_json::json!({ "type": "something_unknown", "foo": "bar" });
        assert!(bridge(raw).is_empty());
    }

    #[test]
    fn malformed_payload_for_known_type_is_dropped() {
        let raw = serde_json::json!({ "type": "message_created", "channel_id": 123 });
        assert!(bridge(raw).is_empty());
    }
}
