//! Protocol Messages
//!
//! Wire format for client-server communication over WebSocket.
//! Every frame is a JSON object `{ "type": <DISCRIMINANT>, ...fields }` with
//! SCREAMING_SNAKE discriminants and camelCase fields.
//!
//! Inbound frames go through [`ServerMessage::decode`], which rejects unknown
//! discriminants, malformed payloads and entity lists that name the same id
//! twice. Nothing that fails decoding is ever handed to a consumer.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Entity identifier.
pub type EntityId = u64;

// =============================================================================
// ENTITIES
// =============================================================================

/// Color multiplier applied when rendering an entity.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Tint {
    /// Red channel.
    pub r: f64,
    /// Green channel.
    pub g: f64,
    /// Blue channel.
    pub b: f64,
}

/// A positioned entity on the shared table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Entity {
    /// Unique id within the session.
    pub id: EntityId,
    /// Position X.
    pub x: f64,
    /// Position Y.
    pub y: f64,
    /// Rotation in radians.
    #[serde(default)]
    pub rot: f64,
    /// Scale X.
    #[serde(default = "unit_scale")]
    pub sx: f64,
    /// Scale Y.
    #[serde(default = "unit_scale")]
    pub sy: f64,
    /// Stacking order, higher draws on top.
    #[serde(default)]
    pub z_index: i32,
    /// Sprite asset id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sprite: Option<String>,
    /// Tint channels.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tint: Option<Tint>,
    /// Opacity.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alpha: Option<f64>,
    /// Animation frame.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frame: Option<u32>,
}

fn unit_scale() -> f64 {
    1.0
}

impl Entity {
    /// Entity at `(x, y)` with identity rotation/scale and no rendering hints.
    pub fn at(id: EntityId, x: f64, y: f64) -> Self {
        Self {
            id,
            x,
            y,
            rot: 0.0,
            sx: 1.0,
            sy: 1.0,
            z_index: 0,
            sprite: None,
            tint: None,
            alpha: None,
            frame: None,
        }
    }
}

/// Partial entity update carried in a delta's `updated` list.
///
/// Present fields overwrite, absent fields are left untouched. A patch cannot
/// clear an optional rendering hint; the server sends a snapshot for that.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityPatch {
    /// Target entity.
    pub id: EntityId,
    /// New X position.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub x: Option<f64>,
    /// New Y position.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub y: Option<f64>,
    /// New rotation (radians).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rot: Option<f64>,
    /// New horizontal scale.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sx: Option<f64>,
    /// New vertical scale.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sy: Option<f64>,
    /// New draw order.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub z_index: Option<i32>,
    /// New sprite key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sprite: Option<String>,
    /// New tint.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tint: Option<Tint>,
    /// New opacity.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alpha: Option<f64>,
    /// New animation frame.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frame: Option<u32>,
}

impl EntityPatch {
    /// Empty patch for `id`.
    pub fn new(id: EntityId) -> Self {
        Self { id, ..Default::default() }
    }

    /// Set the position fields.
    pub fn with_position(mut self, x: f64, y: f64) -> Self {
        self.x = Some(x);
        self.y = Some(y);
        self
    }

    /// Merge present fields into `entity`.
    pub fn apply_to(&self, entity: &mut Entity) {
        if let Some(x) = self.x {
            entity.x = x;
        }
        if let Some(y) = self.y {
            entity.y = y;
        }
        if let Some(rot) = self.rot {
            entity.rot = rot;
        }
        if let Some(sx) = self.sx {
            entity.sx = sx;
        }
        if let Some(sy) = self.sy {
            entity.sy = sy;
        }
        if let Some(z) = self.z_index {
            entity.z_index = z;
        }
        if let Some(ref sprite) = self.sprite {
            entity.sprite = Some(sprite.clone());
        }
        if self.tint.is_some() {
            entity.tint = self.tint;
        }
        if self.alpha.is_some() {
            entity.alpha = self.alpha;
        }
        if self.frame.is_some() {
            entity.frame = self.frame;
        }
    }
}

// =============================================================================
// SESSIONS
// =============================================================================

/// Role of a participant within a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlayerRole {
    /// Game master.
    Gm,
    /// Regular player.
    #[default]
    Player,
    /// Watch-only participant.
    Spectator,
}

/// Session lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    /// Created, not started.
    #[default]
    Waiting,
    /// In play.
    Active,
    /// Temporarily halted by the GM.
    Paused,
    /// Finished.
    Ended,
}

/// A participant in the session roster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Player {
    /// User id.
    pub id: String,
    /// Display name.
    #[serde(default)]
    pub name: String,
    /// Role within this session.
    #[serde(default)]
    pub role: PlayerRole,
}

/// Authoritative session record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    /// Session id.
    pub id: String,
    /// Display name.
    #[serde(default)]
    pub name: String,
    /// User id of the game master.
    #[serde(default)]
    pub gm_id: String,
    /// Player roster.
    #[serde(default)]
    pub players: Vec<Player>,
    /// Lifecycle status.
    #[serde(default)]
    pub status: SessionStatus,
    /// Creation time, when the HTTP API provides it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

impl Session {
    /// Find a roster entry by user id.
    pub fn player(&self, user_id: &str) -> Option<&Player> {
        self.players.iter().find(|p| p.id == user_id)
    }
}

// =============================================================================
// CLIENT -> SERVER MESSAGES
// =============================================================================

/// Messages sent from client to server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    rename_all = "SCREAMING_SNAKE_CASE",
    rename_all_fields = "camelCase"
)]
pub enum ClientMessage {
    /// Present an access token for this connection.
    Authenticate {
        /// Bearer access token.
        token: String,
    },

    /// Ask to join a session.
    JoinSession {
        /// Session to join.
        session_id: String,
    },

    /// Leave the current session.
    LeaveSession,

    /// Liveness probe carrying the send time (ms).
    Ping {
        /// Send time (ms).
        #[serde(default, skip_serializing_if = "Option::is_none")]
        t: Option<u64>,
    },

    /// Reply to a server probe, echoing its time.
    Pong {
        /// Echoed probe time (ms).
        #[serde(default, skip_serializing_if = "Option::is_none")]
        t: Option<u64>,
    },

    /// Ask for a full snapshot after detecting a gap.
    RequestSnapshot {
        /// Last sequence the client applied.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        last_seq: Option<u64>,
    },

    /// Move a token on the table.
    MoveToken {
        /// Token entity.
        id: EntityId,
        /// Target X.
        x: f64,
        /// Target Y.
        y: f64,
    },

    /// Roll dice using standard notation (`2d6+1`).
    RollDice {
        /// Dice formula.
        formula: String,
    },

    /// Send a chat line.
    ChatMessage {
        /// Message text.
        text: String,
    },
}

// =============================================================================
// SERVER -> CLIENT MESSAGES
// =============================================================================

/// Messages sent from server to client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    rename_all = "SCREAMING_SNAKE_CASE",
    rename_all_fields = "camelCase"
)]
pub enum ServerMessage {
    /// Connection greeting.
    Hello {
        /// Server update rate (Hz).
        tick_rate: u32,
        /// Entity snapshot format version.
        snapshot_version: u32,
    },

    /// Server liveness probe.
    Ping {
        /// Send time (ms).
        #[serde(default, skip_serializing_if = "Option::is_none")]
        t: Option<u64>,
    },

    /// Reply to a client PING, echoing its time.
    Pong {
        /// Echoed PING time (ms).
        #[serde(default, skip_serializing_if = "Option::is_none")]
        t: Option<u64>,
    },

    /// Error report. `id` correlates to the request it answers, if any.
    Error {
        /// Machine-readable code.
        code: String,
        /// Human-readable reason.
        message: String,
        /// Id of the request or session this error concerns.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
    },

    /// Complete entity state.
    Snapshot {
        /// Sequence of this state.
        seq: u64,
        /// Every entity.
        entities: Vec<Entity>,
        /// Hex SHA-256 of the entity set.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        checksum: Option<String>,
    },

    /// Incremental entity change valid against `base_seq`.
    Delta {
        /// Sequence after applying.
        seq: u64,
        /// Sequence this delta builds on.
        base_seq: u64,
        /// New entities.
        #[serde(default)]
        created: Vec<Entity>,
        /// Changed entities.
        #[serde(default)]
        updated: Vec<EntityPatch>,
        /// Deleted entity ids.
        #[serde(default)]
        removed: Vec<EntityId>,
        /// Hex SHA-256 of the resulting entity set.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        checksum: Option<String>,
    },

    /// Join accepted, or the session re-announced.
    SessionJoined {
        /// Session record.
        session: Session,
    },

    /// Authoritative roster and phase.
    GameState {
        /// Session id.
        game_id: String,
        /// Full roster.
        players: Vec<Player>,
        /// Session status.
        phase: SessionStatus,
    },

    /// Someone joined the session.
    PlayerJoined {
        /// New roster entry.
        player: Player,
    },

    /// Someone left the session.
    PlayerLeft {
        /// User id.
        player_id: String,
    },

    /// Chat line.
    ChatMessage {
        /// Sender user id.
        from: String,
        /// Message text.
        text: String,
        /// Server timestamp (ms).
        ts: u64,
    },

    /// Dice roll outcome.
    DiceResult {
        /// Roller's user id.
        player_id: String,
        /// Formula as rolled.
        formula: String,
        /// Individual die results.
        rolls: Vec<i32>,
        /// Sum including modifiers.
        total: i32,
    },

    /// Initiative tracker state.
    CombatUpdate {
        /// Combat round.
        round: u32,
        /// Index into `order` of the acting entity.
        turn: u32,
        /// Initiative order.
        order: Vec<EntityId>,
    },
}

/// Discriminant of a [`ServerMessage`], used as a routing key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum MessageKind {
    /// `HELLO`
    Hello,
    /// `PING`
    Ping,
    /// `PONG`
    Pong,
    /// `ERROR`
    Error,
    /// `SNAPSHOT`
    Snapshot,
    /// `DELTA`
    Delta,
    /// `SESSION_JOINED`
    SessionJoined,
    /// `GAME_STATE`
    GameState,
    /// `PLAYER_JOINED`
    PlayerJoined,
    /// `PLAYER_LEFT`
    PlayerLeft,
    /// `CHAT_MESSAGE`
    ChatMessage,
    /// `DICE_RESULT`
    DiceResult,
    /// `COMBAT_UPDATE`
    CombatUpdate,
}

impl MessageKind {
    /// Every server discriminant.
    pub const ALL: [MessageKind; 13] = [
        MessageKind::Hello,
        MessageKind::Ping,
        MessageKind::Pong,
        MessageKind::Error,
        MessageKind::Snapshot,
        MessageKind::Delta,
        MessageKind::SessionJoined,
        MessageKind::GameState,
        MessageKind::PlayerJoined,
        MessageKind::PlayerLeft,
        MessageKind::ChatMessage,
        MessageKind::DiceResult,
        MessageKind::CombatUpdate,
    ];

    /// Wire name of the discriminant.
    pub fn as_str(self) -> &'static str {
        match self {
            MessageKind::Hello => "HELLO",
            MessageKind::Ping => "PING",
            MessageKind::Pong => "PONG",
            MessageKind::Error => "ERROR",
            MessageKind::Snapshot => "SNAPSHOT",
            MessageKind::Delta => "DELTA",
            MessageKind::SessionJoined => "SESSION_JOINED",
            MessageKind::GameState => "GAME_STATE",
            MessageKind::PlayerJoined => "PLAYER_JOINED",
            MessageKind::PlayerLeft => "PLAYER_LEFT",
            MessageKind::ChatMessage => "CHAT_MESSAGE",
            MessageKind::DiceResult => "DICE_RESULT",
            MessageKind::CombatUpdate => "COMBAT_UPDATE",
        }
    }

    /// Look up a discriminant by wire name.
    pub fn from_wire(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.as_str() == name)
    }

    /// Liveness messages handled by the router itself.
    pub fn is_system(self) -> bool {
        matches!(self, MessageKind::Ping | MessageKind::Pong)
    }
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Decoding failures. None of these are ever dispatched.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Frame is not JSON.
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    /// Frame is JSON but has no string `type`.
    #[error("message has no type discriminant")]
    MissingType,

    /// Discriminant is not part of the protocol.
    #[error("unknown message type {0:?}")]
    UnknownType(String),

    /// Known discriminant, wrong payload shape.
    #[error("malformed {kind} message: {source}")]
    Malformed {
        /// Declared discriminant.
        kind: MessageKind,
        /// Underlying shape error.
        source: serde_json::Error,
    },

    /// Same entity id listed twice in one snapshot or delta.
    #[error("{kind} lists entity {id} more than once")]
    DuplicateEntity {
        /// Offending message kind.
        kind: MessageKind,
        /// Repeated id.
        id: EntityId,
    },
}

// =============================================================================
// SERIALIZATION HELPERS
// =============================================================================

impl ClientMessage {
    /// Wire discriminant, for logging.
    pub fn type_name(&self) -> &'static str {
        match self {
            ClientMessage::Authenticate { .. } => "AUTHENTICATE",
            ClientMessage::JoinSession { .. } => "JOIN_SESSION",
            ClientMessage::LeaveSession => "LEAVE_SESSION",
            ClientMessage::Ping { .. } => "PING",
            ClientMessage::Pong { .. } => "PONG",
            ClientMessage::RequestSnapshot { .. } => "REQUEST_SNAPSHOT",
            ClientMessage::MoveToken { .. } => "MOVE_TOKEN",
            ClientMessage::RollDice { .. } => "ROLL_DICE",
            ClientMessage::ChatMessage { .. } => "CHAT_MESSAGE",
        }
    }

    /// Serialize to JSON string.
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserialize from JSON string.
    pub fn decode(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }
}

impl ServerMessage {
    /// Routing discriminant.
    pub fn kind(&self) -> MessageKind {
        match self {
            ServerMessage::Hello { .. } => MessageKind::Hello,
            ServerMessage::Ping { .. } => MessageKind::Ping,
            ServerMessage::Pong { .. } => MessageKind::Pong,
            ServerMessage::Error { .. } => MessageKind::Error,
            ServerMessage::Snapshot { .. } => MessageKind::Snapshot,
            ServerMessage::Delta { .. } => MessageKind::Delta,
            ServerMessage::SessionJoined { .. } => MessageKind::SessionJoined,
            ServerMessage::GameState { .. } => MessageKind::GameState,
            ServerMessage::PlayerJoined { .. } => MessageKind::PlayerJoined,
            ServerMessage::PlayerLeft { .. } => MessageKind::PlayerLeft,
            ServerMessage::ChatMessage { .. } => MessageKind::ChatMessage,
            ServerMessage::DiceResult { .. } => MessageKind::DiceResult,
            ServerMessage::CombatUpdate { .. } => MessageKind::CombatUpdate,
        }
    }

    /// Serialize to JSON string.
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Decode and validate an inbound frame.
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        let value: serde_json::Value = serde_json::from_str(text)?;
        let name = value
            .get("type")
            .and_then(|t| t.as_str())
            .ok_or(ProtocolError::MissingType)?;
        let kind = MessageKind::from_wire(name)
            .ok_or_else(|| ProtocolError::UnknownType(name.to_string()))?;

        let msg: ServerMessage = serde_json::from_value(value)
            .map_err(|source| ProtocolError::Malformed { kind, source })?;
        msg.validate()?;
        Ok(msg)
    }

    /// Check invariants serde cannot express.
    pub fn validate(&self) -> Result<(), ProtocolError> {
        match self {
            ServerMessage::Snapshot { entities, .. } => {
                unique_ids(MessageKind::Snapshot, entities.iter().map(|e| e.id))
            }
            ServerMessage::Delta { created, updated, removed, .. } => unique_ids(
                MessageKind::Delta,
                created
                    .iter()
                    .map(|e| e.id)
                    .chain(updated.iter().map(|p| p.id))
                    .chain(removed.iter().copied()),
            ),
            _ => Ok(()),
        }
    }
}

fn unique_ids(
    kind: MessageKind,
    ids: impl Iterator<Item = EntityId>,
) -> Result<(), ProtocolError> {
    let mut seen = BTreeSet::new();
    for id in ids {
        if !seen.insert(id) {
            return Err(ProtocolError::DuplicateEntity { kind, id });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_client_message_wire_shape() {
        let msg = ClientMessage::JoinSession { session_id: "abc".into() };
        let value: serde_json::Value = serde_json::from_str(&msg.encode().unwrap()).unwrap();
        assert_eq!(value, json!({ "type": "JOIN_SESSION", "sessionId": "abc" }));

        let leave = ClientMessage::LeaveSession.encode().unwrap();
        assert_eq!(leave, r#"{"type":"LEAVE_SESSION"}"#);
    }

    #[test]
    fn test_ping_omits_missing_timestamp() {
        assert_eq!(
            ClientMessage::Ping { t: None }.encode().unwrap(),
            r#"{"type":"PING"}"#
        );
        let msg = ServerMessage::decode(r#"{"type":"PONG"}"#).unwrap();
        assert_eq!(msg, ServerMessage::Pong { t: None });
    }

    #[test]
    fn test_delta_decode_with_camel_case_fields() {
        let text = r#"{
            "type": "DELTA", "seq": 6, "baseSeq": 5,
            "updated": [{ "id": 1, "x": 10.0 }],
            "removed": [3]
        }"#;

        let msg = ServerMessage::decode(text).unwrap();
        match msg {
            ServerMessage::Delta { seq, base_seq, created, updated, removed, checksum } => {
                assert_eq!(seq, 6);
                assert_eq!(base_seq, 5);
                assert!(created.is_empty());
                assert_eq!(updated[0].x, Some(10.0));
                assert_eq!(updated[0].y, None);
                assert_eq!(removed, vec![3]);
                assert!(checksum.is_none());
            }
            other => panic!("Wrong message type: {:?}", other),
        }
    }

    #[test]
    fn test_entity_defaults() {
        let msg = ServerMessage::decode(
            r#"{"type":"SNAPSHOT","seq":1,"entities":[{"id":9,"x":1.5,"y":-2}]}"#,
        )
        .unwrap();

        if let ServerMessage::Snapshot { entities, .. } = msg {
            assert_eq!(entities[0], Entity::at(9, 1.5, -2.0));
        } else {
            panic!("Wrong message type");
        }
    }

    #[test]
    fn test_coordinates_survive_exactly() {
        let mut entity = Entity::at(1, 0.1 + 0.2, -1234.567890123456789);
        entity.rot = std::f64::consts::PI;
        entity.tint = Some(Tint { r: 1.0 / 3.0, g: 0.0, b: 2.0 / 3.0 });
        entity.alpha = Some(0.3333333333333333);

        let msg = ServerMessage::Snapshot { seq: 2, entities: vec![entity], checksum: None };
        let parsed = ServerMessage::decode(&msg.encode().unwrap()).unwrap();

        assert_eq!(parsed, msg);
    }

    #[test]
    fn test_field_order_irrelevant() {
        let a = ServerMessage::decode(r#"{"type":"HELLO","tickRate":20,"snapshotVersion":3}"#).unwrap();
        let b = ServerMessage::decode(r#"{"snapshotVersion":3,"tickRate":20,"type":"HELLO"}"#).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_unknown_type_rejected() {
        let err = ServerMessage::decode(r#"{"type":"TELEPORT","x":1}"#).unwrap_err();
        assert!(matches!(err, ProtocolError::UnknownType(ref t) if t == "TELEPORT"));
    }

    #[test]
    fn test_missing_type_rejected() {
        let err = ServerMessage::decode(r#"{"seq":1}"#).unwrap_err();
        assert!(matches!(err, ProtocolError::MissingType));

        let err = ServerMessage::decode(r#"{"type":7}"#).unwrap_err();
        assert!(matches!(err, ProtocolError::MissingType));
    }

    #[test]
    fn test_malformed_payload_rejected() {
        let err = ServerMessage::decode(r#"{"type":"SNAPSHOT","seq":"one"}"#).unwrap_err();
        assert!(matches!(err, ProtocolError::Malformed { kind: MessageKind::Snapshot, .. }));

        let err = ServerMessage::decode("not json").unwrap_err();
        assert!(matches!(err, ProtocolError::Json(_)));
    }

    #[test]
    fn test_duplicate_entity_rejected() {
        let snapshot = r#"{"type":"SNAPSHOT","seq":1,"entities":[
            {"id":1,"x":0,"y":0},{"id":1,"x":5,"y":5}]}"#;
        assert!(matches!(
            ServerMessage::decode(snapshot),
            Err(ProtocolError::DuplicateEntity { id: 1, .. })
        ));

        let delta = r#"{"type":"DELTA","seq":2,"baseSeq":1,
            "created":[{"id":4,"x":0,"y":0}],"removed":[4]}"#;
        assert!(matches!(
            ServerMessage::decode(delta),
            Err(ProtocolError::DuplicateEntity { kind: MessageKind::Delta, id: 4 })
        ));
    }

    #[test]
    fn test_message_kind_names_match_serde() {
        let samples = vec![
            ServerMessage::Hello { tick_rate: 20, snapshot_version: 1 },
            ServerMessage::Error { code: "E".into(), message: "m".into(), id: None },
            ServerMessage::SessionJoined {
                session: Session {
                    id: "s".into(),
                    name: String::new(),
                    gm_id: String::new(),
                    players: vec![],
                    status: SessionStatus::Waiting,
                    created_at: None,
                },
            },
            ServerMessage::GameState { game_id: "s".into(), players: vec![], phase: SessionStatus::Active },
            ServerMessage::PlayerLeft { player_id: "u".into() },
            ServerMessage::DiceResult { player_id: "u".into(), formula: "1d20".into(), rolls: vec![17], total: 17 },
            ServerMessage::CombatUpdate { round: 1, turn: 0, order: vec![3, 1] },
        ];

        for msg in samples {
            let value: serde_json::Value = serde_json::from_str(&msg.encode().unwrap()).unwrap();
            assert_eq!(value["type"], msg.kind().as_str());
            assert_eq!(MessageKind::from_wire(msg.kind().as_str()), Some(msg.kind()));
        }
    }

    #[test]
    fn test_patch_merges_present_fields_only() {
        let mut entity = Entity::at(1, 0.0, 0.0);
        entity.sprite = Some("goblin".into());

        let patch = EntityPatch { alpha: Some(0.5), ..EntityPatch::new(1).with_position(10.0, 2.0) };
        patch.apply_to(&mut entity);

        assert_eq!(entity.x, 10.0);
        assert_eq!(entity.y, 2.0);
        assert_eq!(entity.alpha, Some(0.5));
        assert_eq!(entity.sprite.as_deref(), Some("goblin"));
        assert_eq!(entity.sx, 1.0);
    }

    #[test]
    fn test_session_status_lowercase() {
        let json = serde_json::to_string(&SessionStatus::Paused).unwrap();
        assert_eq!(json, "\"paused\"");
        let role: PlayerRole = serde_json::from_str("\"gm\"").unwrap();
        assert_eq!(role, PlayerRole::Gm);
    }
}
