//! Comma-delimited records sent by clients over the unreliable channel
//!
//! Minimum form is `id,x,y`. Longer records extend it in a fixed order:
//! `id,x,y,health,displayName,animationFrame,playerObjectData`, so any prefix
//! of three to seven fields is accepted. `id,disconnect` is a leave notice.

use crate::ClientId;
use std::str::FromStr;
use thiserror::Error;

pub const MIN_RECORD_FIELDS: usize = 3;
pub const MAX_RECORD_FIELDS: usize = 7;

/// Health value clients send to request a respawn at full health
pub const RESPAWN_HEALTH: i32 = -1;

const DISCONNECT_FIELD: &str = "disconnect";

#[derive(Debug, Error, Clone, PartialEq)]
pub enum RecordError {
    #[error("expected {MIN_RECORD_FIELDS} to {MAX_RECORD_FIELDS} fields, got {0}")]
    FieldCount(usize),

    #[error("field `{field}` is not a valid number: {value:?}")]
    InvalidNumber { field: &'static str, value: String },

    #[error("invalid player object entry: {0:?}")]
    InvalidObject(String),
}

/// A transient object owned by a player (a projectile, for instance)
#[derive(Debug, Clone, PartialEq)]
pub struct PlayerObject {
    pub kind: String,
    pub id: u32,
    pub x: f32,
    pub y: f32,
}

impl PlayerObject {
    /// Parses a single `kind:id:x&y` entry
    pub fn parse(entry: &str) -> Result<Self, RecordError> {
        let invalid = || RecordError::InvalidObject(entry.to_string());

        let mut parts = entry.split(':');
        let (Some(kind), Some(id), Some(position), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(invalid());
        };
        let (x, y) = position.split_once('&').ok_or_else(invalid)?;

        if kind.is_empty() {
            return Err(invalid());
        }

        Ok(Self {
            kind: kind.to_string(),
            id: id.parse().map_err(|_| invalid())?,
            x: parse_coordinate(x).ok_or_else(invalid)?,
            y: parse_coordinate(y).ok_or_else(invalid)?,
        })
    }

    /// Parses a `+`-separated list of entries; an empty string is an empty list
    pub fn parse_list(data: &str) -> Result<Vec<Self>, RecordError> {
        if data.is_empty() {
            return Ok(Vec::new());
        }
        data.split('+').map(Self::parse).collect()
    }
}

/// Position and state update carried by one datagram
#[derive(Debug, Clone, PartialEq)]
pub struct PlayerUpdate {
    pub id: ClientId,
    pub x: f32,
    pub y: f32,
    pub health: Option<i32>,
    pub display_name: Option<String>,
    pub animation: Option<String>,
    pub objects: Option<Vec<PlayerObject>>,
}

impl PlayerUpdate {
    pub fn position(id: ClientId, x: f32, y: f32) -> Self {
        Self {
            id,
            x,
            y,
            health: None,
            display_name: None,
            animation: None,
            objects: None,
        }
    }

    /// Renders the update back into its textual record form
    pub fn to_record(&self) -> String {
        let mut fields = vec![self.id.to_string(), self.x.to_string(), self.y.to_string()];

        // Later fields are positional, so every earlier optional field must be present
        let optional = [
            self.health.map(|h| h.to_string()),
            self.display_name.clone(),
            self.animation.clone(),
            self.objects.as_ref().map(|objects| {
                objects
                    .iter()
                    .map(|o| format!("{}:{}:{}&{}", o.kind, o.id, o.x, o.y))
                    .collect::<Vec<_>>()
                    .join("+")
            }),
        ];
        let last_present = optional.iter().rposition(Option::is_some);
        if let Some(last) = last_present {
            for field in &optional[..=last] {
                fields.push(field.clone().unwrap_or_default());
            }
        }

        fields.join(",")
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum InboundRecord {
    Update(PlayerUpdate),
    Disconnect(ClientId),
}

impl InboundRecord {
    pub fn client_id(&self) -> ClientId {
        match self {
            InboundRecord::Update(update) => update.id,
            InboundRecord::Disconnect(id) => *id,
        }
    }

    /// Parses a raw datagram payload
    ///
    /// Trailing NUL bytes and line endings left over from fixed-size client
    /// buffers are ignored.
    pub fn parse_bytes(payload: &[u8]) -> Result<Self, RecordError> {
        let text = String::from_utf8_lossy(payload);
        text.parse()
    }
}

impl FromStr for InboundRecord {
    type Err = RecordError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim_end_matches(['\0', '\r', '\n']);
        let fields: Vec<&str> = s.split(',').collect();

        if fields.len() == 2 && fields[1] == DISCONNECT_FIELD {
            return Ok(InboundRecord::Disconnect(parse_id(fields[0])?));
        }

        if !(MIN_RECORD_FIELDS..=MAX_RECORD_FIELDS).contains(&fields.len()) {
            return Err(RecordError::FieldCount(fields.len()));
        }

        let id = parse_id(fields[0])?;
        let x = parse_coordinate(fields[1]).ok_or_else(|| RecordError::InvalidNumber {
            field: "x",
            value: fields[1].to_string(),
        })?;
        let y = parse_coordinate(fields[2]).ok_or_else(|| RecordError::InvalidNumber {
            field: "y",
            value: fields[2].to_string(),
        })?;

        let health = fields
            .get(3)
            .map(|value| {
                value
                    .trim()
                    .parse::<i32>()
                    .map_err(|_| RecordError::InvalidNumber {
                        field: "health",
                        value: value.to_string(),
                    })
            })
            .transpose()?;

        let objects = fields
            .get(6)
            .map(|data| PlayerObject::parse_list(data))
            .transpose()?;

        Ok(InboundRecord::Update(PlayerUpdate {
            id,
            x,
            y,
            health,
            display_name: fields.get(4).map(|s| s.to_string()),
            animation: fields.get(5).map(|s| s.to_string()),
            objects,
        }))
    }
}

fn parse_id(value: &str) -> Result<ClientId, RecordError> {
    value
        .trim()
        .parse()
        .map_err(|_| RecordError::InvalidNumber {
            field: "id",
            value: value.to_string(),
        })
}

fn parse_coordinate(value: &str) -> Option<f32> {
    value.trim().parse::<f32>().ok().filter(|v| v.is_finite())
}
