//! Authoritative player state and the outbound snapshot encoding

use crate::record::{PlayerObject, PlayerUpdate, RESPAWN_HEALTH};
use crate::ClientId;
use serde::Deserialize;
use std::fmt::Write;
use std::str::FromStr;

pub const MAX_HEALTH: i32 = 100;

/// Characters that delimit fields somewhere in the snapshot formats
pub const RESERVED_CHARS: [char; 7] = [',', ';', '|', '+', '-', ':', '&'];

/// Makes client-supplied text safe to embed in a snapshot
///
/// Reserved delimiters become `_` and control characters are dropped.
pub fn sanitize_field(raw: &str) -> String {
    raw.chars()
        .filter(|c| !c.is_control())
        .map(|c| if RESERVED_CHARS.contains(&c) { '_' } else { c })
        .collect()
}

#[derive(Debug, Clone, PartialEq)]
pub struct PlayerState {
    pub id: ClientId,
    pub display_name: String,
    pub x: f32,
    pub y: f32,
    pub health: i32,
    pub animation: String,
    pub objects: Vec<PlayerObject>,
}

impl PlayerState {
    pub fn new(id: ClientId, display_name: impl Into<String>) -> Self {
        Self {
            id,
            display_name: display_name.into(),
            x: 0.0,
            y: 0.0,
            health: MAX_HEALTH,
            animation: String::new(),
            objects: Vec::new(),
        }
    }

    /// Overwrites state with whatever the update carries
    ///
    /// Fields absent from the update are left untouched. The display name is
    /// fixed at handshake time and never taken from an update. Free text is
    /// passed through [`sanitize_field`] before it is stored.
    pub fn apply(&mut self, update: &PlayerUpdate) {
        self.x = update.x;
        self.y = update.y;

        if let Some(health) = update.health {
            self.health = if health == RESPAWN_HEALTH {
                MAX_HEALTH
            } else {
                health.clamp(0, MAX_HEALTH)
            };
        }
        if let Some(animation) = &update.animation {
            self.animation = sanitize_field(animation);
        }
        if let Some(objects) = &update.objects {
            self.objects = objects
                .iter()
                .map(|object| PlayerObject {
                    kind: sanitize_field(&object.kind),
                    ..object.clone()
                })
                .collect();
        }
    }
}

/// Layout of the snapshot datagram sent to every client each tick
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BroadcastFormat {
    /// `id,x,y;` per player
    #[default]
    Positions,
    /// `id,x,y,health,name,animation;` per player, then `|` and owned objects
    Full,
}

impl FromStr for BroadcastFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "positions" => Ok(BroadcastFormat::Positions),
            "full" => Ok(BroadcastFormat::Full),
            other => Err(format!("unknown broadcast format: {}", other)),
        }
    }
}

/// Serializes a snapshot of players into one broadcast payload
pub fn encode_snapshot<'a, I>(players: I, format: BroadcastFormat) -> String
where
    I: IntoIterator<Item = &'a PlayerState>,
{
    let mut out = String::new();
    let mut objects = Vec::new();

    for player in players {
        // Writing into a String cannot fail
        let _ = match format {
            BroadcastFormat::Positions => write!(out, "{},{},{};", player.id, player.x, player.y),
            BroadcastFormat::Full => write!(
                out,
                "{},{},{},{},{},{};",
                player.id, player.x, player.y, player.health, player.display_name, player.animation
            ),
        };

        if format == BroadcastFormat::Full {
            objects.extend(player.objects.iter().map(|o| {
                format!("{}-{}:{}:{}&{}", player.id, o.id, o.kind, o.x, o.y)
            }));
        }
    }

    if format == BroadcastFormat::Full {
        out.push('|');
        out.push_str(&objects.join("+"));
    }

    out
}

/// Decodes the `id,x,y` triples from a broadcast payload
///
/// Works on both formats; anything after `|` and any extra per-player fields
/// are ignored. Entries that fail to parse are skipped.
pub fn decode_positions(payload: &str) -> Vec<(ClientId, f32, f32)> {
    let players = payload.split('|').next().unwrap_or_default();

    players
        .split(';')
        .filter(|entry| !entry.is_empty())
        .filter_map(|entry| {
            let mut fields = entry.split(',');
            let id = fields.next()?.parse().ok()?;
            let x = fields.next()?.parse().ok()?;
            let y = fields.next()?.parse().ok()?;
            Some((id, x, y))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn player(id: ClientId, x: f32, y: f32) -> PlayerState {
        let mut state = PlayerState::new(id, format!("p{}", id));
        state.x = x;
        state.y = y;
        state
    }

    #[test]
    fn test_new_player_defaults() {
        let state = PlayerState::new(3, "Ada");
        assert_eq!(state.health, MAX_HEALTH);
        assert_eq!((state.x, state.y), (0.0, 0.0));
        assert!(state.animation.is_empty());
        assert!(state.objects.is_empty());
    }

    #[test]
    fn test_apply_position_only_keeps_other_fields() {
        let mut state = PlayerState::new(0, "Ada");
        state.health = 40;
        state.animation = "idle".to_string();

        state.apply(&PlayerUpdate::position(0, 5.0, 6.0));

        assert_eq!((state.x, state.y), (5.0, 6.0));
        assert_eq!(state.health, 40);
        assert_eq!(state.animation, "idle");
    }

    #[test]
    fn test_respawn_health_resets_to_max() {
        let mut state = PlayerState::new(0, "Ada");
        state.health = 0;

        let mut update = PlayerUpdate::position(0, 0.0, 0.0);
        update.health = Some(RESPAWN_HEALTH);
        state.apply(&update);

        assert_eq!(state.health, MAX_HEALTH);
    }

    #[test]
    fn test_display_name_not_overwritten() {
        let mut state = PlayerState::new(0, "Ada");
        let mut update = PlayerUpdate::position(0, 0.0, 0.0);
        update.display_name = Some("Mallory".to_string());
        state.apply(&update);
        assert_eq!(state.display_name, "Ada");
    }

    #[test]
    fn test_encode_positions() {
        let players = vec![player(0, 15.0, 25.0), player(1, -3.5, 0.0)];
        assert_eq!(
            encode_snapshot(&players, BroadcastFormat::Positions),
            "0,15,25;1,-3.5,0;"
        );
    }

    #[test]
    fn test_encode_empty_snapshot() {
        let nobody: Vec<PlayerState> = Vec::new();
        assert_eq!(encode_snapshot(&nobody, BroadcastFormat::Positions), "");
        assert_eq!(encode_snapshot(&nobody, BroadcastFormat::Full), "|");
    }

    #[test]
    fn test_encode_full() {
        let mut ada = player(0, 1.0, 2.0);
        ada.display_name = "Ada".to_string();
        ada.animation = "run".to_string();
        ada.objects = vec![PlayerObject {
            kind: "bullet".to_string(),
            id: 9,
            x: 4.0,
            y: 5.5,
        }];
        let bo = player(1, 3.0, 4.0);

        assert_eq!(
            encode_snapshot([&ada, &bo], BroadcastFormat::Full),
            "0,1,2,100,Ada,run;1,3,4,100,p1,;|0-9:bullet:4&5.5"
        );
    }

    #[test]
    fn test_decode_positions_from_both_formats() {
        let players = vec![player(0, 15.0, 25.0), player(7, 1.5, 2.0)];
        for format in [BroadcastFormat::Positions, BroadcastFormat::Full] {
            let decoded = decode_positions(&encode_snapshot(&players, format));
            assert_eq!(decoded, vec![(0, 15.0, 25.0), (7, 1.5, 2.0)]);
        }
    }

    #[test]
    fn test_sanitize_field() {
        assert_eq!(sanitize_field("walk_1"), "walk_1");
        assert_eq!(sanitize_field("a,b;c|d+e-f:g&h"), "a_b_c_d_e_f_g_h");
        assert_eq!(sanitize_field("x\n\0y"), "xy");
    }

    #[test]
    fn test_hostile_animation_cannot_hide_other_players() {
        let record: crate::InboundRecord = "0,1,2,100,Ada,x|".parse().unwrap();
        let crate::InboundRecord::Update(update) = record else {
            panic!("expected an update record");
        };

        let mut ada = PlayerState::new(0, "Ada");
        ada.apply(&update);
        let bo = player(1, 3.0, 4.0);

        let payload = encode_snapshot([&ada, &bo], BroadcastFormat::Full);

        assert_eq!(payload, "0,1,2,100,Ada,x_;1,3,4,100,p1,;|");
        assert_eq!(decode_positions(&payload), vec![(0, 1.0, 2.0), (1, 3.0, 4.0)]);
    }

    #[test]
    fn test_hostile_object_kind_is_scrubbed() {
        let mut update = PlayerUpdate::position(0, 0.0, 0.0);
        update.objects = Some(vec![PlayerObject {
            kind: "bul|let+9-1".to_string(),
            id: 2,
            x: 1.0,
            y: 1.0,
        }]);

        let mut state = PlayerState::new(0, "Ada");
        state.apply(&update);

        assert_eq!(state.objects[0].kind, "bul_let_9_1");
        assert_eq!(
            encode_snapshot([&state], BroadcastFormat::Full),
            "0,0,0,100,Ada,;|0-2:bul_let_9_1:1&1"
        );
    }

    #[test]
    fn test_broadcast_format_from_str() {
        assert_eq!("full".parse::<BroadcastFormat>(), Ok(BroadcastFormat::Full));
        assert_eq!(
            "Positions".parse::<BroadcastFormat>(),
            Ok(BroadcastFormat::Positions)
        );
        assert!("binary".parse::<BroadcastFormat>().is_err());
    }

    proptest! {
        #[test]
        fn applying_an_update_twice_equals_applying_once(
            x in -1000.0f32..1000.0,
            y in -1000.0f32..1000.0,
            health in -1i32..150,
            animation in "[a-z_0-9]{0,8}",
        ) {
            let update = PlayerUpdate {
                id: 0,
                x,
                y,
                health: Some(health),
                display_name: None,
                animation: Some(animation),
                objects: Some(vec![PlayerObject { kind: "bullet".into(), id: 1, x, y }]),
            };

            let mut once = PlayerState::new(0, "Ada");
            once.apply(&update);

            let mut twice = once.clone();
            twice.apply(&update);

            prop_assert_eq!(once, twice);
        }
    }
}
