//! Disk recorder / player transport.
//!
//! One transport per deck. Timeline content:
//!
//! ```json
//! { "type": "transport", "status": "play", "clipId": "A", "speed": 100, "loop": false }
//! ```
//!
//! Layer mapping options: `{ "mappingType": "transport" }`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::device::{
    decode_content, decode_mapping, order_release_first, Command, CommandContext, CommandPhase,
    Conversion, DiffContext, Phase, ProgrammingError, StateDiffer, Timed, UnhandledTagPolicy,
};
use crate::queue::SendMode;
use crate::timeline::{layers_for_device, Mappings, Snapshot};

pub const KIND: &str = "hyperdeck";

/// 1x playback, in percent.
pub const DEFAULT_SPEED: i32 = 100;

const CONTENT_TAGS: &[&str] = &["transport"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportStatus {
    Preview,
    Stopped,
    Play,
    Forward,
    Rewind,
    Jog,
    Shuttle,
    Record,
}

impl TransportStatus {
    fn parse(value: &str) -> Option<Self> {
        Self::deserialize(Value::from(value)).ok()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(tag = "mappingType", rename_all = "snake_case")]
pub enum HyperdeckMapping {
    Transport,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HyperdeckContent {
    Transport(TransportContent),
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportContent {
    pub status: TransportStatus,
    pub speed: Option<i32>,
    #[serde(rename = "loop")]
    pub loop_playback: Option<bool>,
    pub single_clip: Option<bool>,
    pub clip_id: Option<String>,
    pub record_filename: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportState {
    pub status: TransportStatus,
    pub speed: i32,
    #[serde(rename = "loop")]
    pub loop_playback: bool,
    pub single_clip: bool,
    pub clip_id: Option<String>,
    pub record_filename: Option<String>,
}

impl Default for TransportState {
    fn default() -> Self {
        Self {
            status: TransportStatus::Stopped,
            speed: DEFAULT_SPEED,
            loop_playback: false,
            single_clip: true,
            clip_id: None,
            record_filename: None,
        }
    }
}

impl TransportState {
    fn from_content(content: TransportContent) -> Self {
        let defaults = Self::default();
        match content.status {
            TransportStatus::Play => Self {
                status: content.status,
                speed: content.speed.unwrap_or(defaults.speed),
                loop_playback: content.loop_playback.unwrap_or(defaults.loop_playback),
                single_clip: content.single_clip.unwrap_or(defaults.single_clip),
                clip_id: content.clip_id,
                record_filename: None,
            },
            TransportStatus::Record => Self {
                status: content.status,
                record_filename: content.record_filename,
                ..defaults
            },
            status => Self { status, ..defaults },
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HyperdeckState {
    pub transport: TransportState,
    /// Timeline object that set the transport.
    pub object_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum HyperdeckCommand {
    Play {
        speed: i32,
        #[serde(rename = "loop")]
        loop_playback: bool,
        single_clip: bool,
        clip_id: Option<String>,
    },
    Record {
        filename: Option<String>,
    },
    Stop,
    Preview,
}

impl CommandPhase for HyperdeckCommand {
    fn phase(&self) -> Phase {
        match self {
            HyperdeckCommand::Stop => Phase::Release,
            HyperdeckCommand::Preview => Phase::Prepare,
            HyperdeckCommand::Play { .. } | HyperdeckCommand::Record { .. } => Phase::Engage,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct HyperdeckDiffer {
    unhandled: UnhandledTagPolicy,
}

impl HyperdeckDiffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// What to do when the timeline asks for forward/rewind/jog/shuttle.
    pub fn with_unhandled_policy(mut self, policy: UnhandledTagPolicy) -> Self {
        self.unhandled = policy;
        self
    }

    fn transport_commands(
        &self,
        old: &TransportState,
        new: &TransportState,
    ) -> Vec<HyperdeckCommand> {
        let status_changed = old.status != new.status;

        match new.status {
            TransportStatus::Record => {
                let filename_changed =
                    old.record_filename.is_some() && old.record_filename != new.record_filename;
                if status_changed {
                    vec![HyperdeckCommand::Record {
                        filename: new.record_filename.clone(),
                    }]
                } else if filename_changed {
                    // Split the recording
                    vec![
                        HyperdeckCommand::Stop,
                        HyperdeckCommand::Record {
                            filename: new.record_filename.clone(),
                        },
                    ]
                } else {
                    Vec::new()
                }
            }
            TransportStatus::Play => {
                let clip_changed = new.clip_id.is_some() && old.clip_id != new.clip_id;
                let playback_changed = status_changed
                    || old.speed != new.speed
                    || old.loop_playback != new.loop_playback
                    || old.single_clip != new.single_clip;
                if playback_changed || clip_changed {
                    vec![HyperdeckCommand::Play {
                        speed: new.speed,
                        loop_playback: new.loop_playback,
                        single_clip: new.single_clip,
                        clip_id: new.clip_id.clone(),
                    }]
                } else {
                    Vec::new()
                }
            }
            TransportStatus::Preview if status_changed => vec![HyperdeckCommand::Preview],
            TransportStatus::Stopped if status_changed => vec![HyperdeckCommand::Stop],
            TransportStatus::Preview | TransportStatus::Stopped => Vec::new(),
            TransportStatus::Forward
            | TransportStatus::Rewind
            | TransportStatus::Jog
            | TransportStatus::Shuttle => match self.unhandled {
                UnhandledTagPolicy::Stop
                    if matches!(old.status, TransportStatus::Play | TransportStatus::Record) =>
                {
                    vec![HyperdeckCommand::Stop]
                }
                _ => Vec::new(),
            },
        }
    }
}

impl StateDiffer for HyperdeckDiffer {
    type State = HyperdeckState;
    type Payload = HyperdeckCommand;

    fn kind(&self) -> &'static str {
        KIND
    }

    fn default_state(&self) -> HyperdeckState {
        HyperdeckState::default()
    }

    fn convert(
        &self,
        device_id: &str,
        snapshot: &Snapshot,
        mappings: &Mappings,
    ) -> Result<Conversion<HyperdeckState>, ProgrammingError> {
        let mut state = HyperdeckState::default();
        let mut warnings = Vec::new();

        for (layer, object, mapping) in layers_for_device(device_id, snapshot, mappings) {
            let Some(HyperdeckMapping::Transport) =
                decode_mapping::<HyperdeckMapping>(layer, &mapping.options, &mut warnings)
            else {
                continue;
            };

            if let Some(status) = object.content.get("status").and_then(Value::as_str) {
                if TransportStatus::parse(status).is_none() {
                    return Err(ProgrammingError::Unsupported {
                        device_kind: KIND,
                        what: "transport status",
                        value: status.to_string(),
                    });
                }
            }

            let content: Option<HyperdeckContent> =
                decode_content(KIND, layer, &object.content, CONTENT_TAGS, &mut warnings)?;
            if let Some(HyperdeckContent::Transport(transport)) = content {
                // Lexical layer order, last write wins
                state.transport = TransportState::from_content(transport);
                state.object_id = Some(object.object_id.clone());
            }
        }

        Ok(Conversion::new(state, warnings))
    }

    fn diff(
        &self,
        old: &Timed<HyperdeckState>,
        new: &Timed<HyperdeckState>,
        ctx: &DiffContext,
    ) -> Result<Vec<Command<HyperdeckCommand>>, ProgrammingError> {
        let commands = self
            .transport_commands(&old.state.transport, &new.state.transport)
            .into_iter()
            .map(|payload| {
                let context = CommandContext::new(format!(
                    "transport {:?} -> {:?}",
                    old.state.transport.status, new.state.transport.status
                ))
                .with_change(&old.state.transport, &new.state.transport);
                Command::new(ctx.time, payload, context).for_object(new.state.object_id.clone())
            })
            .collect();

        Ok(order_release_first(commands))
    }

    fn send_mode(&self) -> SendMode {
        SendMode::Burst
    }

    fn unhandled_tag_policy(&self) -> UnhandledTagPolicy {
        self.unhandled
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timeline::{LayerObject, Mapping};
    use serde_json::json;

    fn mappings() -> Mappings {
        let mut m = Mappings::new();
        m.insert(
            "deck".into(),
            Mapping::new("deck1", json!({"mappingType": "transport"})),
        );
        m
    }

    fn snapshot(time: i64, content: Value) -> Snapshot {
        Snapshot::new(time).with_layer("deck", LayerObject::new("obj1", content))
    }

    fn convert(differ: &HyperdeckDiffer, time: i64, content: Value) -> Timed<HyperdeckState> {
        let conversion = differ
            .convert("deck1", &snapshot(time, content), &mappings())
            .unwrap();
        assert!(conversion.warnings.is_empty(), "{:?}", conversion.warnings);
        Timed::new(time, conversion.state)
    }

    fn diff(
        differ: &HyperdeckDiffer,
        old: &Timed<HyperdeckState>,
        new: &Timed<HyperdeckState>,
    ) -> Vec<HyperdeckCommand> {
        let ctx = DiffContext {
            time: new.time,
            now: 0,
            previous_time: old.time,
        };
        differ
            .diff(old, new, &ctx)
            .unwrap()
            .into_iter()
            .map(|c| c.payload)
            .collect()
    }

    fn default_state(differ: &HyperdeckDiffer) -> Timed<HyperdeckState> {
        Timed::new(0, differ.default_state())
    }

    #[test]
    fn test_play_from_stopped_emits_single_play_with_clip() {
        let differ = HyperdeckDiffer::new();
        let playing = convert(&differ, 1000, json!({"type": "transport", "status": "play", "clipId": "A"}));

        let commands = diff(&differ, &default_state(&differ), &playing);
        assert_eq!(
            commands,
            vec![HyperdeckCommand::Play {
                speed: DEFAULT_SPEED,
                loop_playback: false,
                single_clip: true,
                clip_id: Some("A".into()),
            }]
        );

        let still_playing =
            convert(&differ, 2000, json!({"type": "transport", "status": "play", "clipId": "A"}));
        assert!(diff(&differ, &playing, &still_playing).is_empty());
    }

    #[test]
    fn test_record_filename_change_splits_recording() {
        let differ = HyperdeckDiffer::new();
        let x = convert(&differ, 1000, json!({"type": "transport", "status": "record", "recordFilename": "X"}));
        let y = convert(&differ, 2000, json!({"type": "transport", "status": "record", "recordFilename": "Y"}));

        assert_eq!(
            diff(&differ, &default_state(&differ), &x),
            vec![HyperdeckCommand::Record {
                filename: Some("X".into())
            }]
        );
        assert_eq!(
            diff(&differ, &x, &y),
            vec![
                HyperdeckCommand::Stop,
                HyperdeckCommand::Record {
                    filename: Some("Y".into())
                }
            ]
        );
    }

    #[test]
    fn test_stop_and_preview_only_on_status_change() {
        let differ = HyperdeckDiffer::new();
        let stopped = convert(&differ, 1000, json!({"type": "transport", "status": "stopped"}));
        let preview = convert(&differ, 2000, json!({"type": "transport", "status": "preview"}));

        assert!(diff(&differ, &default_state(&differ), &stopped).is_empty());
        assert_eq!(diff(&differ, &stopped, &preview), vec![HyperdeckCommand::Preview]);
        assert_eq!(diff(&differ, &preview, &stopped), vec![HyperdeckCommand::Stop]);
    }

    #[test]
    fn test_speed_change_replays() {
        let differ = HyperdeckDiffer::new();
        let normal = convert(&differ, 1000, json!({"type": "transport", "status": "play", "clipId": "A"}));
        let slow = convert(&differ, 2000, json!({"type": "transport", "status": "play", "clipId": "A", "speed": 50}));

        let commands = diff(&differ, &normal, &slow);
        assert!(matches!(commands.as_slice(), [HyperdeckCommand::Play { speed: 50, .. }]));
    }

    #[test]
    fn test_unhandled_status_stops_playing_deck_by_default() {
        let differ = HyperdeckDiffer::new();
        let playing = convert(&differ, 1000, json!({"type": "transport", "status": "play", "clipId": "A"}));
        let jog = convert(&differ, 2000, json!({"type": "transport", "status": "jog"}));

        assert_eq!(differ.unhandled_tag_policy(), UnhandledTagPolicy::Stop);
        assert_eq!(diff(&differ, &playing, &jog), vec![HyperdeckCommand::Stop]);
        assert!(diff(&differ, &default_state(&differ), &jog).is_empty());
    }

    #[test]
    fn test_unhandled_status_ignored_when_configured() {
        let differ = HyperdeckDiffer::new().with_unhandled_policy(UnhandledTagPolicy::Ignore);
        let playing = convert(&differ, 1000, json!({"type": "transport", "status": "play", "clipId": "A"}));
        let shuttle = convert(&differ, 2000, json!({"type": "transport", "status": "shuttle"}));

        assert!(diff(&differ, &playing, &shuttle).is_empty());
    }

    #[test]
    fn test_identical_states_diff_to_nothing() {
        let differ = HyperdeckDiffer::new();
        for content in [
            json!({"type": "transport", "status": "play", "clipId": "A", "loop": true}),
            json!({"type": "transport", "status": "record", "recordFilename": "X"}),
            json!({"type": "transport", "status": "preview"}),
            json!({"type": "transport", "status": "rewind"}),
        ] {
            let state = convert(&differ, 1000, content);
            assert!(diff(&differ, &state, &state).is_empty());
        }
    }

    #[test]
    fn test_last_layer_wins() {
        let differ = HyperdeckDiffer::new();
        let mut mappings = mappings();
        mappings.insert(
            "deck_override".into(),
            Mapping::new("deck1", json!({"mappingType": "transport"})),
        );
        let snapshot = Snapshot::new(1000)
            .with_layer(
                "deck_override",
                LayerObject::new("late", json!({"type": "transport", "status": "record"})),
            )
            .with_layer(
                "deck",
                LayerObject::new("early", json!({"type": "transport", "status": "play"})),
            );

        let state = differ.convert("deck1", &snapshot, &mappings).unwrap().state;
        assert_eq!(state.transport.status, TransportStatus::Record);
        assert_eq!(state.object_id.as_deref(), Some("late"));
    }

    #[test]
    fn test_unknown_content_type_is_rejected() {
        let differ = HyperdeckDiffer::new();
        let err = differ
            .convert("deck1", &snapshot(1000, json!({"type": "slot", "slotId": 1})), &mappings())
            .unwrap_err();
        assert!(matches!(err, ProgrammingError::UnknownTag { tag, .. } if tag == "slot"));
    }

    #[test]
    fn test_unknown_status_is_rejected() {
        let differ = HyperdeckDiffer::new();
        let err = differ
            .convert("deck1", &snapshot(1000, json!({"type": "transport", "status": "warp"})), &mappings())
            .unwrap_err();
        assert!(matches!(err, ProgrammingError::Unsupported { value, .. } if value == "warp"));
    }

    #[test]
    fn test_bad_mapping_falls_back_to_default() {
        let differ = HyperdeckDiffer::new();
        let mut mappings = Mappings::new();
        mappings.insert("deck".into(), Mapping::new("deck1", json!({"mappingType": "slots"})));

        let conversion = differ
            .convert(
                "deck1",
                &snapshot(1000, json!({"type": "transport", "status": "play"})),
                &mappings,
            )
            .unwrap();
        assert_eq!(conversion.state, HyperdeckState::default());
        assert_eq!(conversion.warnings.len(), 1);
    }

    #[test]
    fn test_commands_carry_object_and_time() {
        let differ = HyperdeckDiffer::new();
        let playing = convert(&differ, 1000, json!({"type": "transport", "status": "play", "clipId": "A"}));
        let ctx = DiffContext {
            time: 1000,
            now: 0,
            previous_time: 0,
        };

        let commands = differ.diff(&default_state(&differ), &playing, &ctx).unwrap();
        assert_eq!(commands[0].time, 1000);
        assert_eq!(commands[0].object_id.as_deref(), Some("obj1"));
        assert!(commands[0].context.new.is_some());
    }
}
