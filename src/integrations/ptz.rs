//! Pan/tilt/zoom camera head: preset recall and recall speed.
//!
//! Each layer maps to one of the two head settings:
//!
//! ```json
//! { "mappingType": "presetMem" }   with content { "type": "presetMem", "preset": 3 }
//! { "mappingType": "presetSpeed" } with content { "type": "presetSpeed", "speed": 250 }
//! ```
//!
//! A setting missing from the timeline is left where it is; the head has no
//! idle preset to return to.

use serde::{Deserialize, Serialize};

use crate::device::{
    decode_content, decode_mapping, Command, CommandContext, CommandPhase, Conversion,
    ConversionError, DiffContext, Phase, ProgrammingError, StateDiffer, Timed,
};
use crate::queue::SendMode;
use crate::timeline::{layers_for_device, Mappings, Snapshot};

pub const KIND: &str = "ptz";

const CONTENT_TAGS: &[&str] = &["presetMem", "presetSpeed"];

/// Ordering group for every head command.
const HEAD_GROUP: &str = "head";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(tag = "mappingType", rename_all = "camelCase")]
pub enum PtzMapping {
    PresetMem,
    PresetSpeed,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum PtzContent {
    PresetMem { preset: u32 },
    PresetSpeed { speed: u32 },
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PtzState {
    pub preset: Option<u32>,
    pub speed: Option<u32>,
    /// Timeline object that last set either value.
    pub object_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum PtzCommand {
    SetSpeed { speed: u32 },
    RecallPreset { preset: u32 },
}

impl CommandPhase for PtzCommand {
    fn phase(&self) -> Phase {
        match self {
            PtzCommand::SetSpeed { .. } => Phase::Prepare,
            PtzCommand::RecallPreset { .. } => Phase::Engage,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct PtzDiffer;

impl PtzDiffer {
    pub fn new() -> Self {
        Self
    }
}

impl StateDiffer for PtzDiffer {
    type State = PtzState;
    type Payload = PtzCommand;

    fn kind(&self) -> &'static str {
        KIND
    }

    fn default_state(&self) -> PtzState {
        PtzState::default()
    }

    fn convert(
        &self,
        device_id: &str,
        snapshot: &Snapshot,
        mappings: &Mappings,
    ) -> Result<Conversion<PtzState>, ProgrammingError> {
        let mut state = PtzState::default();
        let mut warnings = Vec::new();

        for (layer, object, mapping) in layers_for_device(device_id, snapshot, mappings) {
            let Some(mapping) = decode_mapping::<PtzMapping>(layer, &mapping.options, &mut warnings)
            else {
                continue;
            };
            let Some(content) =
                decode_content::<PtzContent>(KIND, layer, &object.content, CONTENT_TAGS, &mut warnings)?
            else {
                continue;
            };

            match (mapping, content) {
                (PtzMapping::PresetMem, PtzContent::PresetMem { preset }) => state.preset = Some(preset),
                (PtzMapping::PresetSpeed, PtzContent::PresetSpeed { speed }) => state.speed = Some(speed),
                (mapping, _) => {
                    warnings.push(ConversionError::InvalidContent {
                        layer: layer.to_string(),
                        reason: format!("content does not fit a {:?} mapping", mapping),
                    });
                    continue;
                }
            }
            state.object_id = Some(object.object_id.clone());
        }

        Ok(Conversion::new(state, warnings))
    }

    fn diff(
        &self,
        old: &Timed<PtzState>,
        new: &Timed<PtzState>,
        ctx: &DiffContext,
    ) -> Result<Vec<Command<PtzCommand>>, ProgrammingError> {
        let mut payloads = Vec::new();

        // Speed first: it applies to the recall that follows
        if let Some(speed) = new.state.speed.filter(|s| old.state.speed != Some(*s)) {
            payloads.push((PtzCommand::SetSpeed { speed }, format!("speed {:?} -> {}", old.state.speed, speed)));
        }
        if let Some(preset) = new.state.preset.filter(|p| old.state.preset != Some(*p)) {
            payloads.push((
                PtzCommand::RecallPreset { preset },
                format!("preset {:?} -> {}", old.state.preset, preset),
            ));
        }

        Ok(payloads
            .into_iter()
            .map(|(payload, description)| {
                let context = CommandContext::new(description).with_change(&old.state, &new.state);
                Command::new(ctx.time, payload, context)
                    .for_object(new.state.object_id.clone())
                    .in_group(HEAD_GROUP)
            })
            .collect())
    }

    fn send_mode(&self) -> SendMode {
        SendMode::InOrder
    }
}
