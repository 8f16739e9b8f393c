//! Vision mixer.
//!
//! A mixer has numbered mix effect buses (program/preview + transition),
//! downstream keyers and aux outputs. Each layer mapping addresses one of
//! them; content must match the mapped resource.
//!
//! ```json
//! { "mappingType": "mix_effect", "index": 0 }
//! { "type": "me", "inputMode": { "mode": "direct", "input": 3, "transition": "mix" } }
//! ```

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::device::{
    decode_content, decode_mapping, order_release_first, Command, CommandContext, CommandPhase,
    Conversion, ConversionError, DiffContext, Phase, ProgrammingError, StateDiffer, Timed,
};
use crate::timeline::{layers_for_device, Mappings, Snapshot};

pub const KIND: &str = "mixer";

const CONTENT_TAGS: &[&str] = &["me", "dsk", "aux"];

/// Source number of black.
pub const BLACK: u16 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(tag = "mappingType", rename_all = "snake_case")]
pub enum MixerMapping {
    MixEffect { index: u8 },
    DownstreamKeyer { index: u8 },
    Aux { index: u8 },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransitionStyle {
    #[default]
    Cut,
    Mix,
    Dip,
    Wipe,
    Sting,
}

/// How a mix effect bus is driven.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum InputMode {
    /// Put `input` on program using `transition`.
    Direct {
        input: u16,
        #[serde(default)]
        transition: TransitionStyle,
    },
    /// Set both buses explicitly; program changes cut.
    PreviewProgram { program: u16, preview: u16 },
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MixerContent {
    Me(MixEffectContent),
    Dsk(KeyerContent),
    Aux(AuxContent),
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MixEffectContent {
    pub input_mode: InputMode,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyerContent {
    pub on_air: bool,
    #[serde(default)]
    pub fill: Option<u16>,
    #[serde(default)]
    pub key: Option<u16>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct AuxContent {
    pub input: u16,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MixEffectState {
    pub program: u16,
    /// `None` when the timeline does not care what sits on preview.
    pub preview: Option<u16>,
    pub transition: TransitionStyle,
}

impl MixEffectState {
    fn from_mode(mode: InputMode) -> Self {
        match mode {
            InputMode::Direct { input, transition } => Self {
                program: input,
                preview: None,
                transition,
            },
            InputMode::PreviewProgram { program, preview } => Self {
                program,
                preview: Some(preview),
                transition: TransitionStyle::Cut,
            },
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyerState {
    pub on_air: bool,
    pub fill: Option<u16>,
    pub key: Option<u16>,
}

/// Resources absent from a map are in their default state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MixerState {
    pub mix_effects: BTreeMap<u8, MixEffectState>,
    pub keyers: BTreeMap<u8, KeyerState>,
    pub aux: BTreeMap<u8, u16>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum MixerCommand {
    Cut { me: u8, input: u16 },
    SetPreview { me: u8, input: u16 },
    AutoTransition { me: u8 },
    SetTransitionStyle { me: u8, style: TransitionStyle },
    DskOnAir { keyer: u8, on_air: bool },
    DskSources { keyer: u8, fill: Option<u16>, key: Option<u16> },
    AuxSource { aux: u8, input: u16 },
}

impl CommandPhase for MixerCommand {
    fn phase(&self) -> Phase {
        match self {
            MixerCommand::DskOnAir { on_air: false, .. } => Phase::Release,
            MixerCommand::SetPreview { .. }
            | MixerCommand::SetTransitionStyle { .. }
            | MixerCommand::DskSources { .. } => Phase::Prepare,
            MixerCommand::Cut { .. }
            | MixerCommand::AutoTransition { .. }
            | MixerCommand::DskOnAir { on_air: true, .. }
            | MixerCommand::AuxSource { .. } => Phase::Engage,
        }
    }
}

fn union_keys<'a, V>(a: &'a BTreeMap<u8, V>, b: &'a BTreeMap<u8, V>) -> BTreeSet<u8> {
    a.keys().chain(b.keys()).copied().collect()
}

#[derive(Debug, Clone, Default)]
pub struct MixerDiffer;

impl MixerDiffer {
    pub fn new() -> Self {
        Self
    }

    fn mix_effect_commands(me: u8, old: &MixEffectState, new: &MixEffectState) -> Vec<MixerCommand> {
        let mut commands = Vec::new();
        if old.transition != new.transition {
            commands.push(MixerCommand::SetTransitionStyle {
                me,
                style: new.transition,
            });
        }

        let program_changed = old.program != new.program;
        if program_changed {
            match new.transition {
                TransitionStyle::Cut => commands.push(MixerCommand::Cut {
                    me,
                    input: new.program,
                }),
                _ => {
                    commands.push(MixerCommand::SetPreview {
                        me,
                        input: new.program,
                    });
                    commands.push(MixerCommand::AutoTransition { me });
                }
            }
        }

        if let Some(preview) = new.preview {
            // A transition swaps the buses, so preview must be restored after it
            let swapped = program_changed && new.transition != TransitionStyle::Cut;
            if old.preview != new.preview || swapped {
                commands.push(MixerCommand::SetPreview { me, input: preview });
            }
        }
        commands
    }

    fn keyer_commands(keyer: u8, old: &KeyerState, new: &KeyerState) -> Vec<MixerCommand> {
        let mut commands = Vec::new();
        let sources_set = new.fill.is_some() || new.key.is_some();
        if sources_set && (old.fill != new.fill || old.key != new.key) {
            commands.push(MixerCommand::DskSources {
                keyer,
                fill: new.fill,
                key: new.key,
            });
        }
        if old.on_air != new.on_air {
            commands.push(MixerCommand::DskOnAir {
                keyer,
                on_air: new.on_air,
            });
        }
        commands
    }
}

impl StateDiffer for MixerDiffer {
    type State = MixerState;
    type Payload = MixerCommand;

    fn kind(&self) -> &'static str {
        KIND
    }

    fn default_state(&self) -> MixerState {
        MixerState::default()
    }

    fn convert(
        &self,
        device_id: &str,
        snapshot: &Snapshot,
        mappings: &Mappings,
    ) -> Result<Conversion<MixerState>, ProgrammingError> {
        let mut state = MixerState::default();
        let mut warnings = Vec::new();

        for (layer, object, mapping) in layers_for_device(device_id, snapshot, mappings) {
            let Some(target) = decode_mapping::<MixerMapping>(layer, &mapping.options, &mut warnings)
            else {
                continue;
            };
            let Some(content) =
                decode_content::<MixerContent>(KIND, layer, &object.content, CONTENT_TAGS, &mut warnings)?
            else {
                continue;
            };

            match (target, content) {
                (MixerMapping::MixEffect { index }, MixerContent::Me(me)) => {
                    state
                        .mix_effects
                        .insert(index, MixEffectState::from_mode(me.input_mode));
                }
                (MixerMapping::DownstreamKeyer { index }, MixerContent::Dsk(dsk)) => {
                    state.keyers.insert(
                        index,
                        KeyerState {
                            on_air: dsk.on_air,
                            fill: dsk.fill,
                            key: dsk.key,
                        },
                    );
                }
                (MixerMapping::Aux { index }, MixerContent::Aux(aux)) => {
                    state.aux.insert(index, aux.input);
                }
                (target, _) => warnings.push(ConversionError::InvalidContent {
                    layer: layer.to_string(),
                    reason: format!("content does not fit mapping {:?}", target),
                }),
            }
        }

        Ok(Conversion::new(state, warnings))
    }

    fn diff(
        &self,
        old: &Timed<MixerState>,
        new: &Timed<MixerState>,
        ctx: &DiffContext,
    ) -> Result<Vec<Command<MixerCommand>>, ProgrammingError> {
        let mut commands = Vec::new();
        let mut push = |context: CommandContext, payloads: Vec<MixerCommand>| {
            for payload in payloads {
                commands.push(Command::new(ctx.time, payload, context.clone()));
            }
        };

        let (old_s, new_s) = (&old.state, &new.state);

        for me in union_keys(&old_s.mix_effects, &new_s.mix_effects) {
            let o = old_s.mix_effects.get(&me).copied().unwrap_or_default();
            let n = new_s.mix_effects.get(&me).copied().unwrap_or_default();
            push(
                CommandContext::new(format!("mix effect {} changed", me)).with_change(&o, &n),
                Self::mix_effect_commands(me, &o, &n),
            );
        }

        for keyer in union_keys(&old_s.keyers, &new_s.keyers) {
            let o = old_s.keyers.get(&keyer).copied().unwrap_or_default();
            let n = new_s.keyers.get(&keyer).copied().unwrap_or_default();
            push(
                CommandContext::new(format!("keyer {} changed", keyer)).with_change(&o, &n),
                Self::keyer_commands(keyer, &o, &n),
            );
        }

        for aux in union_keys(&old_s.aux, &new_s.aux) {
            let o = old_s.aux.get(&aux).copied().unwrap_or(BLACK);
            let n = new_s.aux.get(&aux).copied().unwrap_or(BLACK);
            if o != n {
                push(
                    CommandContext::new(format!("aux {} changed", aux)).with_change(&o, &n),
                    vec![MixerCommand::AuxSource { aux, input: n }],
                );
            }
        }

        Ok(order_release_first(commands))
    }
}
