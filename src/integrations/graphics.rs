//! Graphics engine.
//!
//! Each layer carries at most one graphics element. Elements are either
//! internal (template name + data, owned by a show) or external "pilot"
//! elements addressed by id. New elements are prepared ahead of time, then
//! cued or taken on air at their start time; removed elements are taken
//! out. Commands for one layer run strictly in order.
//!
//! Lookahead layers only prepare; they never put anything on air.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::clock::Time;
use crate::device::{
    decode_content, order_release_first, Command, CommandContext, CommandPhase, Conversion,
    ConversionError, DiffContext, Phase, ProgrammingError, StateDiffer, Timed,
};
use crate::queue::SendMode;
use crate::timeline::{layers_for_device, Mappings, Snapshot};

pub const KIND: &str = "graphics";

/// How long before its start time an element is ideally prepared.
pub const DEFAULT_PREPARE_LEAD: Time = 1000;
/// Minimum gap between the previous commit and a prepare.
pub const DEFAULT_PREPARE_WAIT: Time = 50;

const CONTENT_TAGS: &[&str] = &[
    "element_internal",
    "element_pilot",
    "continue",
    "load_all_elements",
    "concept",
];

// ============================================================================
// Timeline content
// ============================================================================

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GraphicsContent {
    ElementInternal(InternalElementContent),
    ElementPilot(PilotElementContent),
    Continue(ContinueContent),
    LoadAllElements,
    Concept(ConceptContent),
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InternalElementContent {
    pub template_name: String,
    #[serde(default)]
    pub template_data: Vec<String>,
    pub show_name: String,
    #[serde(flatten)]
    pub playout: PlayoutContent,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PilotElementContent {
    pub template_vcp_id: u64,
    #[serde(flatten)]
    pub playout: PlayoutContent,
}

/// Fields shared by both element kinds.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayoutContent {
    #[serde(default)]
    pub channel_name: Option<String>,
    #[serde(default)]
    pub cue: bool,
    #[serde(default)]
    pub continue_step: i32,
    #[serde(default)]
    pub out_transition: Option<OutTransition>,
    #[serde(default)]
    pub delay_take_after_out_transition: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutTransition {
    /// Milliseconds the out animation takes.
    pub delay: Time,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContinueContent {
    /// Layer holding the element to continue.
    pub reference: String,
    #[serde(default)]
    pub direction: ContinueDirection,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContinueDirection {
    #[default]
    Forward,
    Reverse,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ConceptContent {
    pub concept: String,
}

// ============================================================================
// Device state
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ElementSource {
    Internal {
        template: String,
        data: Vec<String>,
        show: String,
    },
    Pilot {
        vcp_id: u64,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Element {
    pub source: ElementSource,
    pub channel: Option<String>,
    pub cue: bool,
    pub continue_step: i32,
    pub out_transition: Option<OutTransition>,
    pub delay_take_after_out_transition: bool,
}

impl Element {
    fn new(source: ElementSource, playout: PlayoutContent) -> Self {
        Self {
            source,
            channel: playout.channel_name,
            cue: playout.cue,
            continue_step: playout.continue_step,
            out_transition: playout.out_transition,
            delay_take_after_out_transition: playout.delay_take_after_out_transition,
        }
    }

    /// Same thing on air, ignoring continue position and out transition.
    fn same_playout(&self, other: &Element) -> bool {
        self.source == other.source
            && self.channel == other.channel
            && self.cue == other.cue
            && self.delay_take_after_out_transition == other.delay_take_after_out_transition
    }

    fn is_internal(&self) -> bool {
        matches!(self.source, ElementSource::Internal { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "content", rename_all = "snake_case")]
pub enum LayerContent {
    Element(Element),
    Continue {
        reference: String,
        direction: ContinueDirection,
        /// The referenced element, resolved during conversion.
        target: Option<Element>,
    },
    LoadAllElements,
    Concept {
        concept: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphicsLayer {
    pub object_id: String,
    pub lookahead: bool,
    pub content: LayerContent,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct GraphicsState {
    pub layers: BTreeMap<String, GraphicsLayer>,
}

// ============================================================================
// Commands
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum GraphicsCommand {
    Prepare {
        layer: String,
        element: Element,
    },
    Cue {
        layer: String,
        element: Element,
    },
    Take {
        layer: String,
        element: Element,
        /// Wait this long before taking, to let out transitions finish.
        delay: Option<Time>,
    },
    TakeOut {
        layer: String,
        element: Element,
        delay: Option<Time>,
    },
    Continue {
        layer: String,
        element: Element,
    },
    ContinueReverse {
        layer: String,
        element: Element,
    },
    LoadAllElements,
    SetConcept {
        concept: String,
    },
}

impl CommandPhase for GraphicsCommand {
    fn phase(&self) -> Phase {
        match self {
            GraphicsCommand::TakeOut { .. } => Phase::Release,
            GraphicsCommand::Prepare { .. }
            | GraphicsCommand::Cue { .. }
            | GraphicsCommand::LoadAllElements => Phase::Prepare,
            GraphicsCommand::Take { .. }
            | GraphicsCommand::Continue { .. }
            | GraphicsCommand::ContinueReverse { .. }
            | GraphicsCommand::SetConcept { .. } => Phase::Engage,
        }
    }
}

// ============================================================================
// Differ
// ============================================================================

#[derive(Debug, Clone)]
pub struct GraphicsDiffer {
    prepare_lead: Time,
    prepare_wait: Time,
}

impl Default for GraphicsDiffer {
    fn default() -> Self {
        Self {
            prepare_lead: DEFAULT_PREPARE_LEAD,
            prepare_wait: DEFAULT_PREPARE_WAIT,
        }
    }
}

impl GraphicsDiffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_prepare_timing(mut self, lead: Time, wait: Time) -> Self {
        self.prepare_lead = lead;
        self.prepare_wait = wait;
        self
    }

    fn layer_from_content(content: GraphicsContent) -> LayerContent {
        match content {
            GraphicsContent::ElementInternal(c) => LayerContent::Element(Element::new(
                ElementSource::Internal {
                    template: c.template_name,
                    data: c.template_data,
                    show: c.show_name,
                },
                c.playout,
            )),
            GraphicsContent::ElementPilot(c) => LayerContent::Element(Element::new(
                ElementSource::Pilot {
                    vcp_id: c.template_vcp_id,
                },
                c.playout,
            )),
            GraphicsContent::Continue(c) => LayerContent::Continue {
                reference: c.reference,
                direction: c.direction,
                target: None,
            },
            GraphicsContent::LoadAllElements => LayerContent::LoadAllElements,
            GraphicsContent::Concept(c) => LayerContent::Concept { concept: c.concept },
        }
    }

    /// Point continue layers at the element they continue.
    fn resolve_references(state: &mut GraphicsState, warnings: &mut Vec<ConversionError>) {
        let elements: BTreeMap<String, Option<Element>> = state
            .layers
            .iter()
            .map(|(id, layer)| {
                let element = match &layer.content {
                    LayerContent::Element(e) => Some(e.clone()),
                    _ => None,
                };
                (id.clone(), element)
            })
            .collect();

        for (id, layer) in state.layers.iter_mut() {
            if let LayerContent::Continue {
                reference, target, ..
            } = &mut layer.content
            {
                match elements.get(reference.as_str()) {
                    Some(Some(element)) => *target = Some(element.clone()),
                    Some(None) => warnings.push(ConversionError::InvalidContent {
                        layer: id.clone(),
                        reason: format!("layer '{}' holds no element to continue", reference),
                    }),
                    None => {}
                }
            }
        }
    }

    fn layer_commands(
        &self,
        layer_id: &str,
        old: Option<&GraphicsLayer>,
        new: &GraphicsLayer,
        time: Time,
        prepare_time: Time,
    ) -> Vec<(Time, GraphicsCommand)> {
        let layer = layer_id.to_string();
        let changed = old.map(|o| o.content != new.content).unwrap_or(true);

        match &new.content {
            LayerContent::Element(element) => {
                let old_element = old.and_then(|o| match &o.content {
                    LayerContent::Element(e) => Some(e),
                    _ => None,
                });

                // A pre-loaded element going live still has to be taken
                let was_lookahead = old.is_some_and(|o| o.lookahead);
                let promoted = was_lookahead && !new.lookahead;

                match old_element {
                    Some(previous) if previous.same_playout(element) && !promoted => {
                        if new.lookahead {
                            Vec::new()
                        } else if element.continue_step > previous.continue_step {
                            vec![(time, GraphicsCommand::Continue { layer, element: element.clone() })]
                        } else if element.continue_step < previous.continue_step {
                            vec![(
                                time,
                                GraphicsCommand::ContinueReverse { layer, element: element.clone() },
                            )]
                        } else {
                            Vec::new()
                        }
                    }
                    _ => {
                        let mut commands = Vec::new();
                        if let Some(previous) = old_element.filter(|_| new.lookahead && !was_lookahead) {
                            // The live element ended and only a pre-load replaces it
                            commands.push((
                                time,
                                GraphicsCommand::TakeOut {
                                    layer: layer.clone(),
                                    element: previous.clone(),
                                    delay: previous.out_transition.map(|t| t.delay),
                                },
                            ));
                        }
                        commands.push((
                            prepare_time,
                            GraphicsCommand::Prepare {
                                layer: layer.clone(),
                                element: element.clone(),
                            },
                        ));
                        if new.lookahead {
                            // Pre-load only
                        } else if element.cue {
                            commands.push((time, GraphicsCommand::Cue { layer, element: element.clone() }));
                        } else {
                            commands.push((
                                time,
                                GraphicsCommand::Take {
                                    layer,
                                    element: element.clone(),
                                    delay: None,
                                },
                            ));
                        }
                        commands
                    }
                }
            }
            LayerContent::Continue {
                direction,
                target: Some(element),
                ..
            } if changed && !new.lookahead => {
                let command = match direction {
                    ContinueDirection::Forward => GraphicsCommand::Continue {
                        layer,
                        element: element.clone(),
                    },
                    ContinueDirection::Reverse => GraphicsCommand::ContinueReverse {
                        layer,
                        element: element.clone(),
                    },
                };
                vec![(time, command)]
            }
            LayerContent::Continue { .. } => Vec::new(),
            LayerContent::LoadAllElements if changed => {
                vec![(time, GraphicsCommand::LoadAllElements)]
            }
            LayerContent::LoadAllElements => Vec::new(),
            LayerContent::Concept { concept } if changed => vec![(
                time,
                GraphicsCommand::SetConcept {
                    concept: concept.clone(),
                },
            )],
            LayerContent::Concept { .. } => Vec::new(),
        }
    }
}

impl StateDiffer for GraphicsDiffer {
    type State = GraphicsState;
    type Payload = GraphicsCommand;

    fn kind(&self) -> &'static str {
        KIND
    }

    fn default_state(&self) -> GraphicsState {
        GraphicsState::default()
    }

    fn convert(
        &self,
        device_id: &str,
        snapshot: &Snapshot,
        mappings: &Mappings,
    ) -> Result<Conversion<GraphicsState>, ProgrammingError> {
        let mut state = GraphicsState::default();
        let mut warnings = Vec::new();

        for (layer, object, _) in layers_for_device(device_id, snapshot, mappings) {
            let content: Option<GraphicsContent> =
                decode_content(KIND, layer, &object.content, CONTENT_TAGS, &mut warnings)?;
            if let Some(content) = content {
                state.layers.insert(
                    layer.to_string(),
                    GraphicsLayer {
                        object_id: object.object_id.clone(),
                        lookahead: object.is_lookahead,
                        content: Self::layer_from_content(content),
                    },
                );
            }
        }

        Self::resolve_references(&mut state, &mut warnings);
        Ok(Conversion::new(state, warnings))
    }

    fn diff(
        &self,
        old: &Timed<GraphicsState>,
        new: &Timed<GraphicsState>,
        ctx: &DiffContext,
    ) -> Result<Vec<Command<GraphicsCommand>>, ProgrammingError> {
        let prepare_time = ctx.prepare_time(self.prepare_lead, self.prepare_wait);
        let mut on_air = Vec::new();
        let mut lookahead = Vec::new();

        for (layer_id, new_layer) in &new.state.layers {
            let old_layer = old.state.layers.get(layer_id);
            let target = if new_layer.lookahead { &mut lookahead } else { &mut on_air };
            for (time, payload) in
                self.layer_commands(layer_id, old_layer, new_layer, ctx.time, prepare_time)
            {
                let context = CommandContext::new(format!("layer {} changed", layer_id))
                    .with_change(&old_layer, new_layer);
                target.push(
                    Command::new(time, payload, context)
                        .for_object(Some(new_layer.object_id.clone()))
                        .in_group(layer_id.clone()),
                );
            }
        }

        for (layer_id, old_layer) in &old.state.layers {
            if new.state.layers.contains_key(layer_id) {
                continue;
            }
            // A pre-loaded element was never on air
            if old_layer.lookahead {
                continue;
            }
            let LayerContent::Element(element) = &old_layer.content else {
                continue;
            };
            let payload = GraphicsCommand::TakeOut {
                layer: layer_id.clone(),
                element: element.clone(),
                delay: element.out_transition.map(|t| t.delay),
            };
            let context = CommandContext::new(format!("layer {} cleared", layer_id))
                .with_change(old_layer, &Option::<GraphicsLayer>::None);
            on_air.push(
                Command::new(ctx.time, payload, context)
                    .for_object(Some(old_layer.object_id.clone()))
                    .in_group(layer_id.clone()),
            );
        }

        on_air.extend(lookahead);
        let mut commands = order_release_first(on_air);

        // Give out transitions time to finish before the next take
        let longest_out = commands
            .iter()
            .filter_map(|c| match &c.payload {
                GraphicsCommand::TakeOut { delay, .. } => *delay,
                _ => None,
            })
            .max()
            .unwrap_or(0);
        if longest_out > 0 {
            for command in &mut commands {
                if let GraphicsCommand::Take { element, delay, .. } = &mut command.payload {
                    if element.is_internal() || element.delay_take_after_out_transition {
                        *delay = Some(longest_out + 20);
                    }
                }
            }
        }

        Ok(commands)
    }

    fn send_mode(&self) -> SendMode {
        SendMode::InOrder
    }
}
