use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Client-visible cover name mapped onto a real upstream model and a system prompt.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Persona {
    pub name: String,
    pub upstream_model: String,
    pub system_prompt: String,
}

impl Persona {
    pub fn new(
        name: impl Into<String>,
        upstream_model: impl Into<String>,
        system_prompt: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            upstream_model: upstream_model.into(),
            system_prompt: system_prompt.into(),
        }
    }
}

/// Immutable persona table, looked up by the request's `model` field.
#[derive(Clone, Debug, Default)]
pub struct PersonaRegistry {
    personas: BTreeMap<String, Arc<Persona>>,
}

impl PersonaRegistry {
    pub fn new(personas: impl IntoIterator<Item = Persona>) -> Self {
        let personas = personas
            .into_iter()
            .map(|persona| (persona.name.clone(), Arc::new(persona)))
            .collect();
        Self { personas }
    }

    /// The knights of the Round Table.
    pub fn round_table() -> Self {
        Self::new(
            ROUND_TABLE
                .iter()
                .map(|(name, model, prompt)| Persona::new(*name, *model, *prompt)),
        )
    }

    pub fn get(&self, name: &str) -> Option<Arc<Persona>> {
        self.personas.get(name).cloned()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.personas.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.personas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.personas.is_empty()
    }
}

const ROUND_TABLE: &[(&str, &str, &str)] = &[
    (
        "arthur",
        "gpt-4o-mini-arthur",
        "You are King Arthur, the wise and just ruler of Camelot. Respond with nobility and leadership.",
    ),
    (
        "lancelot",
        "gpt-4o-mini-lancelot",
        "You are Sir Lancelot, the bravest and most skilled knight. Respond with chivalry and courage.",
    ),
    (
        "galahad",
        "gpt-4o-mini-galahad",
        "You are Sir Galahad, the purest and most virtuous knight. Respond with piety and honor.",
    ),
    (
        "gawain",
        "gpt-4o-mini-gawain",
        "You are Sir Gawain, known for your courtesy and loyalty. Respond with politeness and determination.",
    ),
    (
        "percival",
        "gpt-4o-mini-percival",
        "You are Sir Percival, naive but pure-hearted. Respond with innocence and curiosity.",
    ),
    (
        "tristan",
        "gpt-4o-mini-tristan",
        "You are Sir Tristan, the romantic and tragic figure. Respond with passion and melancholy.",
    ),
    (
        "bors",
        "gpt-4o-mini-bors",
        "You are Sir Bors, known for your loyalty and level-headedness. Respond with practicality and wisdom.",
    ),
    (
        "kay",
        "gpt-4o-mini-kay",
        "You are Sir Kay, Arthur's foster brother and seneschal. Respond with sarcasm and efficiency.",
    ),
];
