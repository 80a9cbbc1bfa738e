//! [Generator] for creating the initial intents.
//!
//! Every template contributes one seed per combination of its actions and
//! categories, each carrying a representative value for every known extra.
use std::cmp::max;

use libafl::prelude::Generator;

use crate::{
    intent_input::{ExtraInput, ExtraValue, IntentInput},
    intent_template::{IntentTemplate, TemplateStore},
};

/// The first legal instance of a template: first action, first category.
pub fn seed(template: &IntentTemplate) -> IntentInput {
    seed_for_index(template, 0)
}

/// Number of seeds a template yields, a combination of all the actions and
/// categories.
pub fn number_of_intents(template: &IntentTemplate) -> usize {
    max(1, template.actions.len()) * max(1, template.categories.len())
}

/// The seed at `index`, walking actions first and categories second.
pub fn seed_for_index(template: &IntentTemplate, index: usize) -> IntentInput {
    let action_count = max(1, template.actions.len());
    let action_index = index % action_count;
    let category_index = index / action_count;

    IntentInput {
        receiver_type: template.receiver_type,
        component_package: template.package_name().to_owned(),
        component_class: template.class_name().to_owned(),
        action: template.actions.get(action_index).cloned(),
        categories: template
            .categories
            .get(category_index)
            .cloned()
            .into_iter()
            .collect(),

        data: None,
        mime_type: None,
        flags: 0,

        extras: template
            .known_extras_keys
            .iter()
            .map(|(key, kind)| ExtraInput {
                key: key.clone(),
                value: ExtraValue::representative(*kind),
            })
            .collect(),
    }
}

/// Generates the starting intents of all templates of a session.
pub struct IntentGenerator {
    templates: Vec<IntentTemplate>,
    read_count: usize,
}

impl IntentGenerator {
    pub fn new(store: &TemplateStore) -> Self {
        Self {
            templates: store.templates().to_vec(),
            read_count: 0,
        }
    }

    /// Get the total number of base intents over all templates.
    pub fn number_of_intents(&self) -> usize {
        self.templates.iter().map(number_of_intents).sum()
    }
}

impl<S> Generator<IntentInput, S> for IntentGenerator {
    fn generate(&mut self, _state: &mut S) -> Result<IntentInput, libafl::Error> {
        // Go through all the templates and generate the intent inputs for each template.
        // Keep in mind that every template generates one or more intent inputs.
        let input = self
            .templates
            .iter()
            .flat_map(|t| (0..number_of_intents(t)).map(move |i| seed_for_index(t, i)))
            .nth(self.read_count)
            .ok_or_else(|| libafl::Error::unknown("All seed intents have been generated"))?;

        self.read_count += 1;

        Ok(input)
    }
}
