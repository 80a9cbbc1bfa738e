//! [Mutator]s for [IntentInput].
//!
//! Typed mutators perturb the bytes behind one extra (or the data URI) with
//! libafl's byte mutations and then cut the bytes back to a size the kind can
//! hold. Structural mutators add, remove and rename extras and change the
//! action, categories and flags. [MutationEngine] never touches the parent
//! input: it mutates a clone, so stored corpus entries stay immutable.

use std::marker::PhantomData;

use libafl::{
    prelude::{
        tuple_list, tuple_list_type, BytesInput, HasBytesVec, MutationResult, Mutator, Named, Rand,
        StdRand, StdScheduledMutator,
    },
    state::{HasMaxSize, HasRand},
};
use strum::IntoEnumIterator;

use crate::{
    intent_input::{
        ExtraInput, ExtraKind, ExtraValue, IntentInput, MimeType, URIInput, URIScheme, URISuffix,
    },
    intent_template::{IntentTemplate, TemplateStore},
    util::{COMMON_ACTIONS, COMMON_CATEGORIES, COMMON_EXTRA_KEYS},
};

/// Upper bound on the number of extras a mutated intent carries.
const MAX_EXTRAS: usize = 10;

/// Upper bound on the size of a single mutated byte buffer.
const MAX_BUFFER_SIZE: usize = 4096;

/// Bounds on how many mutations one havoc round stacks.
const HAVOC_MIN_STACK: u64 = 2;
const HAVOC_MAX_STACK: u64 = 8;

/// Access to the session's templates from the mutation state.
pub trait HasTemplates {
    fn templates(&self) -> &TemplateStore;
}

/// Everything the mutators draw on: randomness, size limit, templates.
pub struct MutationState {
    rand: StdRand,
    max_size: usize,
    templates: TemplateStore,
}

impl MutationState {
    pub fn new(templates: TemplateStore, seed: u64) -> Self {
        Self {
            rand: StdRand::with_seed(seed),
            max_size: MAX_BUFFER_SIZE,
            templates,
        }
    }
}

impl HasRand for MutationState {
    type Rand = StdRand;

    fn rand(&self) -> &Self::Rand {
        &self.rand
    }

    fn rand_mut(&mut self) -> &mut Self::Rand {
        &mut self.rand
    }
}

impl HasMaxSize for MutationState {
    fn max_size(&self) -> usize {
        self.max_size
    }

    fn set_max_size(&mut self, max_size: usize) {
        self.max_size = max_size;
    }
}

impl HasTemplates for MutationState {
    fn templates(&self) -> &TemplateStore {
        &self.templates
    }
}

/// Mutator that randomly modifies the flags attribute of the intent.
pub struct IntentRandomFlagMutator<S>
where
    S: HasRand,
{
    phantom: PhantomData<S>,
}

impl<S> IntentRandomFlagMutator<S>
where
    S: HasRand,
{
    pub fn new() -> Self {
        Self {
            phantom: PhantomData,
        }
    }
}

impl<S> Named for IntentRandomFlagMutator<S>
where
    S: HasRand,
{
    fn name(&self) -> &str {
        "IntentRandomFlagMutator"
    }
}

impl<S> Mutator<IntentInput, S> for IntentRandomFlagMutator<S>
where
    S: HasRand,
{
    fn mutate(
        &mut self,
        state: &mut S,
        input: &mut IntentInput,
        _stage_idx: i32,
    ) -> Result<MutationResult, libafl::Error> {
        // Only the low flags (uri grants, stopped-package handling, debug
        // resolution) are safe to send from the shell.
        let bit = 1 << state.rand_mut().below(8);
        input.flags ^= bit;
        Ok(MutationResult::Mutated)
    }
}

/// Mutator that randomly modifies the data attribute of the intent.
pub struct IntentRandomDataMutator<S>
where
    S: HasRand + HasMaxSize,
{
    backing_byte_mutator: StdScheduledMutator<BytesInput, BaseByteMutationsType, S>,
}

impl<S> IntentRandomDataMutator<S>
where
    S: HasRand + HasMaxSize,
{
    pub fn new() -> Self {
        Self {
            backing_byte_mutator: StdScheduledMutator::new(base_byte_mutations()),
        }
    }
}

impl<S> Named for IntentRandomDataMutator<S>
where
    S: HasRand + HasMaxSize,
{
    fn name(&self) -> &str {
        "IntentRandomDataMutator"
    }
}

impl<S> Mutator<IntentInput, S> for IntentRandomDataMutator<S>
where
    S: HasRand + HasMaxSize,
{
    fn mutate(
        &mut self,
        state: &mut S,
        input: &mut IntentInput,
        stage_idx: i32,
    ) -> Result<MutationResult, libafl::Error> {
        match &mut input.data {
            Some(uri_input) => match state.rand_mut().between(1, 3) {
                1 => {
                    // Mutate the scheme
                    uri_input.scheme = state.rand_mut().choose(URIScheme::iter());
                }
                2 => {
                    // Mutate the suffix
                    uri_input.suffix = state.rand_mut().choose(URISuffix::iter());
                }
                _ => {
                    // Mutate the content
                    return self.backing_byte_mutator.mutate(
                        state,
                        &mut uri_input.content,
                        stage_idx,
                    );
                }
            },
            None => {
                let mut uri_input = URIInput::new(
                    state.rand_mut().choose(URIScheme::iter()),
                    state.rand_mut().choose(URISuffix::iter()),
                );

                self.backing_byte_mutator
                    .mutate(state, &mut uri_input.content, stage_idx)?;

                input.data = Some(uri_input);
            }
        }

        Ok(MutationResult::Mutated)
    }
}

/// Mutator that modifies the type attribute of the intent.
pub struct IntentRandomMimeTypeMutator<S>
where
    S: HasRand,
{
    phantom: PhantomData<S>,
}

impl<S> IntentRandomMimeTypeMutator<S>
where
    S: HasRand,
{
    pub fn new() -> Self {
        Self {
            phantom: PhantomData,
        }
    }
}

impl<S> Named for IntentRandomMimeTypeMutator<S>
where
    S: HasRand,
{
    fn name(&self) -> &str {
        "IntentRandomMimeTypeMutator"
    }
}

impl<S> Mutator<IntentInput, S> for IntentRandomMimeTypeMutator<S>
where
    S: HasRand,
{
    fn mutate(
        &mut self,
        state: &mut S,
        input: &mut IntentInput,
        _stage_idx: i32,
    ) -> Result<MutationResult, libafl::Error> {
        // Choose a random mimetype from the enum.
        input.mime_type = Some(state.rand_mut().choose(MimeType::iter()));
        Ok(MutationResult::Mutated)
    }
}

/// Mutator that adds an extra whose key the template or the common key table
/// declares, with the declared kind.
pub struct IntentRandomAddExtraMutator<S>
where
    S: HasRand + HasMaxSize + HasTemplates,
{
    backing_byte_mutator: StdScheduledMutator<BytesInput, BaseByteMutationsType, S>,
}

impl<S> Named for IntentRandomAddExtraMutator<S>
where
    S: HasRand + HasMaxSize + HasTemplates,
{
    fn name(&self) -> &str {
        "IntentRandomAddExtraMutator"
    }
}

impl<S> IntentRandomAddExtraMutator<S>
where
    S: HasRand + HasMaxSize + HasTemplates,
{
    pub fn new() -> Self {
        Self {
            backing_byte_mutator: StdScheduledMutator::new(base_byte_mutations()),
        }
    }
}

impl<S> Mutator<IntentInput, S> for IntentRandomAddExtraMutator<S>
where
    S: HasRand + HasMaxSize + HasTemplates,
{
    fn mutate(
        &mut self,
        state: &mut S,
        input: &mut IntentInput,
        stage_idx: i32,
    ) -> Result<MutationResult, libafl::Error> {
        if input.extras.len() >= MAX_EXTRAS {
            return Ok(MutationResult::Skipped);
        }

        let template = state.templates().template_for(input).cloned();
        let candidates = declared_extra_keys(template.as_ref());
        let (key, kind) = state.rand_mut().choose(candidates);

        let mut extra = ExtraInput {
            key,
            value: ExtraValue::representative(kind),
        };
        randomize_uri(state, &mut extra.value);
        mutate_content(&mut self.backing_byte_mutator, state, &mut extra, stage_idx)?;

        input.extras.push(extra);
        Ok(MutationResult::Mutated)
    }
}

/// Mutator that adds an extra under a key the template does not declare, with
/// an arbitrary kind, to exercise how the receiver handles undeclared extras.
pub struct IntentAddUnknownExtraMutator<S>
where
    S: HasRand + HasMaxSize + HasTemplates,
{
    backing_byte_mutator: StdScheduledMutator<BytesInput, BaseByteMutationsType, S>,
}

impl<S> Named for IntentAddUnknownExtraMutator<S>
where
    S: HasRand + HasMaxSize + HasTemplates,
{
    fn name(&self) -> &str {
        "IntentAddUnknownExtraMutator"
    }
}

impl<S> IntentAddUnknownExtraMutator<S>
where
    S: HasRand + HasMaxSize + HasTemplates,
{
    pub fn new() -> Self {
        Self {
            backing_byte_mutator: StdScheduledMutator::new(base_byte_mutations()),
        }
    }
}

impl<S> Mutator<IntentInput, S> for IntentAddUnknownExtraMutator<S>
where
    S: HasRand + HasMaxSize + HasTemplates,
{
    fn mutate(
        &mut self,
        state: &mut S,
        input: &mut IntentInput,
        stage_idx: i32,
    ) -> Result<MutationResult, libafl::Error> {
        if input.extras.len() >= MAX_EXTRAS {
            return Ok(MutationResult::Skipped);
        }

        let template = state.templates().template_for(input).cloned();
        let key = undeclared_extra_key(state, template.as_ref());
        let kind = state.rand_mut().choose(ExtraKind::all());

        let mut extra = ExtraInput {
            key,
            value: ExtraValue::representative(kind),
        };
        randomize_uri(state, &mut extra.value);
        mutate_content(&mut self.backing_byte_mutator, state, &mut extra, stage_idx)?;

        input.extras.push(extra);
        Ok(MutationResult::Mutated)
    }
}

/// Mutator that drops one extra.
pub struct IntentRemoveExtraMutator<S>
where
    S: HasRand,
{
    phantom: PhantomData<S>,
}

impl<S> Named for IntentRemoveExtraMutator<S>
where
    S: HasRand,
{
    fn name(&self) -> &str {
        "IntentRemoveExtraMutator"
    }
}

impl<S> IntentRemoveExtraMutator<S>
where
    S: HasRand,
{
    pub fn new() -> Self {
        Self {
            phantom: PhantomData,
        }
    }
}

impl<S> Mutator<IntentInput, S> for IntentRemoveExtraMutator<S>
where
    S: HasRand,
{
    fn mutate(
        &mut self,
        state: &mut S,
        input: &mut IntentInput,
        _stage_idx: i32,
    ) -> Result<MutationResult, libafl::Error> {
        if input.extras.is_empty() {
            return Ok(MutationResult::Skipped);
        }

        let index = state.rand_mut().below(input.extras.len() as u64) as usize;
        input.extras.remove(index);
        Ok(MutationResult::Mutated)
    }
}

/// Mutator that randomly modifies the key attribute of the extra. Moving an
/// extra onto a key the template declares converts it to the declared kind.
pub struct IntentRandomExtraKeyMutator<S>
where
    S: HasRand + HasTemplates,
{
    phantom: PhantomData<S>,
}

impl<S> Named for IntentRandomExtraKeyMutator<S>
where
    S: HasRand + HasTemplates,
{
    fn name(&self) -> &str {
        "IntentRandomExtraKeyMutator"
    }
}

impl<S> IntentRandomExtraKeyMutator<S>
where
    S: HasRand + HasTemplates,
{
    pub fn new() -> Self {
        Self {
            phantom: PhantomData,
        }
    }
}

impl<S> Mutator<IntentInput, S> for IntentRandomExtraKeyMutator<S>
where
    S: HasRand + HasTemplates,
{
    fn mutate(
        &mut self,
        state: &mut S,
        input: &mut IntentInput,
        _stage_idx: i32,
    ) -> Result<MutationResult, libafl::Error> {
        let template = state.templates().template_for(input).cloned();

        let Some(extra) = get_extra_to_mutate(state, input) else {
            return Ok(MutationResult::Skipped);
        };

        let extra_keys: Vec<String> = declared_extra_keys(template.as_ref())
            .into_iter()
            .map(|(key, _)| key)
            .collect();
        let extra_key = state.rand_mut().choose(extra_keys);

        if let Some(kind) = template
            .as_ref()
            .and_then(|template| template.known_extra_kind(&extra_key))
        {
            extra.value = extra.value.clone().retyped(kind);
        }
        extra.key = extra_key;

        Ok(MutationResult::Mutated)
    }
}

/// Mutator that randomly modifies the content of an extra: bit flips,
/// arithmetic and interesting values for numbers, byte substitution and
/// length changes for strings, element-wise or whole-buffer changes for
/// arrays.
pub struct IntentRandomExtraContentMutator<S>
where
    S: HasRand + HasMaxSize,
{
    backing_byte_mutator: StdScheduledMutator<BytesInput, BaseByteMutationsType, S>,
}

impl<S> Named for IntentRandomExtraContentMutator<S>
where
    S: HasRand + HasMaxSize,
{
    fn name(&self) -> &str {
        "IntentRandomExtraContentMutator"
    }
}

impl<S> IntentRandomExtraContentMutator<S>
where
    S: HasRand + HasMaxSize,
{
    pub fn new() -> Self {
        Self {
            backing_byte_mutator: StdScheduledMutator::new(base_byte_mutations()),
        }
    }
}

impl<S> Mutator<IntentInput, S> for IntentRandomExtraContentMutator<S>
where
    S: HasRand + HasMaxSize,
{
    fn mutate(
        &mut self,
        state: &mut S,
        input: &mut IntentInput,
        stage_idx: i32,
    ) -> Result<MutationResult, libafl::Error> {
        let Some(extra) = get_extra_to_mutate(state, input) else {
            return Ok(MutationResult::Skipped);
        };

        let element_width = match &extra.value {
            ExtraValue::Array(kind, _) | ExtraValue::ArrayList(kind, _) => kind.width(),
            _ => None,
        };

        let len = extra.value.content_buffer().bytes().len();
        let element_wise = state.rand_mut().below(2) == 0;

        match element_width {
            Some(width) if element_wise && len >= width => {
                mutate_element(&mut self.backing_byte_mutator, state, extra, width, stage_idx)
            }
            _ => mutate_content(&mut self.backing_byte_mutator, state, extra, stage_idx),
        }
    }
}

/// Mutator that randomly modifies the scheme attribute of a URI extra.
pub struct IntentRandomExtraSchemeMutator<S>
where
    S: HasRand,
{
    phantom: PhantomData<S>,
}

impl<S> Named for IntentRandomExtraSchemeMutator<S>
where
    S: HasRand,
{
    fn name(&self) -> &str {
        "IntentRandomExtraSchemeMutator"
    }
}

impl<S> IntentRandomExtraSchemeMutator<S>
where
    S: HasRand,
{
    pub fn new() -> Self {
        Self {
            phantom: PhantomData,
        }
    }
}

impl<S> Mutator<IntentInput, S> for IntentRandomExtraSchemeMutator<S>
where
    S: HasRand,
{
    fn mutate(
        &mut self,
        state: &mut S,
        input: &mut IntentInput,
        _stage_idx: i32,
    ) -> Result<MutationResult, libafl::Error> {
        let Some(extra) = get_extra_to_mutate(state, input) else {
            return Ok(MutationResult::Skipped);
        };

        // Mutate the scheme
        Ok(match &mut extra.value {
            ExtraValue::URI(uri) => {
                uri.scheme = state.rand_mut().choose(URIScheme::iter());
                MutationResult::Mutated
            }
            _ => MutationResult::Skipped,
        })
    }
}

/// Mutator that randomly modifies the suffix attribute of a URI extra.
pub struct IntentRandomExtraSuffixMutator<S>
where
    S: HasRand,
{
    phantom: PhantomData<S>,
}

impl<S> Named for IntentRandomExtraSuffixMutator<S>
where
    S: HasRand,
{
    fn name(&self) -> &str {
        "IntentRandomExtraSuffixMutator"
    }
}

impl<S> IntentRandomExtraSuffixMutator<S>
where
    S: HasRand,
{
    pub fn new() -> Self {
        Self {
            phantom: PhantomData,
        }
    }
}

impl<S> Mutator<IntentInput, S> for IntentRandomExtraSuffixMutator<S>
where
    S: HasRand,
{
    fn mutate(
        &mut self,
        state: &mut S,
        input: &mut IntentInput,
        _stage_idx: i32,
    ) -> Result<MutationResult, libafl::Error> {
        let Some(extra) = get_extra_to_mutate(state, input) else {
            return Ok(MutationResult::Skipped);
        };

        // Mutate the suffix
        Ok(match &mut extra.value {
            ExtraValue::URI(uri) => {
                uri.suffix = state.rand_mut().choose(URISuffix::iter());
                MutationResult::Mutated
            }
            _ => MutationResult::Skipped,
        })
    }
}

/// Mutator that switches the action to another declared action, a common
/// action, or a byte-mutated variant of the current one.
pub struct IntentRandomActionMutator<S>
where
    S: HasRand + HasMaxSize + HasTemplates,
{
    backing_byte_mutator: StdScheduledMutator<BytesInput, BaseByteMutationsType, S>,
}

impl<S> Named for IntentRandomActionMutator<S>
where
    S: HasRand + HasMaxSize + HasTemplates,
{
    fn name(&self) -> &str {
        "IntentRandomActionMutator"
    }
}

impl<S> IntentRandomActionMutator<S>
where
    S: HasRand + HasMaxSize + HasTemplates,
{
    pub fn new() -> Self {
        Self {
            backing_byte_mutator: StdScheduledMutator::new(base_byte_mutations()),
        }
    }
}

impl<S> Mutator<IntentInput, S> for IntentRandomActionMutator<S>
where
    S: HasRand + HasMaxSize + HasTemplates,
{
    fn mutate(
        &mut self,
        state: &mut S,
        input: &mut IntentInput,
        stage_idx: i32,
    ) -> Result<MutationResult, libafl::Error> {
        let declared: Vec<String> = state
            .templates()
            .template_for(input)
            .map(|t| t.actions.clone())
            .unwrap_or_default()
            .into_iter()
            .filter(|action| Some(action) != input.action.as_ref())
            .collect();

        match state.rand_mut().below(3) {
            0 if !declared.is_empty() => {
                input.action = Some(state.rand_mut().choose(declared));
            }
            1 => {
                input.action = Some(state.rand_mut().choose(COMMON_ACTIONS).to_owned());
            }
            _ => {
                let current = input.action.take().unwrap_or_default();
                let mut bytes = BytesInput::new(current.into_bytes());
                self.backing_byte_mutator.mutate(state, &mut bytes, stage_idx)?;
                input.action = Some(String::from_utf8_lossy(bytes.bytes()).into_owned());
            }
        }

        Ok(MutationResult::Mutated)
    }
}

/// Mutator that removes a category or adds a declared or common one.
pub struct IntentRandomCategoryMutator<S>
where
    S: HasRand + HasTemplates,
{
    phantom: PhantomData<S>,
}

impl<S> Named for IntentRandomCategoryMutator<S>
where
    S: HasRand + HasTemplates,
{
    fn name(&self) -> &str {
        "IntentRandomCategoryMutator"
    }
}

impl<S> IntentRandomCategoryMutator<S>
where
    S: HasRand + HasTemplates,
{
    pub fn new() -> Self {
        Self {
            phantom: PhantomData,
        }
    }
}

impl<S> Mutator<IntentInput, S> for IntentRandomCategoryMutator<S>
where
    S: HasRand + HasTemplates,
{
    fn mutate(
        &mut self,
        state: &mut S,
        input: &mut IntentInput,
        _stage_idx: i32,
    ) -> Result<MutationResult, libafl::Error> {
        let candidates: Vec<String> = state
            .templates()
            .template_for(input)
            .map(|t| t.categories.clone())
            .unwrap_or_default()
            .into_iter()
            .chain(COMMON_CATEGORIES.iter().map(|c| (*c).to_owned()))
            .filter(|category| !input.categories.contains(category))
            .collect();

        let remove = !input.categories.is_empty()
            && (candidates.is_empty() || state.rand_mut().below(2) == 0);

        if remove {
            let index = state.rand_mut().below(input.categories.len() as u64) as usize;
            input.categories.remove(index);
        } else if !candidates.is_empty() {
            input.categories.push(state.rand_mut().choose(candidates));
        } else {
            return Ok(MutationResult::Skipped);
        }

        Ok(MutationResult::Mutated)
    }
}

/// The result of one mutation round: a fresh input and the mutators that
/// shaped it, in the order they were applied.
#[derive(Clone, Debug)]
pub struct Mutated {
    pub input: IntentInput,
    pub mutations: Vec<String>,
}

/// A [Mutator] that is also [Named], so boxed mutators can report their name.
trait NamedMutator<I, S>: Mutator<I, S> + Named {}

impl<I, S, M> NamedMutator<I, S> for M where M: Mutator<I, S> + Named {}

/// The full set of intent mutators plus the havoc strategy stacking them.
pub struct MutationEngine<S> {
    mutators: Vec<Box<dyn NamedMutator<IntentInput, S>>>,
}

impl<S> MutationEngine<S>
where
    S: HasRand + HasMaxSize + HasTemplates + 'static,
{
    pub fn new() -> Self {
        let mutators: Vec<Box<dyn NamedMutator<IntentInput, S>>> = vec![
            Box::new(IntentRandomDataMutator::new()),
            Box::new(IntentRandomFlagMutator::new()),
            Box::new(IntentRandomMimeTypeMutator::new()),
            Box::new(IntentRandomAddExtraMutator::new()),
            Box::new(IntentAddUnknownExtraMutator::new()),
            Box::new(IntentRemoveExtraMutator::new()),
            Box::new(IntentRandomExtraKeyMutator::new()),
            Box::new(IntentRandomExtraContentMutator::new()),
            Box::new(IntentRandomExtraSchemeMutator::new()),
            Box::new(IntentRandomExtraSuffixMutator::new()),
            Box::new(IntentRandomActionMutator::new()),
            Box::new(IntentRandomCategoryMutator::new()),
        ];

        Self { mutators }
    }

    pub fn mutator_names(&self) -> Vec<&str> {
        self.mutators.iter().map(|m| m.name()).collect()
    }

    /// One fuzzing trial's worth of mutation: havoc most of the time, a
    /// single mutator otherwise.
    pub fn mutate(
        &mut self,
        state: &mut S,
        parent: &IntentInput,
    ) -> Result<Mutated, libafl::Error> {
        if state.rand_mut().below(8) == 0 {
            let index = state.rand_mut().below(self.mutators.len() as u64) as usize;
            let mut mutated = self.apply(index, state, parent)?;
            if mutated.mutations.is_empty() {
                self.ensure_changed(state, &mut mutated)?;
            }
            Ok(mutated)
        } else {
            self.havoc(state, parent)
        }
    }

    /// Applies the mutator at `index` to a copy of `parent`. Skipped
    /// mutations leave `mutations` empty.
    pub fn apply(
        &mut self,
        index: usize,
        state: &mut S,
        parent: &IntentInput,
    ) -> Result<Mutated, libafl::Error> {
        let mut mutated = Mutated {
            input: parent.clone(),
            mutations: Vec::new(),
        };
        self.apply_in_place(index, state, &mut mutated)?;
        Ok(mutated)
    }

    /// Stacks 2 to 8 randomly chosen mutators on a copy of `parent`.
    pub fn havoc(
        &mut self,
        state: &mut S,
        parent: &IntentInput,
    ) -> Result<Mutated, libafl::Error> {
        let mut mutated = Mutated {
            input: parent.clone(),
            mutations: Vec::new(),
        };

        let stack = state.rand_mut().between(HAVOC_MIN_STACK, HAVOC_MAX_STACK);
        for _ in 0..stack {
            let index = state.rand_mut().below(self.mutators.len() as u64) as usize;
            self.apply_in_place(index, state, &mut mutated)?;
        }

        if mutated.mutations.is_empty() {
            self.ensure_changed(state, &mut mutated)?;
        }

        Ok(mutated)
    }

    fn apply_in_place(
        &mut self,
        index: usize,
        state: &mut S,
        mutated: &mut Mutated,
    ) -> Result<(), libafl::Error> {
        let mutator = &mut self.mutators[index];
        if mutator.mutate(state, &mut mutated.input, 0)? == MutationResult::Mutated {
            mutated.mutations.push(mutator.name().to_owned());
        }
        Ok(())
    }

    /// Every trial has to differ from its parent; a flag flip always applies.
    fn ensure_changed(&mut self, state: &mut S, mutated: &mut Mutated) -> Result<(), libafl::Error> {
        let mut flip = IntentRandomFlagMutator::<S>::new();
        flip.mutate(state, &mut mutated.input, 0)?;
        mutated.mutations.push(flip.name().to_owned());
        Ok(())
    }
}

impl<S> Default for MutationEngine<S>
where
    S: HasRand + HasMaxSize + HasTemplates + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

// -----------------------------------------

/// Helper function to get an ExtraInput to mutate, `None` if there are no
/// extras yet.
fn get_extra_to_mutate<'a, S>(state: &mut S, input: &'a mut IntentInput) -> Option<&'a mut ExtraInput>
where
    S: HasRand,
{
    if input.extras.is_empty() {
        return None;
    }

    // Mutate one extra value.
    let index = state.rand_mut().below(input.extras.len() as u64) as usize;

    input.extras.get_mut(index)
}

/// Keys of the template plus the common keys, each with the kind it is
/// declared with. The template's declaration wins over the common table.
fn declared_extra_keys(template: Option<&IntentTemplate>) -> Vec<(String, ExtraKind)> {
    let mut keys: Vec<(String, ExtraKind)> = template
        .map(|t| {
            t.known_extras_keys
                .iter()
                .map(|(key, kind)| (key.clone(), *kind))
                .collect()
        })
        .unwrap_or_default();

    for (key, kind) in COMMON_EXTRA_KEYS {
        if !keys.iter().any(|(known, _)| known == key) {
            keys.push((key.to_owned(), kind));
        }
    }

    keys
}

/// A key the template does not declare: a common key it lacks, or a made up
/// one.
fn undeclared_extra_key<S>(state: &mut S, template: Option<&IntentTemplate>) -> String
where
    S: HasRand,
{
    let declared = |key: &str| template.map_or(false, |t| t.known_extra_kind(key).is_some());

    let common: Vec<&str> = COMMON_EXTRA_KEYS
        .iter()
        .map(|(key, _)| *key)
        .filter(|key| !declared(key))
        .collect();

    if !common.is_empty() && state.rand_mut().below(2) == 0 {
        return state.rand_mut().choose(common).to_owned();
    }

    loop {
        let key = format!("fuzz.extra.{}", state.rand_mut().below(1 << 16));
        if !declared(&key) {
            return key;
        }
    }
}

/// Fresh URI values start with a random scheme and suffix.
fn randomize_uri<S>(state: &mut S, value: &mut ExtraValue)
where
    S: HasRand,
{
    if let ExtraValue::URI(uri) = value {
        uri.scheme = state.rand_mut().choose(URIScheme::iter());
        uri.suffix = state.rand_mut().choose(URISuffix::iter());
    }
}

fn mutate_content<S>(
    mutator: &mut StdScheduledMutator<BytesInput, BaseByteMutationsType, S>,
    state: &mut S,
    extra: &mut ExtraInput,
    stage_idx: i32,
) -> Result<MutationResult, libafl::Error>
where
    S: HasRand + HasMaxSize,
{
    let result = mutator.mutate(state, extra.value.content_buffer(), stage_idx);

    // Resize the extra value to a size its kind can hold.
    extra.value.normalize();

    result
}

/// Mutates a single element of a fixed-width array in place.
fn mutate_element<S>(
    mutator: &mut StdScheduledMutator<BytesInput, BaseByteMutationsType, S>,
    state: &mut S,
    extra: &mut ExtraInput,
    width: usize,
    stage_idx: i32,
) -> Result<MutationResult, libafl::Error>
where
    S: HasRand + HasMaxSize,
{
    let buffer = extra.value.content_buffer().bytes_mut();
    let elements = buffer.len() / width;
    let start = state.rand_mut().below(elements as u64) as usize * width;

    let mut element = BytesInput::new(buffer[start..start + width].to_vec());
    let result = mutator.mutate(state, &mut element, stage_idx)?;
    element.bytes_mut().resize(width, 0);
    buffer[start..start + width].copy_from_slice(element.bytes());

    Ok(result)
}

/// This is basically a copy of <https://github.com/AFLplusplus/LibAFL/blob/8f8e74d670b3aadda6b288b6f1a2de8a1cf98379/libafl/src/mutators/scheduled.rs#L204>
/// but without the crossover mutations which require the corpus to be a
/// BytesInput.
type BaseByteMutationsType = tuple_list_type!(
    libafl::prelude::BitFlipMutator,
    libafl::prelude::ByteIncMutator,
    libafl::prelude::ByteDecMutator,
    libafl::prelude::ByteNegMutator,
    libafl::prelude::ByteRandMutator,
    libafl::prelude::ByteAddMutator,
    libafl::prelude::WordAddMutator,
    libafl::prelude::DwordAddMutator,
    libafl::prelude::QwordAddMutator,
    libafl::prelude::ByteInterestingMutator,
    libafl::prelude::WordInterestingMutator,
    libafl::prelude::DwordInterestingMutator,
    libafl::prelude::BytesDeleteMutator,
    libafl::prelude::BytesDeleteMutator,
    libafl::prelude::BytesDeleteMutator,
    libafl::prelude::BytesDeleteMutator,
    libafl::prelude::BytesExpandMutator,
    libafl::prelude::BytesInsertMutator,
    libafl::prelude::BytesRandInsertMutator,
    libafl::prelude::BytesSetMutator,
    libafl::prelude::BytesRandSetMutator,
    libafl::prelude::BytesCopyMutator,
    libafl::prelude::BytesInsertCopyMutator,
    libafl::prelude::BytesSwapMutator,
);

fn base_byte_mutations() -> BaseByteMutationsType {
    tuple_list!(
        libafl::prelude::BitFlipMutator::new(),
        libafl::prelude::ByteIncMutator::new(),
        libafl::prelude::ByteDecMutator::new(),
        libafl::prelude::ByteNegMutator::new(),
        libafl::prelude::ByteRandMutator::new(),
        libafl::prelude::ByteAddMutator::new(),
        libafl::prelude::WordAddMutator::new(),
        libafl::prelude::DwordAddMutator::new(),
        libafl::prelude::QwordAddMutator::new(),
        libafl::prelude::ByteInterestingMutator::new(),
        libafl::prelude::WordInterestingMutator::new(),
        libafl::prelude::DwordInterestingMutator::new(),
        libafl::prelude::BytesDeleteMutator::new(),
        libafl::prelude::BytesDeleteMutator::new(),
        libafl::prelude::BytesDeleteMutator::new(),
        libafl::prelude::BytesDeleteMutator::new(),
        libafl::prelude::BytesExpandMutator::new(),
        libafl::prelude::BytesInsertMutator::new(),
        libafl::prelude::BytesRandInsertMutator::new(),
        libafl::prelude::BytesSetMutator::new(),
        libafl::prelude::BytesRandSetMutator::new(),
        libafl::prelude::BytesCopyMutator::new(),
        libafl::prelude::BytesInsertCopyMutator::new(),
        libafl::prelude::BytesSwapMutator::new(),
    )
}
