//! Intent templates, one per exported component, loaded from the
//! `intent_template.json` files the static analysis produces.

use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
};

use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::{
    error::TemplateError,
    intent_input::{ExtraKind, IntentInput, ReceiverType},
};

/// A template for an intent to start mutating, loaded from intent_template.json
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct IntentTemplate {
    pub receiver_type: ReceiverType,
    component: String,
    pub actions: Vec<String>,
    pub categories: Vec<String>,
    pub known_extras_keys: BTreeMap<String, ExtraKind>,
}

/// The template as found on disk, before kinds and receiver types are checked.
#[derive(Deserialize)]
struct RawTemplate {
    receiver_type: String,
    component: String,
    #[serde(default)]
    actions: Vec<String>,
    #[serde(default)]
    categories: Vec<String>,
    #[serde(default)]
    known_extras_keys: BTreeMap<String, String>,
}

impl IntentTemplate {
    pub fn new(
        receiver_type: ReceiverType,
        component: &str,
        actions: Vec<String>,
        categories: Vec<String>,
        known_extras_keys: BTreeMap<String, ExtraKind>,
    ) -> Self {
        Self {
            receiver_type,
            component: component.to_owned(),
            actions: dedup(actions),
            categories: dedup(categories),
            known_extras_keys,
        }
    }

    /// Get the package name from the component attribute.
    pub fn package_name(&self) -> &str {
        self.component
            .split_once('/')
            .map_or(self.component.as_str(), |(package, _)| package)
    }

    /// Get the class name from the component attribute.
    pub fn class_name(&self) -> &str {
        self.component
            .split_once('/')
            .map_or("", |(_, class)| class)
    }

    /// The full component, `package/class`.
    pub fn component(&self) -> &str {
        &self.component
    }

    /// The declared kind of an extra key, if the template knows the key.
    pub fn known_extra_kind(&self, key: &str) -> Option<ExtraKind> {
        self.known_extras_keys.get(key).copied()
    }

    /// Parses and validates a single template file. `Ok(None)` for receivers
    /// that exist on Android but are not fuzzed (services, providers).
    fn from_file(path: &Path) -> Result<Option<Self>, TemplateError> {
        let contents = fs::read(path).map_err(|source| TemplateError::Io {
            path: path.to_owned(),
            source,
        })?;

        let raw: RawTemplate =
            serde_json::from_slice(&contents).map_err(|source| TemplateError::Malformed {
                path: path.to_owned(),
                source,
            })?;

        let receiver_type = match raw.receiver_type.as_str() {
            "Activity" => ReceiverType::Activity,
            "BroadcastReceiver" => ReceiverType::BroadcastReceiver,
            "Service" | "ContentProvider" => {
                warn!(
                    "Skipping {} ({}): receiver type {} is not supported",
                    path.display(),
                    raw.component,
                    raw.receiver_type
                );
                return Ok(None);
            }
            other => {
                return Err(TemplateError::UnknownReceiverType {
                    path: path.to_owned(),
                    receiver_type: other.to_owned(),
                })
            }
        };

        match raw.component.split_once('/') {
            Some((package, class)) if !package.is_empty() && !class.is_empty() => {}
            _ => {
                return Err(TemplateError::InvalidComponent {
                    path: path.to_owned(),
                    component: raw.component,
                })
            }
        }

        let known_extras_keys = raw
            .known_extras_keys
            .into_iter()
            .map(|(key, kind)| match kind.parse::<ExtraKind>() {
                Ok(kind) => Ok((key, kind)),
                Err(kind) => Err(TemplateError::UnknownKind {
                    path: path.to_owned(),
                    key,
                    kind,
                }),
            })
            .collect::<Result<BTreeMap<_, _>, _>>()?;

        Ok(Some(Self::new(
            receiver_type,
            &raw.component,
            raw.actions,
            raw.categories,
            known_extras_keys,
        )))
    }
}

/// Removes repeated entries, keeping the first occurrence.
fn dedup(values: Vec<String>) -> Vec<String> {
    let mut unique: Vec<String> = Vec::with_capacity(values.len());
    for value in values {
        if !unique.contains(&value) {
            unique.push(value);
        }
    }
    unique
}

/// All templates of a session. Owns them for the session lifetime; nothing
/// mutates them after loading.
#[derive(Clone, Debug)]
pub struct TemplateStore {
    templates: Vec<IntentTemplate>,
}

impl TemplateStore {
    /// Loads a single template file, or every template file in a directory.
    pub fn load(config: impl AsRef<Path>) -> Result<Self, TemplateError> {
        let config = config.as_ref();

        let paths: Vec<PathBuf> = if config.is_dir() {
            let dir = fs::read_dir(config).map_err(|source| TemplateError::Io {
                path: config.to_owned(),
                source,
            })?;

            let mut paths = Vec::new();
            for entry in dir {
                let entry = entry.map_err(|source| TemplateError::Io {
                    path: config.to_owned(),
                    source,
                })?;
                let path = entry.path();
                let hidden = entry.file_name().to_string_lossy().starts_with('.');
                if path.is_file() && !hidden {
                    paths.push(path);
                }
            }
            // Directory order is arbitrary, sort for a reproducible session.
            paths.sort();
            paths
        } else {
            vec![config.to_owned()]
        };

        let mut loaded = Vec::new();
        for path in paths {
            if let Some(template) = IntentTemplate::from_file(&path)? {
                debug!("Loaded intent template for {}", template.component());
                loaded.push((path, template));
            }
        }

        if loaded.is_empty() {
            return Err(TemplateError::Empty(config.to_owned()));
        }

        Self::from_sources(loaded)
    }

    /// Builds a store from templates that did not come from files.
    pub fn from_templates(templates: Vec<IntentTemplate>) -> Result<Self, TemplateError> {
        Self::from_sources(
            templates
                .into_iter()
                .map(|t| (PathBuf::from("<memory>"), t))
                .collect(),
        )
    }

    fn from_sources(sources: Vec<(PathBuf, IntentTemplate)>) -> Result<Self, TemplateError> {
        let mut seen: BTreeMap<String, PathBuf> = BTreeMap::new();

        for (path, template) in &sources {
            if let Some(first) = seen.get(template.component()) {
                return Err(TemplateError::DuplicateComponent {
                    component: template.component().to_owned(),
                    first: first.clone(),
                    second: path.clone(),
                });
            }
            seen.insert(template.component().to_owned(), path.clone());
        }

        let templates: Vec<IntentTemplate> = sources.into_iter().map(|(_, t)| t).collect();

        let Some(first) = templates.first() else {
            return Err(TemplateError::Empty(PathBuf::from("<memory>")));
        };
        if let Some(other) = templates
            .iter()
            .find(|t| t.package_name() != first.package_name())
        {
            return Err(TemplateError::MixedPackages {
                first: first.package_name().to_owned(),
                second: other.package_name().to_owned(),
            });
        }

        Ok(Self { templates })
    }

    pub fn templates(&self) -> &[IntentTemplate] {
        &self.templates
    }

    pub fn get(&self, component: &str) -> Option<&IntentTemplate> {
        self.templates.iter().find(|t| t.component() == component)
    }

    /// The template the input was derived from.
    pub fn template_for(&self, input: &IntentInput) -> Option<&IntentTemplate> {
        self.get(&input.component())
    }

    /// Whether every declared extra of the input has the declared kind.
    /// Inputs for components without a template are rejected.
    pub fn validate(&self, input: &IntentInput) -> bool {
        self.template_for(input)
            .map_or(false, |template| input.conforms_to(template))
    }

    /// The package every template targets.
    pub fn package_name(&self) -> &str {
        self.templates[0].package_name()
    }

    /// Activities report when they went idle, broadcast receivers do not.
    /// Deliveries to receivers use the settle delay even when this is on.
    pub fn enable_synchronization(&self) -> bool {
        self.templates
            .iter()
            .any(|t| t.receiver_type == ReceiverType::Activity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::intent_input::PrimitiveKind;

    fn write(dir: &Path, name: &str, contents: &str) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, contents).unwrap();
        path
    }

    const MAIN_ACTIVITY: &str = r#"{
        "receiver_type": "Activity",
        "component": "com.example/com.example.MainActivity",
        "actions": ["android.intent.action.MAIN"],
        "categories": ["android.intent.category.LAUNCHER"],
        "known_extras_keys": {"count": "Int", "names": "StringArrayList"}
    }"#;

    #[test]
    fn loads_single_launcher_activity() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(dir.path(), "intent_template.json", MAIN_ACTIVITY);

        let store = TemplateStore::load(&path).unwrap();
        assert_eq!(store.templates().len(), 1);

        let template = &store.templates()[0];
        assert_eq!(template.actions, vec!["android.intent.action.MAIN"]);
        assert_eq!(template.categories, vec!["android.intent.category.LAUNCHER"]);
        assert_eq!(template.package_name(), "com.example");
        assert_eq!(template.class_name(), "com.example.MainActivity");
        assert_eq!(
            template.known_extra_kind("names"),
            Some(ExtraKind::ArrayList(PrimitiveKind::String))
        );
        assert!(store.enable_synchronization());
    }

    #[test]
    fn any_activity_enables_synchronization() {
        let receiver = || {
            IntentTemplate::new(
                ReceiverType::BroadcastReceiver,
                "com.example/.Receiver",
                vec![],
                vec![],
                BTreeMap::new(),
            )
        };
        let activity = IntentTemplate::new(
            ReceiverType::Activity,
            "com.example/.MainActivity",
            vec![],
            vec![],
            BTreeMap::new(),
        );

        let receivers_only = TemplateStore::from_templates(vec![receiver()]).unwrap();
        assert!(!receivers_only.enable_synchronization());

        let mixed = TemplateStore::from_templates(vec![receiver(), activity]).unwrap();
        assert!(mixed.enable_synchronization());
    }

    #[test]
    fn loads_directories_in_name_order_and_skips_services() {
        let dir = tempfile::tempdir().unwrap();
        write(
            dir.path(),
            "b.json",
            r#"{"receiver_type": "BroadcastReceiver", "component": "com.example/.Receiver"}"#,
        );
        write(dir.path(), "a.json", MAIN_ACTIVITY);
        write(
            dir.path(),
            "c.json",
            r#"{"receiver_type": "Service", "component": "com.example/.Service"}"#,
        );

        let store = TemplateStore::load(dir.path()).unwrap();
        let components: Vec<&str> = store.templates().iter().map(|t| t.component()).collect();
        assert_eq!(
            components,
            vec!["com.example/com.example.MainActivity", "com.example/.Receiver"]
        );
        assert!(store.templates()[1].actions.is_empty());
    }

    #[test]
    fn rejects_unknown_kinds() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(
            dir.path(),
            "t.json",
            r#"{"receiver_type": "Activity", "component": "a/b", "known_extras_keys": {"x": "Parcelable"}}"#,
        );

        match TemplateStore::load(&path) {
            Err(TemplateError::UnknownKind { key, kind, .. }) => {
                assert_eq!(key, "x");
                assert_eq!(kind, "Parcelable");
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn rejects_malformed_files_and_components() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(dir.path(), "t.json", "{ not json");
        assert!(matches!(
            TemplateStore::load(&path),
            Err(TemplateError::Malformed { .. })
        ));

        let path = write(
            dir.path(),
            "t.json",
            r#"{"receiver_type": "Activity", "component": "no-separator"}"#,
        );
        assert!(matches!(
            TemplateStore::load(&path),
            Err(TemplateError::InvalidComponent { .. })
        ));

        let path = write(
            dir.path(),
            "t.json",
            r#"{"receiver_type": "Widget", "component": "a/b"}"#,
        );
        assert!(matches!(
            TemplateStore::load(&path),
            Err(TemplateError::UnknownReceiverType { .. })
        ));
    }

    #[test]
    fn rejects_duplicate_components() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "a.json", MAIN_ACTIVITY);
        write(dir.path(), "b.json", MAIN_ACTIVITY);

        assert!(matches!(
            TemplateStore::load(dir.path()),
            Err(TemplateError::DuplicateComponent { .. })
        ));
    }

    #[test]
    fn rejects_mixed_packages() {
        let a = IntentTemplate::new(ReceiverType::Activity, "a/.A", vec![], vec![], BTreeMap::new());
        let b = IntentTemplate::new(ReceiverType::Activity, "b/.B", vec![], vec![], BTreeMap::new());

        assert!(matches!(
            TemplateStore::from_templates(vec![a, b]),
            Err(TemplateError::MixedPackages { .. })
        ));
    }

    #[test]
    fn template_serialization_round_trips() {
        let mut extras = BTreeMap::new();
        extras.insert("uri".to_owned(), ExtraKind::URI);
        extras.insert("d".to_owned(), ExtraKind::Array(PrimitiveKind::Double));
        let template = IntentTemplate::new(
            ReceiverType::BroadcastReceiver,
            "com.example/.Receiver",
            vec!["a".to_owned(), "a".to_owned(), "b".to_owned()],
            vec![],
            extras,
        );
        assert_eq!(template.actions, vec!["a", "b"]);

        let json = serde_json::to_string(&template).unwrap();
        assert!(json.contains("\"DoubleArray\""));
        let back: IntentTemplate = serde_json::from_str(&json).unwrap();
        assert_eq!(back, template);
    }
}
