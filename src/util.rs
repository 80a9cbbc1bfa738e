use crate::intent_input::{ExtraKind, PrimitiveKind};

/// Encodes bytes into a hexstring like \x41\x42\x43
pub fn encode_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("\\x{:02x}", b)).collect()
}

/// Quotes arbitrary bytes for the device shell as an ANSI-C string,
/// `$'\x41\x42'`, so quotes and spaces in fuzzed values stay inside one word.
pub fn shell_quote(bytes: &[u8]) -> String {
    format!("$'{}'", encode_hex(bytes))
}

/// Array that contains common extra keys and types.
pub const COMMON_EXTRA_KEYS: [(&str, ExtraKind); 14] = [
    ("android.intent.extra.CC", ExtraKind::Array(PrimitiveKind::String)),
    ("android.intent.extra.COMPONENT_NAME", ExtraKind::ComponentName),
    ("android.intent.extra.EMAIL", ExtraKind::Array(PrimitiveKind::String)),
    ("android.intent.extra.HTML_TEXT", ExtraKind::Primitive(PrimitiveKind::String)),
    ("android.intent.extra.INDEX", ExtraKind::Primitive(PrimitiveKind::Int)),
    ("android.intent.extra.MIME_TYPES", ExtraKind::Array(PrimitiveKind::String)),
    ("android.intent.extra.PACKAGE_NAME", ExtraKind::Primitive(PrimitiveKind::String)),
    ("android.intent.extra.PHONE_NUMBER", ExtraKind::Primitive(PrimitiveKind::String)),
    ("android.intent.extra.QUICK_VIEW_FEATURES", ExtraKind::Array(PrimitiveKind::String)),
    ("android.intent.extra.STREAM", ExtraKind::URI),
    ("android.intent.extra.SUBJECT", ExtraKind::Primitive(PrimitiveKind::String)),
    ("android.intent.extra.TEXT", ExtraKind::Primitive(PrimitiveKind::String)),
    ("android.intent.extra.TITLE", ExtraKind::Primitive(PrimitiveKind::String)),
    ("android.intent.extra.UID", ExtraKind::Primitive(PrimitiveKind::Int)),
];

/// Actions tried when the action mutator leaves the template's action set.
pub const COMMON_ACTIONS: [&str; 8] = [
    "android.intent.action.MAIN",
    "android.intent.action.VIEW",
    "android.intent.action.SEND",
    "android.intent.action.SEND_MULTIPLE",
    "android.intent.action.EDIT",
    "android.intent.action.PICK",
    "android.intent.action.BOOT_COMPLETED",
    "android.intent.action.PACKAGE_ADDED",
];

/// Categories the category mutator may add besides the template's own.
pub const COMMON_CATEGORIES: [&str; 5] = [
    "android.intent.category.DEFAULT",
    "android.intent.category.BROWSABLE",
    "android.intent.category.LAUNCHER",
    "android.intent.category.ALTERNATIVE",
    "android.intent.category.OPENABLE",
];
