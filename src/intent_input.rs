//! The fuzzable test case: a single intent aimed at one exported component.
//!
//! Extra values keep their content as raw bytes tagged with a kind, like the
//! byte buffers libafl mutates. The kind decides how the bytes are decoded when
//! the intent is turned into an `am` command, so every byte pattern (NaN floats
//! included) serializes and replays exactly.

use std::{
    fmt::{self, Write},
    hash::Hasher,
    str::FromStr,
};

use fasthash::{farm::Hasher128, FastHasher, HasherExt};
use libafl::prelude::{BytesInput, HasBytesVec, Input};
use log::warn;
use serde::{Deserialize, Serialize};
use strum_macros::EnumIter;

use crate::{intent_template::IntentTemplate, util::shell_quote};

/// Authority of the helper content provider used for `content://` URIs.
pub const CONTENT_PROVIDER_AUTHORITY: &str =
    "org.gts3.jnifuzz.contentprovider.provider/external_files";

/// Directory on the device where `file://` URI payloads are written.
pub const FILE_URI_DIRECTORY: &str = "/data/local/tmp";

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct IntentInput {
    // The stuff up here usually doesn't get mutated because it is needed for
    // the intent to even match and hit the intent receiver.
    /// The type of the receiver (i.e., activity or broadcast receiver)
    pub receiver_type: ReceiverType,
    /// The component that receives the intent, e.g
    /// `com.example.app/.ExampleActivity`
    pub component_package: String,
    pub component_class: String,

    // These fields get mutated!
    /// The action of the intent, if any.
    pub action: Option<String>,
    /// The categories of the intent.
    pub categories: Vec<String>,
    /// The `data` uri of the intent.
    pub data: Option<URIInput>,
    /// The `type`, a mime type for the data.
    pub mime_type: Option<MimeType>,
    /// The `flags` for the intent.
    pub flags: u32,
    /// The `extras` for the intent, in delivery order.
    pub extras: Vec<ExtraInput>,
}

impl IntentInput {
    /// Command to send this intent via adb shell.
    pub fn shell_command(&self) -> String {
        // The way adb shell handles commands is documented here:
        //   https://developer.android.com/studio/command-line/adb#shellcommands
        // but basically we need to generate the command we want to run as
        // a single string fit for use on the android shell.
        let am_command = match self.receiver_type {
            ReceiverType::Activity => "start",
            ReceiverType::BroadcastReceiver => "broadcast",
        };

        let mut command = format!(
            "am {} -n '{}' --grant-read-uri-permission",
            am_command,
            self.component()
        );

        if let Some(action) = &self.action {
            let _ = write!(command, " -a {}", shell_quote(action.as_bytes()));
        }

        for category in &self.categories {
            let _ = write!(command, " -c {}", shell_quote(category.as_bytes()));
        }

        if let Some(mime_type) = &self.mime_type {
            let _ = write!(command, " -t '{}'", mime_type);
        }

        // Append data to the shell_command if it exists.
        if let Some(data) = &self.data {
            let _ = write!(command, " -d {}", shell_quote(&data.identifier(0)));
        }

        if self.flags != 0 {
            let _ = write!(command, " -f 0x{:x}", self.flags);
        }

        // Append extras to the shell_command.
        for (index, extra) in self.extras.iter().enumerate() {
            if let Some(args) = extra.command_args(index + 1) {
                command.push_str(&args);
            }
        }

        command
    }

    /// URIs (extras and data) whose payload has to exist on the device before
    /// the intent is delivered, with the index used to name them.
    pub fn uri_payloads(&self) -> impl Iterator<Item = (usize, &URIInput)> {
        self.extras
            .iter()
            .enumerate()
            .filter_map(|(index, extra)| match &extra.value {
                ExtraValue::URI(uri) => Some((index + 1, uri)),
                _ => None,
            })
            .chain(self.data.iter().map(|uri| (0, uri)))
    }

    /// Creates a unique hash of this input.
    pub fn hash(&self) -> String {
        let mut hasher = Hasher128::new();

        hasher.write(self.component().as_bytes());
        hasher.write(self.action.as_deref().unwrap_or_default().as_bytes());
        for category in &self.categories {
            hasher.write(category.as_bytes());
        }
        hasher.write(&serde_json::to_vec(&self.data).unwrap_or_default());
        hasher.write(&serde_json::to_vec(&self.mime_type).unwrap_or_default());
        hasher.write(&self.flags.to_le_bytes());

        for extra in &self.extras {
            hasher.write(extra.key.as_bytes());
            hasher.write(&serde_json::to_vec(&extra.value).unwrap_or_default());
        }

        format!("{:032x}", hasher.finish_ext())
    }

    /// The component that receives the intent, e.g
    /// `com.example.app/.ExampleActivity`
    pub fn component(&self) -> String {
        format!("{}/{}", self.component_package, self.component_class)
    }

    /// Checks the input against the template of its component: every extra
    /// whose key the template declares must carry the declared kind. Keys the
    /// template does not know are always accepted.
    pub fn conforms_to(&self, template: &IntentTemplate) -> bool {
        if self.component() != template.component() {
            return false;
        }

        self.extras.iter().all(|extra| {
            template
                .known_extra_kind(&extra.key)
                .map_or(true, |kind| kind == extra.value.kind())
        })
    }

    /// Serialized form stored in the corpus.
    pub fn to_json(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec_pretty(self)
    }

    pub fn from_json(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

impl Input for IntentInput {
    /// Generate a name for this input
    #[must_use]
    fn generate_name(&self, idx: usize) -> String {
        format!("id_{idx}_{hash}", idx = idx, hash = self.hash())
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, EnumIter, Copy, PartialEq, Eq, Hash)]
pub enum ReceiverType {
    Activity,
    BroadcastReceiver,
}

/// The scalar kinds an extra (or an element of an array extra) can have.
#[derive(
    Serialize, Deserialize, Clone, Debug, EnumIter, Copy, PartialEq, Eq, Hash, PartialOrd, Ord,
)]
pub enum PrimitiveKind {
    String,
    Boolean,
    Byte,
    Char,
    Short,
    Int,
    Long,
    Float,
    Double,
}

impl PrimitiveKind {
    /// Size in bytes of one value, `None` for the variable-length strings.
    pub fn width(self) -> Option<usize> {
        match self {
            PrimitiveKind::String => None,
            PrimitiveKind::Boolean | PrimitiveKind::Byte => Some(1),
            PrimitiveKind::Char | PrimitiveKind::Short => Some(2),
            PrimitiveKind::Int | PrimitiveKind::Float => Some(4),
            PrimitiveKind::Long | PrimitiveKind::Double => Some(8),
        }
    }

    fn name(self) -> &'static str {
        match self {
            PrimitiveKind::String => "String",
            PrimitiveKind::Boolean => "Boolean",
            PrimitiveKind::Byte => "Byte",
            PrimitiveKind::Char => "Char",
            PrimitiveKind::Short => "Short",
            PrimitiveKind::Int => "Int",
            PrimitiveKind::Long => "Long",
            PrimitiveKind::Float => "Float",
            PrimitiveKind::Double => "Double",
        }
    }

    /// `am` has no flag for every kind, so the narrower ones ride on the
    /// nearest one it has.
    fn am_flag(self) -> &'static str {
        match self {
            PrimitiveKind::String | PrimitiveKind::Char => "s",
            PrimitiveKind::Boolean => "z",
            PrimitiveKind::Byte | PrimitiveKind::Short | PrimitiveKind::Int => "i",
            PrimitiveKind::Long => "l",
            PrimitiveKind::Float => "f",
            PrimitiveKind::Double => "d",
        }
    }

    fn am_array_flag(self) -> &'static str {
        match self {
            PrimitiveKind::String | PrimitiveKind::Char => "sa",
            PrimitiveKind::Boolean
            | PrimitiveKind::Byte
            | PrimitiveKind::Short
            | PrimitiveKind::Int => "ia",
            PrimitiveKind::Long => "la",
            PrimitiveKind::Float => "fa",
            PrimitiveKind::Double => "da",
        }
    }
}

/// The declared kind of an extra, as named in intent templates
/// (`Int`, `IntArray`, `IntArrayList`, `URI`, ...).
#[derive(Serialize, Deserialize, Clone, Debug, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(try_from = "String", into = "String")]
pub enum ExtraKind {
    Primitive(PrimitiveKind),
    Array(PrimitiveKind),
    ArrayList(PrimitiveKind),
    URI,
    ComponentName,
}

impl ExtraKind {
    /// Every kind, in a fixed order.
    pub fn all() -> Vec<ExtraKind> {
        use strum::IntoEnumIterator;

        PrimitiveKind::iter()
            .flat_map(|p| {
                [
                    ExtraKind::Primitive(p),
                    ExtraKind::Array(p),
                    ExtraKind::ArrayList(p),
                ]
            })
            .chain([ExtraKind::URI, ExtraKind::ComponentName])
            .collect()
    }
}

impl fmt::Display for ExtraKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExtraKind::Primitive(p) => write!(f, "{}", p.name()),
            ExtraKind::Array(p) => write!(f, "{}Array", p.name()),
            ExtraKind::ArrayList(p) => write!(f, "{}ArrayList", p.name()),
            ExtraKind::URI => write!(f, "URI"),
            ExtraKind::ComponentName => write!(f, "ComponentName"),
        }
    }
}

impl FromStr for ExtraKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        use strum::IntoEnumIterator;

        match s {
            "URI" => return Ok(ExtraKind::URI),
            "ComponentName" => return Ok(ExtraKind::ComponentName),
            _ => {}
        }

        let (base, wrap): (&str, fn(PrimitiveKind) -> ExtraKind) =
            if let Some(base) = s.strip_suffix("ArrayList") {
                (base, ExtraKind::ArrayList)
            } else if let Some(base) = s.strip_suffix("Array") {
                (base, ExtraKind::Array)
            } else {
                (s, ExtraKind::Primitive)
            };

        PrimitiveKind::iter()
            .find(|p| p.name() == base)
            .map(wrap)
            .ok_or_else(|| s.to_owned())
    }
}

impl TryFrom<String> for ExtraKind {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ExtraKind> for String {
    fn from(kind: ExtraKind) -> Self {
        kind.to_string()
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ExtraInput {
    // The `key` of the extra input.
    pub key: String,
    // The typed value of the extra input.
    pub value: ExtraValue,
}

impl ExtraInput {
    /// The command line arguments for this extra input, `None` when there is
    /// nothing `am` could send (e.g. an empty array).
    pub fn command_args(&self, index: usize) -> Option<String> {
        let (flag, arg) = match &self.value {
            ExtraValue::Primitive(kind, d_input) => {
                (kind.am_flag().to_owned(), primitive_arg(*kind, d_input.buffer.bytes()))
            }
            ExtraValue::Array(kind, d_input) => (
                kind.am_array_flag().to_owned(),
                array_arg(*kind, d_input.buffer.bytes())?,
            ),
            ExtraValue::ArrayList(kind, d_input) => (
                format!("{}l", kind.am_array_flag()),
                array_arg(*kind, d_input.buffer.bytes())?,
            ),
            ExtraValue::URI(uri_input) => ("u".to_owned(), uri_input.identifier(index)),
            ExtraValue::ComponentName(d_input) => {
                let name = String::from_utf8_lossy(d_input.buffer.bytes()).into_owned();
                // am rejects component names without a separator outright.
                if !name.contains('/') {
                    warn!(
                        "Dropping component name extra {} without a '/': {:?}",
                        self.key, name
                    );
                    return None;
                }
                ("cn".to_owned(), name.into_bytes())
            }
        };

        Some(format!(
            " --e{} {} {}",
            flag,
            shell_quote(self.key.as_bytes()),
            shell_quote(&arg)
        ))
    }
}

/// Decodes one primitive from (at most) `width` little-endian bytes, zero
/// padding short buffers.
fn decode_primitive(kind: PrimitiveKind, bytes: &[u8]) -> String {
    fn padded<const N: usize>(bytes: &[u8]) -> [u8; N] {
        let mut buffer = [0u8; N];
        let len = bytes.len().min(N);
        buffer[..len].copy_from_slice(&bytes[..len]);
        buffer
    }

    match kind {
        PrimitiveKind::String => String::from_utf8_lossy(bytes).into_owned(),
        PrimitiveKind::Boolean => {
            if bytes.first().copied().unwrap_or(0) == 0 {
                "false".to_owned()
            } else {
                "true".to_owned()
            }
        }
        PrimitiveKind::Byte => i8::from_le_bytes(padded(bytes)).to_string(),
        PrimitiveKind::Short => i16::from_le_bytes(padded(bytes)).to_string(),
        PrimitiveKind::Char => char::from_u32(u16::from_le_bytes(padded(bytes)) as u32)
            .unwrap_or(char::REPLACEMENT_CHARACTER)
            .to_string(),
        PrimitiveKind::Int => i32::from_le_bytes(padded(bytes)).to_string(),
        PrimitiveKind::Long => i64::from_le_bytes(padded(bytes)).to_string(),
        PrimitiveKind::Float => format_float(f32::from_le_bytes(padded(bytes))),
        PrimitiveKind::Double => format_float(f64::from_le_bytes(padded(bytes))),
    }
}

/// Formats a float the way `Float.valueOf`/`Double.valueOf` parse it.
fn format_float<F: Into<f64> + ToString + Copy>(value: F) -> String {
    let wide: f64 = value.into();
    if wide.is_nan() {
        "NaN".to_owned()
    } else if wide.is_infinite() {
        if wide.is_sign_positive() {
            "Infinity".to_owned()
        } else {
            "-Infinity".to_owned()
        }
    } else {
        value.to_string()
    }
}

fn primitive_arg(kind: PrimitiveKind, bytes: &[u8]) -> Vec<u8> {
    match kind {
        // Strings go out byte for byte, invalid UTF-8 included.
        PrimitiveKind::String => bytes.to_vec(),
        _ => decode_primitive(kind, bytes).into_bytes(),
    }
}

fn array_arg(kind: PrimitiveKind, bytes: &[u8]) -> Option<Vec<u8>> {
    let elements: Vec<Vec<u8>> = match kind.width() {
        // String elements are separated by NUL bytes, commas inside an
        // element are escaped since am splits on unescaped commas.
        None => bytes
            .split(|byte| *byte == 0)
            .map(|element| {
                element
                    .iter()
                    .flat_map(|&byte| {
                        if byte == b',' {
                            vec![b'\\', b',']
                        } else {
                            vec![byte]
                        }
                    })
                    .collect()
            })
            .collect(),
        Some(width) => bytes
            .chunks(width)
            .map(|chunk| match kind {
                // Booleans travel as an int array.
                PrimitiveKind::Boolean => {
                    if chunk[0] == 0 {
                        b"0".to_vec()
                    } else {
                        b"1".to_vec()
                    }
                }
                PrimitiveKind::Char => {
                    decode_primitive(kind, chunk).replace(',', "\\,").into_bytes()
                }
                _ => decode_primitive(kind, chunk).into_bytes(),
            })
            .collect(),
    };

    Some(elements.join(&b',')).filter(|output| !output.is_empty())
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct URIInput {
    // The `scheme` of the URI input (for example, content, file).
    pub scheme: URIScheme,
    // The suffix of the URI input.
    pub suffix: URISuffix,
    // The content of the URI input.
    pub content: BytesInput,
}

impl URIInput {
    pub fn new(scheme: URIScheme, suffix: URISuffix) -> Self {
        Self {
            scheme,
            suffix,
            content: BytesInput::new(Vec::new()),
        }
    }

    /// The URI as sent to the device. Extras use their position as `id`, the
    /// intent data uses `0`.
    pub fn identifier(&self, id: usize) -> Vec<u8> {
        match &self.scheme {
            URIScheme::Other => self.content.bytes().to_vec(),
            _ => format!(
                "{}://{}{}",
                self.scheme,
                self.authority(),
                self.file_name(id)
            )
            .into_bytes(),
        }
    }

    /// Path on the device for a `file://` URI payload.
    pub fn device_path(&self, id: usize) -> String {
        format!("{}{}", FILE_URI_DIRECTORY, self.file_name(id))
    }

    fn authority(&self) -> &'static str {
        match &self.scheme {
            URIScheme::Content => CONTENT_PROVIDER_AUTHORITY,
            URIScheme::File => FILE_URI_DIRECTORY,
            URIScheme::Other => "",
        }
    }

    fn file_name(&self, id: usize) -> String {
        format!("/extra_input_{}{}", id, self.suffix)
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct DirectInput {
    // The raw bytes of the value.
    pub buffer: BytesInput,
}

impl DirectInput {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self {
            buffer: BytesInput::new(bytes),
        }
    }
}

// Enum for the different types of URI schemes.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, EnumIter, PartialEq, Eq)]
pub enum URIScheme {
    Content,
    File,
    Other,
}

impl fmt::Display for URIScheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            URIScheme::Content => write!(f, "content"),
            URIScheme::File => write!(f, "file"),
            URIScheme::Other => Ok(()),
        }
    }
}

// Enum for the different suffixes of URI inputs.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, EnumIter, PartialEq, Eq)]
pub enum URISuffix {
    AAC,
    APK,
    GIF,
    HTML,
    JPG,
    MIDI,
    MP3,
    MP4,
    OGG,
    PDF,
    PNG,
    TXT,
    WAV,
    WMA,
    WMV,
    XML,
}

impl fmt::Display for URISuffix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            URISuffix::AAC => write!(f, ".aac"),
            URISuffix::APK => write!(f, ".apk"),
            URISuffix::GIF => write!(f, ".gif"),
            URISuffix::HTML => write!(f, ".html"),
            URISuffix::JPG => write!(f, ".jpg"),
            URISuffix::MIDI => write!(f, ".midi"),
            URISuffix::MP3 => write!(f, ".mp3"),
            URISuffix::MP4 => write!(f, ".mp4"),
            URISuffix::OGG => write!(f, ".ogg"),
            URISuffix::PDF => write!(f, ".pdf"),
            URISuffix::PNG => write!(f, ".png"),
            URISuffix::TXT => write!(f, ".txt"),
            URISuffix::WAV => write!(f, ".wav"),
            URISuffix::WMA => write!(f, ".wma"),
            URISuffix::WMV => write!(f, ".wmv"),
            URISuffix::XML => write!(f, ".xml"),
        }
    }
}

/// A typed extra value. The variant is the kind, the bytes are the content.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub enum ExtraValue {
    Primitive(PrimitiveKind, DirectInput),
    Array(PrimitiveKind, DirectInput),
    ArrayList(PrimitiveKind, DirectInput),
    URI(URIInput),
    ComponentName(DirectInput),
}

impl ExtraValue {
    /// A representative value of the given kind: zero for numbers, `false`,
    /// empty strings, single-element arrays.
    pub fn representative(kind: ExtraKind) -> Self {
        let zeroes = |p: PrimitiveKind| DirectInput::new(vec![0; p.width().unwrap_or(0)]);

        match kind {
            ExtraKind::Primitive(p) => ExtraValue::Primitive(p, zeroes(p)),
            ExtraKind::Array(p) => ExtraValue::Array(p, zeroes(p)),
            ExtraKind::ArrayList(p) => ExtraValue::ArrayList(p, zeroes(p)),
            ExtraKind::URI => ExtraValue::URI(URIInput::new(URIScheme::Content, URISuffix::TXT)),
            ExtraKind::ComponentName => ExtraValue::ComponentName(DirectInput::new(Vec::new())),
        }
    }

    /// Re-tags the value with another kind, keeping the content bytes.
    pub fn retyped(self, kind: ExtraKind) -> Self {
        if self.kind() == kind {
            return self;
        }

        let bytes = match self {
            ExtraValue::Primitive(_, d)
            | ExtraValue::Array(_, d)
            | ExtraValue::ArrayList(_, d)
            | ExtraValue::ComponentName(d) => d.buffer,
            ExtraValue::URI(uri) => uri.content,
        };

        let mut value = match ExtraValue::representative(kind) {
            ExtraValue::URI(mut uri) => {
                uri.content = bytes;
                ExtraValue::URI(uri)
            }
            ExtraValue::Primitive(p, _) => ExtraValue::Primitive(p, DirectInput { buffer: bytes }),
            ExtraValue::Array(p, _) => ExtraValue::Array(p, DirectInput { buffer: bytes }),
            ExtraValue::ArrayList(p, _) => ExtraValue::ArrayList(p, DirectInput { buffer: bytes }),
            ExtraValue::ComponentName(_) => ExtraValue::ComponentName(DirectInput { buffer: bytes }),
        };
        value.normalize();
        value
    }

    pub fn kind(&self) -> ExtraKind {
        match self {
            ExtraValue::Primitive(p, _) => ExtraKind::Primitive(*p),
            ExtraValue::Array(p, _) => ExtraKind::Array(*p),
            ExtraValue::ArrayList(p, _) => ExtraKind::ArrayList(*p),
            ExtraValue::URI(_) => ExtraKind::URI,
            ExtraValue::ComponentName(_) => ExtraKind::ComponentName,
        }
    }

    pub fn content_buffer(&mut self) -> &mut BytesInput {
        match self {
            ExtraValue::Primitive(_, d_input)
            | ExtraValue::Array(_, d_input)
            | ExtraValue::ArrayList(_, d_input)
            | ExtraValue::ComponentName(d_input) => &mut d_input.buffer,
            ExtraValue::URI(uri_input) => &mut uri_input.content,
        }
    }

    /// Brings the content back to a size the kind can hold: exactly one value
    /// for fixed-width primitives, whole elements for fixed-width arrays.
    pub fn normalize(&mut self) {
        match self {
            ExtraValue::Primitive(p, d_input) => {
                if let Some(width) = p.width() {
                    d_input.buffer.bytes_mut().resize(width, 0);
                }
            }
            ExtraValue::Array(p, d_input) | ExtraValue::ArrayList(p, d_input) => {
                if let Some(width) = p.width() {
                    let bytes = d_input.buffer.bytes_mut();
                    let len = bytes.len() - bytes.len() % width;
                    bytes.truncate(len);
                }
            }
            ExtraValue::URI(_) | ExtraValue::ComponentName(_) => {}
        }
    }
}

// Enum for the following mime types:
#[derive(Serialize, Deserialize, Clone, Debug, EnumIter, Copy, PartialEq, Eq)]
pub enum MimeType {
    ApplicationPdf,
    ApplicationVndAndroidPackageArchive,
    AudioAac,
    AudioMidi,
    AudioMpeg,
    AudioMpeg4Generic,
    AudioOgg,
    AudioWav,
    AudioXMsWma,
    ImageGif,
    ImageJpeg,
    ImagePng,
    TextHtml,
    TextPlain,
    TextXml,
    VideoMp4,
    VideoXMsVideo,
    VideoXMsWmv,
}

impl fmt::Display for MimeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MimeType::ApplicationPdf => write!(f, "application/pdf"),
            MimeType::ApplicationVndAndroidPackageArchive => {
                write!(f, "application/vnd.android.package-archive")
            }
            MimeType::AudioAac => write!(f, "audio/aac"),
            MimeType::AudioMidi => write!(f, "audio/midi"),
            MimeType::AudioMpeg => write!(f, "audio/mpeg"),
            MimeType::AudioMpeg4Generic => write!(f, "audio/mpeg4-generic"),
            MimeType::AudioOgg => write!(f, "audio/ogg"),
            MimeType::AudioWav => write!(f, "audio/wav"),
            MimeType::AudioXMsWma => write!(f, "audio/x-ms-wma"),
            MimeType::ImageGif => write!(f, "image/gif"),
            MimeType::ImageJpeg => write!(f, "image/jpeg"),
            MimeType::ImagePng => write!(f, "image/png"),
            MimeType::TextHtml => write!(f, "text/html"),
            MimeType::TextPlain => write!(f, "text/plain"),
            MimeType::TextXml => write!(f, "text/xml"),
            MimeType::VideoMp4 => write!(f, "video/mp4"),
            MimeType::VideoXMsVideo => write!(f, "video/x-msvideo"),
            MimeType::VideoXMsWmv => write!(f, "video/x-ms-wmv"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::encode_hex;

    fn input() -> IntentInput {
        IntentInput {
            receiver_type: ReceiverType::Activity,
            component_package: "com.example".to_owned(),
            component_class: "com.example.MainActivity".to_owned(),
            action: Some("android.intent.action.VIEW".to_owned()),
            categories: vec!["android.intent.category.DEFAULT".to_owned()],
            data: None,
            mime_type: None,
            flags: 0,
            extras: Vec::new(),
        }
    }

    fn extra(key: &str, value: ExtraValue) -> ExtraInput {
        ExtraInput {
            key: key.to_owned(),
            value,
        }
    }

    #[test]
    fn kind_names_parse_back() {
        for kind in ExtraKind::all() {
            assert_eq!(kind.to_string().parse::<ExtraKind>(), Ok(kind));
        }
        assert_eq!(
            "IntArrayList".parse::<ExtraKind>(),
            Ok(ExtraKind::ArrayList(PrimitiveKind::Int))
        );
        assert!("Parcelable".parse::<ExtraKind>().is_err());
        assert!("Array".parse::<ExtraKind>().is_err());
    }

    #[test]
    fn command_contains_component_action_and_categories() {
        let mut intent = input();
        intent.flags = 0x10;
        let command = intent.shell_command();

        assert!(command.starts_with("am start -n 'com.example/com.example.MainActivity'"));
        assert!(command.contains(&format!(
            " -a $'{}'",
            encode_hex(b"android.intent.action.VIEW")
        )));
        assert!(command.contains(" -c $'"));
        assert!(command.contains(" -f 0x10"));
        assert!(!command.contains(" -t "));

        intent.receiver_type = ReceiverType::BroadcastReceiver;
        intent.action = None;
        assert!(intent.shell_command().starts_with("am broadcast "));
        assert!(!intent.shell_command().contains(" -a "));
    }

    #[test]
    fn numeric_extras_are_decoded_little_endian() {
        let int = extra(
            "k",
            ExtraValue::Primitive(PrimitiveKind::Int, DirectInput::new((-2i32).to_le_bytes().to_vec())),
        );
        let args = int.command_args(1).unwrap();
        assert!(args.starts_with(" --ei "));
        assert!(args.ends_with(&format!("$'{}'", encode_hex(b"-2"))));

        let nan = extra(
            "f",
            ExtraValue::Primitive(PrimitiveKind::Float, DirectInput::new(f32::NAN.to_le_bytes().to_vec())),
        );
        assert!(nan.command_args(1).unwrap().ends_with(&format!("$'{}'", encode_hex(b"NaN"))));

        let short = extra(
            "s",
            ExtraValue::Primitive(PrimitiveKind::Short, DirectInput::new(vec![0xff, 0x7f])),
        );
        assert!(short.command_args(1).unwrap().contains(&encode_hex(b"32767")));
    }

    #[test]
    fn array_extras_use_list_flags_and_skip_empty_arrays() {
        let mut bytes = 1i32.to_le_bytes().to_vec();
        bytes.extend_from_slice(&2i32.to_le_bytes());
        let list = extra(
            "ints",
            ExtraValue::ArrayList(PrimitiveKind::Int, DirectInput::new(bytes)),
        );
        let args = list.command_args(1).unwrap();
        assert!(args.starts_with(" --eial "));
        assert!(args.ends_with(&format!("$'{}'", encode_hex(b"1,2"))));

        let strings = extra(
            "strings",
            ExtraValue::Array(PrimitiveKind::String, DirectInput::new(b"a,b\0c".to_vec())),
        );
        assert!(strings
            .command_args(1)
            .unwrap()
            .ends_with(&format!("$'{}'", encode_hex(b"a\\,b,c"))));

        let empty = extra(
            "empty",
            ExtraValue::Array(PrimitiveKind::Long, DirectInput::new(Vec::new())),
        );
        assert_eq!(empty.command_args(1), None);
    }

    #[test]
    fn component_names_need_a_separator() {
        let valid = extra(
            "target",
            ExtraValue::ComponentName(DirectInput::new(b"com.example/.Other".to_vec())),
        );
        assert!(valid.command_args(0).unwrap().starts_with(" --ecn "));

        let invalid = extra(
            "target",
            ExtraValue::ComponentName(DirectInput::new(b"com.example.Other".to_vec())),
        );
        assert_eq!(invalid.command_args(0), None);
    }

    #[test]
    fn normalize_fixes_widths() {
        let mut value = ExtraValue::Primitive(PrimitiveKind::Long, DirectInput::new(vec![1, 2, 3]));
        value.normalize();
        assert_eq!(value.content_buffer().bytes().len(), 8);

        let mut array = ExtraValue::Array(PrimitiveKind::Int, DirectInput::new(vec![0; 9]));
        array.normalize();
        assert_eq!(array.content_buffer().bytes().len(), 8);
    }

    #[test]
    fn retyping_keeps_bytes_and_changes_kind() {
        let value = ExtraValue::Primitive(PrimitiveKind::String, DirectInput::new(b"abcdef".to_vec()));
        let mut retyped = value.retyped(ExtraKind::Primitive(PrimitiveKind::Int));
        assert_eq!(retyped.kind(), ExtraKind::Primitive(PrimitiveKind::Int));
        assert_eq!(retyped.content_buffer().bytes(), b"abcd");
    }

    #[test]
    fn serialization_round_trips_exotic_values() {
        let mut intent = input();
        intent.mime_type = Some(MimeType::ImagePng);
        intent.data = Some(URIInput {
            scheme: URIScheme::File,
            suffix: URISuffix::PDF,
            content: BytesInput::new(vec![0, 159, 146, 150]),
        });
        intent.extras.push(extra(
            "nan",
            ExtraValue::Primitive(PrimitiveKind::Double, DirectInput::new(f64::NAN.to_le_bytes().to_vec())),
        ));
        intent.extras.push(extra(
            "bytes",
            ExtraValue::ArrayList(PrimitiveKind::Byte, DirectInput::new(vec![255, 0, 7])),
        ));

        let bytes = intent.to_json().unwrap();
        assert_eq!(IntentInput::from_json(&bytes).unwrap(), intent);
        assert_eq!(
            IntentInput::from_json(&bytes).unwrap().hash(),
            intent.hash()
        );
    }

    #[test]
    fn uri_payloads_are_named_by_position() {
        let mut intent = input();
        intent.extras.push(extra("a", ExtraValue::representative(ExtraKind::Primitive(PrimitiveKind::Int))));
        intent.extras.push(extra("b", ExtraValue::representative(ExtraKind::URI)));
        intent.data = Some(URIInput::new(URIScheme::File, URISuffix::TXT));

        let ids: Vec<usize> = intent.uri_payloads().map(|(id, _)| id).collect();
        assert_eq!(ids, vec![2, 0]);
        assert_eq!(
            intent.data.as_ref().unwrap().device_path(0),
            "/data/local/tmp/extra_input_0.txt"
        );
        assert_eq!(
            intent.data.as_ref().unwrap().identifier(0),
            b"file:///data/local/tmp/extra_input_0.txt".to_vec()
        );
    }
}
