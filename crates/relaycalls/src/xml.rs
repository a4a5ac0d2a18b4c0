use async_trait::async_trait;
use quick_xml::events::{BytesEnd, BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};
use relaycore::{pipe, BodyReader, Codec, CodecError, ManifestError, Reference, ReferenceStore, Template};
use relayruntime::{CodecConstructor, ComponentMetadata};
use serde_json::{Map, Value as Json};
use std::sync::Arc;

const CHUNK_SIZE: usize = 8 * 1024;
const PIPE_CAPACITY: usize = 4;
const DEFAULT_ROOT: &str = "root";

/// XML codec bound to one message of a flow.
///
/// A message is encoded as a single root element. Nested objects become
/// child elements and arrays become repeated siblings sharing a name.
/// Decoding reverses this: repeated siblings are read back as an array and
/// element text is typed as a boolean, an integer, a float or a string.
pub struct XmlCodec {
    resource: String,
    root: String,
    message: Option<Template>,
}

impl XmlCodec {
    pub fn new(resource: impl Into<String>, message: Option<Template>) -> Self {
        Self {
            resource: resource.into(),
            root: DEFAULT_ROOT.to_string(),
            message,
        }
    }

    pub fn with_root(mut self, root: impl Into<String>) -> Self {
        self.root = root.into();
        self
    }
}

#[async_trait]
impl Codec for XmlCodec {
    fn name(&self) -> &str {
        "xml"
    }

    fn content_type(&self) -> &str {
        "application/xml"
    }

    async fn marshal(&self, store: Arc<ReferenceStore>) -> Result<BodyReader, CodecError> {
        let Some(message) = self.message.clone() else {
            return Ok(BodyReader::empty());
        };

        let root = self.root.clone();
        let (writer, reader) = pipe(PIPE_CAPACITY);
        tokio::spawn(async move {
            let json = message.resolve(&store).unwrap_or(Json::Null);
            let bytes = match encode_document(&root, &json) {
                Ok(bytes) => bytes,
                Err(e) => {
                    writer.fail(e).await;
                    return;
                }
            };

            for chunk in bytes.chunks(CHUNK_SIZE) {
                if writer.write(chunk).await.is_err() {
                    tracing::debug!("XML body reader dropped before the end of the message");
                    return;
                }
            }

            let _ = writer.finish().await;
        });

        Ok(reader)
    }

    async fn unmarshal(&self, body: BodyReader, store: &ReferenceStore) -> Result<(), CodecError> {
        let bytes = body.read_to_end().await?;
        let Some(json) = decode_document(&self.root, &bytes)? else {
            return Ok(());
        };

        match &json {
            Json::Object(map) => store.store_values(&self.resource, "", map),
            other => store.store_reference(&self.resource, Reference::from_json("", other)),
        }

        Ok(())
    }
}

pub struct XmlCodecConstructor {
    root: String,
}

impl XmlCodecConstructor {
    /// Constructor whose messages use `root` as their root element
    pub fn new(root: impl Into<String>) -> Self {
        Self { root: root.into() }
    }
}

impl Default for XmlCodecConstructor {
    fn default() -> Self {
        Self::new(DEFAULT_ROOT)
    }
}

impl CodecConstructor for XmlCodecConstructor {
    fn name(&self) -> &str {
        "xml"
    }

    fn build(&self, resource: &str, message: Option<Template>) -> Result<Arc<dyn Codec>, ManifestError> {
        Ok(Arc::new(XmlCodec::new(resource, message).with_root(&self.root)))
    }

    fn metadata(&self) -> ComponentMetadata {
        ComponentMetadata {
            description: format!("Encode and decode XML messages rooted at <{}>", self.root),
            options: vec![],
        }
    }
}

fn encode_document(root: &str, json: &Json) -> Result<Vec<u8>, CodecError> {
    if json.is_array() {
        return Err(CodecError::Encode("the root of an XML message cannot be repeated".to_string()));
    }

    let mut writer = Writer::new(Vec::new());
    encode_element(&mut writer, root, json)?;
    Ok(writer.into_inner())
}

fn encode_element(writer: &mut Writer<Vec<u8>>, name: &str, json: &Json) -> Result<(), CodecError> {
    if let Json::Array(items) = json {
        for item in items {
            match item {
                Json::Null => continue,
                Json::Array(_) => {
                    return Err(CodecError::Encode(format!("nested arrays in '{}' cannot be encoded", name)));
                }
                item => encode_element(writer, name, item)?,
            }
        }
        return Ok(());
    }

    if name.is_empty() || name.contains(|c: char| c.is_whitespace() || "<>&/\"'".contains(c)) {
        return Err(CodecError::Encode(format!("'{}' is not a valid element name", name)));
    }

    write(writer, Event::Start(BytesStart::new(name)))?;
    match json {
        Json::Object(fields) => {
            for (key, field) in fields {
                encode_element(writer, key, field)?;
            }
        }
        Json::String(text) => write(writer, Event::Text(BytesText::new(text)))?,
        Json::Bool(_) | Json::Number(_) => write(writer, Event::Text(BytesText::new(&json.to_string())))?,
        Json::Null | Json::Array(_) => {}
    }
    write(writer, Event::End(BytesEnd::new(name)))
}

fn write(writer: &mut Writer<Vec<u8>>, event: Event<'_>) -> Result<(), CodecError> {
    writer
        .write_event(event)
        .map_err(|e| CodecError::Encode(e.to_string()))
}

/// An element being decoded
struct Frame {
    name: String,
    fields: Map<String, Json>,
    text: String,
}

impl Frame {
    fn new(name: String) -> Self {
        Self {
            name,
            fields: Map::new(),
            text: String::new(),
        }
    }

    fn into_json(self) -> Json {
        if !self.fields.is_empty() {
            return Json::Object(self.fields);
        }

        let text = self.text.trim();
        if text.is_empty() {
            Json::Null
        } else {
            scalar(text)
        }
    }

    fn push_text(&mut self, text: &str) -> Result<(), CodecError> {
        if text.trim().is_empty() {
            return Ok(());
        }

        if !self.fields.is_empty() {
            return Err(mixed_content(&self.name));
        }

        self.text.push_str(text);
        Ok(())
    }

    fn push_field(&mut self, name: String, value: Json) {
        match self.fields.get_mut(&name) {
            Some(Json::Array(items)) => items.push(value),
            Some(existing) => {
                let first = existing.take();
                *existing = Json::Array(vec![first, value]);
            }
            None => {
                self.fields.insert(name, value);
            }
        }
    }
}

/// Returns `None` for a body holding no element at all
fn decode_document(root: &str, bytes: &[u8]) -> Result<Option<Json>, CodecError> {
    let mut reader = Reader::from_reader(bytes);
    let mut stack: Vec<Frame> = Vec::new();
    let mut document: Option<Json> = None;

    loop {
        let event = reader
            .read_event()
            .map_err(|e| CodecError::Decode(format!("malformed XML at byte {}: {}", reader.buffer_position(), e)))?;

        match event {
            Event::Start(start) => {
                let name = element_name(&start)?;
                open(&mut stack, &document, root, name)?;
            }
            Event::Empty(start) => {
                let name = element_name(&start)?;
                open(&mut stack, &document, root, name)?;
                close(&mut stack, &mut document);
            }
            Event::End(_) => close(&mut stack, &mut document),
            Event::Text(text) => {
                let text = text
                    .unescape()
                    .map_err(|e| CodecError::Decode(format!("invalid character data: {}", e)))?;
                match stack.last_mut() {
                    Some(frame) => frame.push_text(&text)?,
                    None if text.trim().is_empty() => {}
                    None => return Err(CodecError::Decode("text outside of the root element".to_string())),
                }
            }
            Event::CData(data) => {
                let text = String::from_utf8_lossy(&data.into_inner()).into_owned();
                match stack.last_mut() {
                    Some(frame) => frame.push_text(&text)?,
                    None => return Err(CodecError::Decode("character data outside of the root element".to_string())),
                }
            }
            Event::Eof => {
                if let Some(frame) = stack.last() {
                    return Err(CodecError::Decode(format!(
                        "unexpected end of document inside '{}'",
                        frame.name
                    )));
                }
                return Ok(document);
            }
            Event::Decl(_) | Event::Comment(_) | Event::PI(_) | Event::DocType(_) => {}
        }
    }
}

fn element_name(start: &BytesStart<'_>) -> Result<String, CodecError> {
    std::str::from_utf8(start.local_name().as_ref())
        .map(str::to_string)
        .map_err(|e| CodecError::Decode(format!("element name is not UTF-8: {}", e)))
}

fn open(stack: &mut Vec<Frame>, document: &Option<Json>, root: &str, name: String) -> Result<(), CodecError> {
    match stack.last() {
        None if document.is_some() => {
            return Err(CodecError::Decode(format!("unexpected '{}' after the root element", name)));
        }
        None if name != root => {
            return Err(CodecError::Decode(format!("unexpected '{}', expected '{}'", name, root)));
        }
        Some(parent) if !parent.text.trim().is_empty() => return Err(mixed_content(&parent.name)),
        _ => {}
    }

    stack.push(Frame::new(name));
    Ok(())
}

fn close(stack: &mut Vec<Frame>, document: &mut Option<Json>) {
    let Some(frame) = stack.pop() else {
        return;
    };

    let name = frame.name.clone();
    let value = frame.into_json();
    match stack.last_mut() {
        Some(parent) => parent.push_field(name, value),
        None => *document = Some(value),
    }
}

fn mixed_content(name: &str) -> CodecError {
    CodecError::Decode(format!("element '{}' mixes text with child elements", name))
}

fn scalar(text: &str) -> Json {
    match text {
        "true" => return Json::Bool(true),
        "false" => return Json::Bool(false),
        _ => {}
    }

    if let Ok(integer) = text.parse::<i64>() {
        if integer.to_string() == text {
            return Json::from(integer);
        }
    }

    if text.contains('.') && !text.starts_with('.') && !text.ends_with('.') {
        if let Some(number) = text.parse::<f64>().ok().and_then(serde_json::Number::from_f64) {
            return Json::Number(number);
        }
    }

    Json::String(text.to_string())
}
