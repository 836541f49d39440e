use crate::error::{DispatchError, DispatchResult};
use crate::recipients::Recipient;
use lettre::message::{header, Attachment, Mailbox, MultiPart, SinglePart};
use lettre::{Address, Message};
use std::path::Path;
use std::sync::Arc;

const FALLBACK_MIME: &str = "application/octet-stream";

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Name,
    Company,
}

/// Subject plus a parsed body template.
///
/// Only `{name}` and `{company}` are substituted. `{{` and `}}` produce
/// literal braces and any other `{word}` is kept verbatim. A brace without
/// a partner is rejected when the template is parsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageTemplate {
    subject: String,
    segments: Vec<Segment>,
}

impl MessageTemplate {
    pub fn new(subject: impl Into<String>, body_template: &str) -> DispatchResult<Self> {
        Ok(Self {
            subject: subject.into(),
            segments: parse_segments(body_template)?,
        })
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    pub fn render(&self, recipient: &Recipient) -> String {
        let mut body = String::new();
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => body.push_str(text),
                Segment::Name => body.push_str(&recipient.name),
                Segment::Company => body.push_str(&recipient.company),
            }
        }
        body
    }
}

fn parse_segments(template: &str) -> DispatchResult<Vec<Segment>> {
    let mut segments = Vec::new();
    let mut literal = String::new();
    let mut chars = template.char_indices().peekable();

    while let Some((offset, c)) = chars.next() {
        match c {
            '{' if chars.peek().map(|&(_, next)| next) == Some('{') => {
                chars.next();
                literal.push('{');
            }
            '{' => {
                let mut token = String::new();
                let mut closed = false;
                for (_, inner) in chars.by_ref() {
                    match inner {
                        '}' => {
                            closed = true;
                            break;
                        }
                        '{' => break,
                        other => token.push(other),
                    }
                }
                if !closed {
                    return Err(DispatchError::Template(format!(
                        "unclosed '{{' at {}",
                        position(template, offset)
                    )));
                }
                match token.as_str() {
                    "name" | "company" => {
                        if !literal.is_empty() {
                            segments.push(Segment::Literal(std::mem::take(&mut literal)));
                        }
                        segments.push(if token == "name" {
                            Segment::Name
                        } else {
                            Segment::Company
                        });
                    }
                    _ => {
                        literal.push('{');
                        literal.push_str(&token);
                        literal.push('}');
                    }
                }
            }
            '}' if chars.peek().map(|&(_, next)| next) == Some('}') => {
                chars.next();
                literal.push('}');
            }
            '}' => {
                return Err(DispatchError::Template(format!(
                    "unmatched '}}' at {}",
                    position(template, offset)
                )));
            }
            other => literal.push(other),
        }
    }

    if !literal.is_empty() {
        segments.push(Segment::Literal(literal));
    }
    Ok(segments)
}

fn position(template: &str, offset: usize) -> String {
    let before = &template[..offset];
    let line = before.matches('\n').count() + 1;
    let column = before.rsplit('\n').next().map(|l| l.chars().count()).unwrap_or(0) + 1;
    format!("line {line}, column {column}")
}

/// Attachment bytes, read once and shared by every payload of a run.
#[derive(Debug, PartialEq, Eq)]
pub struct AttachmentBlob {
    filename: String,
    mime_type: String,
    content: Vec<u8>,
}

impl AttachmentBlob {
    pub fn new(filename: impl Into<String>, content: Vec<u8>) -> Self {
        let filename = filename.into();
        let mime_type = mime_guess::from_path(&filename)
            .first_raw()
            .unwrap_or(FALLBACK_MIME)
            .to_string();
        Self {
            filename,
            mime_type,
            content,
        }
    }

    /// Reads the file exactly once; `filename` overrides the name shown to
    /// recipients.
    pub fn from_path<P: AsRef<Path>>(path: P, filename: Option<&str>) -> std::io::Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read(path)?;
        let filename = match filename {
            Some(name) => name.to_string(),
            None => path
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_else(|| "attachment".to_string()),
        };
        log::info!("📎 Attachment {filename} loaded ({} bytes)", content.len());
        Ok(Self::new(filename, content))
    }

    pub fn filename(&self) -> &str {
        &self.filename
    }

    pub fn mime_type(&self) -> &str {
        &self.mime_type
    }

    pub fn content(&self) -> &[u8] {
        &self.content
    }

    fn to_part(&self) -> DispatchResult<SinglePart> {
        let content_type = header::ContentType::parse(&self.mime_type)
            .or_else(|_| header::ContentType::parse(FALLBACK_MIME))
            .map_err(|e| DispatchError::Message(format!("content type: {e}")))?;
        Ok(Attachment::new(self.filename.clone()).body(self.content.clone(), content_type))
    }
}

/// One transport-ready message.
#[derive(Debug, Clone)]
pub struct Payload {
    pub from: Mailbox,
    pub to: Address,
    pub subject: String,
    pub body: String,
    pub attachment: Option<Arc<AttachmentBlob>>,
}

impl Payload {
    pub fn to_message(&self) -> DispatchResult<Message> {
        let builder = Message::builder()
            .from(self.from.clone())
            .to(Mailbox::new(None, self.to.clone()))
            .subject(self.subject.clone());

        let text = SinglePart::builder()
            .header(header::ContentType::TEXT_PLAIN)
            .body(self.body.clone());

        let message = match &self.attachment {
            Some(blob) => builder.multipart(
                MultiPart::mixed()
                    .singlepart(text)
                    .singlepart(blob.to_part()?),
            ),
            None => builder.singlepart(text),
        };
        message.map_err(|e| DispatchError::Message(e.to_string()))
    }

    /// The RFC 5322 bytes handed to the transport.
    pub fn formatted(&self) -> DispatchResult<Vec<u8>> {
        Ok(self.to_message()?.formatted())
    }
}

/// Renders recipients into payloads. Holds no per-recipient state.
#[derive(Debug, Clone)]
pub struct Composer {
    sender: Mailbox,
    template: MessageTemplate,
    attachment: Option<Arc<AttachmentBlob>>,
}

impl Composer {
    pub fn new(
        sender: Mailbox,
        template: MessageTemplate,
        attachment: Option<AttachmentBlob>,
    ) -> Self {
        Self {
            sender,
            template,
            attachment: attachment.map(Arc::new),
        }
    }

    pub fn sender(&self) -> &Mailbox {
        &self.sender
    }

    pub fn compose(&self, recipient: &Recipient) -> DispatchResult<Payload> {
        let to: Address = recipient
            .email
            .parse()
            .map_err(|_| DispatchError::InvalidAddress(recipient.email.clone()))?;

        Ok(Payload {
            from: self.sender.clone(),
            to,
            subject: self.template.subject().to_string(),
            body: self.template.render(recipient),
            attachment: self.attachment.clone(),
        })
    }
}
