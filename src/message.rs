use teloxide::types::{ChatId, Message, MessageEntityKind, MessageId, UserId};

/// What a message carries, for auto-delete rule matching.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaClass {
    None,
    Photo,
    Video,
    Animation,
    Sticker,
    Document,
    Audio,
    Voice,
}

/// Flat view of one inbound group message. Detectors work on this instead of
/// the raw API type so they stay pure and constructible in tests.
#[derive(Debug, Clone)]
pub struct Inbound {
    pub chat_id: ChatId,
    pub message_id: MessageId,
    pub user_id: UserId,
    pub is_bot: bool,
    pub text: String,
    pub sticker_set: Option<String>,
    pub media: MediaClass,
    pub document_name: Option<String>,
    pub forwarded: bool,
    pub contact: bool,
    pub premium_emoji: bool,
    pub links: Vec<String>,
}

impl Inbound {
    pub fn from_message(msg: &Message) -> Option<Self> {
        let from = msg.from.as_ref()?;
        let text = msg
            .text()
            .or_else(|| msg.caption())
            .unwrap_or("")
            .to_string();

        let media = if msg.sticker().is_some() {
            MediaClass::Sticker
        } else if msg.photo().is_some() {
            MediaClass::Photo
        } else if msg.video().is_some() {
            MediaClass::Video
        } else if msg.animation().is_some() {
            MediaClass::Animation
        } else if msg.document().is_some() {
            MediaClass::Document
        } else if msg.audio().is_some() {
            MediaClass::Audio
        } else if msg.voice().is_some() || msg.video_note().is_some() {
            MediaClass::Voice
        } else {
            MediaClass::None
        };

        let mut links = extract_links(&text);
        let mut premium_emoji = false;
        if let Some(entities) = msg.entities().or_else(|| msg.caption_entities()) {
            for e in entities {
                match &e.kind {
                    MessageEntityKind::TextLink { url } => links.push(url.to_string()),
                    MessageEntityKind::CustomEmoji { .. } => premium_emoji = true,
                    _ => {}
                }
            }
        }

        Some(Self {
            chat_id: msg.chat.id,
            message_id: msg.id,
            user_id: from.id,
            is_bot: from.is_bot,
            text,
            sticker_set: msg.sticker().and_then(|s| s.set_name.clone()),
            media,
            document_name: msg.document().and_then(|d| d.file_name.clone()),
            forwarded: msg.forward_origin().is_some(),
            contact: msg.contact().is_some(),
            premium_emoji,
            links,
        })
    }

    pub fn is_command(&self) -> bool {
        self.text.starts_with('/')
    }

    #[cfg(test)]
    pub fn sample(chat: i64, user: u64, message: i32, text: &str) -> Self {
        Self {
            chat_id: ChatId(chat),
            message_id: MessageId(message),
            user_id: UserId(user),
            is_bot: false,
            text: text.to_string(),
            sticker_set: None,
            media: MediaClass::None,
            document_name: None,
            forwarded: false,
            contact: false,
            premium_emoji: false,
            links: extract_links(text),
        }
    }
}

/// Token scan for plain links; entity links are merged in separately.
fn extract_links(text: &str) -> Vec<String> {
    text.split_whitespace()
        .filter(|t| t.contains("://") || t.starts_with("t.me/") || t.contains(".me/+"))
        .map(|t| t.trim_matches(|c: char| c == '(' || c == ')' || c == ',' || c == '。').to_string())
        .collect()
}
