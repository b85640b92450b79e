use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use teloxide::{
    prelude::*,
    types::{ChatId, ChatPermissions, InlineKeyboardMarkup, MessageId, UserId},
};

/// Outbound calls to the messaging platform. Fallible, at-most-once,
/// non-transactional; callers decide whether a failure is swallowed.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send_text(&self, chat: ChatId, text: &str) -> Result<MessageId>;
    async fn send_with_keyboard(
        &self,
        chat: ChatId,
        text: &str,
        kb: InlineKeyboardMarkup,
    ) -> Result<MessageId>;
    async fn delete_message(&self, chat: ChatId, message: MessageId) -> Result<()>;
    async fn restrict(
        &self,
        chat: ChatId,
        user: UserId,
        until: Option<DateTime<Utc>>,
    ) -> Result<()>;
    async fn unrestrict(&self, chat: ChatId, user: UserId) -> Result<()>;
    async fn kick(&self, chat: ChatId, user: UserId) -> Result<()>;
    async fn ban(&self, chat: ChatId, user: UserId, until: Option<DateTime<Utc>>) -> Result<()>;
    async fn is_channel_member(&self, channel: ChatId, user: UserId) -> Result<bool>;
    async fn answer_callback(&self, callback_id: &str, text: &str) -> Result<()>;
    async fn edit_text(&self, chat: ChatId, message: MessageId, text: &str) -> Result<()>;
    async fn chat_administrators(&self, chat: ChatId) -> Result<Vec<UserId>>;
}

fn perm_hint(ctx: &str) -> &'static str {
    match ctx {
        "restrict_chat_member" => "需要管理员权限（限制成员发言），并且群内必须授予 bot Restrict 权限",
        "ban_chat_member" => "需要管理员权限（封禁/移除），并且群内必须授予 bot Ban users 权限",
        "delete_message" => "需要管理员权限（删消息），并且群内必须授予 bot Delete messages 权限",
        "get_chat_administrators" => "需要 bot 能读取管理员列表",
        "get_chat_member" => "需要 bot 在目标频道内（建议设为频道管理员）",
        "send_message" => "需要 bot 能在对应会话发消息；私聊时用户可能未 /start 或已屏蔽 bot",
        "edit_message_text" => "仅能编辑 bot 自己发送的消息",
        "answer_callback_query" => "用于按钮回调确认；失败多为网络/请求异常",
        _ => "检查 bot 是否为群管理员、以及是否授予了对应权限",
    }
}

/// The real thing: a thin wrapper over the teloxide client that attaches a
/// permission hint to every failure.
pub struct TelegramTransport {
    bot: Bot,
}

impl TelegramTransport {
    pub fn new(bot: Bot) -> Self {
        Self { bot }
    }
}

#[async_trait]
impl Transport for TelegramTransport {
    async fn send_text(&self, chat: ChatId, text: &str) -> Result<MessageId> {
        let msg = self
            .bot
            .send_message(chat, text)
            .await
            .with_context(|| perm_hint("send_message"))?;
        Ok(msg.id)
    }

    async fn send_with_keyboard(
        &self,
        chat: ChatId,
        text: &str,
        kb: InlineKeyboardMarkup,
    ) -> Result<MessageId> {
        let msg = self
            .bot
            .send_message(chat, text)
            .reply_markup(kb)
            .await
            .with_context(|| perm_hint("send_message"))?;
        Ok(msg.id)
    }

    async fn delete_message(&self, chat: ChatId, message: MessageId) -> Result<()> {
        self.bot
            .delete_message(chat, message)
            .await
            .with_context(|| perm_hint("delete_message"))?;
        Ok(())
    }

    async fn restrict(
        &self,
        chat: ChatId,
        user: UserId,
        until: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let req = self
            .bot
            .restrict_chat_member(chat, user, ChatPermissions::empty());
        match until {
            Some(ts) => req.until_date(ts).await,
            None => req.await,
        }
        .with_context(|| perm_hint("restrict_chat_member"))?;
        Ok(())
    }

    async fn unrestrict(&self, chat: ChatId, user: UserId) -> Result<()> {
        self.bot
            .restrict_chat_member(chat, user, ChatPermissions::all())
            .await
            .with_context(|| perm_hint("restrict_chat_member"))?;
        Ok(())
    }

    async fn kick(&self, chat: ChatId, user: UserId) -> Result<()> {
        // kick = ban + unban, so the user may rejoin
        self.bot
            .ban_chat_member(chat, user)
            .await
            .with_context(|| perm_hint("ban_chat_member"))?;
        self.bot
            .unban_chat_member(chat, user)
            .await
            .with_context(|| perm_hint("ban_chat_member"))?;
        Ok(())
    }

    async fn ban(&self, chat: ChatId, user: UserId, until: Option<DateTime<Utc>>) -> Result<()> {
        let req = self.bot.ban_chat_member(chat, user);
        match until {
            Some(ts) => req.until_date(ts).await,
            None => req.await,
        }
        .with_context(|| perm_hint("ban_chat_member"))?;
        Ok(())
    }

    async fn is_channel_member(&self, channel: ChatId, user: UserId) -> Result<bool> {
        let member = self
            .bot
            .get_chat_member(channel, user)
            .await
            .with_context(|| perm_hint("get_chat_member"))?;
        Ok(member.is_present())
    }

    async fn answer_callback(&self, callback_id: &str, text: &str) -> Result<()> {
        self.bot
            .answer_callback_query(callback_id.to_string())
            .text(text)
            .await
            .with_context(|| perm_hint("answer_callback_query"))?;
        Ok(())
    }

    async fn edit_text(&self, chat: ChatId, message: MessageId, text: &str) -> Result<()> {
        self.bot
            .edit_message_text(chat, message, text)
            .await
            .with_context(|| perm_hint("edit_message_text"))?;
        Ok(())
    }

    async fn chat_administrators(&self, chat: ChatId) -> Result<Vec<UserId>> {
        let admins = self
            .bot
            .get_chat_administrators(chat)
            .await
            .with_context(|| perm_hint("get_chat_administrators"))?;
        Ok(admins.into_iter().map(|m| m.user.id).collect())
    }
}

#[cfg(test)]
pub mod fake {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
    use std::sync::Mutex;

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum Call {
        Send { chat: i64, text: String },
        Delete { chat: i64, message: i32 },
        Restrict { chat: i64, user: u64 },
        Unrestrict { chat: i64, user: u64 },
        Kick { chat: i64, user: u64 },
        Ban { chat: i64, user: u64 },
        ChannelCheck { channel: i64, user: u64 },
        AnswerCallback { id: String, text: String },
        Edit { chat: i64, message: i32 },
    }

    /// Records every call; knobs force failures or flip channel membership.
    #[derive(Default)]
    pub struct FakeTransport {
        pub calls: Mutex<Vec<Call>>,
        pub fail_delete: AtomicBool,
        pub channel_member: AtomicBool,
        next_msg_id: AtomicI32,
    }

    impl FakeTransport {
        pub fn new() -> Self {
            let t = Self::default();
            t.channel_member.store(true, Ordering::SeqCst);
            t.next_msg_id.store(1000, Ordering::SeqCst);
            t
        }

        pub fn calls(&self) -> Vec<Call> {
            self.calls.lock().unwrap().clone()
        }

        pub fn deletes(&self) -> Vec<(i64, i32)> {
            self.calls()
                .into_iter()
                .filter_map(|c| match c {
                    Call::Delete { chat, message } => Some((chat, message)),
                    _ => None,
                })
                .collect()
        }

        fn push(&self, call: Call) {
            self.calls.lock().unwrap().push(call);
        }
    }

    #[async_trait]
    impl Transport for FakeTransport {
        async fn send_text(&self, chat: ChatId, text: &str) -> Result<MessageId> {
            self.push(Call::Send {
                chat: chat.0,
                text: text.to_string(),
            });
            Ok(MessageId(self.next_msg_id.fetch_add(1, Ordering::SeqCst)))
        }

        async fn send_with_keyboard(
            &self,
            chat: ChatId,
            text: &str,
            _kb: InlineKeyboardMarkup,
        ) -> Result<MessageId> {
            self.send_text(chat, text).await
        }

        async fn delete_message(&self, chat: ChatId, message: MessageId) -> Result<()> {
            self.push(Call::Delete {
                chat: chat.0,
                message: message.0,
            });
            if self.fail_delete.load(Ordering::SeqCst) {
                anyhow::bail!("message to delete not found");
            }
            Ok(())
        }

        async fn restrict(
            &self,
            chat: ChatId,
            user: UserId,
            _until: Option<DateTime<Utc>>,
        ) -> Result<()> {
            self.push(Call::Restrict {
                chat: chat.0,
                user: user.0,
            });
            Ok(())
        }

        async fn unrestrict(&self, chat: ChatId, user: UserId) -> Result<()> {
            self.push(Call::Unrestrict {
                chat: chat.0,
                user: user.0,
            });
            Ok(())
        }

        async fn kick(&self, chat: ChatId, user: UserId) -> Result<()> {
            self.push(Call::Kick {
                chat: chat.0,
                user: user.0,
            });
            Ok(())
        }

        async fn ban(
            &self,
            chat: ChatId,
            user: UserId,
            _until: Option<DateTime<Utc>>,
        ) -> Result<()> {
            self.push(Call::Ban {
                chat: chat.0,
                user: user.0,
            });
            Ok(())
        }

        async fn is_channel_member(&self, channel: ChatId, user: UserId) -> Result<bool> {
            self.push(Call::ChannelCheck {
                channel: channel.0,
                user: user.0,
            });
            Ok(self.channel_member.load(Ordering::SeqCst))
        }

        async fn answer_callback(&self, callback_id: &str, text: &str) -> Result<()> {
            self.push(Call::AnswerCallback {
                id: callback_id.to_string(),
                text: text.to_string(),
            });
            Ok(())
        }

        async fn edit_text(&self, chat: ChatId, message: MessageId, _text: &str) -> Result<()> {
            self.push(Call::Edit {
                chat: chat.0,
                message: message.0,
            });
            Ok(())
        }

        async fn chat_administrators(&self, _chat: ChatId) -> Result<Vec<UserId>> {
            Ok(vec![])
        }
    }
}
