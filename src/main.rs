use anyhow::Result;
use chrono::Utc;
use dashmap::DashMap;
use std::{collections::HashMap, path::PathBuf, sync::Arc, time::Duration};
use teloxide::{
    dispatching::UpdateHandler,
    dptree,
    prelude::*,
    types::{CallbackQuery, ChatId, Message, UserId},
};
use tokio::sync::broadcast;
use tracing::{info, warn};

mod config;
mod counter;
mod detect;
mod message;
mod outcome;
mod persist;
mod pipeline;
mod punish;
mod sched;
mod transport;
mod verify;

use config::{load_config, parse_config_arg, validate_config, CompiledPolicy, RuntimeConfig};
use counter::CounterStore;
use message::Inbound;
use outcome::OutcomeLog;
use pipeline::Pipeline;
use punish::Punisher;
use sched::Scheduler;
use transport::{TelegramTransport, Transport};
use verify::{AnswerOutcome, Verifier};

struct GroupHandle {
    name: String,
    policy: Arc<CompiledPolicy>,
}

struct App {
    runtime: RuntimeConfig,
    groups: HashMap<ChatId, GroupHandle>,
    pipeline: Pipeline,
    punisher: Punisher,
    verifier: Arc<Verifier>,
    scheduler: Arc<Scheduler>,
    transport: Arc<dyn Transport>,
    admins: DashMap<ChatId, Vec<UserId>>,
}

impl App {
    async fn refresh_admins(&self, chat: ChatId) {
        match self.transport.chat_administrators(chat).await {
            Ok(ids) => {
                self.admins.insert(chat, ids);
            }
            Err(e) => warn!("refresh_admins failed (chat={}): {:?}", chat, e),
        }
    }

    async fn is_admin(&self, chat: ChatId, user: UserId) -> bool {
        if self.admins.get(&chat).is_none() {
            self.refresh_admins(chat).await;
        }
        self.admins
            .get(&chat)
            .map(|ids| ids.contains(&user))
            .unwrap_or(false)
    }
}

async fn handle_new_members(app: &App, msg: &Message) -> Result<()> {
    let chat_id = msg.chat.id;
    let Some(handle) = app.groups.get(&chat_id) else {
        return Ok(());
    };
    for u in msg.new_chat_members().unwrap_or(&[]) {
        app.verifier
            .on_join(chat_id, u.id, u.is_bot, &handle.policy)
            .await?;
    }
    Ok(())
}

async fn handle_private_answer(app: &App, msg: &Message) -> Result<()> {
    let Some(from) = msg.from.as_ref() else {
        return Ok(());
    };
    let text = msg.text().unwrap_or("").trim();
    if text.is_empty() {
        return Ok(());
    }

    let Some((_, outcome)) = app.verifier.on_answer(from.id, text, Utc::now()).await else {
        return Ok(());
    };
    let reply = match outcome {
        AnswerOutcome::Passed => "✅ 验证通过，已解除限制。".to_string(),
        AnswerOutcome::Wrong { remaining } => {
            format!("回答不正确，剩余 {} 次机会。", remaining)
        }
        AnswerOutcome::Failed => "❌ 回答错误次数过多，验证失败。".to_string(),
        AnswerOutcome::Expired => "验证已超时。".to_string(),
        AnswerOutcome::Unavailable => "暂时无法完成校验，请稍后再试。".to_string(),
        AnswerOutcome::NoPending => return Ok(()),
    };
    if let Err(e) = app.transport.send_text(msg.chat.id, &reply).await {
        warn!("answer reply failed: {:?}", e);
    }
    Ok(())
}

/// `/sweep <secret>` runs the due deferred deletes on demand; the periodic
/// ticker is the usual caller, this is the externally triggered path.
async fn handle_sweep_command(app: &App, chat: ChatId, text: &str) {
    let supplied = text.split_whitespace().nth(1).unwrap_or("");
    if supplied != app.runtime.sweep_secret {
        // wrong secret: stay silent
        return;
    }
    let stats = app.scheduler.sweep(Utc::now()).await;
    let reply = format!(
        "清理完成：处理 {}，成功 {}，失败 {}。",
        stats.processed, stats.succeeded, stats.failed
    );
    if let Err(e) = app.transport.send_text(chat, &reply).await {
        warn!("sweep reply failed: {:?}", e);
    }
}

async fn handle_group_message(app: &App, msg: &Message) -> Result<()> {
    let chat_id = msg.chat.id;
    let Some(handle) = app.groups.get(&chat_id) else {
        return Ok(());
    };

    if let Some(text) = msg.text() {
        if text.starts_with("/sweep") {
            handle_sweep_command(app, chat_id, text).await;
            return Ok(());
        }
    }

    let Some(inbound) = Inbound::from_message(msg) else {
        return Ok(());
    };
    if inbound.is_bot {
        return Ok(());
    }
    if app.runtime.ignore_admins.unwrap_or(true) && app.is_admin(chat_id, inbound.user_id).await {
        return Ok(());
    }

    let outcome = app.pipeline.evaluate(&inbound, &handle.policy);
    if let Some(verdict) = outcome.verdict {
        let result = app.punisher.apply(&verdict, &handle.policy, &inbound).await;
        info!(
            "moderated chat={}({}) user={} detector={} action={:?} ok={}",
            chat_id,
            handle.name,
            inbound.user_id,
            verdict.detector.as_str(),
            result.action,
            result.ok
        );
    }
    Ok(())
}

async fn handle_callback_query(app: &App, q: CallbackQuery) -> Result<()> {
    let Some(data) = q.data.clone() else {
        return Ok(());
    };
    let Some(chat) = verify::parse_callback_data(&data) else {
        return Ok(());
    };

    let outcome = app.verifier.on_callback(chat, q.from.id, Utc::now()).await;
    let text = match outcome {
        AnswerOutcome::Passed => "验证通过。",
        AnswerOutcome::Wrong { .. } => "尚未检测到关注，请先关注频道再试。",
        AnswerOutcome::Failed => "尝试次数已用完，验证失败。",
        AnswerOutcome::Expired => "已超时，验证失败。",
        AnswerOutcome::Unavailable => "暂时无法校验，请稍后再试。",
        AnswerOutcome::NoPending => "该验证已结束或不存在。",
    };
    if let Err(e) = app.transport.answer_callback(q.id.as_str(), text).await {
        warn!("answer_callback failed: {:?}", e);
    }
    Ok(())
}

fn schema() -> UpdateHandler<anyhow::Error> {
    dptree::entry()
        .branch(
            Update::filter_message().endpoint(|app: Arc<App>, msg: Message| async move {
                if msg.new_chat_members().is_some() {
                    if let Err(e) = handle_new_members(&app, &msg).await {
                        warn!("join handling failed: {:?}", e);
                    }
                }
                if msg.chat.is_private() {
                    let _ = handle_private_answer(&app, &msg).await;
                } else {
                    let _ = handle_group_message(&app, &msg).await;
                }
                Ok(())
            }),
        )
        .branch(
            Update::filter_callback_query().endpoint(|app: Arc<App>, q: CallbackQuery| async move {
                let _ = handle_callback_query(&app, q).await;
                Ok(())
            }),
        )
}

#[tokio::main]
async fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let config_path = parse_config_arg(&args).unwrap_or_else(|| PathBuf::from("config.yaml"));

    let cfg = load_config(&config_path)?;
    validate_config(&cfg)?;

    let filter = cfg.bot.log_level.clone().unwrap_or_else(|| "info".into());
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let data_dir = cfg.runtime.data_dir();
    let policy_dir = cfg.runtime.policy_dir();

    let bot = Bot::new(cfg.bot.token.clone());
    let transport: Arc<dyn Transport> = Arc::new(TelegramTransport::new(bot.clone()));
    let outcomes = Arc::new(OutcomeLog::new(&data_dir));
    let scheduler = Arc::new(Scheduler::new(transport.clone(), outcomes.clone(), &data_dir));
    let verifier = Arc::new(Verifier::new(
        transport.clone(),
        scheduler.clone(),
        outcomes.clone(),
        &data_dir,
        cfg.runtime.welcome_ttl_secs,
    ));
    scheduler.restore();
    verifier.restore();

    let punisher = Punisher::new(
        transport.clone(),
        Arc::new(CounterStore::new()),
        scheduler.clone(),
        outcomes,
    );

    let mut groups = HashMap::new();
    for g in &cfg.groups {
        let policy = config::load_policy(&policy_dir, g)?;
        info!("loaded group {} (chat_id={})", g.name, g.chat_id);
        groups.insert(
            ChatId(g.chat_id),
            GroupHandle {
                name: g.name.clone(),
                policy: Arc::new(policy),
            },
        );
    }

    let app = Arc::new(App {
        runtime: cfg.runtime.clone(),
        groups,
        pipeline: Pipeline::new(),
        punisher,
        verifier,
        scheduler,
        transport,
        admins: DashMap::new(),
    });

    let (shutdown_tx, _) = broadcast::channel::<()>(8);

    let sweep_app = app.clone();
    let mut shutdown_rx_sweep = shutdown_tx.subscribe();
    let h_sweep = tokio::spawn(async move {
        let secs = sweep_app.runtime.sweep_interval_secs.unwrap_or(60);
        let mut ticker = tokio::time::interval(Duration::from_secs(secs.max(5)));
        loop {
            tokio::select! {
                _ = shutdown_rx_sweep.recv() => { break; }
                _ = ticker.tick() => {
                    sweep_app.scheduler.sweep(Utc::now()).await;
                }
            }
        }
    });

    let prune_app = app.clone();
    let mut shutdown_rx_prune = shutdown_tx.subscribe();
    let h_prune = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(15));
        loop {
            tokio::select! {
                _ = shutdown_rx_prune.recv() => { break; }
                _ = ticker.tick() => {
                    prune_app.verifier.prune(Utc::now()).await;
                }
            }
        }
    });

    let admin_app = app.clone();
    let mut shutdown_rx_admin = shutdown_tx.subscribe();
    let h_admin = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(180));
        loop {
            tokio::select! {
                _ = shutdown_rx_admin.recv() => { break; }
                _ = ticker.tick() => {
                    let chats: Vec<ChatId> = admin_app.groups.keys().copied().collect();
                    for chat in chats {
                        admin_app.refresh_admins(chat).await;
                    }
                }
            }
        }
    });

    info!("start polling ({} groups)", app.groups.len());

    Dispatcher::builder(bot, schema())
        .dependencies(dptree::deps![app.clone()])
        .default_handler(|upd| async move {
            let _ = upd;
        })
        .error_handler(LoggingErrorHandler::with_custom_text("Dispatcher error"))
        .enable_ctrlc_handler()
        .build()
        .dispatch()
        .await;

    let _ = shutdown_tx.send(());
    let _ = h_sweep.await;
    let _ = h_prune.await;
    let _ = h_admin.await;

    Ok(())
}
