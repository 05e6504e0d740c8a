use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use futures::future::BoxFuture;
use teloxide::{
    dispatching::Dispatcher,
    error_handlers::ErrorHandler,
    prelude::*,
    types::{BotCommandScope, CallbackQuery, ChatId, Message, ParseMode, Recipient},
    update_listeners,
    utils::command::BotCommands,
};
use thiserror::Error;

use crate::{
    domain::{BroadcastScope, JobStatus, NewBroadcastJob, MAX_WINNERS},
    infrastructure::shutdown::ShutdownListener,
    tasks::sender::SendOutcome,
};

use super::{
    keyboards::{giveaway_user_kb, not_subscribed_kb, parse_callback},
    types::{
        is_channel_subscriber, parse_broadcast, parse_id, parse_id_and_rest, parse_new_giveaway,
        parse_publish, AdminCommand, AppState, BotResult, UserCommand,
    },
    utils::{
        escape_html, format_ends_at, format_user_display, optional_text, parse_local_datetime,
        render_giveaway_intro, render_giveaway_summary, render_join_confirmation, render_rules,
        user_to_i64, winners_label,
    },
};

const PARTICIPANTS_PAGE: i64 = 50;
const RECENT_JOBS: i64 = 10;

/// Admin command failure: bad input is echoed back, anything else is logged.
#[derive(Debug, Error)]
enum CommandError {
    #[error("{0}")]
    Invalid(String),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

type CommandResult = Result<String, CommandError>;

fn invalid(message: impl Into<String>) -> CommandError {
    CommandError::Invalid(message.into())
}

struct ListenerErrorLog;

impl ErrorHandler<teloxide::RequestError> for ListenerErrorLog {
    fn handle_error(self: Arc<Self>, error: teloxide::RequestError) -> BoxFuture<'static, ()> {
        Box::pin(async move {
            tracing::error!(target: "telegram", error = %error, "update listener error");
        })
    }
}

pub struct TelegramService {
    bot: Bot,
    state: Arc<AppState>,
}

impl TelegramService {
    pub fn new(bot: Bot, state: Arc<AppState>) -> Self {
        Self { bot, state }
    }

    pub async fn run(&self, mut shutdown: ShutdownListener) -> Result<()> {
        self.sync_commands().await?;
        let me = self.bot.get_me().await?;
        if let Some(expected_username) = &self.state.config.bot_username {
            if me.username.as_deref() != Some(expected_username.as_str()) {
                tracing::warn!(
                    target: "telegram",
                    expected = expected_username.as_str(),
                    actual = ?me.username,
                    "BOT_USERNAME does not match the bot account"
                );
            }
        }
        if let Some(username) = me.username.clone() {
            let _ = self.state.bot_username.set(username);
        }
        tracing::info!(
            target: "telegram",
            bot_id = me.id.0,
            username = ?me.username,
            "connected to Telegram"
        );

        let messages = Update::filter_message()
            .branch(
                dptree::entry()
                    .filter_command::<UserCommand>()
                    .endpoint(Self::on_user_command),
            )
            .branch(
                dptree::entry()
                    .filter(|msg: Message, state: Arc<AppState>| {
                        msg.from
                            .as_ref()
                            .is_some_and(|user| state.is_admin(user_to_i64(user)))
                    })
                    .filter_command::<AdminCommand>()
                    .endpoint(Self::on_admin_command),
            )
            .branch(
                dptree::entry()
                    .filter_command::<AdminCommand>()
                    .endpoint(Self::on_denied_command),
            );
        let handler = dptree::entry()
            .branch(messages)
            .branch(Update::filter_callback_query().endpoint(Self::on_callback));

        let mut dispatcher = Dispatcher::builder(self.bot.clone(), handler)
            .dependencies(dptree::deps![self.state.clone()])
            .default_handler(|update| async move {
                tracing::debug!(target: "telegram", ?update, "unhandled update");
            })
            .build();

        let listener = update_listeners::polling_default(self.bot.clone()).await;

        let shutdown_token = dispatcher.shutdown_token();
        let mut dispatcher_future = Box::pin(
            dispatcher.dispatch_with_listener(listener, Arc::new(ListenerErrorLog)),
        );
        let mut dispatcher_finished = false;

        tokio::select! {
            _ = shutdown.notified() => {
                tracing::info!(target: "telegram", "dispatcher shutdown requested");
                if let Ok(wait) = shutdown_token.shutdown() {
                    wait.await;
                }
            }
            _ = &mut dispatcher_future => {
                dispatcher_finished = true;
                tracing::info!(target: "telegram", "dispatcher finished");
            }
        }

        if !dispatcher_finished {
            dispatcher_future.await;
        }

        Ok(())
    }

    async fn on_user_command(
        bot: Bot,
        msg: Message,
        cmd: UserCommand,
        state: Arc<AppState>,
    ) -> BotResult<()> {
        let UserCommand::Start(payload) = cmd;
        let Some(user) = msg.from.as_ref() else {
            return Ok(());
        };
        let user_id = user_to_i64(user);
        if let Err(err) = state.users.upsert(user_id, user.username.as_deref()).await {
            tracing::error!(target: "telegram", user_id, error = %err, "failed to register user");
        }

        let giveaway_id = payload
            .trim()
            .strip_prefix("gw_")
            .and_then(|id| id.parse::<i64>().ok());
        let Some(giveaway_id) = giveaway_id else {
            let greeting = if state.is_admin(user_id) {
                "Привет! Вы администратор. Список команд: /help"
            } else {
                "Привет! Откройте ссылку на розыгрыш, чтобы принять участие."
            };
            bot.send_message(msg.chat.id, greeting).await?;
            return Ok(());
        };

        match state.giveaways.get(giveaway_id).await {
            Ok(Some(giveaway)) if giveaway.is_active() => {
                bot.send_message(msg.chat.id, render_giveaway_intro(&giveaway))
                    .parse_mode(ParseMode::Html)
                    .reply_markup(giveaway_user_kb(giveaway.id))
                    .await?;
            }
            Ok(_) => {
                bot.send_message(msg.chat.id, "Розыгрыш не найден или уже завершён.")
                    .await?;
            }
            Err(err) => {
                tracing::error!(target: "telegram", giveaway_id, error = %err, "failed to load giveaway");
                bot.send_message(msg.chat.id, "Не удалось загрузить розыгрыш, попробуйте позже.")
                    .await?;
            }
        }
        Ok(())
    }

    async fn on_denied_command(bot: Bot, msg: Message) -> BotResult<()> {
        bot.send_message(msg.chat.id, "Эта команда доступна только администраторам.")
            .await?;
        Ok(())
    }

    async fn on_admin_command(
        bot: Bot,
        msg: Message,
        cmd: AdminCommand,
        state: Arc<AppState>,
    ) -> BotResult<()> {
        let admin_id = msg.from.as_ref().map(user_to_i64).unwrap_or_default();
        let reply = match Self::run_admin(&state, admin_id, cmd).await {
            Ok(reply) => reply,
            Err(CommandError::Invalid(message)) => escape_html(&message),
            Err(CommandError::Internal(err)) => {
                tracing::error!(target: "admin", admin_id, error = %err, "admin command failed");
                "Ошибка при выполнении команды, подробности в логах.".to_string()
            }
        };
        bot.send_message(msg.chat.id, reply)
            .parse_mode(ParseMode::Html)
            .await?;
        Ok(())
    }

    async fn run_admin(state: &AppState, admin_id: i64, cmd: AdminCommand) -> CommandResult {
        match cmd {
            AdminCommand::Admin => {
                let stats = state.giveaways.stats().await?;
                let users = state.users.count().await?;
                Ok(format!(
                    "<b>Статистика</b>\n\
                     Пользователей: {users}\n\
                     Розыгрышей: {} (активных {}, завершённых {})\n\
                     Участников: {} (доступны для ЛС {})\n\
                     Победителей: {}\n\
                     Рассылок: {}",
                    stats.giveaways_total,
                    stats.giveaways_active,
                    stats.giveaways_finished,
                    stats.participants_total,
                    stats.participants_can_dm,
                    stats.winners_total,
                    stats.broadcasts_total,
                ))
            }
            AdminCommand::Help => Ok(escape_html(&AdminCommand::descriptions().to_string())),
            AdminCommand::New(args) => {
                let new = parse_new_giveaway(&args, state.timezone, admin_id).map_err(invalid)?;
                let giveaway = state.giveaways.create(new).await?;
                if let Some(ends_at) = giveaway.ends_at {
                    state.scheduler.schedule_end(giveaway.id, ends_at).await?;
                }
                tracing::info!(target: "admin", admin_id, giveaway_id = giveaway.id, "giveaway created");
                let mut reply = format!(
                    "Розыгрыш <b>#{}</b> создан.\nПобедителей: {}\nОкончание: {}",
                    giveaway.id,
                    winners_label(giveaway.winners_mode),
                    format_ends_at(giveaway.ends_at, state.timezone),
                );
                if let Some(link) = state.deep_link(giveaway.id) {
                    reply.push_str(&format!("\nСсылка: {link}"));
                }
                Ok(reply)
            }
            AdminCommand::Giveaways => {
                let giveaways = state.giveaways.list_all().await?;
                if giveaways.is_empty() {
                    return Ok("Розыгрышей пока нет.".to_string());
                }
                let mut reply = String::from("<b>Розыгрыши:</b>\n");
                for giveaway in giveaways {
                    reply.push_str(&format!(
                        "#{} {} [{}] до {}\n",
                        giveaway.id,
                        escape_html(&giveaway.title),
                        giveaway.status.as_str(),
                        format_ends_at(giveaway.ends_at, state.timezone),
                    ));
                }
                Ok(reply)
            }
            AdminCommand::Giveaway(args) => {
                let id = parse_id(&args).map_err(invalid)?;
                let giveaway = state
                    .giveaways
                    .get(id)
                    .await?
                    .ok_or_else(|| not_found(id))?;
                let participants = state.giveaways.participants_count(id).await?;
                let winners = state.giveaways.winners(id).await?.len() as i64;
                let broadcasts = state.jobs.count_for_giveaway(id).await?;
                Ok(render_giveaway_summary(
                    &giveaway,
                    participants,
                    winners,
                    broadcasts,
                    state.timezone,
                ))
            }
            AdminCommand::Participants(args) => {
                let id = parse_id(&args).map_err(invalid)?;
                let participants = state.giveaways.list_participants(id, PARTICIPANTS_PAGE).await?;
                if participants.is_empty() {
                    return Ok(format!("В розыгрыше #{id} пока нет участников."));
                }
                let total = state.giveaways.participants_count(id).await?;
                let mut reply = format!("<b>Участники #{id}</b> ({total}):\n");
                for (idx, participant) in participants.iter().enumerate() {
                    let who = participant
                        .username
                        .as_deref()
                        .map(|name| format!("@{}", escape_html(name)))
                        .unwrap_or_else(|| participant.user_id.to_string());
                    let dm = if participant.can_dm { "" } else { " 🚫" };
                    reply.push_str(&format!(
                        "{}. {who} #{}{dm}\n",
                        idx + 1,
                        participant.ticket_number
                    ));
                }
                Ok(reply)
            }
            AdminCommand::Finish(args) => {
                let id = parse_id(&args).map_err(invalid)?;
                if state.giveaways.get(id).await?.is_none() {
                    return Err(not_found(id));
                }
                state.scheduler.cancel(id).await?;
                let report = state.finalizer.finalize_and_notify(id).await?;
                Ok(format!(
                    "Розыгрыш #{id} завершён.\nПобедителей: {}\nУведомлено: {}, ошибок: {}",
                    report.winners.len(),
                    report.notified,
                    report.failed
                ))
            }
            AdminCommand::SetEnd(args) => {
                let (id, rest) = parse_id_and_rest(&args).map_err(invalid)?;
                let ends_at = parse_local_datetime(rest, state.timezone)
                    .map_err(|_| invalid("Формат: /set_end <id> <ГГГГ-ММ-ДД ЧЧ:ММ|->"))?;
                let giveaway = state
                    .giveaways
                    .get(id)
                    .await?
                    .ok_or_else(|| not_found(id))?;
                if !giveaway.is_active() {
                    return Err(invalid(format!("Розыгрыш #{id} уже завершён.")));
                }
                state.giveaways.set_ends_at(id, ends_at).await?;
                match ends_at {
                    Some(at) => state.scheduler.schedule_end(id, at).await?,
                    None => state.scheduler.cancel(id).await?,
                }
                Ok(format!(
                    "Окончание #{id}: {}",
                    format_ends_at(ends_at, state.timezone)
                ))
            }
            AdminCommand::SetWinners(args) => {
                let (id, rest) = parse_id_and_rest(&args).map_err(invalid)?;
                let count = rest
                    .parse::<u32>()
                    .ok()
                    .filter(|n| (1..=MAX_WINNERS).contains(n))
                    .ok_or_else(|| invalid(format!("Количество: число от 1 до {MAX_WINNERS}.")))?;
                if !state.giveaways.set_winners_count(id, count).await? {
                    return Err(not_found(id));
                }
                Ok(format!("Победителей в #{id}: {count}"))
            }
            AdminCommand::SetDesc(args) => {
                let (id, rest) = parse_id_and_rest(&args).map_err(invalid)?;
                let description = optional_text(rest);
                if !state
                    .giveaways
                    .set_description(id, description.as_deref())
                    .await?
                {
                    return Err(not_found(id));
                }
                Ok(format!("Описание #{id} обновлено."))
            }
            AdminCommand::Delete(args) => {
                let id = parse_id(&args).map_err(invalid)?;
                state.scheduler.cancel(id).await?;
                if !state.giveaways.delete(id).await? {
                    return Err(not_found(id));
                }
                tracing::info!(target: "admin", admin_id, giveaway_id = id, "giveaway deleted");
                Ok(format!("Розыгрыш #{id} удалён."))
            }
            AdminCommand::Link(args) => {
                let id = parse_id(&args).map_err(invalid)?;
                if state.giveaways.get(id).await?.is_none() {
                    return Err(not_found(id));
                }
                state
                    .deep_link(id)
                    .ok_or_else(|| invalid("Имя бота ещё неизвестно, попробуйте позже."))
            }
            AdminCommand::Publish(args) => {
                let (id, rest) = parse_id_and_rest(&args).map_err(invalid)?;
                let args = parse_publish(rest).map_err(invalid)?;
                let giveaway = state
                    .giveaways
                    .get(id)
                    .await?
                    .ok_or_else(|| not_found(id))?;
                if !giveaway.is_active() {
                    return Err(invalid(format!("Розыгрыш #{id} уже завершён.")));
                }
                let link = state
                    .deep_link(id)
                    .ok_or_else(|| invalid("Имя бота ещё неизвестно, попробуйте позже."))?;
                let post = args.into_post(&giveaway.channel_username, link);
                match state.sender.publish(&post).await {
                    SendOutcome::Sent => {
                        tracing::info!(
                            target: "admin",
                            admin_id,
                            giveaway_id = id,
                            channel = post.channel.as_str(),
                            "giveaway post published"
                        );
                        Ok(format!("Пост опубликован в {}.", escape_html(&post.channel)))
                    }
                    outcome => {
                        tracing::warn!(
                            target: "admin",
                            admin_id,
                            giveaway_id = id,
                            channel = post.channel.as_str(),
                            ?outcome,
                            "giveaway post was not published"
                        );
                        Ok("Не удалось опубликовать пост. Проверьте, что бот админ в канале и канал доступен."
                            .to_string())
                    }
                }
            }
            AdminCommand::Broadcast(args) => {
                let (id, rest) = parse_id_and_rest(&args).map_err(invalid)?;
                if state.giveaways.get(id).await?.is_none() {
                    return Err(not_found(id));
                }
                let (organizer, text) = parse_broadcast(rest).map_err(invalid)?;
                Self::enqueue(state, admin_id, text, organizer, BroadcastScope::Giveaway(id)).await
            }
            AdminCommand::BroadcastAll(args) => {
                let (organizer, text) = parse_broadcast(&args).map_err(invalid)?;
                Self::enqueue(state, admin_id, text, organizer, BroadcastScope::Global).await
            }
            AdminCommand::Jobs => {
                let jobs = state.jobs.list_recent(RECENT_JOBS).await?;
                if jobs.is_empty() {
                    return Ok("Рассылок пока не было.".to_string());
                }
                let mut reply = String::from("<b>Последние рассылки:</b>\n");
                for job in jobs {
                    let scope = match job.scope {
                        BroadcastScope::Global => "все пользователи".to_string(),
                        BroadcastScope::Giveaway(id) => format!("розыгрыш #{id}"),
                    };
                    let marker = match job.status {
                        JobStatus::Pending => "⏳",
                        JobStatus::Running => "▶️",
                        JobStatus::Done => "✅",
                    };
                    reply.push_str(&format!(
                        "{marker} #{} {} · {scope} · ok {} / fail {}\n",
                        job.id, job.status, job.sent_ok, job.sent_fail
                    ));
                }
                Ok(reply)
            }
        }
    }

    async fn enqueue(
        state: &AppState,
        admin_id: i64,
        text: String,
        organizer: String,
        scope: BroadcastScope,
    ) -> CommandResult {
        let job = NewBroadcastJob {
            text,
            organizer: Some(organizer),
            scope,
        };
        match state.jobs.create(job).await? {
            Some(job) => {
                tracing::info!(target: "admin", admin_id, job_id = job.id, ?scope, "broadcast queued");
                Ok(format!("Рассылка #{} поставлена в очередь.", job.id))
            }
            None => Ok("Такая рассылка уже в очереди.".to_string()),
        }
    }

    async fn on_callback(bot: Bot, q: CallbackQuery, state: Arc<AppState>) -> BotResult<()> {
        let Some((action, giveaway_id)) = q.data.as_deref().and_then(parse_callback) else {
            bot.answer_callback_query(q.id.clone()).await?;
            return Ok(());
        };
        let chat_id = ChatId::from(q.from.id);
        let user_id = user_to_i64(&q.from);

        let giveaway = match state.giveaways.get(giveaway_id).await {
            Ok(Some(giveaway)) if giveaway.is_active() => giveaway,
            Ok(_) => {
                bot.answer_callback_query(q.id.clone())
                    .text("Розыгрыш не найден или уже завершён.")
                    .show_alert(true)
                    .await?;
                return Ok(());
            }
            Err(err) => {
                tracing::error!(target: "telegram", giveaway_id, error = %err, "failed to load giveaway");
                bot.answer_callback_query(q.id.clone())
                    .text("Ошибка, попробуйте позже.")
                    .await?;
                return Ok(());
            }
        };

        match action {
            "rules" => {
                bot.answer_callback_query(q.id.clone()).await?;
                bot.send_message(chat_id, render_rules(&giveaway)).await?;
            }
            "check" => {
                let subscribed =
                    is_channel_subscriber(&bot, &giveaway.channel_username, q.from.id).await;
                let text = if subscribed {
                    "Подписка подтверждена, можно участвовать."
                } else {
                    "Подписка не найдена."
                };
                bot.answer_callback_query(q.id.clone())
                    .text(text)
                    .show_alert(!subscribed)
                    .await?;
                if subscribed {
                    if let Some((chat, message_id)) =
                        q.message.as_ref().map(|m| (m.chat().id, m.id()))
                    {
                        if let Err(err) = bot
                            .edit_message_reply_markup(chat, message_id)
                            .reply_markup(giveaway_user_kb(giveaway.id))
                            .await
                        {
                            tracing::debug!(target: "telegram", error = %err, "keyboard left unchanged");
                        }
                    }
                }
            }
            "join" => {
                if !is_channel_subscriber(&bot, &giveaway.channel_username, q.from.id).await {
                    bot.answer_callback_query(q.id.clone()).await?;
                    bot.send_message(
                        chat_id,
                        format!(
                            "Чтобы участвовать, подпишитесь на канал {} и нажмите «Проверить подписку».",
                            giveaway.channel_username
                        ),
                    )
                    .reply_markup(not_subscribed_kb(&giveaway.channel_username, giveaway.id))
                    .await?;
                    return Ok(());
                }

                let joined = state
                    .giveaways
                    .add_participant(giveaway.id, user_id, q.from.username.as_deref())
                    .await;
                match joined {
                    Ok(Some(participant)) => {
                        tracing::info!(
                            target: "giveaway",
                            giveaway_id,
                            user = %format_user_display(&q.from),
                            ticket = participant.ticket_number,
                            "participant joined"
                        );
                        bot.answer_callback_query(q.id.clone()).await?;
                        bot.send_message(
                            chat_id,
                            render_join_confirmation(
                                &giveaway,
                                participant.ticket_number,
                                state.timezone,
                            ),
                        )
                        .parse_mode(ParseMode::Html)
                        .await?;
                    }
                    Ok(None) => {
                        bot.answer_callback_query(q.id.clone())
                            .text("Вы уже участвуете в этом розыгрыше.")
                            .show_alert(true)
                            .await?;
                    }
                    Err(err) => {
                        tracing::error!(target: "giveaway", giveaway_id, user_id, error = %err, "failed to add participant");
                        bot.answer_callback_query(q.id.clone())
                            .text("Ошибка, попробуйте позже.")
                            .await?;
                    }
                }
            }
            other => {
                tracing::debug!(target: "telegram", action = other, "unknown callback action");
                bot.answer_callback_query(q.id.clone()).await?;
            }
        }
        Ok(())
    }

    async fn sync_commands(&self) -> BotResult<()> {
        self.bot
            .set_my_commands(UserCommand::bot_commands())
            .await?;

        let admin_commands = AdminCommand::bot_commands();
        for admin_id in &self.state.config.admins {
            self.bot
                .set_my_commands(admin_commands.clone())
                .scope(BotCommandScope::Chat {
                    chat_id: Recipient::Id(ChatId(*admin_id)),
                })
                .await?;
        }
        tracing::info!(
            target: "telegram",
            admins = self.state.config.admins.len(),
            "bot commands synced"
        );
        Ok(())
    }
}

fn not_found(id: i64) -> CommandError {
    invalid(format!("Розыгрыш #{id} не найден."))
}
